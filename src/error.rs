//! Error types for the registrator components.

use thiserror::Error;

/// Errors from the container runtime.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),
}

/// Errors from the gateway admin API.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// 5xx responses. Retried.
    #[error("Gateway unavailable: {status} - {message}")]
    Unavailable { status: u16, message: String },

    /// 4xx responses. Never retried.
    #[error("Gateway rejected request: {status} - {message}")]
    Rejected { status: u16, message: String },

    #[error("Unexpected gateway response: {0}")]
    Protocol(String),
}

impl GatewayError {
    /// Connection failures, timeouts and 5xx responses are worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            GatewayError::Http(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            GatewayError::Unavailable { .. } => true,
            GatewayError::Rejected { .. } | GatewayError::Protocol(_) => false,
        }
    }
}

/// Problems with the registration metadata of a single container port.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExtractError {
    #[error("invalid KONG API definition for port {port} of container {container}: {reason}")]
    InvalidApi {
        container: String,
        port: u16,
        reason: String,
    },

    #[error("SERVICE_NAME is ambiguous for port {port} of container {container}, which exposes {exposed} ports")]
    Ambiguous {
        container: String,
        port: u16,
        exposed: usize,
    },

    #[error("ignoring duplicate {kind} name {name} for port {port} of container {container}")]
    Duplicate {
        container: String,
        port: u16,
        kind: &'static str,
        name: String,
    },
}

/// Errors that abort a whole reconciliation pass before anything is changed.
#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("failed to read containers: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("failed to read gateway state: {0}")]
    Gateway(#[from] GatewayError),
}
