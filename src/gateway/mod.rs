//! Gateway admin API abstraction.
//!
//! The gateway is the system of record: every pass re-reads what this host
//! has registered instead of remembering it locally.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use log::warn;
use tokio::time::sleep;

use crate::error::GatewayError;
use crate::types::{GatewayApiDescriptor, HostIdentity, RegisteredTarget, UpstreamTarget};

pub mod kong;
pub use kong::KongAdminClient;

#[async_trait]
pub trait Gateway: Send + Sync {
    /// Every target entry owned by `host`.
    async fn list_targets_for_host(
        &self,
        host: &HostIdentity,
    ) -> Result<Vec<RegisteredTarget>, GatewayError>;

    /// Registers a target, creating its upstream when needed.
    async fn add_target(&self, target: &UpstreamTarget) -> Result<(), GatewayError>;

    /// Deletes one target entry. Deleting a missing entry succeeds.
    async fn remove_target(&self, target: &RegisteredTarget) -> Result<(), GatewayError>;

    /// Every API definition routing to `host`.
    async fn list_apis_for_host(
        &self,
        host: &HostIdentity,
    ) -> Result<Vec<GatewayApiDescriptor>, GatewayError>;

    /// Creates or updates an API definition. Returns whether anything changed.
    async fn upsert_api(&self, api: &GatewayApiDescriptor) -> Result<bool, GatewayError>;

    /// Deletes an API definition. Deleting a missing API succeeds.
    async fn remove_api(&self, name: &str) -> Result<(), GatewayError>;
}

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Runs `op` until it succeeds, fails with a non-transient error, or the
    /// attempts are used up.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, GatewayError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = self.backoff(attempt);
                    warn!(
                        "{} failed (attempt {}/{}): {}. Retrying in {:?}...",
                        what, attempt, self.max_attempts, e, delay
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
