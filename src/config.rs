use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::gateway::RetryPolicy;
use crate::types::HostIdentity;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub admin_url: String,
    pub dns_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub verify_ssl: bool,
    pub request_timeout_secs: u64,
    pub retry_attempts: u32,
    pub retry_initial_ms: u64,
    pub retry_max_ms: u64,
    pub shutdown_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            admin_url: "http://localhost:8001".into(),
            dns_name: ".docker.internal".into(),
            hostname: None,
            verify_ssl: true,
            request_timeout_secs: 10,
            retry_attempts: 5,
            retry_initial_ms: 200,
            retry_max_ms: 5_000,
            shutdown_timeout_secs: 30,
        }
    }
}

/// Values given on the command line. Unset flags leave lower layers alone.
#[derive(Debug, Default, Serialize)]
pub struct Overrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verify_ssl: Option<bool>,
}

impl Config {
    /// Defaults, then `registrator.toml`, `registrator.json`,
    /// `REGISTRATOR_*` variables and finally command-line flags.
    pub fn load(overrides: Overrides) -> anyhow::Result<Self> {
        Self::from_figment(
            Figment::from(Serialized::defaults(Config::default()))
                .merge(Toml::file("registrator.toml"))
                .merge(Json::file("registrator.json"))
                .merge(Env::prefixed("REGISTRATOR_"))
                .merge(Serialized::defaults(overrides)),
        )
    }

    fn from_figment(figment: Figment) -> anyhow::Result<Self> {
        let mut config: Config = figment
            .extract()
            .map_err(|e| anyhow!("Failed to load configuration: {}", e))?;

        if config.hostname.as_deref().map_or(true, str::is_empty) {
            config.hostname = Some(detect_hostname()?);
        }
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        let url = reqwest::Url::parse(&self.admin_url)
            .with_context(|| format!("Invalid admin_url {:?}", self.admin_url))?;
        if !matches!(url.scheme(), "http" | "https") {
            bail!("admin_url must be http or https, got {}", url.scheme());
        }
        if self.dns_name.is_empty() {
            bail!("dns_name must not be empty");
        }
        if self.retry_attempts == 0 {
            bail!("retry_attempts must be at least 1");
        }
        Ok(())
    }

    pub fn host_identity(&self) -> HostIdentity {
        HostIdentity::new(
            self.dns_name.clone(),
            self.hostname.clone().unwrap_or_default(),
        )
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_attempts,
            initial_backoff: Duration::from_millis(self.retry_initial_ms),
            max_backoff: Duration::from_millis(self.retry_max_ms),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// `HOSTNAME`, then `/etc/hostname`.
fn detect_hostname() -> anyhow::Result<String> {
    if let Ok(name) = std::env::var("HOSTNAME") {
        let name = name.trim();
        if !name.is_empty() {
            return Ok(name.to_string());
        }
    }
    if let Ok(name) = std::fs::read_to_string("/etc/hostname") {
        let name = name.trim();
        if !name.is_empty() {
            return Ok(name.to_string());
        }
    }
    bail!("Could not determine the hostname; pass --hostname")
}
