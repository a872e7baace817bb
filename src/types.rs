//! Data structures shared by the registrator components.
//!
//! Containers are read from the runtime as [`ContainerRecord`] snapshots,
//! turned into [`ServiceDescriptor`]s and [`GatewayApiDescriptor`]s, and
//! finally projected onto the gateway as [`UpstreamTarget`]s.  Nothing here
//! outlives a single reconciliation pass except the [`HostIdentity`].

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of the host running the registrator.
///
/// Upstream names are the service name suffixed with `dns_name`, target
/// addresses are `<hostname>:<host port>`.  The hostname prefix of a target
/// address is what marks a target as owned by this host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostIdentity {
    pub dns_name: String,
    pub hostname: String,
}

impl HostIdentity {
    pub fn new(dns_name: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            dns_name: dns_name.into(),
            hostname: hostname.into(),
        }
    }

    /// Name of the gateway upstream for a service, e.g. `web.docker.internal`.
    pub fn upstream_name(&self, service: &str) -> String {
        format!("{}{}", service, self.dns_name)
    }

    /// Target address of a published host port on this host.
    pub fn target_address(&self, host_port: u16) -> String {
        format!("{}:{}", self.hostname, host_port)
    }

    /// Whether an upstream was created by a registrator using this DNS name.
    pub fn manages_upstream(&self, upstream: &str) -> bool {
        upstream.ends_with(&self.dns_name)
    }

    /// Whether a target address points at this host.
    pub fn owns_address(&self, address: &str) -> bool {
        address
            .strip_prefix(&self.hostname)
            .is_some_and(|rest| rest.starts_with(':'))
    }

    /// Whether an API definition routes to this host.
    pub fn owns_upstream_url(&self, url: &str) -> bool {
        let rest = url
            .strip_prefix("http://")
            .or_else(|| url.strip_prefix("https://"));
        rest.is_some_and(|r| self.owns_address(r))
    }
}

/// Snapshot of a running container as far as registration is concerned.
#[derive(Debug, Clone, Default)]
pub struct ContainerRecord {
    pub id: String,
    pub name: String,
    /// Exposed TCP container port → published host port, if any.
    pub tcp_ports: BTreeMap<u16, Option<u16>>,
    pub env: HashMap<String, String>,
}

impl ContainerRecord {
    /// Parses `KEY=value` entries as the Docker API reports them.
    pub fn env_from_pairs<I, S>(pairs: I) -> HashMap<String, String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        pairs
            .into_iter()
            .filter_map(|pair| {
                let (key, value) = pair.as_ref().split_once('=')?;
                Some((key.to_string(), value.to_string()))
            })
            .collect()
    }

    /// Short form used in log lines.
    pub fn label(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    /// Host ports that are actually published.
    pub fn published_ports(&self) -> impl Iterator<Item = (u16, u16)> + '_ {
        self.tcp_ports
            .iter()
            .filter_map(|(port, host)| host.map(|h| (*port, h)))
    }
}

/// A named service reachable through one published port of a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub name: String,
    pub container_port: u16,
    pub host_port: u16,
}

impl ServiceDescriptor {
    pub fn to_target(&self, host: &HostIdentity) -> UpstreamTarget {
        UpstreamTarget {
            upstream: host.upstream_name(&self.name),
            address: host.target_address(self.host_port),
            owner: host.hostname.clone(),
        }
    }
}

/// API definition as written by users in `KONG_API` / `KONG_<port>_API`.
///
/// Every field is optional here; [`GatewayApiDescriptor::resolve`] fills
/// in the defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiSpec {
    pub name: Option<String>,
    pub upstream_url: Option<String>,
    pub uris: Option<Vec<String>>,
    pub strip_uri: Option<bool>,
    pub preserve_host: Option<bool>,
}

/// A fully resolved API definition, in the shape the Kong admin API uses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayApiDescriptor {
    pub name: String,
    pub upstream_url: String,
    #[serde(default)]
    pub uris: Vec<String>,
    #[serde(default = "default_strip_uri")]
    pub strip_uri: bool,
    #[serde(default)]
    pub preserve_host: bool,
}

fn default_strip_uri() -> bool {
    true
}

impl GatewayApiDescriptor {
    /// Applies the defaults: the service name becomes the API name and the
    /// upstream URL points at the published port on this host.
    pub fn resolve(spec: ApiSpec, service: &ServiceDescriptor, host: &HostIdentity) -> Self {
        Self {
            name: spec.name.unwrap_or_else(|| service.name.clone()),
            upstream_url: spec
                .upstream_url
                .unwrap_or_else(|| format!("http://{}", host.target_address(service.host_port))),
            uris: spec.uris.unwrap_or_default(),
            strip_uri: spec.strip_uri.unwrap_or_else(default_strip_uri),
            preserve_host: spec.preserve_host.unwrap_or_default(),
        }
    }
}

/// Key of a target: `(upstream name, address)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TargetKey {
    pub upstream: String,
    pub address: String,
}

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.upstream, self.address)
    }
}

/// A target this host wants (or has) registered in the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTarget {
    pub upstream: String,
    pub address: String,
    /// Hostname of the registering host.
    pub owner: String,
}

impl UpstreamTarget {
    pub fn key(&self) -> TargetKey {
        TargetKey {
            upstream: self.upstream.clone(),
            address: self.address.clone(),
        }
    }
}

/// A target as stored in the gateway, with the entry id needed to delete it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredTarget {
    pub id: String,
    pub target: UpstreamTarget,
}

/// Work item for the reconciliation worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// Full pass over every running container.
    Resync,
    /// A container was started.
    Started { id: String },
    /// A container died.
    Died { id: String },
}
