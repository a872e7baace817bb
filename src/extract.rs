//! Service descriptor extraction.
//!
//! Reads the registration contract from a container's environment:
//!
//! * `SERVICE_<port>_NAME` names the service behind an exposed port.  A
//!   container exposing a single TCP port may use `SERVICE_NAME` instead.
//! * `KONG_<port>_API` (or `KONG_API` under the same single-port rule)
//!   holds a JSON object describing the gateway API for that service.
//!
//! Extraction never fails as a whole: problems are collected per port and
//! the remaining ports are still registered.

use std::collections::HashSet;

use crate::error::ExtractError;
use crate::types::{ApiSpec, ContainerRecord, GatewayApiDescriptor, HostIdentity, ServiceDescriptor};

/// Everything registrable found on one container.
#[derive(Debug, Default)]
pub struct Extraction {
    pub services: Vec<ServiceDescriptor>,
    /// API definitions, each with the name of the service it fronts.
    pub apis: Vec<(String, GatewayApiDescriptor)>,
    pub errors: Vec<ExtractError>,
}

/// Looks up `<prefix>_<port>_<postfix>`, falling back to `<prefix>_<postfix>`
/// when the container exposes exactly one TCP port.
fn lookup<'a>(
    container: &'a ContainerRecord,
    prefix: &str,
    postfix: &str,
    port: u16,
) -> Option<&'a str> {
    let per_port = format!("{}_{}_{}", prefix, port, postfix);
    if let Some(value) = container.env.get(&per_port) {
        return Some(value.as_str());
    }
    if container.tcp_ports.len() == 1 {
        let shared = format!("{}_{}", prefix, postfix);
        return container.env.get(&shared).map(String::as_str);
    }
    None
}

pub fn extract(container: &ContainerRecord, host: &HostIdentity) -> Extraction {
    let mut out = Extraction::default();
    let mut seen_services = HashSet::new();
    let mut seen_apis = HashSet::new();

    for (port, host_port) in container.published_ports() {
        let Some(name) = lookup(container, "SERVICE", "NAME", port) else {
            if container.env.contains_key("SERVICE_NAME") {
                out.errors.push(ExtractError::Ambiguous {
                    container: container.label().to_string(),
                    port,
                    exposed: container.tcp_ports.len(),
                });
            }
            continue;
        };

        let service = ServiceDescriptor {
            name: name.to_string(),
            container_port: port,
            host_port,
        };
        if !seen_services.insert(service.name.clone()) {
            out.errors.push(ExtractError::Duplicate {
                container: container.label().to_string(),
                port,
                kind: "service",
                name: service.name,
            });
            continue;
        }

        if let Some(raw) = lookup(container, "KONG", "API", port) {
            match serde_json::from_str::<ApiSpec>(raw) {
                Ok(spec) => {
                    let api = GatewayApiDescriptor::resolve(spec, &service, host);
                    if seen_apis.insert(api.name.clone()) {
                        out.apis.push((service.name.clone(), api));
                    } else {
                        out.errors.push(ExtractError::Duplicate {
                            container: container.label().to_string(),
                            port,
                            kind: "API",
                            name: api.name,
                        });
                    }
                }
                Err(e) => out.errors.push(ExtractError::InvalidApi {
                    container: container.label().to_string(),
                    port,
                    reason: e.to_string(),
                }),
            }
        }

        out.services.push(service);
    }

    out
}
