use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use bollard::container::{InspectContainerOptions, ListContainersOptions};
use bollard::errors::Error as BollardError;
use bollard::models::{ContainerInspectResponse, EventMessage, EventMessageTypeEnum, PortMap};
use bollard::system::EventsOptions;
use bollard::Docker;
use futures_util::stream::StreamExt;
use log::{debug, warn};

use super::{ContainerRuntime, EventKind, EventStream, RuntimeEvent};
use crate::error::RuntimeError;
use crate::types::ContainerRecord;

pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connects to the local Docker daemon (unix socket or `DOCKER_HOST`).
    pub fn connect() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_running(&self) -> Result<Vec<ContainerRecord>, RuntimeError> {
        let opts = ListContainersOptions::<String> {
            all: false,
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(opts)).await?;

        let mut records = Vec::with_capacity(containers.len());
        for c in containers {
            let Some(id) = c.id else { continue };
            // Containers may disappear between listing and inspection.
            match self.inspect(&id).await? {
                Some(record) => records.push(record),
                None => debug!("Container {} vanished before inspection", id),
            }
        }
        Ok(records)
    }

    async fn inspect(&self, id: &str) -> Result<Option<ContainerRecord>, RuntimeError> {
        match self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
        {
            Ok(detail) => Ok(Some(to_record(detail))),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn events(&self) -> Result<EventStream, RuntimeError> {
        // The event stream is lazy; ping so a dead daemon fails here.
        self.docker.ping().await?;

        let opts = EventsOptions::<String> {
            filters: [
                ("type", ["container"].as_slice()),
                ("event", ["start", "die"].as_slice()),
            ]
            .iter()
            .map(|(k, v)| (k.to_string(), v.iter().map(|s| s.to_string()).collect()))
            .collect(),
            ..Default::default()
        };

        let stream = self
            .docker
            .events(Some(opts))
            .filter_map(|msg| async move {
                match msg {
                    Ok(event) => to_event(event).map(Ok),
                    Err(e) => Some(Err(RuntimeError::from(e))),
                }
            })
            .boxed();
        Ok(stream)
    }
}

fn to_event(event: EventMessage) -> Option<RuntimeEvent> {
    if event.typ != Some(EventMessageTypeEnum::CONTAINER) {
        return None;
    }
    let id = event.actor.and_then(|a| a.id).unwrap_or_default();
    if id.is_empty() {
        warn!("Ignoring container event without an actor id");
        return None;
    }
    let action = event.action.unwrap_or_default();
    Some(RuntimeEvent {
        kind: EventKind::from_action(&action),
        container_id: id,
    })
}

fn to_record(detail: ContainerInspectResponse) -> ContainerRecord {
    let env = detail
        .config
        .and_then(|c| c.env)
        .map(ContainerRecord::env_from_pairs)
        .unwrap_or_else(HashMap::new);
    let tcp_ports = detail
        .network_settings
        .and_then(|s| s.ports)
        .map(|ports| tcp_ports(&ports))
        .unwrap_or_default();

    ContainerRecord {
        id: detail.id.unwrap_or_default(),
        name: detail
            .name
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_default(),
        tcp_ports,
        env,
    }
}

/// Exposed TCP ports with their first published host port.
fn tcp_ports(ports: &PortMap) -> BTreeMap<u16, Option<u16>> {
    ports
        .iter()
        .filter_map(|(spec, bindings)| {
            let port = spec.strip_suffix("/tcp")?.parse::<u16>().ok()?;
            let host_port = bindings
                .as_ref()
                .and_then(|b| b.iter().find_map(|b| b.host_port.as_deref()?.parse().ok()));
            Some((port, host_port))
        })
        .collect()
}
