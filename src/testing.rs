//! In-memory stand-ins for Docker and Kong.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};

use crate::error::{GatewayError, RuntimeError};
use crate::gateway::Gateway;
use crate::runtime::{ContainerRuntime, EventKind, EventStream, RuntimeEvent};
use crate::types::{
    ContainerRecord, GatewayApiDescriptor, HostIdentity, RegisteredTarget, TargetKey,
    UpstreamTarget,
};

pub fn container(id: &str, ports: &[(u16, u16)], env: &[&str]) -> ContainerRecord {
    ContainerRecord {
        id: id.to_string(),
        name: id.to_string(),
        tcp_ports: ports.iter().map(|(p, h)| (*p, Some(*h))).collect(),
        env: ContainerRecord::env_from_pairs(env),
    }
}

fn connection_lost() -> RuntimeError {
    RuntimeError::Docker(bollard::errors::Error::DockerResponseServerError {
        status_code: 500,
        message: "connection lost".into(),
    })
}

pub fn event(kind: EventKind, id: &str) -> RuntimeEvent {
    RuntimeEvent {
        kind,
        container_id: id.to_string(),
    }
}

/// One connection to the event stream.
pub enum Session {
    /// The connection attempt fails.
    Refused,
    /// Connects, optionally changing the container set without emitting an
    /// event first, then yields `events` and drops the connection.
    Connected {
        silently_start: Vec<ContainerRecord>,
        events: Vec<RuntimeEvent>,
    },
}

#[derive(Default)]
pub struct FakeRuntime {
    containers: Mutex<Vec<ContainerRecord>>,
    sessions: Mutex<VecDeque<Session>>,
    connects: Mutex<usize>,
    stalled: AtomicBool,
}

impl FakeRuntime {
    pub fn with(containers: Vec<ContainerRecord>) -> Self {
        Self {
            containers: Mutex::new(containers),
            ..Default::default()
        }
    }

    pub fn start(&self, container: ContainerRecord) {
        let mut containers = self.containers.lock().unwrap();
        containers.retain(|c| c.id != container.id);
        containers.push(container);
    }

    pub fn stop(&self, id: &str) {
        self.containers.lock().unwrap().retain(|c| c.id != id);
    }

    pub fn script(&self, sessions: Vec<Session>) {
        self.sessions.lock().unwrap().extend(sessions);
    }

    /// Makes every later `list_running` hang forever.
    pub fn stall_listing(&self) {
        self.stalled.store(true, Ordering::SeqCst);
    }

    pub fn connects(&self) -> usize {
        *self.connects.lock().unwrap()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn list_running(&self) -> Result<Vec<ContainerRecord>, RuntimeError> {
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(self.containers.lock().unwrap().clone())
    }

    async fn inspect(&self, id: &str) -> Result<Option<ContainerRecord>, RuntimeError> {
        Ok(self
            .containers
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.id == id)
            .cloned())
    }

    async fn events(&self) -> Result<EventStream, RuntimeError> {
        *self.connects.lock().unwrap() += 1;
        let session = self.sessions.lock().unwrap().pop_front();
        match session {
            // Script exhausted: stay connected and quiet.
            None => Ok(stream::pending().boxed()),
            Some(Session::Refused) => Err(connection_lost()),
            Some(Session::Connected {
                silently_start,
                events,
            }) => {
                for c in silently_start {
                    self.start(c);
                }
                let items = events
                    .into_iter()
                    .map(Ok)
                    .chain(std::iter::once(Err(connection_lost())));
                Ok(stream::iter(items).boxed())
            }
        }
    }
}

/// A mutation the fake gateway performed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    AddTarget(TargetKey),
    RemoveTarget(TargetKey),
    UpsertApi(String),
    RemoveApi(String),
}

#[derive(Default)]
struct GatewayState {
    targets: Vec<RegisteredTarget>,
    apis: BTreeMap<String, GatewayApiDescriptor>,
    next_id: usize,
    ops: Vec<Op>,
}

#[derive(Default)]
pub struct FakeGateway {
    state: Mutex<GatewayState>,
    rejected_upstreams: Mutex<HashSet<String>>,
    rejected_apis: Mutex<HashSet<String>>,
}

impl FakeGateway {
    /// Registers a target directly, as another host would.
    pub fn seed(&self, upstream: &str, address: &str) {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("seed-{}", state.next_id);
        state.targets.push(RegisteredTarget {
            id,
            target: UpstreamTarget {
                upstream: upstream.to_string(),
                address: address.to_string(),
                owner: address.split(':').next().unwrap_or_default().to_string(),
            },
        });
    }

    pub fn seed_api(&self, api: GatewayApiDescriptor) {
        self.state.lock().unwrap().apis.insert(api.name.clone(), api);
    }

    /// Makes every write to `upstream` fail with a 400.
    pub fn reject_upstream(&self, upstream: &str) {
        self.rejected_upstreams
            .lock()
            .unwrap()
            .insert(upstream.to_string());
    }

    /// Makes every write of the API definition `name` fail with a 400.
    pub fn reject_api(&self, name: &str) {
        self.rejected_apis.lock().unwrap().insert(name.to_string());
    }

    /// Sorted `(upstream, address)` pairs of every target, any owner.
    pub fn targets(&self) -> Vec<(String, String)> {
        let mut all: Vec<_> = self
            .state
            .lock()
            .unwrap()
            .targets
            .iter()
            .map(|t| (t.target.upstream.clone(), t.target.address.clone()))
            .collect();
        all.sort();
        all
    }

    pub fn apis(&self) -> BTreeMap<String, GatewayApiDescriptor> {
        self.state.lock().unwrap().apis.clone()
    }

    pub fn ops(&self) -> Vec<Op> {
        self.state.lock().unwrap().ops.clone()
    }
}

#[async_trait]
impl Gateway for FakeGateway {
    async fn list_targets_for_host(
        &self,
        host: &HostIdentity,
    ) -> Result<Vec<RegisteredTarget>, GatewayError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .targets
            .iter()
            .filter(|t| {
                host.manages_upstream(&t.target.upstream) && host.owns_address(&t.target.address)
            })
            .cloned()
            .collect())
    }

    async fn add_target(&self, target: &UpstreamTarget) -> Result<(), GatewayError> {
        if self.rejected_upstreams.lock().unwrap().contains(&target.upstream) {
            return Err(GatewayError::Rejected {
                status: 400,
                message: "invalid upstream".into(),
            });
        }
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("t{}", state.next_id);
        state.targets.push(RegisteredTarget {
            id,
            target: target.clone(),
        });
        state.ops.push(Op::AddTarget(target.key()));
        Ok(())
    }

    async fn remove_target(&self, target: &RegisteredTarget) -> Result<(), GatewayError> {
        let mut state = self.state.lock().unwrap();
        state.targets.retain(|t| t.id != target.id);
        state.ops.push(Op::RemoveTarget(target.target.key()));
        Ok(())
    }

    async fn list_apis_for_host(
        &self,
        host: &HostIdentity,
    ) -> Result<Vec<GatewayApiDescriptor>, GatewayError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .apis
            .values()
            .filter(|api| host.owns_upstream_url(&api.upstream_url))
            .cloned()
            .collect())
    }

    async fn upsert_api(&self, api: &GatewayApiDescriptor) -> Result<bool, GatewayError> {
        if self.rejected_apis.lock().unwrap().contains(&api.name) {
            return Err(GatewayError::Rejected {
                status: 400,
                message: "invalid API definition".into(),
            });
        }
        let mut state = self.state.lock().unwrap();
        if state.apis.get(&api.name) == Some(api) {
            return Ok(false);
        }
        state.apis.insert(api.name.clone(), api.clone());
        state.ops.push(Op::UpsertApi(api.name.clone()));
        Ok(true)
    }

    async fn remove_api(&self, name: &str) -> Result<(), GatewayError> {
        let mut state = self.state.lock().unwrap();
        state.apis.remove(name);
        state.ops.push(Op::RemoveApi(name.to_string()));
        Ok(())
    }
}
