use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::error::RuntimeError;
use crate::types::ContainerRecord;

pub mod docker;
pub use docker::DockerRuntime;

/// Lifecycle events are an unbounded feed that may end or fail at any time.
pub type EventStream = BoxStream<'static, Result<RuntimeEvent, RuntimeError>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Start,
    Die,
    Other(String),
}

impl EventKind {
    pub fn from_action(action: &str) -> Self {
        match action {
            "start" => EventKind::Start,
            "die" => EventKind::Die,
            other => EventKind::Other(other.to_string()),
        }
    }
}

/// A container lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeEvent {
    pub kind: EventKind,
    pub container_id: String,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Snapshot of every running container.
    async fn list_running(&self) -> Result<Vec<ContainerRecord>, RuntimeError>;

    /// Inspects one container. `None` when it no longer exists.
    async fn inspect(&self, id: &str) -> Result<Option<ContainerRecord>, RuntimeError>;

    /// Opens the lifecycle event stream.  `Ok` means the runtime was
    /// reachable; the stream reports later failures as items.
    async fn events(&self) -> Result<EventStream, RuntimeError>;
}
