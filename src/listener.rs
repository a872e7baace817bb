//! Container event listener.
//!
//! Turns the runtime's lifecycle events into reconciliation triggers.  The
//! stream is unreliable: whenever it (re)connects a full resync is queued
//! ahead of any event, since whatever happened while disconnected is lost.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::StreamExt;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;

use crate::gateway::RetryPolicy;
use crate::runtime::{ContainerRuntime, EventKind};
use crate::types::Trigger;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Disconnected,
    Connected,
    Streaming,
}

impl fmt::Display for ListenerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ListenerState::Disconnected => "disconnected",
            ListenerState::Connected => "connected",
            ListenerState::Streaming => "streaming",
        };
        f.write_str(s)
    }
}

pub struct EventListener {
    runtime: Arc<dyn ContainerRuntime>,
    reconnect: RetryPolicy,
    state: ListenerState,
}

impl EventListener {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            runtime,
            reconnect: RetryPolicy {
                max_attempts: u32::MAX,
                initial_backoff: Duration::from_secs(1),
                max_backoff: Duration::from_secs(30),
            },
            state: ListenerState::Disconnected,
        }
    }

    fn transition(&mut self, next: ListenerState) {
        debug!("Event listener {} -> {}", self.state, next);
        self.state = next;
    }

    /// Runs until shutdown is signalled or the trigger queue is closed.
    pub async fn run(mut self, triggers: mpsc::Sender<Trigger>, mut shutdown: watch::Receiver<bool>) {
        let mut failures = 0u32;
        loop {
            if *shutdown.borrow() {
                break;
            }

            let connected = tokio::select! {
                _ = shutdown.changed() => break,
                r = self.runtime.events() => r,
            };
            let mut stream = match connected {
                Ok(stream) => {
                    failures = 0;
                    self.transition(ListenerState::Connected);
                    stream
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let delay = self.reconnect.backoff(failures);
                    error!(
                        "Failed to subscribe to container events: {}. Retrying in {:?}...",
                        e, delay
                    );
                    if !pause(delay, &mut shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            if !forward(&triggers, Trigger::Resync, &mut shutdown).await {
                break;
            }
            self.transition(ListenerState::Streaming);
            info!("Listening for container events...");

            loop {
                let next = tokio::select! {
                    _ = shutdown.changed() => return,
                    n = stream.next() => n,
                };
                let trigger = match next {
                    Some(Ok(event)) => match event.kind {
                        EventKind::Start => Trigger::Started {
                            id: event.container_id,
                        },
                        EventKind::Die => Trigger::Died {
                            id: event.container_id,
                        },
                        EventKind::Other(action) => {
                            debug!("Skipping event {} for {}", action, event.container_id);
                            continue;
                        }
                    },
                    Some(Err(e)) => {
                        error!("Error in container event stream: {}", e);
                        break;
                    }
                    None => {
                        warn!("Container event stream ended");
                        break;
                    }
                };
                debug!("Queueing {:?}", trigger);
                if !forward(&triggers, trigger, &mut shutdown).await {
                    return;
                }
            }

            self.transition(ListenerState::Disconnected);
            failures = failures.saturating_add(1);
            let delay = self.reconnect.backoff(failures);
            warn!("Reconnecting to container events in {:?}...", delay);
            if !pause(delay, &mut shutdown).await {
                break;
            }
        }
        debug!("Event listener stopped");
    }
}

/// Queues a trigger. Returns `false` when the listener should stop.
async fn forward(
    triggers: &mpsc::Sender<Trigger>,
    trigger: Trigger,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    tokio::select! {
        _ = shutdown.changed() => false,
        sent = triggers.send(trigger) => sent.is_ok(),
    }
}

/// Sleeps unless shutdown comes first. Returns `false` on shutdown.
async fn pause(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = shutdown.changed() => false,
        _ = sleep(delay) => true,
    }
}
