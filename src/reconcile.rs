//! Reconciliation engine.
//!
//! A pass derives the desired targets and API definitions from containers,
//! reads what this host has registered in the gateway, and applies the
//! difference: removals first, then API definitions, then new targets.
//! Nothing is remembered between passes.

use std::collections::{BTreeMap, HashSet};
use std::slice;
use std::sync::Arc;

use futures_util::stream::{self, StreamExt};
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, watch};

use crate::error::ReconcileError;
use crate::extract::extract;
use crate::gateway::Gateway;
use crate::runtime::ContainerRuntime;
use crate::types::{
    ContainerRecord, GatewayApiDescriptor, HostIdentity, RegisteredTarget, TargetKey, Trigger,
    UpstreamTarget,
};

/// Independent gateway calls issued at once within a phase.
const MAX_CONCURRENT_CALLS: usize = 8;

/// Outcome of one pass.
#[derive(Debug, Default)]
pub struct PassReport {
    pub added: usize,
    pub removed: usize,
    pub apis_upserted: usize,
    pub apis_removed: usize,
    /// Items skipped because of bad metadata or gateway errors.
    pub failures: Vec<String>,
}

impl PassReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn changes(&self) -> usize {
        self.added + self.removed + self.apis_upserted + self.apis_removed
    }

    pub fn log(&self, what: &str) {
        if self.changes() == 0 && self.is_clean() {
            debug!("{}: gateway already in sync", what);
        } else {
            info!(
                "{}: {} targets added, {} removed, {} API definitions written, {} removed, {} failures",
                what,
                self.added,
                self.removed,
                self.apis_upserted,
                self.apis_removed,
                self.failures.len()
            );
        }
    }

    fn fail(&mut self, failure: String) {
        error!("{}", failure);
        self.failures.push(failure);
    }
}

#[derive(Debug, Default)]
struct Desired {
    targets: BTreeMap<TargetKey, UpstreamTarget>,
    /// API definitions by name, with the upstream of the service behind each.
    apis: BTreeMap<String, (String, GatewayApiDescriptor)>,
}

pub struct Reconciler {
    runtime: Arc<dyn ContainerRuntime>,
    gateway: Arc<dyn Gateway>,
    host: HostIdentity,
}

impl Reconciler {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        gateway: Arc<dyn Gateway>,
        host: HostIdentity,
    ) -> Self {
        Self {
            runtime,
            gateway,
            host,
        }
    }

    pub fn host(&self) -> &HostIdentity {
        &self.host
    }

    /// Later containers overwrite earlier ones on identical keys.
    fn desired(&self, containers: &[ContainerRecord], report: &mut PassReport) -> Desired {
        let mut desired = Desired::default();
        for container in containers {
            let extraction = extract(container, &self.host);
            for e in extraction.errors {
                report.fail(e.to_string());
            }
            for service in &extraction.services {
                debug!(
                    "{} exposes {} on port {} (host port {})",
                    container.label(),
                    service.name,
                    service.container_port,
                    service.host_port
                );
                let target = service.to_target(&self.host);
                desired.targets.insert(target.key(), target);
            }
            for (service, api) in extraction.apis {
                let upstream = self.host.upstream_name(&service);
                desired.apis.insert(api.name.clone(), (upstream, api));
            }
        }
        desired
    }

    /// Converges the gateway onto every running container.
    pub async fn full_sync(&self) -> Result<PassReport, ReconcileError> {
        let mut report = PassReport::default();
        let containers = self.runtime.list_running().await?;
        let desired = self.desired(&containers, &mut report);

        let actual = self.gateway.list_targets_for_host(&self.host).await?;
        let stale_apis = self
            .gateway
            .list_apis_for_host(&self.host)
            .await?
            .into_iter()
            .map(|api| api.name)
            .filter(|name| !desired.apis.contains_key(name))
            .collect();

        self.apply(desired, actual, stale_apis, &mut report).await;
        Ok(report)
    }

    /// Registers a started container.  Only targets at the container's own
    /// addresses are compared, so other containers are left alone.
    pub async fn container_started(&self, id: &str) -> Result<PassReport, ReconcileError> {
        let mut report = PassReport::default();
        let Some(container) = self.runtime.inspect(id).await? else {
            info!("Container {} no longer exists, nothing to register", id);
            return Ok(report);
        };
        let desired = self.desired(slice::from_ref(&container), &mut report);

        let addresses: HashSet<String> = container
            .published_ports()
            .map(|(_, host_port)| self.host.target_address(host_port))
            .collect();
        let actual = self
            .gateway
            .list_targets_for_host(&self.host)
            .await?
            .into_iter()
            .filter(|t| addresses.contains(&t.target.address))
            .collect();

        self.apply(desired, actual, Vec::new(), &mut report).await;
        Ok(report)
    }

    /// A stopped container has released its port bindings, so its targets
    /// can only be found by comparing against everything still running.
    pub async fn container_died(&self, id: &str) -> Result<PassReport, ReconcileError> {
        debug!("Container {} died, resynchronizing", id);
        self.full_sync().await
    }

    /// Deletes every target registered by this host.
    pub async fn remove_all(&self) -> Result<PassReport, ReconcileError> {
        let mut report = PassReport::default();
        let actual = self.gateway.list_targets_for_host(&self.host).await?;
        self.apply(Desired::default(), actual, Vec::new(), &mut report)
            .await;
        Ok(report)
    }

    pub async fn handle(&self, trigger: &Trigger) -> Result<PassReport, ReconcileError> {
        match trigger {
            Trigger::Resync => self.full_sync().await,
            Trigger::Started { id } => self.container_started(id).await,
            Trigger::Died { id } => self.container_died(id).await,
        }
    }

    async fn apply(
        &self,
        desired: Desired,
        actual: Vec<RegisteredTarget>,
        stale_apis: Vec<String>,
        report: &mut PassReport,
    ) {
        let gateway = self.gateway.as_ref();

        let present: HashSet<TargetKey> = actual.iter().map(|t| t.target.key()).collect();
        // Kong may hold several entries for one address; all of them go.
        let to_remove: Vec<RegisteredTarget> = actual
            .into_iter()
            .filter(|t| !desired.targets.contains_key(&t.target.key()))
            .collect();
        let to_add: Vec<UpstreamTarget> = desired
            .targets
            .into_iter()
            .filter(|(key, _)| !present.contains(key))
            .map(|(_, target)| target)
            .collect();

        let removals = stream::iter(to_remove)
            .map(|t| async move {
                info!("Removing target {} ({})", t.target.key(), t.id);
                let result = gateway.remove_target(&t).await;
                (t, result)
            })
            .buffer_unordered(MAX_CONCURRENT_CALLS)
            .collect::<Vec<_>>()
            .await;
        for (t, result) in removals {
            match result {
                Ok(()) => report.removed += 1,
                Err(e) => report.fail(format!("failed to remove target {}: {}", t.target.key(), e)),
            }
        }

        for name in stale_apis {
            info!("Removing API definition {}", name);
            match gateway.remove_api(&name).await {
                Ok(()) => report.apis_removed += 1,
                Err(e) => report.fail(format!("failed to remove API definition {}: {}", name, e)),
            }
        }

        // A target is only added once the API in front of its upstream exists.
        let mut blocked_upstreams = HashSet::new();
        for (upstream, api) in desired.apis.values() {
            match gateway.upsert_api(api).await {
                Ok(true) => report.apis_upserted += 1,
                Ok(false) => {}
                Err(e) => {
                    report.fail(format!("failed to write API definition {}: {}", api.name, e));
                    blocked_upstreams.insert(upstream.as_str());
                }
            }
        }
        let to_add: Vec<UpstreamTarget> = to_add
            .into_iter()
            .filter(|t| {
                let blocked = blocked_upstreams.contains(t.upstream.as_str());
                if blocked {
                    warn!("Skipping target {} until its API definition is written", t.key());
                }
                !blocked
            })
            .collect();

        let additions = stream::iter(to_add)
            .map(|t| async move {
                info!("Adding target {} for host {}", t.key(), t.owner);
                let result = gateway.add_target(&t).await;
                (t, result)
            })
            .buffer_unordered(MAX_CONCURRENT_CALLS)
            .collect::<Vec<_>>()
            .await;
        for (t, result) in additions {
            match result {
                Ok(()) => report.added += 1,
                Err(e) => report.fail(format!("failed to add target {}: {}", t.key(), e)),
            }
        }
    }

    /// Consumes triggers one at a time, in arrival order, until the queue
    /// closes or shutdown is signalled.  A pass in flight at shutdown is
    /// dropped; every step is idempotent so the next run picks it up.
    /// Returns the number of passes that reported failures.
    pub async fn run(
        self: Arc<Self>,
        mut triggers: mpsc::Receiver<Trigger>,
        mut shutdown: watch::Receiver<bool>,
    ) -> usize {
        let mut failed_passes = 0;
        loop {
            if *shutdown.borrow() {
                break;
            }
            let trigger = tokio::select! {
                _ = shutdown.changed() => break,
                t = triggers.recv() => match t {
                    Some(t) => t,
                    None => break,
                },
            };

            let result = tokio::select! {
                _ = shutdown.changed() => {
                    warn!("Shutdown during {:?}, abandoning pass", trigger);
                    break;
                }
                r = self.handle(&trigger) => r,
            };
            match result {
                Ok(report) => {
                    report.log(&format!("{:?}", trigger));
                    if !report.is_clean() {
                        failed_passes += 1;
                    }
                }
                Err(e) => {
                    error!("Reconciliation for {:?} failed: {}", trigger, e);
                    failed_passes += 1;
                }
            }
        }
        debug!("Reconciliation worker stopped");
        failed_passes
    }
}
