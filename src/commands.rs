//! The `sync`, `daemon` and `remove_all` commands.
//!
//! Each returns whether it finished without reported failures; the caller
//! turns that into the process exit status.

use std::future::Future;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

use crate::listener::EventListener;
use crate::reconcile::Reconciler;
use crate::runtime::ContainerRuntime;

/// Capacity of the trigger queue between listener and worker.
const TRIGGER_QUEUE: usize = 128;

pub async fn sync(reconciler: &Reconciler) -> bool {
    match reconciler.full_sync().await {
        Ok(report) => {
            report.log("sync");
            report.is_clean()
        }
        Err(e) => {
            error!("Synchronization failed: {}", e);
            false
        }
    }
}

pub async fn remove_all(reconciler: &Reconciler) -> bool {
    info!(
        "Removing all targets of {}",
        reconciler.host().hostname
    );
    match reconciler.remove_all().await {
        Ok(report) => {
            report.log("remove_all");
            report.is_clean()
        }
        Err(e) => {
            error!("Failed to remove targets: {}", e);
            false
        }
    }
}

/// Syncs once, then follows container events until `shutdown_signal`
/// resolves, and finally withdraws every target of this host.  The signal is
/// watched from the start, so a shutdown during the first pass skips straight
/// to the withdrawal.
pub async fn daemon<S>(
    reconciler: Arc<Reconciler>,
    runtime: Arc<dyn ContainerRuntime>,
    shutdown_timeout: Duration,
    shutdown_signal: S,
) -> bool
where
    S: Future<Output = ()>,
{
    let mut shutdown_signal = pin!(shutdown_signal);

    let initial = tokio::select! {
        ok = sync(&reconciler) => Some(ok),
        _ = &mut shutdown_signal => None,
    };
    let ok = match initial {
        Some(synced) => {
            let followed = follow_events(&reconciler, runtime, shutdown_signal).await;
            synced && followed
        }
        None => {
            info!("Received shutdown signal during the initial sync, shutting down...");
            true
        }
    };

    match timeout(shutdown_timeout, reconciler.remove_all()).await {
        Ok(Ok(report)) => report.log("shutdown"),
        Ok(Err(e)) => error!("Failed to remove targets on shutdown: {}", e),
        Err(_) => error!(
            "Removing targets did not finish within {:?}, giving up",
            shutdown_timeout
        ),
    }

    info!("Shutdown complete.");
    ok
}

/// Runs the event listener and the reconciliation worker until the signal
/// resolves or the listener gives up, then stops both.
async fn follow_events<S>(
    reconciler: &Arc<Reconciler>,
    runtime: Arc<dyn ContainerRuntime>,
    shutdown_signal: S,
) -> bool
where
    S: Future<Output = ()>,
{
    let mut ok = true;
    let (trigger_tx, trigger_rx) = mpsc::channel(TRIGGER_QUEUE);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let listener = EventListener::new(runtime);
    let mut listener_handle = tokio::spawn(listener.run(trigger_tx, shutdown_rx.clone()));
    let worker_handle = tokio::spawn(reconciler.clone().run(trigger_rx, shutdown_rx));

    let listener_stopped = tokio::select! {
        _ = shutdown_signal => {
            info!("Received shutdown signal, shutting down...");
            false
        }
        _ = &mut listener_handle => {
            error!("Event listener stopped unexpectedly");
            true
        }
    };
    if listener_stopped {
        ok = false;
    }

    // Receivers may already be gone; shutdown proceeds either way.
    let _ = shutdown_tx.send(true);
    if !listener_stopped {
        if let Err(e) = listener_handle.await {
            error!("Event listener task failed: {}", e);
        }
    }
    match worker_handle.await {
        Ok(0) => {}
        Ok(n) => {
            warn!("{} reconciliation passes reported failures", n);
            ok = false;
        }
        Err(e) => {
            error!("Reconciliation worker failed: {}", e);
            ok = false;
        }
    }
    ok
}
