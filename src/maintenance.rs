//! Offline re-validation of the registry.
//!
//! Runs as short-lived CLI invocations (typically from cron) against the
//! same database the daemon writes. Three flavors: prune rows that never
//! answered a live query, re-probe only those rows, or re-probe the whole
//! registry. Probing reuses the daemon's [`ServerProber`], and refreshed
//! rows go back through the registry merge.

use crate::enrich::ServerProber;
use crate::registry::Registry;
use crate::types::Node;
use anyhow::Result;
use chrono::Utc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Offline task selected on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintenanceTask {
    /// Delete nodes that never answered a live query.
    PruneEmpty,
    /// Probe nodes without query data; delete the dead, refresh the live.
    CheckInactive,
    /// Probe every node; delete the dead, refresh the live.
    CheckAll,
}

/// Counts reported when a task finishes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Report {
    pub processed: usize,
    pub deleted: usize,
    pub updated: usize,
}

/// Concurrent probes during re-validation.
pub const REVALIDATE_WORKERS: usize = 10;

/// A real game server cannot sit at or below this port.
pub const MIN_GAME_PORT: u16 = 1000;

/// Sentinel `--app` value meaning every application.
pub const ANY_APP: &str = "any";

/// Map the CLI `--app` argument to a registry filter.
pub fn app_filter(arg: Option<&str>) -> Option<&str> {
    match arg {
        None => None,
        Some(ANY_APP) => None,
        Some(app) => Some(app),
    }
}

/// Run one maintenance task to completion.
pub async fn run_task(
    task: MaintenanceTask,
    application: Option<&str>,
    registry: Arc<Registry>,
    prober: Arc<dyn ServerProber>,
) -> Result<Report> {
    match task {
        MaintenanceTask::PruneEmpty => {
            let deleted = registry.delete_unenriched(application).await? as usize;
            info!(deleted, "pruned nodes without query data");
            Ok(Report {
                processed: deleted,
                deleted,
                updated: 0,
            })
        }
        MaintenanceTask::CheckInactive => {
            let nodes = registry.subset(application, true).await?;
            revalidate(nodes, REVALIDATE_WORKERS, registry, prober).await
        }
        MaintenanceTask::CheckAll => {
            let nodes = registry.subset(application, false).await?;
            revalidate(nodes, REVALIDATE_WORKERS, registry, prober).await
        }
    }
}

/// Probe a set of nodes with a bounded worker pool.
///
/// Per node: an implausible port is deleted without probing, a failed
/// probe deletes, and a successful probe merges fresh query data with a
/// current `last_seen`.
pub async fn revalidate(
    nodes: Vec<Node>,
    concurrency: usize,
    registry: Arc<Registry>,
    prober: Arc<dyn ServerProber>,
) -> Result<Report> {
    if nodes.is_empty() {
        info!("no nodes matched the selection");
        return Ok(Report::default());
    }

    let total = nodes.len();
    info!(nodes = total, "re-validating nodes");

    let (tx, rx) = mpsc::channel(total);
    let rx = Arc::new(tokio::sync::Mutex::new(rx));
    let deleted = Arc::new(AtomicUsize::new(0));
    let updated = Arc::new(AtomicUsize::new(0));

    let mut workers = Vec::new();
    for _ in 0..concurrency.max(1) {
        let rx = rx.clone();
        let registry = registry.clone();
        let prober = prober.clone();
        let deleted = deleted.clone();
        let updated = updated.clone();
        workers.push(tokio::spawn(async move {
            loop {
                let node = {
                    let mut rx = rx.lock().await;
                    rx.recv().await
                };
                let Some(node) = node else { break };
                match revalidate_node(&node, &registry, prober.as_ref()).await {
                    Some(Action::Deleted) => {
                        deleted.fetch_add(1, Ordering::Relaxed);
                    }
                    Some(Action::Updated) => {
                        updated.fetch_add(1, Ordering::Relaxed);
                    }
                    None => {}
                }
            }
        }));
    }

    for node in nodes {
        // capacity equals the node count, so these sends never park
        if tx.send(node).await.is_err() {
            break;
        }
    }
    drop(tx);

    for worker in workers {
        let _ = worker.await;
    }

    let report = Report {
        processed: total,
        deleted: deleted.load(Ordering::Relaxed),
        updated: updated.load(Ordering::Relaxed),
    };
    info!(
        processed = report.processed,
        deleted = report.deleted,
        updated = report.updated,
        "re-validation finished"
    );
    Ok(report)
}

enum Action {
    Deleted,
    Updated,
}

async fn revalidate_node(
    node: &Node,
    registry: &Registry,
    prober: &dyn ServerProber,
) -> Option<Action> {
    if node.port <= MIN_GAME_PORT {
        debug!(app = %node.application, ip = %node.ip, port = node.port, "implausible port, deleting");
        return delete_node(node, registry).await;
    }

    match prober.probe(&node.ip, node.port).await {
        Ok(info) => {
            let mut refreshed = node.clone();
            refreshed.apply_server_info(&info);
            refreshed.last_seen = Utc::now();
            match registry.merge(&refreshed).await {
                Ok(()) => Some(Action::Updated),
                Err(e) => {
                    error!(error = %e, ip = %node.ip, port = node.port, "failed to refresh node");
                    None
                }
            }
        }
        Err(e) => {
            debug!(ip = %node.ip, port = node.port, error = %e, "node unreachable, deleting");
            delete_node(node, registry).await
        }
    }
}

async fn delete_node(node: &Node, registry: &Registry) -> Option<Action> {
    match registry.delete(&node.application, &node.ip, node.port).await {
        Ok(()) => Some(Action::Deleted),
        Err(e) => {
            error!(error = %e, ip = %node.ip, port = node.port, "failed to delete node");
            None
        }
    }
}
