//! Bounded ingestion pipeline between the HTTP handler and the registry.
//!
//! The handler never talks to SQLite or the network: it hands admitted
//! beacons to a bounded queue and answers immediately. A fixed pool of
//! workers drains the queue, runs the (possibly slow) enrichment lookups,
//! and merges the result. When the queue is full the job is shed rather
//! than ever blocking the request path.

use crate::enrich::{self, CountryResolver, ServerProber};
use crate::registry::Registry;
use crate::types::{Beacon, Node, GENERIC_KIND};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// One admitted beacon on its way to the registry.
#[derive(Debug, Clone)]
pub struct BeaconJob {
    pub beacon: Beacon,
    /// Resolved client IP, as tracked (never from the beacon body).
    pub ip: String,
    pub observed_at: DateTime<Utc>,
}

/// What happened to an enqueue attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    Dropped,
}

/// Counters for log visibility.
#[derive(Debug, Clone, Copy)]
pub struct IngestStats {
    pub queued: u64,
    pub dropped: u64,
}

pub struct IngestPipeline {
    tx: Mutex<Option<mpsc::Sender<BeaconJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    queued: AtomicU64,
    dropped: AtomicU64,
}

impl IngestPipeline {
    /// Spawn the worker pool and return the pipeline handle.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        registry: Arc<Registry>,
        prober: Arc<dyn ServerProber>,
        resolver: Option<Arc<dyn CountryResolver>>,
        queue_size: usize,
        worker_count: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let workers = (0..worker_count)
            .map(|id| {
                let worker = IngestWorker {
                    id,
                    registry: registry.clone(),
                    prober: prober.clone(),
                    resolver: resolver.clone(),
                    rx: rx.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        info!(
            workers = worker_count,
            queue = queue_size,
            "ingest pipeline started"
        );

        Self {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            queued: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Hand a job to the worker pool without waiting.
    ///
    /// A full queue sheds the job. The beacon already passed admission at
    /// that point, so the caller still acknowledges the sender.
    pub fn enqueue(&self, job: BeaconJob) -> EnqueueOutcome {
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return EnqueueOutcome::Dropped;
        };

        match tx.try_send(job) {
            Ok(()) => {
                self.queued.fetch_add(1, Ordering::Relaxed);
                EnqueueOutcome::Queued
            }
            Err(mpsc::error::TrySendError::Full(job)) => {
                warn!(
                    ip = %job.ip,
                    port = job.beacon.port,
                    "ingest queue full, dropping beacon"
                );
                self.dropped.fetch_add(1, Ordering::Relaxed);
                EnqueueOutcome::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                EnqueueOutcome::Dropped
            }
        }
    }

    /// Close the queue and wait for the workers to drain the backlog.
    /// Jobs enqueued before the close are all processed.
    pub async fn shutdown(&self) {
        let tx = self.tx.lock().take();
        drop(tx);

        let workers: Vec<_> = {
            let mut guard = self.workers.lock();
            guard.drain(..).collect()
        };
        for worker in workers {
            let _ = worker.await;
        }

        let stats = self.stats();
        info!(
            queued = stats.queued,
            dropped = stats.dropped,
            "ingest pipeline stopped"
        );
    }

    pub fn stats(&self) -> IngestStats {
        IngestStats {
            queued: self.queued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

struct IngestWorker {
    id: usize,
    registry: Arc<Registry>,
    prober: Arc<dyn ServerProber>,
    resolver: Option<Arc<dyn CountryResolver>>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<BeaconJob>>>,
}

impl IngestWorker {
    async fn run(self) {
        debug!(worker = self.id, "ingest worker started");
        loop {
            // hold the receiver lock only while dequeuing
            let job = {
                let mut rx = self.rx.lock().await;
                rx.recv().await
            };
            match job {
                Some(job) => self.process(job).await,
                None => break,
            }
        }
        debug!(worker = self.id, "ingest worker stopped");
    }

    async fn process(&self, job: BeaconJob) {
        let mut beacon = job.beacon;
        if beacon.kind.is_empty() {
            beacon.kind = GENERIC_KIND.to_string();
        }
        let ip = enrich::normalize_probe_ip(&job.ip).to_string();

        let mut node = Node::from_beacon(&beacon, ip.clone(), job.observed_at);

        if enrich::is_queryable(&beacon.kind, &ip) {
            match self.prober.probe(&ip, beacon.port).await {
                Ok(info) => node.apply_server_info(&info),
                Err(e) => {
                    debug!(ip = %ip, port = beacon.port, error = %e, "live query failed")
                }
            }
        }

        if let Some(resolver) = &self.resolver {
            if let Some(country) = resolver.country_code(&ip) {
                node.country_code = country;
            }
        }

        if let Err(e) = self.registry.merge(&node).await {
            error!(ip = %ip, port = beacon.port, error = %e, "failed to persist node");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ServerInfo;
    use anyhow::Result;
    use async_trait::async_trait;
    use tokio::sync::Notify;

    struct FailProber;

    #[async_trait]
    impl ServerProber for FailProber {
        async fn probe(&self, _ip: &str, _port: u16) -> Result<ServerInfo> {
            anyhow::bail!("no live data")
        }
    }

    /// Parks inside probe() until released, so tests can pin a worker.
    struct StallProber {
        started: Arc<Notify>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl ServerProber for StallProber {
        async fn probe(&self, _ip: &str, _port: u16) -> Result<ServerInfo> {
            self.started.notify_one();
            self.release.notified().await;
            anyhow::bail!("no live data")
        }
    }

    struct StaticResolver(&'static str);

    impl CountryResolver for StaticResolver {
        fn country_code(&self, _ip: &str) -> Option<String> {
            Some(self.0.to_string())
        }
    }

    fn job(kind: &str, ip: &str, port: u16) -> BeaconJob {
        BeaconJob {
            beacon: Beacon {
                application: "MetricZ".to_string(),
                kind: kind.to_string(),
                version: "1.0.0".to_string(),
                port,
            },
            ip: ip.to_string(),
            observed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn full_queue_sheds_without_blocking() {
        let registry = Arc::new(Registry::open_in_memory().await.unwrap());
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let prober = Arc::new(StallProber {
            started: started.clone(),
            release: release.clone(),
        });

        let pipeline = IngestPipeline::start(registry.clone(), prober, None, 1, 1);

        // the steam job parks the only worker inside probe()
        assert_eq!(
            pipeline.enqueue(job("steam", "127.0.0.1", 2302)),
            EnqueueOutcome::Queued
        );
        started.notified().await;

        // queue capacity is one: the next job fits, the one after is shed
        assert_eq!(
            pipeline.enqueue(job("generic", "127.0.0.1", 2303)),
            EnqueueOutcome::Queued
        );
        assert_eq!(
            pipeline.enqueue(job("generic", "127.0.0.1", 2304)),
            EnqueueOutcome::Dropped
        );

        release.notify_one();
        pipeline.shutdown().await;

        let stats = pipeline.stats();
        assert_eq!(stats.queued, 2);
        assert_eq!(stats.dropped, 1);

        // everything queued before shutdown landed in the registry
        assert!(registry.get("MetricZ", "127.0.0.1", 2302).await.unwrap().is_some());
        assert!(registry.get("MetricZ", "127.0.0.1", 2303).await.unwrap().is_some());
        assert!(registry.get("MetricZ", "127.0.0.1", 2304).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn shutdown_drains_the_backlog() {
        let registry = Arc::new(Registry::open_in_memory().await.unwrap());
        let pipeline =
            IngestPipeline::start(registry.clone(), Arc::new(FailProber), None, 100, 2);

        for port in 0..10u16 {
            assert_eq!(
                pipeline.enqueue(job("generic", "198.51.100.7", 3000 + port)),
                EnqueueOutcome::Queued
            );
        }
        pipeline.shutdown().await;

        assert_eq!(registry.list().await.unwrap().len(), 10);
    }

    #[tokio::test]
    async fn empty_kind_defaults_to_generic() {
        let registry = Arc::new(Registry::open_in_memory().await.unwrap());
        let pipeline =
            IngestPipeline::start(registry.clone(), Arc::new(FailProber), None, 10, 1);

        pipeline.enqueue(job("", "198.51.100.7", 2302));
        pipeline.shutdown().await;

        let node = registry
            .get("MetricZ", "198.51.100.7", 2302)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(node.kind, "generic");
    }

    #[tokio::test]
    async fn failed_probe_still_merges_bare_node() {
        let registry = Arc::new(Registry::open_in_memory().await.unwrap());
        let pipeline =
            IngestPipeline::start(registry.clone(), Arc::new(FailProber), None, 10, 1);

        pipeline.enqueue(job("steam", "127.0.0.1", 2302));
        pipeline.shutdown().await;

        let node = registry
            .get("MetricZ", "127.0.0.1", 2302)
            .await
            .unwrap()
            .unwrap();
        assert!(!node.is_enriched());
        assert_eq!(node.count, 1);
    }

    #[tokio::test]
    async fn loopback_is_stored_in_ipv4_form() {
        let registry = Arc::new(Registry::open_in_memory().await.unwrap());
        let pipeline =
            IngestPipeline::start(registry.clone(), Arc::new(FailProber), None, 10, 1);

        pipeline.enqueue(job("generic", "::1", 2302));
        pipeline.shutdown().await;

        assert!(registry.get("MetricZ", "127.0.0.1", 2302).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn resolver_fills_country_code() {
        let registry = Arc::new(Registry::open_in_memory().await.unwrap());
        let pipeline = IngestPipeline::start(
            registry.clone(),
            Arc::new(FailProber),
            Some(Arc::new(StaticResolver("DE"))),
            10,
            1,
        );

        pipeline.enqueue(job("generic", "198.51.100.7", 2302));
        pipeline.shutdown().await;

        let node = registry
            .get("MetricZ", "198.51.100.7", 2302)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(node.country_code, "DE");
    }

    #[tokio::test]
    async fn enqueue_after_shutdown_is_dropped() {
        let registry = Arc::new(Registry::open_in_memory().await.unwrap());
        let pipeline =
            IngestPipeline::start(registry.clone(), Arc::new(FailProber), None, 10, 1);

        pipeline.shutdown().await;
        assert_eq!(
            pipeline.enqueue(job("generic", "198.51.100.7", 2302)),
            EnqueueOutcome::Dropped
        );
    }
}
