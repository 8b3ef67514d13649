//! Daemon lifecycle management.
//!
//! Owns every long-lived component and the order they come up and go down
//! in. Shutdown is drain-first: the HTTP listener and sweep tasks stop
//! before the ingest queue is closed, and the queue is fully drained
//! before the registry pool closes, so an accepted beacon is never lost
//! to a shutdown race.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};
use tokio::signal;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::admission::{AdmissionGate, GateLimits};
use crate::config::Config;
use crate::daemon::http::auth::AuthState;
use crate::daemon::http::handlers::{AppState, IntakePolicy};
use crate::daemon::http::HttpServer;
use crate::enrich::{A2sProber, CountryResolver, PrefixResolver, ServerProber};
use crate::ingest::IngestPipeline;
use crate::registry::Registry;

/// How often expired suppression entries are evicted.
const SOFT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
/// How often idle rate-limit buckets are evicted.
const HARD_SWEEP_INTERVAL: Duration = Duration::from_secs(300);
/// How long background tasks get to finish before being aborted.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Daemon state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Stopped,
    Starting,
    Running,
    Draining,
}

/// The long-running service: HTTP front end, admission sweeps, ingest
/// pipeline, and the registry they all share.
pub struct Daemon {
    registry: Arc<Registry>,
    gate: Arc<AdmissionGate>,
    pipeline: Arc<IngestPipeline>,
    http: Mutex<Option<HttpServer>>,
    local_addr: SocketAddr,
    state: RwLock<DaemonState>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Daemon {
    /// Bring up every component, in dependency order.
    ///
    /// Any failure here is fatal: the service must not accept beacons
    /// with a half-working registry or an unbound listener.
    pub async fn start(config: Config) -> Result<Self> {
        config.validate()?;
        info!("Starting nodebeat daemon");

        let registry = Arc::new(Registry::open(&config.storage.database_path).await?);

        let gate = Arc::new(AdmissionGate::new(GateLimits {
            hard_count: config.admission.hard_limit_count,
            hard_window: config.admission.hard_window(),
            soft_window: config.admission.soft_window(),
        }));

        let prober: Arc<dyn ServerProber> =
            Arc::new(A2sProber::new(config.query.timeout(), config.query.buffer_size));

        let resolver = PrefixResolver::from_table(&config.geo.country_table);
        let resolver: Option<Arc<dyn CountryResolver>> = if resolver.is_empty() {
            info!("Country resolution disabled: no prefix table configured");
            None
        } else {
            Some(Arc::new(resolver))
        };

        let pipeline = Arc::new(IngestPipeline::start(
            registry.clone(),
            prober.clone(),
            resolver,
            config.ingest.queue_size,
            config.ingest.workers,
        ));

        let app_state = AppState {
            registry: registry.clone(),
            gate: gate.clone(),
            pipeline: pipeline.clone(),
            prober,
            policy: Arc::new(IntakePolicy::from_config(&config.http)),
        };
        let auth_state = AuthState::new(config.http.auth_token.clone());

        let http = HttpServer::bind(&config.http.listen_addr, app_state, auth_state).await?;
        let local_addr = http.local_addr();

        let (shutdown_tx, _) = broadcast::channel(16);

        info!(
            addr = %local_addr,
            db = %config.storage.database_path.display(),
            "Daemon initialized"
        );

        Ok(Self {
            registry,
            gate,
            pipeline,
            http: Mutex::new(Some(http)),
            local_addr,
            state: RwLock::new(DaemonState::Starting),
            shutdown_tx,
        })
    }

    /// Address the HTTP listener bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Current lifecycle state.
    pub fn state(&self) -> DaemonState {
        *self.state.read()
    }

    /// Ask a running daemon to drain and stop. Safe to call repeatedly.
    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    fn transition(&self, next: DaemonState) {
        let mut state = self.state.write();
        let current = *state;
        if current != next {
            info!(from = ?current, to = ?next, "Daemon state change");
            *state = next;
        }
    }

    /// Serve until a shutdown signal arrives, then drain.
    pub async fn run(&self) -> Result<()> {
        let http = self
            .http
            .lock()
            .take()
            .context("Daemon can only run once")?;

        let sweeps = self.spawn_sweeps();

        let http_shutdown = self.shutdown_tx.subscribe();
        let http_handle = tokio::spawn(async move {
            match http.run(http_shutdown).await {
                Ok(()) => info!("HTTP server stopped"),
                Err(e) => error!("HTTP server failed: {}", e),
            }
        });

        // Subscribe before flipping to Running so a shutdown triggered the
        // moment the state becomes visible is never missed.
        let shutdown_rx = self.shutdown_tx.subscribe();
        self.transition(DaemonState::Running);

        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received ctrl-c, draining");
            }
            _ = Self::wait_for_sigterm() => {
                info!("Received SIGTERM, draining");
            }
            _ = Self::wait_for_shutdown(shutdown_rx) => {
                info!("Shutdown requested, draining");
            }
        }

        self.drain(http_handle, sweeps).await;
        Ok(())
    }

    /// Periodic gate maintenance, one task per layer.
    fn spawn_sweeps(&self) -> Vec<(&'static str, JoinHandle<()>)> {
        let soft = {
            let gate = self.gate.clone();
            let mut shutdown = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                let mut tick = interval(SOFT_SWEEP_INTERVAL);
                tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = tick.tick() => gate.sweep_soft(),
                        _ = shutdown.recv() => break,
                    }
                }
            })
        };

        let hard = {
            let gate = self.gate.clone();
            let mut shutdown = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                let mut tick = interval(HARD_SWEEP_INTERVAL);
                tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = tick.tick() => gate.sweep_hard(),
                        _ = shutdown.recv() => break,
                    }
                }
            })
        };

        vec![("soft sweep", soft), ("hard sweep", hard)]
    }

    /// Stop accepting work, finish what was accepted, release storage.
    async fn drain(&self, http: JoinHandle<()>, sweeps: Vec<(&'static str, JoinHandle<()>)>) {
        self.transition(DaemonState::Draining);
        let _ = self.shutdown_tx.send(());

        Self::join_with_grace("http", http).await;
        for (name, handle) in sweeps {
            Self::join_with_grace(name, handle).await;
        }

        // No grace period here: queued beacons were acknowledged as
        // accounted and must reach the registry.
        self.pipeline.shutdown().await;
        self.registry.close().await;

        self.transition(DaemonState::Stopped);
        info!("Daemon stopped");
    }

    async fn join_with_grace(name: &str, handle: JoinHandle<()>) {
        let abort = handle.abort_handle();
        if tokio::time::timeout(SHUTDOWN_GRACE, handle).await.is_err() {
            warn!(task = name, "Task did not stop in time, aborting");
            abort.abort();
        }
    }

    async fn wait_for_shutdown(mut shutdown_rx: broadcast::Receiver<()>) {
        let _ = shutdown_rx.recv().await;
    }

    #[cfg(unix)]
    async fn wait_for_sigterm() {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    }

    #[cfg(not(unix))]
    async fn wait_for_sigterm() {
        std::future::pending::<()>().await;
    }
}
