//! HTTP server.
//!
//! Axum-based server carrying both the telemetry intake and the admin API.
//! Binding is split from serving so the daemon can fail fast on a bad
//! listen address and report the real port when it bound to port 0.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::http::Method;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use super::auth::AuthState;
use super::handlers::AppState;
use super::routes::create_router;

/// HTTP server
pub struct HttpServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    app_state: AppState,
    auth_state: AuthState,
}

impl HttpServer {
    /// Bind the listener without accepting connections yet.
    pub async fn bind(
        listen_addr: &str,
        app_state: AppState,
        auth_state: AuthState,
    ) -> Result<Self> {
        let addr: SocketAddr = listen_addr.parse().context("Invalid HTTP listen address")?;

        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind HTTP server on {}", addr))?;
        let local_addr = listener
            .local_addr()
            .context("Failed to read bound address")?;

        Ok(Self {
            listener,
            local_addr,
            app_state,
            auth_state,
        })
    }

    /// Address the listener actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve until the shutdown signal fires.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let cors = CorsLayer::new()
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS, Method::DELETE])
            .allow_headers(Any)
            .allow_origin(Any);

        let app = create_router(self.app_state, self.auth_state)
            .layer(cors)
            .layer(TraceLayer::new_for_http());

        info!("HTTP server listening on http://{}", self.local_addr);

        // ConnectInfo gives handlers the peer address for rate limiting.
        axum::serve(
            self.listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            info!("HTTP server shutting down");
        })
        .await
        .context("HTTP server error")?;

        Ok(())
    }
}
