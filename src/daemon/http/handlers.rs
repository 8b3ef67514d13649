//! HTTP request handlers.
//!
//! The telemetry handler is deliberately forgiving: apart from the hard
//! rate limit, every rejected beacon still gets a 200 with a short status
//! token, so misconfigured reporting mods never retry in a tight loop.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::rejection::BytesRejection;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::header::{CONTENT_TYPE, USER_AGENT};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use tracing::{debug, error, info, trace};

use crate::admission::{Admission, AdmissionGate};
use crate::config::HttpConfig;
use crate::enrich::ServerProber;
use crate::ingest::{BeaconJob, EnqueueOutcome, IngestPipeline};
use crate::registry::Registry;
use crate::types::Beacon;

use super::types::{
    BeaconRequest, ErrorResponse, HealthResponse, NodeKeyParams, ProbeParams, StatusResponse,
};

/// Beacon accepted and queued for processing.
const MSG_ACCOUNTED: &str = "successfully accounted";
/// Beacon acknowledged but not processed (validation failure or full queue).
const MSG_NOT_ACCOUNTED: &str = "not accounted";
/// Beacon suppressed by the per-endpoint window.
const MSG_SUPPRESSED: &str = "ok";

/// Validation rules the intake applies before a beacon reaches the gate.
#[derive(Debug, Clone)]
pub struct IntakePolicy {
    pub trust_proxy: bool,
    pub allowed_apps: HashSet<String>,
    pub expected_user_agent: String,
    pub ignore_user_agent: bool,
    pub expected_content_type: String,
    pub max_body_bytes: u64,
}

impl IntakePolicy {
    pub fn from_config(config: &HttpConfig) -> Self {
        Self {
            trust_proxy: config.trust_proxy,
            allowed_apps: config.allowed_apps.iter().cloned().collect(),
            expected_user_agent: config.expected_user_agent.clone(),
            ignore_user_agent: config.ignore_user_agent,
            expected_content_type: config.expected_content_type.clone(),
            max_body_bytes: config.max_body_bytes,
        }
    }
}

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub gate: Arc<AdmissionGate>,
    pub pipeline: Arc<IngestPipeline>,
    pub prober: Arc<dyn ServerProber>,
    pub policy: Arc<IntakePolicy>,
}

/// Client address as seen through any trusted proxy layer.
///
/// Cloudflare puts the original address in `CF-Connecting-IP`; generic
/// reverse proxies prepend it to `X-Forwarded-For`. Both headers are
/// trivially spoofable when the service is exposed directly, so they are
/// only honored when `trust_proxy` is set.
fn resolve_real_ip(headers: &HeaderMap, peer: SocketAddr, trust_proxy: bool) -> String {
    if trust_proxy {
        if let Some(ip) = headers.get("cf-connecting-ip").and_then(|v| v.to_str().ok()) {
            let ip = ip.trim();
            if !ip.is_empty() {
                return ip.to_string();
            }
        }
        if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
            if let Some(first) = forwarded.split(',').next() {
                let first = first.trim();
                if !first.is_empty() {
                    return first.to_string();
                }
            }
        }
    }
    peer.ip().to_string()
}

fn plain(status: StatusCode, message: &'static str) -> Response {
    (status, message).into_response()
}

/// Telemetry intake: validate, admit, enqueue.
pub async fn telemetry(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    let policy = &state.policy;
    let ip = resolve_real_ip(&headers, peer, policy.trust_proxy);

    if !policy.expected_content_type.is_empty() {
        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !content_type.starts_with(&policy.expected_content_type) {
            debug!(ip = %ip, content_type = %content_type, "beacon with unexpected content type");
            return plain(StatusCode::OK, MSG_NOT_ACCOUNTED);
        }
    }

    if !policy.ignore_user_agent {
        let user_agent = headers
            .get(USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if user_agent != policy.expected_user_agent {
            debug!(ip = %ip, user_agent = %user_agent, "beacon with unexpected user agent");
            return plain(StatusCode::OK, MSG_NOT_ACCOUNTED);
        }
    }

    // Body errors cover both transport failures and the size cap.
    let body = match body {
        Ok(body) if body.len() as u64 <= policy.max_body_bytes => body,
        Ok(_) | Err(_) => {
            debug!(ip = %ip, "beacon body unreadable or over the size cap");
            return plain(StatusCode::OK, MSG_NOT_ACCOUNTED);
        }
    };

    let request: BeaconRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            debug!(ip = %ip, error = %e, "beacon body is not valid JSON");
            return plain(StatusCode::OK, MSG_NOT_ACCOUNTED);
        }
    };

    let Some(port) = request.normalized_port() else {
        debug!(ip = %ip, port = request.port, "beacon with out-of-range port");
        return plain(StatusCode::OK, MSG_NOT_ACCOUNTED);
    };

    if !policy.allowed_apps.is_empty()
        && !policy.allowed_apps.contains(request.application.as_str())
    {
        debug!(ip = %ip, application = %request.application, "beacon from unlisted application");
        return plain(StatusCode::OK, MSG_NOT_ACCOUNTED);
    }

    let endpoint = format!("{}:{}", ip, port);
    match state.gate.admit(&ip, &endpoint) {
        Admission::HardReject => {
            debug!(ip = %ip, "beacon rejected by the hard rate limit");
            plain(StatusCode::TOO_MANY_REQUESTS, "Too Many Requests")
        }
        Admission::SoftReject => {
            trace!(endpoint = %endpoint, "beacon suppressed within the endpoint window");
            plain(StatusCode::OK, MSG_SUPPRESSED)
        }
        Admission::Accept => {
            let beacon = Beacon {
                application: request.application,
                kind: request.kind,
                version: request.version,
                port,
            };
            let job = BeaconJob {
                beacon,
                ip,
                observed_at: Utc::now(),
            };
            match state.pipeline.enqueue(job) {
                EnqueueOutcome::Queued => {
                    trace!(endpoint = %endpoint, "beacon queued");
                    plain(StatusCode::OK, MSG_ACCOUNTED)
                }
                EnqueueOutcome::Dropped => plain(StatusCode::OK, MSG_NOT_ACCOUNTED),
            }
        }
    }
}

/// Health endpoint, open on purpose so load balancers can poll it.
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        healthy: true,
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Full registry dump, newest activity first.
pub async fn list_nodes(State(state): State<AppState>) -> Response {
    match state.registry.list().await {
        Ok(nodes) => (StatusCode::OK, Json(nodes)).into_response(),
        Err(e) => {
            error!("Failed to list nodes: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new("database error")),
            )
                .into_response()
        }
    }
}

/// Single node lookup by (application, ip, port).
pub async fn get_node(
    State(state): State<AppState>,
    Query(params): Query<NodeKeyParams>,
) -> Response {
    match state
        .registry
        .get(&params.app, &params.ip, params.port)
        .await
    {
        Ok(Some(node)) => (StatusCode::OK, Json(node)).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new("node not found")),
        )
            .into_response(),
        Err(e) => {
            error!("Failed to fetch node: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new("database error")),
            )
                .into_response()
        }
    }
}

/// Remove one node from the registry.
pub async fn delete_node(
    State(state): State<AppState>,
    Query(params): Query<NodeKeyParams>,
) -> Response {
    match state
        .registry
        .delete(&params.app, &params.ip, params.port)
        .await
    {
        Ok(()) => {
            info!(app = %params.app, ip = %params.ip, port = params.port, "node deleted");
            (StatusCode::OK, Json(StatusResponse::ok("Node deleted"))).into_response()
        }
        Err(e) => {
            error!("Failed to delete node: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new("database error")),
            )
                .into_response()
        }
    }
}

/// On-demand live query against an arbitrary endpoint.
pub async fn query_server(
    State(state): State<AppState>,
    Query(params): Query<ProbeParams>,
) -> Response {
    match state.prober.probe(&params.ip, params.port).await {
        Ok(info) => (StatusCode::OK, Json(info)).into_response(),
        Err(e) => {
            debug!(ip = %params.ip, port = params.port, error = %e, "live query failed");
            (
                StatusCode::GATEWAY_TIMEOUT,
                Json(ErrorResponse::new(e.to_string())),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header::HeaderName;

    fn headers_with(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.insert(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                value.parse().unwrap(),
            );
        }
        headers
    }

    fn peer(addr: &str) -> SocketAddr {
        addr.parse().unwrap()
    }

    #[test]
    fn peer_address_wins_when_proxies_are_untrusted() {
        let headers = headers_with(&[("cf-connecting-ip", "203.0.113.9")]);
        let ip = resolve_real_ip(&headers, peer("198.51.100.7:40000"), false);
        assert_eq!(ip, "198.51.100.7");
    }

    #[test]
    fn cloudflare_header_wins_when_trusted() {
        let headers = headers_with(&[
            ("cf-connecting-ip", "203.0.113.9"),
            ("x-forwarded-for", "192.0.2.1, 10.0.0.1"),
        ]);
        let ip = resolve_real_ip(&headers, peer("10.0.0.1:40000"), true);
        assert_eq!(ip, "203.0.113.9");
    }

    #[test]
    fn first_forwarded_hop_wins_when_trusted() {
        let headers = headers_with(&[("x-forwarded-for", " 203.0.113.9 , 10.0.0.1")]);
        let ip = resolve_real_ip(&headers, peer("10.0.0.1:40000"), true);
        assert_eq!(ip, "203.0.113.9");
    }

    #[test]
    fn trusted_but_headerless_falls_back_to_peer() {
        let headers = HeaderMap::new();
        let ip = resolve_real_ip(&headers, peer("198.51.100.7:40000"), true);
        assert_eq!(ip, "198.51.100.7");
    }

    #[test]
    fn ipv6_peer_keeps_bare_form() {
        let headers = HeaderMap::new();
        let ip = resolve_real_ip(&headers, peer("[::1]:40000"), false);
        assert_eq!(ip, "::1");
    }

    #[test]
    fn policy_mirrors_http_config() {
        let config = HttpConfig {
            allowed_apps: vec!["MetricZ".to_string(), "Other".to_string()],
            max_body_bytes: 256,
            ..HttpConfig::default()
        };
        let policy = IntakePolicy::from_config(&config);
        assert!(policy.allowed_apps.contains("MetricZ"));
        assert!(policy.allowed_apps.contains("Other"));
        assert!(!policy.allowed_apps.contains("Stranger"));
        assert_eq!(policy.max_body_bytes, 256);
    }
}
