//! HTTP request/response types.

use crate::types::DEFAULT_QUERY_PORT;
use serde::{Deserialize, Serialize};

/// Telemetry report as it arrives on the wire.
///
/// `port` is taken as a wide integer so an out-of-range value is a
/// validation decision, not a deserialization failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeaconRequest {
    pub application: String,
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub port: i64,
}

impl BeaconRequest {
    /// Validated game port: `0` falls back to the default query port,
    /// anything outside `0..=65535` is rejected.
    pub fn normalized_port(&self) -> Option<u16> {
        match self.port {
            0 => Some(DEFAULT_QUERY_PORT),
            p if (1..=65535).contains(&p) => Some(p as u16),
            _ => None,
        }
    }
}

/// Key of one tracked endpoint, passed as query parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeKeyParams {
    pub app: String,
    pub ip: String,
    pub port: u16,
}

/// Target of a live-query proxy request.
#[derive(Debug, Clone, Deserialize)]
pub struct ProbeParams {
    pub ip: String,
    pub port: u16,
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub version: String,
}

/// Success envelope for admin mutations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
    pub message: String,
}

impl StatusResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            status: "ok".to_string(),
            message: message.into(),
        }
    }
}

/// Error envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn beacon_request_fills_optional_fields() {
        let request: BeaconRequest =
            serde_json::from_str(r#"{"application": "MetricZ"}"#).unwrap();
        assert_eq!(request.application, "MetricZ");
        assert_eq!(request.kind, "");
        assert_eq!(request.version, "");
        assert_eq!(request.port, 0);
    }

    #[test]
    fn beacon_request_reads_type_field() {
        let request: BeaconRequest =
            serde_json::from_str(r#"{"application": "MetricZ", "type": "steam", "port": 2302}"#)
                .unwrap();
        assert_eq!(request.kind, "steam");
        assert_eq!(request.port, 2302);
    }

    #[test]
    fn missing_application_is_a_decode_error() {
        assert!(serde_json::from_str::<BeaconRequest>(r#"{"port": 2302}"#).is_err());
    }

    #[test]
    fn port_normalization() {
        let mut request: BeaconRequest =
            serde_json::from_str(r#"{"application": "MetricZ"}"#).unwrap();

        assert_eq!(request.normalized_port(), Some(DEFAULT_QUERY_PORT));

        request.port = 2302;
        assert_eq!(request.normalized_port(), Some(2302));

        request.port = 65535;
        assert_eq!(request.normalized_port(), Some(65535));

        request.port = 65536;
        assert_eq!(request.normalized_port(), None);

        request.port = -1;
        assert_eq!(request.normalized_port(), None);
    }
}
