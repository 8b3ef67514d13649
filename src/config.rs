//! Configuration for nodebeat

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for the nodebeat service
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// HTTP listener and beacon validation
    #[serde(default)]
    pub http: HttpConfig,
    /// Node registry storage
    #[serde(default)]
    pub storage: StorageConfig,
    /// Per-IP and per-endpoint admission limits
    #[serde(default)]
    pub admission: AdmissionConfig,
    /// Ingestion queue and worker pool
    #[serde(default)]
    pub ingest: IngestConfig,
    /// Live game-server queries
    #[serde(default)]
    pub query: QueryConfig,
    /// IP-to-country resolution
    #[serde(default)]
    pub geo: GeoConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// Parsing applies per-field defaults, so a partial file is fine.
    /// Validation is deferred to the daemon: maintenance commands run with
    /// settings the HTTP server would refuse (e.g. no auth token).
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file '{}': {}", path.display(), e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config file '{}': {}", path.display(), e))?;
        Ok(config)
    }

    /// Validate the fields the daemon depends on.
    ///
    /// Collects all validation errors and reports them together so the user
    /// can fix everything in one pass rather than playing whack-a-mole.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        // HTTP validation
        if self.http.listen_addr.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "listen_addr '{}' is not a valid socket address",
                self.http.listen_addr
            ));
        }
        if self.http.auth_token.is_empty() {
            errors.push("auth_token must be set".to_string());
        }
        if self.http.max_body_bytes == 0 {
            errors.push("max_body_bytes must be positive".to_string());
        }

        // Admission validation
        if self.admission.hard_limit_count == 0 {
            errors.push("hard_limit_count must be positive".to_string());
        }
        if self.admission.hard_limit_window_secs == 0 {
            errors.push("hard_limit_window_secs must be positive".to_string());
        }
        if self.admission.soft_limit_window_secs == 0 {
            errors.push("soft_limit_window_secs must be positive".to_string());
        }

        // Ingest validation
        if self.ingest.queue_size == 0 {
            errors.push("queue_size must be positive".to_string());
        }
        if self.ingest.workers == 0 {
            errors.push("workers must be positive".to_string());
        }

        // Query validation
        if self.query.timeout_secs == 0 {
            errors.push("query timeout_secs must be positive".to_string());
        }
        if (self.query.buffer_size as usize) < MIN_QUERY_BUFFER {
            errors.push(format!(
                "query buffer_size must be at least {} bytes",
                MIN_QUERY_BUFFER
            ));
        }

        // Storage validation
        if self.storage.database_path.as_os_str().is_empty() {
            errors.push("database_path must not be empty".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            anyhow::bail!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            );
        }
    }
}

/// Smallest info reply a query buffer must be able to hold.
const MIN_QUERY_BUFFER: usize = 64;

// ============================================================================
// HTTP Configuration
// ============================================================================

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_allowed_apps() -> Vec<String> {
    vec!["MetricZ".to_string()]
}

fn default_ignore_user_agent() -> bool {
    true
}

fn default_expected_content_type() -> String {
    "application/json".to_string()
}

fn default_max_body_bytes() -> u64 {
    512
}

/// HTTP listener and beacon validation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Address to bind the HTTP server to
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Bearer token required on admin endpoints
    #[serde(default)]
    pub auth_token: String,
    /// Trust CF-Connecting-IP / X-Forwarded-For headers for the client IP
    #[serde(default)]
    pub trust_proxy: bool,
    /// Applications accepted by the telemetry endpoint; empty accepts all
    #[serde(default = "default_allowed_apps")]
    pub allowed_apps: Vec<String>,
    /// Exact User-Agent beacons must present (ignored by default)
    #[serde(default)]
    pub expected_user_agent: String,
    /// Skip the User-Agent check
    #[serde(default = "default_ignore_user_agent")]
    pub ignore_user_agent: bool,
    /// Content-Type prefix beacons must present; empty disables the check
    #[serde(default = "default_expected_content_type")]
    pub expected_content_type: String,
    /// Largest beacon body accepted, in bytes
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            auth_token: String::new(),
            trust_proxy: false,
            allowed_apps: default_allowed_apps(),
            expected_user_agent: String::new(),
            ignore_user_agent: default_ignore_user_agent(),
            expected_content_type: default_expected_content_type(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

// ============================================================================
// Storage Configuration
// ============================================================================

fn default_database_path() -> PathBuf {
    PathBuf::from("nodebeat.db")
}

/// Node registry storage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database file
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

// ============================================================================
// Admission Configuration
// ============================================================================

fn default_hard_limit_count() -> u32 {
    8
}

fn default_hard_limit_window_secs() -> u64 {
    60
}

fn default_soft_limit_window_secs() -> u64 {
    300
}

/// Per-IP and per-endpoint admission limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Beacons one IP may burst before hard rejection
    #[serde(default = "default_hard_limit_count")]
    pub hard_limit_count: u32,
    /// Window over which the hard burst allowance refills, in seconds
    #[serde(default = "default_hard_limit_window_secs")]
    pub hard_limit_window_secs: u64,
    /// Window during which repeat beacons from one endpoint are suppressed
    #[serde(default = "default_soft_limit_window_secs")]
    pub soft_limit_window_secs: u64,
}

impl AdmissionConfig {
    pub fn hard_window(&self) -> Duration {
        Duration::from_secs(self.hard_limit_window_secs)
    }

    pub fn soft_window(&self) -> Duration {
        Duration::from_secs(self.soft_limit_window_secs)
    }
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            hard_limit_count: default_hard_limit_count(),
            hard_limit_window_secs: default_hard_limit_window_secs(),
            soft_limit_window_secs: default_soft_limit_window_secs(),
        }
    }
}

// ============================================================================
// Ingest Configuration
// ============================================================================

fn default_queue_size() -> usize {
    1000
}

fn default_ingest_workers() -> usize {
    10
}

/// Ingestion queue and worker pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Beacons the queue holds before new ones are dropped
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    /// Workers draining the queue
    #[serde(default = "default_ingest_workers")]
    pub workers: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            queue_size: default_queue_size(),
            workers: default_ingest_workers(),
        }
    }
}

// ============================================================================
// Query Configuration
// ============================================================================

fn default_query_timeout_secs() -> u64 {
    3
}

fn default_query_buffer_size() -> u16 {
    1400
}

/// Live game-server query settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Whole-exchange deadline for one query, in seconds
    #[serde(default = "default_query_timeout_secs")]
    pub timeout_secs: u64,
    /// Receive buffer for query replies, in bytes
    #[serde(default = "default_query_buffer_size")]
    pub buffer_size: u16,
}

impl QueryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_query_timeout_secs(),
            buffer_size: default_query_buffer_size(),
        }
    }
}

// ============================================================================
// Geo Configuration
// ============================================================================

/// IP-to-country resolution settings
///
/// Maps CIDR prefixes to ISO country codes, e.g.
///
/// ```toml
/// [geo.country_table]
/// "81.0.0.0/8" = "DE"
/// "203.0.113.0/24" = "AU"
/// ```
///
/// An empty table disables country resolution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeoConfig {
    #[serde(default)]
    pub country_table: HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.http.auth_token = "secret".to_string();
        config
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.http.listen_addr, "0.0.0.0:8080");
        assert!(config.http.auth_token.is_empty());
        assert!(!config.http.trust_proxy);
        assert_eq!(config.http.allowed_apps, vec!["MetricZ".to_string()]);
        assert!(config.http.ignore_user_agent);
        assert_eq!(config.http.expected_content_type, "application/json");
        assert_eq!(config.http.max_body_bytes, 512);
        assert_eq!(config.admission.hard_limit_count, 8);
        assert_eq!(config.admission.hard_window(), Duration::from_secs(60));
        assert_eq!(config.admission.soft_window(), Duration::from_secs(300));
        assert_eq!(config.ingest.queue_size, 1000);
        assert_eq!(config.ingest.workers, 10);
        assert_eq!(config.query.timeout(), Duration::from_secs(3));
        assert_eq!(config.query.buffer_size, 1400);
        assert_eq!(config.storage.database_path, PathBuf::from("nodebeat.db"));
        assert!(config.geo.country_table.is_empty());
    }

    #[test]
    fn default_config_fails_validation_without_token() {
        let err = Config::default().validate().unwrap_err();
        assert!(err.to_string().contains("auth_token"));
    }

    #[test]
    fn valid_config_passes_validation() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn validation_collects_multiple_errors() {
        let mut config = valid_config();
        config.ingest.workers = 0;
        config.ingest.queue_size = 0;
        config.admission.hard_limit_count = 0;

        let message = config.validate().unwrap_err().to_string();
        assert!(message.contains("workers"));
        assert!(message.contains("queue_size"));
        assert!(message.contains("hard_limit_count"));
    }

    #[test]
    fn rejects_unparseable_listen_addr() {
        let mut config = valid_config();
        config.http.listen_addr = "not-an-address".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("listen_addr"));
    }

    #[test]
    fn partial_toml_keeps_defaults_elsewhere() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[http]
auth_token = "hunter2"
trust_proxy = true

[admission]
hard_limit_count = 20

[geo.country_table]
"81.0.0.0/8" = "DE"
"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.http.auth_token, "hunter2");
        assert!(config.http.trust_proxy);
        assert_eq!(config.admission.hard_limit_count, 20);
        // untouched sections keep defaults
        assert_eq!(config.http.listen_addr, "0.0.0.0:8080");
        assert_eq!(config.ingest.queue_size, 1000);
        assert_eq!(
            config.geo.country_table.get("81.0.0.0/8"),
            Some(&"DE".to_string())
        );
    }

    #[test]
    fn load_reports_missing_file() {
        let err = Config::load(Path::new("/nonexistent/nodebeat.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
