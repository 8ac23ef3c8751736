use serde::{Deserialize, Serialize};

use crate::topics::TopicPrefixes;

fn default_bus_server() -> String {
    "mqtt://localhost:1883".to_string()
}
fn default_client_id_prefix() -> String {
    "edgecast".to_string()
}
fn default_qos() -> u8 {
    1
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BusConfig {
    #[serde(default = "default_bus_server")]
    pub server: String,
    #[serde(default = "default_client_id_prefix")]
    pub client_id_prefix: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// MQTT QoS, 0-2.
    #[serde(default = "default_qos")]
    pub qos: u8,
    /// Whether the cloud's answer is published retained (§4.1 policy:
    /// offers and ICE candidates must never be retained).
    #[serde(default = "default_true")]
    pub retained_answer: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            server: default_bus_server(),
            client_id_prefix: default_client_id_prefix(),
            username: None,
            password: None,
            qos: default_qos(),
            retained_answer: true,
        }
    }
}

fn default_stun_urls() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".to_string(),
        "stun:stun1.l.google.com:19302".to_string(),
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IceConfig {
    #[serde(default = "default_stun_urls")]
    pub stun_urls: Vec<String>,
    #[serde(default)]
    pub turn_url: Option<String>,
    #[serde(default)]
    pub turn_username: Option<String>,
    #[serde(default)]
    pub turn_credential: Option<String>,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_urls: default_stun_urls(),
            turn_url: None,
            turn_username: None,
            turn_credential: None,
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8443
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub tls_cert: Option<String>,
    #[serde(default)]
    pub tls_key: Option<String>,
    /// Directory to serve under `/v1/test/e2e/broadcast` when set.
    #[serde(default)]
    pub debug_static_dir: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            tls_cert: None,
            tls_key: None,
            debug_static_dir: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_rtp_listen() -> String {
    "0.0.0.0:5004".to_string()
}
fn default_rtsp_url() -> String {
    String::new()
}
fn default_rtmp_listen() -> String {
    "0.0.0.0:1935".to_string()
}
fn default_drone_kind() -> String {
    "rtp".to_string()
}
fn default_max_burst_retries() -> u32 {
    10
}
fn default_burst_retries_group_interval_secs() -> u64 {
    60
}
fn default_answer_timeout_secs() -> u64 {
    3
}

/// Edge ingest adapter settings. The edge engine always runs a DRONE stream
/// (via `drone_kind`, either `rtp` or `rtmp`) and, when `rtsp_url` is
/// non-empty, a second MONITOR stream over RTSP — mirroring the reference
/// implementation's fixed two-stream layout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngestConfig {
    #[serde(default = "default_drone_kind")]
    pub drone_kind: String,
    #[serde(default = "default_rtp_listen")]
    pub rtp_listen: String,
    #[serde(default = "default_rtsp_url")]
    pub rtsp_url: String,
    #[serde(default = "default_rtmp_listen")]
    pub rtmp_listen: String,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            drone_kind: default_drone_kind(),
            rtp_listen: default_rtp_listen(),
            rtsp_url: default_rtsp_url(),
            rtmp_listen: default_rtmp_listen(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EdgeRetryConfig {
    #[serde(default = "default_max_burst_retries")]
    pub max_burst_retries: u32,
    #[serde(default = "default_burst_retries_group_interval_secs")]
    pub burst_retries_group_interval_secs: u64,
    #[serde(default = "default_answer_timeout_secs")]
    pub answer_timeout_secs: u64,
}

impl Default for EdgeRetryConfig {
    fn default() -> Self {
        Self {
            max_burst_retries: default_max_burst_retries(),
            burst_retries_group_interval_secs: default_burst_retries_group_interval_secs(),
            answer_timeout_secs: default_answer_timeout_secs(),
        }
    }
}

/// Top-level configuration shared by the `edge` and `cloud` binaries.
/// Deserializes from an empty TOML document to fully defaulted values.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct RelayConfig {
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub topics: TopicPrefixes,
    #[serde(default)]
    pub ice: IceConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub retry: EdgeRetryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Edge's machine id override. Empty means read `/etc/machine-id`.
    #[serde(default)]
    pub machine_id: String,
}

impl RelayConfig {
    /// Collects `ERROR:`/`WARNING:` prefixed issue strings. The caller
    /// (binary `main`) treats any `ERROR:` entry as fatal.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();

        if self.bus.server.is_empty() {
            issues.push("ERROR: bus.server must not be empty".to_string());
        }
        if self.bus.qos > 2 {
            issues.push(format!("ERROR: bus.qos must be 0-2, got {}", self.bus.qos));
        }
        if self.server.port == 0 {
            issues.push("ERROR: server.port must not be 0".to_string());
        }
        match (&self.server.tls_cert, &self.server.tls_key) {
            (Some(_), None) => {
                issues.push("ERROR: server.tls_cert set without server.tls_key".to_string())
            }
            (None, Some(_)) => {
                issues.push("ERROR: server.tls_key set without server.tls_cert".to_string())
            }
            _ => {}
        }
        if self.ice.stun_urls.is_empty() && self.ice.turn_url.is_none() {
            issues.push(
                "WARNING: no STUN or TURN servers configured, ICE may fail across NAT"
                    .to_string(),
            );
        }
        let turn_creds_without_url = self.ice.turn_url.is_none()
            && (self.ice.turn_username.is_some() || self.ice.turn_credential.is_some());
        if turn_creds_without_url {
            issues.push("WARNING: turn credentials set without ice.turn_url".to_string());
        }
        for url in self.ice.stun_urls.iter() {
            if !url.starts_with("stun:") && !url.starts_with("stuns:") {
                issues.push(format!(
                    "ERROR: ice.stun_urls entry '{url}' must start with stun: or stuns:"
                ));
            }
        }
        if let Some(url) = &self.ice.turn_url
            && !url.starts_with("turn:")
            && !url.starts_with("turns:")
        {
            issues.push(format!(
                "ERROR: ice.turn_url '{url}' must start with turn: or turns:"
            ));
        }
        if self.retry.max_burst_retries == 0 {
            issues.push("ERROR: retry.max_burst_retries must be at least 1".to_string());
        }
        if self.retry.answer_timeout_secs == 0 {
            issues.push("ERROR: retry.answer_timeout_secs must be at least 1".to_string());
        }
        if self.ingest.drone_kind != "rtp" && self.ingest.drone_kind != "rtmp" {
            issues.push(format!(
                "ERROR: ingest.drone_kind '{}' must be 'rtp' or 'rtmp'",
                self.ingest.drone_kind
            ));
        }
        if !is_valid_log_level(&self.logging.level) {
            issues.push(format!(
                "ERROR: logging.level '{}' is not a valid level (trace/debug/info/warn/error)",
                self.logging.level
            ));
        }

        issues
    }
}

fn is_valid_log_level(level: &str) -> bool {
    matches!(
        level.to_ascii_lowercase().as_str(),
        "trace" | "debug" | "info" | "warn" | "error"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn has_error(issues: &[String]) -> bool {
        issues.iter().any(|i| i.starts_with("ERROR:"))
    }
    fn has_warning(issues: &[String]) -> bool {
        issues.iter().any(|i| i.starts_with("WARNING:"))
    }

    #[test]
    fn default_config_from_empty_string() {
        let config: RelayConfig = toml::from_str("").unwrap();
        assert_eq!(config.bus.server, "mqtt://localhost:1883");
        assert_eq!(config.server.port, 8443);
        assert_eq!(config.retry.max_burst_retries, 10);
        assert_eq!(config.retry.burst_retries_group_interval_secs, 60);
        assert_eq!(config.retry.answer_timeout_secs, 3);
        assert_eq!(config.ice.stun_urls.len(), 2);
    }

    #[test]
    fn partial_config_only_bus_section() {
        let toml_str = r#"
            [bus]
            server = "mqtt://broker.example.com:1883"
        "#;
        let config: RelayConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.bus.server, "mqtt://broker.example.com:1883");
        assert_eq!(config.server.port, 8443);
    }

    #[test]
    fn validate_accepts_defaults() {
        let config = RelayConfig::default();
        assert!(!has_error(&config.validate()));
    }

    #[test]
    fn validate_rejects_zero_port() {
        let mut config = RelayConfig::default();
        config.server.port = 0;
        assert!(has_error(&config.validate()));
    }

    #[test]
    fn validate_rejects_mismatched_tls_pair() {
        let mut config = RelayConfig::default();
        config.server.tls_cert = Some("cert.pem".to_string());
        assert!(has_error(&config.validate()));
    }

    #[test]
    fn validate_warns_on_turn_creds_without_url() {
        let mut config = RelayConfig::default();
        config.ice.turn_username = Some("user".to_string());
        let issues = config.validate();
        assert!(has_warning(&issues));
        assert!(!has_error(&issues));
    }

    #[test]
    fn validate_rejects_bad_stun_scheme() {
        let mut config = RelayConfig::default();
        config.ice.stun_urls = vec!["http://example.com".to_string()];
        assert!(has_error(&config.validate()));
    }

    #[test]
    fn validate_rejects_zero_burst_retries() {
        let mut config = RelayConfig::default();
        config.retry.max_burst_retries = 0;
        assert!(has_error(&config.validate()));
    }

    #[test]
    fn validate_rejects_bad_drone_kind() {
        let mut config = RelayConfig::default();
        config.ingest.drone_kind = "srt".to_string();
        assert!(has_error(&config.validate()));
    }

    #[test]
    fn validate_rejects_bad_log_level() {
        let mut config = RelayConfig::default();
        config.logging.level = "verbose".to_string();
        assert!(has_error(&config.validate()));
    }
}
