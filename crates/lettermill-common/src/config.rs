//! Configuration for lettermill

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Application-wide settings
    #[serde(default)]
    pub app: AppConfig,

    /// Database configuration
    pub database: DatabaseConfig,

    /// Send engine configuration
    #[serde(default)]
    pub engine: EngineConfig,

    /// SMTP server blocks. Each block becomes part of the round-robin
    /// "email" messenger and, when named, a standalone messenger too.
    #[serde(default, rename = "smtp")]
    pub smtp_servers: Vec<SmtpServerConfig>,

    /// Bounce processing configuration
    #[serde(default)]
    pub bounce: BounceConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Application-wide settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Public root URL used in unsubscribe links and tracking pixels
    #[serde(default = "default_root_url")]
    pub root_url: String,

    /// Hostname used in generated Message-ID headers. Falls back to the
    /// SMTP server host when unset.
    pub message_id_host: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            root_url: default_root_url(),
            message_id_host: None,
        }
    }
}

fn default_root_url() -> String {
    "http://localhost:9000".to_string()
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Postgres connection URL
    pub url: String,

    /// Maximum connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

fn default_max_connections() -> u32 {
    20
}

fn default_min_connections() -> u32 {
    2
}

/// Send engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of concurrent send workers
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Maximum subscribers fetched per batch; also sizes the queues
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Error threshold at which a campaign is auto-paused. 0 disables.
    #[serde(default = "default_max_send_errors")]
    pub max_send_errors: u64,

    /// Enable the global sliding-window rate limit
    #[serde(default)]
    pub sliding_window: bool,

    /// Messages allowed per sliding window
    #[serde(default)]
    pub sliding_window_rate: u64,

    /// Sliding window length in seconds. Must exceed 1s to take effect.
    #[serde(default = "default_sliding_window_duration")]
    pub sliding_window_duration_secs: u64,

    /// Legacy per-worker rate hint. Kept for config compatibility; the
    /// engine does not consult it.
    #[serde(default)]
    pub message_rate: usize,

    /// Default From address when a campaign doesn't set one
    #[serde(default = "default_from_email")]
    pub from_email: String,

    /// Interval in seconds between scans for newly running campaigns
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,

    /// Number of successful sends accumulated before the campaign counters
    /// are flushed to the database
    #[serde(default = "default_flush_threshold")]
    pub flush_threshold: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            batch_size: default_batch_size(),
            max_send_errors: default_max_send_errors(),
            sliding_window: false,
            sliding_window_rate: 0,
            sliding_window_duration_secs: default_sliding_window_duration(),
            message_rate: 0,
            from_email: default_from_email(),
            scan_interval_secs: default_scan_interval(),
            flush_threshold: default_flush_threshold(),
        }
    }
}

fn default_concurrency() -> usize {
    10
}

fn default_batch_size() -> usize {
    1000
}

fn default_max_send_errors() -> u64 {
    1000
}

fn default_sliding_window_duration() -> u64 {
    3600
}

fn default_from_email() -> String {
    "noreply@localhost".to_string()
}

fn default_scan_interval() -> u64 {
    5
}

fn default_flush_threshold() -> u64 {
    100
}

/// A single SMTP server block
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpServerConfig {
    /// Disabled blocks are kept in config but not used for sending.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Optional unique name. Named servers are also registered as
    /// standalone messengers.
    #[serde(default)]
    pub name: String,

    pub host: String,

    #[serde(default = "default_smtp_port")]
    pub port: u16,

    #[serde(default)]
    pub username: String,

    /// Password. Spaces are stripped before use (app passwords are often
    /// formatted with spaces for readability).
    #[serde(default)]
    pub password: String,

    /// Auth protocol: "plain", "login", "cram" or "none"
    #[serde(default = "default_auth_protocol")]
    pub auth_protocol: String,

    /// TLS mode: "none", "tls" (implicit, port 465) or "starttls" (port 587)
    #[serde(default = "default_tls_type")]
    pub tls_type: String,

    #[serde(default)]
    pub tls_skip_verify: bool,

    /// Maximum pooled connections to this server
    #[serde(default = "default_max_conns")]
    pub max_conns: usize,

    /// Seconds an idle pooled connection is kept before being discarded
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Seconds a push waits for a free connection before erroring
    #[serde(default = "default_wait_timeout")]
    pub wait_timeout_secs: u64,

    /// Hostname sent in EHLO. Defaults to "localhost".
    #[serde(default)]
    pub hello_hostname: Option<String>,

    /// Static headers attached to every message sent through this server
    #[serde(default)]
    pub email_headers: HashMap<String, String>,
}

fn default_true() -> bool {
    true
}

fn default_smtp_port() -> u16 {
    587
}

fn default_auth_protocol() -> String {
    "plain".to_string()
}

fn default_tls_type() -> String {
    "starttls".to_string()
}

fn default_max_conns() -> usize {
    10
}

fn default_idle_timeout() -> u64 {
    15
}

fn default_wait_timeout() -> u64 {
    5
}

/// Bounce processing configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BounceConfig {
    /// Enable bounce mailbox scanning
    #[serde(default)]
    pub enabled: bool,

    /// POP3 mailboxes to scan
    #[serde(default)]
    pub mailboxes: Vec<BounceMailboxConfig>,

    /// Per-type actions applied once a subscriber's bounce count for that
    /// type reaches the threshold
    #[serde(default)]
    pub actions: BounceActions,
}

/// A POP3 bounce mailbox
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BounceMailboxConfig {
    pub host: String,

    #[serde(default = "default_pop3_port")]
    pub port: u16,

    /// "userpass" or "none"
    #[serde(default = "default_pop3_auth")]
    pub auth_protocol: String,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    #[serde(default)]
    pub tls_enabled: bool,

    #[serde(default)]
    pub tls_skip_verify: bool,

    /// Minutes between scans. Must be at least 1.
    #[serde(default = "default_scan_interval_minutes")]
    pub scan_interval_minutes: u64,

    /// Maximum messages downloaded per scan cycle
    #[serde(default = "default_fetch_limit")]
    pub fetch_limit: usize,
}

fn default_pop3_port() -> u16 {
    110
}

fn default_pop3_auth() -> String {
    "userpass".to_string()
}

fn default_scan_interval_minutes() -> u64 {
    15
}

fn default_fetch_limit() -> usize {
    100
}

/// Action applied to a subscriber once their bounce count for a type
/// reaches the threshold
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BounceAction {
    /// Bounce count threshold
    pub count: i64,

    /// "none", "blocklist" or "delete"
    pub action: String,
}

/// Per-bounce-type actions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BounceActions {
    pub hard: BounceAction,
    pub soft: BounceAction,
    pub complaint: BounceAction,
}

impl Default for BounceActions {
    fn default() -> Self {
        Self {
            hard: BounceAction {
                count: 1,
                action: "blocklist".to_string(),
            },
            soft: BounceAction {
                count: 2,
                action: "none".to_string(),
            },
            complaint: BounceAction {
                count: 1,
                action: "blocklist".to_string(),
            },
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from default locations
    pub fn load() -> crate::Result<Self> {
        let paths = [
            std::path::PathBuf::from("./config.toml"),
            std::path::PathBuf::from("/etc/lettermill/config.toml"),
        ];

        for path in paths {
            if path.exists() {
                return Self::from_file(&path);
            }
        }

        Err(crate::Error::Config(
            "No configuration file found".to_string(),
        ))
    }

    /// Validate cross-field constraints
    pub fn validate(&self) -> crate::Result<()> {
        for srv in &self.smtp_servers {
            match srv.auth_protocol.as_str() {
                "plain" | "login" | "cram" | "none" | "" => {}
                other => {
                    return Err(crate::Error::Config(format!(
                        "unknown SMTP auth protocol '{}' on server {}",
                        other, srv.host
                    )));
                }
            }
            match srv.tls_type.as_str() {
                "none" | "tls" | "starttls" => {}
                other => {
                    return Err(crate::Error::Config(format!(
                        "unknown TLS type '{}' on server {}",
                        other, srv.host
                    )));
                }
            }
        }

        for mbox in &self.bounce.mailboxes {
            if mbox.scan_interval_minutes < 1 {
                return Err(crate::Error::Config(format!(
                    "bounce mailbox {} scan interval must be at least a minute",
                    mbox.host
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_engine_config() {
        let engine = EngineConfig::default();
        assert_eq!(engine.concurrency, 10);
        assert_eq!(engine.batch_size, 1000);
        assert!(!engine.sliding_window);
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[app]
root_url = "https://news.example.com"

[database]
url = "postgres://localhost/lettermill"

[engine]
concurrency = 4
batch_size = 500
max_send_errors = 10

[[smtp]]
name = "primary"
host = "smtp.example.com"
port = 465
username = "mailer@example.com"
password = "secret"
auth_protocol = "plain"
tls_type = "tls"

[bounce]
enabled = true

[[bounce.mailboxes]]
host = "pop.example.com"
port = 995
username = "bounces@example.com"
password = "secret"
tls_enabled = true
"#;

        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.app.root_url, "https://news.example.com");
        assert_eq!(config.engine.concurrency, 4);
        assert_eq!(config.smtp_servers.len(), 1);
        assert_eq!(config.smtp_servers[0].tls_type, "tls");
        assert_eq!(config.bounce.mailboxes[0].scan_interval_minutes, 15);
    }

    #[test]
    fn test_rejects_unknown_auth_protocol() {
        let toml = r#"
[database]
url = "postgres://localhost/lettermill"

[[smtp]]
host = "smtp.example.com"
auth_protocol = "xoauth2"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_bounce_actions() {
        let actions = BounceActions::default();
        assert_eq!(actions.hard.action, "blocklist");
        assert_eq!(actions.soft.action, "none");
    }
}
