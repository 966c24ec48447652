use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::AmpsError;

/// CLI arguments for the relay server.
#[derive(Parser, Debug, Clone)]
#[command(name = "amps")]
#[command(about = "AMP relay server")]
#[command(version)]
pub struct Args {
    /// Path to a YAML or JSON configuration file.
    #[arg(long, env = "AMP_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Complete relay server configuration.
///
/// Defaults come from [`Config::default`]; values from a config file
/// override defaults, and `AMP_*` environment variables override both.
/// [`Config::validate`] runs after the merge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Listener and transport options.
    pub server: ServerSection,
    /// Message store options.
    pub storage: StorageSection,
    /// Operator-facing log options.
    pub logging: LoggingSection,
    /// Authentication and abuse-control options.
    pub security: SecuritySection,
}

/// `[server]` configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSection {
    /// Socket address to listen on.
    pub address: String,
    /// HTTP read deadline in seconds (health probes and upgrade requests).
    pub read_timeout: u64,
    /// HTTP write deadline in seconds.
    pub write_timeout: u64,
    /// Upper bound on inbound WebSocket frame size, in bytes.
    pub max_payload_size: usize,
    /// Gate for the `/ws` endpoint.
    pub enable_websocket: bool,
    /// Socket address for the Prometheus metrics sidecar.
    pub metrics_addr: String,
}

/// `[storage]` configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageSection {
    /// Storage backend: `memory`, `file`, or `redis`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Data directory, required when `type = file`.
    pub path: String,
    /// Fallback retention in seconds for messages without their own TTL.
    pub default_ttl: u64,
    /// Soft cap on stored messages. Zero means unlimited.
    pub max_messages: usize,
    /// Seconds between background expiry sweeps.
    pub cleanup_interval: u64,
}

/// `[logging]` configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingSection {
    /// Log level: `debug`, `info`, `warn`, or `error`.
    pub level: String,
    /// Log format: `text` or `json`.
    pub format: String,
    /// Log destination: `stdout`, `stderr`, or a file path.
    pub output: String,
}

/// `[security]` configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SecuritySection {
    /// Selects the real authenticator over the no-op variant.
    pub enable_auth: bool,
    /// CORS allowlist for the upgrade request. Empty means allow any.
    pub allowed_origins: Vec<String>,
    /// Per-connection inbound message cap per minute. Zero disables.
    pub rate_limit_per_minute: u32,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            address: ":8080".to_owned(),
            read_timeout: 30,
            write_timeout: 30,
            max_payload_size: 512 * 1024,
            enable_websocket: true,
            metrics_addr: "127.0.0.1:9090".to_owned(),
        }
    }
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            kind: "memory".to_owned(),
            path: "./data".to_owned(),
            default_ttl: 300,
            max_messages: 10_000,
            cleanup_interval: 60,
        }
    }
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: "text".to_owned(),
            output: "stdout".to_owned(),
        }
    }
}

impl Default for SecuritySection {
    fn default() -> Self {
        Self {
            enable_auth: false,
            allowed_origins: Vec::new(),
            rate_limit_per_minute: 60,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerSection::default(),
            storage: StorageSection::default(),
            logging: LoggingSection::default(),
            security: SecuritySection::default(),
        }
    }
}

const VALID_STORAGE_TYPES: &[&str] = &["memory", "file", "redis"];
const VALID_LOG_LEVELS: &[&str] = &["debug", "info", "warn", "error"];
const VALID_LOG_FORMATS: &[&str] = &["text", "json"];

impl Config {
    /// Loads configuration: defaults, then the optional file, then
    /// environment variables, then validation.
    ///
    /// # Errors
    ///
    /// Returns [`AmpsError::Config`] if the file cannot be read or parsed,
    /// or if the merged configuration fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self, AmpsError> {
        let mut config = Self::default();
        if let Some(path) = path {
            config = Self::from_file(path)?;
        }
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self, AmpsError> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| AmpsError::Config(format!("failed to read {}: {e}", path.display())))?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        match ext.as_str() {
            "yaml" | "yml" => serde_yaml::from_str(&data)
                .map_err(|e| AmpsError::Config(format!("failed to parse YAML: {e}"))),
            "json" => serde_json::from_str(&data)
                .map_err(|e| AmpsError::Config(format!("failed to parse JSON: {e}"))),
            other => Err(AmpsError::Config(format!(
                "unsupported config file format: .{other} (use .yaml, .yml, or .json)"
            ))),
        }
    }

    /// Applies `AMP_*` environment variable overrides. Variables take
    /// precedence over file-loaded values; unparseable values are ignored.
    pub fn apply_env(&mut self) {
        env_string("AMP_SERVER_ADDRESS", &mut self.server.address);
        env_parse("AMP_SERVER_READ_TIMEOUT", &mut self.server.read_timeout);
        env_parse("AMP_SERVER_WRITE_TIMEOUT", &mut self.server.write_timeout);
        env_parse("AMP_SERVER_MAX_PAYLOAD_SIZE", &mut self.server.max_payload_size);
        env_bool("AMP_SERVER_ENABLE_WEBSOCKET", &mut self.server.enable_websocket);
        env_string("AMP_SERVER_METRICS_ADDR", &mut self.server.metrics_addr);

        env_string("AMP_STORAGE_TYPE", &mut self.storage.kind);
        env_string("AMP_STORAGE_PATH", &mut self.storage.path);
        env_parse("AMP_STORAGE_DEFAULT_TTL", &mut self.storage.default_ttl);
        env_parse("AMP_STORAGE_MAX_MESSAGES", &mut self.storage.max_messages);
        env_parse("AMP_STORAGE_CLEANUP_INTERVAL", &mut self.storage.cleanup_interval);

        env_string("AMP_LOG_LEVEL", &mut self.logging.level);
        env_string("AMP_LOG_FORMAT", &mut self.logging.format);
        env_string("AMP_LOG_OUTPUT", &mut self.logging.output);

        env_bool("AMP_SECURITY_ENABLE_AUTH", &mut self.security.enable_auth);
        if let Ok(v) = std::env::var("AMP_SECURITY_ALLOWED_ORIGINS") {
            self.security.allowed_origins =
                v.split(',').map(|s| s.trim().to_owned()).collect();
        }
        env_parse("AMP_SECURITY_RATE_LIMIT", &mut self.security.rate_limit_per_minute);
    }

    /// Validates the merged configuration.
    ///
    /// # Errors
    ///
    /// Returns [`AmpsError::Config`] for: empty address, non-positive
    /// sizes or timeouts, unknown storage type, `file` storage without a
    /// path, or an invalid log level or format.
    pub fn validate(&self) -> Result<(), AmpsError> {
        if self.server.address.is_empty() {
            return Err(AmpsError::Config("server address cannot be empty".into()));
        }
        if self.server.read_timeout == 0 {
            return Err(AmpsError::Config("read_timeout must be positive".into()));
        }
        if self.server.write_timeout == 0 {
            return Err(AmpsError::Config("write_timeout must be positive".into()));
        }
        if self.server.max_payload_size == 0 {
            return Err(AmpsError::Config("max_payload_size must be positive".into()));
        }
        if self.server.metrics_addr.is_empty() {
            return Err(AmpsError::Config("metrics_addr cannot be empty".into()));
        }

        let kind = self.storage.kind.to_ascii_lowercase();
        if !VALID_STORAGE_TYPES.contains(&kind.as_str()) {
            return Err(AmpsError::Config(format!(
                "invalid storage type: {} (must be one of: {})",
                self.storage.kind,
                VALID_STORAGE_TYPES.join(", ")
            )));
        }
        if kind == "file" && self.storage.path.is_empty() {
            return Err(AmpsError::Config(
                "storage path cannot be empty when using file storage".into(),
            ));
        }
        if self.storage.default_ttl == 0 {
            return Err(AmpsError::Config("default_ttl must be positive".into()));
        }
        if self.storage.cleanup_interval == 0 {
            return Err(AmpsError::Config("cleanup_interval must be positive".into()));
        }

        let level = self.logging.level.to_ascii_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(AmpsError::Config(format!(
                "invalid log level: {} (must be one of: {})",
                self.logging.level,
                VALID_LOG_LEVELS.join(", ")
            )));
        }
        let format = self.logging.format.to_ascii_lowercase();
        if !VALID_LOG_FORMATS.contains(&format.as_str()) {
            return Err(AmpsError::Config(format!(
                "invalid log format: {} (must be one of: {})",
                self.logging.format,
                VALID_LOG_FORMATS.join(", ")
            )));
        }
        Ok(())
    }

    /// Listen address with the Go-style `:port` shorthand expanded.
    #[must_use]
    pub fn listen_addr(&self) -> String {
        if self.server.address.starts_with(':') {
            format!("0.0.0.0{}", self.server.address)
        } else {
            self.server.address.clone()
        }
    }

    /// Fallback retention for messages that carry no TTL of their own.
    #[must_use]
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.storage.default_ttl)
    }

    /// Cadence of the background expiry sweep.
    #[must_use]
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.storage.cleanup_interval)
    }
}

fn env_string(name: &str, slot: &mut String) {
    if let Ok(v) = std::env::var(name) {
        if !v.is_empty() {
            *slot = v;
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, slot: &mut T) {
    if let Ok(v) = std::env::var(name) {
        if let Ok(parsed) = v.parse() {
            *slot = parsed;
        }
    }
}

fn env_bool(name: &str, slot: &mut bool) {
    if let Ok(v) = std::env::var(name) {
        let v = v.trim().to_ascii_lowercase();
        *slot = matches!(v.as_str(), "true" | "1" | "yes" | "on");
    }
}
