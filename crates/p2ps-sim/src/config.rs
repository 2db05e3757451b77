//! Configuration management for p2ps-sim
//!
//! Configuration is stored in TOML format.
//!
//! # Configuration File Locations
//!
//! - Unix: `~/.config/p2ps/sim.toml`
//! - Windows: `%APPDATA%\p2ps\sim.toml`

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use p2ps_core::{
    ApiCredentials, EndpointSettings, FlowSettings, HttpSessionApi, KeepaliveSettings, SessionApi, TopicAddress,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    /// Failed to parse config file
    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Failed to serialize config
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Simulator configuration
///
/// # Example TOML
///
/// ```toml
/// [endpoint]
/// product_key = "PLAF204"
/// device_id = "AF070135F064641AG"
/// app_id = "188815492"
/// namespace = ""  # Empty = no prefix
///
/// [api]
/// base_url = ""  # Empty = in-process session service
/// timeout_seconds = 10
///
/// [flow]
/// after_offer_ms = 1000
/// after_candidate_ms = 2000
/// ready_timeout_seconds = 30
///
/// [keepalive]
/// interval_ms = 10000
/// max_ticks = 10
///
/// [output]
/// format = "table"  # "table" | "json" | "quiet"
///
/// [logging]
/// level = "warn"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub endpoint: EndpointConfig,

    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub flow: FlowConfig,

    #[serde(default)]
    pub keepalive: KeepaliveConfig,

    #[serde(default)]
    pub output: OutputConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Identities and topic layout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    #[serde(default = "default_product_key")]
    pub product_key: String,

    #[serde(default = "default_device_id")]
    pub device_id: String,

    #[serde(default = "default_app_id")]
    pub app_id: String,

    /// Leading topic segment (empty = none)
    #[serde(default)]
    pub namespace: String,
}

fn default_product_key() -> String {
    "PLAF204".to_string()
}

fn default_device_id() -> String {
    "AF070135F064641AG".to_string()
}

fn default_app_id() -> String {
    "188815492".to_string()
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            product_key: default_product_key(),
            device_id: default_device_id(),
            app_id: default_app_id(),
            namespace: String::new(),
        }
    }
}

/// Session service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Base URL (empty = in-process session service)
    #[serde(default)]
    pub base_url: String,

    /// Sent as `Authorization: Bearer`
    #[serde(default)]
    pub bearer: Option<String>,

    /// Sent as the `token` header
    #[serde(default)]
    pub token: Option<String>,

    /// Sent as the `source` header
    #[serde(default)]
    pub source: Option<String>,

    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
}

fn default_timeout() -> u64 {
    10
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            bearer: None,
            token: None,
            source: None,
            timeout_seconds: default_timeout(),
        }
    }
}

/// Automated flow timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConfig {
    #[serde(default = "default_after_offer")]
    pub after_offer_ms: u64,

    #[serde(default = "default_after_candidate")]
    pub after_candidate_ms: u64,

    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_seconds: u64,
}

fn default_after_offer() -> u64 {
    1000
}

fn default_after_candidate() -> u64 {
    2000
}

fn default_ready_timeout() -> u64 {
    30
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            after_offer_ms: default_after_offer(),
            after_candidate_ms: default_after_candidate(),
            ready_timeout_seconds: default_ready_timeout(),
        }
    }
}

/// Keepalive scheduler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepaliveConfig {
    /// Used when the session configuration carries no interval
    #[serde(default = "default_interval")]
    pub interval_ms: u64,

    #[serde(default = "default_max_ticks")]
    pub max_ticks: u32,
}

fn default_interval() -> u64 {
    10_000
}

fn default_max_ticks() -> u32 {
    10
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval(),
            max_ticks: default_max_ticks(),
        }
    }
}

/// Output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Output format: "table", "json", "quiet"
    #[serde(default = "default_format")]
    pub format: String,

    #[serde(default)]
    pub verbose: bool,
}

fn default_format() -> String {
    "table".to_string()
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: default_format(),
            verbose: false,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "warn".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn check_identifier(field: &str, value: &str) -> Result<(), ConfigError> {
    if value.is_empty() {
        return Err(ConfigError::ValidationError(format!("{field} must not be empty")));
    }
    if value.contains(['/', '+', '#']) {
        return Err(ConfigError::ValidationError(format!(
            "{field} '{value}' must not contain '/', '+' or '#'"
        )));
    }
    Ok(())
}

impl Config {
    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from default location
    pub fn load_default() -> Result<Self, ConfigError> {
        if let Some(path) = Self::default_path() {
            if path.exists() {
                return Self::load(&path);
            }
        }
        Ok(Self::default())
    }

    /// Load configuration from custom path or default
    pub fn load_from(custom_path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = custom_path {
            Self::load(path)
        } else {
            Self::load_default()
        }
    }

    /// Platform-specific configuration file path
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("io", "p2ps", "p2ps").map(|dirs| dirs.config_dir().join("sim.toml"))
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_identifier("product_key", &self.endpoint.product_key)?;
        check_identifier("device_id", &self.endpoint.device_id)?;
        check_identifier("app_id", &self.endpoint.app_id)?;
        if !self.endpoint.namespace.is_empty() {
            check_identifier("namespace", &self.endpoint.namespace)?;
        }

        let url = &self.api.base_url;
        if !url.is_empty() && !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ConfigError::ValidationError(format!(
                "Invalid API URL '{}': must start with http:// or https://",
                url
            )));
        }
        if self.api.timeout_seconds == 0 {
            return Err(ConfigError::ValidationError(
                "timeout_seconds must be greater than 0".to_string(),
            ));
        }
        if self.flow.ready_timeout_seconds == 0 {
            return Err(ConfigError::ValidationError(
                "ready_timeout_seconds must be greater than 0".to_string(),
            ));
        }
        if self.keepalive.interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "keepalive interval_ms must be greater than 0".to_string(),
            ));
        }

        let valid_formats = ["table", "json", "quiet"];
        if !valid_formats.contains(&self.output.format.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid output format '{}'. Valid values: {:?}",
                self.output.format, valid_formats
            )));
        }

        let valid_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level '{}'. Valid values: {:?}",
                self.logging.level, valid_levels
            )));
        }

        Ok(())
    }

    /// Topic address for the configured device.
    pub fn topics(&self) -> Result<TopicAddress, ConfigError> {
        let invalid = |e: p2ps_core::TopicError| ConfigError::ValidationError(e.to_string());
        let topics = TopicAddress::new(&self.endpoint.product_key, &self.endpoint.device_id).map_err(invalid)?;
        if self.endpoint.namespace.is_empty() {
            Ok(topics)
        } else {
            topics.with_namespace(&self.endpoint.namespace).map_err(invalid)
        }
    }

    fn keepalive_settings(&self) -> KeepaliveSettings {
        KeepaliveSettings {
            default_interval: Duration::from_millis(self.keepalive.interval_ms),
            max_ticks: self.keepalive.max_ticks,
        }
    }

    /// Settings for the app and device endpoints.
    pub fn endpoint_settings(&self) -> Result<(EndpointSettings, EndpointSettings), ConfigError> {
        let topics = self.topics()?;

        let mut app = EndpointSettings::app(topics.clone(), self.endpoint.app_id.clone());
        app.keepalive = self.keepalive_settings();
        app.flow = FlowSettings {
            after_offer: Duration::from_millis(self.flow.after_offer_ms),
            after_candidate: Duration::from_millis(self.flow.after_candidate_ms),
            ready_timeout: Duration::from_secs(self.flow.ready_timeout_seconds),
        };

        let mut device = EndpointSettings::device(topics);
        device.keepalive = self.keepalive_settings();
        Ok((app, device))
    }

    /// HTTP session service, if one is configured.
    pub fn session_api(&self) -> Result<Option<Arc<dyn SessionApi>>, ConfigError> {
        if self.api.base_url.is_empty() {
            return Ok(None);
        }
        let api = HttpSessionApi::new(&self.api.base_url, Duration::from_secs(self.api.timeout_seconds))
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?
            .with_credentials(ApiCredentials {
                bearer: self.api.bearer.clone(),
                token: self.api.token.clone(),
                source: self.api.source.clone(),
            });
        Ok(Some(Arc::new(api)))
    }

    /// Generate a sample configuration file content
    pub fn sample_toml() -> &'static str {
        r#"# p2ps-sim configuration

[endpoint]
product_key = "PLAF204"
device_id = "AF070135F064641AG"
app_id = "188815492"
# Leading topic segment, e.g. "dl"
namespace = ""

[api]
# Session service base URL (empty = in-process service)
base_url = ""
# bearer = ""
# token = ""
# source = "app"
timeout_seconds = 10

[flow]
after_offer_ms = 1000
after_candidate_ms = 2000
ready_timeout_seconds = 30

[keepalive]
# Used when the session configuration carries no interval
interval_ms = 10000
max_ticks = 10

[output]
# Output format: "table", "json", "quiet"
format = "table"
verbose = false

[logging]
# Log level: "error", "warn", "info", "debug", "trace"
level = "warn"
"#
    }
}

/// CLI configuration overrides
///
/// Command-line arguments take precedence over config file values.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub output_format: Option<String>,
    pub verbose: Option<bool>,
    pub debug: Option<bool>,
    pub api_url: Option<String>,
    pub device_id: Option<String>,
    pub app_id: Option<String>,
}

impl Config {
    /// Apply CLI overrides to configuration
    pub fn with_overrides(mut self, overrides: &CliOverrides) -> Self {
        if let Some(ref format) = overrides.output_format {
            self.output.format = format.clone();
        }
        if let Some(verbose) = overrides.verbose {
            self.output.verbose = verbose;
            if verbose && self.logging.level == "warn" {
                self.logging.level = "info".to_string();
            }
        }
        if overrides.debug == Some(true) {
            self.logging.level = "debug".to_string();
        }
        if let Some(ref url) = overrides.api_url {
            self.api.base_url = url.clone();
        }
        if let Some(ref device_id) = overrides.device_id {
            self.endpoint.device_id = device_id.clone();
        }
        if let Some(ref app_id) = overrides.app_id {
            self.endpoint.app_id = app_id.clone();
        }
        self
    }
}
