//! Configuration management for vasbridge

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use vasbridge_core::{Error, FilterParser, Result, RiskFactor, ThreatLevel};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Which halves of the bridge run
    #[serde(default)]
    pub bridge: BridgeConfig,

    /// OMP scanner connection
    #[serde(default)]
    pub scanner: ScannerConfig,

    /// IF-MAP sink
    #[serde(default)]
    pub ifmap: IfmapConfig,

    /// AMQP event sink and control queue
    #[serde(default)]
    pub amqp: AmqpConfig,

    /// Per-vulnerability pre-filter applied by the fetcher
    #[serde(default)]
    pub filter: FilterConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("Failed to read config file {:?}: {}", path, e))
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| Error::Configuration(format!("Failed to parse config: {}", e)))
    }

    /// Create a configuration builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Merge with environment variables (VASBRIDGE_ prefix)
    pub fn merge_env(mut self) -> Self {
        // Scanner settings
        if let Ok(val) = std::env::var("VASBRIDGE_SCANNER_HOST") {
            self.scanner.host = val;
        }
        if let Ok(val) = std::env::var("VASBRIDGE_SCANNER_PORT") {
            if let Ok(n) = val.parse() {
                self.scanner.port = n;
            }
        }
        if let Ok(val) = std::env::var("VASBRIDGE_SCANNER_USERNAME") {
            self.scanner.username = val;
        }
        if let Ok(val) = std::env::var("VASBRIDGE_SCANNER_PASSWORD") {
            self.scanner.password = val;
        }

        // IF-MAP settings
        if let Ok(val) = std::env::var("VASBRIDGE_IFMAP_URL") {
            self.ifmap.url = val;
        }
        if let Ok(val) = std::env::var("VASBRIDGE_IFMAP_USERNAME") {
            self.ifmap.username = val;
        }
        if let Ok(val) = std::env::var("VASBRIDGE_IFMAP_PASSWORD") {
            self.ifmap.password = val;
        }
        if let Ok(val) = std::env::var("VASBRIDGE_IFMAP_CONVERTER") {
            self.ifmap.converter = val;
        }

        // AMQP settings
        if let Ok(val) = std::env::var("VASBRIDGE_AMQP_URI") {
            self.amqp.uri = val;
        }

        // Logging
        if let Ok(val) = std::env::var("VASBRIDGE_LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = std::env::var("VASBRIDGE_LOG_FORMAT") {
            self.logging.format = val;
        }

        self
    }

    /// Reject settings no worker could run with
    pub fn validate(&self) -> Result<()> {
        if self.scanner.poll_interval_seconds == 0 {
            return Err(Error::InvalidConfig {
                key: "scanner.poll_interval_seconds".into(),
                message: "must be greater than zero".into(),
            });
        }

        if self.ifmap.enable {
            if self.ifmap.keepalive_seconds == 0 {
                return Err(Error::InvalidConfig {
                    key: "ifmap.keepalive_seconds".into(),
                    message: "must be greater than zero".into(),
                });
            }
            FilterParser::parse(&self.ifmap.filter_update).map_err(|e| Error::InvalidConfig {
                key: "ifmap.filter_update".into(),
                message: e.to_string(),
            })?;
            FilterParser::parse(&self.ifmap.filter_notify).map_err(|e| Error::InvalidConfig {
                key: "ifmap.filter_notify".into(),
                message: e.to_string(),
            })?;
            if self.ifmap.auth_method == AuthMethod::Cert && self.ifmap.identity_path.is_none() {
                return Err(Error::MissingConfig {
                    key: "ifmap.identity_path".into(),
                });
            }
        }

        if self.bridge.subscriber_enable && self.amqp.name_prefix.is_empty() {
            return Err(Error::MissingConfig {
                key: "amqp.name_prefix".into(),
            });
        }

        if let Some(pattern) = &self.filter.name_pattern {
            Regex::new(pattern).map_err(|e| Error::InvalidConfig {
                key: "filter.name_pattern".into(),
                message: e.to_string(),
            })?;
        }

        Ok(())
    }

    /// True when neither the publishing nor the subscribing side would run
    pub fn nothing_to_do(&self) -> bool {
        let publishes = self.bridge.publisher_enable
            && (self.ifmap.enable || self.amqp.publisher_enable);
        !publishes && !self.bridge.subscriber_enable
    }
}

/// Top-level switches
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Poll the scanner and publish results
    #[serde(default = "default_true")]
    pub publisher_enable: bool,

    /// Accept scan/delete-task requests from the broker
    #[serde(default)]
    pub subscriber_enable: bool,

    /// Bridge name, used as publisher id when no MAP session exists
    #[serde(default = "default_bridge_name")]
    pub name: String,
}

fn default_true() -> bool {
    true
}

fn default_bridge_name() -> String {
    String::from("vasbridge")
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            publisher_enable: true,
            subscriber_enable: false,
            name: default_bridge_name(),
        }
    }
}

/// OMP scanner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    #[serde(default = "default_scanner_host")]
    pub host: String,

    #[serde(default = "default_scanner_port")]
    pub port: u16,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    /// Seconds between two poll cycles
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,

    #[serde(default = "default_scanner_timeout")]
    pub request_timeout_seconds: u64,

    /// Scanners usually run with a self-signed certificate
    #[serde(default = "default_true")]
    pub accept_invalid_certs: bool,

    /// Scanner version announced by self-publish
    #[serde(default)]
    pub version: String,
}

fn default_scanner_host() -> String {
    String::from("127.0.0.1")
}

fn default_scanner_port() -> u16 {
    9390
}

fn default_poll_interval() -> u64 {
    30
}

fn default_scanner_timeout() -> u64 {
    60
}

impl ScannerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            host: default_scanner_host(),
            port: default_scanner_port(),
            username: String::new(),
            password: String::new(),
            poll_interval_seconds: default_poll_interval(),
            request_timeout_seconds: default_scanner_timeout(),
            accept_invalid_certs: true,
            version: String::new(),
        }
    }
}

/// How the bridge authenticates against the MAP server
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    #[default]
    Basic,
    Cert,
}

/// IF-MAP configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IfmapConfig {
    #[serde(default = "default_true")]
    pub enable: bool,

    #[serde(default = "default_ifmap_url")]
    pub url: String,

    #[serde(default)]
    pub auth_method: AuthMethod,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    /// PKCS#12 client identity for `cert` authentication
    pub identity_path: Option<String>,

    pub identity_password: Option<String>,

    /// Additional PEM root certificate for the MAP server
    pub ca_cert_path: Option<String>,

    #[serde(default)]
    pub accept_invalid_certs: bool,

    /// Seconds between two session renewals; must stay below the server's
    /// session timeout
    #[serde(default = "default_keepalive")]
    pub keepalive_seconds: u64,

    #[serde(default = "default_ifmap_timeout")]
    pub request_timeout_seconds: u64,

    /// Converter registry name
    #[serde(default = "default_converter")]
    pub converter: String,

    /// Risk levels published as updates (filtered converter only)
    #[serde(default = "default_filter_update")]
    pub filter_update: String,

    /// Risk levels additionally sent as notifications (filtered converter only)
    #[serde(default)]
    pub filter_notify: String,

    /// Remove everything previously published under our publisher id at startup
    #[serde(default = "default_true")]
    pub purge_on_start: bool,

    #[serde(default)]
    pub self_publish: SelfPublishConfig,
}

fn default_ifmap_url() -> String {
    String::from("https://localhost:8443")
}

fn default_keepalive() -> u64 {
    120
}

fn default_ifmap_timeout() -> u64 {
    120
}

fn default_converter() -> String {
    String::from("full")
}

fn default_filter_update() -> String {
    String::from("ALL")
}

impl IfmapConfig {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

impl Default for IfmapConfig {
    fn default() -> Self {
        Self {
            enable: true,
            url: default_ifmap_url(),
            auth_method: AuthMethod::Basic,
            username: String::new(),
            password: String::new(),
            identity_path: None,
            identity_password: None,
            ca_cert_path: None,
            accept_invalid_certs: false,
            keepalive_seconds: default_keepalive(),
            request_timeout_seconds: default_ifmap_timeout(),
            converter: default_converter(),
            filter_update: default_filter_update(),
            filter_notify: String::new(),
            purge_on_start: true,
            self_publish: SelfPublishConfig::default(),
        }
    }
}

/// Announce the scanner itself in the MAP graph
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SelfPublishConfig {
    #[serde(default)]
    pub enable: bool,

    /// Device name; defaults to the local host name
    pub device: Option<String>,

    /// MAC address of the scanner host
    pub mac: Option<String>,
}

/// AMQP configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AmqpConfig {
    #[serde(default = "default_amqp_uri")]
    pub uri: String,

    /// Emit one event per changed vulnerability
    #[serde(default)]
    pub publisher_enable: bool,

    #[serde(default = "default_exchange")]
    pub exchange: String,

    /// Queue carrying scan and delete-task requests
    #[serde(default = "default_queue")]
    pub queue: String,

    #[serde(default = "default_true")]
    pub durable: bool,

    #[serde(default)]
    pub allow_delete_event: bool,

    /// Prefix of target and task names created on request
    #[serde(default = "default_bridge_name")]
    pub name_prefix: String,

    /// Scan configuration used when a request names an unknown one
    #[serde(default = "default_scan_config")]
    pub default_config: String,
}

fn default_amqp_uri() -> String {
    String::from("amqp://127.0.0.1:5672/%2f")
}

fn default_exchange() -> String {
    String::from("vasbridge")
}

fn default_queue() -> String {
    String::from("vasbridge-scan")
}

fn default_scan_config() -> String {
    String::from("Full and fast")
}

impl Default for AmqpConfig {
    fn default() -> Self {
        Self {
            uri: default_amqp_uri(),
            publisher_enable: false,
            exchange: default_exchange(),
            queue: default_queue(),
            durable: true,
            allow_delete_event: false,
            name_prefix: default_bridge_name(),
            default_config: default_scan_config(),
        }
    }
}

/// Vulnerability pre-filter rules; all configured rules must pass
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterConfig {
    pub min_threat: Option<ThreatLevel>,

    pub min_risk_factor: Option<RiskFactor>,

    /// Regex the NVT name must match
    pub name_pattern: Option<String>,

    #[serde(default)]
    pub exclude_hosts: Vec<String>,

    /// External filter program and its arguments
    #[serde(default)]
    pub command: Vec<String>,
}

impl FilterConfig {
    pub fn is_empty(&self) -> bool {
        self.min_threat.is_none()
            && self.min_risk_factor.is_none()
            && self.name_pattern.is_none()
            && self.exclude_hosts.is_empty()
            && self.command.is_empty()
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log span open and close events
    #[serde(default)]
    pub spans: bool,

    /// Add source file and line to each record
    #[serde(default)]
    pub file: bool,

    /// Add the worker thread name to each record
    #[serde(default)]
    pub thread_names: bool,
}

fn default_log_level() -> String {
    String::from("info")
}

fn default_log_format() -> String {
    String::from("pretty")
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            spans: false,
            file: false,
            thread_names: false,
        }
    }
}

/// Builder for constructing Config
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn scanner(mut self, host: impl Into<String>, port: u16) -> Self {
        self.config.scanner.host = host.into();
        self.config.scanner.port = port;
        self
    }

    pub fn scanner_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.config.scanner.username = username.into();
        self.config.scanner.password = password.into();
        self
    }

    pub fn poll_interval_seconds(mut self, seconds: u64) -> Self {
        self.config.scanner.poll_interval_seconds = seconds;
        self
    }

    pub fn ifmap_url(mut self, url: impl Into<String>) -> Self {
        self.config.ifmap.url = url.into();
        self
    }

    pub fn ifmap_enable(mut self, enable: bool) -> Self {
        self.config.ifmap.enable = enable;
        self
    }

    pub fn converter(mut self, name: impl Into<String>) -> Self {
        self.config.ifmap.converter = name.into();
        self
    }

    pub fn filters(mut self, update: impl Into<String>, notify: impl Into<String>) -> Self {
        self.config.ifmap.filter_update = update.into();
        self.config.ifmap.filter_notify = notify.into();
        self
    }

    pub fn amqp_uri(mut self, uri: impl Into<String>) -> Self {
        self.config.amqp.uri = uri.into();
        self
    }

    pub fn amqp_publisher_enable(mut self, enable: bool) -> Self {
        self.config.amqp.publisher_enable = enable;
        self
    }

    pub fn publisher_enable(mut self, enable: bool) -> Self {
        self.config.bridge.publisher_enable = enable;
        self
    }

    pub fn subscriber_enable(mut self, enable: bool) -> Self {
        self.config.bridge.subscriber_enable = enable;
        self
    }

    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
