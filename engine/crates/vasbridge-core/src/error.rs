//! Error types for vasbridge

use thiserror::Error;

/// Result type alias using the vasbridge Error
pub type Result<T> = std::result::Result<T, Error>;

/// vasbridge error types
#[derive(Error, Debug)]
pub enum Error {
    // === Scan Source Errors ===
    #[error("Scan source unavailable: {0}")]
    ScanSourceUnavailable(String),

    #[error("Scan source rejected {command} ({status}): {message}")]
    ScanSourceRejected {
        command: String,
        status: u16,
        message: String,
    },

    #[error("Scan source authentication failed: {0}")]
    ScanSourceAuthentication(String),

    // === MAP Errors ===
    #[error("MAP session error: {0}")]
    MapSession(String),

    #[error("MAP request rejected ({code}): {message}")]
    MapRejected { code: String, message: String },

    #[error("No MAP session established")]
    MapNoSession,

    // === Broker Errors ===
    #[error("Broker channel error: {0}")]
    BrokerChannel(String),

    #[error("Broker channel closed")]
    BrokerClosed,

    // === Conversion Errors ===
    #[error("Conversion failed: {0}")]
    Conversion(String),

    #[error("Unrecognized risk level in filter: {token:?}")]
    FilterParse { token: String },

    #[error("Encoding failed: {0}")]
    Encoding(String),

    // === Configuration Errors ===
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Missing required configuration: {key}")]
    MissingConfig { key: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidConfig { key: String, message: String },

    #[error("Unknown converter: {name}")]
    UnknownConverter { name: String },

    #[error("Default scan configuration not found on scanner: {name}")]
    DefaultScanConfigMissing { name: String },

    // === IO Errors ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // === Serialization Errors ===
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("XML error: {0}")]
    Xml(String),

    #[error("Parse error: {0}")]
    Parse(String),

    // === Lifecycle Errors ===
    #[error("Worker {worker} failed: {message}")]
    WorkerFailed { worker: String, message: String },

    #[error("Cancelled")]
    Cancelled,

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Errors after which the owning worker must stop and its session or
    /// channel cannot be reused.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            Error::MapSession(_)
                | Error::MapNoSession
                | Error::BrokerChannel(_)
                | Error::BrokerClosed
                | Error::Cancelled
        )
    }

    /// Errors that only affect the current cycle. The caller logs, skips the
    /// cycle and leaves its cache untouched so the next poll re-derives the
    /// same delta.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::ScanSourceUnavailable(_)
                | Error::ScanSourceRejected { .. }
                | Error::MapRejected { .. }
                | Error::Conversion(_)
                | Error::Encoding(_)
                | Error::Xml(_)
                | Error::Parse(_)
                | Error::Json(_)
        )
    }

    /// Errors that must abort startup
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Error::Configuration(_)
                | Error::MissingConfig { .. }
                | Error::InvalidConfig { .. }
                | Error::UnknownConverter { .. }
                | Error::DefaultScanConfigMissing { .. }
                | Error::FilterParse { .. }
        )
    }

    /// Get error code for logging
    pub fn code(&self) -> &'static str {
        match self {
            Error::ScanSourceUnavailable(_) => "SCAN_SOURCE_UNAVAILABLE",
            Error::ScanSourceRejected { .. } => "SCAN_SOURCE_REJECTED",
            Error::ScanSourceAuthentication(_) => "SCAN_SOURCE_AUTH",
            Error::MapSession(_) => "MAP_SESSION",
            Error::MapRejected { .. } => "MAP_REJECTED",
            Error::MapNoSession => "MAP_NO_SESSION",
            Error::BrokerChannel(_) => "BROKER_CHANNEL",
            Error::BrokerClosed => "BROKER_CLOSED",
            Error::Conversion(_) => "CONVERSION",
            Error::FilterParse { .. } => "FILTER_PARSE",
            Error::Encoding(_) => "ENCODING",
            Error::Configuration(_) => "CONFIG_ERROR",
            Error::MissingConfig { .. } => "MISSING_CONFIG",
            Error::InvalidConfig { .. } => "INVALID_CONFIG",
            Error::UnknownConverter { .. } => "UNKNOWN_CONVERTER",
            Error::DefaultScanConfigMissing { .. } => "DEFAULT_SCAN_CONFIG_MISSING",
            Error::Io(_) => "IO_ERROR",
            Error::Json(_) => "JSON_ERROR",
            Error::Xml(_) => "XML_ERROR",
            Error::Parse(_) => "PARSE_ERROR",
            Error::WorkerFailed { .. } => "WORKER_FAILED",
            Error::Cancelled => "CANCELLED",
            Error::Internal(_) => "INTERNAL",
            Error::Other(_) => "OTHER",
        }
    }
}
