//! Wire-level errors and their mapping onto the bridge error taxonomy

use vasbridge_core::Error;

/// Errors raised by the wire clients
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("TLS error: {0}")]
    Tls(#[from] native_tls::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("XML error: {0}")]
    Xml(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("IF-MAP error {code}: {message}")]
    Ifmap { code: String, message: String },

    #[error("No IF-MAP session")]
    NoSession,

    #[error("OMP {command} failed ({status}): {message}")]
    Omp {
        command: String,
        status: u16,
        message: String,
    },

    #[error("OMP authentication failed: {0}")]
    OmpAuthentication(String),

    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    #[error("Not configured: {0}")]
    NotConfigured(String),
}

impl From<quick_xml::Error> for TransportError {
    fn from(e: quick_xml::Error) -> Self {
        TransportError::Xml(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for TransportError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        TransportError::Timeout
    }
}

/// IF-MAP error codes after which the session cannot be used any more
const FATAL_IFMAP_CODES: &[&str] = &["InvalidSessionID", "AccessDenied", "SystemError"];

impl TransportError {
    /// Classify an error raised while talking to the MAP server
    pub fn into_map_error(self) -> Error {
        match self {
            TransportError::Ifmap { code, message } => {
                if FATAL_IFMAP_CODES.contains(&code.as_str()) {
                    Error::MapSession(format!("{}: {}", code, message))
                } else {
                    Error::MapRejected { code, message }
                }
            }
            TransportError::NoSession => Error::MapNoSession,
            TransportError::Xml(message) => Error::Xml(message),
            TransportError::NotConfigured(message) => Error::Configuration(message),
            other => Error::MapSession(other.to_string()),
        }
    }

    /// Classify an error raised while talking to the scanner
    pub fn into_scan_error(self) -> Error {
        match self {
            TransportError::Omp {
                command,
                status,
                message,
            } => Error::ScanSourceRejected {
                command,
                status,
                message,
            },
            TransportError::OmpAuthentication(message) => Error::ScanSourceAuthentication(message),
            TransportError::Xml(message) => Error::Xml(message),
            TransportError::NotConfigured(message) => Error::Configuration(message),
            other => Error::ScanSourceUnavailable(other.to_string()),
        }
    }

    /// Classify an error raised while talking to the broker
    pub fn into_broker_error(self) -> Error {
        match self {
            TransportError::NotConfigured(message) => Error::Configuration(message),
            other => Error::BrokerChannel(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_session_is_fatal() {
        let err = TransportError::Ifmap {
            code: "InvalidSessionID".into(),
            message: "expired".into(),
        }
        .into_map_error();
        assert!(err.is_session_fatal());
    }

    #[test]
    fn test_invalid_metadata_is_transient() {
        let err = TransportError::Ifmap {
            code: "InvalidMetadata".into(),
            message: "unknown element".into(),
        }
        .into_map_error();
        assert!(err.is_transient());
    }

    #[test]
    fn test_io_error_mapping_depends_on_side() {
        let io = || TransportError::Io(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"));
        assert!(io().into_map_error().is_session_fatal());
        assert!(io().into_scan_error().is_transient());
        assert!(io().into_broker_error().is_session_fatal());
    }

    #[test]
    fn test_omp_status_maps_to_rejected() {
        let err = TransportError::Omp {
            command: "create_task".into(),
            status: 400,
            message: "Bogus".into(),
        }
        .into_scan_error();
        assert!(matches!(err, Error::ScanSourceRejected { status: 400, .. }));
    }
}
