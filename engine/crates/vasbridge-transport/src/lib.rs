//! vasbridge Transport - clients for the systems the bridge talks to
//!
//! This crate provides:
//! - Capability traits for the scan source, the MAP channel and the broker
//! - An IF-MAP 2.0 request model and SOAP client
//! - An OMP client speaking XML over TLS to the scanner
//! - An AMQP channel and the JSON event payloads exchanged over it
//! - `SharedSession`, which serializes every call on one MAP session

pub mod amqp;
pub mod error;
pub mod events;
pub mod ifmap;
pub mod omp;
pub mod session;
pub mod traits;
pub mod types;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use amqp::AmqpChannel;
pub use error::TransportError;
pub use events::{
    ControlEvent, DecodeError, DeleteTaskRequest, ScanRequest, TaskInformation, VulnerabilityEvent,
};
pub use ifmap::{IfmapClient, IfmapClientConfig};
pub use omp::{OmpClient, OmpClientConfig};
pub use session::SharedSession;
pub use traits::{BrokerChannel, Delivery, DeliveryStream, MapChannel, ScanSource};
pub use types::*;
