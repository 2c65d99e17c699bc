//! OpenVAS Management Protocol
//!
//! OMP is XML over TLS. The client opens a connection per command,
//! authenticates, sends the command and reads one response document.

mod client;
pub mod xml;

pub use client::{OmpClient, OmpClientConfig};
