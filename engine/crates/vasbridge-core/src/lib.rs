//! vasbridge Core - Foundation types and error handling
//!
//! This crate provides the core abstractions shared by every vasbridge crate:
//! - `Nvt`, `Vulnerability`: value objects describing one scanner result
//! - `Report`: the snapshot of a scan task's results for one poll cycle
//! - `RiskFactor`, `ThreatLevel`, `Significance`: severity enums
//! - `FilterParser`, `RiskFilter`: declarative per-risk-level inclusion policy

pub mod error;
pub mod risk_filter;
pub mod severity;
pub mod vulnerability;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use risk_filter::{FilterParser, RiskFilter};
pub use severity::{RiskFactor, Significance, ThreatLevel};
pub use vulnerability::{Nvt, NvtBuilder, Report, Vulnerability, VulnerabilityBuilder};
