//! vasbridge Sync - the synchronization engine
//!
//! This crate turns repeated scanner snapshots into change events:
//! - `VulnerabilityCache`: per-task known state and new/outdated diffs
//! - `Fetcher`: poll loop feeding one queue per sink
//! - `MapHandler`, `EventPublisher`: the IF-MAP and broker sinks
//! - `EventConsumer`: scan and delete-task requests from the broker
//! - `Keepalive`: MAP session renewal
//! - `Lifecycle`: worker registry with cooperative shutdown

pub mod cache;
pub mod consumer;
pub mod fetcher;
pub mod filter;
pub mod handler;
pub mod keepalive;
pub mod lifecycle;
pub mod publisher;
pub mod self_publish;

pub use cache::{Diff, VulnerabilityCache};
pub use consumer::{ConsumerSettings, EventConsumer, Outcome};
pub use fetcher::{Fetcher, ReportReceiver};
pub use filter::{AllOf, CommandFilter, RuleFilter, VulnerabilityFilter};
pub use handler::MapHandler;
pub use keepalive::Keepalive;
pub use lifecycle::{wait_or_cancel, Lifecycle, ShutdownSummary, WorkerExit};
pub use publisher::EventPublisher;
pub use self_publish::{self_publish, ScannerIdentity};
