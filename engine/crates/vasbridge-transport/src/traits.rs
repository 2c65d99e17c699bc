//! Capabilities the bridge needs from the scanner, the MAP server and the broker
//!
//! The sync engine only sees these traits. Wire clients in this crate
//! implement them; tests use the in-memory versions in `testing`.

use async_trait::async_trait;
use futures::stream::BoxStream;
use vasbridge_core::{Report, Result};

use crate::ifmap::{Identifier, PublishRequest};
use crate::types::{CommandStatus, ScanConfigInfo, TargetInfo, TaskInfo};

/// Scanner management operations (OMP)
#[async_trait]
pub trait ScanSource: Send + Sync {
    /// Host name or address of the scanner
    fn host(&self) -> &str;

    /// All tasks known to the scanner
    async fn list_tasks(&self) -> Result<Vec<TaskInfo>>;

    /// Latest report of a task, `None` if the task has not produced one yet
    async fn latest_report(&self, task: &TaskInfo) -> Result<Option<Report>>;

    /// Latest reports of several tasks. Each task gets its own result so a
    /// failure for one task does not hide the others.
    async fn get_reports(&self, tasks: &[TaskInfo]) -> Vec<(String, Result<Option<Report>>)> {
        let mut results = Vec::with_capacity(tasks.len());
        for task in tasks {
            results.push((task.id.clone(), self.latest_report(task).await));
        }
        results
    }

    async fn list_targets(&self) -> Result<Vec<TargetInfo>>;

    async fn list_configs(&self) -> Result<Vec<ScanConfigInfo>>;

    /// Create a target, returning its id
    async fn create_target(&self, name: &str, hosts: &str) -> Result<String>;

    /// Create a task, returning its id
    async fn create_task(&self, name: &str, config_id: &str, target_id: &str) -> Result<String>;

    async fn start_task(&self, task_id: &str) -> Result<CommandStatus>;

    /// Delete a task. The scanner moves a task to its trash on the first
    /// call and removes it for good on the second.
    async fn delete_task(&self, task_id: &str) -> Result<CommandStatus>;
}

/// IF-MAP session operations
#[async_trait]
pub trait MapChannel: Send + Sync {
    async fn new_session(&self) -> Result<()>;

    async fn renew_session(&self) -> Result<()>;

    async fn end_session(&self) -> Result<()>;

    /// Remove everything previously published under our publisher id
    async fn purge_publisher(&self) -> Result<()>;

    /// Send one publish request; the server applies it atomically
    async fn publish(&self, request: &PublishRequest) -> Result<()>;

    /// Find the device linked to an IP address identifier
    async fn search_device(&self, ip: &Identifier) -> Result<Option<Identifier>>;

    /// Publisher id assigned by the server; `None` before `new_session`
    fn publisher_id(&self) -> Option<String>;
}

/// A message received from the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

/// Stream of deliveries from one queue
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// Message broker operations (AMQP)
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Make sure the exchange exists before publishing to it
    async fn declare_exchange(&self, exchange: &str) -> Result<()>;

    async fn publish(&self, exchange: &str, content_type: &str, payload: &[u8]) -> Result<()>;

    /// Declare `queue` and start consuming it with manual acknowledgement
    async fn consume(&self, queue: &str, durable: bool) -> Result<DeliveryStream>;

    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    async fn close(&self) -> Result<()>;
}
