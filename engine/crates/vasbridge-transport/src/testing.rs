//! In-memory collaborators for tests
//!
//! `MemoryMap` keeps published metadata in a small graph store and applies
//! delete filters of the form `prefix:name[@ifmap-publisher-id='p' and child='v']`,
//! which is enough to check that deletes retract what updates created.

use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use vasbridge_core::{Error, Report, Result};

use crate::ifmap::{Identifier, Lifetime, Metadata, PublishElement, PublishRequest};
use crate::traits::{BrokerChannel, Delivery, DeliveryStream, MapChannel, ScanSource};
use crate::types::{CommandStatus, ScanConfigInfo, TargetInfo, TaskInfo};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Kind of failure to inject into the next call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// Only the current call fails
    Transient,
    /// The session or channel is gone
    Fatal,
}

// ── Scan source ──────────────────────────────────────────────────────────────

#[derive(Default)]
struct ScanState {
    tasks: Vec<TaskInfo>,
    reports: HashMap<String, Report>,
    failing_reports: HashSet<String>,
    unavailable: bool,
    targets: Vec<TargetInfo>,
    configs: Vec<ScanConfigInfo>,
    calls: Vec<String>,
    next_id: usize,
}

/// Scanner with tasks and reports set up by the test
pub struct MemoryScanSource {
    host: String,
    state: Mutex<ScanState>,
}

impl MemoryScanSource {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            state: Mutex::new(ScanState::default()),
        }
    }

    /// Add a task whose latest report is `report`
    pub fn with_report(self, task_name: &str, report: Report) -> Self {
        self.set_report(task_name, report);
        self
    }

    pub fn with_config(self, id: &str, name: &str) -> Self {
        lock(&self.state).configs.push(ScanConfigInfo {
            id: id.into(),
            name: name.into(),
        });
        self
    }

    pub fn with_target(self, id: &str, name: &str) -> Self {
        lock(&self.state).targets.push(TargetInfo {
            id: id.into(),
            name: name.into(),
        });
        self
    }

    /// Replace the latest report of a task, creating the task if needed
    pub fn set_report(&self, task_name: &str, report: Report) {
        let mut state = lock(&self.state);
        let task_id = report.task_id.clone();
        state.tasks.retain(|t| t.id != task_id);
        state
            .tasks
            .push(TaskInfo::new(task_id.clone(), task_name).with_last_report(format!("report-{}", task_id)));
        state.reports.insert(task_id, report);
    }

    pub fn add_task(&self, task: TaskInfo) {
        lock(&self.state).tasks.push(task);
    }

    /// Make report retrieval for one task fail
    pub fn fail_report(&self, task_id: &str) {
        lock(&self.state).failing_reports.insert(task_id.to_string());
    }

    /// Make every call fail as if the scanner were down
    pub fn set_unavailable(&self, unavailable: bool) {
        lock(&self.state).unavailable = unavailable;
    }

    /// Mutating calls in order, e.g. `delete_task:t-1`
    pub fn calls(&self) -> Vec<String> {
        lock(&self.state).calls.clone()
    }

    pub fn tasks(&self) -> Vec<TaskInfo> {
        lock(&self.state).tasks.clone()
    }

    pub fn targets(&self) -> Vec<TargetInfo> {
        lock(&self.state).targets.clone()
    }

    fn check_available(state: &ScanState) -> Result<()> {
        if state.unavailable {
            Err(Error::ScanSourceUnavailable("connection refused".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ScanSource for MemoryScanSource {
    fn host(&self) -> &str {
        &self.host
    }

    async fn list_tasks(&self) -> Result<Vec<TaskInfo>> {
        let state = lock(&self.state);
        Self::check_available(&state)?;
        Ok(state.tasks.clone())
    }

    async fn latest_report(&self, task: &TaskInfo) -> Result<Option<Report>> {
        let state = lock(&self.state);
        Self::check_available(&state)?;
        if state.failing_reports.contains(&task.id) {
            return Err(Error::ScanSourceRejected {
                command: "get_reports".into(),
                status: 404,
                message: format!("Failed to find report of task {}", task.id),
            });
        }
        if task.last_report_id.is_none() {
            return Ok(None);
        }
        Ok(state.reports.get(&task.id).cloned())
    }

    async fn list_targets(&self) -> Result<Vec<TargetInfo>> {
        let state = lock(&self.state);
        Self::check_available(&state)?;
        Ok(state.targets.clone())
    }

    async fn list_configs(&self) -> Result<Vec<ScanConfigInfo>> {
        let state = lock(&self.state);
        Self::check_available(&state)?;
        Ok(state.configs.clone())
    }

    async fn create_target(&self, name: &str, hosts: &str) -> Result<String> {
        let mut state = lock(&self.state);
        Self::check_available(&state)?;
        state.next_id += 1;
        let id = format!("target-{}", state.next_id);
        state.targets.push(TargetInfo {
            id: id.clone(),
            name: name.into(),
        });
        state.calls.push(format!("create_target:{}:{}", name, hosts));
        Ok(id)
    }

    async fn create_task(&self, name: &str, config_id: &str, target_id: &str) -> Result<String> {
        let mut state = lock(&self.state);
        Self::check_available(&state)?;
        state.next_id += 1;
        let id = format!("task-{}", state.next_id);
        state.tasks.push(TaskInfo::new(id.clone(), name));
        state
            .calls
            .push(format!("create_task:{}:{}:{}", name, config_id, target_id));
        Ok(id)
    }

    async fn start_task(&self, task_id: &str) -> Result<CommandStatus> {
        let mut state = lock(&self.state);
        Self::check_available(&state)?;
        state.calls.push(format!("start_task:{}", task_id));
        Ok(CommandStatus::new(202, "OK, request submitted"))
    }

    async fn delete_task(&self, task_id: &str) -> Result<CommandStatus> {
        let mut state = lock(&self.state);
        Self::check_available(&state)?;
        state.calls.push(format!("delete_task:{}", task_id));
        Ok(CommandStatus::new(200, "OK"))
    }
}

// ── MAP ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
struct Stored {
    publisher: String,
    lifetime: Lifetime,
    metadata: Metadata,
}

/// Links are undirected in IF-MAP
fn graph_key(identifier1: &Identifier, identifier2: Option<&Identifier>) -> (String, Option<String>) {
    let a = format!("{:?}", identifier1);
    match identifier2.map(|i| format!("{:?}", i)) {
        Some(b) if b < a => (b, Some(a)),
        other => (a, other),
    }
}

/// Does `metadata` published by `publisher` match `filter`?
fn filter_matches(filter: &str, publisher: &str, metadata: &Metadata) -> bool {
    let (qname, predicates) = match filter.split_once('[') {
        Some((qname, rest)) => (qname.trim(), rest.trim_end().trim_end_matches(']')),
        None => (filter.trim(), ""),
    };
    if qname != metadata.qualified_name() {
        return false;
    }
    predicates
        .split(" and ")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .all(|predicate| {
            let Some((key, value)) = predicate.split_once('=') else {
                return false;
            };
            let value = value.trim();
            let value = value
                .strip_prefix('\'')
                .and_then(|v| v.strip_suffix('\''))
                .or_else(|| value.strip_prefix('"').and_then(|v| v.strip_suffix('"')))
                .unwrap_or(value);
            match key.trim() {
                "@ifmap-publisher-id" => publisher == value,
                child => metadata.child_value(child) == Some(value),
            }
        })
}

#[derive(Default)]
struct MapState {
    session_open: bool,
    ended: bool,
    purged: usize,
    renewals: usize,
    requests: Vec<PublishRequest>,
    notifications: Vec<Metadata>,
    graph: HashMap<(String, Option<String>), Vec<Stored>>,
    devices: HashMap<String, String>,
    publish_failures: VecDeque<Failure>,
    renew_failures: VecDeque<Failure>,
}

/// MAP server holding metadata in memory
pub struct MemoryMap {
    publisher_id: String,
    state: Mutex<MapState>,
}

impl MemoryMap {
    pub fn new(publisher_id: impl Into<String>) -> Self {
        Self {
            publisher_id: publisher_id.into(),
            state: Mutex::new(MapState::default()),
        }
    }

    /// Start with a session already open
    pub fn with_session(publisher_id: impl Into<String>) -> Self {
        let map = Self::new(publisher_id);
        lock(&map.state).session_open = true;
        map
    }

    /// Resolve `ip` to `device` in searches
    pub fn with_device(self, ip: &str, device: &str) -> Self {
        lock(&self.state).devices.insert(ip.into(), device.into());
        self
    }

    pub fn fail_next_publish(&self, failure: Failure) {
        lock(&self.state).publish_failures.push_back(failure);
    }

    pub fn fail_next_renew(&self, failure: Failure) {
        lock(&self.state).renew_failures.push_back(failure);
    }

    /// Successful publish requests in order
    pub fn requests(&self) -> Vec<PublishRequest> {
        lock(&self.state).requests.clone()
    }

    /// Metadata forwarded by notify elements
    pub fn notifications(&self) -> Vec<Metadata> {
        lock(&self.state).notifications.clone()
    }

    /// Metadata currently stored on an identifier or link
    pub fn stored(&self, identifier1: &Identifier, identifier2: Option<&Identifier>) -> Vec<Metadata> {
        lock(&self.state)
            .graph
            .get(&graph_key(identifier1, identifier2))
            .map(|entries| entries.iter().map(|s| s.metadata.clone()).collect())
            .unwrap_or_default()
    }

    /// Number of metadata elements stored anywhere
    pub fn stored_count(&self) -> usize {
        lock(&self.state).graph.values().map(Vec::len).sum()
    }

    pub fn renewals(&self) -> usize {
        lock(&self.state).renewals
    }

    pub fn purges(&self) -> usize {
        lock(&self.state).purged
    }

    pub fn session_ended(&self) -> bool {
        lock(&self.state).ended
    }

    fn require_session(state: &MapState) -> Result<()> {
        if state.session_open {
            Ok(())
        } else {
            Err(Error::MapNoSession)
        }
    }

    fn failure(failure: Failure, operation: &str) -> Error {
        match failure {
            Failure::Transient => Error::MapRejected {
                code: "InvalidMetadata".into(),
                message: format!("{} rejected", operation),
            },
            Failure::Fatal => Error::MapSession(format!("{}: connection reset", operation)),
        }
    }

    fn apply(&self, state: &mut MapState, request: &PublishRequest) {
        for element in &request.elements {
            match element {
                PublishElement::Update(update) => {
                    let entries = state
                        .graph
                        .entry(graph_key(&update.identifier1, update.identifier2.as_ref()))
                        .or_default();
                    for metadata in &update.metadata {
                        let stored = Stored {
                            publisher: self.publisher_id.clone(),
                            lifetime: update.lifetime,
                            metadata: metadata.clone(),
                        };
                        // singleValue metadata replaces the previous element of the same name
                        if metadata.cardinality == crate::ifmap::Cardinality::SingleValue {
                            entries.retain(|s| s.metadata.qualified_name() != metadata.qualified_name());
                        }
                        if !entries.contains(&stored) {
                            entries.push(stored);
                        }
                    }
                }
                PublishElement::Notify(update) => {
                    state.notifications.extend(update.metadata.iter().cloned());
                }
                PublishElement::Delete(delete) => {
                    let key = graph_key(&delete.identifier1, delete.identifier2.as_ref());
                    if let Some(entries) = state.graph.get_mut(&key) {
                        match &delete.filter {
                            Some(filter) => entries
                                .retain(|s| !filter_matches(filter, &s.publisher, &s.metadata)),
                            None => entries.clear(),
                        }
                    }
                }
            }
        }
        state.graph.retain(|_, entries| !entries.is_empty());
    }
}

#[async_trait]
impl MapChannel for MemoryMap {
    async fn new_session(&self) -> Result<()> {
        let mut state = lock(&self.state);
        state.session_open = true;
        state.ended = false;
        Ok(())
    }

    async fn renew_session(&self) -> Result<()> {
        let mut state = lock(&self.state);
        Self::require_session(&state)?;
        if let Some(failure) = state.renew_failures.pop_front() {
            return Err(Self::failure(failure, "renewSession"));
        }
        state.renewals += 1;
        Ok(())
    }

    async fn end_session(&self) -> Result<()> {
        let mut state = lock(&self.state);
        Self::require_session(&state)?;
        state.session_open = false;
        state.ended = true;
        for entries in state.graph.values_mut() {
            entries.retain(|s| s.lifetime != Lifetime::Session);
        }
        state.graph.retain(|_, entries| !entries.is_empty());
        Ok(())
    }

    async fn purge_publisher(&self) -> Result<()> {
        let mut state = lock(&self.state);
        Self::require_session(&state)?;
        let publisher = self.publisher_id.clone();
        for entries in state.graph.values_mut() {
            entries.retain(|s| s.publisher != publisher);
        }
        state.graph.retain(|_, entries| !entries.is_empty());
        state.purged += 1;
        Ok(())
    }

    async fn publish(&self, request: &PublishRequest) -> Result<()> {
        let mut state = lock(&self.state);
        Self::require_session(&state)?;
        if let Some(failure) = state.publish_failures.pop_front() {
            return Err(Self::failure(failure, "publish"));
        }
        self.apply(&mut state, request);
        state.requests.push(request.clone());
        Ok(())
    }

    async fn search_device(&self, ip: &Identifier) -> Result<Option<Identifier>> {
        let state = lock(&self.state);
        Self::require_session(&state)?;
        let device = match ip {
            Identifier::IpAddress { value, .. } => state.devices.get(value).cloned(),
            _ => None,
        };
        Ok(device.map(Identifier::device))
    }

    fn publisher_id(&self) -> Option<String> {
        if lock(&self.state).session_open {
            Some(self.publisher_id.clone())
        } else {
            None
        }
    }
}

// ── Broker ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub content_type: String,
    pub payload: Vec<u8>,
}

#[derive(Default)]
struct BrokerState {
    exchanges: Vec<String>,
    queues: Vec<(String, bool)>,
    published: Vec<PublishedMessage>,
    acks: Vec<u64>,
    closed: bool,
    next_tag: u64,
    publish_failures: VecDeque<(usize, Failure)>,
}

/// Broker that records publishes and feeds deliveries pushed by the test
pub struct MemoryBroker {
    state: Mutex<BrokerState>,
    inbound_tx: Mutex<Option<mpsc::UnboundedSender<Delivery>>>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Delivery>>>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            state: Mutex::new(BrokerState::default()),
            inbound_tx: Mutex::new(Some(tx)),
            inbound_rx: Mutex::new(Some(rx)),
        }
    }

    /// Queue an inbound message, returning its delivery tag
    pub fn push_delivery(&self, content_type: Option<&str>, body: &[u8]) -> u64 {
        let tag = {
            let mut state = lock(&self.state);
            state.next_tag += 1;
            state.next_tag
        };
        if let Some(tx) = lock(&self.inbound_tx).as_ref() {
            let _ = tx.send(Delivery {
                delivery_tag: tag,
                content_type: content_type.map(str::to_string),
                body: body.to_vec(),
            });
        }
        tag
    }

    /// End the delivery stream once queued messages are consumed
    pub fn finish_deliveries(&self) {
        lock(&self.inbound_tx).take();
    }

    /// Fail the publish that follows `after` further successful ones
    pub fn fail_publish(&self, after: usize, failure: Failure) {
        lock(&self.state).publish_failures.push_back((after, failure));
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        lock(&self.state).published.clone()
    }

    pub fn acks(&self) -> Vec<u64> {
        lock(&self.state).acks.clone()
    }

    pub fn exchanges(&self) -> Vec<String> {
        lock(&self.state).exchanges.clone()
    }

    pub fn queues(&self) -> Vec<(String, bool)> {
        lock(&self.state).queues.clone()
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }
}

#[async_trait]
impl BrokerChannel for MemoryBroker {
    async fn declare_exchange(&self, exchange: &str) -> Result<()> {
        lock(&self.state).exchanges.push(exchange.into());
        Ok(())
    }

    async fn publish(&self, exchange: &str, content_type: &str, payload: &[u8]) -> Result<()> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(Error::BrokerClosed);
        }
        let due = match state.publish_failures.front_mut() {
            Some((0, failure)) => Some(*failure),
            Some((after, _)) => {
                *after -= 1;
                None
            }
            None => None,
        };
        if let Some(failure) = due {
            state.publish_failures.pop_front();
            return Err(match failure {
                Failure::Transient => Error::Encoding("payload rejected".into()),
                Failure::Fatal => Error::BrokerChannel("connection reset".into()),
            });
        }
        state.published.push(PublishedMessage {
            exchange: exchange.into(),
            content_type: content_type.into(),
            payload: payload.to_vec(),
        });
        Ok(())
    }

    async fn consume(&self, queue: &str, durable: bool) -> Result<DeliveryStream> {
        lock(&self.state).queues.push((queue.into(), durable));
        let rx = lock(&self.inbound_rx)
            .take()
            .ok_or_else(|| Error::BrokerChannel("queue already consumed".into()))?;
        Ok(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (Ok(delivery), rx))
        })
        .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        lock(&self.state).acks.push(delivery_tag);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        lock(&self.state).closed = true;
        Ok(())
    }
}
