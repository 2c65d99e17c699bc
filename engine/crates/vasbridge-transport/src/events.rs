//! JSON payloads exchanged with the broker

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vasbridge_core::{Error, Result, RiskFactor, ThreatLevel, Vulnerability};

/// Content type of every message the bridge sends or accepts
pub const CONTENT_TYPE: &str = "application/json";

/// One changed vulnerability, published to the broker exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VulnerabilityEvent {
    pub id: String,
    /// When the scanner produced the result
    pub scanner_timestamp: DateTime<Utc>,
    /// When the bridge emitted this event
    pub bridge_timestamp: DateTime<Utc>,
    pub subnet: String,
    pub host: String,
    pub port: String,
    pub threat: ThreatLevel,
    pub description: String,
    pub oid: String,
    pub name: String,
    pub cvss_base: f32,
    pub risk_factor: RiskFactor,
    pub cve: String,
    pub bid: String,
    pub ifmap_publisher_id: String,
    /// `true` for a newly found vulnerability, `false` when it disappeared
    pub new_event: bool,
}

impl VulnerabilityEvent {
    pub fn new(
        vulnerability: &Vulnerability,
        publisher_id: impl Into<String>,
        new_event: bool,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: vulnerability.id.clone(),
            scanner_timestamp: vulnerability.timestamp,
            bridge_timestamp: now,
            subnet: vulnerability.subnet.clone(),
            host: vulnerability.host.clone(),
            port: vulnerability.port.clone(),
            threat: vulnerability.threat,
            description: vulnerability.description.clone(),
            oid: vulnerability.nvt.oid.clone(),
            name: vulnerability.nvt.name.clone(),
            cvss_base: vulnerability.nvt.cvss_base,
            risk_factor: vulnerability.nvt.risk_factor,
            cve: vulnerability.nvt.cve.clone(),
            bid: vulnerability.nvt.bid.clone(),
            ifmap_publisher_id: publisher_id.into(),
            new_event,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Encoding(e.to_string()))
    }
}

/// Identifies a scan requested over the broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInformation {
    /// Empty when the requester leaves naming to the bridge
    #[serde(default)]
    pub name_prefix: String,
    pub ip: String,
    /// Request time in milliseconds, part of the task name
    pub timestamp: i64,
}

impl TaskInformation {
    /// Copy carrying `prefix` when the request named none
    pub fn or_prefix(&self, prefix: &str) -> Self {
        let mut info = self.clone();
        if info.name_prefix.is_empty() {
            info.name_prefix = prefix.to_string();
        }
        info
    }

    /// Target name, shared by every scan of the same address
    pub fn target_name(&self) -> String {
        format!("{}-{}", self.name_prefix, self.ip)
    }

    /// Task name, unique per request
    pub fn task_name(&self) -> String {
        format!("{}-{}-{}", self.name_prefix, self.ip, self.timestamp)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanRequest {
    pub info: TaskInformation,
    /// Scan configuration name; unknown names fall back to the default
    pub config_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteTaskRequest {
    pub task_infos: Vec<TaskInformation>,
}

/// Inbound control message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ControlEvent {
    Scan(ScanRequest),
    DeleteTasks(DeleteTaskRequest),
}

/// Why an inbound message was not turned into a [`ControlEvent`]
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("unsupported content type {0:?}")]
    WrongContentType(Option<String>),

    #[error("malformed control event: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Media type without parameters such as `charset`
fn media_type(content_type: &str) -> &str {
    content_type.split(';').next().unwrap_or_default().trim()
}

impl ControlEvent {
    pub fn decode(content_type: Option<&str>, body: &[u8]) -> std::result::Result<Self, DecodeError> {
        match content_type {
            Some(ct) if media_type(ct).eq_ignore_ascii_case(CONTENT_TYPE) => Ok(serde_json::from_slice(body)?),
            other => Err(DecodeError::WrongContentType(other.map(str::to_string))),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Encoding(e.to_string()))
    }
}
