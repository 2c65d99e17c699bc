//! Scanner-side entities returned by the scan source

use serde::{Deserialize, Serialize};

/// A scan task on the scanner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub id: String,
    pub name: String,
    /// Scanner status text, e.g. `Done`, `Running`
    pub status: Option<String>,
    /// Latest report of the task; `None` until the task produced one
    pub last_report_id: Option<String>,
}

impl TaskInfo {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            status: None,
            last_report_id: None,
        }
    }

    pub fn with_last_report(mut self, report_id: impl Into<String>) -> Self {
        self.last_report_id = Some(report_id.into());
        self
    }
}

/// A scan target on the scanner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetInfo {
    pub id: String,
    pub name: String,
}

/// A scan configuration on the scanner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanConfigInfo {
    pub id: String,
    pub name: String,
}

/// Outcome of a scanner command that returns no entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandStatus {
    pub status: u16,
    pub text: String,
}

impl CommandStatus {
    pub fn new(status: u16, text: impl Into<String>) -> Self {
        Self {
            status,
            text: text.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

impl std::fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.status, self.text)
    }
}
