//! Scanner results: NVTs, vulnerabilities and per-task reports

use crate::severity::{RiskFactor, ThreatLevel};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::hash::{Hash, Hasher};

/// Network vulnerability test that produced a result
///
/// Equality and hashing cover every field. The CVSS score is compared by its
/// bit pattern so that `Nvt` can be used as a set member.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Nvt {
    pub oid: String,
    pub name: String,
    pub cvss_base: f32,
    pub risk_factor: RiskFactor,
    pub cve: String,
    pub bid: String,
}

impl Nvt {
    /// Create a new NVT builder
    pub fn builder(oid: impl Into<String>) -> NvtBuilder {
        NvtBuilder::new(oid)
    }
}

impl PartialEq for Nvt {
    fn eq(&self, other: &Self) -> bool {
        self.oid == other.oid
            && self.name == other.name
            && self.cvss_base.to_bits() == other.cvss_base.to_bits()
            && self.risk_factor == other.risk_factor
            && self.cve == other.cve
            && self.bid == other.bid
    }
}

impl Eq for Nvt {}

impl Hash for Nvt {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.oid.hash(state);
        self.name.hash(state);
        self.cvss_base.to_bits().hash(state);
        self.risk_factor.hash(state);
        self.cve.hash(state);
        self.bid.hash(state);
    }
}

/// Builder for constructing NVTs
pub struct NvtBuilder {
    nvt: Nvt,
}

impl NvtBuilder {
    pub fn new(oid: impl Into<String>) -> Self {
        Self {
            nvt: Nvt {
                oid: oid.into(),
                name: String::new(),
                cvss_base: 0.0,
                risk_factor: RiskFactor::Unknown,
                cve: String::from("NOCVE"),
                bid: String::from("NOBID"),
            },
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.nvt.name = name.into();
        self
    }

    pub fn cvss_base(mut self, score: f32) -> Self {
        self.nvt.cvss_base = score;
        self
    }

    pub fn risk_factor(mut self, risk: RiskFactor) -> Self {
        self.nvt.risk_factor = risk;
        self
    }

    pub fn cve(mut self, cve: impl Into<String>) -> Self {
        self.nvt.cve = cve.into();
        self
    }

    pub fn bid(mut self, bid: impl Into<String>) -> Self {
        self.nvt.bid = bid.into();
        self
    }

    pub fn build(self) -> Nvt {
        self.nvt
    }
}

/// One scanner result on one host/port
///
/// There is no surrogate key: two vulnerabilities with identical fields are
/// the same cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Vulnerability {
    /// Scanner result id
    pub id: String,
    /// Time the scanner produced the result
    pub timestamp: DateTime<Utc>,
    pub subnet: String,
    pub host: String,
    /// Port description as reported, e.g. `http (80/tcp)`
    pub port: String,
    pub threat: ThreatLevel,
    pub description: String,
    pub nvt: Nvt,
}

impl Vulnerability {
    /// Create a new vulnerability builder
    pub fn builder(id: impl Into<String>, host: impl Into<String>) -> VulnerabilityBuilder {
        VulnerabilityBuilder::new(id, host)
    }
}

/// Builder for constructing vulnerabilities
pub struct VulnerabilityBuilder {
    vulnerability: Vulnerability,
}

impl VulnerabilityBuilder {
    pub fn new(id: impl Into<String>, host: impl Into<String>) -> Self {
        let host = host.into();
        Self {
            vulnerability: Vulnerability {
                id: id.into(),
                timestamp: DateTime::<Utc>::UNIX_EPOCH,
                subnet: host.clone(),
                host,
                port: String::new(),
                threat: ThreatLevel::Log,
                description: String::new(),
                nvt: Nvt::builder("").build(),
            },
        }
    }

    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.vulnerability.timestamp = timestamp;
        self
    }

    pub fn subnet(mut self, subnet: impl Into<String>) -> Self {
        self.vulnerability.subnet = subnet.into();
        self
    }

    pub fn port(mut self, port: impl Into<String>) -> Self {
        self.vulnerability.port = port.into();
        self
    }

    pub fn threat(mut self, threat: ThreatLevel) -> Self {
        self.vulnerability.threat = threat;
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.vulnerability.description = description.into();
        self
    }

    pub fn nvt(mut self, nvt: Nvt) -> Self {
        self.vulnerability.nvt = nvt;
        self
    }

    pub fn build(self) -> Vulnerability {
        self.vulnerability
    }
}

/// Results of one scan task as seen in one poll cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub task_id: String,
    pub vulnerabilities: Vec<Vulnerability>,
}

impl Report {
    pub fn new(task_id: impl Into<String>, vulnerabilities: Vec<Vulnerability>) -> Self {
        Self {
            task_id: task_id.into(),
            vulnerabilities,
        }
    }

    /// The report's vulnerabilities as a set; duplicates collapse
    pub fn vulnerability_set(&self) -> HashSet<Vulnerability> {
        self.vulnerabilities.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.vulnerabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vulnerabilities.is_empty()
    }
}
