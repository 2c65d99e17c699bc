//! Risk factors, threat levels and downstream significance

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Risk factor of an NVT as reported by the scanner
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RiskFactor {
    /// The scanner did not classify the NVT
    #[default]
    Unknown,
    /// No risk
    None,
    /// Low risk
    Low,
    /// Medium risk
    Medium,
    /// High risk
    High,
    /// Critical risk
    Critical,
}

impl RiskFactor {
    /// All risk factors, in ascending order
    pub const ALL: [RiskFactor; 6] = [
        RiskFactor::Unknown,
        RiskFactor::None,
        RiskFactor::Low,
        RiskFactor::Medium,
        RiskFactor::High,
        RiskFactor::Critical,
    ];

    /// Position in [`RiskFactor::ALL`]
    pub fn index(&self) -> usize {
        match self {
            RiskFactor::Unknown => 0,
            RiskFactor::None => 1,
            RiskFactor::Low => 2,
            RiskFactor::Medium => 3,
            RiskFactor::High => 4,
            RiskFactor::Critical => 5,
        }
    }

    /// Get display string
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskFactor::Unknown => "Unknown",
            RiskFactor::None => "None",
            RiskFactor::Low => "Low",
            RiskFactor::Medium => "Medium",
            RiskFactor::High => "High",
            RiskFactor::Critical => "Critical",
        }
    }

    /// Parse a scanner-supplied value, mapping anything unrecognized to `Unknown`
    pub fn from_scanner(value: &str) -> Self {
        value.trim().parse().unwrap_or(RiskFactor::Unknown)
    }
}

impl FromStr for RiskFactor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RiskFactor::ALL
            .iter()
            .copied()
            .find(|level| level.as_str() == s)
            .ok_or_else(|| s.to_string())
    }
}

impl std::fmt::Display for RiskFactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Threat level of a single scan result
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ThreatLevel {
    Debug,
    #[default]
    Log,
    Low,
    Medium,
    High,
}

impl ThreatLevel {
    pub const ALL: [ThreatLevel; 5] = [
        ThreatLevel::Debug,
        ThreatLevel::Log,
        ThreatLevel::Low,
        ThreatLevel::Medium,
        ThreatLevel::High,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatLevel::Debug => "Debug",
            ThreatLevel::Log => "Log",
            ThreatLevel::Low => "Low",
            ThreatLevel::Medium => "Medium",
            ThreatLevel::High => "High",
        }
    }

    /// Parse a scanner-supplied value, mapping anything unrecognized to `Log`
    pub fn from_scanner(value: &str) -> Self {
        value.trim().parse().unwrap_or(ThreatLevel::Log)
    }
}

impl FromStr for ThreatLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ThreatLevel::ALL
            .iter()
            .copied()
            .find(|level| level.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| s.to_string())
    }
}

impl std::fmt::Display for ThreatLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Three-level significance used by IF-MAP event metadata
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Significance {
    Critical,
    Important,
    #[default]
    Informational,
}

impl Significance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Significance::Critical => "critical",
            Significance::Important => "important",
            Significance::Informational => "informational",
        }
    }
}

impl From<RiskFactor> for Significance {
    fn from(risk: RiskFactor) -> Self {
        match risk {
            RiskFactor::Critical | RiskFactor::High => Significance::Critical,
            RiskFactor::Medium | RiskFactor::Low => Significance::Important,
            RiskFactor::None | RiskFactor::Unknown => Significance::Informational,
        }
    }
}

impl std::fmt::Display for Significance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
