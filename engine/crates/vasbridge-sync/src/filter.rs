//! Pre-filters deciding which scan results reach the sinks
//!
//! A filter answers keep or drop for one vulnerability. Errors are not
//! drops: the fetcher keeps a vulnerability whenever its filter fails.

use async_trait::async_trait;
use regex::Regex;
use std::collections::HashSet;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::warn;
use vasbridge_common::config::FilterConfig;
use vasbridge_core::{Error, Result, RiskFactor, ThreatLevel, Vulnerability};

/// Predicate over a single vulnerability
#[async_trait]
pub trait VulnerabilityFilter: Send + Sync {
    /// `true` to keep `v`
    async fn filter(&self, v: &Vulnerability) -> Result<bool>;

    /// Short label used in log lines
    fn name(&self) -> &str {
        "filter"
    }
}

/// Native rule table; every configured rule must pass
#[derive(Debug, Clone, Default)]
pub struct RuleFilter {
    min_threat: Option<ThreatLevel>,
    min_risk_factor: Option<RiskFactor>,
    name_pattern: Option<Regex>,
    exclude_hosts: HashSet<String>,
}

impl RuleFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &FilterConfig) -> Result<Self> {
        let mut rules = Self::new();
        rules.min_threat = config.min_threat;
        rules.min_risk_factor = config.min_risk_factor;
        if let Some(pattern) = &config.name_pattern {
            rules = rules.name_pattern(pattern)?;
        }
        rules.exclude_hosts = config.exclude_hosts.iter().cloned().collect();
        Ok(rules)
    }

    pub fn min_threat(mut self, threat: ThreatLevel) -> Self {
        self.min_threat = Some(threat);
        self
    }

    pub fn min_risk_factor(mut self, risk: RiskFactor) -> Self {
        self.min_risk_factor = Some(risk);
        self
    }

    pub fn name_pattern(mut self, pattern: &str) -> Result<Self> {
        let regex = Regex::new(pattern).map_err(|e| Error::InvalidConfig {
            key: "filter.name_pattern".into(),
            message: e.to_string(),
        })?;
        self.name_pattern = Some(regex);
        Ok(self)
    }

    pub fn exclude_host(mut self, host: impl Into<String>) -> Self {
        self.exclude_hosts.insert(host.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.min_threat.is_none()
            && self.min_risk_factor.is_none()
            && self.name_pattern.is_none()
            && self.exclude_hosts.is_empty()
    }

    pub fn matches(&self, v: &Vulnerability) -> bool {
        if self.min_threat.map_or(false, |min| v.threat < min) {
            return false;
        }
        if self.min_risk_factor.map_or(false, |min| v.nvt.risk_factor < min) {
            return false;
        }
        if let Some(pattern) = &self.name_pattern {
            if !pattern.is_match(&v.nvt.name) {
                return false;
            }
        }
        !self.exclude_hosts.contains(&v.host)
    }
}

#[async_trait]
impl VulnerabilityFilter for RuleFilter {
    async fn filter(&self, v: &Vulnerability) -> Result<bool> {
        Ok(self.matches(v))
    }

    fn name(&self) -> &str {
        "rules"
    }
}

/// External program deciding per vulnerability
///
/// The vulnerability is written as JSON to the program's stdin. Exit
/// status 0 keeps it, any other status drops it.
#[derive(Debug, Clone)]
pub struct CommandFilter {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandFilter {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            timeout: Duration::from_secs(10),
        }
    }

    /// From `[program, args...]`; `None` for an empty command line
    pub fn from_command_line(command: &[String]) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self::new(program.clone(), args.to_vec()))
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl VulnerabilityFilter for CommandFilter {
    async fn filter(&self, v: &Vulnerability) -> Result<bool> {
        let payload = serde_json::to_vec(v)?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&payload).await?;
        }

        let status = tokio::time::timeout(self.timeout, child.wait())
            .await
            .map_err(|_| Error::Other(format!("filter command {} timed out", self.program)))??;
        Ok(status.success())
    }

    fn name(&self) -> &str {
        &self.program
    }
}

/// Keeps a vulnerability only if every inner filter keeps it
pub struct AllOf {
    filters: Vec<Arc<dyn VulnerabilityFilter>>,
}

impl AllOf {
    pub fn new(filters: Vec<Arc<dyn VulnerabilityFilter>>) -> Self {
        Self { filters }
    }
}

#[async_trait]
impl VulnerabilityFilter for AllOf {
    async fn filter(&self, v: &Vulnerability) -> Result<bool> {
        for filter in &self.filters {
            match filter.filter(v).await {
                Ok(true) => {}
                Ok(false) => return Ok(false),
                Err(e) => {
                    warn!("Filter {} failed for {} on {}: {}", filter.name(), v.id, v.host, e);
                    return Err(e);
                }
            }
        }
        Ok(true)
    }

    fn name(&self) -> &str {
        "all-of"
    }
}

/// Filter described by the `[filter]` section, `None` when it is empty
pub fn from_config(config: &FilterConfig) -> Result<Option<Arc<dyn VulnerabilityFilter>>> {
    let mut filters: Vec<Arc<dyn VulnerabilityFilter>> = Vec::new();

    let rules = RuleFilter::from_config(config)?;
    if !rules.is_empty() {
        filters.push(Arc::new(rules));
    }
    if let Some(command) = CommandFilter::from_command_line(&config.command) {
        filters.push(Arc::new(command));
    }

    Ok(match filters.len() {
        0 => None,
        1 => filters.pop(),
        _ => Some(Arc::new(AllOf::new(filters))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use vasbridge_core::Nvt;

    /// Counts calls, optionally failing each one
    #[derive(Default)]
    struct Counting {
        fail: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl VulnerabilityFilter for Counting {
        async fn filter(&self, _v: &Vulnerability) -> Result<bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(Error::Other("rule engine unavailable".into()))
            } else {
                Ok(true)
            }
        }

        fn name(&self) -> &str {
            "counting"
        }
    }

    fn vulnerability(name: &str, host: &str, threat: ThreatLevel) -> Vulnerability {
        Vulnerability::builder("r-1", host)
            .threat(threat)
            .nvt(Nvt::builder("1.3.6.1.4.1.25623.1.0.1").name(name).risk_factor(RiskFactor::Medium).build())
            .build()
    }

    #[tokio::test]
    async fn test_rule_filter() {
        // threat at least Low and the name mentions Firefox
        let rules = RuleFilter::new()
            .min_threat(ThreatLevel::Low)
            .name_pattern("Firefox")
            .unwrap();

        let keep = vulnerability("Mozilla Firefox Multiple Vulnerabilities", "10.0.0.1", ThreatLevel::High);
        assert!(rules.filter(&keep).await.unwrap());

        let quiet = vulnerability("Mozilla Firefox Version Detection", "10.0.0.1", ThreatLevel::Log);
        assert!(!rules.filter(&quiet).await.unwrap());

        let other = vulnerability("OpenSSH Detection", "10.0.0.1", ThreatLevel::High);
        assert!(!rules.filter(&other).await.unwrap());
    }

    #[test]
    fn test_rule_filter_risk_and_hosts() {
        let rules = RuleFilter::new()
            .min_risk_factor(RiskFactor::High)
            .exclude_host("10.0.0.9");
        assert!(!rules.matches(&vulnerability("x", "10.0.0.1", ThreatLevel::High)));

        let rules = RuleFilter::new().exclude_host("10.0.0.9");
        assert!(rules.matches(&vulnerability("x", "10.0.0.1", ThreatLevel::High)));
        assert!(!rules.matches(&vulnerability("x", "10.0.0.9", ThreatLevel::High)));
    }

    #[test]
    fn test_invalid_pattern() {
        let err = RuleFilter::new().name_pattern("(unclosed").unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_from_config() {
        assert!(from_config(&FilterConfig::default()).unwrap().is_none());

        let config = FilterConfig {
            min_threat: Some(ThreatLevel::Low),
            command: vec!["true".into()],
            ..FilterConfig::default()
        };
        assert!(from_config(&config).unwrap().is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_filter_exit_status() {
        let v = vulnerability("Mozilla Firefox", "10.0.0.1", ThreatLevel::High);

        let keep = CommandFilter::new("sh", vec!["-c".into(), "cat >/dev/null; exit 0".into()]);
        assert!(keep.filter(&v).await.unwrap());

        let drop = CommandFilter::new("sh", vec!["-c".into(), "cat >/dev/null; exit 1".into()]);
        assert!(!drop.filter(&v).await.unwrap());

        let grep = CommandFilter::new("sh", vec!["-c".into(), "grep -q Firefox".into()]);
        assert!(grep.filter(&v).await.unwrap());
    }

    #[tokio::test]
    async fn test_command_filter_spawn_error() {
        let missing = CommandFilter::new("/nonexistent/vasbridge-filter", Vec::new());
        let v = vulnerability("x", "10.0.0.1", ThreatLevel::High);
        assert!(missing.filter(&v).await.is_err());
    }

    #[tokio::test]
    async fn test_all_of() {
        let v = vulnerability("x", "10.0.0.1", ThreatLevel::Medium);
        let both = AllOf::new(vec![
            Arc::new(RuleFilter::new().min_threat(ThreatLevel::Low)),
            Arc::new(RuleFilter::new().exclude_host("10.0.0.1")),
        ]);
        assert!(!both.filter(&v).await.unwrap());

        let none = AllOf::new(Vec::new());
        assert!(none.filter(&v).await.unwrap());
    }

    #[tokio::test]
    async fn test_all_of_stops_at_failing_component() {
        let v = vulnerability("x", "10.0.0.1", ThreatLevel::Medium);
        let broken = Arc::new(Counting {
            fail: true,
            ..Counting::default()
        });
        let after = Arc::new(Counting::default());
        let filters: Vec<Arc<dyn VulnerabilityFilter>> = vec![
            Arc::new(RuleFilter::new()),
            broken.clone(),
            after.clone(),
        ];
        let all = AllOf::new(filters);

        assert!(all.filter(&v).await.is_err());
        assert_eq!(broken.calls.load(Ordering::SeqCst), 1);
        assert_eq!(after.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_filter_names() {
        assert_eq!(RuleFilter::new().name(), "rules");
        assert_eq!(CommandFilter::new("/usr/local/bin/triage", Vec::new()).name(), "/usr/local/bin/triage");
        assert_eq!(AllOf::new(Vec::new()).name(), "all-of");
    }
}
