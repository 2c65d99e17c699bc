//! The converter contract and what converters get to work with

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use vasbridge_core::{Result, RiskFilter, Vulnerability};
use vasbridge_transport::ifmap::{Identifier, PublishElement};
use vasbridge_transport::MapChannel;

/// Finds the device identifier linked to an IP address identifier
#[async_trait]
pub trait DeviceResolver: Send + Sync {
    async fn resolve_device(&self, ip: &Identifier) -> Result<Option<Identifier>>;
}

#[async_trait]
impl<M: MapChannel> DeviceResolver for M {
    async fn resolve_device(&self, ip: &Identifier) -> Result<Option<Identifier>> {
        self.search_device(ip).await
    }
}

/// Provenance and lookups available to a converter
#[derive(Clone)]
pub struct ConverterContext {
    /// Publisher id of our MAP session; scopes every delete filter
    pub publisher_id: String,
    /// Stamped as `discoverer-id`, e.g. `openvas@10.0.0.2`
    pub scanner_id: String,
    resolver: Option<Arc<dyn DeviceResolver>>,
}

impl ConverterContext {
    pub fn new(publisher_id: impl Into<String>, scanner_id: impl Into<String>) -> Self {
        Self {
            publisher_id: publisher_id.into(),
            scanner_id: scanner_id.into(),
            resolver: None,
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn DeviceResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Scanner id for a scanner reachable at `host`
    pub fn scanner_id_for(host: &str) -> String {
        format!("openvas@{}", host)
    }

    /// Look up the device of `ip`; `None` without a resolver
    pub async fn resolve_device(&self, ip: &Identifier) -> Result<Option<Identifier>> {
        match &self.resolver {
            Some(resolver) => resolver.resolve_device(ip).await,
            None => Ok(None),
        }
    }
}

impl std::fmt::Debug for ConverterContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConverterContext")
            .field("publisher_id", &self.publisher_id)
            .field("scanner_id", &self.scanner_id)
            .field("resolver", &self.resolver.is_some())
            .finish()
    }
}

/// Converter options from the configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConverterSettings {
    /// Risk levels published as stored metadata
    pub filter_update: RiskFilter,
    /// Risk levels additionally sent as notifications
    pub filter_notify: RiskFilter,
}

impl Default for ConverterSettings {
    fn default() -> Self {
        Self {
            filter_update: RiskFilter::all(),
            filter_notify: RiskFilter::none(),
        }
    }
}

/// Maps vulnerabilities onto publish elements
///
/// Converters may track what they published, hence `&mut self`. Each sink
/// owns its converter, so no synchronization is needed.
#[async_trait]
pub trait Converter: Send {
    /// Registry name of this converter
    fn name(&self) -> &'static str;

    fn context(&self) -> &ConverterContext;

    /// Elements that publish `vulnerabilities`
    async fn to_updates(&mut self, vulnerabilities: &HashSet<Vulnerability>) -> Result<Vec<PublishElement>>;

    /// Elements that retract everything `to_updates` published for `vulnerabilities`
    async fn to_deletes(&mut self, vulnerabilities: &HashSet<Vulnerability>) -> Result<Vec<PublishElement>>;

    /// Called once the server accepted the request built from `published`
    /// and `retracted`. Converters that track published state update it
    /// here, never while building elements.
    fn commit(&mut self, _published: &HashSet<Vulnerability>, _retracted: &HashSet<Vulnerability>) {}
}

/// Vulnerabilities in a stable order so requests are reproducible
pub(crate) fn ordered(vulnerabilities: &HashSet<Vulnerability>) -> Vec<&Vulnerability> {
    let mut list: Vec<&Vulnerability> = vulnerabilities.iter().collect();
    list.sort_by(|a, b| {
        (&a.host, &a.id, &a.nvt.oid, &a.port).cmp(&(&b.host, &b.id, &b.nvt.oid, &b.port))
    });
    list
}
