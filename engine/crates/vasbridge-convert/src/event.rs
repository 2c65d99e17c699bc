//! One standard `meta:event` per vulnerability, attached to the host's IP

use async_trait::async_trait;
use std::collections::HashSet;
use vasbridge_core::{Result, Significance, Vulnerability};
use vasbridge_transport::ifmap::{
    xpath_literal, Cardinality, Identifier, Metadata, PublishDelete, PublishElement, PublishUpdate,
    META_NS, META_PREFIX,
};

use crate::converter::{ordered, Converter, ConverterContext};

const DISCOVERED_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%z";

/// CVSS base score (0.0 - 10.0) as event magnitude (0 - 100), halves rounded up
pub fn magnitude(cvss_base: f32) -> u32 {
    (cvss_base * 10.0 + 0.5).floor().clamp(0.0, 100.0) as u32
}

/// The `meta:event` describing `v`
pub fn event_metadata(v: &Vulnerability, ctx: &ConverterContext) -> Metadata {
    Metadata::standard("event", Cardinality::MultiValue)
        .child("name", v.nvt.name.as_str())
        .child("discovered-time", v.timestamp.format(DISCOVERED_TIME_FORMAT).to_string())
        .child("discoverer-id", ctx.scanner_id.as_str())
        .child("magnitude", magnitude(v.nvt.cvss_base).to_string())
        .child("confidence", "0")
        .child("significance", Significance::from(v.nvt.risk_factor).as_str())
        .child("type", "cve")
        .child("other-type-definition", v.id.as_str())
        .child("information", v.description.as_str())
        .child("vulnerability-uri", v.nvt.cve.as_str())
}

pub fn event_update(v: &Vulnerability, ctx: &ConverterContext) -> PublishUpdate {
    PublishUpdate::new(Identifier::ip(v.host.as_str())).metadata(event_metadata(v, ctx))
}

/// Removes our own event for `v` and nothing published by others
pub fn event_delete(v: &Vulnerability, ctx: &ConverterContext) -> PublishDelete {
    let filter = format!(
        "meta:event[@ifmap-publisher-id={} and other-type-definition={}]",
        xpath_literal(&ctx.publisher_id),
        xpath_literal(&v.id)
    );
    PublishDelete::new(Identifier::ip(v.host.as_str()))
        .namespace(META_PREFIX, META_NS)
        .filter(filter)
}

/// Publishes every vulnerability as an event
pub struct FullConverter {
    context: ConverterContext,
}

impl FullConverter {
    pub fn new(context: ConverterContext) -> Self {
        Self { context }
    }
}

#[async_trait]
impl Converter for FullConverter {
    fn name(&self) -> &'static str {
        "full"
    }

    fn context(&self) -> &ConverterContext {
        &self.context
    }

    async fn to_updates(&mut self, vulnerabilities: &HashSet<Vulnerability>) -> Result<Vec<PublishElement>> {
        Ok(ordered(vulnerabilities)
            .into_iter()
            .map(|v| PublishElement::Update(event_update(v, &self.context)))
            .collect())
    }

    async fn to_deletes(&mut self, vulnerabilities: &HashSet<Vulnerability>) -> Result<Vec<PublishElement>> {
        Ok(ordered(vulnerabilities)
            .into_iter()
            .map(|v| PublishElement::Delete(event_delete(v, &self.context)))
            .collect())
    }
}
