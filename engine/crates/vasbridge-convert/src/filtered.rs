//! Event converter gated per risk level

use async_trait::async_trait;
use std::collections::HashSet;
use vasbridge_core::{Result, RiskFilter, Vulnerability};
use vasbridge_transport::ifmap::PublishElement;

use crate::converter::{ordered, Converter, ConverterContext, ConverterSettings};
use crate::event::{event_delete, event_update};

/// Publishes events only for risk levels passing the update filter, and
/// additionally sends notifications for risk levels passing the notify filter.
///
/// Notifications are not stored by the MAP server, so deletes only cover
/// the update side.
pub struct FilteredConverter {
    context: ConverterContext,
    update: RiskFilter,
    notify: RiskFilter,
}

impl FilteredConverter {
    pub fn new(context: ConverterContext, settings: &ConverterSettings) -> Self {
        Self {
            context,
            update: settings.filter_update,
            notify: settings.filter_notify,
        }
    }
}

#[async_trait]
impl Converter for FilteredConverter {
    fn name(&self) -> &'static str {
        "filtered"
    }

    fn context(&self) -> &ConverterContext {
        &self.context
    }

    async fn to_updates(&mut self, vulnerabilities: &HashSet<Vulnerability>) -> Result<Vec<PublishElement>> {
        let mut elements = Vec::new();
        for v in ordered(vulnerabilities) {
            let level = v.nvt.risk_factor;
            if self.update.allows(level) {
                elements.push(PublishElement::Update(event_update(v, &self.context)));
            }
            if self.notify.allows(level) {
                elements.push(PublishElement::Notify(event_update(v, &self.context)));
            }
        }
        Ok(elements)
    }

    async fn to_deletes(&mut self, vulnerabilities: &HashSet<Vulnerability>) -> Result<Vec<PublishElement>> {
        Ok(ordered(vulnerabilities)
            .into_iter()
            .filter(|v| self.update.allows(v.nvt.risk_factor))
            .map(|v| PublishElement::Delete(event_delete(v, &self.context)))
            .collect())
    }
}
