//! Category tree of scan results below each host's device
//!
//! For every host the tree looks like
//!
//! ```text
//! device --device-category--> vulnerability-scan-result
//!            --subcategory-of--> vulnerability-scan-result.vulnerability:<id>
//!                                  feature (Name, Port, Cvss-base, Threat, Description, CVE)
//! ```
//!
//! Categories are `other` identities whose administrative domain is the
//! device name, so trees of different hosts never share identifiers.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, warn};
use uuid::Uuid;
use vasbridge_core::{Result, Vulnerability};
use vasbridge_transport::ifmap::{
    xpath_literal, Cardinality, Identifier, Metadata, PublishDelete, PublishElement, PublishUpdate,
};

use crate::converter::{ordered, Converter, ConverterContext};

pub const NAMESPACE: &str = "http://www.esukom.de/2012/ifmap-metadata/1";
pub const NAMESPACE_PREFIX: &str = "esukom";
pub const OTHER_TYPE_DEFINITION: &str = "32939:category";
pub const ROOT_CATEGORY_NAME: &str = "vulnerability-scan-result";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

fn category(name: &str, device: &Identifier) -> Identifier {
    Identifier::other_identity(name, device.name().unwrap_or_default(), OTHER_TYPE_DEFINITION)
}

fn vulnerability_category(v: &Vulnerability, device: &Identifier) -> Identifier {
    category(&format!("{}.vulnerability:{}", ROOT_CATEGORY_NAME, v.id), device)
}

fn link_metadata(name: &str) -> Metadata {
    Metadata::new(NAMESPACE_PREFIX, NAMESPACE, name, Cardinality::SingleValue)
}

fn feature(id: &str, kind: &str, value: &str, v: &Vulnerability) -> Metadata {
    Metadata::new(NAMESPACE_PREFIX, NAMESPACE, "feature", Cardinality::MultiValue)
        .attribute("ctxp-timestamp", v.timestamp.format(TIMESTAMP_FORMAT).to_string())
        .child("id", id)
        .child("type", kind)
        .child("value", value)
}

/// Scores keep one decimal even when whole, e.g. `5.0`
fn cvss_text(score: f32) -> String {
    if score.fract() == 0.0 {
        format!("{:.1}", score)
    } else {
        score.to_string()
    }
}

fn features(v: &Vulnerability) -> [Metadata; 6] {
    [
        feature("Name", "qualified", &v.nvt.name, v),
        feature("Port", "qualified", &v.port, v),
        feature("Cvss-base", "quantitive", &cvss_text(v.nvt.cvss_base), v),
        feature("Threat", "quantitive", v.nvt.risk_factor.as_str(), v),
        feature("Description", "arbitrary", &v.description, v),
        feature("CVE", "qualified", &v.nvt.cve, v),
    ]
}

fn scoped_delete(delete: PublishDelete, element: &str, publisher_id: &str) -> PublishElement {
    PublishElement::Delete(
        delete
            .namespace(NAMESPACE_PREFIX, NAMESPACE)
            .filter(format!(
                "{}:{}[@ifmap-publisher-id={}]",
                NAMESPACE_PREFIX,
                element,
                xpath_literal(publisher_id)
            )),
    )
}

fn by_host<'a>(vulnerabilities: &'a HashSet<Vulnerability>) -> BTreeMap<&'a str, Vec<&'a Vulnerability>> {
    let mut hosts: BTreeMap<&str, Vec<&Vulnerability>> = BTreeMap::new();
    for v in ordered(vulnerabilities) {
        hosts.entry(v.host.as_str()).or_default().push(v);
    }
    hosts
}

/// Publishes scan results as a feature tree per host
pub struct FeatureConverter {
    context: ConverterContext,
    /// Device used for each host; kept for the process lifetime
    devices: HashMap<String, Identifier>,
    /// Vulnerability ids with a published sub-category, per host
    published: HashMap<String, HashSet<String>>,
}

impl FeatureConverter {
    pub fn new(context: ConverterContext) -> Self {
        Self {
            context,
            devices: HashMap::new(),
            published: HashMap::new(),
        }
    }

    /// Device of `host`: the one used before, else the one linked to its IP
    /// on the MAP server, else a new one
    async fn device_for(&mut self, host: &str) -> Result<Identifier> {
        if let Some(device) = self.devices.get(host) {
            return Ok(device.clone());
        }

        let device = match self.context.resolve_device(&Identifier::ip(host)).await {
            Ok(Some(device)) => {
                debug!("Found device {} for {}", device, host);
                device
            }
            Ok(None) => {
                debug!("Creating device for {}", host);
                Identifier::device(Uuid::new_v4().to_string())
            }
            Err(e) if e.is_session_fatal() => return Err(e),
            Err(e) => {
                warn!("Device lookup for {} failed, creating one: {}", host, e);
                Identifier::device(Uuid::new_v4().to_string())
            }
        };
        self.devices.insert(host.to_string(), device.clone());
        Ok(device)
    }
}

#[async_trait]
impl Converter for FeatureConverter {
    fn name(&self) -> &'static str {
        "feature"
    }

    fn context(&self) -> &ConverterContext {
        &self.context
    }

    async fn to_updates(&mut self, vulnerabilities: &HashSet<Vulnerability>) -> Result<Vec<PublishElement>> {
        let mut elements = Vec::new();

        for (host, list) in by_host(vulnerabilities) {
            let device = self.device_for(host).await?;
            let root = category(ROOT_CATEGORY_NAME, &device);

            elements.push(PublishElement::Update(
                PublishUpdate::link(device.clone(), root.clone()).metadata(link_metadata("device-category")),
            ));

            for v in &list {
                let vulnerability = vulnerability_category(v, &device);
                elements.push(PublishElement::Update(
                    PublishUpdate::link(root.clone(), vulnerability.clone())
                        .metadata(link_metadata("subcategory-of")),
                ));
                for metadata in features(v) {
                    elements.push(PublishElement::Update(
                        PublishUpdate::new(vulnerability.clone()).metadata(metadata),
                    ));
                }
            }
        }
        Ok(elements)
    }

    async fn to_deletes(&mut self, vulnerabilities: &HashSet<Vulnerability>) -> Result<Vec<PublishElement>> {
        let publisher_id = self.context.publisher_id.clone();
        let mut elements = Vec::new();

        for (host, list) in by_host(vulnerabilities) {
            let Some(device) = self.devices.get(host).cloned() else {
                warn!("No device known for {}, skipping {} deletes", host, list.len());
                continue;
            };
            let root = category(ROOT_CATEGORY_NAME, &device);

            for v in &list {
                let vulnerability = vulnerability_category(v, &device);
                elements.push(scoped_delete(
                    PublishDelete::link(root.clone(), vulnerability.clone()),
                    "subcategory-of",
                    &publisher_id,
                ));
                elements.push(scoped_delete(
                    PublishDelete::new(vulnerability),
                    "feature",
                    &publisher_id,
                ));
            }

            let last = self
                .published
                .get(host)
                .map_or(true, |ids| ids.iter().all(|id| list.iter().any(|v| &v.id == id)));
            if last {
                elements.push(scoped_delete(
                    PublishDelete::link(device, root),
                    "device-category",
                    &publisher_id,
                ));
            }
        }
        Ok(elements)
    }

    fn commit(&mut self, published: &HashSet<Vulnerability>, retracted: &HashSet<Vulnerability>) {
        for v in retracted {
            if let Some(ids) = self.published.get_mut(&v.host) {
                ids.remove(&v.id);
                if ids.is_empty() {
                    self.published.remove(&v.host);
                }
            }
        }
        for v in published {
            self.published.entry(v.host.clone()).or_default().insert(v.id.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;
    use vasbridge_core::{Nvt, RiskFactor};
    use vasbridge_transport::ifmap::PublishRequest;
    use vasbridge_transport::testing::MemoryMap;
    use vasbridge_transport::MapChannel;

    fn vulnerability(id: &str, host: &str, cvss: f32) -> Vulnerability {
        let nvt = Nvt::builder("1.3.6.1.4.1.25623.1.0.10330")
            .name("Services")
            .cvss_base(cvss)
            .risk_factor(RiskFactor::High)
            .cve("CVE-2012-0001")
            .build();
        Vulnerability::builder(id, host)
            .timestamp(Utc.with_ymd_and_hms(2013, 6, 25, 10, 24, 32).unwrap())
            .port("ssh (22/tcp)")
            .description("found")
            .nvt(nvt)
            .build()
    }

    fn set(items: &[Vulnerability]) -> HashSet<Vulnerability> {
        items.iter().cloned().collect()
    }

    fn converter(map: Arc<MemoryMap>) -> FeatureConverter {
        FeatureConverter::new(ConverterContext::new("pub-1", "openvas@scanner").with_resolver(map))
    }

    #[test]
    fn test_cvss_text() {
        assert_eq!(cvss_text(5.0), "5.0");
        assert_eq!(cvss_text(0.0), "0.0");
        assert_eq!(cvss_text(9.3), "9.3");
    }

    #[tokio::test]
    async fn test_tree_structure() {
        let map = Arc::new(MemoryMap::with_session("pub-1").with_device("10.0.0.7", "laptop"));
        let mut converter = converter(map);

        let elements = converter
            .to_updates(&set(&[vulnerability("r-1", "10.0.0.7", 7.5)]))
            .await
            .unwrap();
        // root link, sub-category link, six features
        assert_eq!(elements.len(), 8);

        let device = Identifier::device("laptop");
        let root = Identifier::other_identity(ROOT_CATEGORY_NAME, "laptop", OTHER_TYPE_DEFINITION);
        let category = Identifier::other_identity(
            "vulnerability-scan-result.vulnerability:r-1",
            "laptop",
            OTHER_TYPE_DEFINITION,
        );
        assert_eq!(elements[0].identifier1(), &device);
        assert_eq!(elements[0].identifier2(), Some(&root));
        assert_eq!(elements[1].identifier1(), &root);
        assert_eq!(elements[1].identifier2(), Some(&category));

        let features: Vec<(String, String)> = elements[2..]
            .iter()
            .map(|e| match e {
                PublishElement::Update(u) => {
                    assert_eq!(u.identifier1, category);
                    let m = &u.metadata[0];
                    assert_eq!(m.qualified_name(), "esukom:feature");
                    assert_eq!(
                        m.attributes,
                        vec![("ctxp-timestamp".to_string(), "2013-06-25T10:24:32".to_string())]
                    );
                    (
                        m.child_value("id").unwrap_or_default().to_string(),
                        m.child_value("value").unwrap_or_default().to_string(),
                    )
                }
                other => panic!("unexpected element {:?}", other),
            })
            .collect();
        let expected = [
            ("Name", "Services"),
            ("Port", "ssh (22/tcp)"),
            ("Cvss-base", "7.5"),
            ("Threat", "High"),
            ("Description", "found"),
            ("CVE", "CVE-2012-0001"),
        ];
        assert_eq!(
            features,
            expected
                .iter()
                .map(|(a, b)| (a.to_string(), b.to_string()))
                .collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn test_synthesized_device_is_reused() {
        let map = Arc::new(MemoryMap::with_session("pub-1"));
        let mut converter = converter(map);

        let first = converter
            .to_updates(&set(&[vulnerability("r-1", "10.0.0.9", 1.0)]))
            .await
            .unwrap();
        let second = converter
            .to_updates(&set(&[vulnerability("r-2", "10.0.0.9", 1.0)]))
            .await
            .unwrap();
        assert_eq!(first[0].identifier1(), second[0].identifier1());
        assert!(matches!(first[0].identifier1(), Identifier::Device { .. }));
    }

    #[tokio::test]
    async fn test_unknown_host_deletes_are_skipped() {
        let mut converter = converter(Arc::new(MemoryMap::with_session("pub-1")));
        let deletes = converter
            .to_deletes(&set(&[vulnerability("r-1", "10.0.0.9", 1.0)]))
            .await
            .unwrap();
        assert!(deletes.is_empty());
    }

    #[tokio::test]
    async fn test_deletes_retract_whole_tree() {
        let map = Arc::new(MemoryMap::with_session("pub-1").with_device("10.0.0.7", "laptop"));
        let mut converter = converter(Arc::clone(&map));

        let a = vulnerability("r-1", "10.0.0.7", 7.5);
        let b = vulnerability("r-2", "10.0.0.7", 5.0);
        let c = vulnerability("r-3", "10.0.0.8", 2.1);

        let all = set(&[a.clone(), b.clone(), c.clone()]);
        let updates = converter.to_updates(&all).await.unwrap();
        map.publish(&PublishRequest::from_parts(Vec::new(), updates)).await.unwrap();
        converter.commit(&all, &HashSet::new());
        // per host one root link, per vulnerability one sub-category link and six features
        assert_eq!(map.stored_count(), 2 + 3 * 7);

        // removing one of two results keeps the root link of the host
        let first = set(&[a.clone()]);
        let deletes = converter.to_deletes(&first).await.unwrap();
        assert_eq!(deletes.len(), 2);
        map.publish(&PublishRequest::from_parts(deletes, Vec::new())).await.unwrap();
        converter.commit(&HashSet::new(), &first);
        assert_eq!(map.stored_count(), 2 + 2 * 7);

        let rest = set(&[b, c]);
        let deletes = converter.to_deletes(&rest).await.unwrap();
        map.publish(&PublishRequest::from_parts(deletes, Vec::new())).await.unwrap();
        converter.commit(&HashSet::new(), &rest);
        assert_eq!(map.stored_count(), 0);
    }

    #[tokio::test]
    async fn test_uncommitted_updates_do_not_hold_root_link() {
        let map = Arc::new(MemoryMap::with_session("pub-1").with_device("10.0.0.7", "laptop"));
        let mut converter = converter(map);

        let a = set(&[vulnerability("r-1", "10.0.0.7", 7.5)]);
        converter.to_updates(&a).await.unwrap();
        converter.commit(&a, &HashSet::new());

        // built but never accepted by the server
        converter
            .to_updates(&set(&[vulnerability("r-2", "10.0.0.7", 5.0)]))
            .await
            .unwrap();

        let deletes = converter.to_deletes(&a).await.unwrap();
        assert_eq!(deletes.len(), 3);
        assert_eq!(deletes[2].identifier1(), &Identifier::device("laptop"));
    }
}
