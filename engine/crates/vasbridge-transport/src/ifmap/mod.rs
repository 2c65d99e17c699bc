//! IF-MAP 2.0 publish model
//!
//! Identifiers, metadata and publish elements as plain values. `soap`
//! renders them into request documents, `client` sends them.

mod client;
pub mod soap;

pub use client::{IfmapAuth, IfmapClient, IfmapClientConfig};

use quick_xml::escape::escape;
use std::fmt::Write;

/// Namespace of the IF-MAP 2.0 operations
pub const IFMAP_NS: &str = "http://www.trustedcomputinggroup.org/2010/IFMAP/2";

/// Namespace of the standard IF-MAP metadata schema
pub const META_NS: &str = "http://www.trustedcomputinggroup.org/2010/IFMAP-METADATA/2";

/// Prefix bound to [`META_NS`]
pub const META_PREFIX: &str = "meta";

/// `value` as an XPath string literal for delete filters
///
/// XPath 1.0 has no escape sequences, so the quote not contained in the
/// value is used, and `concat()` when both occur.
pub fn xpath_literal(value: &str) -> String {
    if !value.contains('\'') {
        format!("'{}'", value)
    } else if !value.contains('"') {
        format!("\"{}\"", value)
    } else {
        let parts: Vec<String> = value.split('\'').map(|part| format!("'{}'", part)).collect();
        format!("concat({})", parts.join(", \"'\", "))
    }
}

/// An IF-MAP identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identifier {
    IpAddress { value: String, ipv6: bool },
    MacAddress { value: String },
    Device { name: String },
    Identity {
        name: String,
        administrative_domain: String,
        other_type_definition: String,
    },
    /// Vendor specific identifier carried as an escaped XML document
    Extended { document: String },
}

impl Identifier {
    pub fn ip(value: impl Into<String>) -> Self {
        let value = value.into();
        let ipv6 = value.contains(':');
        Identifier::IpAddress { value, ipv6 }
    }

    pub fn mac(value: impl Into<String>) -> Self {
        Identifier::MacAddress {
            value: value.into(),
        }
    }

    pub fn device(name: impl Into<String>) -> Self {
        Identifier::Device { name: name.into() }
    }

    /// Identity of type `other`
    pub fn other_identity(
        name: impl Into<String>,
        administrative_domain: impl Into<String>,
        other_type_definition: impl Into<String>,
    ) -> Self {
        Identifier::Identity {
            name: name.into(),
            administrative_domain: administrative_domain.into(),
            other_type_definition: other_type_definition.into(),
        }
    }

    pub fn extended(document: impl Into<String>) -> Self {
        Identifier::Extended {
            document: document.into(),
        }
    }

    /// Name of a device or identity identifier
    pub fn name(&self) -> Option<&str> {
        match self {
            Identifier::Device { name } | Identifier::Identity { name, .. } => Some(name),
            _ => None,
        }
    }

    pub fn write_xml(&self, out: &mut String) {
        match self {
            Identifier::IpAddress { value, ipv6 } => {
                let kind = if *ipv6 { "IPv6" } else { "IPv4" };
                let _ = write!(out, "<ip-address value=\"{}\" type=\"{}\"/>", escape(value), kind);
            }
            Identifier::MacAddress { value } => {
                let _ = write!(out, "<mac-address value=\"{}\"/>", escape(value));
            }
            Identifier::Device { name } => {
                let _ = write!(out, "<device><name>{}</name></device>", escape(name));
            }
            Identifier::Identity {
                name,
                administrative_domain,
                other_type_definition,
            } => {
                let _ = write!(out, "<identity name=\"{}\" type=\"other\"", escape(name));
                if !administrative_domain.is_empty() {
                    let _ = write!(out, " administrative-domain=\"{}\"", escape(administrative_domain));
                }
                let _ = write!(out, " other-type-definition=\"{}\"/>", escape(other_type_definition));
            }
            Identifier::Extended { document } => {
                let _ = write!(
                    out,
                    "<identity name=\"{}\" type=\"other\" other-type-definition=\"extended\"/>",
                    escape(document)
                );
            }
        }
    }
}

impl std::fmt::Display for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Identifier::IpAddress { value, .. } => write!(f, "ip-address({})", value),
            Identifier::MacAddress { value } => write!(f, "mac-address({})", value),
            Identifier::Device { name } => write!(f, "device({})", name),
            Identifier::Identity { name, .. } => write!(f, "identity({})", name),
            Identifier::Extended { .. } => write!(f, "extended-identifier"),
        }
    }
}

/// `ifmap-cardinality` of a metadata element
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cardinality {
    SingleValue,
    MultiValue,
}

impl Cardinality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Cardinality::SingleValue => "singleValue",
            Cardinality::MultiValue => "multiValue",
        }
    }
}

/// A metadata element with attributes and simple text children
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Metadata {
    pub prefix: String,
    pub namespace: String,
    pub name: String,
    pub cardinality: Cardinality,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<(String, String)>,
}

impl Metadata {
    pub fn new(
        prefix: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
        cardinality: Cardinality,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            namespace: namespace.into(),
            name: name.into(),
            cardinality,
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Standard metadata element in the `meta` namespace
    pub fn standard(name: impl Into<String>, cardinality: Cardinality) -> Self {
        Self::new(META_PREFIX, META_NS, name, cardinality)
    }

    pub fn device_ip() -> Self {
        Self::standard("device-ip", Cardinality::SingleValue)
    }

    pub fn ip_mac() -> Self {
        Self::standard("ip-mac", Cardinality::MultiValue)
    }

    pub fn attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push((name.into(), value.into()));
        self
    }

    pub fn child(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.children.push((name.into(), value.into()));
        self
    }

    /// Qualified element name, e.g. `meta:event`
    pub fn qualified_name(&self) -> String {
        format!("{}:{}", self.prefix, self.name)
    }

    /// Text of the first child named `name`
    pub fn child_value(&self, name: &str) -> Option<&str> {
        self.children
            .iter()
            .find(|(child, _)| child == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn write_xml(&self, out: &mut String) {
        let qname = self.qualified_name();
        let _ = write!(
            out,
            "<{} ifmap-cardinality=\"{}\" xmlns:{}=\"{}\"",
            qname,
            self.cardinality.as_str(),
            self.prefix,
            escape(&self.namespace)
        );
        for (name, value) in &self.attributes {
            let _ = write!(out, " {}=\"{}\"", name, escape(value));
        }
        if self.children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        for (name, value) in &self.children {
            let _ = write!(out, "<{}>{}</{}>", name, escape(value), name);
        }
        let _ = write!(out, "</{}>", qname);
    }
}

/// How long published metadata lives on the server
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Lifetime {
    /// Removed when our session ends
    Session,
    #[default]
    Forever,
}

impl Lifetime {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lifetime::Session => "session",
            Lifetime::Forever => "forever",
        }
    }
}

/// Metadata attached to one identifier or to the link between two
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishUpdate {
    pub identifier1: Identifier,
    pub identifier2: Option<Identifier>,
    pub metadata: Vec<Metadata>,
    pub lifetime: Lifetime,
}

impl PublishUpdate {
    pub fn new(identifier1: Identifier) -> Self {
        Self {
            identifier1,
            identifier2: None,
            metadata: Vec::new(),
            lifetime: Lifetime::Forever,
        }
    }

    pub fn link(identifier1: Identifier, identifier2: Identifier) -> Self {
        Self {
            identifier2: Some(identifier2),
            ..Self::new(identifier1)
        }
    }

    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata.push(metadata);
        self
    }

    pub fn lifetime(mut self, lifetime: Lifetime) -> Self {
        self.lifetime = lifetime;
        self
    }
}

/// Removal of metadata matching a filter from an identifier or link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishDelete {
    pub identifier1: Identifier,
    pub identifier2: Option<Identifier>,
    pub filter: Option<String>,
    pub namespaces: Vec<(String, String)>,
}

impl PublishDelete {
    pub fn new(identifier1: Identifier) -> Self {
        Self {
            identifier1,
            identifier2: None,
            filter: None,
            namespaces: Vec::new(),
        }
    }

    pub fn link(identifier1: Identifier, identifier2: Identifier) -> Self {
        Self {
            identifier2: Some(identifier2),
            ..Self::new(identifier1)
        }
    }

    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn namespace(mut self, prefix: impl Into<String>, uri: impl Into<String>) -> Self {
        self.namespaces.push((prefix.into(), uri.into()));
        self
    }
}

/// One element of a publish request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishElement {
    Update(PublishUpdate),
    /// Like an update, but the server only forwards it to subscribers
    /// and does not store it
    Notify(PublishUpdate),
    Delete(PublishDelete),
}

impl PublishElement {
    pub fn is_delete(&self) -> bool {
        matches!(self, PublishElement::Delete(_))
    }

    pub fn identifier1(&self) -> &Identifier {
        match self {
            PublishElement::Update(u) | PublishElement::Notify(u) => &u.identifier1,
            PublishElement::Delete(d) => &d.identifier1,
        }
    }

    pub fn identifier2(&self) -> Option<&Identifier> {
        match self {
            PublishElement::Update(u) | PublishElement::Notify(u) => u.identifier2.as_ref(),
            PublishElement::Delete(d) => d.identifier2.as_ref(),
        }
    }

    pub fn write_xml(&self, out: &mut String) {
        match self {
            PublishElement::Update(update) => write_update("update", update, out),
            PublishElement::Notify(update) => write_update("notify", update, out),
            PublishElement::Delete(delete) => {
                out.push_str("<delete");
                for (prefix, uri) in &delete.namespaces {
                    let _ = write!(out, " xmlns:{}=\"{}\"", prefix, escape(uri));
                }
                if let Some(filter) = &delete.filter {
                    let _ = write!(out, " filter=\"{}\"", escape(filter));
                }
                out.push('>');
                delete.identifier1.write_xml(out);
                if let Some(identifier2) = &delete.identifier2 {
                    identifier2.write_xml(out);
                }
                out.push_str("</delete>");
            }
        }
    }
}

fn write_update(tag: &str, update: &PublishUpdate, out: &mut String) {
    if tag == "update" {
        let _ = write!(out, "<{} lifetime=\"{}\">", tag, update.lifetime.as_str());
    } else {
        let _ = write!(out, "<{}>", tag);
    }
    update.identifier1.write_xml(out);
    if let Some(identifier2) = &update.identifier2 {
        identifier2.write_xml(out);
    }
    out.push_str("<metadata>");
    for metadata in &update.metadata {
        metadata.write_xml(out);
    }
    out.push_str("</metadata>");
    let _ = write!(out, "</{}>", tag);
}

/// An ordered batch of publish elements sent in one request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishRequest {
    pub elements: Vec<PublishElement>,
}

impl PublishRequest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deletes first, so a re-published object is not removed by the
    /// delete of its predecessor in the same request
    pub fn from_parts(deletes: Vec<PublishElement>, updates: Vec<PublishElement>) -> Self {
        let mut elements = deletes;
        elements.extend(updates);
        Self { elements }
    }

    pub fn push(&mut self, element: PublishElement) {
        self.elements.push(element);
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn deletes(&self) -> impl Iterator<Item = &PublishDelete> {
        self.elements.iter().filter_map(|e| match e {
            PublishElement::Delete(d) => Some(d),
            _ => None,
        })
    }

    pub fn updates(&self) -> impl Iterator<Item = &PublishUpdate> {
        self.elements.iter().filter_map(|e| match e {
            PublishElement::Update(u) => Some(u),
            _ => None,
        })
    }

    pub fn notifies(&self) -> impl Iterator<Item = &PublishUpdate> {
        self.elements.iter().filter_map(|e| match e {
            PublishElement::Notify(u) => Some(u),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ip_identifier_xml() {
        let mut out = String::new();
        Identifier::ip("192.168.7.7").write_xml(&mut out);
        assert_eq!(out, r#"<ip-address value="192.168.7.7" type="IPv4"/>"#);

        let mut out = String::new();
        Identifier::ip("fe80::1").write_xml(&mut out);
        assert!(out.contains(r#"type="IPv6""#));
    }

    #[test]
    fn test_extended_identifier_is_escaped() {
        let mut out = String::new();
        Identifier::extended(r#"<simu:service name="openvas"></simu:service>"#).write_xml(&mut out);
        assert!(out.starts_with("<identity name=\"&lt;simu:service"));
        assert!(out.contains("other-type-definition=\"extended\""));
    }

    #[test]
    fn test_metadata_xml() {
        let metadata = Metadata::standard("event", Cardinality::MultiValue)
            .child("name", "a & b")
            .child("magnitude", "93");
        let mut out = String::new();
        metadata.write_xml(&mut out);
        assert_eq!(
            out,
            format!(
                "<meta:event ifmap-cardinality=\"multiValue\" xmlns:meta=\"{}\"><name>a &amp; b</name><magnitude>93</magnitude></meta:event>",
                META_NS
            )
        );
        assert_eq!(metadata.child_value("magnitude"), Some("93"));
    }

    #[test]
    fn test_delete_xml_carries_filter_and_namespace() {
        let delete = PublishDelete::new(Identifier::ip("10.0.0.1"))
            .filter("meta:event[@ifmap-publisher-id='p1']")
            .namespace(META_PREFIX, META_NS);
        let mut out = String::new();
        PublishElement::Delete(delete).write_xml(&mut out);
        assert!(out.starts_with(&format!("<delete xmlns:meta=\"{}\"", META_NS)));
        assert!(out.contains("filter=\"meta:event[@ifmap-publisher-id=&apos;p1&apos;]\""));
        assert!(out.ends_with("<ip-address value=\"10.0.0.1\" type=\"IPv4\"/></delete>"));
    }

    #[test]
    fn test_xpath_literal() {
        assert_eq!(xpath_literal("res-2"), "'res-2'");
        assert_eq!(xpath_literal("O'Brien"), "\"O'Brien\"");
        assert_eq!(xpath_literal("a'b\"c"), "concat('a', \"'\", 'b\"c')");
    }

    #[test]
    fn test_request_orders_deletes_first() {
        let update = PublishElement::Update(PublishUpdate::new(Identifier::ip("10.0.0.1")));
        let delete = PublishElement::Delete(PublishDelete::new(Identifier::ip("10.0.0.2")));
        let request = PublishRequest::from_parts(vec![delete.clone()], vec![update.clone()]);
        assert_eq!(request.elements, vec![delete, update]);
        assert_eq!(request.deletes().count(), 1);
        assert_eq!(request.updates().count(), 1);
        assert_eq!(request.notifies().count(), 0);
    }
}
