//! Announces the scanner itself in the MAP graph
//!
//! Everything is published with session lifetime, so the server drops it
//! when the bridge's session ends.

use quick_xml::escape::escape;
use tracing::{info, warn};
use vasbridge_core::Result;
use vasbridge_transport::ifmap::{
    Cardinality, Identifier, Lifetime, Metadata, PublishElement, PublishRequest, PublishUpdate,
};
use vasbridge_transport::MapChannel;

pub const SIMU_NS: &str = "http://simu-project.de/XMLSchema/1";
pub const SIMU_PREFIX: &str = "simu";

const SERVICE_NAME: &str = "openvas";
const SERVICE_TYPE: &str = "vulnerability scanner";
const IMPLEMENTATION_NAME: &str = "OpenVAS";

/// The scanner as seen from the MAP server
#[derive(Debug, Clone, Default)]
pub struct ScannerIdentity {
    /// Address of the scanner host
    pub ip: String,
    pub mac: Option<String>,
    pub device: String,
    pub port: u16,
    pub version: String,
    pub local_version: String,
    pub platform: String,
    pub administrative_domain: String,
}

fn simu_link(name: &str) -> Metadata {
    Metadata::new(SIMU_PREFIX, SIMU_NS, name, Cardinality::SingleValue)
}

fn session_update(identifier1: Identifier, identifier2: Identifier, metadata: Metadata) -> PublishElement {
    PublishElement::Update(
        PublishUpdate::link(identifier1, identifier2)
            .metadata(metadata)
            .lifetime(Lifetime::Session),
    )
}


impl ScannerIdentity {
    /// Extended identifier of the scanning service
    pub fn service(&self) -> Identifier {
        Identifier::extended(format!(
            "<{p}:service administrative-domain=\"{}\" xmlns:{p}=\"{}\" type=\"{}\" name=\"{}\" port=\"{}\"></{p}:service>",
            escape(&self.administrative_domain),
            SIMU_NS,
            SERVICE_TYPE,
            SERVICE_NAME,
            self.port,
            p = SIMU_PREFIX,
        ))
    }

    /// Extended identifier of the scanner software
    pub fn implementation(&self) -> Identifier {
        Identifier::extended(format!(
            "<{p}:implementation xmlns:{p}=\"{}\" name=\"{}\" version=\"{}\" local-version=\"{}\" platform=\"{}\"></{p}:implementation>",
            SIMU_NS,
            IMPLEMENTATION_NAME,
            escape(&self.version),
            escape(&self.local_version),
            escape(&self.platform),
            p = SIMU_PREFIX,
        ))
    }

    pub fn request(&self) -> PublishRequest {
        let ip = Identifier::ip(self.ip.as_str());
        let service = self.service();
        let mut request = PublishRequest::new();

        request.push(session_update(
            Identifier::device(self.device.as_str()),
            ip.clone(),
            Metadata::device_ip(),
        ));
        if let Some(mac) = &self.mac {
            request.push(session_update(ip.clone(), Identifier::mac(mac.as_str()), Metadata::ip_mac()));
        }
        request.push(session_update(service.clone(), ip, simu_link("service-ip")));
        request.push(session_update(
            service,
            self.implementation(),
            simu_link("service-implementation"),
        ));
        request
    }

    pub async fn publish(&self, channel: &dyn MapChannel) -> Result<()> {
        channel.publish(&self.request()).await
    }
}

/// Publish `identity`; failures are only logged
pub async fn self_publish(channel: &dyn MapChannel, identity: &ScannerIdentity) {
    match identity.publish(channel).await {
        Ok(()) => info!("Published scanner {} as device {}", identity.ip, identity.device),
        Err(e) => warn!("Could not publish scanner information: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vasbridge_transport::testing::{Failure, MemoryMap};

    fn identity(mac: Option<&str>) -> ScannerIdentity {
        ScannerIdentity {
            ip: "10.0.0.2".into(),
            mac: mac.map(str::to_string),
            device: "scanner-host".into(),
            port: 9390,
            version: "6.0".into(),
            ..ScannerIdentity::default()
        }
    }

    #[test]
    fn test_request_shape() {
        let request = identity(Some("00:11:22:33:44:55")).request();
        assert_eq!(request.len(), 4);
        assert!(request.updates().all(|u| u.lifetime == Lifetime::Session));

        let names: Vec<String> = request
            .updates()
            .map(|u| u.metadata[0].qualified_name())
            .collect();
        assert_eq!(
            names,
            vec!["meta:device-ip", "meta:ip-mac", "simu:service-ip", "simu:service-implementation"]
        );

        assert_eq!(identity(None).request().len(), 3);
    }

    #[test]
    fn test_service_document() {
        let Identifier::Extended { document } = identity(None).service() else {
            panic!("service must be an extended identifier");
        };
        assert_eq!(
            document,
            "<simu:service administrative-domain=\"\" xmlns:simu=\"http://simu-project.de/XMLSchema/1\" \
             type=\"vulnerability scanner\" name=\"openvas\" port=\"9390\"></simu:service>"
        );

        let Identifier::Extended { document } = identity(None).implementation() else {
            panic!("implementation must be an extended identifier");
        };
        assert!(document.contains("name=\"OpenVAS\" version=\"6.0\""));
    }

    #[test]
    fn test_documents_escape_attribute_values() {
        let identity = ScannerIdentity {
            administrative_domain: "O'Neil & Co".into(),
            version: "6.0 \"beta\"".into(),
            ..identity(None)
        };
        let Identifier::Extended { document } = identity.service() else {
            panic!("service must be an extended identifier");
        };
        assert!(document.contains("administrative-domain=\"O&apos;Neil &amp; Co\""));

        let Identifier::Extended { document } = identity.implementation() else {
            panic!("implementation must be an extended identifier");
        };
        assert!(document.contains("version=\"6.0 &quot;beta&quot;\""));
    }

    #[tokio::test]
    async fn test_published_metadata_ends_with_session() {
        let map = MemoryMap::with_session("pub-1");
        self_publish(&map, &identity(None)).await;
        assert_eq!(map.stored_count(), 3);

        map.end_session().await.unwrap();
        assert_eq!(map.stored_count(), 0);
    }

    #[tokio::test]
    async fn test_failure_is_not_fatal() {
        let map = MemoryMap::with_session("pub-1");
        map.fail_next_publish(Failure::Fatal);
        self_publish(&map, &identity(None)).await;
        assert_eq!(map.stored_count(), 0);
    }
}
