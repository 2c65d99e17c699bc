//! IF-MAP SOAP client over HTTPS

use async_trait::async_trait;
use reqwest::Client;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info};

use super::soap::{self, SessionInfo};
use super::{Identifier, PublishRequest};
use crate::error::TransportError;
use crate::traits::MapChannel;

// ── Configuration ────────────────────────────────────────────────────────────

/// How the client authenticates
#[derive(Clone)]
pub enum IfmapAuth {
    Basic { username: String, password: String },
    /// PKCS#12 client identity
    Certificate { pkcs12: Vec<u8>, password: String },
}

impl std::fmt::Debug for IfmapAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IfmapAuth::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .finish_non_exhaustive(),
            IfmapAuth::Certificate { .. } => f.debug_struct("Certificate").finish_non_exhaustive(),
        }
    }
}

/// Configuration for the IF-MAP client
#[derive(Debug, Clone)]
pub struct IfmapClientConfig {
    /// MAP server endpoint, e.g. `https://map.example.com:8443`
    pub url: String,
    pub auth: IfmapAuth,
    /// Additional PEM root certificate
    pub ca_cert_pem: Option<Vec<u8>>,
    pub accept_invalid_certs: bool,
    pub request_timeout: Duration,
}

impl Default for IfmapClientConfig {
    fn default() -> Self {
        Self {
            url: String::from("https://localhost:8443"),
            auth: IfmapAuth::Basic {
                username: String::new(),
                password: String::new(),
            },
            ca_cert_pem: None,
            accept_invalid_certs: false,
            request_timeout: Duration::from_secs(120),
        }
    }
}

// ── Client ───────────────────────────────────────────────────────────────────

/// IF-MAP client holding at most one session
pub struct IfmapClient {
    config: IfmapClientConfig,
    http: Client,
    session: Mutex<Option<SessionInfo>>,
}

impl IfmapClient {
    pub fn new(config: IfmapClientConfig) -> Result<Self, TransportError> {
        if config.url.is_empty() {
            return Err(TransportError::NotConfigured("ifmap url is required".into()));
        }

        let mut builder = Client::builder()
            .timeout(config.request_timeout)
            .user_agent(format!("vasbridge/{}", env!("CARGO_PKG_VERSION")))
            .danger_accept_invalid_certs(config.accept_invalid_certs);

        if let Some(pem) = &config.ca_cert_pem {
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(pem)?);
        }
        if let IfmapAuth::Certificate { pkcs12, password } = &config.auth {
            builder = builder.identity(reqwest::Identity::from_pkcs12_der(pkcs12, password)?);
        }

        Ok(Self {
            config,
            http: builder.build()?,
            session: Mutex::new(None),
        })
    }

    fn current_session(&self) -> Option<SessionInfo> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_session(&self, session: Option<SessionInfo>) {
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = session;
    }

    fn session_id(&self) -> Result<String, TransportError> {
        self.current_session()
            .map(|s| s.session_id)
            .ok_or(TransportError::NoSession)
    }

    async fn post(&self, body: String) -> Result<String, TransportError> {
        let mut request = self
            .http
            .post(&self.config.url)
            .header(reqwest::header::CONTENT_TYPE, "application/soap+xml; charset=utf-8")
            .body(body);

        if let IfmapAuth::Basic { username, password } = &self.config.auth {
            request = request.basic_auth(username, Some(password));
        }

        let res = request.send().await?;
        if !res.status().is_success() {
            let status = res.status().as_u16();
            let text = res.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status,
                message: text,
            });
        }
        Ok(res.text().await?)
    }

    // ── Operations ───────────────────────────────────────────────────────

    pub async fn open(&self) -> Result<SessionInfo, TransportError> {
        let response = self.post(soap::new_session()).await?;
        let info = soap::parse_new_session(&response)?;
        info!(
            "IF-MAP session {} established as publisher {}",
            info.session_id, info.publisher_id
        );
        self.set_session(Some(info.clone()));
        Ok(info)
    }

    pub async fn renew(&self) -> Result<(), TransportError> {
        let session_id = self.session_id()?;
        let response = self.post(soap::renew_session(&session_id)).await?;
        soap::parse_ack(&response, "renewSessionResult")?;
        debug!("IF-MAP session {} renewed", session_id);
        Ok(())
    }

    pub async fn close(&self) -> Result<(), TransportError> {
        let session_id = self.session_id()?;
        let result = self.post(soap::end_session(&session_id)).await;
        self.set_session(None);
        soap::parse_ack(&result?, "endSessionResult")?;
        info!("IF-MAP session {} ended", session_id);
        Ok(())
    }

    pub async fn purge(&self) -> Result<(), TransportError> {
        let session = self.current_session().ok_or(TransportError::NoSession)?;
        let response = self
            .post(soap::purge_publisher(&session.session_id, &session.publisher_id))
            .await?;
        soap::parse_ack(&response, "purgePublisherReceived")?;
        info!("Purged metadata of publisher {}", session.publisher_id);
        Ok(())
    }

    pub async fn send_publish(&self, request: &PublishRequest) -> Result<(), TransportError> {
        let session_id = self.session_id()?;
        let response = self.post(soap::publish(&session_id, request)).await?;
        soap::parse_ack(&response, "publishReceived")?;
        debug!("Published {} elements", request.len());
        Ok(())
    }

    pub async fn search(&self, start: &Identifier) -> Result<Option<Identifier>, TransportError> {
        let session_id = self.session_id()?;
        let response = self.post(soap::search_device(&session_id, start)).await?;
        let devices = soap::parse_search_devices(&response)?;
        Ok(devices.into_iter().next().map(Identifier::device))
    }
}

#[async_trait]
impl MapChannel for IfmapClient {
    async fn new_session(&self) -> vasbridge_core::Result<()> {
        self.open().await.map(|_| ()).map_err(TransportError::into_map_error)
    }

    async fn renew_session(&self) -> vasbridge_core::Result<()> {
        self.renew().await.map_err(TransportError::into_map_error)
    }

    async fn end_session(&self) -> vasbridge_core::Result<()> {
        self.close().await.map_err(TransportError::into_map_error)
    }

    async fn purge_publisher(&self) -> vasbridge_core::Result<()> {
        self.purge().await.map_err(TransportError::into_map_error)
    }

    async fn publish(&self, request: &PublishRequest) -> vasbridge_core::Result<()> {
        self.send_publish(request)
            .await
            .map_err(TransportError::into_map_error)
    }

    async fn search_device(&self, ip: &Identifier) -> vasbridge_core::Result<Option<Identifier>> {
        self.search(ip).await.map_err(TransportError::into_map_error)
    }

    fn publisher_id(&self) -> Option<String> {
        self.current_session().map(|s| s.publisher_id)
    }
}
