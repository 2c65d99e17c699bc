//! OMP client: one TLS connection per command

use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_native_tls::TlsConnector;
use tracing::{debug, info};
use vasbridge_core::Report;

use super::xml::{self, Element};
use crate::error::TransportError;
use crate::traits::ScanSource;
use crate::types::{CommandStatus, ScanConfigInfo, TargetInfo, TaskInfo};

/// Responses above this size are rejected
const MAX_RESPONSE_BYTES: usize = 64 * 1024 * 1024;

/// Configuration for the OMP client
#[derive(Debug, Clone)]
pub struct OmpClientConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Scanner managers usually run with a self-signed certificate
    pub accept_invalid_certs: bool,
    pub request_timeout: Duration,
}

impl Default for OmpClientConfig {
    fn default() -> Self {
        Self {
            host: String::from("127.0.0.1"),
            port: 9390,
            username: String::new(),
            password: String::new(),
            accept_invalid_certs: true,
            request_timeout: Duration::from_secs(60),
        }
    }
}

pub struct OmpClient {
    config: OmpClientConfig,
    connector: TlsConnector,
}

impl OmpClient {
    pub fn new(config: OmpClientConfig) -> Result<Self, TransportError> {
        if config.host.is_empty() {
            return Err(TransportError::NotConfigured("scanner host is required".into()));
        }

        let connector = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .danger_accept_invalid_hostnames(config.accept_invalid_certs)
            .build()?;

        Ok(Self {
            config,
            connector: TlsConnector::from(connector),
        })
    }

    /// Authenticate and run one command on a fresh connection
    async fn command(&self, name: &str, body: String) -> Result<Element, TransportError> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        debug!("OMP {} on {}", name, addr);

        tokio::time::timeout(self.config.request_timeout, async {
            let tcp = TcpStream::connect(&addr).await?;
            let mut stream = self.connector.connect(&self.config.host, tcp).await?;
            exchange(
                &mut stream,
                &self.config.username,
                &self.config.password,
                name,
                &body,
            )
            .await
        })
        .await?
    }
}

/// Write one document and read the reply up to the end of its root element
async fn round_trip<S>(stream: &mut S, request: &str) -> Result<Element, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 8192];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(TransportError::UnexpectedResponse(
                "connection closed before response was complete".into(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > MAX_RESPONSE_BYTES {
            return Err(TransportError::UnexpectedResponse("response too large".into()));
        }
        if let Some(len) = xml::document_len(&buf) {
            let text = String::from_utf8_lossy(&buf[..len]);
            return xml::parse(&text);
        }
    }
}

async fn exchange<S>(
    stream: &mut S,
    username: &str,
    password: &str,
    name: &str,
    body: &str,
) -> Result<Element, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let auth = round_trip(stream, &xml::authenticate(username, password)).await?;
    let status = xml::status(&auth);
    if !status.is_success() {
        return Err(TransportError::OmpAuthentication(status.to_string()));
    }

    let response = round_trip(stream, body).await?;
    xml::check(name, &response)?;
    Ok(response)
}

#[async_trait]
impl ScanSource for OmpClient {
    fn host(&self) -> &str {
        &self.config.host
    }

    async fn list_tasks(&self) -> vasbridge_core::Result<Vec<TaskInfo>> {
        let root = self
            .command("get_tasks", xml::get_tasks())
            .await
            .map_err(TransportError::into_scan_error)?;
        Ok(xml::tasks(&root))
    }

    async fn latest_report(&self, task: &TaskInfo) -> vasbridge_core::Result<Option<Report>> {
        let Some(report_id) = &task.last_report_id else {
            return Ok(None);
        };
        let root = self
            .command("get_reports", xml::get_report(report_id))
            .await
            .map_err(TransportError::into_scan_error)?;
        let report = xml::report(&task.id, &root).map_err(TransportError::into_scan_error)?;
        debug!("Task {} report {}: {} results", task.name, report_id, report.len());
        Ok(Some(report))
    }

    async fn list_targets(&self) -> vasbridge_core::Result<Vec<TargetInfo>> {
        let root = self
            .command("get_targets", xml::get_targets())
            .await
            .map_err(TransportError::into_scan_error)?;
        Ok(xml::targets(&root))
    }

    async fn list_configs(&self) -> vasbridge_core::Result<Vec<ScanConfigInfo>> {
        let root = self
            .command("get_configs", xml::get_configs())
            .await
            .map_err(TransportError::into_scan_error)?;
        Ok(xml::configs(&root))
    }

    async fn create_target(&self, name: &str, hosts: &str) -> vasbridge_core::Result<String> {
        let root = self
            .command("create_target", xml::create_target(name, hosts))
            .await
            .map_err(TransportError::into_scan_error)?;
        let id = xml::created_id("create_target", &root).map_err(TransportError::into_scan_error)?;
        info!("Created target {} ({})", name, id);
        Ok(id)
    }

    async fn create_task(
        &self,
        name: &str,
        config_id: &str,
        target_id: &str,
    ) -> vasbridge_core::Result<String> {
        let root = self
            .command("create_task", xml::create_task(name, config_id, target_id))
            .await
            .map_err(TransportError::into_scan_error)?;
        let id = xml::created_id("create_task", &root).map_err(TransportError::into_scan_error)?;
        info!("Created task {} ({})", name, id);
        Ok(id)
    }

    async fn start_task(&self, task_id: &str) -> vasbridge_core::Result<CommandStatus> {
        self.command("start_task", xml::start_task(task_id))
            .await
            .map(|root| xml::status(&root))
            .map_err(TransportError::into_scan_error)
    }

    async fn delete_task(&self, task_id: &str) -> vasbridge_core::Result<CommandStatus> {
        self.command("delete_task", xml::delete_task(task_id))
            .await
            .map(|root| xml::status(&root))
            .map_err(TransportError::into_scan_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    /// Plays the manager side: reads each request and answers in order
    async fn serve(mut server: tokio::io::DuplexStream, replies: Vec<&'static str>) -> Vec<String> {
        let mut requests = Vec::new();
        for reply in replies {
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            while xml::document_len(&buf).is_none() {
                let n = server.read(&mut chunk).await.unwrap();
                if n == 0 {
                    return requests;
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            requests.push(String::from_utf8(buf).unwrap());
            // Split the reply to exercise partial reads
            let (head, tail) = reply.split_at(reply.len() / 2);
            server.write_all(head.as_bytes()).await.unwrap();
            server.flush().await.unwrap();
            tokio::task::yield_now().await;
            server.write_all(tail.as_bytes()).await.unwrap();
        }
        requests
    }

    #[tokio::test]
    async fn test_exchange_authenticates_first() {
        let (mut client, server) = duplex(4096);
        let manager = tokio::spawn(serve(
            server,
            vec![
                r#"<authenticate_response status="200" status_text="OK"><role>Admin</role></authenticate_response>"#,
                r#"<get_targets_response status="200" status_text="OK"><target id="g-1"><name>office</name></target></get_targets_response>"#,
            ],
        ));

        let root = exchange(&mut client, "admin", "secret", "get_targets", &xml::get_targets())
            .await
            .unwrap();
        assert_eq!(xml::targets(&root)[0].name, "office");

        let requests = manager.await.unwrap();
        assert!(requests[0].starts_with("<authenticate>"));
        assert_eq!(requests[1], "<get_targets/>");
    }

    #[tokio::test]
    async fn test_exchange_rejected_credentials() {
        let (mut client, server) = duplex(4096);
        tokio::spawn(serve(
            server,
            vec![r#"<authenticate_response status="400" status_text="Authentication failed"/>"#],
        ));

        let err = exchange(&mut client, "admin", "wrong", "get_tasks", &xml::get_tasks())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::OmpAuthentication(_)));
    }

    #[tokio::test]
    async fn test_exchange_command_failure() {
        let (mut client, server) = duplex(4096);
        tokio::spawn(serve(
            server,
            vec![
                r#"<authenticate_response status="200" status_text="OK"/>"#,
                r#"<create_task_response status="400" status_text="Bogus config"/>"#,
            ],
        ));

        let err = exchange(&mut client, "a", "b", "create_task", &xml::create_task("n", "c", "t"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Omp { status: 400, .. }));
    }

    #[test]
    fn test_new_requires_host() {
        let config = OmpClientConfig {
            host: String::new(),
            ..OmpClientConfig::default()
        };
        assert!(matches!(OmpClient::new(config), Err(TransportError::NotConfigured(_))));
    }
}
