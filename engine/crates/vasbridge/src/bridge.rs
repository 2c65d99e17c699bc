//! Builds the workers described by the configuration and runs them

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};
use vasbridge_common::config::AuthMethod;
use vasbridge_common::{local_hostname, Config};
use vasbridge_convert::{ConverterContext, ConverterRegistry, ConverterSettings, DeviceResolver};
use vasbridge_core::FilterParser;
use vasbridge_sync::filter;
use vasbridge_sync::{
    self_publish, ConsumerSettings, EventConsumer, EventPublisher, Fetcher, Keepalive, Lifecycle,
    MapHandler, ScannerIdentity,
};
use vasbridge_transport::ifmap::{Identifier, IfmapAuth};
use vasbridge_transport::{
    AmqpChannel, BrokerChannel, IfmapClient, IfmapClientConfig, MapChannel, OmpClient,
    OmpClientConfig, ScanSource, SharedSession,
};

/// Fail early on a converter name the registry does not know
pub fn check_converter(config: &Config) -> Result<()> {
    if !config.ifmap.enable {
        return Ok(());
    }
    let registry = ConverterRegistry::with_defaults();
    if !registry.contains(&config.ifmap.converter) {
        anyhow::bail!(
            "unknown converter {:?}, expected one of {}",
            config.ifmap.converter,
            registry.names().join(", ")
        );
    }
    Ok(())
}

fn converter_settings(config: &Config) -> Result<ConverterSettings> {
    Ok(ConverterSettings {
        filter_update: FilterParser::parse(&config.ifmap.filter_update)?,
        filter_notify: FilterParser::parse(&config.ifmap.filter_notify)?,
    })
}

fn read_file(path: &str) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading {}", path))
}

fn ifmap_client_config(config: &Config) -> Result<IfmapClientConfig> {
    let section = &config.ifmap;
    let auth = match section.auth_method {
        AuthMethod::Basic => IfmapAuth::Basic {
            username: section.username.clone(),
            password: section.password.clone(),
        },
        AuthMethod::Cert => {
            let path = section
                .identity_path
                .as_deref()
                .context("ifmap.identity_path is required for certificate authentication")?;
            IfmapAuth::Certificate {
                pkcs12: read_file(path)?,
                password: section.identity_password.clone().unwrap_or_default(),
            }
        }
    };
    let ca_cert_pem = section.ca_cert_path.as_deref().map(read_file).transpose()?;

    Ok(IfmapClientConfig {
        url: section.url.clone(),
        auth,
        ca_cert_pem,
        accept_invalid_certs: section.accept_invalid_certs,
        request_timeout: section.request_timeout(),
    })
}

/// Opens the scanner, MAP and broker connections a configuration asks for
#[async_trait]
pub trait Connector: Send + Sync {
    fn scan_source(&self, config: &Config) -> Result<Arc<dyn ScanSource>>;

    /// MAP channel without a session yet
    fn map_channel(&self, config: &Config) -> Result<Arc<dyn MapChannel>>;

    async fn broker(&self, config: &Config, tag: String) -> Result<Arc<dyn BrokerChannel>>;
}

/// OMP over TLS, IF-MAP over HTTPS and AMQP
pub struct Network;

#[async_trait]
impl Connector for Network {
    fn scan_source(&self, config: &Config) -> Result<Arc<dyn ScanSource>> {
        let client = OmpClient::new(OmpClientConfig {
            host: config.scanner.host.clone(),
            port: config.scanner.port,
            username: config.scanner.username.clone(),
            password: config.scanner.password.clone(),
            accept_invalid_certs: config.scanner.accept_invalid_certs,
            request_timeout: config.scanner.request_timeout(),
        })?;
        Ok(Arc::new(client))
    }

    fn map_channel(&self, config: &Config) -> Result<Arc<dyn MapChannel>> {
        let client = IfmapClient::new(ifmap_client_config(config)?)?;
        Ok(Arc::new(SharedSession::new(client)))
    }

    async fn broker(&self, config: &Config, tag: String) -> Result<Arc<dyn BrokerChannel>> {
        let channel = AmqpChannel::connect(&config.amqp.uri, tag).await?;
        Ok(Arc::new(channel))
    }
}

/// Device lookups through the MAP session
struct SessionResolver(Arc<dyn MapChannel>);

#[async_trait]
impl DeviceResolver for SessionResolver {
    async fn resolve_device(&self, ip: &Identifier) -> vasbridge_core::Result<Option<Identifier>> {
        self.0.search_device(ip).await
    }
}

fn scanner_identity(config: &Config) -> ScannerIdentity {
    let self_publish = &config.ifmap.self_publish;
    ScannerIdentity {
        ip: config.scanner.host.clone(),
        mac: self_publish.mac.clone(),
        device: self_publish.device.clone().unwrap_or_else(local_hostname),
        port: config.scanner.port,
        version: config.scanner.version.clone(),
        ..ScannerIdentity::default()
    }
}

/// Everything the configuration asks for, connected but not yet running
struct Bridge {
    fetcher: Option<Fetcher>,
    session: Option<Arc<dyn MapChannel>>,
    handler: Option<MapHandler>,
    publisher: Option<EventPublisher>,
    consumer: Option<EventConsumer>,
    brokers: Vec<Arc<dyn BrokerChannel>>,
}

impl Bridge {
    /// Connect everything; on failure whatever was opened is closed again
    async fn build(config: &Config, connector: &dyn Connector) -> Result<Self> {
        let mut bridge = Bridge {
            fetcher: None,
            session: None,
            handler: None,
            publisher: None,
            consumer: None,
            brokers: Vec::new(),
        };
        if let Err(e) = bridge.connect(config, connector).await {
            bridge.close().await;
            return Err(e);
        }
        Ok(bridge)
    }

    async fn connect(&mut self, config: &Config, connector: &dyn Connector) -> Result<()> {
        let source = connector.scan_source(config)?;

        if config.bridge.publisher_enable {
            let mut fetcher = Fetcher::new(source.clone(), config.scanner.poll_interval());
            if let Some(filter) = filter::from_config(&config.filter)? {
                fetcher = fetcher.with_filter(filter);
            }

            if config.ifmap.enable {
                self.open_map(config, connector, &mut fetcher).await?;
            }

            if config.amqp.publisher_enable {
                let broker = connector
                    .broker(config, format!("{}-publisher", config.bridge.name))
                    .await
                    .context("connecting event publisher")?;
                self.brokers.push(broker.clone());
                let publisher_id = self
                    .session
                    .as_ref()
                    .and_then(|s| s.publisher_id())
                    .unwrap_or_else(|| config.bridge.name.clone());
                self.publisher = Some(EventPublisher::new(
                    broker,
                    config.amqp.exchange.as_str(),
                    publisher_id,
                    fetcher.subscribe("event-publisher"),
                ));
            }

            if fetcher.sink_count() == 0 {
                warn!("Publisher enabled without any sink, not polling the scanner");
            } else {
                self.fetcher = Some(fetcher);
            }
        }

        if config.bridge.subscriber_enable {
            let broker = connector
                .broker(config, format!("{}-subscriber", config.bridge.name))
                .await
                .context("connecting event consumer")?;
            self.brokers.push(broker.clone());
            let mut consumer = EventConsumer::new(
                source,
                broker,
                ConsumerSettings {
                    queue: config.amqp.queue.clone(),
                    durable: config.amqp.durable,
                    allow_delete_event: config.amqp.allow_delete_event,
                    default_config: config.amqp.default_config.clone(),
                    name_prefix: config.amqp.name_prefix.clone(),
                },
            );
            consumer.prepare().await.context("loading scan configurations")?;
            self.consumer = Some(consumer);
        }

        Ok(())
    }

    /// Open the MAP session and build the handler on top of it
    async fn open_map(&mut self, config: &Config, connector: &dyn Connector, fetcher: &mut Fetcher) -> Result<()> {
        let session = connector.map_channel(config)?;
        session.new_session().await.context("opening MAP session")?;
        self.session = Some(session.clone());

        if config.ifmap.purge_on_start {
            session
                .purge_publisher()
                .await
                .context("purging previously published metadata")?;
        }
        let publisher_id = session
            .publisher_id()
            .unwrap_or_else(|| config.bridge.name.clone());
        info!("MAP session open, publisher id {}", publisher_id);

        if config.ifmap.self_publish.enable {
            self_publish(&*session, &scanner_identity(config)).await;
        }

        let context = ConverterContext::new(
            publisher_id,
            ConverterContext::scanner_id_for(&config.scanner.host),
        )
        .with_resolver(Arc::new(SessionResolver(session.clone())));
        let converter = ConverterRegistry::with_defaults().resolve(
            &config.ifmap.converter,
            &converter_settings(config)?,
            context,
        )?;
        info!("Using converter {}", converter.name());

        self.handler = Some(MapHandler::new(session, converter, fetcher.subscribe("map-handler")));
        Ok(())
    }

    /// End the MAP session and close every broker channel
    async fn close(&self) {
        if let Some(session) = &self.session {
            if let Err(e) = session.end_session().await {
                warn!("Ending MAP session failed: {}", e);
            }
        }
        for broker in &self.brokers {
            if let Err(e) = broker.close().await {
                warn!("Closing broker channel failed: {}", e);
            }
        }
    }
}

/// Poll once, push the result through every sink and disconnect
///
/// Returns true when a sink failed.
pub async fn run_once(config: &Config) -> Result<bool> {
    run_once_with(config, &Network).await
}

async fn run_once_with(config: &Config, connector: &dyn Connector) -> Result<bool> {
    let mut bridge = Bridge::build(config, connector).await?;
    let mut failed = false;

    if let Some(fetcher) = &bridge.fetcher {
        let reports = fetcher.poll_once().await;
        info!("Fetched {} reports", reports);
    }
    if let Some(handler) = bridge.handler.as_mut() {
        match handler.drain().await {
            Ok(n) => info!("Published {} changes to MAP", n),
            Err(e) => {
                warn!("MAP sink failed: {}", e);
                failed = true;
            }
        }
    }
    if let Some(publisher) = bridge.publisher.as_mut() {
        match publisher.drain().await {
            Ok(n) => info!("Sent {} vulnerability events", n),
            Err(e) => {
                warn!("Event publisher failed: {}", e);
                failed = true;
            }
        }
    }
    if bridge.consumer.is_some() {
        info!("Single cycle mode does not consume requests");
    }

    bridge.close().await;
    Ok(failed)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

/// Run every worker until a signal arrives or one of them ends
///
/// Returns true when a worker failed.
pub async fn run(config: &Config) -> Result<bool> {
    let bridge = Bridge::build(config, &Network).await?;
    let mut lifecycle = Lifecycle::new();

    if let Some(fetcher) = bridge.fetcher {
        let cancel = lifecycle.token();
        lifecycle.spawn("fetcher", fetcher.run(cancel));
    }
    if let Some(handler) = bridge.handler {
        let cancel = lifecycle.token();
        lifecycle.spawn("map-handler", handler.run(cancel));
    }
    if let Some(session) = bridge.session {
        // ends the session, so it stops after the handler
        let keepalive = Keepalive::new(session, config.ifmap.keepalive_interval());
        let cancel = lifecycle.closing_token();
        lifecycle.spawn_last("keepalive", keepalive.run(cancel));
    }
    if let Some(publisher) = bridge.publisher {
        let cancel = lifecycle.token();
        lifecycle.spawn("event-publisher", publisher.run(cancel));
    }
    if let Some(consumer) = bridge.consumer {
        let cancel = lifecycle.token();
        lifecycle.spawn("event-consumer", consumer.run(cancel));
    }
    info!("Started {} workers, press Ctrl+C to stop", lifecycle.len());

    let summary = lifecycle.run_until_shutdown(shutdown_signal()).await;
    for name in summary.failed() {
        warn!("Worker {} failed", name);
    }
    Ok(summary.any_failed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use vasbridge_core::{Report, RiskFilter, Vulnerability};
    use vasbridge_transport::testing::{MemoryBroker, MemoryMap, MemoryScanSource};

    /// In-memory collaborators; without a broker every AMQP connect fails
    struct Doubles {
        source: Arc<MemoryScanSource>,
        map: Arc<MemoryMap>,
        broker: Option<Arc<MemoryBroker>>,
    }

    #[async_trait]
    impl Connector for Doubles {
        fn scan_source(&self, _config: &Config) -> Result<Arc<dyn ScanSource>> {
            Ok(self.source.clone())
        }

        fn map_channel(&self, _config: &Config) -> Result<Arc<dyn MapChannel>> {
            Ok(self.map.clone())
        }

        async fn broker(&self, _config: &Config, _tag: String) -> Result<Arc<dyn BrokerChannel>> {
            match &self.broker {
                Some(broker) => Ok(broker.clone()),
                None => anyhow::bail!("connection refused"),
            }
        }
    }

    fn both_sinks() -> Config {
        let mut config = Config::default();
        config.bridge.publisher_enable = true;
        config.bridge.subscriber_enable = false;
        config.ifmap.enable = true;
        config.ifmap.self_publish.enable = false;
        config.amqp.publisher_enable = true;
        config
    }

    #[tokio::test]
    async fn test_failed_build_ends_map_session() {
        let doubles = Doubles {
            source: Arc::new(MemoryScanSource::new("scanner")),
            map: Arc::new(MemoryMap::new("pub-1")),
            broker: None,
        };

        match Bridge::build(&both_sinks(), &doubles).await {
            Ok(_) => panic!("build succeeded without a broker"),
            Err(e) => assert_eq!(e.to_string(), "connecting event publisher"),
        }
        assert!(doubles.map.session_ended());
    }

    #[tokio::test]
    async fn test_run_once_publishes_and_disconnects() {
        let report = Report::new("t1", vec![Vulnerability::builder("r-1", "10.0.0.5").build()]);
        let doubles = Doubles {
            source: Arc::new(MemoryScanSource::new("scanner").with_report("T1", report)),
            map: Arc::new(MemoryMap::new("pub-1")),
            broker: Some(Arc::new(MemoryBroker::new())),
        };

        let failed = run_once_with(&both_sinks(), &doubles).await.unwrap();
        assert!(!failed);
        assert!(doubles.map.stored_count() > 0);
        assert!(doubles.map.session_ended());

        let broker = doubles.broker.as_ref().unwrap();
        assert_eq!(broker.published().len(), 1);
        assert!(broker.is_closed());
    }

    #[test]
    fn test_unknown_converter_rejected() {
        let mut config = Config::default();
        config.ifmap.enable = true;
        config.ifmap.converter = "esukom".into();
        assert!(check_converter(&config).is_ok());

        config.ifmap.converter = "graph".into();
        let err = check_converter(&config).unwrap_err().to_string();
        assert!(err.contains("graph"));

        config.ifmap.enable = false;
        assert!(check_converter(&config).is_ok());
    }

    #[test]
    fn test_converter_settings() {
        let mut config = Config::default();
        config.ifmap.filter_update = "ALL".into();
        config.ifmap.filter_notify = "".into();

        let settings = converter_settings(&config).unwrap();
        assert_eq!(settings.filter_update, RiskFilter::all());
        assert_eq!(settings.filter_notify, RiskFilter::none());
    }

    #[test]
    fn test_certificate_auth_reads_identity() {
        let mut identity = tempfile::NamedTempFile::new().unwrap();
        identity.write_all(b"pkcs12-bytes").unwrap();

        let mut config = Config::default();
        config.ifmap.auth_method = AuthMethod::Cert;
        config.ifmap.identity_path = Some(identity.path().to_string_lossy().to_string());
        config.ifmap.identity_password = Some("secret".into());

        match ifmap_client_config(&config).unwrap().auth {
            IfmapAuth::Certificate { pkcs12, password } => {
                assert_eq!(pkcs12, b"pkcs12-bytes");
                assert_eq!(password, "secret");
            }
            other => panic!("unexpected auth {:?}", other),
        }

        config.ifmap.identity_path = Some("/nonexistent/identity.p12".into());
        assert!(ifmap_client_config(&config).is_err());
    }

    #[test]
    fn test_scanner_identity_defaults_device_to_hostname() {
        let mut config = Config::default();
        config.scanner.host = "10.0.0.2".into();
        let identity = scanner_identity(&config);
        assert_eq!(identity.ip, "10.0.0.2");
        assert_eq!(identity.device, local_hostname());

        config.ifmap.self_publish.device = Some("scanner-1".into());
        assert_eq!(scanner_identity(&config).device, "scanner-1");
    }
}
