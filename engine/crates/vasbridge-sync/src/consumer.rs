//! Broker source: scan and delete-task requests driving the scanner

use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vasbridge_core::{Error, Result};
use vasbridge_transport::{
    BrokerChannel, ControlEvent, DeleteTaskRequest, Delivery, ScanRequest, ScanSource,
};

use crate::lifecycle::WorkerExit;

/// Consumer options
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub queue: String,
    pub durable: bool,
    /// Honour delete-task requests; otherwise they are acknowledged and ignored
    pub allow_delete_event: bool,
    /// Scan configuration used when a request names an unknown one
    pub default_config: String,
    /// Target and task name prefix for requests that carry none
    pub name_prefix: String,
}

/// What became of one delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Task created and started
    Scanned { task_id: String },
    /// Number of tasks deleted
    Deleted(usize),
    /// Delete requests are disabled
    DeleteIgnored,
    /// Not a control event, or the scanner refused it
    Dropped,
}

/// Turns inbound control events into scanner commands
///
/// Every delivery is acknowledged, whatever its outcome, so a bad
/// message is never redelivered.
pub struct EventConsumer {
    source: Arc<dyn ScanSource>,
    broker: Arc<dyn BrokerChannel>,
    settings: ConsumerSettings,
    /// Scan configuration ids by name
    configs: HashMap<String, String>,
    default_config_id: Option<String>,
}

impl EventConsumer {
    pub fn new(source: Arc<dyn ScanSource>, broker: Arc<dyn BrokerChannel>, settings: ConsumerSettings) -> Self {
        Self {
            source,
            broker,
            settings,
            configs: HashMap::new(),
            default_config_id: None,
        }
    }

    /// Load the scanner's scan configurations; the default one must exist
    pub async fn prepare(&mut self) -> Result<()> {
        let configs = self.source.list_configs().await?;
        self.configs = configs.into_iter().map(|c| (c.name, c.id)).collect();

        let default = self
            .configs
            .get(&self.settings.default_config)
            .cloned()
            .ok_or_else(|| Error::DefaultScanConfigMissing {
                name: self.settings.default_config.clone(),
            })?;
        debug!("Default scan configuration {} is {}", self.settings.default_config, default);
        self.default_config_id = Some(default);
        Ok(())
    }

    fn config_id(&self, name: &str) -> Result<String> {
        if let Some(id) = self.configs.get(name) {
            return Ok(id.clone());
        }
        let default = self.default_config_id.clone().ok_or_else(|| Error::DefaultScanConfigMissing {
            name: self.settings.default_config.clone(),
        })?;
        warn!("Unknown scan configuration {:?}, using {}", name, self.settings.default_config);
        Ok(default)
    }

    async fn scan(&self, request: &ScanRequest) -> Result<String> {
        let info = request.info.or_prefix(&self.settings.name_prefix);
        let target_name = info.target_name();

        let existing = self
            .source
            .list_targets()
            .await?
            .into_iter()
            .find(|t| t.name == target_name);
        let target_id = match existing {
            Some(target) => target.id,
            None => {
                let id = self.source.create_target(&target_name, &info.ip).await?;
                info!("Created target {} for {}", target_name, info.ip);
                id
            }
        };

        let config_id = self.config_id(&request.config_name)?;
        let task_name = info.task_name();
        let task_id = self.source.create_task(&task_name, &config_id, &target_id).await?;
        let status = self.source.start_task(&task_id).await?;
        info!("Started task {} ({}): {}", task_name, task_id, status);
        Ok(task_id)
    }

    async fn delete_tasks(&self, request: &DeleteTaskRequest) -> Result<usize> {
        let tasks = self.source.list_tasks().await?;
        let mut deleted = 0;
        for info in &request.task_infos {
            let name = info.or_prefix(&self.settings.name_prefix).task_name();
            let Some(task) = tasks.iter().find(|t| t.name == name) else {
                info!("No task named {}, nothing to delete", name);
                continue;
            };
            // the first call moves the task to the trash, the second removes it
            self.source.delete_task(&task.id).await?;
            self.source.delete_task(&task.id).await?;
            info!("Deleted task {} ({})", name, task.id);
            deleted += 1;
        }
        Ok(deleted)
    }

    async fn process(&self, delivery: &Delivery) -> Outcome {
        let event = match ControlEvent::decode(delivery.content_type.as_deref(), &delivery.body) {
            Ok(event) => event,
            Err(e) => {
                warn!("Dropping message {}: {}", delivery.delivery_tag, e);
                return Outcome::Dropped;
            }
        };

        match event {
            ControlEvent::Scan(request) => match self.scan(&request).await {
                Ok(task_id) => Outcome::Scanned { task_id },
                Err(e) => {
                    warn!("Scan request for {} failed: {}", request.info.ip, e);
                    Outcome::Dropped
                }
            },
            ControlEvent::DeleteTasks(_) if !self.settings.allow_delete_event => {
                info!("Delete-task requests are disabled, ignoring message {}", delivery.delivery_tag);
                Outcome::DeleteIgnored
            }
            ControlEvent::DeleteTasks(request) => match self.delete_tasks(&request).await {
                Ok(count) => Outcome::Deleted(count),
                Err(e) => {
                    warn!("Delete-task request failed: {}", e);
                    Outcome::Dropped
                }
            },
        }
    }

    /// Process and acknowledge one delivery; only a failed ack is an error
    pub async fn handle(&self, delivery: &Delivery) -> Result<Outcome> {
        let outcome = self.process(delivery).await;
        self.broker.ack(delivery.delivery_tag).await?;
        Ok(outcome)
    }

    async fn close(&self) {
        if let Err(e) = self.broker.close().await {
            debug!("Closing broker channel: {}", e);
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) -> WorkerExit {
        if self.default_config_id.is_none() {
            if let Err(e) = self.prepare().await {
                error!("Cannot accept scan requests: {}", e);
                self.close().await;
                return WorkerExit::Failed;
            }
        }

        let mut deliveries = match self.broker.consume(&self.settings.queue, self.settings.durable).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("Consuming queue {} failed: {}", self.settings.queue, e);
                self.close().await;
                return WorkerExit::Failed;
            }
        };
        info!("Waiting for requests on queue {}", self.settings.queue);

        let exit = loop {
            let delivery = tokio::select! {
                () = cancel.cancelled() => break WorkerExit::Interrupted,
                delivery = deliveries.next() => delivery,
            };

            match delivery {
                Some(Ok(delivery)) => {
                    if let Err(e) = self.handle(&delivery).await {
                        error!("Acknowledging message {} failed: {}", delivery.delivery_tag, e);
                        break WorkerExit::Failed;
                    }
                }
                Some(Err(e)) if e.is_session_fatal() => {
                    error!("Broker channel lost: {}", e);
                    break WorkerExit::Failed;
                }
                Some(Err(e)) => warn!("Broken delivery: {}", e),
                None => {
                    info!("Queue {} closed", self.settings.queue);
                    break WorkerExit::Completed;
                }
            }
        };

        drop(deliveries);
        self.close().await;
        exit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vasbridge_transport::events::CONTENT_TYPE;
    use vasbridge_transport::testing::{MemoryBroker, MemoryScanSource};
    use vasbridge_transport::{TaskInfo, TaskInformation};

    fn settings(allow_delete_event: bool) -> ConsumerSettings {
        ConsumerSettings {
            queue: "vasbridge-scan".into(),
            durable: true,
            allow_delete_event,
            default_config: "Full and fast".into(),
            name_prefix: "bridge".into(),
        }
    }

    fn info(ip: &str, timestamp: i64) -> TaskInformation {
        TaskInformation {
            name_prefix: "vasbridge".into(),
            ip: ip.into(),
            timestamp,
        }
    }

    fn scanner() -> Arc<MemoryScanSource> {
        Arc::new(
            MemoryScanSource::new("scanner")
                .with_config("cfg-fast", "Full and fast")
                .with_config("cfg-deep", "Full and very deep"),
        )
    }

    fn delivery(tag: u64, event: &ControlEvent) -> Delivery {
        Delivery {
            delivery_tag: tag,
            content_type: Some(CONTENT_TYPE.into()),
            body: event.encode().unwrap(),
        }
    }

    async fn consumer(source: &Arc<MemoryScanSource>, broker: &Arc<MemoryBroker>, allow: bool) -> EventConsumer {
        let mut consumer = EventConsumer::new(source.clone(), broker.clone(), settings(allow));
        consumer.prepare().await.unwrap();
        consumer
    }

    #[tokio::test]
    async fn test_missing_default_config() {
        let source = Arc::new(MemoryScanSource::new("scanner").with_config("cfg-deep", "Full and very deep"));
        let mut consumer = EventConsumer::new(source, Arc::new(MemoryBroker::new()), settings(false));
        let err = consumer.prepare().await.unwrap_err();
        assert!(matches!(err, Error::DefaultScanConfigMissing { .. }));
        assert!(err.is_config_error());
    }

    #[tokio::test]
    async fn test_scan_request_creates_and_starts_task() {
        let source = scanner();
        let broker = Arc::new(MemoryBroker::new());
        let consumer = consumer(&source, &broker, false).await;

        let event = ControlEvent::Scan(ScanRequest {
            info: info("10.0.0.5", 1_371_000_000_000),
            config_name: "Full and very deep".into(),
        });
        let outcome = consumer.handle(&delivery(7, &event)).await.unwrap();
        assert!(matches!(outcome, Outcome::Scanned { .. }));

        assert_eq!(
            source.calls(),
            vec![
                "create_target:vasbridge-10.0.0.5:10.0.0.5",
                "create_task:vasbridge-10.0.0.5-1371000000000:cfg-deep:target-1",
                "start_task:task-2",
            ]
        );
        assert_eq!(broker.acks(), vec![7]);
    }

    #[tokio::test]
    async fn test_scan_request_reuses_target_and_default_config() {
        let source = Arc::new(
            MemoryScanSource::new("scanner")
                .with_config("cfg-fast", "Full and fast")
                .with_target("tgt-9", "vasbridge-10.0.0.5"),
        );
        let broker = Arc::new(MemoryBroker::new());
        let consumer = consumer(&source, &broker, false).await;

        let event = ControlEvent::Scan(ScanRequest {
            info: info("10.0.0.5", 42),
            config_name: "No such config".into(),
        });
        consumer.handle(&delivery(1, &event)).await.unwrap();
        assert_eq!(
            source.calls()[0],
            "create_task:vasbridge-10.0.0.5-42:cfg-fast:tgt-9"
        );
    }

    #[tokio::test]
    async fn test_delete_request_deletes_twice() {
        let source = scanner();
        source.add_task(TaskInfo::new("t-1", "vasbridge-10.0.0.5-42"));
        let broker = Arc::new(MemoryBroker::new());
        let consumer = consumer(&source, &broker, true).await;

        let event = ControlEvent::DeleteTasks(DeleteTaskRequest {
            task_infos: vec![info("10.0.0.5", 42), info("10.0.0.6", 43)],
        });
        let outcome = consumer.handle(&delivery(3, &event)).await.unwrap();
        assert_eq!(outcome, Outcome::Deleted(1));
        assert_eq!(source.calls(), vec!["delete_task:t-1", "delete_task:t-1"]);
        assert_eq!(broker.acks(), vec![3]);
    }

    #[tokio::test]
    async fn test_requests_without_prefix_use_configured_prefix() {
        let source = scanner();
        source.add_task(TaskInfo::new("t-1", "bridge-10.0.0.6-43"));
        let broker = Arc::new(MemoryBroker::new());
        let consumer = consumer(&source, &broker, true).await;

        let bare = |ip: &str, timestamp| TaskInformation {
            name_prefix: String::new(),
            ip: ip.into(),
            timestamp,
        };
        let scan = ControlEvent::Scan(ScanRequest {
            info: bare("10.0.0.5", 42),
            config_name: "Full and fast".into(),
        });
        consumer.handle(&delivery(1, &scan)).await.unwrap();
        let delete = ControlEvent::DeleteTasks(DeleteTaskRequest {
            task_infos: vec![bare("10.0.0.6", 43)],
        });
        assert_eq!(consumer.handle(&delivery(2, &delete)).await.unwrap(), Outcome::Deleted(1));

        let calls = source.calls();
        assert_eq!(calls[0], "create_target:bridge-10.0.0.5:10.0.0.5");
        assert!(calls[1].starts_with("create_task:bridge-10.0.0.5-42:cfg-fast:"));
        assert_eq!(calls[3..].to_vec(), vec!["delete_task:t-1", "delete_task:t-1"]);
    }

    #[tokio::test]
    async fn test_delete_unknown_task_is_noop() {
        let source = scanner();
        let broker = Arc::new(MemoryBroker::new());
        let consumer = consumer(&source, &broker, true).await;

        let event = ControlEvent::DeleteTasks(DeleteTaskRequest {
            task_infos: vec![info("10.0.0.5", 42)],
        });
        assert_eq!(consumer.handle(&delivery(4, &event)).await.unwrap(), Outcome::Deleted(0));
        assert!(source.calls().is_empty());
        assert_eq!(broker.acks(), vec![4]);
    }

    #[tokio::test]
    async fn test_delete_disabled() {
        let source = scanner();
        source.add_task(TaskInfo::new("t-1", "vasbridge-10.0.0.5-42"));
        let broker = Arc::new(MemoryBroker::new());
        let consumer = consumer(&source, &broker, false).await;

        let event = ControlEvent::DeleteTasks(DeleteTaskRequest {
            task_infos: vec![info("10.0.0.5", 42)],
        });
        assert_eq!(consumer.handle(&delivery(5, &event)).await.unwrap(), Outcome::DeleteIgnored);
        assert!(source.calls().is_empty());
        assert_eq!(broker.acks(), vec![5]);
    }

    #[tokio::test]
    async fn test_bad_messages_are_acked_and_dropped() {
        let source = scanner();
        let broker = Arc::new(MemoryBroker::new());
        let consumer = consumer(&source, &broker, true).await;

        let wrong_type = Delivery {
            delivery_tag: 1,
            content_type: Some("application/x-java-serialized-object".into()),
            body: b"{}".to_vec(),
        };
        let garbage = Delivery {
            delivery_tag: 2,
            content_type: Some(CONTENT_TYPE.into()),
            body: b"not json".to_vec(),
        };
        assert_eq!(consumer.handle(&wrong_type).await.unwrap(), Outcome::Dropped);
        assert_eq!(consumer.handle(&garbage).await.unwrap(), Outcome::Dropped);
        assert_eq!(broker.acks(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_run_consumes_until_queue_ends() {
        let source = scanner();
        let broker = Arc::new(MemoryBroker::new());
        let event = ControlEvent::Scan(ScanRequest {
            info: info("10.0.0.5", 42),
            config_name: "Full and fast".into(),
        });
        let tag = broker.push_delivery(Some(CONTENT_TYPE), &event.encode().unwrap());
        broker.push_delivery(None, b"junk");
        broker.finish_deliveries();

        let consumer = EventConsumer::new(source.clone(), broker.clone(), settings(false));
        assert_eq!(consumer.run(CancellationToken::new()).await, WorkerExit::Completed);

        assert_eq!(broker.queues(), vec![("vasbridge-scan".to_string(), true)]);
        assert_eq!(broker.acks(), vec![tag, tag + 1]);
        assert!(source.calls().iter().any(|c| c.starts_with("start_task:")));
        assert!(broker.is_closed());
    }
}
