//! Broker sink: one JSON event per changed vulnerability

use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vasbridge_core::{Report, Result, Vulnerability};
use vasbridge_transport::events::CONTENT_TYPE;
use vasbridge_transport::{BrokerChannel, VulnerabilityEvent};

use crate::cache::VulnerabilityCache;
use crate::fetcher::ReportReceiver;
use crate::lifecycle::WorkerExit;

/// Emits `new_event = true` for found and `false` for vanished results
///
/// Every sent event is committed on its own, so after a failure in the
/// middle of a report only the unsent rest is derived again.
pub struct EventPublisher {
    broker: Arc<dyn BrokerChannel>,
    exchange: String,
    publisher_id: String,
    cache: VulnerabilityCache,
    reports: ReportReceiver,
}

impl EventPublisher {
    pub fn new(
        broker: Arc<dyn BrokerChannel>,
        exchange: impl Into<String>,
        publisher_id: impl Into<String>,
        reports: ReportReceiver,
    ) -> Self {
        Self {
            broker,
            exchange: exchange.into(),
            publisher_id: publisher_id.into(),
            cache: VulnerabilityCache::new(),
            reports,
        }
    }

    pub fn cache(&self) -> &VulnerabilityCache {
        &self.cache
    }

    pub async fn declare(&self) -> Result<()> {
        self.broker.declare_exchange(&self.exchange).await
    }

    async fn send(&self, v: &Vulnerability, new_event: bool) -> Result<()> {
        let payload = VulnerabilityEvent::new(v, self.publisher_id.as_str(), new_event, Utc::now()).encode()?;
        self.broker.publish(&self.exchange, CONTENT_TYPE, &payload).await
    }

    /// Send the change in `report`; returns the number of events sent
    pub async fn handle(&mut self, report: &Report) -> Result<usize> {
        let task_id = report.task_id.as_str();
        let diff = self.cache.diff(task_id, &report.vulnerability_set());
        if diff.is_empty() {
            debug!("No change in task {}", task_id);
            return Ok(0);
        }

        let mut news: Vec<&Vulnerability> = diff.news.iter().collect();
        news.sort_by(|a, b| (&a.host, &a.id).cmp(&(&b.host, &b.id)));
        let mut outdated: Vec<&Vulnerability> = diff.outdated.iter().collect();
        outdated.sort_by(|a, b| (&a.host, &a.id).cmp(&(&b.host, &b.id)));

        let mut sent = 0;
        for v in news {
            self.send(v, true).await?;
            self.cache.add_to_task(task_id, [v]);
            sent += 1;
        }
        for v in outdated {
            self.send(v, false).await?;
            self.cache.remove_from_task(task_id, [v]);
            sent += 1;
        }

        info!("Task {}: {} events sent to {}", task_id, sent, self.exchange);
        Ok(sent)
    }

    /// Handle every report already queued, stopping at a fatal error
    pub async fn drain(&mut self) -> Result<usize> {
        let mut sent = 0;
        while let Ok(report) = self.reports.try_recv() {
            match self.handle(&report).await {
                Ok(count) => sent += count,
                Err(e) if e.is_session_fatal() => return Err(e),
                Err(e) => warn!("Skipping report of task {}: {}", report.task_id, e),
            }
        }
        Ok(sent)
    }

    async fn close(&self) {
        if let Err(e) = self.broker.close().await {
            debug!("Closing broker channel: {}", e);
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) -> WorkerExit {
        if let Err(e) = self.declare().await {
            error!("Declaring exchange {} failed: {}", self.exchange, e);
            self.close().await;
            return WorkerExit::Failed;
        }
        info!("Publishing events to exchange {}", self.exchange);

        let exit = loop {
            let report = tokio::select! {
                () = cancel.cancelled() => break WorkerExit::Interrupted,
                report = self.reports.recv() => match report {
                    Some(report) => report,
                    None => break WorkerExit::Completed,
                },
            };

            match self.handle(&report).await {
                Ok(_) => {}
                Err(e) if e.is_session_fatal() => {
                    error!("Broker channel lost while sending task {}: {}", report.task_id, e);
                    break WorkerExit::Failed;
                }
                Err(e) => warn!("Skipping report of task {} [{}]: {}", report.task_id, e.code(), e),
            }
        };

        self.close().await;
        exit
    }
}
