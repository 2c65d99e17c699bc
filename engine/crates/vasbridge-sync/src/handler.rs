//! MAP sink: one publish request per report

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vasbridge_convert::Converter;
use vasbridge_core::{Report, Result};
use vasbridge_transport::ifmap::PublishRequest;
use vasbridge_transport::MapChannel;

use crate::cache::VulnerabilityCache;
use crate::fetcher::ReportReceiver;
use crate::lifecycle::WorkerExit;

/// Diffs reports against its own cache and publishes the change to the
/// MAP server
///
/// The session is shared with the keepalive, which also ends it.
pub struct MapHandler {
    channel: Arc<dyn MapChannel>,
    converter: Box<dyn Converter>,
    cache: VulnerabilityCache,
    reports: ReportReceiver,
}

impl MapHandler {
    pub fn new(channel: Arc<dyn MapChannel>, converter: Box<dyn Converter>, reports: ReportReceiver) -> Self {
        Self {
            channel,
            converter,
            cache: VulnerabilityCache::new(),
            reports,
        }
    }

    pub fn cache(&self) -> &VulnerabilityCache {
        &self.cache
    }

    /// Publish what changed in `report`; returns the number of elements sent
    ///
    /// The cache is committed only after the server accepted the request.
    pub async fn handle(&mut self, report: &Report) -> Result<usize> {
        let incoming = report.vulnerability_set();
        let diff = self.cache.diff(&report.task_id, &incoming);
        if diff.is_empty() {
            debug!("No change in task {}", report.task_id);
            return Ok(0);
        }

        let deletes = self.converter.to_deletes(&diff.outdated).await?;
        let updates = self.converter.to_updates(&diff.news).await?;
        let request = PublishRequest::from_parts(deletes, updates);

        if !request.is_empty() {
            self.channel.publish(&request).await?;
        }
        self.converter.commit(&diff.news, &diff.outdated);
        self.cache.commit(&report.task_id, &diff);

        info!(
            "Task {}: {} new, {} outdated, {} elements published",
            report.task_id,
            diff.news.len(),
            diff.outdated.len(),
            request.len()
        );
        Ok(request.len())
    }

    /// Handle every report already queued, stopping at a session-fatal error
    pub async fn drain(&mut self) -> Result<usize> {
        let mut published = 0;
        while let Ok(report) = self.reports.try_recv() {
            match self.handle(&report).await {
                Ok(count) => published += count,
                Err(e) if e.is_session_fatal() => return Err(e),
                Err(e) => warn!("Skipping report of task {}: {}", report.task_id, e),
            }
        }
        Ok(published)
    }

    pub async fn run(mut self, cancel: CancellationToken) -> WorkerExit {
        info!("Publishing to MAP with the {} converter", self.converter.name());
        loop {
            let report = tokio::select! {
                () = cancel.cancelled() => return WorkerExit::Interrupted,
                report = self.reports.recv() => match report {
                    Some(report) => report,
                    None => return WorkerExit::Completed,
                },
            };

            match self.handle(&report).await {
                Ok(_) => {}
                Err(e) if e.is_session_fatal() => {
                    error!("MAP session lost while publishing task {}: {}", report.task_id, e);
                    return WorkerExit::Failed;
                }
                Err(e) => warn!("Skipping report of task {} [{}]: {}", report.task_id, e.code(), e),
            }
        }
    }
}
