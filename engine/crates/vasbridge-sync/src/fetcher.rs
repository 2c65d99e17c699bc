//! Poll loop over the scanner's tasks

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vasbridge_core::{Report, Vulnerability};
use vasbridge_transport::{ScanSource, TaskInfo};

use crate::filter::VulnerabilityFilter;
use crate::lifecycle::{wait_or_cancel, WorkerExit};

/// Receiving end of a sink's report queue
pub type ReportReceiver = mpsc::UnboundedReceiver<Report>;

struct Sink {
    name: String,
    queue: mpsc::UnboundedSender<Report>,
}

/// Polls every task's latest report and hands it to each sink
///
/// Sink queues are unbounded so a slow sink never delays a poll.
pub struct Fetcher {
    source: Arc<dyn ScanSource>,
    interval: Duration,
    filter: Option<Arc<dyn VulnerabilityFilter>>,
    sinks: Vec<Sink>,
}

impl Fetcher {
    pub fn new(source: Arc<dyn ScanSource>, interval: Duration) -> Self {
        Self {
            source,
            interval,
            filter: None,
            sinks: Vec::new(),
        }
    }

    pub fn with_filter(mut self, filter: Arc<dyn VulnerabilityFilter>) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Register a sink and return its queue
    pub fn subscribe(&mut self, name: impl Into<String>) -> ReportReceiver {
        let (queue, reports) = mpsc::unbounded_channel();
        self.sinks.push(Sink {
            name: name.into(),
            queue,
        });
        reports
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    async fn keep(&self, v: &Vulnerability) -> bool {
        let Some(filter) = &self.filter else {
            return true;
        };
        match filter.filter(v).await {
            Ok(keep) => keep,
            Err(e) => {
                warn!("Filter {} failed for {} on {}, keeping it: {}", filter.name(), v.id, v.host, e);
                true
            }
        }
    }

    async fn apply_filter(&self, report: Report) -> Report {
        if self.filter.is_none() {
            return report;
        }
        let total = report.len();
        let mut kept = Vec::with_capacity(total);
        for v in report.vulnerabilities {
            if self.keep(&v).await {
                kept.push(v);
            }
        }
        if kept.len() < total {
            debug!("Filter dropped {} of {} results of task {}", total - kept.len(), total, report.task_id);
        }
        Report::new(report.task_id, kept)
    }

    fn dispatch(&self, report: &Report) {
        for sink in &self.sinks {
            if sink.queue.send(report.clone()).is_err() {
                warn!("Sink {} is gone, report of task {} not delivered", sink.name, report.task_id);
            }
        }
    }

    /// One poll cycle; returns the number of reports dispatched
    ///
    /// Failures of single tasks are logged and skipped. A scanner outage
    /// yields no reports, which leaves every sink cache untouched.
    pub async fn poll_once(&self) -> usize {
        let tasks = match self.source.list_tasks().await {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!("Listing tasks on {} failed: {}", self.source.host(), e);
                return 0;
            }
        };

        let with_reports: Vec<TaskInfo> = tasks.into_iter().filter(|t| t.last_report_id.is_some()).collect();
        debug!("{} tasks with reports", with_reports.len());

        let mut dispatched = 0;
        for (task_id, result) in self.source.get_reports(&with_reports).await {
            match result {
                Ok(Some(report)) => {
                    let report = self.apply_filter(report).await;
                    debug!("Report of task {} with {} results", task_id, report.len());
                    self.dispatch(&report);
                    dispatched += 1;
                }
                Ok(None) => debug!("Task {} has no report yet", task_id),
                Err(e) => warn!("Fetching report of task {} failed: {}", task_id, e),
            }
        }
        dispatched
    }

    pub async fn run(self, cancel: CancellationToken) -> WorkerExit {
        info!(
            "Polling {} every {}s for {} sinks",
            self.source.host(),
            self.interval.as_secs(),
            self.sinks.len()
        );
        loop {
            if cancel.is_cancelled() {
                break;
            }
            self.poll_once().await;
            if wait_or_cancel(&cancel, self.interval).await {
                break;
            }
        }
        WorkerExit::Interrupted
    }
}
