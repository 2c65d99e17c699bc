//! Worker registry and cooperative shutdown
//!
//! Every long-running loop is spawned through [`Lifecycle`]. Workers get
//! a child of the root cancellation token and must return once it fires,
//! after releasing their session or channel.
//!
//! Last-stage workers own something the others still use, such as the MAP
//! session. Their token fires only once every regular worker has ended.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// How a worker loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Its input ended
    Completed,
    /// Cancelled from outside
    Interrupted,
    /// Stopped on an error it cannot recover from
    Failed,
}

impl WorkerExit {
    pub fn is_failure(&self) -> bool {
        matches!(self, WorkerExit::Failed)
    }
}

/// Sleep for `interval`; `true` if cancelled first
pub async fn wait_or_cancel(cancel: &CancellationToken, interval: Duration) -> bool {
    tokio::select! {
        () = cancel.cancelled() => true,
        () = tokio::time::sleep(interval) => false,
    }
}

/// Exit of every worker after shutdown
#[derive(Debug, Clone, Default)]
pub struct ShutdownSummary {
    pub exits: Vec<(String, WorkerExit)>,
}

impl ShutdownSummary {
    pub fn any_failed(&self) -> bool {
        self.exits.iter().any(|(_, exit)| exit.is_failure())
    }

    pub fn failed(&self) -> impl Iterator<Item = &str> {
        self.exits
            .iter()
            .filter(|(_, exit)| exit.is_failure())
            .map(|(name, _)| name.as_str())
    }
}

/// Registry of running workers
pub struct Lifecycle {
    root: CancellationToken,
    closing: CancellationToken,
    workers: JoinSet<(String, WorkerExit)>,
    last: JoinSet<(String, WorkerExit)>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

async fn supervise<F>(name: String, worker: F) -> (String, WorkerExit)
where
    F: Future<Output = WorkerExit> + Send + 'static,
{
    let exit = match tokio::spawn(worker).await {
        Ok(exit) => exit,
        Err(e) => {
            error!(worker = %name, "Worker panicked: {}", e);
            WorkerExit::Failed
        }
    };
    match exit {
        WorkerExit::Failed => warn!(worker = %name, "Worker failed"),
        other => info!(worker = %name, exit = ?other, "Worker stopped"),
    }
    (name, exit)
}

fn joined(result: std::result::Result<(String, WorkerExit), tokio::task::JoinError>) -> (String, WorkerExit) {
    result.unwrap_or_else(|e| {
        error!("Worker supervisor task failed: {}", e);
        (String::from("unknown"), WorkerExit::Failed)
    })
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            root: CancellationToken::new(),
            closing: CancellationToken::new(),
            workers: JoinSet::new(),
            last: JoinSet::new(),
        }
    }

    /// Token for a worker; fires on [`Lifecycle::interrupt_all`]
    pub fn token(&self) -> CancellationToken {
        self.root.child_token()
    }

    /// Token for a last-stage worker; fires once the regular workers are joined
    pub fn closing_token(&self) -> CancellationToken {
        self.closing.child_token()
    }

    /// Register and start a worker. A panicking worker counts as failed.
    pub fn spawn<F>(&mut self, name: impl Into<String>, worker: F)
    where
        F: Future<Output = WorkerExit> + Send + 'static,
    {
        let name = name.into();
        info!(worker = %name, "Worker started");
        self.workers.spawn(supervise(name, worker));
    }

    /// Register a worker that is stopped after all regular workers
    pub fn spawn_last<F>(&mut self, name: impl Into<String>, worker: F)
    where
        F: Future<Output = WorkerExit> + Send + 'static,
    {
        let name = name.into();
        info!(worker = %name, "Worker started, stops last");
        self.last.spawn(supervise(name, worker));
    }

    pub fn len(&self) -> usize {
        self.workers.len() + self.last.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty() && self.last.is_empty()
    }

    /// Cancel the regular workers; last-stage workers follow in [`Lifecycle::join_all`]
    pub fn interrupt_all(&self) {
        self.root.cancel();
    }

    pub fn is_interrupted(&self) -> bool {
        self.root.is_cancelled()
    }

    /// Wait for the next worker of either stage to end
    pub async fn join_next(&mut self) -> Option<(String, WorkerExit)> {
        tokio::select! {
            Some(done) = self.workers.join_next() => Some(joined(done)),
            Some(done) = self.last.join_next() => Some(joined(done)),
            else => None,
        }
    }

    /// Wait for every regular worker, then stop and wait for the last stage
    pub async fn join_all(&mut self) -> Vec<(String, WorkerExit)> {
        let mut exits = Vec::with_capacity(self.len());
        while let Some(done) = self.workers.join_next().await {
            exits.push(joined(done));
        }
        self.closing.cancel();
        while let Some(done) = self.last.join_next().await {
            exits.push(joined(done));
        }
        exits
    }

    /// Run until `shutdown` resolves or any worker ends, then interrupt
    /// the others and wait for them
    pub async fn run_until_shutdown<F>(&mut self, shutdown: F) -> ShutdownSummary
    where
        F: Future<Output = ()>,
    {
        let mut summary = ShutdownSummary::default();

        if !self.is_empty() {
            tokio::select! {
                () = shutdown => info!("Shutdown requested"),
                Some(first) = self.join_next() => {
                    info!(worker = %first.0, "Worker ended, shutting down the others");
                    summary.exits.push(first);
                }
            }
        }

        self.interrupt_all();
        summary.exits.extend(self.join_all().await);
        summary
    }
}
