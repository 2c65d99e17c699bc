//! Keeps the MAP session alive and ends it on shutdown

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vasbridge_transport::MapChannel;

use crate::lifecycle::{wait_or_cancel, WorkerExit};

/// Renews the session every `interval`
///
/// The interval must stay below the server's session timeout; this is
/// not checked here.
pub struct Keepalive {
    session: Arc<dyn MapChannel>,
    interval: Duration,
}

impl Keepalive {
    pub fn new(session: Arc<dyn MapChannel>, interval: Duration) -> Self {
        Self { session, interval }
    }

    async fn end_session(&self) {
        match self.session.end_session().await {
            Ok(()) => info!("MAP session ended"),
            Err(e) => warn!("Ending MAP session failed: {}", e),
        }
    }

    pub async fn run(self, cancel: CancellationToken) -> WorkerExit {
        loop {
            if let Err(e) = self.session.renew_session().await {
                error!("Renewing MAP session failed: {}", e);
                self.end_session().await;
                return WorkerExit::Failed;
            }
            debug!("MAP session renewed");

            if wait_or_cancel(&cancel, self.interval).await {
                break;
            }
        }
        self.end_session().await;
        WorkerExit::Interrupted
    }
}
