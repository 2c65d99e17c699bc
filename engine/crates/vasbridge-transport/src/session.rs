//! One MAP session shared by the handler and the keepalive loop
//!
//! IF-MAP does not allow pipelining requests from one publisher, so every
//! call goes through a single async mutex.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use vasbridge_core::Result;

use crate::ifmap::{Identifier, PublishRequest};
use crate::traits::MapChannel;

/// Cloneable handle that serializes all calls on the wrapped channel
pub struct SharedSession<C: MapChannel> {
    inner: Arc<C>,
    lock: Arc<Mutex<()>>,
}

impl<C: MapChannel> SharedSession<C> {
    pub fn new(channel: C) -> Self {
        Self::from_arc(Arc::new(channel))
    }

    pub fn from_arc(channel: Arc<C>) -> Self {
        Self {
            inner: channel,
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// The wrapped channel, bypassing the lock
    pub fn channel(&self) -> &Arc<C> {
        &self.inner
    }
}

impl<C: MapChannel> Clone for SharedSession<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            lock: Arc::clone(&self.lock),
        }
    }
}

#[async_trait]
impl<C: MapChannel> MapChannel for SharedSession<C> {
    async fn new_session(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.inner.new_session().await
    }

    async fn renew_session(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.inner.renew_session().await
    }

    async fn end_session(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.inner.end_session().await
    }

    async fn purge_publisher(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.inner.purge_publisher().await
    }

    async fn publish(&self, request: &PublishRequest) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.inner.publish(request).await
    }

    async fn search_device(&self, ip: &Identifier) -> Result<Option<Identifier>> {
        let _guard = self.lock.lock().await;
        self.inner.search_device(ip).await
    }

    // Assigned once by new_session; no request is sent
    fn publisher_id(&self) -> Option<String> {
        self.inner.publisher_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Records the highest number of calls in flight at once
    #[derive(Default)]
    struct Recorder {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
    }

    impl Recorder {
        async fn enter(&self) {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl MapChannel for Recorder {
        async fn new_session(&self) -> Result<()> {
            self.enter().await;
            Ok(())
        }
        async fn renew_session(&self) -> Result<()> {
            self.enter().await;
            Ok(())
        }
        async fn end_session(&self) -> Result<()> {
            self.enter().await;
            Ok(())
        }
        async fn purge_publisher(&self) -> Result<()> {
            self.enter().await;
            Ok(())
        }
        async fn publish(&self, _request: &PublishRequest) -> Result<()> {
            self.enter().await;
            Ok(())
        }
        async fn search_device(&self, _ip: &Identifier) -> Result<Option<Identifier>> {
            self.enter().await;
            Ok(None)
        }
        fn publisher_id(&self) -> Option<String> {
            Some("recorder".into())
        }
    }

    #[tokio::test]
    async fn test_calls_never_overlap() {
        let session = SharedSession::new(Recorder::default());

        let mut handles = Vec::new();
        for i in 0..8 {
            let session = session.clone();
            handles.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    session.renew_session().await
                } else {
                    session.publish(&PublishRequest::new()).await
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let recorder = session.channel();
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 8);
        assert_eq!(recorder.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_publisher_id_passes_through() {
        let session = SharedSession::new(Recorder::default());
        assert_eq!(session.publisher_id().as_deref(), Some("recorder"));
    }
}
