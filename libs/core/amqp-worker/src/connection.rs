//! Shared broker connection owned by the consumer manager.

use crate::broker::{Broker, BrokerConnection};
use crate::error::ConsumerError;
use crate::metrics::ConsumerMetrics;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

/// Holds at most one live connection to the broker.
///
/// Every path that opens, replaces or closes the connection goes through the
/// same mutex, so two workers racing on a dead connection never open two new
/// ones.
pub struct ConnectionHandle<B: Broker> {
    broker: Arc<B>,
    current: Mutex<Option<Arc<B::Connection>>>,
    close_timeout: Duration,
    metrics: ConsumerMetrics,
}

impl<B: Broker> ConnectionHandle<B> {
    /// Create a closed handle.
    pub fn new(broker: Arc<B>, close_timeout: Duration, metrics: ConsumerMetrics) -> Self {
        Self {
            broker,
            current: Mutex::new(None),
            close_timeout,
            metrics,
        }
    }

    /// Return the live connection, opening a new one if there is none.
    ///
    /// A connection that is no longer open is closed (bounded by the close
    /// timeout) before its replacement is opened.
    pub async fn acquire(&self) -> Result<Arc<B::Connection>, ConsumerError> {
        let mut current = self.current.lock().await;

        if let Some(connection) = current.as_ref() {
            if connection.is_open() {
                return Ok(Arc::clone(connection));
            }
            debug!("The existing connection is closed");
        }

        if let Some(stale) = current.take() {
            close_with_timeout(stale.as_ref(), self.close_timeout).await;
        }

        trace!("Creating connection...");
        let connection = match self.broker.connect().await {
            Ok(connection) => Arc::new(connection),
            Err(e) => {
                self.metrics.connect_failed();
                return Err(e);
            }
        };
        self.metrics.connection_opened();
        debug!("Created connection");

        *current = Some(Arc::clone(&connection));
        Ok(connection)
    }

    /// Close the connection, waiting at most `timeout`.
    ///
    /// Never fails: a close error or timeout is logged and the connection is
    /// dropped anyway, so the next [`acquire`](Self::acquire) opens a fresh one.
    pub async fn close(&self, timeout: Duration) {
        let mut current = self.current.lock().await;
        if let Some(connection) = current.take() {
            debug!(timeout_ms = timeout.as_millis() as u64, "Closing connection");
            close_with_timeout(connection.as_ref(), timeout).await;
        }
    }

    /// Non-blocking liveness probe.
    ///
    /// Reports `false` while another task holds the handle (opening or closing).
    pub fn is_open(&self) -> bool {
        self.current
            .try_lock()
            .map(|current| current.as_ref().is_some_and(|c| c.is_open()))
            .unwrap_or(false)
    }
}

async fn close_with_timeout<C: BrokerConnection>(connection: &C, timeout: Duration) {
    if !connection.is_open() {
        return;
    }
    match tokio::time::timeout(timeout, connection.close()).await {
        Ok(Ok(())) => debug!("Connection closed"),
        Ok(Err(e)) => warn!(error = %e, "Error closing connection"),
        Err(_) => warn!(
            timeout_ms = timeout.as_millis() as u64,
            "Timed out closing connection"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBroker;

    fn handle(broker: &MemoryBroker) -> ConnectionHandle<MemoryBroker> {
        ConnectionHandle::new(
            Arc::new(broker.clone()),
            Duration::from_secs(1),
            ConsumerMetrics::new("test"),
        )
    }

    #[tokio::test]
    async fn test_acquire_reuses_open_connection() {
        let broker = MemoryBroker::new();
        let handle = handle(&broker);

        let first = handle.acquire().await.unwrap();
        let second = handle.acquire().await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(broker.connect_attempts(), 1);
        assert!(handle.is_open());
    }

    #[tokio::test]
    async fn test_acquire_replaces_dead_connection() {
        let broker = MemoryBroker::new();
        let handle = handle(&broker);

        let first = handle.acquire().await.unwrap();
        broker.drop_connections();
        assert!(!handle.is_open());

        let second = handle.acquire().await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(second.is_open());
        assert_eq!(broker.open_connections(), 1);
    }

    #[tokio::test]
    async fn test_acquire_fails_when_unreachable() {
        let broker = MemoryBroker::new();
        broker.set_reachable(false);
        let handle = handle(&broker);

        let err = handle.acquire().await.unwrap_err();
        assert!(matches!(err, ConsumerError::Connect(_)));
        assert!(!handle.is_open());
    }

    #[tokio::test]
    async fn test_concurrent_acquire_opens_one_connection() {
        let broker = MemoryBroker::new();
        let handle = Arc::new(handle(&broker));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let handle = Arc::clone(&handle);
                tokio::spawn(async move { handle.acquire().await.map(|_| ()) })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(broker.connect_attempts(), 1);
        assert_eq!(broker.open_connections(), 1);
    }

    #[tokio::test]
    async fn test_close_then_acquire_opens_fresh_connection() {
        let broker = MemoryBroker::new();
        let handle = handle(&broker);

        handle.acquire().await.unwrap();
        handle.close(Duration::from_millis(100)).await;
        assert_eq!(broker.open_connections(), 0);

        handle.acquire().await.unwrap();
        assert_eq!(broker.connect_attempts(), 2);

        // closing an already closed handle is a no-op
        handle.close(Duration::from_millis(100)).await;
        handle.close(Duration::from_millis(100)).await;
    }
}
