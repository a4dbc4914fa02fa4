//! Prometheus metrics for the consumer manager
//!
//! Provides observability into deliveries, acknowledgements and reconnects.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;
use tracing::{info, warn};

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Initialize Prometheus metrics
///
/// Call this once at startup. Subsequent calls are no-ops. Returns false when
/// another recorder was already installed.
pub fn init_metrics() -> bool {
    let result = PROMETHEUS_HANDLE.get_or_try_init(|| {
        let handle = PrometheusBuilder::new().install_recorder()?;
        info!("Prometheus metrics initialized");
        Ok::<_, metrics_exporter_prometheus::BuildError>(handle)
    });

    match result {
        Ok(_) => true,
        Err(e) => {
            warn!(error = %e, "Failed to install Prometheus recorder");
            false
        }
    }
}

/// Get the Prometheus handle for rendering metrics
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Render metrics in Prometheus format
pub fn render_metrics() -> String {
    prometheus_handle()
        .map(|h| h.render())
        .unwrap_or_default()
}

/// Consumer metrics helper, labelled by queue
#[derive(Debug, Clone)]
pub struct ConsumerMetrics {
    queue: String,
}

impl ConsumerMetrics {
    /// Create new ConsumerMetrics
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
        }
    }

    /// Record a delivery handed to a worker
    pub fn delivery_received(&self) {
        counter!(
            "amqp_worker_deliveries_received_total",
            "queue" => self.queue.clone()
        )
        .increment(1);
    }

    /// Record a delivery processed successfully
    pub fn delivery_acked(&self, duration: Duration) {
        counter!(
            "amqp_worker_deliveries_processed_total",
            "queue" => self.queue.clone(),
            "status" => "acked"
        )
        .increment(1);

        histogram!(
            "amqp_worker_processing_duration_seconds",
            "queue" => self.queue.clone()
        )
        .record(duration.as_secs_f64());
    }

    /// Record a delivery rejected after a processing failure
    pub fn delivery_rejected(&self, category: &str, requeue: bool) {
        counter!(
            "amqp_worker_deliveries_processed_total",
            "queue" => self.queue.clone(),
            "status" => if requeue { "requeued" } else { "rejected" }
        )
        .increment(1);

        counter!(
            "amqp_worker_processing_errors_total",
            "queue" => self.queue.clone(),
            "category" => category.to_string()
        )
        .increment(1);
    }

    /// Record a new broker connection
    pub fn connection_opened(&self) {
        counter!(
            "amqp_worker_connections_opened_total",
            "queue" => self.queue.clone()
        )
        .increment(1);
    }

    /// Record a failed connect attempt
    pub fn connect_failed(&self) {
        counter!(
            "amqp_worker_connect_failures_total",
            "queue" => self.queue.clone()
        )
        .increment(1);
    }

    /// Record a worker losing its connection
    pub fn connection_lost(&self) {
        counter!(
            "amqp_worker_connections_lost_total",
            "queue" => self.queue.clone()
        )
        .increment(1);
    }

    /// Record one reconnect pass
    pub fn reconnect_attempt(&self, succeeded: bool) {
        counter!(
            "amqp_worker_reconnect_attempts_total",
            "queue" => self.queue.clone(),
            "result" => if succeeded { "success" } else { "failure" }
        )
        .increment(1);
    }

    /// Update the number of consuming workers
    pub fn active_workers(&self, count: usize) {
        gauge!(
            "amqp_worker_active_workers",
            "queue" => self.queue.clone()
        )
        .set(count as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = ConsumerMetrics::new("orders");
        assert_eq!(metrics.queue, "orders");

        // recording without an installed recorder is a no-op
        metrics.delivery_received();
        metrics.delivery_rejected("permanent", false);
        metrics.active_workers(3);
    }

    #[test]
    fn test_render_without_recorder() {
        if prometheus_handle().is_none() {
            assert!(render_metrics().is_empty());
        }
    }
}
