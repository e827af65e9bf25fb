//! Prometheus metrics for consumers
//!
//! Provides observability into stream attempts, processing and coordination.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;
use tracing::{info, warn};

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Initialize Prometheus metrics
///
/// Call this once at startup. Subsequent calls are no-ops.
pub fn init_metrics() {
    if PROMETHEUS_HANDLE.get().is_some() {
        return;
    }

    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            let _ = PROMETHEUS_HANDLE.set(handle);
            info!("Prometheus metrics initialized");
        }
        Err(e) => warn!(error = %e, "Failed to install Prometheus recorder"),
    }
}

pub fn metrics_initialized() -> bool {
    PROMETHEUS_HANDLE.get().is_some()
}

/// Render metrics in Prometheus format
pub fn render_metrics() -> String {
    PROMETHEUS_HANDLE
        .get()
        .map(|h| h.render())
        .unwrap_or_default()
}

/// Why a channel issued another attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The broker closed the stream normally
    Repeat,
    /// The attempt failed at transport level
    Retry,
}

impl AttemptOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Repeat => "repeat",
            AttemptOutcome::Retry => "retry",
        }
    }
}

/// Consumer metrics helper, labeled by event type and consumer name
#[derive(Debug, Clone)]
pub struct ConsumerMetrics {
    event_type: String,
    consumer: String,
}

impl ConsumerMetrics {
    pub fn new(event_type: impl Into<String>, consumer: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            consumer: consumer.into(),
        }
    }

    pub fn stream_attempt(&self, outcome: AttemptOutcome) {
        counter!(
            "nakadi_consumer_stream_attempts_total",
            "event_type" => self.event_type.clone(),
            "consumer" => self.consumer.clone(),
            "outcome" => outcome.as_str()
        )
        .increment(1);
    }

    pub fn events_processed(&self, count: u64) {
        counter!(
            "nakadi_consumer_events_processed_total",
            "event_type" => self.event_type.clone(),
            "consumer" => self.consumer.clone()
        )
        .increment(count);
    }

    pub fn batch_processed(&self, duration: Duration) {
        counter!(
            "nakadi_consumer_batches_total",
            "event_type" => self.event_type.clone(),
            "consumer" => self.consumer.clone()
        )
        .increment(1);

        histogram!(
            "nakadi_consumer_batch_duration_seconds",
            "event_type" => self.event_type.clone(),
            "consumer" => self.consumer.clone()
        )
        .record(duration.as_secs_f64());
    }

    pub fn committed(&self) {
        counter!(
            "nakadi_consumer_commits_total",
            "event_type" => self.event_type.clone(),
            "consumer" => self.consumer.clone()
        )
        .increment(1);
    }

    pub fn handler_error(&self, kind: &str) {
        counter!(
            "nakadi_consumer_handler_errors_total",
            "event_type" => self.event_type.clone(),
            "consumer" => self.consumer.clone(),
            "kind" => kind.to_string()
        )
        .increment(1);
    }

    pub fn rebalanced(&self, assigned: usize, revoked: usize) {
        counter!(
            "nakadi_consumer_rebalances_total",
            "event_type" => self.event_type.clone(),
            "consumer" => self.consumer.clone()
        )
        .increment(1);

        counter!(
            "nakadi_consumer_partitions_assigned_total",
            "event_type" => self.event_type.clone(),
            "consumer" => self.consumer.clone()
        )
        .increment(assigned as u64);

        counter!(
            "nakadi_consumer_partitions_revoked_total",
            "event_type" => self.event_type.clone(),
            "consumer" => self.consumer.clone()
        )
        .increment(revoked as u64);
    }

    pub fn owned_partitions(&self, count: usize) {
        gauge!(
            "nakadi_consumer_owned_partitions",
            "event_type" => self.event_type.clone(),
            "consumer" => self.consumer.clone()
        )
        .set(count as f64);
    }

    pub fn channel_restarted(&self) {
        counter!(
            "nakadi_consumer_stuck_channel_restarts_total",
            "event_type" => self.event_type.clone(),
            "consumer" => self.consumer.clone()
        )
        .increment(1);
    }
}
