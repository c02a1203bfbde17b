//! Metrics collection for Spindle
//!
//! This module provides Prometheus metrics for observability.
//! The gateway serves the gathered text on `GET /metrics`.

use lazy_static::lazy_static;
use prometheus::{Histogram, IntCounter, IntGauge, Registry};
use std::sync::Arc;

/// Metrics registry for Spindle
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub dispatch: DispatchMetrics,
    pub pool: PoolMetrics,
}

/// Request dispatch metrics
#[derive(Debug, Clone)]
pub struct DispatchMetrics {
    /// Total number of inference requests
    pub requests_total: IntCounter,

    /// Total number of requests that ended in an error chunk
    pub requests_failed: IntCounter,

    /// Total number of requests whose client disconnected mid-stream
    pub client_disconnects: IntCounter,

    /// Response chunks streamed to clients
    pub chunks_streamed_total: IntCounter,

    /// Request duration histogram
    pub request_duration: Histogram,

    /// Current in-flight requests
    pub active_requests: IntGauge,
}

/// Worker pool metrics
#[derive(Debug, Clone)]
pub struct PoolMetrics {
    /// Currently deployed worker processes
    pub workers_deployed: IntGauge,

    /// Workers currently serving a task
    pub workers_busy: IntGauge,

    /// Tasks completed across all workers
    pub tasks_processed_total: IntCounter,

    /// Workers reaped and replaced after a failed health check
    pub worker_restarts_total: IntCounter,
}

lazy_static! {
    /// Global metrics registry instance
    pub static ref METRICS: MetricsRegistry = MetricsRegistry::new();
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        let registry = Arc::new(Registry::new());

        let requests_total = IntCounter::new(
            "spindle_requests_total",
            "Total number of inference requests",
        )
        .unwrap();

        let requests_failed = IntCounter::new(
            "spindle_requests_failed_total",
            "Total number of requests that ended in an error chunk",
        )
        .unwrap();

        let client_disconnects = IntCounter::new(
            "spindle_client_disconnects_total",
            "Total number of clients that disconnected mid-stream",
        )
        .unwrap();

        let chunks_streamed_total = IntCounter::new(
            "spindle_chunks_streamed_total",
            "Response chunks streamed to clients",
        )
        .unwrap();

        let request_duration = Histogram::with_opts(
            prometheus::HistogramOpts::new(
                "spindle_request_duration_seconds",
                "Inference request duration in seconds",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        )
        .unwrap();

        let active_requests = IntGauge::new(
            "spindle_active_requests",
            "Current number of in-flight inference requests",
        )
        .unwrap();

        let workers_deployed = IntGauge::new(
            "spindle_workers_deployed",
            "Currently deployed worker processes",
        )
        .unwrap();

        let workers_busy =
            IntGauge::new("spindle_workers_busy", "Workers currently serving a task").unwrap();

        let tasks_processed_total = IntCounter::new(
            "spindle_tasks_processed_total",
            "Tasks completed across all workers",
        )
        .unwrap();

        let worker_restarts_total = IntCounter::new(
            "spindle_worker_restarts_total",
            "Workers reaped and replaced after a failed health check",
        )
        .unwrap();

        registry.register(Box::new(requests_total.clone())).unwrap();
        registry.register(Box::new(requests_failed.clone())).unwrap();
        registry.register(Box::new(client_disconnects.clone())).unwrap();
        registry.register(Box::new(chunks_streamed_total.clone())).unwrap();
        registry.register(Box::new(request_duration.clone())).unwrap();
        registry.register(Box::new(active_requests.clone())).unwrap();
        registry.register(Box::new(workers_deployed.clone())).unwrap();
        registry.register(Box::new(workers_busy.clone())).unwrap();
        registry.register(Box::new(tasks_processed_total.clone())).unwrap();
        registry.register(Box::new(worker_restarts_total.clone())).unwrap();

        let dispatch = DispatchMetrics {
            requests_total,
            requests_failed,
            client_disconnects,
            chunks_streamed_total,
            request_duration,
            active_requests,
        };

        let pool = PoolMetrics {
            workers_deployed,
            workers_busy,
            tasks_processed_total,
            worker_restarts_total,
        };

        MetricsRegistry {
            registry,
            dispatch,
            pool,
        }
    }

    /// Gather all metrics as text
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap();
        String::from_utf8(buffer).unwrap()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registry() {
        let metrics = MetricsRegistry::new();

        metrics.dispatch.requests_total.inc();
        metrics.pool.workers_deployed.set(2);

        let output = metrics.gather();
        assert!(output.contains("spindle_requests_total"));
        assert!(output.contains("spindle_workers_deployed"));
    }
}
