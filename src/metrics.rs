//! Prometheus metrics for bleepgate.
//!
//! Defines metric name constants, installs the global Prometheus recorder
//! using `metrics-exporter-prometheus`, and provides the helper the gateway
//! uses to record per-operation RED metrics.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Instant;

use crate::errors::GatewayResult;

// -- Metric name constants ----------------------------------------------------

/// Total gateway operations (counter). Labels: operation, status.
pub const OPERATIONS_TOTAL: &str = "bleepgate_operations_total";

/// Gateway operation duration in seconds (histogram). Labels: operation.
pub const OPERATION_DURATION_SECONDS: &str = "bleepgate_operation_duration_seconds";

/// In-flight multipart upload sessions (gauge).
pub const MULTIPART_SESSIONS: &str = "bleepgate_multipart_sessions";

/// Multipart sessions aborted by stale-upload collection (counter).
pub const MULTIPART_GC_ABORTED_TOTAL: &str = "bleepgate_multipart_gc_aborted_total";

/// Bytes written to the backend for objects and parts (counter).
pub const BYTES_WRITTEN_TOTAL: &str = "bleepgate_bytes_written_total";

/// Bytes read from the backend for object reads (counter).
pub const BYTES_READ_TOTAL: &str = "bleepgate_bytes_read_total";

// -- Global recorder installation ---------------------------------------------

/// Install the global Prometheus recorder with an HTTP listener on `addr`.
pub fn install_exporter(addr: SocketAddr) -> anyhow::Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("failed to install Prometheus exporter: {}", e))?;
    describe_metrics();
    Ok(())
}

/// Register metric descriptions with the global recorder.
pub fn describe_metrics() {
    describe_counter!(OPERATIONS_TOTAL, "Total gateway operations by type and outcome");
    describe_histogram!(
        OPERATION_DURATION_SECONDS,
        "Gateway operation duration in seconds"
    );
    describe_gauge!(MULTIPART_SESSIONS, "In-flight multipart upload sessions");
    describe_counter!(
        MULTIPART_GC_ABORTED_TOTAL,
        "Multipart sessions aborted as stale"
    );
    describe_counter!(BYTES_WRITTEN_TOTAL, "Total bytes written to the backend");
    describe_counter!(BYTES_READ_TOTAL, "Total bytes read from the backend");
}

// -- Recording helpers --------------------------------------------------------

/// Times one gateway operation and records its outcome when finished.
pub struct OperationTimer {
    operation: &'static str,
    start: Instant,
}

impl OperationTimer {
    pub fn start(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }

    /// Record the outcome and hand the result back unchanged.
    pub fn finish<T>(self, result: GatewayResult<T>) -> GatewayResult<T> {
        let status = match &result {
            Ok(_) => "ok",
            Err(e) => e.kind().as_str(),
        };
        counter!(OPERATIONS_TOTAL, "operation" => self.operation, "status" => status).increment(1);
        histogram!(OPERATION_DURATION_SECONDS, "operation" => self.operation)
            .record(self.start.elapsed().as_secs_f64());
        result
    }
}

pub fn set_multipart_sessions(count: usize) {
    gauge!(MULTIPART_SESSIONS).set(count as f64);
}

pub fn record_gc_aborted(count: usize) {
    counter!(MULTIPART_GC_ABORTED_TOTAL).increment(count as u64);
}

pub fn record_bytes_written(bytes: u64) {
    counter!(BYTES_WRITTEN_TOTAL).increment(bytes);
}

pub fn record_bytes_read(bytes: u64) {
    counter!(BYTES_READ_TOTAL).increment(bytes);
}
