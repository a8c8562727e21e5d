//! Metrics instrumentation for the mapping layer.
//!
//! Uses the `metrics` crate for backend-agnostic collection; the embedding
//! application chooses the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `om_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `record`: the record type name
//! - `status`: ok, skipped, errored

use metrics::{counter, histogram};
use std::time::{Duration, Instant};

/// One search round trip was issued for a record type.
pub fn record_search(record: &str) {
    counter!("om_search_round_trips_total", "record" => record.to_string()).increment(1);
}

/// One record save was issued.
pub fn record_save(record: &str) {
    counter!("om_saves_total", "record" => record.to_string()).increment(1);
}

/// One key was processed by a data migration.
pub fn record_migration_key(migration: &str, status: &str) {
    counter!(
        "om_migration_keys_total",
        "migration" => migration.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// A data migration finished (successfully or not).
pub fn record_migration_duration(migration: &str, duration: Duration) {
    histogram!(
        "om_migration_seconds",
        "migration" => migration.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Drop-in timer that records a duration histogram when dropped.
pub struct LatencyTimer {
    name: &'static str,
    start: Instant,
}

impl LatencyTimer {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        histogram!("om_operation_seconds", "operation" => self.name).record(
            self.start.elapsed().as_secs_f64(),
        );
    }
}
