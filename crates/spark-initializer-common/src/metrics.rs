//! OpenTelemetry instruments for the initializer control loop
//!
//! Instruments are created lazily from the global meter, so they are no-ops
//! until a meter provider is installed by [`crate::telemetry`].

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::KeyValue;

static METER: Lazy<Meter> = Lazy::new(|| global::meter("spark_pod_initializer"));

/// Counter of queued reconciliations
///
/// Labels:
/// - `result`: patched, released, not_found, already_initialized, error, dropped
///
/// A reconcile that panicked is counted as `error`.
pub static RECONCILE_TOTAL: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("spark_initializer_reconcile_total")
        .with_description("Total number of pod reconciliations by result")
        .with_unit("{reconciliations}")
        .build()
});

/// Histogram of reconciliation duration
pub static RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("spark_initializer_reconcile_duration_seconds")
        .with_description("Duration of pod reconciliation in seconds")
        .with_unit("s")
        .build()
});

/// Counter of pods handled on the inline non-Spark path
///
/// Labels:
/// - `result`: updated, error
pub static INLINE_UPDATES: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("spark_initializer_inline_updates_total")
        .with_description("Total number of non-Spark pods released by whole-object update")
        .with_unit("{pods}")
        .build()
});

/// Counter of registration lifecycle operations
///
/// Labels:
/// - `operation`: created, appended, present, deleted
pub static REGISTRATIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("spark_initializer_registrations_total")
        .with_description("Total number of registration record operations")
        .with_unit("{operations}")
        .build()
});

/// Gauge of keys waiting in the retry queue
pub static QUEUE_DEPTH: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("spark_initializer_queue_depth")
        .with_description("Number of pod keys waiting in the retry queue")
        .with_unit("{keys}")
        .build()
});

/// Record the outcome of one queued reconciliation
pub fn record_reconcile(result: &'static str, seconds: f64) {
    let attrs = [KeyValue::new("result", result)];
    RECONCILE_TOTAL.add(1, &attrs);
    RECONCILE_DURATION.record(seconds, &attrs);
}

/// Record the outcome of one inline update
pub fn record_inline_update(result: &'static str) {
    INLINE_UPDATES.add(1, &[KeyValue::new("result", result)]);
}

/// Record one registration lifecycle operation
pub fn record_registration(operation: &'static str) {
    REGISTRATIONS.add(1, &[KeyValue::new("operation", operation)]);
}

/// Record the current queue depth
pub fn record_queue_depth(depth: usize) {
    QUEUE_DEPTH.record(depth as i64, &[]);
}
