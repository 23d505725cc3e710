/*!
Metric definitions for the engine: pool and isolate lifecycle plus the
watchdog counter.
*/

// Gauges, live isolates across every pool
pub(crate) static METRIC_ACTIVE_ISOLATES: &str = "active_isolates";

// Counters, lifetime totals
pub(crate) static METRIC_ISOLATES_CREATED: &str = "isolates_created_total";
pub(crate) static METRIC_ISOLATES_DISCARDED: &str = "isolates_discarded_total";
pub(crate) static METRIC_DISCARD_REASON_LABEL: &str = "reason";

pub(crate) static METRIC_POOL_CHECKOUTS: &str = "pool_checkouts_total";
pub(crate) static METRIC_POOL_EXHAUSTED: &str = "pool_exhausted_total";

pub(crate) static METRIC_REQUESTS: &str = "worker_requests_total";
pub(crate) static METRIC_COMPILES: &str = "worker_compiles_total";

pub(crate) static METRIC_WATCHDOG_TERMINATIONS: &str = "watchdog_terminations_total";

/// Record that the watchdog cut a request short.
pub(crate) fn record_watchdog_fired() {
    metrics::counter!(METRIC_WATCHDOG_TERMINATIONS).increment(1);
    tracing::warn!("watchdog fired — execution terminated at the deadline");
}

/// Record an isolate leaving service.
pub(crate) fn record_isolate_discarded(reason: &'static str) {
    metrics::counter!(
        METRIC_ISOLATES_DISCARDED,
        METRIC_DISCARD_REASON_LABEL => reason
    )
    .increment(1);
    metrics::gauge!(METRIC_ACTIVE_ISOLATES).decrement(1.0);
}

/// Record an isolate entering service.
pub(crate) fn record_isolate_created() {
    metrics::counter!(METRIC_ISOLATES_CREATED).increment(1);
    metrics::gauge!(METRIC_ACTIVE_ISOLATES).increment(1.0);
}
