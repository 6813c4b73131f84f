//! Observability metrics for the hub.
//!
//! Exposed via the `metrics` crate facade; install an exporter in the
//! binary to scrape them.
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `sluice_hub_requests_total` | Counter | `method` | Requests accepted off the wire |
//! | `sluice_hub_steps_leased_total` | Counter | - | Step ids handed to workers |
//! | `sluice_hub_mutations_applied_total` | Counter | `method`, `outcome` | Transaction queue items applied |
//! | `sluice_hub_txqueue_depth` | Gauge | - | Durable transaction queue backlog |

use metrics::{counter, gauge};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: Requests accepted off the wire.
    pub const REQUESTS_TOTAL: &str = "sluice_hub_requests_total";
    /// Counter: Step ids handed to workers.
    pub const STEPS_LEASED_TOTAL: &str = "sluice_hub_steps_leased_total";
    /// Counter: Transaction queue items applied.
    pub const MUTATIONS_APPLIED_TOTAL: &str = "sluice_hub_mutations_applied_total";
    /// Gauge: Durable transaction queue backlog.
    pub const TXQUEUE_DEPTH: &str = "sluice_hub_txqueue_depth";
}

/// Label keys used across metrics.
pub mod labels {
    /// Wire method literal.
    pub const METHOD: &str = "method";
    /// Apply outcome (`ok` or `error`).
    pub const OUTCOME: &str = "outcome";
}

/// Metrics recorder for the hub.
#[derive(Debug, Clone, Copy, Default)]
pub struct HubMetrics;

impl HubMetrics {
    /// Creates a new recorder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Records one accepted request.
    pub fn record_request(self, method: &str) {
        counter!(names::REQUESTS_TOTAL, labels::METHOD => method.to_string()).increment(1);
    }

    /// Records leased step ids.
    pub fn record_leased(self, count: usize) {
        counter!(names::STEPS_LEASED_TOTAL).increment(count as u64);
    }

    /// Records one applied (or failed) mutation.
    pub fn record_mutation(self, method: &str, ok: bool) {
        let outcome = if ok { "ok" } else { "error" };
        counter!(
            names::MUTATIONS_APPLIED_TOTAL,
            labels::METHOD => method.to_string(),
            labels::OUTCOME => outcome.to_string(),
        )
        .increment(1);
    }

    /// Updates the transaction queue backlog gauge.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_queue_depth(self, depth: usize) {
        gauge!(names::TXQUEUE_DEPTH).set(depth as f64);
    }
}
