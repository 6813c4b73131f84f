//! Step scheduler: ranking, velocity admission, and leasing.
//!
//! `get-steps` flows through here. Selection happens in three stages:
//!
//! 1. **Candidate filter**: rows in the requested scopes that carry the
//!    requested status, plus stale `working` leases past the reclaim
//!    cutoff when `include_working` is set.
//! 2. **Ranking**: `priority DESC, epoch ASC`; priority is the primary
//!    correctness contract, the epoch tie-break gives FIFO fairness.
//!    `reverse` flips the priority direction for drain-style workers.
//! 3. **Velocity admission**: candidates are offered to the governor in
//!    rank order; a tag at its cap is skipped, everything admitted is
//!    leased in one batched update to `working` with a fresh epoch.
//!
//! The scope list is an admission filter, not a strict priority order;
//! ranking across scopes is entirely priority/epoch.

use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;

use sluice_core::step::StepStatus;

use crate::error::Result;
use crate::governor::VelocityGovernor;
use crate::metrics::HubMetrics;
use crate::store::StepStore;

/// A `working` row older than this many seconds is considered a lost
/// lease and becomes re-eligible.
pub const LEASE_SECONDS: i64 = 720;

/// Options accepted by `get-steps`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LeaseOptions {
    /// Maximum ids returned (and leased).
    pub limit: usize,
    /// Candidate rows fetched before admission filtering; raised to
    /// `limit` when smaller.
    pub chunk_size: usize,
    /// Status candidates must carry.
    pub status: StepStatus,
    /// Whether stale `working` leases are reclaimed in the same pass.
    pub include_working: bool,
    /// Flips the priority direction (drain lowest first).
    pub reverse: bool,
}

impl Default for LeaseOptions {
    fn default() -> Self {
        Self {
            limit: 50,
            chunk_size: 100,
            status: StepStatus::Pending,
            include_working: true,
            reverse: false,
        }
    }
}

/// The scheduler; cheap to clone, shared between request handlers.
#[derive(Clone)]
pub struct Scheduler {
    store: Arc<StepStore>,
    governor: Arc<VelocityGovernor>,
    metrics: HubMetrics,
}

impl Scheduler {
    /// Creates a scheduler over the given store and governor.
    #[must_use]
    pub fn new(store: Arc<StepStore>, governor: Arc<VelocityGovernor>) -> Self {
        Self {
            store,
            governor,
            metrics: HubMetrics::new(),
        }
    }

    /// Selects up to `options.limit` runnable steps for the scope set and
    /// leases them as `working`.
    ///
    /// Returns the leased ids in rank order. Once this returns, the rows
    /// are `working` with a fresh epoch, so a concurrent `get-steps`
    /// cannot hand them out again.
    ///
    /// # Errors
    ///
    /// Returns a store error if selection or the lease update fails.
    pub fn lease(&self, scopes: &[String], options: &LeaseOptions) -> Result<Vec<String>> {
        if scopes.is_empty() || options.limit == 0 {
            return Ok(Vec::new());
        }

        let now = Utc::now().timestamp();
        let cutoff = now - LEASE_SECONDS;
        let chunk = options.chunk_size.max(options.limit);

        let candidates = self.store.candidates(
            scopes,
            options.status,
            options.include_working,
            cutoff,
            options.reverse,
            chunk,
        )?;

        let mut selected = Vec::with_capacity(options.limit.min(candidates.len()));
        for candidate in candidates {
            if selected.len() == options.limit {
                break;
            }
            if self.governor.admit(&candidate.tag) {
                selected.push(candidate.id);
            }
        }

        if !selected.is_empty() {
            self.store
                .set_status_many(&selected, StepStatus::Working, now)?;
            self.metrics.record_leased(selected.len());
        }
        tracing::debug!(
            scopes = ?scopes,
            leased = selected.len(),
            limit = options.limit,
            "get-steps lease"
        );
        Ok(selected)
    }
}
