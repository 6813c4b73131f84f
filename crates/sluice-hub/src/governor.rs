//! Tag-velocity governor: leaky-bucket admission control per tag.
//!
//! The governor owns the in-memory usage counters. The scheduler asks it
//! to [`admit`](VelocityGovernor::admit) each candidate in ranking order;
//! a background ticker decrements every counter once per second, so a tag
//! with limit `V` gets at most `V` concurrent leases plus roughly `V` per
//! second of sustained throughput.
//!
//! Counters are process-local and ephemeral; a hub restart resets them to
//! zero. The governor is injected wherever admission decisions are made;
//! there is no process-wide static.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

/// Interval between decrement sweeps.
const TICK: Duration = Duration::from_secs(1);

/// Per-tag admission governor.
#[derive(Debug, Default)]
pub struct VelocityGovernor {
    limits: RwLock<HashMap<String, u32>>,
    usage: Mutex<HashMap<String, u32>>,
}

impl VelocityGovernor {
    /// Creates a governor with the given per-tag limits. Tags without a
    /// limit are never throttled.
    #[must_use]
    pub fn new(limits: HashMap<String, u32>) -> Self {
        Self {
            limits: RwLock::new(limits),
            usage: Mutex::new(HashMap::new()),
        }
    }

    /// Sets or clears one tag's limit.
    pub fn set_limit(&self, tag: &str, limit: Option<u32>) {
        let mut limits = self.limits.write().unwrap_or_else(PoisonError::into_inner);
        match limit {
            Some(limit) => {
                limits.insert(tag.to_string(), limit);
            }
            None => {
                limits.remove(tag);
            }
        }
    }

    /// Tries to admit one lease for the tag.
    ///
    /// Admission increments the tag's usage counter; a tag at its limit is
    /// refused until the ticker drains it.
    pub fn admit(&self, tag: &str) -> bool {
        let limit = {
            let limits = self.limits.read().unwrap_or_else(PoisonError::into_inner);
            limits.get(tag).copied()
        };
        let mut usage = self.usage.lock().unwrap_or_else(PoisonError::into_inner);
        let count = usage.entry(tag.to_string()).or_insert(0);
        if let Some(limit) = limit {
            if *count >= limit {
                return false;
            }
        }
        *count += 1;
        true
    }

    /// Current usage counter for a tag.
    #[must_use]
    pub fn usage(&self, tag: &str) -> u32 {
        let usage = self.usage.lock().unwrap_or_else(PoisonError::into_inner);
        usage.get(tag).copied().unwrap_or(0)
    }

    /// One decrement sweep: every counter drops by one, floored at zero;
    /// drained tags are pruned.
    pub fn release_all(&self) {
        let mut usage = self.usage.lock().unwrap_or_else(PoisonError::into_inner);
        usage.retain(|_, count| {
            *count = count.saturating_sub(1);
            *count > 0
        });
    }

    /// Runs the 1 Hz decrement ticker forever. Spawn on the runtime at
    /// startup.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(TICK);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.release_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn governor_with(tag: &str, limit: u32) -> VelocityGovernor {
        VelocityGovernor::new(HashMap::from([(tag.to_string(), limit)]))
    }

    #[test]
    fn admits_up_to_the_limit() {
        let governor = governor_with("api", 2);
        assert!(governor.admit("api"));
        assert!(governor.admit("api"));
        assert!(!governor.admit("api"));
        assert_eq!(governor.usage("api"), 2);
    }

    #[test]
    fn unlimited_tags_always_admit() {
        let governor = VelocityGovernor::default();
        for _ in 0..100 {
            assert!(governor.admit("anything"));
        }
        assert_eq!(governor.usage("anything"), 100);
    }

    #[test]
    fn release_drains_one_per_sweep() {
        let governor = governor_with("api", 2);
        assert!(governor.admit("api"));
        assert!(governor.admit("api"));
        assert!(!governor.admit("api"));

        governor.release_all();
        assert_eq!(governor.usage("api"), 1);
        assert!(governor.admit("api"));
        assert!(!governor.admit("api"));
    }

    #[test]
    fn release_floors_at_zero() {
        let governor = governor_with("api", 2);
        governor.release_all();
        governor.release_all();
        assert_eq!(governor.usage("api"), 0);
        assert!(governor.admit("api"));
    }

    #[test]
    fn limits_can_change_at_runtime() {
        let governor = governor_with("api", 1);
        assert!(governor.admit("api"));
        assert!(!governor.admit("api"));

        governor.set_limit("api", Some(3));
        assert!(governor.admit("api"));

        governor.set_limit("api", None);
        for _ in 0..10 {
            assert!(governor.admit("api"));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_decrements_on_schedule() {
        let governor = Arc::new(governor_with("api", 1));
        assert!(governor.admit("api"));
        assert!(!governor.admit("api"));

        let ticker = tokio::spawn(governor.clone().run());
        tokio::time::sleep(Duration::from_millis(1100)).await;

        assert!(governor.admit("api"));
        ticker.abort();
    }
}
