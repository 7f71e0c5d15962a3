//! Per-node forwarding health (circuit breaker)
//!
//! A node with no record is healthy. The first failed send creates a record
//! and the node becomes suspect; from the fourth failure on it is excluded.
//! Records are never expired by a timer. Every check compares the last failure
//! against the expiration window and deletes the record once it has elapsed.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Failures at which a node is excluded instead of suspect
pub const EXCLUSION_THRESHOLD: u32 = 4;

/// Default time a failing node is kept out of forwarding
pub const DEFAULT_EXPIRATION: Duration = Duration::from_secs(120);

/// Forwarding health of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    /// No recent failures
    Healthy,
    /// Between one and three failures inside the window
    Suspect,
    /// At least four failures inside the window
    Excluded,
}

#[derive(Debug, Clone, Copy)]
struct HealthRecord {
    failures: u32,
    last_failure: Instant,
}

impl HealthRecord {
    fn state(&self) -> HealthState {
        if self.failures >= EXCLUSION_THRESHOLD {
            HealthState::Excluded
        } else {
            HealthState::Suspect
        }
    }
}

/// Tracks recent send failures by node name
#[derive(Debug)]
pub struct HealthTracker {
    expiration: Duration,
    records: RwLock<HashMap<String, HealthRecord>>,
}

impl HealthTracker {
    pub fn new(expiration: Duration) -> Self {
        Self {
            expiration,
            records: RwLock::new(HashMap::new()),
        }
    }

    pub fn expiration(&self) -> Duration {
        self.expiration
    }

    /// Record a failed send to `node`
    pub fn record_failure(&self, node: &str, now: Instant) -> HealthState {
        let mut records = self.records.write();
        let record = records.entry(node.to_string()).or_insert(HealthRecord {
            failures: 0,
            last_failure: now,
        });
        record.failures += 1;
        record.last_failure = now;
        record.state()
    }

    /// Whether `node` may receive forwarded writes at `now`
    ///
    /// Clears the node's record when its window has elapsed.
    pub fn is_usable(&self, node: &str, now: Instant) -> bool {
        let mut records = self.records.write();
        let Some(record) = records.get(node) else {
            return true;
        };

        if now.saturating_duration_since(record.last_failure) >= self.expiration {
            records.remove(node);
            return true;
        }
        false
    }

    /// Current state of `node` without expiring anything
    pub fn state(&self, node: &str) -> HealthState {
        self.records
            .read()
            .get(node)
            .map(HealthRecord::state)
            .unwrap_or(HealthState::Healthy)
    }

    /// Recorded failures for `node`
    pub fn failures(&self, node: &str) -> u32 {
        self.records.read().get(node).map(|r| r.failures).unwrap_or(0)
    }

    /// Names of nodes with a live record
    pub fn tracked(&self) -> Vec<String> {
        self.records.read().keys().cloned().collect()
    }

    /// Name, state and failure count of every tracked node, sorted by name
    ///
    /// Taken under one read lock so each entry is self-consistent.
    pub fn snapshot(&self) -> Vec<(String, HealthState, u32)> {
        let mut entries: Vec<_> = self
            .records
            .read()
            .iter()
            .map(|(name, record)| (name.clone(), record.state(), record.failures))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new(DEFAULT_EXPIRATION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_node_is_usable() {
        let tracker = HealthTracker::default();
        assert!(tracker.is_usable("node1", Instant::now()));
        assert_eq!(tracker.state("node1"), HealthState::Healthy);
    }

    #[test]
    fn test_failures_escalate_to_excluded() {
        let tracker = HealthTracker::default();
        let now = Instant::now();

        for expected in 1..EXCLUSION_THRESHOLD {
            assert_eq!(tracker.record_failure("node1", now), HealthState::Suspect);
            assert_eq!(tracker.failures("node1"), expected);
        }
        assert_eq!(tracker.record_failure("node1", now), HealthState::Excluded);
        assert_eq!(tracker.state("node1"), HealthState::Excluded);
    }

    #[test]
    fn test_suspect_node_cools_down() {
        let tracker = HealthTracker::default();
        let now = Instant::now();
        tracker.record_failure("node1", now);

        assert!(!tracker.is_usable("node1", now + Duration::from_secs(30)));
        assert_eq!(tracker.failures("node1"), 1);

        assert!(tracker.is_usable("node1", now + DEFAULT_EXPIRATION));
        assert_eq!(tracker.state("node1"), HealthState::Healthy);
        assert!(tracker.tracked().is_empty());
    }

    #[test]
    fn test_excluded_node_recovers_after_window() {
        let tracker = HealthTracker::default();
        let now = Instant::now();
        for _ in 0..EXCLUSION_THRESHOLD {
            tracker.record_failure("node1", now);
        }

        assert!(!tracker.is_usable("node1", now));
        assert!(!tracker.is_usable("node1", now + DEFAULT_EXPIRATION - Duration::from_secs(1)));
        assert!(tracker.is_usable("node1", now + DEFAULT_EXPIRATION + Duration::from_secs(1)));
        assert_eq!(tracker.failures("node1"), 0);
    }

    #[test]
    fn test_new_failure_restarts_window() {
        let tracker = HealthTracker::new(Duration::from_secs(10));
        let now = Instant::now();
        tracker.record_failure("node1", now);
        tracker.record_failure("node1", now + Duration::from_secs(8));

        assert!(!tracker.is_usable("node1", now + Duration::from_secs(12)));
        assert!(tracker.is_usable("node1", now + Duration::from_secs(18)));
    }

    #[test]
    fn test_snapshot_reports_consistent_entries() {
        let tracker = HealthTracker::default();
        let now = Instant::now();
        for _ in 0..EXCLUSION_THRESHOLD {
            tracker.record_failure("node2", now);
        }
        tracker.record_failure("node1", now);

        assert_eq!(
            tracker.snapshot(),
            vec![
                ("node1".to_string(), HealthState::Suspect, 1),
                ("node2".to_string(), HealthState::Excluded, EXCLUSION_THRESHOLD),
            ]
        );

        // An expired record vanishes as a whole, never as a zero-failure entry
        assert!(tracker.is_usable("node1", now + DEFAULT_EXPIRATION));
        assert_eq!(
            tracker.snapshot(),
            vec![("node2".to_string(), HealthState::Excluded, EXCLUSION_THRESHOLD)]
        );
    }

    #[test]
    fn test_snapshot_while_records_change() {
        let tracker = std::sync::Arc::new(HealthTracker::new(Duration::ZERO));
        let writer = {
            let tracker = tracker.clone();
            std::thread::spawn(move || {
                for _ in 0..2_000 {
                    let now = Instant::now();
                    tracker.record_failure("node1", now);
                    tracker.is_usable("node1", now);
                }
            })
        };

        for _ in 0..2_000 {
            for (name, state, failures) in tracker.snapshot() {
                assert_eq!(name, "node1");
                assert!(failures >= 1);
                assert_ne!(state, HealthState::Healthy);
            }
        }
        writer.join().unwrap();
    }

    #[test]
    fn test_nodes_are_tracked_independently() {
        let tracker = HealthTracker::default();
        let now = Instant::now();
        tracker.record_failure("node1", now);

        assert!(!tracker.is_usable("node1", now));
        assert!(tracker.is_usable("node2", now));
    }
}
