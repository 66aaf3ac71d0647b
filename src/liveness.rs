use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

/// Default heartbeat recency threshold.
pub const DEFAULT_LIVENESS_THRESHOLD_MS: u64 = 10_000;

/// Derives "agent connected" from how recently the agent was last heard from.
/// Nothing is pushed on disconnect; readers see it once the threshold lapses.
#[derive(Debug, Clone)]
pub struct LivenessTracker {
    threshold: Duration,
    last_seen: Option<Instant>,
    last_seen_wall: Option<DateTime<Utc>>,
}

impl LivenessTracker {
    pub fn new(threshold: Duration) -> Self {
        Self {
            threshold,
            last_seen: None,
            last_seen_wall: None,
        }
    }

    pub fn record_heartbeat(&mut self, now: Instant) {
        self.last_seen = Some(now);
        self.last_seen_wall = Some(Utc::now());
    }

    pub fn is_connected(&self, now: Instant) -> bool {
        match self.last_seen {
            Some(last) => now.saturating_duration_since(last) < self.threshold,
            None => false,
        }
    }

    pub fn last_heartbeat_at(&self) -> Option<DateTime<Utc>> {
        self.last_seen_wall
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::LivenessTracker;

    #[test]
    fn never_seen_is_disconnected() {
        let tracker = LivenessTracker::new(Duration::from_millis(10_000));
        assert!(!tracker.is_connected(Instant::now()));
        assert!(tracker.last_heartbeat_at().is_none());
    }

    #[test]
    fn threshold_edge() {
        let mut tracker = LivenessTracker::new(Duration::from_millis(10_000));
        let start = Instant::now();
        tracker.record_heartbeat(start);

        assert!(tracker.is_connected(start + Duration::from_millis(9_999)));
        assert!(!tracker.is_connected(start + Duration::from_millis(10_000)));
        assert!(!tracker.is_connected(start + Duration::from_millis(10_001)));
    }

    #[test]
    fn heartbeat_refreshes_connection() {
        let mut tracker = LivenessTracker::new(Duration::from_millis(10_000));
        let start = Instant::now();
        tracker.record_heartbeat(start);
        assert!(!tracker.is_connected(start + Duration::from_secs(15)));

        tracker.record_heartbeat(start + Duration::from_secs(15));
        assert!(tracker.is_connected(start + Duration::from_secs(16)));
        assert!(tracker.last_heartbeat_at().is_some());
    }
}
