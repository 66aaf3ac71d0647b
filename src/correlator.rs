//! Result store that matches agent results to the callers waiting on them.
//!
//! Every `claim` either hands back a result that is already stored or
//! registers a one-shot waiter that `store` fulfils directly, so waiting
//! callers wake as soon as the agent posts rather than on a polling tick.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use tokio::sync::oneshot;

use crate::protocol::CommandResult;

#[derive(Debug)]
struct StoredResult {
    result: CommandResult,
    received_at: Instant,
}

#[derive(Debug)]
struct Waiter {
    key: u64,
    tx: oneshot::Sender<CommandResult>,
}

/// Identifies one registered waiter so it can be released on timeout,
/// cancellation or drop.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WaiterKey {
    command_id: String,
    key: u64,
}

impl WaiterKey {
    pub fn command_id(&self) -> &str {
        &self.command_id
    }
}

#[derive(Debug)]
pub enum Claim {
    Ready(CommandResult),
    Waiting(WaiterKey, oneshot::Receiver<CommandResult>),
}

/// Where a stored result went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Handed straight to this many live waiters; nothing retained.
    Waiters(usize),
    /// Nobody was waiting; kept for a later claim until retention expires.
    Stored,
}

#[derive(Debug)]
pub struct ResultStore {
    retention: Duration,
    results: HashMap<String, StoredResult>,
    waiters: HashMap<String, Vec<Waiter>>,
    next_waiter: u64,
}

impl ResultStore {
    pub fn new(retention: Duration) -> Self {
        Self {
            retention,
            results: HashMap::new(),
            waiters: HashMap::new(),
            next_waiter: 0,
        }
    }

    /// Record a result. Last write wins for repeated ids.
    pub fn store(&mut self, command_id: &str, result: CommandResult, now: Instant) -> Delivery {
        let mut delivered = 0;
        if let Some(waiters) = self.waiters.remove(command_id) {
            for waiter in waiters {
                if waiter.tx.send(result.clone()).is_ok() {
                    delivered += 1;
                }
            }
        }

        if delivered > 0 {
            self.results.remove(command_id);
            return Delivery::Waiters(delivered);
        }

        self.results.insert(
            command_id.to_string(),
            StoredResult {
                result,
                received_at: now,
            },
        );
        Delivery::Stored
    }

    /// Take the stored result for `command_id`, or register a waiter for it.
    /// A result past its retention counts as absent even before a sweep.
    pub fn claim(&mut self, command_id: &str, now: Instant) -> Claim {
        if let Some(stored) = self.results.remove(command_id) {
            if now.saturating_duration_since(stored.received_at) < self.retention {
                return Claim::Ready(stored.result);
            }
        }

        self.next_waiter += 1;
        let key = self.next_waiter;
        let (tx, rx) = oneshot::channel();
        self.waiters
            .entry(command_id.to_string())
            .or_default()
            .push(Waiter { key, tx });

        Claim::Waiting(
            WaiterKey {
                command_id: command_id.to_string(),
                key,
            },
            rx,
        )
    }

    /// Whether a caller is still waiting on `command_id`.
    pub fn has_waiter(&self, command_id: &str) -> bool {
        self.waiters
            .get(command_id)
            .is_some_and(|list| list.iter().any(|w| !w.tx.is_closed()))
    }

    pub fn release(&mut self, waiter: &WaiterKey) {
        if let Some(list) = self.waiters.get_mut(&waiter.command_id) {
            list.retain(|w| w.key != waiter.key);
            if list.is_empty() {
                self.waiters.remove(&waiter.command_id);
            }
        }
    }

    /// Evict results nobody claimed within the retention window.
    pub fn evict_expired(&mut self, now: Instant) -> usize {
        let before = self.results.len();
        let retention = self.retention;
        self.results
            .retain(|_, stored| now.saturating_duration_since(stored.received_at) < retention);
        before - self.results.len()
    }

    /// Drop waiters whose receiving side has gone away.
    pub fn prune_abandoned(&mut self) -> usize {
        let mut pruned = 0;
        self.waiters.retain(|_, list| {
            let before = list.len();
            list.retain(|w| !w.tx.is_closed());
            pruned += before - list.len();
            !list.is_empty()
        });
        pruned
    }

    pub fn stored_len(&self) -> usize {
        self.results.len()
    }

    pub fn waiting_len(&self) -> usize {
        self.waiters.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use serde_json::json;

    use super::{Claim, Delivery, ResultStore};
    use crate::protocol::CommandResult;

    #[test]
    fn stored_result_is_claimed_once() {
        let mut store = ResultStore::new(Duration::from_secs(300));
        let now = Instant::now();
        assert_eq!(
            store.store("c1", CommandResult::ok(json!({ "v": 1 })), now),
            Delivery::Stored
        );

        match store.claim("c1", now) {
            Claim::Ready(result) => assert_eq!(result, CommandResult::ok(json!({ "v": 1 }))),
            Claim::Waiting(..) => panic!("expected stored result"),
        }
        assert_eq!(store.stored_len(), 0);
        assert!(matches!(store.claim("c1", now), Claim::Waiting(..)));
    }

    #[test]
    fn last_write_wins() {
        let mut store = ResultStore::new(Duration::from_secs(300));
        let now = Instant::now();
        store.store("c1", CommandResult::failed("first"), now);
        store.store("c1", CommandResult::ok(json!("second")), now);

        match store.claim("c1", now) {
            Claim::Ready(result) => assert_eq!(result.data, Some(json!("second"))),
            Claim::Waiting(..) => panic!("expected stored result"),
        }
    }

    #[tokio::test]
    async fn store_wakes_registered_waiter() {
        let mut store = ResultStore::new(Duration::from_secs(300));
        let now = Instant::now();
        let Claim::Waiting(key, rx) = store.claim("c7", now) else {
            panic!("expected waiter");
        };
        assert_eq!(key.command_id(), "c7");
        assert_eq!(store.waiting_len(), 1);

        let delivery = store.store("c7", CommandResult::ok(json!(7)), now);
        assert_eq!(delivery, Delivery::Waiters(1));
        assert_eq!(rx.await.unwrap(), CommandResult::ok(json!(7)));
        assert_eq!(store.stored_len(), 0);
        assert_eq!(store.waiting_len(), 0);
    }

    #[test]
    fn result_is_kept_when_waiter_went_away() {
        let mut store = ResultStore::new(Duration::from_secs(300));
        let now = Instant::now();
        let Claim::Waiting(_key, rx) = store.claim("c2", now) else {
            panic!("expected waiter");
        };
        drop(rx);

        let delivery = store.store("c2", CommandResult::ok(json!(2)), now);
        assert_eq!(delivery, Delivery::Stored);
        assert_eq!(store.stored_len(), 1);
    }

    #[test]
    fn release_removes_only_that_waiter() {
        let mut store = ResultStore::new(Duration::from_secs(300));
        let now = Instant::now();
        let Claim::Waiting(first, _rx1) = store.claim("c3", now) else {
            panic!("expected waiter");
        };
        let Claim::Waiting(_second, _rx2) = store.claim("c3", now) else {
            panic!("expected waiter");
        };
        assert_eq!(store.waiting_len(), 2);

        store.release(&first);
        assert_eq!(store.waiting_len(), 1);
    }

    #[test]
    fn unclaimed_results_expire_after_retention() {
        let mut store = ResultStore::new(Duration::from_secs(300));
        let now = Instant::now();
        store.store("old", CommandResult::ok(json!(1)), now);
        store.store("new", CommandResult::ok(json!(2)), now + Duration::from_secs(200));

        let later = now + Duration::from_secs(301);
        let evicted = store.evict_expired(later);
        assert_eq!(evicted, 1);
        assert!(matches!(store.claim("old", later), Claim::Waiting(..)));
        assert!(matches!(store.claim("new", later), Claim::Ready(_)));
    }

    #[test]
    fn expired_result_is_not_claimable_before_sweep() {
        let mut store = ResultStore::new(Duration::from_secs(300));
        let now = Instant::now();
        store.store("stale", CommandResult::ok(json!(1)), now);
        store.store("edge", CommandResult::ok(json!(2)), now);

        assert!(matches!(
            store.claim("stale", now + Duration::from_secs(301)),
            Claim::Waiting(..)
        ));
        assert!(matches!(
            store.claim("edge", now + Duration::from_secs(300)),
            Claim::Waiting(..)
        ));
        assert_eq!(store.stored_len(), 0);
    }

    #[test]
    fn has_waiter_ignores_dropped_receivers() {
        let mut store = ResultStore::new(Duration::from_secs(300));
        let now = Instant::now();
        assert!(!store.has_waiter("c5"));

        let Claim::Waiting(_key, rx) = store.claim("c5", now) else {
            panic!("expected waiter");
        };
        assert!(store.has_waiter("c5"));

        drop(rx);
        assert!(!store.has_waiter("c5"));
    }

    #[test]
    fn abandoned_waiters_are_pruned() {
        let mut store = ResultStore::new(Duration::from_secs(300));
        let now = Instant::now();
        let Claim::Waiting(_k1, rx1) = store.claim("gone", now) else {
            panic!("expected waiter");
        };
        let Claim::Waiting(_k2, _rx2) = store.claim("alive", now) else {
            panic!("expected waiter");
        };
        drop(rx1);

        assert_eq!(store.prune_abandoned(), 1);
        assert_eq!(store.waiting_len(), 1);
    }
}
