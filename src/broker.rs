//! The relay broker: one owner for the command queue, the result store and
//! the liveness timestamp.
//!
//! All shared state sits behind a single lock. Nothing awaits while holding
//! it, so a caller suspended in [`Broker::wait_for_result`] never stalls the
//! agent's drains or submissions.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::{sync::Notify, task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::{
    correlator::{Claim, ResultStore, WaiterKey},
    liveness::{LivenessTracker, DEFAULT_LIVENESS_THRESHOLD_MS},
    protocol::{Command, CommandResult, ResultSubmission},
    queue::CommandQueue,
};

/// Timing and batching policy for one broker instance.
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    /// Batch size used when a poll does not ask for one.
    pub poll_batch: usize,
    /// Upper clamp on any requested batch size.
    pub max_poll_batch: usize,
    /// Interval agents are told to poll at.
    pub poll_interval: Duration,
    /// Default wait for `enqueue_and_wait` callers that do not pick one.
    pub result_timeout: Duration,
    pub liveness_threshold: Duration,
    /// Lifetime of undrained commands and of issued-id records.
    pub pending_ttl: Duration,
    /// Lifetime of results nobody has claimed.
    pub result_ttl: Duration,
    pub sweep_interval: Duration,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            poll_batch: 10,
            max_poll_batch: 100,
            poll_interval: Duration::from_millis(1_000),
            result_timeout: Duration::from_millis(30_000),
            liveness_threshold: Duration::from_millis(DEFAULT_LIVENESS_THRESHOLD_MS),
            pending_ttl: Duration::from_millis(120_000),
            result_ttl: Duration::from_millis(300_000),
            sweep_interval: Duration::from_millis(5_000),
        }
    }
}

/// How a `submit_results` batch was classified.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmitOutcome {
    pub accepted: usize,
    /// Entries without a command id or without a result.
    pub malformed: usize,
    /// Entries naming an id this broker never issued (or has forgotten).
    pub unknown: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_commands: usize,
    pub expired_results: usize,
    pub abandoned_waiters: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.expired_commands == 0 && self.expired_results == 0 && self.abandoned_waiters == 0
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub connected: bool,
    pub pending_count: usize,
    pub waiting_count: usize,
    pub stored_results: usize,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub poll_interval_ms: u64,
}

#[derive(Debug)]
struct RelayState {
    queue: CommandQueue,
    results: ResultStore,
    liveness: LivenessTracker,
}

#[derive(Debug)]
struct BrokerInner {
    settings: BrokerSettings,
    state: Mutex<RelayState>,
    enqueued: Notify,
    shutdown: CancellationToken,
}

/// Cheaply cloneable handle to a broker instance.
#[derive(Debug, Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

impl Broker {
    pub fn new(settings: BrokerSettings) -> Self {
        let state = RelayState {
            queue: CommandQueue::new(),
            results: ResultStore::new(settings.result_ttl),
            liveness: LivenessTracker::new(settings.liveness_threshold),
        };
        Self {
            inner: Arc::new(BrokerInner {
                settings,
                state: Mutex::new(state),
                enqueued: Notify::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.inner.settings
    }

    /// Spawn the periodic sweep that bounds memory while the agent is gone.
    /// Runs until [`Broker::shutdown`].
    pub fn start(&self) -> JoinHandle<()> {
        let broker = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(broker.settings().sweep_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = broker.inner.shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        let report = broker.sweep();
                        if !report.is_empty() {
                            tracing::debug!(
                                target = "command_relay::broker",
                                expired_commands = report.expired_commands,
                                expired_results = report.expired_results,
                                abandoned_waiters = report.abandoned_waiters,
                                "sweep evicted stale entries"
                            );
                        }
                    }
                }
            }
            tracing::debug!(target = "command_relay::broker", "sweeper stopped");
        })
    }

    /// Stop the sweeper and release every caller still waiting.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Resolves once [`Broker::shutdown`] has been called.
    pub async fn stopped(&self) {
        self.inner.shutdown.cancelled().await;
    }

    pub fn enqueue(&self, kind: &str, payload: Value) -> String {
        let id = self.inner.state.lock().queue.enqueue(kind, payload, now());
        self.inner.enqueued.notify_one();
        id
    }

    /// Resolves once a command has been enqueued since the last wake-up.
    pub async fn enqueued(&self) {
        self.inner.enqueued.notified().await;
    }

    pub(crate) fn renotify(&self) {
        self.inner.enqueued.notify_one();
    }

    /// Hand the agent up to `max_batch` of the oldest commands and count the
    /// call as a heartbeat.
    pub fn drain(&self, max_batch: Option<usize>) -> Vec<Command> {
        self.take_batch(max_batch, true)
    }

    /// Drain for a broker-initiated push. The agent did not ask for anything,
    /// so this says nothing about its liveness.
    pub(crate) fn drain_for_push(&self) -> Vec<Command> {
        self.take_batch(None, false)
    }

    fn take_batch(&self, max_batch: Option<usize>, heartbeat: bool) -> Vec<Command> {
        let settings = self.settings();
        let batch = max_batch
            .unwrap_or(settings.poll_batch)
            .min(settings.max_poll_batch);

        let commands = {
            let mut state = self.inner.state.lock();
            if heartbeat {
                state.liveness.record_heartbeat(now());
            }
            state.queue.drain(batch)
        };

        if !commands.is_empty() {
            tracing::debug!(
                target = "command_relay::broker",
                count = commands.len(),
                "drained commands for agent"
            );
        }
        commands
    }

    pub fn submit_results(&self, submissions: Vec<ResultSubmission>) -> SubmitOutcome {
        let mut outcome = SubmitOutcome::default();
        let received = now();
        {
            let mut state = self.inner.state.lock();
            for submission in submissions {
                let command_id = submission
                    .command_id
                    .as_deref()
                    .map(str::trim)
                    .filter(|id| !id.is_empty());
                let (Some(command_id), Some(result)) = (command_id, submission.result) else {
                    outcome.malformed += 1;
                    continue;
                };
                // A live waiter outlasts the issued-id record when callers
                // wait longer than `pending_ttl`.
                if !state.queue.was_issued(command_id) && !state.results.has_waiter(command_id) {
                    outcome.unknown += 1;
                    continue;
                }
                state.results.store(command_id, result, received);
                outcome.accepted += 1;
            }
        }

        if outcome.malformed > 0 || outcome.unknown > 0 {
            tracing::warn!(
                target = "command_relay::broker",
                accepted = outcome.accepted,
                malformed = outcome.malformed,
                unknown = outcome.unknown,
                "dropped result submissions"
            );
        } else {
            tracing::debug!(
                target = "command_relay::broker",
                accepted = outcome.accepted,
                "stored results"
            );
        }
        outcome
    }

    pub async fn wait_for_result(&self, command_id: &str, timeout: Duration) -> CommandResult {
        self.wait_for_result_with_cancel(command_id, timeout, &CancellationToken::new())
            .await
    }

    /// Wait until the result for `command_id` arrives, `timeout` elapses,
    /// `cancel` fires or the broker shuts down. Never errors: expiry and
    /// cancellation come back as failed results.
    pub async fn wait_for_result_with_cancel(
        &self,
        command_id: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> CommandResult {
        let claim = self.inner.state.lock().results.claim(command_id, now());
        let (key, mut rx) = match claim {
            Claim::Ready(result) => return result,
            Claim::Waiting(key, rx) => (key, rx),
        };
        let _guard = WaiterGuard {
            broker: self,
            key,
        };

        let fallback = tokio::select! {
            received = &mut rx => {
                return received.unwrap_or_else(|_| CommandResult::cancelled());
            }
            _ = tokio::time::sleep(timeout) => CommandResult::timeout(),
            _ = cancel.cancelled() => CommandResult::cancelled(),
            _ = self.inner.shutdown.cancelled() => CommandResult::cancelled(),
        };

        // A result may have landed between the deadline firing and now.
        rx.try_recv().unwrap_or(fallback)
    }

    pub async fn enqueue_and_wait(
        &self,
        kind: &str,
        payload: Value,
        timeout: Duration,
    ) -> CommandResult {
        self.enqueue_and_wait_with_cancel(kind, payload, timeout, &CancellationToken::new())
            .await
    }

    pub async fn enqueue_and_wait_with_cancel(
        &self,
        kind: &str,
        payload: Value,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> CommandResult {
        if !self.is_connected() {
            // Liveness is advisory only; the command is queued regardless.
            tracing::warn!(
                target = "command_relay::broker",
                kind = kind,
                "dispatching while agent appears disconnected"
            );
        }
        let command_id = self.enqueue(kind, payload);
        let result = self
            .wait_for_result_with_cancel(&command_id, timeout, cancel)
            .await;
        if result.is_timeout() {
            tracing::debug!(
                target = "command_relay::broker",
                command_id = %command_id,
                timeout_ms = timeout.as_millis() as u64,
                "dispatch timed out"
            );
        }
        result
    }

    pub fn record_heartbeat(&self) {
        self.inner.state.lock().liveness.record_heartbeat(now());
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().liveness.is_connected(now())
    }

    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn health(&self) -> HealthSnapshot {
        let state = self.inner.state.lock();
        HealthSnapshot {
            connected: state.liveness.is_connected(now()),
            pending_count: state.queue.len(),
            waiting_count: state.results.waiting_len(),
            stored_results: state.results.stored_len(),
            last_heartbeat_at: state.liveness.last_heartbeat_at(),
            poll_interval_ms: self.settings().poll_interval.as_millis() as u64,
        }
    }

    /// One garbage-collection pass. Called by the sweeper; public so tests
    /// and embedders can force one.
    pub fn sweep(&self) -> SweepReport {
        let now = now();
        let pending_ttl = self.settings().pending_ttl;
        let mut state = self.inner.state.lock();
        SweepReport {
            expired_commands: state.queue.evict_expired(now, pending_ttl),
            expired_results: state.results.evict_expired(now),
            abandoned_waiters: state.results.prune_abandoned(),
        }
    }
}

/// Unregisters a waiter however its wait ends, including when the waiting
/// future is dropped mid-flight.
struct WaiterGuard<'a> {
    broker: &'a Broker,
    key: WaiterKey,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.broker.inner.state.lock().results.release(&self.key);
    }
}
