use std::{
    collections::{HashMap, VecDeque},
    time::{Duration, Instant},
};

use chrono::Utc;
use rand::Rng;
use serde_json::Value;

use crate::protocol::Command;

#[derive(Debug)]
struct QueuedCommand {
    command: Command,
    enqueued: Instant,
}

/// FIFO of commands not yet handed to the agent.
///
/// Besides the queue itself this keeps a record of every id it has issued
/// (for `pending_ttl`), so result submissions can be checked against ids this
/// broker actually produced.
#[derive(Debug)]
pub struct CommandQueue {
    queued: VecDeque<QueuedCommand>,
    issued: HashMap<String, Instant>,
    issued_order: VecDeque<(String, Instant)>,
    next_seq: u64,
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandQueue {
    pub fn new() -> Self {
        Self {
            queued: VecDeque::new(),
            issued: HashMap::new(),
            issued_order: VecDeque::new(),
            next_seq: 0,
        }
    }

    /// Append a command to the tail. Never blocks and never rejects.
    pub fn enqueue(&mut self, kind: &str, payload: Value, now: Instant) -> String {
        self.next_seq += 1;
        let suffix: u32 = rand::thread_rng().gen_range(0..0x100_0000);
        let id = format!("c{}_{:06x}", self.next_seq, suffix);

        self.issued.insert(id.clone(), now);
        self.issued_order.push_back((id.clone(), now));
        self.queued.push_back(QueuedCommand {
            command: Command {
                id: id.clone(),
                kind: kind.to_string(),
                payload,
                enqueued_at: Utc::now(),
            },
            enqueued: now,
        });
        id
    }

    /// Pop up to `max_batch` of the oldest commands in insertion order.
    /// Drained commands are gone for good; there is no way back in.
    pub fn drain(&mut self, max_batch: usize) -> Vec<Command> {
        let take = max_batch.min(self.queued.len());
        self.queued
            .drain(..take)
            .map(|queued| queued.command)
            .collect()
    }

    pub fn was_issued(&self, id: &str) -> bool {
        self.issued.contains_key(id)
    }

    /// Drop undrained commands and issued-id records older than `ttl`.
    /// Returns how many undrained commands expired.
    pub fn evict_expired(&mut self, now: Instant, ttl: Duration) -> usize {
        let before = self.queued.len();
        self.queued
            .retain(|queued| now.saturating_duration_since(queued.enqueued) < ttl);

        while let Some((id, ts)) = self.issued_order.front().cloned() {
            if now.saturating_duration_since(ts) < ttl {
                break;
            }
            self.issued_order.pop_front();
            self.issued.remove(&id);
        }

        debug_assert_eq!(
            self.issued.len(),
            self.issued_order.len(),
            "CommandQueue: issued map and order out of sync"
        );
        before - self.queued.len()
    }

    pub fn len(&self) -> usize {
        self.queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }
}
