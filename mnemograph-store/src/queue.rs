// Copyright 2025 Sushanth (https://github.com/sushanthpy)
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Ingestion queue and dead-letter queue.
//!
//! The queue store owns batch durability: pending batches wait here,
//! transient failures come back with a not-before delay, and batches
//! that exhaust their retry budget (or fail fatally) are parked in
//! the dead-letter queue with their attempt history. Nothing is ever
//! silently dropped.

use dashmap::DashMap;
use mnemograph_core::{now_micros, FailureClass};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::warn;

/// A batch waiting on the ingestion queue.
#[derive(Debug, Clone)]
pub struct QueuedBatch {
    pub batch_id: u64,
    /// Wire-encoded envelope.
    pub payload: Vec<u8>,
    /// Transient attempts consumed so far.
    pub attempts: u32,
    /// Set after an ambiguous-binding deferral: the next resolution
    /// pass must use the more expensive verification path.
    pub escalate: bool,
    /// Earliest eligible dequeue time (microseconds since epoch).
    pub not_before: u64,
    pub enqueued_at: u64,
}

/// In-memory ingestion queue with delayed requeue support.
pub struct BatchQueue {
    inner: parking_lot::Mutex<VecDeque<QueuedBatch>>,
    notify: Notify,
    next_batch_id: AtomicU64,
}

impl BatchQueue {
    pub fn new() -> Self {
        Self {
            inner: parking_lot::Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            next_batch_id: AtomicU64::new(1),
        }
    }

    /// Submit a freshly produced batch. This is the producer-facing
    /// endpoint used by the extraction oracle's output stage.
    pub fn submit(&self, payload: Vec<u8>) -> u64 {
        let batch_id = self.next_batch_id.fetch_add(1, Ordering::SeqCst);
        let now = now_micros();

        self.inner.lock().push_back(QueuedBatch {
            batch_id,
            payload,
            attempts: 0,
            escalate: false,
            not_before: 0,
            enqueued_at: now,
        });
        self.notify.notify_one();
        batch_id
    }

    /// Put a batch back, optionally delayed. Used for transient
    /// retries and ambiguity deferrals.
    pub fn requeue(&self, mut batch: QueuedBatch, delay: Duration) {
        batch.not_before = now_micros() + delay.as_micros() as u64;
        self.inner.lock().push_back(batch);
        self.notify.notify_one();
    }

    /// Receive the next eligible batch, waiting up to `timeout`.
    pub async fn recv(&self, timeout: Duration) -> Option<QueuedBatch> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            {
                let mut queue = self.inner.lock();
                let now = now_micros();
                if let Some(pos) = queue.iter().position(|b| b.not_before <= now) {
                    return queue.remove(pos);
                }
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return None;
            }

            // Wake on new work or re-check soon for delayed items.
            let poll = remaining.min(Duration::from_millis(20));
            let _ = tokio::time::timeout(poll, self.notify.notified()).await;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl Default for BatchQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// A parked batch with its failure history.
#[derive(Debug, Clone)]
pub struct DlqEntry {
    pub batch_id: u64,
    pub payload: Vec<u8>,
    /// Human-readable terminal failure reason.
    pub reason: String,
    pub class: FailureClass,
    pub attempts: u32,
    pub first_seen: u64,
    pub last_attempt: u64,
}

/// Durable parking lot for batches that exhausted their retry policy
/// or failed fatally.
pub struct DeadLetterQueue {
    entries: DashMap<u64, DlqEntry>,
}

impl DeadLetterQueue {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Park a batch. Overwrites any previous entry for the same
    /// batch id, keeping the original first-seen timestamp.
    pub fn park(&self, mut entry: DlqEntry) {
        if let Some(existing) = self.entries.get(&entry.batch_id) {
            entry.first_seen = existing.first_seen;
        }
        warn!(
            "Parked batch {} after {} attempts: {}",
            entry.batch_id, entry.attempts, entry.reason
        );
        self.entries.insert(entry.batch_id, entry);
    }

    /// Remove a successfully replayed entry.
    pub fn resolve(&self, batch_id: u64) -> Option<DlqEntry> {
        self.entries.remove(&batch_id).map(|(_, e)| e)
    }

    /// Entries eligible for automatic replay: transient failure
    /// class only. Entries remain parked until explicitly resolved.
    pub fn replayable(&self, limit: usize) -> Vec<DlqEntry> {
        self.entries
            .iter()
            .filter(|e| e.class == FailureClass::Transient)
            .take(limit)
            .map(|e| e.clone())
            .collect()
    }

    /// Record a failed replay attempt in place.
    pub fn record_attempt(&self, batch_id: u64, reason: &str) {
        if let Some(mut entry) = self.entries.get_mut(&batch_id) {
            entry.attempts += 1;
            entry.last_attempt = now_micros();
            entry.reason = reason.to_string();
        }
    }

    pub fn get(&self, batch_id: u64) -> Option<DlqEntry> {
        self.entries.get(&batch_id).map(|e| e.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for DeadLetterQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_submit_and_recv() {
        let queue = BatchQueue::new();
        let id = queue.submit(b"payload".to_vec());

        let batch = queue.recv(Duration::from_millis(50)).await.unwrap();
        assert_eq!(batch.batch_id, id);
        assert_eq!(batch.attempts, 0);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_recv_times_out_empty() {
        let queue = BatchQueue::new();
        assert!(queue.recv(Duration::from_millis(10)).await.is_none());
    }

    #[tokio::test]
    async fn test_requeue_respects_delay() {
        let queue = BatchQueue::new();
        queue.submit(b"x".to_vec());
        let batch = queue.recv(Duration::from_millis(50)).await.unwrap();

        queue.requeue(batch, Duration::from_millis(80));

        // Not eligible yet.
        assert!(queue.recv(Duration::from_millis(10)).await.is_none());
        // Eligible after the delay.
        let batch = queue.recv(Duration::from_millis(200)).await.unwrap();
        assert_eq!(batch.batch_id, 1);
    }

    #[test]
    fn test_dlq_park_and_replayable() {
        let dlq = DeadLetterQueue::new();

        dlq.park(DlqEntry {
            batch_id: 1,
            payload: vec![],
            reason: "store timeout".to_string(),
            class: FailureClass::Transient,
            attempts: 5,
            first_seen: 100,
            last_attempt: 100,
        });
        dlq.park(DlqEntry {
            batch_id: 2,
            payload: vec![],
            reason: "malformed batch".to_string(),
            class: FailureClass::Fatal,
            attempts: 0,
            first_seen: 100,
            last_attempt: 100,
        });

        let replayable = dlq.replayable(10);
        assert_eq!(replayable.len(), 1);
        assert_eq!(replayable[0].batch_id, 1);

        // Fatal entries stay put until an operator intervenes.
        assert_eq!(dlq.len(), 2);
        dlq.resolve(1);
        assert_eq!(dlq.len(), 1);
    }

    #[test]
    fn test_dlq_attempt_metadata_updates() {
        let dlq = DeadLetterQueue::new();
        dlq.park(DlqEntry {
            batch_id: 7,
            payload: vec![],
            reason: "timeout".to_string(),
            class: FailureClass::Transient,
            attempts: 5,
            first_seen: 100,
            last_attempt: 100,
        });

        dlq.record_attempt(7, "timeout again");
        let entry = dlq.get(7).unwrap();
        assert_eq!(entry.attempts, 6);
        assert_eq!(entry.reason, "timeout again");
        assert_eq!(entry.first_seen, 100);
    }
}
