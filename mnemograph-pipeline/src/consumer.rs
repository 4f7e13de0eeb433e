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

//! Batch Consumer
//!
//! Drains the ingestion queue and drives each batch through the
//! state machine `pending -> processing -> {committed | retry(n) |
//! parked}`. Transient failures back off and retry up to the
//! configured attempt budget; fatal failures park immediately with
//! zero retry budget consumed. A processing timeout counts as
//! transient: the batch is requeued, never left half-committed.
//!
//! Multiple consumers may run concurrently; batches are not required
//! to commit in arrival order, and provenance is keyed by each
//! batch's own message ids, so reordering cannot corrupt evidence.

use async_trait::async_trait;
use mnemograph_core::resilience::RetryPolicy;
use mnemograph_core::{now_micros, Batch, BatchType, PipelineError};
use mnemograph_store::{BatchQueue, DeadLetterQueue, DlqEntry, GraphStore, QueuedBatch};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::locks::EntityLocks;
use crate::refiner::ProfileRefiner;
use crate::resolver::EntityResolver;

/// Per-batch lifecycle states, reported for observability and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Pending,
    Processing,
    Committed,
    Retry(u32),
    Parked,
}

/// Processes one decoded-or-not batch payload to completion. The
/// DLQ replay manager drives parked payloads through the same
/// implementation the live queue uses.
#[async_trait]
pub trait BatchProcessor: Send + Sync {
    async fn process(&self, payload: &[u8], escalated: bool) -> Result<(), PipelineError>;
}

pub struct BatchConsumer {
    queue: Arc<BatchQueue>,
    dlq: Arc<DeadLetterQueue>,
    resolver: Arc<EntityResolver>,
    refiner: Arc<ProfileRefiner>,
    store: Arc<dyn GraphStore>,
    locks: Arc<EntityLocks>,
    retry: RetryPolicy,
    /// Budget for one processing pass; exceeding it cancels the pass
    /// and requeues the batch as a transient failure.
    processing_timeout: Duration,
}

impl BatchConsumer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<BatchQueue>,
        dlq: Arc<DeadLetterQueue>,
        resolver: Arc<EntityResolver>,
        refiner: Arc<ProfileRefiner>,
        store: Arc<dyn GraphStore>,
        locks: Arc<EntityLocks>,
        retry: RetryPolicy,
        processing_timeout: Duration,
    ) -> Self {
        Self {
            queue,
            dlq,
            resolver,
            refiner,
            store,
            locks,
            retry,
            processing_timeout,
        }
    }

    /// Consumer loop. Run one task per desired worker; workers draw
    /// from the shared queue in parallel.
    pub async fn run(self: Arc<Self>) {
        info!("Batch consumer started");
        loop {
            self.poll_once(Duration::from_secs(1)).await;
        }
    }

    /// Receive and handle at most one batch. Returns the terminal
    /// state for this pass, or None if the queue stayed empty.
    pub async fn poll_once(&self, wait: Duration) -> Option<BatchState> {
        let batch = self.queue.recv(wait).await?;
        Some(self.handle(batch).await)
    }

    async fn handle(&self, batch: QueuedBatch) -> BatchState {
        debug!(
            "Processing batch {} (attempt {}, escalated: {})",
            batch.batch_id, batch.attempts, batch.escalate
        );

        let result = match tokio::time::timeout(
            self.processing_timeout,
            self.process(&batch.payload, batch.escalate),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(PipelineError::TransientStore(
                "batch processing timed out".to_string(),
            )),
        };

        match result {
            Ok(()) => {
                debug!("Batch {} committed", batch.batch_id);
                BatchState::Committed
            }
            Err(PipelineError::AmbiguousBinding { mention, topic }) if !batch.escalate => {
                // Defer once: back on the queue with the expensive
                // verification flag, no retry budget consumed.
                info!(
                    "Batch {} deferred on ambiguous mention '{}' in '{}'",
                    batch.batch_id, mention, topic
                );
                let attempts = batch.attempts;
                let mut batch = batch;
                batch.escalate = true;
                self.queue
                    .requeue(batch, self.retry.delay_for_attempt(0));
                BatchState::Retry(attempts)
            }
            Err(e) if e.is_transient() => {
                let attempts = batch.attempts + 1;
                if attempts >= self.retry.max_attempts {
                    self.park(&batch, attempts, &e);
                    BatchState::Parked
                } else {
                    let delay = self.retry.delay_for_attempt(attempts - 1);
                    debug!(
                        "Batch {} retry {} in {:?}: {}",
                        batch.batch_id, attempts, delay, e
                    );
                    let mut batch = batch;
                    batch.attempts = attempts;
                    self.queue.requeue(batch, delay);
                    BatchState::Retry(attempts)
                }
            }
            Err(e) => {
                // Fatal: parked directly, attempts untouched.
                error!("Batch {} failed fatally: {}", batch.batch_id, e);
                self.park(&batch, batch.attempts, &e);
                BatchState::Parked
            }
        }
    }

    fn park(&self, batch: &QueuedBatch, attempts: u32, error: &PipelineError) {
        let now = now_micros();
        self.dlq.park(DlqEntry {
            batch_id: batch.batch_id,
            payload: batch.payload.clone(),
            reason: error.to_string(),
            class: error.failure_class(),
            attempts,
            first_seen: batch.enqueued_at,
            last_attempt: now,
        });
    }

    async fn apply_profile_updates(&self, batch: &Batch) -> Result<(), PipelineError> {
        for record in &batch.entities {
            if record.id == 0 {
                debug!("Profile update without canonical id skipped");
                continue;
            }

            // Serialize against concurrent bind/merge/refine.
            let _guard = self.locks.acquire(record.id).await?;
            self.store
                .update_profile(
                    record.id,
                    &record.summary,
                    record.embedding.clone(),
                    record.last_profiled_msg_id,
                )
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl BatchProcessor for BatchConsumer {
    async fn process(&self, payload: &[u8], escalated: bool) -> Result<(), PipelineError> {
        let batch = Batch::decode(payload)?;

        match batch.batch_type {
            BatchType::UserMessage | BatchType::SystemEntity => {
                let outcome = self.resolver.resolve_batch(&batch, escalated).await?;
                self.refiner.observe_outcome(&outcome).await;
                Ok(())
            }
            BatchType::ProfileUpdate => self.apply_profile_updates(&batch).await,
        }
    }
}
