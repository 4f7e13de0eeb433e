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

//! DLQ Replay Manager
//!
//! Re-attempts parked batches whose failure class is transient.
//! Successfully committed entries leave the dead-letter queue;
//! entries that fail again stay parked with updated attempt
//! metadata. Fatal entries (malformed batches) are never replayed
//! automatically and wait for operator intervention.

use mnemograph_core::config::DlqConfig;
use mnemograph_store::DeadLetterQueue;
use std::sync::Arc;
use tracing::{info, warn};

use crate::consumer::BatchProcessor;

/// Outcome of one replay sweep.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub attempted: usize,
    pub committed: usize,
    pub still_parked: usize,
}

pub struct DlqReplayManager {
    dlq: Arc<DeadLetterQueue>,
    processor: Arc<dyn BatchProcessor>,
    config: DlqConfig,
}

impl DlqReplayManager {
    pub fn new(
        dlq: Arc<DeadLetterQueue>,
        processor: Arc<dyn BatchProcessor>,
        config: DlqConfig,
    ) -> Self {
        Self {
            dlq,
            processor,
            config,
        }
    }

    /// Re-attempt transient-parked entries, up to the configured
    /// sweep size. Escalated processing is used so a batch that was
    /// deferred before parking cannot defer forever.
    pub async fn replay(&self) -> ReplayReport {
        let mut report = ReplayReport::default();

        for entry in self.dlq.replayable(self.config.replay_batch) {
            report.attempted += 1;

            match self.processor.process(&entry.payload, true).await {
                Ok(()) => {
                    self.dlq.resolve(entry.batch_id);
                    report.committed += 1;
                    info!("Replayed parked batch {} successfully", entry.batch_id);
                }
                Err(e) => {
                    self.dlq.record_attempt(entry.batch_id, &e.to_string());
                    report.still_parked += 1;
                    warn!("Replay of batch {} failed again: {}", entry.batch_id, e);
                }
            }
        }

        if report.attempted > 0 {
            info!(
                "DLQ replay: {} attempted, {} committed, {} still parked",
                report.attempted, report.committed, report.still_parked
            );
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mnemograph_core::{now_micros, FailureClass, PipelineError};
    use mnemograph_store::DlqEntry;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Processor that fails until flipped healthy.
    struct FlakyProcessor {
        healthy: AtomicBool,
    }

    #[async_trait]
    impl BatchProcessor for FlakyProcessor {
        async fn process(&self, _payload: &[u8], _escalated: bool) -> Result<(), PipelineError> {
            if self.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(PipelineError::TransientStore("still down".to_string()))
            }
        }
    }

    fn parked(dlq: &DeadLetterQueue, batch_id: u64, class: FailureClass) {
        dlq.park(DlqEntry {
            batch_id,
            payload: vec![1, 2, 3],
            reason: "store timeout".to_string(),
            class,
            attempts: 5,
            first_seen: now_micros(),
            last_attempt: now_micros(),
        });
    }

    #[tokio::test]
    async fn test_replay_commits_when_healthy() {
        let dlq = Arc::new(DeadLetterQueue::new());
        parked(&dlq, 1, FailureClass::Transient);

        let processor = Arc::new(FlakyProcessor {
            healthy: AtomicBool::new(true),
        });
        let manager = DlqReplayManager::new(dlq.clone(), processor, DlqConfig::default());

        let report = manager.replay().await;
        assert_eq!(report.committed, 1);
        assert!(dlq.is_empty());
    }

    #[tokio::test]
    async fn test_replay_failure_updates_metadata() {
        let dlq = Arc::new(DeadLetterQueue::new());
        parked(&dlq, 1, FailureClass::Transient);

        let processor = Arc::new(FlakyProcessor {
            healthy: AtomicBool::new(false),
        });
        let manager = DlqReplayManager::new(dlq.clone(), processor, DlqConfig::default());

        let report = manager.replay().await;
        assert_eq!(report.still_parked, 1);

        // Entry still parked, attempt history advanced, never
        // silently dropped.
        let entry = dlq.get(1).unwrap();
        assert_eq!(entry.attempts, 6);
        assert_eq!(entry.reason, "transient store error: still down");
    }

    #[tokio::test]
    async fn test_fatal_entries_are_not_replayed() {
        let dlq = Arc::new(DeadLetterQueue::new());
        parked(&dlq, 1, FailureClass::Fatal);

        let processor = Arc::new(FlakyProcessor {
            healthy: AtomicBool::new(true),
        });
        let manager = DlqReplayManager::new(dlq.clone(), processor, DlqConfig::default());

        let report = manager.replay().await;
        assert_eq!(report.attempted, 0);
        assert_eq!(dlq.len(), 1);
    }
}
