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

//! Pipeline error taxonomy.
//!
//! Every per-batch failure is caught at the batch boundary and folded
//! into a retry/park decision; nothing propagates past the consumer
//! that owns the batch.

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    /// Schema or decoding violation. Fatal: parked without retries.
    #[error("malformed batch: {0}")]
    MalformedBatch(String),

    /// Connectivity, timeout, or lock contention against a store.
    /// Retried with backoff.
    #[error("transient store error: {0}")]
    TransientStore(String),

    /// The resolver cannot confidently bind a mention. The batch is
    /// deferred once with an escalation flag before the mention is
    /// forced to a new entity.
    #[error("ambiguous binding for mention '{mention}' in topic '{topic}'")]
    AmbiguousBinding { mention: String, topic: String },

    /// Two merge proposals touched overlapping entities within one
    /// sweep; the later proposal is skipped for this cycle.
    #[error("merge conflict: entity {entity_id} already touched this sweep")]
    MergeConflict { entity_id: u64 },

    /// Another runner holds the lease for this job type. The cycle is
    /// skipped; never surfaced to operators as an error.
    #[error("lease unavailable for job '{job}'")]
    LeaseUnavailable { job: &'static str },

    /// The external similarity/verification service failed.
    #[error("verification service error: {0}")]
    Verification(String),
}

impl PipelineError {
    /// Whether the failure is worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PipelineError::TransientStore(_) | PipelineError::Verification(_)
        )
    }

    /// Classify for DLQ bookkeeping.
    pub fn failure_class(&self) -> FailureClass {
        if self.is_transient() {
            FailureClass::Transient
        } else {
            FailureClass::Fatal
        }
    }
}

/// Coarse failure classification recorded on DLQ entries. Replay only
/// re-attempts entries parked with a transient-compatible class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FailureClass {
    Transient,
    Fatal,
}
