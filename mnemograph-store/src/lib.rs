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

//! Mnemograph Store
//!
//! Storage backends for the reconciliation pipeline: the graph store
//! (system of record for entities, relationships, and topics), the
//! ingestion queue with its dead-letter queue, and the lease table
//! that coordinates background jobs.

pub mod graph;
pub mod lease;
pub mod queue;
pub mod visibility;

pub use graph::{GraphOp, GraphStore, GraphWriteSet, MemoryGraph, MergeReport, RelatedEntity};
pub use lease::{ActivityTracker, JobKind, LeaseHandle, LeaseTable, MaintenanceFlag};
pub use queue::{BatchQueue, DeadLetterQueue, DlqEntry, QueuedBatch};
pub use visibility::TopicFilter;
