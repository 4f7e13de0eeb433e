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

//! Mnemograph Pipeline
//!
//! The write-side reconciliation pipeline: entity resolution, batch
//! consumption with retry/park semantics, background merge detection,
//! profile refinement, dead-letter replay, and the scheduler that
//! coordinates background jobs through leases.

pub mod consumer;
pub mod dlq;
pub mod locks;
pub mod merge;
pub mod oracle;
pub mod refiner;
pub mod resolver;
pub mod scheduler;


pub use consumer::{BatchConsumer, BatchProcessor, BatchState};
pub use dlq::{DlqReplayManager, ReplayReport};
pub use locks::EntityLocks;
pub use merge::{MergeDetector, MergeProposal, SweepReport};
pub use oracle::{
    CandidateProfile, ExtractionOracle, HeuristicCondenser, HeuristicJudge, ScriptedJudge,
    SimilarityJudge, SummaryCondenser,
};
pub use refiner::ProfileRefiner;
pub use resolver::{EntityResolver, ResolutionOutcome};
pub use scheduler::{
    BackgroundJob, DlqReplayJob, JobContext, MergeDetectionJob, ProfileSweepJob, Scheduler,
};
