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

//! Mnemograph Core
//!
//! Fundamental data structures for the knowledge-graph write path:
//! entities, relationships, topics, the batch envelope, the error
//! taxonomy, configuration, and similarity math.

pub mod batch;
pub mod config;
pub mod entity;
pub mod error;
pub mod resilience;
pub mod similarity;

pub use batch::{Batch, BatchType, EntityRecord, RelationshipRecord};
pub use config::PipelineConfig;
pub use entity::{Entity, EntityId, EntityType, Relationship, Topic, TopicStatus};
pub use error::{FailureClass, PipelineError};

/// Current timestamp in microseconds since the Unix epoch.
pub fn now_micros() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}
