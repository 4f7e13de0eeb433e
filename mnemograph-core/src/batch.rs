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

//! Batch Envelope & Wire Codec
//!
//! The batch envelope is the sole contract between the extraction
//! oracle (producer) and the reconciliation pipeline (consumer). The
//! codec is a pure transform: decoding rejects unknown type tags as
//! `MalformedBatch`, encoding is deterministic (fixed field order) so
//! a decoded batch re-encodes byte-for-byte across replay.
//!
//! Absent optional scalar fields decode to zero/empty.

use crate::error::PipelineError;
use serde::{Deserialize, Serialize};

/// Batch type discriminator
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum BatchType {
    #[serde(rename = "USER_MESSAGE")]
    UserMessage,
    #[serde(rename = "PROFILE_UPDATE")]
    ProfileUpdate,
    #[serde(rename = "SYSTEM_ENTITY")]
    SystemEntity,
}

/// Wire record for a candidate entity mention.
///
/// `id` is zero for unresolved mentions; the resolver assigns or
/// binds canonical ids. `PROFILE_UPDATE` batches carry the canonical
/// id of the entity being refreshed.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EntityRecord {
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub canonical_name: String,
    #[serde(default, rename = "type")]
    pub entity_type: String,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub last_profiled_msg_id: u64,
    #[serde(default)]
    pub aliases: Vec<String>,
}

/// Wire record for a candidate relationship.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RelationshipRecord {
    #[serde(default)]
    pub message_id: u64,
    #[serde(default)]
    pub entity_a: String,
    #[serde(default)]
    pub entity_b: String,
    #[serde(default)]
    pub confidence: f64,
}

/// An ingestion batch: the unit of atomic commit and retry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Batch {
    #[serde(rename = "type")]
    pub batch_type: BatchType,
    #[serde(default)]
    pub entities: Vec<EntityRecord>,
    #[serde(default)]
    pub relationships: Vec<RelationshipRecord>,
}

impl Batch {
    pub fn new(batch_type: BatchType) -> Self {
        Self {
            batch_type,
            entities: Vec::new(),
            relationships: Vec::new(),
        }
    }

    /// Encode to the canonical wire form.
    pub fn encode(&self) -> Vec<u8> {
        // Struct field order is fixed, so output is deterministic.
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Decode from the wire form.
    ///
    /// Any schema violation, including an unknown `type` tag, is a
    /// fatal `MalformedBatch`.
    pub fn decode(bytes: &[u8]) -> Result<Self, PipelineError> {
        serde_json::from_slice(bytes).map_err(|e| PipelineError::MalformedBatch(e.to_string()))
    }
}
