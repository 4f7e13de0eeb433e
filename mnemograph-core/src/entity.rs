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

//! Entity and Relationship Types
//!
//! Defines the canonical node and edge types of the knowledge graph.
//! Canonical identity (id, aliases) may only be mutated by the entity
//! resolver and the merge detector; every other component is limited
//! to attribute updates.

use serde::{Deserialize, Serialize};

/// A unique identifier for entities in the knowledge graph
pub type EntityId = u64;

/// A canonical knowledge graph entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    /// Unique identifier
    pub id: EntityId,
    /// Canonical display name
    pub canonical_name: String,
    /// Entity type
    pub entity_type: EntityType,
    /// Extraction confidence (0.0 - 1.0)
    pub confidence: f64,
    /// Accumulated profile summary
    pub summary: String,
    /// Topic partition this entity belongs to
    pub topic: String,
    /// Profile embedding (fixed dimension, L2-normalized)
    pub embedding: Vec<f32>,
    /// Surface strings that resolve to this entity (set semantics,
    /// matched case-insensitively)
    pub aliases: Vec<String>,
    /// Watermark of the last message folded into the summary
    pub last_profiled_msg_id: u64,
    /// Last mention timestamp (microseconds since epoch)
    pub last_mentioned: u64,
}

impl Entity {
    /// Check whether a surface string is already a known alias.
    pub fn has_alias(&self, name: &str) -> bool {
        self.aliases.iter().any(|a| a.eq_ignore_ascii_case(name))
    }

    /// Add an alias if not already present. Returns true if added.
    pub fn add_alias(&mut self, name: &str) -> bool {
        if self.has_alias(name) {
            return false;
        }
        self.aliases.push(name.to_string());
        true
    }
}

/// Entity types in the knowledge graph
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    /// A person
    Person,
    /// A place or location
    Place,
    /// An organization, team, or institution
    Organization,
    /// An abstract concept, project, or topic of discussion
    Concept,
}

impl EntityType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "person" | "people" => Some(EntityType::Person),
            "place" | "location" => Some(EntityType::Place),
            "organization" | "org" | "company" => Some(EntityType::Organization),
            "concept" | "idea" | "topic" => Some(EntityType::Concept),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Person => "person",
            EntityType::Place => "place",
            EntityType::Organization => "organization",
            EntityType::Concept => "concept",
        }
    }
}

/// A relationship record between two canonical entities.
///
/// Multiple records may exist for the same pair, one per supporting
/// message. Aggregate weight and recency are derived from the record
/// set, never stored redundantly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Relationship {
    /// Source entity
    pub entity_a: EntityId,
    /// Target entity
    pub entity_b: EntityId,
    /// Message that evidences this relationship
    pub message_id: u64,
    /// Extraction confidence (0.0 - 1.0)
    pub confidence: f64,
    /// Observation timestamp (microseconds since epoch)
    pub observed_at: u64,
}

impl Relationship {
    /// Unordered pair key. Edges are undirected; (a, b) and (b, a)
    /// identify the same relationship.
    pub fn pair(&self) -> (EntityId, EntityId) {
        if self.entity_a <= self.entity_b {
            (self.entity_a, self.entity_b)
        } else {
            (self.entity_b, self.entity_a)
        }
    }

    /// Check whether the edge is a self-loop.
    pub fn is_self_loop(&self) -> bool {
        self.entity_a == self.entity_b
    }
}

/// A named visibility partition for entities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Topic {
    pub name: String,
    pub status: TopicStatus,
}

/// Topic visibility status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TopicStatus {
    /// Pinned: always surfaced, eligible for hot-topic context
    Hot,
    /// Normal visibility
    Active,
    /// Excluded from all retrieval-facing queries
    Inactive,
}

impl TopicStatus {
    /// Whether entities in a topic with this status are retrievable.
    pub fn is_visible(&self) -> bool {
        !matches!(self, TopicStatus::Inactive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_type_parse() {
        assert_eq!(EntityType::parse("PERSON"), Some(EntityType::Person));
        assert_eq!(EntityType::parse("org"), Some(EntityType::Organization));
        assert_eq!(EntityType::parse("Location"), Some(EntityType::Place));
        assert_eq!(EntityType::parse("widget"), None);
    }

    #[test]
    fn test_alias_set_semantics() {
        let mut entity = Entity {
            id: 1,
            canonical_name: "Marcus".to_string(),
            entity_type: EntityType::Person,
            confidence: 1.0,
            summary: String::new(),
            topic: "family".to_string(),
            embedding: vec![],
            aliases: vec!["Marcus".to_string()],
            last_profiled_msg_id: 0,
            last_mentioned: 0,
        };

        assert!(entity.has_alias("marcus"));
        assert!(!entity.add_alias("MARCUS"));
        assert!(entity.add_alias("Marc"));
        assert_eq!(entity.aliases.len(), 2);
    }

    #[test]
    fn test_relationship_pair_is_unordered() {
        let forward = Relationship {
            entity_a: 2,
            entity_b: 7,
            message_id: 1,
            confidence: 0.9,
            observed_at: 0,
        };
        let reverse = Relationship {
            entity_a: 7,
            entity_b: 2,
            message_id: 1,
            confidence: 0.9,
            observed_at: 0,
        };

        assert_eq!(forward.pair(), reverse.pair());
        assert!(!forward.is_self_loop());
    }
}
