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

//! Graph Store
//!
//! System of record for entities, relationships, and topics. Writes
//! are transactional: a batch write set applies fully or not at all,
//! and a merge repoints relationships and unions aliases atomically.
//! Readers use the store's snapshot semantics and never take entity
//! mutation locks.

use async_trait::async_trait;
use dashmap::DashMap;
use mnemograph_core::similarity::normalize;
use mnemograph_core::{Entity, EntityId, EntityType, PipelineError, Relationship, Topic, TopicStatus};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{create_dir_all, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

use crate::visibility::TopicFilter;

/// A single mutation inside a batch write set.
#[derive(Debug, Clone)]
pub enum GraphOp {
    /// Create a new canonical entity.
    CreateEntity(Entity),
    /// Bind a surface string to an existing entity (no-op if already
    /// present).
    AddAlias { id: EntityId, alias: String },
    /// Record a mention of an existing entity.
    Touch {
        id: EntityId,
        at: u64,
        confidence: f64,
    },
    /// Append a relationship record. Duplicate provenance for the
    /// same (pair, message_id) is ignored.
    AddRelationship(Relationship),
}

/// The unit of atomic commit: either every op applies or none do.
#[derive(Debug, Clone, Default)]
pub struct GraphWriteSet {
    pub ops: Vec<GraphOp>,
}

impl GraphWriteSet {
    pub fn push(&mut self, op: GraphOp) {
        self.ops.push(op);
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Outcome of merging one entity into another.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub aliases_added: usize,
    pub relationships_repointed: usize,
    pub self_loops_dropped: usize,
}

/// A connected entity with derived connection strength.
#[derive(Debug, Clone)]
pub struct RelatedEntity {
    pub entity: Entity,
    /// Number of supporting relationship records.
    pub weight: usize,
    /// Provenance message ids, most recent last.
    pub message_ids: Vec<u64>,
    pub last_seen: u64,
}

/// Transactional graph store interface.
///
/// Only the entity resolver and the merge detector may issue
/// identity-affecting operations (`CreateEntity`, `AddAlias`,
/// `merge_entities`); all other writers are limited to attribute
/// updates.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Allocate a fresh canonical entity id.
    fn allocate_id(&self) -> EntityId;

    /// Apply a write set atomically.
    async fn apply(&self, writes: GraphWriteSet) -> Result<(), PipelineError>;

    async fn entity(&self, id: EntityId) -> Option<Entity>;

    /// Exact alias lookup within a topic (case-insensitive).
    async fn find_alias(&self, topic: &str, name: &str) -> Option<EntityId>;

    /// Write-path candidate set: all entities of a type within a
    /// topic, regardless of topic status. Resolution must see
    /// entities in inactive topics or it would mint duplicates there.
    async fn resolve_candidates(&self, topic: &str, entity_type: EntityType) -> Vec<Entity>;

    /// Retrieval-facing listing for a topic.
    async fn entities_in_topic(&self, topic: &str, filter: &TopicFilter) -> Vec<Entity>;

    /// Substring search over canonical names and aliases.
    async fn search_entities(&self, query: &str, filter: &TopicFilter, limit: usize)
        -> Vec<Entity>;

    /// Entities connected to `id`, with derived weight and recency.
    async fn related_entities(&self, id: EntityId, filter: &TopicFilter) -> Vec<RelatedEntity>;

    /// Most recently active entities per hot topic.
    async fn hot_topic_context(&self, per_topic: usize) -> Vec<(String, Vec<Entity>)>;

    /// Number of relationship records evidencing an entity.
    async fn evidence_count(&self, id: EntityId) -> usize;

    /// Merge `loser` into `winner`: union aliases, adopt the merged
    /// summary, repoint every relationship, delete the loser. Atomic.
    async fn merge_entities(
        &self,
        winner: EntityId,
        loser: EntityId,
        merged_summary: &str,
    ) -> Result<MergeReport, PipelineError>;

    /// Replace summary/embedding behind a monotonic watermark.
    /// Returns false when the watermark would regress (stale update
    /// skipped).
    async fn update_profile(
        &self,
        id: EntityId,
        summary: &str,
        embedding: Vec<f32>,
        watermark: u64,
    ) -> Result<bool, PipelineError>;

    /// Entities whose profile watermark is behind `watermark`.
    async fn stale_profiles(&self, watermark: u64, limit: usize) -> Vec<Entity>;

    async fn set_topic_status(&self, name: &str, status: TopicStatus) -> Result<(), PipelineError>;

    async fn topic_status(&self, name: &str) -> Option<TopicStatus>;

    async fn topics(&self) -> Vec<Topic>;

    async fn entity_count(&self) -> usize;
}

/// In-memory graph store with optional snapshot persistence.
pub struct MemoryGraph {
    /// Entity storage (id -> Entity)
    entities: DashMap<EntityId, Entity>,
    /// (topic, lowercased alias) -> entity id
    alias_index: DashMap<String, EntityId>,
    /// Unordered pair -> relationship records
    edges: DashMap<(EntityId, EntityId), Vec<Relationship>>,
    /// Topic statuses
    topics: DashMap<String, TopicStatus>,
    /// Next entity id
    next_id: AtomicU64,
    /// Transaction boundary: batch apply, merge, and status toggles
    /// take the write side; retrieval queries take the read side.
    tx: RwLock<()>,
    /// Snapshot path
    persist_path: Option<PathBuf>,
}

fn alias_key(topic: &str, name: &str) -> String {
    format!("{}\u{1}{}", topic.trim().to_lowercase(), name.trim().to_lowercase())
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self {
            entities: DashMap::new(),
            alias_index: DashMap::new(),
            edges: DashMap::new(),
            topics: DashMap::new(),
            next_id: AtomicU64::new(1),
            tx: RwLock::new(()),
            persist_path: None,
        }
    }

    /// Open a store backed by a snapshot file, loading it if present.
    pub fn with_persistence<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();

        if path.exists() {
            Self::load_from_disk(&path)
        } else {
            let mut graph = Self::new();
            graph.persist_path = Some(path);
            Ok(graph)
        }
    }

    /// Validate a write set against current state. Relationships must
    /// reference entities that exist or are created earlier in the
    /// same set.
    fn validate(&self, writes: &GraphWriteSet) -> Result<(), PipelineError> {
        let mut created: Vec<EntityId> = Vec::new();

        for op in &writes.ops {
            match op {
                GraphOp::CreateEntity(entity) => {
                    created.push(entity.id);
                }
                GraphOp::AddAlias { id, .. } | GraphOp::Touch { id, .. } => {
                    if !self.entities.contains_key(id) && !created.contains(id) {
                        return Err(PipelineError::MalformedBatch(format!(
                            "write set references unknown entity {}",
                            id
                        )));
                    }
                }
                GraphOp::AddRelationship(rel) => {
                    for id in [rel.entity_a, rel.entity_b] {
                        if !self.entities.contains_key(&id) && !created.contains(&id) {
                            return Err(PipelineError::MalformedBatch(format!(
                                "relationship references unknown entity {}",
                                id
                            )));
                        }
                    }
                }
            }
        }

        Ok(())
    }

    fn insert_entity(&self, mut entity: Entity) {
        normalize(&mut entity.embedding);

        self.topics
            .entry(entity.topic.clone())
            .or_insert(TopicStatus::Active);

        for alias in &entity.aliases {
            self.alias_index
                .insert(alias_key(&entity.topic, alias), entity.id);
        }
        self.alias_index
            .insert(alias_key(&entity.topic, &entity.canonical_name), entity.id);

        // Keep the id counter ahead of externally assigned ids.
        let floor = entity.id + 1;
        self.next_id.fetch_max(floor, Ordering::SeqCst);

        self.entities.insert(entity.id, entity);
    }

    fn add_relationship_record(&self, rel: Relationship) -> bool {
        if rel.is_self_loop() {
            debug!("Dropping self-loop relationship on entity {}", rel.entity_a);
            return false;
        }

        let mut records = self.edges.entry(rel.pair()).or_default();
        if records.iter().any(|r| r.message_id == rel.message_id) {
            return false;
        }
        records.push(rel);
        true
    }

    fn status_of(&self, topic: &str) -> Option<TopicStatus> {
        self.topics.get(topic).map(|s| *s)
    }

    /// Save a snapshot to disk (atomic replace).
    pub fn save_to_disk(&self) -> std::io::Result<()> {
        let Some(ref path) = self.persist_path else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            create_dir_all(parent)?;
        }

        let _guard = self.tx.read();
        let data = GraphSnapshot {
            entities: self.entities.iter().map(|e| e.clone()).collect(),
            edges: self.edges.iter().flat_map(|e| e.clone()).collect(),
            topics: self
                .topics
                .iter()
                .map(|t| (t.key().clone(), *t.value()))
                .collect(),
            next_id: self.next_id.load(Ordering::SeqCst),
        };
        drop(_guard);

        let temp_path = path.with_extension("tmp");
        let file = File::create(&temp_path)?;
        let mut writer = BufWriter::new(file);

        serde_json::to_writer(&mut writer, &data)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

        writer.flush()?;
        std::fs::rename(&temp_path, path)?;

        Ok(())
    }

    fn load_from_disk(path: &Path) -> std::io::Result<Self> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);

        let data: GraphSnapshot = serde_json::from_reader(reader)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

        let graph = Self::new();

        for entity in data.entities {
            graph.insert_entity(entity);
        }
        for rel in data.edges {
            graph.add_relationship_record(rel);
        }
        for (name, status) in data.topics {
            graph.topics.insert(name, status);
        }

        // Sync the id counter past anything persisted.
        let max_id = graph.entities.iter().map(|e| e.id).max().unwrap_or(0);
        graph
            .next_id
            .store(data.next_id.max(max_id + 1), Ordering::SeqCst);

        let graph = Self {
            persist_path: Some(path.to_path_buf()),
            ..graph
        };

        info!(
            "Loaded graph snapshot: {} entities, {} edges",
            graph.entities.len(),
            graph.edges.len()
        );

        Ok(graph)
    }
}

impl Default for MemoryGraph {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GraphStore for MemoryGraph {
    fn allocate_id(&self) -> EntityId {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    async fn apply(&self, writes: GraphWriteSet) -> Result<(), PipelineError> {
        let _guard = self.tx.write();

        // All-or-nothing: reject the whole set before touching state.
        self.validate(&writes)?;

        for op in writes.ops {
            match op {
                GraphOp::CreateEntity(entity) => {
                    self.insert_entity(entity);
                }
                GraphOp::AddAlias { id, alias } => {
                    if let Some(mut entity) = self.entities.get_mut(&id) {
                        if entity.add_alias(&alias) {
                            let key = alias_key(&entity.topic, &alias);
                            drop(entity);
                            self.alias_index.insert(key, id);
                        }
                    }
                }
                GraphOp::Touch { id, at, confidence } => {
                    if let Some(mut entity) = self.entities.get_mut(&id) {
                        entity.last_mentioned = entity.last_mentioned.max(at);
                        if confidence > entity.confidence {
                            entity.confidence = confidence;
                        }
                    }
                }
                GraphOp::AddRelationship(rel) => {
                    self.add_relationship_record(rel);
                }
            }
        }

        Ok(())
    }

    async fn entity(&self, id: EntityId) -> Option<Entity> {
        self.entities.get(&id).map(|e| e.clone())
    }

    async fn find_alias(&self, topic: &str, name: &str) -> Option<EntityId> {
        self.alias_index.get(&alias_key(topic, name)).map(|id| *id)
    }

    async fn resolve_candidates(&self, topic: &str, entity_type: EntityType) -> Vec<Entity> {
        self.entities
            .iter()
            .filter(|e| e.topic == topic && e.entity_type == entity_type)
            .map(|e| e.clone())
            .collect()
    }

    async fn entities_in_topic(&self, topic: &str, filter: &TopicFilter) -> Vec<Entity> {
        let _guard = self.tx.read();

        if !filter.allows(self.status_of(topic)) {
            return Vec::new();
        }

        let mut result: Vec<Entity> = self
            .entities
            .iter()
            .filter(|e| e.topic == topic)
            .map(|e| e.clone())
            .collect();
        result.sort_by(|a, b| b.last_mentioned.cmp(&a.last_mentioned));
        result
    }

    async fn search_entities(
        &self,
        query: &str,
        filter: &TopicFilter,
        limit: usize,
    ) -> Vec<Entity> {
        let _guard = self.tx.read();
        let needle = query.trim().to_lowercase();

        let mut result: Vec<Entity> = self
            .entities
            .iter()
            .filter(|e| filter.allows(self.status_of(&e.topic)))
            .filter(|e| {
                e.canonical_name.to_lowercase().contains(&needle)
                    || e.aliases.iter().any(|a| a.to_lowercase().contains(&needle))
            })
            .map(|e| e.clone())
            .collect();

        result.sort_by(|a, b| b.last_mentioned.cmp(&a.last_mentioned));
        result.truncate(limit);
        result
    }

    async fn related_entities(&self, id: EntityId, filter: &TopicFilter) -> Vec<RelatedEntity> {
        let _guard = self.tx.read();
        let mut grouped: HashMap<EntityId, (usize, Vec<u64>, u64)> = HashMap::new();

        for entry in self.edges.iter() {
            let (a, b) = *entry.key();
            let other = if a == id {
                b
            } else if b == id {
                a
            } else {
                continue;
            };

            let slot = grouped.entry(other).or_insert((0, Vec::new(), 0));
            for rel in entry.iter() {
                slot.0 += 1;
                slot.1.push(rel.message_id);
                slot.2 = slot.2.max(rel.observed_at);
            }
        }

        let mut result: Vec<RelatedEntity> = grouped
            .into_iter()
            .filter_map(|(other, (weight, message_ids, last_seen))| {
                let entity = self.entities.get(&other).map(|e| e.clone())?;
                if !filter.allows(self.status_of(&entity.topic)) {
                    return None;
                }
                Some(RelatedEntity {
                    entity,
                    weight,
                    message_ids,
                    last_seen,
                })
            })
            .collect();

        result.sort_by(|a, b| b.weight.cmp(&a.weight).then(b.last_seen.cmp(&a.last_seen)));
        result
    }

    async fn hot_topic_context(&self, per_topic: usize) -> Vec<(String, Vec<Entity>)> {
        let _guard = self.tx.read();

        let hot: Vec<String> = self
            .topics
            .iter()
            .filter(|t| *t.value() == TopicStatus::Hot)
            .map(|t| t.key().clone())
            .collect();

        hot.into_iter()
            .map(|topic| {
                let mut members: Vec<Entity> = self
                    .entities
                    .iter()
                    .filter(|e| e.topic == topic)
                    .map(|e| e.clone())
                    .collect();
                members.sort_by(|a, b| b.last_mentioned.cmp(&a.last_mentioned));
                members.truncate(per_topic);
                (topic, members)
            })
            .collect()
    }

    async fn evidence_count(&self, id: EntityId) -> usize {
        self.edges
            .iter()
            .filter(|e| e.key().0 == id || e.key().1 == id)
            .map(|e| e.len())
            .sum()
    }

    async fn merge_entities(
        &self,
        winner: EntityId,
        loser: EntityId,
        merged_summary: &str,
    ) -> Result<MergeReport, PipelineError> {
        let _guard = self.tx.write();

        if winner == loser {
            return Err(PipelineError::MergeConflict { entity_id: winner });
        }
        if !self.entities.contains_key(&winner) || !self.entities.contains_key(&loser) {
            // One side vanished: an earlier proposal in this sweep
            // already consumed it.
            return Err(PipelineError::MergeConflict { entity_id: loser });
        }

        let loser_entity = self
            .entities
            .get(&loser)
            .map(|e| e.clone())
            .ok_or(PipelineError::MergeConflict { entity_id: loser })?;

        let mut report = MergeReport::default();

        // Union aliases (loser's canonical name becomes an alias).
        {
            let mut winner_entity = self
                .entities
                .get_mut(&winner)
                .ok_or(PipelineError::MergeConflict { entity_id: winner })?;

            for alias in loser_entity
                .aliases
                .iter()
                .chain(std::iter::once(&loser_entity.canonical_name))
            {
                if winner_entity.add_alias(alias) {
                    report.aliases_added += 1;
                }
            }

            winner_entity.summary = merged_summary.to_string();
            winner_entity.confidence = winner_entity.confidence.max(loser_entity.confidence);
            winner_entity.last_mentioned =
                winner_entity.last_mentioned.max(loser_entity.last_mentioned);
        }

        // Repoint the alias index. Loser aliases may live in a
        // different topic than the winner; they keep their key and
        // now resolve to the winner.
        let stale_keys: Vec<String> = self
            .alias_index
            .iter()
            .filter(|e| *e.value() == loser)
            .map(|e| e.key().clone())
            .collect();
        for key in stale_keys {
            self.alias_index.insert(key, winner);
        }
        let winner_topic = self
            .entities
            .get(&winner)
            .map(|e| e.topic.clone())
            .unwrap_or_default();
        for alias in loser_entity
            .aliases
            .iter()
            .chain(std::iter::once(&loser_entity.canonical_name))
        {
            self.alias_index
                .insert(alias_key(&winner_topic, alias), winner);
        }

        // Repoint relationships, dropping self-loops and duplicate
        // provenance.
        let affected: Vec<(EntityId, EntityId)> = self
            .edges
            .iter()
            .filter(|e| e.key().0 == loser || e.key().1 == loser)
            .map(|e| *e.key())
            .collect();

        for pair in affected {
            let records = match self.edges.remove(&pair) {
                Some((_, records)) => records,
                None => continue,
            };

            for mut rel in records {
                if rel.entity_a == loser {
                    rel.entity_a = winner;
                }
                if rel.entity_b == loser {
                    rel.entity_b = winner;
                }

                if rel.is_self_loop() {
                    report.self_loops_dropped += 1;
                    continue;
                }
                if self.add_relationship_record(rel) {
                    report.relationships_repointed += 1;
                }
            }
        }

        self.entities.remove(&loser);

        info!(
            "Merged entity {} into {}: {} aliases, {} edges repointed, {} self-loops dropped",
            loser, winner, report.aliases_added, report.relationships_repointed,
            report.self_loops_dropped
        );

        Ok(report)
    }

    async fn update_profile(
        &self,
        id: EntityId,
        summary: &str,
        embedding: Vec<f32>,
        watermark: u64,
    ) -> Result<bool, PipelineError> {
        let _guard = self.tx.write();

        // An entity merged away since the update was produced is a
        // stale update, not a failure.
        let Some(mut entity) = self.entities.get_mut(&id) else {
            debug!("Skipping profile update for missing entity {}", id);
            return Ok(false);
        };

        if watermark < entity.last_profiled_msg_id {
            debug!(
                "Skipping stale profile update for {} (watermark {} < {})",
                id, watermark, entity.last_profiled_msg_id
            );
            return Ok(false);
        }

        entity.summary = summary.to_string();
        if !embedding.is_empty() {
            let mut embedding = embedding;
            normalize(&mut embedding);
            entity.embedding = embedding;
        }
        entity.last_profiled_msg_id = watermark;

        Ok(true)
    }

    async fn stale_profiles(&self, watermark: u64, limit: usize) -> Vec<Entity> {
        let mut result: Vec<Entity> = self
            .entities
            .iter()
            .filter(|e| e.last_profiled_msg_id < watermark)
            .map(|e| e.clone())
            .collect();
        result.sort_by_key(|e| e.last_profiled_msg_id);
        result.truncate(limit);
        result
    }

    async fn set_topic_status(&self, name: &str, status: TopicStatus) -> Result<(), PipelineError> {
        let _guard = self.tx.write();
        self.topics.insert(name.to_string(), status);
        Ok(())
    }

    async fn topic_status(&self, name: &str) -> Option<TopicStatus> {
        self.status_of(name)
    }

    async fn topics(&self) -> Vec<Topic> {
        self.topics
            .iter()
            .map(|t| Topic {
                name: t.key().clone(),
                status: *t.value(),
            })
            .collect()
    }

    async fn entity_count(&self) -> usize {
        self.entities.len()
    }
}

/// Snapshot format
#[derive(Debug, Serialize, Deserialize)]
struct GraphSnapshot {
    entities: Vec<Entity>,
    edges: Vec<Relationship>,
    topics: Vec<(String, TopicStatus)>,
    next_id: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use mnemograph_core::similarity::seeded_embedding;

    fn entity(id: EntityId, name: &str, topic: &str) -> Entity {
        Entity {
            id,
            canonical_name: name.to_string(),
            entity_type: EntityType::Person,
            confidence: 0.9,
            summary: String::new(),
            topic: topic.to_string(),
            embedding: seeded_embedding(name, 16),
            aliases: vec![name.to_string()],
            last_profiled_msg_id: 0,
            last_mentioned: 0,
        }
    }

    fn rel(a: EntityId, b: EntityId, message_id: u64) -> Relationship {
        Relationship {
            entity_a: a,
            entity_b: b,
            message_id,
            confidence: 0.8,
            observed_at: message_id,
        }
    }

    #[tokio::test]
    async fn test_apply_is_atomic() {
        let graph = MemoryGraph::new();

        let mut writes = GraphWriteSet::default();
        writes.push(GraphOp::CreateEntity(entity(1, "Marc", "family")));
        writes.push(GraphOp::AddRelationship(rel(1, 99, 5)));

        // Unknown entity 99 rejects the whole set.
        assert!(graph.apply(writes).await.is_err());
        assert_eq!(graph.entity_count().await, 0);
    }

    #[tokio::test]
    async fn test_duplicate_provenance_ignored() {
        let graph = MemoryGraph::new();

        let mut writes = GraphWriteSet::default();
        writes.push(GraphOp::CreateEntity(entity(1, "Marc", "family")));
        writes.push(GraphOp::CreateEntity(entity(2, "Lyon", "family")));
        writes.push(GraphOp::AddRelationship(rel(1, 2, 5)));
        writes.push(GraphOp::AddRelationship(rel(2, 1, 5)));
        graph.apply(writes).await.unwrap();

        assert_eq!(graph.evidence_count(1).await, 1);
    }

    #[tokio::test]
    async fn test_merge_repoints_and_drops_self_loops() {
        let graph = MemoryGraph::new();

        let mut writes = GraphWriteSet::default();
        writes.push(GraphOp::CreateEntity(entity(1, "Marcus", "family")));
        writes.push(GraphOp::CreateEntity(entity(2, "Marc", "family")));
        writes.push(GraphOp::CreateEntity(entity(3, "Lyon", "family")));
        // Direct edge between the pair that will merge, plus one to a
        // third entity.
        writes.push(GraphOp::AddRelationship(rel(1, 2, 10)));
        writes.push(GraphOp::AddRelationship(rel(2, 3, 11)));
        graph.apply(writes).await.unwrap();

        let report = graph.merge_entities(1, 2, "merged summary").await.unwrap();

        assert_eq!(report.self_loops_dropped, 1);
        assert_eq!(report.relationships_repointed, 1);
        assert!(graph.entity(2).await.is_none());

        let winner = graph.entity(1).await.unwrap();
        assert!(winner.has_alias("Marc"));
        assert_eq!(winner.summary, "merged summary");

        // The repointed edge carries the old provenance.
        let related = graph.related_entities(1, &TopicFilter::retrieval()).await;
        assert_eq!(related.len(), 1);
        assert_eq!(related[0].entity.id, 3);
        assert_eq!(related[0].message_ids, vec![11]);

        // Loser's alias now resolves to the winner.
        assert_eq!(graph.find_alias("family", "marc").await, Some(1));
    }

    #[tokio::test]
    async fn test_merge_missing_loser_is_conflict() {
        let graph = MemoryGraph::new();
        let mut writes = GraphWriteSet::default();
        writes.push(GraphOp::CreateEntity(entity(1, "Marcus", "family")));
        graph.apply(writes).await.unwrap();

        let err = graph.merge_entities(1, 42, "s").await.unwrap_err();
        assert!(matches!(err, PipelineError::MergeConflict { .. }));
    }

    #[tokio::test]
    async fn test_watermark_never_regresses() {
        let graph = MemoryGraph::new();
        let mut writes = GraphWriteSet::default();
        writes.push(GraphOp::CreateEntity(entity(1, "Marcus", "family")));
        graph.apply(writes).await.unwrap();

        assert!(graph.update_profile(1, "v2", vec![], 20).await.unwrap());
        assert!(!graph.update_profile(1, "v1", vec![], 10).await.unwrap());

        let entity = graph.entity(1).await.unwrap();
        assert_eq!(entity.summary, "v2");
        assert_eq!(entity.last_profiled_msg_id, 20);
    }

    #[tokio::test]
    async fn test_topic_isolation() {
        let graph = MemoryGraph::new();
        let mut writes = GraphWriteSet::default();
        writes.push(GraphOp::CreateEntity(entity(1, "Marcus", "family")));
        graph.apply(writes).await.unwrap();

        let filter = TopicFilter::retrieval();
        assert_eq!(graph.entities_in_topic("family", &filter).await.len(), 1);

        graph
            .set_topic_status("family", TopicStatus::Inactive)
            .await
            .unwrap();
        assert!(graph.entities_in_topic("family", &filter).await.is_empty());
        assert!(graph.search_entities("marc", &filter, 10).await.is_empty());

        // Elevated callers still see it; toggling back restores
        // visibility with no stale state.
        assert_eq!(
            graph
                .entities_in_topic("family", &TopicFilter::elevated())
                .await
                .len(),
            1
        );
        graph
            .set_topic_status("family", TopicStatus::Active)
            .await
            .unwrap();
        assert_eq!(graph.entities_in_topic("family", &filter).await.len(), 1);
    }

    #[tokio::test]
    async fn test_hot_topic_context() {
        let graph = MemoryGraph::new();
        let mut writes = GraphWriteSet::default();
        for (id, name) in [(1, "Marcus"), (2, "Lyon"), (3, "Ada")] {
            let mut e = entity(id, name, "family");
            e.last_mentioned = id * 100;
            writes.push(GraphOp::CreateEntity(e));
        }
        writes.push(GraphOp::CreateEntity(entity(4, "Turing", "work")));
        graph.apply(writes).await.unwrap();

        // No hot topics yet.
        assert!(graph.hot_topic_context(3).await.is_empty());

        graph
            .set_topic_status("family", TopicStatus::Hot)
            .await
            .unwrap();
        let context = graph.hot_topic_context(2).await;
        assert_eq!(context.len(), 1);
        assert_eq!(context[0].0, "family");

        // Top entities by recency, capped per topic.
        let names: Vec<&str> = context[0].1.iter().map(|e| e.canonical_name.as_str()).collect();
        assert_eq!(names, vec!["Ada", "Lyon"]);
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.json");

        {
            let graph = MemoryGraph::with_persistence(&path).unwrap();
            let mut writes = GraphWriteSet::default();
            writes.push(GraphOp::CreateEntity(entity(7, "Marcus", "family")));
            writes.push(GraphOp::CreateEntity(entity(8, "Lyon", "family")));
            writes.push(GraphOp::AddRelationship(rel(7, 8, 3)));
            graph.apply(writes).await.unwrap();
            graph.save_to_disk().unwrap();
        }

        let reloaded = MemoryGraph::with_persistence(&path).unwrap();
        assert_eq!(reloaded.entity_count().await, 2);
        assert_eq!(reloaded.evidence_count(7).await, 1);
        assert_eq!(reloaded.find_alias("family", "marcus").await, Some(7));
        // Id counter resumes past persisted ids.
        assert!(reloaded.allocate_id() > 8);
    }
}
