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

//! Entity Resolver
//!
//! Canonicalizes incoming mentions against the existing graph. Per
//! mention: exact alias lookup binds directly; otherwise embedding
//! similarity against same-type same-topic candidates auto-binds
//! above the high threshold, goes through judge verification in the
//! mid band, and creates a new entity below the floor. Ties break by
//! highest similarity, then most recently active candidate.
//!
//! Commits are scoped per batch: the write set applies atomically or
//! not at all, so readers never observe a half-applied batch.

use dashmap::DashMap;
use mnemograph_core::config::ResolverConfig;
use mnemograph_core::similarity::cosine;
use mnemograph_core::{now_micros, Batch, Entity, EntityId, EntityRecord, EntityType, PipelineError, Relationship};
use mnemograph_store::{GraphOp, GraphStore, GraphWriteSet};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::locks::EntityLocks;
use crate::oracle::{CandidateProfile, SimilarityJudge};

const DEFAULT_TOPIC: &str = "General";

/// Result of resolving and committing one batch.
#[derive(Debug, Default)]
pub struct ResolutionOutcome {
    /// Pre-existing entities bound by this batch.
    pub bound: Vec<EntityId>,
    /// Entities newly created by this batch.
    pub created: Vec<EntityId>,
    /// Mention context per touched entity, for profile refinement.
    pub observations: Vec<(EntityId, String)>,
    /// Highest message id carried by the batch.
    pub max_message_id: u64,
}

enum Decision {
    Bind(EntityId),
    Create,
}

pub struct EntityResolver {
    store: Arc<dyn GraphStore>,
    judge: Arc<dyn SimilarityJudge>,
    locks: Arc<EntityLocks>,
    config: ResolverConfig,
    /// Ambiguity deferral counts per (topic, mention).
    deferrals: DashMap<String, u32>,
}

fn deferral_key(topic: &str, name: &str) -> String {
    format!("{}\u{1}{}", topic.to_lowercase(), name.to_lowercase())
}

fn mention_profile(record: &EntityRecord, name: &str) -> CandidateProfile {
    CandidateProfile {
        name: name.to_string(),
        entity_type: record.entity_type.clone(),
        summary: record.summary.clone(),
        aliases: record.aliases.clone(),
    }
}

fn entity_profile(entity: &Entity) -> CandidateProfile {
    CandidateProfile {
        name: entity.canonical_name.clone(),
        entity_type: entity.entity_type.as_str().to_string(),
        summary: entity.summary.clone(),
        aliases: entity.aliases.clone(),
    }
}

impl EntityResolver {
    pub fn new(
        store: Arc<dyn GraphStore>,
        judge: Arc<dyn SimilarityJudge>,
        locks: Arc<EntityLocks>,
        config: ResolverConfig,
    ) -> Self {
        Self {
            store,
            judge,
            locks,
            config,
            deferrals: DashMap::new(),
        }
    }

    /// Resolve every mention in a batch and commit entities and
    /// relationships atomically.
    ///
    /// `escalated` marks a batch re-queued after an ambiguity
    /// deferral; the resolver then runs the expensive verification
    /// path and never defers again.
    pub async fn resolve_batch(
        &self,
        batch: &Batch,
        escalated: bool,
    ) -> Result<ResolutionOutcome, PipelineError> {
        let now = now_micros();
        let mut writes = GraphWriteSet::default();
        let mut outcome = ResolutionOutcome {
            max_message_id: batch
                .relationships
                .iter()
                .map(|r| r.message_id)
                .max()
                .unwrap_or(0),
            ..Default::default()
        };

        // Lowercased surface string -> id, for intra-batch lookups.
        let mut name_map: HashMap<String, EntityId> = HashMap::new();
        let mut topics_seen: Vec<String> = Vec::new();
        let mut lock_ids: Vec<EntityId> = Vec::new();

        for record in &batch.entities {
            let name = record.canonical_name.trim();
            if name.is_empty() {
                debug!("Skipping mention with empty name");
                continue;
            }

            let topic = if record.topic.trim().is_empty() {
                DEFAULT_TOPIC
            } else {
                record.topic.trim()
            };
            if !topics_seen.iter().any(|t| t == topic) {
                topics_seen.push(topic.to_string());
            }

            // A mention already resolved earlier in this batch binds
            // to the same entity.
            let prior = name_map.get(&name.to_lowercase()).copied();
            let decision = match prior {
                Some(id) => Decision::Bind(id),
                None => self.decide(record, name, topic, escalated).await?,
            };

            let id = match decision {
                Decision::Bind(id) => {
                    lock_ids.push(id);
                    writes.push(GraphOp::AddAlias {
                        id,
                        alias: name.to_string(),
                    });
                    for alias in &record.aliases {
                        if !alias.trim().is_empty() {
                            writes.push(GraphOp::AddAlias {
                                id,
                                alias: alias.trim().to_string(),
                            });
                        }
                    }
                    writes.push(GraphOp::Touch {
                        id,
                        at: now,
                        confidence: record.confidence,
                    });
                    outcome.bound.push(id);
                    id
                }
                Decision::Create => {
                    let id = self.store.allocate_id();
                    let mut aliases = vec![name.to_string()];
                    for alias in &record.aliases {
                        let alias = alias.trim();
                        if !alias.is_empty() && !aliases.iter().any(|a| a.eq_ignore_ascii_case(alias))
                        {
                            aliases.push(alias.to_string());
                        }
                    }

                    let entity_type =
                        EntityType::parse(&record.entity_type).unwrap_or(EntityType::Concept);

                    writes.push(GraphOp::CreateEntity(Entity {
                        id,
                        canonical_name: name.to_string(),
                        entity_type,
                        confidence: record.confidence,
                        summary: record.summary.clone(),
                        topic: topic.to_string(),
                        embedding: record.embedding.clone(),
                        aliases,
                        last_profiled_msg_id: record.last_profiled_msg_id,
                        last_mentioned: now,
                    }));
                    outcome.created.push(id);
                    id
                }
            };

            name_map.insert(name.to_lowercase(), id);
            for alias in &record.aliases {
                name_map.entry(alias.trim().to_lowercase()).or_insert(id);
            }

            if !record.summary.is_empty() {
                outcome.observations.push((id, record.summary.clone()));
            }
        }

        for rel in &batch.relationships {
            let a = self
                .resolve_endpoint(&rel.entity_a, &topics_seen, &name_map)
                .await;
            let b = self
                .resolve_endpoint(&rel.entity_b, &topics_seen, &name_map)
                .await;

            match (a, b) {
                (Some(a), Some(b)) if a != b => {
                    writes.push(GraphOp::AddRelationship(Relationship {
                        entity_a: a,
                        entity_b: b,
                        message_id: rel.message_id,
                        confidence: rel.confidence,
                        observed_at: now,
                    }));
                }
                (Some(a), Some(b)) => {
                    debug!("Dropping self-relationship for entity {} ({})", a, b);
                }
                _ => {
                    debug!(
                        "Skipping relationship with unresolved endpoint: {} -- {}",
                        rel.entity_a, rel.entity_b
                    );
                }
            }
        }

        // Serialize against merge and refinement on the touched
        // entities, then commit the whole set.
        let _guards = self.locks.acquire_all(&lock_ids).await?;
        self.store.apply(writes).await?;

        Ok(outcome)
    }

    /// Decide how one unseen mention binds.
    async fn decide(
        &self,
        record: &EntityRecord,
        name: &str,
        topic: &str,
        escalated: bool,
    ) -> Result<Decision, PipelineError> {
        // Tier 1: exact alias lookup within the topic.
        if let Some(id) = self.store.find_alias(topic, name).await {
            return Ok(Decision::Bind(id));
        }
        for alias in &record.aliases {
            if let Some(id) = self.store.find_alias(topic, alias.trim()).await {
                return Ok(Decision::Bind(id));
            }
        }

        // Tier 2: embedding similarity against same-type, same-topic
        // candidates.
        let entity_type = EntityType::parse(&record.entity_type).unwrap_or(EntityType::Concept);
        if record.embedding.is_empty() {
            return Ok(Decision::Create);
        }
        if record.embedding.len() != self.config.embedding_dimension {
            debug!(
                "Mention '{}' carries a {}-dim embedding (expected {}); treating as unembedded",
                name,
                record.embedding.len(),
                self.config.embedding_dimension
            );
            return Ok(Decision::Create);
        }

        let candidates = self.store.resolve_candidates(topic, entity_type).await;
        let mut scored: Vec<(f32, Entity)> = candidates
            .into_iter()
            .filter(|c| !c.embedding.is_empty())
            .map(|c| (cosine(&record.embedding, &c.embedding), c))
            .collect();

        // Highest similarity wins; recency breaks ties.
        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.1.last_mentioned.cmp(&a.1.last_mentioned))
        });
        scored.truncate(self.config.top_k);

        let Some((best_score, best)) = scored.first() else {
            return Ok(Decision::Create);
        };

        if *best_score >= self.config.auto_bind_threshold {
            return Ok(Decision::Bind(best.id));
        }
        if *best_score < self.config.verify_floor {
            return Ok(Decision::Create);
        }

        // Tier 3: the verification band. An escalated pass judges
        // more candidates instead of just the best one.
        let judge_depth = if escalated { 3 } else { 1 };
        let mention = mention_profile(record, name);

        let mut best_judged: Option<(f64, EntityId)> = None;
        for (score, candidate) in scored.iter().take(judge_depth) {
            if *score < self.config.verify_floor {
                break;
            }
            let judged = self
                .judge
                .judge(&mention, &entity_profile(candidate))
                .await?;
            if best_judged.map(|(s, _)| judged > s).unwrap_or(true) {
                best_judged = Some((judged, candidate.id));
            }
        }

        let (judged, candidate_id) = match best_judged {
            Some(v) => v,
            None => return Ok(Decision::Create),
        };

        if judged >= self.config.bind_confidence {
            self.deferrals.remove(&deferral_key(topic, name));
            return Ok(Decision::Bind(candidate_id));
        }
        if judged < self.config.ambiguity_floor {
            return Ok(Decision::Create);
        }

        // Ambiguous: defer once, then force a new entity rather than
        // deferring forever.
        let key = deferral_key(topic, name);
        let count = {
            let mut entry = self.deferrals.entry(key.clone()).or_insert(0);
            *entry += 1;
            *entry
        };

        if escalated || count > self.config.max_deferrals {
            warn!(
                "Mention '{}' in topic '{}' still ambiguous after {} deferrals; forcing new entity",
                name, topic, count
            );
            self.deferrals.remove(&key);
            return Ok(Decision::Create);
        }

        Err(PipelineError::AmbiguousBinding {
            mention: name.to_string(),
            topic: topic.to_string(),
        })
    }

    async fn resolve_endpoint(
        &self,
        name: &str,
        topics: &[String],
        name_map: &HashMap<String, EntityId>,
    ) -> Option<EntityId> {
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        if let Some(id) = name_map.get(&name.to_lowercase()) {
            return Some(*id);
        }
        for topic in topics {
            if let Some(id) = self.store.find_alias(topic, name).await {
                return Some(id);
            }
        }
        self.store.find_alias(DEFAULT_TOPIC, name).await
    }
}
