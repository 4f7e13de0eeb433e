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

//! Merge Detector
//!
//! Background sweep over each topic hunting for latent duplicates
//! the resolver missed: entities created under different spellings
//! before enough evidence existed. Nearest neighbors by embedding go
//! to the cross-encoder judge; high scores merge immediately, mid
//! scores become proposals for manual review, low scores are
//! discarded. Proposals never outlive the sweep that produced them.
//!
//! The winner of a merge is the entity with strictly more evidence
//! records, ties broken by lower id. A pair overlapping an entity
//! already merged this sweep is skipped for the cycle.

use mnemograph_core::config::MergeConfig;
use mnemograph_core::similarity::cosine;
use mnemograph_core::{Entity, EntityId, PipelineError};
use mnemograph_store::{GraphStore, TopicFilter};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::locks::EntityLocks;
use crate::oracle::{CandidateProfile, SimilarityJudge};
use crate::refiner::ProfileRefiner;

/// A candidate-duplicate pair surfaced for manual confirmation.
#[derive(Debug, Clone)]
pub struct MergeProposal {
    pub primary: EntityId,
    pub secondary: EntityId,
    pub primary_name: String,
    pub secondary_name: String,
    pub similarity: f32,
    pub judge_score: f64,
}

/// Outcome of one sweep cycle.
#[derive(Debug, Default)]
pub struct SweepReport {
    pub pairs_examined: usize,
    pub merged: usize,
    /// Mid-band proposals for manual review, not auto-applied.
    pub review: Vec<MergeProposal>,
    pub rejected: usize,
    pub conflicts: usize,
    pub failed: usize,
}

pub struct MergeDetector {
    store: Arc<dyn GraphStore>,
    judge: Arc<dyn SimilarityJudge>,
    refiner: Arc<ProfileRefiner>,
    locks: Arc<EntityLocks>,
    config: MergeConfig,
}

fn profile(entity: &Entity) -> CandidateProfile {
    CandidateProfile {
        name: entity.canonical_name.clone(),
        entity_type: entity.entity_type.as_str().to_string(),
        summary: entity.summary.clone(),
        aliases: entity.aliases.clone(),
    }
}

impl MergeDetector {
    pub fn new(
        store: Arc<dyn GraphStore>,
        judge: Arc<dyn SimilarityJudge>,
        refiner: Arc<ProfileRefiner>,
        locks: Arc<EntityLocks>,
        config: MergeConfig,
    ) -> Self {
        Self {
            store,
            judge,
            refiner,
            locks,
            config,
        }
    }

    /// Run one full sweep across all topics. Item failures abort
    /// only that pair, never the sweep.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let pairs = self.candidate_pairs().await;

        // Entities consumed by an applied merge this cycle.
        let mut touched: HashSet<EntityId> = HashSet::new();

        for (similarity, a, b) in pairs {
            if touched.contains(&a) || touched.contains(&b) {
                debug!("Skipping overlapping pair ({}, {}) this cycle", a, b);
                report.conflicts += 1;
                continue;
            }

            let (Some(entity_a), Some(entity_b)) =
                (self.store.entity(a).await, self.store.entity(b).await)
            else {
                report.conflicts += 1;
                continue;
            };

            report.pairs_examined += 1;

            let score = match self.judge.judge(&profile(&entity_a), &profile(&entity_b)).await {
                Ok(score) => score,
                Err(e) => {
                    warn!("Judge failed for pair ({}, {}): {}", a, b, e);
                    report.failed += 1;
                    continue;
                }
            };

            if score >= self.config.auto_merge_threshold {
                match self.apply_merge(&entity_a, &entity_b).await {
                    Ok(()) => {
                        report.merged += 1;
                        touched.insert(a);
                        touched.insert(b);
                    }
                    Err(PipelineError::MergeConflict { .. }) => report.conflicts += 1,
                    Err(e) => {
                        warn!("Merge of ({}, {}) failed: {}", a, b, e);
                        report.failed += 1;
                    }
                }
            } else if score >= self.config.review_threshold {
                report.review.push(MergeProposal {
                    primary: a,
                    secondary: b,
                    primary_name: entity_a.canonical_name.clone(),
                    secondary_name: entity_b.canonical_name.clone(),
                    similarity,
                    judge_score: score,
                });
            } else {
                debug!(
                    "Rejected pair ({}, {}): judge {:.3} below review floor",
                    a, b, score
                );
                report.rejected += 1;
            }
        }

        info!(
            "Merge sweep: {} merged, {} proposals, {} rejected, {} conflicts, {} failed",
            report.merged,
            report.review.len(),
            report.rejected,
            report.conflicts,
            report.failed
        );
        report
    }

    /// Collect same-topic, same-type neighbor pairs above the
    /// similarity floor, ordered most-similar first.
    async fn candidate_pairs(&self) -> Vec<(f32, EntityId, EntityId)> {
        let mut pairs: Vec<(f32, EntityId, EntityId)> = Vec::new();
        let mut seen: HashSet<(EntityId, EntityId)> = HashSet::new();

        // Convergence is a write-side duty: inactive topics are
        // swept too, so reactivating one never surfaces duplicates.
        for topic in self.store.topics().await {
            let entities = self
                .store
                .entities_in_topic(&topic.name, &TopicFilter::elevated())
                .await;

            for entity in &entities {
                if entity.embedding.is_empty() {
                    continue;
                }

                let mut neighbors: Vec<(f32, EntityId)> = entities
                    .iter()
                    .filter(|other| {
                        other.id != entity.id
                            && other.entity_type == entity.entity_type
                            && !other.embedding.is_empty()
                    })
                    .map(|other| (cosine(&entity.embedding, &other.embedding), other.id))
                    .filter(|(similarity, _)| *similarity >= self.config.similarity_floor)
                    .collect();

                neighbors.sort_by(|a, b| {
                    b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal)
                });
                neighbors.truncate(self.config.neighbors);

                for (similarity, other) in neighbors {
                    let key = if entity.id < other {
                        (entity.id, other)
                    } else {
                        (other, entity.id)
                    };
                    if seen.insert(key) {
                        pairs.push((similarity, key.0, key.1));
                    }
                }
            }
        }

        pairs.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        pairs
    }

    /// Apply one merge transactionally: pick the winner, merge
    /// summaries through the refiner, then let the store union
    /// aliases and repoint relationships atomically.
    async fn apply_merge(&self, a: &Entity, b: &Entity) -> Result<(), PipelineError> {
        let evidence_a = self.store.evidence_count(a.id).await;
        let evidence_b = self.store.evidence_count(b.id).await;

        let (winner, loser) = if evidence_a > evidence_b {
            (a, b)
        } else if evidence_b > evidence_a {
            (b, a)
        } else if a.id <= b.id {
            (a, b)
        } else {
            (b, a)
        };

        let _guards = self.locks.acquire_all(&[winner.id, loser.id]).await?;

        let merged_summary = self.refiner.merged_summary(winner, loser).await?;
        let report = self
            .store
            .merge_entities(winner.id, loser.id, &merged_summary)
            .await?;

        info!(
            "Merged '{}' into '{}' ({} edges repointed, {} self-loops dropped)",
            loser.canonical_name,
            winner.canonical_name,
            report.relationships_repointed,
            report.self_loops_dropped
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::{HeuristicCondenser, ScriptedJudge};
    use mnemograph_core::config::RefinerConfig;
    use mnemograph_core::{EntityType, Relationship};
    use mnemograph_store::{GraphOp, GraphWriteSet, MemoryGraph};
    use std::time::Duration;

    fn entity(id: EntityId, name: &str, embedding: Vec<f32>) -> Entity {
        Entity {
            id,
            canonical_name: name.to_string(),
            entity_type: EntityType::Person,
            confidence: 0.9,
            summary: format!("{} summary", name),
            topic: "family".to_string(),
            embedding,
            aliases: vec![name.to_string()],
            last_profiled_msg_id: 0,
            last_mentioned: 0,
        }
    }

    fn vector_at(c: f32) -> Vec<f32> {
        vec![c, (1.0 - c * c).max(0.0).sqrt(), 0.0, 0.0]
    }

    fn detector(store: Arc<MemoryGraph>, judge: ScriptedJudge) -> MergeDetector {
        let locks = Arc::new(EntityLocks::new(Duration::from_millis(100)));
        let refiner = Arc::new(ProfileRefiner::new(
            store.clone(),
            Arc::new(HeuristicCondenser),
            locks.clone(),
            RefinerConfig::default(),
        ));
        MergeDetector::new(
            store,
            Arc::new(judge),
            refiner,
            locks,
            MergeConfig::default(),
        )
    }

    async fn seed(store: &MemoryGraph, entities: Vec<Entity>, rels: Vec<Relationship>) {
        let mut writes = GraphWriteSet::default();
        for e in entities {
            writes.push(GraphOp::CreateEntity(e));
        }
        for r in rels {
            writes.push(GraphOp::AddRelationship(r));
        }
        store.apply(writes).await.unwrap();
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
    async fn test_auto_merge_above_threshold() {
        let store = Arc::new(MemoryGraph::new());
        seed(
            &store,
            vec![
                entity(1, "Marcus", vector_at(1.0)),
                entity(2, "Marc", vector_at(0.95)),
                entity(3, "Lyon", vector_at(0.0)),
            ],
            // Marcus has more evidence: he wins.
            vec![rel(1, 3, 10), rel(1, 3, 11), rel(2, 3, 12)],
        )
        .await;

        let judge = ScriptedJudge::new(0.0);
        judge.script("Marcus", "Marc", 0.97);

        let report = detector(store.clone(), judge).sweep().await;

        assert_eq!(report.merged, 1);
        assert!(store.entity(2).await.is_none());

        let winner = store.entity(1).await.unwrap();
        assert!(winner.has_alias("Marc"));
        // All evidence repointed.
        assert_eq!(store.evidence_count(1).await, 3);
    }

    #[tokio::test]
    async fn test_mid_band_becomes_proposal() {
        let store = Arc::new(MemoryGraph::new());
        seed(
            &store,
            vec![
                entity(1, "Marcus", vector_at(1.0)),
                entity(2, "Marko", vector_at(0.9)),
            ],
            vec![],
        )
        .await;

        let judge = ScriptedJudge::new(0.0);
        judge.script("Marcus", "Marko", 0.75);

        let report = detector(store.clone(), judge).sweep().await;

        assert_eq!(report.merged, 0);
        assert_eq!(report.review.len(), 1);
        assert_eq!(report.review[0].judge_score, 0.75);
        // Nothing applied.
        assert_eq!(store.entity_count().await, 2);
    }

    #[tokio::test]
    async fn test_below_floor_discarded() {
        let store = Arc::new(MemoryGraph::new());
        seed(
            &store,
            vec![
                entity(1, "Marcus", vector_at(1.0)),
                entity(2, "Marko", vector_at(0.9)),
            ],
            vec![],
        )
        .await;

        let report = detector(store.clone(), ScriptedJudge::new(0.1)).sweep().await;

        assert_eq!(report.merged, 0);
        assert!(report.review.is_empty());
        assert_eq!(report.rejected, 1);
    }

    #[tokio::test]
    async fn test_overlapping_pairs_conflict() {
        let store = Arc::new(MemoryGraph::new());
        // Three near-identical entities: after the best pair merges,
        // the remaining pairs overlap and must be skipped this cycle.
        seed(
            &store,
            vec![
                entity(1, "Marcus", vector_at(1.0)),
                entity(2, "Marc", vector_at(0.99)),
                entity(3, "Markus", vector_at(0.98)),
            ],
            vec![],
        )
        .await;

        let report = detector(store.clone(), ScriptedJudge::new(0.97)).sweep().await;

        assert_eq!(report.merged, 1);
        assert!(report.conflicts >= 1);
        assert_eq!(store.entity_count().await, 2);
    }

    #[tokio::test]
    async fn test_tie_breaks_to_lower_id() {
        let store = Arc::new(MemoryGraph::new());
        seed(
            &store,
            vec![
                entity(5, "Marc", vector_at(0.99)),
                entity(9, "Marcus", vector_at(1.0)),
            ],
            vec![],
        )
        .await;

        let judge = ScriptedJudge::new(0.0);
        judge.script("Marc", "Marcus", 0.95);

        let report = detector(store.clone(), judge).sweep().await;
        assert_eq!(report.merged, 1);
        // Equal evidence: lower id survives.
        assert!(store.entity(5).await.is_some());
        assert!(store.entity(9).await.is_none());
    }

    #[tokio::test]
    async fn test_shared_edge_leaves_no_self_loop() {
        let store = Arc::new(MemoryGraph::new());
        seed(
            &store,
            vec![
                entity(1, "Marcus", vector_at(1.0)),
                entity(2, "Marc", vector_at(0.99)),
            ],
            // Direct relationship between the duplicates themselves.
            vec![rel(1, 2, 10)],
        )
        .await;

        let report = detector(store.clone(), ScriptedJudge::new(0.96)).sweep().await;
        assert_eq!(report.merged, 1);

        let survivor_id = if store.entity(1).await.is_some() { 1 } else { 2 };
        // The collapsed edge vanished instead of becoming a loop.
        assert_eq!(store.evidence_count(survivor_id).await, 0);
        assert!(store
            .related_entities(survivor_id, &TopicFilter::elevated())
            .await
            .is_empty());
    }
}
