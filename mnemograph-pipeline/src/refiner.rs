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

//! Profile Refiner
//!
//! Folds mention evidence into entity summaries without unbounded
//! growth. Runs inline after resolver commits (throttled per entity)
//! and in background sweeps over the dirty set. Refinement of a
//! given entity is serialized through its mutation lock because
//! summary merging is not commutative; the profile watermark only
//! ever moves forward.

use dashmap::DashMap;
use mnemograph_core::config::RefinerConfig;
use mnemograph_core::{Entity, EntityId, PipelineError};
use mnemograph_store::GraphStore;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::locks::EntityLocks;
use crate::oracle::SummaryCondenser;
use crate::resolver::ResolutionOutcome;

pub struct ProfileRefiner {
    store: Arc<dyn GraphStore>,
    condenser: Arc<dyn SummaryCondenser>,
    locks: Arc<EntityLocks>,
    config: RefinerConfig,
    /// Entities with unfolded evidence.
    dirty: DashMap<EntityId, ()>,
    /// Queued observation text per entity.
    pending: DashMap<EntityId, Vec<String>>,
    /// Touch counters driving the inline throttle.
    touch_counts: DashMap<EntityId, u32>,
    /// Highest message id observed on any batch.
    high_water: AtomicU64,
}

/// Truncate at a char boundary within the budget.
fn clamp_to_budget(summary: &mut String, budget: usize) {
    if summary.len() <= budget {
        return;
    }
    let mut end = budget;
    while end > 0 && !summary.is_char_boundary(end) {
        end -= 1;
    }
    summary.truncate(end);
}

impl ProfileRefiner {
    pub fn new(
        store: Arc<dyn GraphStore>,
        condenser: Arc<dyn SummaryCondenser>,
        locks: Arc<EntityLocks>,
        config: RefinerConfig,
    ) -> Self {
        Self {
            store,
            condenser,
            locks,
            config,
            dirty: DashMap::new(),
            pending: DashMap::new(),
            touch_counts: DashMap::new(),
            high_water: AtomicU64::new(0),
        }
    }

    /// Record mention evidence for an entity. Every
    /// `inline_refine_interval`-th touch refines immediately; inline
    /// failures are absorbed (the entity stays dirty for the sweep)
    /// so a flaky condenser never fails an already committed batch.
    pub async fn observe(&self, id: EntityId, text: &str, message_id: u64) {
        self.high_water.fetch_max(message_id, Ordering::SeqCst);
        if !text.is_empty() {
            self.pending.entry(id).or_default().push(text.to_string());
        }
        self.dirty.insert(id, ());

        let touches = {
            let mut count = self.touch_counts.entry(id).or_insert(0);
            *count += 1;
            *count
        };

        if touches % self.config.inline_refine_interval == 0 {
            if let Err(e) = self.refine(id).await {
                warn!("Inline refinement of entity {} failed: {}", id, e);
            }
        }
    }

    /// Record every observation from a committed resolution.
    pub async fn observe_outcome(&self, outcome: &ResolutionOutcome) {
        for (id, text) in &outcome.observations {
            self.observe(*id, text, outcome.max_message_id).await;
        }
    }

    /// Refine one entity now. Returns true if a new summary was
    /// committed.
    pub async fn refine(&self, id: EntityId) -> Result<bool, PipelineError> {
        let _guard = self.locks.acquire(id).await?;

        let Some(entity) = self.store.entity(id).await else {
            // Merged away since it was marked dirty.
            self.dirty.remove(&id);
            self.pending.remove(&id);
            return Ok(false);
        };

        let observations = self
            .pending
            .remove(&id)
            .map(|(_, texts)| texts)
            .unwrap_or_default();

        let high_water = self.high_water.load(Ordering::SeqCst);
        if observations.is_empty() && entity.last_profiled_msg_id >= high_water {
            self.dirty.remove(&id);
            return Ok(false);
        }

        let budget = self.config.max_summary_chars;
        let mut summary = self
            .condenser
            .condense(&entity.canonical_name, &entity.summary, &observations, budget)
            .await?;
        // The condenser is an external service; enforce the budget
        // regardless of what it returns.
        clamp_to_budget(&mut summary, budget);

        let watermark = high_water.max(entity.last_profiled_msg_id);
        let applied = self
            .store
            .update_profile(id, &summary, vec![], watermark)
            .await?;

        self.dirty.remove(&id);
        debug!(
            "Refined profile for '{}' (id {}, watermark {})",
            entity.canonical_name, id, watermark
        );
        Ok(applied)
    }

    /// Merge two summaries during an entity merge. Empty sides pass
    /// through without a condenser call.
    pub async fn merged_summary(
        &self,
        primary: &Entity,
        secondary: &Entity,
    ) -> Result<String, PipelineError> {
        if secondary.summary.is_empty() {
            return Ok(primary.summary.clone());
        }
        if primary.summary.is_empty() {
            return Ok(secondary.summary.clone());
        }

        let budget = self.config.max_summary_chars;
        let mut merged = self
            .condenser
            .condense(
                &primary.canonical_name,
                &primary.summary,
                std::slice::from_ref(&secondary.summary),
                budget,
            )
            .await?;
        clamp_to_budget(&mut merged, budget);
        Ok(merged)
    }

    /// Background sweep: refine dirty entities plus any whose
    /// watermark fell behind. A failing item aborts only itself.
    pub async fn sweep(&self) -> usize {
        let mut ids: Vec<EntityId> = self
            .dirty
            .iter()
            .take(self.config.sweep_batch)
            .map(|e| *e.key())
            .collect();

        if ids.len() < self.config.sweep_batch {
            let high_water = self.high_water.load(Ordering::SeqCst);
            let remaining = self.config.sweep_batch - ids.len();
            for entity in self.store.stale_profiles(high_water, remaining).await {
                if !ids.contains(&entity.id) {
                    ids.push(entity.id);
                }
            }
        }

        let results = futures::future::join_all(ids.iter().map(|id| self.refine(*id))).await;

        let mut refined = 0;
        for (id, result) in ids.iter().zip(results) {
            match result {
                Ok(true) => refined += 1,
                Ok(false) => {}
                Err(e) => warn!("Sweep refinement of entity {} failed: {}", id, e),
            }
        }
        refined
    }

    /// Sweep trigger: dirty volume, or any dirt plus idleness.
    pub fn should_sweep(&self, idle_seconds: u64) -> bool {
        let dirty = self.dirty.len();
        dirty >= self.config.volume_threshold
            || (dirty > 0 && idle_seconds >= self.config.idle_threshold_secs)
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::HeuristicCondenser;
    use mnemograph_core::similarity::seeded_embedding;
    use mnemograph_core::EntityType;
    use mnemograph_store::{GraphOp, GraphWriteSet, MemoryGraph};
    use std::time::Duration;

    fn entity(id: EntityId, name: &str) -> Entity {
        Entity {
            id,
            canonical_name: name.to_string(),
            entity_type: EntityType::Person,
            confidence: 0.9,
            summary: String::new(),
            topic: "family".to_string(),
            embedding: seeded_embedding(name, 16),
            aliases: vec![name.to_string()],
            last_profiled_msg_id: 0,
            last_mentioned: 0,
        }
    }

    async fn setup() -> (Arc<MemoryGraph>, ProfileRefiner) {
        let store = Arc::new(MemoryGraph::new());
        let mut writes = GraphWriteSet::default();
        writes.push(GraphOp::CreateEntity(entity(1, "Marcus")));
        store.apply(writes).await.unwrap();

        let refiner = ProfileRefiner::new(
            store.clone(),
            Arc::new(HeuristicCondenser),
            Arc::new(EntityLocks::new(Duration::from_millis(100))),
            RefinerConfig {
                max_summary_chars: 120,
                inline_refine_interval: 2,
                ..Default::default()
            },
        );
        (store, refiner)
    }

    #[tokio::test]
    async fn test_inline_refine_is_throttled() {
        let (store, refiner) = setup().await;

        refiner.observe(1, "plays guitar", 10).await;
        // First touch: no inline refinement yet.
        assert_eq!(store.entity(1).await.unwrap().summary, "");
        assert_eq!(refiner.dirty_count(), 1);

        refiner.observe(1, "lives in Lyon", 11).await;
        // Second touch hits the interval.
        let summary = store.entity(1).await.unwrap().summary;
        assert!(summary.contains("guitar"));
        assert!(summary.contains("Lyon"));
        assert_eq!(refiner.dirty_count(), 0);
    }

    #[tokio::test]
    async fn test_summary_is_bounded() {
        let (store, refiner) = setup().await;

        for i in 0..20 {
            refiner
                .observe(1, &format!("a rather long observation number {}", i), i)
                .await;
        }
        refiner.refine(1).await.unwrap();

        let entity = store.entity(1).await.unwrap();
        assert!(entity.summary.len() <= 120);
        // Most recent evidence survives condensation.
        assert!(entity.summary.contains("19"));
    }

    #[tokio::test]
    async fn test_watermark_is_monotonic() {
        let (store, refiner) = setup().await;

        refiner.observe(1, "first fact", 50).await;
        refiner.refine(1).await.unwrap();
        assert_eq!(store.entity(1).await.unwrap().last_profiled_msg_id, 50);

        // A direct profile write carrying an older watermark is
        // ignored by the store.
        assert!(!store.update_profile(1, "stale", vec![], 10).await.unwrap());
        assert_eq!(store.entity(1).await.unwrap().last_profiled_msg_id, 50);
    }

    #[tokio::test]
    async fn test_sweep_triggers() {
        let (_store, refiner) = setup().await;

        assert!(!refiner.should_sweep(0));
        refiner.observe(1, "fact", 1).await;
        assert!(!refiner.should_sweep(0));
        // Idle trigger with any dirt.
        assert!(refiner.should_sweep(RefinerConfig::default().idle_threshold_secs));
    }

    #[tokio::test]
    async fn test_sweep_refines_dirty_entities() {
        let (store, refiner) = setup().await;

        refiner.observe(1, "rides a bike", 7).await;
        let refined = refiner.sweep().await;
        assert_eq!(refined, 1);
        assert!(store.entity(1).await.unwrap().summary.contains("bike"));
        assert_eq!(refiner.dirty_count(), 0);
    }

    #[tokio::test]
    async fn test_refine_missing_entity_is_noop() {
        let (_store, refiner) = setup().await;
        refiner.observe(99, "ghost", 1).await;
        assert!(!refiner.refine(99).await.unwrap());
        assert_eq!(refiner.dirty_count(), 0);
    }
}
