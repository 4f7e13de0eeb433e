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

//! Keyed per-entity mutation locks.
//!
//! All identity-affecting mutation of an entity (bind, merge, refine)
//! must hold that entity's lock. Acquisition waits a bounded time;
//! exceeding it reports lock contention, which the batch layer treats
//! as transient. Guards release on drop, so every exit path including
//! failure unlocks.
//!
//! Multi-entity acquisition is ordered by id to rule out deadlock
//! between concurrent bind/merge operations.

use dashmap::DashMap;
use mnemograph_core::{EntityId, PipelineError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

pub struct EntityLocks {
    locks: DashMap<EntityId, Arc<Mutex<()>>>,
    max_wait: Duration,
}

impl EntityLocks {
    pub fn new(max_wait: Duration) -> Self {
        Self {
            locks: DashMap::new(),
            max_wait,
        }
    }

    fn handle(&self, id: EntityId) -> Arc<Mutex<()>> {
        self.locks
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Acquire a single entity's lock with bounded wait.
    pub async fn acquire(&self, id: EntityId) -> Result<OwnedMutexGuard<()>, PipelineError> {
        let handle = self.handle(id);
        tokio::time::timeout(self.max_wait, handle.lock_owned())
            .await
            .map_err(|_| {
                PipelineError::TransientStore(format!("lock contention on entity {}", id))
            })
    }

    /// Acquire several entity locks in ascending id order.
    pub async fn acquire_all(
        &self,
        ids: &[EntityId],
    ) -> Result<Vec<OwnedMutexGuard<()>>, PipelineError> {
        let mut sorted: Vec<EntityId> = ids.to_vec();
        sorted.sort_unstable();
        sorted.dedup();

        let mut guards = Vec::with_capacity(sorted.len());
        for id in sorted {
            guards.push(self.acquire(id).await?);
        }
        Ok(guards)
    }
}
