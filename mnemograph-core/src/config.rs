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

//! Pipeline configuration.
//!
//! Every similarity threshold, retry bound, and trigger window is a
//! configuration field rather than a constant, so deployments can
//! tune them and tests can exercise them as boundary parameters.

use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level pipeline configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub merge: MergeConfig,
    #[serde(default)]
    pub refiner: RefinerConfig,
    #[serde(default)]
    pub dlq: DlqConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

impl PipelineConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }
}

/// Entity resolver thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Similarity at or above which a mention auto-binds to an
    /// existing entity without verification.
    #[serde(default = "default_auto_bind")]
    pub auto_bind_threshold: f32,

    /// Similarity at or above which a mention enters the verification
    /// band. Below this floor a new entity is created.
    #[serde(default = "default_verify_floor")]
    pub verify_floor: f32,

    /// Judge confidence required to accept a binding from the
    /// verification band.
    #[serde(default = "default_bind_confidence")]
    pub bind_confidence: f64,

    /// Judge confidence below which the mention is a new entity.
    /// Scores between this floor and `bind_confidence` are ambiguous
    /// and deferred.
    #[serde(default = "default_ambiguity_floor")]
    pub ambiguity_floor: f64,

    /// Candidates considered per mention.
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Deferrals allowed before a mention is forced to a new entity.
    #[serde(default = "default_max_deferrals")]
    pub max_deferrals: u32,

    /// Embedding dimension expected on the wire.
    #[serde(default = "default_embedding_dimension")]
    pub embedding_dimension: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            auto_bind_threshold: default_auto_bind(),
            verify_floor: default_verify_floor(),
            bind_confidence: default_bind_confidence(),
            ambiguity_floor: default_ambiguity_floor(),
            top_k: default_top_k(),
            max_deferrals: default_max_deferrals(),
            embedding_dimension: default_embedding_dimension(),
        }
    }
}

/// Merge detector thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeConfig {
    /// Embedding similarity floor below which pairs are not even
    /// considered.
    #[serde(default = "default_similarity_floor")]
    pub similarity_floor: f32,

    /// Judge confidence at or above which a merge is auto-applied.
    #[serde(default = "default_auto_merge")]
    pub auto_merge_threshold: f64,

    /// Judge confidence at or above which a proposal is surfaced for
    /// manual review instead of discarded.
    #[serde(default = "default_review")]
    pub review_threshold: f64,

    /// Nearest neighbors examined per entity during a sweep.
    #[serde(default = "default_neighbors")]
    pub neighbors: usize,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            similarity_floor: default_similarity_floor(),
            auto_merge_threshold: default_auto_merge(),
            review_threshold: default_review(),
            neighbors: default_neighbors(),
        }
    }
}

/// Profile refiner behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefinerConfig {
    /// Hard budget on summary length; excess is condensed.
    #[serde(default = "default_max_summary_chars")]
    pub max_summary_chars: usize,

    /// Inline refinement runs on every Nth touch of an entity.
    #[serde(default = "default_inline_interval")]
    pub inline_refine_interval: u32,

    /// Dirty-set size that triggers a sweep regardless of idleness.
    #[serde(default = "default_volume_threshold")]
    pub volume_threshold: usize,

    /// Idle seconds after which any dirty entity triggers a sweep.
    #[serde(default = "default_refiner_idle")]
    pub idle_threshold_secs: u64,

    /// Entities refined per sweep.
    #[serde(default = "default_sweep_batch")]
    pub sweep_batch: usize,
}

impl Default for RefinerConfig {
    fn default() -> Self {
        Self {
            max_summary_chars: default_max_summary_chars(),
            inline_refine_interval: default_inline_interval(),
            volume_threshold: default_volume_threshold(),
            idle_threshold_secs: default_refiner_idle(),
            sweep_batch: default_sweep_batch(),
        }
    }
}

/// Dead-letter queue policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqConfig {
    /// Transient attempts before a batch is parked.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial retry backoff in milliseconds.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Backoff multiplier per attempt.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Backoff ceiling in milliseconds.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Parked entries re-attempted per replay sweep.
    #[serde(default = "default_replay_batch")]
    pub replay_batch: usize,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff_ms: default_max_backoff_ms(),
            replay_batch: default_replay_batch(),
        }
    }
}

/// Scheduler and lease behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between trigger checks.
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,

    /// Idle seconds before background jobs become eligible.
    #[serde(default = "default_idle_threshold")]
    pub idle_threshold_secs: u64,

    /// Lease time-to-live in seconds. A crashed runner's lease
    /// expires after this long.
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval(),
            idle_threshold_secs: default_idle_threshold(),
            lease_ttl_secs: default_lease_ttl(),
        }
    }
}

fn default_auto_bind() -> f32 {
    0.85
}
fn default_verify_floor() -> f32 {
    0.60
}
fn default_bind_confidence() -> f64 {
    0.70
}
fn default_ambiguity_floor() -> f64 {
    0.50
}
fn default_top_k() -> usize {
    10
}
fn default_max_deferrals() -> u32 {
    1
}
fn default_embedding_dimension() -> usize {
    384
}
fn default_similarity_floor() -> f32 {
    0.80
}
fn default_auto_merge() -> f64 {
    0.93
}
fn default_review() -> f64 {
    0.65
}
fn default_neighbors() -> usize {
    5
}
fn default_max_summary_chars() -> usize {
    1200
}
fn default_inline_interval() -> u32 {
    5
}
fn default_volume_threshold() -> usize {
    30
}
fn default_refiner_idle() -> u64 {
    300
}
fn default_sweep_batch() -> usize {
    50
}
fn default_max_attempts() -> u32 {
    5
}
fn default_initial_backoff_ms() -> u64 {
    100
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_max_backoff_ms() -> u64 {
    10_000
}
fn default_replay_batch() -> usize {
    50
}
fn default_check_interval() -> u64 {
    60
}
fn default_idle_threshold() -> u64 {
    900
}
fn default_lease_ttl() -> u64 {
    600
}
