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

//! External capability boundaries.
//!
//! The extraction oracle, the similarity/verification service, and
//! the summary condenser are non-deterministic collaborators. Each is
//! modeled as a stateless trait so the non-determinism stays at this
//! seam and never leaks into pipeline control flow. Heuristic
//! implementations are provided for deployments without a reasoning
//! backend and for deterministic tests.

use async_trait::async_trait;
use dashmap::DashMap;
use mnemograph_core::{Batch, PipelineError};

/// Candidate description handed to the verification service.
#[derive(Debug, Clone)]
pub struct CandidateProfile {
    pub name: String,
    pub entity_type: String,
    pub summary: String,
    pub aliases: Vec<String>,
}

/// Proposes candidate entities and relationships from raw text.
///
/// The oracle's internal reasoning is opaque; the pipeline only sees
/// the batches it emits onto the ingestion queue.
#[async_trait]
pub trait ExtractionOracle: Send + Sync {
    async fn propose(&self, text: &str) -> Result<Batch, PipelineError>;
}

/// Scores whether two candidate descriptions denote the same
/// real-world identity. Returns a confidence in [0, 1].
#[async_trait]
pub trait SimilarityJudge: Send + Sync {
    async fn judge(
        &self,
        a: &CandidateProfile,
        b: &CandidateProfile,
    ) -> Result<f64, PipelineError>;
}

/// Folds observations into a profile summary within a character
/// budget. The pipeline clamps the output regardless, so a
/// misbehaving backend cannot grow summaries unboundedly.
#[async_trait]
pub trait SummaryCondenser: Send + Sync {
    async fn condense(
        &self,
        name: &str,
        existing: &str,
        observations: &[String],
        budget: usize,
    ) -> Result<String, PipelineError>;
}

/// Name-overlap judge for deployments without a reasoning backend.
///
/// Two profiles score high when any alias of one is a prefix of (or
/// equal to) an alias of the other, ignoring case.
pub struct HeuristicJudge;

impl HeuristicJudge {
    fn names(profile: &CandidateProfile) -> Vec<String> {
        let mut names: Vec<String> = profile
            .aliases
            .iter()
            .chain(std::iter::once(&profile.name))
            .map(|n| n.trim().to_lowercase())
            .filter(|n| !n.is_empty())
            .collect();
        names.dedup();
        names
    }
}

#[async_trait]
impl SimilarityJudge for HeuristicJudge {
    async fn judge(
        &self,
        a: &CandidateProfile,
        b: &CandidateProfile,
    ) -> Result<f64, PipelineError> {
        if !a.entity_type.eq_ignore_ascii_case(&b.entity_type) {
            return Ok(0.1);
        }

        let names_a = Self::names(a);
        let names_b = Self::names(b);

        for x in &names_a {
            for y in &names_b {
                if x == y {
                    return Ok(0.98);
                }
                let (short, long) = if x.len() <= y.len() { (x, y) } else { (y, x) };
                if short.len() >= 3 && long.starts_with(short.as_str()) {
                    return Ok(0.95);
                }
            }
        }

        Ok(0.2)
    }
}

/// Judge returning scripted scores per name pair, used by tests to
/// exercise the threshold bands.
pub struct ScriptedJudge {
    scores: DashMap<(String, String), f64>,
    fallback: f64,
}

impl ScriptedJudge {
    pub fn new(fallback: f64) -> Self {
        Self {
            scores: DashMap::new(),
            fallback,
        }
    }

    pub fn script(&self, a: &str, b: &str, score: f64) {
        let key = Self::key(a, b);
        self.scores.insert(key, score);
    }

    fn key(a: &str, b: &str) -> (String, String) {
        let a = a.to_lowercase();
        let b = b.to_lowercase();
        if a <= b {
            (a, b)
        } else {
            (b, a)
        }
    }
}

#[async_trait]
impl SimilarityJudge for ScriptedJudge {
    async fn judge(
        &self,
        a: &CandidateProfile,
        b: &CandidateProfile,
    ) -> Result<f64, PipelineError> {
        let key = Self::key(&a.name, &b.name);
        Ok(self.scores.get(&key).map(|s| *s).unwrap_or(self.fallback))
    }
}

/// Deterministic condenser: keeps the existing summary plus new
/// observations, dropping the oldest sentences when over budget.
pub struct HeuristicCondenser;

#[async_trait]
impl SummaryCondenser for HeuristicCondenser {
    async fn condense(
        &self,
        _name: &str,
        existing: &str,
        observations: &[String],
        budget: usize,
    ) -> Result<String, PipelineError> {
        let mut parts: Vec<&str> = Vec::new();
        if !existing.is_empty() {
            parts.extend(existing.split(". ").filter(|s| !s.is_empty()));
        }
        for obs in observations {
            if !obs.is_empty() {
                parts.push(obs.as_str());
            }
        }

        // Newest sentences win; walk backwards until the budget fills.
        let mut kept: Vec<&str> = Vec::new();
        let mut used = 0;
        for part in parts.iter().rev() {
            let cost = part.len() + 2;
            if used + cost > budget {
                break;
            }
            used += cost;
            kept.push(part);
        }
        kept.reverse();

        Ok(kept.join(". "))
    }
}
