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

//! Topic visibility filter.
//!
//! Visibility is a query-construction-time predicate: every
//! retrieval-facing store operation takes a `TopicFilter` parameter
//! and evaluates it against topic status inside the store's
//! transaction boundary. Inactive topics are excluded from results,
//! not hidden in presentation.

use mnemograph_core::TopicStatus;

/// Caller-visible topic scope for a single query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopicFilter {
    elevated: bool,
}

impl TopicFilter {
    /// The default retrieval scope: hot and active topics only.
    pub fn retrieval() -> Self {
        Self { elevated: false }
    }

    /// Explicitly elevated scope: inactive topics included. Used by
    /// management surfaces, never by the retrieval agent.
    pub fn elevated() -> Self {
        Self { elevated: true }
    }

    /// Whether entities under a topic with the given status are in
    /// scope. A topic the store has never seen carries no status and
    /// is treated as active.
    pub fn allows(&self, status: Option<TopicStatus>) -> bool {
        self.elevated || status.map(|s| s.is_visible()).unwrap_or(true)
    }
}
