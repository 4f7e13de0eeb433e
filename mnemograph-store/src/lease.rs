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

//! Job coordination state owned by the queue/cache store: leases,
//! the maintenance flag, activity tracking, and pending-work flags.
//!
//! A lease is a time-bounded exclusive claim on a background job
//! type. It is renewed via heartbeat while the job runs and expires
//! on its own if the runner crashes, so a dead worker can never
//! starve its job type.

use dashmap::DashMap;
use mnemograph_core::now_micros;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Background job types guarded by leases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    MergeDetection,
    ProfileRefinement,
    DlqReplay,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::MergeDetection => "merge_detection",
            JobKind::ProfileRefinement => "profile_refinement",
            JobKind::DlqReplay => "dlq_replay",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Lease {
    holder: u64,
    expires_at: u64,
}

/// Lease table guaranteeing at most one runner per job type.
pub struct LeaseTable {
    leases: DashMap<JobKind, Lease>,
    pending: DashMap<JobKind, ()>,
    next_holder: AtomicU64,
    ttl: Duration,
}

impl LeaseTable {
    pub fn new(ttl: Duration) -> Self {
        Self {
            leases: DashMap::new(),
            pending: DashMap::new(),
            next_holder: AtomicU64::new(1),
            ttl,
        }
    }

    /// Try to claim the lease for a job type. Returns `None` if a
    /// live lease is held by another runner; the caller skips this
    /// cycle rather than blocking.
    pub fn try_acquire(self: &Arc<Self>, job: JobKind) -> Option<LeaseHandle> {
        let holder = self.next_holder.fetch_add(1, Ordering::SeqCst);
        let now = now_micros();
        let expires_at = now + self.ttl.as_micros() as u64;

        let mut acquired = false;
        self.leases
            .entry(job)
            .and_modify(|lease| {
                if lease.expires_at <= now {
                    // Previous runner crashed or stalled; take over.
                    *lease = Lease { holder, expires_at };
                    acquired = true;
                }
            })
            .or_insert_with(|| {
                acquired = true;
                Lease { holder, expires_at }
            });

        if acquired {
            debug!("Acquired lease for {}", job.as_str());
            Some(LeaseHandle {
                table: Arc::clone(self),
                job,
                holder,
            })
        } else {
            None
        }
    }

    fn renew(&self, job: JobKind, holder: u64) -> bool {
        if let Some(mut lease) = self.leases.get_mut(&job) {
            if lease.holder == holder {
                lease.expires_at = now_micros() + self.ttl.as_micros() as u64;
                return true;
            }
        }
        false
    }

    fn release(&self, job: JobKind, holder: u64) {
        self.leases
            .remove_if(&job, |_, lease| lease.holder == holder);
    }

    /// Whether a live lease currently exists for the job type.
    pub fn is_held(&self, job: JobKind) -> bool {
        self.leases
            .get(&job)
            .map(|lease| lease.expires_at > now_micros())
            .unwrap_or(false)
    }

    /// Mark a job as having pending work (set on shutdown so the
    /// next session runs it first).
    pub fn set_pending(&self, job: JobKind) {
        self.pending.insert(job, ());
    }

    /// Consume the pending marker for a job, if any.
    pub fn take_pending(&self, job: JobKind) -> bool {
        self.pending.remove(&job).is_some()
    }
}

/// Scoped lease claim. Dropping the handle releases the lease on
/// every exit path, including panics and early errors.
pub struct LeaseHandle {
    table: Arc<LeaseTable>,
    job: JobKind,
    holder: u64,
}

impl LeaseHandle {
    /// Heartbeat: extend the lease while the job is still running.
    pub fn renew(&self) -> bool {
        self.table.renew(self.job, self.holder)
    }

    pub fn job(&self) -> JobKind {
        self.job
    }
}

impl Drop for LeaseHandle {
    fn drop(&mut self) {
        self.table.release(self.job, self.holder);
        debug!("Released lease for {}", self.job.as_str());
    }
}

/// TTL'd advisory flag surfaced while a background job mutates the
/// graph. Auto-expires so a crashed job cannot leave the system in
/// permanent maintenance mode.
pub struct MaintenanceFlag {
    state: parking_lot::Mutex<Option<(String, u64)>>,
}

impl MaintenanceFlag {
    pub fn new() -> Self {
        Self {
            state: parking_lot::Mutex::new(None),
        }
    }

    pub fn set(&self, message: &str, ttl: Duration) {
        let expires_at = now_micros() + ttl.as_micros() as u64;
        *self.state.lock() = Some((message.to_string(), expires_at));
    }

    pub fn clear(&self) {
        *self.state.lock() = None;
    }

    /// The active message, if any and not expired.
    pub fn current(&self) -> Option<String> {
        let mut state = self.state.lock();
        match &*state {
            Some((message, expires_at)) if *expires_at > now_micros() => Some(message.clone()),
            Some(_) => {
                *state = None;
                None
            }
            None => None,
        }
    }
}

impl Default for MaintenanceFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Last-activity watermark feeding idle detection.
pub struct ActivityTracker {
    last_activity: AtomicU64,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self {
            last_activity: AtomicU64::new(now_micros()),
        }
    }

    /// Record user activity. Called on every inbound message.
    pub fn record(&self) {
        self.last_activity.store(now_micros(), Ordering::SeqCst);
    }

    /// Seconds since the last recorded activity.
    pub fn idle_seconds(&self) -> u64 {
        let last = self.last_activity.load(Ordering::SeqCst);
        now_micros().saturating_sub(last) / 1_000_000
    }
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_runner_per_job_type() {
        let table = Arc::new(LeaseTable::new(Duration::from_secs(60)));

        let handle = table.try_acquire(JobKind::MergeDetection).unwrap();
        assert!(table.try_acquire(JobKind::MergeDetection).is_none());

        // A different job type is independent.
        assert!(table.try_acquire(JobKind::DlqReplay).is_some());

        drop(handle);
        assert!(table.try_acquire(JobKind::MergeDetection).is_some());
    }

    #[test]
    fn test_expired_lease_is_taken_over() {
        let table = Arc::new(LeaseTable::new(Duration::from_micros(1)));

        let stale = table.try_acquire(JobKind::MergeDetection).unwrap();
        std::thread::sleep(Duration::from_millis(2));

        // Lease expired: a new runner claims it even though the old
        // handle was never dropped (crashed worker).
        let fresh = table.try_acquire(JobKind::MergeDetection).unwrap();

        // The stale handle's drop must not evict the new holder.
        drop(stale);
        assert!(fresh.renew());
    }

    #[test]
    fn test_renew_extends_lease() {
        let table = Arc::new(LeaseTable::new(Duration::from_secs(60)));
        let handle = table.try_acquire(JobKind::ProfileRefinement).unwrap();
        assert!(handle.renew());
    }

    #[test]
    fn test_maintenance_flag_expires() {
        let flag = MaintenanceFlag::new();
        flag.set("merging duplicates", Duration::from_micros(1));
        std::thread::sleep(Duration::from_millis(2));
        assert!(flag.current().is_none());

        flag.set("merging duplicates", Duration::from_secs(60));
        assert_eq!(flag.current().unwrap(), "merging duplicates");
        flag.clear();
        assert!(flag.current().is_none());
    }

    #[test]
    fn test_pending_flags() {
        let table = Arc::new(LeaseTable::new(Duration::from_secs(60)));
        assert!(!table.take_pending(JobKind::MergeDetection));
        table.set_pending(JobKind::MergeDetection);
        assert!(table.take_pending(JobKind::MergeDetection));
        assert!(!table.take_pending(JobKind::MergeDetection));
    }
}
