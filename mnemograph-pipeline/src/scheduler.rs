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

//! Scheduler / Lease Coordinator
//!
//! Wakes background jobs during detected idle periods. Each job type
//! is guarded by a lease: at most one runner system-wide, renewed by
//! heartbeat while the job executes, auto-expiring if the runner
//! crashes. A job that cannot take its lease skips the cycle rather
//! than blocking. Jobs interrupted by shutdown leave a pending
//! marker so the next session runs them first.

use async_trait::async_trait;
use mnemograph_core::config::SchedulerConfig;
use mnemograph_core::PipelineError;
use mnemograph_store::{
    ActivityTracker, DeadLetterQueue, GraphStore, JobKind, LeaseTable, MaintenanceFlag,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::dlq::DlqReplayManager;
use crate::merge::MergeDetector;
use crate::refiner::ProfileRefiner;

/// Context handed to every job check and execution.
#[derive(Debug, Clone, Copy)]
pub struct JobContext {
    pub idle_seconds: u64,
    /// Set when the job was interrupted last session.
    pub pending: bool,
}

/// A background job coordinated by the scheduler.
#[async_trait]
pub trait BackgroundJob: Send + Sync {
    fn kind(&self) -> JobKind;

    /// Whether the job has work, given the current context. Idle
    /// gating happens in the scheduler; this checks job-local state.
    async fn should_run(&self, ctx: &JobContext) -> bool;

    /// Run to completion, returning a one-line summary.
    async fn execute(&self, ctx: &JobContext) -> Result<String, PipelineError>;
}

pub struct Scheduler {
    jobs: Vec<Arc<dyn BackgroundJob>>,
    leases: Arc<LeaseTable>,
    activity: Arc<ActivityTracker>,
    maintenance: Arc<MaintenanceFlag>,
    config: SchedulerConfig,
    running: AtomicBool,
}

impl Scheduler {
    pub fn new(
        leases: Arc<LeaseTable>,
        activity: Arc<ActivityTracker>,
        maintenance: Arc<MaintenanceFlag>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            jobs: Vec::new(),
            leases,
            activity,
            maintenance,
            config,
            running: AtomicBool::new(false),
        }
    }

    /// Register a job. Returns self for chaining.
    pub fn register(mut self, job: Arc<dyn BackgroundJob>) -> Self {
        info!("Registered job: {}", job.kind().as_str());
        self.jobs.push(job);
        self
    }

    /// Scheduler loop: check triggers every `check_interval_secs`.
    pub async fn run(self: Arc<Self>) {
        self.running.store(true, Ordering::SeqCst);
        info!("Scheduler started with {} jobs", self.jobs.len());

        while self.running.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(self.config.check_interval_secs)).await;
            self.run_cycle().await;
        }
    }

    /// One trigger check across all jobs. Returns how many executed.
    pub async fn run_cycle(&self) -> usize {
        let idle_seconds = self.activity.idle_seconds();
        let mut executed = 0;

        for job in &self.jobs {
            let kind = job.kind();
            let pending = self.leases.take_pending(kind);
            let ctx = JobContext {
                idle_seconds,
                pending,
            };

            if !pending {
                if idle_seconds < self.config.idle_threshold_secs {
                    continue;
                }
                if !job.should_run(&ctx).await {
                    continue;
                }
            }

            // Lease held elsewhere: skip the cycle, never block.
            let Some(lease) = self.leases.try_acquire(kind) else {
                debug!("Lease unavailable for {}; skipping cycle", kind.as_str());
                continue;
            };

            let ttl = Duration::from_secs(self.config.lease_ttl_secs);
            self.maintenance
                .set(&format!("{} in progress", kind.as_str()), ttl);

            // Heartbeat the lease while the job runs.
            let heartbeat = ttl / 3;
            let exec = job.execute(&ctx);
            tokio::pin!(exec);
            let result = loop {
                tokio::select! {
                    result = &mut exec => break result,
                    _ = tokio::time::sleep(heartbeat) => {
                        lease.renew();
                    }
                }
            };

            self.maintenance.clear();
            drop(lease);

            match result {
                Ok(summary) => {
                    executed += 1;
                    info!("Job {}: {}", kind.as_str(), summary);
                }
                Err(e) => error!("Job {} failed: {}", kind.as_str(), e),
            }
        }

        executed
    }

    /// Graceful shutdown: stop the loop and mark unfinished work
    /// pending so the next session picks it up.
    pub async fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);

        let ctx = JobContext {
            idle_seconds: self.activity.idle_seconds(),
            pending: false,
        };
        for job in &self.jobs {
            if job.should_run(&ctx).await {
                self.leases.set_pending(job.kind());
                debug!("Pending flag set for {}", job.kind().as_str());
            }
        }
        info!("Scheduler stopped");
    }
}

/// Merge detection sweep as a scheduled job.
pub struct MergeDetectionJob {
    detector: Arc<MergeDetector>,
    store: Arc<dyn GraphStore>,
}

impl MergeDetectionJob {
    pub fn new(detector: Arc<MergeDetector>, store: Arc<dyn GraphStore>) -> Self {
        Self { detector, store }
    }
}

#[async_trait]
impl BackgroundJob for MergeDetectionJob {
    fn kind(&self) -> JobKind {
        JobKind::MergeDetection
    }

    async fn should_run(&self, _ctx: &JobContext) -> bool {
        self.store.entity_count().await >= 2
    }

    async fn execute(&self, _ctx: &JobContext) -> Result<String, PipelineError> {
        let report = self.detector.sweep().await;
        Ok(format!(
            "{} merged, {} proposals, {} conflicts",
            report.merged,
            report.review.len(),
            report.conflicts
        ))
    }
}

/// Profile refinement sweep as a scheduled job.
pub struct ProfileSweepJob {
    refiner: Arc<ProfileRefiner>,
}

impl ProfileSweepJob {
    pub fn new(refiner: Arc<ProfileRefiner>) -> Self {
        Self { refiner }
    }
}

#[async_trait]
impl BackgroundJob for ProfileSweepJob {
    fn kind(&self) -> JobKind {
        JobKind::ProfileRefinement
    }

    async fn should_run(&self, ctx: &JobContext) -> bool {
        self.refiner.should_sweep(ctx.idle_seconds)
    }

    async fn execute(&self, _ctx: &JobContext) -> Result<String, PipelineError> {
        let refined = self.refiner.sweep().await;
        Ok(format!("{} profiles refined", refined))
    }
}

/// DLQ replay as a scheduled job.
pub struct DlqReplayJob {
    manager: Arc<DlqReplayManager>,
    dlq: Arc<DeadLetterQueue>,
}

impl DlqReplayJob {
    pub fn new(manager: Arc<DlqReplayManager>, dlq: Arc<DeadLetterQueue>) -> Self {
        Self { manager, dlq }
    }
}

#[async_trait]
impl BackgroundJob for DlqReplayJob {
    fn kind(&self) -> JobKind {
        JobKind::DlqReplay
    }

    async fn should_run(&self, _ctx: &JobContext) -> bool {
        !self.dlq.is_empty()
    }

    async fn execute(&self, _ctx: &JobContext) -> Result<String, PipelineError> {
        let report = self.manager.replay().await;
        Ok(format!(
            "{} replayed, {} committed, {} still parked",
            report.attempted, report.committed, report.still_parked
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingJob {
        runs: AtomicUsize,
        ready: AtomicBool,
    }

    impl CountingJob {
        fn new(ready: bool) -> Arc<Self> {
            Arc::new(Self {
                runs: AtomicUsize::new(0),
                ready: AtomicBool::new(ready),
            })
        }
    }

    #[async_trait]
    impl BackgroundJob for CountingJob {
        fn kind(&self) -> JobKind {
            JobKind::MergeDetection
        }

        async fn should_run(&self, _ctx: &JobContext) -> bool {
            self.ready.load(Ordering::SeqCst)
        }

        async fn execute(&self, _ctx: &JobContext) -> Result<String, PipelineError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok("done".to_string())
        }
    }

    fn scheduler(idle_threshold_secs: u64) -> (Scheduler, Arc<LeaseTable>) {
        let leases = Arc::new(LeaseTable::new(Duration::from_secs(60)));
        let scheduler = Scheduler::new(
            leases.clone(),
            Arc::new(ActivityTracker::new()),
            Arc::new(MaintenanceFlag::new()),
            SchedulerConfig {
                idle_threshold_secs,
                ..Default::default()
            },
        );
        (scheduler, leases)
    }

    #[tokio::test]
    async fn test_idle_gating() {
        // Activity was just recorded, so idle is ~0: with a nonzero
        // threshold the job must not run.
        let (scheduler, _leases) = scheduler(900);
        let job = CountingJob::new(true);
        let scheduler = scheduler.register(job.clone());

        assert_eq!(scheduler.run_cycle().await, 0);
        assert_eq!(job.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_runs_when_idle_and_ready() {
        let (scheduler, _leases) = scheduler(0);
        let job = CountingJob::new(true);
        let scheduler = scheduler.register(job.clone());

        assert_eq!(scheduler.run_cycle().await, 1);
        assert_eq!(job.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_lease_held_skips_cycle() {
        let (scheduler, leases) = scheduler(0);
        let job = CountingJob::new(true);
        let scheduler = scheduler.register(job.clone());

        // Another runner holds the merge-detection lease.
        let held = leases.try_acquire(JobKind::MergeDetection).unwrap();
        assert_eq!(scheduler.run_cycle().await, 0);
        assert_eq!(job.runs.load(Ordering::SeqCst), 0);

        drop(held);
        assert_eq!(scheduler.run_cycle().await, 1);
    }

    #[tokio::test]
    async fn test_pending_flag_overrides_idle_gate() {
        let (scheduler, leases) = scheduler(900);
        let job = CountingJob::new(false);
        let scheduler = scheduler.register(job.clone());

        leases.set_pending(JobKind::MergeDetection);
        assert_eq!(scheduler.run_cycle().await, 1);
        // Marker consumed: the next cycle gates normally again.
        assert_eq!(scheduler.run_cycle().await, 0);
    }

    #[tokio::test]
    async fn test_shutdown_marks_pending_work() {
        let (scheduler, leases) = scheduler(900);
        let job = CountingJob::new(true);
        let scheduler = scheduler.register(job.clone());

        scheduler.shutdown().await;
        assert!(leases.take_pending(JobKind::MergeDetection));
    }
}
