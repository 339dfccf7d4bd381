// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! The GPU scheduler control loop
//!
//! Each tick recovers orphaned dispatches, snapshots pool capacity from
//! the store, and walks the queue in
//! `(priority + boost) DESC, requested_at ASC, job_id ASC` order,
//! committing each admission with a conditional update. Ticks are
//! idempotent and replicas are safe: a tick that crashes after N
//! dispatches leaves the store consistent because every dispatch is its
//! own atomic step, and a lost race simply shows up as zero rows
//! affected.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use itertools::Itertools;
use log::{debug, error, info, warn};
use uuid::Uuid;

use modelops_core::error::Result;
use modelops_core::event::bus::EventBus;
use modelops_core::event::{dispatch_subject, encode_event, JobDispatched};
use modelops_core::model::{
    GpuJob, GpuPool, IsolationLevel, JobStatus, PoolRequest, TenantGpuPolicy,
};
use modelops_core::state::StateStores;

use crate::config::SchedulerConfig;
use crate::metrics::SchedulerMetricsCollector;

pub const ERROR_DISPATCH_TIMEOUT: &str = "dispatch_timeout";
pub const ERROR_EXECUTOR_TIMEOUT: &str = "executor_timeout";

/// What one tick did. Ticks are logged at debug level unless they acted.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickSummary {
    pub dispatched: usize,
    pub reverted: usize,
    pub failed: usize,
}

pub struct GpuScheduler {
    stores: StateStores,
    bus: Arc<dyn EventBus>,
    config: SchedulerConfig,
    metrics: Arc<dyn SchedulerMetricsCollector>,
}

impl GpuScheduler {
    pub fn new(
        stores: StateStores,
        bus: Arc<dyn EventBus>,
        config: SchedulerConfig,
        metrics: Arc<dyn SchedulerMetricsCollector>,
    ) -> Self {
        Self {
            stores,
            bus,
            config,
            metrics,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Spawn the periodic control loop.
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let interval = self.config.tick_interval;
        tokio::task::spawn(async move {
            info!(
                "GPU scheduler loop started (tick every {:?}, slots: t4 shared {}, t4 exclusive {}, mig {})",
                interval,
                self.config.t4_shared_slots,
                self.config.t4_exclusive_slots,
                self.config.mig_total_slots
            );
            loop {
                match self.tick().await {
                    Ok(summary)
                        if summary.dispatched + summary.reverted + summary.failed
                            > 0 =>
                    {
                        info!(
                            "Tick dispatched {} job(s), reverted {}, failed {}",
                            summary.dispatched, summary.reverted, summary.failed
                        );
                    }
                    Ok(_) => {}
                    Err(e) => error!("Scheduler tick failed: {e}"),
                }
                tokio::time::sleep(interval).await;
            }
        })
    }

    /// One scheduling pass. Safe to call concurrently with other
    /// replicas; the store serializes every transition.
    pub async fn tick(&self) -> Result<TickSummary> {
        let mut summary = TickSummary::default();

        self.recover_orphans(&mut summary).await?;

        let in_flight = self.stores.jobs.in_flight().await?;
        let mut slots = SlotTracker::new(&self.config, &in_flight);

        let queued = self.stores.jobs.queued().await?;
        self.metrics.set_queued_jobs(queued.len() as u64);
        if queued.is_empty() {
            return Ok(summary);
        }

        let policies = self.load_policies(&queued).await?;

        let mut candidates = queued;
        candidates.sort_by(|a, b| {
            effective_priority(b, &policies)
                .cmp(&effective_priority(a, &policies))
                .then_with(|| a.requested_at.cmp(&b.requested_at))
                .then_with(|| a.job_id.cmp(&b.job_id))
        });

        let now = Utc::now();
        for job in candidates {
            let pool = self.resolve_pool(&job, &slots);

            // global slots and the T4 exclusivity interlock come before
            // any per-tenant consideration
            if !slots.admits(pool, job.isolation_level) {
                continue;
            }

            let policy = match policies.get(&job.tenant_id) {
                Some(policy) => policy,
                None => continue,
            };
            if slots.tenant_in_flight(job.tenant_id, pool) + 1
                > policy.max_concurrency_for(pool)
            {
                // a capped tenant must not block the rest of the queue
                debug!(
                    "Tenant {} at {} concurrency cap, skipping job {}",
                    job.tenant_id, pool, job.job_id
                );
                continue;
            }

            let token = Uuid::new_v4();
            if !self
                .stores
                .jobs
                .try_dispatch(job.job_id, pool, token, now)
                .await?
            {
                // another replica won this row
                continue;
            }
            slots.commit(job.tenant_id, pool, job.isolation_level);
            summary.dispatched += 1;

            let queued_millis = now
                .signed_duration_since(job.requested_at)
                .num_milliseconds()
                .max(0) as u64;
            self.metrics
                .record_dispatched(&job.job_id.to_string(), queued_millis);

            self.publish_dispatch(&job, pool, token).await;
        }

        Ok(summary)
    }

    /// Dispatch events are best-effort: a lost event is recovered by the
    /// orphan path, so publish failures must not fail the tick.
    async fn publish_dispatch(&self, job: &GpuJob, pool: GpuPool, token: Uuid) {
        let subject = dispatch_subject(pool, job.isolation_level);
        let event = JobDispatched {
            job_id: job.job_id,
            dispatch_token: token,
            tenant_id: job.tenant_id,
            project_id: job.project_id,
            pool,
            isolation: job.isolation_level,
            published_at: Utc::now().timestamp_millis(),
        };
        let body = match encode_event(&event) {
            Ok(body) => body,
            Err(e) => {
                error!("Failed to encode dispatch event for {}: {e}", job.job_id);
                return;
            }
        };
        if let Err(e) = self.bus.publish(&subject, body).await {
            warn!("Failed to publish {subject} for job {}: {e}", job.job_id);
        }
    }

    async fn load_policies(
        &self,
        queued: &[GpuJob],
    ) -> Result<HashMap<Uuid, TenantGpuPolicy>> {
        let mut policies = HashMap::new();
        let tenant_ids: Vec<Uuid> = queued.iter().map(|job: &GpuJob| job.tenant_id).unique().collect();
        for tenant_id in tenant_ids {
            let policy = self.stores.policies.get(tenant_id).await?;
            policies.insert(tenant_id, policy);
        }
        Ok(policies)
    }

    fn resolve_pool(&self, job: &GpuJob, slots: &SlotTracker) -> GpuPool {
        match job.gpu_pool_requested {
            PoolRequest::T4 => GpuPool::T4,
            PoolRequest::Mig => GpuPool::Mig,
            // MIG first: hard partitioning is the stronger isolation,
            // fall back to T4 when MIG is absent or saturated
            PoolRequest::Auto => {
                if self.config.mig_total_slots > 0 && slots.mig_free > 0 {
                    GpuPool::Mig
                } else {
                    GpuPool::T4
                }
            }
        }
    }

    /// Reclaim jobs stuck in `DISPATCHED` past the dispatch timeout and
    /// fail jobs stuck in `RUNNING` past the execution timeout. A
    /// `RUNNING` job is never redispatched: its side effects may have
    /// happened, and billing them twice is worse than failing.
    async fn recover_orphans(&self, summary: &mut TickSummary) -> Result<()> {
        let now = Utc::now();
        let dispatch_timeout = chrono::Duration::from_std(self.config.dispatch_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(i64::MAX / 1_000));
        let execution_timeout =
            chrono::Duration::from_std(self.config.execution_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(i64::MAX / 1_000));

        for job in self.stores.jobs.in_flight().await? {
            match job.status {
                JobStatus::Dispatched => {
                    let dispatched_at = match job.dispatched_at {
                        Some(ts) => ts,
                        None => continue,
                    };
                    if now.signed_duration_since(dispatched_at) <= dispatch_timeout {
                        continue;
                    }
                    if job.dispatch_attempts >= self.config.max_dispatch_attempts {
                        if self
                            .stores
                            .jobs
                            .try_fail_dispatched(job.job_id, ERROR_DISPATCH_TIMEOUT, now)
                            .await?
                        {
                            warn!(
                                "Job {} failed after {} dispatch attempts",
                                job.job_id, job.dispatch_attempts
                            );
                            summary.failed += 1;
                            self.metrics
                                .record_dispatch_failed(&job.job_id.to_string());
                        }
                    } else if self
                        .stores
                        .jobs
                        .try_revert_dispatch(job.job_id, now)
                        .await?
                    {
                        warn!(
                            "Reverted orphaned dispatch of job {} (attempt {})",
                            job.job_id, job.dispatch_attempts
                        );
                        summary.reverted += 1;
                        self.metrics.record_reverted(&job.job_id.to_string());
                    }
                }
                JobStatus::Running => {
                    let (started_at, token) = match (job.started_at, job.dispatch_token)
                    {
                        (Some(started_at), Some(token)) => (started_at, token),
                        _ => continue,
                    };
                    if now.signed_duration_since(started_at) <= execution_timeout {
                        continue;
                    }
                    if self
                        .stores
                        .jobs
                        .try_fail_running(job.job_id, token, ERROR_EXECUTOR_TIMEOUT, now)
                        .await?
                    {
                        warn!("Job {} timed out while RUNNING", job.job_id);
                        summary.failed += 1;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

fn effective_priority(job: &GpuJob, policies: &HashMap<Uuid, TenantGpuPolicy>) -> i64 {
    let boost = policies
        .get(&job.tenant_id)
        .map(|policy| policy.priority_boost)
        .unwrap_or(0);
    job.priority as i64 + boost as i64
}

/// Per-tick view of free capacity, kept current as the tick commits
/// dispatches. The store remains the source of truth; this never
/// outlives one tick.
struct SlotTracker {
    t4_shared_free: u32,
    t4_exclusive_free: u32,
    mig_free: u32,
    t4_shared_in_flight: u32,
    t4_exclusive_in_flight: u32,
    tenant_in_flight: HashMap<(Uuid, GpuPool), u32>,
}

impl SlotTracker {
    fn new(config: &SchedulerConfig, in_flight: &[GpuJob]) -> Self {
        let mut t4_shared = 0u32;
        let mut t4_exclusive = 0u32;
        let mut mig = 0u32;
        let mut tenant_in_flight: HashMap<(Uuid, GpuPool), u32> = HashMap::new();

        for job in in_flight {
            let pool = match job.gpu_pool_assigned {
                Some(pool) => pool,
                None => continue,
            };
            match (pool, job.isolation_level) {
                (GpuPool::T4, IsolationLevel::Shared) => t4_shared += 1,
                (GpuPool::T4, IsolationLevel::Exclusive) => t4_exclusive += 1,
                (GpuPool::Mig, _) => mig += 1,
            }
            *tenant_in_flight.entry((job.tenant_id, pool)).or_insert(0) += 1;
        }

        Self {
            t4_shared_free: config.t4_shared_slots.saturating_sub(t4_shared),
            t4_exclusive_free: config.t4_exclusive_slots.saturating_sub(t4_exclusive),
            mig_free: config.mig_total_slots.saturating_sub(mig),
            t4_shared_in_flight: t4_shared,
            t4_exclusive_in_flight: t4_exclusive,
            tenant_in_flight,
        }
    }

    /// Global slot availability, including the T4 soft-exclusivity
    /// interlock: no shared job may dispatch while an exclusive job is
    /// in flight, and vice versa.
    fn admits(&self, pool: GpuPool, isolation: IsolationLevel) -> bool {
        match pool {
            GpuPool::Mig => self.mig_free > 0,
            GpuPool::T4 => match isolation {
                IsolationLevel::Shared => {
                    self.t4_shared_free > 0 && self.t4_exclusive_in_flight == 0
                }
                IsolationLevel::Exclusive => {
                    self.t4_exclusive_free > 0 && self.t4_shared_in_flight == 0
                }
            },
        }
    }

    fn tenant_in_flight(&self, tenant_id: Uuid, pool: GpuPool) -> u32 {
        self.tenant_in_flight
            .get(&(tenant_id, pool))
            .copied()
            .unwrap_or(0)
    }

    fn commit(&mut self, tenant_id: Uuid, pool: GpuPool, isolation: IsolationLevel) {
        match (pool, isolation) {
            (GpuPool::T4, IsolationLevel::Shared) => {
                self.t4_shared_free = self.t4_shared_free.saturating_sub(1);
                self.t4_shared_in_flight += 1;
            }
            (GpuPool::T4, IsolationLevel::Exclusive) => {
                self.t4_exclusive_free = self.t4_exclusive_free.saturating_sub(1);
                self.t4_exclusive_in_flight += 1;
            }
            (GpuPool::Mig, _) => {
                self.mig_free = self.mig_free.saturating_sub(1);
            }
        }
        *self
            .tenant_in_flight
            .entry((tenant_id, pool))
            .or_insert(0) += 1;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_utils::{await_condition, SchedulerTestHarness};
    use modelops_core::model::{IsolationLevel, JobStatus, PoolRequest};
    use std::time::Duration;

    // Scenario: happy path on shared T4. Two of three jobs dispatch on
    // the first tick under a per-tenant cap of 2, the third follows once
    // a slot frees, and the ledger ends with one gpu_seconds row per job.
    #[tokio::test]
    async fn happy_path_t4_shared() {
        let harness = SchedulerTestHarness::new(SchedulerConfig::default());
        let tenant = harness.tenant_with_policy(2, 0, 10, 0).await;

        let mut jobs = vec![];
        for _ in 0..3 {
            jobs.push(
                harness
                    .submit(tenant, PoolRequest::T4, IsolationLevel::Shared, 0)
                    .await,
            );
        }

        // subscribe before the first tick so no dispatch event is lost
        let mut worker = harness.virtual_worker().await;

        let summary = harness.scheduler.tick().await.unwrap();
        assert_eq!(summary.dispatched, 2);

        let statuses = harness.statuses(&jobs).await;
        assert_eq!(
            statuses
                .iter()
                .filter(|s| **s == JobStatus::Dispatched)
                .count(),
            2
        );
        assert_eq!(
            statuses.iter().filter(|s| **s == JobStatus::Queued).count(),
            1
        );

        worker.run_one().await.expect("first dispatch");
        worker.run_one().await.expect("second dispatch");

        let summary = harness.scheduler.tick().await.unwrap();
        assert_eq!(summary.dispatched, 1);
        worker.run_one().await.expect("third dispatch");

        for job in &jobs {
            let row = harness.stores.jobs.expect(job.job_id).await.unwrap();
            assert_eq!(row.status, JobStatus::Succeeded);
            let finished = row.finished_at.unwrap();
            let started = row.started_at.unwrap();
            let dispatched = row.dispatched_at.unwrap();
            assert!(finished >= started);
            assert!(started >= dispatched);
            assert!(dispatched >= row.requested_at);
        }

        let ledger = harness.stores.usage.list().await.unwrap();
        assert_eq!(ledger.len(), 3);
        assert!(ledger.iter().all(|row| row.meter == "gpu_seconds"));
    }

    // Scenario: T4 exclusivity interlock. While an exclusive job is in
    // flight no shared job dispatches, and the shared job follows only
    // after the exclusive one reaches a terminal state.
    #[tokio::test]
    async fn exclusivity_interlock() {
        let harness = SchedulerTestHarness::new(
            SchedulerConfig::default()
                .with_t4_shared_slots(8)
                .with_t4_exclusive_slots(1),
        );
        let tenant = harness.tenant_with_policy(4, 0, 10, 0).await;

        let exclusive = harness
            .submit(tenant, PoolRequest::T4, IsolationLevel::Exclusive, 0)
            .await;
        harness.scheduler.tick().await.unwrap();
        assert_eq!(
            harness.status(&exclusive).await,
            JobStatus::Dispatched
        );

        let shared = harness
            .submit(tenant, PoolRequest::T4, IsolationLevel::Shared, 0)
            .await;
        harness.scheduler.tick().await.unwrap();
        assert_eq!(harness.status(&shared).await, JobStatus::Queued);

        harness.complete(&exclusive).await;
        harness.scheduler.tick().await.unwrap();
        assert_eq!(harness.status(&shared).await, JobStatus::Dispatched);
    }

    // The interlock also blocks the other direction: a queued exclusive
    // job waits while shared jobs are in flight.
    #[tokio::test]
    async fn exclusive_waits_for_shared_drain() {
        let harness = SchedulerTestHarness::new(SchedulerConfig::default());
        let tenant = harness.tenant_with_policy(4, 0, 10, 0).await;

        let shared = harness
            .submit(tenant, PoolRequest::T4, IsolationLevel::Shared, 0)
            .await;
        harness.scheduler.tick().await.unwrap();

        let exclusive = harness
            .submit(tenant, PoolRequest::T4, IsolationLevel::Exclusive, 100)
            .await;
        harness.scheduler.tick().await.unwrap();
        assert_eq!(harness.status(&exclusive).await, JobStatus::Queued);

        harness.complete(&shared).await;
        harness.scheduler.tick().await.unwrap();
        assert_eq!(harness.status(&exclusive).await, JobStatus::Dispatched);
    }

    // Scenario: strict priority ordering with one free slot; the later
    // but higher-priority submission goes first.
    #[tokio::test]
    async fn priority_ordering() {
        let harness = SchedulerTestHarness::new(
            SchedulerConfig::default().with_t4_shared_slots(1),
        );
        let tenant = harness.tenant_with_policy(2, 0, 10, 0).await;

        let job_a = harness
            .submit(tenant, PoolRequest::T4, IsolationLevel::Shared, 0)
            .await;
        let job_b = harness
            .submit(tenant, PoolRequest::T4, IsolationLevel::Shared, 10)
            .await;

        harness.scheduler.tick().await.unwrap();
        assert_eq!(harness.status(&job_b).await, JobStatus::Dispatched);
        assert_eq!(harness.status(&job_a).await, JobStatus::Queued);

        harness.complete(&job_b).await;
        harness.scheduler.tick().await.unwrap();
        assert_eq!(harness.status(&job_a).await, JobStatus::Dispatched);
    }

    // A tenant's priority boost participates in the global order.
    #[tokio::test]
    async fn priority_boost_applies() {
        let harness = SchedulerTestHarness::new(
            SchedulerConfig::default().with_t4_shared_slots(1),
        );
        let plain = harness.tenant_with_policy(2, 0, 10, 0).await;
        let boosted = harness.tenant_with_policy(2, 0, 10, 50).await;

        let plain_job = harness
            .submit(plain, PoolRequest::T4, IsolationLevel::Shared, 10)
            .await;
        let boosted_job = harness
            .submit(boosted, PoolRequest::T4, IsolationLevel::Shared, 0)
            .await;

        harness.scheduler.tick().await.unwrap();
        assert_eq!(harness.status(&boosted_job).await, JobStatus::Dispatched);
        assert_eq!(harness.status(&plain_job).await, JobStatus::Queued);
    }

    // Scenario: orphan recovery. A dispatch stale past the timeout is
    // reverted to QUEUED; once attempts are exhausted the job fails with
    // the well-known error string.
    #[tokio::test]
    async fn dispatch_orphan_recovery() {
        let config = SchedulerConfig::default()
            .with_dispatch_timeout(Duration::from_secs(120))
            .with_max_dispatch_attempts(3);
        let harness = SchedulerTestHarness::new(config);
        let tenant = harness.tenant_with_policy(2, 0, 10, 0).await;

        let job = harness
            .submit(tenant, PoolRequest::T4, IsolationLevel::Shared, 0)
            .await;
        harness.scheduler.tick().await.unwrap();

        // age the dispatch far past the timeout
        harness
            .age_dispatch(&job, chrono::Duration::seconds(240))
            .await;
        let summary = harness.scheduler.tick().await.unwrap();
        assert_eq!(summary.reverted, 1);
        // the same tick redispatches the reverted job
        assert_eq!(summary.dispatched, 1);

        let row = harness.stores.jobs.expect(job.job_id).await.unwrap();
        assert_eq!(row.dispatch_attempts, 2);

        // exhaust the attempt budget
        harness
            .age_dispatch(&job, chrono::Duration::seconds(240))
            .await;
        harness.scheduler.tick().await.unwrap();
        harness
            .age_dispatch(&job, chrono::Duration::seconds(240))
            .await;
        let summary = harness.scheduler.tick().await.unwrap();
        assert_eq!(summary.failed, 1);

        let row = harness.stores.jobs.expect(job.job_id).await.unwrap();
        assert_eq!(row.status, JobStatus::Failed);
        assert_eq!(row.error.as_deref(), Some(ERROR_DISPATCH_TIMEOUT));
    }

    // A RUNNING job stale past the execution timeout fails in place; it
    // is never redispatched.
    #[tokio::test]
    async fn stale_running_job_fails() {
        let harness = SchedulerTestHarness::new(
            SchedulerConfig::default()
                .with_execution_timeout(Duration::from_secs(600)),
        );
        let tenant = harness.tenant_with_policy(2, 0, 10, 0).await;

        let job = harness
            .submit(tenant, PoolRequest::T4, IsolationLevel::Shared, 0)
            .await;
        harness.scheduler.tick().await.unwrap();
        harness.start(&job).await;
        harness
            .age_running(&job, chrono::Duration::seconds(1200))
            .await;

        let summary = harness.scheduler.tick().await.unwrap();
        assert_eq!(summary.failed, 1);
        let row = harness.stores.jobs.expect(job.job_id).await.unwrap();
        assert_eq!(row.status, JobStatus::Failed);
        assert_eq!(row.error.as_deref(), Some(ERROR_EXECUTOR_TIMEOUT));
    }

    // auto resolves MIG-first while MIG slots are free, then falls back
    // to T4.
    #[tokio::test]
    async fn auto_pool_prefers_mig() {
        let harness = SchedulerTestHarness::new(
            SchedulerConfig::default().with_mig_total_slots(1),
        );
        let tenant = harness.tenant_with_policy(4, 2, 10, 0).await;

        let first = harness
            .submit(tenant, PoolRequest::Auto, IsolationLevel::Shared, 0)
            .await;
        let second = harness
            .submit(tenant, PoolRequest::Auto, IsolationLevel::Shared, 0)
            .await;
        harness.scheduler.tick().await.unwrap();

        let first_row = harness.stores.jobs.expect(first.job_id).await.unwrap();
        let second_row = harness.stores.jobs.expect(second.job_id).await.unwrap();
        assert_eq!(first_row.gpu_pool_assigned, Some(GpuPool::Mig));
        assert_eq!(second_row.gpu_pool_assigned, Some(GpuPool::T4));
    }

    // A capped tenant must not block other tenants behind it in the
    // queue.
    #[tokio::test]
    async fn capped_tenant_does_not_block_others() {
        let harness = SchedulerTestHarness::new(SchedulerConfig::default());
        let greedy = harness.tenant_with_policy(1, 0, 10, 0).await;
        let modest = harness.tenant_with_policy(1, 0, 10, 0).await;

        // greedy fills its cap with a high-priority job, then queues more
        harness
            .submit(greedy, PoolRequest::T4, IsolationLevel::Shared, 100)
            .await;
        harness.scheduler.tick().await.unwrap();
        harness
            .submit(greedy, PoolRequest::T4, IsolationLevel::Shared, 100)
            .await;
        let modest_job = harness
            .submit(modest, PoolRequest::T4, IsolationLevel::Shared, 0)
            .await;

        harness.scheduler.tick().await.unwrap();
        assert_eq!(harness.status(&modest_job).await, JobStatus::Dispatched);
    }

    // Capacity invariant: at no observable point do in-flight counts
    // exceed the configured caps, per pool and per tenant.
    #[tokio::test]
    async fn capacity_caps_hold_across_ticks() {
        let config = SchedulerConfig::default()
            .with_t4_shared_slots(3)
            .with_mig_total_slots(2);
        let harness = SchedulerTestHarness::new(config.clone());
        let tenant_a = harness.tenant_with_policy(2, 1, 50, 0).await;
        let tenant_b = harness.tenant_with_policy(2, 2, 50, 0).await;

        for i in 0..20 {
            let tenant = if i % 2 == 0 { tenant_a } else { tenant_b };
            let pool = match i % 3 {
                0 => PoolRequest::T4,
                1 => PoolRequest::Mig,
                _ => PoolRequest::Auto,
            };
            harness
                .submit(tenant, pool, IsolationLevel::Shared, (i % 5) as i32)
                .await;
        }

        let mut worker = harness.virtual_worker().await;
        for _ in 0..24 {
            harness.scheduler.tick().await.unwrap();

            let in_flight = harness.stores.jobs.in_flight().await.unwrap();
            let t4_shared = in_flight
                .iter()
                .filter(|j| {
                    j.gpu_pool_assigned == Some(GpuPool::T4)
                        && j.isolation_level == IsolationLevel::Shared
                })
                .count();
            let mig = in_flight
                .iter()
                .filter(|j| j.gpu_pool_assigned == Some(GpuPool::Mig))
                .count();
            assert!(t4_shared <= config.t4_shared_slots as usize);
            assert!(mig <= config.mig_total_slots as usize);

            for (tenant, caps) in [(tenant_a, (2u32, 1u32)), (tenant_b, (2, 2))] {
                let t4 = in_flight
                    .iter()
                    .filter(|j| {
                        j.tenant_id == tenant
                            && j.gpu_pool_assigned == Some(GpuPool::T4)
                    })
                    .count();
                let mig = in_flight
                    .iter()
                    .filter(|j| {
                        j.tenant_id == tenant
                            && j.gpu_pool_assigned == Some(GpuPool::Mig)
                    })
                    .count();
                assert!(t4 <= caps.0 as usize, "tenant t4 cap exceeded");
                assert!(mig <= caps.1 as usize, "tenant mig cap exceeded");
            }

            while worker.run_one().await.is_some() {}
        }

        let done = await_condition(Duration::from_millis(20), 50, || async {
            let jobs = harness.stores.jobs.list().await?;
            Ok(jobs.iter().all(|j| j.status.is_terminal()))
        })
        .await
        .unwrap();
        assert!(done, "all jobs should reach a terminal state");
    }
}
