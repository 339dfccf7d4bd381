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

//! Test harness for the scheduler and the API
//!
//! An in-memory control plane (store + bus + scheduler) plus a virtual
//! GPU worker which plays the executor role: it consumes dispatch
//! events and drives jobs to a terminal state through the same
//! conditional updates the real executor uses.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use modelops_core::error::Result;
use modelops_core::event::bus::{EventBus, MemoryEventBus, Subscription};
use modelops_core::event::{
    decode_event, dispatch_subjects, encode_event, JobDispatched, JobEnqueued,
    SUBJECT_ENQUEUED,
};
use modelops_core::model::{
    GpuJob, IsolationLevel, JobStatus, PoolRequest, TenantGpuPolicy, UsageRecord,
};
use modelops_core::state::backend::memory::MemoryBackend;
use modelops_core::state::backend::{Keyspace, StateBackend};
use modelops_core::state::{encode_row, StateStores};

use crate::config::SchedulerConfig;
use crate::metrics::SchedulerMetricsCollector;
use crate::scheduler::GpuScheduler;

/// Utility for running some async check multiple times to verify a
/// condition. It will run the check at the specified interval up to a
/// maximum of the specified iterations.
pub async fn await_condition<Fut: Future<Output = Result<bool>>, F: Fn() -> Fut>(
    interval: Duration,
    iterations: usize,
    cond: F,
) -> Result<bool> {
    let mut iteration = 0;

    while iteration < iterations {
        let check = cond().await?;

        if check {
            return Ok(true);
        } else {
            iteration += 1;
            tokio::time::sleep(interval).await;
        }
    }

    Ok(false)
}

pub struct SchedulerTestHarness {
    pub backend: Arc<MemoryBackend>,
    pub stores: StateStores,
    pub bus: Arc<MemoryEventBus>,
    pub scheduler: Arc<GpuScheduler>,
    pub metrics: Arc<TestMetricsCollector>,
    project_id: Uuid,
}

impl SchedulerTestHarness {
    pub fn new(config: SchedulerConfig) -> Self {
        let backend = Arc::new(MemoryBackend::new());
        let stores = StateStores::new(backend.clone());
        let bus = Arc::new(MemoryEventBus::new());
        let metrics = Arc::new(TestMetricsCollector::default());
        let scheduler = Arc::new(GpuScheduler::new(
            stores.clone(),
            bus.clone(),
            config,
            metrics.clone(),
        ));
        Self {
            backend,
            stores,
            bus,
            scheduler,
            metrics,
            project_id: Uuid::new_v4(),
        }
    }

    /// Register a tenant with an explicit policy and return its id.
    pub async fn tenant_with_policy(
        &self,
        t4_max_concurrency: u32,
        mig_max_concurrency: u32,
        max_queued_jobs: u32,
        priority_boost: i32,
    ) -> Uuid {
        let tenant_id = Uuid::new_v4();
        self.stores
            .policies
            .put(&TenantGpuPolicy {
                tenant_id,
                plan: "test".to_owned(),
                t4_max_concurrency,
                mig_max_concurrency,
                max_queued_jobs,
                priority_boost,
            })
            .await
            .expect("writing policy");
        tenant_id
    }

    /// Insert a QUEUED job the way the jobs API does, enqueued event
    /// included.
    pub async fn submit(
        &self,
        tenant_id: Uuid,
        pool: PoolRequest,
        isolation: IsolationLevel,
        priority: i32,
    ) -> GpuJob {
        let job = GpuJob::new_queued(
            tenant_id,
            self.project_id,
            pool,
            isolation,
            priority,
            "http://inference.local/run".to_owned(),
            serde_json::json!({"input": "test"}),
        );
        self.stores.jobs.create(&job).await.expect("creating job");

        let event = JobEnqueued {
            job_id: job.job_id,
            tenant_id,
            project_id: self.project_id,
            published_at: Utc::now().timestamp_millis(),
        };
        self.bus
            .publish(SUBJECT_ENQUEUED, encode_event(&event).unwrap())
            .await
            .expect("publishing enqueued");
        job
    }

    pub async fn status(&self, job: &GpuJob) -> JobStatus {
        self.stores
            .jobs
            .expect(job.job_id)
            .await
            .expect("reading job")
            .status
    }

    pub async fn statuses(&self, jobs: &[GpuJob]) -> Vec<JobStatus> {
        let mut statuses = Vec::with_capacity(jobs.len());
        for job in jobs {
            statuses.push(self.status(job).await);
        }
        statuses
    }

    /// Move a DISPATCHED job to RUNNING with its own token.
    pub async fn start(&self, job: &GpuJob) {
        let row = self.stores.jobs.expect(job.job_id).await.expect("job row");
        let token = row.dispatch_token.expect("job has no dispatch token");
        assert!(self
            .stores
            .jobs
            .try_start(job.job_id, token, Utc::now())
            .await
            .expect("starting job"));
    }

    /// Drive a DISPATCHED job all the way to SUCCEEDED.
    pub async fn complete(&self, job: &GpuJob) {
        self.start(job).await;
        let row = self.stores.jobs.expect(job.job_id).await.expect("job row");
        let token = row.dispatch_token.expect("job has no dispatch token");
        assert!(self
            .stores
            .jobs
            .try_succeed(
                job.job_id,
                token,
                serde_json::json!({"status": "ok"}),
                Utc::now(),
            )
            .await
            .expect("completing job"));
    }

    /// Rewrite a DISPATCHED row so its dispatch looks `age` old.
    pub async fn age_dispatch(&self, job: &GpuJob, age: chrono::Duration) {
        let mut row = self.stores.jobs.expect(job.job_id).await.expect("job row");
        row.dispatched_at = Some(Utc::now() - age);
        self.rewrite(&row).await;
    }

    /// Rewrite a RUNNING row so its start looks `age` old.
    pub async fn age_running(&self, job: &GpuJob, age: chrono::Duration) {
        let mut row = self.stores.jobs.expect(job.job_id).await.expect("job row");
        row.started_at = Some(Utc::now() - age);
        self.rewrite(&row).await;
    }

    async fn rewrite(&self, row: &GpuJob) {
        self.backend
            .put(
                Keyspace::GpuJobs,
                row.job_id.to_string(),
                encode_row(row).expect("encoding job row"),
            )
            .await
            .expect("rewriting job row");
    }

    /// A worker consuming the dispatch subjects like a real executor.
    pub async fn virtual_worker(&self) -> VirtualWorker {
        let subjects = dispatch_subjects();
        let subject_refs: Vec<&str> = subjects.iter().map(String::as_str).collect();
        let subscription = self
            .bus
            .subscribe(&subject_refs, "virtual-executors")
            .await
            .expect("subscribing worker");
        VirtualWorker {
            stores: self.stores.clone(),
            subscription,
        }
    }
}

/// Plays the executor role against the store: token check, start,
/// succeed, usage row. Stale deliveries are dropped exactly like the
/// real dispatcher drops them.
pub struct VirtualWorker {
    stores: StateStores,
    subscription: Box<dyn Subscription>,
}

impl VirtualWorker {
    /// Process the next dispatch event, returning the completed job id,
    /// or `None` if no event arrives within the polling window.
    pub async fn run_one(&mut self) -> Option<Uuid> {
        loop {
            let delivery = match tokio::time::timeout(
                Duration::from_millis(200),
                self.subscription.next(),
            )
            .await
            {
                Ok(delivery) => delivery,
                Err(_) => return None,
            };
            let event: JobDispatched = match decode_event(&delivery.body) {
                Ok(event) => event,
                Err(_) => continue,
            };
            self.subscription
                .ack(delivery)
                .await
                .expect("acking delivery");

            let row = match self.stores.jobs.get(event.job_id).await.expect("job row") {
                Some(row) => row,
                None => continue,
            };
            if row.dispatch_token != Some(event.dispatch_token) {
                // stale delivery from an earlier attempt
                continue;
            }

            let started_at = Utc::now();
            if !self
                .stores
                .jobs
                .try_start(event.job_id, event.dispatch_token, started_at)
                .await
                .expect("starting job")
            {
                continue;
            }
            let finished_at = Utc::now();
            self.stores
                .jobs
                .try_succeed(
                    event.job_id,
                    event.dispatch_token,
                    serde_json::json!({"status": "ok"}),
                    finished_at,
                )
                .await
                .expect("finishing job");

            let row = self
                .stores
                .jobs
                .expect(event.job_id)
                .await
                .expect("job row");
            let record =
                UsageRecord::gpu_seconds(&row, event.pool, started_at, finished_at);
            self.stores
                .usage
                .append(&record)
                .await
                .expect("appending usage");

            return Some(event.job_id);
        }
    }
}

#[derive(Clone)]
pub enum MetricEvent {
    Submitted(String),
    Dispatched(String, u64),
    Reverted(String),
    DispatchFailed(String),
}

impl MetricEvent {
    pub fn job_id(&self) -> &str {
        match self {
            MetricEvent::Submitted(job) => job.as_str(),
            MetricEvent::Dispatched(job, _) => job.as_str(),
            MetricEvent::Reverted(job) => job.as_str(),
            MetricEvent::DispatchFailed(job) => job.as_str(),
        }
    }
}

#[derive(Default)]
pub struct TestMetricsCollector {
    pub events: Mutex<Vec<MetricEvent>>,
    pub queued_gauge: Mutex<u64>,
}

impl TestMetricsCollector {
    pub fn job_events(&self, job_id: &str) -> Vec<MetricEvent> {
        let guard = self.events.lock();
        guard
            .iter()
            .filter(|event| event.job_id() == job_id)
            .cloned()
            .collect()
    }
}

impl SchedulerMetricsCollector for TestMetricsCollector {
    fn record_submitted(&self, job_id: &str) {
        self.events
            .lock()
            .push(MetricEvent::Submitted(job_id.to_owned()));
    }

    fn record_dispatched(&self, job_id: &str, queued_millis: u64) {
        self.events
            .lock()
            .push(MetricEvent::Dispatched(job_id.to_owned(), queued_millis));
    }

    fn record_reverted(&self, job_id: &str) {
        self.events
            .lock()
            .push(MetricEvent::Reverted(job_id.to_owned()));
    }

    fn record_dispatch_failed(&self, job_id: &str) {
        self.events
            .lock()
            .push(MetricEvent::DispatchFailed(job_id.to_owned()));
    }

    fn set_queued_jobs(&self, value: u64) {
        *self.queued_gauge.lock() = value;
    }
}

pub fn assert_dispatched_event(job_id: &str, collector: &TestMetricsCollector) {
    let found = collector
        .job_events(job_id)
        .iter()
        .any(|ev| matches!(ev, MetricEvent::Dispatched(_, _)));

    assert!(found, "Expected dispatched event for job {job_id}");
}
