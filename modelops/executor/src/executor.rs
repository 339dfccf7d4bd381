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

//! Executor logic: runs once per dispatched job
//!
//! Every transition presents the dispatch token, so a stale executor
//! (superseded by a redispatch, or racing the scheduler's reclaim) exits
//! silently without touching the row. Worker failures never raise; they
//! end as a terminal `FAILED` row with an `error` string.

use std::sync::Arc;

use chrono::Utc;
use log::{debug, info, warn};
use uuid::Uuid;

use modelops_core::client::TenantHttpClient;
use modelops_core::error::Result;
use modelops_core::event::bus::EventBus;
use modelops_core::event::{encode_event, UsageRecorded, SUBJECT_USAGE_RECORDED};
use modelops_core::model::{GpuJob, UsageRecord};
use modelops_core::state::StateStores;
use modelops_core::tenancy::TenantContext;

use crate::config::{ExecutorKind, WorkerConfig};

/// What one executor run did to the job row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Succeeded,
    Failed,
    /// Another owner holds the row; nothing was touched.
    Stale,
}

pub struct Executor {
    stores: StateStores,
    bus: Arc<dyn EventBus>,
    config: WorkerConfig,
    client: TenantHttpClient,
}

impl Executor {
    pub fn new(
        stores: StateStores,
        bus: Arc<dyn EventBus>,
        config: WorkerConfig,
    ) -> Result<Self> {
        let client = TenantHttpClient::new(config.http_timeout)?;
        Ok(Self {
            stores,
            bus,
            config,
            client,
        })
    }

    /// Run one dispatched job to a terminal state. Errors are
    /// infrastructure faults only; a job failure is a normal
    /// `Ok(ExecutionOutcome::Failed)`.
    pub async fn run(&self, job_id: Uuid, token: Uuid) -> Result<ExecutionOutcome> {
        let job = match self.stores.jobs.get(job_id).await? {
            Some(job) => job,
            None => {
                debug!("Job {job_id} does not exist, dropping");
                return Ok(ExecutionOutcome::Stale);
            }
        };
        if job.dispatch_token != Some(token) {
            debug!("Job {job_id} is owned by another dispatch attempt, exiting");
            return Ok(ExecutionOutcome::Stale);
        }

        let started_at = Utc::now();
        if !self.stores.jobs.try_start(job_id, token, started_at).await? {
            debug!("Job {job_id} lost the RUNNING transition, exiting");
            return Ok(ExecutionOutcome::Stale);
        }
        info!("Job {job_id} running ({:?})", self.config.executor);

        let work = self.perform(&job).await;
        let finished_at = Utc::now();

        let outcome = match work {
            Ok(response_json) => {
                if !self
                    .stores
                    .jobs
                    .try_succeed(job_id, token, response_json, finished_at)
                    .await?
                {
                    // the scheduler reclaimed the row mid-run
                    return Ok(ExecutionOutcome::Stale);
                }
                ExecutionOutcome::Succeeded
            }
            Err(error) => {
                warn!("Job {job_id} failed: {error}");
                if !self
                    .stores
                    .jobs
                    .try_fail_running(job_id, token, &error.to_string(), finished_at)
                    .await?
                {
                    return Ok(ExecutionOutcome::Stale);
                }
                ExecutionOutcome::Failed
            }
        };

        let row = self.stores.jobs.expect(job_id).await?;
        self.record_usage(&row).await?;

        Ok(outcome)
    }

    async fn perform(&self, job: &GpuJob) -> Result<serde_json::Value> {
        match self.config.executor {
            ExecutorKind::Simulate => {
                tokio::time::sleep(self.config.simulate_duration).await;
                Ok(serde_json::json!({
                    "simulated": true,
                    "job_id": job.job_id,
                    "slept_seconds": self.config.simulate_duration.as_secs_f64(),
                }))
            }
            ExecutorKind::Http => {
                let ctx = TenantContext {
                    tenant_id: job.tenant_id,
                    project_id: job.project_id,
                    user_id: "gpu-executor".to_owned(),
                    roles: vec![],
                };
                self.client
                    .post_json(&job.target_url, Some(&ctx), &job.request_json)
                    .await
            }
        }
    }

    /// One `gpu_seconds` ledger row per finished job, success or
    /// failure.
    async fn record_usage(&self, row: &GpuJob) -> Result<()> {
        let pool = match row.gpu_pool_assigned {
            Some(pool) => pool,
            None => return Ok(()),
        };
        let (started_at, finished_at) = match (row.started_at, row.finished_at) {
            (Some(started_at), Some(finished_at)) => (started_at, finished_at),
            _ => return Ok(()),
        };

        let record = UsageRecord::gpu_seconds(row, pool, started_at, finished_at);
        self.stores.usage.append(&record).await?;

        let event = UsageRecorded {
            record_id: record.record_id,
            job_id: row.job_id,
            tenant_id: row.tenant_id,
            project_id: row.project_id,
            meter: record.meter.clone(),
            quantity: record.quantity,
            published_at: Utc::now().timestamp_millis(),
        };
        match encode_event(&event) {
            Ok(body) => {
                if let Err(e) = self.bus.publish(SUBJECT_USAGE_RECORDED, body).await {
                    warn!("Failed to publish usage_recorded for {}: {e}", row.job_id);
                }
            }
            Err(e) => warn!("Failed to encode usage_recorded for {}: {e}", row.job_id),
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use modelops_core::event::bus::MemoryEventBus;
    use modelops_core::model::{GpuPool, IsolationLevel, JobStatus, PoolRequest};
    use modelops_core::state::backend::memory::MemoryBackend;
    use std::time::Duration;

    struct Fixture {
        stores: StateStores,
        executor: Executor,
    }

    fn fixture(config: WorkerConfig) -> Fixture {
        let stores = StateStores::new(Arc::new(MemoryBackend::new()));
        let bus = Arc::new(MemoryEventBus::new());
        let executor = Executor::new(stores.clone(), bus, config).unwrap();
        Fixture { stores, executor }
    }

    async fn dispatched_job(stores: &StateStores, target_url: &str) -> (GpuJob, Uuid) {
        let job = GpuJob::new_queued(
            Uuid::new_v4(),
            Uuid::new_v4(),
            PoolRequest::T4,
            IsolationLevel::Shared,
            0,
            target_url.to_owned(),
            serde_json::json!({"prompt": "hi"}),
        );
        stores.jobs.create(&job).await.unwrap();
        let token = Uuid::new_v4();
        assert!(stores
            .jobs
            .try_dispatch(job.job_id, GpuPool::T4, token, Utc::now())
            .await
            .unwrap());
        (job, token)
    }

    #[tokio::test]
    async fn simulate_run_succeeds_and_meters() {
        let fixture = fixture(
            WorkerConfig::default()
                .with_simulate_duration(Duration::from_millis(10)),
        );
        let (job, token) = dispatched_job(&fixture.stores, "http://x/run").await;

        let outcome = fixture.executor.run(job.job_id, token).await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::Succeeded);

        let row = fixture.stores.jobs.expect(job.job_id).await.unwrap();
        assert_eq!(row.status, JobStatus::Succeeded);
        assert!(row.response_json.is_some());
        assert!(row.finished_at.unwrap() >= row.started_at.unwrap());

        let ledger = fixture.stores.usage.list().await.unwrap();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].meter, "gpu_seconds");
        assert_eq!(ledger[0].subject_id, job.job_id.to_string());
        assert_eq!(ledger[0].labels["pool"], "t4");
    }

    #[tokio::test]
    async fn stale_token_exits_silently() {
        let fixture = fixture(WorkerConfig::default());
        let (job, _token) = dispatched_job(&fixture.stores, "http://x/run").await;

        let outcome = fixture
            .executor
            .run(job.job_id, Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(outcome, ExecutionOutcome::Stale);

        let row = fixture.stores.jobs.expect(job.job_id).await.unwrap();
        assert_eq!(row.status, JobStatus::Dispatched);
        assert!(fixture.stores.usage.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn http_failure_lands_in_the_error_column() {
        let fixture = fixture(
            WorkerConfig::default().with_executor(ExecutorKind::Http),
        );
        // an unparsable target means the POST can never be attempted
        let (job, token) = dispatched_job(&fixture.stores, "not a url").await;

        let outcome = fixture.executor.run(job.job_id, token).await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::Failed);

        let row = fixture.stores.jobs.expect(job.job_id).await.unwrap();
        assert_eq!(row.status, JobStatus::Failed);
        assert!(row.error.is_some());
        // a failed job is still metered
        assert_eq!(fixture.stores.usage.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn a_terminal_row_cannot_be_rerun() {
        let fixture = fixture(
            WorkerConfig::default()
                .with_simulate_duration(Duration::from_millis(1)),
        );
        let (job, token) = dispatched_job(&fixture.stores, "http://x/run").await;

        fixture.executor.run(job.job_id, token).await.unwrap();
        let outcome = fixture.executor.run(job.job_id, token).await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::Stale);
        assert_eq!(fixture.stores.usage.list().await.unwrap().len(), 1);
    }
}
