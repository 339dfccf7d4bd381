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

//! Typed stores over the state backend
//!
//! Every job state transition in this module is a single
//! `compare_and_swap` on the serialized row, guarded by the fields the
//! transition requires (current `status`, and out of
//! `DISPATCHED`/`RUNNING` also the `dispatch_token`). A `false` return
//! means zero rows were affected: another writer won and the caller
//! skips.

pub mod backend;
pub mod migrations;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::error::{PlaneError, Result};
use crate::idempotency::IdempotencyStore;
use crate::model::{
    EndpointIntent, GpuJob, GpuPool, JobStatus, TenantGpuPolicy, UsageRecord,
};
use crate::state::backend::{Keyspace, StateBackend};

pub fn encode_row<T: Serialize>(row: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(row)?)
}

pub fn decode_row<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(bytes)?)
}

/// All typed stores over one backend.
#[derive(Clone)]
pub struct StateStores {
    pub jobs: JobStore,
    pub policies: PolicyStore,
    pub endpoints: EndpointStore,
    pub usage: UsageStore,
    pub idempotency: IdempotencyStore,
}

impl StateStores {
    pub fn new(backend: Arc<dyn StateBackend>) -> Self {
        Self {
            jobs: JobStore::new(backend.clone()),
            policies: PolicyStore::new(backend.clone()),
            endpoints: EndpointStore::new(backend.clone()),
            usage: UsageStore::new(backend.clone()),
            idempotency: IdempotencyStore::new(backend),
        }
    }

    /// Prepare the backend and apply pending migrations. Run once at
    /// boot by every binary before serving.
    pub async fn init(backend: &dyn StateBackend) -> Result<()> {
        backend.init().await?;
        migrations::run(backend).await
    }
}

#[derive(Clone)]
pub struct JobStore {
    backend: Arc<dyn StateBackend>,
}

impl JobStore {
    pub fn new(backend: Arc<dyn StateBackend>) -> Self {
        Self { backend }
    }

    pub async fn create(&self, job: &GpuJob) -> Result<()> {
        let inserted = self
            .backend
            .compare_and_swap(
                Keyspace::GpuJobs,
                &job.job_id.to_string(),
                None,
                Some(encode_row(job)?),
            )
            .await?;
        if !inserted {
            return Err(PlaneError::Internal(format!(
                "job id collision for {}",
                job.job_id
            )));
        }
        Ok(())
    }

    pub async fn get(&self, job_id: Uuid) -> Result<Option<GpuJob>> {
        match self
            .backend
            .get(Keyspace::GpuJobs, &job_id.to_string())
            .await?
        {
            Some(bytes) => Ok(Some(decode_row(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn expect(&self, job_id: Uuid) -> Result<GpuJob> {
        self.get(job_id)
            .await?
            .ok_or_else(|| PlaneError::NotFound(format!("gpu job {job_id}")))
    }

    pub async fn list(&self) -> Result<Vec<GpuJob>> {
        let rows = self.backend.scan(Keyspace::GpuJobs).await?;
        rows.iter().map(|(_, bytes)| decode_row(bytes)).collect()
    }

    /// All `QUEUED` jobs, unordered; the scheduler imposes the dispatch
    /// order after joining tenant policies.
    pub async fn queued(&self) -> Result<Vec<GpuJob>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|job| job.status == JobStatus::Queued)
            .collect())
    }

    pub async fn count_queued_for_tenant(&self, tenant_id: Uuid) -> Result<usize> {
        Ok(self
            .list()
            .await?
            .iter()
            .filter(|job| job.tenant_id == tenant_id && job.status == JobStatus::Queued)
            .count())
    }

    /// All jobs occupying a slot (`DISPATCHED` or `RUNNING`).
    pub async fn in_flight(&self) -> Result<Vec<GpuJob>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|job| job.status.is_in_flight())
            .collect())
    }

    /// Single-shot conditional update. Reads the row, lets `mutate`
    /// produce the next revision (or decline by returning `None`), then
    /// swaps the bytes atomically. Never retries: a lost race is the
    /// caller's signal that another writer owns this transition.
    async fn update_if<F>(&self, job_id: Uuid, mutate: F) -> Result<bool>
    where
        F: FnOnce(&GpuJob) -> Option<GpuJob>,
    {
        let key = job_id.to_string();
        let old_bytes = match self.backend.get(Keyspace::GpuJobs, &key).await? {
            Some(bytes) => bytes,
            None => return Ok(false),
        };
        let current: GpuJob = decode_row(&old_bytes)?;
        let next = match mutate(&current) {
            Some(next) => next,
            None => return Ok(false),
        };
        self.backend
            .compare_and_swap(
                Keyspace::GpuJobs,
                &key,
                Some(old_bytes.as_slice()),
                Some(encode_row(&next)?),
            )
            .await
    }

    /// `QUEUED -> DISPATCHED`: pin the pool, mint the dispatch token,
    /// bump the attempt counter.
    pub async fn try_dispatch(
        &self,
        job_id: Uuid,
        pool: GpuPool,
        token: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.update_if(job_id, |job| {
            if job.status != JobStatus::Queued {
                return None;
            }
            let mut next = job.clone();
            next.status = JobStatus::Dispatched;
            next.gpu_pool_assigned = Some(pool);
            next.dispatch_token = Some(token);
            next.dispatched_at = Some(now);
            next.dispatch_attempts += 1;
            next.updated_at = now;
            Some(next)
        })
        .await
    }

    /// Orphan recovery: `DISPATCHED -> QUEUED`, clearing the token and
    /// the pool assignment so the next dispatch starts clean.
    pub async fn try_revert_dispatch(&self, job_id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        self.update_if(job_id, |job| {
            if job.status != JobStatus::Dispatched {
                return None;
            }
            let mut next = job.clone();
            next.status = JobStatus::Queued;
            next.gpu_pool_assigned = None;
            next.dispatch_token = None;
            next.dispatched_at = None;
            next.updated_at = now;
            Some(next)
        })
        .await
    }

    /// `DISPATCHED -> FAILED` with a well-known error string
    /// (dispatch gave up: timeout past the attempt cap, or launch
    /// failure past the redelivery cap).
    pub async fn try_fail_dispatched(
        &self,
        job_id: Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.update_if(job_id, |job| {
            if job.status != JobStatus::Dispatched {
                return None;
            }
            let mut next = job.clone();
            next.status = JobStatus::Failed;
            next.error = Some(error.to_owned());
            next.finished_at = Some(now);
            next.updated_at = now;
            Some(next)
        })
        .await
    }

    /// `DISPATCHED -> RUNNING`, guarded by the dispatch token.
    pub async fn try_start(
        &self,
        job_id: Uuid,
        token: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.update_if(job_id, |job| {
            if job.status != JobStatus::Dispatched || job.dispatch_token != Some(token) {
                return None;
            }
            let mut next = job.clone();
            next.status = JobStatus::Running;
            next.started_at = Some(now);
            next.updated_at = now;
            Some(next)
        })
        .await
    }

    /// `RUNNING -> SUCCEEDED`, guarded by the dispatch token.
    pub async fn try_succeed(
        &self,
        job_id: Uuid,
        token: Uuid,
        response_json: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.update_if(job_id, |job| {
            if job.status != JobStatus::Running || job.dispatch_token != Some(token) {
                return None;
            }
            let mut next = job.clone();
            next.status = JobStatus::Succeeded;
            next.response_json = Some(response_json);
            next.finished_at = Some(now);
            next.updated_at = now;
            Some(next)
        })
        .await
    }

    /// `RUNNING -> FAILED`, guarded by the dispatch token.
    pub async fn try_fail_running(
        &self,
        job_id: Uuid,
        token: Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.update_if(job_id, |job| {
            if job.status != JobStatus::Running || job.dispatch_token != Some(token) {
                return None;
            }
            let mut next = job.clone();
            next.status = JobStatus::Failed;
            next.error = Some(error.to_owned());
            next.finished_at = Some(now);
            next.updated_at = now;
            Some(next)
        })
        .await
    }
}

#[derive(Clone)]
pub struct PolicyStore {
    backend: Arc<dyn StateBackend>,
}

impl PolicyStore {
    pub fn new(backend: Arc<dyn StateBackend>) -> Self {
        Self { backend }
    }

    /// The tenant's policy row, or the implicit free-plan default.
    pub async fn get(&self, tenant_id: Uuid) -> Result<TenantGpuPolicy> {
        match self
            .backend
            .get(Keyspace::TenantGpuPolicies, &tenant_id.to_string())
            .await?
        {
            Some(bytes) => decode_row(&bytes),
            None => Ok(TenantGpuPolicy::default_for(tenant_id)),
        }
    }

    pub async fn put(&self, policy: &TenantGpuPolicy) -> Result<()> {
        self.backend
            .put(
                Keyspace::TenantGpuPolicies,
                policy.tenant_id.to_string(),
                encode_row(policy)?,
            )
            .await
    }
}

#[derive(Clone)]
pub struct EndpointStore {
    backend: Arc<dyn StateBackend>,
}

impl EndpointStore {
    pub fn new(backend: Arc<dyn StateBackend>) -> Self {
        Self { backend }
    }

    /// Insert a new intent, enforcing name uniqueness per
    /// (tenant, project). The check-then-insert window is accepted: a
    /// duplicate that slips through differs by endpoint_id and the
    /// deploy worker reconciles both to the same resource name, where
    /// the orchestration plane rejects the loser.
    pub async fn create(&self, intent: &EndpointIntent) -> Result<()> {
        if self
            .find_by_name(intent.tenant_id, intent.project_id, &intent.name)
            .await?
            .is_some()
        {
            return Err(PlaneError::Validation(format!(
                "endpoint name '{}' already in use",
                intent.name
            )));
        }
        let inserted = self
            .backend
            .compare_and_swap(
                Keyspace::Endpoints,
                &intent.endpoint_id.to_string(),
                None,
                Some(encode_row(intent)?),
            )
            .await?;
        if !inserted {
            return Err(PlaneError::Internal(format!(
                "endpoint id collision for {}",
                intent.endpoint_id
            )));
        }
        Ok(())
    }

    pub async fn get(&self, endpoint_id: Uuid) -> Result<Option<EndpointIntent>> {
        match self
            .backend
            .get(Keyspace::Endpoints, &endpoint_id.to_string())
            .await?
        {
            Some(bytes) => Ok(Some(decode_row(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn expect(&self, endpoint_id: Uuid) -> Result<EndpointIntent> {
        self.get(endpoint_id)
            .await?
            .ok_or_else(|| PlaneError::NotFound(format!("endpoint {endpoint_id}")))
    }

    pub async fn find_by_name(
        &self,
        tenant_id: Uuid,
        project_id: Uuid,
        name: &str,
    ) -> Result<Option<EndpointIntent>> {
        let rows = self.backend.scan(Keyspace::Endpoints).await?;
        for (_, bytes) in rows {
            let intent: EndpointIntent = decode_row(&bytes)?;
            if intent.tenant_id == tenant_id
                && intent.project_id == project_id
                && intent.name == name
            {
                return Ok(Some(intent));
            }
        }
        Ok(None)
    }

    /// Read-modify-write with a bounded CAS retry loop. `mutate` returns
    /// `false` to abort without writing.
    pub async fn modify<F>(&self, endpoint_id: Uuid, mut mutate: F) -> Result<bool>
    where
        F: FnMut(&mut EndpointIntent) -> bool,
    {
        let key = endpoint_id.to_string();
        for _ in 0..8 {
            let old_bytes = match self.backend.get(Keyspace::Endpoints, &key).await? {
                Some(bytes) => bytes,
                None => return Ok(false),
            };
            let mut intent: EndpointIntent = decode_row(&old_bytes)?;
            if !mutate(&mut intent) {
                return Ok(false);
            }
            intent.updated_at = Utc::now();
            let swapped = self
                .backend
                .compare_and_swap(
                    Keyspace::Endpoints,
                    &key,
                    Some(old_bytes.as_slice()),
                    Some(encode_row(&intent)?),
                )
                .await?;
            if swapped {
                return Ok(true);
            }
        }
        Err(PlaneError::TransientStore(format!(
            "endpoint {endpoint_id} contended beyond retry budget"
        )))
    }

    pub async fn delete(&self, endpoint_id: Uuid) -> Result<()> {
        self.backend
            .delete(Keyspace::Endpoints, &endpoint_id.to_string())
            .await
    }
}

#[derive(Clone)]
pub struct UsageStore {
    backend: Arc<dyn StateBackend>,
}

impl UsageStore {
    pub fn new(backend: Arc<dyn StateBackend>) -> Self {
        Self { backend }
    }

    /// Append-only; keys sort by time so scans read in recording order.
    pub async fn append(&self, record: &UsageRecord) -> Result<()> {
        let key = format!(
            "{:020}/{}",
            record.recorded_at.timestamp_millis().max(0),
            record.record_id
        );
        self.backend
            .put(Keyspace::UsageLedger, key, encode_row(record)?)
            .await
    }

    pub async fn list(&self) -> Result<Vec<UsageRecord>> {
        let rows = self.backend.scan(Keyspace::UsageLedger).await?;
        rows.iter().map(|(_, bytes)| decode_row(bytes)).collect()
    }

    pub async fn list_for_tenant(&self, tenant_id: Uuid) -> Result<Vec<UsageRecord>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|record| record.tenant_id == tenant_id)
            .collect())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::{IsolationLevel, PoolRequest};
    use crate::state::backend::memory::MemoryBackend;

    fn test_job() -> GpuJob {
        GpuJob::new_queued(
            Uuid::new_v4(),
            Uuid::new_v4(),
            PoolRequest::T4,
            IsolationLevel::Shared,
            0,
            "http://inference.local/run".to_owned(),
            serde_json::json!({"prompt": "hi"}),
        )
    }

    fn stores() -> StateStores {
        StateStores::new(Arc::new(MemoryBackend::new()))
    }

    #[tokio::test]
    async fn dispatch_has_a_single_winner() {
        let stores = stores();
        let job = test_job();
        stores.jobs.create(&job).await.unwrap();

        let now = Utc::now();
        let mut handles = vec![];
        for _ in 0..16 {
            let jobs = stores.jobs.clone();
            let id = job.job_id;
            handles.push(tokio::spawn(async move {
                jobs.try_dispatch(id, GpuPool::T4, Uuid::new_v4(), now)
                    .await
                    .unwrap()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);

        let row = stores.jobs.expect(job.job_id).await.unwrap();
        assert_eq!(row.status, JobStatus::Dispatched);
        assert_eq!(row.dispatch_attempts, 1);
        assert!(row.dispatch_token.is_some());
        assert_eq!(row.gpu_pool_assigned, Some(GpuPool::T4));
    }

    #[tokio::test]
    async fn transitions_require_the_current_token() {
        let stores = stores();
        let job = test_job();
        stores.jobs.create(&job).await.unwrap();

        let token = Uuid::new_v4();
        let now = Utc::now();
        assert!(stores
            .jobs
            .try_dispatch(job.job_id, GpuPool::T4, token, now)
            .await
            .unwrap());

        // a stale token is a no-op
        assert!(!stores
            .jobs
            .try_start(job.job_id, Uuid::new_v4(), now)
            .await
            .unwrap());

        assert!(stores.jobs.try_start(job.job_id, token, now).await.unwrap());
        assert!(stores
            .jobs
            .try_succeed(job.job_id, token, serde_json::json!({"ok": true}), now)
            .await
            .unwrap());

        // terminal rows are immutable
        assert!(!stores
            .jobs
            .try_fail_running(job.job_id, token, "late", now)
            .await
            .unwrap());
        let row = stores.jobs.expect(job.job_id).await.unwrap();
        assert_eq!(row.status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn revert_clears_the_dispatch_annotations() {
        let stores = stores();
        let job = test_job();
        stores.jobs.create(&job).await.unwrap();

        let now = Utc::now();
        let token = Uuid::new_v4();
        assert!(stores
            .jobs
            .try_dispatch(job.job_id, GpuPool::T4, token, now)
            .await
            .unwrap());
        assert!(stores
            .jobs
            .try_revert_dispatch(job.job_id, now)
            .await
            .unwrap());

        let row = stores.jobs.expect(job.job_id).await.unwrap();
        assert_eq!(row.status, JobStatus::Queued);
        assert_eq!(row.dispatch_token, None);
        assert_eq!(row.gpu_pool_assigned, None);
        // the attempt remains counted
        assert_eq!(row.dispatch_attempts, 1);
    }

    #[tokio::test]
    async fn missing_policy_row_defaults_to_free_plan() {
        let stores = stores();
        let tenant = Uuid::new_v4();
        let policy = stores.policies.get(tenant).await.unwrap();
        assert_eq!(policy.plan, "free");
        assert_eq!(policy.mig_max_concurrency, 0);
    }

    #[tokio::test]
    async fn endpoint_names_are_unique_per_project() {
        let stores = stores();
        let tenant = Uuid::new_v4();
        let project = Uuid::new_v4();
        let intent = EndpointIntent::new_creating(
            tenant,
            project,
            "ranker".to_owned(),
            "sklearn".to_owned(),
        );
        stores.endpoints.create(&intent).await.unwrap();

        let duplicate = EndpointIntent::new_creating(
            tenant,
            project,
            "ranker".to_owned(),
            "sklearn".to_owned(),
        );
        let err = stores.endpoints.create(&duplicate).await.unwrap_err();
        assert!(matches!(err, PlaneError::Validation(_)));

        // same name under a different project is fine
        let other = EndpointIntent::new_creating(
            tenant,
            Uuid::new_v4(),
            "ranker".to_owned(),
            "sklearn".to_owned(),
        );
        stores.endpoints.create(&other).await.unwrap();
    }
}
