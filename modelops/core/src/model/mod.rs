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

//! Domain model for the GPU control plane

pub mod endpoint;
pub mod job;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use endpoint::{
    AutoscalingSpec, DeploymentMode, EndpointIntent, EndpointStatus, RuntimeConfig,
    TrafficSpec,
};
pub use job::{GpuJob, GpuPool, IsolationLevel, JobStatus, PoolRequest};

/// Per-tenant admission and fairness policy. A missing row means the
/// implicit default (free plan).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantGpuPolicy {
    pub tenant_id: Uuid,
    pub plan: String,
    pub t4_max_concurrency: u32,
    pub mig_max_concurrency: u32,
    pub max_queued_jobs: u32,
    pub priority_boost: i32,
}

impl TenantGpuPolicy {
    /// The implicit free-plan policy applied when no row exists.
    pub fn default_for(tenant_id: Uuid) -> Self {
        Self {
            tenant_id,
            plan: "free".to_owned(),
            t4_max_concurrency: 1,
            mig_max_concurrency: 0,
            max_queued_jobs: 10,
            priority_boost: 0,
        }
    }

    pub fn max_concurrency_for(&self, pool: GpuPool) -> u32 {
        match pool {
            GpuPool::T4 => self.t4_max_concurrency,
            GpuPool::Mig => self.mig_max_concurrency,
        }
    }
}

/// Append-only metering ledger row, written by the executor once per
/// finished job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub record_id: Uuid,
    pub tenant_id: Uuid,
    pub project_id: Uuid,
    pub subject_type: String,
    pub subject_id: String,
    pub meter: String,
    pub quantity: f64,
    pub labels: BTreeMap<String, String>,
    pub recorded_at: DateTime<Utc>,
}

impl UsageRecord {
    /// The `gpu_seconds` row for a finished GPU job.
    pub fn gpu_seconds(
        job: &GpuJob,
        pool: GpuPool,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert("pool".to_owned(), pool.to_string());
        labels.insert("isolation".to_owned(), job.isolation_level.to_string());
        let quantity =
            (finished_at - started_at).num_milliseconds().max(0) as f64 / 1000.0;
        Self {
            record_id: Uuid::new_v4(),
            tenant_id: job.tenant_id,
            project_id: job.project_id,
            subject_type: "gpu_job".to_owned(),
            subject_id: job.job_id.to_string(),
            meter: "gpu_seconds".to_owned(),
            quantity,
            labels,
            recorded_at: finished_at,
        }
    }
}
