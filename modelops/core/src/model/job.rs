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

//! The GPU job row and its state machine

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a GPU job.
///
/// Status only ever advances along
/// `QUEUED -> DISPATCHED -> RUNNING -> {SUCCEEDED, FAILED}` plus the two
/// recovery edges: `DISPATCHED -> QUEUED` (orphan revert, token cleared)
/// and `DISPATCHED -> FAILED` (dispatch gave up). There are no other
/// back-edges and terminal states are immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Dispatched,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(self, JobStatus::Dispatched | JobStatus::Running)
    }

    /// Allowed edges of the job state machine.
    pub fn can_advance_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Dispatched)
                | (JobStatus::Dispatched, JobStatus::Running)
                | (JobStatus::Dispatched, JobStatus::Queued)
                | (JobStatus::Dispatched, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Succeeded)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Dispatched => "DISPATCHED",
            JobStatus::Running => "RUNNING",
            JobStatus::Succeeded => "SUCCEEDED",
            JobStatus::Failed => "FAILED",
        };
        write!(f, "{s}")
    }
}

/// A concrete GPU capacity group. `auto` never appears here: once a job
/// leaves `QUEUED` it has been pinned to one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuPool {
    T4,
    Mig,
}

impl fmt::Display for GpuPool {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            GpuPool::T4 => write!(f, "t4"),
            GpuPool::Mig => write!(f, "mig"),
        }
    }
}

/// What the client asked for at submission time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolRequest {
    T4,
    Mig,
    Auto,
}

impl fmt::Display for PoolRequest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PoolRequest::T4 => write!(f, "t4"),
            PoolRequest::Mig => write!(f, "mig"),
            PoolRequest::Auto => write!(f, "auto"),
        }
    }
}

/// `shared` coexists with other shared jobs on a time-sliced T4;
/// `exclusive` requires no concurrent shared jobs while in flight.
/// `isolated` is accepted on input as an alias for `exclusive`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationLevel {
    Shared,
    #[serde(alias = "isolated")]
    Exclusive,
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            IsolationLevel::Shared => write!(f, "shared"),
            IsolationLevel::Exclusive => write!(f, "exclusive"),
        }
    }
}

/// A single asynchronous GPU job row. This is the central entity of the
/// control plane; every transition is a conditional update in the store
/// guarded by the current `status` and, once dispatched, the
/// `dispatch_token`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuJob {
    pub job_id: Uuid,

    // Tenancy, immutable after creation
    pub tenant_id: Uuid,
    pub project_id: Uuid,

    // Request
    pub gpu_pool_requested: PoolRequest,
    pub isolation_level: IsolationLevel,
    pub priority: i32,
    pub target_url: String,
    pub request_json: serde_json::Value,

    // Scheduling annotations
    pub gpu_pool_assigned: Option<GpuPool>,
    pub dispatch_token: Option<Uuid>,
    pub dispatch_attempts: u32,
    pub dispatched_at: Option<DateTime<Utc>>,

    // Execution
    pub status: JobStatus,
    pub response_json: Option<serde_json::Value>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,

    pub requested_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GpuJob {
    /// A fresh `QUEUED` row with a server-generated id.
    pub fn new_queued(
        tenant_id: Uuid,
        project_id: Uuid,
        gpu_pool_requested: PoolRequest,
        isolation_level: IsolationLevel,
        priority: i32,
        target_url: String,
        request_json: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            job_id: Uuid::new_v4(),
            tenant_id,
            project_id,
            gpu_pool_requested,
            isolation_level,
            priority,
            target_url,
            request_json,
            gpu_pool_assigned: None,
            dispatch_token: None,
            dispatch_attempts: 0,
            dispatched_at: None,
            status: JobStatus::Queued,
            response_json: None,
            error: None,
            started_at: None,
            finished_at: None,
            requested_at: now,
            updated_at: now,
        }
    }
}
