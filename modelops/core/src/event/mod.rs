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

//! Event subjects and payload records
//!
//! All payloads carry tenancy, the id of the subject entity and a
//! publisher timestamp in epoch milliseconds. The bus is at-least-once;
//! consumers deduplicate with the dispatch token at the store, never by
//! message identity.

pub mod bus;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::model::{GpuPool, IsolationLevel};

pub const SUBJECT_ENQUEUED: &str = "enqueued";
pub const SUBJECT_DEPLOY_REQUESTED: &str = "deploy_requested";
pub const SUBJECT_DELETE_REQUESTED: &str = "delete_requested";
pub const SUBJECT_USAGE_RECORDED: &str = "usage_recorded";

/// The dispatch subject for a pool/isolation pair. MIG is
/// hard-partitioned, so it carries no isolation segment.
pub fn dispatch_subject(pool: GpuPool, isolation: IsolationLevel) -> String {
    match pool {
        GpuPool::T4 => format!("dispatched.t4.{isolation}"),
        GpuPool::Mig => "dispatched.mig".to_owned(),
    }
}

/// Every subject a dispatch consumer must subscribe to.
pub fn dispatch_subjects() -> Vec<String> {
    vec![
        dispatch_subject(GpuPool::T4, IsolationLevel::Shared),
        dispatch_subject(GpuPool::T4, IsolationLevel::Exclusive),
        dispatch_subject(GpuPool::Mig, IsolationLevel::Shared),
    ]
}

pub fn encode_event<T: Serialize>(event: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(event)?)
}

pub fn decode_event<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(body)?)
}

/// Emitted at submission. Informational: the scheduler polls the store,
/// so losing this event does not affect correctness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEnqueued {
    pub job_id: Uuid,
    pub tenant_id: Uuid,
    pub project_id: Uuid,
    pub published_at: i64,
}

/// Hands a `DISPATCHED` job to an executor. The token gates every
/// further transition; a consumer holding a stale token drops the
/// message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDispatched {
    pub job_id: Uuid,
    pub dispatch_token: Uuid,
    pub tenant_id: Uuid,
    pub project_id: Uuid,
    pub pool: GpuPool,
    pub isolation: IsolationLevel,
    pub published_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployRequested {
    pub endpoint_id: Uuid,
    pub tenant_id: Uuid,
    pub project_id: Uuid,
    pub published_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteRequested {
    pub endpoint_id: Uuid,
    pub tenant_id: Uuid,
    pub project_id: Uuid,
    pub published_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecorded {
    pub record_id: Uuid,
    pub job_id: Uuid,
    pub tenant_id: Uuid,
    pub project_id: Uuid,
    pub meter: String,
    pub quantity: f64,
    pub published_at: i64,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn dispatch_subjects_match_the_wire_names() {
        assert_eq!(
            dispatch_subject(GpuPool::T4, IsolationLevel::Shared),
            "dispatched.t4.shared"
        );
        assert_eq!(
            dispatch_subject(GpuPool::T4, IsolationLevel::Exclusive),
            "dispatched.t4.exclusive"
        );
        assert_eq!(
            dispatch_subject(GpuPool::Mig, IsolationLevel::Exclusive),
            "dispatched.mig"
        );
    }
}
