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

//! Orchestration plane clients
//!
//! The control plane only ever talks to the orchestration plane through
//! these two seams: [`UnitLauncher`] starts ephemeral compute units for
//! dispatched jobs, [`ServingClient`] owns serving resources for
//! endpoint intents. The simulated implementations run everything
//! in-process; the Kubernetes implementations live behind the
//! `kubernetes` feature.

#[cfg(feature = "kubernetes")]
pub mod kubernetes;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use log::info;
use uuid::Uuid;

use modelops_core::error::Result;
use modelops_core::model::{DeploymentMode, GpuPool, IsolationLevel};

use crate::executor::Executor;

/// An ephemeral compute unit to run one dispatched job.
#[derive(Debug, Clone)]
pub struct UnitSpec {
    pub job_id: Uuid,
    pub dispatch_token: Uuid,
    pub pool: GpuPool,
    pub isolation: IsolationLevel,
    /// GPU resource the unit requests
    pub gpu_resource_name: String,
    /// Auto-cleanup TTL once the unit finishes
    pub ttl: Duration,
}

#[async_trait]
pub trait UnitLauncher: Send + Sync {
    /// Submit the unit. Failures are retriable through bus redelivery.
    async fn launch(&self, unit: &UnitSpec) -> Result<()>;
}

/// Runs the executor on a local task instead of a real compute unit.
/// This is the ephemeral mode of the dev profile: dispatch semantics are
/// identical, only the placement differs.
pub struct SimulatedUnitLauncher {
    executor: Arc<Executor>,
}

impl SimulatedUnitLauncher {
    pub fn new(executor: Arc<Executor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl UnitLauncher for SimulatedUnitLauncher {
    async fn launch(&self, unit: &UnitSpec) -> Result<()> {
        let executor = self.executor.clone();
        let job_id = unit.job_id;
        let token = unit.dispatch_token;
        info!("Launching simulated unit for job {job_id}");
        tokio::task::spawn(async move {
            if let Err(e) = executor.run(job_id, token).await {
                log::error!("Simulated unit for job {job_id} failed: {e}");
            }
        });
        Ok(())
    }
}

/// The rendered desired state of one serving resource. Rendering the
/// same intent always yields the same spec, which is what makes
/// re-reconciles idempotent.
#[derive(Debug, Clone, PartialEq)]
pub struct ServingSpec {
    /// Stable resource name derived from the endpoint id
    pub name: String,
    pub runtime: String,
    pub artifact_uri: Option<String>,
    pub deployment_mode: DeploymentMode,
    pub canary_traffic_percent: u32,
    pub min_replicas: u32,
    pub max_replicas: u32,
    pub model_format: Option<String>,
    pub protocol_version: Option<String>,
    pub image: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ServingState {
    pub ready: bool,
    pub url: Option<String>,
}

#[async_trait]
pub trait ServingClient: Send + Sync {
    async fn upsert(&self, spec: &ServingSpec) -> Result<()>;

    /// Current state of the named resource, `None` if it does not exist.
    async fn state(&self, name: &str) -> Result<Option<ServingState>>;

    async fn delete(&self, name: &str) -> Result<()>;
}

struct SimulatedServing {
    spec: ServingSpec,
    polls_until_ready: u32,
}

/// In-memory serving plane. Resources become ready after a configurable
/// number of state polls, so reconcile loops are exercised for real.
pub struct SimulatedServingClient {
    resources: DashMap<String, SimulatedServing>,
    readiness_polls: u32,
}

impl SimulatedServingClient {
    pub fn new() -> Self {
        Self::with_readiness_polls(1)
    }

    pub fn with_readiness_polls(readiness_polls: u32) -> Self {
        Self {
            resources: DashMap::new(),
            readiness_polls,
        }
    }

    pub fn upserted(&self, name: &str) -> bool {
        self.resources.contains_key(name)
    }

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }
}

impl Default for SimulatedServingClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ServingClient for SimulatedServingClient {
    async fn upsert(&self, spec: &ServingSpec) -> Result<()> {
        let polls = self.readiness_polls;
        self.resources
            .entry(spec.name.clone())
            .and_modify(|existing| {
                // re-applying the same spec keeps readiness progress
                if existing.spec != *spec {
                    existing.spec = spec.clone();
                    existing.polls_until_ready = polls;
                }
            })
            .or_insert_with(|| SimulatedServing {
                spec: spec.clone(),
                polls_until_ready: polls,
            });
        Ok(())
    }

    async fn state(&self, name: &str) -> Result<Option<ServingState>> {
        let mut entry = match self.resources.get_mut(name) {
            Some(entry) => entry,
            None => return Ok(None),
        };
        if entry.polls_until_ready > 0 {
            entry.polls_until_ready -= 1;
            return Ok(Some(ServingState {
                ready: false,
                url: None,
            }));
        }
        Ok(Some(ServingState {
            ready: true,
            url: Some(format!("http://{name}.serving.local")),
        }))
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.resources.remove(name);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn spec(name: &str) -> ServingSpec {
        ServingSpec {
            name: name.to_owned(),
            runtime: "sklearn".to_owned(),
            artifact_uri: Some("s3://models/a/1".to_owned()),
            deployment_mode: DeploymentMode::Serverless,
            canary_traffic_percent: 0,
            min_replicas: 0,
            max_replicas: 1,
            model_format: None,
            protocol_version: None,
            image: None,
        }
    }

    #[tokio::test]
    async fn simulated_serving_becomes_ready_after_polls() {
        let client = SimulatedServingClient::with_readiness_polls(2);
        client.upsert(&spec("ep-a")).await.unwrap();

        assert!(!client.state("ep-a").await.unwrap().unwrap().ready);
        assert!(!client.state("ep-a").await.unwrap().unwrap().ready);
        let state = client.state("ep-a").await.unwrap().unwrap();
        assert!(state.ready);
        assert_eq!(state.url.as_deref(), Some("http://ep-a.serving.local"));
    }

    #[tokio::test]
    async fn reapplying_the_same_spec_keeps_progress() {
        let client = SimulatedServingClient::with_readiness_polls(1);
        client.upsert(&spec("ep-b")).await.unwrap();
        let _ = client.state("ep-b").await.unwrap();

        client.upsert(&spec("ep-b")).await.unwrap();
        assert!(client.state("ep-b").await.unwrap().unwrap().ready);

        // a changed spec resets readiness
        let mut changed = spec("ep-b");
        changed.max_replicas = 4;
        client.upsert(&changed).await.unwrap();
        assert!(!client.state("ep-b").await.unwrap().unwrap().ready);
    }
}
