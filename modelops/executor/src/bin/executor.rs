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

//! One-shot executor for ephemeral compute units
//!
//! Runs exactly one job, identified by `JOB_ID` and `DISPATCH_TOKEN`
//! from the environment. Exits 0 on any clean terminal transition
//! (FAILED included) and on stale-token no-ops; exits nonzero only for
//! infrastructure faults the unit's controller should retry.

use std::process::exit;
use std::sync::Arc;

use log::{error, info};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use modelops_core::config::StoreUrl;
use modelops_core::event::bus::MemoryEventBus;
use modelops_core::state::StateStores;

use modelops_executor::config::WorkerConfig;
use modelops_executor::executor::{ExecutionOutcome, Executor};

fn env_uuid(name: &str) -> Uuid {
    match std::env::var(name).ok().and_then(|raw| raw.parse().ok()) {
        Some(value) => value,
        None => {
            error!("{name} must be set to a UUID");
            exit(2);
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let job_id = env_uuid("JOB_ID");
    let token = env_uuid("DISPATCH_TOKEN");
    let config = WorkerConfig::from_env();

    let outcome = run(job_id, token, config).await;
    match outcome {
        Ok(outcome) => {
            info!("Executor finished for job {job_id}: {outcome:?}");
            exit(0);
        }
        Err(e) => {
            error!("Executor infrastructure error for job {job_id}: {e}");
            exit(1);
        }
    }
}

async fn run(
    job_id: Uuid,
    token: Uuid,
    config: WorkerConfig,
) -> modelops_core::error::Result<ExecutionOutcome> {
    let backend = StoreUrl::from_env()?.open()?;
    StateStores::init(backend.as_ref()).await?;
    let stores = StateStores::new(backend);

    // a unit is a leaf: its usage event has no in-process consumers
    let bus = Arc::new(MemoryEventBus::new());
    let executor = Executor::new(stores, bus, config)?;
    executor.run(job_id, token).await
}
