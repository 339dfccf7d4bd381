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

//! Scheduler process: control loop + HTTP API

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Utc;
use clap::Parser;
use log::{info, warn};
use tracing_subscriber::EnvFilter;

use modelops_core::config::{BusUrl, StoreUrl};
use modelops_core::error::Result;
use modelops_core::event::bus::{EventBus, MemoryEventBus};
use modelops_core::state::StateStores;

use modelops_scheduler::api::{self, ApiContext};
use modelops_scheduler::config::SchedulerConfig;
use modelops_scheduler::metrics::default_metrics_collector;
use modelops_scheduler::scheduler::GpuScheduler;

#[derive(Debug, Parser)]
#[clap(name = "modelops-scheduler", about = "ModelOps GPU scheduler and API")]
struct Opt {
    /// Address the HTTP API binds to
    #[clap(long, default_value = "0.0.0.0:8080")]
    bind: SocketAddr,

    /// State store url (`memory:` or `sled:<path>`); overrides
    /// STATE_STORE_URL
    #[clap(long)]
    store_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let opt = Opt::parse();
    let config = SchedulerConfig::from_env();

    let store_url = match opt.store_url {
        Some(raw) => StoreUrl::parse(&raw)?,
        None => StoreUrl::from_env()?,
    };
    let backend = store_url.open()?;
    StateStores::init(backend.as_ref()).await?;
    let stores = StateStores::new(backend);

    // only the in-process bus ships in-tree; fail loud on anything else
    let BusUrl::Memory = BusUrl::from_env()?;
    let bus: Arc<dyn EventBus> = Arc::new(MemoryEventBus::new());

    let metrics = default_metrics_collector()?;

    let scheduler = Arc::new(GpuScheduler::new(
        stores.clone(),
        bus.clone(),
        config.clone(),
        metrics.clone(),
    ));
    scheduler.start();

    spawn_idempotency_sweeper(stores.clone(), config.clone());

    let ctx = ApiContext {
        stores,
        bus,
        config,
        metrics,
    };
    info!("Serving API on {}", opt.bind);
    warp::serve(api::routes(ctx)).run(opt.bind).await;

    Ok(())
}

fn spawn_idempotency_sweeper(stores: StateStores, config: SchedulerConfig) {
    let interval = config.idempotency_sweep_interval;
    tokio::task::spawn(async move {
        loop {
            match stores.idempotency.sweep_expired(Utc::now()).await {
                Ok(0) => {}
                Ok(removed) => info!("Swept {removed} expired idempotency records"),
                Err(e) => warn!("Idempotency sweep failed: {e}"),
            }
            tokio::time::sleep(interval).await;
        }
    });
}
