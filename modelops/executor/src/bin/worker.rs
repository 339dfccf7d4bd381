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

//! Worker daemon: dispatch consumer + deploy worker

use std::sync::Arc;

use clap::Parser;
use log::info;
use tracing_subscriber::EnvFilter;

use modelops_core::config::{BusUrl, StoreUrl};
use modelops_core::error::Result;
use modelops_core::event::bus::{EventBus, MemoryEventBus};
use modelops_core::state::StateStores;

use modelops_executor::config::WorkerConfig;
use modelops_executor::deploy::DeployWorker;
use modelops_executor::dispatcher::DispatchWorker;
use modelops_executor::executor::Executor;
#[cfg(feature = "kubernetes")]
use modelops_executor::orchestrator::kubernetes::{
    KubernetesServingClient, KubernetesUnitLauncher,
};
#[cfg(not(feature = "kubernetes"))]
use modelops_executor::orchestrator::{SimulatedServingClient, SimulatedUnitLauncher};
use modelops_executor::orchestrator::{ServingClient, UnitLauncher};

#[derive(Debug, Parser)]
#[clap(name = "modelops-worker", about = "ModelOps dispatch and deploy worker")]
struct Opt {
    /// State store url (`memory:` or `sled:<path>`); overrides
    /// STATE_STORE_URL
    #[clap(long)]
    store_url: Option<String>,

    /// Kubernetes namespace for launched units and serving resources
    #[clap(long, default_value = "modelops")]
    namespace: String,

    /// Image the ephemeral executor units run
    #[clap(long, default_value = "modelops/executor:latest")]
    executor_image: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let opt = Opt::parse();
    let config = WorkerConfig::from_env();

    let store_url = match &opt.store_url {
        Some(raw) => StoreUrl::parse(raw)?,
        None => StoreUrl::from_env()?,
    };
    let backend = store_url.open()?;
    StateStores::init(backend.as_ref()).await?;
    let stores = StateStores::new(backend);

    let BusUrl::Memory = BusUrl::from_env()?;
    let bus: Arc<dyn EventBus> = Arc::new(MemoryEventBus::new());

    let executor = Arc::new(Executor::new(stores.clone(), bus.clone(), config.clone())?);

    let launcher: Arc<dyn UnitLauncher> = unit_launcher(&opt, executor.clone()).await?;
    let serving: Arc<dyn ServingClient> = serving_client(&opt).await?;

    let dispatch_worker = DispatchWorker::new(
        stores.clone(),
        bus.clone(),
        config.clone(),
        executor,
        launcher,
    )
    .await?;
    let deploy_worker = DeployWorker::new(stores, bus, config, serving).await?;

    info!("Worker daemon started");
    tokio::try_join!(dispatch_worker.run(), deploy_worker.run())?;
    Ok(())
}

#[cfg(feature = "kubernetes")]
async fn unit_launcher(
    opt: &Opt,
    _executor: Arc<Executor>,
) -> Result<Arc<dyn UnitLauncher>> {
    Ok(Arc::new(
        KubernetesUnitLauncher::try_new(opt.namespace.clone(), opt.executor_image.clone())
            .await?,
    ))
}

#[cfg(not(feature = "kubernetes"))]
async fn unit_launcher(
    _opt: &Opt,
    executor: Arc<Executor>,
) -> Result<Arc<dyn UnitLauncher>> {
    Ok(Arc::new(SimulatedUnitLauncher::new(executor)))
}

#[cfg(feature = "kubernetes")]
async fn serving_client(opt: &Opt) -> Result<Arc<dyn ServingClient>> {
    Ok(Arc::new(
        KubernetesServingClient::try_new(opt.namespace.clone()).await?,
    ))
}

#[cfg(not(feature = "kubernetes"))]
async fn serving_client(_opt: &Opt) -> Result<Arc<dyn ServingClient>> {
    Ok(Arc::new(SimulatedServingClient::new()))
}
