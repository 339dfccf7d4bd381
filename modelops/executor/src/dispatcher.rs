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

//! Dispatch event consumer
//!
//! Joins the dispatcher consumer group over the dispatch subjects.
//! Deduplication is by dispatch token at the store: a delivery whose
//! token no longer matches the row is acknowledged and dropped, which
//! makes duplicates and redeliveries harmless.

use std::sync::Arc;

use chrono::Utc;
use log::{debug, info, warn};
use uuid::Uuid;

use modelops_core::error::Result;
use modelops_core::event::bus::{EventBus, Subscription};
use modelops_core::event::{decode_event, dispatch_subjects, JobDispatched};
use modelops_core::state::StateStores;

use crate::config::{ExecutionMode, WorkerConfig};
use crate::executor::Executor;
use crate::orchestrator::{UnitLauncher, UnitSpec};

pub const ERROR_DISPATCH_LAUNCH_FAILED: &str = "dispatch_launch_failed";

pub const DISPATCHER_GROUP: &str = "gpu-dispatchers";

pub struct DispatchWorker {
    stores: StateStores,
    config: WorkerConfig,
    executor: Arc<Executor>,
    launcher: Arc<dyn UnitLauncher>,
    subscription: Box<dyn Subscription>,
}

impl DispatchWorker {
    pub async fn new(
        stores: StateStores,
        bus: Arc<dyn EventBus>,
        config: WorkerConfig,
        executor: Arc<Executor>,
        launcher: Arc<dyn UnitLauncher>,
    ) -> Result<Self> {
        let subjects = dispatch_subjects();
        let subject_refs: Vec<&str> = subjects.iter().map(String::as_str).collect();
        let subscription = bus.subscribe(&subject_refs, DISPATCHER_GROUP).await?;
        Ok(Self {
            stores,
            config,
            executor,
            launcher,
            subscription,
        })
    }

    pub async fn run(mut self) -> Result<()> {
        info!(
            "Dispatch worker consuming {:?} in {:?} mode",
            dispatch_subjects(),
            self.config.execution_mode
        );
        loop {
            self.process_one().await?;
        }
    }

    /// Handle the next dispatch delivery. Returns the job id the
    /// delivery was accepted for, or `None` when it was dropped, nacked
    /// or failed.
    pub async fn process_one(&mut self) -> Result<Option<Uuid>> {
        let delivery = self.subscription.next().await;
        let deliveries = delivery.deliveries;

        let event: JobDispatched = match decode_event(&delivery.body) {
            Ok(event) => event,
            Err(e) => {
                warn!("Dropping undecodable dispatch message: {e}");
                self.subscription.ack(delivery).await?;
                return Ok(None);
            }
        };

        let job = match self.stores.jobs.get(event.job_id).await? {
            Some(job) => job,
            None => {
                warn!("Dispatch event for unknown job {}, dropping", event.job_id);
                self.subscription.ack(delivery).await?;
                return Ok(None);
            }
        };
        if job.dispatch_token != Some(event.dispatch_token) {
            debug!(
                "Stale dispatch event for job {} (attempt superseded), dropping",
                event.job_id
            );
            self.subscription.ack(delivery).await?;
            return Ok(None);
        }

        match self.config.execution_mode {
            ExecutionMode::Direct => {
                match self.executor.run(event.job_id, event.dispatch_token).await {
                    Ok(_) => {
                        self.subscription.ack(delivery).await?;
                        Ok(Some(event.job_id))
                    }
                    Err(e) => {
                        // infrastructure fault; the row is untouched or
                        // recoverable, so retry through redelivery and
                        // let orphan recovery reclaim past the cap
                        warn!(
                            "Executor infrastructure error for job {} (delivery {deliveries}): {e}",
                            event.job_id
                        );
                        if deliveries >= self.config.redelivery_cap {
                            self.subscription.ack(delivery).await?;
                        } else {
                            self.subscription.nack(delivery).await?;
                        }
                        Ok(None)
                    }
                }
            }
            ExecutionMode::Ephemeral => {
                let unit = UnitSpec {
                    job_id: event.job_id,
                    dispatch_token: event.dispatch_token,
                    pool: event.pool,
                    isolation: event.isolation,
                    gpu_resource_name: self.config.gpu_resource_name.clone(),
                    ttl: self.config.unit_ttl,
                };
                match self.launcher.launch(&unit).await {
                    Ok(()) => {
                        self.subscription.ack(delivery).await?;
                        Ok(Some(event.job_id))
                    }
                    Err(e) => {
                        warn!(
                            "Unit launch failed for job {} (delivery {deliveries}): {e}",
                            event.job_id
                        );
                        if deliveries >= self.config.redelivery_cap {
                            if self
                                .stores
                                .jobs
                                .try_fail_dispatched(
                                    event.job_id,
                                    ERROR_DISPATCH_LAUNCH_FAILED,
                                    Utc::now(),
                                )
                                .await?
                            {
                                warn!(
                                    "Job {} failed after {deliveries} launch attempts",
                                    event.job_id
                                );
                            }
                            self.subscription.ack(delivery).await?;
                        } else {
                            self.subscription.nack(delivery).await?;
                        }
                        Ok(None)
                    }
                }
            }
        }
    }
}
