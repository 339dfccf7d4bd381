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

//! Deploy worker: reconciles endpoint intents into serving resources
//!
//! Validation failures and reconcile timeouts are not raised; they land
//! in the endpoint row as `FAILED` with an error detail, visible through
//! the API. Re-reconciles are idempotent because the rendered spec is a
//! pure function of the intent.

use std::sync::Arc;

use chrono::Utc;
use log::{debug, info, warn};
use uuid::Uuid;

use modelops_core::error::Result;
use modelops_core::event::bus::{EventBus, Subscription};
use modelops_core::event::{
    decode_event, DeleteRequested, DeployRequested, SUBJECT_DELETE_REQUESTED,
    SUBJECT_DEPLOY_REQUESTED,
};
use modelops_core::model::{DeploymentMode, EndpointIntent, EndpointStatus};
use modelops_core::state::StateStores;

use crate::config::{DeployMode, WorkerConfig};
use crate::orchestrator::{ServingClient, ServingSpec};

pub const DEPLOY_GROUP: &str = "deploy-workers";

/// Stable serving resource name for an endpoint. Deriving it from the
/// endpoint id (not the name) keeps renames and re-reconciles pointed at
/// the same resource.
pub fn serving_resource_name(endpoint_id: Uuid) -> String {
    format!("ep-{endpoint_id}")
}

/// Admission rules for a serving intent, checked before anything is
/// upserted.
pub fn validate_intent(intent: &EndpointIntent) -> std::result::Result<(), String> {
    let traffic = &intent.traffic;
    if traffic.canary_traffic_percent > 100 {
        return Err(format!(
            "canaryTrafficPercent {} is outside [0, 100]",
            traffic.canary_traffic_percent
        ));
    }
    if traffic.canary_traffic_percent > 0
        && traffic.deployment_mode != DeploymentMode::Serverless
    {
        return Err(
            "canary traffic requires the serverless deployment mode".to_owned()
        );
    }
    if intent.runtime_config.model_format.as_deref() == Some("triton")
        && intent.runtime_config.protocol_version.as_deref() != Some("v2")
    {
        return Err("modelFormat triton requires protocolVersion v2".to_owned());
    }
    Ok(())
}

/// Render the desired serving resource from the intent. Pure: the same
/// intent always yields the same spec.
pub fn render_spec(intent: &EndpointIntent) -> ServingSpec {
    ServingSpec {
        name: serving_resource_name(intent.endpoint_id),
        runtime: intent.runtime.clone(),
        artifact_uri: intent.artifact_uri.clone(),
        deployment_mode: intent.traffic.deployment_mode,
        canary_traffic_percent: intent.traffic.canary_traffic_percent,
        min_replicas: intent.autoscaling.min_replicas,
        max_replicas: intent.autoscaling.max_replicas,
        model_format: intent.runtime_config.model_format.clone(),
        protocol_version: intent.runtime_config.protocol_version.clone(),
        image: intent.runtime_config.image.clone(),
    }
}

pub struct DeployWorker {
    stores: StateStores,
    config: WorkerConfig,
    serving: Arc<dyn ServingClient>,
    subscription: Box<dyn Subscription>,
}

impl DeployWorker {
    pub async fn new(
        stores: StateStores,
        bus: Arc<dyn EventBus>,
        config: WorkerConfig,
        serving: Arc<dyn ServingClient>,
    ) -> Result<Self> {
        let subscription = bus
            .subscribe(
                &[SUBJECT_DEPLOY_REQUESTED, SUBJECT_DELETE_REQUESTED],
                DEPLOY_GROUP,
            )
            .await?;
        Ok(Self {
            stores,
            config,
            serving,
            subscription,
        })
    }

    pub async fn run(mut self) -> Result<()> {
        info!(
            "Deploy worker consuming deploy/delete requests in {:?} mode",
            self.config.deploy_mode
        );
        loop {
            self.process_one().await?;
        }
    }

    /// Handle the next deploy or delete request. Returns the endpoint id
    /// acted on, `None` when the delivery was dropped or retried.
    pub async fn process_one(&mut self) -> Result<Option<Uuid>> {
        let delivery = self.subscription.next().await;
        let deliveries = delivery.deliveries;

        let (endpoint_id, is_delete) = match delivery.subject.as_str() {
            SUBJECT_DEPLOY_REQUESTED => match decode_event::<DeployRequested>(
                &delivery.body,
            ) {
                Ok(event) => (event.endpoint_id, false),
                Err(e) => {
                    warn!("Dropping undecodable deploy request: {e}");
                    self.subscription.ack(delivery).await?;
                    return Ok(None);
                }
            },
            SUBJECT_DELETE_REQUESTED => match decode_event::<DeleteRequested>(
                &delivery.body,
            ) {
                Ok(event) => (event.endpoint_id, true),
                Err(e) => {
                    warn!("Dropping undecodable delete request: {e}");
                    self.subscription.ack(delivery).await?;
                    return Ok(None);
                }
            },
            other => {
                warn!("Dropping delivery for unexpected subject {other}");
                self.subscription.ack(delivery).await?;
                return Ok(None);
            }
        };

        let outcome = if is_delete {
            self.handle_delete(endpoint_id).await
        } else {
            self.handle_deploy(endpoint_id).await
        };

        match outcome {
            Ok(()) => {
                self.subscription.ack(delivery).await?;
                Ok(Some(endpoint_id))
            }
            Err(e) => {
                warn!(
                    "Reconcile of endpoint {endpoint_id} hit an infrastructure fault (delivery {deliveries}): {e}"
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

    async fn handle_deploy(&self, endpoint_id: Uuid) -> Result<()> {
        let intent = match self.stores.endpoints.get(endpoint_id).await? {
            Some(intent) => intent,
            None => {
                warn!("Deploy request for unknown endpoint {endpoint_id}, dropping");
                return Ok(());
            }
        };
        if !matches!(
            intent.status,
            EndpointStatus::Creating | EndpointStatus::Ready
        ) {
            debug!(
                "Endpoint {endpoint_id} is {}, not reconciling",
                intent.status
            );
            return Ok(());
        }

        match self.config.deploy_mode {
            DeployMode::Simulate => {
                let url = format!(
                    "http://{}.serving.local",
                    serving_resource_name(endpoint_id)
                );
                self.stores
                    .endpoints
                    .modify(endpoint_id, |row| {
                        if !matches!(
                            row.status,
                            EndpointStatus::Creating | EndpointStatus::Ready
                        ) {
                            return false;
                        }
                        row.status = EndpointStatus::Ready;
                        row.url = Some(url.clone());
                        row.error = None;
                        true
                    })
                    .await?;
                info!("Endpoint {endpoint_id} simulated READY at {url}");
                Ok(())
            }
            DeployMode::Reconcile => self.reconcile(intent).await,
        }
    }

    async fn reconcile(&self, intent: EndpointIntent) -> Result<()> {
        let endpoint_id = intent.endpoint_id;

        if let Err(reason) = validate_intent(&intent) {
            warn!("Endpoint {endpoint_id} failed validation: {reason}");
            return self.mark_failed(endpoint_id, &reason).await;
        }

        let spec = render_spec(&intent);
        if let Err(e) = self.serving.upsert(&spec).await {
            warn!("Upsert of {} failed: {e}", spec.name);
            return self
                .mark_failed(endpoint_id, &format!("serving upsert failed: {e}"))
                .await;
        }

        let deadline = tokio::time::Instant::now() + self.config.deploy_timeout;
        loop {
            match self.serving.state(&spec.name).await {
                Ok(Some(state)) if state.ready && state.url.is_some() => {
                    let url = state.url.unwrap_or_default();
                    self.stores
                        .endpoints
                        .modify(endpoint_id, |row| {
                            if !matches!(
                                row.status,
                                EndpointStatus::Creating | EndpointStatus::Ready
                            ) {
                                return false;
                            }
                            row.status = EndpointStatus::Ready;
                            row.url = Some(url.clone());
                            row.error = None;
                            true
                        })
                        .await?;
                    info!("Endpoint {endpoint_id} READY");
                    return Ok(());
                }
                Ok(_) => {}
                Err(e) => warn!("Polling {} failed: {e}", spec.name),
            }

            if tokio::time::Instant::now() >= deadline {
                return self
                    .mark_failed(
                        endpoint_id,
                        "timed out waiting for the serving resource to become ready",
                    )
                    .await;
            }
            tokio::time::sleep(self.config.deploy_poll_interval).await;
        }
    }

    async fn handle_delete(&self, endpoint_id: Uuid) -> Result<()> {
        let intent = match self.stores.endpoints.get(endpoint_id).await? {
            Some(intent) => intent,
            None => return Ok(()),
        };
        if intent.status != EndpointStatus::Deleting {
            debug!(
                "Delete request for endpoint {endpoint_id} in {}, dropping",
                intent.status
            );
            return Ok(());
        }

        self.serving
            .delete(&serving_resource_name(endpoint_id))
            .await?;

        // soft delete: rename so the (tenant, project, name) slot frees
        // up for a new endpoint
        let released_name = format!(
            "{}~deleted-{}",
            intent.name,
            Utc::now().timestamp_millis()
        );
        self.stores
            .endpoints
            .modify(endpoint_id, |row| {
                if row.status != EndpointStatus::Deleting {
                    return false;
                }
                row.name = released_name.clone();
                true
            })
            .await?;
        info!("Endpoint {endpoint_id} deleted (name released)");
        Ok(())
    }

    async fn mark_failed(&self, endpoint_id: Uuid, reason: &str) -> Result<()> {
        self.stores
            .endpoints
            .modify(endpoint_id, |row| {
                row.status = EndpointStatus::Failed;
                row.error = Some(reason.to_owned());
                true
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::orchestrator::SimulatedServingClient;
    use modelops_core::error::PlaneError;
    use modelops_core::event::bus::MemoryEventBus;
    use modelops_core::event::encode_event;
    use modelops_core::state::backend::memory::MemoryBackend;
    use std::time::Duration;

    struct Fixture {
        stores: StateStores,
        bus: Arc<MemoryEventBus>,
        serving: Arc<SimulatedServingClient>,
        worker: DeployWorker,
    }

    async fn fixture(config: WorkerConfig) -> Fixture {
        let stores = StateStores::new(Arc::new(MemoryBackend::new()));
        let bus = Arc::new(MemoryEventBus::new());
        let serving = Arc::new(SimulatedServingClient::new());
        let worker = DeployWorker::new(
            stores.clone(),
            bus.clone(),
            config,
            serving.clone(),
        )
        .await
        .unwrap();
        Fixture {
            stores,
            bus,
            serving,
            worker,
        }
    }

    fn reconcile_config() -> WorkerConfig {
        WorkerConfig::default()
            .with_deploy_mode(DeployMode::Reconcile)
            .with_deploy_timeout(Duration::from_millis(500))
            .with_deploy_poll_interval(Duration::from_millis(10))
    }

    async fn create_intent(fixture: &Fixture) -> EndpointIntent {
        let intent = EndpointIntent::new_creating(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "classifier".to_owned(),
            "sklearn".to_owned(),
        );
        fixture.stores.endpoints.create(&intent).await.unwrap();
        intent
    }

    async fn publish_deploy(fixture: &Fixture, intent: &EndpointIntent) {
        let event = DeployRequested {
            endpoint_id: intent.endpoint_id,
            tenant_id: intent.tenant_id,
            project_id: intent.project_id,
            published_at: Utc::now().timestamp_millis(),
        };
        fixture
            .bus
            .publish(SUBJECT_DEPLOY_REQUESTED, encode_event(&event).unwrap())
            .await
            .unwrap();
    }

    async fn publish_delete(fixture: &Fixture, intent: &EndpointIntent) {
        let event = DeleteRequested {
            endpoint_id: intent.endpoint_id,
            tenant_id: intent.tenant_id,
            project_id: intent.project_id,
            published_at: Utc::now().timestamp_millis(),
        };
        fixture
            .bus
            .publish(SUBJECT_DELETE_REQUESTED, encode_event(&event).unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn simulate_mode_marks_ready_with_a_synthetic_url() {
        let mut fixture = fixture(WorkerConfig::default()).await;
        let intent = create_intent(&fixture).await;
        publish_deploy(&fixture, &intent).await;

        let handled = fixture.worker.process_one().await.unwrap();
        assert_eq!(handled, Some(intent.endpoint_id));

        let row = fixture
            .stores
            .endpoints
            .expect(intent.endpoint_id)
            .await
            .unwrap();
        assert_eq!(row.status, EndpointStatus::Ready);
        assert!(row.url.unwrap().contains("serving.local"));
    }

    #[tokio::test]
    async fn reconcile_mode_upserts_and_waits_for_readiness() {
        let mut fixture = fixture(reconcile_config()).await;
        let intent = create_intent(&fixture).await;
        publish_deploy(&fixture, &intent).await;

        fixture.worker.process_one().await.unwrap();

        let row = fixture
            .stores
            .endpoints
            .expect(intent.endpoint_id)
            .await
            .unwrap();
        assert_eq!(row.status, EndpointStatus::Ready);
        assert_eq!(
            row.url.as_deref(),
            Some(
                format!(
                    "http://{}.serving.local",
                    serving_resource_name(intent.endpoint_id)
                )
                .as_str()
            )
        );
        assert!(fixture
            .serving
            .upserted(&serving_resource_name(intent.endpoint_id)));
    }

    // Scenario: canary validation. An out-of-range canary percent fails
    // the endpoint with a validation error and nothing is upserted.
    #[tokio::test]
    async fn out_of_range_canary_fails_without_an_upsert() {
        let mut fixture = fixture(reconcile_config()).await;
        let intent = create_intent(&fixture).await;
        fixture
            .stores
            .endpoints
            .modify(intent.endpoint_id, |row| {
                row.traffic.canary_traffic_percent = 150;
                true
            })
            .await
            .unwrap();
        publish_deploy(&fixture, &intent).await;

        fixture.worker.process_one().await.unwrap();

        let row = fixture
            .stores
            .endpoints
            .expect(intent.endpoint_id)
            .await
            .unwrap();
        assert_eq!(row.status, EndpointStatus::Failed);
        assert!(row.error.unwrap().contains("canaryTrafficPercent"));
        assert_eq!(fixture.serving.resource_count(), 0);
    }

    #[tokio::test]
    async fn canary_requires_serverless() {
        let intent = {
            let mut intent = EndpointIntent::new_creating(
                Uuid::new_v4(),
                Uuid::new_v4(),
                "canary".to_owned(),
                "sklearn".to_owned(),
            );
            intent.traffic.canary_traffic_percent = 30;
            intent.traffic.deployment_mode = DeploymentMode::RawDeployment;
            intent
        };
        assert!(validate_intent(&intent)
            .unwrap_err()
            .contains("serverless"));
    }

    #[tokio::test]
    async fn triton_requires_protocol_v2() {
        let mut intent = EndpointIntent::new_creating(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "triton-ep".to_owned(),
            "triton".to_owned(),
        );
        intent.runtime_config.model_format = Some("triton".to_owned());
        assert!(validate_intent(&intent).unwrap_err().contains("v2"));

        intent.runtime_config.protocol_version = Some("v2".to_owned());
        assert!(validate_intent(&intent).is_ok());
    }

    #[tokio::test]
    async fn deploy_requests_for_failed_endpoints_are_ignored() {
        let mut fixture = fixture(reconcile_config()).await;
        let intent = create_intent(&fixture).await;
        fixture
            .stores
            .endpoints
            .modify(intent.endpoint_id, |row| {
                row.status = EndpointStatus::Failed;
                row.error = Some("previous validation error".to_owned());
                true
            })
            .await
            .unwrap();
        publish_deploy(&fixture, &intent).await;

        fixture.worker.process_one().await.unwrap();

        let row = fixture
            .stores
            .endpoints
            .expect(intent.endpoint_id)
            .await
            .unwrap();
        assert_eq!(row.status, EndpointStatus::Failed);
        assert_eq!(fixture.serving.resource_count(), 0);
    }

    #[tokio::test]
    async fn delete_soft_deletes_by_renaming() {
        let mut fixture = fixture(reconcile_config()).await;
        let intent = create_intent(&fixture).await;

        // deploy it first so the serving resource exists
        publish_deploy(&fixture, &intent).await;
        fixture.worker.process_one().await.unwrap();

        fixture
            .stores
            .endpoints
            .modify(intent.endpoint_id, |row| {
                row.status = EndpointStatus::Deleting;
                true
            })
            .await
            .unwrap();
        publish_delete(&fixture, &intent).await;
        fixture.worker.process_one().await.unwrap();

        let row = fixture
            .stores
            .endpoints
            .expect(intent.endpoint_id)
            .await
            .unwrap();
        assert_ne!(row.name, intent.name);
        assert!(row.name.starts_with(&intent.name));
        assert_eq!(fixture.serving.resource_count(), 0);

        // the original name is free again
        let replacement = EndpointIntent::new_creating(
            intent.tenant_id,
            intent.project_id,
            intent.name.clone(),
            "sklearn".to_owned(),
        );
        fixture.stores.endpoints.create(&replacement).await.unwrap();
    }

    #[tokio::test]
    async fn undeliverable_reconciles_are_retried_then_dropped() {
        // a serving client that always refuses deletes exercises the
        // nack path
        struct RefusingServing;

        #[async_trait::async_trait]
        impl ServingClient for RefusingServing {
            async fn upsert(&self, _spec: &ServingSpec) -> Result<()> {
                Err(PlaneError::TransientStore("api refused".to_owned()))
            }
            async fn state(
                &self,
                _name: &str,
            ) -> Result<Option<crate::orchestrator::ServingState>> {
                Ok(None)
            }
            async fn delete(&self, _name: &str) -> Result<()> {
                Err(PlaneError::TransientStore("api refused".to_owned()))
            }
        }

        let stores = StateStores::new(Arc::new(MemoryBackend::new()));
        let bus = Arc::new(MemoryEventBus::new());
        let mut worker = DeployWorker::new(
            stores.clone(),
            bus.clone(),
            reconcile_config().with_redelivery_cap(2),
            Arc::new(RefusingServing),
        )
        .await
        .unwrap();

        let intent = EndpointIntent::new_creating(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "stuck".to_owned(),
            "sklearn".to_owned(),
        );
        stores.endpoints.create(&intent).await.unwrap();
        stores
            .endpoints
            .modify(intent.endpoint_id, |row| {
                row.status = EndpointStatus::Deleting;
                true
            })
            .await
            .unwrap();

        let event = DeleteRequested {
            endpoint_id: intent.endpoint_id,
            tenant_id: intent.tenant_id,
            project_id: intent.project_id,
            published_at: Utc::now().timestamp_millis(),
        };
        bus.publish(SUBJECT_DELETE_REQUESTED, encode_event(&event).unwrap())
            .await
            .unwrap();

        // first delivery nacks, second hits the cap and is dropped
        assert_eq!(worker.process_one().await.unwrap(), None);
        assert_eq!(worker.process_one().await.unwrap(), None);

        // the row keeps its DELETING status for a later sweep
        let row = stores.endpoints.expect(intent.endpoint_id).await.unwrap();
        assert_eq!(row.status, EndpointStatus::Deleting);
    }
}
