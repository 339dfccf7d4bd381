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

//! Endpoint intents: create, update, soft-delete
//!
//! The API only records desired state and emits `deploy_requested` /
//! `delete_requested`; the deploy worker does the reconciliation. Canary
//! and runtime validation deliberately happen in the worker, so a bad
//! intent surfaces as a FAILED endpoint, not a rejected request.

use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use warp::{Filter, Rejection};

use modelops_core::error::{PlaneError, Result};
use modelops_core::event::{
    encode_event, DeleteRequested, DeployRequested, SUBJECT_DELETE_REQUESTED,
    SUBJECT_DEPLOY_REQUESTED,
};
use modelops_core::model::{
    AutoscalingSpec, EndpointIntent, EndpointStatus, RuntimeConfig, TrafficSpec,
};
use modelops_core::tenancy::TenantContext;

use crate::api::{reject, tenant_ctx, with_ctx, ApiContext};

pub fn routes(
    ctx: ApiContext,
) -> impl Filter<Extract = (warp::reply::Response,), Error = Rejection> + Clone {
    let create = warp::path!("api" / "v1" / "deployments")
        .and(warp::post())
        .and(tenant_ctx())
        .and(warp::body::json())
        .and(with_ctx(ctx.clone()))
        .and_then(create_deployment);

    let get = warp::path!("api" / "v1" / "deployments" / Uuid)
        .and(warp::get())
        .and(tenant_ctx())
        .and(with_ctx(ctx.clone()))
        .and_then(get_deployment);

    let update = warp::path!("api" / "v1" / "deployments" / Uuid)
        .and(warp::patch())
        .and(tenant_ctx())
        .and(warp::body::json())
        .and(with_ctx(ctx.clone()))
        .and_then(update_deployment);

    let delete = warp::path!("api" / "v1" / "deployments" / Uuid)
        .and(warp::delete())
        .and(tenant_ctx())
        .and(with_ctx(ctx))
        .and_then(delete_deployment);

    create
        .or(get)
        .unify()
        .or(update)
        .unify()
        .or(delete)
        .unify()
}

#[derive(Debug, Deserialize)]
pub struct CreateDeploymentRequest {
    pub name: String,
    pub runtime: String,
    #[serde(default)]
    pub model_version_id: Option<String>,
    #[serde(default)]
    pub artifact_uri: Option<String>,
    #[serde(default)]
    pub traffic: TrafficSpec,
    #[serde(default)]
    pub autoscaling: AutoscalingSpec,
    #[serde(default)]
    pub runtime_config: RuntimeConfig,
}

#[derive(Debug, Deserialize)]
pub struct UpdateDeploymentRequest {
    pub runtime: Option<String>,
    pub model_version_id: Option<String>,
    pub artifact_uri: Option<String>,
    pub traffic: Option<TrafficSpec>,
    pub autoscaling: Option<AutoscalingSpec>,
    pub runtime_config: Option<RuntimeConfig>,
}

#[derive(Debug, Serialize)]
pub struct EndpointView {
    pub endpoint_id: Uuid,
    pub name: String,
    pub status: EndpointStatus,
    pub url: Option<String>,
    pub runtime: String,
    pub model_version_id: Option<String>,
    pub artifact_uri: Option<String>,
    pub traffic: TrafficSpec,
    pub autoscaling: AutoscalingSpec,
    pub runtime_config: RuntimeConfig,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&EndpointIntent> for EndpointView {
    fn from(intent: &EndpointIntent) -> Self {
        Self {
            endpoint_id: intent.endpoint_id,
            name: intent.name.clone(),
            status: intent.status,
            url: intent.url.clone(),
            runtime: intent.runtime.clone(),
            model_version_id: intent.model_version_id.clone(),
            artifact_uri: intent.artifact_uri.clone(),
            traffic: intent.traffic.clone(),
            autoscaling: intent.autoscaling.clone(),
            runtime_config: intent.runtime_config.clone(),
            error: intent.error.clone(),
            created_at: intent.created_at,
            updated_at: intent.updated_at,
        }
    }
}

async fn create_deployment(
    tenant: TenantContext,
    request: CreateDeploymentRequest,
    ctx: ApiContext,
) -> std::result::Result<warp::reply::Response, Rejection> {
    create_inner(tenant, request, ctx).await.map_err(reject)
}

async fn create_inner(
    tenant: TenantContext,
    request: CreateDeploymentRequest,
    ctx: ApiContext,
) -> Result<warp::reply::Response> {
    let name = request.name.trim();
    if name.is_empty() {
        return Err(PlaneError::Validation("name must not be empty".to_owned()));
    }
    if request.runtime.trim().is_empty() {
        return Err(PlaneError::Validation(
            "runtime must not be empty".to_owned(),
        ));
    }

    let mut intent = EndpointIntent::new_creating(
        tenant.tenant_id,
        tenant.project_id,
        name.to_owned(),
        request.runtime,
    );
    intent.model_version_id = request.model_version_id;
    intent.artifact_uri = request.artifact_uri;
    intent.traffic = request.traffic;
    intent.autoscaling = request.autoscaling;
    intent.runtime_config = request.runtime_config;

    ctx.stores.endpoints.create(&intent).await?;
    publish_deploy_requested(&ctx, &intent).await;

    json_view(warp::http::StatusCode::CREATED, &intent)
}

async fn get_deployment(
    endpoint_id: Uuid,
    tenant: TenantContext,
    ctx: ApiContext,
) -> std::result::Result<warp::reply::Response, Rejection> {
    let intent = load_scoped(&ctx, &tenant, endpoint_id).await.map_err(reject)?;
    json_view(warp::http::StatusCode::OK, &intent).map_err(reject)
}

async fn update_deployment(
    endpoint_id: Uuid,
    tenant: TenantContext,
    request: UpdateDeploymentRequest,
    ctx: ApiContext,
) -> std::result::Result<warp::reply::Response, Rejection> {
    update_inner(endpoint_id, tenant, request, ctx)
        .await
        .map_err(reject)
}

async fn update_inner(
    endpoint_id: Uuid,
    tenant: TenantContext,
    request: UpdateDeploymentRequest,
    ctx: ApiContext,
) -> Result<warp::reply::Response> {
    let current = load_scoped(&ctx, &tenant, endpoint_id).await?;
    if current.status == EndpointStatus::Deleting {
        return Err(PlaneError::Validation(format!(
            "endpoint {endpoint_id} is being deleted"
        )));
    }

    let mut updated = current.clone();
    if let Some(runtime) = request.runtime {
        updated.runtime = runtime;
    }
    if let Some(model_version_id) = request.model_version_id {
        updated.model_version_id = Some(model_version_id);
    }
    if let Some(artifact_uri) = request.artifact_uri {
        updated.artifact_uri = Some(artifact_uri);
    }
    if let Some(traffic) = request.traffic {
        updated.traffic = traffic;
    }
    if let Some(autoscaling) = request.autoscaling {
        updated.autoscaling = autoscaling;
    }
    if let Some(runtime_config) = request.runtime_config {
        updated.runtime_config = runtime_config;
    }

    let needs_reconcile = current.serving_fields_differ(&updated);
    if needs_reconcile {
        updated.status = EndpointStatus::Creating;
        updated.error = None;
    }

    let applied = ctx
        .stores
        .endpoints
        .modify(endpoint_id, |row| {
            row.runtime = updated.runtime.clone();
            row.model_version_id = updated.model_version_id.clone();
            row.artifact_uri = updated.artifact_uri.clone();
            row.traffic = updated.traffic.clone();
            row.autoscaling = updated.autoscaling.clone();
            row.runtime_config = updated.runtime_config.clone();
            if needs_reconcile {
                row.status = EndpointStatus::Creating;
                row.error = None;
            }
            true
        })
        .await?;
    if !applied {
        return Err(PlaneError::NotFound(format!("endpoint {endpoint_id}")));
    }

    let refreshed = ctx.stores.endpoints.expect(endpoint_id).await?;
    if needs_reconcile {
        publish_deploy_requested(&ctx, &refreshed).await;
    }

    json_view(warp::http::StatusCode::OK, &refreshed)
}

async fn delete_deployment(
    endpoint_id: Uuid,
    tenant: TenantContext,
    ctx: ApiContext,
) -> std::result::Result<warp::reply::Response, Rejection> {
    delete_inner(endpoint_id, tenant, ctx).await.map_err(reject)
}

async fn delete_inner(
    endpoint_id: Uuid,
    tenant: TenantContext,
    ctx: ApiContext,
) -> Result<warp::reply::Response> {
    load_scoped(&ctx, &tenant, endpoint_id).await?;

    ctx.stores
        .endpoints
        .modify(endpoint_id, |row| {
            if row.status == EndpointStatus::Deleting {
                return false;
            }
            row.status = EndpointStatus::Deleting;
            true
        })
        .await?;

    let intent = ctx.stores.endpoints.expect(endpoint_id).await?;
    let event = DeleteRequested {
        endpoint_id,
        tenant_id: intent.tenant_id,
        project_id: intent.project_id,
        published_at: Utc::now().timestamp_millis(),
    };
    match encode_event(&event) {
        Ok(body) => {
            if let Err(e) = ctx.bus.publish(SUBJECT_DELETE_REQUESTED, body).await {
                warn!("Failed to publish delete_requested for {endpoint_id}: {e}");
            }
        }
        Err(e) => warn!("Failed to encode delete_requested for {endpoint_id}: {e}"),
    }

    json_view(warp::http::StatusCode::ACCEPTED, &intent)
}

async fn load_scoped(
    ctx: &ApiContext,
    tenant: &TenantContext,
    endpoint_id: Uuid,
) -> Result<EndpointIntent> {
    match ctx.stores.endpoints.get(endpoint_id).await? {
        Some(intent)
            if intent.tenant_id == tenant.tenant_id
                && intent.project_id == tenant.project_id =>
        {
            Ok(intent)
        }
        _ => Err(PlaneError::NotFound(format!("endpoint {endpoint_id}"))),
    }
}

async fn publish_deploy_requested(ctx: &ApiContext, intent: &EndpointIntent) {
    let event = DeployRequested {
        endpoint_id: intent.endpoint_id,
        tenant_id: intent.tenant_id,
        project_id: intent.project_id,
        published_at: Utc::now().timestamp_millis(),
    };
    match encode_event(&event) {
        Ok(body) => {
            if let Err(e) = ctx.bus.publish(SUBJECT_DEPLOY_REQUESTED, body).await {
                warn!(
                    "Failed to publish deploy_requested for {}: {e}",
                    intent.endpoint_id
                );
            }
        }
        Err(e) => warn!(
            "Failed to encode deploy_requested for {}: {e}",
            intent.endpoint_id
        ),
    }
}

fn json_view(
    status: warp::http::StatusCode,
    intent: &EndpointIntent,
) -> Result<warp::reply::Response> {
    let body = serde_json::to_string(&EndpointView::from(intent))?;
    let mut response = warp::reply::Response::new(body.into());
    *response.status_mut() = status;
    response.headers_mut().insert(
        warp::http::header::CONTENT_TYPE,
        warp::http::HeaderValue::from_static("application/json"),
    );
    Ok(response)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::test_utils::SchedulerTestHarness;
    use modelops_core::event::bus::EventBus;
    use modelops_core::event::decode_event;
    use modelops_core::tenancy::{PROJECT_HEADER, TENANT_HEADER, USER_HEADER};
    use std::time::Duration;

    fn api(harness: &SchedulerTestHarness) -> ApiContext {
        ApiContext {
            stores: harness.stores.clone(),
            bus: harness.bus.clone(),
            config: SchedulerConfig::default(),
            metrics: harness.metrics.clone(),
        }
    }

    fn request(
        method: &str,
        path: &str,
        tenant: Uuid,
        project: Uuid,
    ) -> warp::test::RequestBuilder {
        warp::test::request()
            .method(method)
            .path(path)
            .header(TENANT_HEADER, tenant.to_string())
            .header(PROJECT_HEADER, project.to_string())
            .header(USER_HEADER, "user-1")
    }

    #[tokio::test]
    async fn create_emits_deploy_requested() {
        let harness = SchedulerTestHarness::new(SchedulerConfig::default());
        let mut sub = harness
            .bus
            .subscribe(&[SUBJECT_DEPLOY_REQUESTED], "deploy-test")
            .await
            .unwrap();
        let routes = crate::api::routes(api(&harness));
        let tenant = Uuid::new_v4();
        let project = Uuid::new_v4();

        let response = request("POST", "/api/v1/deployments", tenant, project)
            .json(&serde_json::json!({
                "name": "embeddings",
                "runtime": "sklearn",
                "artifact_uri": "s3://models/embeddings/3"
            }))
            .reply(&routes)
            .await;
        assert_eq!(response.status(), 201);

        let view: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(view["status"], "CREATING");

        let delivery = tokio::time::timeout(Duration::from_secs(1), sub.next())
            .await
            .expect("deploy_requested expected");
        let event: DeployRequested = decode_event(&delivery.body).unwrap();
        assert_eq!(
            event.endpoint_id.to_string(),
            view["endpoint_id"].as_str().unwrap()
        );
    }

    #[tokio::test]
    async fn patch_emits_only_on_serving_changes() {
        let harness = SchedulerTestHarness::new(SchedulerConfig::default());
        let routes = crate::api::routes(api(&harness));
        let tenant = Uuid::new_v4();
        let project = Uuid::new_v4();

        let created = request("POST", "/api/v1/deployments", tenant, project)
            .json(&serde_json::json!({"name": "ranker", "runtime": "xgboost"}))
            .reply(&routes)
            .await;
        let view: serde_json::Value = serde_json::from_slice(created.body()).unwrap();
        let endpoint_id = view["endpoint_id"].as_str().unwrap().to_owned();

        // subscribe after creation so only the PATCH event is observed
        let mut sub = harness
            .bus
            .subscribe(&[SUBJECT_DEPLOY_REQUESTED], "patch-test")
            .await
            .unwrap();

        let patched = request(
            "PATCH",
            &format!("/api/v1/deployments/{endpoint_id}"),
            tenant,
            project,
        )
        .json(&serde_json::json!({
            "traffic": {"canaryTrafficPercent": 20, "deploymentMode": "serverless"}
        }))
        .reply(&routes)
        .await;
        assert_eq!(patched.status(), 200);
        let patched_view: serde_json::Value =
            serde_json::from_slice(patched.body()).unwrap();
        assert_eq!(patched_view["status"], "CREATING");
        assert_eq!(patched_view["traffic"]["canaryTrafficPercent"], 20);

        let delivery = tokio::time::timeout(Duration::from_secs(1), sub.next())
            .await
            .expect("deploy_requested expected after serving change");
        let event: DeployRequested = decode_event(&delivery.body).unwrap();
        assert_eq!(event.endpoint_id.to_string(), endpoint_id);

        // a PATCH that changes nothing serving-relevant stays quiet
        let noop = request(
            "PATCH",
            &format!("/api/v1/deployments/{endpoint_id}"),
            tenant,
            project,
        )
        .json(&serde_json::json!({}))
        .reply(&routes)
        .await;
        assert_eq!(noop.status(), 200);
        let nothing =
            tokio::time::timeout(Duration::from_millis(100), sub.next()).await;
        assert!(nothing.is_err(), "no event expected for a no-op PATCH");
    }

    #[tokio::test]
    async fn delete_marks_deleting_and_emits() {
        let harness = SchedulerTestHarness::new(SchedulerConfig::default());
        let mut sub = harness
            .bus
            .subscribe(&[SUBJECT_DELETE_REQUESTED], "delete-test")
            .await
            .unwrap();
        let routes = crate::api::routes(api(&harness));
        let tenant = Uuid::new_v4();
        let project = Uuid::new_v4();

        let created = request("POST", "/api/v1/deployments", tenant, project)
            .json(&serde_json::json!({"name": "summarizer", "runtime": "triton"}))
            .reply(&routes)
            .await;
        let view: serde_json::Value = serde_json::from_slice(created.body()).unwrap();
        let endpoint_id = view["endpoint_id"].as_str().unwrap().to_owned();

        let deleted = request(
            "DELETE",
            &format!("/api/v1/deployments/{endpoint_id}"),
            tenant,
            project,
        )
        .reply(&routes)
        .await;
        assert_eq!(deleted.status(), 202);

        let intent = harness
            .stores
            .endpoints
            .expect(endpoint_id.parse().unwrap())
            .await
            .unwrap();
        assert_eq!(intent.status, EndpointStatus::Deleting);

        let delivery = tokio::time::timeout(Duration::from_secs(1), sub.next())
            .await
            .expect("delete_requested expected");
        let event: DeleteRequested = decode_event(&delivery.body).unwrap();
        assert_eq!(event.endpoint_id.to_string(), endpoint_id);

        // updates are rejected once deletion started
        let patched = request(
            "PATCH",
            &format!("/api/v1/deployments/{endpoint_id}"),
            tenant,
            project,
        )
        .json(&serde_json::json!({"runtime": "sklearn"}))
        .reply(&routes)
        .await;
        assert_eq!(patched.status(), 400);
    }
}
