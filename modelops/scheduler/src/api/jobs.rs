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

//! GPU job submission and status

use bytes::Bytes;
use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use warp::{Filter, Rejection};

use modelops_core::error::{PlaneError, Result};
use modelops_core::event::{encode_event, JobEnqueued, SUBJECT_ENQUEUED};
use modelops_core::idempotency::{
    request_hash, IdempotencyOutcome, IdempotencyScope, ResponseSnapshot,
};
use modelops_core::model::{GpuJob, GpuPool, IsolationLevel, JobStatus, PoolRequest};
use modelops_core::tenancy::TenantContext;

use crate::api::{reject, tenant_ctx, with_ctx, ApiContext};

pub const JOBS_PATH: &str = "/api/v1/gpu-jobs";
pub const IDEMPOTENCY_HEADER: &str = "idempotency-key";

const MAX_BODY_BYTES: u64 = 256 * 1024;

pub fn routes(
    ctx: ApiContext,
) -> impl Filter<Extract = (warp::reply::Response,), Error = Rejection> + Clone {
    let submit = warp::path!("api" / "v1" / "gpu-jobs")
        .and(warp::post())
        .and(tenant_ctx())
        .and(warp::header::optional::<String>(IDEMPOTENCY_HEADER))
        .and(warp::body::content_length_limit(MAX_BODY_BYTES))
        .and(warp::body::bytes())
        .and(with_ctx(ctx.clone()))
        .and_then(submit_gpu_job);

    let get = warp::path!("api" / "v1" / "gpu-jobs" / Uuid)
        .and(warp::get())
        .and(tenant_ctx())
        .and(with_ctx(ctx))
        .and_then(get_gpu_job);

    submit.or(get).unify()
}

#[derive(Debug, Deserialize)]
pub struct SubmitGpuJobRequest {
    #[serde(default = "default_pool")]
    pub gpu_pool_requested: PoolRequest,
    #[serde(default = "default_isolation")]
    pub isolation_level: IsolationLevel,
    #[serde(default)]
    pub priority: i32,
    pub target_url: String,
    pub request_json: serde_json::Value,
}

fn default_pool() -> PoolRequest {
    PoolRequest::Auto
}

fn default_isolation() -> IsolationLevel {
    IsolationLevel::Shared
}

/// The client-facing job representation. The dispatch token never
/// leaves the store.
#[derive(Debug, Serialize)]
pub struct GpuJobView {
    pub job_id: Uuid,
    pub tenant_id: Uuid,
    pub project_id: Uuid,
    pub gpu_pool_requested: PoolRequest,
    pub isolation_level: IsolationLevel,
    pub priority: i32,
    pub target_url: String,
    pub request_json: serde_json::Value,
    pub gpu_pool_assigned: Option<GpuPool>,
    pub dispatch_attempts: u32,
    pub status: JobStatus,
    pub response_json: Option<serde_json::Value>,
    pub error: Option<String>,
    pub requested_at: DateTime<Utc>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl From<&GpuJob> for GpuJobView {
    fn from(job: &GpuJob) -> Self {
        Self {
            job_id: job.job_id,
            tenant_id: job.tenant_id,
            project_id: job.project_id,
            gpu_pool_requested: job.gpu_pool_requested,
            isolation_level: job.isolation_level,
            priority: job.priority,
            target_url: job.target_url.clone(),
            request_json: job.request_json.clone(),
            gpu_pool_assigned: job.gpu_pool_assigned,
            dispatch_attempts: job.dispatch_attempts,
            status: job.status,
            response_json: job.response_json.clone(),
            error: job.error.clone(),
            requested_at: job.requested_at,
            dispatched_at: job.dispatched_at,
            started_at: job.started_at,
            finished_at: job.finished_at,
            updated_at: job.updated_at,
        }
    }
}

async fn submit_gpu_job(
    tenant: TenantContext,
    idem_key: Option<String>,
    body: Bytes,
    ctx: ApiContext,
) -> std::result::Result<warp::reply::Response, Rejection> {
    submit_inner(tenant, idem_key, body, ctx)
        .await
        .map_err(reject)
}

async fn submit_inner(
    tenant: TenantContext,
    idem_key: Option<String>,
    body: Bytes,
    ctx: ApiContext,
) -> Result<warp::reply::Response> {
    let idem_key = match idem_key {
        Some(key) => key,
        None => {
            let (body_string, _) = create_job(&ctx, &tenant, &body).await?;
            return Ok(json_response(
                warp::http::StatusCode::CREATED,
                body_string,
            ));
        }
    };

    let scope = IdempotencyScope {
        tenant_id: tenant.tenant_id,
        project_id: tenant.project_id,
        method: "POST".to_owned(),
        path: JOBS_PATH.to_owned(),
        idem_key,
    };
    let hash = request_hash(&body);
    let ttl = chrono::Duration::from_std(ctx.config.idempotency_ttl)
        .unwrap_or_else(|_| chrono::Duration::hours(24));

    // a concurrent identical request may still be executing; give it a
    // bounded window to commit before giving up
    let mut attempts = 0;
    loop {
        match ctx.stores.idempotency.begin(&scope, &hash, ttl).await? {
            IdempotencyOutcome::Replay(snapshot) => {
                return Ok(snapshot_response(&snapshot));
            }
            IdempotencyOutcome::InFlight => {
                attempts += 1;
                if attempts > 40 {
                    return Err(PlaneError::TransientStore(
                        "identical request still in flight".to_owned(),
                    ));
                }
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
            IdempotencyOutcome::Owner => {
                return match create_job(&ctx, &tenant, &body).await {
                    Ok((body_string, _)) => {
                        let snapshot = ResponseSnapshot {
                            status_code: warp::http::StatusCode::CREATED.as_u16(),
                            response_headers: vec![(
                                "content-type".to_owned(),
                                "application/json".to_owned(),
                            )],
                            response_body: body_string,
                        };
                        ctx.stores
                            .idempotency
                            .complete(&scope, &hash, snapshot.clone(), ttl)
                            .await?;
                        Ok(snapshot_response(&snapshot))
                    }
                    Err(e) => {
                        // errors are not replayable; free the key
                        if let Err(release_err) =
                            ctx.stores.idempotency.release(&scope).await
                        {
                            warn!("Failed to release idempotency key: {release_err}");
                        }
                        Err(e)
                    }
                };
            }
        }
    }
}

/// Validate, enforce the queued-jobs quota, insert the `QUEUED` row, and
/// publish the informational `enqueued` event. Returns the serialized
/// response body so idempotent replays are byte-identical.
async fn create_job(
    ctx: &ApiContext,
    tenant: &TenantContext,
    body: &[u8],
) -> Result<(String, GpuJob)> {
    let request: SubmitGpuJobRequest = serde_json::from_slice(body)
        .map_err(|e| PlaneError::Validation(format!("invalid request body: {e}")))?;

    let target_url = request.target_url.trim();
    if target_url.is_empty() {
        return Err(PlaneError::Validation(
            "target_url must not be empty".to_owned(),
        ));
    }

    let policy = ctx.stores.policies.get(tenant.tenant_id).await?;
    let queued = ctx
        .stores
        .jobs
        .count_queued_for_tenant(tenant.tenant_id)
        .await?;
    if queued >= policy.max_queued_jobs as usize {
        return Err(PlaneError::QuotaExceeded(format!(
            "tenant has {queued} queued jobs (limit {})",
            policy.max_queued_jobs
        )));
    }

    let job = GpuJob::new_queued(
        tenant.tenant_id,
        tenant.project_id,
        request.gpu_pool_requested,
        request.isolation_level,
        request.priority,
        target_url.to_owned(),
        request.request_json,
    );
    ctx.stores.jobs.create(&job).await?;
    ctx.metrics.record_submitted(&job.job_id.to_string());

    let event = JobEnqueued {
        job_id: job.job_id,
        tenant_id: job.tenant_id,
        project_id: job.project_id,
        published_at: Utc::now().timestamp_millis(),
    };
    match encode_event(&event) {
        Ok(body) => {
            if let Err(e) = ctx.bus.publish(SUBJECT_ENQUEUED, body).await {
                // informational only; the scheduler polls the store
                warn!("Failed to publish enqueued event for {}: {e}", job.job_id);
            }
        }
        Err(e) => warn!("Failed to encode enqueued event for {}: {e}", job.job_id),
    }

    let body_string = serde_json::to_string(&GpuJobView::from(&job))?;
    Ok((body_string, job))
}

async fn get_gpu_job(
    job_id: Uuid,
    tenant: TenantContext,
    ctx: ApiContext,
) -> std::result::Result<warp::reply::Response, Rejection> {
    let job = ctx.stores.jobs.get(job_id).await.map_err(reject)?;
    match job {
        // a foreign tenant's job is indistinguishable from a missing one
        Some(job)
            if job.tenant_id == tenant.tenant_id
                && job.project_id == tenant.project_id =>
        {
            let body = serde_json::to_string(&GpuJobView::from(&job))
                .map_err(|e| reject(PlaneError::SerdeError(e)))?;
            Ok(json_response(warp::http::StatusCode::OK, body))
        }
        _ => Err(reject(PlaneError::NotFound(format!("gpu job {job_id}")))),
    }
}

fn json_response(status: warp::http::StatusCode, body: String) -> warp::reply::Response {
    let mut response = warp::reply::Response::new(body.into());
    *response.status_mut() = status;
    response.headers_mut().insert(
        warp::http::header::CONTENT_TYPE,
        warp::http::HeaderValue::from_static("application/json"),
    );
    response
}

/// Rebuild the stored response byte-for-byte.
fn snapshot_response(snapshot: &ResponseSnapshot) -> warp::reply::Response {
    let mut response = warp::reply::Response::new(snapshot.response_body.clone().into());
    *response.status_mut() = warp::http::StatusCode::from_u16(snapshot.status_code)
        .unwrap_or(warp::http::StatusCode::OK);
    for (name, value) in &snapshot.response_headers {
        if let (Ok(name), Ok(value)) = (
            warp::http::header::HeaderName::from_bytes(name.as_bytes()),
            warp::http::HeaderValue::from_str(value),
        ) {
            response.headers_mut().insert(name, value);
        }
    }
    response
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::test_utils::SchedulerTestHarness;
    use modelops_core::tenancy::{PROJECT_HEADER, TENANT_HEADER, USER_HEADER};

    fn api(harness: &SchedulerTestHarness) -> ApiContext {
        ApiContext {
            stores: harness.stores.clone(),
            bus: harness.bus.clone(),
            config: SchedulerConfig::default(),
            metrics: harness.metrics.clone(),
        }
    }

    fn submit_request(tenant: Uuid, project: Uuid) -> warp::test::RequestBuilder {
        warp::test::request()
            .method("POST")
            .path("/api/v1/gpu-jobs")
            .header(TENANT_HEADER, tenant.to_string())
            .header(PROJECT_HEADER, project.to_string())
            .header(USER_HEADER, "user-1")
    }

    #[tokio::test]
    async fn submit_creates_a_queued_job() {
        let harness = SchedulerTestHarness::new(SchedulerConfig::default());
        let routes = crate::api::routes(api(&harness));
        let tenant = Uuid::new_v4();
        let project = Uuid::new_v4();

        let response = submit_request(tenant, project)
            .json(&serde_json::json!({
                "gpu_pool_requested": "t4",
                "isolation_level": "isolated",
                "priority": 5,
                "target_url": "http://inference.local/run",
                "request_json": {"prompt": "hello"}
            }))
            .reply(&routes)
            .await;
        assert_eq!(response.status(), 201);

        let view: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(view["status"], "QUEUED");
        // the isolated alias normalizes to exclusive
        assert_eq!(view["isolation_level"], "exclusive");

        let job_id: Uuid = view["job_id"].as_str().unwrap().parse().unwrap();
        let row = harness.stores.jobs.expect(job_id).await.unwrap();
        assert_eq!(row.status, JobStatus::Queued);
        assert_eq!(row.priority, 5);
    }

    #[tokio::test]
    async fn missing_tenancy_headers_are_rejected() {
        let harness = SchedulerTestHarness::new(SchedulerConfig::default());
        let routes = crate::api::routes(api(&harness));

        let response = warp::test::request()
            .method("POST")
            .path("/api/v1/gpu-jobs")
            .json(&serde_json::json!({
                "target_url": "http://x/run",
                "request_json": {}
            }))
            .reply(&routes)
            .await;
        assert_eq!(response.status(), 401);

        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["error"], "TENANCY_DENIED");
    }

    #[tokio::test]
    async fn invalid_pool_is_a_validation_error() {
        let harness = SchedulerTestHarness::new(SchedulerConfig::default());
        let routes = crate::api::routes(api(&harness));

        let response = submit_request(Uuid::new_v4(), Uuid::new_v4())
            .json(&serde_json::json!({
                "gpu_pool_requested": "h100",
                "target_url": "http://x/run",
                "request_json": {}
            }))
            .reply(&routes)
            .await;
        assert_eq!(response.status(), 400);
        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["error"], "VALIDATION");
    }

    #[tokio::test]
    async fn queued_jobs_quota_is_enforced() {
        let harness = SchedulerTestHarness::new(SchedulerConfig::default());
        let routes = crate::api::routes(api(&harness));
        let tenant = harness.tenant_with_policy(2, 0, 1, 0).await;
        let project = Uuid::new_v4();

        let body = serde_json::json!({
            "target_url": "http://x/run",
            "request_json": {}
        });
        let first = submit_request(tenant, project)
            .json(&body)
            .reply(&routes)
            .await;
        assert_eq!(first.status(), 201);

        let second = submit_request(tenant, project)
            .json(&body)
            .reply(&routes)
            .await;
        assert_eq!(second.status(), 429);
        let error: serde_json::Value = serde_json::from_slice(second.body()).unwrap();
        assert_eq!(error["error"], "QUOTA_EXCEEDED");
    }

    // Scenario: idempotent submission. The same key and body yield a
    // single row and byte-identical responses; a different body under
    // the same key conflicts.
    #[tokio::test]
    async fn idempotent_submission_replays_bytes() {
        let harness = SchedulerTestHarness::new(SchedulerConfig::default());
        let routes = crate::api::routes(api(&harness));
        let tenant = Uuid::new_v4();
        let project = Uuid::new_v4();

        let body = serde_json::json!({
            "target_url": "http://x/run",
            "request_json": {"n": 1}
        });

        let first = submit_request(tenant, project)
            .header(IDEMPOTENCY_HEADER, "key-1")
            .json(&body)
            .reply(&routes)
            .await;
        assert_eq!(first.status(), 201);

        let second = submit_request(tenant, project)
            .header(IDEMPOTENCY_HEADER, "key-1")
            .json(&body)
            .reply(&routes)
            .await;
        assert_eq!(second.status(), 201);
        assert_eq!(first.body(), second.body());

        assert_eq!(harness.stores.jobs.list().await.unwrap().len(), 1);

        let divergent = submit_request(tenant, project)
            .header(IDEMPOTENCY_HEADER, "key-1")
            .json(&serde_json::json!({
                "target_url": "http://x/run",
                "request_json": {"n": 2}
            }))
            .reply(&routes)
            .await;
        assert_eq!(divergent.status(), 409);
        let error: serde_json::Value =
            serde_json::from_slice(divergent.body()).unwrap();
        assert_eq!(error["error"], "IDEMPOTENCY_CONFLICT");
    }

    #[tokio::test]
    async fn get_is_scoped_to_the_tenant() {
        let harness = SchedulerTestHarness::new(SchedulerConfig::default());
        let routes = crate::api::routes(api(&harness));
        let tenant = Uuid::new_v4();
        let project = Uuid::new_v4();

        let created = submit_request(tenant, project)
            .json(&serde_json::json!({
                "target_url": "http://x/run",
                "request_json": {}
            }))
            .reply(&routes)
            .await;
        let view: serde_json::Value = serde_json::from_slice(created.body()).unwrap();
        let job_id = view["job_id"].as_str().unwrap().to_owned();

        let own = warp::test::request()
            .method("GET")
            .path(&format!("/api/v1/gpu-jobs/{job_id}"))
            .header(TENANT_HEADER, tenant.to_string())
            .header(PROJECT_HEADER, project.to_string())
            .header(USER_HEADER, "user-1")
            .reply(&routes)
            .await;
        assert_eq!(own.status(), 200);

        let foreign = warp::test::request()
            .method("GET")
            .path(&format!("/api/v1/gpu-jobs/{job_id}"))
            .header(TENANT_HEADER, Uuid::new_v4().to_string())
            .header(PROJECT_HEADER, project.to_string())
            .header(USER_HEADER, "user-2")
            .reply(&routes)
            .await;
        assert_eq!(foreign.status(), 404);
    }

    #[tokio::test]
    async fn healthz_needs_no_tenancy() {
        let harness = SchedulerTestHarness::new(SchedulerConfig::default());
        let routes = crate::api::routes(api(&harness));

        let response = warp::test::request()
            .method("GET")
            .path("/healthz")
            .reply(&routes)
            .await;
        assert_eq!(response.status(), 200);
    }
}
