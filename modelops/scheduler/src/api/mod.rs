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

//! HTTP surface of the control plane
//!
//! Every route except the configured exemptions (`healthz`, `metrics`)
//! requires the tenancy headers. Errors leave this layer as a JSON body
//! `{"error": CODE, "message": ...}` with the status the error kind
//! maps to.

pub mod deployments;
pub mod jobs;

use std::convert::Infallible;
use std::sync::Arc;

use serde::Serialize;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use modelops_core::error::PlaneError;
use modelops_core::event::bus::EventBus;
use modelops_core::state::StateStores;
use modelops_core::tenancy::{
    TenantContext, PROJECT_HEADER, ROLES_HEADER, TENANT_HEADER, USER_HEADER,
};

use crate::config::SchedulerConfig;
use crate::metrics::SchedulerMetricsCollector;

#[derive(Clone)]
pub struct ApiContext {
    pub stores: StateStores,
    pub bus: Arc<dyn EventBus>,
    pub config: SchedulerConfig,
    pub metrics: Arc<dyn SchedulerMetricsCollector>,
}

/// The full route tree, rejection handling included.
pub fn routes(
    ctx: ApiContext,
) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone {
    let health = warp::path!("healthz")
        .and(warp::get())
        .map(|| warp::reply::Response::new("ok".into()));
    let metrics = warp::path!("metrics").and(warp::get()).and_then(metrics_handler);

    health
        .or(metrics)
        .unify()
        .or(jobs::routes(ctx.clone()))
        .unify()
        .or(deployments::routes(ctx))
        .unify()
        .recover(handle_rejection)
}

async fn metrics_handler() -> Result<warp::reply::Response, Rejection> {
    #[cfg(feature = "prometheus-metrics")]
    {
        match crate::metrics::prometheus::get_metrics() {
            Ok(reply) => Ok(reply.into_response()),
            Err(e) => Err(warp::reject::custom(ApiError(e))),
        }
    }
    #[cfg(not(feature = "prometheus-metrics"))]
    {
        Ok(warp::reply::with_status(
            "metrics support not compiled in",
            StatusCode::NOT_FOUND,
        )
        .into_response())
    }
}

/// Wrapper carrying a [`PlaneError`] through warp's rejection machinery.
#[derive(Debug)]
pub struct ApiError(pub PlaneError);

impl warp::reject::Reject for ApiError {}

pub(crate) fn reject(error: PlaneError) -> Rejection {
    warp::reject::custom(ApiError(error))
}

/// Extract the tenant context from the identity headers.
pub(crate) fn tenant_ctx(
) -> impl Filter<Extract = (TenantContext,), Error = Rejection> + Clone {
    warp::header::optional::<String>(TENANT_HEADER)
        .and(warp::header::optional::<String>(PROJECT_HEADER))
        .and(warp::header::optional::<String>(USER_HEADER))
        .and(warp::header::optional::<String>(ROLES_HEADER))
        .and_then(
            |tenant: Option<String>,
             project: Option<String>,
             user: Option<String>,
             roles: Option<String>| async move {
                TenantContext::from_headers(
                    tenant.as_deref(),
                    project.as_deref(),
                    user.as_deref(),
                    roles.as_deref(),
                )
                .map_err(reject)
            },
        )
}

pub(crate) fn with_ctx(
    ctx: ApiContext,
) -> impl Filter<Extract = (ApiContext,), Error = Infallible> + Clone {
    warp::any().map(move || ctx.clone())
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

fn status_for(error: &PlaneError) -> StatusCode {
    match error {
        PlaneError::Validation(_) => StatusCode::BAD_REQUEST,
        PlaneError::TenancyDenied(_) => StatusCode::UNAUTHORIZED,
        PlaneError::IdempotencyConflict(_) => StatusCode::CONFLICT,
        PlaneError::QuotaExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
        PlaneError::NotFound(_) => StatusCode::NOT_FOUND,
        PlaneError::TransientStore(_) | PlaneError::TransientBus(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
    let (status, code, message) = if err.is_not_found() {
        (
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            "resource not found".to_owned(),
        )
    } else if let Some(ApiError(error)) = err.find::<ApiError>() {
        (status_for(error), error.code(), error.to_string())
    } else if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
        (StatusCode::BAD_REQUEST, "VALIDATION", e.to_string())
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (
            StatusCode::METHOD_NOT_ALLOWED,
            "METHOD_NOT_ALLOWED",
            "method not allowed".to_owned(),
        )
    } else {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL",
            "unhandled error".to_owned(),
        )
    };

    Ok(warp::reply::with_status(
        warp::reply::json(&ErrorBody {
            error: code,
            message,
        }),
        status,
    ))
}
