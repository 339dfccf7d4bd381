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

//! Tenancy-aware outbound HTTP helper
//!
//! The one place outbound calls happen: propagates the tenant context
//! headers, applies the configured timeout and surfaces typed errors.

use std::time::Duration;

use log::debug;
use url::Url;

use crate::error::{PlaneError, Result};
use crate::tenancy::{
    TenantContext, PROJECT_HEADER, ROLES_HEADER, TENANT_HEADER, USER_HEADER,
};

#[derive(Clone)]
pub struct TenantHttpClient {
    inner: reqwest::Client,
    timeout: Duration,
}

impl TenantHttpClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let inner = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PlaneError::Internal(format!("building http client: {e}")))?;
        Ok(Self { inner, timeout })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// POST a JSON body and return the JSON response. Non-2xx responses
    /// are errors carrying the status and a truncated body excerpt.
    pub async fn post_json(
        &self,
        target_url: &str,
        ctx: Option<&TenantContext>,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        let url = Url::parse(target_url)
            .map_err(|e| PlaneError::Validation(format!("invalid target url: {e}")))?;

        let mut request = self.inner.post(url).json(body);
        if let Some(ctx) = ctx {
            request = request
                .header(TENANT_HEADER, ctx.tenant_id.to_string())
                .header(PROJECT_HEADER, ctx.project_id.to_string())
                .header(USER_HEADER, ctx.user_id.clone());
            if !ctx.roles.is_empty() {
                request = request.header(ROLES_HEADER, ctx.roles.join(","));
            }
        }

        debug!("POST {target_url}");
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                PlaneError::Internal(format!(
                    "request to {target_url} timed out after {:?}",
                    self.timeout
                ))
            } else {
                PlaneError::Internal(format!("request to {target_url} failed: {e}"))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let excerpt: String = response
                .text()
                .await
                .unwrap_or_default()
                .chars()
                .take(512)
                .collect();
            return Err(PlaneError::Internal(format!(
                "{target_url} returned {status}: {excerpt}"
            )));
        }

        response
            .json()
            .await
            .map_err(|e| PlaneError::Internal(format!("decoding response body: {e}")))
    }
}
