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

//! Tenancy context extraction
//!
//! Identity arrives on trusted headers from the edge; this module only
//! validates shape, it does not verify identity.

use uuid::Uuid;

use crate::error::{PlaneError, Result};

pub const TENANT_HEADER: &str = "x-tenant-id";
pub const PROJECT_HEADER: &str = "x-project-id";
pub const USER_HEADER: &str = "x-user-id";
pub const ROLES_HEADER: &str = "x-roles";

#[derive(Debug, Clone)]
pub struct TenantContext {
    pub tenant_id: Uuid,
    pub project_id: Uuid,
    pub user_id: String,
    pub roles: Vec<String>,
}

impl TenantContext {
    /// Build a context from raw header values. All three identity
    /// headers are mandatory; roles are optional.
    pub fn from_headers(
        tenant: Option<&str>,
        project: Option<&str>,
        user: Option<&str>,
        roles: Option<&str>,
    ) -> Result<Self> {
        let tenant_id = parse_uuid_header(TENANT_HEADER, tenant)?;
        let project_id = parse_uuid_header(PROJECT_HEADER, project)?;
        let user_id = match user {
            Some(value) if !value.trim().is_empty() => value.trim().to_owned(),
            _ => {
                return Err(PlaneError::TenancyDenied(format!(
                    "missing {USER_HEADER} header"
                )))
            }
        };
        Ok(Self {
            tenant_id,
            project_id,
            user_id,
            roles: roles.map(parse_roles).unwrap_or_default(),
        })
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

fn parse_uuid_header(name: &str, value: Option<&str>) -> Result<Uuid> {
    match value {
        Some(raw) => Uuid::parse_str(raw.trim()).map_err(|_| {
            PlaneError::TenancyDenied(format!("{name} header is not a UUID"))
        }),
        None => Err(PlaneError::TenancyDenied(format!("missing {name} header"))),
    }
}

/// Roles are comma- or whitespace-separated.
pub fn parse_roles(raw: &str) -> Vec<String> {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Whether tenancy extraction is skipped for this request path.
pub fn is_exempt_path(path: &str, skip_prefixes: &[String]) -> bool {
    let trimmed = path.trim_start_matches('/');
    skip_prefixes
        .iter()
        .any(|prefix| trimmed.starts_with(prefix.trim_start_matches('/')))
}

/// The default exemptions: liveness and metrics scrapes.
pub fn default_skip_prefixes() -> Vec<String> {
    vec!["healthz".to_owned(), "metrics".to_owned()]
}
