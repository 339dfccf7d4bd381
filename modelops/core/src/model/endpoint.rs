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

//! Serving endpoint intents consumed by the deploy worker

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EndpointStatus {
    Creating,
    Ready,
    Failed,
    Deleting,
}

impl fmt::Display for EndpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            EndpointStatus::Creating => "CREATING",
            EndpointStatus::Ready => "READY",
            EndpointStatus::Failed => "FAILED",
            EndpointStatus::Deleting => "DELETING",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeploymentMode {
    Serverless,
    RawDeployment,
}

/// Traffic splitting for an endpoint. A canary percentage above zero is
/// only valid for the serverless deployment mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficSpec {
    pub canary_traffic_percent: u32,
    pub deployment_mode: DeploymentMode,
}

impl Default for TrafficSpec {
    fn default() -> Self {
        Self {
            canary_traffic_percent: 0,
            deployment_mode: DeploymentMode::Serverless,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoscalingSpec {
    pub min_replicas: u32,
    pub max_replicas: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_concurrency: Option<u32>,
}

impl Default for AutoscalingSpec {
    fn default() -> Self {
        Self {
            min_replicas: 0,
            max_replicas: 1,
            target_concurrency: None,
        }
    }
}

/// Runtime-specific knobs, passed through to the serving resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

/// A serving deployment intent. The API writes the desired state; the
/// deploy worker reconciles it into a serving resource and reports
/// `status`/`url` back into the row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointIntent {
    pub endpoint_id: Uuid,
    pub tenant_id: Uuid,
    pub project_id: Uuid,

    /// Unique per (tenant, project). Soft deletion renames the row to
    /// release the name.
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

impl EndpointIntent {
    pub fn new_creating(
        tenant_id: Uuid,
        project_id: Uuid,
        name: String,
        runtime: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            endpoint_id: Uuid::new_v4(),
            tenant_id,
            project_id,
            name,
            status: EndpointStatus::Creating,
            url: None,
            runtime,
            model_version_id: None,
            artifact_uri: None,
            traffic: TrafficSpec::default(),
            autoscaling: AutoscalingSpec::default(),
            runtime_config: RuntimeConfig::default(),
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// The fields whose change requires a re-reconcile of the serving
    /// resource. Tenancy, name and status changes do not count.
    pub fn serving_fields_differ(&self, other: &EndpointIntent) -> bool {
        self.runtime != other.runtime
            || self.model_version_id != other.model_version_id
            || self.artifact_uri != other.artifact_uri
            || self.traffic != other.traffic
            || self.autoscaling != other.autoscaling
            || self.runtime_config != other.runtime_config
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn traffic_spec_uses_camel_case_wire_names() {
        let spec = TrafficSpec {
            canary_traffic_percent: 25,
            deployment_mode: DeploymentMode::Serverless,
        };
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["canaryTrafficPercent"], 25);
        assert_eq!(json["deploymentMode"], "serverless");
    }

    #[test]
    fn serving_field_changes_are_detected() {
        let a = EndpointIntent::new_creating(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "embeddings".to_owned(),
            "sklearn".to_owned(),
        );
        let mut b = a.clone();
        assert!(!a.serving_fields_differ(&b));

        b.status = EndpointStatus::Ready;
        assert!(!a.serving_fields_differ(&b));

        b.traffic.canary_traffic_percent = 10;
        assert!(a.serving_fields_differ(&b));
    }
}
