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

//! Kubernetes orchestration plane clients
//!
//! Compute units are batch/v1 Jobs running the one-shot executor binary;
//! serving resources are KServe InferenceServices applied through the
//! dynamic API.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, PodSpec, PodTemplateSpec, ResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::Client;
use log::info;

use modelops_core::error::{PlaneError, Result};
use modelops_core::model::DeploymentMode;

use crate::orchestrator::{ServingClient, ServingSpec, ServingState, UnitLauncher, UnitSpec};

/// Environment passed through from the worker to launched units so the
/// executor binary sees the same store and executor settings.
const PASSTHROUGH_ENV: &[&str] = &[
    "STATE_STORE_URL",
    "EVENT_BUS_URL",
    "GPU_EXECUTOR",
    "GPU_SIMULATE_SECONDS",
    "HTTP_TIMEOUT_SECONDS",
    "RUST_LOG",
];

fn kube_error(context: &str, e: kube::Error) -> PlaneError {
    PlaneError::Internal(format!("{context}: {e}"))
}

pub struct KubernetesUnitLauncher {
    jobs: Api<Job>,
    namespace: String,
    executor_image: String,
}

impl KubernetesUnitLauncher {
    pub async fn try_new(namespace: String, executor_image: String) -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| kube_error("connecting to kubernetes", e))?;
        let jobs = Api::namespaced(client, &namespace);
        Ok(Self {
            jobs,
            namespace,
            executor_image,
        })
    }

    fn build_job(&self, unit: &UnitSpec) -> Job {
        let mut labels = BTreeMap::new();
        labels.insert("app".to_owned(), "modelops-executor".to_owned());
        labels.insert("gpu-job-id".to_owned(), unit.job_id.to_string());
        labels.insert("gpu-pool".to_owned(), unit.pool.to_string());

        let mut env = vec![
            EnvVar {
                name: "JOB_ID".to_owned(),
                value: Some(unit.job_id.to_string()),
                ..Default::default()
            },
            EnvVar {
                name: "DISPATCH_TOKEN".to_owned(),
                value: Some(unit.dispatch_token.to_string()),
                ..Default::default()
            },
        ];
        for name in PASSTHROUGH_ENV {
            if let Ok(value) = std::env::var(name) {
                env.push(EnvVar {
                    name: (*name).to_owned(),
                    value: Some(value),
                    ..Default::default()
                });
            }
        }

        let mut limits = BTreeMap::new();
        limits.insert(unit.gpu_resource_name.clone(), Quantity("1".to_owned()));

        let container = Container {
            name: "executor".to_owned(),
            image: Some(self.executor_image.clone()),
            command: Some(vec!["modelops-executor".to_owned()]),
            env: Some(env),
            resources: Some(ResourceRequirements {
                limits: Some(limits),
                ..Default::default()
            }),
            ..Default::default()
        };

        Job {
            metadata: ObjectMeta {
                // the token makes the name unique per dispatch attempt
                name: Some(format!("gpu-job-{}", unit.dispatch_token)),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels),
                ..Default::default()
            },
            spec: Some(JobSpec {
                template: PodTemplateSpec {
                    spec: Some(PodSpec {
                        containers: vec![container],
                        restart_policy: Some("Never".to_owned()),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                // the scheduler owns retries via redispatch
                backoff_limit: Some(0),
                ttl_seconds_after_finished: Some(unit.ttl.as_secs() as i32),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

#[async_trait]
impl UnitLauncher for KubernetesUnitLauncher {
    async fn launch(&self, unit: &UnitSpec) -> Result<()> {
        let job = self.build_job(unit);
        self.jobs
            .create(&PostParams::default(), &job)
            .await
            .map_err(|e| kube_error("creating compute unit", e))?;
        info!(
            "Launched unit gpu-job-{} for job {} ({})",
            unit.dispatch_token, unit.job_id, unit.gpu_resource_name
        );
        Ok(())
    }
}

pub struct KubernetesServingClient {
    api: Api<DynamicObject>,
    resource: ApiResource,
}

impl KubernetesServingClient {
    pub async fn try_new(namespace: String) -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| kube_error("connecting to kubernetes", e))?;
        let gvk = GroupVersionKind::gvk("serving.kserve.io", "v1beta1", "InferenceService");
        let resource = ApiResource::from_gvk(&gvk);
        let api = Api::namespaced_with(client, &namespace, &resource);
        Ok(Self { api, resource })
    }

    fn render(&self, spec: &ServingSpec) -> DynamicObject {
        let deployment_mode = match spec.deployment_mode {
            DeploymentMode::Serverless => "Serverless",
            DeploymentMode::RawDeployment => "RawDeployment",
        };
        let mut annotations = BTreeMap::new();
        annotations.insert(
            "serving.kserve.io/deploymentMode".to_owned(),
            deployment_mode.to_owned(),
        );

        let mut object = DynamicObject::new(&spec.name, &self.resource);
        object.metadata.annotations = Some(annotations);
        object.data = serde_json::json!({
            "spec": {
                "predictor": {
                    "minReplicas": spec.min_replicas,
                    "maxReplicas": spec.max_replicas,
                    "canaryTrafficPercent": spec.canary_traffic_percent,
                    "model": {
                        "modelFormat": {
                            "name": spec.model_format.clone()
                                .unwrap_or_else(|| spec.runtime.clone()),
                        },
                        "protocolVersion": spec.protocol_version,
                        "storageUri": spec.artifact_uri,
                        "image": spec.image,
                    },
                },
            },
        });
        object
    }
}

#[async_trait]
impl ServingClient for KubernetesServingClient {
    async fn upsert(&self, spec: &ServingSpec) -> Result<()> {
        let object = self.render(spec);
        let params = PatchParams::apply("modelops-deploy-worker").force();
        self.api
            .patch(&spec.name, &params, &Patch::Apply(&object))
            .await
            .map_err(|e| kube_error("applying serving resource", e))?;
        Ok(())
    }

    async fn state(&self, name: &str) -> Result<Option<ServingState>> {
        let object = self
            .api
            .get_opt(name)
            .await
            .map_err(|e| kube_error("reading serving resource", e))?;
        let object = match object {
            Some(object) => object,
            None => return Ok(None),
        };

        let status = &object.data["status"];
        let url = status["url"].as_str().map(str::to_owned);
        let ready = status["conditions"]
            .as_array()
            .map(|conditions| {
                conditions.iter().any(|condition| {
                    condition["type"].as_str() == Some("Ready")
                        && condition["status"].as_str() == Some("True")
                })
            })
            .unwrap_or(false);
        Ok(Some(ServingState { ready, url }))
    }

    async fn delete(&self, name: &str) -> Result<()> {
        match self.api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(kube_error("deleting serving resource", e)),
        }
    }
}
