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
//

//! Worker and executor configuration

use std::str::FromStr;
use std::time::Duration;

use modelops_core::config::{env_duration_secs, env_parse, env_string};

/// How dispatch events turn into executor runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Run the executor logic in-process (dev)
    Direct,
    /// Launch an ephemeral compute unit per job
    Ephemeral,
}

impl FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "direct" => Ok(ExecutionMode::Direct),
            "ephemeral" => Ok(ExecutionMode::Ephemeral),
            other => Err(format!("unknown execution mode '{other}'")),
        }
    }
}

/// What the executor does for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorKind {
    /// Sleep for a configured duration and synthesize a response
    Simulate,
    /// POST the job's request_json to its target_url
    Http,
}

impl FromStr for ExecutorKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "simulate" => Ok(ExecutorKind::Simulate),
            "http" => Ok(ExecutorKind::Http),
            other => Err(format!("unknown executor kind '{other}'")),
        }
    }
}

/// How the deploy worker realizes endpoint intents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployMode {
    /// Mark intents READY with a synthetic url
    Simulate,
    /// Render and upsert a serving resource, then poll it
    Reconcile,
}

impl FromStr for DeployMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "simulate" => Ok(DeployMode::Simulate),
            "reconcile" => Ok(DeployMode::Reconcile),
            other => Err(format!("unknown deploy mode '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub execution_mode: ExecutionMode,
    pub executor: ExecutorKind,
    pub deploy_mode: DeployMode,
    /// Timeout for the executor's outbound POST
    pub http_timeout: Duration,
    /// Budget for one endpoint reconcile, polling included
    pub deploy_timeout: Duration,
    pub deploy_poll_interval: Duration,
    /// Kubernetes resource the compute unit requests, e.g.
    /// `nvidia.com/gpu` or `nvidia.com/mig-1g.5gb`
    pub gpu_resource_name: String,
    /// Simulated work duration for `ExecutorKind::Simulate`
    pub simulate_duration: Duration,
    /// Deliveries after which a failing dispatch message gives up
    pub redelivery_cap: u32,
    /// TTL for launched compute units
    pub unit_ttl: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            execution_mode: ExecutionMode::Direct,
            executor: ExecutorKind::Simulate,
            deploy_mode: DeployMode::Simulate,
            http_timeout: Duration::from_secs(60),
            deploy_timeout: Duration::from_secs(300),
            deploy_poll_interval: Duration::from_secs(2),
            gpu_resource_name: "nvidia.com/gpu".to_owned(),
            simulate_duration: Duration::from_secs(1),
            redelivery_cap: 5,
            unit_ttl: Duration::from_secs(3600),
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            execution_mode: env_parse("GPU_EXECUTION_MODE", defaults.execution_mode),
            executor: env_parse("GPU_EXECUTOR", defaults.executor),
            deploy_mode: env_parse("DEPLOY_MODE", defaults.deploy_mode),
            http_timeout: env_duration_secs("HTTP_TIMEOUT_SECONDS", 60),
            deploy_timeout: env_duration_secs("DEPLOY_TIMEOUT_SECONDS", 300),
            deploy_poll_interval: env_duration_secs(
                "DEPLOY_POLL_INTERVAL_SECONDS",
                2,
            ),
            gpu_resource_name: env_string("GPU_RESOURCE_NAME", "nvidia.com/gpu"),
            simulate_duration: env_duration_secs("GPU_SIMULATE_SECONDS", 1),
            redelivery_cap: env_parse(
                "DISPATCH_REDELIVERY_CAP",
                defaults.redelivery_cap,
            ),
            unit_ttl: env_duration_secs("UNIT_TTL_SECONDS", 3600),
        }
    }

    pub fn with_execution_mode(mut self, mode: ExecutionMode) -> Self {
        self.execution_mode = mode;
        self
    }

    pub fn with_executor(mut self, kind: ExecutorKind) -> Self {
        self.executor = kind;
        self
    }

    pub fn with_deploy_mode(mut self, mode: DeployMode) -> Self {
        self.deploy_mode = mode;
        self
    }

    pub fn with_simulate_duration(mut self, duration: Duration) -> Self {
        self.simulate_duration = duration;
        self
    }

    pub fn with_deploy_timeout(mut self, timeout: Duration) -> Self {
        self.deploy_timeout = timeout;
        self
    }

    pub fn with_deploy_poll_interval(mut self, interval: Duration) -> Self {
        self.deploy_poll_interval = interval;
        self
    }

    pub fn with_redelivery_cap(mut self, cap: u32) -> Self {
        self.redelivery_cap = cap;
        self
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn modes_parse_case_insensitively() {
        assert_eq!(
            "Ephemeral".parse::<ExecutionMode>().unwrap(),
            ExecutionMode::Ephemeral
        );
        assert_eq!("HTTP".parse::<ExecutorKind>().unwrap(), ExecutorKind::Http);
        assert_eq!(
            "reconcile".parse::<DeployMode>().unwrap(),
            DeployMode::Reconcile
        );
        assert!("warp-drive".parse::<ExecutionMode>().is_err());
    }
}
