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

//! Scheduler specific configuration

use std::time::Duration;

use modelops_core::config::{env_duration_secs, env_parse};

/// Configuration for the GPU scheduler control loop and the API it
/// serves.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Global T4 shared slot cap. Must equal the device plugin's
    /// time-slicing replica count or the cluster will overcommit.
    pub t4_shared_slots: u32,
    /// Global T4 exclusive slot cap
    pub t4_exclusive_slots: u32,
    /// Global MIG slot cap; zero disables the MIG pool
    pub mig_total_slots: u32,
    /// How long a job may sit in `DISPATCHED` before it is reclaimed
    pub dispatch_timeout: Duration,
    /// How long a job may sit in `RUNNING` before it is failed
    pub execution_timeout: Duration,
    /// Dispatch attempts before a reclaimed job is failed for good
    pub max_dispatch_attempts: u32,
    /// Pause between scheduler ticks
    pub tick_interval: Duration,
    /// How long idempotency records are replayable
    pub idempotency_ttl: Duration,
    /// Pause between idempotency sweep passes
    pub idempotency_sweep_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            t4_shared_slots: 8,
            t4_exclusive_slots: 1,
            mig_total_slots: 0,
            dispatch_timeout: Duration::from_secs(120),
            execution_timeout: Duration::from_secs(3600),
            max_dispatch_attempts: 3,
            tick_interval: Duration::from_secs(2),
            idempotency_ttl: Duration::from_secs(86_400),
            idempotency_sweep_interval: Duration::from_secs(300),
        }
    }
}

impl SchedulerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            t4_shared_slots: env_parse("T4_SHARED_SLOTS", defaults.t4_shared_slots),
            t4_exclusive_slots: env_parse(
                "T4_EXCLUSIVE_SLOTS",
                defaults.t4_exclusive_slots,
            ),
            mig_total_slots: env_parse("MIG_TOTAL_SLOTS", defaults.mig_total_slots),
            dispatch_timeout: env_duration_secs("DISPATCH_TIMEOUT", 120),
            execution_timeout: env_duration_secs("EXECUTION_TIMEOUT", 3600),
            max_dispatch_attempts: env_parse(
                "MAX_DISPATCH_ATTEMPTS",
                defaults.max_dispatch_attempts,
            ),
            tick_interval: env_duration_secs("SCHEDULER_TICK_INTERVAL_SECONDS", 2),
            idempotency_ttl: env_duration_secs("IDEMPOTENCY_TTL_SECONDS", 86_400),
            idempotency_sweep_interval: env_duration_secs(
                "IDEMPOTENCY_SWEEP_INTERVAL_SECONDS",
                300,
            ),
        }
    }

    pub fn with_t4_shared_slots(mut self, slots: u32) -> Self {
        self.t4_shared_slots = slots;
        self
    }

    pub fn with_t4_exclusive_slots(mut self, slots: u32) -> Self {
        self.t4_exclusive_slots = slots;
        self
    }

    pub fn with_mig_total_slots(mut self, slots: u32) -> Self {
        self.mig_total_slots = slots;
        self
    }

    pub fn with_dispatch_timeout(mut self, timeout: Duration) -> Self {
        self.dispatch_timeout = timeout;
        self
    }

    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = timeout;
        self
    }

    pub fn with_max_dispatch_attempts(mut self, attempts: u32) -> Self {
        self.max_dispatch_attempts = attempts;
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }
}
