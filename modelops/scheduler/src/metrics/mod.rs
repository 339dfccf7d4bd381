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

#[cfg(feature = "prometheus-metrics")]
pub mod prometheus;

use std::sync::Arc;

/// Collects metrics from the scheduler and the jobs API.
pub trait SchedulerMetricsCollector: Send + Sync {
    /// A job was accepted into the queue
    fn record_submitted(&self, job_id: &str);
    /// A job moved `QUEUED -> DISPATCHED`; `queued_millis` is the time it
    /// waited in the queue
    fn record_dispatched(&self, job_id: &str, queued_millis: u64);
    /// An orphaned dispatch was reverted to `QUEUED`
    fn record_reverted(&self, job_id: &str);
    /// A job was failed by the scheduler (dispatch timed out for good)
    fn record_dispatch_failed(&self, job_id: &str);
    /// Current number of `QUEUED` jobs
    fn set_queued_jobs(&self, value: u64);
}

/// Default collector which ignores all metrics
#[derive(Default)]
pub struct NoopMetricsCollector {}

impl SchedulerMetricsCollector for NoopMetricsCollector {
    fn record_submitted(&self, _job_id: &str) {}
    fn record_dispatched(&self, _job_id: &str, _queued_millis: u64) {}
    fn record_reverted(&self, _job_id: &str) {}
    fn record_dispatch_failed(&self, _job_id: &str) {}
    fn set_queued_jobs(&self, _value: u64) {}
}

/// The collector binaries should use: Prometheus when compiled in,
/// otherwise a no-op.
pub fn default_metrics_collector(
) -> modelops_core::error::Result<Arc<dyn SchedulerMetricsCollector>> {
    #[cfg(feature = "prometheus-metrics")]
    {
        self::prometheus::PrometheusMetricsCollector::current()
    }
    #[cfg(not(feature = "prometheus-metrics"))]
    {
        Ok(Arc::new(NoopMetricsCollector::default()))
    }
}
