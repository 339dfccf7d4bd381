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

use crate::metrics::SchedulerMetricsCollector;
use modelops_core::error::{PlaneError, Result};
use once_cell::sync::OnceCell;
use prometheus::{
    register_counter_with_registry, register_gauge_with_registry,
    register_histogram_with_registry, Counter, Gauge, Histogram, Registry,
};
use prometheus::{Encoder, TextEncoder};
use std::sync::Arc;

use warp::http::header::CONTENT_TYPE;
use warp::Reply;

static COLLECTOR: OnceCell<Arc<dyn SchedulerMetricsCollector>> = OnceCell::new();

pub struct PrometheusMetricsCollector {
    queue_time: Histogram,
    submitted: Counter,
    dispatched: Counter,
    reverted: Counter,
    dispatch_failed: Counter,
    queued_jobs: Gauge,
}

impl PrometheusMetricsCollector {
    pub fn new(registry: &Registry) -> Result<Self> {
        let queue_time = register_histogram_with_registry!(
            "gpu_job_queue_time_seconds",
            "Histogram of time jobs spend in QUEUED before dispatch",
            vec![0.5_f64, 1_f64, 5_f64, 30_f64, 120_f64, 600_f64],
            registry
        )
        .map_err(|e| {
            PlaneError::Internal(format!("Error registering metric: {e:?}"))
        })?;

        let submitted = register_counter_with_registry!(
            "gpu_jobs_submitted_total",
            "Counter of submitted GPU jobs",
            registry
        )
        .map_err(|e| {
            PlaneError::Internal(format!("Error registering metric: {e:?}"))
        })?;

        let dispatched = register_counter_with_registry!(
            "gpu_jobs_dispatched_total",
            "Counter of dispatched GPU jobs",
            registry
        )
        .map_err(|e| {
            PlaneError::Internal(format!("Error registering metric: {e:?}"))
        })?;

        let reverted = register_counter_with_registry!(
            "gpu_jobs_reverted_total",
            "Counter of orphaned dispatches reverted to QUEUED",
            registry
        )
        .map_err(|e| {
            PlaneError::Internal(format!("Error registering metric: {e:?}"))
        })?;

        let dispatch_failed = register_counter_with_registry!(
            "gpu_jobs_dispatch_failed_total",
            "Counter of jobs failed after exhausting dispatch attempts",
            registry
        )
        .map_err(|e| {
            PlaneError::Internal(format!("Error registering metric: {e:?}"))
        })?;

        let queued_jobs = register_gauge_with_registry!(
            "gpu_jobs_queued",
            "Number of jobs currently QUEUED",
            registry
        )
        .map_err(|e| {
            PlaneError::Internal(format!("Error registering metric: {e:?}"))
        })?;

        Ok(Self {
            queue_time,
            submitted,
            dispatched,
            reverted,
            dispatch_failed,
            queued_jobs,
        })
    }

    pub fn current() -> Result<Arc<dyn SchedulerMetricsCollector>> {
        COLLECTOR
            .get_or_try_init(|| {
                let collector = Self::new(::prometheus::default_registry())?;

                Ok(Arc::new(collector) as Arc<dyn SchedulerMetricsCollector>)
            })
            .map(|arc| arc.clone())
    }
}

impl SchedulerMetricsCollector for PrometheusMetricsCollector {
    fn record_submitted(&self, _job_id: &str) {
        self.submitted.inc();
    }

    fn record_dispatched(&self, _job_id: &str, queued_millis: u64) {
        self.dispatched.inc();
        self.queue_time.observe(queued_millis as f64 / 1000_f64);
    }

    fn record_reverted(&self, _job_id: &str) {
        self.reverted.inc();
    }

    fn record_dispatch_failed(&self, _job_id: &str) {
        self.dispatch_failed.inc();
    }

    fn set_queued_jobs(&self, value: u64) {
        self.queued_jobs.set(value as f64);
    }
}

pub fn get_metrics() -> Result<impl Reply> {
    let encoder = TextEncoder::new();

    let metric_families = prometheus::gather();
    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer).map_err(|e| {
        PlaneError::Internal(format!("Error encoding prometheus metrics: {e:?}"))
    })?;

    Ok(warp::reply::with_header(
        buffer,
        CONTENT_TYPE,
        encoder.format_type(),
    ))
}
