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

pub mod memory;
#[cfg(feature = "sled")]
pub mod sled;

use async_trait::async_trait;

use crate::error::Result;

/// The durable tables of the control plane. Each keyspace is an
/// independent ordered map of `String` key to serialized row bytes.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Keyspace {
    GpuJobs,
    TenantGpuPolicies,
    IdempotencyKeys,
    Endpoints,
    UsageLedger,
    Meta,
}

impl Keyspace {
    pub fn as_str(&self) -> &'static str {
        match self {
            Keyspace::GpuJobs => "gpu_jobs",
            Keyspace::TenantGpuPolicies => "tenant_gpu_policies",
            Keyspace::IdempotencyKeys => "idempotency_keys",
            Keyspace::Endpoints => "endpoints",
            Keyspace::UsageLedger => "usage_ledger",
            Keyspace::Meta => "meta",
        }
    }

    pub fn all() -> &'static [Keyspace] {
        &[
            Keyspace::GpuJobs,
            Keyspace::TenantGpuPolicies,
            Keyspace::IdempotencyKeys,
            Keyspace::Endpoints,
            Keyspace::UsageLedger,
            Keyspace::Meta,
        ]
    }
}

/// A key/value interface for persisting control plane state, with the one
/// primitive all state transitions rely on: a row-level conditional
/// update (`compare_and_swap`).
///
/// Every component treats the backend as the source of truth; in-process
/// caches are never authoritative. Multiple scheduler replicas are safe
/// because the `QUEUED -> DISPATCHED` transition is serialized here.
#[async_trait]
pub trait StateBackend: Send + Sync {
    /// Prepare the backend for use (open trees, warm caches). Called once
    /// at boot before migrations run.
    async fn init(&self) -> Result<()>;

    /// Retrieve the row stored under `key`, or `None` if absent.
    async fn get(&self, keyspace: Keyspace, key: &str) -> Result<Option<Vec<u8>>>;

    /// Retrieve all rows in a keyspace in key order.
    async fn scan(&self, keyspace: Keyspace) -> Result<Vec<(String, Vec<u8>)>>;

    /// Retrieve all rows whose key starts with `prefix`, in key order.
    async fn scan_prefix(
        &self,
        keyspace: Keyspace,
        prefix: &str,
    ) -> Result<Vec<(String, Vec<u8>)>>;

    /// Save `value` under `key`, overwriting any previous row.
    async fn put(&self, keyspace: Keyspace, key: String, value: Vec<u8>) -> Result<()>;

    /// Atomic conditional update. The swap is applied only if the current
    /// row bytes equal `expected` (`None` meaning the key must be
    /// absent); `new = None` deletes the row. Returns whether the swap
    /// was applied. A `false` return is the "zero rows affected" signal:
    /// another writer won the race and the caller must re-read.
    async fn compare_and_swap(
        &self,
        keyspace: Keyspace,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<Vec<u8>>,
    ) -> Result<bool>;

    /// Permanently delete a row.
    async fn delete(&self, keyspace: Keyspace, key: &str) -> Result<()>;
}
