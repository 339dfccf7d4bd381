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

//! First-class idempotency records
//!
//! A write carrying an `Idempotency-Key` is at-most-once within its
//! `(tenant, project, method, path, idem_key)` scope. Concurrent
//! identical POSTs race to insert the record; the loser reads the
//! winner's snapshot and replays it byte-for-byte. A divergent request
//! hash under the same key is a conflict, never a replay.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{PlaneError, Result};
use crate::state::backend::{Keyspace, StateBackend};
use crate::state::{decode_row, encode_row};

/// Scope key of one idempotent write.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyScope {
    pub tenant_id: Uuid,
    pub project_id: Uuid,
    pub method: String,
    pub path: String,
    pub idem_key: String,
}

impl IdempotencyScope {
    pub fn storage_key(&self) -> String {
        format!(
            "{}/{}/{}|{}|{}",
            self.tenant_id, self.project_id, self.method, self.path, self.idem_key
        )
    }
}

/// SHA-256 of the raw request body, hex encoded.
pub fn request_hash(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Serialized snapshot of the winning response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseSnapshot {
    pub status_code: u16,
    pub response_headers: Vec<(String, String)>,
    pub response_body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub request_hash: String,
    /// `None` while the owning request is still executing.
    pub response: Option<ResponseSnapshot>,
    pub expires_at: DateTime<Utc>,
}

/// What `begin` decided for this request.
#[derive(Debug)]
pub enum IdempotencyOutcome {
    /// This request owns the key and must call `complete` when done.
    Owner,
    /// A matching prior request finished; replay its snapshot.
    Replay(ResponseSnapshot),
    /// A matching prior request is still executing.
    InFlight,
}

#[derive(Clone)]
pub struct IdempotencyStore {
    backend: Arc<dyn StateBackend>,
}

impl IdempotencyStore {
    pub fn new(backend: Arc<dyn StateBackend>) -> Self {
        Self { backend }
    }

    /// Claim the scope or resolve it against the existing record.
    /// Expired records are treated as absent.
    pub async fn begin(
        &self,
        scope: &IdempotencyScope,
        request_hash: &str,
        ttl: Duration,
    ) -> Result<IdempotencyOutcome> {
        let key = scope.storage_key();
        let placeholder = IdempotencyRecord {
            request_hash: request_hash.to_owned(),
            response: None,
            expires_at: Utc::now() + ttl,
        };

        loop {
            let existing = self.backend.get(Keyspace::IdempotencyKeys, &key).await?;
            match existing {
                None => {
                    let claimed = self
                        .backend
                        .compare_and_swap(
                            Keyspace::IdempotencyKeys,
                            &key,
                            None,
                            Some(encode_row(&placeholder)?),
                        )
                        .await?;
                    if claimed {
                        return Ok(IdempotencyOutcome::Owner);
                    }
                    // lost the insert race; resolve against the winner
                    continue;
                }
                Some(bytes) => {
                    let record: IdempotencyRecord = decode_row(&bytes)?;
                    if record.expires_at <= Utc::now() {
                        // expired; try to take its place
                        let claimed = self
                            .backend
                            .compare_and_swap(
                                Keyspace::IdempotencyKeys,
                                &key,
                                Some(bytes.as_slice()),
                                Some(encode_row(&placeholder)?),
                            )
                            .await?;
                        if claimed {
                            return Ok(IdempotencyOutcome::Owner);
                        }
                        continue;
                    }
                    if record.request_hash != request_hash {
                        return Err(PlaneError::IdempotencyConflict(format!(
                            "key '{}' was first used with a different request body",
                            scope.idem_key
                        )));
                    }
                    return Ok(match record.response {
                        Some(snapshot) => IdempotencyOutcome::Replay(snapshot),
                        None => IdempotencyOutcome::InFlight,
                    });
                }
            }
        }
    }

    /// Store the owner's response snapshot for future replays.
    pub async fn complete(
        &self,
        scope: &IdempotencyScope,
        request_hash: &str,
        snapshot: ResponseSnapshot,
        ttl: Duration,
    ) -> Result<()> {
        let record = IdempotencyRecord {
            request_hash: request_hash.to_owned(),
            response: Some(snapshot),
            expires_at: Utc::now() + ttl,
        };
        self.backend
            .put(
                Keyspace::IdempotencyKeys,
                scope.storage_key(),
                encode_row(&record)?,
            )
            .await
    }

    /// Release a claimed scope after the owning request failed before
    /// producing a replayable response.
    pub async fn release(&self, scope: &IdempotencyScope) -> Result<()> {
        self.backend
            .delete(Keyspace::IdempotencyKeys, &scope.storage_key())
            .await
    }

    /// Delete expired records. Returns how many were removed.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let rows = self.backend.scan(Keyspace::IdempotencyKeys).await?;
        let mut removed = 0;
        for (key, bytes) in rows {
            let record: IdempotencyRecord = decode_row(&bytes)?;
            if record.expires_at <= now {
                // conditional so a concurrent refresh is not lost
                if self
                    .backend
                    .compare_and_swap(
                        Keyspace::IdempotencyKeys,
                        &key,
                        Some(bytes.as_slice()),
                        None,
                    )
                    .await?
                {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}
