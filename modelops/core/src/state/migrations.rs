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

//! Boot-time state migrations
//!
//! Named steps applied in lexicographic order; applied names are recorded
//! in the `Meta` keyspace so re-running at every boot is a no-op. New
//! steps must sort after all existing ones.

use futures::future::BoxFuture;
use log::info;

use crate::error::Result;
use crate::state::backend::{Keyspace, StateBackend};

type MigrationFn = for<'a> fn(&'a dyn StateBackend) -> BoxFuture<'a, Result<()>>;

const MIGRATIONS: &[(&str, MigrationFn)] = &[
    ("0001_initial_keyspaces", initial_keyspaces),
    ("0002_schema_version", schema_version),
];

fn applied_key(name: &str) -> String {
    format!("migration/{name}")
}

/// Apply all pending migrations, in lexicographic name order.
pub async fn run(backend: &dyn StateBackend) -> Result<()> {
    let mut ordered: Vec<(&str, MigrationFn)> = MIGRATIONS.to_vec();
    ordered.sort_by_key(|(name, _)| *name);

    for (name, apply) in ordered {
        let key = applied_key(name);
        if backend.get(Keyspace::Meta, &key).await?.is_some() {
            continue;
        }
        apply(backend).await?;
        backend
            .put(Keyspace::Meta, key, b"applied".to_vec())
            .await?;
        info!("Applied state migration {name}");
    }
    Ok(())
}

fn initial_keyspaces(backend: &dyn StateBackend) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move { backend.init().await })
}

fn schema_version(backend: &dyn StateBackend) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        backend
            .put(Keyspace::Meta, "schema_version".to_owned(), b"1".to_vec())
            .await
    })
}
