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

//! In-memory state backend for development and tests

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::Result;
use crate::state::backend::{Keyspace, StateBackend};

type Tree = BTreeMap<String, Vec<u8>>;

/// A process-local [`StateBackend`]. All operations take a single lock,
/// which makes `compare_and_swap` trivially atomic.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    trees: Arc<RwLock<HashMap<Keyspace, Tree>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateBackend for MemoryBackend {
    async fn init(&self) -> Result<()> {
        let mut trees = self.trees.write();
        for keyspace in Keyspace::all() {
            trees.entry(*keyspace).or_default();
        }
        Ok(())
    }

    async fn get(&self, keyspace: Keyspace, key: &str) -> Result<Option<Vec<u8>>> {
        let trees = self.trees.read();
        Ok(trees
            .get(&keyspace)
            .and_then(|tree| tree.get(key))
            .cloned())
    }

    async fn scan(&self, keyspace: Keyspace) -> Result<Vec<(String, Vec<u8>)>> {
        let trees = self.trees.read();
        Ok(trees
            .get(&keyspace)
            .map(|tree| {
                tree.iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn scan_prefix(
        &self,
        keyspace: Keyspace,
        prefix: &str,
    ) -> Result<Vec<(String, Vec<u8>)>> {
        let trees = self.trees.read();
        Ok(trees
            .get(&keyspace)
            .map(|tree| {
                tree.range(prefix.to_owned()..)
                    .take_while(|(k, _)| k.starts_with(prefix))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn put(&self, keyspace: Keyspace, key: String, value: Vec<u8>) -> Result<()> {
        let mut trees = self.trees.write();
        trees.entry(keyspace).or_default().insert(key, value);
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        keyspace: Keyspace,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<Vec<u8>>,
    ) -> Result<bool> {
        let mut trees = self.trees.write();
        let tree = trees.entry(keyspace).or_default();
        let current = tree.get(key).map(|v| v.as_slice());
        if current != expected {
            return Ok(false);
        }
        match new {
            Some(value) => {
                tree.insert(key.to_owned(), value);
            }
            None => {
                tree.remove(key);
            }
        }
        Ok(true)
    }

    async fn delete(&self, keyspace: Keyspace, key: &str) -> Result<()> {
        let mut trees = self.trees.write();
        if let Some(tree) = trees.get_mut(&keyspace) {
            tree.remove(key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn cas_insert_succeeds_only_once() {
        let backend = MemoryBackend::new();
        backend.init().await.unwrap();

        let won = backend
            .compare_and_swap(Keyspace::GpuJobs, "a", None, Some(b"1".to_vec()))
            .await
            .unwrap();
        assert!(won);

        let won = backend
            .compare_and_swap(Keyspace::GpuJobs, "a", None, Some(b"2".to_vec()))
            .await
            .unwrap();
        assert!(!won);
        assert_eq!(
            backend.get(Keyspace::GpuJobs, "a").await.unwrap(),
            Some(b"1".to_vec())
        );
    }

    #[tokio::test]
    async fn cas_swap_requires_current_bytes() {
        let backend = MemoryBackend::new();
        backend.init().await.unwrap();
        backend
            .put(Keyspace::GpuJobs, "a".to_owned(), b"1".to_vec())
            .await
            .unwrap();

        let stale = backend
            .compare_and_swap(
                Keyspace::GpuJobs,
                "a",
                Some(b"0".as_ref()),
                Some(b"2".to_vec()),
            )
            .await
            .unwrap();
        assert!(!stale);

        let won = backend
            .compare_and_swap(
                Keyspace::GpuJobs,
                "a",
                Some(b"1".as_ref()),
                Some(b"2".to_vec()),
            )
            .await
            .unwrap();
        assert!(won);
    }

    #[tokio::test]
    async fn scan_prefix_is_bounded() {
        let backend = MemoryBackend::new();
        backend.init().await.unwrap();
        for key in ["t1/a", "t1/b", "t2/a"] {
            backend
                .put(Keyspace::Endpoints, key.to_owned(), b"x".to_vec())
                .await
                .unwrap();
        }
        let rows = backend
            .scan_prefix(Keyspace::Endpoints, "t1/")
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
    }
}
