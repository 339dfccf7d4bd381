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

//! Embedded durable state backend based on sled

use std::path::Path;

use async_trait::async_trait;
use sled_package::{Config, Db};

use crate::error::{PlaneError, Result};
use crate::state::backend::{Keyspace, StateBackend};

/// A [`StateBackend`] over an embedded sled database, one tree per
/// keyspace. sled's native `compare_and_swap` provides the conditional
/// update primitive.
#[derive(Clone)]
pub struct SledBackend {
    db: Db,
}

impl SledBackend {
    pub fn try_new(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            db: sled_package::open(path)?,
        })
    }

    /// A backend over a temporary directory, removed on drop. Test use.
    pub fn try_new_temporary() -> Result<Self> {
        Ok(Self {
            db: Config::new().temporary(true).open()?,
        })
    }

    fn tree(&self, keyspace: Keyspace) -> Result<sled_package::Tree> {
        Ok(self.db.open_tree(keyspace.as_str())?)
    }
}

#[async_trait]
impl StateBackend for SledBackend {
    async fn init(&self) -> Result<()> {
        for keyspace in Keyspace::all() {
            self.tree(*keyspace)?;
        }
        Ok(())
    }

    async fn get(&self, keyspace: Keyspace, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.tree(keyspace)?.get(key)?.map(|v| v.to_vec()))
    }

    async fn scan(&self, keyspace: Keyspace) -> Result<Vec<(String, Vec<u8>)>> {
        let tree = self.tree(keyspace)?;
        let mut rows = Vec::new();
        for entry in tree.iter() {
            let (key, value) = entry?;
            rows.push((String::from_utf8_lossy(&key).into_owned(), value.to_vec()));
        }
        Ok(rows)
    }

    async fn scan_prefix(
        &self,
        keyspace: Keyspace,
        prefix: &str,
    ) -> Result<Vec<(String, Vec<u8>)>> {
        let tree = self.tree(keyspace)?;
        let mut rows = Vec::new();
        for entry in tree.scan_prefix(prefix) {
            let (key, value) = entry?;
            rows.push((String::from_utf8_lossy(&key).into_owned(), value.to_vec()));
        }
        Ok(rows)
    }

    async fn put(&self, keyspace: Keyspace, key: String, value: Vec<u8>) -> Result<()> {
        self.tree(keyspace)?.insert(key.as_bytes(), value)?;
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        keyspace: Keyspace,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<Vec<u8>>,
    ) -> Result<bool> {
        let outcome = self
            .tree(keyspace)?
            .compare_and_swap(key.as_bytes(), expected, new)
            .map_err(|e| PlaneError::TransientStore(format!("sled cas: {e}")))?;
        Ok(outcome.is_ok())
    }

    async fn delete(&self, keyspace: Keyspace, key: &str) -> Result<()> {
        self.tree(keyspace)?.remove(key.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn sled_cas_matches_memory_semantics() {
        let backend = SledBackend::try_new_temporary().unwrap();
        backend.init().await.unwrap();

        assert!(backend
            .compare_and_swap(Keyspace::GpuJobs, "a", None, Some(b"1".to_vec()))
            .await
            .unwrap());
        assert!(!backend
            .compare_and_swap(Keyspace::GpuJobs, "a", None, Some(b"2".to_vec()))
            .await
            .unwrap());
        assert!(backend
            .compare_and_swap(
                Keyspace::GpuJobs,
                "a",
                Some(b"1".as_ref()),
                Some(b"2".to_vec()),
            )
            .await
            .unwrap());
        assert_eq!(
            backend.get(Keyspace::GpuJobs, "a").await.unwrap(),
            Some(b"2".to_vec())
        );

        // conditional delete
        assert!(backend
            .compare_and_swap(Keyspace::GpuJobs, "a", Some(b"2".as_ref()), None)
            .await
            .unwrap());
        assert_eq!(backend.get(Keyspace::GpuJobs, "a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn rows_survive_a_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        {
            let backend = SledBackend::try_new(dir.path()).unwrap();
            backend.init().await.unwrap();
            backend
                .put(Keyspace::UsageLedger, "r1".to_owned(), b"row".to_vec())
                .await
                .unwrap();
            backend.db.flush().unwrap();
        }

        let reopened = SledBackend::try_new(dir.path()).unwrap();
        assert_eq!(
            reopened.get(Keyspace::UsageLedger, "r1").await.unwrap(),
            Some(b"row".to_vec())
        );
    }
}
