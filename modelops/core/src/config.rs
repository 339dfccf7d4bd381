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

//! Environment configuration helpers and connection URLs

use std::env;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use log::warn;

use crate::error::{PlaneError, Result};
use crate::state::backend::memory::MemoryBackend;
#[cfg(feature = "sled")]
use crate::state::backend::sled::SledBackend;
use crate::state::backend::StateBackend;

/// Read an envvar, falling back to `default` when unset or unparsable.
/// A value that fails to parse is logged and ignored rather than
/// aborting boot.
pub fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!("Ignoring unparsable {name}={raw}");
                default
            }
        },
        Err(_) => default,
    }
}

pub fn env_duration_secs(name: &str, default_secs: u64) -> Duration {
    Duration::from_secs(env_parse(name, default_secs))
}

pub fn env_string(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_owned())
}

/// Where the durable store lives. `memory:` is process-local;
/// `sled:<path>` is an embedded durable database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreUrl {
    Memory,
    Sled(String),
}

impl StoreUrl {
    pub fn parse(raw: &str) -> Result<Self> {
        if raw == "memory:" || raw == "memory" {
            return Ok(StoreUrl::Memory);
        }
        if let Some(path) = raw.strip_prefix("sled:") {
            if path.is_empty() {
                return Err(PlaneError::Validation(
                    "sled store url is missing a path".to_owned(),
                ));
            }
            return Ok(StoreUrl::Sled(path.to_owned()));
        }
        Err(PlaneError::Validation(format!(
            "unsupported state store url '{raw}'"
        )))
    }

    pub fn from_env() -> Result<Self> {
        Self::parse(&env_string("STATE_STORE_URL", "memory:"))
    }

    /// Open the backend this URL points at.
    pub fn open(&self) -> Result<Arc<dyn StateBackend>> {
        match self {
            StoreUrl::Memory => Ok(Arc::new(MemoryBackend::new())),
            #[cfg(feature = "sled")]
            StoreUrl::Sled(path) => Ok(Arc::new(SledBackend::try_new(path)?)),
            #[cfg(not(feature = "sled"))]
            StoreUrl::Sled(_) => Err(PlaneError::Validation(
                "built without the sled feature".to_owned(),
            )),
        }
    }
}

/// Where the event bus lives. Only the in-process bus ships in-tree;
/// the variant exists so a durable backend slots in without touching
/// call sites.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusUrl {
    Memory,
}

impl BusUrl {
    pub fn parse(raw: &str) -> Result<Self> {
        if raw == "memory:" || raw == "memory" {
            return Ok(BusUrl::Memory);
        }
        Err(PlaneError::Validation(format!(
            "unsupported event bus url '{raw}'"
        )))
    }

    pub fn from_env() -> Result<Self> {
        Self::parse(&env_string("EVENT_BUS_URL", "memory:"))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn store_urls_parse() {
        assert_eq!(StoreUrl::parse("memory:").unwrap(), StoreUrl::Memory);
        assert_eq!(
            StoreUrl::parse("sled:/var/lib/modelops").unwrap(),
            StoreUrl::Sled("/var/lib/modelops".to_owned())
        );
        assert!(StoreUrl::parse("postgres://x").is_err());
        assert!(StoreUrl::parse("sled:").is_err());
    }

    #[test]
    fn env_parse_falls_back_on_garbage() {
        std::env::set_var("MODELOPS_TEST_SLOTS", "not-a-number");
        assert_eq!(env_parse("MODELOPS_TEST_SLOTS", 8u32), 8);
        std::env::remove_var("MODELOPS_TEST_SLOTS");
    }
}
