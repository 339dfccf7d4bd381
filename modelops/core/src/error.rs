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

//! Error types shared across the control plane

use std::error::Error;
use std::fmt::{Display, Formatter};
use std::io;
use std::result;

pub type Result<T> = result::Result<T, PlaneError>;

/// Control plane error. Variants mirror the error taxonomy of the HTTP
/// surface and the async workers: client-visible kinds map to 4xx,
/// transient infrastructure kinds are retried internally and surface as
/// 5xx only after exhaustion, and worker-internal kinds are written into
/// the owning row as a terminal `error` string instead of being raised.
#[derive(Debug)]
pub enum PlaneError {
    /// Malformed request fields
    Validation(String),
    /// Missing or invalid tenancy headers
    TenancyDenied(String),
    /// Same idempotency key re-used with a different request body
    IdempotencyConflict(String),
    /// Per-tenant admission limit hit
    QuotaExceeded(String),
    /// Referenced entity does not exist
    NotFound(String),
    /// Retriable state-store fault
    TransientStore(String),
    /// Retriable event-bus fault
    TransientBus(String),
    /// Deploy worker could not produce a healthy serving resource
    ReconcileFailed(String),
    Internal(String),
    IoError(io::Error),
    SerdeError(serde_json::Error),
}

impl PlaneError {
    /// Stable machine-readable code for API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            PlaneError::Validation(_) => "VALIDATION",
            PlaneError::TenancyDenied(_) => "TENANCY_DENIED",
            PlaneError::IdempotencyConflict(_) => "IDEMPOTENCY_CONFLICT",
            PlaneError::QuotaExceeded(_) => "QUOTA_EXCEEDED",
            PlaneError::NotFound(_) => "NOT_FOUND",
            PlaneError::TransientStore(_) => "TRANSIENT_STORE",
            PlaneError::TransientBus(_) => "TRANSIENT_BUS",
            PlaneError::ReconcileFailed(_) => "RECONCILE_FAILED",
            PlaneError::Internal(_) => "INTERNAL",
            PlaneError::IoError(_) => "IO",
            PlaneError::SerdeError(_) => "SERDE",
        }
    }

    /// Whether a bounded in-component retry is worthwhile.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PlaneError::TransientStore(_) | PlaneError::TransientBus(_)
        )
    }
}

impl From<io::Error> for PlaneError {
    fn from(e: io::Error) -> Self {
        PlaneError::IoError(e)
    }
}

impl From<serde_json::Error> for PlaneError {
    fn from(e: serde_json::Error) -> Self {
        PlaneError::SerdeError(e)
    }
}

#[cfg(feature = "sled")]
impl From<sled_package::Error> for PlaneError {
    fn from(e: sled_package::Error) -> Self {
        PlaneError::TransientStore(format!("sled error: {e}"))
    }
}

impl Display for PlaneError {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            PlaneError::Validation(desc) => write!(f, "Validation error: {desc}"),
            PlaneError::TenancyDenied(desc) => write!(f, "Tenancy denied: {desc}"),
            PlaneError::IdempotencyConflict(desc) => {
                write!(f, "Idempotency conflict: {desc}")
            }
            PlaneError::QuotaExceeded(desc) => write!(f, "Quota exceeded: {desc}"),
            PlaneError::NotFound(desc) => write!(f, "Not found: {desc}"),
            PlaneError::TransientStore(desc) => {
                write!(f, "Transient store error: {desc}")
            }
            PlaneError::TransientBus(desc) => write!(f, "Transient bus error: {desc}"),
            PlaneError::ReconcileFailed(desc) => write!(f, "Reconcile failed: {desc}"),
            PlaneError::Internal(desc) => write!(f, "Internal error: {desc}"),
            PlaneError::IoError(e) => write!(f, "IO error: {e}"),
            PlaneError::SerdeError(e) => write!(f, "Serde error: {e}"),
        }
    }
}

impl Error for PlaneError {}

#[cfg(test)]
mod test {
    use super::PlaneError;

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(PlaneError::Validation("x".to_owned()).code(), "VALIDATION");
        assert_eq!(
            PlaneError::QuotaExceeded("x".to_owned()).code(),
            "QUOTA_EXCEEDED"
        );
        assert_eq!(
            PlaneError::IdempotencyConflict("x".to_owned()).code(),
            "IDEMPOTENCY_CONFLICT"
        );
    }

    #[test]
    fn transient_kinds() {
        assert!(PlaneError::TransientStore("x".to_owned()).is_transient());
        assert!(PlaneError::TransientBus("x".to_owned()).is_transient());
        assert!(!PlaneError::Validation("x".to_owned()).is_transient());
    }
}
