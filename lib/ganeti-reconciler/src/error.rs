// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Errors that end a reconciliation pass.
//!
//! Every error is fatal to the pass that raised it. None of them are retried
//! and none trigger compensating actions; operations that completed before the
//! error stay applied on the cluster.

use std::time::Duration;

use thiserror::Error;

use crate::spec::LifecycleState;

#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The desired state was malformed. Raised before any remote call.
    #[error("invalid instance specification: {0}")]
    Validation(String),

    /// The instance must exist for the requested state but does not.
    #[error("instance {name} is not present, cannot set it to {state}")]
    NotFound { name: String, state: LifecycleState },

    /// The instance exists but is in a state that forbids the request.
    #[error("instance {name}: {reason}")]
    Precondition { name: String, reason: String },

    #[error(
        "instance {name}: disk {index} cannot shrink from {actual_mib} MiB \
        to {desired_mib} MiB"
    )]
    UnsupportedShrink {
        name: String,
        index: usize,
        actual_mib: u64,
        desired_mib: u64,
    },

    #[error("instance {name}: unsupported change: {reason}")]
    UnsupportedChange { name: String, reason: String },

    /// The control plane refused a request or a job ended in failure.
    #[error("{context}: {message}")]
    Remote { context: String, message: String },

    #[error("{context}: job {job} did not finish within {timeout:?}")]
    TimedOut { context: String, job: String, timeout: Duration },
}

impl ReconcileError {
    /// A stable name for the error class, reported alongside the message.
    pub fn kind(&self) -> &'static str {
        match self {
            ReconcileError::Validation(_) => "ValidationError",
            ReconcileError::NotFound { .. } => "NotFoundError",
            ReconcileError::Precondition { .. } => "PreconditionError",
            ReconcileError::UnsupportedShrink { .. } => {
                "UnsupportedShrinkError"
            }
            ReconcileError::UnsupportedChange { .. } => {
                "UnsupportedChangeError"
            }
            ReconcileError::Remote { .. } => "RemoteError",
            ReconcileError::TimedOut { .. } => "TimedOutError",
        }
    }

    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        ReconcileError::Validation(msg.into())
    }
}
