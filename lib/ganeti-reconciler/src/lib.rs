// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Converges a Ganeti instance toward a declared desired state.
//!
//! A caller describes the instance it wants (attributes, disks, NICs, tags
//! and a requested lifecycle state). The [`Reconciler`] compares that with
//! what the cluster reports through a [`Gateway`], and submits the changes
//! needed to close the gap one job at a time. Each pass is independent: the
//! cluster is the only state.

pub mod engine;
pub mod error;
pub mod gateway;
pub mod lifecycle;
pub mod plan;
pub mod report;
pub mod spec;
pub mod validation;
pub mod waiter;

#[cfg(test)]
mod fake;

pub use engine::Reconciler;
pub use error::ReconcileError;
pub use gateway::{
    Gateway, GatewayError, JobHandle, JobId, JobStatus, PowerStatus,
    PowerTarget, RemoteDisk, RemoteInstanceState, RemoteNic,
};
pub use plan::ChangeOperation;
pub use report::{InvocationOutput, ReconciliationResult};
pub use spec::{InstanceSpec, JobFlags, Options, RawInstanceRequest};
