// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The boundary between the engine and the cluster's control API.
//!
//! Implementations own the wire protocol entirely. Mutating calls only submit
//! work: completion is learned by polling the returned [`JobHandle`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;

use crate::plan::ChangeOperation;
use crate::spec::{InstanceSpec, JobFlags};
use crate::validation::NicMode;

/// Whether the instance is running, as far as the cluster can tell.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerStatus {
    Running,
    Stopped,
    Unknown,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PowerTarget {
    On,
    Off,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RemoteDisk {
    pub size_mib: u64,
    pub name: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RemoteNic {
    pub mode: Option<NicMode>,
    pub name: Option<String>,
    pub link: Option<String>,
    pub ip: Option<String>,
    pub mac: Option<String>,
    pub vlan: Option<u16>,
    pub network: Option<String>,
    pub bridge: Option<String>,
}

/// A snapshot of an instance as fetched at the start of a pass. Never reused
/// across passes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RemoteInstanceState {
    pub name: String,
    /// The cluster's own status string, kept for messages.
    pub status: String,
    pub power: PowerStatus,
    pub memory: Option<u64>,
    pub vcpus: Option<u32>,
    pub disk_template: Option<String>,
    pub disks: Vec<RemoteDisk>,
    pub nics: Vec<RemoteNic>,
    pub os_type: Option<String>,
    pub os_params: BTreeMap<String, String>,
    pub tags: BTreeSet<String>,
    pub hypervisor: Option<String>,
    pub primary_node: Option<String>,
    pub secondary_nodes: Vec<String>,
    pub group: Option<String>,
    /// Jobs known to have recently touched this instance.
    pub recent_jobs: Vec<JobId>,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Tracks the remote work behind one submitted operation.
///
/// Most operations map to one job. A handle may carry several when the
/// control plane splits a single operation into more than one job (tags are
/// added and removed by separate jobs); it is only successful once every one
/// of them is.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobHandle {
    jobs: Vec<JobId>,
    submitted_at: Instant,
}

impl JobHandle {
    pub fn new(job: JobId) -> Self {
        Self::with_jobs(vec![job])
    }

    pub fn with_jobs(jobs: Vec<JobId>) -> Self {
        Self { jobs, submitted_at: Instant::now() }
    }

    pub fn jobs(&self) -> &[JobId] {
        &self.jobs
    }

    pub fn submitted_at(&self) -> Instant {
        self.submitted_at
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids: Vec<&str> = self.jobs.iter().map(JobId::as_str).collect();
        write!(f, "{}", ids.join("+"))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobStatus {
    Running,
    Success,
    Failed(String),
}

/// An error reported by a gateway implementation, flattened to its message.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct GatewayError(String);

impl GatewayError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Reads and mutates instances on the cluster.
///
/// `submit_modify` accepts the attribute-changing operations (rename, vCPUs,
/// memory, disks, NICs and tags). Creation, removal, power changes and
/// migration have dedicated calls.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait Gateway: Send + Sync {
    async fn fetch_instance(
        &self,
        name: &str,
    ) -> Result<Option<RemoteInstanceState>, GatewayError>;

    /// Creates the instance under `name`: its new name when a rename was
    /// requested, otherwise its current one.
    async fn submit_create(
        &self,
        name: &str,
        spec: &InstanceSpec,
        flags: &JobFlags,
    ) -> Result<JobHandle, GatewayError>;

    async fn submit_remove(&self, name: &str)
        -> Result<JobHandle, GatewayError>;

    async fn submit_modify(
        &self,
        name: &str,
        op: &ChangeOperation,
        flags: &JobFlags,
    ) -> Result<JobHandle, GatewayError>;

    async fn submit_power(
        &self,
        name: &str,
        target: PowerTarget,
    ) -> Result<JobHandle, GatewayError>;

    async fn submit_migrate(
        &self,
        name: &str,
    ) -> Result<JobHandle, GatewayError>;

    async fn poll_job(&self, job: &JobHandle)
        -> Result<JobStatus, GatewayError>;
}
