// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::BTreeMap;
use std::sync::Mutex;

use ganeti_reconciler::spec::{InstanceSpec, JobFlags};
use ganeti_reconciler::{
    ChangeOperation, Gateway, GatewayError, JobHandle, JobId, JobStatus,
    PowerTarget, RemoteInstanceState,
};

use crate::types::{
    disk_params, nic_params, BeParamsRequest, CreateInstanceRequest,
    GrowDiskRequest, ModifyInstanceRequest, RenameInstanceRequest,
};
use crate::{Client, RapiError};

impl From<RapiError> for GatewayError {
    fn from(e: RapiError) -> Self {
        GatewayError::new(e.to_string())
    }
}

/// Drives the reconciliation engine against a live cluster.
///
/// Also remembers the jobs it submitted per instance, which are reported
/// back in the snapshot's job history.
pub struct RapiGateway {
    client: Client,
    history: Mutex<BTreeMap<String, Vec<JobId>>>,
}

impl RapiGateway {
    pub fn new(client: Client) -> Self {
        Self { client, history: Mutex::new(BTreeMap::new()) }
    }

    fn record(&self, name: &str, jobs: &[JobId]) {
        if let Ok(mut history) = self.history.lock() {
            history
                .entry(name.to_string())
                .or_default()
                .extend(jobs.iter().cloned());
        }
    }

    fn submitted(&self, name: &str, jobs: Vec<JobId>) -> JobHandle {
        self.record(name, &jobs);
        JobHandle::with_jobs(jobs)
    }

    /// Finds the node group holding the primary node.
    async fn group_of(
        &self,
        node: &str,
    ) -> Result<Option<String>, RapiError> {
        let groups = self.client.get_groups().await?;
        Ok(groups
            .into_iter()
            .find(|g| g.node_list.iter().any(|n| n == node))
            .map(|g| g.name))
    }
}

#[async_trait::async_trait]
impl Gateway for RapiGateway {
    async fn fetch_instance(
        &self,
        name: &str,
    ) -> Result<Option<RemoteInstanceState>, GatewayError> {
        let Some(info) = self.client.get_instance(name).await? else {
            return Ok(None);
        };
        let group = match &info.pnode {
            Some(node) => self.group_of(node).await?,
            None => None,
        };
        let recent_jobs = self
            .history
            .lock()
            .ok()
            .and_then(|h| h.get(&info.name).cloned())
            .unwrap_or_default();
        Ok(Some(info.into_state(group, recent_jobs)))
    }

    async fn submit_create(
        &self,
        name: &str,
        spec: &InstanceSpec,
        flags: &JobFlags,
    ) -> Result<JobHandle, GatewayError> {
        let body = CreateInstanceRequest::new(name, spec, flags);
        let job = self.client.create_instance(&body).await?;
        Ok(self.submitted(name, vec![job]))
    }

    async fn submit_remove(
        &self,
        name: &str,
    ) -> Result<JobHandle, GatewayError> {
        let job = self.client.delete_instance(name).await?;
        Ok(self.submitted(name, vec![job]))
    }

    async fn submit_modify(
        &self,
        name: &str,
        op: &ChangeOperation,
        flags: &JobFlags,
    ) -> Result<JobHandle, GatewayError> {
        let mut modify = ModifyInstanceRequest::new(flags);
        let jobs = match op {
            ChangeOperation::Rename { new_name } => {
                let body = RenameInstanceRequest {
                    new_name: new_name.clone(),
                    ip_check: flags.ip_check,
                    name_check: flags.name_check,
                };
                vec![self.client.rename_instance(name, &body).await?]
            }
            ChangeOperation::SetVcpus { to, .. } => {
                modify.beparams =
                    BeParamsRequest { vcpus: Some(*to), ..Default::default() };
                vec![self.client.modify_instance(name, &modify).await?]
            }
            ChangeOperation::SetMemory { to, .. } => {
                modify.beparams = BeParamsRequest::default().with_memory(*to);
                vec![self.client.modify_instance(name, &modify).await?]
            }
            ChangeOperation::AddDisk { index, disk } => {
                modify.disks.push(("add", *index, disk_params(disk)));
                vec![self.client.modify_instance(name, &modify).await?]
            }
            ChangeOperation::GrowDisk { index, from_mib, to_mib } => {
                let body = GrowDiskRequest {
                    amount: to_mib.saturating_sub(*from_mib),
                    wait_for_sync: flags.wait_for_sync,
                };
                vec![self.client.grow_disk(name, *index, &body).await?]
            }
            ChangeOperation::AddNic { index, nic } => {
                modify.nics.push(("add", *index, nic_params(nic)));
                vec![self.client.modify_instance(name, &modify).await?]
            }
            ChangeOperation::RemoveNic { index } => {
                modify.nics.push(("remove", *index, Default::default()));
                vec![self.client.modify_instance(name, &modify).await?]
            }
            ChangeOperation::SetTags { added, removed } => {
                let mut jobs = Vec::new();
                if !added.is_empty() {
                    let tags: Vec<String> = added.iter().cloned().collect();
                    jobs.push(self.client.add_tags(name, &tags).await?);
                }
                if !removed.is_empty() {
                    let tags: Vec<String> = removed.iter().cloned().collect();
                    jobs.push(self.client.delete_tags(name, &tags).await?);
                }
                jobs
            }
            ChangeOperation::CreateInstance
            | ChangeOperation::RemoveInstance
            | ChangeOperation::SetPower { .. }
            | ChangeOperation::Migrate => {
                return Err(GatewayError::new(format!(
                    "{op} is not an instance modification"
                )))
            }
        };
        let record_as = match op {
            ChangeOperation::Rename { new_name } => new_name.as_str(),
            _ => name,
        };
        Ok(self.submitted(record_as, jobs))
    }

    async fn submit_power(
        &self,
        name: &str,
        target: PowerTarget,
    ) -> Result<JobHandle, GatewayError> {
        let job = match target {
            PowerTarget::On => self.client.startup_instance(name).await?,
            PowerTarget::Off => self.client.shutdown_instance(name).await?,
        };
        Ok(self.submitted(name, vec![job]))
    }

    async fn submit_migrate(
        &self,
        name: &str,
    ) -> Result<JobHandle, GatewayError> {
        let job = self.client.migrate_instance(name).await?;
        Ok(self.submitted(name, vec![job]))
    }

    /// A handle with several jobs is running until all of them finish and
    /// failed as soon as one of them fails.
    async fn poll_job(
        &self,
        job: &JobHandle,
    ) -> Result<JobStatus, GatewayError> {
        let mut status = JobStatus::Success;
        for id in job.jobs() {
            match self.client.get_job(id).await?.job_status() {
                JobStatus::Success => {}
                JobStatus::Running => status = JobStatus::Running,
                failed @ JobStatus::Failed(_) => return Ok(failed),
            }
        }
        Ok(status)
    }
}
