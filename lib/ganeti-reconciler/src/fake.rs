// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! An in-memory cluster for exercising whole reconciliation passes.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use crate::gateway::{
    Gateway, GatewayError, JobHandle, JobId, JobStatus, PowerStatus,
    PowerTarget, RemoteDisk, RemoteInstanceState, RemoteNic,
};
use crate::plan::ChangeOperation;
use crate::spec::{InstanceSpec, JobFlags};

enum Rule {
    Fail(String),
    Hang,
    Reject(String),
}

#[derive(Default)]
struct Cluster {
    instances: BTreeMap<String, RemoteInstanceState>,
    jobs: BTreeMap<JobId, JobStatus>,
    next_job: u64,
    calls: Vec<String>,
    rules: Vec<(String, Rule)>,
}

/// Applies every accepted job immediately unless a rule says otherwise.
///
/// Calls are recorded as `"<operation> <instance>"`, or `"fetch <instance>"`
/// for reads. Rules match on a prefix of the operation, e.g. `"SetMemory"`.
#[derive(Default)]
pub(crate) struct FakeGateway {
    cluster: Mutex<Cluster>,
}

impl FakeGateway {
    pub(crate) fn with_instance(instance: RemoteInstanceState) -> Self {
        let gw = Self::default();
        gw.insert(instance);
        gw
    }

    pub(crate) fn insert(&self, instance: RemoteInstanceState) {
        let mut cluster = self.cluster.lock().unwrap();
        cluster.instances.insert(instance.name.clone(), instance);
    }

    pub(crate) fn instance(&self, name: &str) -> Option<RemoteInstanceState> {
        self.cluster.lock().unwrap().instances.get(name).cloned()
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.cluster.lock().unwrap().calls.clone()
    }

    /// Mutating calls only, in submission order.
    pub(crate) fn submissions(&self) -> Vec<String> {
        self.calls().into_iter().filter(|c| !c.starts_with("fetch ")).collect()
    }

    pub(crate) fn clear_calls(&self) {
        self.cluster.lock().unwrap().calls.clear();
    }

    /// Jobs for matching operations end in failure without effect.
    pub(crate) fn fail_jobs(&self, prefix: &str, reason: &str) {
        self.rule(prefix, Rule::Fail(reason.to_string()));
    }

    /// Jobs for matching operations never finish.
    pub(crate) fn hang_jobs(&self, prefix: &str) {
        self.rule(prefix, Rule::Hang);
    }

    /// Matching submissions are refused outright.
    pub(crate) fn reject_submissions(&self, prefix: &str, reason: &str) {
        self.rule(prefix, Rule::Reject(reason.to_string()));
    }

    fn rule(&self, prefix: &str, rule: Rule) {
        self.cluster.lock().unwrap().rules.push((prefix.to_string(), rule));
    }

    fn submit(
        &self,
        name: &str,
        summary: &str,
        apply: impl FnOnce(&mut BTreeMap<String, RemoteInstanceState>),
    ) -> Result<JobHandle, GatewayError> {
        let mut guard = self.cluster.lock().unwrap();
        let cluster = &mut *guard;
        cluster.calls.push(format!("{summary} {name}"));
        let rule = cluster
            .rules
            .iter()
            .find(|(prefix, _)| summary.starts_with(prefix.as_str()))
            .map(|(_, rule)| rule);
        let status = match rule {
            Some(Rule::Reject(reason)) => {
                return Err(GatewayError::new(reason.clone()))
            }
            Some(Rule::Fail(reason)) => JobStatus::Failed(reason.clone()),
            Some(Rule::Hang) => JobStatus::Running,
            None => {
                apply(&mut cluster.instances);
                JobStatus::Success
            }
        };
        cluster.next_job += 1;
        let id = JobId::new(cluster.next_job.to_string());
        cluster.jobs.insert(id.clone(), status);
        Ok(JobHandle::new(id))
    }
}

fn set_power(instance: &mut RemoteInstanceState, target: PowerTarget) {
    let (power, status) = match target {
        PowerTarget::On => (PowerStatus::Running, "running"),
        PowerTarget::Off => (PowerStatus::Stopped, "ADMIN_down"),
    };
    instance.power = power;
    instance.status = status.to_string();
}

fn created(name: &str, spec: &InstanceSpec) -> RemoteInstanceState {
    RemoteInstanceState {
        name: name.to_string(),
        status: "running".to_string(),
        power: PowerStatus::Running,
        memory: spec.memory.or(Some(128)),
        vcpus: spec.vcpus.or(Some(1)),
        disk_template: Some(spec.disk_template.to_string()),
        disks: spec
            .disks
            .iter()
            .flatten()
            .map(|d| RemoteDisk {
                size_mib: d.size.as_mib(),
                name: d.name.clone(),
            })
            .collect(),
        nics: spec
            .nics
            .iter()
            .flatten()
            .map(|n| RemoteNic {
                mode: Some(n.mode),
                link: n.link.clone(),
                ..Default::default()
            })
            .collect(),
        os_type: Some(spec.os_type_for_create().to_string()),
        os_params: spec.os_params.clone(),
        tags: spec.tags.clone().unwrap_or_default(),
        hypervisor: Some(spec.placement.hypervisor.to_string()),
        primary_node: Some("node1".to_string()),
        secondary_nodes: Vec::new(),
        group: Some("default".to_string()),
        recent_jobs: Vec::new(),
    }
}

fn modify(
    instances: &mut BTreeMap<String, RemoteInstanceState>,
    name: &str,
    op: &ChangeOperation,
) {
    if let ChangeOperation::Rename { new_name } = op {
        if let Some(mut instance) = instances.remove(name) {
            instance.name = new_name.clone();
            instances.insert(new_name.clone(), instance);
        }
        return;
    }
    let Some(instance) = instances.get_mut(name) else { return };
    match op {
        ChangeOperation::SetVcpus { to, .. } => instance.vcpus = Some(*to),
        ChangeOperation::SetMemory { to, .. } => instance.memory = Some(*to),
        ChangeOperation::AddDisk { disk, .. } => {
            instance.disks.push(RemoteDisk {
                size_mib: disk.size.as_mib(),
                name: disk.name.clone(),
            })
        }
        ChangeOperation::GrowDisk { index, to_mib, .. } => {
            instance.disks[*index].size_mib = *to_mib
        }
        ChangeOperation::AddNic { nic, .. } => instance.nics.push(RemoteNic {
            mode: Some(nic.mode),
            link: nic.link.clone(),
            ..Default::default()
        }),
        ChangeOperation::RemoveNic { index } => {
            instance.nics.remove(*index);
        }
        ChangeOperation::SetTags { added, removed } => {
            instance.tags.extend(added.iter().cloned());
            instance.tags = instance
                .tags
                .difference(removed)
                .cloned()
                .collect::<BTreeSet<_>>();
        }
        _ => {}
    }
}

#[async_trait::async_trait]
impl Gateway for FakeGateway {
    async fn fetch_instance(
        &self,
        name: &str,
    ) -> Result<Option<RemoteInstanceState>, GatewayError> {
        let mut cluster = self.cluster.lock().unwrap();
        cluster.calls.push(format!("fetch {name}"));
        Ok(cluster.instances.get(name).cloned())
    }

    async fn submit_create(
        &self,
        name: &str,
        spec: &InstanceSpec,
        _flags: &JobFlags,
    ) -> Result<JobHandle, GatewayError> {
        let instance = created(name, spec);
        self.submit(name, "CreateInstance", move |instances| {
            instances.insert(instance.name.clone(), instance);
        })
    }

    async fn submit_remove(
        &self,
        name: &str,
    ) -> Result<JobHandle, GatewayError> {
        self.submit(name, "RemoveInstance", |instances| {
            instances.remove(name);
        })
    }

    async fn submit_modify(
        &self,
        name: &str,
        op: &ChangeOperation,
        _flags: &JobFlags,
    ) -> Result<JobHandle, GatewayError> {
        self.submit(name, &op.to_string(), |instances| {
            modify(instances, name, op)
        })
    }

    async fn submit_power(
        &self,
        name: &str,
        target: PowerTarget,
    ) -> Result<JobHandle, GatewayError> {
        let summary = ChangeOperation::SetPower { target }.to_string();
        self.submit(name, &summary, |instances| {
            if let Some(instance) = instances.get_mut(name) {
                set_power(instance, target);
            }
        })
    }

    async fn submit_migrate(
        &self,
        name: &str,
    ) -> Result<JobHandle, GatewayError> {
        self.submit(name, "Migrate", |instances| {
            if let Some(instance) = instances.get_mut(name) {
                if let Some(secondary) = instance.secondary_nodes.pop() {
                    let primary = instance.primary_node.replace(secondary);
                    instance.secondary_nodes.extend(primary);
                }
            }
        })
    }

    async fn poll_job(
        &self,
        job: &JobHandle,
    ) -> Result<JobStatus, GatewayError> {
        let cluster = self.cluster.lock().unwrap();
        let mut status = JobStatus::Success;
        for id in job.jobs() {
            match cluster.jobs.get(id) {
                None => {
                    return Err(GatewayError::new(format!("no such job {id}")))
                }
                Some(JobStatus::Success) => {}
                Some(other) => status = other.clone(),
            }
        }
        Ok(status)
    }
}
