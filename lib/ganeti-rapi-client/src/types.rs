// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Request and response bodies of the RAPI v2 resources this client uses.

use std::collections::BTreeMap;
use std::str::FromStr;

use ganeti_reconciler::spec::{DiskSpec, InstanceSpec, JobFlags, NicSpec};
use ganeti_reconciler::validation::NicMode;
use ganeti_reconciler::{
    JobId, JobStatus, PowerStatus, RemoteDisk, RemoteInstanceState, RemoteNic,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Job ids come back as a JSON number from some Ganeti versions and as a
/// string from others.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum WireJobId {
    Number(u64),
    Text(String),
}

impl From<WireJobId> for JobId {
    fn from(id: WireJobId) -> Self {
        match id {
            WireJobId::Number(n) => JobId::new(n.to_string()),
            WireJobId::Text(s) => JobId::new(s),
        }
    }
}

/// Maps the `status` field of an instance onto whether it is running.
///
/// `ERROR_nodedown` and `ERROR_nodeoffline` mean the primary node cannot be
/// reached, so nothing is known about the instance itself.
pub fn power_status(status: &str) -> PowerStatus {
    match status {
        "running" | "ERROR_up" | "ERROR_wrongnode" => PowerStatus::Running,
        "ADMIN_down" | "ADMIN_offline" | "ERROR_down" | "USER_down" => {
            PowerStatus::Stopped
        }
        _ => PowerStatus::Unknown,
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct BeParams {
    pub vcpus: Option<u32>,
    pub memory: Option<u64>,
    pub maxmem: Option<u64>,
    pub minmem: Option<u64>,
}

/// `GET /2/instances/{name}`
#[derive(Clone, Debug, Deserialize)]
pub struct InstanceInfo {
    pub name: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub beparams: BeParams,
    #[serde(default)]
    pub disk_template: Option<String>,
    #[serde(rename = "disk.sizes", default)]
    pub disk_sizes: Vec<u64>,
    #[serde(rename = "disk.names", default)]
    pub disk_names: Vec<Option<String>>,
    #[serde(rename = "nic.modes", default)]
    pub nic_modes: Vec<Option<String>>,
    #[serde(rename = "nic.links", default)]
    pub nic_links: Vec<Option<String>>,
    #[serde(rename = "nic.ips", default)]
    pub nic_ips: Vec<Option<String>>,
    #[serde(rename = "nic.macs", default)]
    pub nic_macs: Vec<Option<String>>,
    #[serde(rename = "nic.names", default)]
    pub nic_names: Vec<Option<String>>,
    #[serde(rename = "nic.networks", default)]
    pub nic_networks: Vec<Option<String>>,
    #[serde(rename = "nic.vlans", default)]
    pub nic_vlans: Vec<Option<String>>,
    #[serde(rename = "nic.bridges", default)]
    pub nic_bridges: Vec<Option<String>>,
    #[serde(default)]
    pub os: Option<String>,
    #[serde(default)]
    pub osparams: BTreeMap<String, Value>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub hypervisor: Option<String>,
    #[serde(default)]
    pub pnode: Option<String>,
    #[serde(default)]
    pub snodes: Vec<String>,
}

fn nth(values: &[Option<String>], i: usize) -> Option<String> {
    values
        .get(i)
        .cloned()
        .flatten()
        .filter(|v| !v.is_empty() && v != "None")
}

/// Ganeti stores VLANs as `.100` (untagged) or `:100:200` (trunk). Only the
/// first id is compared.
fn parse_vlan(raw: &str) -> Option<u16> {
    raw.trim_start_matches(['.', ':']).split(':').next()?.parse().ok()
}

impl InstanceInfo {
    /// Builds the engine's snapshot. `group` is the node group of the
    /// primary node, looked up separately.
    pub fn into_state(
        self,
        group: Option<String>,
        recent_jobs: Vec<JobId>,
    ) -> RemoteInstanceState {
        let status = self.status.clone().unwrap_or_default();
        let disks = self
            .disk_sizes
            .iter()
            .enumerate()
            .map(|(i, size)| RemoteDisk {
                size_mib: *size,
                name: nth(&self.disk_names, i),
            })
            .collect();
        let nics = (0..self.nic_modes.len())
            .map(|i| RemoteNic {
                mode: nth(&self.nic_modes, i)
                    .and_then(|m| NicMode::from_str(&m).ok()),
                name: nth(&self.nic_names, i),
                link: nth(&self.nic_links, i),
                ip: nth(&self.nic_ips, i),
                mac: nth(&self.nic_macs, i),
                vlan: nth(&self.nic_vlans, i).and_then(|v| parse_vlan(&v)),
                network: nth(&self.nic_networks, i),
                bridge: nth(&self.nic_bridges, i),
            })
            .collect();
        let os_params = self
            .osparams
            .into_iter()
            .filter_map(|(k, v)| match v {
                Value::String(s) => Some((k, s)),
                Value::Number(n) => Some((k, n.to_string())),
                Value::Bool(b) => Some((k, b.to_string())),
                _ => None,
            })
            .collect();

        RemoteInstanceState {
            name: self.name,
            power: power_status(&status),
            status,
            memory: self.beparams.maxmem.or(self.beparams.memory),
            vcpus: self.beparams.vcpus,
            disk_template: self.disk_template,
            disks,
            nics,
            os_type: self.os,
            os_params,
            tags: self.tags.into_iter().collect(),
            hypervisor: self.hypervisor,
            primary_node: self.pnode,
            secondary_nodes: self.snodes,
            group,
            recent_jobs,
        }
    }
}

/// `GET /2/jobs/{id}`
#[derive(Clone, Debug, Deserialize)]
pub struct JobInfo {
    pub status: String,
    #[serde(default)]
    pub opresult: Value,
}

fn string_leaves<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
    match value {
        Value::String(s) if !s.is_empty() => out.push(s),
        Value::Array(items) => {
            items.iter().for_each(|item| string_leaves(item, out))
        }
        Value::Object(map) => {
            map.values().for_each(|item| string_leaves(item, out))
        }
        _ => {}
    }
}

impl JobInfo {
    pub fn job_status(&self) -> JobStatus {
        match self.status.as_str() {
            "success" => JobStatus::Success,
            "error" | "canceled" => {
                let mut leaves = Vec::new();
                string_leaves(&self.opresult, &mut leaves);
                if leaves.is_empty() {
                    JobStatus::Failed(format!("job ended as {}", self.status))
                } else {
                    JobStatus::Failed(leaves.join(": "))
                }
            }
            // queued, waiting, running, canceling
            _ => JobStatus::Running,
        }
    }
}

/// One entry of `GET /2/groups?bulk=1`.
#[derive(Clone, Debug, Deserialize)]
pub struct GroupInfo {
    pub name: String,
    #[serde(default)]
    pub node_list: Vec<String>,
}

/// Error body returned with non-2xx responses.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub explain: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BeParamsRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vcpus: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minmem: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maxmem: Option<u64>,
}

impl BeParamsRequest {
    /// Memory is pinned: minimum, maximum and current are set together.
    pub fn with_memory(mut self, mib: u64) -> Self {
        self.memory = Some(mib);
        self.minmem = Some(mib);
        self.maxmem = Some(mib);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

pub fn disk_params(disk: &DiskSpec) -> Map<String, Value> {
    let mut params = Map::new();
    params.insert("size".to_string(), disk.size.as_mib().into());
    if let Some(name) = &disk.name {
        params.insert("name".to_string(), name.clone().into());
    }
    if let Some(mode) = &disk.mode {
        params.insert("mode".to_string(), mode.clone().into());
    }
    if let Some(provider) = &disk.provider {
        params.insert("provider".to_string(), provider.clone().into());
    }
    for (key, value) in &disk.extra {
        params.insert(key.clone(), value.clone());
    }
    params
}

pub fn nic_params(nic: &NicSpec) -> Map<String, Value> {
    let mut params = Map::new();
    params.insert("mode".to_string(), nic.mode.to_string().into());
    let optional = [
        ("name", &nic.name),
        ("link", &nic.link),
        ("ip", &nic.ip),
        ("mac", &nic.mac),
        ("network", &nic.network),
        ("bridge", &nic.bridge),
    ];
    for (key, value) in optional {
        if let Some(value) = value {
            params.insert(key.to_string(), value.clone().into());
        }
    }
    if let Some(vlan) = nic.vlan {
        params.insert("vlan".to_string(), vlan.to_string().into());
    }
    params
}

/// `POST /2/instances`
#[derive(Clone, Debug, Serialize)]
pub struct CreateInstanceRequest {
    #[serde(rename = "__version__")]
    pub version: u32,
    pub mode: &'static str,
    pub name: String,
    pub disk_template: String,
    pub hypervisor: String,
    pub os_type: String,
    pub beparams: BeParamsRequest,
    pub disks: Vec<Map<String, Value>>,
    pub nics: Vec<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iallocator: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pnode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub osparams: BTreeMap<String, String>,
    pub tags: Vec<String>,
    pub conflicts_check: bool,
    pub ip_check: bool,
    pub name_check: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub no_install: Option<bool>,
    pub wait_for_sync: bool,
}

impl CreateInstanceRequest {
    pub fn new(name: &str, spec: &InstanceSpec, flags: &JobFlags) -> Self {
        let mut beparams = BeParamsRequest {
            vcpus: spec.vcpus,
            ..Default::default()
        };
        if let Some(memory) = spec.memory {
            beparams = beparams.with_memory(memory);
        }
        Self {
            version: 1,
            mode: "create",
            name: name.to_string(),
            disk_template: spec.disk_template.to_string(),
            hypervisor: spec.placement.hypervisor.to_string(),
            os_type: spec.os_type_for_create().to_string(),
            beparams,
            disks: spec.disks.iter().flatten().map(disk_params).collect(),
            nics: spec.nics.iter().flatten().map(nic_params).collect(),
            iallocator: spec.placement.iallocator.clone(),
            pnode: spec.placement.primary_node.clone(),
            snode: spec.placement.secondary_node.clone(),
            group_name: spec.placement.group_name.clone(),
            osparams: spec.os_params.clone(),
            tags: spec.tags.iter().flatten().cloned().collect(),
            conflicts_check: flags.conflicts_check,
            ip_check: flags.ip_check,
            name_check: flags.name_check,
            no_install: spec.no_install,
            wait_for_sync: flags.wait_for_sync,
        }
    }
}

/// One `[action, index, parameters]` entry of a disk or NIC modification.
pub type DeviceChange = (&'static str, usize, Map<String, Value>);

/// `PUT /2/instances/{name}/modify`
#[derive(Clone, Debug, Default, Serialize)]
pub struct ModifyInstanceRequest {
    #[serde(skip_serializing_if = "BeParamsRequest::is_empty")]
    pub beparams: BeParamsRequest,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub disks: Vec<DeviceChange>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub nics: Vec<DeviceChange>,
    pub conflicts_check: bool,
    pub wait_for_sync: bool,
}

impl ModifyInstanceRequest {
    pub fn new(flags: &JobFlags) -> Self {
        Self {
            conflicts_check: flags.conflicts_check,
            wait_for_sync: flags.wait_for_sync,
            ..Default::default()
        }
    }
}

/// `PUT /2/instances/{name}/rename`
#[derive(Clone, Debug, Serialize)]
pub struct RenameInstanceRequest {
    pub new_name: String,
    pub ip_check: bool,
    pub name_check: bool,
}

/// `POST /2/instances/{name}/disk/{index}/grow`
#[derive(Clone, Debug, Serialize)]
pub struct GrowDiskRequest {
    /// MiB to add, not the final size.
    pub amount: u64,
    pub wait_for_sync: bool,
}
