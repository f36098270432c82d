// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Desired instance state: the raw form callers supply, the canonical
//! [`InstanceSpec`] the rest of the engine consumes, and the normalizer that
//! turns one into the other.
//!
//! Normalization is a pure function. It applies the documented defaults,
//! validates every entry, and fails with [`ReconcileError::Validation`] before
//! anything is sent to the cluster.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ReconcileError;
use crate::validation::{DiskTemplate, Hypervisor, NicMode, ValidationData};

/// OS definition used at creation time when the caller names none.
pub const DEFAULT_OS_TYPE: &str = "debootstrap+default";

/// Allocator used at creation time when no primary node is given.
pub const DEFAULT_IALLOCATOR: &str = "hail";

/// The state a caller asks the instance to be in. These are requests, not
/// states the engine keeps; the real state lives on the cluster.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
    Deserialize,
    Serialize,
    strum::Display,
    strum::EnumString,
    strum::VariantNames,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum LifecycleState {
    #[default]
    Present,
    Absent,
    Started,
    Stopped,
    Restarted,
    Migrated,
}

/// A disk size in MiB. Always positive.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize,
)]
#[serde(transparent)]
pub struct DiskSize(u64);

impl DiskSize {
    pub fn from_mib(mib: u64) -> Option<Self> {
        (mib > 0).then_some(Self(mib))
    }

    pub fn as_mib(self) -> u64 {
        self.0
    }
}

impl fmt::Display for DiskSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} MiB", self.0)
    }
}

/// Parses sizes such as `10G`, `512M`, `2TiB` or a bare number of MiB.
impl FromStr for DiskSize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
        let (digits, unit) = s.split_at(split);
        let amount: u64 = digits
            .parse()
            .map_err(|_| format!("'{s}' does not start with a number"))?;
        let factor: u64 = match unit.trim().to_ascii_lowercase().as_str() {
            "" | "m" | "mb" | "mib" => 1,
            "g" | "gb" | "gib" => 1024,
            "t" | "tb" | "tib" => 1024 * 1024,
            other => return Err(format!("unknown size unit '{other}'")),
        };
        let mib = amount
            .checked_mul(factor)
            .ok_or_else(|| format!("size '{s}' is too large"))?;
        DiskSize::from_mib(mib).ok_or_else(|| "size must be positive".into())
    }
}

/// Options that shape how a reconciliation pass runs, independent of the
/// instance being reconciled.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Options {
    /// Wait for each job to finish before submitting the next one.
    pub wait: bool,

    /// Seconds to wait for any single job when `wait` is set.
    pub job_timeout: u64,

    /// Seconds between two polls of a running job.
    pub poll_interval: u64,

    /// Compute and report the plan without submitting anything.
    pub check_mode: bool,

    pub conflicts_check: bool,
    pub ip_check: bool,
    pub name_check: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            wait: true,
            job_timeout: 300,
            poll_interval: 1,
            check_mode: false,
            conflicts_check: true,
            ip_check: true,
            name_check: true,
        }
    }
}

impl Options {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval)
    }
}

/// Flags forwarded untouched to the cluster with each submitted job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct JobFlags {
    pub conflicts_check: bool,
    pub ip_check: bool,
    pub name_check: bool,
    pub wait_for_sync: bool,
}

/// A disk size as written by the caller: either MiB or a string with a unit.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum RawSize {
    Mib(i64),
    Text(String),
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct RawDisk {
    pub size: Option<RawSize>,
    pub name: Option<String>,
    pub provider: Option<String>,
    pub mode: Option<String>,

    /// Anything else. Only accepted for `ext` disks, where it is handed to
    /// the external storage provider.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct RawNic {
    pub mode: Option<String>,
    pub name: Option<String>,
    pub link: Option<String>,
    pub ip: Option<String>,
    pub mac: Option<String>,
    pub vlan: Option<u16>,
    pub network: Option<String>,
    pub bridge: Option<String>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// The desired state exactly as a caller wrote it.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RawInstanceRequest {
    #[serde(alias = "instance_name")]
    pub name: Option<String>,
    pub new_name: Option<String>,
    pub state: Option<String>,
    pub memory: Option<u64>,
    pub vcpus: Option<u32>,
    pub disk_template: Option<String>,
    pub disks: Option<Vec<RawDisk>>,
    pub nics: Option<Vec<RawNic>>,
    pub hypervisor: Option<String>,
    pub iallocator: Option<String>,
    pub os_type: Option<String>,
    pub osparams: Option<BTreeMap<String, serde_json::Value>>,
    pub pnode: Option<String>,
    pub snode: Option<String>,
    pub group_name: Option<String>,
    pub tags: Option<Vec<String>>,
    pub no_install: Option<bool>,
    pub wait_for_sync: Option<bool>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DiskSpec {
    pub size: DiskSize,
    pub name: Option<String>,
    pub provider: Option<String>,
    pub mode: Option<String>,
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct NicSpec {
    pub mode: NicMode,
    pub name: Option<String>,
    pub link: Option<String>,
    pub ip: Option<String>,
    pub mac: Option<String>,
    pub vlan: Option<u16>,
    pub network: Option<String>,
    pub bridge: Option<String>,
}

/// Where a new instance is placed. Only consulted at creation, except for
/// `group_name`, which is also checked against existing instances.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Placement {
    pub hypervisor: Hypervisor,
    pub iallocator: Option<String>,
    pub primary_node: Option<String>,
    pub secondary_node: Option<String>,
    pub group_name: Option<String>,
}

/// Canonical desired state. `None` fields were not specified by the caller
/// and are never compared against the cluster.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct InstanceSpec {
    pub name: String,
    pub new_name: Option<String>,
    pub state: LifecycleState,
    pub memory: Option<u64>,
    pub vcpus: Option<u32>,
    pub disk_template: DiskTemplate,
    pub disks: Option<Vec<DiskSpec>>,
    pub nics: Option<Vec<NicSpec>>,
    pub os_type: Option<String>,
    pub os_params: BTreeMap<String, String>,
    pub tags: Option<BTreeSet<String>>,
    pub placement: Placement,
    pub no_install: Option<bool>,
    pub wait_for_sync: bool,
}

impl InstanceSpec {
    pub fn job_flags(&self, options: &Options) -> JobFlags {
        JobFlags {
            conflicts_check: options.conflicts_check,
            ip_check: options.ip_check,
            name_check: options.name_check,
            wait_for_sync: self.wait_for_sync,
        }
    }

    /// The OS definition to install when creating the instance.
    pub fn os_type_for_create(&self) -> &str {
        self.os_type.as_deref().unwrap_or(DEFAULT_OS_TYPE)
    }
}

/// Checks `name` against host name rules: dot-separated labels of ASCII
/// letters, digits and hyphens, no label longer than 63 bytes or starting or
/// ending with a hyphen.
pub fn is_valid_instance_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 255 {
        return false;
    }
    name.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

/// Builds a validated [`InstanceSpec`] from a raw request.
pub fn normalize(
    raw: &RawInstanceRequest,
    options: &Options,
    known: &dyn ValidationData,
) -> Result<InstanceSpec, ReconcileError> {
    if options.job_timeout == 0 {
        return Err(ReconcileError::validation(
            "job_timeout must be at least one second",
        ));
    }
    if options.poll_interval == 0 {
        return Err(ReconcileError::validation(
            "poll_interval must be at least one second",
        ));
    }

    let name = match raw.name.as_deref().map(str::trim) {
        None | Some("") => {
            return Err(ReconcileError::validation("no instance name given"))
        }
        Some(name) if !is_valid_instance_name(name) => {
            return Err(ReconcileError::validation(format!(
                "'{name}' is not a valid instance name"
            )))
        }
        Some(name) => name.to_string(),
    };

    let new_name = match raw.new_name.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(new) if !is_valid_instance_name(new) => {
            return Err(ReconcileError::validation(format!(
                "'{new}' is not a valid new instance name"
            )))
        }
        Some(new) if new == name => None,
        Some(new) => Some(new.to_string()),
    };

    let state = match raw.state.as_deref() {
        None => LifecycleState::default(),
        Some(s) => LifecycleState::from_str(s).map_err(|_| {
            ReconcileError::validation(format!("unknown state '{s}'"))
        })?,
    };

    let disk_template = match raw.disk_template.as_deref() {
        None => DiskTemplate::default(),
        Some(t) if known.is_valid_template(t) => DiskTemplate::from_str(t)
            .map_err(|_| {
                ReconcileError::validation(format!(
                    "unknown disk template '{t}'"
                ))
            })?,
        Some(t) => {
            return Err(ReconcileError::validation(format!(
                "disk template '{t}' is not available"
            )))
        }
    };

    let hypervisor = match raw.hypervisor.as_deref() {
        None => Hypervisor::default(),
        Some(h) if known.is_valid_hypervisor(h) => Hypervisor::from_str(h)
            .map_err(|_| {
                ReconcileError::validation(format!("unknown hypervisor '{h}'"))
            })?,
        Some(h) => {
            return Err(ReconcileError::validation(format!(
                "hypervisor '{h}' is not available"
            )))
        }
    };

    if raw.memory == Some(0) {
        return Err(ReconcileError::validation("memory must be positive"));
    }
    if raw.vcpus == Some(0) {
        return Err(ReconcileError::validation("vcpus must be positive"));
    }

    let disks = raw
        .disks
        .as_ref()
        .map(|disks| {
            disks
                .iter()
                .enumerate()
                .map(|(i, d)| normalize_disk(i, d, disk_template))
                .collect::<Result<Vec<_>, _>>()
        })
        .transpose()?;

    let nics = raw
        .nics
        .as_ref()
        .map(|nics| {
            nics.iter()
                .enumerate()
                .map(|(i, n)| normalize_nic(i, n))
                .collect::<Result<Vec<_>, _>>()
        })
        .transpose()?;

    let mut os_params = BTreeMap::new();
    for (key, value) in raw.osparams.iter().flatten() {
        let value = match value {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Number(n) => n.to_string(),
            serde_json::Value::Bool(b) => b.to_string(),
            _ => {
                return Err(ReconcileError::validation(format!(
                    "osparams key '{key}' must have a scalar value"
                )))
            }
        };
        os_params.insert(key.clone(), value);
    }

    let tags = raw.tags.as_ref().map(|tags| {
        tags.iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect::<BTreeSet<_>>()
    });

    let primary_node = non_empty(&raw.pnode);
    let secondary_node = non_empty(&raw.snode);
    if secondary_node.is_some() && primary_node.is_none() {
        return Err(ReconcileError::validation(
            "a secondary node requires a primary node",
        ));
    }
    let iallocator = match (non_empty(&raw.iallocator), &primary_node) {
        (Some(alloc), _) => Some(alloc),
        (None, None) => Some(DEFAULT_IALLOCATOR.to_string()),
        (None, Some(_)) => None,
    };

    Ok(InstanceSpec {
        name,
        new_name,
        state,
        memory: raw.memory,
        vcpus: raw.vcpus,
        disk_template,
        disks,
        nics,
        os_type: non_empty(&raw.os_type),
        os_params,
        tags,
        placement: Placement {
            hypervisor,
            iallocator,
            primary_node,
            secondary_node,
            group_name: non_empty(&raw.group_name),
        },
        no_install: raw.no_install,
        wait_for_sync: raw.wait_for_sync.unwrap_or(true),
    })
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn normalize_disk(
    index: usize,
    raw: &RawDisk,
    template: DiskTemplate,
) -> Result<DiskSpec, ReconcileError> {
    let invalid = |msg: String| {
        ReconcileError::validation(format!("disk {index}: {msg}"))
    };

    let size = match &raw.size {
        None => return Err(invalid("no size given".to_string())),
        Some(RawSize::Mib(mib)) => u64::try_from(*mib)
            .ok()
            .and_then(DiskSize::from_mib)
            .ok_or_else(|| invalid(format!("size {mib} must be positive")))?,
        Some(RawSize::Text(text)) => DiskSize::from_str(text).map_err(invalid)?,
    };

    if let Some(mode) = raw.mode.as_deref() {
        if mode != "rw" && mode != "ro" {
            return Err(invalid(format!(
                "access mode '{mode}' is not rw or ro"
            )));
        }
    }

    let provider = non_empty(&raw.provider);
    if template == DiskTemplate::Ext {
        if provider.is_none() {
            return Err(invalid("ext disks need a provider".to_string()));
        }
    } else if let Some(key) = raw.extra.keys().next() {
        return Err(invalid(format!("'{key}' is not a valid disk parameter")));
    }

    Ok(DiskSpec {
        size,
        name: non_empty(&raw.name),
        provider,
        mode: raw.mode.clone(),
        extra: raw.extra.clone(),
    })
}

fn normalize_nic(
    index: usize,
    raw: &RawNic,
) -> Result<NicSpec, ReconcileError> {
    let invalid =
        |msg: String| ReconcileError::validation(format!("nic {index}: {msg}"));

    if let Some(key) = raw.extra.keys().next() {
        return Err(invalid(format!("'{key}' is not a valid nic parameter")));
    }
    let mode = match raw.mode.as_deref() {
        None => return Err(invalid("no mode given".to_string())),
        Some(mode) => NicMode::from_str(mode)
            .map_err(|_| invalid(format!("invalid mode '{mode}'")))?,
    };
    if raw.vlan.is_some_and(|vlan| vlan > 4095) {
        return Err(invalid("vlan must be between 0 and 4095".to_string()));
    }

    Ok(NicSpec {
        mode,
        name: non_empty(&raw.name),
        link: non_empty(&raw.link),
        ip: non_empty(&raw.ip),
        mac: non_empty(&raw.mac),
        vlan: raw.vlan,
        network: non_empty(&raw.network),
        bridge: non_empty(&raw.bridge),
    })
}
