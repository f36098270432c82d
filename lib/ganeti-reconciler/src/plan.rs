// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Computes the ordered list of changes that converges an instance on the
//! cluster toward its desired state.
//!
//! Fields are compared in a fixed order: rename, vCPUs, memory, disks, NICs,
//! tags. The cluster runs jobs for one instance sequentially and later steps
//! assume earlier ones have landed, so the order is part of the contract.
//! Planning either yields the whole plan or fails without any of it; a policy
//! violation anywhere means nothing is submitted.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;

use serde::Serialize;

use crate::error::ReconcileError;
use crate::gateway::{
    PowerStatus, PowerTarget, RemoteInstanceState, RemoteNic,
};
use crate::spec::{DiskSpec, InstanceSpec, LifecycleState, NicSpec};

/// One atomic change, submitted to the cluster as one job handle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ChangeOperation {
    CreateInstance,
    RemoveInstance,
    Rename { new_name: String },
    SetVcpus { from: Option<u32>, to: u32 },
    SetMemory { from: Option<u64>, to: u64 },
    AddDisk { index: usize, disk: DiskSpec },
    GrowDisk { index: usize, from_mib: u64, to_mib: u64 },
    AddNic { index: usize, nic: NicSpec },
    RemoveNic { index: usize },
    SetTags { added: BTreeSet<String>, removed: BTreeSet<String> },
    SetPower { target: PowerTarget },
    Migrate,
}

impl ChangeOperation {
    /// Whether the change only takes effect once a running instance has been
    /// restarted. The engine reports this but never restarts on its own.
    pub fn needs_restart_to_apply(&self) -> bool {
        matches!(
            self,
            ChangeOperation::SetVcpus { .. }
                | ChangeOperation::SetMemory { .. }
                | ChangeOperation::AddDisk { .. }
                | ChangeOperation::GrowDisk { .. }
                | ChangeOperation::AddNic { .. }
                | ChangeOperation::RemoveNic { .. }
        )
    }
}

fn signed_delta(from: Option<u64>, to: u64) -> String {
    match from {
        None => format!("={to}"),
        Some(from) => match to.cmp(&from) {
            Ordering::Less => format!("-{}", from - to),
            _ => format!("+{}", to - from),
        },
    }
}

impl fmt::Display for ChangeOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeOperation::CreateInstance => write!(f, "CreateInstance"),
            ChangeOperation::RemoveInstance => write!(f, "RemoveInstance"),
            ChangeOperation::Rename { new_name } => {
                write!(f, "Rename({new_name})")
            }
            ChangeOperation::SetVcpus { from, to } => write!(
                f,
                "SetVcpus({})",
                signed_delta(from.map(u64::from), u64::from(*to))
            ),
            ChangeOperation::SetMemory { from, to } => {
                write!(f, "SetMemory({})", signed_delta(*from, *to))
            }
            ChangeOperation::AddDisk { index, disk } => {
                write!(f, "AddDisk(index {index}, {})", disk.size)
            }
            ChangeOperation::GrowDisk { index, from_mib, to_mib } => write!(
                f,
                "GrowDisk(index {index}, {from_mib} -> {to_mib} MiB)"
            ),
            ChangeOperation::AddNic { index, nic } => {
                write!(f, "AddNic(index {index}, {})", nic.mode)
            }
            ChangeOperation::RemoveNic { index } => {
                write!(f, "RemoveNic(index {index})")
            }
            ChangeOperation::SetTags { added, removed } => write!(
                f,
                "SetTags(+{}, -{})",
                added.len(),
                removed.len()
            ),
            ChangeOperation::SetPower { target } => {
                write!(f, "SetPower({target})")
            }
            ChangeOperation::Migrate => write!(f, "Migrate"),
        }
    }
}

/// Plans the presence-level and attribute-level changes for `desired`.
///
/// An absent instance is created when the requested state needs one; a
/// present instance is removed when `absent` is requested and otherwise
/// diffed field by field.
pub fn plan(
    desired: &InstanceSpec,
    actual: Option<&RemoteInstanceState>,
) -> Result<Vec<ChangeOperation>, ReconcileError> {
    match (actual, desired.state) {
        (None, LifecycleState::Absent) => Ok(Vec::new()),
        (None, _) => Ok(vec![ChangeOperation::CreateInstance]),
        (Some(_), LifecycleState::Absent) => {
            Ok(vec![ChangeOperation::RemoveInstance])
        }
        (Some(actual), _) => diff(desired, actual),
    }
}

/// Compares an existing instance against its desired state.
pub fn diff(
    desired: &InstanceSpec,
    actual: &RemoteInstanceState,
) -> Result<Vec<ChangeOperation>, ReconcileError> {
    let mut ops = Vec::new();
    let name = &actual.name;

    if let Some(new_name) = &desired.new_name {
        if new_name != name {
            if actual.power != PowerStatus::Stopped {
                return Err(ReconcileError::Precondition {
                    name: name.clone(),
                    reason: format!(
                        "instance needs to be stopped to be renamed, \
                        status {}",
                        actual.status
                    ),
                });
            }
            ops.push(ChangeOperation::Rename { new_name: new_name.clone() });
        }
    }

    if let Some(vcpus) = desired.vcpus {
        if actual.vcpus != Some(vcpus) {
            ops.push(ChangeOperation::SetVcpus {
                from: actual.vcpus,
                to: vcpus,
            });
        }
    }

    if let Some(memory) = desired.memory {
        if actual.memory != Some(memory) {
            ops.push(ChangeOperation::SetMemory {
                from: actual.memory,
                to: memory,
            });
        }
    }

    if let Some(disks) = &desired.disks {
        for (index, disk) in disks.iter().enumerate() {
            let Some(current) = actual.disks.get(index) else {
                ops.push(ChangeOperation::AddDisk {
                    index,
                    disk: disk.clone(),
                });
                continue;
            };
            let wanted = disk.size.as_mib();
            match wanted.cmp(&current.size_mib) {
                Ordering::Equal => {}
                Ordering::Greater => ops.push(ChangeOperation::GrowDisk {
                    index,
                    from_mib: current.size_mib,
                    to_mib: wanted,
                }),
                Ordering::Less => {
                    return Err(ReconcileError::UnsupportedShrink {
                        name: name.clone(),
                        index,
                        actual_mib: current.size_mib,
                        desired_mib: wanted,
                    })
                }
            }
        }
        // Disks beyond the desired list are left alone: removal is not
        // something this engine does.
    }

    if let Some(nics) = &desired.nics {
        for (index, (nic, current)) in nics.iter().zip(&actual.nics).enumerate()
        {
            if let Some(field) = nic_mismatch(nic, current) {
                return Err(ReconcileError::UnsupportedChange {
                    name: name.clone(),
                    reason: format!(
                        "nic {index} differs in '{field}'; only adding or \
                        removing nics at the end of the list is supported"
                    ),
                });
            }
        }
        for (index, nic) in nics.iter().enumerate().skip(actual.nics.len()) {
            ops.push(ChangeOperation::AddNic { index, nic: nic.clone() });
        }
        for index in (nics.len()..actual.nics.len()).rev() {
            ops.push(ChangeOperation::RemoveNic { index });
        }
    }

    if let Some(group) = &desired.placement.group_name {
        if actual.group.as_ref() != Some(group) {
            return Err(ReconcileError::UnsupportedChange {
                name: name.clone(),
                reason: format!(
                    "moving the instance to node group {group} is not \
                    supported by the remote API; run `gnt-instance \
                    change-group --to={group} {name}` and reconcile again"
                ),
            });
        }
    }

    if let Some(tags) = &desired.tags {
        let added: BTreeSet<String> =
            tags.difference(&actual.tags).cloned().collect();
        let removed: BTreeSet<String> =
            actual.tags.difference(tags).cloned().collect();
        if !added.is_empty() || !removed.is_empty() {
            ops.push(ChangeOperation::SetTags { added, removed });
        }
    }

    Ok(ops)
}

/// Returns the first attribute the caller specified for `nic` that the
/// cluster reports differently. A requested MAC of `generate` matches any.
fn nic_mismatch(nic: &NicSpec, current: &RemoteNic) -> Option<&'static str> {
    fn differs<T: PartialEq>(wanted: &Option<T>, actual: &Option<T>) -> bool {
        wanted.as_ref().is_some_and(|w| Some(w) != actual.as_ref())
    }

    if current.mode.is_some_and(|mode| mode != nic.mode) {
        return Some("mode");
    }
    if differs(&nic.name, &current.name) {
        return Some("name");
    }
    if differs(&nic.link, &current.link) {
        return Some("link");
    }
    if differs(&nic.ip, &current.ip) {
        return Some("ip");
    }
    if nic.mac.as_deref() != Some("generate") && differs(&nic.mac, &current.mac)
    {
        return Some("mac");
    }
    if differs(&nic.vlan, &current.vlan) {
        return Some("vlan");
    }
    if differs(&nic.network, &current.network) {
        return Some("network");
    }
    // `bridge` is the older spelling of a bridged NIC's link.
    let bridge = current.bridge.as_ref().or(current.link.as_ref());
    if nic.bridge.as_ref().is_some_and(|b| Some(b) != bridge) {
        return Some("bridge");
    }
    None
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    use proptest::prelude::*;

    #[test]
    fn absent_instances_are_created_or_left_alone() {
        let desired = spec("web1");
        assert_eq!(
            plan(&desired, None).unwrap(),
            vec![ChangeOperation::CreateInstance]
        );

        let mut desired = spec("web1");
        desired.state = LifecycleState::Absent;
        assert!(plan(&desired, None).unwrap().is_empty());
        let actual = remote("web1", PowerStatus::Running);
        assert_eq!(
            plan(&desired, Some(&actual)).unwrap(),
            vec![ChangeOperation::RemoveInstance]
        );
    }

    #[test]
    fn converged_instance_plans_nothing() {
        let actual = remote("web1", PowerStatus::Running);
        let mut desired = spec("web1");
        desired.vcpus = Some(2);
        desired.memory = Some(1024);
        desired.disks = Some(vec![disk(10240), disk(20480)]);
        desired.nics = Some(vec![nic("br0")]);
        desired.tags = Some(BTreeSet::from(["env:prod".to_string()]));
        desired.placement.group_name = Some("default".to_string());
        assert!(diff(&desired, &actual).unwrap().is_empty());
    }

    #[test]
    fn vcpus_and_new_disk() {
        let actual = remote("web1", PowerStatus::Running);
        let mut desired = spec("web1");
        desired.vcpus = Some(4);
        desired.memory = Some(1024);
        desired.disks = Some(vec![disk(10240), disk(20480), disk(4096)]);

        let ops = diff(&desired, &actual).unwrap();
        assert_eq!(
            ops,
            vec![
                ChangeOperation::SetVcpus { from: Some(2), to: 4 },
                ChangeOperation::AddDisk { index: 2, disk: disk(4096) },
            ]
        );
        assert_eq!(ops[0].to_string(), "SetVcpus(+2)");
        assert_eq!(ops[1].to_string(), "AddDisk(index 2, 4096 MiB)");
    }

    #[test]
    fn scalar_changes_go_either_direction() {
        let actual = remote("web1", PowerStatus::Running);
        let mut desired = spec("web1");
        desired.vcpus = Some(1);
        desired.memory = Some(512);
        let ops = diff(&desired, &actual).unwrap();
        assert_eq!(ops[0].to_string(), "SetVcpus(-1)");
        assert_eq!(ops[1].to_string(), "SetMemory(-512)");
    }

    #[test]
    fn rename_comes_first_and_needs_a_stopped_instance() {
        let mut desired = spec("web1");
        desired.new_name = Some("web2".to_string());
        desired.vcpus = Some(4);
        desired.memory = Some(2048);
        desired.disks = Some(vec![disk(20480)]);
        desired.tags = Some(BTreeSet::new());

        let stopped = remote("web1", PowerStatus::Stopped);
        let ops = diff(&desired, &stopped).unwrap();
        assert_eq!(
            ops.iter().map(ToString::to_string).collect::<Vec<_>>(),
            vec![
                "Rename(web2)",
                "SetVcpus(+2)",
                "SetMemory(+1024)",
                "GrowDisk(index 0, 10240 -> 20480 MiB)",
                "SetTags(+0, -1)",
            ]
        );

        for power in [PowerStatus::Running, PowerStatus::Unknown] {
            let err = diff(&desired, &remote("web1", power)).unwrap_err();
            assert_eq!(err.kind(), "PreconditionError");
        }
    }

    #[test]
    fn rename_already_applied_is_not_repeated() {
        let mut desired = spec("web1");
        desired.new_name = Some("web2".to_string());
        let renamed = remote("web2", PowerStatus::Running);
        assert!(diff(&desired, &renamed).unwrap().is_empty());
    }

    #[test]
    fn shrinking_a_disk_fails_the_whole_plan() {
        let actual = remote("web1", PowerStatus::Stopped);
        let mut desired = spec("web1");
        desired.vcpus = Some(8);
        desired.disks = Some(vec![disk(10240), disk(1024), disk(4096)]);
        match diff(&desired, &actual) {
            Err(ReconcileError::UnsupportedShrink {
                index, actual_mib, desired_mib, ..
            }) => {
                assert_eq!(index, 1);
                assert_eq!(actual_mib, 20480);
                assert_eq!(desired_mib, 1024);
            }
            other => panic!("unexpected plan: {other:?}"),
        }
    }

    #[test]
    fn extra_disks_on_the_cluster_are_left_alone() {
        let actual = remote("web1", PowerStatus::Running);
        let mut desired = spec("web1");
        desired.disks = Some(vec![disk(10240)]);
        assert!(diff(&desired, &actual).unwrap().is_empty());
    }

    #[test]
    fn nics_change_only_at_the_tail() {
        let mut actual = remote("web1", PowerStatus::Running);
        let mut desired = spec("web1");
        desired.nics = Some(vec![nic("br0"), nic("br1"), nic("br2")]);
        assert_eq!(
            diff(&desired, &actual).unwrap(),
            vec![
                ChangeOperation::AddNic { index: 1, nic: nic("br1") },
                ChangeOperation::AddNic { index: 2, nic: nic("br2") },
            ]
        );

        actual.nics =
            vec![remote_nic("br0"), remote_nic("br1"), remote_nic("br2")];
        desired.nics = Some(vec![nic("br0")]);
        assert_eq!(
            diff(&desired, &actual).unwrap(),
            vec![
                ChangeOperation::RemoveNic { index: 2 },
                ChangeOperation::RemoveNic { index: 1 },
            ]
        );

        desired.nics = Some(vec![nic("br0"), nic("br9")]);
        let err = diff(&desired, &actual).unwrap_err();
        assert_eq!(err.kind(), "UnsupportedChangeError");
        assert!(err.to_string().contains("nic 1 differs in 'link'"));
    }

    #[test]
    fn bridge_matches_the_link_of_a_bridged_nic() {
        let actual = remote("web1", PowerStatus::Running);
        let mut desired = spec("web1");
        let mut bridged = nic("br0");
        bridged.bridge = Some("br0".to_string());
        desired.nics = Some(vec![bridged.clone()]);
        assert!(diff(&desired, &actual).unwrap().is_empty());

        bridged.bridge = Some("br7".to_string());
        desired.nics = Some(vec![bridged]);
        let err = diff(&desired, &actual).unwrap_err();
        assert!(err.to_string().contains("nic 0 differs in 'bridge'"));
    }

    #[test]
    fn generated_macs_match_any_address() {
        let actual = remote("web1", PowerStatus::Running);
        let mut desired = spec("web1");
        let mut wanted = nic("br0");
        wanted.mac = Some("generate".to_string());
        desired.nics = Some(vec![wanted.clone()]);
        assert!(diff(&desired, &actual).unwrap().is_empty());

        wanted.mac = Some("aa:00:00:00:00:01".to_string());
        desired.nics = Some(vec![wanted]);
        assert!(diff(&desired, &actual).is_err());
    }

    #[test]
    fn node_group_moves_are_refused() {
        let actual = remote("web1", PowerStatus::Running);
        let mut desired = spec("web1");
        desired.placement.group_name = Some("rack2".to_string());
        let err = diff(&desired, &actual).unwrap_err();
        assert!(err.to_string().contains("change-group --to=rack2 web1"));
    }

    #[test]
    fn tags_are_one_operation_with_both_sets() {
        let actual = remote("web1", PowerStatus::Running);
        let mut desired = spec("web1");
        desired.tags = Some(BTreeSet::from(["role:db".to_string()]));
        assert_eq!(
            diff(&desired, &actual).unwrap(),
            vec![ChangeOperation::SetTags {
                added: BTreeSet::from(["role:db".to_string()]),
                removed: BTreeSet::from(["env:prod".to_string()]),
            }]
        );
    }

    fn rank(op: &ChangeOperation) -> u8 {
        match op {
            ChangeOperation::Rename { .. } => 0,
            ChangeOperation::SetVcpus { .. } => 1,
            ChangeOperation::SetMemory { .. } => 2,
            ChangeOperation::AddDisk { .. }
            | ChangeOperation::GrowDisk { .. } => 3,
            ChangeOperation::AddNic { .. }
            | ChangeOperation::RemoveNic { .. } => 4,
            ChangeOperation::SetTags { .. } => 5,
            _ => 6,
        }
    }

    /// Applies a plan to a snapshot the way the cluster would.
    fn apply(actual: &mut RemoteInstanceState, ops: &[ChangeOperation]) {
        for op in ops {
            match op {
                ChangeOperation::Rename { new_name } => {
                    actual.name = new_name.clone()
                }
                ChangeOperation::SetVcpus { to, .. } => {
                    actual.vcpus = Some(*to)
                }
                ChangeOperation::SetMemory { to, .. } => {
                    actual.memory = Some(*to)
                }
                ChangeOperation::AddDisk { disk, .. } => {
                    actual.disks.push(crate::gateway::RemoteDisk {
                        size_mib: disk.size.as_mib(),
                        name: None,
                    })
                }
                ChangeOperation::GrowDisk { index, to_mib, .. } => {
                    actual.disks[*index].size_mib = *to_mib
                }
                ChangeOperation::AddNic { nic, .. } => {
                    actual.nics.push(remote_nic(nic.link.as_deref().unwrap()))
                }
                ChangeOperation::RemoveNic { index } => {
                    actual.nics.remove(*index);
                }
                ChangeOperation::SetTags { added, removed } => {
                    actual.tags.extend(added.iter().cloned());
                    actual.tags.retain(|t| !removed.contains(t));
                }
                other => panic!("unexpected operation {other}"),
            }
        }
    }

    proptest! {
        #[test]
        fn plans_are_ordered_and_converge(
            vcpus in proptest::option::of(1u32..16),
            memory in proptest::option::of(256u64..8192),
            growth in proptest::collection::vec(0u64..4096, 0..5),
            nic_count in 0usize..4,
            tags in proptest::collection::btree_set("[a-c]{1,2}", 0..4),
            rename in any::<bool>(),
        ) {
            let mut actual = remote("web1", PowerStatus::Stopped);
            let mut desired = spec("web1");
            desired.vcpus = vcpus;
            desired.memory = memory;
            desired.disks = Some(
                growth
                    .iter()
                    .enumerate()
                    .map(|(i, extra)| {
                        let base =
                            actual.disks.get(i).map_or(1024, |d| d.size_mib);
                        disk(base + extra)
                    })
                    .collect(),
            );
            desired.nics = Some(
                (0..nic_count).map(|i| nic(&format!("br{i}"))).collect(),
            );
            desired.tags = Some(tags);
            if rename {
                desired.new_name = Some("web2".to_string());
            }

            let ops = diff(&desired, &actual).unwrap();
            let ranks: Vec<u8> = ops.iter().map(rank).collect();
            prop_assert!(ranks.windows(2).all(|w| w[0] <= w[1]));
            prop_assert!(ops.iter().all(|op| rank(op) < 6));

            apply(&mut actual, &ops);
            prop_assert!(diff(&desired, &actual).unwrap().is_empty());
        }

        #[test]
        fn shrinking_never_yields_a_plan(
            index in 0usize..2,
            shrink in 1u64..10240,
        ) {
            let actual = remote("web1", PowerStatus::Running);
            let mut sizes: Vec<u64> =
                actual.disks.iter().map(|d| d.size_mib).collect();
            sizes[index] -= shrink;
            let mut desired = spec("web1");
            desired.disks = Some(sizes.into_iter().map(disk).collect());
            let is_shrink = matches!(
                diff(&desired, &actual),
                Err(ReconcileError::UnsupportedShrink { .. })
            );
            prop_assert!(is_shrink);
        }
    }
}
