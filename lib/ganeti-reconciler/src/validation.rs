// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Enumerated values the cluster recognizes for disk templates, hypervisors
//! and NIC modes.
//!
//! The sets are fixed at compile time. Request normalization does not match on
//! them directly; it asks a [`ValidationData`] implementation, so callers that
//! know a cluster only enables a subset can narrow the accepted values.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Disk templates accepted by the RAPI as of Ganeti 2.16.
#[derive(
    Clone,
    Copy,
    Debug,
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
pub enum DiskTemplate {
    Sharedfile,
    Diskless,
    Plain,
    Gluster,
    Blockdev,
    Drbd,
    Ext,
    File,
    Rbd,
}

impl Default for DiskTemplate {
    fn default() -> Self {
        Self::Plain
    }
}

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Deserialize,
    Serialize,
    strum::Display,
    strum::EnumString,
    strum::VariantNames,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Hypervisor {
    Chroot,
    XenPvm,
    Kvm,
    XenHvm,
    Lxc,
    Fake,
}

impl Default for Hypervisor {
    fn default() -> Self {
        Self::Kvm
    }
}

#[derive(
    Clone,
    Copy,
    Debug,
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
pub enum NicMode {
    Routed,
    Bridged,
    Openvswitch,
}

/// Membership checks against the enumerated cluster values.
pub trait ValidationData: Send + Sync {
    fn is_valid_template(&self, name: &str) -> bool;
    fn is_valid_hypervisor(&self, name: &str) -> bool;
}

/// Accepts every value Ganeti itself knows about.
#[derive(Clone, Copy, Debug, Default)]
pub struct KnownValues;

/// The process-wide instance used when callers do not supply their own.
pub static KNOWN_VALUES: KnownValues = KnownValues;

impl ValidationData for KnownValues {
    fn is_valid_template(&self, name: &str) -> bool {
        DiskTemplate::from_str(name).is_ok()
    }

    fn is_valid_hypervisor(&self, name: &str) -> bool {
        Hypervisor::from_str(name).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::VariantNames;

    #[test]
    fn known_values_match_rapi_names() {
        assert!(KNOWN_VALUES.is_valid_template("drbd"));
        assert!(KNOWN_VALUES.is_valid_template("sharedfile"));
        assert!(!KNOWN_VALUES.is_valid_template("zfs"));
        assert!(KNOWN_VALUES.is_valid_hypervisor("xen-pvm"));
        assert!(KNOWN_VALUES.is_valid_hypervisor("kvm"));
        assert!(!KNOWN_VALUES.is_valid_hypervisor("xen_pvm"));

        assert_eq!(DiskTemplate::VARIANTS.len(), 9);
        assert_eq!(Hypervisor::XenHvm.to_string(), "xen-hvm");
        assert_eq!(
            NicMode::from_str("openvswitch").unwrap(),
            NicMode::Openvswitch
        );
    }
}
