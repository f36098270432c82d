// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Maps a requested [`LifecycleState`] and what the cluster reports onto the
//! presence and power operations that move the instance between them.
//!
//! The mapping is a closed table. Every (request, observation) pair has
//! exactly one row in [`transition`], and the unit tests cover each row.
//!
//! | requested   | observed          | result                 |
//! |-------------|-------------------|------------------------|
//! | `present`   | absent            | create                 |
//! | `present`   | present           | converge attributes    |
//! | `absent`    | absent            | unchanged              |
//! | `absent`    | present           | remove                 |
//! | `started`   | absent            | not found              |
//! | `started`   | running           | nothing                |
//! | `started`   | stopped / unknown | power on               |
//! | `stopped`   | absent            | not found              |
//! | `stopped`   | stopped           | nothing                |
//! | `stopped`   | running / unknown | power off              |
//! | `restarted` | absent            | not found              |
//! | `restarted` | stopped           | power on               |
//! | `restarted` | running / unknown | power off, power on    |
//! | `migrated`  | absent            | not found              |
//! | `migrated`  | running           | migrate                |
//! | `migrated`  | stopped / unknown | precondition failure   |
//!
//! Only `present` compares attributes. The power states leave vCPUs, memory,
//! disks, NICs, tags and the name alone even when they differ.

use crate::error::ReconcileError;
use crate::gateway::{PowerStatus, PowerTarget, RemoteInstanceState};
use crate::plan::ChangeOperation;
use crate::spec::LifecycleState;

/// Whether the instance exists, and if so how it is powered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Presence {
    Absent,
    Present(PowerStatus),
}

impl Presence {
    pub fn of(actual: Option<&RemoteInstanceState>) -> Self {
        match actual {
            None => Presence::Absent,
            Some(state) => Presence::Present(state.power),
        }
    }
}

/// What the lifecycle table asks of a pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Transition {
    /// Nothing to do.
    Unchanged,

    /// Create or remove the instance. Attributes are not compared.
    Replace(ChangeOperation),

    /// Compare attributes and plan whatever differs.
    Converge,

    /// Run exactly these power or migration operations, without comparing
    /// attributes. Empty when the instance is already in the right state.
    Power(Vec<ChangeOperation>),
}

fn power(target: PowerTarget) -> ChangeOperation {
    ChangeOperation::SetPower { target }
}

/// Looks up the row for `requested` given what the cluster reports.
pub fn transition(
    name: &str,
    requested: LifecycleState,
    presence: Presence,
) -> Result<Transition, ReconcileError> {
    use LifecycleState as L;
    use PowerStatus as P;
    use Presence::*;

    let row = match (requested, presence) {
        (L::Present, Absent) => {
            Transition::Replace(ChangeOperation::CreateInstance)
        }
        (L::Present, Present(_)) => Transition::Converge,

        (L::Absent, Absent) => Transition::Unchanged,
        (L::Absent, Present(_)) => {
            Transition::Replace(ChangeOperation::RemoveInstance)
        }

        (
            L::Started | L::Stopped | L::Restarted | L::Migrated,
            Absent,
        ) => {
            return Err(ReconcileError::NotFound {
                name: name.to_string(),
                state: requested,
            })
        }

        (L::Started, Present(P::Running)) => Transition::Power(Vec::new()),
        (L::Started, Present(P::Stopped | P::Unknown)) => {
            Transition::Power(vec![power(PowerTarget::On)])
        }

        (L::Stopped, Present(P::Stopped)) => Transition::Power(Vec::new()),
        (L::Stopped, Present(P::Running | P::Unknown)) => {
            Transition::Power(vec![power(PowerTarget::Off)])
        }

        (L::Restarted, Present(P::Stopped)) => {
            Transition::Power(vec![power(PowerTarget::On)])
        }
        (L::Restarted, Present(P::Running | P::Unknown)) => {
            Transition::Power(vec![
                power(PowerTarget::Off),
                power(PowerTarget::On),
            ])
        }

        (L::Migrated, Present(P::Running)) => {
            Transition::Power(vec![ChangeOperation::Migrate])
        }
        (L::Migrated, Present(status @ (P::Stopped | P::Unknown))) => {
            return Err(ReconcileError::Precondition {
                name: name.to_string(),
                reason: format!(
                    "only running instances can be migrated, power status \
                    is {status:?}"
                ),
            })
        }
    };
    Ok(row)
}
