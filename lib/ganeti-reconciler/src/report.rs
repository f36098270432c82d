// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Results of a reconciliation pass and their serialized form.

use serde::Serialize;

use crate::error::ReconcileError;
use crate::gateway::{JobId, RemoteInstanceState};
use crate::plan::ChangeOperation;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OutcomeStatus {
    /// The job finished successfully.
    Completed,
    /// Accepted by the cluster; completion was not awaited.
    Submitted,
    /// Check mode: computed but never submitted.
    Planned,
    Failed { reason: String },
    TimedOut,
}

/// What happened to one operation of the plan.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct OperationOutcome {
    pub index: usize,
    pub operation: ChangeOperation,
    /// Rendered form of `operation`, e.g. `SetVcpus(+2)`.
    pub summary: String,
    /// The instance name the operation was addressed to.
    pub target: String,
    pub jobs: Vec<JobId>,
    #[serde(flatten)]
    pub status: OutcomeStatus,
}

impl OperationOutcome {
    /// Whether the cluster took the operation, finished or not.
    pub fn accepted(&self) -> bool {
        matches!(
            self.status,
            OutcomeStatus::Completed
                | OutcomeStatus::Submitted
                | OutcomeStatus::TimedOut
        )
    }
}

/// Everything a pass learned and did.
///
/// When `error` is set, `outcomes` still lists the operations that were
/// accepted before it; those are not undone.
#[derive(Debug)]
pub struct ReconciliationResult {
    pub changed: bool,
    pub outcomes: Vec<OperationOutcome>,
    pub error: Option<ReconcileError>,
    /// At least one applied change only takes effect after the instance is
    /// restarted, and the pass did not restart it.
    pub requires_restart: bool,
    pub message: String,
    /// The instance as fetched after the pass, when it could be fetched.
    pub instance: Option<RemoteInstanceState>,
}

impl ReconciliationResult {
    pub fn failed(&self) -> bool {
        self.error.is_some()
    }
}

/// Collects outcomes while a pass executes.
#[derive(Debug, Default)]
pub(crate) struct ResultReporter {
    outcomes: Vec<OperationOutcome>,
    requires_restart: bool,
}

impl ResultReporter {
    pub(crate) fn record(
        &mut self,
        index: usize,
        operation: &ChangeOperation,
        target: &str,
        jobs: Vec<JobId>,
        status: OutcomeStatus,
    ) {
        self.outcomes.push(OperationOutcome {
            index,
            operation: operation.clone(),
            summary: operation.to_string(),
            target: target.to_string(),
            jobs,
            status,
        });
    }

    pub(crate) fn require_restart(&mut self) {
        self.requires_restart = true;
    }

    /// A power off in the same pass picks the pending changes up.
    pub(crate) fn clear_restart(&mut self) {
        self.requires_restart = false;
    }

    pub(crate) fn finish(
        self,
        check_mode: bool,
        error: Option<ReconcileError>,
        message: String,
        instance: Option<RemoteInstanceState>,
    ) -> ReconciliationResult {
        let changed = if check_mode {
            !self.outcomes.is_empty()
        } else {
            self.outcomes.iter().any(OperationOutcome::accepted)
        };
        ReconciliationResult {
            changed,
            outcomes: self.outcomes,
            error,
            requires_restart: self.requires_restart,
            message,
            instance,
        }
    }
}

/// The JSON document handed back to whoever invoked the reconciliation.
#[derive(Debug, Serialize)]
pub struct InvocationOutput {
    pub changed: bool,
    pub failed: bool,
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<&'static str>,
    pub requires_restart: bool,
    pub operations: Vec<OperationOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<RemoteInstanceState>,
}

impl From<ReconciliationResult> for InvocationOutput {
    fn from(result: ReconciliationResult) -> Self {
        let (failed, msg, error_kind) = match &result.error {
            Some(err) => (true, err.to_string(), Some(err.kind())),
            None => (false, result.message.clone(), None),
        };
        InvocationOutput {
            changed: result.changed,
            failed,
            msg,
            error_kind,
            requires_restart: result.requires_restart,
            operations: result.outcomes,
            instance: result.instance,
        }
    }
}
