// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Drives one reconciliation pass end to end.
//!
//! A pass normalizes the request, fetches the instance once, looks up the
//! lifecycle row, plans attribute changes, and submits the resulting
//! operations strictly one after another. The first failure ends the pass.
//! Nothing is retried or rolled back, and no state is kept between passes.

use std::sync::Arc;

use slog::{info, o, warn, Logger};

use crate::error::ReconcileError;
use crate::gateway::{
    Gateway, GatewayError, JobHandle, PowerStatus, PowerTarget,
    RemoteInstanceState,
};
use crate::lifecycle::{transition, Presence, Transition};
use crate::plan::{self, ChangeOperation};
use crate::report::{OutcomeStatus, ReconciliationResult, ResultReporter};
use crate::spec::{
    normalize, InstanceSpec, JobFlags, LifecycleState, Options,
    RawInstanceRequest,
};
use crate::validation::{ValidationData, KNOWN_VALUES};
use crate::waiter::{JobWaiter, WaitOutcome};

pub struct Reconciler<G: Gateway> {
    gateway: G,
    options: Options,
    known: Arc<dyn ValidationData>,
    log: Logger,
}

/// The instance as found at the start of a pass, and the name it was found
/// under.
struct Fetched {
    target: String,
    actual: Option<RemoteInstanceState>,
}

impl<G: Gateway> Reconciler<G> {
    pub fn new(gateway: G, options: Options, log: Logger) -> Self {
        Self {
            gateway,
            options,
            known: Arc::new(KNOWN_VALUES),
            log,
        }
    }

    /// Replaces the set of disk templates and hypervisors requests are
    /// validated against.
    pub fn with_validation_data(
        mut self,
        known: Arc<dyn ValidationData>,
    ) -> Self {
        self.known = known;
        self
    }

    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Normalizes `raw` and reconciles the instance it describes.
    pub async fn reconcile(
        &self,
        raw: &RawInstanceRequest,
    ) -> ReconciliationResult {
        match normalize(raw, &self.options, self.known.as_ref()) {
            Ok(spec) => self.reconcile_spec(&spec).await,
            Err(e) => {
                warn!(self.log, "rejected instance request"; "error" => %e);
                ResultReporter::default().finish(
                    self.options.check_mode,
                    Some(e),
                    String::new(),
                    None,
                )
            }
        }
    }

    /// Reconciles an already normalized spec.
    pub async fn reconcile_spec(
        &self,
        spec: &InstanceSpec,
    ) -> ReconciliationResult {
        let log = self.log.new(o!(
            "instance" => spec.name.clone(),
            "state" => spec.state.to_string(),
        ));
        let mut reporter = ResultReporter::default();

        let Fetched { target, actual } = match self.fetch(spec, &log).await {
            Ok(fetched) => fetched,
            Err(e) => return self.finish(&log, reporter, Err(e), None),
        };

        let ops = match self.plan(spec, &target, actual.as_ref()) {
            Ok(Some(ops)) => ops,
            Ok(None) => {
                let msg = format!("instance {target} is already absent");
                return self.finish(&log, reporter, Ok(msg), None);
            }
            Err(e) => return self.finish(&log, reporter, Err(e), actual),
        };

        if ops.is_empty() {
            let msg =
                format!("instance {target} is already in the desired state");
            return self.finish(&log, reporter, Ok(msg), actual);
        }

        if self.options.check_mode {
            let mut addressed = target.clone();
            for (i, op) in ops.iter().enumerate() {
                match op {
                    ChangeOperation::CreateInstance => {
                        addressed = create_name(spec).to_string()
                    }
                    ChangeOperation::Rename { new_name } => {
                        reporter.record(
                            i,
                            op,
                            &addressed,
                            Vec::new(),
                            OutcomeStatus::Planned,
                        );
                        addressed = new_name.clone();
                        continue;
                    }
                    _ => {}
                }
                reporter.record(
                    i,
                    op,
                    &addressed,
                    Vec::new(),
                    OutcomeStatus::Planned,
                );
            }
            info!(log, "check mode, nothing submitted";
                "operations" => ops.len());
            let msg = format!(
                "{} operation(s) would be applied to instance {target}",
                ops.len()
            );
            return self.finish(&log, reporter, Ok(msg), actual);
        }

        let was_running =
            actual.as_ref().is_some_and(|a| a.power == PowerStatus::Running);
        let (target, outcome) = self
            .execute(spec, target, was_running, &ops, &mut reporter, &log)
            .await;

        let instance = match self.gateway.fetch_instance(&target).await {
            Ok(instance) => instance,
            Err(e) => {
                warn!(log, "could not fetch instance after reconciling";
                    "error" => %e);
                None
            }
        };
        self.finish(&log, reporter, outcome, instance)
    }

    /// Fetches the instance, falling back to its new name when a previous
    /// pass already renamed it.
    async fn fetch(
        &self,
        spec: &InstanceSpec,
        log: &Logger,
    ) -> Result<Fetched, ReconcileError> {
        let actual = self.fetch_named(&spec.name).await?;
        if actual.is_some() || spec.state == LifecycleState::Absent {
            return Ok(Fetched { target: spec.name.clone(), actual });
        }
        if let Some(new_name) = &spec.new_name {
            if let Some(renamed) = self.fetch_named(new_name).await? {
                info!(log, "instance found under its new name";
                    "new_name" => new_name);
                return Ok(Fetched {
                    target: new_name.clone(),
                    actual: Some(renamed),
                });
            }
        }
        Ok(Fetched { target: spec.name.clone(), actual: None })
    }

    async fn fetch_named(
        &self,
        name: &str,
    ) -> Result<Option<RemoteInstanceState>, ReconcileError> {
        self.gateway.fetch_instance(name).await.map_err(|e| {
            ReconcileError::Remote {
                context: format!("fetching instance {name}"),
                message: e.to_string(),
            }
        })
    }

    /// Returns `None` when the lifecycle table says there is nothing to do.
    fn plan(
        &self,
        spec: &InstanceSpec,
        target: &str,
        actual: Option<&RemoteInstanceState>,
    ) -> Result<Option<Vec<ChangeOperation>>, ReconcileError> {
        let row = transition(target, spec.state, Presence::of(actual))?;
        let ops = match row {
            Transition::Unchanged => return Ok(None),
            Transition::Replace(op) => vec![op],
            Transition::Converge => plan::plan(spec, actual)?,
            Transition::Power(ops) => ops,
        };
        Ok(Some(ops))
    }

    async fn submit(
        &self,
        op: &ChangeOperation,
        target: &str,
        spec: &InstanceSpec,
        flags: &JobFlags,
    ) -> Result<JobHandle, GatewayError> {
        match op {
            ChangeOperation::CreateInstance => {
                self.gateway.submit_create(target, spec, flags).await
            }
            ChangeOperation::RemoveInstance => {
                self.gateway.submit_remove(target).await
            }
            ChangeOperation::SetPower { target: power } => {
                self.gateway.submit_power(target, *power).await
            }
            ChangeOperation::Migrate => {
                self.gateway.submit_migrate(target).await
            }
            _ => self.gateway.submit_modify(target, op, flags).await,
        }
    }

    /// Submits `ops` in order. Returns the name the instance ends up under
    /// and how the pass ended.
    async fn execute(
        &self,
        spec: &InstanceSpec,
        mut target: String,
        was_running: bool,
        ops: &[ChangeOperation],
        reporter: &mut ResultReporter,
        log: &Logger,
    ) -> (String, Result<String, ReconcileError>) {
        let flags = spec.job_flags(&self.options);
        let waiter = JobWaiter::new(
            &self.gateway,
            self.options.poll_interval(),
            log.clone(),
        );
        let timeout = self.options.job_timeout();
        let total = ops.len();
        let mut running = was_running;

        for (i, op) in ops.iter().enumerate() {
            if matches!(op, ChangeOperation::CreateInstance) {
                target = create_name(spec).to_string();
            }
            let context = format!(
                "operation {}/{} {} on instance {}",
                i + 1,
                total,
                op,
                target
            );

            let job = match self.submit(op, &target, spec, &flags).await {
                Ok(job) => job,
                Err(e) => {
                    warn!(log, "submission rejected";
                        "operation" => %op, "error" => %e);
                    reporter.record(
                        i,
                        op,
                        &target,
                        Vec::new(),
                        OutcomeStatus::Failed { reason: e.to_string() },
                    );
                    let err = ReconcileError::Remote {
                        context,
                        message: e.to_string(),
                    };
                    return (target, Err(err));
                }
            };
            info!(log, "submitted operation";
                "operation" => %op, "job" => %job);
            let jobs = job.jobs().to_vec();

            let status = if !self.options.wait {
                OutcomeStatus::Submitted
            } else {
                match waiter.wait(&job, timeout).await {
                    Ok(WaitOutcome::Success) => OutcomeStatus::Completed,
                    Ok(WaitOutcome::Failed(reason)) => {
                        warn!(log, "job failed";
                            "operation" => %op, "job" => %job,
                            "reason" => &reason);
                        reporter.record(
                            i,
                            op,
                            &target,
                            jobs,
                            OutcomeStatus::Failed { reason: reason.clone() },
                        );
                        let err =
                            ReconcileError::Remote { context, message: reason };
                        return (target, Err(err));
                    }
                    Ok(WaitOutcome::TimedOut) => {
                        warn!(log, "job timed out";
                            "operation" => %op, "job" => %job,
                            "timeout" => ?timeout);
                        reporter.record(
                            i,
                            op,
                            &target,
                            jobs,
                            OutcomeStatus::TimedOut,
                        );
                        let err = ReconcileError::TimedOut {
                            context,
                            job: job.to_string(),
                            timeout,
                        };
                        return (target, Err(err));
                    }
                    Err(e) => {
                        warn!(log, "polling job failed";
                            "operation" => %op, "job" => %job,
                            "error" => %e);
                        reporter.record(
                            i,
                            op,
                            &target,
                            jobs,
                            OutcomeStatus::Failed { reason: e.to_string() },
                        );
                        let err = ReconcileError::Remote {
                            context,
                            message: e.to_string(),
                        };
                        return (target, Err(err));
                    }
                }
            };
            reporter.record(i, op, &target, jobs, status);

            match op {
                ChangeOperation::Rename { new_name } => {
                    target = new_name.clone();
                }
                ChangeOperation::SetPower { target: PowerTarget::Off } => {
                    running = false;
                    reporter.clear_restart();
                }
                ChangeOperation::SetPower { target: PowerTarget::On } => {
                    running = true;
                }
                op if running && op.needs_restart_to_apply() => {
                    info!(log, "change takes effect after a restart";
                        "operation" => %op);
                    reporter.require_restart();
                }
                _ => {}
            }
        }

        let verb = if self.options.wait { "applied" } else { "submitted" };
        let msg = format!("{verb} {total} operation(s) to instance {target}");
        (target, Ok(msg))
    }

    fn finish(
        &self,
        log: &Logger,
        reporter: ResultReporter,
        outcome: Result<String, ReconcileError>,
        instance: Option<RemoteInstanceState>,
    ) -> ReconciliationResult {
        let (error, message) = match outcome {
            Ok(message) => {
                info!(log, "reconciliation finished"; "result" => &message);
                (None, message)
            }
            Err(e) => {
                warn!(log, "reconciliation failed";
                    "kind" => e.kind(), "error" => %e);
                (Some(e), String::new())
            }
        };
        reporter.finish(self.options.check_mode, error, message, instance)
    }
}

/// The name an instance is created under: its final name.
fn create_name(spec: &InstanceSpec) -> &str {
    spec.new_name.as_deref().unwrap_or(&spec.name)
}
