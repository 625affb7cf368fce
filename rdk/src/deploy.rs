//! Orchestration for `rdk deploy`, `rdk destroy` and `rdk wait`.
//!
//! A run moves through four phases: survey and diff, bootstrap, apply, and
//! completion. Every unit touched by the apply phase is waited on, even when
//! an earlier unit already failed.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use crate::core::lifecycle::{UnitEvent, UnitState};
use crate::core::planner::{DiffVerdict, build_deploy_plan, build_destroy_plan};
use crate::core::poll::PollPolicy;
use crate::core::status::{RemoteStackStatus, StackOutcome};
use crate::core::types::{ActionKind, DeployableUnit, DeploymentPlan};
use crate::exit_codes;
use crate::io::cdk::CdkTool;
use crate::io::ledger::{
    PendingOperation, PendingOperations, PendingStack, clear_pending, write_pending,
};
use crate::io::process::CommandRunner;
use crate::io::stack_api::{StackApi, UpdateOutcome};
use crate::wait::{Sleeper, StackWaiter, WaitError};

/// Tool that performs the apply phase.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum ApplyBackend {
    /// One `cdk deploy`/`cdk destroy` for the whole batch.
    #[default]
    Cdk,
    /// Direct create/update/delete calls, one per unit.
    #[value(name = "cloudformation")]
    CloudFormation,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeployOptions {
    pub backend: ApplyBackend,
    pub skip_diff: bool,
    pub skip_bootstrap: bool,
    /// Stop after planning.
    pub dry_run: bool,
}

/// Final state of one touched unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitResult {
    pub unit_name: String,
    pub stack_name: String,
    pub action: ActionKind,
    pub state: UnitState,
    /// Last remote status seen for the unit.
    pub last_status: Option<String>,
    /// False when waiting stopped before the unit reached a terminal state.
    pub terminal: bool,
}

impl UnitResult {
    fn new(unit_name: &str, stack_name: &str, action: ActionKind, state: UnitState) -> Self {
        Self {
            unit_name: unit_name.to_string(),
            stack_name: stack_name.to_string(),
            action,
            state,
            last_status: None,
            terminal: false,
        }
    }

    fn apply(&mut self, event: UnitEvent) -> Result<()> {
        let next = self
            .state
            .transition(event)
            .with_context(|| format!("unit {}", self.unit_name))?;
        debug!(rule = %self.unit_name, from = %self.state, to = %next, "unit transition");
        self.state = next;
        Ok(())
    }

    pub fn failed(&self) -> bool {
        !self.terminal || self.state.is_failure()
    }
}

/// Outcome of one orchestrated command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub plan: DeploymentPlan,
    pub dry_run: bool,
    pub results: Vec<UnitResult>,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.results.iter().all(|result| !result.failed())
    }

    pub fn exit_code(&self) -> i32 {
        if self.succeeded() {
            exit_codes::OK
        } else {
            exit_codes::FAILED
        }
    }
}

struct Surveyed {
    unit: DeployableUnit,
    remote: Option<RemoteStackStatus>,
    verdict: DiffVerdict,
}

pub struct Orchestrator<'a, R, A: ?Sized, S: ?Sized> {
    cdk: &'a CdkTool<R>,
    api: &'a A,
    waiter: StackWaiter<'a, A, S>,
    options: DeployOptions,
    ledger_path: Option<PathBuf>,
}

impl<'a, R, A, S> Orchestrator<'a, R, A, S>
where
    R: CommandRunner,
    A: StackApi + ?Sized,
    S: Sleeper + ?Sized,
{
    pub fn new(
        cdk: &'a CdkTool<R>,
        api: &'a A,
        sleeper: &'a S,
        policy: PollPolicy,
        options: DeployOptions,
    ) -> Self {
        Self {
            cdk,
            api,
            waiter: StackWaiter::new(api, sleeper, policy),
            options,
            ledger_path: None,
        }
    }

    /// Persist touched stacks here while a run is in flight.
    pub fn with_ledger(mut self, path: impl Into<PathBuf>) -> Self {
        self.ledger_path = Some(path.into());
        self
    }

    /// Survey and diff only.
    pub fn plan(&self, units: &[DeployableUnit]) -> Result<DeploymentPlan> {
        let surveyed = self.survey(units)?;
        Ok(deploy_plan(&surveyed))
    }

    /// Deploy every unit that is missing or changed and wait for the result.
    #[instrument(skip_all, fields(units = units.len(), backend = ?self.options.backend))]
    pub fn plan_and_apply(&self, units: &[DeployableUnit]) -> Result<RunReport> {
        let surveyed = self.survey(units)?;
        let plan = deploy_plan(&surveyed);
        log_plan(&plan);
        if plan.is_empty() {
            info!("No changes to deploy.");
            return Ok(self.planned(plan));
        }
        if self.options.dry_run {
            info!("Dry run: nothing applied.");
            return Ok(self.planned(plan));
        }

        let mut results: Vec<UnitResult> = Vec::new();
        for (entry, survey) in plan.entries.iter().zip(&surveyed) {
            // Unchanged units make no transition and are not reported.
            if entry.action == ActionKind::Skip {
                continue;
            }
            let start = UnitState::from_remote(survey.remote.as_ref());
            let mut result =
                UnitResult::new(entry.unit.name(), entry.unit.stack_name(), entry.action, start);
            result.apply(match entry.action {
                ActionKind::Create => UnitEvent::BeginCreate,
                _ => UnitEvent::BeginUpdate,
            })?;
            results.push(result);
        }
        let touched = plan.actionable_units();

        if self.options.backend == ApplyBackend::Cdk && !self.options.skip_bootstrap {
            self.cdk.bootstrap(&touched).context("bootstrap")?;
        }
        self.record_pending(PendingOperation::Deploy, &results)?;

        let mut awaiting = vec![true; results.len()];
        match self.options.backend {
            ApplyBackend::Cdk => {
                info!(count = touched.len(), "deploying");
                self.cdk.deploy(&touched).context("deploy")?;
            }
            ApplyBackend::CloudFormation => {
                for ((unit, result), wait) in touched.iter().zip(&mut results).zip(&mut awaiting) {
                    if result.action == ActionKind::Create {
                        info!(rule = %unit.name(), "creating stack");
                        self.api
                            .create_stack(unit)
                            .with_context(|| format!("create {}", unit.stack_name()))?;
                        continue;
                    }
                    info!(rule = %unit.name(), "updating stack");
                    let outcome = self
                        .api
                        .update_stack(unit)
                        .with_context(|| format!("update {}", unit.stack_name()))?;
                    if outcome == UpdateOutcome::NoChangesRequired {
                        info!(rule = %unit.name(), "No updates are to be performed.");
                        result.apply(UnitEvent::NoChanges)?;
                        result.terminal = true;
                        *wait = false;
                    }
                }
            }
        }

        self.complete(&mut results, &awaiting, false)?;
        Ok(self.finish(plan, results))
    }

    /// Delete every deployed unit and wait until they are gone.
    #[instrument(skip_all, fields(units = units.len(), backend = ?self.options.backend))]
    pub fn destroy(&self, units: &[DeployableUnit]) -> Result<RunReport> {
        let mut surveyed = Vec::with_capacity(units.len());
        for unit in units {
            let remote = self.describe(unit)?;
            surveyed.push((unit.clone(), remote));
        }
        let plan = build_destroy_plan(
            surveyed
                .iter()
                .map(|(unit, remote)| (unit.clone(), is_deployed(remote.as_ref())))
                .collect(),
        );
        log_plan(&plan);
        if plan.is_empty() {
            info!("Nothing to destroy.");
            return Ok(self.planned(plan));
        }
        if self.options.dry_run {
            info!("Dry run: nothing destroyed.");
            return Ok(self.planned(plan));
        }

        let mut results = Vec::new();
        for (entry, (_, remote)) in plan.entries.iter().zip(&surveyed) {
            if entry.action == ActionKind::Skip {
                continue;
            }
            let mut result = UnitResult::new(
                entry.unit.name(),
                entry.unit.stack_name(),
                entry.action,
                UnitState::from_remote(remote.as_ref()),
            );
            result.apply(UnitEvent::BeginDestroy)?;
            results.push(result);
        }
        let touched = plan.actionable_units();
        self.record_pending(PendingOperation::Destroy, &results)?;

        match self.options.backend {
            ApplyBackend::Cdk => {
                info!(count = touched.len(), "destroying");
                self.cdk.destroy(&touched).context("destroy")?;
            }
            ApplyBackend::CloudFormation => {
                for unit in &touched {
                    info!(rule = %unit.name(), "deleting stack");
                    self.api
                        .delete_stack(unit.stack_name())
                        .with_context(|| format!("delete {}", unit.stack_name()))?;
                }
            }
        }

        let awaiting = vec![true; results.len()];
        self.complete(&mut results, &awaiting, true)?;
        Ok(self.finish(plan, results))
    }

    /// Completion phase only, for stacks left pending by an earlier run.
    #[instrument(skip_all, fields(operation = ?pending.operation, stacks = pending.stacks.len()))]
    pub fn resume(&self, pending: &PendingOperations) -> Result<RunReport> {
        let destroying = pending.operation == PendingOperation::Destroy;
        let mut results: Vec<UnitResult> = pending
            .stacks
            .iter()
            .map(|stack| {
                let state = match stack.action {
                    ActionKind::Create => UnitState::Deploying,
                    ActionKind::Destroy => UnitState::Destroying,
                    _ => UnitState::Updating,
                };
                UnitResult::new(&stack.unit_name, &stack.stack_name, stack.action, state)
            })
            .collect();
        let awaiting = vec![true; results.len()];
        self.complete(&mut results, &awaiting, destroying)?;
        Ok(self.finish(DeploymentPlan::default(), results))
    }

    fn survey(&self, units: &[DeployableUnit]) -> Result<Vec<Surveyed>> {
        let mut surveyed = Vec::with_capacity(units.len());
        for unit in units {
            let remote = self.describe(unit)?;
            let verdict = if !is_deployed(remote.as_ref()) {
                info!(rule = %unit.name(), "not deployed; will create");
                DiffVerdict::NotDeployed
            } else if self.options.skip_diff || self.options.backend == ApplyBackend::CloudFormation
            {
                DiffVerdict::Changed
            } else {
                self.cdk
                    .diff(unit)
                    .with_context(|| format!("diff {}", unit.name()))?
            };
            surveyed.push(Surveyed {
                unit: unit.clone(),
                remote,
                verdict,
            });
        }
        Ok(surveyed)
    }

    fn describe(&self, unit: &DeployableUnit) -> Result<Option<RemoteStackStatus>> {
        let remote = self
            .api
            .describe_stack(unit.stack_name())
            .with_context(|| format!("describe {}", unit.stack_name()))?;
        debug!(rule = %unit.name(), status = ?remote.as_ref().map(|s| s.status.as_str()), "described");
        Ok(remote)
    }

    /// Wait on every awaiting unit. Terminal failures do not stop the loop;
    /// remote errors do.
    fn complete(
        &self,
        results: &mut [UnitResult],
        awaiting: &[bool],
        destroying: bool,
    ) -> Result<()> {
        for (result, _) in results.iter_mut().zip(awaiting).filter(|(_, wait)| **wait) {
            let report = match self.waiter.wait_for_terminal(&result.stack_name) {
                Ok(report) => report,
                Err(WaitError::PollLimitExceeded { last_status, .. }) => {
                    error!(rule = %result.unit_name, status = %last_status, "gave up waiting");
                    result.last_status = Some(last_status);
                    continue;
                }
                Err(err) => {
                    return Err(err).with_context(|| format!("wait for {}", result.stack_name));
                }
            };
            result.last_status = report.status.as_ref().map(|s| s.status.clone());
            let mut outcome = report.outcome;
            if destroying && outcome.is_success() && report.status.is_some() {
                error!(rule = %result.unit_name, status = ?result.last_status, "stack still present after destroy");
                outcome = StackOutcome::Failed;
            }
            result.apply(UnitEvent::Finished(outcome))?;
            result.terminal = true;
            if result.state.is_failure() {
                error!(rule = %result.unit_name, state = %result.state, "unit did not complete");
            } else {
                info!(rule = %result.unit_name, state = %result.state, "unit complete");
            }
        }
        Ok(())
    }

    fn record_pending(&self, operation: PendingOperation, results: &[UnitResult]) -> Result<()> {
        let Some(path) = &self.ledger_path else {
            return Ok(());
        };
        let pending = PendingOperations {
            operation,
            stacks: results
                .iter()
                .map(|result| PendingStack {
                    unit_name: result.unit_name.clone(),
                    stack_name: result.stack_name.clone(),
                    action: result.action,
                })
                .collect(),
        };
        write_pending(path, &pending)
    }

    fn planned(&self, plan: DeploymentPlan) -> RunReport {
        RunReport {
            plan,
            dry_run: self.options.dry_run,
            results: Vec::new(),
        }
    }

    fn finish(&self, plan: DeploymentPlan, results: Vec<UnitResult>) -> RunReport {
        let all_terminal = results.iter().all(|result| result.terminal);
        if let Some(path) = &self.ledger_path {
            if all_terminal {
                if let Err(err) = clear_pending(path) {
                    warn!(err = %err, "failed to clear pending ledger");
                }
            } else {
                warn!(path = %path.display(), "some stacks are still in progress; run `rdk wait` to resume");
            }
        }
        RunReport {
            plan,
            dry_run: false,
            results,
        }
    }
}

fn is_deployed(remote: Option<&RemoteStackStatus>) -> bool {
    remote.is_some_and(|status| !status.is_deleted())
}

fn deploy_plan(surveyed: &[Surveyed]) -> DeploymentPlan {
    build_deploy_plan(
        surveyed
            .iter()
            .map(|survey| (survey.unit.clone(), survey.verdict))
            .collect(),
    )
}

fn log_plan(plan: &DeploymentPlan) {
    for entry in &plan.entries {
        info!(rule = %entry.unit.name(), stack = %entry.unit.stack_name(), action = %entry.action, "planned");
    }
}
