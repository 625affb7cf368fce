//! Remote stack orchestration API and its CLI-backed implementation.

use std::collections::HashSet;
use std::ops::RangeInclusive;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::core::output::LineLevel;
use crate::core::status::RemoteStackStatus;
use crate::core::types::DeployableUnit;
use crate::io::process::{CaptureMode, CommandError, CommandRunner, ExternalInvocation};

const CAPABILITIES: [&str; 2] = ["CAPABILITY_IAM", "CAPABILITY_NAMED_IAM"];
const NO_UPDATES: &str = "No updates are to be performed";
const NOT_FOUND: &str = "does not exist";
/// Every code the CLI can report, including `-1` for a signal exit. The
/// adapter classifies non-zero answers itself.
const CLI_EXIT_CODES: RangeInclusive<i32> = -1..=255;
const CONNECT_FAILURES: [&str; 2] = [
    "Could not connect to the endpoint URL",
    "Unable to locate credentials",
];

/// One page of stack summaries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackPage {
    pub summaries: Vec<RemoteStackStatus>,
    pub next_token: Option<String>,
}

/// Result of asking the service to update a stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Updating,
    /// The submitted template matches the deployed one. Not a failure.
    NoChangesRequired,
}

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote API unavailable: {0}")]
    Unavailable(String),
    #[error("remote API rejected {operation}: {message}")]
    Rejected { operation: String, message: String },
    #[error("malformed response to {operation}: {message}")]
    Malformed { operation: String, message: String },
    #[error("rule {0} has no template to submit")]
    MissingTemplate(String),
    #[error("pagination repeated continuation token {0:?}")]
    RepeatedToken(String),
    #[error(transparent)]
    Command(#[from] CommandError),
}

pub trait StackApi {
    /// One page of stack summaries, including deleted instances.
    fn list_stacks(&self, next_token: Option<&str>) -> Result<StackPage, RemoteError>;

    /// Current status of the named stack, `None` when it does not exist.
    fn describe_stack(&self, stack_name: &str) -> Result<Option<RemoteStackStatus>, RemoteError>;

    fn create_stack(&self, unit: &DeployableUnit) -> Result<(), RemoteError>;

    fn update_stack(&self, unit: &DeployableUnit) -> Result<UpdateOutcome, RemoteError>;

    fn delete_stack(&self, stack_name: &str) -> Result<(), RemoteError>;
}

impl<A: StackApi + ?Sized> StackApi for &A {
    fn list_stacks(&self, next_token: Option<&str>) -> Result<StackPage, RemoteError> {
        (**self).list_stacks(next_token)
    }

    fn describe_stack(&self, stack_name: &str) -> Result<Option<RemoteStackStatus>, RemoteError> {
        (**self).describe_stack(stack_name)
    }

    fn create_stack(&self, unit: &DeployableUnit) -> Result<(), RemoteError> {
        (**self).create_stack(unit)
    }

    fn update_stack(&self, unit: &DeployableUnit) -> Result<UpdateOutcome, RemoteError> {
        (**self).update_stack(unit)
    }

    fn delete_stack(&self, stack_name: &str) -> Result<(), RemoteError> {
        (**self).delete_stack(stack_name)
    }
}

/// Follow continuation tokens until the listing is exhausted.
pub fn list_all_stacks<A: StackApi + ?Sized>(
    api: &A,
) -> Result<Vec<RemoteStackStatus>, RemoteError> {
    let mut all = Vec::new();
    let mut seen = HashSet::new();
    let mut token: Option<String> = None;
    loop {
        let page = api.list_stacks(token.as_deref())?;
        all.extend(page.summaries);
        match page.next_token {
            Some(next) if !next.is_empty() => {
                if !seen.insert(next.clone()) {
                    return Err(RemoteError::RepeatedToken(next));
                }
                token = Some(next);
            }
            _ => break,
        }
    }
    debug!(count = all.len(), pages = seen.len() + 1, "listed stacks");
    Ok(all)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WireStack {
    stack_name: String,
    stack_status: String,
    #[serde(default)]
    stack_status_reason: Option<String>,
}

impl From<WireStack> for RemoteStackStatus {
    fn from(wire: WireStack) -> Self {
        RemoteStackStatus {
            stack_name: wire.stack_name,
            status: wire.stack_status,
            status_reason: wire.stack_status_reason,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListStacksResponse {
    #[serde(default)]
    stack_summaries: Vec<WireStack>,
    #[serde(default)]
    next_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeStacksResponse {
    #[serde(default)]
    stacks: Vec<WireStack>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct WireParameter<'a> {
    parameter_key: &'a str,
    parameter_value: &'a str,
}

/// [`StackApi`] backed by `aws cloudformation` invocations.
#[derive(Debug)]
pub struct AwsCliStackApi<R> {
    runner: R,
    region: Option<String>,
}

impl<R: CommandRunner> AwsCliStackApi<R> {
    pub fn new(runner: R, region: Option<String>) -> Self {
        Self { runner, region }
    }

    fn invocation(&self, args: &[&str]) -> ExternalInvocation {
        let mut argv = vec!["aws".to_string(), "cloudformation".to_string()];
        argv.extend(args.iter().map(|arg| (*arg).to_string()));
        argv.extend(["--output".to_string(), "json".to_string()]);
        if let Some(region) = &self.region {
            argv.extend(["--region".to_string(), region.clone()]);
        }
        let exit_codes: Vec<i32> = CLI_EXIT_CODES.collect();
        ExternalInvocation::new(argv)
            .capture(CaptureMode::CaptureText)
            .allow_exit_codes(&exit_codes)
            .stdout_level(LineLevel::Debug)
            .stderr_level(LineLevel::Debug)
    }

    fn call(&self, operation: &str, args: &[&str]) -> Result<String, RemoteError> {
        let invocation = self.invocation(args);
        let result = self
            .runner
            .run(&invocation)
            .map_err(|err| classify(operation, err))?;
        if result.exit_code != 0 {
            debug!(exit_code = result.exit_code, "cli reported an error");
            return Err(classify_stderr(operation, result.captured_stderr.join("\n")));
        }
        Ok(result.stdout_text())
    }
}

fn template_args<'u>(
    unit: &'u DeployableUnit,
    parameters: &'u str,
) -> Result<Vec<&'u str>, RemoteError> {
    let body = unit
        .template_body()
        .ok_or_else(|| RemoteError::MissingTemplate(unit.name().to_string()))?;
    let mut args = vec![
        "--stack-name",
        unit.stack_name(),
        "--template-body",
        body,
        "--capabilities",
    ];
    args.extend(CAPABILITIES);
    if !unit.parameters().is_empty() {
        args.extend(["--parameters", parameters]);
    }
    Ok(args)
}

fn parameters_json(unit: &DeployableUnit) -> Result<String, RemoteError> {
    let wire: Vec<WireParameter<'_>> = unit
        .parameters()
        .iter()
        .map(|(key, value)| WireParameter {
            parameter_key: key,
            parameter_value: value,
        })
        .collect();
    serde_json::to_string(&wire).map_err(|err| RemoteError::Malformed {
        operation: "encode-parameters".to_string(),
        message: err.to_string(),
    })
}

fn classify(operation: &str, err: CommandError) -> RemoteError {
    match err {
        CommandError::InvocationFailed { .. } => RemoteError::Unavailable(err.to_string()),
        CommandError::ExecutionFailed { stderr, .. } => classify_stderr(operation, stderr.join("\n")),
        other => RemoteError::Command(other),
    }
}

fn classify_stderr(operation: &str, message: String) -> RemoteError {
    if CONNECT_FAILURES.iter().any(|marker| message.contains(marker)) {
        RemoteError::Unavailable(message)
    } else {
        RemoteError::Rejected {
            operation: operation.to_string(),
            message,
        }
    }
}

fn parse<T: DeserializeOwned>(operation: &str, body: &str) -> Result<T, RemoteError> {
    serde_json::from_str(body).map_err(|err| RemoteError::Malformed {
        operation: operation.to_string(),
        message: err.to_string(),
    })
}

impl<R: CommandRunner> StackApi for AwsCliStackApi<R> {
    #[instrument(skip_all, fields(token = ?next_token))]
    fn list_stacks(&self, next_token: Option<&str>) -> Result<StackPage, RemoteError> {
        let mut args = vec!["list-stacks", "--no-paginate"];
        if let Some(token) = next_token {
            args.extend(["--next-token", token]);
        }
        let body = self.call("list-stacks", &args)?;
        let response: ListStacksResponse = parse("list-stacks", &body)?;
        Ok(StackPage {
            summaries: response.stack_summaries.into_iter().map(Into::into).collect(),
            next_token: response.next_token,
        })
    }

    #[instrument(skip_all, fields(stack = %stack_name))]
    fn describe_stack(&self, stack_name: &str) -> Result<Option<RemoteStackStatus>, RemoteError> {
        let args = ["describe-stacks", "--stack-name", stack_name];
        let body = match self.call("describe-stacks", &args) {
            Ok(body) => body,
            Err(RemoteError::Rejected { message, .. }) if message.contains(NOT_FOUND) => {
                debug!("stack not deployed");
                return Ok(None);
            }
            Err(err) => return Err(err),
        };
        let response: DescribeStacksResponse = parse("describe-stacks", &body)?;
        Ok(response.stacks.into_iter().next().map(Into::into))
    }

    #[instrument(skip_all, fields(stack = %unit.stack_name()))]
    fn create_stack(&self, unit: &DeployableUnit) -> Result<(), RemoteError> {
        let parameters = parameters_json(unit)?;
        let mut args = vec!["create-stack"];
        args.extend(template_args(unit, &parameters)?);
        self.call("create-stack", &args)?;
        Ok(())
    }

    #[instrument(skip_all, fields(stack = %unit.stack_name()))]
    fn update_stack(&self, unit: &DeployableUnit) -> Result<UpdateOutcome, RemoteError> {
        let parameters = parameters_json(unit)?;
        let mut args = vec!["update-stack"];
        args.extend(template_args(unit, &parameters)?);
        match self.call("update-stack", &args) {
            Ok(_) => Ok(UpdateOutcome::Updating),
            Err(RemoteError::Rejected { message, .. }) if message.contains(NO_UPDATES) => {
                Ok(UpdateOutcome::NoChangesRequired)
            }
            Err(err) => {
                warn!(err = %err, "update rejected");
                Err(err)
            }
        }
    }

    #[instrument(skip_all, fields(stack = %stack_name))]
    fn delete_stack(&self, stack_name: &str) -> Result<(), RemoteError> {
        self.call("delete-stack", &["delete-stack", "--stack-name", stack_name])?;
        Ok(())
    }
}
