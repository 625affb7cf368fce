//! Scripted fakes and fixtures for orchestration tests.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing_subscriber::fmt::MakeWriter;

use crate::core::allow_list::AllowList;
use crate::core::status::{DELETE_COMPLETE, RemoteStackStatus};
use crate::core::types::DeployableUnit;
use crate::io::process::{
    CaptureMode, CommandError, CommandRunner, ExternalInvocation, InvocationResult,
};
use crate::io::stack_api::{RemoteError, StackApi, StackPage, UpdateOutcome};
use crate::wait::Sleeper;

/// Build a unit, panicking on invalid names.
pub fn unit(name: &str) -> DeployableUnit {
    DeployableUnit::new(name).expect("valid unit name")
}

/// Create `<parent>/<name>/parameters.json` and return the rule directory.
pub fn write_rule(parent: &Path, name: &str, runtime: &str) -> PathBuf {
    let dir = parent.join(name);
    fs::create_dir_all(&dir).expect("create rule dir");
    let parameters = serde_json::json!({
        "Version": "1.0",
        "Parameters": {
            "RuleName": name,
            "SourceRuntime": runtime,
        },
        "Tags": "[]",
    });
    fs::write(
        dir.join("parameters.json"),
        serde_json::to_string_pretty(&parameters).expect("serialize parameters"),
    )
    .expect("write parameters.json");
    dir
}

/// Temporary rules directory holding `(name, runtime)` rules.
pub fn rules_fixture(rules: &[(&str, &str)]) -> tempfile::TempDir {
    let temp = tempfile::tempdir().expect("tempdir");
    for (name, runtime) in rules {
        write_rule(temp.path(), name, runtime);
    }
    temp
}

enum Scripted {
    Exit {
        code: i32,
        stdout: Vec<String>,
        stderr: Vec<String>,
    },
    InvokeError,
}

fn lines(text: &str) -> Vec<String> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(str::to_string)
        .collect()
}

/// [`CommandRunner`] that replays queued responses and records invocations.
///
/// An empty queue answers with exit code 0 and no output.
#[derive(Default)]
pub struct ScriptedRunner {
    responses: RefCell<VecDeque<Scripted>>,
    invocations: RefCell<Vec<ExternalInvocation>>,
    allow_list: Option<AllowList>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_allow_list(mut self, allow_list: AllowList) -> Self {
        self.allow_list = Some(allow_list);
        self
    }

    pub fn push_output(&self, code: i32, stdout: &str, stderr: &str) {
        self.responses.borrow_mut().push_back(Scripted::Exit {
            code,
            stdout: lines(stdout),
            stderr: lines(stderr),
        });
    }

    pub fn push_exit(&self, code: i32) {
        self.push_output(code, "", "");
    }

    pub fn push_stdout(&self, stdout: &str) {
        self.push_output(0, stdout, "");
    }

    pub fn push_failure(&self, code: i32, stderr: &str) {
        self.push_output(code, "", stderr);
    }

    /// Next invocation fails to start, as if the binary were missing.
    pub fn push_invoke_error(&self) {
        self.responses.borrow_mut().push_back(Scripted::InvokeError);
    }

    pub fn invocations(&self) -> Vec<ExternalInvocation> {
        self.invocations.borrow().clone()
    }

    pub fn argv(&self, index: usize) -> Vec<String> {
        self.invocations.borrow()[index].argv.clone()
    }

    /// `argv[..2]` of each invocation joined by a space, e.g. `cdk deploy`.
    pub fn commands(&self) -> Vec<String> {
        self.invocations
            .borrow()
            .iter()
            .map(|invocation| {
                invocation
                    .argv
                    .iter()
                    .take(2)
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .collect()
    }

    pub fn remaining(&self) -> usize {
        self.responses.borrow().len()
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, invocation: &ExternalInvocation) -> Result<InvocationResult, CommandError> {
        let program = invocation.program().to_string();
        if let Some(allow_list) = &self.allow_list {
            if !allow_list.permits(&program) {
                return Err(CommandError::NotAllowed { program });
            }
        }
        self.invocations.borrow_mut().push(invocation.clone());
        let response = self.responses.borrow_mut().pop_front().unwrap_or(Scripted::Exit {
            code: 0,
            stdout: Vec::new(),
            stderr: Vec::new(),
        });
        match response {
            Scripted::InvokeError => Err(CommandError::InvocationFailed {
                program,
                source: io::Error::new(io::ErrorKind::NotFound, "No such file or directory"),
            }),
            Scripted::Exit {
                code,
                stdout,
                stderr,
            } => {
                if !invocation.allowed_exit_codes.contains(&code) {
                    return Err(CommandError::ExecutionFailed {
                        program,
                        exit_code: code,
                        stderr,
                    });
                }
                Ok(InvocationResult {
                    exit_code: code,
                    captured_stdout: (invocation.capture == CaptureMode::CaptureText)
                        .then_some(stdout),
                    captured_stderr: stderr,
                    succeeded: true,
                })
            }
        }
    }
}

struct Timeline {
    statuses: Vec<String>,
    next: usize,
}

/// In-memory [`StackApi`].
///
/// `describe_stack` answers from [`FakeStackApi::set_deployed`]. Listings
/// answer from per-stack status timelines that advance one step each time a
/// first page is requested, so one wait poll sees one status.
#[derive(Default)]
pub struct FakeStackApi {
    deployed: RefCell<BTreeMap<String, RemoteStackStatus>>,
    timelines: RefCell<BTreeMap<String, Timeline>>,
    reasons: RefCell<BTreeMap<String, String>>,
    deleted: RefCell<Vec<String>>,
    snapshot: RefCell<Vec<RemoteStackStatus>>,
    update_outcomes: RefCell<BTreeMap<String, UpdateOutcome>>,
    calls: RefCell<Vec<String>>,
    list_calls: Cell<usize>,
    page_size: usize,
    unavailable: Cell<bool>,
    repeat_token: Cell<bool>,
}

impl FakeStackApi {
    pub fn new() -> Self {
        Self {
            page_size: 100,
            ..Self::default()
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Status returned by `describe_stack`.
    pub fn set_deployed(&self, stack_name: &str, status: &str) {
        self.deployed.borrow_mut().insert(
            stack_name.to_string(),
            RemoteStackStatus::new(stack_name, status),
        );
    }

    /// Statuses reported by successive polls; the last one repeats.
    pub fn set_timeline(&self, stack_name: &str, statuses: &[&str]) {
        self.timelines.borrow_mut().insert(
            stack_name.to_string(),
            Timeline {
                statuses: statuses.iter().map(|s| (*s).to_string()).collect(),
                next: 0,
            },
        );
    }

    pub fn set_reason(&self, stack_name: &str, reason: &str) {
        self.reasons
            .borrow_mut()
            .insert(stack_name.to_string(), reason.to_string());
    }

    /// A deleted historical instance sharing the name.
    pub fn add_deleted(&self, stack_name: &str) {
        self.deleted.borrow_mut().push(stack_name.to_string());
    }

    pub fn set_update_outcome(&self, stack_name: &str, outcome: UpdateOutcome) {
        self.update_outcomes
            .borrow_mut()
            .insert(stack_name.to_string(), outcome);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.set(unavailable);
    }

    /// Every page claims another page follows under the same token.
    pub fn set_repeat_token(&self, repeat: bool) {
        self.repeat_token.set(repeat);
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.get()
    }

    /// Mutating calls in order, e.g. `create:MyRule`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    fn check_available(&self) -> Result<(), RemoteError> {
        if self.unavailable.get() {
            return Err(RemoteError::Unavailable(
                "Could not connect to the endpoint URL".to_string(),
            ));
        }
        Ok(())
    }

    fn take_snapshot(&self) {
        let reasons = self.reasons.borrow();
        let mut snapshot: Vec<RemoteStackStatus> = self
            .deleted
            .borrow()
            .iter()
            .map(|name| RemoteStackStatus::new(name.as_str(), DELETE_COMPLETE))
            .collect();
        for (name, timeline) in self.timelines.borrow_mut().iter_mut() {
            let Some(status) = timeline.statuses.get(timeline.next) else {
                continue;
            };
            let mut summary = RemoteStackStatus::new(name.as_str(), status.as_str());
            if let Some(reason) = reasons.get(name) {
                summary = summary.with_reason(reason.as_str());
            }
            snapshot.push(summary);
            if timeline.next + 1 < timeline.statuses.len() {
                timeline.next += 1;
            }
        }
        *self.snapshot.borrow_mut() = snapshot;
    }
}

impl StackApi for FakeStackApi {
    fn list_stacks(&self, next_token: Option<&str>) -> Result<StackPage, RemoteError> {
        self.check_available()?;
        self.list_calls.set(self.list_calls.get() + 1);
        if next_token.is_none() {
            self.take_snapshot();
        }
        let snapshot = self.snapshot.borrow();
        let offset = next_token
            .and_then(|token| token.parse::<usize>().ok())
            .unwrap_or(0)
            .min(snapshot.len());
        let end = (offset + self.page_size).min(snapshot.len());
        let next_token = if self.repeat_token.get() {
            Some("again".to_string())
        } else {
            (end < snapshot.len()).then(|| end.to_string())
        };
        Ok(StackPage {
            summaries: snapshot[offset..end].to_vec(),
            next_token,
        })
    }

    fn describe_stack(&self, stack_name: &str) -> Result<Option<RemoteStackStatus>, RemoteError> {
        self.check_available()?;
        Ok(self.deployed.borrow().get(stack_name).cloned())
    }

    fn create_stack(&self, unit: &DeployableUnit) -> Result<(), RemoteError> {
        self.check_available()?;
        if unit.template_body().is_none() {
            return Err(RemoteError::MissingTemplate(unit.name().to_string()));
        }
        self.calls
            .borrow_mut()
            .push(format!("create:{}", unit.stack_name()));
        Ok(())
    }

    fn update_stack(&self, unit: &DeployableUnit) -> Result<UpdateOutcome, RemoteError> {
        self.check_available()?;
        self.calls
            .borrow_mut()
            .push(format!("update:{}", unit.stack_name()));
        Ok(self
            .update_outcomes
            .borrow()
            .get(unit.stack_name())
            .copied()
            .unwrap_or(UpdateOutcome::Updating))
    }

    fn delete_stack(&self, stack_name: &str) -> Result<(), RemoteError> {
        self.check_available()?;
        self.calls.borrow_mut().push(format!("delete:{stack_name}"));
        Ok(())
    }
}

/// [`Sleeper`] that records requested pauses instead of sleeping.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    sleeps: RefCell<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.borrow().clone()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        self.sleeps.borrow_mut().push(duration);
    }
}

#[derive(Clone, Default)]
struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl io::Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .map_err(|_| io::Error::other("log buffer poisoned"))?
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for SharedBuffer {
    type Writer = SharedBuffer;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Run `f` under a scoped debug-level subscriber and return what it logged.
pub fn capture_logs<T>(f: impl FnOnce() -> T) -> (T, String) {
    let buffer = SharedBuffer::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(buffer.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::DEBUG)
        .finish();
    let result = tracing::subscriber::with_default(subscriber, f);
    let bytes = buffer.0.lock().map(|b| b.clone()).unwrap_or_default();
    (result, String::from_utf8_lossy(&bytes).into_owned())
}
