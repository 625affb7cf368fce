//! Child-process runner with live, per-line logging of both output streams.
//!
//! Each pipe gets its own reader thread so a chatty stderr can never fill its
//! buffer and stall the child while stdout is being read. Lines are logged as
//! they arrive; readers are joined after the child exits, which drains
//! anything still buffered before the exit code is inspected.
//!
//! A timed invocation runs in its own process group so the deadline can take
//! down everything the tool started, not only the direct child.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{self, BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};
use wait_timeout::ChildExt;

use crate::core::allow_list::AllowList;
use crate::core::output::{LineLevel, Stream, clean_line, effective_level};

/// How long readers may keep draining after a child was killed. Anything
/// still holding the pipes past this is left behind.
const KILL_DRAIN_GRACE: Duration = Duration::from_secs(1);

/// What happens to standard output besides logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    /// Log each line; keep nothing.
    StreamToLog,
    /// Log each line and return them to the caller.
    CaptureText,
    /// Log at debug only; keep nothing.
    Discard,
}

/// A single child-process execution request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalInvocation {
    pub argv: Vec<String>,
    pub workdir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub allowed_exit_codes: BTreeSet<i32>,
    pub capture: CaptureMode,
    pub stdout_level: LineLevel,
    pub stderr_level: LineLevel,
    pub timeout: Option<Duration>,
}

impl ExternalInvocation {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            workdir: None,
            env: BTreeMap::new(),
            allowed_exit_codes: BTreeSet::from([0]),
            capture: CaptureMode::StreamToLog,
            stdout_level: LineLevel::Info,
            stderr_level: LineLevel::Error,
            timeout: None,
        }
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs(mut self, vars: &BTreeMap<String, String>) -> Self {
        self.env
            .extend(vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    /// Replace the accepted exit codes (default `{0}`).
    pub fn allow_exit_codes(mut self, codes: &[i32]) -> Self {
        self.allowed_exit_codes = codes.iter().copied().collect();
        self
    }

    pub fn capture(mut self, mode: CaptureMode) -> Self {
        self.capture = mode;
        self
    }

    pub fn stdout_level(mut self, level: LineLevel) -> Self {
        self.stdout_level = level;
        self
    }

    pub fn stderr_level(mut self, level: LineLevel) -> Self {
        self.stderr_level = level;
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn program(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or("")
    }

    pub fn command_line(&self) -> String {
        self.argv.join(" ")
    }

    fn effective_stdout_level(&self) -> LineLevel {
        match self.capture {
            CaptureMode::Discard => LineLevel::Debug,
            _ => self.stdout_level,
        }
    }
}

/// Outcome of one invocation. Only produced for accepted exit codes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationResult {
    pub exit_code: i32,
    /// Standard-output transcript, present only for [`CaptureMode::CaptureText`].
    pub captured_stdout: Option<Vec<String>>,
    /// Standard-error lines; always collected.
    pub captured_stderr: Vec<String>,
    pub succeeded: bool,
}

impl InvocationResult {
    pub fn stdout_text(&self) -> String {
        self.captured_stdout
            .as_deref()
            .map(|lines| lines.join("\n"))
            .unwrap_or_default()
    }
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("command not allowed: {program:?}")]
    NotAllowed { program: String },

    #[error("failed to invoke {program}: {source}")]
    InvocationFailed {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} failed with an unacceptable exit code: {exit_code}")]
    ExecutionFailed {
        program: String,
        exit_code: i32,
        stderr: Vec<String>,
    },

    #[error("{program} timed out after {timeout_secs}s")]
    TimedOut { program: String, timeout_secs: u64 },

    #[error("reading {stream} of {program} failed: {message}")]
    Stream {
        program: String,
        stream: &'static str,
        message: String,
    },
}

impl CommandError {
    /// Captured standard-error lines of a failed execution.
    pub fn stderr(&self) -> &[String] {
        match self {
            CommandError::ExecutionFailed { stderr, .. } => stderr,
            _ => &[],
        }
    }
}

/// Abstraction over process execution so orchestration can be scripted in tests.
pub trait CommandRunner {
    fn run(&self, invocation: &ExternalInvocation) -> Result<InvocationResult, CommandError>;
}

impl<R: CommandRunner + ?Sized> CommandRunner for &R {
    fn run(&self, invocation: &ExternalInvocation) -> Result<InvocationResult, CommandError> {
        (**self).run(invocation)
    }
}

/// Runner that spawns real child processes.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    allow_list: AllowList,
}

impl ProcessRunner {
    pub fn new(allow_list: AllowList) -> Self {
        Self { allow_list }
    }
}

impl CommandRunner for ProcessRunner {
    #[instrument(skip_all, fields(program = %invocation.program()))]
    fn run(&self, invocation: &ExternalInvocation) -> Result<InvocationResult, CommandError> {
        let program = invocation.program().to_string();
        // Checked before anything is logged or spawned.
        if !self.allow_list.permits(&program) {
            return Err(CommandError::NotAllowed { program });
        }
        debug!(command = %invocation.command_line(), workdir = ?invocation.workdir, "running command");

        let mut cmd = Command::new(&program);
        cmd.args(&invocation.argv[1..])
            .envs(&invocation.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &invocation.workdir {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            if invocation.timeout.is_some() {
                cmd.process_group(0);
            }
        }

        let mut child = cmd.spawn().map_err(|source| {
            error!(err = %source, "failed to spawn command");
            CommandError::InvocationFailed {
                program: program.clone(),
                source,
            }
        })?;

        let stdout = child.stdout.take().ok_or_else(|| missing_pipe(&program, "stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing_pipe(&program, "stderr"))?;

        let stdout_handle = spawn_reader(
            stdout,
            LineSink {
                program: program.clone(),
                stream: Stream::Stdout,
                level: invocation.effective_stdout_level(),
                keep: invocation.capture == CaptureMode::CaptureText,
            },
        );
        let stderr_handle = spawn_reader(
            stderr,
            LineSink {
                program: program.clone(),
                stream: Stream::Stderr,
                level: invocation.stderr_level,
                keep: true,
            },
        );

        let status = match wait_child(&mut child, invocation.timeout, &program) {
            Ok(Some(status)) => status,
            outcome => {
                settle_reader(stdout_handle);
                settle_reader(stderr_handle);
                outcome?;
                let timeout_secs = invocation.timeout.map(|t| t.as_secs()).unwrap_or_default();
                warn!(timeout_secs, "command timed out, killed");
                return Err(CommandError::TimedOut {
                    program,
                    timeout_secs,
                });
            }
        };
        let stdout_lines = join_reader(stdout_handle, &program, Stream::Stdout)?;
        let stderr_lines = join_reader(stderr_handle, &program, Stream::Stderr)?;

        let exit_code = exit_code(status);
        debug!(exit_code, "command finished");
        if !invocation.allowed_exit_codes.contains(&exit_code) {
            info!("Return code was {exit_code}");
            let replay = LineSink {
                program: program.clone(),
                stream: Stream::Stderr,
                level: LineLevel::Error,
                keep: false,
            };
            for line in &stderr_lines {
                replay.emit(line);
            }
            return Err(CommandError::ExecutionFailed {
                program,
                exit_code,
                stderr: stderr_lines,
            });
        }

        Ok(InvocationResult {
            exit_code,
            captured_stdout: (invocation.capture == CaptureMode::CaptureText)
                .then_some(stdout_lines),
            captured_stderr: stderr_lines,
            succeeded: true,
        })
    }
}

/// Wait for the child, killing it when the deadline passes.
///
/// `Ok(None)` means the child was killed after timing out.
fn wait_child(
    child: &mut Child,
    timeout: Option<Duration>,
    program: &str,
) -> Result<Option<ExitStatus>, CommandError> {
    let waited = match timeout {
        None => child.wait().map(Some),
        Some(timeout) => match child.wait_timeout(timeout) {
            Ok(Some(status)) => Ok(Some(status)),
            Ok(None) => kill_child(child).and_then(|()| child.wait()).map(|_| None),
            Err(err) => Err(err),
        },
    };
    waited.map_err(|source| CommandError::InvocationFailed {
        program: program.to_string(),
        source,
    })
}

/// Kill the child and, on unix, the process group it leads.
fn kill_child(child: &mut Child) -> io::Result<()> {
    #[cfg(unix)]
    kill_process_group(child.id());
    child.kill()
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn kill_process_group(leader: u32) {
    let Ok(pgid) = libc::pid_t::try_from(leader) else {
        return;
    };
    // SAFETY: killpg takes plain integers and touches no memory of ours.
    if unsafe { libc::killpg(pgid, libc::SIGKILL) } != 0 {
        let err = io::Error::last_os_error();
        debug!(err = %err, "process group kill failed");
    }
}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => {
            warn!(signal, "command terminated by signal");
            -1
        }
        (None, None) => -1,
    }
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

fn missing_pipe(program: &str, stream: &'static str) -> CommandError {
    CommandError::Stream {
        program: program.to_string(),
        stream,
        message: "pipe was not captured".to_string(),
    }
}

/// Where a reader thread sends the lines it reads.
struct LineSink {
    program: String,
    stream: Stream,
    level: LineLevel,
    keep: bool,
}

impl LineSink {
    fn emit(&self, line: &str) {
        let program = self.program.as_str();
        let stream = self.stream.as_str();
        match effective_level(self.level, line) {
            LineLevel::Debug => debug!(target: "rdk::child", program, stream, "{line}"),
            LineLevel::Info => info!(target: "rdk::child", program, stream, "{line}"),
            LineLevel::Error => error!(target: "rdk::child", program, stream, "{line}"),
        }
    }
}

type ReaderHandle = thread::JoinHandle<io::Result<Vec<String>>>;

fn spawn_reader<R: Read + Send + 'static>(reader: R, sink: LineSink) -> ReaderHandle {
    // Reader threads log under the caller's subscriber, not the global default.
    let dispatch = tracing::dispatcher::get_default(|current| current.clone());
    thread::spawn(move || {
        tracing::dispatcher::with_default(&dispatch, || pump_lines(reader, &sink))
    })
}

fn pump_lines<R: Read>(reader: R, sink: &LineSink) -> io::Result<Vec<String>> {
    let mut reader = BufReader::new(reader);
    let mut kept = Vec::new();
    let mut raw = Vec::new();
    loop {
        raw.clear();
        let n = reader.read_until(b'\n', &mut raw)?;
        if n == 0 {
            break;
        }
        let Some(line) = clean_line(&String::from_utf8_lossy(&raw)) else {
            continue;
        };
        sink.emit(&line);
        if sink.keep {
            kept.push(line);
        }
    }
    Ok(kept)
}

/// Give a reader a short grace period after a kill, then detach it.
fn settle_reader(handle: ReaderHandle) {
    let deadline = Instant::now() + KILL_DRAIN_GRACE;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            debug!("reader still blocked after kill, detaching");
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    let _ = handle.join();
}

fn join_reader(
    handle: ReaderHandle,
    program: &str,
    stream: Stream,
) -> Result<Vec<String>, CommandError> {
    let stream_error = |message: String| CommandError::Stream {
        program: program.to_string(),
        stream: stream.as_str(),
        message,
    };
    match handle.join() {
        Ok(Ok(lines)) => Ok(lines),
        Ok(Err(err)) => Err(stream_error(err.to_string())),
        Err(_) => Err(stream_error("reader thread panicked".to_string())),
    }
}
