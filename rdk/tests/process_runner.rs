//! Real-process tests for `ProcessRunner`, driving `sh`.
#![cfg(unix)]

use std::time::{Duration, Instant};

use rdk::core::allow_list::AllowList;
use rdk::core::output::LineLevel;
use rdk::io::process::{CaptureMode, CommandError, CommandRunner, ExternalInvocation, ProcessRunner};
use rdk::test_support::capture_logs;

fn runner() -> ProcessRunner {
    ProcessRunner::new(AllowList::new(["sh"]))
}

fn sh(script: &str) -> ExternalInvocation {
    ExternalInvocation::new(["sh", "-c", script])
}

#[test]
fn capture_text_returns_stdout_only() {
    let invocation = sh("echo out1; echo err1 >&2; echo out2").capture(CaptureMode::CaptureText);

    let result = runner().run(&invocation).expect("run");

    assert_eq!(result.exit_code, 0);
    assert_eq!(
        result.captured_stdout,
        Some(vec!["out1".to_string(), "out2".to_string()])
    );
    assert_eq!(result.captured_stderr, vec!["err1".to_string()]);
}

#[test]
fn stream_to_log_keeps_no_transcript() {
    let result = runner().run(&sh("echo hello")).expect("run");
    assert_eq!(result.captured_stdout, None);
}

#[test]
fn unlisted_program_is_rejected_without_side_effects() {
    let invocation = ExternalInvocation::new(["curl", "http://evil"]);

    let (result, logs) = capture_logs(|| runner().run(&invocation));

    assert!(matches!(result, Err(CommandError::NotAllowed { program }) if program == "curl"));
    assert!(logs.is_empty(), "unexpected logs: {logs}");
}

#[test]
fn missing_binary_is_an_invocation_failure() {
    let runner = ProcessRunner::new(AllowList::new(["rdk-test-no-such-binary"]));
    let err = runner
        .run(&ExternalInvocation::new(["rdk-test-no-such-binary"]))
        .unwrap_err();
    assert!(matches!(err, CommandError::InvocationFailed { .. }), "{err}");
}

#[test]
fn disallowed_exit_code_carries_stderr() {
    let err = runner()
        .run(&sh("echo boom >&2; exit 3"))
        .unwrap_err();

    match err {
        CommandError::ExecutionFailed {
            exit_code, stderr, ..
        } => {
            assert_eq!(exit_code, 3);
            assert_eq!(stderr, vec!["boom".to_string()]);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn failure_stderr_is_replayed_at_error() {
    let invocation = sh("echo boom-reason >&2; exit 3").stderr_level(LineLevel::Info);

    let (result, logs) = capture_logs(|| runner().run(&invocation));

    assert!(matches!(result, Err(CommandError::ExecutionFailed { exit_code: 3, .. })));
    let levels: Vec<&str> = logs
        .lines()
        .filter(|line| line.contains("rdk::child") && line.contains("boom-reason"))
        .map(|line| if line.contains("ERROR") { "ERROR" } else { "INFO" })
        .collect();
    assert_eq!(levels, ["INFO", "ERROR"], "{logs}");
}

#[test]
fn allowed_nonzero_exit_code_succeeds() {
    let result = runner()
        .run(&sh("exit 1").allow_exit_codes(&[0, 1, 2]))
        .expect("run");
    assert_eq!(result.exit_code, 1);
    assert!(result.succeeded);
}

#[test]
fn escapes_are_stripped_and_blank_lines_dropped() {
    let invocation = sh(r"printf '\033[31mred\033[0m\n\n   \nplain\n'").capture(CaptureMode::CaptureText);

    let result = runner().run(&invocation).expect("run");

    assert_eq!(
        result.captured_stdout,
        Some(vec!["red".to_string(), "plain".to_string()])
    );
}

#[test]
fn lines_are_logged_with_their_levels() {
    let invocation = sh("echo hello; echo 'Error: bad input'; echo noisy >&2").stderr_level(LineLevel::Info);

    let (result, logs) = capture_logs(|| runner().run(&invocation));

    result.expect("run");
    let line_with = |needle: &str| {
        logs.lines()
            .find(|line| line.contains("rdk::child") && line.contains(needle))
            .unwrap_or_else(|| panic!("no log line with {needle:?} in {logs}"))
            .to_string()
    };
    assert!(line_with("hello").contains("INFO"));
    assert!(line_with("Error: bad input").contains("ERROR"));
    assert!(line_with("noisy").contains("INFO"));
}

#[test]
fn discard_logs_stdout_at_debug() {
    let invocation = sh("echo quiet-line").capture(CaptureMode::Discard);

    let (result, logs) = capture_logs(|| runner().run(&invocation));

    assert_eq!(result.expect("run").captured_stdout, None);
    let line = logs
        .lines()
        .find(|line| line.contains("rdk::child") && line.contains("quiet-line"))
        .expect("logged");
    assert!(line.contains("DEBUG"), "{line}");
}

#[test]
fn heavy_output_on_both_streams_does_not_deadlock() {
    let script = r#"i=0; while [ $i -lt 20000 ]; do echo "out $i"; echo "err $i" >&2; i=$((i+1)); done"#;
    let invocation = sh(script)
        .capture(CaptureMode::CaptureText)
        .stdout_level(LineLevel::Debug)
        .stderr_level(LineLevel::Debug)
        .timeout(Some(Duration::from_secs(60)));

    let result = runner().run(&invocation).expect("run");

    let stdout = result.captured_stdout.expect("captured");
    assert_eq!(stdout.len(), 20_000);
    assert_eq!(stdout.last().map(String::as_str), Some("out 19999"));
    assert_eq!(result.captured_stderr.len(), 20_000);
}

#[test]
fn timeout_kills_the_child() {
    let invocation = sh("exec sleep 5").timeout(Some(Duration::from_millis(200)));

    let err = runner().run(&invocation).unwrap_err();

    assert!(matches!(err, CommandError::TimedOut { .. }), "{err}");
}

#[test]
fn timeout_kills_processes_the_child_started() {
    let invocation = sh("sleep 4; echo late-line").timeout(Some(Duration::from_millis(200)));
    let started = Instant::now();

    let (result, logs) = capture_logs(|| runner().run(&invocation));

    assert!(matches!(result, Err(CommandError::TimedOut { .. })), "{result:?}");
    assert!(started.elapsed() < Duration::from_secs(2), "took {:?}", started.elapsed());
    assert!(!logs.contains("late-line"), "{logs}");
}

#[test]
fn workdir_and_env_are_passed_through() {
    let temp = tempfile::tempdir().expect("tempdir");
    let invocation = sh("pwd; echo $RDK_TEST_VALUE")
        .current_dir(temp.path())
        .env("RDK_TEST_VALUE", "forty-two")
        .capture(CaptureMode::CaptureText);

    let result = runner().run(&invocation).expect("run");

    let stdout = result.captured_stdout.expect("captured");
    let expected_dir = temp.path().canonicalize().expect("canonicalize");
    assert_eq!(
        std::path::Path::new(&stdout[0]).canonicalize().expect("canonicalize"),
        expected_dir
    );
    assert_eq!(stdout[1], "forty-two");
}
