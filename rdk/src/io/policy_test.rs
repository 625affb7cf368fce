//! Local rule tests: `cfn-guard test` for guard rules, `unittest` for python.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use tracing::{info, instrument};
use walkdir::WalkDir;

use crate::core::allow_list::POLICY_TEST_TOOL;
use crate::core::output::LineLevel;
use crate::io::process::{CaptureMode, CommandError, CommandRunner, ExternalInvocation};
use crate::io::rules::{PARAMETERS_FILE, TEMPLATE_FILE};

pub const GUARD_RULES_FILE: &str = "rule_code.guard";
const TEST_CASE_MARKER: &str = "Test Case #";
const TEST_DATA_EXTENSIONS: [&str; 3] = ["json", "yaml", "yml"];
const PYTHON_TEST_PATTERN: &str = "*_test.py";

static RAN_TESTS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Ran (\d+) tests?").expect("unittest summary pattern is valid"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TestStatus {
    Passed,
    Failed,
}

/// Result of one test invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestReport {
    /// `rule` or `rule/test-data-file`.
    pub label: String,
    pub status: TestStatus,
    pub tests_run: usize,
    pub errors: Vec<String>,
}

impl TestReport {
    pub fn passed(&self) -> bool {
        self.status == TestStatus::Passed
    }
}

#[derive(Debug)]
pub struct PolicyTester<R> {
    runner: R,
    interpreter: String,
    verbose: bool,
    timeout: Option<Duration>,
}

impl<R: CommandRunner> PolicyTester<R> {
    pub fn new(runner: R, interpreter: impl Into<String>) -> Self {
        Self {
            runner,
            interpreter: interpreter.into(),
            verbose: false,
            timeout: None,
        }
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// One `cfn-guard test` run per test-data file in the rule directory.
    #[instrument(skip_all, fields(rule = %rule_label(rule_dir)))]
    pub fn run_guard(&self, rule_dir: &Path) -> Vec<TestReport> {
        let rules_file = rule_dir.join(GUARD_RULES_FILE);
        guard_test_data(rule_dir)
            .into_iter()
            .map(|data| {
                let label = format!(
                    "{}/{}",
                    rule_label(rule_dir),
                    data.file_name().unwrap_or_default().to_string_lossy()
                );
                info!(test_data = %data.display(), "running guard test");
                let mut argv = vec![
                    POLICY_TEST_TOOL.to_string(),
                    "test".to_string(),
                    "--rules-file".to_string(),
                    rules_file.display().to_string(),
                    "--test-data".to_string(),
                    data.display().to_string(),
                ];
                if self.verbose {
                    argv.push("--verbose".to_string());
                }
                let invocation = ExternalInvocation::new(argv)
                    .capture(CaptureMode::CaptureText)
                    .stdout_level(LineLevel::Debug)
                    .timeout(self.timeout);
                match self.runner.run(&invocation) {
                    Ok(result) => TestReport {
                        label,
                        status: TestStatus::Passed,
                        tests_run: count_guard_cases(result.captured_stdout.as_deref().unwrap_or_default()),
                        errors: Vec::new(),
                    },
                    Err(err) => failed(label, &err),
                }
            })
            .collect()
    }

    /// `<interpreter> -m unittest discover` over the rule directory.
    #[instrument(skip_all, fields(rule = %rule_label(rule_dir)))]
    pub fn run_python(&self, rule_dir: &Path) -> TestReport {
        let label = rule_label(rule_dir);
        let mut argv = vec![
            self.interpreter.clone(),
            "-m".to_string(),
            "unittest".to_string(),
            "discover".to_string(),
            "-s".to_string(),
            rule_dir.display().to_string(),
            "-p".to_string(),
            PYTHON_TEST_PATTERN.to_string(),
        ];
        if self.verbose {
            argv.push("-v".to_string());
        }
        // unittest reports progress on stderr even when everything passes.
        let invocation = ExternalInvocation::new(argv)
            .stderr_level(LineLevel::Info)
            .timeout(self.timeout);
        match self.runner.run(&invocation) {
            Ok(result) => TestReport {
                label,
                status: TestStatus::Passed,
                tests_run: count_unittest_runs(&result.captured_stderr),
                errors: Vec::new(),
            },
            Err(err) => {
                let mut report = failed(label, &err);
                report.tests_run = count_unittest_runs(err.stderr());
                report
            }
        }
    }
}

fn failed(label: String, err: &CommandError) -> TestReport {
    let mut errors = vec![err.to_string()];
    errors.extend(err.stderr().iter().cloned());
    TestReport {
        label,
        status: TestStatus::Failed,
        tests_run: 0,
        errors,
    }
}

fn rule_label(rule_dir: &Path) -> String {
    rule_dir
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| rule_dir.display().to_string())
}

/// Test-data files for a guard rule, sorted; rule metadata files excluded.
pub fn guard_test_data(rule_dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(rule_dir)
        .min_depth(1)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| {
            let is_data = path
                .extension()
                .and_then(OsStr::to_str)
                .is_some_and(|ext| TEST_DATA_EXTENSIONS.contains(&ext));
            let name = path.file_name().unwrap_or_default();
            is_data && name != OsStr::new(PARAMETERS_FILE) && name != OsStr::new(TEMPLATE_FILE)
        })
        .collect();
    files.sort();
    files
}

pub fn count_guard_cases(lines: &[String]) -> usize {
    lines
        .iter()
        .map(|line| line.matches(TEST_CASE_MARKER).count())
        .sum()
}

pub fn count_unittest_runs(lines: &[String]) -> usize {
    lines
        .iter()
        .filter_map(|line| RAN_TESTS_RE.captures(line))
        .filter_map(|caps| caps[1].parse::<usize>().ok())
        .sum()
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::test_support::ScriptedRunner;

    #[test]
    fn guard_test_data_skips_metadata() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path().join("my_rule");
        fs::create_dir_all(dir.join("tests")).expect("mkdir");
        for name in [PARAMETERS_FILE, TEMPLATE_FILE, "rule_code.guard", "b.yaml"] {
            fs::write(dir.join(name), "").expect("write");
        }
        fs::write(dir.join("tests/a.json"), "").expect("write");

        let files = guard_test_data(&dir);

        assert_eq!(files, vec![dir.join("b.yaml"), dir.join("tests/a.json")]);
    }

    #[test]
    fn guard_runs_once_per_data_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path().join("my_rule");
        fs::create_dir_all(&dir).expect("mkdir");
        fs::write(dir.join("pass.json"), "").expect("write");
        fs::write(dir.join("fail.yml"), "").expect("write");
        let runner = ScriptedRunner::new();
        runner.push_failure(7, "FAIL Test Case #1");
        runner.push_stdout("Test Case #1\nPASS\nTest Case #2\nPASS");
        let tester = PolicyTester::new(&runner, "python3").verbose(true);

        let reports = tester.run_guard(&dir);

        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].label, "my_rule/fail.yml");
        assert_eq!(reports[0].status, TestStatus::Failed);
        assert_eq!(reports[1].tests_run, 2);
        assert!(reports[1].passed());
        let argv = runner.argv(0);
        assert_eq!(argv[0], "cfn-guard");
        assert_eq!(argv.last().map(String::as_str), Some("--verbose"));
    }

    #[test]
    fn python_counts_ran_tests() {
        let runner = ScriptedRunner::new();
        runner.push_output(0, "", "test_a ... ok\nRan 3 tests in 0.01s\nOK");
        let tester = PolicyTester::new(&runner, "python3.12");

        let report = tester.run_python(Path::new("/rules/my_rule"));

        assert!(report.passed());
        assert_eq!(report.tests_run, 3);
        assert_eq!(runner.invocations()[0].argv[..4], ["python3.12", "-m", "unittest", "discover"]);
    }

    #[test]
    fn counts_guard_cases() {
        let lines = vec!["Test Case #1".to_string(), "x Test Case #2".to_string()];
        assert_eq!(count_guard_cases(&lines), 2);
        assert_eq!(count_unittest_runs(&["Ran 1 test in 0.0s".to_string()]), 1);
    }
}
