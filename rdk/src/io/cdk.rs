//! Infrastructure tool adapter: `cdk` invocations scoped to selected rules.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use tracing::{info, instrument};

use crate::core::allow_list::INFRA_TOOL;
use crate::core::output::LineLevel;
use crate::core::planner::DiffVerdict;
use crate::core::types::DeployableUnit;
use crate::io::process::{CommandError, CommandRunner, ExternalInvocation};

/// Exit codes of `cdk diff --fail`: 0 unchanged, 1 changed, 2 reported by
/// some versions for changed stacks with warnings.
const DIFF_EXIT_CODES: [i32; 3] = [0, 1, 2];
const RULE_SEPARATOR: &str = "|";

#[derive(Debug)]
pub struct CdkTool<R> {
    runner: R,
    app_dir: PathBuf,
    rules_dir: PathBuf,
    env: BTreeMap<String, String>,
    stderr_level: LineLevel,
    timeout: Option<Duration>,
}

impl<R: CommandRunner> CdkTool<R> {
    pub fn new(runner: R, app_dir: impl Into<PathBuf>, rules_dir: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            app_dir: app_dir.into(),
            rules_dir: rules_dir.into(),
            env: BTreeMap::new(),
            stderr_level: LineLevel::Error,
            timeout: None,
        }
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_stderr_level(mut self, level: LineLevel) -> Self {
        self.stderr_level = level;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Compare one rule with its deployed stack.
    #[instrument(skip_all, fields(rule = %unit.name()))]
    pub fn diff(&self, unit: &DeployableUnit) -> Result<DiffVerdict, CommandError> {
        let units = [unit];
        let invocation = self
            .invocation("diff", &units, &["--fail", unit.stack_name()])
            .allow_exit_codes(&DIFF_EXIT_CODES);
        let result = self.runner.run(&invocation)?;
        let verdict = DiffVerdict::from_exit_code(result.exit_code);
        info!(?verdict, "diff finished");
        Ok(verdict)
    }

    #[instrument(skip_all, fields(count = units.len()))]
    pub fn bootstrap(&self, units: &[&DeployableUnit]) -> Result<(), CommandError> {
        info!("bootstrapping environment");
        self.runner.run(&self.invocation("bootstrap", units, &[]))?;
        Ok(())
    }

    /// Apply every unit in a single invocation.
    #[instrument(skip_all, fields(count = units.len()))]
    pub fn deploy(&self, units: &[&DeployableUnit]) -> Result<(), CommandError> {
        let mut trailing: Vec<&str> = stack_names(units);
        trailing.extend(["--require-approval", "never"]);
        self.runner.run(&self.invocation("deploy", units, &trailing))?;
        Ok(())
    }

    #[instrument(skip_all, fields(count = units.len()))]
    pub fn destroy(&self, units: &[&DeployableUnit]) -> Result<(), CommandError> {
        let mut trailing = vec!["--force"];
        trailing.extend(stack_names(units));
        self.runner.run(&self.invocation("destroy", units, &trailing))?;
        Ok(())
    }

    fn invocation(
        &self,
        subcommand: &str,
        units: &[&DeployableUnit],
        trailing: &[&str],
    ) -> ExternalInvocation {
        let rule_names: Vec<&str> = units.iter().map(|unit| unit.name()).collect();
        let mut argv = vec![
            INFRA_TOOL.to_string(),
            subcommand.to_string(),
            "--version-reporting".to_string(),
            "false".to_string(),
            "--context".to_string(),
            format!("rules_dir={}", self.rules_dir.display()),
            "--context".to_string(),
            format!("rulename={}", rule_names.join(RULE_SEPARATOR)),
        ];
        argv.extend(trailing.iter().map(|arg| (*arg).to_string()));
        ExternalInvocation::new(argv)
            .current_dir(&self.app_dir)
            .envs(&self.env)
            .stderr_level(self.stderr_level)
            .timeout(self.timeout)
    }
}

fn stack_names<'u>(units: &[&'u DeployableUnit]) -> Vec<&'u str> {
    units.iter().map(|unit| unit.stack_name()).collect()
}
