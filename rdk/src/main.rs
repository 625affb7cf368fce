//! `rdk`: deploy, destroy, and test config-compliance rules.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use thiserror::Error;
use tracing::{info, warn};

use rdk::core::allow_list::AllowList;
use rdk::core::types::{DeployableUnit, DeploymentPlan};
use rdk::deploy::{ApplyBackend, DeployOptions, Orchestrator};
use rdk::exit_codes;
use rdk::io::cdk::CdkTool;
use rdk::io::config::{DEFAULT_CONFIG_FILE, RdkConfig, load_config};
use rdk::io::ledger::load_pending;
use rdk::io::policy_test::PolicyTester;
use rdk::io::process::ProcessRunner;
use rdk::io::rules::{RuleDefinition, load_rules};
use rdk::io::stack_api::AwsCliStackApi;
use rdk::logging::{self, Verbosity};
use rdk::rule_test::run_rule_tests;
use rdk::wait::ThreadSleeper;

#[derive(Parser)]
#[command(
    name = "rdk",
    version,
    about = "Deploy and test config-compliance rules"
)]
struct Cli {
    /// Only log warnings and errors.
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Log debug detail, including all child-process output.
    #[arg(short, long, global = true)]
    debug: bool,

    /// Path to the TOML config file.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Deploy new or changed rules and wait for them to finish.
    Deploy {
        /// Rules to deploy; all discovered rules when empty.
        rules: Vec<String>,
        /// Print the plan without applying it.
        #[arg(short = 'n', long)]
        dryrun: bool,
        /// Treat every deployed rule as changed.
        #[arg(long)]
        skip_diff: bool,
        #[arg(long)]
        skip_bootstrap: bool,
        #[arg(long, value_enum)]
        backend: Option<ApplyBackend>,
    },
    /// Remove deployed rules and wait until they are gone.
    Destroy {
        rules: Vec<String>,
        #[arg(short = 'n', long)]
        dryrun: bool,
        #[arg(long, value_enum)]
        backend: Option<ApplyBackend>,
    },
    /// Resume waiting on stacks left in progress by an interrupted run.
    Wait,
    /// Run local rule tests.
    Test {
        rules: Vec<String>,
        /// Pass verbose flags to the test tools.
        #[arg(short, long)]
        verbose: bool,
    },
}

/// Bad configuration or rule definitions; reported with a distinct exit code.
#[derive(Debug, Error)]
#[error("{0:#}")]
struct InvalidInput(anyhow::Error);

fn main() {
    let cli = Cli::parse();
    logging::init(Verbosity::from_flags(cli.quiet, cli.debug));
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) if err.downcast_ref::<InvalidInput>().is_some() => {
            eprintln!("{:#}", err);
            exit_codes::INVALID
        }
        Err(err) => {
            eprintln!("{:#}", err);
            exit_codes::FAILED
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    let cfg = load_config(&cli.config).map_err(InvalidInput)?;
    match cli.command {
        Command::Deploy {
            rules,
            dryrun,
            skip_diff,
            skip_bootstrap,
            backend,
        } => {
            let options = DeployOptions {
                backend: backend.unwrap_or(cfg.deploy.backend),
                skip_diff: skip_diff || cfg.deploy.skip_diff,
                skip_bootstrap: skip_bootstrap || cfg.deploy.skip_bootstrap,
                dry_run: dryrun,
            };
            cmd_deploy(&cfg, &rules, options)
        }
        Command::Destroy {
            rules,
            dryrun,
            backend,
        } => {
            let options = DeployOptions {
                backend: backend.unwrap_or(cfg.deploy.backend),
                dry_run: dryrun,
                ..DeployOptions::default()
            };
            cmd_destroy(&cfg, &rules, options)
        }
        Command::Wait => cmd_wait(&cfg),
        Command::Test { rules, verbose } => cmd_test(&cfg, &rules, verbose),
    }
}

fn cmd_deploy(cfg: &RdkConfig, names: &[String], options: DeployOptions) -> Result<i32> {
    let units = load_units(cfg, names)?;
    warn_if_pending(cfg)?;
    let runner = process_runner(cfg);
    let cdk = cdk_tool(cfg, &runner)?;
    let api = AwsCliStackApi::new(&runner, cfg.region.clone());
    let sleeper = ThreadSleeper;
    let orchestrator = Orchestrator::new(&cdk, &api, &sleeper, cfg.poll_policy(), options)
        .with_ledger(cfg.pending_path());
    let report = orchestrator.plan_and_apply(&units)?;
    if report.dry_run {
        print_plan(&report.plan);
    }
    Ok(report.exit_code())
}

fn cmd_destroy(cfg: &RdkConfig, names: &[String], options: DeployOptions) -> Result<i32> {
    let units = load_units(cfg, names)?;
    warn_if_pending(cfg)?;
    let runner = process_runner(cfg);
    let cdk = cdk_tool(cfg, &runner)?;
    let api = AwsCliStackApi::new(&runner, cfg.region.clone());
    let sleeper = ThreadSleeper;
    let orchestrator = Orchestrator::new(&cdk, &api, &sleeper, cfg.poll_policy(), options)
        .with_ledger(cfg.pending_path());
    let report = orchestrator.destroy(&units)?;
    if report.dry_run {
        print_plan(&report.plan);
    }
    Ok(report.exit_code())
}

fn cmd_wait(cfg: &RdkConfig) -> Result<i32> {
    let path = cfg.pending_path();
    let Some(pending) = load_pending(&path).map_err(InvalidInput)? else {
        info!("Nothing pending.");
        return Ok(exit_codes::OK);
    };
    let runner = process_runner(cfg);
    let cdk = cdk_tool(cfg, &runner)?;
    let api = AwsCliStackApi::new(&runner, cfg.region.clone());
    let sleeper = ThreadSleeper;
    let orchestrator = Orchestrator::new(
        &cdk,
        &api,
        &sleeper,
        cfg.poll_policy(),
        DeployOptions::default(),
    )
    .with_ledger(path);
    let report = orchestrator.resume(&pending)?;
    Ok(report.exit_code())
}

fn cmd_test(cfg: &RdkConfig, names: &[String], verbose: bool) -> Result<i32> {
    let rules: Vec<RuleDefinition> =
        load_rules(&cfg.rules_dir, names).map_err(InvalidInput)?;
    let runner = process_runner(cfg);
    let tester = PolicyTester::new(&runner, cfg.python_interpreter.as_str())
        .verbose(verbose)
        .timeout(cfg.command_timeout());
    let summary = run_rule_tests(&tester, &rules);
    summary.log();
    Ok(summary.exit_code())
}

fn load_units(cfg: &RdkConfig, names: &[String]) -> Result<Vec<DeployableUnit>> {
    let rules = load_rules(&cfg.rules_dir, names).map_err(InvalidInput)?;
    Ok(rules.into_iter().map(|rule| rule.unit).collect())
}

fn process_runner(cfg: &RdkConfig) -> ProcessRunner {
    ProcessRunner::new(AllowList::standard(&cfg.python_interpreter))
}

fn cdk_tool<'r>(cfg: &RdkConfig, runner: &'r ProcessRunner) -> Result<CdkTool<&'r ProcessRunner>> {
    // The tool runs inside the app directory, so the rules path must not be relative.
    let rules_dir = absolute(&cfg.rules_dir)?;
    Ok(CdkTool::new(runner, &cfg.cdk.app_dir, rules_dir)
        .with_env(cfg.cdk_env())
        .with_stderr_level(cfg.command.stderr_level)
        .with_timeout(cfg.command_timeout()))
}

fn absolute(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path).with_context(|| format!("resolve {}", path.display()))
}

fn warn_if_pending(cfg: &RdkConfig) -> Result<()> {
    if load_pending(&cfg.pending_path())?.is_some() {
        warn!("a previous run left stacks pending; they are replaced by this run (see `rdk wait`)");
    }
    Ok(())
}

fn print_plan(plan: &DeploymentPlan) {
    for entry in &plan.entries {
        println!(
            "{:<8} {} ({})",
            entry.action.to_string(),
            entry.unit.name(),
            entry.unit.stack_name()
        );
    }
}
