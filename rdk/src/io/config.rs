//! Tool configuration stored in `rdk.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::output::LineLevel;
use crate::core::poll::PollPolicy;
use crate::deploy::ApplyBackend;

pub const DEFAULT_CONFIG_FILE: &str = "rdk.toml";

/// Tool configuration (TOML).
///
/// Edited by humans; missing fields fall back to defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RdkConfig {
    /// Directory searched for rule directories.
    pub rules_dir: PathBuf,

    /// Interpreter used for python rule tests; also allow-listed.
    pub python_interpreter: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    /// Where the pending-operation ledger lives.
    pub state_dir: PathBuf,

    pub cdk: CdkConfig,
    pub deploy: DeployConfig,
    pub poll: PollConfig,
    pub command: CommandConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CdkConfig {
    /// CDK app directory; invocations run here.
    pub app_dir: PathBuf,
    /// Extra environment for `cdk` invocations.
    pub env: BTreeMap<String, String>,
}

impl Default for CdkConfig {
    fn default() -> Self {
        Self {
            app_dir: PathBuf::from("cdk"),
            env: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DeployConfig {
    pub backend: ApplyBackend,
    pub skip_diff: bool,
    pub skip_bootstrap: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PollConfig {
    pub interval_secs: u64,
    /// Unbounded when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            max_attempts: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CommandConfig {
    /// Level for child standard-error lines (`error` or `info`).
    pub stderr_level: LineLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            stderr_level: LineLevel::Error,
            timeout_secs: None,
        }
    }
}

impl Default for RdkConfig {
    fn default() -> Self {
        Self {
            rules_dir: PathBuf::from("."),
            python_interpreter: "python3".to_string(),
            region: None,
            state_dir: PathBuf::from(".rdk/state"),
            cdk: CdkConfig::default(),
            deploy: DeployConfig::default(),
            poll: PollConfig::default(),
            command: CommandConfig::default(),
        }
    }
}

impl RdkConfig {
    pub fn validate(&self) -> Result<()> {
        if self.python_interpreter.trim().is_empty() {
            return Err(anyhow!("python_interpreter must not be empty"));
        }
        if self.poll.interval_secs == 0 {
            return Err(anyhow!("poll.interval_secs must be > 0"));
        }
        if self.poll.max_attempts == Some(0) {
            return Err(anyhow!("poll.max_attempts must be > 0 when set"));
        }
        if self.command.timeout_secs == Some(0) {
            return Err(anyhow!("command.timeout_secs must be > 0 when set"));
        }
        if self.command.stderr_level == LineLevel::Debug {
            return Err(anyhow!("command.stderr_level must be \"error\" or \"info\""));
        }
        Ok(())
    }

    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            interval: Duration::from_secs(self.poll.interval_secs),
            max_attempts: self.poll.max_attempts,
        }
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        self.command.timeout_secs.map(Duration::from_secs)
    }

    /// Environment for infrastructure tool runs: `[cdk.env]` plus the region.
    pub fn cdk_env(&self) -> BTreeMap<String, String> {
        let mut env = self.cdk.env.clone();
        if let Some(region) = &self.region {
            env.insert("AWS_REGION".to_string(), region.clone());
            env.insert("AWS_DEFAULT_REGION".to_string(), region.clone());
        }
        env
    }

    pub fn pending_path(&self) -> PathBuf {
        self.state_dir.join(crate::io::ledger::PENDING_FILE)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RdkConfig::default()`.
pub fn load_config(path: &Path) -> Result<RdkConfig> {
    if !path.exists() {
        let cfg = RdkConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RdkConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}
