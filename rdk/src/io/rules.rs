//! Rule discovery and loading from a rules directory.
//!
//! A rule is any directory containing `parameters.json`. The directory name
//! is the rule name; an optional `template.json` next to it is the template
//! submitted by the CloudFormation backend.

use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow, bail};
use jsonschema::{Draft, Validator};
use serde_json::Value;
use tracing::{debug, instrument, warn};
use walkdir::WalkDir;

use crate::core::types::{DeployableUnit, stack_name_collisions};

pub const PARAMETERS_FILE: &str = "parameters.json";
pub const TEMPLATE_FILE: &str = "template.json";

const PARAMETERS_SCHEMA: &str = include_str!("../../schemas/parameters.schema.json");
const SKIPPED_DIRS: [&str; 2] = ["node_modules", "cdk.out"];
const GUARD_RUNTIMES: [&str; 2] = ["cloudformation-guard2.0", "guard-2.x.x"];

static PARAMETERS_VALIDATOR: LazyLock<std::result::Result<Validator, String>> =
    LazyLock::new(|| {
        let schema: Value = serde_json::from_str(PARAMETERS_SCHEMA).map_err(|e| e.to_string())?;
        jsonschema::options()
            .with_draft(Draft::Draft202012)
            .build(&schema)
            .map_err(|e| e.to_string())
    });

/// How a rule's local tests are run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleRuntime {
    Guard,
    Python(String),
    Other(String),
}

impl RuleRuntime {
    pub fn from_source_runtime(value: &str) -> Self {
        if GUARD_RUNTIMES.contains(&value) {
            RuleRuntime::Guard
        } else if value.starts_with("python") {
            RuleRuntime::Python(value.to_string())
        } else {
            RuleRuntime::Other(value.to_string())
        }
    }
}

/// A loaded rule: where it lives, how it deploys, how it is tested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleDefinition {
    pub dir: PathBuf,
    pub unit: DeployableUnit,
    pub runtime: RuleRuntime,
}

/// Every rule directory under `rules_dir`, sorted by path.
pub fn discover_rule_dirs(rules_dir: &Path) -> Result<Vec<PathBuf>> {
    if !rules_dir.is_dir() {
        bail!("rules directory {} does not exist", rules_dir.display());
    }
    let mut dirs = Vec::new();
    let walker = WalkDir::new(rules_dir)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            !(entry.file_type().is_dir()
                && (name.starts_with('.') || SKIPPED_DIRS.contains(&name.as_ref())))
        });
    for entry in walker {
        let entry = entry.with_context(|| format!("walk {}", rules_dir.display()))?;
        if entry.file_type().is_file() && entry.file_name() == OsStr::new(PARAMETERS_FILE) {
            if let Some(parent) = entry.path().parent() {
                dirs.push(parent.to_path_buf());
            }
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// Load one rule directory.
pub fn load_rule(dir: &Path) -> Result<RuleDefinition> {
    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| anyhow!("rule path {} has no directory name", dir.display()))?;
    let params_path = dir.join(PARAMETERS_FILE);
    let raw = fs::read_to_string(&params_path)
        .with_context(|| format!("read {}", params_path.display()))?;
    let document: Value = serde_json::from_str(&raw)
        .with_context(|| format!("parse {}", params_path.display()))?;
    validate_parameters(&document).with_context(|| format!("validate {}", params_path.display()))?;

    let parameters = flatten_parameters(&document);
    let declared = parameter(&parameters, "RuleName");
    if declared.is_some_and(|declared| declared != name) {
        warn!(rule = %name, declared = ?declared, "RuleName differs from directory name");
    }
    let runtime =
        RuleRuntime::from_source_runtime(parameter(&parameters, "SourceRuntime").unwrap_or(""));

    let mut unit = DeployableUnit::new(&name)
        .with_context(|| format!("rule {}", dir.display()))?
        .with_parameters(parameters);
    let template_path = dir.join(TEMPLATE_FILE);
    if template_path.is_file() {
        let body = fs::read_to_string(&template_path)
            .with_context(|| format!("read {}", template_path.display()))?;
        unit = unit.with_template(body);
    }
    debug!(rule = %name, stack = %unit.stack_name(), ?runtime, "loaded rule");
    Ok(RuleDefinition {
        dir: dir.to_path_buf(),
        unit,
        runtime,
    })
}

/// Load the named rules (all discovered rules when `names` is empty).
///
/// Fails on unknown names and on rules whose stack names collide.
#[instrument(skip_all, fields(rules_dir = %rules_dir.display(), requested = names.len()))]
pub fn load_rules(rules_dir: &Path, names: &[String]) -> Result<Vec<RuleDefinition>> {
    let dirs = discover_rule_dirs(rules_dir)?;
    let selected: Vec<PathBuf> = if names.is_empty() {
        dirs
    } else {
        names
            .iter()
            .map(|name| {
                dirs.iter()
                    .find(|dir| dir.file_name().is_some_and(|n| n == OsStr::new(name)))
                    .cloned()
                    .ok_or_else(|| anyhow!("unknown rule {name:?} in {}", rules_dir.display()))
            })
            .collect::<Result<_>>()?
    };
    let rules = selected
        .iter()
        .map(|dir| load_rule(dir))
        .collect::<Result<Vec<_>>>()?;

    let units: Vec<DeployableUnit> = rules.iter().map(|rule| rule.unit.clone()).collect();
    let collisions = stack_name_collisions(&units);
    if !collisions.is_empty() {
        let described: Vec<String> = collisions
            .iter()
            .map(|(stack, names)| format!("{stack} <- {}", names.join(", ")))
            .collect();
        bail!("rules share a stack name: {}", described.join("; "));
    }
    Ok(rules)
}

fn validate_parameters(document: &Value) -> Result<()> {
    let validator = PARAMETERS_VALIDATOR
        .as_ref()
        .map_err(|err| anyhow!("compile parameters schema: {err}"))?;
    let messages: Vec<String> = validator
        .iter_errors(document)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("schema validation failed:\n- {}", messages.join("\n- "));
    }
    Ok(())
}

/// `Parameters` as string pairs in file order; non-string values are
/// JSON-encoded.
fn flatten_parameters(document: &Value) -> Vec<(String, String)> {
    let Some(object) = document.get("Parameters").and_then(Value::as_object) else {
        return Vec::new();
    };
    object
        .iter()
        .map(|(key, value)| {
            let value = match value {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            };
            (key.clone(), value)
        })
        .collect()
}

fn parameter<'p>(pairs: &'p [(String, String)], key: &str) -> Option<&'p str> {
    pairs
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}
