//! Deployable units and deployment plans.
//!
//! These types define stable contracts between core components. They should not
//! depend on external state or I/O and must remain deterministic across runs.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Longest stack name the remote service accepts.
pub const MAX_STACK_NAME_LEN: usize = 128;

const NAME_SEPARATORS: [char; 1] = ['_'];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UnitError {
    #[error("rule name must not be empty")]
    EmptyName,
    #[error("stack name for rule {name} is {len} characters (limit {MAX_STACK_NAME_LEN})")]
    NameTooLong { name: String, len: usize },
    #[error("rule {name} does not map to a valid stack name ({stack_name:?})")]
    InvalidStackName { name: String, stack_name: String },
}

/// Stack identifier used remotely for a rule name (separators stripped).
pub fn normalize_name(name: &str) -> String {
    name.chars()
        .filter(|c| !NAME_SEPARATORS.contains(c))
        .collect()
}

fn is_valid_stack_name(stack_name: &str) -> bool {
    let mut chars = stack_name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '-')
}

/// One independently deployable rule.
///
/// Immutable for the duration of a command; built once from caller input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployableUnit {
    name: String,
    stack_name: String,
    template_body: Option<String>,
    parameters: Vec<(String, String)>,
}

impl DeployableUnit {
    pub fn new(name: impl Into<String>) -> Result<Self, UnitError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(UnitError::EmptyName);
        }
        let stack_name = normalize_name(&name);
        if stack_name.len() > MAX_STACK_NAME_LEN {
            return Err(UnitError::NameTooLong {
                len: stack_name.len(),
                name,
            });
        }
        if !is_valid_stack_name(&stack_name) {
            return Err(UnitError::InvalidStackName { name, stack_name });
        }
        Ok(Self {
            name,
            stack_name,
            template_body: None,
            parameters: Vec::new(),
        })
    }

    pub fn with_template(mut self, body: impl Into<String>) -> Self {
        self.template_body = Some(body.into());
        self
    }

    pub fn with_parameters(mut self, parameters: Vec<(String, String)>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Normalized name used as the remote stack identifier.
    pub fn stack_name(&self) -> &str {
        &self.stack_name
    }

    pub fn template_body(&self) -> Option<&str> {
        self.template_body.as_deref()
    }

    pub fn parameters(&self) -> &[(String, String)] {
        &self.parameters
    }
}

/// Group unit names whose stack names collide after normalization.
///
/// Returned in stack-name order; empty when every stack name is unique.
pub fn stack_name_collisions(units: &[DeployableUnit]) -> Vec<(String, Vec<String>)> {
    let mut by_stack: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for unit in units {
        by_stack
            .entry(unit.stack_name())
            .or_default()
            .push(unit.name().to_string());
    }
    by_stack
        .into_iter()
        .filter(|(_, names)| names.len() > 1)
        .map(|(stack, names)| (stack.to_string(), names))
        .collect()
}

/// What the orchestrator will do with a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Create,
    Update,
    Destroy,
    Skip,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ActionKind::Create => "create",
            ActionKind::Update => "update",
            ActionKind::Destroy => "destroy",
            ActionKind::Skip => "skip",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedUnit {
    pub unit: DeployableUnit,
    pub action: ActionKind,
}

/// Units of one run with the action chosen for each, in caller order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeploymentPlan {
    pub entries: Vec<PlannedUnit>,
}

impl DeploymentPlan {
    /// Entries that require an external operation.
    pub fn actionable(&self) -> impl Iterator<Item = &PlannedUnit> {
        self.entries
            .iter()
            .filter(|entry| entry.action != ActionKind::Skip)
    }

    pub fn actionable_units(&self) -> Vec<&DeployableUnit> {
        self.actionable().map(|entry| &entry.unit).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.actionable().next().is_none()
    }

    pub fn count(&self, action: ActionKind) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.action == action)
            .count()
    }
}
