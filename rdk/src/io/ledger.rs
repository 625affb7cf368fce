//! Pending-operation ledger (`<state_dir>/pending.json`).
//!
//! Written before a deploy or destroy touches remote stacks and removed once
//! every touched stack is terminal, so an interrupted run can be resumed with
//! `rdk wait`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::types::ActionKind;

pub const PENDING_FILE: &str = "pending.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PendingOperation {
    Deploy,
    Destroy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingStack {
    pub unit_name: String,
    pub stack_name: String,
    pub action: ActionKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingOperations {
    pub operation: PendingOperation,
    pub stacks: Vec<PendingStack>,
}

/// Load the ledger; `None` when nothing is pending.
pub fn load_pending(path: &Path) -> Result<Option<PendingOperations>> {
    if !path.exists() {
        debug!(path = %path.display(), "no pending ledger");
        return Ok(None);
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read ledger {}", path.display()))?;
    let pending: PendingOperations = serde_json::from_str(&contents)
        .with_context(|| format!("parse ledger {}", path.display()))?;
    debug!(operation = ?pending.operation, stacks = pending.stacks.len(), "ledger loaded");
    Ok(Some(pending))
}

/// Atomically write the ledger (temp file + rename).
pub fn write_pending(path: &Path, pending: &PendingOperations) -> Result<()> {
    debug!(path = %path.display(), operation = ?pending.operation, stacks = pending.stacks.len(), "writing ledger");
    let mut buf = serde_json::to_string_pretty(pending)?;
    buf.push('\n');
    write_atomic(path, &buf)
}

pub fn clear_pending(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_file(path).with_context(|| format!("remove ledger {}", path.display()))?;
        debug!(path = %path.display(), "ledger cleared");
    }
    Ok(())
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("ledger path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp ledger {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace ledger {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_load_clear() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state").join(PENDING_FILE);
        let pending = PendingOperations {
            operation: PendingOperation::Destroy,
            stacks: vec![PendingStack {
                unit_name: "my_rule".to_string(),
                stack_name: "myrule".to_string(),
                action: ActionKind::Destroy,
            }],
        };

        write_pending(&path, &pending).expect("write");
        assert_eq!(load_pending(&path).expect("load"), Some(pending));

        clear_pending(&path).expect("clear");
        assert_eq!(load_pending(&path).expect("load"), None);
        clear_pending(&path).expect("clear twice");
    }

    #[test]
    fn corrupt_ledger_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(PENDING_FILE);
        fs::write(&path, "not json").expect("write");
        assert!(load_pending(&path).is_err());
    }
}
