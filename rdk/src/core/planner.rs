//! Turn per-unit diff verdicts into a deployment plan.

use crate::core::types::{ActionKind, DeployableUnit, DeploymentPlan, PlannedUnit};

/// Result of comparing one unit's desired state with what is deployed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffVerdict {
    /// No remote instance exists; diffing was not attempted.
    NotDeployed,
    Unchanged,
    Changed,
}

impl DiffVerdict {
    /// Map a diff-tool exit code. Anything other than 0 counts as changed so a
    /// confused diff never suppresses a deployment.
    pub fn from_exit_code(code: i32) -> Self {
        if code == 0 {
            DiffVerdict::Unchanged
        } else {
            DiffVerdict::Changed
        }
    }

    fn action(self) -> ActionKind {
        match self {
            DiffVerdict::NotDeployed => ActionKind::Create,
            DiffVerdict::Changed => ActionKind::Update,
            DiffVerdict::Unchanged => ActionKind::Skip,
        }
    }
}

/// Build a deploy plan preserving caller order.
pub fn build_deploy_plan(verdicts: Vec<(DeployableUnit, DiffVerdict)>) -> DeploymentPlan {
    DeploymentPlan {
        entries: verdicts
            .into_iter()
            .map(|(unit, verdict)| PlannedUnit {
                unit,
                action: verdict.action(),
            })
            .collect(),
    }
}

/// Build a destroy plan: deployed units are destroyed, the rest skipped.
pub fn build_destroy_plan(units: Vec<(DeployableUnit, bool)>) -> DeploymentPlan {
    DeploymentPlan {
        entries: units
            .into_iter()
            .map(|(unit, deployed)| PlannedUnit {
                unit,
                action: if deployed {
                    ActionKind::Destroy
                } else {
                    ActionKind::Skip
                },
            })
            .collect(),
    }
}
