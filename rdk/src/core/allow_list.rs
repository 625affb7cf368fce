//! Fixed set of executables the command runner may spawn.

use std::collections::BTreeSet;

/// Infrastructure-as-code tool driving synth/diff/deploy.
pub const INFRA_TOOL: &str = "cdk";
/// Policy-as-code test tool.
pub const POLICY_TEST_TOOL: &str = "cfn-guard";
/// CLI used to reach the remote orchestration API.
pub const REMOTE_CLI: &str = "aws";

/// Immutable allow-list checked before any child process is spawned.
///
/// Membership is an exact match on `argv[0]`; no `PATH` lookup or
/// canonicalization happens, so `/usr/bin/cdk` is not the same entry as `cdk`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowList {
    programs: BTreeSet<String>,
}

impl AllowList {
    pub fn new<I, S>(programs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            programs: programs
                .into_iter()
                .map(Into::into)
                .filter(|program: &String| !program.trim().is_empty())
                .collect(),
        }
    }

    /// The known tools plus the configured script interpreter.
    pub fn standard(interpreter: &str) -> Self {
        Self::new([INFRA_TOOL, POLICY_TEST_TOOL, REMOTE_CLI, interpreter])
    }

    pub fn permits(&self, program: &str) -> bool {
        !program.is_empty() && self.programs.contains(program)
    }

    pub fn programs(&self) -> impl Iterator<Item = &str> {
        self.programs.iter().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_list_contains_tools_and_interpreter() {
        let list = AllowList::standard("python3");
        let programs: Vec<&str> = list.programs().collect();
        assert_eq!(programs, vec!["aws", "cdk", "cfn-guard", "python3"]);
    }

    #[test]
    fn rejects_unknown_and_empty_programs() {
        let list = AllowList::standard("python3");
        assert!(list.permits("cdk"));
        assert!(!list.permits("curl"));
        assert!(!list.permits(""));
        assert!(!list.permits("/usr/local/bin/cdk"));
    }

    #[test]
    fn blank_entries_are_ignored() {
        let list = AllowList::new(["sh", " ", ""]);
        assert_eq!(list.programs().count(), 1);
    }
}
