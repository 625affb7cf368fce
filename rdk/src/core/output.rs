//! Cleaning and classification of child-process output lines.

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static ANSI_ESCAPE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[0-9;?]*[a-zA-Z]").expect("ansi escape pattern is valid")
});

/// Severity used when forwarding a child output line to the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineLevel {
    Debug,
    Info,
    Error,
}

/// Which pipe a line was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
        }
    }
}

/// Remove terminal escape sequences (colors, cursor movement).
pub fn strip_ansi(line: &str) -> Cow<'_, str> {
    ANSI_ESCAPE_RE.replace_all(line, "")
}

/// Clean a raw line: drop escape sequences and trailing whitespace.
///
/// Returns `None` for lines that are blank once cleaned.
pub fn clean_line(raw: &str) -> Option<String> {
    let stripped = strip_ansi(raw);
    let trimmed = stripped.trim_end();
    if trimmed.trim_start().is_empty() {
        return None;
    }
    Some(trimmed.to_string())
}

/// Informational lines that mention `Error` are promoted so tool failures
/// printed on stdout stand out in the log.
pub fn effective_level(base: LineLevel, line: &str) -> LineLevel {
    if base == LineLevel::Info && line.contains("Error") {
        LineLevel::Error
    } else {
        base
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_color_codes() {
        let raw = "\x1b[32m✓\x1b[0m  Synthesis time: \x1b[1m3.2s\x1b[22m";
        assert_eq!(strip_ansi(raw), "✓  Synthesis time: 3.2s");
    }

    #[test]
    fn clean_line_drops_blank_output() {
        assert_eq!(clean_line("   \x1b[0m  \n"), None);
        assert_eq!(
            clean_line("  Stack MFAENABLEDRULE\r\n"),
            Some("  Stack MFAENABLEDRULE".to_string())
        );
    }

    #[test]
    fn error_mentions_escalate_info_only() {
        assert_eq!(
            effective_level(LineLevel::Info, "ValidationError: bad template"),
            LineLevel::Error
        );
        assert_eq!(
            effective_level(LineLevel::Debug, "ValidationError: bad template"),
            LineLevel::Debug
        );
        assert_eq!(
            effective_level(LineLevel::Info, "deploying stack"),
            LineLevel::Info
        );
    }
}
