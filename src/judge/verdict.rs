//! Verdict codes and per-run classification.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::backend::ExecutionResult;
use crate::limits::to_kib;
use crate::metadata;

/// Terminal classification of one execution or a whole request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verdict {
    #[serde(rename = "AC")]
    Accepted,
    #[serde(rename = "WA")]
    WrongAnswer,
    #[serde(rename = "TLE")]
    TimeLimitExceeded,
    #[serde(rename = "MLE")]
    MemoryLimitExceeded,
    #[serde(rename = "RE")]
    RuntimeError,
    #[serde(rename = "IR")]
    InvalidReturn,
    #[serde(rename = "CE")]
    CompilationError,
    #[serde(rename = "IE")]
    InternalError,
}

impl Verdict {
    pub const fn code(self) -> &'static str {
        match self {
            Self::Accepted => "AC",
            Self::WrongAnswer => "WA",
            Self::TimeLimitExceeded => "TLE",
            Self::MemoryLimitExceeded => "MLE",
            Self::RuntimeError => "RE",
            Self::InvalidReturn => "IR",
            Self::CompilationError => "CE",
            Self::InternalError => "IE",
        }
    }

    pub const fn is_accepted(self) -> bool {
        matches!(self, Self::Accepted)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Accepted => "Accepted",
            Self::WrongAnswer => "Wrong Answer",
            Self::TimeLimitExceeded => "Time Limit Exceeded",
            Self::MemoryLimitExceeded => "Memory Limit Exceeded",
            Self::RuntimeError => "Runtime Error",
            Self::InvalidReturn => "Invalid Return",
            Self::CompilationError => "Compilation Error",
            Self::InternalError => "Internal Error",
        };
        f.write_str(name)
    }
}

/// Classify one run from its result and metadata report.
///
/// Order matters: a memory kill beats a timeout, a timeout beats a signal,
/// and a signal beats a plain nonzero exit.
pub fn classify(result: &ExecutionResult, memory_limit_bytes: Option<u64>) -> Verdict {
    let meta = &result.metadata;
    let status = metadata::status(meta);

    if status == Some("XX") {
        return Verdict::InternalError;
    }

    let failed = status.is_some() || metadata::is_killed(meta) || result.exit_code != 0;
    let over_memory = memory_limit_bytes
        .is_some_and(|limit| metadata::memory_kb(meta) >= to_kib(limit));
    let memory_message = result
        .message
        .as_deref()
        .is_some_and(|m| m.to_ascii_lowercase().contains("memory limit"));
    if metadata::is_oom_killed(meta) || (failed && (over_memory || memory_message)) {
        return Verdict::MemoryLimitExceeded;
    }

    if status == Some("TO") {
        return Verdict::TimeLimitExceeded;
    }
    if metadata::exit_signal(meta).is_some_and(|sig| sig != 0) {
        return Verdict::RuntimeError;
    }
    if result.exit_code != 0 {
        return Verdict::InvalidReturn;
    }
    Verdict::Accepted
}

/// Whitespace-tolerant output comparison: line endings are normalized,
/// trailing whitespace on each line and trailing blank lines are ignored.
pub fn outputs_match(actual: &str, expected: &str) -> bool {
    normalized_lines(actual) == normalized_lines(expected)
}

fn normalized_lines(text: &str) -> Vec<&str> {
    let mut lines: Vec<&str> = text
        .split('\n')
        .map(|line| line.trim_end_matches(|c: char| c == '\r' || c.is_whitespace()))
        .collect();
    while lines.last().is_some_and(|line| line.is_empty()) {
        lines.pop();
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(exit_code: i32, meta: &str) -> ExecutionResult {
        let metadata = metadata::parse(Some(meta));
        ExecutionResult {
            exit_code,
            output: String::new(),
            message: metadata.get("message").cloned(),
            metadata,
        }
    }

    const MB: u64 = 1024 * 1024;

    #[test]
    fn clean_exit_is_accepted() {
        let r = result(0, "time:0.010\nmax-rss:2048\nexitcode:0\n");
        assert_eq!(classify(&r, Some(64 * MB)), Verdict::Accepted);
    }

    #[test]
    fn timeout_is_tle() {
        let r = result(1, "status:TO\nkilled:1\nmessage:Time limit exceeded\n");
        assert_eq!(classify(&r, Some(64 * MB)), Verdict::TimeLimitExceeded);
        let wall = result(1, "status:TO\nkilled:1\nmessage:Time limit exceeded (wall clock)\n");
        assert_eq!(classify(&wall, None), Verdict::TimeLimitExceeded);
    }

    #[test]
    fn oom_kill_is_mle() {
        let r = result(1, "status:SG\nexitsig:9\nkilled:1\ncg-oom-killed:1\n");
        assert_eq!(classify(&r, Some(64 * MB)), Verdict::MemoryLimitExceeded);
    }

    #[test]
    fn crash_at_memory_limit_is_mle() {
        let r = result(11, "status:SG\nexitsig:11\nmax-rss:65536\n");
        assert_eq!(classify(&r, Some(64 * MB)), Verdict::MemoryLimitExceeded);
    }

    #[test]
    fn high_memory_but_clean_exit_is_accepted() {
        let r = result(0, "max-rss:65536\nexitcode:0\n");
        assert_eq!(classify(&r, Some(64 * MB)), Verdict::Accepted);
    }

    #[test]
    fn signal_is_runtime_error() {
        let r = result(11, "status:SG\nexitsig:11\nmax-rss:1024\n");
        assert_eq!(classify(&r, Some(64 * MB)), Verdict::RuntimeError);
    }

    #[test]
    fn nonzero_exit_is_invalid_return() {
        let r = result(3, "status:RE\nexitcode:3\n");
        assert_eq!(classify(&r, None), Verdict::InvalidReturn);
    }

    #[test]
    fn tool_failure_is_internal() {
        let r = result(2, "status:XX\nmessage:cannot chdir\n");
        assert_eq!(classify(&r, None), Verdict::InternalError);
    }

    #[test]
    fn comparison_ignores_trailing_whitespace() {
        assert!(outputs_match("a \nb\n", "a\nb"));
        assert!(outputs_match("a\r\nb\r\n\r\n", "a\nb\n"));
        assert!(outputs_match("", "\n\n"));
        assert!(!outputs_match("a\nb\n", "a\nc\n"));
        assert!(!outputs_match(" a\n", "a\n"));
        assert!(!outputs_match("a\n\nb\n", "a\nb\n"));
    }

    #[test]
    fn verdict_codes_serialize_short() {
        assert_eq!(serde_json::to_string(&Verdict::TimeLimitExceeded).unwrap(), "\"TLE\"");
        assert_eq!(Verdict::InvalidReturn.code(), "IR");
        assert_eq!(Verdict::WrongAnswer.to_string(), "Wrong Answer");
    }
}
