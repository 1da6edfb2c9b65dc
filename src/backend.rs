//! Execution backend trait and the request/result types it speaks.
//!
//! [`crate::pool::SandboxPool`] is the production implementation; the judge
//! only depends on this trait so it can be driven by a mock in tests.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::ExecutorError;
use crate::limits::ResourceLimits;
use crate::metadata::Metadata;

/// What to run inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxCommand {
    /// Interpreted by `/bin/sh -c` inside the box.
    Shell(String),
    /// Executed directly; the first element is the program.
    Argv(Vec<String>),
}

impl SandboxCommand {
    pub fn argv<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Argv(args.into_iter().map(Into::into).collect())
    }

    /// The argument vector handed to the isolation tool after `--`.
    pub fn to_argv(&self) -> Vec<String> {
        match self {
            Self::Shell(script) => vec!["/bin/sh".to_string(), "-c".to_string(), script.clone()],
            Self::Argv(args) => args.clone(),
        }
    }
}

/// A file placed into the box before the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputFile {
    /// Copied from a host path.
    Path { name: String, source: PathBuf },
    /// Written from inline text.
    Inline { name: String, contents: String },
}

impl InputFile {
    pub fn name(&self) -> &str {
        match self {
            Self::Path { name, .. } | Self::Inline { name, .. } => name,
        }
    }
}

/// A file copied out of the box after the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFile {
    /// Name relative to the box directory.
    pub name: String,
    /// Host path to copy it to.
    pub destination: PathBuf,
}

/// Options of one execution request.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Written to the box and connected to the program's stdin.
    pub stdin: Option<String>,
    pub input_files: Vec<InputFile>,
    pub output_files: Vec<OutputFile>,
    /// Pass the host environment through (`--full-env`).
    pub inherit_env: bool,
    pub limits: ResourceLimits,
}

/// Result of one sandboxed run. Nonzero exits and kills are data.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionResult {
    /// Exit code derived from the metadata report, see the pool docs.
    pub exit_code: i32,
    /// Combined stdout and stderr of the program.
    pub output: String,
    /// The isolation tool's own diagnostic line, e.g. `Time limit exceeded`.
    pub message: Option<String>,
    /// Parsed `--meta` report.
    pub metadata: Metadata,
}

/// Advisory snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub total: usize,
    pub available: usize,
}

/// Trait for sandbox execution backends.
#[async_trait]
pub trait IsolationBackend: Send + Sync {
    /// Run `command` in a sandbox. Lower `priority` values are served first
    /// when callers queue for a slot.
    async fn execute(
        &self,
        command: &SandboxCommand,
        priority: i32,
        options: &ExecuteOptions,
    ) -> Result<ExecutionResult, ExecutorError>;

    /// Advisory occupancy snapshot; never blocks.
    fn status(&self) -> PoolStatus;
}
