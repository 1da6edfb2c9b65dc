//! Error taxonomy for the shell supervisor, the sandbox pool and the judge.
//!
//! Run outcomes (nonzero exits, signals, limit kills) are never errors; they
//! travel back as data inside [`crate::backend::ExecutionResult`].

use std::time::Duration;

use thiserror::Error;

/// Failures of a single [`crate::shell::PersistentShell`] command.
#[derive(Debug, Error)]
pub enum ShellError {
    /// A previous command on this shell has not completed yet.
    #[error("shell is busy with another command")]
    AlreadyBusy,

    /// The backing process was never spawned.
    #[error("shell process has not been started")]
    NotInitialized,

    /// The supervisory timer fired; the process group was killed.
    #[error("command timed out after {0:?}; shell was killed")]
    TimedOut(Duration),

    /// The shell exited before printing the completion sentinel.
    #[error("shell exited unexpectedly")]
    Exited,

    #[error("failed to spawn shell `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("shell I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of one pooled execution request.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// `isolate --init` failed. The slot was returned to the pool.
    #[error("failed to initialize sandbox {box_id}: {reason}")]
    SandboxInit { box_id: usize, reason: String },

    /// Input files or stdin could not be written into the box.
    #[error("failed to prepare sandbox {box_id}: {source}")]
    EnvironmentSetup {
        box_id: usize,
        #[source]
        source: std::io::Error,
    },

    /// Infrastructure distress: supervisory timeout, a box reported as
    /// already in use, or a broken shell.
    #[error("internal sandbox error on box {box_id}: {reason}")]
    Internal { box_id: usize, reason: String },

    /// A permit was granted but the free list was empty.
    #[error("no free sandbox slot despite an acquired permit")]
    NoFreeSlot,
}

impl ExecutorError {
    /// Whether this failure reflects broken infrastructure rather than a
    /// request that could not be prepared.
    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::Internal { .. } | Self::NoFreeSlot)
    }
}

/// Failures of a compile-and-run request as a whole.
#[derive(Debug, Error)]
pub enum JudgeError {
    #[error("unknown language `{0}`")]
    UnknownLanguage(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("{given} inputs submitted, at most {max} allowed")]
    TooManyInputs { given: usize, max: usize },

    #[error("scratch directory error: {0}")]
    Scratch(#[from] std::io::Error),

    #[error(transparent)]
    Executor(#[from] ExecutorError),
}
