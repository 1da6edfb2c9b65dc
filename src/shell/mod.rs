//! Persistent shell processes that drive the isolation tool.
//!
//! Each sandbox slot owns one long-lived `/bin/sh`. Commands are written to
//! its stdin and completion is detected with the sentinel framing in
//! [`protocol`], so running `isolate` costs no extra process spawn on the
//! host side.

pub mod persistent;
pub mod protocol;

pub use persistent::PersistentShell;

/// Output of one completed shell command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellOutput {
    /// Captured stdout with the sentinel stripped.
    pub stdout: String,
    /// Captured stderr with the sentinel stripped.
    pub stderr: String,
    /// `$?` of the command.
    pub exit_code: i32,
}
