//! One long-lived shell with a single command in flight at a time.
//!
//! A command that outlives its timeout takes the whole process group down
//! with it: the shell is killed and a fresh one is spawned before the call
//! returns, so the owning slot stays usable. A command whose caller went away
//! mid-flight is treated the same way at the start of the next `execute`.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::protocol::{new_marker, split_stderr, split_stdout, wrap_command};
use super::ShellOutput;
use crate::error::ShellError;

const READ_CHUNK: usize = 8192;

/// A spawned shell and its pipes.
struct ShellProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
    stderr: ChildStderr,
    /// Set while a command is written but its sentinels not yet read.
    in_flight: bool,
}

impl ShellProcess {
    fn spawn(program: &str) -> Result<Self, ShellError> {
        let mut child = Command::new(program)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ShellError::Spawn {
                program: program.to_string(),
                source,
            })?;

        let missing = |stream: &str| {
            ShellError::Io(std::io::Error::other(format!("shell {stream} was not captured")))
        };
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        Ok(Self {
            child,
            stdin,
            stdout,
            stderr,
            in_flight: false,
        })
    }

    /// Write one wrapped command and read both streams up to their sentinels.
    async fn run(&mut self, wrapped: &str, marker: &str) -> Result<ShellOutput, ShellError> {
        self.in_flight = true;
        self.stdin.write_all(wrapped.as_bytes()).await?;
        self.stdin.flush().await?;

        let mut out = Vec::new();
        let mut err = Vec::new();
        let mut out_chunk = [0u8; READ_CHUNK];
        let mut err_chunk = [0u8; READ_CHUNK];
        let mut out_done = None;
        let mut err_done = None;

        let ((out_end, exit_code), err_end) = loop {
            if let (Some(out_split), Some(err_split)) = (out_done, err_done) {
                break (out_split, err_split);
            }

            tokio::select! {
                read = self.stdout.read(&mut out_chunk), if out_done.is_none() => {
                    let n = read?;
                    if n == 0 {
                        return Err(ShellError::Exited);
                    }
                    out.extend_from_slice(&out_chunk[..n]);
                    out_done = split_stdout(&out, marker);
                }
                read = self.stderr.read(&mut err_chunk), if err_done.is_none() => {
                    let n = read?;
                    if n == 0 {
                        return Err(ShellError::Exited);
                    }
                    err.extend_from_slice(&err_chunk[..n]);
                    err_done = split_stderr(&err, marker);
                }
            }
        };

        self.in_flight = false;
        Ok(ShellOutput {
            stdout: String::from_utf8_lossy(&out[..out_end]).into_owned(),
            stderr: String::from_utf8_lossy(&err[..err_end]).into_owned(),
            exit_code,
        })
    }

    /// Kill the shell's whole process group, then reap the shell.
    async fn kill(mut self, name: &str) {
        match self.child.id() {
            Some(pid) => {
                let group = Pid::from_raw(pid as i32);
                if let Err(e) = killpg(group, Signal::SIGKILL) {
                    warn!(shell = %name, pid, error = %e, "killpg failed, killing shell directly");
                    if let Err(e) = self.child.start_kill() {
                        warn!(shell = %name, pid, error = %e, "Direct kill failed");
                    }
                }
            }
            None => debug!(shell = %name, "Shell already exited"),
        }
        if let Err(e) = self.child.wait().await {
            warn!(shell = %name, error = %e, "Failed to reap killed shell");
        }
    }
}

/// Clears the busy flag when a command finishes or its future is dropped.
struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// A persistent shell bound to one sandbox slot.
pub struct PersistentShell {
    name: String,
    program: String,
    busy: AtomicBool,
    started: AtomicBool,
    process: Mutex<Option<ShellProcess>>,
}

impl PersistentShell {
    /// Create an unstarted shell. Call [`start`](Self::start) before use.
    pub fn new(name: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            busy: AtomicBool::new(false),
            started: AtomicBool::new(false),
            process: Mutex::new(None),
        }
    }

    /// Create and start a shell.
    pub async fn spawn(name: impl Into<String>, program: impl Into<String>) -> Result<Self, ShellError> {
        let shell = Self::new(name, program);
        shell.start().await?;
        Ok(shell)
    }

    /// Spawn the backing process.
    pub async fn start(&self) -> Result<(), ShellError> {
        let process = ShellProcess::spawn(&self.program)?;
        info!(shell = %self.name, pid = ?process.child.id(), "Spawned shell");
        *self.process.lock().await = Some(process);
        self.started.store(true, Ordering::Release);
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether a command is currently in flight.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Run `command` and wait for it, at most `timeout`.
    ///
    /// Fails with [`ShellError::AlreadyBusy`] while another command is in
    /// flight and with [`ShellError::NotInitialized`] before
    /// [`start`](Self::start). On timeout the shell is killed and respawned.
    pub async fn execute(&self, command: &str, timeout: Duration) -> Result<ShellOutput, ShellError> {
        let _busy = BusyGuard::acquire(&self.busy).ok_or(ShellError::AlreadyBusy)?;
        if !self.started.load(Ordering::Acquire) {
            return Err(ShellError::NotInitialized);
        }

        let mut process = self.process.lock().await;
        if process.as_ref().is_some_and(|p| p.in_flight) {
            warn!(shell = %self.name, "Previous command was abandoned mid-flight, replacing shell");
            if let Some(old) = process.take() {
                old.kill(&self.name).await;
            }
        }
        if process.is_none() {
            info!(shell = %self.name, "Spawning replacement shell");
            *process = Some(ShellProcess::spawn(&self.program)?);
        }
        let Some(running) = process.as_mut() else {
            return Err(ShellError::NotInitialized);
        };

        debug!(shell = %self.name, timeout_ms = timeout.as_millis() as u64, command, "Executing");
        let marker = new_marker();
        let wrapped = wrap_command(command, &marker);
        let outcome = tokio::time::timeout(timeout, running.run(&wrapped, &marker)).await;

        let error = match outcome {
            Ok(Ok(output)) => return Ok(output),
            Ok(Err(e)) => {
                warn!(shell = %self.name, error = %e, "Shell command failed, restarting shell");
                e
            }
            Err(_) => {
                warn!(shell = %self.name, timeout_ms = timeout.as_millis() as u64, "Command timed out, killing shell");
                ShellError::TimedOut(timeout)
            }
        };

        if let Some(old) = process.take() {
            old.kill(&self.name).await;
        }
        match ShellProcess::spawn(&self.program) {
            Ok(fresh) => {
                info!(shell = %self.name, pid = ?fresh.child.id(), "Respawned shell");
                *process = Some(fresh);
            }
            Err(e) => warn!(shell = %self.name, error = %e, "Respawn failed, will retry on next command"),
        }

        Err(error)
    }

    /// Kill the backing process. The shell must be started again before use.
    pub async fn shutdown(&self) {
        let old = self.process.lock().await.take();
        if let Some(old) = old {
            old.kill(&self.name).await;
            debug!(shell = %self.name, "Shell shut down");
        }
        self.started.store(false, Ordering::Release);
    }
}
