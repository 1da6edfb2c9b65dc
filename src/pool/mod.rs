//! Bounded pool of isolate sandboxes.
//!
//! The pool owns `box_count` slots, each with a persistent shell. A request
//! waits for a slot on a [`PrioritySemaphore`], then runs the whole box
//! lifecycle: init, stage inputs, run, collect, cleanup. Cleanup and the
//! return of the slot happen on every path, including failures and
//! cancellation of the request.

pub mod semaphore;

use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

pub use semaphore::{OwnedPriorityPermit, PriorityPermit, PrioritySemaphore};

use crate::backend::{
    ExecuteOptions, ExecutionResult, InputFile, IsolationBackend, OutputFile, PoolStatus,
    SandboxCommand,
};
use crate::config::PoolSection;
use crate::error::{ExecutorError, ShellError};
use crate::limits::{self, TimeoutPolicy};
use crate::metadata::{self, Metadata};
use crate::shell::protocol::join_quoted;
use crate::shell::{PersistentShell, ShellOutput};

/// Combined stdout/stderr of the program, inside the box.
pub const OUTPUT_FILE: &str = "output.txt";
/// Stdin content of the program, inside the box.
pub const STDIN_FILE: &str = "stdin.txt";
/// Stdin of a program given no input.
const NULL_DEVICE: &str = "/dev/null";

/// Runtime pool configuration with `Duration` fields.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// The isolation tool executable.
    pub isolate_bin: String,
    /// Shell used for the persistent per-slot processes.
    pub shell: String,
    /// Directory holding `<id>/box` for every slot.
    pub sandbox_root: PathBuf,
    pub box_count: usize,
    /// Directory for the per-slot `--meta` reports, outside the boxes.
    pub metadata_dir: PathBuf,
    /// Timeout for `--init` and `--cleanup`.
    pub command_timeout: Duration,
    pub timeouts: TimeoutPolicy,
    /// Pass `--cg` and use cgroup memory limits.
    pub use_cgroups: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::from_section(&PoolSection::default())
    }
}

impl PoolConfig {
    /// Create from the JSON configuration values.
    pub fn from_section(section: &PoolSection) -> Self {
        let command_timeout = Duration::from_millis(section.command_timeout_ms);
        Self {
            isolate_bin: section.isolate_bin.clone(),
            shell: section.shell.clone(),
            sandbox_root: section.sandbox_root.clone(),
            box_count: section.box_count.max(1),
            metadata_dir: section.metadata_dir.clone(),
            command_timeout,
            timeouts: TimeoutPolicy {
                base: Duration::from_millis(section.base_timeout_ms),
                multiplier: section.wall_time_multiplier,
                offset: Duration::from_millis(section.wall_time_offset_ms),
                fallback: command_timeout,
            },
            use_cgroups: section.use_cgroups,
        }
    }
}

/// Lifecycle state of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    Initializing,
    Running,
    Cleaning,
}

struct Slot {
    id: usize,
    box_dir: PathBuf,
    meta_path: PathBuf,
    shell: PersistentShell,
    state: Mutex<SlotState>,
}

impl Slot {
    fn set_state(&self, state: SlotState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn state(&self) -> SlotState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Pool state shared with cleanup tasks that outlive a cancelled request.
struct PoolInner {
    config: PoolConfig,
    slots: Vec<Slot>,
    free: Mutex<Vec<usize>>,
    semaphore: Arc<PrioritySemaphore>,
}

/// Holds a slot and its permit until the box is cleaned up.
///
/// Dropped before cleanup ran, which happens when the request future is
/// cancelled, it cleans the box on a background task and only then hands the
/// slot and permit back.
struct SlotLease {
    pool: Arc<PoolInner>,
    id: usize,
    permit: Option<OwnedPriorityPermit>,
    cleaned: bool,
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        let permit = self.permit.take();
        if self.cleaned {
            self.pool.release_slot(self.id);
            drop(permit);
            return;
        }

        warn!(box_id = self.id, "Request dropped mid-flight, cleaning up in the background");
        let pool = Arc::clone(&self.pool);
        let id = self.id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    pool.cleanup(&pool.slots[id]).await;
                    pool.release_slot(id);
                    drop(permit);
                });
            }
            Err(_) => {
                warn!(box_id = id, "No runtime for cleanup, releasing sandbox as is");
                pool.release_slot(id);
                drop(permit);
            }
        }
    }
}

/// A fixed set of reusable sandboxes.
pub struct SandboxPool {
    inner: Arc<PoolInner>,
}

impl SandboxPool {
    /// Create the pool and start one shell per slot.
    pub async fn new(config: PoolConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.metadata_dir)
            .await
            .with_context(|| {
                format!("Failed to create metadata dir {}", config.metadata_dir.display())
            })?;

        let mut slots = Vec::with_capacity(config.box_count);
        for id in 0..config.box_count {
            let shell = PersistentShell::spawn(format!("box-{id}"), config.shell.as_str())
                .await
                .with_context(|| format!("Failed to start shell for box {id}"))?;
            slots.push(Slot {
                id,
                box_dir: config.sandbox_root.join(id.to_string()).join("box"),
                meta_path: config.metadata_dir.join(format!("{id}.meta")),
                shell,
                state: Mutex::new(SlotState::Free),
            });
        }

        info!(
            boxes = config.box_count,
            root = %config.sandbox_root.display(),
            isolate = %config.isolate_bin,
            "Sandbox pool ready"
        );

        Ok(Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new((0..config.box_count).rev().collect()),
                semaphore: Arc::new(PrioritySemaphore::new(config.box_count)),
                slots,
                config,
            }),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Advisory snapshot; may be stale by the time it is read.
    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            total: self.inner.slots.len(),
            available: self.inner.free_list().len(),
        }
    }

    /// Current lifecycle state of a slot, if it exists.
    pub fn slot_state(&self, id: usize) -> Option<SlotState> {
        self.inner.slots.get(id).map(Slot::state)
    }

    /// Kill every slot's shell.
    pub async fn shutdown(&self) {
        for slot in &self.inner.slots {
            slot.shell.shutdown().await;
        }
        info!("Sandbox pool shut down");
    }

    fn lease(&self, permit: OwnedPriorityPermit) -> Result<SlotLease, ExecutorError> {
        let id = self.inner.free_list().pop().ok_or(ExecutorError::NoFreeSlot)?;
        Ok(SlotLease {
            pool: Arc::clone(&self.inner),
            id,
            permit: Some(permit),
            cleaned: false,
        })
    }

    /// Run one request in the next free sandbox.
    ///
    /// Cancel-safe: if the returned future is dropped mid-run, the box is
    /// still cleaned up before its slot is reused.
    #[instrument(skip(self, command, options), fields(box_id))]
    pub async fn execute(
        &self,
        command: &SandboxCommand,
        priority: i32,
        options: &ExecuteOptions,
    ) -> Result<ExecutionResult, ExecutorError> {
        let permit = Arc::clone(&self.inner.semaphore).acquire_owned(priority).await;
        let mut lease = self.lease(permit)?;
        let slot = &self.inner.slots[lease.id];
        tracing::Span::current().record("box_id", slot.id);
        debug!("Acquired sandbox");

        let result = self.inner.run_in_slot(slot, command, options).await;
        self.inner.cleanup(slot).await;
        lease.cleaned = true;

        if let Err(e) = &result {
            warn!(error = %e, "Sandbox execution failed");
        }
        result
    }
}

impl PoolInner {
    fn free_list(&self) -> MutexGuard<'_, Vec<usize>> {
        self.free.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release_slot(&self, id: usize) {
        self.slots[id].set_state(SlotState::Free);
        self.free_list().push(id);
        debug!(box_id = id, "Released sandbox");
    }

    async fn run_in_slot(
        &self,
        slot: &Slot,
        command: &SandboxCommand,
        options: &ExecuteOptions,
    ) -> Result<ExecutionResult, ExecutorError> {
        slot.set_state(SlotState::Initializing);
        self.init_box(slot).await?;

        stage_inputs(&slot.box_dir, options)
            .await
            .map_err(|source| ExecutorError::EnvironmentSetup {
                box_id: slot.id,
                source,
            })?;

        slot.set_state(SlotState::Running);
        let run_command = self.run_command(slot, command, options);
        let timeout = self.config.timeouts.supervisory_timeout(&options.limits);
        let shell_output = match slot.shell.execute(&run_command, timeout).await {
            Ok(output) => output,
            Err(ShellError::TimedOut(after)) => {
                return Err(ExecutorError::Internal {
                    box_id: slot.id,
                    reason: format!("supervisory timeout fired after {after:?}"),
                });
            }
            Err(e) => {
                return Err(ExecutorError::Internal {
                    box_id: slot.id,
                    reason: e.to_string(),
                });
            }
        };

        if reports_box_in_use(&shell_output.stderr) {
            return Err(ExecutorError::Internal {
                box_id: slot.id,
                reason: format!("sandbox already in use: {}", shell_output.stderr.trim()),
            });
        }

        Ok(self.collect(slot, &shell_output, &options.output_files).await)
    }

    async fn init_box(&self, slot: &Slot) -> Result<(), ExecutorError> {
        let command = join_quoted(self.box_args(slot, "--init"));
        match slot.shell.execute(&command, self.config.command_timeout).await {
            Ok(output) if output.exit_code == 0 => {
                debug!(box_id = slot.id, path = %output.stdout.trim(), "Initialized sandbox");
                Ok(())
            }
            Ok(output) => Err(ExecutorError::SandboxInit {
                box_id: slot.id,
                reason: non_empty_or(output.stderr.trim(), || {
                    format!("init exited with code {}", output.exit_code)
                }),
            }),
            Err(e) => Err(ExecutorError::SandboxInit {
                box_id: slot.id,
                reason: e.to_string(),
            }),
        }
    }

    fn box_args(&self, slot: &Slot, action: &str) -> Vec<String> {
        let mut args = vec![self.config.isolate_bin.clone(), format!("--box-id={}", slot.id)];
        if self.config.use_cgroups {
            args.push("--cg".to_string());
        }
        args.push(action.to_string());
        args
    }

    fn run_command(&self, slot: &Slot, command: &SandboxCommand, options: &ExecuteOptions) -> String {
        let mut args = self.box_args(slot, "--run");
        args.push(format!("--meta={}", slot.meta_path.display()));
        args.push(format!("--stdout={OUTPUT_FILE}"));
        args.push("--stderr-to-stdout".to_string());
        // Without --stdin the program would inherit the shell's command pipe.
        let stdin = if options.stdin.is_some() { STDIN_FILE } else { NULL_DEVICE };
        args.push(format!("--stdin={stdin}"));
        if options.inherit_env {
            args.push("--full-env".to_string());
        }
        args.extend(limits::isolate_args(
            &options.limits,
            &self.config.timeouts,
            self.config.use_cgroups,
        ));
        args.push("--".to_string());
        args.extend(command.to_argv());
        join_quoted(args)
    }

    async fn collect(
        &self,
        slot: &Slot,
        shell_output: &ShellOutput,
        output_files: &[OutputFile],
    ) -> ExecutionResult {
        let output = read_best_effort(&slot.box_dir.join(OUTPUT_FILE), slot.id).await;
        let report = read_best_effort(&slot.meta_path, slot.id).await;
        let metadata = metadata::parse(Some(report.as_str()));
        let exit_code = derive_exit_code(&metadata, shell_output.exit_code);
        let message = metadata
            .get("message")
            .cloned()
            .or_else(|| last_line(&shell_output.stderr));

        copy_outputs(&slot.box_dir, output_files, slot.id).await;

        debug!(
            box_id = slot.id,
            exit_code,
            status = metadata::status(&metadata).unwrap_or("OK"),
            "Collected run results"
        );

        ExecutionResult {
            exit_code,
            output,
            message,
            metadata,
        }
    }

    async fn cleanup(&self, slot: &Slot) {
        slot.set_state(SlotState::Cleaning);
        let command = join_quoted(self.box_args(slot, "--cleanup"));
        match slot.shell.execute(&command, self.config.command_timeout).await {
            Ok(output) if output.exit_code == 0 => debug!(box_id = slot.id, "Cleaned up sandbox"),
            Ok(output) => warn!(
                box_id = slot.id,
                exit_code = output.exit_code,
                stderr = %output.stderr.trim(),
                "Sandbox cleanup failed"
            ),
            Err(e) => warn!(box_id = slot.id, error = %e, "Sandbox cleanup failed"),
        }

        if let Err(e) = tokio::fs::remove_file(&slot.meta_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(box_id = slot.id, error = %e, "Failed to remove metadata file");
            }
        }
    }
}

#[async_trait]
impl IsolationBackend for SandboxPool {
    async fn execute(
        &self,
        command: &SandboxCommand,
        priority: i32,
        options: &ExecuteOptions,
    ) -> Result<ExecutionResult, ExecutorError> {
        Self::execute(self, command, priority, options).await
    }

    fn status(&self) -> PoolStatus {
        Self::status(self)
    }
}

/// Exit code precedence: a kill counts as failure (1), then the fatal
/// signal, then the reported exit code, then the shell's `$?`.
pub fn derive_exit_code(meta: &Metadata, shell_exit_code: i32) -> i32 {
    if metadata::is_killed(meta) {
        1
    } else if let Some(signal) = metadata::exit_signal(meta) {
        signal
    } else if let Some(code) = metadata::exit_code(meta) {
        code
    } else {
        shell_exit_code
    }
}

fn reports_box_in_use(stderr: &str) -> bool {
    let stderr = stderr.to_ascii_lowercase();
    stderr.contains("already in use") || stderr.contains("currently in use")
}

fn last_line(text: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .rfind(|line| !line.is_empty())
        .map(str::to_string)
}

fn non_empty_or(text: &str, fallback: impl FnOnce() -> String) -> String {
    if text.is_empty() {
        fallback()
    } else {
        text.to_string()
    }
}

/// Resolve a file name inside the box, refusing anything that could escape.
fn box_path(box_dir: &Path, name: &str) -> std::io::Result<PathBuf> {
    let relative = Path::new(name);
    let plain = relative
        .components()
        .all(|c| matches!(c, Component::Normal(_)));
    if name.is_empty() || !plain {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("invalid sandbox file name `{name}`"),
        ));
    }
    Ok(box_dir.join(relative))
}

async fn stage_inputs(box_dir: &Path, options: &ExecuteOptions) -> std::io::Result<()> {
    for file in &options.input_files {
        let dest = box_path(box_dir, file.name())?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        match file {
            InputFile::Path { source, .. } => {
                tokio::fs::copy(source, &dest).await?;
            }
            InputFile::Inline { contents, .. } => {
                tokio::fs::write(&dest, contents).await?;
            }
        }
    }

    if let Some(stdin) = &options.stdin {
        tokio::fs::write(box_dir.join(STDIN_FILE), stdin).await?;
    }
    Ok(())
}

async fn read_best_effort(path: &Path, box_id: usize) -> String {
    match tokio::fs::read(path).await {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            warn!(box_id, path = %path.display(), error = %e, "Could not read sandbox file");
            String::new()
        }
    }
}

async fn copy_outputs(box_dir: &Path, output_files: &[OutputFile], box_id: usize) {
    for file in output_files {
        let source = match box_path(box_dir, &file.name) {
            Ok(source) => source,
            Err(e) => {
                warn!(box_id, error = %e, "Skipping output file");
                continue;
            }
        };
        if let Err(e) = tokio::fs::copy(&source, &file.destination).await {
            warn!(
                box_id,
                file = %file.name,
                destination = %file.destination.display(),
                error = %e,
                "Could not copy output file"
            );
        }
    }
}
