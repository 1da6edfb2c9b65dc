//! Translation of semantic resource limits into isolate CLI flags.
//!
//! Everything here is pure. The supervisory timeout computed by
//! [`TimeoutPolicy::supervisory_timeout`] is always strictly longer than the
//! wall-time limit handed to the sandbox, so a program that runs out of time
//! is reported by isolate as `TO` before the shell supervisor gives up on it.

use std::time::Duration;

/// A count limit that may be switched off entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Count {
    Unlimited,
    Limited(u32),
}

/// Limits applied to one sandboxed run. `None` leaves the tool's default.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceLimits {
    /// Address-space (or cgroup) memory limit in bytes.
    pub memory_bytes: Option<u64>,
    /// CPU time limit.
    pub time: Option<Duration>,
    /// Wall-clock limit. Derived from `time` when absent.
    pub wall_time: Option<Duration>,
    pub open_files: Option<Count>,
    pub processes: Option<Count>,
    /// Largest file the program may create, in bytes.
    pub file_size_bytes: Option<u64>,
}

impl ResourceLimits {
    #[must_use]
    pub const fn with_time(mut self, time: Duration) -> Self {
        self.time = Some(time);
        self
    }

    #[must_use]
    pub const fn with_memory(mut self, bytes: u64) -> Self {
        self.memory_bytes = Some(bytes);
        self
    }

    #[must_use]
    pub const fn with_processes(mut self, processes: Count) -> Self {
        self.processes = Some(processes);
        self
    }
}

/// Bytes to KiB, rounded to the nearest KiB.
pub const fn to_kib(bytes: u64) -> u64 {
    bytes.saturating_add(512) / 1024
}

/// Seconds with millisecond precision, as isolate expects.
pub fn seconds(duration: Duration) -> String {
    format!("{:.3}", duration.as_secs_f64())
}

pub fn memory_arg(bytes: u64, cgroups: bool) -> String {
    if cgroups {
        format!("--cg-mem={}", to_kib(bytes))
    } else {
        format!("--mem={}", to_kib(bytes))
    }
}

pub fn time_arg(time: Duration) -> String {
    format!("--time={}", seconds(time))
}

pub fn wall_time_arg(wall_time: Duration) -> String {
    format!("--wall-time={}", seconds(wall_time))
}

/// `0` switches the open-file limit off in isolate.
pub fn open_files_arg(open_files: Count) -> String {
    match open_files {
        Count::Unlimited => "--open-files=0".to_string(),
        Count::Limited(n) => format!("--open-files={n}"),
    }
}

/// A bare `--processes` allows any number of processes.
pub fn processes_arg(processes: Count) -> String {
    match processes {
        Count::Unlimited => "--processes".to_string(),
        Count::Limited(n) => format!("--processes={n}"),
    }
}

pub fn file_size_arg(bytes: u64) -> String {
    format!("--fsize={}", to_kib(bytes))
}

/// How wall-time defaults and the host-side timeout are derived.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeoutPolicy {
    /// Fixed overhead added on top of the stretched limit.
    pub base: Duration,
    /// Multiplier applied to the time limit (kept at 1.0 or above).
    pub multiplier: f64,
    /// Fixed extension applied to the time limit.
    pub offset: Duration,
    /// Stand-in limit when a run has no time limit at all.
    pub fallback: Duration,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            multiplier: 2.0,
            offset: Duration::from_secs(1),
            fallback: Duration::from_secs(10),
        }
    }
}

impl TimeoutPolicy {
    /// `max(limit × multiplier, limit + offset)`.
    pub fn stretch(&self, limit: Duration) -> Duration {
        let scaled = limit.mul_f64(self.multiplier.max(1.0));
        scaled.max(limit.saturating_add(self.offset))
    }

    /// The wall-time limit to hand to isolate.
    pub fn wall_time(&self, limits: &ResourceLimits) -> Option<Duration> {
        limits.wall_time.or_else(|| limits.time.map(|t| self.stretch(t)))
    }

    /// Host-side timeout for the whole isolate invocation.
    pub fn supervisory_timeout(&self, limits: &ResourceLimits) -> Duration {
        let limit = match (limits.time, self.wall_time(limits)) {
            (Some(time), Some(wall)) => time.max(wall),
            (Some(time), None) => time,
            (None, Some(wall)) => wall,
            (None, None) => self.fallback,
        };
        self.base.saturating_add(self.stretch(limit))
    }
}

/// All limit flags for an `isolate --run` invocation.
pub fn isolate_args(limits: &ResourceLimits, policy: &TimeoutPolicy, cgroups: bool) -> Vec<String> {
    let mut args = Vec::new();

    if let Some(bytes) = limits.memory_bytes {
        args.push(memory_arg(bytes, cgroups));
    }
    if let Some(time) = limits.time {
        args.push(time_arg(time));
    }
    if let Some(wall) = policy.wall_time(limits) {
        args.push(wall_time_arg(wall));
    }
    if let Some(open_files) = limits.open_files {
        args.push(open_files_arg(open_files));
    }
    if let Some(processes) = limits.processes {
        args.push(processes_arg(processes));
    }
    if let Some(bytes) = limits.file_size_bytes {
        args.push(file_size_arg(bytes));
    }

    args
}
