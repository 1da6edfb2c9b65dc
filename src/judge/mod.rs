//! Compile-and-run orchestration.
//!
//! One request compiles a source once, then runs the executable against
//! every input in its own sandbox. Per-input failures, including
//! infrastructure failures, become verdicts; only problems with the request
//! itself or with the compile step's infrastructure are returned as errors.

pub mod language;
pub mod policy;
pub mod verdict;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

pub use language::{LanguageSpec, OptimizationLevel, WarningLevel};
pub use verdict::{classify, outputs_match, Verdict};

use crate::backend::{
    ExecuteOptions, ExecutionResult, InputFile, IsolationBackend, OutputFile, SandboxCommand,
};
use crate::config::JudgeSection;
use crate::error::{ExecutorError, JudgeError};
use crate::limits::{Count, ResourceLimits};
use crate::metadata;

/// Time and memory limits of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepLimits {
    pub time_ms: u64,
    pub memory_mb: u64,
}

impl StepLimits {
    pub const fn compile_default() -> Self {
        Self {
            time_ms: 10_000,
            memory_mb: 512,
        }
    }

    pub const fn run_default() -> Self {
        Self {
            time_ms: 1_000,
            memory_mb: 256,
        }
    }

    pub const fn memory_bytes(self) -> u64 {
        self.memory_mb.saturating_mul(1024 * 1024)
    }

    fn to_limits(self) -> ResourceLimits {
        ResourceLimits::default()
            .with_time(Duration::from_millis(self.time_ms))
            .with_memory(self.memory_bytes())
    }
}

/// A source to compile and the inputs to run it against.
#[derive(Debug, Clone, Deserialize)]
pub struct CompileRunRequest {
    pub language: String,
    #[serde(default)]
    pub optimization: OptimizationLevel,
    #[serde(default)]
    pub warnings: WarningLevel,
    pub source: String,
    /// Stdin of each run, in order.
    #[serde(default)]
    pub inputs: Vec<String>,
    /// When present, one expected output per input.
    #[serde(default)]
    pub expected_outputs: Option<Vec<String>>,
    /// When present, the only headers a native source may include.
    #[serde(default)]
    pub allowed_headers: Option<Vec<String>>,
    #[serde(default)]
    pub banned_functions: Vec<String>,
    #[serde(default = "StepLimits::compile_default")]
    pub compile_limits: StepLimits,
    #[serde(default = "StepLimits::run_default")]
    pub run_limits: StepLimits,
}

impl CompileRunRequest {
    pub fn new(language: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            optimization: OptimizationLevel::default(),
            warnings: WarningLevel::default(),
            source: source.into(),
            inputs: Vec::new(),
            expected_outputs: None,
            allowed_headers: None,
            banned_functions: Vec::new(),
            compile_limits: StepLimits::compile_default(),
            run_limits: StepLimits::run_default(),
        }
    }

    #[must_use]
    pub fn with_inputs<I, S>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs = inputs.into_iter().map(Into::into).collect();
        self
    }
}

/// Outcome of one input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InputResult {
    pub verdict: Verdict,
    pub output: String,
    pub time_ms: u64,
    pub memory_kb: u64,
    pub exit_code: i32,
    pub exit_signal: Option<i32>,
    pub message: Option<String>,
}

impl InputResult {
    fn from_execution(result: &ExecutionResult, memory_limit_bytes: u64) -> Self {
        Self {
            verdict: classify(result, Some(memory_limit_bytes)),
            output: result.output.clone(),
            time_ms: metadata::time_ms(&result.metadata),
            memory_kb: metadata::memory_kb(&result.metadata),
            exit_code: result.exit_code,
            exit_signal: metadata::exit_signal(&result.metadata),
            message: result.message.clone(),
        }
    }

    fn internal_error(reason: String) -> Self {
        Self {
            verdict: Verdict::InternalError,
            output: String::new(),
            time_ms: 0,
            memory_kb: 0,
            exit_code: 0,
            exit_signal: None,
            message: Some(reason),
        }
    }
}

/// Aggregated outcome of a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompileRunResponse {
    /// First non-accepted verdict in input order, else `AC`.
    pub verdict: Verdict,
    pub compile_output: String,
    pub compile_time_ms: u64,
    pub compile_memory_kb: u64,
    pub executable_size: u64,
    pub results: Vec<InputResult>,
    pub total_time_ms: u64,
    pub max_time_ms: u64,
    pub total_memory_kb: u64,
    pub max_memory_kb: u64,
}

impl CompileRunResponse {
    fn without_runs(verdict: Verdict, compile_output: String) -> Self {
        Self {
            verdict,
            compile_output,
            compile_time_ms: 0,
            compile_memory_kb: 0,
            executable_size: 0,
            results: Vec::new(),
            total_time_ms: 0,
            max_time_ms: 0,
            total_memory_kb: 0,
            max_memory_kb: 0,
        }
    }

    fn aggregate(&mut self) {
        self.total_time_ms = self.results.iter().map(|r| r.time_ms).sum();
        self.max_time_ms = self.results.iter().map(|r| r.time_ms).max().unwrap_or(0);
        self.total_memory_kb = self.results.iter().map(|r| r.memory_kb).sum();
        self.max_memory_kb = self.results.iter().map(|r| r.memory_kb).max().unwrap_or(0);
        self.verdict = self
            .results
            .iter()
            .map(|r| r.verdict)
            .find(|v| !v.is_accepted())
            .unwrap_or(Verdict::Accepted);
    }
}

/// Runtime judge configuration.
#[derive(Debug, Clone)]
pub struct JudgeConfig {
    pub max_inputs: usize,
    /// Parent of the per-request scratch directories; system temp if unset.
    pub scratch_dir: Option<PathBuf>,
    pub compile_priority: i32,
    pub run_priority: i32,
    pub compile_processes: Count,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self::from_section(&JudgeSection::default())
    }
}

impl JudgeConfig {
    pub fn from_section(section: &JudgeSection) -> Self {
        Self {
            max_inputs: section.max_inputs,
            scratch_dir: section.scratch_dir.clone(),
            compile_priority: section.compile_priority,
            run_priority: section.run_priority,
            compile_processes: section.compile_processes.map_or(Count::Unlimited, Count::Limited),
        }
    }
}

/// Compiles and runs submissions on an [`IsolationBackend`].
pub struct Judge<B> {
    backend: Arc<B>,
    languages: HashMap<String, LanguageSpec>,
    config: JudgeConfig,
}

impl<B: IsolationBackend + 'static> Judge<B> {
    pub fn new(
        backend: Arc<B>,
        languages: HashMap<String, LanguageSpec>,
        config: JudgeConfig,
    ) -> Self {
        Self {
            backend,
            languages,
            config,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub const fn languages(&self) -> &HashMap<String, LanguageSpec> {
        &self.languages
    }

    #[instrument(skip_all, fields(language = %request.language, inputs = request.inputs.len()))]
    pub async fn compile_and_run(
        &self,
        request: &CompileRunRequest,
    ) -> Result<CompileRunResponse, JudgeError> {
        let language = self.validate(request)?;

        if language.native {
            if let Err(diagnostic) = policy::check_source(
                &request.source,
                request.allowed_headers.as_deref(),
                &request.banned_functions,
            ) {
                info!(%diagnostic, "Source rejected by policy");
                return Ok(CompileRunResponse::without_runs(
                    Verdict::CompilationError,
                    diagnostic,
                ));
            }
        }

        let scratch = self.scratch_dir()?;
        let executable = scratch.path().join(&language.executable);

        let compiled = self.compile(language, request, &executable).await?;
        let compile_output = compile_diagnostics(&compiled);
        if compiled.exit_code != 0 {
            info!(exit_code = compiled.exit_code, "Compilation failed");
            return Ok(CompileRunResponse::without_runs(
                Verdict::CompilationError,
                compile_output,
            ));
        }

        let executable_size = match tokio::fs::metadata(&executable).await {
            Ok(meta) => meta.len(),
            Err(e) => {
                warn!(error = %e, "Compiler succeeded but produced no executable");
                return Ok(CompileRunResponse::without_runs(
                    Verdict::InternalError,
                    format!("{compile_output}executable `{}` not produced: {e}", language.executable),
                ));
            }
        };

        let mut response = CompileRunResponse {
            compile_time_ms: metadata::time_ms(&compiled.metadata),
            compile_memory_kb: metadata::memory_kb(&compiled.metadata),
            executable_size,
            results: self.run_all(language, request, &executable).await,
            ..CompileRunResponse::without_runs(Verdict::Accepted, compile_output)
        };

        if let Some(expected) = &request.expected_outputs {
            for (result, expected) in response.results.iter_mut().zip(expected) {
                if result.verdict.is_accepted() && !outputs_match(&result.output, expected) {
                    result.verdict = Verdict::WrongAnswer;
                }
            }
        }

        response.aggregate();
        info!(verdict = %response.verdict.code(), "Request judged");
        Ok(response)
    }

    fn validate(&self, request: &CompileRunRequest) -> Result<&LanguageSpec, JudgeError> {
        let language = self
            .languages
            .get(&request.language)
            .ok_or_else(|| JudgeError::UnknownLanguage(request.language.clone()))?;

        if request.inputs.len() > self.config.max_inputs {
            return Err(JudgeError::TooManyInputs {
                given: request.inputs.len(),
                max: self.config.max_inputs,
            });
        }
        if let Some(expected) = &request.expected_outputs {
            if expected.len() != request.inputs.len() {
                return Err(JudgeError::InvalidRequest(format!(
                    "{} expected outputs for {} inputs",
                    expected.len(),
                    request.inputs.len()
                )));
            }
        }
        if request.compile_limits.time_ms == 0 || request.run_limits.time_ms == 0 {
            return Err(JudgeError::InvalidRequest("time limits must be positive".into()));
        }
        Ok(language)
    }

    fn scratch_dir(&self) -> Result<tempfile::TempDir, JudgeError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("judge-");
        let dir = match &self.config.scratch_dir {
            Some(parent) => builder.tempdir_in(parent)?,
            None => builder.tempdir()?,
        };
        Ok(dir)
    }

    async fn compile(
        &self,
        language: &LanguageSpec,
        request: &CompileRunRequest,
        executable: &Path,
    ) -> Result<ExecutionResult, JudgeError> {
        let argv = language.compile_argv(request.optimization, request.warnings);
        debug!(?argv, "Compiling");
        let options = ExecuteOptions {
            input_files: vec![InputFile::Inline {
                name: language.source_file.clone(),
                contents: request.source.clone(),
            }],
            output_files: vec![OutputFile {
                name: language.executable.clone(),
                destination: executable.to_path_buf(),
            }],
            inherit_env: true,
            limits: request
                .compile_limits
                .to_limits()
                .with_processes(self.config.compile_processes),
            ..ExecuteOptions::default()
        };
        let result = self
            .backend
            .execute(&SandboxCommand::Argv(argv), self.config.compile_priority, &options)
            .await?;
        Ok(result)
    }

    async fn run_all(
        &self,
        language: &LanguageSpec,
        request: &CompileRunRequest,
        executable: &Path,
    ) -> Vec<InputResult> {
        let command = SandboxCommand::Argv(language.run_argv());
        let limits = request.run_limits.to_limits();
        let memory_limit = request.run_limits.memory_bytes();

        let handles: Vec<_> = request
            .inputs
            .iter()
            .enumerate()
            .map(|(index, input)| {
                let backend = Arc::clone(&self.backend);
                let command = command.clone();
                let priority = self.config.run_priority;
                let options = ExecuteOptions {
                    stdin: Some(input.clone()),
                    input_files: vec![InputFile::Path {
                        name: language.executable.clone(),
                        source: executable.to_path_buf(),
                    }],
                    limits: limits.clone(),
                    ..ExecuteOptions::default()
                };
                tokio::spawn(async move {
                    let result = backend.execute(&command, priority, &options).await;
                    run_result(index, result, memory_limit)
                })
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for (index, handle) in handles.into_iter().enumerate() {
            let result = handle.await.unwrap_or_else(|e| {
                warn!(index, error = %e, "Run task failed");
                InputResult::internal_error(format!("run task failed: {e}"))
            });
            results.push(result);
        }
        results
    }
}

fn run_result(
    index: usize,
    result: Result<ExecutionResult, ExecutorError>,
    memory_limit_bytes: u64,
) -> InputResult {
    match result {
        Ok(result) => {
            let result = InputResult::from_execution(&result, memory_limit_bytes);
            debug!(index, verdict = %result.verdict.code(), time_ms = result.time_ms, "Input finished");
            result
        }
        Err(e) => {
            warn!(index, error = %e, internal = e.is_internal(), "Input could not be run");
            InputResult::internal_error(e.to_string())
        }
    }
}

/// Compiler output, or the best available explanation when it printed nothing.
fn compile_diagnostics(result: &ExecutionResult) -> String {
    if !result.output.trim().is_empty() || result.exit_code == 0 {
        return result.output.clone();
    }
    result
        .message
        .clone()
        .unwrap_or_else(|| format!("compiler exited with code {}", result.exit_code))
}
