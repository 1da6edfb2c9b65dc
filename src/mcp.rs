//! MCP server implementation using rmcp.
//!
//! Exposes the compile-and-run judge and the pool status as MCP tools.

use std::sync::Arc;

use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{CallToolResult, Content, Implementation, ServerCapabilities, ServerInfo};
use rmcp::schemars;
use rmcp::transport::stdio;
use rmcp::{tool, tool_handler, tool_router, ErrorData as McpError, ServerHandler, ServiceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::backend::{IsolationBackend, PoolStatus};
use crate::error::JudgeError;
use crate::judge::{CompileRunRequest, Judge, StepLimits};

/// MCP server for compiling and running untrusted code.
pub struct SandboxServer<B> {
    judge: Arc<Judge<B>>,
    tool_router: ToolRouter<Self>,
}

impl<B: IsolationBackend + 'static> Clone for SandboxServer<B> {
    fn clone(&self) -> Self {
        Self {
            judge: Arc::clone(&self.judge),
            tool_router: Self::tool_router(),
        }
    }
}

/// Parameters for the `compile_and_run` tool.
#[derive(Debug, Default, Deserialize, JsonSchema)]
pub struct CompileRunParams {
    #[schemars(description = "Language of the source (e.g. 'c', 'cpp', 'python3')")]
    pub language: String,

    #[schemars(description = "Complete program source")]
    pub source: String,

    #[schemars(description = "Stdin for each run; the program runs once per input")]
    #[serde(default)]
    pub inputs: Vec<String>,

    #[schemars(description = "Expected stdout per input; mismatches are reported as WA")]
    #[serde(default)]
    pub expected_outputs: Option<Vec<String>>,

    #[schemars(description = "Optimization level: O0, O1, O2 (default), O3 or Os")]
    #[serde(default)]
    pub optimization: Option<String>,

    #[schemars(description = "Warning level: none, default, all, extra or error")]
    #[serde(default)]
    pub warnings: Option<String>,

    #[schemars(description = "Only these headers may be included (C/C++)")]
    #[serde(default)]
    pub allowed_headers: Option<Vec<String>>,

    #[schemars(description = "Functions the source may not call (C/C++)")]
    #[serde(default)]
    pub banned_functions: Vec<String>,

    #[schemars(description = "CPU time limit per run in milliseconds (default 1000)")]
    #[serde(default)]
    pub time_limit_ms: Option<u64>,

    #[schemars(description = "Memory limit per run in megabytes (default 256)")]
    #[serde(default)]
    pub memory_limit_mb: Option<u64>,

    #[schemars(description = "Compile time limit in milliseconds (default 10000)")]
    #[serde(default)]
    pub compile_time_limit_ms: Option<u64>,

    #[schemars(description = "Compile memory limit in megabytes (default 512)")]
    #[serde(default)]
    pub compile_memory_limit_mb: Option<u64>,
}

impl CompileRunParams {
    fn into_request(self) -> Result<CompileRunRequest, McpError> {
        let mut request = CompileRunRequest::new(self.language, self.source);
        if let Some(level) = self.optimization {
            request.optimization = level
                .parse()
                .map_err(|e: String| McpError::invalid_params(e, None))?;
        }
        if let Some(level) = self.warnings {
            request.warnings = level
                .parse()
                .map_err(|e: String| McpError::invalid_params(e, None))?;
        }
        request.inputs = self.inputs;
        request.expected_outputs = self.expected_outputs;
        request.allowed_headers = self.allowed_headers;
        request.banned_functions = self.banned_functions;

        let compile = StepLimits::compile_default();
        request.compile_limits = StepLimits {
            time_ms: self.compile_time_limit_ms.unwrap_or(compile.time_ms),
            memory_mb: self.compile_memory_limit_mb.unwrap_or(compile.memory_mb),
        };
        let run = StepLimits::run_default();
        request.run_limits = StepLimits {
            time_ms: self.time_limit_ms.unwrap_or(run.time_ms),
            memory_mb: self.memory_limit_mb.unwrap_or(run.memory_mb),
        };
        Ok(request)
    }
}

#[derive(Serialize)]
struct StatusReport {
    #[serde(flatten)]
    pool: PoolStatus,
    languages: Vec<String>,
}

fn to_json<T: Serialize>(value: &T) -> Result<String, McpError> {
    serde_json::to_string_pretty(value)
        .map_err(|e| McpError::internal_error(format!("Failed to serialize result: {e}"), None))
}

#[tool_router]
impl<B: IsolationBackend + 'static> SandboxServer<B> {
    /// Create a new sandbox server.
    pub fn new(judge: Judge<B>) -> Self {
        Self {
            judge: Arc::new(judge),
            tool_router: Self::tool_router(),
        }
    }

    fn sorted_languages(&self) -> Vec<String> {
        let mut languages: Vec<_> = self.judge.languages().keys().cloned().collect();
        languages.sort();
        languages
    }

    /// Compile a program and run it against every input.
    #[tool(
        description = "Compile a program in a sandbox and run it against each input. \
                       Returns a JSON report with a verdict (AC, WA, TLE, MLE, RE, IR, CE, IE), \
                       compiler output and per-input results."
    )]
    async fn compile_and_run(
        &self,
        Parameters(params): Parameters<CompileRunParams>,
    ) -> Result<CallToolResult, McpError> {
        let request = params.into_request()?;

        info!(
            language = %request.language,
            source_len = request.source.len(),
            inputs = request.inputs.len(),
            "Compile-and-run requested"
        );

        match self.judge.compile_and_run(&request).await {
            Ok(response) => Ok(CallToolResult::success(vec![Content::text(to_json(&response)?)])),
            Err(e @ JudgeError::UnknownLanguage(_)) => Err(McpError::invalid_params(
                format!("{e}. Available: {:?}", self.sorted_languages()),
                None,
            )),
            Err(e @ (JudgeError::InvalidRequest(_) | JudgeError::TooManyInputs { .. })) => {
                Err(McpError::invalid_params(e.to_string(), None))
            }
            Err(e) => {
                error!(error = %e, "Compile-and-run failed");
                Ok(CallToolResult::error(vec![Content::text(format!(
                    "Execution error: {e}"
                ))]))
            }
        }
    }

    /// Report pool occupancy and the configured languages.
    #[tool(description = "Show how many sandboxes are free and which languages are available")]
    async fn sandbox_status(&self) -> Result<CallToolResult, McpError> {
        let report = StatusReport {
            pool: self.judge.backend().status(),
            languages: self.sorted_languages(),
        };
        Ok(CallToolResult::success(vec![Content::text(to_json(&report)?)]))
    }
}

#[tool_handler]
impl<B: IsolationBackend + 'static> ServerHandler for SandboxServer<B> {
    fn get_info(&self) -> ServerInfo {
        let languages = self.sorted_languages();

        ServerInfo {
            protocol_version: rmcp::model::ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "sandbox-executor".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                title: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(format!(
                "Compile and run untrusted programs in pooled isolate sandboxes.\n\
                 Available languages: {languages:?}\n\
                 \n\
                 Use the 'compile_and_run' tool with:\n\
                 - language: one of {languages:?}\n\
                 - source: the program\n\
                 - inputs: stdin for each run"
            )),
        }
    }
}

/// Serve the judge over stdio.
pub async fn serve_stdio<B: IsolationBackend + 'static>(judge: Judge<B>) -> anyhow::Result<()> {
    let server = SandboxServer::new(judge);

    info!("Starting MCP server on stdio");

    let service = server
        .serve(stdio())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to start MCP server: {e}"))?;

    service
        .waiting()
        .await
        .map_err(|e| anyhow::anyhow!("MCP server error: {e}"))?;

    Ok(())
}
