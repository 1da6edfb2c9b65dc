//! sandbox-executor
//!
//! Compiles and runs untrusted programs in a pool of isolate sandboxes,
//! either as an MCP server on stdio or once from the command line.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use sandbox_executor::config::Config;
use sandbox_executor::judge::{CompileRunRequest, Judge, JudgeConfig, OptimizationLevel, WarningLevel};
use sandbox_executor::mcp;
use sandbox_executor::pool::{PoolConfig, SandboxPool};

#[derive(Parser, Debug)]
#[command(name = "sandbox-executor")]
#[command(about = "Compile and run untrusted code in pooled isolate sandboxes")]
struct Args {
    /// Run in stdio mode (for MCP clients)
    #[arg(long)]
    stdio: bool,

    /// JSON configuration file (defaults to $SANDBOX_EXECUTOR_CONFIG)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Language of the source to judge once
    #[arg(long, requires = "source")]
    language: Option<String>,

    /// Source file to judge once
    #[arg(long, requires = "language")]
    source: Option<PathBuf>,

    /// Stdin for one run; repeat for several runs
    #[arg(long = "input")]
    inputs: Vec<String>,

    /// Optimization level (O0, O1, O2, O3, Os)
    #[arg(long, default_value = "O2")]
    optimization: OptimizationLevel,

    /// Warning level (none, default, all, extra, error)
    #[arg(long, default_value = "default")]
    warnings: WarningLevel,

    /// CPU time limit per run in milliseconds
    #[arg(long, default_value_t = 1000)]
    time_limit_ms: u64,

    /// Memory limit per run in megabytes
    #[arg(long, default_value_t = 256)]
    memory_limit_mb: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging (stderr so stdout is free for MCP protocol and JSON output)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    let languages = config.resolved_languages();

    info!(
        boxes = config.pool.box_count,
        languages = ?languages.keys().collect::<Vec<_>>(),
        "Loaded configuration"
    );

    let pool = SandboxPool::new(PoolConfig::from_section(&config.pool))
        .await
        .context("Failed to start sandbox pool")?;
    let pool = Arc::new(pool);
    let judge = Judge::new(
        Arc::clone(&pool),
        languages,
        JudgeConfig::from_section(&config.judge),
    );

    let outcome = if args.stdio {
        mcp::serve_stdio(judge).await
    } else if let (Some(language), Some(source)) = (&args.language, &args.source) {
        judge_once(&judge, &args, language, source).await
    } else {
        Err(anyhow::anyhow!(
            "Nothing to do: pass --stdio, or --language and --source"
        ))
    };

    pool.shutdown().await;
    outcome
}

async fn judge_once(
    judge: &Judge<SandboxPool>,
    args: &Args,
    language: &str,
    source: &Path,
) -> Result<()> {
    let code = tokio::fs::read_to_string(source)
        .await
        .with_context(|| format!("Failed to read source {}", source.display()))?;

    let mut request = CompileRunRequest::new(language, code).with_inputs(args.inputs.clone());
    request.optimization = args.optimization;
    request.warnings = args.warnings;
    request.run_limits.time_ms = args.time_limit_ms;
    request.run_limits.memory_mb = args.memory_limit_mb;

    let response = judge
        .compile_and_run(&request)
        .await
        .context("Compile-and-run failed")?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}
