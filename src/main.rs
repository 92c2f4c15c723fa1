//! build-codex CLI
//!
//! Builds the codex CLI in an ephemeral container and installs it under the
//! given target root.

use std::future::Future;
use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use codex_builder::request::{require_target, resolve_source_root, SOURCE_ROOT_ENV};
use codex_builder::{
    BuildRequest, ContainerSandbox, Error, Pipeline, PipelineConfig, Result, VerifyMode,
};

/// Reproducibly build the codex CLI in a pinned-toolchain container and
/// install it into a target tree.
#[derive(Parser, Debug)]
#[command(name = "build-codex", version, about, long_about = None)]
struct Cli {
    /// Target tree; the binary is installed at <TARGET_ROOT>/mooreCube/bin/codex/codex
    target_root: Option<PathBuf>,

    /// Source tree to build (default: parent of this program's directory)
    #[arg(long, value_name = "DIR", env = SOURCE_ROOT_ENV)]
    source_root: Option<PathBuf>,

    /// TOML file overriding the built-in pipeline configuration
    #[arg(long, value_name = "FILE", env = "CODEX_BUILDER_CONFIG")]
    config: Option<PathBuf>,

    /// Container engine CLI (docker, podman)
    #[arg(long, value_name = "BIN", env = "CODEX_BUILDER_ENGINE")]
    engine: Option<String>,

    /// Install without running the dependency constraint checks
    #[arg(long, conflicts_with = "verify_only")]
    skip_verify: bool,

    /// Only run the dependency constraint checks
    #[arg(long)]
    verify_only: bool,

    /// Print the verification report as JSON
    #[arg(long, requires = "verify_only")]
    json: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    if let Err(e) = run(cli).await {
        eprintln!("error: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    let target = require_target(cli.target_root.as_deref())?;
    let source_root = resolve_source_root(cli.source_root.as_deref())?;
    let request = BuildRequest::new(Some(target), &source_root)?;

    let mut config = PipelineConfig::load(cli.config.as_deref())?;
    if let Some(engine) = cli.engine {
        config.sandbox.engine = engine;
    }

    let verify_mode = if cli.skip_verify {
        VerifyMode::Skip
    } else {
        VerifyMode::from_config(&config)
    };

    let provider = ContainerSandbox::new(config.sandbox.engine.clone());
    let mut pipeline = Pipeline::new(provider, config).with_verify_mode(verify_mode);

    tracing::info!(
        source_root = ?request.source_root(),
        target_root = ?request.target_root(),
        "starting codex build"
    );

    if cli.verify_only {
        let report = interruptible(pipeline.verify_only(&request)).await?;
        if cli.json {
            let json = serde_json::to_string_pretty(&report)
                .map_err(|e| Error::Config(format!("failed to serialize report: {}", e)))?;
            println!("{}", json);
        } else {
            for check in &report.dependencies {
                println!("{}: {:?}", check.package, check.outcome);
            }
            println!(
                "{} token matches, {} outside documentation",
                report.tokens.len(),
                report.tokens.iter().filter(|m| !m.allowed).count()
            );
        }

        let violations = report.violations();
        if !violations.is_empty() {
            return Err(Error::ConstraintViolation(violations.join("; ")));
        }
        return Ok(());
    }

    let artifact = interruptible(pipeline.run(&request)).await?;
    println!(
        "installed {} to {}",
        pipeline.config().build.binary,
        artifact.installed_path.display()
    );
    Ok(())
}

/// Races `fut` against SIGINT and SIGTERM. On either signal the future is
/// dropped, which tears down any sandbox it holds.
async fn interruptible<T>(fut: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::select! {
        result = fut => result,
        err = shutdown_signal() => {
            tracing::warn!(signal = %err, "stopping, tearing down");
            Err(err)
        }
    }
}

/// Resolves with the error matching the first shutdown signal received.
#[cfg(unix)]
async fn shutdown_signal() -> Error {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => tokio::select! {
            _ = ctrl_c() => Error::Interrupted,
            _ = terminate.recv() => Error::Terminated,
        },
        Err(e) => {
            tracing::warn!(error = %e, "cannot listen for SIGTERM");
            ctrl_c().await;
            Error::Interrupted
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Error {
    ctrl_c().await;
    Error::Interrupted
}

/// Waits for Ctrl-C; never resolves if the handler cannot be installed.
async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "cannot listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}
