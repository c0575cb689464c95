// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod cli;

use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use otto_config::{ApprovalMode, ModelSettings, SessionConfig};
use otto_core::{core_worker_builder, HarnessInput, HARNESS_WORKFLOW};
use otto_model::{ModelProvider, ScriptedProvider};

use cli::{Cli, Command, WorkerArgs};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Command::Worker(args) => run_worker(args).await,
    }
}

async fn run_worker(args: WorkerArgs) -> anyhow::Result<()> {
    let provider: Arc<dyn ModelProvider> = match args.provider.as_str() {
        // The bundled provider echoes input; real clients (HTTP-backed)
        // register themselves here when linked into the build.
        "mock" => Arc::new(ScriptedProvider::new(Vec::new())),
        other => bail!("provider {other:?} requires an external provider client in this build"),
    };

    let approval_mode: ApprovalMode = args
        .approval_mode
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;
    let cwd = std::fs::canonicalize(&args.cwd)
        .with_context(|| format!("invalid cwd: {}", args.cwd))?
        .to_string_lossy()
        .to_string();

    let config = SessionConfig {
        model: ModelSettings {
            provider: args.provider.clone(),
            name: args.model.clone(),
            ..ModelSettings::default()
        },
        approval_mode,
        cwd,
        session_task_queue: args.session_task_queue.clone(),
        ..SessionConfig::default()
    };

    let worker = core_worker_builder(provider)
        .start()
        .context("failed to start worker")?;
    let harness = worker
        .start_workflow(
            HARNESS_WORKFLOW,
            &args.harness_id,
            serde_json::to_value(HarnessInput::Start { config })?,
        )
        .await
        .map_err(|e| anyhow::anyhow!("failed to start harness: {e}"))?;
    info!(
        harness = harness.workflow_id(),
        version = worker.version(),
        "worker running; press ctrl-c to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutting down");
    drop(worker);
    Ok(())
}
