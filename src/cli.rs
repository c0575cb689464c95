// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "otto",
    version,
    about = "Durable, crash-safe agentic workflow worker",
    long_about = "Hosts the harness and session workflows: a deterministic agentic loop \
                  with parallel tool execution, user approval, sub-agents and \
                  continue-as-new durability."
)]
pub struct Cli {
    /// Log filter (overridden by RUST_LOG when set).
    #[arg(long, global = true, default_value = "info")]
    pub log: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a worker and start the per-directory harness workflow.
    Worker(WorkerArgs),
}

#[derive(Debug, Args)]
pub struct WorkerArgs {
    /// Working directory sessions operate in.
    #[arg(long, default_value = ".")]
    pub cwd: String,

    /// Model provider id.  Only the bundled mock ships with this binary;
    /// real provider clients are linked in at build time.
    #[arg(long, default_value = "mock")]
    pub provider: String,

    /// Model name forwarded to the provider.
    #[arg(long, default_value = "mock-model")]
    pub model: String,

    /// Approval mode: never | unless_trusted | on_failure.
    #[arg(long, default_value = "never")]
    pub approval_mode: String,

    /// Workflow id of the harness (one per directory).
    #[arg(long, default_value = "harness-default")]
    pub harness_id: String,

    /// Route this worker's tool activities through a dedicated task queue.
    #[arg(long)]
    pub session_task_queue: Option<String>,
}
