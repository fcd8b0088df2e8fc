//! CLI argument parsing

use crate::commands::{self, DemoArgs, EnqueueArgs, StatsArgs, WorkArgs};
use clap::{Parser, Subcommand};
use relayq_jobs::Backend;

/// relayq - durable job queue tooling
#[derive(Parser, Debug)]
#[command(name = "relayq")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Backend to use instead of RELAYQ_BACKEND (in-process, durable, test-double)
    #[arg(long, global = true)]
    backend: Option<Backend>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run workers and the maintenance reaper until interrupted
    Work(WorkArgs),

    /// Submit one or more jobs
    Enqueue(EnqueueArgs),

    /// Show queue counts and metrics
    Stats(StatsArgs),

    /// Enqueue a batch of simulated jobs and drain it with local workers
    Demo(DemoArgs),
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> anyhow::Result<()> {
        let settings = commands::load_settings(self.backend)?;
        match self.command {
            Commands::Work(args) => commands::work(settings, args).await,
            Commands::Enqueue(args) => commands::enqueue(settings, args).await,
            Commands::Stats(args) => commands::stats(settings, args).await,
            Commands::Demo(args) => commands::demo(settings, args).await,
        }
    }
}
