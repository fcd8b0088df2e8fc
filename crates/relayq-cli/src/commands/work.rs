//! Long-running worker pool

use anyhow::Result;
use clap::Args;
use console::style;
use relayq_jobs::{QueueHandle, QueueSettings, Reaper, SimulatedProcessor, Worker, WorkerConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::output::print_stats;

/// Knobs for the built-in simulated processor
#[derive(Args, Debug, Clone)]
pub struct SimulationArgs {
    /// Probability that a job fails midway
    #[arg(long, default_value = "0.0")]
    pub failure_rate: f64,

    /// Progress steps per job
    #[arg(long, default_value = "4")]
    pub steps: u8,

    /// Milliseconds spent on each step
    #[arg(long, default_value = "250")]
    pub step_ms: u64,

    /// Seed for failure selection; each worker offsets it by its index
    #[arg(long, default_value = "42")]
    pub seed: u64,
}

impl SimulationArgs {
    pub fn processor(&self, index: usize) -> SimulatedProcessor {
        SimulatedProcessor::new(self.seed.wrapping_add(index as u64))
            .with_failure_rate(self.failure_rate)
            .with_steps(self.steps, Duration::from_millis(self.step_ms))
    }
}

/// Arguments for the `work` command
#[derive(Args, Debug)]
pub struct WorkArgs {
    /// Number of concurrent workers
    #[arg(short, long, default_value = "1")]
    pub workers: usize,

    /// Only take jobs of these types
    #[arg(short, long, value_delimiter = ',')]
    pub types: Option<Vec<String>>,

    /// Milliseconds to wait when the queue has nothing ready
    #[arg(long, default_value = "1000")]
    pub poll_ms: u64,

    #[command(flatten)]
    pub simulation: SimulationArgs,
}

/// Build a worker config with an id derived from `index`.
pub fn worker_config(
    settings: &QueueSettings,
    index: usize,
    types: Option<&[String]>,
    poll: Duration,
) -> WorkerConfig {
    let mut config = WorkerConfig::new(format!("worker-{}-{index}", std::process::id()))
        .poll_interval(poll)
        .for_visibility_timeout(settings.visibility_timeout());
    if let Some(types) = types {
        config = config.types(types.iter().cloned());
    }
    config
}

/// Run workers until Ctrl-C
pub async fn work(settings: QueueSettings, args: WorkArgs) -> Result<()> {
    let queue = QueueHandle::from_settings(&settings).await?;
    let cancel = CancellationToken::new();
    let reaper = Reaper::from_settings(queue.clone(), &settings).spawn(cancel.clone());

    let mut workers = JoinSet::new();
    for index in 0..args.workers.max(1) {
        let config = worker_config(
            &settings,
            index,
            args.types.as_deref(),
            Duration::from_millis(args.poll_ms),
        );
        let worker = Worker::new(
            queue.clone(),
            Arc::new(args.simulation.processor(index)),
            config,
        );
        let cancel = cancel.clone();
        workers.spawn(async move { worker.run(cancel).await });
    }

    println!(
        "{} {} worker(s) on the {} backend. Press Ctrl-C to stop.",
        style("Running").green().bold(),
        args.workers.max(1),
        style(queue.backend()).cyan()
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("interrupt received; stopping workers");
    println!("{}", style("Shutting down...").yellow());
    cancel.cancel();
    while let Some(joined) = workers.join_next().await {
        joined?;
    }
    reaper.await?;

    println!();
    print_stats(&queue.get_stats().await?);
    Ok(())
}
