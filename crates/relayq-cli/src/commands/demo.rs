//! End-to-end walkthrough against the configured backend

use anyhow::Result;
use clap::Args;
use console::style;
use relayq_core::generate_trace_id;
use relayq_jobs::{
    BackoffStrategy, EnqueueRequest, JobPriority, Outcome, QueueHandle, QueueSettings, Reaper,
    RetryPolicy, Worker,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::output::{print_rejection, print_settled, print_stats};
use super::work::{worker_config, SimulationArgs};

/// Arguments for the `demo` command
#[derive(Args, Debug)]
pub struct DemoArgs {
    /// Jobs to submit
    #[arg(short = 'n', long, default_value = "20")]
    pub jobs: usize,

    /// Concurrent workers
    #[arg(short, long, default_value = "4")]
    pub workers: usize,

    /// Give up waiting for the queue to drain after this many seconds
    #[arg(long, default_value = "30")]
    pub timeout_secs: u64,

    /// Print Prometheus metrics at the end
    #[arg(long)]
    pub metrics: bool,

    #[command(flatten)]
    pub simulation: SimulationArgs,
}

const POLL: Duration = Duration::from_millis(50);

/// Submit a batch, drain it, and report what happened
pub async fn demo(settings: QueueSettings, args: DemoArgs) -> Result<()> {
    let queue = QueueHandle::from_settings(&settings).await?;
    let batch = generate_trace_id();
    println!(
        "{} {} job(s) as batch {} on the {} backend",
        style("Submitting").bold(),
        args.jobs,
        style(&batch).dim(),
        style(queue.backend()).cyan()
    );

    let retry = RetryPolicy::new(3)
        .strategy(BackoffStrategy::Exponential)
        .initial_delay(Duration::from_millis(200));
    let mut rejected = 0;
    for index in 0..args.jobs {
        let priority = JobPriority::ALL[index % JobPriority::ALL.len()];
        let request = EnqueueRequest::new("preview")
            .priority(priority)
            .field("index", index)
            .metadata("batch", batch.as_str())
            .retry_policy(retry.clone());
        if let Err(err) = queue.enqueue(request).await {
            rejected += 1;
            print_rejection(&err);
        }
    }

    let cancel = CancellationToken::new();
    let reaper = Reaper::from_settings(queue.clone(), &settings).spawn(cancel.clone());
    let mut workers = JoinSet::new();
    for index in 0..args.workers.max(1) {
        let worker = Worker::new(
            queue.clone(),
            Arc::new(args.simulation.processor(index)),
            worker_config(&settings, index, None, POLL),
        );
        workers.spawn(drive(worker, cancel.clone()));
    }

    let drained = wait_for_drain(&queue, Duration::from_secs(args.timeout_secs)).await?;
    cancel.cancel();
    while let Some(joined) = workers.join_next().await {
        joined?;
    }
    reaper.await?;

    println!();
    if !drained {
        println!(
            "{}",
            style("Timed out; some jobs are still waiting on retry backoff.").yellow()
        );
    }
    if rejected > 0 {
        println!("{} submission(s) rejected", style(rejected).red());
    }
    print_stats(&queue.get_stats().await?);

    if args.metrics {
        println!();
        print!("{}", queue.metrics().render());
    }
    Ok(())
}

async fn drive(worker: Worker, cancel: CancellationToken) {
    loop {
        let outcome = tokio::select! {
            _ = cancel.cancelled() => break,
            outcome = worker.run_once() => outcome,
        };
        let pause = match outcome {
            Ok(Outcome::Idle) => true,
            Ok(Outcome::Completed(job) | Outcome::Retrying(job) | Outcome::Failed(job)) => {
                print_settled(&job);
                false
            }
            Ok(Outcome::Abandoned { job_id }) => {
                println!("{} lease lost", style(job_id).dim());
                false
            }
            Err(err) => {
                print_rejection(&err);
                true
            }
        };
        if pause {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(POLL) => {}
            }
        }
    }
}

/// `true` once nothing is queued or processing.
async fn wait_for_drain(queue: &QueueHandle, timeout: Duration) -> Result<bool> {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        let stats = queue.get_stats().await?;
        if stats.queued == 0 && stats.processing == 0 {
            return Ok(true);
        }
        tokio::time::sleep(POLL * 2).await;
    }
    Ok(false)
}
