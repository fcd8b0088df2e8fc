//! Queue inspection

use anyhow::Result;
use clap::Args;
use console::style;
use relayq_jobs::{QueueHandle, QueueSettings};

use super::output::print_stats;

/// Arguments for the `stats` command
#[derive(Args, Debug)]
pub struct StatsArgs {
    /// Print the raw JSON instead of a table
    #[arg(long)]
    pub json: bool,

    /// Also list the jobs submitted under this request id
    #[arg(long)]
    pub request_id: Option<String>,
}

/// Print queue counts
pub async fn stats(settings: QueueSettings, args: StatsArgs) -> Result<()> {
    let queue = QueueHandle::from_settings(&settings).await?;
    let stats = queue.get_stats().await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        print_stats(&stats);
    }

    if let Some(request_id) = &args.request_id {
        let jobs = queue.get_request_jobs(request_id).await?;
        if args.json {
            println!("{}", serde_json::to_string_pretty(&jobs)?);
            return Ok(());
        }
        println!();
        println!(
            "{} {} ({} job(s))",
            style("Request").bold(),
            style(request_id).cyan(),
            jobs.len()
        );
        for job in &jobs {
            println!(
                "  {} {:<10} {:<8} {:>3}%  attempt {}/{}",
                style(&job.id).dim(),
                job.job_type,
                job.status.as_str(),
                job.progress,
                job.attempts,
                job.max_attempts
            );
        }
    }
    Ok(())
}
