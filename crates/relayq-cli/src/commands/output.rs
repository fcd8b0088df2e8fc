//! Terminal rendering shared by the commands

use console::{style, Emoji};
use relayq_core::AppError;
use relayq_jobs::{Job, JobStatus, QueueStats};

static DONE: Emoji<'_, '_> = Emoji("✅ ", "+ ");
static RETRY: Emoji<'_, '_> = Emoji("🔁 ", "~ ");
static FAILED: Emoji<'_, '_> = Emoji("❌ ", "x ");

pub fn print_stats(stats: &QueueStats) {
    println!("{}", style("Queue").bold());
    row("queued", stats.queued);
    row("processing", stats.processing);
    row("completed", stats.completed);
    row("failed", stats.failed);
    row("cancelled", stats.cancelled);
    row("total", stats.total);

    if let Some(avg) = stats.avg_processing_time_ms {
        println!("  {:<12} {}", "avg time", style(format!("{avg:.1} ms")).cyan());
    }
    if let Some(rate) = stats.success_rate {
        println!("  {:<12} {}", "success", style(format!("{:.1}%", rate * 100.0)).cyan());
    }
}

fn row(label: &str, value: u64) {
    println!("  {:<12} {}", label, style(value).cyan());
}

/// One line per settled job.
pub fn print_settled(job: &Job) {
    let (marker, detail) = match job.status {
        JobStatus::Completed => (DONE, style("completed".to_string()).green()),
        JobStatus::Queued => {
            let code = job.last_error.as_ref().map_or("", |e| e.code.as_str());
            (RETRY, style(format!("retrying after {code}")).yellow())
        }
        _ => {
            let code = job.error.as_ref().map_or("", |e| e.code.as_str());
            (FAILED, style(format!("failed with {code}")).red())
        }
    };
    println!(
        "{}{} {} {}",
        marker,
        style(&job.id).dim(),
        style(&job.job_type).bold(),
        detail
    );
}

pub fn print_rejection(err: &AppError) {
    let detail = err.detail.as_deref().unwrap_or(err.code.title());
    let mut line = format!("{} {}", style(err.code.as_str()).red().bold(), detail);
    if let Some(seconds) = err.retry_after {
        line.push_str(&format!(" (retry after {seconds}s)"));
    }
    eprintln!("{line}");
    for violation in &err.violations {
        eprintln!("  {} {}", style(&violation.field).yellow(), violation.message);
    }
    eprintln!("  {}", style(err.code.fix()).dim());
}
