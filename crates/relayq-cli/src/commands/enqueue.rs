//! Job submission

use anyhow::{anyhow, Result};
use clap::Args;
use console::style;
use relayq_jobs::{
    Backend, BackoffStrategy, EnqueueRequest, JobPriority, QueueHandle, QueueSettings, RetryPolicy,
};
use serde_json::Value;
use std::time::Duration;

use super::output::print_rejection;

/// Arguments for the `enqueue` command
#[derive(Args, Debug)]
pub struct EnqueueArgs {
    /// Job type, e.g. `preview`
    pub job_type: String,

    /// low, normal, high or urgent
    #[arg(short, long, default_value = "normal")]
    pub priority: JobPriority,

    /// Payload field as KEY=VALUE; VALUE is parsed as JSON when it can be
    #[arg(short, long = "field", value_parser = parse_field)]
    pub fields: Vec<(String, Value)>,

    /// Group the job under a request for per-request quotas and lookup
    #[arg(long)]
    pub request_id: Option<String>,

    /// Reuse the active job submitted with the same key
    #[arg(long)]
    pub idempotency_key: Option<String>,

    /// Attach a retry policy allowing this many attempts
    #[arg(long)]
    pub max_attempts: Option<u32>,

    /// Backoff for the retry policy: fixed, linear or exponential
    #[arg(long, default_value = "exponential")]
    pub backoff: String,

    /// Initial retry delay in milliseconds
    #[arg(long, default_value = "1000")]
    pub retry_delay_ms: u64,

    /// Submit this many copies
    #[arg(short = 'n', long, default_value = "1")]
    pub count: usize,
}

fn parse_field(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))?;
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn backoff(name: &str) -> Result<BackoffStrategy> {
    match name.to_ascii_lowercase().as_str() {
        "fixed" => Ok(BackoffStrategy::Fixed),
        "linear" => Ok(BackoffStrategy::Linear),
        "exponential" => Ok(BackoffStrategy::Exponential),
        other => Err(anyhow!("unknown backoff '{other}'")),
    }
}

impl EnqueueArgs {
    fn request(&self) -> Result<EnqueueRequest> {
        let mut request = EnqueueRequest::new(&self.job_type).priority(self.priority);
        for (key, value) in &self.fields {
            request = request.field(key.clone(), value.clone());
        }
        if let Some(request_id) = &self.request_id {
            request = request.request_id(request_id);
        }
        if let Some(key) = &self.idempotency_key {
            request = request.idempotency_key(key);
        }
        if let Some(max_attempts) = self.max_attempts {
            let policy = RetryPolicy::new(max_attempts)
                .strategy(backoff(&self.backoff)?)
                .initial_delay(Duration::from_millis(self.retry_delay_ms));
            request = request.retry_policy(policy);
        }
        Ok(request)
    }
}

/// Submit jobs and print each accepted job as JSON
pub async fn enqueue(settings: QueueSettings, args: EnqueueArgs) -> Result<()> {
    let queue = QueueHandle::from_settings(&settings).await?;
    if queue.backend() != Backend::Durable {
        eprintln!(
            "{}",
            style("Note: this backend lives in this process; jobs vanish when it exits.").yellow()
        );
    }

    let request = args.request()?;
    let mut accepted = 0;
    for _ in 0..args.count.max(1) {
        match queue.enqueue(request.clone()).await {
            Ok(job) => {
                accepted += 1;
                println!("{}", serde_json::to_string_pretty(&job)?);
            }
            Err(err) => {
                print_rejection(&err);
                anyhow::bail!("{accepted} of {} job(s) accepted", args.count.max(1));
            }
        }
    }
    Ok(())
}
