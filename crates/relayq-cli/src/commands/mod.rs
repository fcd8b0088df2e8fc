//! CLI commands

mod demo;
mod enqueue;
mod output;
mod stats;
mod work;

pub use demo::{demo, DemoArgs};
pub use enqueue::{enqueue, EnqueueArgs};
pub use stats::{stats, StatsArgs};
pub use work::{work, WorkArgs};

use relayq_jobs::{Backend, QueueSettings};

/// Read `RELAYQ_*` settings, letting `--backend` take precedence.
pub fn load_settings(backend: Option<Backend>) -> anyhow::Result<QueueSettings> {
    let mut settings = QueueSettings::from_env()?;
    if let Some(backend) = backend {
        settings.backend = backend;
        settings.validate()?;
    }
    Ok(settings)
}
