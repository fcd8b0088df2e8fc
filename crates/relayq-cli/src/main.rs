//! relayq command-line tool

mod cli;
mod commands;

use clap::Parser;
use cli::Cli;
use relayq_extras::{load_dotenv, Environment, StructuredLoggingConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();
    StructuredLoggingConfig::for_environment(&Environment::current()).init()?;

    Cli::parse().execute().await
}
