mod cli;
mod config;
mod error;
mod jenkins;
mod output;

use anyhow::Result;
use clap::Parser;
use cli::Cli;
use log::info;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    output::print_banner();

    let cli = Cli::parse();
    info!("Starting jenkins-runner");
    cli.execute().await?;

    Ok(())
}
