use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use config::TrainerConfig;

mod bounded;
mod config;
mod training;

fn main() -> Result<()> {
    configure_logging()?;
    let config = TrainerConfig::parse();

    training::setup_and_train_translator(config)?;
    Ok(())
}

fn configure_logging() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .compact()
        .with_target(false)
        .with_env_filter(filter)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}
