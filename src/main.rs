use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use gridbot::app::App;
use gridbot::config::{AccountsConfig, Settings};
use tokio::signal;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "gridbot", about = "Event-driven perpetual futures grid trading bot")]
struct Args {
    /// Directory holding pm_config.json and strategies/
    #[arg(long)]
    config_dir: Option<PathBuf>,

    /// SQLite database path
    #[arg(long)]
    database: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let args = Args::parse();

    let mut settings = Settings::from_env().context("failed to load settings")?;
    if let Some(dir) = args.config_dir {
        settings.config_dir = dir;
    }
    if let Some(database) = args.database {
        settings.database_url = database;
    }

    settings.init_logging();
    info!("gridbot starting");

    let accounts = AccountsConfig::load(&settings.accounts_path())
        .context("failed to load account configuration")?;
    let app = App::build(&settings).context("failed to assemble runtime")?;

    app.start(&accounts);

    match signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => error!(error = %e, "failed to listen for shutdown signal"),
    }

    app.shutdown().await;
    info!("gridbot stopped");
    Ok(())
}
