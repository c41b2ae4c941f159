use anyhow::Context;
use clap::Parser;
use log::info;

use common::Settings;
use dbsupd::cli::{Cli, Commands};
use dbsupd::supervisor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Start { env_file } => {
            match env_file {
                Some(path) => {
                    dotenvy::from_path(path)
                        .with_context(|| format!("loading env file {}", path.display()))?;
                }
                None => {
                    dotenvy::dotenv().ok();
                }
            }
            let settings = Settings::from_env()?;
            info!(
                "supervising {} with data directory {}",
                settings.engine,
                settings.data_dir.display()
            );
            supervisor::run(settings).await?;
        }
    }

    Ok(())
}
