use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "dbsupd", version, about = "Database supervisor daemon CLI")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start supervising the database engine
    Start {
        /// Environment file loaded before reading configuration
        #[arg(short, long)]
        env_file: Option<PathBuf>,
    },
}
