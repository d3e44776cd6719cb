use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "debridfs", version, about = "debridfs daemon CLI")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the debridfs daemon with config file
    Start {
        #[arg(short, long)]
        config: PathBuf,
    },
}
