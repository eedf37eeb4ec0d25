use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "rkws", version, about = "RK8s workspace manager")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the workspace manager with config file
    Start {
        #[arg(short, long)]
        config: PathBuf,
    },
}
