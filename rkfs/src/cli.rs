use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "rkfs", version, about = "rkfs master daemon CLI")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the master with config file
    Start {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Register a slave and the host masks it may connect from
    AddSlave {
        #[arg(short, long)]
        config: PathBuf,
        name: String,
        /// e.g. `*@10.0.0.0/8` or `*@slave?.example.org`
        masks: Vec<String>,
    },
    /// Forget a slave and every file it holds
    DelSlave {
        #[arg(short, long)]
        config: PathBuf,
        name: String,
    },
}
