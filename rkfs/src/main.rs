use anyhow::Context;
use clap::Parser;
use log::info;
use rkfs::cli::{Cli, Commands};
use rkfs::config::load_config;
use rkfs::daemon::Master;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Start { config } => {
            let cfg = load_config(config)?;
            info!("[rkfs] listening on {}", cfg.addr);
            Master::open(cfg)?.run().await?;
        }
        Commands::AddSlave {
            config,
            name,
            masks,
        } => {
            let master = Master::open(load_config(config)?)?;
            let slave = master
                .manager()
                .new_slave(name)
                .with_context(|| format!("Failed to add slave {name}"))?;
            for mask in masks {
                slave.add_mask(mask)?;
            }
            slave.commit_now()?;
            println!("Added slave {name} with masks {:?}", slave.masks());
        }
        Commands::DelSlave { config, name } => {
            let master = Master::open(load_config(config)?)?;
            master
                .manager()
                .del_slave(name)
                .with_context(|| format!("Failed to delete slave {name}"))?;
            let written = master.vfs().commits().flush_pending();
            println!("Deleted slave {name} ({written} records updated)");
        }
    }

    Ok(())
}
