use std::{net::IpAddr, path::Path};

use anyhow::{bail, Result};
use clap::Subcommand;

use crate::config::{clamp_limit, load_config, save_config};

use super::{client::DaemonClient, output::print_config};

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    #[command(about = "Change settings. The daemon has to be stopped")]
    Set {
        #[arg(short, long, help = "Address the daemon listens on")]
        ip: Option<IpAddr>,
        #[arg(short, long, help = "Port the daemon listens on")]
        port: Option<u16>,
        #[arg(short, long, help = "How many processes can be tracked at the same time (1-24)")]
        limit: Option<usize>,
    },
    #[command(about = "Show current settings")]
    Show,
}

pub async fn process_config_command(command: ConfigCommand, root: &Path) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            print_config(&load_config(root));
            Ok(())
        }
        ConfigCommand::Set { ip, port, limit } => {
            if ip.is_none() && port.is_none() && limit.is_none() {
                bail!("Nothing to change. Pass at least one of --ip, --port or --limit");
            }
            let client = DaemonClient::for_root(root);
            if client.is_running().await {
                bail!(
                    "Daemon is running on {}. Stop it before changing the configuration",
                    client.address()
                );
            }

            let mut config = load_config(root);
            if let Some(ip) = ip {
                config.bind_ip = ip;
            }
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(limit) = limit {
                let clamped = clamp_limit(limit);
                if clamped != limit {
                    eprintln!("Limit {limit} is out of range, using {clamped}");
                }
                config.max_tracked_processes = clamped;
            }
            save_config(root, &config)?;
            print_config(&config);
            Ok(())
        }
    }
}
