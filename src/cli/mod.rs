pub mod client;
pub mod config;
pub mod daemon_path;
pub mod output;
pub mod process;
pub mod report;
pub mod reset;

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use client::DaemonClient;
use config::{process_config_command, ConfigCommand};
use output::{format_duration, print_entries, print_processes, print_status, print_stopped_status};
use process::spawn_daemon;
use report::{process_report_command, ReportCommand};
use reset::{process_reset_command, ResetTarget};
use tracing::level_filters::LevelFilter;

use crate::{
    daemon::start_daemon,
    process_api::{system::SystemInspector, ProcessInspector},
    protocol::{ErrorCode, Request, Response},
    utils::{
        dir::application_path,
        logging::{enable_logging, CLI_PREFIX, DAEMON_PREFIX},
    },
};

#[derive(Parser, Debug)]
#[command(name = "trakd", version, long_about = None)]
#[command(about = "Track how long selected processes run", long_about = None)]
struct Args {
    #[command(subcommand)]
    commands: Commands,
    #[arg(
        long,
        global = true,
        help = "Application directory. By default tries to save into $XDG_STATE_HOME or $HOME/.local/state"
    )]
    dir: Option<PathBuf>,
    #[arg(long, global = true, help = "Enable logging")]
    log: bool,
}

#[derive(Subcommand, Debug)]
#[command(version, about, long_about = None)]
enum Commands {
    #[command(about = "Starts a daemon for the application")]
    Start,
    #[command(
        about = "Run a daemon directly in current console. Used for debugging"
    )]
    Serve,
    #[command(about = "Stop currently running daemon")]
    Stop {
        #[arg(short, long, help = "Stop even if processes are still tracked")]
        force: bool,
    },
    #[command(about = "Show daemon status")]
    Status,
    #[command(about = "Start tracking a process by name or pid")]
    Add {
        process: String,
        #[arg(short = 'n', long = "name", help = "Track id, generated when omitted")]
        id: Option<String>,
        #[arg(short, long, help = "Wait here until the process exits")]
        foreground: bool,
    },
    #[command(about = "Stop tracking a process")]
    Rm { id: String },
    #[command(about = "Give a tracked process another id")]
    Rename { id: String, new_id: String },
    #[command(about = "List tracked processes")]
    Ps {
        #[arg(short, long, help = "Include stopped processes")]
        all: bool,
        #[arg(short, long, help = "Show pid, stop time, mode and connection")]
        detailed: bool,
    },
    #[command(about = "List processes running on this machine")]
    Ls,
    #[command(about = "Total runtime and active days per process")]
    Report {
        #[command(flatten)]
        command: ReportCommand,
    },
    #[command(about = "Show or change the daemon configuration")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    #[command(about = "Reset configuration and/or session history")]
    Reset {
        target: ResetTarget,
        #[arg(short, long, help = "Don't ask for confirmation")]
        yes: bool,
    },
}

pub async fn run_cli() -> Result<()> {
    let args = Args::parse();
    let root = application_path(args.dir)?;

    let logging_level = if args.log {
        Some(LevelFilter::TRACE)
    } else {
        None
    };
    let prefix = match args.commands {
        Commands::Serve => DAEMON_PREFIX,
        _ => CLI_PREFIX,
    };
    enable_logging(prefix, &root, logging_level, args.log)?;

    match args.commands {
        Commands::Start => spawn_daemon(&root).await,
        Commands::Serve => start_daemon(root).await,
        Commands::Stop { force } => stop(&root, force).await,
        Commands::Status => status(&root).await,
        Commands::Add {
            process,
            id,
            foreground,
        } => add(&root, process, id, foreground).await,
        Commands::Rm { id } => {
            let client = DaemonClient::for_root(&root);
            if let Response::Finished { entry } = client.call(&Request::Rm { id }).await? {
                println!(
                    "Stopped tracking {} ({}) after {}",
                    entry.id,
                    entry.process_name,
                    format_duration(entry.runtime)
                );
            }
            Ok(())
        }
        Commands::Rename { id, new_id } => {
            let client = DaemonClient::for_root(&root);
            client
                .call(&Request::Rename {
                    id: id.clone(),
                    new_id: new_id.clone(),
                })
                .await?;
            println!("Renamed {id} to {new_id}");
            Ok(())
        }
        Commands::Ps { all, detailed } => {
            let client = DaemonClient::for_root(&root);
            match client.call(&Request::Ps { all }).await? {
                Response::Entries { entries } => print_entries(&entries, detailed),
                other => bail!("Unexpected response {other:?}"),
            }
            Ok(())
        }
        Commands::Ls => {
            print_processes(&SystemInspector::new().list());
            Ok(())
        }
        Commands::Report { command } => process_report_command(command, &root).await,
        Commands::Config { command } => process_config_command(command, &root).await,
        Commands::Reset { target, yes } => process_reset_command(target, yes, &root).await,
    }
}

async fn add(root: &Path, process: String, id: Option<String>, foreground: bool) -> Result<()> {
    let client = DaemonClient::for_root(root);
    let request = Request::Add {
        target: process,
        id,
        foreground,
    };

    if !foreground {
        if let Response::Tracking { entry } = client.call(&request).await? {
            println!(
                "Tracking {} ({}) as {}",
                entry.process_name,
                entry.pid.map_or_else(String::new, |pid| format!("pid {pid}")),
                entry.id
            );
        }
        return Ok(());
    }

    client
        .stream(&request, |response| {
            match response {
                Response::Tracking { entry } => println!(
                    "Tracking {} as {}. Waiting for it to exit, ctrl-c stops tracking",
                    entry.process_name, entry.id
                ),
                Response::Finished { entry } => println!(
                    "{} ({}) stopped after {}",
                    entry.id,
                    entry.process_name,
                    format_duration(entry.runtime)
                ),
                Response::Error { message, .. } => bail!(message),
                other => bail!("Unexpected response {other:?}"),
            }
            Ok(())
        })
        .await
}

async fn stop(root: &Path, force: bool) -> Result<()> {
    let client = DaemonClient::for_root(root);
    if !client.is_running().await {
        println!("Daemon is not running");
        return Ok(());
    }
    match client.request(&Request::Stop { force }).await? {
        Response::Ok => {
            println!("Daemon stopped");
            Ok(())
        }
        Response::Error {
            code: ErrorCode::Busy,
            message,
        } => bail!("{message}. Use `trakd stop -f` to stop them as well"),
        Response::Error { message, .. } => bail!(message),
        other => bail!("Unexpected response {other:?}"),
    }
}

async fn status(root: &Path) -> Result<()> {
    let client = DaemonClient::for_root(root);
    if !client.is_running().await {
        print_stopped_status(&client.address().to_string());
        return Ok(());
    }
    match client.call(&Request::Status).await? {
        Response::Status(status) => print_status(&status),
        other => bail!("Unexpected response {other:?}"),
    }
    Ok(())
}
