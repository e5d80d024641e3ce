use std::{io::Write, path::Path};

use anyhow::{bail, Result};
use clap::ValueEnum;
use tracing::info;

use crate::{
    config::{config_path, save_config, Config},
    daemon::{
        storage::{session_log::SessionLog, snapshot::SNAPSHOT_FILE_NAME},
        RECORDS_DIR,
    },
    protocol::Request,
};

use super::client::DaemonClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ResetTarget {
    /// Configuration, session history and the recovery snapshot.
    All,
    Config,
    /// Session history only.
    Logs,
}

pub async fn process_reset_command(target: ResetTarget, yes: bool, root: &Path) -> Result<()> {
    let client = DaemonClient::for_root(root);
    let running = client.is_running().await;
    if running && target != ResetTarget::Logs {
        bail!(
            "Daemon is running on {}. Stop it before resetting {target:?}",
            client.address()
        );
    }

    if !yes && !confirm(target)? {
        println!("Reset cancelled");
        return Ok(());
    }

    if matches!(target, ResetTarget::All | ResetTarget::Config) {
        save_config(root, &Config::default())?;
        info!("Reset configuration at {:?}", config_path(root));
        println!("Configuration has been reset to default values");
    }

    if matches!(target, ResetTarget::All | ResetTarget::Logs) {
        if running {
            client.call(&Request::ClearHistory).await?;
        } else {
            SessionLog::new(root.join(RECORDS_DIR))?
                .clear_history()
                .await?;
        }
        println!("Session history has been deleted");
    }

    if target == ResetTarget::All {
        match std::fs::remove_file(root.join(SNAPSHOT_FILE_NAME)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => Err(e)?,
        }
    }
    Ok(())
}

fn confirm(target: ResetTarget) -> Result<bool> {
    let target = format!("{target:?}").to_uppercase();
    print!("This will reset {target} data. Are you sure? [y/N]: ");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    if std::io::stdin().read_line(&mut answer)? == 0 {
        println!();
        return Ok(false);
    }
    Ok(answer.trim().eq_ignore_ascii_case("y"))
}
