use std::{
    env,
    path::Path,
    process::{Command, Stdio},
    time::Duration,
};

use anyhow::{bail, Context, Result};
use tracing::info;

use crate::utils::logging::log_dir;

use super::{client::DaemonClient, daemon_path::to_daemon_path};

const STARTUP_ATTEMPTS: u32 = 30;
const STARTUP_POLL: Duration = Duration::from_millis(100);

/// Launches the daemon binary for `root` and waits until it answers. The daemon detaches on its
/// own on unix. Elsewhere it is started as a detached process running in the foreground.
pub async fn spawn_daemon(root: &Path) -> Result<()> {
    let client = DaemonClient::for_root(root);
    if client.is_running().await {
        println!("Daemon is already running on {}", client.address());
        return Ok(());
    }

    let daemon = to_daemon_path(env::current_exe().context("Can't locate the cli executable")?);
    let mut command = Command::new(&daemon);
    command.arg("--dir").arg(root);
    command.stdin(Stdio::null());
    command.stdout(Stdio::null());
    command.stderr(Stdio::null());

    #[cfg(unix)]
    {
        let status = command
            .status()
            .with_context(|| format!("Failed to launch {daemon:?}"))?;
        if !status.success() {
            bail!("{daemon:?} exited with {status}");
        }
    }
    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        const DETACHED_PROCESS: u32 = 0x0000_0008;

        command.arg("--force");
        command.creation_flags(DETACHED_PROCESS);
        let _daemon = command
            .spawn()
            .with_context(|| format!("Failed to launch {daemon:?}"))?;
    }

    for _ in 0..STARTUP_ATTEMPTS {
        if client.is_running().await {
            info!("Daemon started on {}", client.address());
            println!("Daemon is running on {}", client.address());
            return Ok(());
        }
        tokio::time::sleep(STARTUP_POLL).await;
    }
    bail!(
        "Daemon didn't answer on {} after starting. Check the logs in {:?}",
        client.address(),
        log_dir(root)
    )
}
