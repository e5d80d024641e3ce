use std::{env::args, path::PathBuf};

use anyhow::Result;
use clap::Parser;
use trakd::{
    daemon::{args::DaemonArgs, start_daemon},
    utils::{
        dir::application_path,
        logging::{enable_logging, DAEMON_PREFIX},
        runtime::multi_thread_runtime,
    },
};

fn main() -> Result<()> {
    run_service(args().collect::<Vec<_>>())
}

fn run_service(command_args: Vec<String>) -> Result<()> {
    let args = DaemonArgs::parse_from(&command_args);
    // Detaching moves the working directory to `/`, relative roots have to be resolved first.
    let app_dir = std::path::absolute(application_path(args.dir.clone())?)?;

    if !args.force {
        #[cfg(unix)]
        {
            use daemonize::Daemonize;

            let daemonize = Daemonize::new()
                .stdout(daemonize::Stdio::devnull())
                .stderr(daemonize::Stdio::devnull())
                .execute();
            match daemonize {
                daemonize::Outcome::Parent(parent) => {
                    parent.inspect_err(|e| eprintln!("Failed to create daemon {e:?}"))?;
                    println!("Created daemon");
                    return Ok(());
                }
                daemonize::Outcome::Child(child) => {
                    child?;
                }
            }
        }
    }

    run(app_dir, args)
}

fn run(app_dir: PathBuf, args: DaemonArgs) -> Result<()> {
    enable_logging(DAEMON_PREFIX, &app_dir, args.log, args.log_console)?;
    multi_thread_runtime()?.block_on(async move { start_daemon(app_dir).await })?;
    Ok(())
}
