use std::{env, io, path::PathBuf};

use anyhow::Result;

pub const APPLICATION_DIR_NAME: &str = "trakd";

/// Per-user storage root. Holds the config, the session records, the recovery snapshot and logs.
pub fn create_application_default_path() -> Result<PathBuf> {
    let path = {
        cfg_if::cfg_if! {
            if #[cfg(windows)] {
                let mut path = PathBuf::from(
                    env::var("APPDATA").map_err(|_| anyhow::anyhow!("APPDATA is not set"))?,
                );
                path.push(APPLICATION_DIR_NAME);
                path
            } else {
                let mut path = env::var("XDG_STATE_HOME")
                    .map(PathBuf::from)
                    .or_else(|_| {
                        env::var("HOME").map(|home| {
                            let mut path = PathBuf::from(home);
                            path.push(".local/state");
                            path
                        })
                    })
                    .map_err(|_| anyhow::anyhow!("Couldn't find neither XDG_STATE_HOME nor HOME"))?;
                path.push(APPLICATION_DIR_NAME);
                path
            }
        }
    };

    ensure_dir(path)
}

/// Resolves an explicit `--dir` or falls back to the default storage root.
pub fn application_path(dir: Option<PathBuf>) -> Result<PathBuf> {
    match dir {
        Some(dir) => ensure_dir(dir),
        None => create_application_default_path(),
    }
}

fn ensure_dir(path: PathBuf) -> Result<PathBuf> {
    match std::fs::create_dir_all(&path) {
        Ok(_) => Ok(path),
        Err(v) if v.kind() == io::ErrorKind::AlreadyExists => Ok(path),
        Err(v) => Err(v.into()),
    }
}
