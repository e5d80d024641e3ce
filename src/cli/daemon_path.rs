use std::path::PathBuf;

pub const DAEMON_BINARY_NAME: &str = "trakd-daemon";

/// The daemon binary is installed next to the cli.
pub fn to_daemon_path(mut path: PathBuf) -> PathBuf {
    path.set_file_name(DAEMON_BINARY_NAME);
    #[cfg(windows)]
    {
        path.set_extension("exe");
    }
    path
}
