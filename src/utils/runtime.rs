use anyhow::Result;

/// Monitors, connection handlers and the snapshot ticker are independent tasks, so the daemon runs
/// on the multi-threaded scheduler.
pub fn multi_thread_runtime() -> Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?)
}
