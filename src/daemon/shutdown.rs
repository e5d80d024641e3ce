use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Resolves once the daemon has to stop: on ctrl-c, on SIGTERM where it exists, or when
/// something else cancels `cancelation` (a `stop` request or a dead listener).
pub async fn detect_shutdown(cancelation: CancellationToken) {
    select! {
        result = tokio::signal::ctrl_c() => {
            match result {
                Ok(()) => info!("Received ctrl-c, shutting down"),
                Err(e) => warn!("Failed to listen for ctrl-c {e}, shutting down"),
            }
            cancelation.cancel();
        },
        _ = terminate() => {
            info!("Received SIGTERM, shutting down");
            cancelation.cancel();
        },
        _ = cancelation.cancelled() => {},
    };
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(e) => {
            warn!("Failed to listen for SIGTERM {e}");
            std::future::pending::<()>().await;
        }
    }
}

/// Detached processes on Windows don't receive signals, `trakd stop` is the way to end them.
#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
