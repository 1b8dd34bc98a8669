use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(e) => {
            warn!("Can't listen for SIGTERM {e:?}");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}

/// Cancels the session when the process is asked to stop, or when something else cancels it
/// first.
///
/// On Windows detached processes can't receive these signals, there `stop` kills the process.
pub async fn detect_shutdown(cancellation: CancellationToken) {
    select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            cancellation.cancel();
        },
        _ = terminate() => {
            info!("Terminated, shutting down");
            cancellation.cancel();
        },
        _ = cancellation.cancelled() => (),
    };
}
