//! Termination signal handling for SIGTERM, SIGINT and SIGHUP.
//!
//! A signal cancels the shared token. An in-flight backup notices it before
//! its manifest is written, so an interrupted run leaves no visible backup;
//! chunks it already uploaded stay in storage for later deduplication.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Shutdown coordinator
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Token observed by coordinators
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Install signal handlers and spawn the task that waits on them.
    pub fn install(&self) -> std::io::Result<JoinHandle<()>> {
        #[cfg(unix)]
        let (mut terminate, mut hangup) = {
            use tokio::signal::unix::{signal, SignalKind};
            (signal(SignalKind::terminate())?, signal(SignalKind::hangup())?)
        };

        let token = self.token.clone();
        let handle = tokio::spawn(async move {
            #[cfg(unix)]
            let received = tokio::select! {
                _ = tokio::signal::ctrl_c() => "SIGINT",
                _ = terminate.recv() => "SIGTERM",
                _ = hangup.recv() => "SIGHUP",
                _ = token.cancelled() => return,
            };

            #[cfg(not(unix))]
            let received = tokio::select! {
                _ = tokio::signal::ctrl_c() => "SIGINT",
                _ = token.cancelled() => return,
            };

            info!("Received {}, cancelling current operation", received);
            token.cancel();
        });

        Ok(handle)
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
