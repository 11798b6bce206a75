//! Process signals that request a graceful shutdown.
//!
//! Handlers are registered by [`ShutdownSignal::install`], before the first
//! await, so a signal delivered while the server starts is not lost.

use crate::error::AppResult;
use tracing::warn;

/// Ctrl-C, and on Unix also `SIGTERM`.
#[derive(Debug)]
pub struct ShutdownSignal {
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
}

impl ShutdownSignal {
    /// Registers the handlers. Must be called inside a tokio runtime.
    pub fn install() -> AppResult<Self> {
        Ok(Self {
            #[cfg(unix)]
            terminate: tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?,
        })
    }

    /// Resolves with the name of the first signal received.
    pub async fn recv(&mut self) -> &'static str {
        #[cfg(unix)]
        {
            tokio::select! {
                _ = interrupt() => "SIGINT",
                _ = self.terminate.recv() => "SIGTERM",
            }
        }
        #[cfg(not(unix))]
        {
            interrupt().await;
            "Ctrl+C"
        }
    }
}

async fn interrupt() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn terminate_is_observed() {
        let mut signal = ShutdownSignal::install().unwrap();
        let status = std::process::Command::new("sh")
            .arg("-c")
            .arg(format!("kill -TERM {}", std::process::id()))
            .status()
            .unwrap();
        assert!(status.success());

        let name = tokio::time::timeout(Duration::from_secs(5), signal.recv())
            .await
            .unwrap();
        assert_eq!(name, "SIGTERM");
    }
}
