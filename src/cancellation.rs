//! Cooperative shutdown: one root CancellationToken for the daemon, checked
//! at the top of every tick and raced against the inter-tick sleep.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Clone, Default)]
pub struct Shutdown {
    token: CancellationToken,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.token.cancel();
    }

    #[inline]
    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Token for background tasks that must stop with the daemon.
    pub fn token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub async fn wait(&self) {
        self.token.cancelled().await
    }

    /// Sleep for `duration` unless shutdown fires first.
    /// Returns false if the sleep was cut short.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.token.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    /// Trigger on Ctrl-C. Must be called inside a tokio runtime.
    pub fn install_ctrl_c(&self) {
        let shutdown = self.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("ctrl-c received, shutting down after the current tick");
                    shutdown.trigger();
                }
                Err(e) => warn!(error = %e, "failed to listen for ctrl-c"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sleep_completes_without_shutdown() {
        let shutdown = Shutdown::new();
        assert!(shutdown.sleep(Duration::from_millis(5)).await);
        assert!(!shutdown.is_triggered());
    }

    #[tokio::test]
    async fn test_trigger_aborts_sleep() {
        let shutdown = Shutdown::new();
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.trigger();
        });
        let started = std::time::Instant::now();
        assert!(!shutdown.sleep(Duration::from_secs(30)).await);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_child_tokens_follow_root() {
        let shutdown = Shutdown::new();
        let child = shutdown.token();
        assert!(!child.is_cancelled());
        shutdown.trigger();
        assert!(child.is_cancelled());
        shutdown.wait().await;
    }
}
