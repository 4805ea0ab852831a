use anyhow::Result;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::coordinator::Coordinator;
use crate::observability::pipeline_metrics;

/// Graceful shutdown for the resolution loop
pub struct ShutdownCoordinator {
    escalation_grace: Duration,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl ShutdownCoordinator {
    pub fn new(escalation_grace: Duration) -> Self {
        Self { escalation_grace }
    }

    /// Resolves on ctrl-c, or SIGTERM on unix
    pub async fn wait_for_signal() -> Result<()> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut terminate = signal(SignalKind::terminate())?;
            tokio::select! {
                result = tokio::signal::ctrl_c() => result?,
                _ = terminate.recv() => {}
            }
        }
        #[cfg(not(unix))]
        tokio::signal::ctrl_c().await?;

        info!("Shutdown signal received");
        Ok(())
    }

    /// Stop in-flight pipelines, give open escalations a short grace period
    /// and log final statistics. Queue entries interrupted mid-drain are
    /// recovered by the next drainer.
    pub async fn shutdown(&self, coordinator: &Coordinator) -> Result<()> {
        info!("Initiating graceful shutdown...");

        coordinator.budget().cancel_all();

        match timeout(self.escalation_grace, coordinator.wait_for_escalations()).await {
            Ok(verdicts) => {
                if !verdicts.is_empty() {
                    info!(verdicts = verdicts.len(), "Escalations settled before shutdown");
                }
            }
            // the dropped wait aborts the remaining watchers
            Err(_) => warn!("Escalations still open; they stay in the outbox for the next run"),
        }

        pipeline_metrics().log_stats();
        info!("Graceful shutdown completed successfully");
        Ok(())
    }
}
