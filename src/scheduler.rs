use crate::prelude::*;

use tokio::time::MissedTickBehavior;

/// Runs refresh cycles at the scan interval, one at a time.
pub struct Scheduler {
    config: ConfigWrapper,
    coordinator: Coordinator,
}

impl Scheduler {
    pub fn new(config: ConfigWrapper, coordinator: Coordinator) -> Self {
        Self {
            config,
            coordinator,
        }
    }

    /// Stops once `cancel` fires. A cycle already running is allowed to
    /// finish so the logger's only session slot is never left half used.
    pub async fn start(&self, cancel: CancellationToken) -> Result<()> {
        let mut interval = tokio::time::interval(self.config.polling().scan_interval());
        // a slow cycle pushes the next one back rather than bunching them up
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            match self.coordinator.refresh(&cancel).await {
                Ok(Some(refresh)) => info!(
                    "refreshed {} values ({:?})",
                    refresh.snapshot.len(),
                    refresh.source
                ),
                Ok(None) => debug!("nothing to refresh"),
                Err(e) => error!("refresh failed: {:#}", e),
            }
        }

        info!("scheduler stopped");
        Ok(())
    }
}
