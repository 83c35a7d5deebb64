use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::DispatchError,
    models::{message::QueueMessage, status::NotificationStatus},
    queue::QueueFabric,
    records::RecordStore,
};

const SWEEP_BATCH: usize = 500;

/// Publishes records admission persisted but never managed to publish.
pub struct ReconciliationSweep {
    records: Arc<dyn RecordStore>,
    fabric: Arc<dyn QueueFabric>,
    interval: Duration,
    grace: Duration,
}

impl ReconciliationSweep {
    pub fn new(
        records: Arc<dyn RecordStore>,
        fabric: Arc<dyn QueueFabric>,
        interval: Duration,
        grace: Duration,
    ) -> Self {
        Self {
            records,
            fabric,
            interval,
            grace,
        }
    }

    /// Returns how many orphaned records were published.
    pub async fn sweep_once(&self) -> Result<usize, DispatchError> {
        let grace = chrono::Duration::from_std(self.grace)
            .map_err(|e| DispatchError::Internal(anyhow::anyhow!("invalid grace period: {}", e)))?;
        let cutoff = Utc::now() - grace;

        let orphans = self
            .records
            .list_stale(NotificationStatus::Pending, cutoff, SWEEP_BATCH)
            .await?;

        let mut published = 0;

        for mut record in orphans {
            self.fabric.publish(&QueueMessage::for_record(&record)).await?;
            published += 1;

            let expected = record.version();
            record.transition(NotificationStatus::Queued)?;

            if !self.records.update(&record, expected).await? {
                debug!(
                    notification_id = %record.notification_id,
                    "Orphan advanced concurrently"
                );
            }
        }

        if published > 0 {
            info!(published, "Republished orphaned PENDING records");
        }

        Ok(published)
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        warn!(error = %e, "Reconciliation sweep failed");
                    }
                }
            }
        }

        info!("Reconciliation sweep stopped");
    }
}
