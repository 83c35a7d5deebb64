//! Dead-letter review: archiving entries off the dead-letter channel and the
//! list / inspect / replay feed operators use.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    admission::{DispatchAdmission, Submission, normalize_page},
    error::DispatchError,
    models::{message::DeadLetterEntry, retry::RetryConfig},
    queue::{Delivery, QueueFabric},
    utils::retry_with_backoff,
};

#[derive(Debug, Clone)]
pub struct DeadLetterPage {
    pub entries: Vec<DeadLetterEntry>,
    pub total: u64,
}

#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// Stores the entry; appending an id that is already stored is a no-op.
    async fn append(&self, entry: &DeadLetterEntry) -> Result<(), DispatchError>;

    async fn get(&self, id: Uuid) -> Result<Option<DeadLetterEntry>, DispatchError>;

    /// Newest first. `page` starts at 1.
    async fn list(&self, page: u64, limit: u64) -> Result<DeadLetterPage, DispatchError>;

    async fn mark_replayed(&self, id: Uuid, replayed_as: Uuid) -> Result<(), DispatchError>;
}

/// Moves entries from the dead-letter channel into the [`DeadLetterStore`].
pub struct DeadLetterArchiver {
    fabric: Arc<dyn QueueFabric>,
    store: Arc<dyn DeadLetterStore>,
    retry: RetryConfig,
}

impl DeadLetterArchiver {
    pub fn new(
        fabric: Arc<dyn QueueFabric>,
        store: Arc<dyn DeadLetterStore>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            fabric,
            store,
            retry,
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), DispatchError> {
        let mut source = self
            .fabric
            .subscribe_dead_letters("dead-letter-archiver")
            .await?;

        info!("Dead-letter archiver started");

        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = source.next() => next,
            };

            match next {
                Some(Ok(delivery)) => self.archive(delivery).await,
                Some(Err(e)) => {
                    warn!(error = %e, "Failed to receive dead-letter entry");
                    sleep(Duration::from_secs(1)).await;
                }
                None => {
                    warn!("Dead-letter subscription closed");
                    break;
                }
            }
        }

        info!("Dead-letter archiver stopped");
        Ok(())
    }

    async fn archive(&self, delivery: Delivery<DeadLetterEntry>) {
        let entry = &delivery.payload;

        let settled = match retry_with_backoff(&self.retry, || self.store.append(entry)).await {
            Ok(()) => {
                info!(
                    entry_id = %entry.id,
                    notification_id = %entry.notification_id,
                    error_kind = %entry.error.kind,
                    "Dead-letter entry archived"
                );
                delivery.ack().await
            }
            Err(e) => {
                error!(entry_id = %entry.id, error = %e, "Failed to archive dead-letter entry");
                delivery.nack(true).await
            }
        };

        if let Err(e) = settled {
            warn!(entry_id = %entry.id, error = %e, "Failed to settle dead-letter delivery");
        }
    }
}

/// Operator interface over archived dead letters.
#[derive(Clone)]
pub struct DeadLetterFeed {
    store: Arc<dyn DeadLetterStore>,
    admission: DispatchAdmission,
}

impl DeadLetterFeed {
    pub fn new(store: Arc<dyn DeadLetterStore>, admission: DispatchAdmission) -> Self {
        Self { store, admission }
    }

    pub async fn list(&self, page: u64, limit: u64) -> Result<DeadLetterPage, DispatchError> {
        let (page, limit) = normalize_page(page, limit)?;
        self.store.list(page, limit).await
    }

    pub async fn inspect(&self, id: Uuid) -> Result<DeadLetterEntry, DispatchError> {
        self.store
            .get(id)
            .await?
            .ok_or(DispatchError::DeadLetterNotFound(id))
    }

    /// Re-submits the entry's request through admission with a fresh attempt
    /// counter. Replaying the same entry again returns the same notification.
    #[instrument(name = "replay", skip(self))]
    pub async fn replay(&self, id: Uuid) -> Result<Submission, DispatchError> {
        let entry = self.inspect(id).await?;

        let mut request = entry.request.clone();
        request.request_id = entry.replay_request_id();
        request.created_at = Utc::now();

        let submission = self.admission.submit(request).await?;
        self.store
            .mark_replayed(id, submission.notification_id)
            .await?;

        info!(
            original_notification_id = %entry.notification_id,
            notification_id = %submission.notification_id,
            duplicate = submission.duplicate,
            "Dead-letter entry replayed"
        );

        Ok(submission)
    }
}
