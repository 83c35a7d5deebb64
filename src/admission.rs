use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::time::{Instant, sleep};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::{
    error::DispatchError,
    idempotency::{Admission, IdempotencyStore},
    models::{
        message::QueueMessage,
        record::NotificationRecord,
        request::NotificationRequest,
        status::NotificationStatus,
        validation::validate_request,
    },
    queue::QueueFabric,
    records::{RecordPage, RecordStore},
};

pub const MAX_PAGE_SIZE: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    pub notification_id: Uuid,
    pub duplicate: bool,
}

/// How long a duplicate waits for the first admission's record by default.
pub const DEFAULT_CONFIRM_TIMEOUT: Duration = Duration::from_secs(2);

const CONFIRM_INITIAL_BACKOFF: Duration = Duration::from_millis(10);
const CONFIRM_MAX_BACKOFF: Duration = Duration::from_millis(200);

/// Gateway-side entry point of the pipeline.
#[derive(Clone)]
pub struct DispatchAdmission {
    idempotency: Arc<dyn IdempotencyStore>,
    records: Arc<dyn RecordStore>,
    fabric: Arc<dyn QueueFabric>,
    confirm_timeout: Duration,
}

impl DispatchAdmission {
    pub fn new(
        idempotency: Arc<dyn IdempotencyStore>,
        records: Arc<dyn RecordStore>,
        fabric: Arc<dyn QueueFabric>,
    ) -> Self {
        Self {
            idempotency,
            records,
            fabric,
            confirm_timeout: DEFAULT_CONFIRM_TIMEOUT,
        }
    }

    pub fn with_confirm_timeout(mut self, confirm_timeout: Duration) -> Self {
        self.confirm_timeout = confirm_timeout;
        self
    }

    /// Validates, deduplicates, persists and publishes a request.
    ///
    /// A duplicate request key returns the id of the first admission without
    /// publishing anything, but only once that admission's record exists.
    /// While the first admission is still inserting, the duplicate waits up to
    /// the confirm timeout. A binding whose record never appears is released
    /// once and the key is admitted again; if that also stalls the caller gets
    /// `AdmissionInProgress`.
    ///
    /// The record is persisted before its message is published; if the
    /// publish fails the record stays PENDING for the reconciliation sweep and
    /// the id is still returned.
    #[instrument(
        name = "submit",
        skip_all,
        fields(request_id = %request.request_id, channel = %request.channel)
    )]
    pub async fn submit(&self, request: NotificationRequest) -> Result<Submission, DispatchError> {
        validate_request(&request)?;

        let candidate = Uuid::new_v4();
        let mut deadline = Instant::now() + self.confirm_timeout;
        let mut backoff = CONFIRM_INITIAL_BACKOFF;
        let mut released_stale = false;

        loop {
            let bound = match self
                .idempotency
                .admit(&request.request_id, candidate)
                .await?
            {
                Admission::Fresh => return self.admit_fresh(candidate, request).await,
                Admission::Duplicate(notification_id) => notification_id,
            };

            if self.records.get(bound).await?.is_some() {
                info!(notification_id = %bound, "Duplicate request, returning existing notification");
                return Ok(Submission {
                    notification_id: bound,
                    duplicate: true,
                });
            }

            if Instant::now() >= deadline {
                if released_stale {
                    return Err(DispatchError::AdmissionInProgress(request.request_id));
                }
                warn!(
                    notification_id = %bound,
                    "Idempotency key bound to a notification that was never stored, releasing it"
                );
                self.idempotency.release(&request.request_id, bound).await?;
                released_stale = true;
                deadline = Instant::now() + self.confirm_timeout;
                backoff = CONFIRM_INITIAL_BACKOFF;
                continue;
            }

            debug!(notification_id = %bound, "First admission still in progress, waiting");
            sleep(backoff).await;
            backoff = (backoff * 2).min(CONFIRM_MAX_BACKOFF);
        }
    }

    async fn admit_fresh(
        &self,
        candidate: Uuid,
        request: NotificationRequest,
    ) -> Result<Submission, DispatchError> {
        let mut record = NotificationRecord::new(candidate, request);

        if let Err(e) = self.records.insert(&record).await {
            let stored = self.stored_for(record.request_id()).await;
            match stored {
                Some(existing) if existing.notification_id == candidate => {
                    debug!("Insert reported an error but the record was stored");
                    record = existing;
                }
                Some(existing) => return Ok(self.rebind(candidate, existing).await),
                None => {
                    if let Err(release_err) = self
                        .idempotency
                        .release(record.request_id(), candidate)
                        .await
                    {
                        warn!(error = %release_err, "Failed to release idempotency key after insert failure");
                    }
                    return Err(e);
                }
            }
        }

        match self.fabric.publish(&QueueMessage::for_record(&record)).await {
            Ok(()) => self.mark_queued(&mut record).await,
            Err(e) => {
                warn!(
                    notification_id = %candidate,
                    error = %e,
                    "Publish failed, record left PENDING for reconciliation"
                );
            }
        }

        info!(notification_id = %candidate, "Notification admitted");

        Ok(Submission {
            notification_id: candidate,
            duplicate: false,
        })
    }

    async fn stored_for(&self, request_id: &str) -> Option<NotificationRecord> {
        match self.records.get_by_request_id(request_id).await {
            Ok(existing) => existing,
            Err(e) => {
                warn!(error = %e, "Lookup by request id failed after insert failure");
                None
            }
        }
    }

    /// The request was stored earlier and its key has since expired or was
    /// taken over: point the key back at the stored record.
    async fn rebind(&self, candidate: Uuid, existing: NotificationRecord) -> Submission {
        let request_id = existing.request_id();
        let notification_id = existing.notification_id;

        if let Err(e) = self.idempotency.release(request_id, candidate).await {
            warn!(error = %e, "Failed to release candidate binding");
        }

        match self.idempotency.admit(request_id, notification_id).await {
            Ok(Admission::Fresh) if existing.status.is_terminal() => {
                if let Err(e) = self.idempotency.retire(request_id).await {
                    warn!(error = %e, "Failed to start idempotency retention");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Failed to rebind idempotency key"),
        }

        info!(%notification_id, "Request already stored, returning existing notification");
        Submission {
            notification_id,
            duplicate: true,
        }
    }

    /// A worker may advance the record first; losing this write is fine.
    async fn mark_queued(&self, record: &mut NotificationRecord) {
        let expected = record.version();

        if let Err(e) = record.transition(NotificationStatus::Queued) {
            warn!(error = %e, "Unexpected record state after insert");
            return;
        }

        match self.records.update(record, expected).await {
            Ok(true) => {}
            Ok(false) => debug!(
                notification_id = %record.notification_id,
                "Record advanced by a worker before admission marked it QUEUED"
            ),
            Err(e) => warn!(
                notification_id = %record.notification_id,
                error = %e,
                "Failed to mark record QUEUED"
            ),
        }
    }

    pub async fn get_status(&self, notification_id: Uuid) -> Result<NotificationRecord, DispatchError> {
        self.records
            .get(notification_id)
            .await?
            .ok_or(DispatchError::NotificationNotFound(notification_id))
    }

    pub async fn list_for_user(
        &self,
        user_id: &str,
        page: u64,
        limit: u64,
    ) -> Result<RecordPage, DispatchError> {
        if user_id.trim().is_empty() {
            return Err(DispatchError::Validation("user_id is required".to_string()));
        }
        let (page, limit) = normalize_page(page, limit)?;

        self.records.list_by_user(user_id, page, limit).await
    }
}

/// Pages start at 1; `limit` must be within 1..=100.
pub fn normalize_page(page: u64, limit: u64) -> Result<(u64, u64), DispatchError> {
    if page == 0 {
        return Err(DispatchError::Validation("page starts at 1".to_string()));
    }
    if limit == 0 || limit > MAX_PAGE_SIZE {
        return Err(DispatchError::Validation(format!(
            "limit must be between 1 and {}",
            MAX_PAGE_SIZE
        )));
    }
    Ok((page, limit))
}
