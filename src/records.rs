use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    error::DispatchError,
    models::{
        record::{NotificationRecord, RecordVersion},
        status::NotificationStatus,
    },
};

#[derive(Debug, Clone)]
pub struct RecordPage {
    pub records: Vec<NotificationRecord>,
    pub total: u64,
}

/// Durable notification state, keyed by notification id with a secondary
/// lookup by request id.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn insert(&self, record: &NotificationRecord) -> Result<(), DispatchError>;

    async fn get(&self, notification_id: Uuid)
    -> Result<Option<NotificationRecord>, DispatchError>;

    async fn get_by_request_id(
        &self,
        request_id: &str,
    ) -> Result<Option<NotificationRecord>, DispatchError>;

    /// Writes `record` only if the stored row is still at `expected`.
    ///
    /// Returns `false` when another writer changed the row first.
    async fn update(
        &self,
        record: &NotificationRecord,
        expected: RecordVersion,
    ) -> Result<bool, DispatchError>;

    /// Newest first. `page` starts at 1.
    async fn list_by_user(
        &self,
        user_id: &str,
        page: u64,
        limit: u64,
    ) -> Result<RecordPage, DispatchError>;

    /// Records in `status` whose last update is older than `updated_before`.
    async fn list_stale(
        &self,
        status: NotificationStatus,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<NotificationRecord>, DispatchError>;

    async fn ping(&self) -> Result<(), DispatchError> {
        Ok(())
    }
}
