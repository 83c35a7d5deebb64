use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_postgres::{Client, NoTls, Row, types::Json};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::{
    dead_letter::{DeadLetterPage, DeadLetterStore},
    error::DispatchError,
    models::{
        message::DeadLetterEntry,
        record::{ErrorInfo, NotificationRecord, RecordVersion},
        request::NotificationRequest,
        status::NotificationStatus,
    },
    records::{RecordPage, RecordStore},
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS notification_records (
    notification_id UUID PRIMARY KEY,
    request_id TEXT NOT NULL UNIQUE,
    user_id TEXT NOT NULL,
    channel TEXT NOT NULL,
    status TEXT NOT NULL,
    attempt INTEGER NOT NULL,
    last_error JSONB,
    attempt_errors JSONB NOT NULL DEFAULT '[]',
    request JSONB NOT NULL,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
);

CREATE INDEX IF NOT EXISTS notification_records_user_idx
    ON notification_records (user_id, created_at DESC);

CREATE INDEX IF NOT EXISTS notification_records_status_idx
    ON notification_records (status, updated_at);

CREATE TABLE IF NOT EXISTS dead_letters (
    id UUID PRIMARY KEY,
    notification_id UUID NOT NULL,
    request JSONB NOT NULL,
    error JSONB NOT NULL,
    attempts INTEGER NOT NULL,
    attempt_errors JSONB NOT NULL,
    dead_lettered_at TIMESTAMPTZ NOT NULL,
    replayed_as UUID
);

CREATE INDEX IF NOT EXISTS dead_letters_time_idx
    ON dead_letters (dead_lettered_at DESC);
"#;

const RECORD_COLUMNS: &str = "notification_id, request, status, attempt, last_error, \
                              attempt_errors, created_at, updated_at";

const DEAD_LETTER_COLUMNS: &str = "id, notification_id, request, error, attempts, \
                                   attempt_errors, dead_lettered_at, replayed_as";

/// PostgreSQL storage for notification records and archived dead letters.
pub struct PostgresStore {
    client: Client,
}

impl PostgresStore {
    pub async fn connect(database_url: &str) -> Result<Self, Error> {
        info!("Connecting to PostgreSQL database");

        let (client, connection) = tokio_postgres::connect(database_url, NoTls)
            .await
            .map_err(|e| anyhow!("Failed to connect to database: {}", e))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "PostgreSQL connection closed");
            }
        });

        client
            .batch_execute(SCHEMA)
            .await
            .map_err(|e| anyhow!("Failed to create schema: {}", e))?;

        info!("PostgreSQL connection established");
        Ok(Self { client })
    }

    async fn count(&self, query: &str, user_id: Option<&str>) -> Result<u64, DispatchError> {
        let row = match user_id {
            Some(user_id) => self.client.query_one(query, &[&user_id]).await?,
            None => self.client.query_one(query, &[]).await?,
        };
        let total: i64 = row.try_get(0)?;
        Ok(total as u64)
    }
}

fn offset(page: u64, limit: u64) -> i64 {
    (page.saturating_sub(1) * limit) as i64
}

fn record_from_row(row: &Row) -> Result<NotificationRecord, DispatchError> {
    let status: String = row.try_get("status")?;
    let status = NotificationStatus::from_string(&status).ok_or_else(|| {
        DispatchError::Internal(anyhow!("Unknown notification status '{}'", status))
    })?;

    let Json(request): Json<NotificationRequest> = row.try_get("request")?;
    let last_error: Option<Json<ErrorInfo>> = row.try_get("last_error")?;
    let Json(attempt_errors): Json<Vec<ErrorInfo>> = row.try_get("attempt_errors")?;
    let attempt: i32 = row.try_get("attempt")?;

    Ok(NotificationRecord {
        notification_id: row.try_get("notification_id")?,
        request,
        status,
        attempt: attempt as u32,
        last_error: last_error.map(|Json(e)| e),
        attempt_errors,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn dead_letter_from_row(row: &Row) -> Result<DeadLetterEntry, DispatchError> {
    let Json(request): Json<NotificationRequest> = row.try_get("request")?;
    let Json(error): Json<ErrorInfo> = row.try_get("error")?;
    let Json(attempt_errors): Json<Vec<ErrorInfo>> = row.try_get("attempt_errors")?;
    let attempts: i32 = row.try_get("attempts")?;

    Ok(DeadLetterEntry {
        id: row.try_get("id")?,
        notification_id: row.try_get("notification_id")?,
        request,
        error,
        attempts: attempts as u32,
        attempt_errors,
        dead_lettered_at: row.try_get("dead_lettered_at")?,
        replayed_as: row.try_get("replayed_as")?,
    })
}

#[async_trait]
impl RecordStore for PostgresStore {
    async fn insert(&self, record: &NotificationRecord) -> Result<(), DispatchError> {
        self.client
            .execute(
                "INSERT INTO notification_records (notification_id, request_id, user_id, channel, \
                 status, attempt, last_error, attempt_errors, request, created_at, updated_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
                &[
                    &record.notification_id,
                    &record.request_id(),
                    &record.user_id(),
                    &record.channel().as_str(),
                    &record.status.as_str(),
                    &(record.attempt as i32),
                    &record.last_error.as_ref().map(Json),
                    &Json(&record.attempt_errors),
                    &Json(&record.request),
                    &record.created_at,
                    &record.updated_at,
                ],
            )
            .await?;

        debug!(notification_id = %record.notification_id, "Record inserted");
        Ok(())
    }

    async fn get(
        &self,
        notification_id: Uuid,
    ) -> Result<Option<NotificationRecord>, DispatchError> {
        let query = format!(
            "SELECT {} FROM notification_records WHERE notification_id = $1",
            RECORD_COLUMNS
        );
        self.client
            .query_opt(&query, &[&notification_id])
            .await?
            .as_ref()
            .map(record_from_row)
            .transpose()
    }

    async fn get_by_request_id(
        &self,
        request_id: &str,
    ) -> Result<Option<NotificationRecord>, DispatchError> {
        let query = format!(
            "SELECT {} FROM notification_records WHERE request_id = $1",
            RECORD_COLUMNS
        );
        self.client
            .query_opt(&query, &[&request_id])
            .await?
            .as_ref()
            .map(record_from_row)
            .transpose()
    }

    async fn update(
        &self,
        record: &NotificationRecord,
        expected: RecordVersion,
    ) -> Result<bool, DispatchError> {
        let updated = self
            .client
            .execute(
                "UPDATE notification_records \
                 SET status = $2, attempt = $3, last_error = $4, attempt_errors = $5, updated_at = $6 \
                 WHERE notification_id = $1 AND status = $7 AND attempt = $8",
                &[
                    &record.notification_id,
                    &record.status.as_str(),
                    &(record.attempt as i32),
                    &record.last_error.as_ref().map(Json),
                    &Json(&record.attempt_errors),
                    &record.updated_at,
                    &expected.status.as_str(),
                    &(expected.attempt as i32),
                ],
            )
            .await?;

        Ok(updated == 1)
    }

    async fn list_by_user(
        &self,
        user_id: &str,
        page: u64,
        limit: u64,
    ) -> Result<RecordPage, DispatchError> {
        let total = self
            .count(
                "SELECT COUNT(*) FROM notification_records WHERE user_id = $1",
                Some(user_id),
            )
            .await?;

        let query = format!(
            "SELECT {} FROM notification_records WHERE user_id = $1 \
             ORDER BY created_at DESC LIMIT $2 OFFSET $3",
            RECORD_COLUMNS
        );
        let rows = self
            .client
            .query(&query, &[&user_id, &(limit as i64), &offset(page, limit)])
            .await?;

        Ok(RecordPage {
            records: rows.iter().map(record_from_row).collect::<Result<_, _>>()?,
            total,
        })
    }

    async fn list_stale(
        &self,
        status: NotificationStatus,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<NotificationRecord>, DispatchError> {
        let query = format!(
            "SELECT {} FROM notification_records WHERE status = $1 AND updated_at < $2 \
             ORDER BY updated_at LIMIT $3",
            RECORD_COLUMNS
        );
        let rows = self
            .client
            .query(
                &query,
                &[&status.as_str(), &updated_before, &(limit as i64)],
            )
            .await?;

        rows.iter().map(record_from_row).collect()
    }

    async fn ping(&self) -> Result<(), DispatchError> {
        self.client.simple_query("SELECT 1").await?;
        Ok(())
    }
}

#[async_trait]
impl DeadLetterStore for PostgresStore {
    async fn append(&self, entry: &DeadLetterEntry) -> Result<(), DispatchError> {
        self.client
            .execute(
                "INSERT INTO dead_letters (id, notification_id, request, error, attempts, \
                 attempt_errors, dead_lettered_at, replayed_as) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8) ON CONFLICT (id) DO NOTHING",
                &[
                    &entry.id,
                    &entry.notification_id,
                    &Json(&entry.request),
                    &Json(&entry.error),
                    &(entry.attempts as i32),
                    &Json(&entry.attempt_errors),
                    &entry.dead_lettered_at,
                    &entry.replayed_as,
                ],
            )
            .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<DeadLetterEntry>, DispatchError> {
        let query = format!(
            "SELECT {} FROM dead_letters WHERE id = $1",
            DEAD_LETTER_COLUMNS
        );
        self.client
            .query_opt(&query, &[&id])
            .await?
            .as_ref()
            .map(dead_letter_from_row)
            .transpose()
    }

    async fn list(&self, page: u64, limit: u64) -> Result<DeadLetterPage, DispatchError> {
        let total = self.count("SELECT COUNT(*) FROM dead_letters", None).await?;

        let query = format!(
            "SELECT {} FROM dead_letters ORDER BY dead_lettered_at DESC LIMIT $1 OFFSET $2",
            DEAD_LETTER_COLUMNS
        );
        let rows = self
            .client
            .query(&query, &[&(limit as i64), &offset(page, limit)])
            .await?;

        Ok(DeadLetterPage {
            entries: rows
                .iter()
                .map(dead_letter_from_row)
                .collect::<Result<_, _>>()?,
            total,
        })
    }

    async fn mark_replayed(&self, id: Uuid, replayed_as: Uuid) -> Result<(), DispatchError> {
        let updated = self
            .client
            .execute(
                "UPDATE dead_letters SET replayed_as = $2 WHERE id = $1",
                &[&id, &replayed_as],
            )
            .await?;

        if updated == 0 {
            return Err(DispatchError::DeadLetterNotFound(id));
        }
        Ok(())
    }
}
