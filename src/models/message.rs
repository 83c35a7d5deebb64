use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{
    record::{ErrorInfo, NotificationRecord},
    request::{Channel, NotificationRequest},
};

/// Self-contained queue envelope; replayable against a rebuilt record store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub notification_id: Uuid,
    pub attempt: u32,
    pub request: NotificationRequest,
    pub not_before: DateTime<Utc>,
}

impl QueueMessage {
    pub fn new(notification_id: Uuid, attempt: u32, request: NotificationRequest) -> Self {
        Self {
            notification_id,
            attempt,
            request,
            not_before: Utc::now(),
        }
    }

    pub fn for_record(record: &NotificationRecord) -> Self {
        Self::new(record.notification_id, record.attempt, record.request.clone())
    }

    pub fn delayed_until(mut self, not_before: DateTime<Utc>) -> Self {
        self.not_before = not_before;
        self
    }

    pub fn channel(&self) -> Channel {
        self.request.channel
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        now >= self.not_before
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: Uuid,
    pub notification_id: Uuid,
    pub request: NotificationRequest,
    pub error: ErrorInfo,
    pub attempts: u32,
    pub attempt_errors: Vec<ErrorInfo>,
    pub dead_lettered_at: DateTime<Utc>,

    #[serde(default)]
    pub replayed_as: Option<Uuid>,
}

impl DeadLetterEntry {
    pub fn from_record(record: &NotificationRecord, error: ErrorInfo) -> Self {
        Self {
            id: Uuid::new_v4(),
            notification_id: record.notification_id,
            request: record.request.clone(),
            error,
            attempts: record.attempt,
            attempt_errors: record.attempt_errors.clone(),
            dead_lettered_at: Utc::now(),
            replayed_as: None,
        }
    }

    /// Request id used when this entry is replayed through admission.
    ///
    /// Unique per entry, so replaying the same entry twice is deduplicated.
    /// The original key is shortened to keep the result within 255 bytes.
    pub fn replay_request_id(&self) -> String {
        let suffix = format!(":replay:{}", self.id);
        let budget = 255 - suffix.len();

        let mut prefix = String::new();
        for c in self.request.request_id.chars() {
            if prefix.len() + c.len_utf8() > budget {
                break;
            }
            prefix.push(c);
        }

        format!("{}{}", prefix, suffix)
    }
}
