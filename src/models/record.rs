use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::{DispatchError, ErrorKind},
    models::{
        request::{Channel, NotificationRequest},
        status::NotificationStatus,
    },
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
    pub attempt: u32,
    pub occurred_at: DateTime<Utc>,
}

impl ErrorInfo {
    pub fn new(kind: ErrorKind, message: impl Into<String>, attempt: u32) -> Self {
        Self {
            kind,
            message: message.into(),
            attempt,
            occurred_at: Utc::now(),
        }
    }

    pub fn from_error(error: &DispatchError, attempt: u32) -> Self {
        Self::new(error.kind(), error.to_string(), attempt)
    }
}

/// Version a record was read at; writes are compare-and-set against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordVersion {
    pub status: NotificationStatus,
    pub attempt: u32,
}

/// Durable delivery state of one admitted notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub notification_id: Uuid,
    pub request: NotificationRequest,
    pub status: NotificationStatus,
    pub attempt: u32,
    pub last_error: Option<ErrorInfo>,

    #[serde(default)]
    pub attempt_errors: Vec<ErrorInfo>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NotificationRecord {
    pub fn new(notification_id: Uuid, request: NotificationRequest) -> Self {
        let now = Utc::now();

        Self {
            notification_id,
            request,
            status: NotificationStatus::Pending,
            attempt: 0,
            last_error: None,
            attempt_errors: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Rebuilds a QUEUED record from a queue envelope after the store lost it.
    pub fn restore(notification_id: Uuid, request: NotificationRequest, attempt: u32) -> Self {
        Self {
            status: NotificationStatus::Queued,
            attempt,
            ..Self::new(notification_id, request)
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request.request_id
    }

    pub fn user_id(&self) -> &str {
        &self.request.user_id
    }

    pub fn channel(&self) -> Channel {
        self.request.channel
    }

    pub fn version(&self) -> RecordVersion {
        RecordVersion {
            status: self.status,
            attempt: self.attempt,
        }
    }

    pub fn transition(&mut self, next: NotificationStatus) -> Result<(), DispatchError> {
        if !self.status.can_transition_to(next) {
            return Err(DispatchError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }

        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Moves the record into SENDING and counts a new attempt.
    ///
    /// A PENDING record is walked through QUEUED first: the worker can see the
    /// message before admission has recorded the QUEUED transition.
    pub fn begin_attempt(&mut self) -> Result<u32, DispatchError> {
        if self.status == NotificationStatus::Pending {
            self.transition(NotificationStatus::Queued)?;
        }

        self.transition(NotificationStatus::Sending)?;
        self.attempt += 1;
        Ok(self.attempt)
    }

    /// Records a failure of the current attempt in the attempt history.
    pub fn record_attempt_error(&mut self, error: ErrorInfo) -> Result<(), DispatchError> {
        self.ensure_mutable()?;
        self.attempt_errors.push(error.clone());
        self.last_error = Some(error);
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Sets `last_error` without consuming an attempt (CIRCUIT_OPEN requeues).
    pub fn note_error(&mut self, error: ErrorInfo) -> Result<(), DispatchError> {
        self.ensure_mutable()?;
        self.last_error = Some(error);
        self.updated_at = Utc::now();
        Ok(())
    }

    fn ensure_mutable(&self) -> Result<(), DispatchError> {
        if self.status.is_terminal() {
            return Err(DispatchError::InvalidTransition {
                from: self.status,
                to: self.status,
            });
        }
        Ok(())
    }
}
