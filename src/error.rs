use std::{
    fmt::{Display, Formatter},
    time::Duration,
};

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{response::ApiResponse, status::NotificationStatus};

/// Structured error code persisted with records and dead-letter entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    ValidationError,
    CircuitOpen,
    ProviderError,
    Timeout,
    Exhausted,
    DeadlineExceeded,
    UserNotFound,
    TemplateNotFound,
    RenderError,
    ChannelDisabled,
    InvalidRecipient,
    Upstream,
    NotFound,
    Conflict,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "VALIDATION_ERROR",
            ErrorKind::CircuitOpen => "CIRCUIT_OPEN",
            ErrorKind::ProviderError => "PROVIDER_ERROR",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Exhausted => "EXHAUSTED",
            ErrorKind::DeadlineExceeded => "DEADLINE_EXCEEDED",
            ErrorKind::UserNotFound => "USER_NOT_FOUND",
            ErrorKind::TemplateNotFound => "TEMPLATE_NOT_FOUND",
            ErrorKind::RenderError => "RENDER_ERROR",
            ErrorKind::ChannelDisabled => "CHANNEL_DISABLED",
            ErrorKind::InvalidRecipient => "INVALID_RECIPIENT",
            ErrorKind::Upstream => "UPSTREAM_ERROR",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Conflict => "CONFLICT",
            ErrorKind::Internal => "INTERNAL_ERROR",
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Circuit breaker is open for {0}")]
    CircuitOpen(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Provider call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Retries exhausted after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },

    #[error("In-flight deadline exceeded after {0:?}")]
    DeadlineExceeded(Duration),

    #[error("User {0} not found")]
    UserNotFound(String),

    #[error("Template {0} not found")]
    TemplateNotFound(String),

    #[error("Template render failed: {0}")]
    Render(String),

    #[error("User {user_id} has {channel} notifications disabled")]
    ChannelDisabled { user_id: String, channel: String },

    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),

    #[error("Upstream service error: {0}")]
    Upstream(String),

    #[error("Notification {0} not found")]
    NotificationNotFound(Uuid),

    #[error("Dead-letter entry {0} not found")]
    DeadLetterNotFound(Uuid),

    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition {
        from: NotificationStatus,
        to: NotificationStatus,
    },

    #[error("Notification {0} was updated by another delivery")]
    StaleDelivery(Uuid),

    #[error("Request {0} is still being admitted, retry shortly")]
    AdmissionInProgress(String),

    #[error("Database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Queue error: {0}")]
    Queue(#[from] lapin::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl DispatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DispatchError::Validation(_) => ErrorKind::ValidationError,
            DispatchError::CircuitOpen(_) => ErrorKind::CircuitOpen,
            DispatchError::Provider(_) => ErrorKind::ProviderError,
            DispatchError::Timeout(_) => ErrorKind::Timeout,
            DispatchError::Exhausted { .. } => ErrorKind::Exhausted,
            DispatchError::DeadlineExceeded(_) => ErrorKind::DeadlineExceeded,
            DispatchError::UserNotFound(_) => ErrorKind::UserNotFound,
            DispatchError::TemplateNotFound(_) => ErrorKind::TemplateNotFound,
            DispatchError::Render(_) => ErrorKind::RenderError,
            DispatchError::ChannelDisabled { .. } => ErrorKind::ChannelDisabled,
            DispatchError::InvalidRecipient(_) => ErrorKind::InvalidRecipient,
            DispatchError::Upstream(_) => ErrorKind::Upstream,
            DispatchError::NotificationNotFound(_) | DispatchError::DeadLetterNotFound(_) => {
                ErrorKind::NotFound
            }
            DispatchError::InvalidTransition { .. }
            | DispatchError::StaleDelivery(_)
            | DispatchError::AdmissionInProgress(_) => ErrorKind::Conflict,
            DispatchError::Database(_)
            | DispatchError::Redis(_)
            | DispatchError::Queue(_)
            | DispatchError::Serialization(_)
            | DispatchError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Failures attributed to a delivery attempt that a later attempt may fix.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DispatchError::Provider(_) | DispatchError::Timeout(_) | DispatchError::Upstream(_)
        )
    }

    /// Failures of the guarded provider call itself.
    pub fn counts_against_circuit(&self) -> bool {
        matches!(self, DispatchError::Provider(_) | DispatchError::Timeout(_))
    }

    /// Failures no retry can fix; the notification goes straight to the dead-letter channel.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            DispatchError::UserNotFound(_)
                | DispatchError::TemplateNotFound(_)
                | DispatchError::Render(_)
                | DispatchError::InvalidRecipient(_)
        )
    }

    fn status_code(&self) -> StatusCode {
        match self {
            DispatchError::Validation(_) => StatusCode::BAD_REQUEST,
            DispatchError::NotificationNotFound(_) | DispatchError::DeadLetterNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            DispatchError::InvalidTransition { .. }
            | DispatchError::StaleDelivery(_)
            | DispatchError::AdmissionInProgress(_) => StatusCode::CONFLICT,
            DispatchError::CircuitOpen(_) => StatusCode::SERVICE_UNAVAILABLE,
            DispatchError::Upstream(_) | DispatchError::Provider(_) => StatusCode::BAD_GATEWAY,
            DispatchError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body: ApiResponse<()> = ApiResponse::error(self.kind().to_string(), self.to_string());
        (status, Json(body)).into_response()
    }
}
