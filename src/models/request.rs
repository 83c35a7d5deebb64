use std::{
    collections::HashMap,
    fmt::{Display, Formatter},
    str::FromStr,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DispatchError;

pub const DEFAULT_PRIORITY: i32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Email,
    Push,
}

impl Channel {
    pub const ALL: [Channel; 2] = [Channel::Email, Channel::Push];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Email => "email",
            Channel::Push => "push",
        }
    }
}

impl Display for Channel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "email" => Ok(Channel::Email),
            "push" => Ok(Channel::Push),
            other => Err(DispatchError::Validation(format!(
                "Unknown notification channel '{}'",
                other
            ))),
        }
    }
}

/// Immutable notification request as admitted and carried by every queue message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub request_id: String,
    pub user_id: String,
    pub channel: Channel,
    pub template_code: String,

    #[serde(default)]
    pub variables: HashMap<String, String>,

    #[serde(default = "default_priority")]
    pub priority: i32,

    #[serde(default)]
    pub metadata: HashMap<String, String>,

    pub created_at: DateTime<Utc>,
}

impl NotificationRequest {
    pub fn new(
        request_id: impl Into<String>,
        user_id: impl Into<String>,
        channel: Channel,
        template_code: impl Into<String>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            user_id: user_id.into(),
            channel,
            template_code: template_code.into(),
            variables: HashMap::new(),
            priority: DEFAULT_PRIORITY,
            metadata: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }
}

fn default_priority() -> i32 {
    DEFAULT_PRIORITY
}

/// Request body accepted by the HTTP surface before validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitNotification {
    #[serde(default)]
    pub request_id: Option<String>,
    pub user_id: String,
    pub channel: String,
    pub template_code: String,

    #[serde(default)]
    pub variables: HashMap<String, String>,

    #[serde(default)]
    pub priority: Option<i32>,

    #[serde(default)]
    pub metadata: HashMap<String, String>,

    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl SubmitNotification {
    pub fn into_request(self) -> Result<NotificationRequest, DispatchError> {
        let channel = self.channel.parse::<Channel>()?;

        Ok(NotificationRequest {
            request_id: self
                .request_id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            user_id: self.user_id,
            channel,
            template_code: self.template_code,
            variables: self.variables,
            priority: self.priority.unwrap_or(DEFAULT_PRIORITY),
            metadata: self.metadata,
            created_at: self.created_at.unwrap_or_else(Utc::now),
        })
    }
}
