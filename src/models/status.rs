use std::fmt::{Display, Formatter, Result};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationStatus {
    Pending,
    Queued,
    Sending,
    Delivered,
    Failed,
    DeadLettered,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Pending => "PENDING",
            NotificationStatus::Queued => "QUEUED",
            NotificationStatus::Sending => "SENDING",
            NotificationStatus::Delivered => "DELIVERED",
            NotificationStatus::Failed => "FAILED",
            NotificationStatus::DeadLettered => "DEAD_LETTERED",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(NotificationStatus::Pending),
            "QUEUED" => Some(NotificationStatus::Queued),
            "SENDING" => Some(NotificationStatus::Sending),
            "DELIVERED" => Some(NotificationStatus::Delivered),
            "FAILED" => Some(NotificationStatus::Failed),
            "DEAD_LETTERED" => Some(NotificationStatus::DeadLettered),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NotificationStatus::Delivered
                | NotificationStatus::Failed
                | NotificationStatus::DeadLettered
        )
    }

    pub fn can_transition_to(&self, next: NotificationStatus) -> bool {
        use NotificationStatus::*;

        matches!(
            (self, next),
            (Pending, Queued)
                | (Queued, Sending)
                | (Queued, DeadLettered)
                | (Sending, Delivered)
                | (Sending, Queued)
                | (Sending, DeadLettered)
                | (Sending, Failed)
        )
    }
}

impl Display for NotificationStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "{}", self.as_str())
    }
}
