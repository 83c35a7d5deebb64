//! Narrow interfaces to the services the pipeline depends on but does not own.

use std::collections::HashMap;

use async_trait::async_trait;
use uuid::Uuid;

use crate::{
    error::DispatchError,
    models::{request::Channel, template::RenderedContent, user::UserProfile},
};

#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Fails with `UserNotFound` when the user does not exist.
    async fn get_user(&self, user_id: &str) -> Result<UserProfile, DispatchError>;
}

#[async_trait]
pub trait TemplateRenderer: Send + Sync {
    /// Fails with `TemplateNotFound` or `Render`.
    async fn render(
        &self,
        template_code: &str,
        channel: Channel,
        variables: &HashMap<String, String>,
    ) -> Result<RenderedContent, DispatchError>;
}

/// Fully resolved message handed to a provider.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub notification_id: Uuid,
    pub channel: Channel,
    /// E-mail address or device token.
    pub recipient: String,
    pub subject: Option<String>,
    pub body: String,
    pub data: HashMap<String, String>,
}

impl OutboundMessage {
    pub fn new(
        notification_id: Uuid,
        channel: Channel,
        recipient: String,
        content: RenderedContent,
    ) -> Self {
        Self {
            notification_id,
            channel,
            recipient,
            subject: content.subject,
            body: content.body,
            data: HashMap::new(),
        }
    }

    pub fn with_data(mut self, data: HashMap<String, String>) -> Self {
        self.data = data;
        self
    }

    /// Key providers can use to drop retried duplicates.
    pub fn idempotency_key(&self) -> String {
        self.notification_id.to_string()
    }
}

/// Downstream provider for one channel. Sends may be retried and duplicated;
/// implementations forward [`OutboundMessage::idempotency_key`] where the
/// provider supports it.
#[async_trait]
pub trait ChannelSender: Send + Sync {
    fn provider_name(&self) -> &str;

    /// Fails with `Provider` for attributable failures.
    async fn send(&self, message: &OutboundMessage) -> Result<(), DispatchError>;
}
