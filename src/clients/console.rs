use async_trait::async_trait;
use tracing::info;

use crate::{
    collaborators::{ChannelSender, OutboundMessage},
    error::DispatchError,
};

/// Logs messages instead of sending them. For local runs.
pub struct ConsoleSender;

#[async_trait]
impl ChannelSender for ConsoleSender {
    fn provider_name(&self) -> &str {
        "console"
    }

    async fn send(&self, message: &OutboundMessage) -> Result<(), DispatchError> {
        info!(
            notification_id = %message.notification_id,
            channel = %message.channel,
            recipient = %message.recipient,
            subject = message.subject.as_deref().unwrap_or(""),
            body = %message.body,
            "Console delivery"
        );
        Ok(())
    }
}
