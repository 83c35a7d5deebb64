use std::{collections::HashMap, time::Duration};

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info};

use crate::{
    collaborators::{ChannelSender, OutboundMessage},
    error::DispatchError,
    models::sendgrid::{SendGridAddress, SendGridContent, SendGridMail, SendGridPersonalization},
};

pub struct SendGridSender {
    http_client: Client,
    base_url: String,
    api_key: String,
    from: String,
}

impl SendGridSender {
    pub fn new(base_url: &str, api_key: &str, from: &str, timeout: Duration) -> Result<Self, Error> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))?;

        info!(from, "SendGrid sender initialized");

        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            from: from.to_string(),
        })
    }

    fn mail(&self, message: &OutboundMessage) -> SendGridMail {
        let mut custom_args = HashMap::new();
        custom_args.insert("notification_id".to_string(), message.idempotency_key());

        SendGridMail {
            personalizations: vec![SendGridPersonalization {
                to: vec![SendGridAddress {
                    email: message.recipient.clone(),
                }],
            }],
            from: SendGridAddress {
                email: self.from.clone(),
            },
            subject: message.subject.clone().unwrap_or_default(),
            content: vec![SendGridContent {
                content_type: "text/html".to_string(),
                value: message.body.clone(),
            }],
            custom_args,
        }
    }
}

#[async_trait]
impl ChannelSender for SendGridSender {
    fn provider_name(&self) -> &str {
        "sendgrid"
    }

    async fn send(&self, message: &OutboundMessage) -> Result<(), DispatchError> {
        debug!(notification_id = %message.notification_id, "Sending email via SendGrid");

        let response = self
            .http_client
            .post(format!("{}/v3/mail/send", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&self.mail(message))
            .send()
            .await
            .map_err(|e| DispatchError::Provider(format!("SendGrid request failed: {}", e)))?;

        if response.status().is_success() {
            info!(notification_id = %message.notification_id, "Email accepted by SendGrid");
            Ok(())
        } else {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            Err(DispatchError::Provider(format!(
                "SendGrid returned {}: {}",
                status, error_text
            )))
        }
    }
}
