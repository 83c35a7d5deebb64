use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use gcp_auth::TokenProvider;
use reqwest::Client;
use tracing::{debug, info};

use crate::{
    collaborators::{ChannelSender, OutboundMessage},
    error::DispatchError,
    models::fcm::{FcmAndroidConfig, FcmApnsConfig, FcmMessage, FcmNotification, FcmRequest},
};

const FCM_SCOPES: &[&str] = &["https://www.googleapis.com/auth/firebase.messaging"];

/// Push sender for the FCM HTTP v1 API.
pub struct FcmSender {
    http_client: Client,
    project_id: String,
    token_provider: Arc<dyn TokenProvider>,
}

impl FcmSender {
    pub async fn new(project_id: &str, timeout: Duration) -> Result<Self, Error> {
        let token_provider = gcp_auth::provider()
            .await
            .map_err(|e| anyhow!("Failed to load Google credentials: {}", e))?;

        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))?;

        info!(project_id, "FCM sender initialized");

        Ok(Self {
            http_client,
            project_id: project_id.to_string(),
            token_provider,
        })
    }

    fn request(message: &OutboundMessage) -> FcmRequest {
        let key = message.idempotency_key();

        let mut data = message.data.clone();
        data.insert("notification_id".to_string(), key.clone());

        FcmRequest {
            message: FcmMessage {
                token: message.recipient.clone(),
                notification: FcmNotification {
                    title: message.subject.clone().unwrap_or_default(),
                    body: message.body.clone(),
                },
                data,
                android: FcmAndroidConfig {
                    collapse_key: key.clone(),
                },
                apns: FcmApnsConfig {
                    headers: HashMap::from([("apns-collapse-id".to_string(), key)]),
                },
            },
        }
    }
}

#[async_trait]
impl ChannelSender for FcmSender {
    fn provider_name(&self) -> &str {
        "fcm"
    }

    async fn send(&self, message: &OutboundMessage) -> Result<(), DispatchError> {
        debug!(notification_id = %message.notification_id, "Sending FCM push notification");

        let token = self
            .token_provider
            .token(FCM_SCOPES)
            .await
            .map_err(|e| DispatchError::Provider(format!("FCM token request failed: {}", e)))?;

        let url = format!(
            "https://fcm.googleapis.com/v1/projects/{}/messages:send",
            self.project_id
        );

        let response = self
            .http_client
            .post(&url)
            .bearer_auth(token.as_str())
            .json(&Self::request(message))
            .send()
            .await
            .map_err(|e| DispatchError::Provider(format!("FCM request failed: {}", e)))?;

        if response.status().is_success() {
            info!(notification_id = %message.notification_id, "FCM push notification sent");
            Ok(())
        } else {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            Err(DispatchError::Provider(format!(
                "FCM returned {}: {}",
                status, error_text
            )))
        }
    }
}
