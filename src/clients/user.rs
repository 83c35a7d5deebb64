use std::time::Duration;

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::{debug, info};

use crate::{
    collaborators::UserDirectory,
    error::DispatchError,
    models::{response::ApiResponse, user::UserProfile},
};

/// User service lookup over HTTP (`GET /api/v1/users/{id}`).
pub struct HttpUserDirectory {
    http_client: Client,
    base_url: String,
}

impl HttpUserDirectory {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, Error> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))?;

        info!(base_url, "User service client initialized");

        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl UserDirectory for HttpUserDirectory {
    async fn get_user(&self, user_id: &str) -> Result<UserProfile, DispatchError> {
        let url = format!("{}/api/v1/users/{}", self.base_url, user_id);
        debug!(user_id, "Fetching user from service");

        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(|e| DispatchError::Upstream(format!("User service unreachable: {}", e)))?;

        match response.status() {
            status if status.is_success() => {
                let body: ApiResponse<UserProfile> = response.json().await.map_err(|e| {
                    DispatchError::Upstream(format!("Invalid user service response: {}", e))
                })?;

                body.data
                    .ok_or_else(|| DispatchError::UserNotFound(user_id.to_string()))
            }
            StatusCode::NOT_FOUND => Err(DispatchError::UserNotFound(user_id.to_string())),
            status => Err(DispatchError::Upstream(format!(
                "User service returned status {}",
                status
            ))),
        }
    }
}
