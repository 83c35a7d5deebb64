use std::{collections::HashMap, time::Duration};

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::{debug, info, warn};

use crate::{
    collaborators::TemplateRenderer,
    error::DispatchError,
    models::{
        request::Channel,
        response::ApiResponse,
        template::{RenderRequest, RenderedContent},
    },
};

/// Template service renderer over HTTP
/// (`POST /api/v1/templates/{code}/render`).
pub struct HttpTemplateRenderer {
    http_client: Client,
    base_url: String,
}

impl HttpTemplateRenderer {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, Error> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))?;

        info!(base_url, "Template service client initialized");

        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl TemplateRenderer for HttpTemplateRenderer {
    async fn render(
        &self,
        template_code: &str,
        channel: Channel,
        variables: &HashMap<String, String>,
    ) -> Result<RenderedContent, DispatchError> {
        let url = format!("{}/api/v1/templates/{}/render", self.base_url, template_code);

        debug!(
            template_code,
            variable_count = variables.len(),
            "Rendering template"
        );

        let response = self
            .http_client
            .post(&url)
            .json(&RenderRequest { channel, variables })
            .send()
            .await
            .map_err(|e| DispatchError::Upstream(format!("Template service unreachable: {}", e)))?;

        match response.status() {
            status if status.is_success() => {
                let body: ApiResponse<RenderedContent> = response.json().await.map_err(|e| {
                    DispatchError::Upstream(format!("Invalid template service response: {}", e))
                })?;

                body.data.ok_or_else(|| {
                    DispatchError::Render(format!("Template {} rendered no content", template_code))
                })
            }
            StatusCode::NOT_FOUND => Err(DispatchError::TemplateNotFound(template_code.to_string())),
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
                let detail = response.text().await.unwrap_or_default();
                warn!(template_code, detail = %detail, "Template render rejected");
                Err(DispatchError::Render(format!(
                    "Template {} could not be rendered: {}",
                    template_code, detail
                )))
            }
            status => Err(DispatchError::Upstream(format!(
                "Template service returned status {}",
                status
            ))),
        }
    }
}
