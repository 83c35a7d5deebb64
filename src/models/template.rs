use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::models::request::Channel;

#[derive(Debug, Clone, Serialize)]
pub struct RenderRequest<'a> {
    pub channel: Channel,
    pub variables: &'a HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderedContent {
    #[serde(default)]
    pub subject: Option<String>,
    pub body: String,
}
