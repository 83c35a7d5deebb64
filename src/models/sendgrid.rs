use std::collections::HashMap;

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct SendGridMail {
    pub personalizations: Vec<SendGridPersonalization>,
    pub from: SendGridAddress,
    pub subject: String,
    pub content: Vec<SendGridContent>,
    pub custom_args: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SendGridPersonalization {
    pub to: Vec<SendGridAddress>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SendGridAddress {
    pub email: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SendGridContent {
    #[serde(rename = "type")]
    pub content_type: String,
    pub value: String,
}
