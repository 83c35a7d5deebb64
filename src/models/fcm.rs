use std::collections::HashMap;

use serde::Serialize;

/// Body of `POST /v1/projects/{project}/messages:send`.
#[derive(Debug, Clone, Serialize)]
pub struct FcmRequest {
    pub message: FcmMessage,
}

#[derive(Debug, Clone, Serialize)]
pub struct FcmMessage {
    pub token: String,
    pub notification: FcmNotification,
    pub data: HashMap<String, String>,
    pub android: FcmAndroidConfig,
    pub apns: FcmApnsConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct FcmNotification {
    pub title: String,
    pub body: String,
}

/// Repeated sends with the same collapse key replace each other on the device.
#[derive(Debug, Clone, Serialize)]
pub struct FcmAndroidConfig {
    pub collapse_key: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FcmApnsConfig {
    pub headers: HashMap<String, String>,
}
