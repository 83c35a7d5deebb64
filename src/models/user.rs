use serde::{Deserialize, Serialize};

use crate::models::request::Channel;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: String,

    #[serde(default)]
    pub contact_address: Option<String>,

    #[serde(default)]
    pub push_token: Option<String>,

    #[serde(default = "enabled")]
    pub email_enabled: bool,

    #[serde(default = "enabled")]
    pub push_enabled: bool,
}

impl UserProfile {
    pub fn accepts(&self, channel: Channel) -> bool {
        match channel {
            Channel::Email => self.email_enabled,
            Channel::Push => self.push_enabled,
        }
    }
}

fn enabled() -> bool {
    true
}
