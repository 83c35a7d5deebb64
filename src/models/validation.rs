use crate::{error::DispatchError, models::request::NotificationRequest};

const MAX_REQUEST_ID_LEN: usize = 255;

pub fn validate_request(request: &NotificationRequest) -> Result<(), DispatchError> {
    if request.request_id.trim().is_empty() {
        return Err(DispatchError::Validation("request_id is required".to_string()));
    }

    if request.request_id.len() > MAX_REQUEST_ID_LEN {
        return Err(DispatchError::Validation(format!(
            "request_id too long (maximum {} characters)",
            MAX_REQUEST_ID_LEN
        )));
    }

    if request.user_id.trim().is_empty() {
        return Err(DispatchError::Validation("user_id is required".to_string()));
    }

    if request.template_code.trim().is_empty() {
        return Err(DispatchError::Validation("template_code is required".to_string()));
    }

    if request.variables.keys().any(|key| key.trim().is_empty()) {
        return Err(DispatchError::Validation(
            "variable names cannot be empty".to_string(),
        ));
    }

    Ok(())
}

pub fn validate_push_token(token: &str) -> Result<(), DispatchError> {
    if token.is_empty() {
        return Err(DispatchError::InvalidRecipient(
            "Device token cannot be empty".to_string(),
        ));
    }

    if token.len() < 20 {
        return Err(DispatchError::InvalidRecipient(
            "Device token too short (minimum 20 characters)".to_string(),
        ));
    }

    if token.len() > 200 {
        return Err(DispatchError::InvalidRecipient(
            "Device token too long (maximum 200 characters)".to_string(),
        ));
    }

    let valid_chars = token
        .chars()
        .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == ':' || c == '.');

    if !valid_chars {
        return Err(DispatchError::InvalidRecipient(
            "Device token contains invalid characters".to_string(),
        ));
    }

    Ok(())
}

pub fn validate_email_address(address: &str) -> Result<(), DispatchError> {
    let Some((local, domain)) = address.split_once('@') else {
        return Err(DispatchError::InvalidRecipient(format!(
            "'{}' is not an email address",
            address
        )));
    };

    if local.is_empty() || domain.is_empty() || !domain.contains('.') {
        return Err(DispatchError::InvalidRecipient(format!(
            "'{}' is not an email address",
            address
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::request::Channel;

    #[test]
    fn rejects_missing_fields() {
        let request = NotificationRequest::new("", "user-1", Channel::Email, "welcome");
        assert!(matches!(
            validate_request(&request),
            Err(DispatchError::Validation(_))
        ));

        let request = NotificationRequest::new("r1", "user-1", Channel::Push, " ");
        assert!(validate_request(&request).is_err());
    }

    #[test]
    fn push_tokens_are_checked() {
        assert!(validate_push_token("short").is_err());
        assert!(validate_push_token("fcm-token:APA91bH_abcdefghijklmnop").is_ok());
        assert!(validate_push_token("token with spaces in it for sure").is_err());
    }

    #[test]
    fn email_addresses_are_checked() {
        assert!(validate_email_address("ada@example.com").is_ok());
        assert!(validate_email_address("ada.example.com").is_err());
        assert!(validate_email_address("ada@localhost").is_err());
    }
}
