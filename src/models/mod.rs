pub mod circuit_breaker;
pub mod fcm;
pub mod health;
pub mod message;
pub mod record;
pub mod request;
pub mod response;
pub mod retry;
pub mod sendgrid;
pub mod status;
pub mod template;
pub mod user;
pub mod validation;
