pub mod circuit_breaker;
pub mod console;
pub mod database;
pub mod fcm;
pub mod health;
pub mod memory;
pub mod rbmq;
pub mod redis;
pub mod sendgrid;
pub mod template;
pub mod user;
