pub mod admission;
pub mod api;
pub mod circuit_breaker;
pub mod clients;
pub mod collaborators;
pub mod config;
pub mod dead_letter;
pub mod error;
pub mod idempotency;
pub mod models;
pub mod queue;
pub mod reconcile;
pub mod records;
pub mod retry;
pub mod runtime;
pub mod telemetry;
pub mod utils;
pub mod worker;
