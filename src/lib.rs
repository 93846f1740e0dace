pub mod config;
pub mod error;
pub mod gateway;
pub mod idempotency;
pub mod observability;
