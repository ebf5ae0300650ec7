pub mod config;
pub mod context;
pub mod error;
pub mod idempotency;
pub mod logging;
pub mod problem;
pub mod scope;
