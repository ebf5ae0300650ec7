pub mod correlation;
pub mod idempotency;
pub mod problem;
pub mod request_logging;
