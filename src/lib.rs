pub mod config;
pub mod constants;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod schema;

pub mod idempotency;

// Domain data shapes shared across stages
pub mod domain;
