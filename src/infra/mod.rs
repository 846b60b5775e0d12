//! Infrastructure adapters and runtime bootstrap.

pub mod error;
pub mod http;
pub mod redis;
pub mod telemetry;
pub mod upstream;
