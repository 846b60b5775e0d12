//! Application services: the proxy decision engine and its seams.

pub mod engine;
pub mod error;
pub mod upstream;
