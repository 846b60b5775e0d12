//! Caching reverse proxy for the back-office partner API.
//!
//! Partner requests for whitelisted resources are keyed by partner identity
//! and resource, answered from a shared store when possible, and forwarded
//! to the backend otherwise.

pub mod application;
pub mod cache;
pub mod config;
pub mod infra;
