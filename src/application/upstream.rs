//! Forwarding seam between the decision engine and the backend.

use std::error::Error as StdError;

use async_trait::async_trait;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use bytes::Bytes;
use thiserror::Error;

pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Inbound request as seen by the proxy, body fully buffered.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ProxyRequest {
    pub fn path(&self) -> &str {
        self.uri.path()
    }
}

/// Backend response, body fully buffered.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("request to `{target}` failed")]
    Request {
        target: String,
        #[source]
        source: BoxError,
    },
    #[error("failed to read response body from `{target}`")]
    Body {
        target: String,
        #[source]
        source: BoxError,
    },
}

/// Performs the upstream call for a cache miss.
///
/// Implementations forward method, headers and body unchanged apart from the
/// backend address, and never retry.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn forward(&self, request: ProxyRequest) -> Result<UpstreamResponse, UpstreamError>;
}
