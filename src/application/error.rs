use std::error::Error as StdError;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::{cache::ClassifyError, config::LoadError, infra::error::InfraError};

use super::upstream::UpstreamError;

/// Diagnostic attached to error responses for the logging middleware.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub source: &'static str,
    pub status: StatusCode,
    pub messages: Vec<String>,
}

impl ErrorReport {
    pub fn from_error(source: &'static str, status: StatusCode, error: &dyn StdError) -> Self {
        let mut messages = vec![error.to_string()];
        let mut current = error.source();
        while let Some(inner) = current {
            messages.push(inner.to_string());
            current = inner.source();
        }
        Self {
            source,
            status,
            messages,
        }
    }

    pub fn attach(self, response: &mut Response) {
        response.extensions_mut().insert(self);
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
}

/// Failures visible to the caller. Store failures never appear here.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("partner id or authorization header missing")]
    Unauthorized,
    #[error(transparent)]
    UnknownResource(#[from] ClassifyError),
    #[error("request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },
    #[error("failed to read request body")]
    RequestBody(#[source] axum::Error),
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::UnknownResource(_) => StatusCode::NOT_FOUND,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::RequestBody(_) => StatusCode::BAD_REQUEST,
            Self::Upstream(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn public_message(&self) -> &'static str {
        match self {
            Self::Unauthorized => "Authentication credentials were not provided.",
            Self::UnknownResource(_) => "Resource not found.",
            Self::PayloadTooLarge { .. } => "Request body too large.",
            Self::RequestBody(_) => "Failed to read request body.",
            Self::Upstream(UpstreamError::Request { .. }) => {
                "Failed to make request to remote server."
            }
            Self::Upstream(UpstreamError::Body { .. }) => "Failed to read response body.",
        }
    }

    fn source_label(&self) -> &'static str {
        match self {
            Self::Unauthorized => "application::engine::authenticate",
            Self::UnknownResource(_) => "application::engine::derive_key",
            Self::PayloadTooLarge { .. } | Self::RequestBody(_) => "infra::http::proxy",
            Self::Upstream(_) => "application::engine::forward",
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        let report = ErrorReport::from_error(self.source_label(), status, &self);
        let mut response = (
            status,
            Json(ErrorBody {
                error: self.public_message(),
            }),
        )
            .into_response();
        report.attach(&mut response);
        response
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("failed to load configuration: {0}")]
    Config(#[from] LoadError),
    #[error(transparent)]
    Infra(#[from] InfraError),
}
