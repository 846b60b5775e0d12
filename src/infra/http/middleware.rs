use std::time::Instant;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    middleware::Next,
    response::Response,
};
use metrics::counter;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::application::{engine::CacheStatus, error::ErrorReport};

pub const METRIC_HTTP_REQUESTS: &str = "http_requests_total";

#[derive(Clone)]
pub struct RequestContext {
    pub request_id: String,
}

pub async fn set_request_context(mut request: Request<Body>, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();
    let ctx = RequestContext {
        request_id: request_id.clone(),
    };
    request.extensions_mut().insert(ctx.clone());

    let mut response = next.run(request).await;
    response.extensions_mut().insert(ctx);
    response
}

pub async fn log_responses(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();

    let request_id = request
        .extensions()
        .get::<RequestContext>()
        .map(|ctx| ctx.request_id.clone())
        .unwrap_or_default();

    let mut response = next.run(request).await;
    let status = response.status();
    let elapsed_ms = start.elapsed().as_millis();

    if status.is_client_error() || status.is_server_error() {
        let report = response.extensions_mut().remove::<ErrorReport>();
        let (source, messages) = match report {
            Some(report) => (report.source, report.messages),
            None => ("upstream", Vec::new()),
        };
        let detail = messages
            .first()
            .cloned()
            .unwrap_or_else(|| "status returned by upstream".to_string());

        if status.is_server_error() {
            error!(
                target = "cacher::http::response",
                status = status.as_u16(),
                method = %method,
                path = %uri.path(),
                elapsed_ms = elapsed_ms,
                source = source,
                detail = %detail,
                chain = ?messages,
                request_id = request_id,
                "request failed",
            );
        } else {
            warn!(
                target = "cacher::http::response",
                status = status.as_u16(),
                method = %method,
                path = %uri.path(),
                elapsed_ms = elapsed_ms,
                source = source,
                detail = %detail,
                chain = ?messages,
                request_id = request_id,
                "client request error",
            );
        }
    } else {
        let cache = match response.extensions().get::<CacheStatus>() {
            Some(CacheStatus::Hit) => "hit",
            Some(CacheStatus::Miss) => "miss",
            None => "none",
        };
        debug!(
            target = "cacher::http::response",
            status = status.as_u16(),
            method = %method,
            path = %uri.path(),
            elapsed_ms = elapsed_ms,
            cache = cache,
            request_id = request_id,
            "request served",
        );
    }

    response
}

/// Count every request by method and path. Requests the proxy rejected
/// before classification share a fixed label value per reason.
pub async fn count_requests(request: Request<Body>, next: Next) -> Response {
    let method = request.method().as_str().to_string();
    let path = request.uri().path().to_string();

    let response = next.run(request).await;

    let rejected = response
        .extensions()
        .get::<ErrorReport>()
        .and_then(|report| rejected_endpoint(report.status));
    let endpoint = match rejected {
        Some(label) => label.to_string(),
        None => path,
    };
    counter!(METRIC_HTTP_REQUESTS, "method" => method, "endpoint" => endpoint).increment(1);
    response
}

fn rejected_endpoint(status: StatusCode) -> Option<&'static str> {
    match status {
        StatusCode::UNAUTHORIZED => Some("unauthenticated"),
        StatusCode::NOT_FOUND => Some("unmatched"),
        _ => None,
    }
}
