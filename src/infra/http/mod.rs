mod middleware;

pub use middleware::{METRIC_HTTP_REQUESTS, RequestContext};

use std::sync::Arc;

use axum::{
    Router,
    body::{Body, to_bytes},
    extract::State,
    http::{Request, StatusCode, header},
    middleware::from_fn,
    response::{IntoResponse, Response},
    routing::get,
};
use http_body_util::LengthLimitError;
use metrics_exporter_prometheus::PrometheusHandle;

use crate::application::{
    engine::ProxyEngine, error::ProxyError, upstream::ProxyRequest,
};

use middleware::{count_requests, log_responses, set_request_context};

/// Prometheus exposition served next to the proxy.
#[derive(Clone)]
pub struct MetricsEndpoint {
    pub path: String,
    pub handle: PrometheusHandle,
}

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ProxyEngine>,
    pub metrics: Option<MetricsEndpoint>,
    pub max_request_bytes: usize,
}

/// Every path not claimed by the metrics endpoint goes to the proxy.
pub fn build_router(state: AppState) -> Router {
    let router = match &state.metrics {
        Some(metrics) => Router::new().route(&metrics.path, get(render_metrics)),
        None => Router::new(),
    };

    router
        .fallback(proxy)
        .with_state(state)
        .layer(from_fn(count_requests))
        .layer(from_fn(log_responses))
        .layer(from_fn(set_request_context))
}

async fn proxy(State(state): State<AppState>, request: Request<Body>) -> Response {
    let (parts, body) = request.into_parts();
    let admission = match state.engine.admit(&parts.headers, &parts.uri) {
        Ok(admission) => admission,
        Err(err) => return err.into_response(),
    };
    let limit = state.max_request_bytes;

    let body = match to_bytes(body, limit).await {
        Ok(body) => body,
        Err(err) => {
            let err = if is_length_limit(&err) {
                ProxyError::PayloadTooLarge { limit }
            } else {
                ProxyError::RequestBody(err)
            };
            return err.into_response();
        }
    };

    let request = ProxyRequest {
        method: parts.method,
        uri: parts.uri,
        headers: parts.headers,
        body,
    };

    match state.engine.serve(admission, request).await {
        Ok(response) => response.into_response(),
        Err(err) => err.into_response(),
    }
}

fn is_length_limit(err: &axum::Error) -> bool {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(inner) = current {
        if inner.is::<LengthLimitError>() {
            return true;
        }
        current = inner.source();
    }
    false
}

async fn render_metrics(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(metrics) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            metrics.handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
