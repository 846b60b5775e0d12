//! HTTP forwarding to the configured backend.

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderName, Uri, header};
use reqwest::{Client, redirect};
use tracing::debug;
use url::Url;

use crate::application::upstream::{ProxyRequest, Upstream, UpstreamError, UpstreamResponse};
use crate::config::UpstreamSettings;

use super::error::InfraError;

pub struct HttpUpstream {
    client: Client,
    base: Url,
}

impl HttpUpstream {
    pub fn new(settings: &UpstreamSettings) -> Result<Self, InfraError> {
        let client = Client::builder()
            .timeout(settings.timeout)
            .redirect(redirect::Policy::none())
            .build()
            .map_err(|err| {
                InfraError::configuration(format!("failed to build upstream client: {err}"))
            })?;
        Ok(Self {
            client,
            base: settings.url.clone(),
        })
    }

    /// Backend scheme, host and port with the inbound path and query.
    ///
    /// Any path on the configured backend URL is ignored.
    pub fn target_url(&self, uri: &Uri) -> Url {
        let mut target = self.base.clone();
        target.set_path(uri.path());
        target.set_query(uri.query());
        target.set_fragment(None);
        target
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn forward(&self, request: ProxyRequest) -> Result<UpstreamResponse, UpstreamError> {
        let target = self.target_url(&request.uri);
        debug!(
            target = "infra::upstream",
            method = %request.method,
            url = %target,
            "forwarding request"
        );

        let mut headers = request.headers;
        strip_hop_by_hop(&mut headers);
        headers.remove(header::HOST);
        headers.remove(header::CONTENT_LENGTH);

        let response = self
            .client
            .request(request.method, target.clone())
            .headers(headers)
            .body(request.body)
            .send()
            .await
            .map_err(|err| UpstreamError::Request {
                target: target.to_string(),
                source: Box::new(err),
            })?;

        let status = response.status();
        let mut headers = response.headers().clone();
        strip_hop_by_hop(&mut headers);

        let body = response.bytes().await.map_err(|err| UpstreamError::Body {
            target: target.to_string(),
            source: Box::new(err),
        })?;

        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }
}

fn is_hop_by_hop_header(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailer"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Remove hop-by-hop headers, including any named by `Connection`.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|token| HeaderName::try_from(token.trim()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }

    let hop: Vec<HeaderName> = headers
        .keys()
        .filter(|name| is_hop_by_hop_header(name))
        .cloned()
        .collect();
    for name in hop {
        headers.remove(name);
    }
}
