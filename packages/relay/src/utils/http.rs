// packages/relay/src/utils/http.rs
//! Shared HTTPS client
//!
//! Both the collector client and the coordination-service lock POST small
//! JSON bodies; they share one connection pool built here.

use crate::utils::errors::{PipelineError, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use hyper::{Method, Request, StatusCode};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tracing::trace;

/// Pooled HTTP/HTTPS client
pub type HttpClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

/// Response status and collected body
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub body: Bytes,
}

impl HttpResponse {
    /// Body as lossy UTF-8, truncated for log and error messages
    pub fn body_snippet(&self) -> String {
        const MAX: usize = 512;
        let text = String::from_utf8_lossy(&self.body);
        if text.len() <= MAX {
            text.into_owned()
        } else {
            let mut end = MAX;
            while !text.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}...", &text[..end])
        }
    }
}

/// Build the shared client (TLS via rustls with webpki roots)
pub fn build_client() -> Result<HttpClient> {
    let https = HttpsConnectorBuilder::new()
        .with_provider_and_webpki_roots(rustls::crypto::ring::default_provider())
        .map_err(|e| PipelineError::InvalidConfig(format!("TLS setup failed: {}", e)))?
        .https_or_http()
        .enable_http1()
        .build();

    Ok(Client::builder(TokioExecutor::new()).build(https))
}

/// POST a JSON body, optionally with a bearer token, bounded by `timeout`
pub async fn post_json(
    client: &HttpClient,
    url: &str,
    token: Option<&str>,
    body: Vec<u8>,
    timeout: Duration,
) -> Result<HttpResponse> {
    let mut request = Request::builder()
        .method(Method::POST)
        .uri(url)
        .header(CONTENT_TYPE, "application/json")
        .header(USER_AGENT, concat!("event-relay/", env!("CARGO_PKG_VERSION")));

    if let Some(token) = token {
        request = request.header(AUTHORIZATION, format!("Bearer {}", token));
    }

    let request = request
        .body(Full::new(Bytes::from(body)))
        .map_err(|e| PipelineError::DeliveryFailed(format!("Invalid request: {}", e)))?;

    let exchange = async {
        let response = client
            .request(request)
            .await
            .map_err(|e| PipelineError::DeliveryFailed(e.to_string()))?;

        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| PipelineError::DeliveryFailed(format!("Failed to read body: {}", e)))?
            .to_bytes();

        Ok::<_, PipelineError>(HttpResponse { status, body })
    };

    let response = tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| PipelineError::Timeout(format!("POST {} after {:?}", url, timeout)))??;

    trace!(url, status = %response.status, "HTTP exchange complete");

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_body_snippet_truncates() {
        let response = HttpResponse {
            status: StatusCode::BAD_GATEWAY,
            body: Bytes::from("x".repeat(2000)),
        };
        let snippet = response.body_snippet();
        assert!(snippet.ends_with("..."));
        assert_eq!(snippet.len(), 515);
    }

    #[test]
    fn test_build_client() {
        assert!(build_client().is_ok());
    }
}
