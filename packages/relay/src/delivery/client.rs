// packages/relay/src/delivery/client.rs
//! Remote collector client
//!
//! The collector accepts `POST <url>` with `{"events": [...]}` and answers
//! any 2xx on success. Every other outcome is a retryable failure.

use crate::recording::event::Event;
use crate::utils::errors::{PipelineError, Result};
use crate::utils::http::{self, HttpClient};
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

/// Destination for delivered batches
#[async_trait]
pub trait Collector: Send + Sync {
    /// Deliver one batch; `Ok` only when the collector accepted all of it
    async fn send(&self, events: &[Event]) -> Result<()>;
}

#[derive(Serialize)]
struct BatchBody<'a> {
    events: &'a [Event],
}

/// Collector reached over HTTP(S) with optional bearer auth
pub struct HttpCollector {
    client: HttpClient,
    url: String,
    token: Option<String>,
    timeout: Duration,
}

impl HttpCollector {
    pub fn new(client: HttpClient, url: impl Into<String>, token: Option<String>, timeout: Duration) -> Self {
        Self {
            client,
            url: url.into(),
            token,
            timeout,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Collector for HttpCollector {
    async fn send(&self, events: &[Event]) -> Result<()> {
        let body = serde_json::to_vec(&BatchBody { events })?;
        let response =
            http::post_json(&self.client, &self.url, self.token.as_deref(), body, self.timeout).await?;

        if !response.status.is_success() {
            return Err(PipelineError::CollectorRejected {
                status: response.status.as_u16(),
                body: response.body_snippet(),
            });
        }

        debug!(count = events.len(), status = %response.status, "Collector accepted batch");
        Ok(())
    }
}
