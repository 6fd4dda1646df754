//! Network seam between the client and the marketplace API
//!
//! `Transport` sends one already-authorized `RequestDescriptor` and returns
//! whatever the server answered, including error statuses. Classification and
//! recovery happen above this layer. `HttpTransport` is the reqwest
//! implementation; tests substitute scripted transports.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument};

use crate::error::{ClientError, Result};
use crate::request::RequestDescriptor;

/// A fully read response.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ApiResponse {
    /// Decode the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body)
            .map_err(|e| ClientError::Decode(format!("expected JSON body: {e}")))
    }

    /// Body as text, lossily decoded.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Sends a request and returns the raw response.
///
/// Uses `Pin<Box<dyn Future>>` so the client can hold an `Arc<dyn Transport>`.
/// Only failures without a response are errors; a 4xx/5xx is `Ok`.
pub trait Transport: Send + Sync {
    fn execute<'a>(
        &'a self,
        request: &'a RequestDescriptor,
    ) -> Pin<Box<dyn Future<Output = Result<ApiResponse>> + Send + 'a>>;
}

/// reqwest-backed transport rooted at the API base URL.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            timeout,
        }
    }

    #[instrument(skip_all, fields(request_id = %request.id(), method = %request.method(), path = %request.path()))]
    async fn send(&self, request: &RequestDescriptor) -> Result<ApiResponse> {
        let url = market_auth::endpoint(&self.base_url, request.path());

        let mut builder = self
            .client
            .request(request.method().clone(), &url)
            .headers(request.headers().clone())
            .timeout(self.timeout);
        if !request.query_pairs().is_empty() {
            builder = builder.query(request.query_pairs());
        }
        if let Some(body) = request.body_bytes() {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ClientError::Transport(format!("timed out after {:?}", self.timeout))
            } else {
                ClientError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| ClientError::Transport(format!("reading response body: {e}")))?;

        debug!(%status, bytes = body.len(), "response received");
        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }
}

impl Transport for HttpTransport {
    fn execute<'a>(
        &'a self,
        request: &'a RequestDescriptor,
    ) -> Pin<Box<dyn Future<Output = Result<ApiResponse>> + Send + 'a>> {
        Box::pin(self.send(request))
    }
}
