//! HTTP transport on `reqwest`

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method};
use tracing::debug;

use super::{Transport, TransportRequest, TransportResponse};
use crate::{Error, Result};

/// Longest error body echoed into an error message
const MAX_ERROR_BODY: usize = 512;

/// HTTP transport backed by a pooled `reqwest` client
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Create a new HTTP transport with a per-request timeout
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(30))
            .tcp_nodelay(true)
            .redirect(reqwest::redirect::Policy::limited(5))
            .user_agent(concat!("outbound-guard/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    /// Wrap an existing client
    #[must_use]
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &TransportRequest) -> Result<TransportResponse> {
        let method = Method::from_bytes(request.method.to_uppercase().as_bytes())
            .map_err(|_| Error::transport(format!("invalid HTTP method '{}'", request.method)))?;

        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(payload) = &request.payload {
            builder = builder.json(payload);
        }

        debug!(method = %request.method, url = %request.url, "Sending request");

        let response = builder.send().await.map_err(describe_send_error)?;
        let status = response.status();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| Some((k.as_str().to_string(), v.to_str().ok()?.to_string())))
            .collect::<HashMap<_, _>>();
        let body = response.text().await.map_err(describe_send_error)?;

        if !status.is_success() {
            let reason = status.canonical_reason().unwrap_or("Unknown status");
            let detail: String = body.chars().take(MAX_ERROR_BODY).collect();
            return Err(Error::transport_status(
                status.as_u16(),
                if detail.is_empty() {
                    reason.to_string()
                } else {
                    format!("{reason}: {detail}")
                },
            ));
        }

        Ok(TransportResponse {
            status: status.as_u16(),
            headers,
            body,
        })
    }
}

/// Map a client-side failure to a transport error whose message names the
/// failure kind
fn describe_send_error(e: reqwest::Error) -> Error {
    let kind = if e.is_timeout() {
        "timeout"
    } else if e.is_connect() {
        "connection failed"
    } else if e.is_request() || e.is_body() {
        "network error"
    } else {
        "request failed"
    };
    Error::Transport {
        status: e.status().map(|s| s.as_u16()),
        message: format!("{kind}: {e}"),
    }
}
