//! Transports that carry outbound calls to platform APIs

mod http;

pub use self::http::HttpTransport;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::Result;

/// One outbound HTTP-like request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransportRequest {
    /// HTTP method (`GET`, `POST`, ...)
    pub method: String,
    /// Absolute URL
    pub url: String,
    /// Request headers
    pub headers: HashMap<String, String>,
    /// JSON body
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

/// Response of a successful request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransportResponse {
    /// Status code (2xx)
    pub status: u16,
    /// Response headers, lowercase names
    pub headers: HashMap<String, String>,
    /// Raw body
    pub body: String,
}

impl TransportResponse {
    /// Decode the body as JSON
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(&self.body)?)
    }
}

/// Transport trait for outbound calls.
///
/// Implementations return `Err` for every failed call, including non-2xx
/// answers, so the retry classifier sees one error type.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and wait for the response
    async fn send(&self, request: &TransportRequest) -> Result<TransportResponse>;
}
