//! Request/response plumbing shared by the catalog, order and payment clients.
//!
//! Every remote call goes through a [`Transport`]; [`ResilientClient`] layers
//! retry, circuit breaking and a fallback route on top of one or two of them.

pub mod http;
pub mod resilient;

use async_trait::async_trait;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::errors::ServiceError;

pub use self::http::HttpTransport;
pub use self::resilient::{ResilientClient, RetryPolicy};

/// Header carrying the caller-generated idempotency key.
pub const IDEMPOTENCY_HEADER: &str = "X-Idempotency-Key";

/// A JSON API call, independent of the HTTP client that performs it.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    /// Path relative to the API base URL, e.g. `/products/42`.
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
    pub idempotency_key: Option<String>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            idempotency_key: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::POST, path).with_body(body)
    }

    pub fn patch(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::PATCH, path).with_body(body)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Safe to send more than once: reads, and writes the server can deduplicate.
    pub fn is_idempotent(&self) -> bool {
        self.method == Method::GET || self.idempotency_key.is_some()
    }

    /// Same payload and idempotency key, sent to a different route.
    pub fn rerouted(&self, method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            ..self.clone()
        }
    }
}

/// A successful (2xx) response with its JSON body. Empty bodies decode as `null`.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    pub fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ServiceError> {
        Ok(serde_json::from_value(self.body.clone())?)
    }

    /// The payload, unwrapped from a `{ "data": ... }` envelope when present.
    pub fn data(&self) -> &Value {
        match self.body.get("data") {
            Some(inner) if !inner.is_null() => inner,
            _ => &self.body,
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Performs one attempt. Non-2xx answers come back as `ProviderError`.
    async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse, ServiceError>;
}

/// Pulls the human-readable error text out of a provider response body.
pub(crate) fn provider_message(body: &Value) -> Option<String> {
    const KEYS: [&str; 6] = [
        "message",
        "errorMessage",
        "ResultDesc",
        "resultDesc",
        "error_description",
        "error",
    ];

    for key in KEYS {
        match body.get(key) {
            Some(Value::String(text)) if !text.trim().is_empty() => {
                return Some(text.trim().to_string())
            }
            Some(nested @ Value::Object(_)) => {
                if let Some(text) = provider_message(nested) {
                    return Some(text);
                }
            }
            _ => {}
        }
    }
    body.get("data").and_then(provider_message)
}
