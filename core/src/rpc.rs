//! JSON-RPC transport
//!
//! The network endpoint is reached through [`RpcTransport`]. A connected
//! wallet, an HTTP node and the in-process dev chain all implement it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Error)]
pub enum RpcError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("rpc error {code}: {message}")]
    Remote { code: i64, message: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl RpcError {
    pub fn method_not_found(method: &str) -> Self {
        RpcError::Remote {
            code: -32601,
            message: format!("method {} not found", method),
        }
    }
}

pub trait RpcTransport: Send + Sync {
    fn request<'a>(&'a self, method: &'a str, params: Value)
    -> BoxFuture<'a, Result<Value, RpcError>>;
}

/// Typed request helper.
pub async fn call<T: DeserializeOwned>(
    transport: &dyn RpcTransport,
    method: &str,
    params: Value,
) -> Result<T, RpcError> {
    let value = transport.request(method, params).await?;
    serde_json::from_value(value)
        .map_err(|e| RpcError::InvalidResponse(format!("{}: {}", method, e)))
}

/// Parse an Ethereum quantity (`"0x7a69"`, `"31337"` or a JSON number).
pub fn parse_quantity(value: &Value) -> Result<u64, RpcError> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| RpcError::InvalidResponse(format!("not a quantity: {}", n))),
        Value::String(s) => {
            let parsed = match s.strip_prefix("0x") {
                Some(hex) => u64::from_str_radix(hex, 16),
                None => s.parse(),
            };
            parsed.map_err(|_| RpcError::InvalidResponse(format!("not a quantity: {}", s)))
        }
        other => Err(RpcError::InvalidResponse(format!(
            "not a quantity: {}",
            other
        ))),
    }
}

// ============================================================================
// HTTP transport
// ============================================================================

#[derive(Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcErrorObject>,
}

#[derive(Deserialize)]
struct JsonRpcErrorObject {
    code: i64,
    message: String,
}

/// JSON-RPC 2.0 over HTTP POST.
pub struct HttpTransport {
    url: String,
    client: reqwest::Client,
    next_id: AtomicU64,
}

impl HttpTransport {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, RpcError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RpcError::Transport(e.to_string()))?;
        Ok(Self {
            url: url.into(),
            client,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn send(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };
        debug!("rpc {} -> {}", method, self.url);

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(RpcError::Transport(format!(
                "{} returned HTTP {}",
                self.url,
                response.status()
            )));
        }

        let body: JsonRpcResponse = response
            .json()
            .await
            .map_err(|e| RpcError::InvalidResponse(e.to_string()))?;

        if let Some(err) = body.error {
            return Err(RpcError::Remote {
                code: err.code,
                message: err.message,
            });
        }
        Ok(body.result.unwrap_or(Value::Null))
    }
}

impl RpcTransport for HttpTransport {
    fn request<'a>(
        &'a self,
        method: &'a str,
        params: Value,
    ) -> BoxFuture<'a, Result<Value, RpcError>> {
        Box::pin(self.send(method, params))
    }
}

// ============================================================================
// Connectors and provider sources
// ============================================================================

/// Opens a transport for an RPC URL.
pub trait Connector: Send + Sync {
    fn connect(&self, url: &str) -> Result<Arc<dyn RpcTransport>, RpcError>;
}

#[derive(Debug, Clone)]
pub struct HttpConnector {
    timeout: Duration,
}

impl HttpConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for HttpConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl Connector for HttpConnector {
    fn connect(&self, url: &str) -> Result<Arc<dyn RpcTransport>, RpcError> {
        Ok(Arc::new(HttpTransport::new(url, self.timeout)?))
    }
}

/// What the caller hands in: an endpoint URL or a live provider.
#[derive(Clone)]
pub enum ProviderSource {
    Url(String),
    Transport(Arc<dyn RpcTransport>),
}

impl std::fmt::Debug for ProviderSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderSource::Url(url) => f.debug_tuple("Url").field(url).finish(),
            ProviderSource::Transport(_) => f.write_str("Transport(..)"),
        }
    }
}

impl From<&str> for ProviderSource {
    fn from(url: &str) -> Self {
        ProviderSource::Url(url.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity(&json!("0x7a69")).unwrap(), 31337);
        assert_eq!(parse_quantity(&json!("31337")).unwrap(), 31337);
        assert_eq!(parse_quantity(&json!(11155111)).unwrap(), 11155111);
        assert!(parse_quantity(&json!("0xzz")).is_err());
        assert!(parse_quantity(&json!(null)).is_err());
    }

    #[test]
    fn test_request_envelope() {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id: 7,
            method: "eth_chainId",
            params: json!([]),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["id"], 7);
        assert_eq!(value["method"], "eth_chainId");
    }

    #[test]
    fn test_response_error_decoding() {
        let body: JsonRpcResponse = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": { "code": -32601, "message": "nope" }
        }))
        .unwrap();
        assert!(body.result.is_none());
        assert_eq!(body.error.map(|e| e.code), Some(-32601));
    }
}
