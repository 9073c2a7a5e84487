use anyhow::{Context, Result};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use std::time::Duration;

/// JSON-RPC error object, kept verbatim. The simulation flows *expect*
/// reverts, so the `data` payload must survive intact.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

impl RpcErrorObject {
    pub fn data_hex(&self) -> Option<&str> {
        self.data.as_ref().and_then(Value::as_str)
    }
}

/// One JSON-RPC reply: either `result` or `error` is present.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RpcReply {
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcErrorObject>,
}

impl RpcReply {
    pub fn from_result(result: Value) -> Self {
        Self {
            result: Some(result),
            error: None,
        }
    }

    pub fn from_error(code: i64, message: &str, data: Option<Value>) -> Self {
        Self {
            result: None,
            error: Some(RpcErrorObject {
                code,
                message: message.to_string(),
                data,
            }),
        }
    }

    /// The `result` field of a call that is not allowed to fail.
    pub fn into_result(self, method: &str) -> Result<Value> {
        if let Some(err) = self.error {
            anyhow::bail!("{method} rpc error {}: {}", err.code, err.message);
        }
        self.result.with_context(|| format!("{method} missing result field"))
    }
}

/// Seam over the upstream node so tests can substitute canned replies.
pub trait EthRpc: Send + Sync {
    fn request(
        &self,
        method: &str,
        params: Value,
    ) -> impl Future<Output = Result<RpcReply>> + Send;
}

#[derive(Clone)]
pub struct RpcClient {
    url: Arc<String>,
    http: reqwest::Client,
    next_id: Arc<AtomicU64>,
}

impl RpcClient {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        if url.trim().is_empty() {
            anyhow::bail!("ethereum node url must not be empty");
        }
        let http = reqwest::ClientBuilder::new()
            .timeout(timeout)
            .build()
            .context("build reqwest client")?;

        Ok(Self {
            url: Arc::new(url.to_string()),
            http,
            next_id: Arc::new(AtomicU64::new(1)),
        })
    }
}

impl EthRpc for RpcClient {
    async fn request(&self, method: &str, params: Value) -> Result<RpcReply> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let resp = self
            .http
            .post(self.url.as_str())
            .json(&body)
            .send()
            .await
            .with_context(|| format!("{method} POST {}", self.url))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .with_context(|| format!("{method} read body"))?;
        if status != StatusCode::OK {
            anyhow::bail!("{method} http status={} body={}", status.as_u16(), text);
        }

        serde_json::from_str(&text).with_context(|| format!("{method} parse json"))
    }
}

pub fn format_quantity(value: u64) -> String {
    format!("0x{value:x}")
}

pub fn parse_quantity_u64(v: &Value) -> Result<u64> {
    match v {
        Value::String(s) => {
            let hex = strip_quantity_prefix(s)?;
            u64::from_str_radix(hex, 16).with_context(|| format!("invalid hex quantity: {s}"))
        }
        Value::Number(n) => n
            .as_u64()
            .context("quantity number not representable as u64"),
        other => anyhow::bail!("unexpected quantity json type: {other}"),
    }
}

pub fn parse_quantity_u128(v: &Value) -> Result<u128> {
    match v {
        Value::String(s) => {
            let hex = strip_quantity_prefix(s)?;
            u128::from_str_radix(hex, 16).with_context(|| format!("invalid hex quantity: {s}"))
        }
        Value::Number(n) => n
            .as_u64()
            .map(u128::from)
            .context("quantity number not representable as u128"),
        other => anyhow::bail!("unexpected quantity json type: {other}"),
    }
}

fn strip_quantity_prefix(s: &str) -> Result<&str> {
    let trimmed = s.trim();
    let hex = trimmed
        .strip_prefix("0x")
        .with_context(|| format!("quantity missing 0x prefix: {trimmed}"))?;
    if hex.is_empty() {
        anyhow::bail!("invalid hex quantity: {trimmed}");
    }
    Ok(hex)
}
