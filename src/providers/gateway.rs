//! WebSocket JSON-RPC client for the OpenClaw gateway (C6 fallback path).
//!
//! Wire shape pinned per SPEC_FULL.md §9: a minimal JSON-RPC 2.0 envelope.
//! Methods used: `config.get`, `config.apply`, `agent`. This is a *client*
//! of an external process — unlike the teacher's `ipc/mod.rs`, which is the
//! daemon's own RPC *server* for UI clients.

use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_tungstenite::tungstenite::Message;

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[allow(dead_code)]
    jsonrpc: Option<String>,
    id: Option<u64>,
    result: Option<Value>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

pub struct GatewayClient {
    url: String,
    next_id: AtomicU64,
}

impl GatewayClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Opens a fresh connection, sends one request, reads the matching
    /// response, and closes. Gateway calls in this system are one-shot —
    /// there's no long-lived subscription model to keep alive between
    /// invocations.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let (mut socket, _) = tokio_tungstenite::connect_async(&self.url)
            .await
            .with_context(|| format!("failed to connect to gateway at {}", self.url))?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = RpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params,
        };
        let body = serde_json::to_string(&request)?;
        socket.send(Message::Text(body)).await?;

        while let Some(msg) = socket.next().await {
            let msg = msg.context("gateway websocket error")?;
            let Message::Text(text) = msg else {
                continue;
            };
            let response: RpcResponse =
                serde_json::from_str(&text).context("malformed gateway JSON-RPC response")?;
            if response.id != Some(id) {
                continue;
            }
            if let Some(error) = response.error {
                bail!("gateway RPC error {}: {}", error.code, error.message);
            }
            let _ = socket.close(None).await;
            return response
                .result
                .ok_or_else(|| anyhow::anyhow!("gateway response missing both result and error"));
        }

        bail!("gateway closed the connection before responding")
    }

    pub async fn config_get(&self, agent_id: &str) -> Result<Value> {
        self.call("config.get", serde_json::json!({ "agentId": agent_id }))
            .await
    }

    pub async fn config_apply(&self, agent_id: &str, config: Value) -> Result<Value> {
        self.call(
            "config.apply",
            serde_json::json!({ "agentId": agent_id, "config": config }),
        )
        .await
    }

    /// The fallback invocation path used when the provider CLI is absent
    /// (`ProviderCommandNotFoundError`, §4.7 policy 3).
    pub async fn agent(&self, agent_id: &str, message: &str, cwd: &str) -> Result<Value> {
        self.call(
            "agent",
            serde_json::json!({ "agentId": agent_id, "message": message, "cwd": cwd }),
        )
        .await
    }

    /// Used by the executor's `UvCwdFailure` recovery policy (§4.7 policy 1)
    /// — not itself a gateway RPC call, but issued via the same CLI the
    /// adapter otherwise spawns, since `openclaw gateway restart` is a
    /// process-management command rather than a session RPC.
    pub async fn restart_via_cli(openclaw_cmd: &str, home: &std::path::Path) -> Result<()> {
        let status = tokio::process::Command::new(openclaw_cmd)
            .args(["gateway", "restart", "--json"])
            .current_dir(home)
            .status()
            .await
            .with_context(|| format!("failed to run `{openclaw_cmd} gateway restart --json`"))?;
        if !status.success() {
            bail!("gateway restart exited with {status}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serialises_to_jsonrpc_2_envelope() {
        let req = RpcRequest {
            jsonrpc: "2.0",
            id: 1,
            method: "config.get",
            params: serde_json::json!({ "agentId": "ceo" }),
        };
        let value: Value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["method"], "config.get");
    }
}
