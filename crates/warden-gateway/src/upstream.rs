//! Upstream MCP server adapters.
//!
//! The gateway is a JSON-RPC client to each configured upstream. Every
//! stdio upstream owns one child process, one reader task draining its
//! stdout and completing waiters correlated by request id, and a writer
//! lock serializing frames onto its stdin. Timeouts are explicit on every
//! call; a timed-out waiter is removed so a late response is dropped by
//! the reader instead of leaking.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::error::GatewayError;
use crate::protocol::{JsonRpcMessage, PROTOCOL_VERSION};

/// One upstream server entry in `servers.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamServerConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// The `servers.json` document.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamFile {
    pub servers: Vec<UpstreamServerConfig>,
}

/// Transport-agnostic upstream client.
///
/// The gateway and its tests talk to upstreams exclusively through this
/// trait; the stdio implementation below is the production transport.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Sends a request and awaits the correlated response's `result`.
    async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, GatewayError>;

    /// Sends a notification (no response expected).
    async fn notify(&self, method: &str, params: Value) -> Result<(), GatewayError>;

    /// Terminates the transport.
    async fn shutdown(&self);
}

/// A running upstream with its routing metadata.
pub struct UpstreamHandle {
    pub server_id: String,
    pub name: String,
    pub client: Arc<dyn UpstreamClient>,
    /// Capabilities reported by the upstream's `initialize` result.
    pub capabilities: Value,
    degraded: AtomicBool,
}

impl UpstreamHandle {
    /// Wraps a client as a handle.
    pub fn new(
        server_id: impl Into<String>,
        name: impl Into<String>,
        client: Arc<dyn UpstreamClient>,
        capabilities: Value,
    ) -> Self {
        Self {
            server_id: server_id.into(),
            name: name.into(),
            client,
            capabilities,
            degraded: AtomicBool::new(false),
        }
    }

    /// True once a call against this upstream has failed.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Marks the upstream degraded.
    pub fn mark_degraded(&self) {
        if !self.degraded.swap(true, Ordering::Relaxed) {
            warn!(server = %self.name, "upstream marked degraded");
        }
    }
}

/// The set of live upstreams, keyed by server id.
#[derive(Default)]
pub struct UpstreamManager {
    servers: DashMap<String, Arc<UpstreamHandle>>,
}

impl UpstreamManager {
    /// Creates an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a handle.
    pub fn add(&self, handle: Arc<UpstreamHandle>) {
        self.servers.insert(handle.server_id.clone(), handle);
    }

    /// The handle for a server id.
    pub fn get(&self, server_id: &str) -> Option<Arc<UpstreamHandle>> {
        self.servers.get(server_id).map(|entry| entry.clone())
    }

    /// Every live handle.
    pub fn all(&self) -> Vec<Arc<UpstreamHandle>> {
        self.servers.iter().map(|entry| entry.clone()).collect()
    }

    /// Number of live upstreams.
    pub fn len(&self) -> usize {
        self.servers.len()
    }

    /// True when no upstream is registered.
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Shuts down every upstream.
    pub async fn stop_all(&self) {
        for entry in self.servers.iter() {
            entry.client.shutdown().await;
        }
        self.servers.clear();
        info!("all upstream servers stopped");
    }
}

/// Stdio transport to a child-process MCP server.
pub struct StdioUpstream {
    name: String,
    stdin: Mutex<ChildStdin>,
    child: Mutex<Option<Child>>,
    waiters: Arc<DashMap<u64, oneshot::Sender<JsonRpcMessage>>>,
    next_id: AtomicU64,
}

impl StdioUpstream {
    /// Spawns the configured process and starts its reader task.
    pub fn spawn(config: &UpstreamServerConfig) -> Result<Arc<Self>, GatewayError> {
        let mut command = Command::new(&config.command);
        command
            .args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(cwd) = &config.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().map_err(|source| GatewayError::UpstreamSpawn {
            name: config.name.clone(),
            source,
        })?;

        let stdin = child.stdin.take().ok_or_else(|| GatewayError::UpstreamIo {
            name: config.name.clone(),
            reason: "stdin unavailable".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| GatewayError::UpstreamIo {
            name: config.name.clone(),
            reason: "stdout unavailable".to_string(),
        })?;

        let upstream = Arc::new(Self {
            name: config.name.clone(),
            stdin: Mutex::new(stdin),
            child: Mutex::new(Some(child)),
            waiters: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
        });

        // Reader task: one per upstream, dispatching responses to
        // waiters by id. Non-response frames from the upstream are
        // logged and dropped.
        let waiters = upstream.waiters.clone();
        let name = config.name.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let Ok(message) = JsonRpcMessage::parse(&line) else {
                    warn!(server = %name, "unparseable frame from upstream");
                    continue;
                };
                if let Some(id) = message.id.as_ref().and_then(Value::as_u64) {
                    if let Some((_, waiter)) = waiters.remove(&id) {
                        let _ = waiter.send(message);
                        continue;
                    }
                }
                debug!(server = %name, method = ?message.method, "uncorrelated upstream frame dropped");
            }
            debug!(server = %name, "upstream reader finished");
        });

        info!(server = %config.name, command = %config.command, "upstream server started");
        Ok(upstream)
    }

    /// Performs the MCP handshake and returns the upstream's
    /// `initialize` result.
    pub async fn initialize(&self, timeout: Duration) -> Result<Value, GatewayError> {
        let result = self
            .request(
                "initialize",
                serde_json::json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {
                        "name": "mcp-warden",
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                }),
                timeout,
            )
            .await?;
        self.notify("notifications/initialized", Value::Object(Default::default()))
            .await?;
        info!(server = %self.name, "upstream initialized");
        Ok(result)
    }

    async fn write_frame(&self, frame: String) -> Result<(), GatewayError> {
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(frame.as_bytes())
            .await
            .map_err(|err| GatewayError::UpstreamIo {
                name: self.name.clone(),
                reason: err.to_string(),
            })?;
        stdin.flush().await.map_err(|err| GatewayError::UpstreamIo {
            name: self.name.clone(),
            reason: err.to_string(),
        })
    }
}

#[async_trait]
impl UpstreamClient for StdioUpstream {
    async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, GatewayError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();
        self.waiters.insert(id, sender);

        let frame = JsonRpcMessage::request(Value::from(id), method, params).to_frame();
        if let Err(err) = self.write_frame(frame).await {
            self.waiters.remove(&id);
            return Err(err);
        }

        let message = match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(message)) => message,
            Ok(Err(_)) => {
                return Err(GatewayError::UpstreamClosed {
                    name: self.name.clone(),
                })
            }
            Err(_) => {
                // Remove the waiter so the late response is dropped by
                // the reader instead of completing into nothing.
                self.waiters.remove(&id);
                return Err(GatewayError::UpstreamTimeout {
                    name: self.name.clone(),
                });
            }
        };

        if let Some(error) = message.error {
            return Err(GatewayError::UpstreamRpc {
                code: error.get("code").and_then(Value::as_i64).unwrap_or(-32603),
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("upstream error")
                    .to_string(),
            });
        }
        Ok(message.result.unwrap_or(Value::Null))
    }

    async fn notify(&self, method: &str, params: Value) -> Result<(), GatewayError> {
        self.write_frame(JsonRpcMessage::notification(method, params).to_frame())
            .await
    }

    async fn shutdown(&self) {
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.start_kill();
            let _ = child.wait().await;
            info!(server = %self.name, "upstream server stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_file_parse() {
        let raw = r#"{
            "servers": [
                {"name": "files", "command": "mcp-files", "args": ["--root", "/workspace"]},
                {"name": "web", "command": "mcp-web", "enabled": false, "env": {"TOKEN": "x"}}
            ]
        }"#;
        let file: UpstreamFile = serde_json::from_str(raw).unwrap();
        assert_eq!(file.servers.len(), 2);
        assert!(file.servers[0].enabled);
        assert!(!file.servers[1].enabled);
        assert_eq!(file.servers[1].env["TOKEN"], "x");
    }

    #[test]
    fn test_handle_degradation_latches() {
        struct NullClient;
        #[async_trait]
        impl UpstreamClient for NullClient {
            async fn request(
                &self,
                _method: &str,
                _params: Value,
                _timeout: Duration,
            ) -> Result<Value, GatewayError> {
                Ok(Value::Null)
            }
            async fn notify(&self, _method: &str, _params: Value) -> Result<(), GatewayError> {
                Ok(())
            }
            async fn shutdown(&self) {}
        }

        let handle =
            UpstreamHandle::new("s1", "files", Arc::new(NullClient), Value::Null);
        assert!(!handle.is_degraded());
        handle.mark_degraded();
        handle.mark_degraded();
        assert!(handle.is_degraded());
    }
}
