//! The gateway state machine.
//!
//! Owns the MCP handshake, tool routing, and the per-request inspection
//! sequence: parse, inspect request, forward or reject, inspect response,
//! deliver. One gateway instance serves one client connection (one
//! session); distinct requests on the connection run concurrently.
//!
//! ## States
//!
//! ```text
//! UNINITIALIZED ──initialize──► HANDSHAKING ──initialized──► READY
//!       │                                                      │
//!       └──────────── anything else: -32002 ────────┐          │
//!                                                   ▼          ▼
//!                                                DRAINING ──► CLOSED
//! ```
//!
//! ## Cancellation
//!
//! `notifications/cancelled` marks the in-flight id. If the upstream has
//! not been contacted yet the call stops immediately; if it has, the late
//! response is still inspected and audited, then discarded. Either way no
//! further frame with that id reaches the client.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use warden_core::{Decision, InspectionRequest, Warden};
use warden_session::{TaskContext, UserRole};

use crate::audit::{AuditRecord, AuditSink, FinalStatus};
use crate::error::GatewayError;
use crate::protocol::{
    codes, methods, response_text_view, JsonRpcMessage, RequestEnvelope, PROTOCOL_VERSION,
};
use crate::router::ToolRouter;
use crate::upstream::{UpstreamHandle, UpstreamManager};

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Deadline for one upstream call.
    pub upstream_timeout: Duration,
    /// Grace period for in-flight requests while draining.
    pub drain_grace: Duration,
    /// Declared task context for this connection's session.
    pub task_context: TaskContext,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            upstream_timeout: Duration::from_secs(30),
            drain_grace: Duration::from_secs(5),
            task_context: TaskContext::Unknown,
        }
    }
}

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayState {
    Uninitialized,
    Handshaking,
    Ready,
    Draining,
    Closed,
}

/// The sentinel text substituted for a sanitized response body.
fn sanitized_body(technique_ids: &[String]) -> String {
    format!("[CONTENT SANITIZED: {}]", technique_ids.join(", "))
}

/// The gateway.
pub struct Gateway {
    warden: Arc<Warden>,
    config: GatewayConfig,
    router: RwLock<ToolRouter>,
    upstreams: UpstreamManager,
    audit: AuditSink,
    state: Mutex<GatewayState>,
    /// Session id for this connection.
    session_id: String,
    /// Caller identity; refined from `clientInfo` at initialize.
    user_id: Mutex<String>,
    /// In-flight request ids with their cancellation flags.
    inflight: DashMap<String, Arc<AtomicBool>>,
    /// Resource URI and prompt name routes, built from upstream listings.
    resource_routes: RwLock<HashMap<String, String>>,
    prompt_routes: RwLock<HashMap<String, String>>,
}

impl Gateway {
    /// Creates a gateway over an inspection pipeline.
    pub fn new(warden: Arc<Warden>, config: GatewayConfig, audit: AuditSink) -> Self {
        Self {
            warden,
            config,
            router: RwLock::new(ToolRouter::new()),
            upstreams: UpstreamManager::new(),
            audit,
            state: Mutex::new(GatewayState::Uninitialized),
            session_id: format!("sess-{}", Uuid::new_v4()),
            user_id: Mutex::new("anonymous".to_string()),
            inflight: DashMap::new(),
            resource_routes: RwLock::new(HashMap::new()),
            prompt_routes: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a live upstream: discovers its tools and merges them
    /// into the routing table.
    pub async fn attach_upstream(&self, handle: Arc<UpstreamHandle>) -> Result<(), GatewayError> {
        let tools = handle
            .client
            .request(methods::TOOLS_LIST, json!({}), self.config.upstream_timeout)
            .await?;
        let tools = tools
            .get("tools")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        self.router
            .write()
            .register_tools(&handle.server_id, &handle.name, &tools);
        self.upstreams.add(handle);
        Ok(())
    }

    /// The connection's session id.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Current state (for status reporting).
    pub fn state(&self) -> GatewayState {
        *self.state.lock()
    }

    /// The inspection pipeline.
    pub fn warden(&self) -> &Arc<Warden> {
        &self.warden
    }

    /// Handles one raw frame; returns the response frame, if any.
    pub async fn handle_frame(self: &Arc<Self>, raw: &str) -> Option<JsonRpcMessage> {
        let message = match JsonRpcMessage::parse(raw) {
            Ok(message) => message,
            Err(_) => {
                return Some(JsonRpcMessage::error_response(
                    Value::Null,
                    codes::PARSE_ERROR,
                    "Parse error",
                    None,
                ));
            }
        };

        let id = message.id.clone();
        let envelope = match RequestEnvelope::validate(message) {
            Ok(envelope) => envelope,
            Err(err) => {
                return Some(JsonRpcMessage::error_response(
                    id.unwrap_or(Value::Null),
                    codes::INVALID_REQUEST,
                    &err.to_string(),
                    None,
                ));
            }
        };

        if envelope.id.is_none() {
            self.handle_notification(&envelope);
            return None;
        }
        self.handle_request(envelope).await
    }

    fn handle_notification(&self, envelope: &RequestEnvelope) {
        match envelope.method.as_str() {
            methods::INITIALIZED | methods::INITIALIZED_LEGACY => {
                let mut state = self.state.lock();
                if *state == GatewayState::Handshaking {
                    *state = GatewayState::Ready;
                    info!(session = %self.session_id, "client handshake complete");
                }
            }
            methods::CANCELLED => {
                let request_id = envelope
                    .params
                    .get("requestId")
                    .or_else(|| envelope.params.get("id"));
                if let Some(request_id) = request_id {
                    let key = id_key(request_id);
                    if let Some(entry) = self.inflight.get(&key) {
                        entry.store(true, Ordering::SeqCst);
                        info!(request_id = %key, "cancellation requested");
                    }
                }
            }
            methods::PROGRESS | methods::LOG_MESSAGE | methods::RESOURCES_UPDATED => {
                debug!(method = %envelope.method, "client notification ignored");
            }
            other => {
                debug!(method = other, "unknown notification ignored");
            }
        }
    }

    async fn handle_request(self: &Arc<Self>, envelope: RequestEnvelope) -> Option<JsonRpcMessage> {
        let id = envelope.id.clone().expect("requests carry an id");

        // State gate.
        match self.state() {
            GatewayState::Uninitialized | GatewayState::Handshaking
                if envelope.method != methods::INITIALIZE =>
            {
                return Some(JsonRpcMessage::error_response(
                    id,
                    codes::NOT_INITIALIZED,
                    "Not Initialized",
                    None,
                ));
            }
            GatewayState::Draining | GatewayState::Closed => {
                return Some(JsonRpcMessage::error_response(
                    id,
                    codes::REQUEST_TIMEOUT,
                    "Gateway is shutting down",
                    None,
                ));
            }
            _ => {}
        }

        // Request-id collision: the second use of a live id is rejected.
        let key = id_key(&id);
        let cancelled = Arc::new(AtomicBool::new(false));
        if self.inflight.contains_key(&key) {
            return Some(JsonRpcMessage::error_response(
                id,
                codes::INVALID_REQUEST,
                "Request id already in flight",
                None,
            ));
        }
        self.inflight.insert(key.clone(), cancelled.clone());

        let response = self.dispatch_request(&envelope, id).await;
        self.inflight.remove(&key);

        // A cancelled request produces no frame, whatever the outcome.
        if cancelled.load(Ordering::SeqCst) {
            debug!(request_id = %key, "response swallowed after cancellation");
            return None;
        }
        response
    }

    async fn dispatch_request(
        self: &Arc<Self>,
        envelope: &RequestEnvelope,
        id: Value,
    ) -> Option<JsonRpcMessage> {
        match envelope.method.as_str() {
            methods::INITIALIZE => Some(self.handle_initialize(envelope, id)),
            methods::TOOLS_LIST => {
                let tools = self.router.read().list_tools();
                Some(JsonRpcMessage::response(id, json!({ "tools": tools })))
            }
            methods::TOOLS_CALL => Some(self.handle_tool_call(envelope, id).await),
            methods::RESOURCES_LIST => {
                let resources = self
                    .aggregate_listing(methods::RESOURCES_LIST, "resources", "uri", &self.resource_routes)
                    .await;
                Some(JsonRpcMessage::response(id, json!({ "resources": resources })))
            }
            methods::PROMPTS_LIST => {
                let prompts = self
                    .aggregate_listing(methods::PROMPTS_LIST, "prompts", "name", &self.prompt_routes)
                    .await;
                Some(JsonRpcMessage::response(id, json!({ "prompts": prompts })))
            }
            methods::RESOURCES_READ | methods::RESOURCES_SUBSCRIBE => {
                let Some(uri) = envelope.resource_uri().map(str::to_string) else {
                    return Some(JsonRpcMessage::error_response(
                        id,
                        codes::INVALID_PARAMS,
                        "Missing resource uri",
                        None,
                    ));
                };
                let server_id = self.resource_routes.read().get(&uri).cloned();
                Some(self.relay_inspected(envelope, id, server_id, &uri).await)
            }
            methods::PROMPTS_GET => {
                let Some(name) = envelope.params.get("name").and_then(Value::as_str) else {
                    return Some(JsonRpcMessage::error_response(
                        id,
                        codes::INVALID_PARAMS,
                        "Missing prompt name",
                        None,
                    ));
                };
                let server_id = self.prompt_routes.read().get(name).cloned();
                let name = name.to_string();
                Some(self.relay_inspected(envelope, id, server_id, &name).await)
            }
            methods::SAMPLING_CREATE => {
                let capable = self.upstreams.all().into_iter().find(|handle| {
                    handle.capabilities.get("sampling").is_some() && !handle.is_degraded()
                });
                match capable {
                    Some(handle) => {
                        Some(self.relay_inspected(envelope, id, Some(handle.server_id.clone()), "sampling").await)
                    }
                    None => Some(JsonRpcMessage::error_response(
                        id,
                        codes::METHOD_NOT_FOUND,
                        "No upstream provides sampling",
                        None,
                    )),
                }
            }
            other => Some(JsonRpcMessage::error_response(
                id,
                codes::METHOD_NOT_FOUND,
                &format!("Method not found: {}", other),
                None,
            )),
        }
    }

    fn handle_initialize(&self, envelope: &RequestEnvelope, id: Value) -> JsonRpcMessage {
        if let Some(name) = envelope
            .params
            .get("clientInfo")
            .and_then(|info| info.get("name"))
            .and_then(Value::as_str)
        {
            *self.user_id.lock() = name.to_string();
            self.warden
                .adaptive()
                .register_user(name, UserRole::User, None);
        }

        {
            let mut state = self.state.lock();
            *state = GatewayState::Handshaking;
        }
        info!(
            session = %self.session_id,
            client_version = ?envelope.params.get("protocolVersion"),
            "client initializing"
        );

        JsonRpcMessage::response(
            id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "serverInfo": {
                    "name": "mcp-warden",
                    "version": env!("CARGO_PKG_VERSION"),
                },
                "capabilities": {
                    "tools": { "listChanged": true },
                    "resources": { "subscribe": true },
                    "prompts": { "listChanged": false },
                    "logging": {},
                },
            }),
        )
    }

    /// The full `tools/call` path: gate + detect, forward, re-inspect,
    /// record, audit.
    async fn handle_tool_call(self: &Arc<Self>, envelope: &RequestEnvelope, id: Value) -> JsonRpcMessage {
        if envelope.params.is_empty() {
            return JsonRpcMessage::error_response(
                id,
                codes::INVALID_PARAMS,
                "Missing params",
                None,
            );
        }
        let Some(tool_name) = envelope.tool_name().map(str::to_string) else {
            return JsonRpcMessage::error_response(
                id,
                codes::INVALID_PARAMS,
                "Tool name required",
                None,
            );
        };

        // Routing pre-check: unknown tools are rejected before any
        // analyzer runs.
        let registration = {
            let router = self.router.read();
            router.resolve(&tool_name).cloned()
        };
        let Some(registration) = registration else {
            self.audit.emit(AuditRecord::from_verdict(
                methods::TOOLS_CALL,
                Some(id.clone()),
                Some(&tool_name),
                None,
                Some(&self.session_id),
                &warden_core::AggregateVerdict::allow(),
                vec![],
                FinalStatus::RoutingMiss,
            ));
            return JsonRpcMessage::error_response(
                id,
                codes::METHOD_NOT_FOUND,
                &format!("Tool not found: {}", tool_name),
                None,
            );
        };

        let request = InspectionRequest {
            method: methods::TOOLS_CALL.to_string(),
            tool_name: Some(tool_name.clone()),
            arguments: envelope.tool_arguments(),
            text_view: envelope.text_view(),
            session_id: Some(self.session_id.clone()),
            user_id: self.user_id.lock().clone(),
            task_context: self.config.task_context,
        };

        // Request inspection.
        let outcome = self.warden.inspect_request(&request).await;
        if outcome.verdict.is_blocked() {
            warn!(
                tool = %tool_name,
                risk = ?outcome.verdict.risk_level,
                "tool call blocked"
            );
            self.audit.emit(AuditRecord::from_outcome(
                methods::TOOLS_CALL,
                Some(id.clone()),
                Some(&tool_name),
                Some(&registration.server_name),
                Some(&self.session_id),
                &outcome,
                FinalStatus::Blocked,
            ));
            return JsonRpcMessage::error_response(
                id,
                codes::SECURITY_VIOLATION,
                "Security policy violation",
                Some(outcome.verdict.error_payload()),
            );
        }
        if outcome.verdict.decision == Decision::Warn {
            warn!(tool = %tool_name, "tool call flagged; forwarding with warning");
        }

        // Cancellation before the upstream is contacted is immediate.
        if self.is_cancelled(&id) {
            self.audit.emit(AuditRecord::from_outcome(
                methods::TOOLS_CALL,
                Some(id.clone()),
                Some(&tool_name),
                Some(&registration.server_name),
                Some(&self.session_id),
                &outcome,
                FinalStatus::Cancelled,
            ));
            return JsonRpcMessage::error_response(id, codes::REQUEST_TIMEOUT, "Cancelled", None);
        }

        // Forward to the routed upstream.
        let Some(handle) = self.upstreams.get(&registration.server_id) else {
            return JsonRpcMessage::error_response(
                id,
                codes::INTERNAL_ERROR,
                "Upstream server not available",
                None,
            );
        };
        if handle.is_degraded() {
            return JsonRpcMessage::error_response(
                id,
                codes::INTERNAL_ERROR,
                "Upstream server degraded",
                None,
            );
        }

        let upstream_result = handle
            .client
            .request(
                methods::TOOLS_CALL,
                json!({
                    "name": registration.original_name,
                    "arguments": Value::Object(request.arguments.clone()),
                }),
                self.config.upstream_timeout,
            )
            .await;

        let result = match upstream_result {
            Ok(result) => result,
            Err(GatewayError::UpstreamTimeout { name }) => {
                handle.mark_degraded();
                self.audit.emit(AuditRecord::from_outcome(
                    methods::TOOLS_CALL,
                    Some(id.clone()),
                    Some(&tool_name),
                    Some(&name),
                    Some(&self.session_id),
                    &outcome,
                    FinalStatus::Blocked,
                ));
                return JsonRpcMessage::error_response(
                    id,
                    codes::REQUEST_TIMEOUT,
                    "Upstream request timed out",
                    None,
                );
            }
            Err(err) => {
                handle.mark_degraded();
                warn!(tool = %tool_name, error = %err, "upstream call failed");
                return JsonRpcMessage::error_response(
                    id,
                    codes::INTERNAL_ERROR,
                    &format!("Error calling tool: {}", err),
                    None,
                );
            }
        };

        // Response inspection under the response-scoped technique subset.
        let response_text = response_text_view(&result);
        let response_outcome = self.warden.inspect_response(&request, &response_text).await;

        let (delivered, delivered_text, status) = if response_outcome.verdict.is_blocked() {
            let ids: Vec<String> = response_outcome
                .verdict
                .matched_techniques
                .iter()
                .map(|technique| technique.technique_id.clone())
                .collect();
            let body = sanitized_body(&ids);
            warn!(tool = %tool_name, "response sanitized");
            (
                json!({ "content": [{ "type": "text", "text": body }] }),
                body,
                FinalStatus::Sanitized,
            )
        } else {
            (result, response_text, FinalStatus::Allowed)
        };

        // Post-delivery bookkeeping: taint marks and the session graph.
        self.warden
            .record_tool_outcome(&request, &delivered_text, &outcome.verdict);

        // A cancellation that landed while the upstream was working
        // swallows the (already inspected) response.
        let final_status = if self.is_cancelled(&id) {
            debug!(tool = %tool_name, "response discarded: cancelled after upstream commit");
            FinalStatus::Cancelled
        } else {
            status
        };

        self.audit.emit(AuditRecord::from_outcome(
            methods::TOOLS_CALL,
            Some(id.clone()),
            Some(&tool_name),
            Some(&registration.server_name),
            Some(&self.session_id),
            if final_status == FinalStatus::Sanitized || final_status == FinalStatus::Cancelled {
                &response_outcome
            } else {
                &outcome
            },
            final_status,
        ));

        // The cancelled frame is suppressed by the caller via the
        // in-flight flag; returning here keeps the code path uniform.
        JsonRpcMessage::response(id, delivered)
    }

    /// Generic inspected relay for resources, prompts, and sampling.
    async fn relay_inspected(
        self: &Arc<Self>,
        envelope: &RequestEnvelope,
        id: Value,
        server_id: Option<String>,
        target: &str,
    ) -> JsonRpcMessage {
        let Some(server_id) = server_id else {
            self.audit.emit(AuditRecord::from_verdict(
                &envelope.method,
                Some(id.clone()),
                None,
                None,
                Some(&self.session_id),
                &warden_core::AggregateVerdict::allow(),
                vec![],
                FinalStatus::RoutingMiss,
            ));
            return JsonRpcMessage::error_response(
                id,
                codes::METHOD_NOT_FOUND,
                &format!("No upstream provides '{}'", target),
                None,
            );
        };

        let request = InspectionRequest {
            method: envelope.method.clone(),
            tool_name: None,
            arguments: envelope.params.clone(),
            text_view: envelope.text_view(),
            session_id: Some(self.session_id.clone()),
            user_id: self.user_id.lock().clone(),
            task_context: self.config.task_context,
        };

        let outcome = self.warden.inspect_request(&request).await;
        if outcome.verdict.is_blocked() {
            self.audit.emit(AuditRecord::from_outcome(
                &envelope.method,
                Some(id.clone()),
                None,
                None,
                Some(&self.session_id),
                &outcome,
                FinalStatus::Blocked,
            ));
            return JsonRpcMessage::error_response(
                id,
                codes::SECURITY_VIOLATION,
                "Security policy violation",
                Some(outcome.verdict.error_payload()),
            );
        }

        let Some(handle) = self.upstreams.get(&server_id) else {
            return JsonRpcMessage::error_response(
                id,
                codes::INTERNAL_ERROR,
                "Upstream server not available",
                None,
            );
        };

        let result = match handle
            .client
            .request(
                &envelope.method,
                Value::Object(envelope.params.clone()),
                self.config.upstream_timeout,
            )
            .await
        {
            Ok(result) => result,
            Err(err) => {
                handle.mark_degraded();
                return JsonRpcMessage::error_response(
                    id,
                    codes::INTERNAL_ERROR,
                    &err.to_string(),
                    None,
                );
            }
        };

        let response_text = response_text_view(&result);
        let response_outcome = self.warden.inspect_response(&request, &response_text).await;
        let (delivered, status) = if response_outcome.verdict.is_blocked() {
            let ids: Vec<String> = response_outcome
                .verdict
                .matched_techniques
                .iter()
                .map(|technique| technique.technique_id.clone())
                .collect();
            (
                json!({ "contents": [{ "type": "text", "text": sanitized_body(&ids) }] }),
                FinalStatus::Sanitized,
            )
        } else {
            (result, FinalStatus::Allowed)
        };

        self.audit.emit(AuditRecord::from_outcome(
            &envelope.method,
            Some(id.clone()),
            None,
            Some(&handle.name),
            Some(&self.session_id),
            &outcome,
            status,
        ));

        JsonRpcMessage::response(id, delivered)
    }

    /// Aggregates a listing method across every healthy upstream and
    /// refreshes the corresponding route map.
    async fn aggregate_listing(
        &self,
        method: &str,
        key: &str,
        route_key: &str,
        routes: &RwLock<HashMap<String, String>>,
    ) -> Vec<Value> {
        let mut merged = Vec::new();
        for handle in self.upstreams.all() {
            if handle.is_degraded() {
                continue;
            }
            match handle
                .client
                .request(method, json!({}), self.config.upstream_timeout)
                .await
            {
                Ok(result) => {
                    if let Some(items) = result.get(key).and_then(Value::as_array) {
                        let mut routes = routes.write();
                        for item in items {
                            if let Some(route) = item.get(route_key).and_then(Value::as_str) {
                                routes.insert(route.to_string(), handle.server_id.clone());
                            }
                            merged.push(item.clone());
                        }
                    }
                }
                Err(err) => {
                    debug!(server = %handle.name, method, error = %err, "listing skipped");
                }
            }
        }
        merged
    }

    fn is_cancelled(&self, id: &Value) -> bool {
        self.inflight
            .get(&id_key(id))
            .map(|flag| flag.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Stops accepting requests, lets in-flight ones finish up to the
    /// grace period, then closes.
    pub async fn drain(&self) {
        {
            let mut state = self.state.lock();
            if matches!(*state, GatewayState::Closed) {
                return;
            }
            *state = GatewayState::Draining;
        }
        info!(session = %self.session_id, "gateway draining");

        let deadline = tokio::time::Instant::now() + self.config.drain_grace;
        while !self.inflight.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        self.upstreams.stop_all().await;
        *self.state.lock() = GatewayState::Closed;
        info!(session = %self.session_id, "gateway closed");
    }

    /// Serves newline-delimited JSON frames until EOF, then drains.
    ///
    /// Distinct requests run in parallel; responses are written in
    /// completion order (clients correlate by id).
    pub async fn serve<R, W>(self: Arc<Self>, reader: R, mut writer: W) -> Result<(), GatewayError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (frame_tx, mut frame_rx) = mpsc::channel::<String>(64);
        let write_task = tokio::spawn(async move {
            while let Some(frame) = frame_rx.recv().await {
                if writer.write_all(frame.as_bytes()).await.is_err() {
                    break;
                }
                let _ = writer.flush().await;
            }
        });

        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            let gateway = self.clone();
            let frame_tx = frame_tx.clone();
            tokio::spawn(async move {
                if let Some(response) = gateway.handle_frame(&line).await {
                    let _ = frame_tx.send(response.to_frame()).await;
                }
            });
        }

        drop(frame_tx);
        self.drain().await;
        let _ = write_task.await;
        Ok(())
    }
}

/// Canonical string key for a JSON-RPC id.
fn id_key(id: &Value) -> String {
    match id {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
