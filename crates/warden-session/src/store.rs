//! Session state store.
//!
//! Sessions live in a concurrent map keyed by session id. Each session's
//! state (context plus call graph) sits behind its own mutex: insertion of
//! a call takes the lock briefly, analysis runs on a snapshot taken under
//! the lock and released before any work happens. Sessions expire by
//! inactivity and are evicted wholesale.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info};

use crate::adaptive::TaskContext;
use crate::graph::{GraphSnapshot, SessionGraph};

/// Context of one session.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub session_id: String,
    pub user_id: String,
    pub task_context: TaskContext,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub call_count: u64,
    /// Distinct tools used this session, in first-use order.
    pub tools_used: Vec<String>,
    /// Count of WARN/BLOCK outcomes this session.
    pub risk_events: u64,
}

impl SessionContext {
    /// Creates a fresh context.
    pub fn new(
        session_id: impl Into<String>,
        user_id: impl Into<String>,
        task_context: TaskContext,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            user_id: user_id.into(),
            task_context,
            first_seen: now,
            last_seen: now,
            call_count: 0,
            tools_used: Vec::new(),
            risk_events: 0,
        }
    }
}

/// Mutable per-session state: context plus the owned call graph.
pub struct SessionState {
    pub context: SessionContext,
    pub graph: SessionGraph,
}

/// The keyed session map.
pub struct SessionStore {
    sessions: DashMap<String, Arc<Mutex<SessionState>>>,
    graph_cap: usize,
    inactivity_timeout: Duration,
}

impl SessionStore {
    /// Creates a store with the given per-session graph cap and
    /// inactivity timeout.
    pub fn new(graph_cap: usize, inactivity_timeout: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            graph_cap,
            inactivity_timeout,
        }
    }

    /// Gets or creates the state for a session.
    pub fn get_or_create(
        &self,
        session_id: &str,
        user_id: &str,
        task_context: TaskContext,
    ) -> Arc<Mutex<SessionState>> {
        self.sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                debug!(session = session_id, user = user_id, "created session state");
                Arc::new(Mutex::new(SessionState {
                    context: SessionContext::new(session_id, user_id, task_context),
                    graph: SessionGraph::new(session_id, self.graph_cap),
                }))
            })
            .clone()
    }

    /// The state of an existing session.
    pub fn get(&self, session_id: &str) -> Option<Arc<Mutex<SessionState>>> {
        self.sessions.get(session_id).map(|entry| entry.clone())
    }

    /// Appends a call to a session's graph and updates the context.
    /// Returns the new node id.
    pub fn observe_call(
        &self,
        session_id: &str,
        user_id: &str,
        task_context: TaskContext,
        tool: &str,
        arguments: Value,
        risk_score: f64,
    ) -> String {
        let handle = self.get_or_create(session_id, user_id, task_context);
        let mut state = handle.lock();
        state.context.call_count += 1;
        state.context.last_seen = Utc::now();
        if !state.context.tools_used.iter().any(|used| used == tool) {
            state.context.tools_used.push(tool.to_string());
        }
        state.graph.observe(tool, arguments, Utc::now(), risk_score)
    }

    /// Records the result summary of a session's latest call.
    pub fn record_result(&self, session_id: &str, summary: &str) {
        if let Some(handle) = self.get(session_id) {
            handle.lock().graph.record_result(summary);
        }
    }

    /// Bumps the session's risk-event counter.
    pub fn record_risk_event(&self, session_id: &str) {
        if let Some(handle) = self.get(session_id) {
            handle.lock().context.risk_events += 1;
        }
    }

    /// A bounded snapshot of a session's graph, or `None` for an unknown
    /// session. The per-session lock is held only while copying.
    pub fn snapshot(&self, session_id: &str, depth: usize) -> Option<GraphSnapshot> {
        self.get(session_id)
            .map(|handle| handle.lock().graph.snapshot(depth))
    }

    /// A clone of the session context.
    pub fn context(&self, session_id: &str) -> Option<SessionContext> {
        self.get(session_id).map(|handle| handle.lock().context.clone())
    }

    /// Evicts one session wholesale.
    pub fn evict(&self, session_id: &str) {
        if self.sessions.remove(session_id).is_some() {
            info!(session = session_id, "session evicted");
        }
    }

    /// Evicts every session idle longer than the inactivity timeout.
    /// Returns the number evicted.
    pub fn expire_idle(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now
            - chrono::Duration::from_std(self.inactivity_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(3600));
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().lock().context.last_seen < cutoff)
            .map(|entry| entry.key().clone())
            .collect();
        for session_id in &expired {
            self.evict(session_id);
        }
        expired.len()
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// True when no session is tracked.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
