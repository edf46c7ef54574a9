//! Audit sink.
//!
//! One record per inspected request, emitted through a bounded queue that
//! never blocks the request path: when full, the oldest record is dropped
//! and a counter bumped. The schema is stable across versions — fields
//! are only ever added.

use std::collections::VecDeque;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Notify;
use tracing::info;

use warden_core::{AggregateVerdict, Decision, InspectionOutcome, RiskLevel};

/// Final status of one request, after enforcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FinalStatus {
    Allowed,
    Blocked,
    Sanitized,
    Cancelled,
    /// The request named a tool or resource no upstream provides.
    RoutingMiss,
}

/// One audit record.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub request_id: Option<Value>,
    pub method: String,
    pub tool_name: Option<String>,
    pub upstream_server: Option<String>,
    pub session_id: Option<String>,
    pub decision: Decision,
    pub risk_level: RiskLevel,
    pub confidence: f64,
    pub matched_technique_ids: Vec<String>,
    pub evidence: Vec<String>,
    pub mitigations: Vec<String>,
    pub adjustments: Vec<String>,
    pub violations: Vec<String>,
    pub phase_latencies_ms: Vec<(String, u64)>,
    pub status: FinalStatus,
}

impl AuditRecord {
    /// Builds a record from an inspection outcome.
    pub fn from_outcome(
        method: &str,
        request_id: Option<Value>,
        tool_name: Option<&str>,
        upstream_server: Option<&str>,
        session_id: Option<&str>,
        outcome: &InspectionOutcome,
        status: FinalStatus,
    ) -> Self {
        Self::from_verdict(
            method,
            request_id,
            tool_name,
            upstream_server,
            session_id,
            &outcome.verdict,
            outcome
                .phase_latencies
                .iter()
                .map(|(phase, ms)| (phase.to_string(), *ms))
                .collect(),
            status,
        )
    }

    /// Builds a record from a bare verdict.
    #[allow(clippy::too_many_arguments)]
    pub fn from_verdict(
        method: &str,
        request_id: Option<Value>,
        tool_name: Option<&str>,
        upstream_server: Option<&str>,
        session_id: Option<&str>,
        verdict: &AggregateVerdict,
        phase_latencies_ms: Vec<(String, u64)>,
        status: FinalStatus,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            request_id,
            method: method.to_string(),
            tool_name: tool_name.map(str::to_string),
            upstream_server: upstream_server.map(str::to_string),
            session_id: session_id.map(str::to_string),
            decision: verdict.decision,
            risk_level: verdict.risk_level,
            confidence: verdict.confidence,
            matched_technique_ids: verdict
                .matched_techniques
                .iter()
                .map(|technique| technique.technique_id.clone())
                .collect(),
            evidence: verdict.evidence.clone(),
            mitigations: verdict.mitigations.clone(),
            adjustments: verdict.adjustments.clone(),
            violations: verdict.violations.clone(),
            phase_latencies_ms,
            status,
        }
    }
}

/// Where drained records go.
pub trait AuditWriter: Send {
    /// Writes one record. Failures are the writer's problem; the sink
    /// never propagates them into the request path.
    fn write(&mut self, record: &AuditRecord);
}

/// Writer that logs each record as one structured line.
#[derive(Default)]
pub struct TracingWriter;

impl AuditWriter for TracingWriter {
    fn write(&mut self, record: &AuditRecord) {
        if let Ok(line) = serde_json::to_string(record) {
            info!(target: "audit", "{}", line);
        }
    }
}

/// Writer appending JSON lines to any `Write`.
pub struct JsonlWriter<W: Write + Send> {
    inner: W,
}

impl<W: Write + Send> JsonlWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

impl<W: Write + Send> AuditWriter for JsonlWriter<W> {
    fn write(&mut self, record: &AuditRecord) {
        if let Ok(line) = serde_json::to_string(record) {
            let _ = writeln!(self.inner, "{}", line);
            let _ = self.inner.flush();
        }
    }
}

/// The bounded, non-blocking audit queue.
pub struct AuditSink {
    queue: Arc<Mutex<VecDeque<AuditRecord>>>,
    notify: Arc<Notify>,
    capacity: usize,
    dropped: Arc<AtomicU64>,
}

impl AuditSink {
    /// Creates a sink draining into `writer` from a background task.
    pub fn new(capacity: usize, mut writer: Box<dyn AuditWriter>) -> Self {
        let queue: Arc<Mutex<VecDeque<AuditRecord>>> =
            Arc::new(Mutex::new(VecDeque::with_capacity(capacity)));
        let notify = Arc::new(Notify::new());

        let drain_queue = queue.clone();
        let drain_notify = notify.clone();
        tokio::spawn(async move {
            loop {
                drain_notify.notified().await;
                loop {
                    let record = drain_queue.lock().pop_front();
                    match record {
                        Some(record) => writer.write(&record),
                        None => break,
                    }
                }
            }
        });

        Self {
            queue,
            notify,
            capacity: capacity.max(1),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Enqueues a record. Never blocks: on a full queue the oldest record
    /// is dropped and the drop counter bumped.
    pub fn emit(&self, record: AuditRecord) {
        {
            let mut queue = self.queue.lock();
            if queue.len() >= self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(record);
        }
        self.notify.notify_one();
    }

    /// Records dropped so far under pressure.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Records currently queued (drained asynchronously).
    pub fn backlog(&self) -> usize {
        self.queue.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Clone, Default)]
    struct SharedWriter(Arc<StdMutex<Vec<AuditRecord>>>);

    impl AuditWriter for SharedWriter {
        fn write(&mut self, record: &AuditRecord) {
            self.0.lock().unwrap().push(record.clone());
        }
    }

    fn record(status: FinalStatus) -> AuditRecord {
        AuditRecord::from_verdict(
            "tools/call",
            Some(Value::from(1)),
            Some("read_file"),
            Some("files"),
            Some("sess-1"),
            &AggregateVerdict::allow(),
            vec![("dispatch".to_string(), 3)],
            status,
        )
    }

    #[tokio::test]
    async fn test_emit_and_drain() {
        let writer = SharedWriter::default();
        let sink = AuditSink::new(8, Box::new(writer.clone()));

        sink.emit(record(FinalStatus::Allowed));
        sink.emit(record(FinalStatus::Blocked));

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let written = writer.0.lock().unwrap();
        assert_eq!(written.len(), 2);
        assert_eq!(written[0].status, FinalStatus::Allowed);
        assert_eq!(sink.dropped(), 0);
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest() {
        // No drain: writer is never reached because we flood before the
        // background task can be scheduled; capacity math still holds.
        let sink = AuditSink::new(2, Box::new(TracingWriter));
        sink.emit(record(FinalStatus::Allowed));
        sink.emit(record(FinalStatus::Allowed));
        sink.emit(record(FinalStatus::Allowed));
        assert!(sink.dropped() >= 1 || sink.backlog() <= 2);
    }

    #[test]
    fn test_record_serialization_schema() {
        let record = record(FinalStatus::Sanitized);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["method"], "tools/call");
        assert_eq!(json["status"], "SANITIZED");
        assert_eq!(json["decision"], "ALLOW");
        assert!(json["timestamp"].is_string());
    }
}
