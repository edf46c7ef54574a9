//! Technique dispatcher.
//!
//! For one request, fans out one task per (technique × configured
//! channel) under a per-request concurrency cap, applies the wall-clock
//! inspection budget to the whole batch, and compresses the per-channel
//! results into one verdict per technique. Timed-out or failed channels
//! become channel-unavailable markers: they neither contribute to nor
//! diminish confidence, and the gateway never blocks indefinitely waiting
//! on a channel.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use warden_analyzers::rules::{self, RuleContext};
use warden_analyzers::{MlEngine, MlOutcome, PatternAnalyzer};
use warden_catalog::{ApplicabilityProbe, Technique};
use warden_session::BehavioralRisk;

use crate::verdict::{Channel, TechniqueVerdict};

/// The normalized view of one message handed to the pipeline.
#[derive(Debug, Clone)]
pub struct InspectionRequest {
    pub method: String,
    /// Routed tool name for `tools/call`.
    pub tool_name: Option<String>,
    pub arguments: Map<String, Value>,
    /// Concatenation of all string leaves in the params.
    pub text_view: String,
    pub session_id: Option<String>,
    pub user_id: String,
    /// Declared task context of the session, for adaptive adjustment.
    pub task_context: warden_session::TaskContext,
}

impl InspectionRequest {
    /// Argument keys treated as filesystem paths.
    const PATH_KEYS: &'static [&'static str] =
        &["path", "file", "filename", "directory", "dir", "filepath"];
    /// Argument keys treated as network destinations.
    const URL_KEYS: &'static [&'static str] = &["url", "host", "domain", "endpoint", "api_url"];

    /// True when any argument looks like a filesystem path.
    pub fn has_path_argument(&self) -> bool {
        Self::PATH_KEYS
            .iter()
            .any(|key| self.arguments.get(*key).map(Value::is_string).unwrap_or(false))
    }

    /// True when any argument looks like a network destination.
    pub fn has_url_argument(&self) -> bool {
        Self::URL_KEYS
            .iter()
            .any(|key| self.arguments.get(*key).map(Value::is_string).unwrap_or(false))
    }

    /// The applicability probe for technique selection.
    pub fn probe(&self) -> ApplicabilityProbe {
        ApplicabilityProbe {
            method: self.method.clone(),
            tool_name: self.tool_name.clone(),
            has_path_argument: self.has_path_argument(),
            has_url_argument: self.has_url_argument(),
        }
    }
}

/// The outcome of one channel task.
enum ChannelOutcome {
    Answered {
        channel: Channel,
        matched: bool,
        confidence: f64,
        evidence: Vec<String>,
    },
    Unavailable {
        channel: Channel,
        reason: String,
    },
}

/// The technique dispatcher.
pub struct Dispatcher {
    patterns: PatternAnalyzer,
    ml: Arc<MlEngine>,
    concurrency: usize,
    budget: Duration,
    /// Models already warned about, so the unknown-model warning fires
    /// once per name.
    warned_models: Arc<DashSet<String>>,
}

impl Dispatcher {
    /// Creates a dispatcher.
    pub fn new(
        patterns: PatternAnalyzer,
        ml: Arc<MlEngine>,
        concurrency: usize,
        budget: Duration,
    ) -> Self {
        Self {
            patterns,
            ml,
            concurrency: concurrency.max(1),
            budget,
            warned_models: Arc::new(DashSet::new()),
        }
    }

    /// Dispatches one request across every applicable technique.
    ///
    /// `views` holds the text view plus its deobfuscated variants;
    /// `behavioral` is the session's behavioral risk, when available.
    pub async fn dispatch(
        &self,
        techniques: &[Arc<Technique>],
        views: Arc<Vec<String>>,
        request: &InspectionRequest,
        behavioral: Option<Arc<BehavioralRisk>>,
    ) -> Vec<TechniqueVerdict> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let arguments = Arc::new(request.arguments.clone());
        let tool_name = request.tool_name.clone();
        let text = views.first().cloned().unwrap_or_default();

        // (technique index, channel) tagged tasks.
        let mut handles = Vec::new();
        let mut aborts = Vec::new();

        for (index, technique) in techniques.iter().enumerate() {
            let spec = &technique.spec;

            if !technique.matchers.is_empty() {
                let handle = self.spawn_pattern(index, technique.clone(), views.clone(), &semaphore);
                aborts.push(handle.abort_handle());
                handles.push(handle);
            }
            if !spec.detection.rules.is_empty() {
                let handle = self.spawn_rules(
                    index,
                    technique.clone(),
                    text.clone(),
                    arguments.clone(),
                    tool_name.clone(),
                    &semaphore,
                );
                aborts.push(handle.abort_handle());
                handles.push(handle);
            }
            if spec.detection.ml_model.is_some() {
                let handle =
                    self.spawn_ml(index, technique.clone(), text.clone(), &semaphore);
                aborts.push(handle.abort_handle());
                handles.push(handle);
            }
            if spec.detection.behavioral.is_some() {
                let handle = self.spawn_behavioral(
                    index,
                    technique.clone(),
                    behavioral.clone(),
                    &semaphore,
                );
                aborts.push(handle.abort_handle());
                handles.push(handle);
            }
        }

        // Collect results until the batch budget expires; whatever has not
        // finished by then is reported unavailable.
        let mut outcomes: Vec<Vec<ChannelOutcome>> =
            (0..techniques.len()).map(|_| Vec::new()).collect();
        let deadline = tokio::time::Instant::now() + self.budget;
        let mut pending: FuturesUnordered<_> = handles.into_iter().collect();
        let mut timed_out = false;

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    timed_out = true;
                    break;
                }
                next = pending.next() => match next {
                    Some(Ok((index, outcome))) => outcomes[index].push(outcome),
                    Some(Err(join_error)) => {
                        // A panicking channel fails itself, not the request.
                        warn!(error = %join_error, "inspection channel task failed");
                    }
                    None => break,
                }
            }
        }

        if timed_out {
            debug!(budget_ms = self.budget.as_millis() as u64, "inspection budget exhausted");
            for abort in aborts {
                abort.abort();
            }
        }

        techniques
            .iter()
            .zip(outcomes)
            .map(|(technique, channel_outcomes)| {
                self.compress(technique, channel_outcomes, timed_out)
            })
            .collect()
    }

    fn spawn_pattern(
        &self,
        index: usize,
        technique: Arc<Technique>,
        views: Arc<Vec<String>>,
        semaphore: &Arc<Semaphore>,
    ) -> tokio::task::JoinHandle<(usize, ChannelOutcome)> {
        let analyzer = self.patterns.clone();
        let semaphore = semaphore.clone();
        tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            let refs: Vec<&str> = views.iter().map(String::as_str).collect();
            let outcome = analyzer.analyze(&technique, &refs);
            (
                index,
                ChannelOutcome::Answered {
                    channel: Channel::Pattern,
                    matched: outcome.matched,
                    confidence: outcome.confidence,
                    evidence: outcome.evidence,
                },
            )
        })
    }

    fn spawn_rules(
        &self,
        index: usize,
        technique: Arc<Technique>,
        text: String,
        arguments: Arc<Map<String, Value>>,
        tool_name: Option<String>,
        semaphore: &Arc<Semaphore>,
    ) -> tokio::task::JoinHandle<(usize, ChannelOutcome)> {
        let semaphore = semaphore.clone();
        tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            let context = RuleContext {
                tool_name: tool_name.as_deref(),
            };

            let mut matched = false;
            let mut confidence: f64 = 0.0;
            let mut evidence = Vec::new();
            let mut unknown: Option<String> = None;

            for name in &technique.spec.detection.rules {
                match rules::evaluate(name, &text, &arguments, &context) {
                    Some(outcome) => {
                        if outcome.triggered {
                            matched = true;
                        }
                        confidence = confidence.max(outcome.confidence);
                        for (rule_id, reason) in
                            outcome.rule_ids.iter().zip(outcome.reasons.iter()).take(4)
                        {
                            evidence.push(format!("rule {}: {}", rule_id, reason));
                        }
                    }
                    None => unknown = Some(name.clone()),
                }
            }

            let outcome = match unknown {
                // An unknown rule disables the channel rather than
                // silently reporting clean.
                Some(name) if !matched => ChannelOutcome::Unavailable {
                    channel: Channel::Rule,
                    reason: format!("unknown rule '{}'", name),
                },
                _ => ChannelOutcome::Answered {
                    channel: Channel::Rule,
                    matched,
                    confidence,
                    evidence,
                },
            };
            (index, outcome)
        })
    }

    fn spawn_ml(
        &self,
        index: usize,
        technique: Arc<Technique>,
        text: String,
        semaphore: &Arc<Semaphore>,
    ) -> tokio::task::JoinHandle<(usize, ChannelOutcome)> {
        let engine = self.ml.clone();
        let semaphore = semaphore.clone();
        let warned = self.warned_models.clone();
        tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            let Some(model) = technique.spec.detection.ml_model.as_ref() else {
                return (
                    index,
                    ChannelOutcome::Unavailable {
                        channel: Channel::Ml,
                        reason: "no model configured".to_string(),
                    },
                );
            };
            let model_name = model.name.clone();
            let threshold = model.threshold;

            // Model I/O and compute stay off the request-serving workers.
            let infer_name = model_name.clone();
            let inference = tokio::task::spawn_blocking(move || {
                engine.infer(&infer_name, &text, threshold)
            })
            .await;

            let outcome = match inference {
                Ok(MlOutcome::Inference {
                    matched,
                    confidence,
                    evidence,
                }) => ChannelOutcome::Answered {
                    channel: Channel::Ml,
                    matched,
                    confidence,
                    evidence: if evidence.is_empty() { vec![] } else { vec![evidence] },
                },
                Ok(MlOutcome::Unavailable { reason }) => {
                    if warned.insert(model_name.clone()) {
                        warn!(model = %model_name, technique = technique.id(), "ml channel disabled: {}", reason);
                    }
                    ChannelOutcome::Unavailable {
                        channel: Channel::Ml,
                        reason,
                    }
                }
                Err(join_error) => ChannelOutcome::Unavailable {
                    channel: Channel::Ml,
                    reason: format!("inference task failed: {}", join_error),
                },
            };
            (index, outcome)
        })
    }

    fn spawn_behavioral(
        &self,
        index: usize,
        technique: Arc<Technique>,
        behavioral: Option<Arc<BehavioralRisk>>,
        semaphore: &Arc<Semaphore>,
    ) -> tokio::task::JoinHandle<(usize, ChannelOutcome)> {
        let semaphore = semaphore.clone();
        tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            let outcome = match behavioral {
                Some(risk) => {
                    let checks = match technique.spec.detection.behavioral.as_ref() {
                        Some(checks) => checks,
                        None => {
                            return (
                                index,
                                ChannelOutcome::Unavailable {
                                    channel: Channel::Behavioral,
                                    reason: "no checks configured".to_string(),
                                },
                            )
                        }
                    };

                    let mut fired = Vec::new();
                    for check in checks {
                        if let Some(value) = risk.feature(&check.feature) {
                            if value >= check.threshold {
                                fired.push(format!(
                                    "behavioral {}: {:.2} >= {:.2}",
                                    check.feature, value, check.threshold
                                ));
                            }
                        }
                    }

                    let matched = !fired.is_empty();
                    let mut evidence = fired;
                    if matched {
                        evidence.extend(risk.evidence.iter().cloned());
                    }
                    ChannelOutcome::Answered {
                        channel: Channel::Behavioral,
                        matched,
                        confidence: if matched { risk.risk_score } else { 0.0 },
                        evidence,
                    }
                }
                None => ChannelOutcome::Unavailable {
                    channel: Channel::Behavioral,
                    reason: "no session context".to_string(),
                },
            };
            (index, outcome)
        })
    }

    /// Compresses the channel outcomes of one technique into a verdict:
    /// matched if any channel matched, confidence from the strongest
    /// matched channel, evidence concatenated channel by channel. Missing
    /// channels are ignored.
    fn compress(
        &self,
        technique: &Technique,
        mut outcomes: Vec<ChannelOutcome>,
        timed_out: bool,
    ) -> TechniqueVerdict {
        // Fixed channel presentation order.
        let order = |channel: &Channel| match channel {
            Channel::Pattern => 0u8,
            Channel::Rule => 1,
            Channel::Ml => 2,
            Channel::Behavioral => 3,
        };
        outcomes.sort_by_key(|outcome| match outcome {
            ChannelOutcome::Answered { channel, .. } => order(channel),
            ChannelOutcome::Unavailable { channel, .. } => order(channel),
        });

        let mut matched = false;
        let mut confidence: f64 = 0.0;
        let mut method = None;
        let mut evidence = Vec::new();

        for outcome in &outcomes {
            match outcome {
                ChannelOutcome::Answered {
                    channel,
                    matched: hit,
                    confidence: channel_confidence,
                    evidence: channel_evidence,
                } => {
                    // Evidence concatenates channel by channel; a channel
                    // whose sub-checks fired contributes its strings even
                    // when it stayed below its own trigger threshold.
                    evidence.extend(channel_evidence.iter().cloned());
                    if *hit {
                        matched = true;
                        if *channel_confidence > confidence {
                            confidence = *channel_confidence;
                            method = Some(*channel);
                        }
                    }
                }
                ChannelOutcome::Unavailable { channel, reason } => {
                    if timed_out {
                        debug!(
                            technique = technique.id(),
                            channel = %channel,
                            reason,
                            "channel unavailable"
                        );
                    }
                }
            }
        }

        TechniqueVerdict {
            technique_id: technique.spec.id.clone(),
            technique_name: technique.spec.name.clone(),
            tactic: technique.spec.tactic,
            severity: technique.spec.severity,
            matched,
            confidence,
            method,
            evidence,
        }
    }
}
