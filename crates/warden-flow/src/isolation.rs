//! Isolation policy gate.
//!
//! Purely declarative pre-execution checks on `(tool name, arguments)`.
//! Policies are configured per tool (exact name first, keyword inference
//! second) and immutable afterwards; the gate itself holds no mutable
//! state and is safe to share across requests.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

/// Capability-based permissions a tool may be granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCapability {
    FileRead,
    FileWrite,
    FileList,
    NetworkHttp,
    NetworkSocket,
    ProcessSpawn,
    SystemInfo,
    DatabaseRead,
    DatabaseWrite,
}

impl std::fmt::Display for ToolCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::FileRead => "file_read",
            Self::FileWrite => "file_write",
            Self::FileList => "file_list",
            Self::NetworkHttp => "network_http",
            Self::NetworkSocket => "network_socket",
            Self::ProcessSpawn => "process_spawn",
            Self::SystemInfo => "system_info",
            Self::DatabaseRead => "database_read",
            Self::DatabaseWrite => "database_write",
        };
        write!(f, "{}", name)
    }
}

/// Per-tool security policy, immutable after configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolationPolicy {
    /// Granted capabilities.
    pub capabilities: BTreeSet<ToolCapability>,
    /// Allow-listed path prefixes. Empty means no path restriction beyond
    /// the deny list.
    pub allowed_paths: Vec<String>,
    /// Deny-listed path prefixes (system directories).
    pub blocked_paths: Vec<String>,
    /// Upper bound for the upstream call.
    pub max_execution: Duration,
    /// Maximum `size`-style argument, in megabytes.
    pub max_file_size_mb: u64,
    /// Maximum `count`-style argument.
    pub max_count: u64,
    /// Whether the tool may name network destinations at all.
    pub allow_network: bool,
    /// Substring allow-list for network destinations. Empty with
    /// `allow_network` means any destination.
    pub allowed_domains: Vec<String>,
}

/// One policy violation, with a structured reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PolicyViolation {
    /// A path argument resolved under a deny prefix.
    PathBlocked { path: String, prefix: String },
    /// A path argument resolved outside every allow prefix.
    PathOutsideAllowed { path: String },
    /// The tool named a network destination but has no network grant.
    NetworkDenied { destination: String },
    /// The destination is not in the domain allow-list.
    DomainDenied { destination: String },
    /// A size argument exceeded the per-tool cap.
    SizeExceeded { size_mb: u64, limit_mb: u64 },
    /// A count argument exceeded the per-tool cap.
    CountExceeded { count: u64, limit: u64 },
    /// The tool requires capabilities the policy does not grant.
    MissingCapabilities { missing: Vec<ToolCapability> },
}

impl std::fmt::Display for PolicyViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PathBlocked { path, prefix } => {
                write!(f, "path '{}' is system directory access under '{}'", path, prefix)
            }
            Self::PathOutsideAllowed { path } => {
                write!(f, "path '{}' is outside the allowed directories", path)
            }
            Self::NetworkDenied { destination } => {
                write!(f, "network access to '{}' is not granted", destination)
            }
            Self::DomainDenied { destination } => {
                write!(f, "destination '{}' is not in the domain allow-list", destination)
            }
            Self::SizeExceeded { size_mb, limit_mb } => {
                write!(f, "requested size {}MB exceeds the {}MB limit", size_mb, limit_mb)
            }
            Self::CountExceeded { count, limit } => {
                write!(f, "count {} exceeds the limit {}", count, limit)
            }
            Self::MissingCapabilities { missing } => {
                let names: Vec<String> = missing.iter().map(|c| c.to_string()).collect();
                write!(f, "tool requires ungranted capabilities: {}", names.join(", "))
            }
        }
    }
}

/// Outcome of the pre-execution gate.
#[derive(Debug, Clone)]
pub struct GateDecision {
    /// True when no violation was found.
    pub accepted: bool,
    /// Every violation found, in check order.
    pub violations: Vec<PolicyViolation>,
}

/// Argument keys treated as filesystem paths.
const PATH_KEYS: &[&str] = &["path", "file", "filename", "directory", "dir", "filepath"];

/// Argument keys treated as network destinations.
const NETWORK_KEYS: &[&str] = &["url", "host", "domain", "endpoint", "api_url"];

/// System prefixes denied to every default policy.
const SYSTEM_BLOCKED_PATHS: &[&str] = &[
    "/etc", "/proc", "/sys", "/dev", "/boot", "/root", "/var/log",
];

/// The isolation policy gate.
pub struct PolicyGate {
    workspace_root: String,
    policies: HashMap<String, IsolationPolicy>,
    fallback: IsolationPolicy,
}

impl PolicyGate {
    /// Creates a gate with the default per-tool-shape policies rooted at
    /// `workspace_root`.
    pub fn new(workspace_root: impl Into<String>) -> Self {
        let workspace_root = workspace_root.into();
        let blocked: Vec<String> = SYSTEM_BLOCKED_PATHS.iter().map(|s| s.to_string()).collect();

        let mut policies = HashMap::new();
        policies.insert(
            "read_file".to_string(),
            IsolationPolicy {
                capabilities: [ToolCapability::FileRead].into(),
                allowed_paths: vec![workspace_root.clone()],
                blocked_paths: blocked.clone(),
                max_execution: Duration::from_secs(5),
                max_file_size_mb: 10,
                max_count: 10_000,
                allow_network: false,
                allowed_domains: vec![],
            },
        );
        policies.insert(
            "write_file".to_string(),
            IsolationPolicy {
                capabilities: [ToolCapability::FileWrite, ToolCapability::FileRead].into(),
                allowed_paths: vec![workspace_root.clone()],
                blocked_paths: blocked.clone(),
                max_execution: Duration::from_secs(10),
                max_file_size_mb: 50,
                max_count: 10_000,
                allow_network: false,
                allowed_domains: vec![],
            },
        );
        policies.insert(
            "list_files".to_string(),
            IsolationPolicy {
                capabilities: [ToolCapability::FileList].into(),
                allowed_paths: vec![workspace_root.clone()],
                blocked_paths: blocked.clone(),
                max_execution: Duration::from_secs(3),
                max_file_size_mb: 1,
                max_count: 10_000,
                allow_network: false,
                allowed_domains: vec![],
            },
        );
        policies.insert(
            "http_request".to_string(),
            IsolationPolicy {
                capabilities: [ToolCapability::NetworkHttp].into(),
                allowed_paths: vec![],
                blocked_paths: blocked.clone(),
                max_execution: Duration::from_secs(30),
                max_file_size_mb: 0,
                max_count: 10_000,
                allow_network: true,
                allowed_domains: vec![],
            },
        );
        policies.insert(
            "execute_command".to_string(),
            IsolationPolicy {
                capabilities: [ToolCapability::ProcessSpawn].into(),
                allowed_paths: vec![workspace_root.clone()],
                blocked_paths: blocked
                    .iter()
                    .cloned()
                    .chain(["/bin".to_string(), "/usr/bin".to_string(), "/sbin".to_string()])
                    .collect(),
                max_execution: Duration::from_secs(10),
                max_file_size_mb: 10,
                max_count: 10_000,
                allow_network: false,
                allowed_domains: vec![],
            },
        );
        policies.insert(
            "system_info".to_string(),
            IsolationPolicy {
                capabilities: [ToolCapability::SystemInfo].into(),
                allowed_paths: vec![],
                blocked_paths: blocked.clone(),
                max_execution: Duration::from_secs(2),
                max_file_size_mb: 0,
                max_count: 10_000,
                allow_network: false,
                allowed_domains: vec![],
            },
        );

        // Unknown tools get the most restrictive policy.
        let fallback = IsolationPolicy {
            capabilities: BTreeSet::new(),
            allowed_paths: vec![workspace_root.clone()],
            blocked_paths: blocked,
            max_execution: Duration::from_secs(1),
            max_file_size_mb: 1,
            max_count: 100,
            allow_network: false,
            allowed_domains: vec![],
        };

        Self {
            workspace_root,
            policies,
            fallback,
        }
    }

    /// Overrides or adds the policy for one tool.
    pub fn set_policy(&mut self, tool_name: impl Into<String>, policy: IsolationPolicy) {
        self.policies.insert(tool_name.into(), policy);
    }

    /// The policy that applies to a tool: exact name, then keyword
    /// inference over the documented mapping, then the restrictive
    /// fallback.
    pub fn policy_for(&self, tool_name: &str) -> &IsolationPolicy {
        if let Some(policy) = self.policies.get(tool_name) {
            return policy;
        }

        let lower = tool_name.to_lowercase();
        let inferred = if contains_any(&lower, &["read", "get", "fetch", "load"]) {
            "read_file"
        } else if contains_any(&lower, &["write", "create", "update", "delete", "save"]) {
            "write_file"
        } else if contains_any(&lower, &["list", "dir", "ls"]) {
            "list_files"
        } else if contains_any(&lower, &["http", "request", "api", "send"]) {
            "http_request"
        } else if contains_any(&lower, &["exec", "run", "command", "shell"]) {
            "execute_command"
        } else if contains_any(&lower, &["system", "info", "status"]) {
            "system_info"
        } else {
            warn!(tool = tool_name, "unknown tool shape, applying restrictive policy");
            return &self.fallback;
        };

        self.policies
            .get(inferred)
            .unwrap_or(&self.fallback)
    }

    /// Runs every declarative check for one call.
    ///
    /// This is a pre-filter: a rejection here short-circuits the pipeline
    /// with a policy-violation BLOCK and no analyzer runs.
    pub fn check(&self, tool_name: &str, arguments: &Map<String, Value>) -> GateDecision {
        let policy = self.policy_for(tool_name);
        let mut violations = Vec::new();

        self.check_paths(arguments, policy, &mut violations);
        self.check_network(arguments, policy, &mut violations);
        self.check_limits(arguments, policy, &mut violations);
        self.check_capabilities(tool_name, policy, &mut violations);

        if !violations.is_empty() {
            warn!(
                tool = tool_name,
                violations = violations.len(),
                "tool call rejected by isolation policy"
            );
        }

        GateDecision {
            accepted: violations.is_empty(),
            violations,
        }
    }

    fn check_paths(
        &self,
        arguments: &Map<String, Value>,
        policy: &IsolationPolicy,
        violations: &mut Vec<PolicyViolation>,
    ) {
        for key in PATH_KEYS {
            let Some(raw) = arguments.get(*key).and_then(Value::as_str) else {
                continue;
            };
            let resolved = self.resolve(raw);

            for prefix in &policy.blocked_paths {
                if resolved.starts_with(prefix.as_str()) {
                    violations.push(PolicyViolation::PathBlocked {
                        path: raw.to_string(),
                        prefix: prefix.clone(),
                    });
                }
            }

            if !policy.allowed_paths.is_empty()
                && !policy
                    .allowed_paths
                    .iter()
                    .any(|prefix| resolved.starts_with(prefix.as_str()))
            {
                violations.push(PolicyViolation::PathOutsideAllowed {
                    path: raw.to_string(),
                });
            }
        }
    }

    fn check_network(
        &self,
        arguments: &Map<String, Value>,
        policy: &IsolationPolicy,
        violations: &mut Vec<PolicyViolation>,
    ) {
        for key in NETWORK_KEYS {
            let Some(destination) = arguments.get(*key).and_then(Value::as_str) else {
                continue;
            };
            if !policy.allow_network {
                violations.push(PolicyViolation::NetworkDenied {
                    destination: destination.to_string(),
                });
            } else if !policy.allowed_domains.is_empty()
                && !policy
                    .allowed_domains
                    .iter()
                    .any(|domain| destination.contains(domain.as_str()))
            {
                violations.push(PolicyViolation::DomainDenied {
                    destination: destination.to_string(),
                });
            }
        }
    }

    fn check_limits(
        &self,
        arguments: &Map<String, Value>,
        policy: &IsolationPolicy,
        violations: &mut Vec<PolicyViolation>,
    ) {
        if let Some(size) = arguments.get("size").and_then(Value::as_u64) {
            let size_mb = size / (1024 * 1024);
            if size_mb > policy.max_file_size_mb {
                violations.push(PolicyViolation::SizeExceeded {
                    size_mb,
                    limit_mb: policy.max_file_size_mb,
                });
            }
        }
        if let Some(count) = arguments.get("count").and_then(Value::as_u64) {
            if count > policy.max_count {
                violations.push(PolicyViolation::CountExceeded {
                    count,
                    limit: policy.max_count,
                });
            }
        }
    }

    fn check_capabilities(
        &self,
        tool_name: &str,
        policy: &IsolationPolicy,
        violations: &mut Vec<PolicyViolation>,
    ) {
        let required = infer_capabilities(tool_name);
        let missing: Vec<ToolCapability> = required
            .into_iter()
            .filter(|capability| !policy.capabilities.contains(capability))
            .collect();
        if !missing.is_empty() {
            violations.push(PolicyViolation::MissingCapabilities { missing });
        }
    }

    /// Resolves an argument to an absolute, lexically normalized path.
    /// Relative paths are anchored at the workspace root; `..` segments
    /// are resolved without touching the filesystem.
    fn resolve(&self, raw: &str) -> String {
        let unified = raw.replace('\\', "/");
        let anchored = if unified.starts_with('/') {
            unified
        } else {
            format!("{}/{}", self.workspace_root.trim_end_matches('/'), unified)
        };

        let mut segments: Vec<&str> = Vec::new();
        for segment in anchored.split('/') {
            match segment {
                "" | "." => {}
                ".." => {
                    segments.pop();
                }
                other => segments.push(other),
            }
        }
        format!("/{}", segments.join("/"))
    }
}

/// Required capabilities inferred from the tool name (documented keyword
/// mapping).
fn infer_capabilities(tool_name: &str) -> BTreeSet<ToolCapability> {
    let lower = tool_name.to_lowercase();
    let mut required = BTreeSet::new();
    if contains_any(&lower, &["read", "get", "load"]) {
        required.insert(ToolCapability::FileRead);
    }
    if contains_any(&lower, &["write", "create", "update"]) {
        required.insert(ToolCapability::FileWrite);
    }
    if contains_any(&lower, &["http", "network", "api"]) {
        required.insert(ToolCapability::NetworkHttp);
    }
    if contains_any(&lower, &["exec", "run", "command"]) {
        required.insert(ToolCapability::ProcessSpawn);
    }
    required
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.clone()))
            .collect()
    }

    #[test]
    fn test_workspace_read_accepted() {
        let gate = PolicyGate::new("/workspace");
        let decision = gate.check(
            "read_file",
            &args(&[("path", Value::String("docs/report.txt".into()))]),
        );
        assert!(decision.accepted, "violations: {:?}", decision.violations);
    }

    #[test]
    fn test_traversal_to_etc_rejected() {
        let gate = PolicyGate::new("/workspace");
        let decision = gate.check(
            "read_file",
            &args(&[("path", Value::String("../../../../etc/passwd".into()))]),
        );
        assert!(!decision.accepted);
        assert!(decision
            .violations
            .iter()
            .any(|violation| matches!(violation, PolicyViolation::PathBlocked { .. })));
        assert!(decision
            .violations
            .iter()
            .any(|violation| matches!(violation, PolicyViolation::PathOutsideAllowed { .. })));
    }

    #[test]
    fn test_network_denied_for_file_tool() {
        let gate = PolicyGate::new("/workspace");
        let decision = gate.check(
            "read_file",
            &args(&[("url", Value::String("https://example.com".into()))]),
        );
        assert!(!decision.accepted);
        assert!(matches!(
            decision.violations[0],
            PolicyViolation::NetworkDenied { .. }
        ));
    }

    #[test]
    fn test_domain_allow_list() {
        let mut gate = PolicyGate::new("/workspace");
        let mut policy = gate.policy_for("http_request").clone();
        policy.allowed_domains = vec!["api.internal.example".to_string()];
        gate.set_policy("http_request", policy);

        let allowed = gate.check(
            "http_request",
            &args(&[("url", Value::String("https://api.internal.example/v1".into()))]),
        );
        assert!(allowed.accepted);

        let denied = gate.check(
            "http_request",
            &args(&[("url", Value::String("https://evil.example.com/".into()))]),
        );
        assert!(!denied.accepted);
        assert!(matches!(
            denied.violations[0],
            PolicyViolation::DomainDenied { .. }
        ));
    }

    #[test]
    fn test_size_limit_enforced() {
        let gate = PolicyGate::new("/workspace");
        let decision = gate.check(
            "read_file",
            &args(&[
                ("path", Value::String("big.bin".into())),
                ("size", Value::from(100u64 * 1024 * 1024)),
            ]),
        );
        assert!(!decision.accepted);
        assert!(decision
            .violations
            .iter()
            .any(|violation| matches!(violation, PolicyViolation::SizeExceeded { .. })));
    }

    #[test]
    fn test_capability_inference_rejects_ungranted_mix() {
        let gate = PolicyGate::new("/workspace");
        // "update" selects the write-file policy, but "api" also demands
        // NETWORK_HTTP, which that policy does not grant.
        let decision = gate.check("update_api_settings", &Map::new());
        assert!(!decision.accepted);
        assert!(matches!(
            decision.violations[0],
            PolicyViolation::MissingCapabilities { .. }
        ));
    }

    #[test]
    fn test_keyword_policy_inference() {
        let gate = PolicyGate::new("/workspace");
        let policy = gate.policy_for("fetch_document");
        assert!(policy.capabilities.contains(&ToolCapability::FileRead));
        let policy = gate.policy_for("send_http");
        assert!(policy.allow_network);
    }

    #[test]
    fn test_resolve_normalizes_lexically() {
        let gate = PolicyGate::new("/workspace");
        assert_eq!(gate.resolve("a/../b.txt"), "/workspace/b.txt");
        assert_eq!(gate.resolve("../../etc/passwd"), "/etc/passwd");
        assert_eq!(gate.resolve("/etc/shadow"), "/etc/shadow");
    }

    #[test]
    fn test_violation_display_names_system_directory() {
        let violation = PolicyViolation::PathBlocked {
            path: "../../etc/passwd".to_string(),
            prefix: "/etc".to_string(),
        };
        assert!(violation.to_string().contains("system directory access"));
    }
}
