//! Tool routing across upstream servers.
//!
//! The router owns the merged tool table the gateway advertises. Conflict
//! rule: when two upstreams register the same tool name, *both*
//! registrations are renamed to `<server_name>/<tool_name>` and the bare
//! name is removed from the map entirely, so no tool silently routes to
//! whichever server registered first.

use std::collections::{HashMap, HashSet};

use serde_json::Value;
use tracing::{info, warn};

/// One registered tool.
#[derive(Debug, Clone)]
pub struct ToolRegistration {
    /// Advertised (possibly prefixed) name.
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    /// Owning upstream server.
    pub server_id: String,
    pub server_name: String,
    /// The name the upstream knows the tool by.
    pub original_name: String,
}

/// The routing table.
#[derive(Debug, Default)]
pub struct ToolRouter {
    tools: HashMap<String, ToolRegistration>,
    server_tools: HashMap<String, Vec<String>>,
    /// Bare names that have conflicted; all later registrations of these
    /// names go in prefixed.
    conflicted: HashSet<String>,
}

impl ToolRouter {
    /// Creates an empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the tool list of one upstream.
    pub fn register_tools(&mut self, server_id: &str, server_name: &str, tools: &[Value]) {
        let mut registered = 0usize;

        for tool in tools {
            let Some(original_name) = tool.get("name").and_then(Value::as_str) else {
                warn!(server = server_name, "tool without a name skipped");
                continue;
            };
            let description = tool
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let input_schema = tool
                .get("inputSchema")
                .cloned()
                .unwrap_or_else(|| Value::Object(Default::default()));

            let advertised = if self.conflicted.contains(original_name) {
                format!("{}/{}", server_name, original_name)
            } else if let Some(existing) = self.tools.remove(original_name) {
                // First conflict on this name: rename the existing
                // registration too and retire the bare name.
                warn!(
                    tool = original_name,
                    first = existing.server_name,
                    second = server_name,
                    "tool name conflict; both registrations prefixed"
                );
                let renamed = format!("{}/{}", existing.server_name, original_name);
                self.replace_in_server_list(&existing.server_id, original_name, &renamed);
                self.tools.insert(
                    renamed.clone(),
                    ToolRegistration {
                        name: renamed,
                        ..existing
                    },
                );
                self.conflicted.insert(original_name.to_string());
                format!("{}/{}", server_name, original_name)
            } else {
                original_name.to_string()
            };

            self.tools.insert(
                advertised.clone(),
                ToolRegistration {
                    name: advertised.clone(),
                    description,
                    input_schema,
                    server_id: server_id.to_string(),
                    server_name: server_name.to_string(),
                    original_name: original_name.to_string(),
                },
            );
            self.server_tools
                .entry(server_id.to_string())
                .or_default()
                .push(advertised);
            registered += 1;
        }

        info!(
            server = server_name,
            count = registered,
            total = self.tools.len(),
            "tools registered"
        );
    }

    fn replace_in_server_list(&mut self, server_id: &str, from: &str, to: &str) {
        if let Some(names) = self.server_tools.get_mut(server_id) {
            for name in names.iter_mut() {
                if name == from {
                    *name = to.to_string();
                }
            }
        }
    }

    /// Removes every tool of one server.
    pub fn unregister_server(&mut self, server_id: &str) {
        if let Some(names) = self.server_tools.remove(server_id) {
            for name in &names {
                self.tools.remove(name);
            }
            info!(server = server_id, count = names.len(), "server tools unregistered");
        }
    }

    /// Resolves an advertised name to its registration.
    pub fn resolve(&self, tool_name: &str) -> Option<&ToolRegistration> {
        self.tools.get(tool_name)
    }

    /// True when the advertised name exists.
    pub fn has_tool(&self, tool_name: &str) -> bool {
        self.tools.contains_key(tool_name)
    }

    /// The merged tool list, sorted by advertised name, as `tools/list`
    /// result entries.
    pub fn list_tools(&self) -> Vec<Value> {
        let mut names: Vec<&String> = self.tools.keys().collect();
        names.sort();
        names
            .into_iter()
            .map(|name| {
                let tool = &self.tools[name];
                serde_json::json!({
                    "name": tool.name,
                    "description": tool.description,
                    "inputSchema": tool.input_schema,
                })
            })
            .collect()
    }

    /// Number of advertised tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// True when no tool is registered.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool(name: &str) -> Value {
        json!({"name": name, "description": "d", "inputSchema": {"type": "object"}})
    }

    #[test]
    fn test_register_and_resolve() {
        let mut router = ToolRouter::new();
        router.register_tools("s1", "files", &[tool("read_file"), tool("write_file")]);

        let registration = router.resolve("read_file").unwrap();
        assert_eq!(registration.server_id, "s1");
        assert_eq!(registration.original_name, "read_file");
        assert_eq!(router.len(), 2);
    }

    #[test]
    fn test_conflict_renames_both_and_removes_bare_name() {
        let mut router = ToolRouter::new();
        router.register_tools("s1", "alpha", &[tool("search")]);
        router.register_tools("s2", "beta", &[tool("search")]);

        assert!(!router.has_tool("search"));
        assert!(router.has_tool("alpha/search"));
        assert!(router.has_tool("beta/search"));
        assert_eq!(router.resolve("alpha/search").unwrap().original_name, "search");
        assert_eq!(router.resolve("beta/search").unwrap().server_id, "s2");
    }

    #[test]
    fn test_third_registration_of_conflicted_name_prefixed() {
        let mut router = ToolRouter::new();
        router.register_tools("s1", "alpha", &[tool("search")]);
        router.register_tools("s2", "beta", &[tool("search")]);
        router.register_tools("s3", "gamma", &[tool("search")]);

        assert!(!router.has_tool("search"));
        assert!(router.has_tool("gamma/search"));
        assert_eq!(router.len(), 3);
    }

    #[test]
    fn test_unregister_server() {
        let mut router = ToolRouter::new();
        router.register_tools("s1", "alpha", &[tool("a"), tool("b")]);
        router.register_tools("s2", "beta", &[tool("c")]);

        router.unregister_server("s1");
        assert!(!router.has_tool("a"));
        assert!(!router.has_tool("b"));
        assert!(router.has_tool("c"));
    }

    #[test]
    fn test_list_tools_sorted() {
        let mut router = ToolRouter::new();
        router.register_tools("s1", "alpha", &[tool("zeta"), tool("alpha_tool")]);
        let listed = router.list_tools();
        assert_eq!(listed[0]["name"], "alpha_tool");
        assert_eq!(listed[1]["name"], "zeta");
    }

    #[test]
    fn test_nameless_tool_skipped() {
        let mut router = ToolRouter::new();
        router.register_tools("s1", "alpha", &[json!({"description": "no name"})]);
        assert!(router.is_empty());
    }
}
