//! Scope & policy engine — maps IdP groups to scopes and evaluates
//! `(scopes, server, method, tool) → allow/deny`.
//!
//! Loaded from a single YAML file. Server rules are keyed by scope name;
//! `group_mappings` is a sibling top-level key rather than a scope, so the
//! file is parsed as a generic mapping and split by key rather than via a
//! single `#[derive(Deserialize)]` struct.
//!
//! Wildcard matching (`"*"`/`"all"` in `methods`/`tools`, and `server: "*"`)
//! is hand-rolled string comparison, the same `strip_suffix('*')` +
//! `starts_with` idiom the upstream gateway's tool-policy glob matching uses
//! — there is no dependency on a glob-matching crate.

use std::{collections::HashMap, path::Path};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Error, Result};

const WILDCARDS: [&str; 2] = ["*", "all"];

/// One server rule within a scope's rule list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerRule {
    /// Server path this rule applies to, or `"*"` for any server.
    pub server: String,
    /// Allowed JSON-RPC methods (or `"all"`/`"*"`).
    #[serde(default)]
    pub methods: Vec<String>,
    /// Allowed tool names for `tools/call` (or `"all"`/`"*"`).
    #[serde(default)]
    pub tools: Vec<String>,
}

/// The loaded scope policy and group-to-scope map.
#[derive(Debug, Clone, Default)]
pub struct ScopePolicy {
    rules: HashMap<String, Vec<ServerRule>>,
    group_mappings: HashMap<String, Vec<String>>,
}

impl ScopePolicy {
    /// Load and parse the scope policy file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid YAML.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse scope-policy YAML from a string (used directly by tests and by
    /// `Self::load`).
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not valid YAML or a scope's rule
    /// list does not match the expected shape.
    pub fn parse(content: &str) -> Result<Self> {
        let raw: serde_yaml::Mapping = serde_yaml::from_str(content)
            .map_err(|e| Error::Config(format!("invalid scope policy YAML: {e}")))?;

        let mut rules = HashMap::new();
        let mut group_mappings = HashMap::new();

        for (key, value) in raw {
            let key = key
                .as_str()
                .ok_or_else(|| Error::Config("scope policy keys must be strings".to_string()))?
                .to_string();

            if key == "group_mappings" {
                group_mappings = serde_yaml::from_value(value).map_err(|e| {
                    Error::Config(format!("invalid group_mappings: {e}"))
                })?;
            } else {
                let server_rules: Vec<ServerRule> = serde_yaml::from_value(value)
                    .map_err(|e| Error::Config(format!("invalid rules for scope '{key}': {e}")))?;
                rules.insert(key, server_rules);
            }
        }

        Ok(Self {
            rules,
            group_mappings,
        })
    }

    /// An empty policy: every lookup fails closed.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Every scope name the policy defines rules for, sorted. Used to
    /// populate `scopes_supported` in the discovery metadata documents.
    #[must_use]
    pub fn scope_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.rules.keys().cloned().collect();
        names.sort();
        names
    }

    /// Map IdP group memberships to the union of scopes they grant.
    /// Groups with no mapping contribute nothing; the result is deduplicated
    /// but otherwise unordered.
    #[must_use]
    pub fn groups_to_scopes(&self, groups: &[String]) -> Vec<String> {
        let mut scopes: Vec<String> = groups
            .iter()
            .filter_map(|g| self.group_mappings.get(g))
            .flatten()
            .cloned()
            .collect();
        scopes.sort();
        scopes.dedup();
        scopes
    }

    /// Evaluate whether `scopes` grant `(server, method, tool)`.
    ///
    /// An empty scope set always denies, independent of policy content.
    #[must_use]
    pub fn allow(&self, scopes: &[String], server: &str, method: &str, tool: Option<&str>) -> bool {
        if scopes.is_empty() {
            return false;
        }
        let normalized_server = server.trim_end_matches('/');

        for scope in scopes {
            let Some(server_rules) = self.rules.get(scope) else {
                continue;
            };
            for rule in server_rules {
                let rule_server = rule.server.trim_end_matches('/');
                if rule_server != "*" && rule_server != normalized_server {
                    continue;
                }
                if method == "tools/call" {
                    if let Some(tool) = tool {
                        if list_matches(&rule.tools, tool) {
                            return true;
                        }
                    }
                    continue;
                }
                if list_matches(&rule.methods, method) {
                    return true;
                }
                // Backward-compat: non tools/call methods may also be granted
                // via the tools list.
                if list_matches(&rule.tools, method) {
                    return true;
                }
            }
        }

        debug!(server = %normalized_server, method, ?tool, "scope policy: no rule matched, denying");
        false
    }
}

fn list_matches(list: &[String], value: &str) -> bool {
    list.iter().any(|entry| {
        if WILDCARDS.contains(&entry.as_str()) {
            return true;
        }
        if let Some(prefix) = entry.strip_suffix('*') {
            return value.starts_with(prefix);
        }
        entry == value
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_policy() -> ScopePolicy {
        ScopePolicy::parse(
            r"
mcp:read:
  - server: '*'
    methods: ['tools/list', 'resources/list']
    tools: []
mcp:search:
  - server: brave
    methods: []
    tools: ['brave_*']
group_mappings:
  dev: ['mcp:read', 'mcp:search']
  readonly: ['mcp:read']
",
        )
        .unwrap()
    }

    #[test]
    fn groups_to_scopes_unions_and_dedups() {
        let policy = sample_policy();
        let scopes = policy.groups_to_scopes(&["dev".to_string(), "readonly".to_string()]);
        assert_eq!(scopes, vec!["mcp:read".to_string(), "mcp:search".to_string()]);
    }

    #[test]
    fn unmapped_group_contributes_nothing() {
        let policy = sample_policy();
        assert!(policy.groups_to_scopes(&["ghost".to_string()]).is_empty());
    }

    #[test]
    fn empty_scope_set_always_denies() {
        let policy = sample_policy();
        assert!(!policy.allow(&[], "brave", "tools/list", None));
    }

    #[test]
    fn wildcard_server_matches_any_name() {
        let policy = sample_policy();
        assert!(policy.allow(&["mcp:read".to_string()], "anything", "tools/list", None));
    }

    #[test]
    fn tools_call_checks_tool_name_not_method() {
        let policy = sample_policy();
        assert!(policy.allow(
            &["mcp:search".to_string()],
            "brave",
            "tools/call",
            Some("brave_search")
        ));
        assert!(!policy.allow(
            &["mcp:search".to_string()],
            "brave",
            "tools/call",
            Some("tavily-search")
        ));
    }

    #[test]
    fn rule_miss_denies() {
        let policy = sample_policy();
        assert!(!policy.allow(&["mcp:read".to_string()], "brave", "tools/call", Some("brave_search")));
    }

    #[test]
    fn trailing_slash_is_normalized() {
        let policy = ScopePolicy::parse(
            r"
mcp:read:
  - server: 'brave/'
    methods: ['tools/list']
    tools: []
",
        )
        .unwrap();
        assert!(policy.allow(&["mcp:read".to_string()], "brave", "tools/list", None));
    }
}
