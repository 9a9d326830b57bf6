//! Catalog sync: keep the discovery index in step with the configured MCP
//! server catalog, doing the minimum work for each kind of mutation.
//!
//! `content` is always a deterministic function of a document's
//! non-metadata fields (name, server, descriptions, tags) — never hand
//! edited — so the diff/rebuild operations below can always tell whether a
//! tool changed by comparing the regenerated string, not by trusting a
//! dirty flag.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::document::{Document, EntityType, Filter};
use super::store::VectorStore;
use crate::error::Result;

/// One tool exposed by a server, as known to the catalog (not the discovery
/// index) — the sync layer's input shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Tool name, unique within its server.
    pub name: String,
    /// Primary description.
    pub description: String,
    /// Description of the tool's arguments, if documented separately.
    pub args_description: String,
    /// Description of the tool's return value, if documented separately.
    pub returns_description: String,
    /// Serialized JSON input schema.
    pub input_schema: Value,
    /// Lowercased tags.
    pub tags: Vec<String>,
}

/// One server (or A2A agent) as known to the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSpec {
    /// Stable path/identifier, e.g. `brave` or `agents/scheduler`.
    pub server_path: String,
    /// Human-facing name.
    pub display_name: String,
    /// Primary description, used for the virtual document when there are
    /// no tools (e.g. an A2A agent) and as part of every tool's content.
    pub description: String,
    /// A2A-style skill names, folded into the virtual document when there
    /// are no tools.
    pub skills: Vec<String>,
    /// Lowercased tags.
    pub tags: Vec<String>,
    /// Whether the server is currently enabled.
    pub is_enabled: bool,
    /// Tools the server exposes; empty for a tool-less agent.
    pub tools: Vec<ToolSpec>,
}

fn lowercase_tags(tags: &[String]) -> Vec<String> {
    tags.iter().map(|t| t.to_lowercase()).collect()
}

/// Build a tool document's `content`: a deterministic concatenation of
/// name, server, description, and tags — the text that actually gets
/// embedded.
#[must_use]
pub fn tool_content(server: &ServerSpec, tool: &ToolSpec) -> String {
    format!(
        "{name} ({server}): {description} Args: {args} Returns: {returns} Tags: {tags}",
        name = tool.name,
        server = server.display_name,
        description = tool.description,
        args = tool.args_description,
        returns = tool.returns_description,
        tags = lowercase_tags(&tool.tags).join(", "),
    )
}

/// Build a server (or virtual agent) document's `content`.
#[must_use]
pub fn server_content(server: &ServerSpec) -> String {
    format!(
        "{name}: {description} Skills: {skills} Tags: {tags}",
        name = server.display_name,
        description = server.description,
        skills = server.skills.join(", "),
        tags = lowercase_tags(&server.tags).join(", "),
    )
}

fn tool_document(server: &ServerSpec, tool: &ToolSpec) -> Document {
    let mut properties = HashMap::new();
    properties.insert("server_path".to_string(), Value::String(server.server_path.clone()));
    properties.insert("server_name".to_string(), Value::String(server.display_name.clone()));
    properties.insert("server_id".to_string(), Value::String(server.server_path.clone()));
    properties.insert("tool_name".to_string(), Value::String(tool.name.clone()));
    properties.insert("entity_type".to_string(), serde_json::to_value(EntityType::Tool).unwrap_or_default());
    properties.insert("tags".to_string(), serde_json::json!(lowercase_tags(&tool.tags)));
    properties.insert("is_enabled".to_string(), Value::Bool(server.is_enabled));
    properties.insert("input_schema".to_string(), tool.input_schema.clone());
    Document {
        id: format!("{}:{}", server.server_path, tool.name),
        content: tool_content(server, tool),
        properties,
    }
}

fn server_document(server: &ServerSpec) -> Document {
    let mut properties = HashMap::new();
    properties.insert("server_path".to_string(), Value::String(server.server_path.clone()));
    properties.insert("server_name".to_string(), Value::String(server.display_name.clone()));
    properties.insert("server_id".to_string(), Value::String(server.server_path.clone()));
    properties.insert("entity_type".to_string(), serde_json::to_value(EntityType::Server).unwrap_or_default());
    properties.insert("tags".to_string(), serde_json::json!(lowercase_tags(&server.tags)));
    properties.insert("is_enabled".to_string(), Value::Bool(server.is_enabled));
    Document {
        id: server.server_path.clone(),
        content: server_content(server),
        properties,
    }
}

/// Result of comparing an old and a new tool list, keyed by tool name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolDiff {
    /// Tools present in `new` but not `old`.
    pub to_add: Vec<String>,
    /// Tools present in both whose description changed.
    pub to_update: Vec<String>,
    /// Tools present in `old` but not `new`.
    pub to_delete: Vec<String>,
}

/// Name-keyed comparison of an old and new tool list.
#[must_use]
pub fn diff_tools(old: &[ToolSpec], new: &[ToolSpec]) -> ToolDiff {
    let old_by_name: HashMap<&str, &ToolSpec> = old.iter().map(|t| (t.name.as_str(), t)).collect();
    let new_by_name: HashMap<&str, &ToolSpec> = new.iter().map(|t| (t.name.as_str(), t)).collect();

    let mut diff = ToolDiff::default();
    for (name, new_tool) in &new_by_name {
        match old_by_name.get(name) {
            None => diff.to_add.push((*name).to_string()),
            Some(old_tool) => {
                if old_tool.description != new_tool.description {
                    diff.to_update.push((*name).to_string());
                }
            }
        }
    }
    for name in old_by_name.keys() {
        if !new_by_name.contains_key(name) {
            diff.to_delete.push((*name).to_string());
        }
    }
    diff.to_add.sort();
    diff.to_update.sort();
    diff.to_delete.sort();
    diff
}

/// Keeps the discovery index in step with catalog mutations.
pub struct CatalogSync {
    store: Arc<dyn VectorStore>,
}

impl CatalogSync {
    /// Build a sync component over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn VectorStore>) -> Self {
        Self { store }
    }

    /// Enable or upsert a server: diff its tool list against `previous`
    /// (`None` on first sync) and apply the minimum set of index writes.
    /// A tool-less server (an A2A agent) gets one synthesized virtual
    /// document instead.
    ///
    /// # Errors
    ///
    /// Returns an error if any underlying index write fails.
    pub async fn upsert_server(&self, server: &ServerSpec, previous: Option<&ServerSpec>) -> Result<()> {
        // `insert` is an upsert for every adapter: the in-memory store keys
        // by id and simply overwrites, and the HTTP adapter's point upsert
        // does the same.
        self.store.insert("servers", server_document(server)).await?;

        if server.tools.is_empty() {
            return Ok(());
        }

        let old_tools: &[ToolSpec] = previous.map(|p| p.tools.as_slice()).unwrap_or(&[]);
        let diff = diff_tools(old_tools, &server.tools);
        let by_name: HashMap<&str, &ToolSpec> = server.tools.iter().map(|t| (t.name.as_str(), t)).collect();

        for name in diff.to_add.iter().chain(diff.to_update.iter()) {
            let Some(tool) = by_name.get(name.as_str()) else { continue };
            let id = format!("{}:{name}", server.server_path);
            let doc = tool_document(server, tool);
            if diff.to_update.contains(name) {
                self.store.delete("tools", &id).await?;
            }
            self.store.insert("tools", doc).await?;
        }
        for name in &diff.to_delete {
            let id = format!("{}:{name}", server.server_path);
            self.store.delete("tools", &id).await?;
        }
        Ok(())
    }

    /// Disable a server: remove every document (server + tools) tagged
    /// with its id.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying delete fails.
    pub async fn disable_server(&self, server_path: &str) -> Result<()> {
        let filter = Filter::eq("server_id", Value::String(server_path.to_string()));
        self.store.delete_by_filter("servers", &filter).await?;
        self.store.delete_by_filter("tools", &filter).await?;
        Ok(())
    }

    /// Metadata-only change (tags, enabled flag, display name): patched in
    /// place across every document for the server, without re-embedding.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying batch update fails.
    pub async fn update_metadata(&self, server_path: &str, patch: HashMap<String, Value>) -> Result<()> {
        let filter = Filter::eq("server_path", Value::String(server_path.to_string()));
        for collection in ["servers", "tools"] {
            let matches = self.store.filter(collection, &filter, usize::MAX, 0).await?;
            let ids: Vec<String> = matches.into_iter().map(|d| d.id).collect();
            if !ids.is_empty() {
                self.store.batch_update_properties(collection, &ids, patch.clone()).await?;
            }
        }
        Ok(())
    }

    /// Full rebuild: delete everything tagged with the server's id, then
    /// bulk-insert it fresh. Used on initial sync and after unrecoverable
    /// drift; idempotent like every other operation here.
    ///
    /// # Errors
    ///
    /// Returns an error if any underlying index write fails.
    pub async fn rebuild_server(&self, server: &ServerSpec) -> Result<()> {
        self.disable_server(&server.server_path).await?;
        self.store.insert("servers", server_document(server)).await?;
        if server.tools.is_empty() {
            return Ok(());
        }
        let docs = server.tools.iter().map(|tool| tool_document(server, tool)).collect();
        self.store.bulk_insert("tools", docs).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::embeddings::HashingEmbedder;
    use crate::discovery::store::InMemoryVectorStore;

    fn tool(name: &str, description: &str) -> ToolSpec {
        ToolSpec {
            name: name.to_string(),
            description: description.to_string(),
            args_description: String::new(),
            returns_description: String::new(),
            input_schema: serde_json::json!({}),
            tags: vec![],
        }
    }

    fn server(tools: Vec<ToolSpec>) -> ServerSpec {
        ServerSpec {
            server_path: "brave".to_string(),
            display_name: "Brave Search".to_string(),
            description: "web search".to_string(),
            skills: vec![],
            tags: vec!["search".to_string()],
            is_enabled: true,
            tools,
        }
    }

    fn sync() -> CatalogSync {
        CatalogSync::new(Arc::new(InMemoryVectorStore::new(Arc::new(HashingEmbedder::new(32)))))
    }

    #[test]
    fn diff_tools_classifies_add_update_delete() {
        let old = vec![tool("a", "old description"), tool("b", "same")];
        let new = vec![tool("a", "new description"), tool("b", "same"), tool("c", "fresh")];
        let diff = diff_tools(&old, &new);
        assert_eq!(diff.to_add, vec!["c".to_string()]);
        assert_eq!(diff.to_update, vec!["a".to_string()]);
        assert_eq!(diff.to_delete, Vec::<String>::new());
    }

    #[test]
    fn diff_tools_detects_removed_tools() {
        let old = vec![tool("a", "d"), tool("b", "d")];
        let new = vec![tool("a", "d")];
        let diff = diff_tools(&old, &new);
        assert_eq!(diff.to_delete, vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn upsert_then_disable_removes_all_documents() {
        let sync = sync();
        let srv = server(vec![tool("brave_search", "search the web")]);
        sync.upsert_server(&srv, None).await.unwrap();

        let found = sync.store.get("tools", "brave:brave_search").await.unwrap();
        assert!(found.is_some());

        sync.disable_server("brave").await.unwrap();
        let found = sync.store.get("tools", "brave:brave_search").await.unwrap();
        assert!(found.is_none());
        let found = sync.store.get("servers", "brave").await.unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn tool_less_server_synthesizes_virtual_document_only() {
        let sync = sync();
        let mut srv = server(vec![]);
        srv.server_path = "scheduler-agent".to_string();
        srv.skills = vec!["plan".to_string(), "remind".to_string()];
        sync.upsert_server(&srv, None).await.unwrap();
        let doc = sync.store.get("servers", "scheduler-agent").await.unwrap().unwrap();
        assert!(doc.content.contains("plan"));
    }

    #[tokio::test]
    async fn metadata_update_is_idempotent_and_rebuild_restores_tools() {
        let sync = sync();
        let srv = server(vec![tool("brave_search", "search the web")]);
        sync.upsert_server(&srv, None).await.unwrap();

        let patch = HashMap::from([("is_enabled".to_string(), serde_json::json!(false))]);
        sync.update_metadata("brave", patch.clone()).await.unwrap();
        sync.update_metadata("brave", patch).await.unwrap();
        let doc = sync.store.get("servers", "brave").await.unwrap().unwrap();
        assert_eq!(doc.properties.get("is_enabled"), Some(&serde_json::json!(false)));

        sync.rebuild_server(&srv).await.unwrap();
        let doc = sync.store.get("tools", "brave:brave_search").await.unwrap().unwrap();
        assert_eq!(doc.properties.get("is_enabled"), Some(&serde_json::json!(true)));
    }
}
