//! Document and filter shapes shared by every [`super::store::VectorStore`]
//! adapter, grounded on the `Vector`/`QueryResult`/filter shapes of
//! `swissknife-vectordb-sdk`, generalized from per-backend provider traits
//! into one portable filter dict.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One indexed unit: an MCP server or one of its tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    /// A catalog entry for an MCP server.
    Server,
    /// A single tool exposed by a server.
    Tool,
}

impl EntityType {
    /// Collection name this entity kind is stored under.
    #[must_use]
    pub fn collection(self) -> &'static str {
        match self {
            Self::Server => "servers",
            Self::Tool => "tools",
        }
    }
}

/// A document in the discovery index: the embedded text plus metadata
/// properties the caller can filter and rerank on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    /// Stable document id, unique within its collection.
    pub id: String,
    /// Text that was (or will be) embedded.
    pub content: String,
    /// Metadata-safe properties: server id/path, tags, enabled flag, tool
    /// name, etc. Any key here may be patched via `update_metadata` without
    /// triggering re-embedding.
    pub properties: HashMap<String, Value>,
}

/// One retrieved document plus whatever relevance signals the backend
/// supplies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredDocument {
    /// The underlying document.
    #[serde(flatten)]
    pub document: Document,
    /// Vector distance, when the backend is a pure-vector search.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance: Option<f32>,
    /// Certainty (1 - normalized distance), when applicable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certainty: Option<f32>,
    /// Combined relevance score (hybrid / BM25 / reranked).
    pub score: f32,
}

/// A portable filter expression: `{key: value}` for equality, or
/// `{key: {$op: value}}` for a comparison, combined with `$and`/`$or`.
/// Adapters translate this into their native filter representation.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Filter(pub HashMap<String, Value>);

impl Filter {
    /// An empty filter — matches everything.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// A single equality filter, expanding a list value to `$in`.
    #[must_use]
    pub fn eq(key: impl Into<String>, value: Value) -> Self {
        let mut map = HashMap::new();
        if value.is_array() {
            let mut op = HashMap::new();
            op.insert("$in".to_string(), value);
            map.insert(key.into(), Value::Object(op.into_iter().collect()));
        } else {
            map.insert(key.into(), value);
        }
        Self(map)
    }

    /// Whether `properties` satisfies every clause in this filter. Used by
    /// [`super::store::InMemoryVectorStore`], which has no native filter
    /// engine of its own.
    #[must_use]
    pub fn matches(&self, properties: &HashMap<String, Value>) -> bool {
        self.0.iter().all(|(key, expected)| match key.as_str() {
            "$and" => expected
                .as_array()
                .is_some_and(|clauses| clauses.iter().all(|c| sub_filter(c).matches(properties))),
            "$or" => expected
                .as_array()
                .is_some_and(|clauses| clauses.iter().any(|c| sub_filter(c).matches(properties))),
            _ => match_clause(properties.get(key), expected),
        })
    }
}

fn sub_filter(value: &Value) -> Filter {
    value
        .as_object()
        .map(|obj| Filter(obj.clone().into_iter().collect()))
        .unwrap_or_default()
}

fn match_clause(actual: Option<&Value>, expected: &Value) -> bool {
    let Some(ops) = expected.as_object() else {
        return actual == Some(expected);
    };
    // `{key: {$op: value}}` form.
    if ops.keys().all(|k| k.starts_with('$')) {
        return ops.iter().all(|(op, value)| apply_op(actual, op, value));
    }
    actual == Some(expected)
}

fn apply_op(actual: Option<&Value>, op: &str, value: &Value) -> bool {
    match op {
        "$eq" => actual == Some(value),
        "$ne" => actual != Some(value),
        "$in" => value.as_array().is_some_and(|arr| actual.is_some_and(|a| arr.contains(a))),
        "$gt" | "$gte" | "$lt" | "$lte" => compare_numeric(actual, op, value),
        _ => false,
    }
}

fn compare_numeric(actual: Option<&Value>, op: &str, value: &Value) -> bool {
    let (Some(a), Some(b)) = (actual.and_then(Value::as_f64), value.as_f64()) else {
        return false;
    };
    match op {
        "$gt" => a > b,
        "$gte" => a >= b,
        "$lt" => a < b,
        "$lte" => a <= b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props() -> HashMap<String, Value> {
        let mut p = HashMap::new();
        p.insert("server_id".to_string(), serde_json::json!("brave"));
        p.insert("enabled".to_string(), serde_json::json!(true));
        p.insert("rank".to_string(), serde_json::json!(3));
        p
    }

    #[test]
    fn equality_filter_matches() {
        let filter = Filter::eq("server_id", serde_json::json!("brave"));
        assert!(filter.matches(&props()));
        let filter = Filter::eq("server_id", serde_json::json!("tavily"));
        assert!(!filter.matches(&props()));
    }

    #[test]
    fn list_value_expands_to_in() {
        let filter = Filter::eq("server_id", serde_json::json!(["brave", "tavily"]));
        assert!(filter.matches(&props()));
    }

    #[test]
    fn comparison_operators_work() {
        let filter = Filter(HashMap::from([(
            "rank".to_string(),
            serde_json::json!({"$gte": 3}),
        )]));
        assert!(filter.matches(&props()));
        let filter = Filter(HashMap::from([(
            "rank".to_string(),
            serde_json::json!({"$gt": 3}),
        )]));
        assert!(!filter.matches(&props()));
    }

    #[test]
    fn and_or_combinators_compose() {
        let filter = Filter(HashMap::from([(
            "$and".to_string(),
            serde_json::json!([
                {"server_id": "brave"},
                {"enabled": true}
            ]),
        )]));
        assert!(filter.matches(&props()));

        let filter = Filter(HashMap::from([(
            "$or".to_string(),
            serde_json::json!([
                {"server_id": "tavily"},
                {"enabled": true}
            ]),
        )]));
        assert!(filter.matches(&props()));
    }
}
