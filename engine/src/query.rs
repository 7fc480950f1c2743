//! Query descriptions.
//!
//! A [`QueryState`] is an immutable description of a query in the remote
//! service's `where` dialect. It is built with a [`QueryBuilder`] and handed to
//! the local query executor, which compiles it into a
//! [`Matcher`](crate::Matcher).

use crate::value::{Fields, Pointer};
use crate::ClassName;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;

/// Key of the disjunction clause in a `where` map.
pub const OR_KEY: &str = "$or";
/// Key of the relation-membership clause in a `where` map.
pub const RELATED_TO_KEY: &str = "$relatedTo";

/// Description of a query against one class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryState {
    /// Class being queried
    pub class_name: ClassName,
    /// Constraints by key, in the remote `where` format
    #[serde(default, rename = "where")]
    pub conditions: Fields,
    /// Sort keys in priority order; a leading `-` sorts descending
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sort_keys: Vec<String>,
    /// Pointer paths to load alongside each result
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub include_keys: BTreeSet<String>,
    /// Keys to keep in results; all keys when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub select_keys: Option<BTreeSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default)]
    pub skip: usize,
    /// Skip the ACL read check
    #[serde(default)]
    pub ignore_acls: bool,
    /// Only consider members of this pin
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pin_name: Option<String>,
}

impl QueryState {
    /// A query matching every object of `class_name`.
    pub fn new(class_name: impl Into<ClassName>) -> Self {
        Self {
            class_name: class_name.into(),
            conditions: Fields::new(),
            sort_keys: Vec::new(),
            include_keys: BTreeSet::new(),
            select_keys: None,
            limit: None,
            skip: 0,
            ignore_acls: false,
            pin_name: None,
        }
    }

    /// Start building a query on `class_name`.
    pub fn builder(class_name: impl Into<ClassName>) -> QueryBuilder {
        QueryBuilder::new(class_name)
    }

    /// Encode as the nested query value used by `$inQuery` and `$notInQuery`.
    pub fn to_subquery_value(&self) -> Value {
        json!({
            "className": self.class_name,
            "where": Value::Object(self.conditions.clone()),
        })
    }

    /// Decode a nested query value.
    pub fn from_subquery_value(value: &Value) -> Option<Self> {
        let map = value.as_object()?;
        let class_name = map.get("className")?.as_str()?;
        let mut state = QueryState::new(class_name);
        if let Some(conditions) = map.get("where") {
            state.conditions = conditions.as_object()?.clone();
        }
        Some(state)
    }
}

/// Builder for [`QueryState`].
#[derive(Debug, Clone)]
pub struct QueryBuilder {
    state: QueryState,
}

impl QueryBuilder {
    pub fn new(class_name: impl Into<ClassName>) -> Self {
        Self {
            state: QueryState::new(class_name),
        }
    }

    /// Add `{operator: value}` under `key`, keeping other operators on the key.
    fn add_constraint(mut self, key: &str, operator: &str, value: Value) -> Self {
        let entry = self
            .state
            .conditions
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !is_constraint_map(entry) {
            *entry = Value::Object(Map::new());
        }
        if let Value::Object(map) = entry {
            map.insert(operator.to_string(), value);
        }
        self
    }

    pub fn equal_to(mut self, key: &str, value: Value) -> Self {
        self.state.conditions.insert(key.to_string(), value);
        self
    }

    pub fn not_equal_to(self, key: &str, value: Value) -> Self {
        self.add_constraint(key, "$ne", value)
    }

    pub fn less_than(self, key: &str, value: Value) -> Self {
        self.add_constraint(key, "$lt", value)
    }

    pub fn less_than_or_equal_to(self, key: &str, value: Value) -> Self {
        self.add_constraint(key, "$lte", value)
    }

    pub fn greater_than(self, key: &str, value: Value) -> Self {
        self.add_constraint(key, "$gt", value)
    }

    pub fn greater_than_or_equal_to(self, key: &str, value: Value) -> Self {
        self.add_constraint(key, "$gte", value)
    }

    pub fn contained_in(self, key: &str, values: Vec<Value>) -> Self {
        self.add_constraint(key, "$in", Value::Array(values))
    }

    pub fn not_contained_in(self, key: &str, values: Vec<Value>) -> Self {
        self.add_constraint(key, "$nin", Value::Array(values))
    }

    pub fn contains_all(self, key: &str, values: Vec<Value>) -> Self {
        self.add_constraint(key, "$all", Value::Array(values))
    }

    pub fn exists(self, key: &str) -> Self {
        self.add_constraint(key, "$exists", Value::Bool(true))
    }

    pub fn does_not_exist(self, key: &str) -> Self {
        self.add_constraint(key, "$exists", Value::Bool(false))
    }

    /// Match string values against a regular expression. `modifiers` takes any
    /// of `i`, `m`, `s` and `x`.
    pub fn matches_regex(self, key: &str, pattern: &str, modifiers: &str) -> Self {
        let builder = self.add_constraint(key, "$regex", Value::String(pattern.to_string()));
        if modifiers.is_empty() {
            builder
        } else {
            builder.add_constraint(key, "$options", Value::String(modifiers.to_string()))
        }
    }

    pub fn starts_with(self, key: &str, prefix: &str) -> Self {
        let pattern = format!("^{}", regex::escape(prefix));
        self.matches_regex(key, &pattern, "")
    }

    pub fn contains_string(self, key: &str, substring: &str) -> Self {
        let pattern = regex::escape(substring);
        self.matches_regex(key, &pattern, "")
    }

    /// The pointer under `key` must reference a result of `query`.
    pub fn matches_query(self, key: &str, query: &QueryState) -> Self {
        self.add_constraint(key, "$inQuery", query.to_subquery_value())
    }

    /// The pointer under `key` must not reference a result of `query`.
    pub fn does_not_match_query(self, key: &str, query: &QueryState) -> Self {
        self.add_constraint(key, "$notInQuery", query.to_subquery_value())
    }

    /// Results must be targets of relation `key` on `owner`.
    pub fn related_to(mut self, owner: &Pointer, key: &str) -> Self {
        self.state.conditions.insert(
            RELATED_TO_KEY.to_string(),
            json!({"object": owner.to_value(), "key": key}),
        );
        self
    }

    /// Match objects satisfying any of `queries`.
    pub fn or(mut self, queries: &[QueryState]) -> Self {
        let clauses = queries
            .iter()
            .map(|query| Value::Object(query.conditions.clone()))
            .collect();
        self.state
            .conditions
            .insert(OR_KEY.to_string(), Value::Array(clauses));
        self
    }

    /// Replace the sort order with ascending `key`.
    pub fn order_by_ascending(mut self, key: &str) -> Self {
        self.state.sort_keys = vec![key.to_string()];
        self
    }

    /// Replace the sort order with descending `key`.
    pub fn order_by_descending(mut self, key: &str) -> Self {
        self.state.sort_keys = vec![format!("-{key}")];
        self
    }

    pub fn add_ascending_order(mut self, key: &str) -> Self {
        self.state.sort_keys.push(key.to_string());
        self
    }

    pub fn add_descending_order(mut self, key: &str) -> Self {
        self.state.sort_keys.push(format!("-{key}"));
        self
    }

    pub fn include(mut self, path: &str) -> Self {
        self.state.include_keys.insert(path.to_string());
        self
    }

    pub fn select_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state.select_keys = Some(keys.into_iter().map(Into::into).collect());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.state.limit = Some(limit);
        self
    }

    pub fn skip(mut self, skip: usize) -> Self {
        self.state.skip = skip;
        self
    }

    pub fn ignore_acls(mut self) -> Self {
        self.state.ignore_acls = true;
        self
    }

    /// Restrict the query to members of pin `name`.
    pub fn from_pin(mut self, name: impl Into<String>) -> Self {
        self.state.pin_name = Some(name.into());
        self
    }

    pub fn build(self) -> QueryState {
        self.state
    }
}

/// True if `value` is a map of `$` operators rather than a literal.
pub fn is_constraint_map(value: &Value) -> bool {
    match value.as_object() {
        Some(map) => !map.is_empty() && map.keys().all(|key| key.starts_with('$')),
        None => false,
    }
}
