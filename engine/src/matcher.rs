//! Constraint matching against local objects.
//!
//! A [`Matcher`] is compiled from a [`QueryState`] and evaluated against
//! [`Candidate`]s. Nested queries (`$inQuery`, `$notInQuery`) and relation
//! membership (`$relatedTo`) need the store to evaluate, so compilation is two
//! steps: [`Matcher::subqueries`] lists them, the caller resolves each to a set
//! of local ids, and [`Matcher::compile`] consumes the sets in the same order.

use crate::order::compare_values;
use crate::query::{is_constraint_map, QueryState, OR_KEY, RELATED_TO_KEY};
use crate::state::{ObjectState, CREATED_AT_KEY, OBJECT_ID_KEY, UPDATED_AT_KEY};
use crate::value::{contains_value, date_value, value_at_path, values_equal, Fields, Pointer};
use crate::{error::Result, Error, LocalId, ObjectId};
use chrono::{DateTime, Utc};
use regex::{Regex, RegexBuilder};
use serde_json::Value;
use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::HashSet;

/// Key holding an object's access control list.
pub const ACL_KEY: &str = "ACL";
/// ACL entry that applies to everyone.
pub const PUBLIC_ACCESS: &str = "*";

/// A local object as seen by the matcher.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub local_id: LocalId,
    pub object_id: Option<ObjectId>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    /// Estimated field values
    pub data: Fields,
}

impl Candidate {
    pub fn new(local_id: impl Into<LocalId>, data: Fields) -> Self {
        Self {
            local_id: local_id.into(),
            object_id: None,
            created_at: None,
            updated_at: None,
            data,
        }
    }

    /// Snapshot an object's estimated data and metadata.
    pub fn from_state(local_id: impl Into<LocalId>, state: &ObjectState) -> Self {
        Self {
            local_id: local_id.into(),
            object_id: state.object_id.clone(),
            created_at: state.created_at,
            updated_at: state.updated_at,
            data: state.estimated_data(),
        }
    }

    /// Value of a possibly dotted key; metadata keys read object metadata.
    pub fn value(&self, key: &str) -> Option<Cow<'_, Value>> {
        match key {
            OBJECT_ID_KEY => self
                .object_id
                .as_ref()
                .map(|id| Cow::Owned(Value::String(id.clone()))),
            CREATED_AT_KEY => self.created_at.map(|at| Cow::Owned(date_value(at))),
            UPDATED_AT_KEY => self.updated_at.map(|at| Cow::Owned(date_value(at))),
            _ => value_at_path(&self.data, key).map(Cow::Borrowed),
        }
    }
}

/// A nested evaluation the store must perform before compiling.
#[derive(Debug, Clone, PartialEq)]
pub enum Subquery {
    /// Pointers under `key` must reference a result of `query`
    InQuery { key: String, query: QueryState },
    /// Pointers under `key` must not reference a result of `query`
    NotInQuery { key: String, query: QueryState },
    /// Candidates must be targets of relation `key` on `owner`
    RelatedTo { owner: Pointer, key: String },
}

#[derive(Debug, Clone, Copy)]
enum Comparison {
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
}

impl Comparison {
    fn accepts(self, ordering: Ordering) -> bool {
        match self {
            Comparison::Less => ordering == Ordering::Less,
            Comparison::LessOrEqual => ordering != Ordering::Greater,
            Comparison::Greater => ordering == Ordering::Greater,
            Comparison::GreaterOrEqual => ordering != Ordering::Less,
        }
    }
}

#[derive(Debug, Clone)]
enum Test {
    Equal(Value),
    NotEqual(Value),
    Compare(Comparison, Value),
    In(Vec<Value>),
    NotIn(Vec<Value>),
    All(Vec<Value>),
    Exists(bool),
    Regex(Regex),
    PointsInto { ids: HashSet<LocalId>, negate: bool },
}

#[derive(Debug, Clone)]
enum Node {
    All(Vec<Node>),
    Any(Vec<Node>),
    Field { key: String, test: Test },
    SelfIn(HashSet<LocalId>),
}

/// Compiled form of a query's constraints.
#[derive(Debug, Clone)]
pub struct Matcher {
    root: Node,
    ignore_acls: bool,
}

type Resolver<'a> = dyn FnMut(Subquery) -> Result<HashSet<LocalId>> + 'a;

impl Matcher {
    /// List the nested evaluations `state` needs, in compilation order.
    pub fn subqueries(state: &QueryState) -> Result<Vec<Subquery>> {
        let mut found = Vec::new();
        compile_conditions(&state.conditions, &mut |subquery| {
            found.push(subquery);
            Ok(HashSet::new())
        })?;
        Ok(found)
    }

    /// Compile `state`, taking one resolved id set per entry of
    /// [`Matcher::subqueries`].
    pub fn compile(state: &QueryState, resolved: Vec<HashSet<LocalId>>) -> Result<Self> {
        let mut resolved = resolved.into_iter();
        let root = compile_conditions(&state.conditions, &mut |subquery| {
            resolved.next().ok_or_else(|| {
                Error::InvalidQuery(format!("unresolved nested query: {subquery:?}"))
            })
        })?;
        Ok(Self {
            root,
            ignore_acls: state.ignore_acls,
        })
    }

    /// True if `candidate` satisfies every constraint and is readable by
    /// `user_id`.
    pub fn matches(&self, candidate: &Candidate, user_id: Option<&str>) -> bool {
        if !self.ignore_acls && !has_read_access(&candidate.data, user_id) {
            return false;
        }
        eval(&self.root, candidate)
    }
}

fn compile_conditions(conditions: &Fields, resolve: &mut Resolver<'_>) -> Result<Node> {
    let mut nodes = Vec::with_capacity(conditions.len());
    for (key, value) in conditions {
        match key.as_str() {
            OR_KEY => {
                let clauses = value
                    .as_array()
                    .ok_or_else(|| Error::InvalidQuery("$or expects an array".into()))?;
                let mut branches = Vec::with_capacity(clauses.len());
                for clause in clauses {
                    let clause = clause.as_object().ok_or_else(|| {
                        Error::InvalidQuery("$or clauses must be objects".into())
                    })?;
                    branches.push(compile_conditions(clause, resolve)?);
                }
                nodes.push(Node::Any(branches));
            }
            RELATED_TO_KEY => {
                let owner = value
                    .get("object")
                    .and_then(Pointer::from_value)
                    .ok_or_else(|| Error::InvalidQuery("$relatedTo needs an object".into()))?;
                let relation_key = value
                    .get("key")
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::InvalidQuery("$relatedTo needs a key".into()))?;
                let ids = resolve(Subquery::RelatedTo {
                    owner,
                    key: relation_key.to_string(),
                })?;
                nodes.push(Node::SelfIn(ids));
            }
            other if other.starts_with('$') => {
                return Err(Error::InvalidQuery(format!("unsupported operator {other}")));
            }
            _ => match value.as_object() {
                Some(operators) if is_constraint_map(value) => {
                    for test in compile_operators(key, operators, resolve)? {
                        nodes.push(Node::Field {
                            key: key.clone(),
                            test,
                        });
                    }
                }
                _ => nodes.push(Node::Field {
                    key: key.clone(),
                    test: Test::Equal(value.clone()),
                }),
            },
        }
    }
    Ok(Node::All(nodes))
}

fn compile_operators(
    key: &str,
    operators: &Fields,
    resolve: &mut Resolver<'_>,
) -> Result<Vec<Test>> {
    let mut tests = Vec::with_capacity(operators.len());
    for (operator, argument) in operators {
        let test = match operator.as_str() {
            "$ne" => Test::NotEqual(argument.clone()),
            "$lt" => Test::Compare(Comparison::Less, argument.clone()),
            "$lte" => Test::Compare(Comparison::LessOrEqual, argument.clone()),
            "$gt" => Test::Compare(Comparison::Greater, argument.clone()),
            "$gte" => Test::Compare(Comparison::GreaterOrEqual, argument.clone()),
            "$in" => Test::In(list_argument(operator, argument)?),
            "$nin" => Test::NotIn(list_argument(operator, argument)?),
            "$all" => Test::All(list_argument(operator, argument)?),
            "$exists" => Test::Exists(argument.as_bool().ok_or_else(|| {
                Error::InvalidQuery("$exists expects a boolean".into())
            })?),
            "$regex" => {
                let options = operators.get("$options").and_then(Value::as_str);
                Test::Regex(compile_regex(argument, options.unwrap_or(""))?)
            }
            "$options" => {
                if !operators.contains_key("$regex") {
                    return Err(Error::InvalidQuery("$options without $regex".into()));
                }
                continue;
            }
            "$inQuery" | "$notInQuery" => {
                let query = QueryState::from_subquery_value(argument).ok_or_else(|| {
                    Error::InvalidQuery(format!("{operator} expects a className and where"))
                })?;
                let negate = operator == "$notInQuery";
                let subquery = if negate {
                    Subquery::NotInQuery {
                        key: key.to_string(),
                        query,
                    }
                } else {
                    Subquery::InQuery {
                        key: key.to_string(),
                        query,
                    }
                };
                Test::PointsInto {
                    ids: resolve(subquery)?,
                    negate,
                }
            }
            other => {
                return Err(Error::InvalidQuery(format!(
                    "unsupported operator {other} on key '{key}'"
                )))
            }
        };
        tests.push(test);
    }
    Ok(tests)
}

fn list_argument(operator: &str, argument: &Value) -> Result<Vec<Value>> {
    argument
        .as_array()
        .cloned()
        .ok_or_else(|| Error::InvalidQuery(format!("{operator} expects an array")))
}

fn compile_regex(pattern: &Value, options: &str) -> Result<Regex> {
    let pattern = pattern
        .as_str()
        .ok_or_else(|| Error::InvalidQuery("$regex expects a string".into()))?;
    let mut builder = RegexBuilder::new(pattern);
    for option in options.chars() {
        match option {
            'i' => builder.case_insensitive(true),
            'm' => builder.multi_line(true),
            's' => builder.dot_matches_new_line(true),
            'x' => builder.ignore_whitespace(true),
            other => {
                return Err(Error::InvalidQuery(format!("unsupported $options flag '{other}'")))
            }
        };
    }
    builder
        .build()
        .map_err(|err| Error::InvalidQuery(format!("invalid $regex: {err}")))
}

fn eval(node: &Node, candidate: &Candidate) -> bool {
    match node {
        Node::All(nodes) => nodes.iter().all(|node| eval(node, candidate)),
        Node::Any(nodes) => nodes.iter().any(|node| eval(node, candidate)),
        Node::SelfIn(ids) => ids.contains(&candidate.local_id),
        Node::Field { key, test } => {
            let value = candidate.value(key);
            check(test, value.as_deref())
        }
    }
}

fn present(value: Option<&Value>) -> Option<&Value> {
    value.filter(|v| !v.is_null())
}

fn equals(value: Option<&Value>, expected: &Value) -> bool {
    match present(value) {
        None => expected.is_null(),
        Some(Value::Array(items)) if !expected.is_array() => contains_value(items, expected),
        Some(actual) => values_equal(actual, expected),
    }
}

fn is_in(value: Option<&Value>, list: &[Value]) -> bool {
    match present(value) {
        None => false,
        Some(Value::Array(items)) => items.iter().any(|item| contains_value(list, item)),
        Some(actual) => contains_value(list, actual),
    }
}

fn points_into(value: Option<&Value>, ids: &HashSet<LocalId>) -> bool {
    let hit = |v: &Value| {
        Pointer::from_value(v)
            .and_then(|pointer| pointer.local_id)
            .is_some_and(|id| ids.contains(&id))
    };
    match present(value) {
        None => false,
        Some(Value::Array(items)) => items.iter().any(hit),
        Some(actual) => hit(actual),
    }
}

fn check(test: &Test, value: Option<&Value>) -> bool {
    match test {
        Test::Equal(expected) => equals(value, expected),
        Test::NotEqual(expected) => !equals(value, expected),
        Test::Compare(comparison, bound) => present(value)
            .and_then(|actual| compare_values(actual, bound))
            .is_some_and(|ordering| comparison.accepts(ordering)),
        Test::In(list) => is_in(value, list),
        Test::NotIn(list) => !is_in(value, list),
        Test::All(expected) => match present(value) {
            Some(Value::Array(items)) => expected.iter().all(|e| contains_value(items, e)),
            _ => false,
        },
        Test::Exists(wanted) => present(value).is_some() == *wanted,
        Test::Regex(regex) => present(value)
            .and_then(Value::as_str)
            .is_some_and(|text| regex.is_match(text)),
        Test::PointsInto { ids, negate } => points_into(value, ids) != *negate,
    }
}

fn acl_grants(data: &Fields, user_id: Option<&str>, permission: &str) -> bool {
    let Some(acl) = data.get(ACL_KEY).and_then(Value::as_object) else {
        return true;
    };
    let grants = |entry: &str| {
        acl.get(entry)
            .and_then(|rights| rights.get(permission))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    };
    grants(PUBLIC_ACCESS) || user_id.is_some_and(grants)
}

/// True if the object has no ACL, or its ACL lets everyone or `user_id` read.
/// Roles are not resolved.
pub fn has_read_access(data: &Fields, user_id: Option<&str>) -> bool {
    acl_grants(data, user_id, "read")
}

/// Write counterpart of [`has_read_access`].
pub fn has_write_access(data: &Fields, user_id: Option<&str>) -> bool {
    acl_grants(data, user_id, "write")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::sort_candidates;
    use serde_json::json;

    fn candidate(id: &str, data: Value) -> Candidate {
        Candidate::new(id, data.as_object().unwrap().clone())
    }

    fn matcher(state: &QueryState) -> Matcher {
        Matcher::compile(state, Vec::new()).unwrap()
    }

    #[test]
    fn greater_than_with_sort() {
        let objects = vec![
            candidate("a", json!({"score": 3})),
            candidate("b", json!({"score": 7})),
            candidate("c", json!({"title": "no score"})),
        ];
        let query = QueryState::builder("Post")
            .greater_than("score", json!(5))
            .order_by_ascending("score")
            .build();
        let m = matcher(&query);
        let mut hits: Vec<_> = objects.into_iter().filter(|c| m.matches(c, None)).collect();
        sort_candidates(&mut hits, &query.sort_keys, |c| c).unwrap();
        let ids: Vec<_> = hits.iter().map(|c| c.local_id.as_str()).collect();
        assert_eq!(ids, ["b"]);
    }

    #[test]
    fn equality_on_arrays_means_contains() {
        let c = candidate("a", json!({"tags": ["x", "y"], "n": 1}));
        let query = QueryState::builder("Post").equal_to("tags", json!("y")).build();
        assert!(matcher(&query).matches(&c, None));
        let query = QueryState::builder("Post").equal_to("n", json!(1.0)).build();
        assert!(matcher(&query).matches(&c, None));
        let query = QueryState::builder("Post").not_equal_to("tags", json!("z")).build();
        assert!(matcher(&query).matches(&c, None));
    }

    #[test]
    fn list_operators() {
        let c = candidate("a", json!({"tags": ["x", "y"], "kind": "k"}));
        let m = |q: QueryState| matcher(&q).matches(&c, None);
        assert!(m(QueryState::builder("T").contained_in("kind", vec![json!("k"), json!("j")]).build()));
        assert!(m(QueryState::builder("T").contained_in("tags", vec![json!("y")]).build()));
        assert!(m(QueryState::builder("T").not_contained_in("kind", vec![json!("j")]).build()));
        assert!(m(QueryState::builder("T").contains_all("tags", vec![json!("x"), json!("y")]).build()));
        assert!(!m(QueryState::builder("T").contains_all("tags", vec![json!("x"), json!("q")]).build()));
        assert!(!m(QueryState::builder("T").contained_in("missing", vec![json!(1)]).build()));
    }

    #[test]
    fn exists_and_dotted_keys() {
        let c = candidate("a", json!({"author": {"name": "Ann"}, "gone": null}));
        let m = |q: QueryState| matcher(&q).matches(&c, None);
        assert!(m(QueryState::builder("T").exists("author").build()));
        assert!(m(QueryState::builder("T").does_not_exist("gone").build()));
        assert!(m(QueryState::builder("T").equal_to("author.name", json!("Ann")).build()));
        assert!(!m(QueryState::builder("T").equal_to("author.age", json!(3)).build()));
    }

    #[test]
    fn regex_with_options() {
        let c = candidate("a", json!({"title": "Hello\nWorld"}));
        let m = |q: QueryState| matcher(&q).matches(&c, None);
        assert!(m(QueryState::builder("T").matches_regex("title", "^hello", "i").build()));
        assert!(!m(QueryState::builder("T").matches_regex("title", "^hello", "").build()));
        assert!(m(QueryState::builder("T").matches_regex("title", "^World", "m").build()));
        assert!(m(QueryState::builder("T").starts_with("title", "Hell").build()));

        let bad = QueryState::builder("T").matches_regex("title", "x", "q").build();
        assert!(Matcher::compile(&bad, Vec::new()).is_err());
    }

    #[test]
    fn or_clauses() {
        let a = candidate("a", json!({"n": 1}));
        let b = candidate("b", json!({"n": 5}));
        let query = QueryState::builder("T")
            .or(&[
                QueryState::builder("T").equal_to("n", json!(1)).build(),
                QueryState::builder("T").greater_than("n", json!(3)).build(),
            ])
            .build();
        let m = matcher(&query);
        assert!(m.matches(&a, None));
        assert!(m.matches(&b, None));
        assert!(!m.matches(&candidate("c", json!({"n": 2})), None));
    }

    #[test]
    fn nested_queries_resolve_in_order() {
        let users = QueryState::builder("User").equal_to("name", json!("ann")).build();
        let owner = Pointer::local("List", "l-1");
        let query = QueryState::builder("Post")
            .matches_query("author", &users)
            .related_to(&owner, "posts")
            .build();

        let subqueries = Matcher::subqueries(&query).unwrap();
        assert_eq!(subqueries.len(), 2);
        let mut resolved = Vec::new();
        for subquery in &subqueries {
            resolved.push(match subquery {
                Subquery::InQuery { .. } => HashSet::from(["u-1".to_string()]),
                Subquery::RelatedTo { .. } => HashSet::from(["p-1".to_string()]),
                Subquery::NotInQuery { .. } => HashSet::new(),
            });
        }
        let m = Matcher::compile(&query, resolved).unwrap();

        let author = Pointer::local("User", "u-1").to_value();
        assert!(m.matches(&candidate("p-1", json!({"author": author})), None));
        assert!(!m.matches(&candidate("p-2", json!({"author": author})), None));
        let other = Pointer::local("User", "u-2").to_value();
        assert!(!m.matches(&candidate("p-1", json!({"author": other})), None));

        assert!(Matcher::compile(&query, Vec::new()).is_err());
    }

    #[test]
    fn unsupported_operators_fail() {
        let mut query = QueryState::new("T");
        query
            .conditions
            .insert("loc".into(), json!({"$nearSphere": [0, 0]}));
        assert!(matches!(
            Matcher::compile(&query, Vec::new()),
            Err(Error::InvalidQuery(_))
        ));
        let mut query = QueryState::new("T");
        query.conditions.insert("$and".into(), json!([]));
        assert!(Matcher::compile(&query, Vec::new()).is_err());
    }

    #[test]
    fn metadata_keys() {
        let mut c = candidate("a", json!({}));
        c.object_id = Some("abc".into());
        let query = QueryState::builder("T").equal_to("objectId", json!("abc")).build();
        assert!(matcher(&query).matches(&c, None));
    }

    #[test]
    fn acl_filter() {
        let private = candidate(
            "a",
            json!({"ACL": {"u-1": {"read": true, "write": true}}}),
        );
        let public = candidate("b", json!({"ACL": {"*": {"read": true}}}));
        let open = candidate("c", json!({}));

        let query = QueryState::new("T");
        let m = matcher(&query);
        assert!(!m.matches(&private, None));
        assert!(m.matches(&private, Some("u-1")));
        assert!(m.matches(&public, None));
        assert!(m.matches(&open, None));

        let m = matcher(&QueryState::builder("T").ignore_acls().build());
        assert!(m.matches(&private, None));

        assert!(has_write_access(&private.data, Some("u-1")));
        assert!(!has_write_access(&public.data, Some("u-1")));
    }
}
