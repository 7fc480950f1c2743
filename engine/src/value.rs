//! Value conventions shared by objects, operations and queries.
//!
//! Field values are plain JSON. Special values are JSON objects tagged with a
//! `__type` key:
//!
//! - `{"__type": "Pointer", "className": "Post", "localId": "..."}` references
//!   another object. Stored and in-memory pointers always carry the `localId`;
//!   the remote `objectId` is only attached when a command goes on the wire.
//! - `{"__type": "Date", "iso": "2024-01-01T00:00:00.000Z"}`.
//! - `{"__type": "Relation", "className": "Tag", "objects": ["<localId>", ...]}`.

use crate::{error::Result, ClassName, Error, LocalId, ObjectId};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Number, Value};
use std::collections::BTreeSet;

/// Field map of an object.
pub type Fields = Map<String, Value>;

pub const TYPE_KEY: &str = "__type";
pub const POINTER_TYPE: &str = "Pointer";
pub const DATE_TYPE: &str = "Date";
pub const RELATION_TYPE: &str = "Relation";

/// A reference to another object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pointer {
    pub class_name: ClassName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_id: Option<LocalId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_id: Option<ObjectId>,
}

impl Pointer {
    /// Pointer to an object by its local identity.
    pub fn local(class_name: impl Into<ClassName>, local_id: impl Into<LocalId>) -> Self {
        Self {
            class_name: class_name.into(),
            local_id: Some(local_id.into()),
            object_id: None,
        }
    }

    /// Pointer to an object by its server id, as received from the remote service.
    pub fn remote(class_name: impl Into<ClassName>, object_id: impl Into<ObjectId>) -> Self {
        Self {
            class_name: class_name.into(),
            local_id: None,
            object_id: Some(object_id.into()),
        }
    }

    /// Parse a pointer out of a tagged JSON value.
    pub fn from_value(value: &Value) -> Option<Pointer> {
        let map = value.as_object()?;
        if map.get(TYPE_KEY)?.as_str()? != POINTER_TYPE {
            return None;
        }
        let class_name = map.get("className")?.as_str()?.to_string();
        let local_id = map
            .get("localId")
            .and_then(Value::as_str)
            .map(str::to_string);
        let object_id = map
            .get("objectId")
            .and_then(Value::as_str)
            .map(str::to_string);
        if local_id.is_none() && object_id.is_none() {
            return None;
        }
        Some(Pointer {
            class_name,
            local_id,
            object_id,
        })
    }

    /// Encode as a tagged JSON value.
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert(TYPE_KEY.into(), Value::String(POINTER_TYPE.into()));
        map.insert("className".into(), Value::String(self.class_name.clone()));
        if let Some(local_id) = &self.local_id {
            map.insert("localId".into(), Value::String(local_id.clone()));
        }
        if let Some(object_id) = &self.object_id {
            map.insert("objectId".into(), Value::String(object_id.clone()));
        }
        Value::Object(map)
    }

    /// True if both pointers reference the same object.
    pub fn same_target(&self, other: &Pointer) -> bool {
        if self.class_name != other.class_name {
            return false;
        }
        match (&self.local_id, &other.local_id) {
            (Some(a), Some(b)) => a == b,
            _ => matches!((&self.object_id, &other.object_id), (Some(a), Some(b)) if a == b),
        }
    }
}

/// Encode a timestamp as a tagged date value.
pub fn date_value(at: DateTime<Utc>) -> Value {
    json!({
        TYPE_KEY: DATE_TYPE,
        "iso": at.to_rfc3339_opts(SecondsFormat::Millis, true),
    })
}

/// Parse a tagged date value.
pub fn parse_date(value: &Value) -> Option<DateTime<Utc>> {
    let map = value.as_object()?;
    if map.get(TYPE_KEY)?.as_str()? != DATE_TYPE {
        return None;
    }
    let iso = map.get("iso")?.as_str()?;
    DateTime::parse_from_rfc3339(iso)
        .ok()
        .map(|at| at.with_timezone(&Utc))
}

/// Encode a relation with its locally known targets.
pub fn relation_value(class_name: &str, targets: &BTreeSet<LocalId>) -> Value {
    json!({
        TYPE_KEY: RELATION_TYPE,
        "className": class_name,
        "objects": targets.iter().cloned().collect::<Vec<_>>(),
    })
}

/// Parse a relation value into its target class and locally known targets.
pub fn parse_relation(value: &Value) -> Option<(ClassName, BTreeSet<LocalId>)> {
    let map = value.as_object()?;
    if map.get(TYPE_KEY)?.as_str()? != RELATION_TYPE {
        return None;
    }
    let class_name = map.get("className")?.as_str()?.to_string();
    let targets = map
        .get("objects")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    Some((class_name, targets))
}

fn type_tag(value: &Value) -> Option<&str> {
    value.as_object()?.get(TYPE_KEY)?.as_str()
}

/// Name of the kind of a value, used in error messages.
pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "Null",
        Value::Bool(_) => "Bool",
        Value::Number(_) => "Number",
        Value::String(_) => "String",
        Value::Array(_) => "Array",
        Value::Object(_) => match type_tag(value) {
            Some(POINTER_TYPE) => "Pointer",
            Some(DATE_TYPE) => "Date",
            Some(RELATION_TYPE) => "Relation",
            _ => "Object",
        },
    }
}

/// Add two numeric values, keeping integers exact when possible.
pub fn add_numbers(a: &Value, b: &Value) -> Option<Value> {
    let (Value::Number(a), Value::Number(b)) = (a, b) else {
        return None;
    };
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        if let Some(sum) = x.checked_add(y) {
            return Some(Value::Number(sum.into()));
        }
    }
    let sum = a.as_f64()? + b.as_f64()?;
    Number::from_f64(sum).map(Value::Number)
}

/// Equality used by query matching and array operations.
///
/// Pointers compare by target, dates by instant and numbers by value, so
/// `1` equals `1.0`.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    if let (Some(p), Some(q)) = (Pointer::from_value(a), Pointer::from_value(b)) {
        return p.same_target(&q);
    }
    if let (Some(x), Some(y)) = (parse_date(a), parse_date(b)) {
        return x == y;
    }
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x == y;
    }
    a == b
}

/// True if `list` holds a value equal to `value`.
pub fn contains_value(list: &[Value], value: &Value) -> bool {
    list.iter().any(|item| values_equal(item, value))
}

/// Look up a possibly dotted key (`"author.name"`) in a field map.
pub fn value_at_path<'a>(fields: &'a Fields, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = fields.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

/// Visit every pointer nested anywhere in `value`.
///
/// Relation values are not traversed; their targets are not part of the
/// owning object's data.
pub fn visit_pointers(value: &Value, visit: &mut impl FnMut(Pointer)) {
    match value {
        Value::Array(items) => {
            for item in items {
                visit_pointers(item, visit);
            }
        }
        Value::Object(map) => {
            if let Some(pointer) = Pointer::from_value(value) {
                visit(pointer);
                return;
            }
            if type_tag(value).is_some() {
                return;
            }
            for item in map.values() {
                visit_pointers(item, visit);
            }
        }
        _ => {}
    }
}

/// Rewrite every pointer nested anywhere in `value`.
pub fn map_pointers(value: Value, rewrite: &mut impl FnMut(Pointer) -> Result<Pointer>) -> Result<Value> {
    match value {
        Value::Array(items) => items
            .into_iter()
            .map(|item| map_pointers(item, rewrite))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        Value::Object(map) if map.contains_key(TYPE_KEY) => {
            let value = Value::Object(map);
            match Pointer::from_value(&value) {
                Some(pointer) => Ok(rewrite(pointer)?.to_value()),
                None => Ok(value),
            }
        }
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, item) in map {
                out.insert(key, map_pointers(item, rewrite)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other),
    }
}

/// Require a value to be an array, naming the field for the error.
pub fn expect_array<'a>(field: &str, value: &'a Value) -> Result<&'a Vec<Value>> {
    value.as_array().ok_or_else(|| Error::TypeMismatch {
        field: field.to_string(),
        expected: "Array".into(),
        got: json_type_name(value).into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn pointer_roundtrip() {
        let pointer = Pointer::local("Post", "u-1");
        let value = pointer.to_value();
        assert_eq!(value["__type"], "Pointer");
        assert_eq!(value["localId"], "u-1");
        assert!(value.get("objectId").is_none());
        assert_eq!(Pointer::from_value(&value), Some(pointer));
    }

    #[test]
    fn pointer_requires_identity() {
        let value = json!({"__type": "Pointer", "className": "Post"});
        assert_eq!(Pointer::from_value(&value), None);
    }

    #[test]
    fn same_target_prefers_local_id() {
        let a = Pointer {
            class_name: "Post".into(),
            local_id: Some("u-1".into()),
            object_id: Some("abc".into()),
        };
        let b = Pointer::local("Post", "u-1");
        let c = Pointer::remote("Post", "abc");
        assert!(a.same_target(&b));
        assert!(a.same_target(&c));
        assert!(!b.same_target(&c));
        assert!(!b.same_target(&Pointer::local("Comment", "u-1")));
    }

    #[test]
    fn dates_parse_and_compare() {
        let at = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let value = date_value(at);
        assert_eq!(value["iso"], "2024-01-02T03:04:05.000Z");
        assert_eq!(parse_date(&value), Some(at));
        let same = json!({"__type": "Date", "iso": "2024-01-02T03:04:05Z"});
        assert!(values_equal(&value, &same));
    }

    #[test]
    fn number_addition() {
        assert_eq!(add_numbers(&json!(2), &json!(3)), Some(json!(5)));
        assert_eq!(add_numbers(&json!(1.5), &json!(1)), Some(json!(2.5)));
        assert_eq!(add_numbers(&json!("2"), &json!(1)), None);
        assert!(values_equal(&json!(1), &json!(1.0)));
    }

    #[test]
    fn dotted_paths() {
        let fields = json!({"author": {"name": "Ann"}}).as_object().unwrap().clone();
        assert_eq!(value_at_path(&fields, "author.name"), Some(&json!("Ann")));
        assert_eq!(value_at_path(&fields, "author.age"), None);
    }

    #[test]
    fn visits_nested_pointers_but_not_relations() {
        let value = json!({
            "a": Pointer::local("A", "1").to_value(),
            "list": [Pointer::local("B", "2").to_value(), 3],
            "map": {"inner": Pointer::local("C", "3").to_value()},
            "rel": relation_value("D", &BTreeSet::from(["4".to_string()])),
        });
        let mut seen = Vec::new();
        visit_pointers(&value, &mut |p| seen.push(p.local_id.unwrap()));
        seen.sort();
        assert_eq!(seen, vec!["1", "2", "3"]);
    }

    #[test]
    fn map_pointers_rewrites_in_place() {
        let value = json!({"list": [Pointer::local("A", "1").to_value()]});
        let mapped = map_pointers(value, &mut |mut p| {
            p.object_id = Some("srv-1".into());
            Ok(p)
        })
        .unwrap();
        assert_eq!(mapped["list"][0]["objectId"], "srv-1");
        assert_eq!(mapped["list"][0]["localId"], "1");
    }
}
