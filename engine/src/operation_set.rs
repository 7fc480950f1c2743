//! Operation sets: the pending edits that go out with one save.

use crate::value::Fields;
use crate::{error::Result, FieldOperation};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Unique identifier for an operation set.
pub type OperationSetId = String;

/// The field operations accumulated for one save of one object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationSet {
    /// Operation set ID
    pub uuid: OperationSetId,
    /// Whether this set was handed to the durable command queue
    #[serde(default)]
    pub is_save_eventually: bool,
    /// Last time an operation was added
    pub updated_at: DateTime<Utc>,
    /// A failed save could not be folded into the following set
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub failed: bool,
    /// Operations by key
    #[serde(default)]
    pub operations: BTreeMap<String, FieldOperation>,
}

impl Default for OperationSet {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationSet {
    /// Create an empty set with a fresh ID.
    pub fn new() -> Self {
        Self::with_uuid(uuid::Uuid::new_v4().to_string(), Utc::now())
    }

    /// Create an empty set with the given ID.
    pub fn with_uuid(uuid: impl Into<OperationSetId>, updated_at: DateTime<Utc>) -> Self {
        Self {
            uuid: uuid.into(),
            is_save_eventually: false,
            updated_at,
            failed: false,
            operations: BTreeMap::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&FieldOperation> {
        self.operations.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldOperation)> {
        self.operations.iter()
    }

    /// Record an operation on `key`, merging it over any operation already
    /// queued for that key.
    pub fn apply_operation(&mut self, key: &str, operation: FieldOperation) -> Result<()> {
        let merged = operation.merge_with_previous(key, self.operations.get(key))?;
        self.operations.insert(key.to_string(), merged);
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Fold a later set into this one, as if both had been performed in order.
    ///
    /// Either every key merges or this set is left untouched.
    pub fn merge_operation_set(&mut self, next: &OperationSet) -> Result<()> {
        let mut merged = self.operations.clone();
        for (key, operation) in &next.operations {
            let combined = operation.merge_with_previous(key, merged.get(key))?;
            merged.insert(key.clone(), combined);
        }
        self.operations = merged;
        self.is_save_eventually |= next.is_save_eventually;
        self.updated_at = self.updated_at.max(next.updated_at);
        Ok(())
    }

    /// Apply every operation to a field map.
    pub fn apply_to(&self, fields: &mut Fields) -> Result<()> {
        for (key, operation) in &self.operations {
            match operation.apply(key, fields.get(key))? {
                Some(value) => {
                    fields.insert(key.clone(), value);
                }
                None => {
                    fields.remove(key);
                }
            }
        }
        Ok(())
    }

    /// Encode the operations as a save body, `key -> operation`.
    pub fn to_body(&self) -> Value {
        let mut body = Map::with_capacity(self.operations.len());
        for (key, operation) in &self.operations {
            let encoded = match operation {
                FieldOperation::Set { value } => value.clone(),
                other => serde_json::to_value(other).unwrap_or(Value::Null),
            };
            body.insert(key.clone(), encoded);
        }
        Value::Object(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn operations_merge_per_key() {
        let mut set = OperationSet::new();
        set.apply_operation("score", FieldOperation::increment(1)).unwrap();
        set.apply_operation("score", FieldOperation::increment(2)).unwrap();
        assert_eq!(set.get("score"), Some(&FieldOperation::increment(3)));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn merge_error_leaves_set_untouched() {
        let mut set = OperationSet::new();
        set.apply_operation("name", FieldOperation::set(json!("a"))).unwrap();
        let err = set
            .apply_operation("name", FieldOperation::increment(1))
            .unwrap_err();
        assert!(err.is_merge_type());
        assert_eq!(set.get("name"), Some(&FieldOperation::set(json!("a"))));
    }

    #[test]
    fn merge_operation_set_is_all_or_nothing() {
        let mut base = OperationSet::new();
        base.apply_operation("a", FieldOperation::increment(1)).unwrap();
        base.apply_operation("b", FieldOperation::set(json!("x"))).unwrap();

        let mut next = OperationSet::new();
        next.apply_operation("a", FieldOperation::increment(2)).unwrap();
        next.apply_operation("b", FieldOperation::increment(1)).unwrap();

        assert!(base.merge_operation_set(&next).is_err());
        assert_eq!(base.get("a"), Some(&FieldOperation::increment(1)));

        let mut ok = OperationSet::new();
        ok.apply_operation("a", FieldOperation::increment(2)).unwrap();
        ok.is_save_eventually = true;
        base.merge_operation_set(&ok).unwrap();
        assert_eq!(base.get("a"), Some(&FieldOperation::increment(3)));
        assert!(base.is_save_eventually);
    }

    #[test]
    fn apply_to_fields() {
        let mut set = OperationSet::new();
        set.apply_operation("gone", FieldOperation::Delete).unwrap();
        set.apply_operation("n", FieldOperation::increment(5)).unwrap();
        let mut fields = json!({"gone": 1, "n": 1}).as_object().unwrap().clone();
        set.apply_to(&mut fields).unwrap();
        assert_eq!(Value::Object(fields), json!({"n": 6}));
    }

    #[test]
    fn body_encodes_set_as_plain_value() {
        let mut set = OperationSet::new();
        set.apply_operation("name", FieldOperation::set(json!("a"))).unwrap();
        set.apply_operation("n", FieldOperation::increment(1)).unwrap();
        assert_eq!(
            set.to_body(),
            json!({"name": "a", "n": {"__op": "Increment", "amount": 1}})
        );
    }
}
