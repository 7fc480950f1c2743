//! Object state: the confirmed snapshot plus the queue of pending edits.

use crate::value::{json_type_name, Fields};
use crate::{
    error::Result, ClassName, Error, FieldOperation, ObjectId, OperationSet,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;

/// Keys the remote service reports as object metadata rather than data.
pub const OBJECT_ID_KEY: &str = "objectId";
pub const CREATED_AT_KEY: &str = "createdAt";
pub const UPDATED_AT_KEY: &str = "updatedAt";

/// The state of one object.
///
/// `server_data` only ever holds what the remote service acknowledged. Local
/// edits live in operation sets: the current set collects new edits, every
/// pending set is frozen and waiting for its save to be acknowledged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectState {
    /// Class of the object
    pub class_name: ClassName,
    /// Server-assigned ID, once created remotely
    #[serde(default)]
    pub object_id: Option<ObjectId>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    /// Last acknowledged field values
    #[serde(default)]
    pub server_data: Fields,
    /// Whether `server_data` holds the full object rather than a bare pointer
    #[serde(default)]
    pub complete: bool,
    /// Whether the object was deleted remotely
    #[serde(default)]
    pub deleted: bool,
    /// Sets frozen for a save that has not been acknowledged, oldest first
    #[serde(default)]
    pending_sets: VecDeque<OperationSet>,
    /// Set collecting new edits
    #[serde(default)]
    current: OperationSet,
}

impl ObjectState {
    /// State of a new object that only exists locally.
    pub fn new(class_name: impl Into<ClassName>) -> Self {
        Self {
            class_name: class_name.into(),
            object_id: None,
            created_at: None,
            updated_at: None,
            server_data: Fields::new(),
            complete: true,
            deleted: false,
            pending_sets: VecDeque::new(),
            current: OperationSet::new(),
        }
    }

    /// State of an object known only by its server ID; its data has not been
    /// fetched.
    pub fn without_data(class_name: impl Into<ClassName>, object_id: impl Into<ObjectId>) -> Self {
        Self {
            object_id: Some(object_id.into()),
            complete: false,
            ..Self::new(class_name)
        }
    }

    /// Reassemble a state from stored parts. The last set, if any, becomes the
    /// current set.
    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        class_name: impl Into<ClassName>,
        object_id: Option<ObjectId>,
        created_at: Option<DateTime<Utc>>,
        updated_at: Option<DateTime<Utc>>,
        server_data: Fields,
        complete: bool,
        deleted: bool,
        mut operation_sets: Vec<OperationSet>,
    ) -> Self {
        let current = operation_sets.pop().unwrap_or_default();
        Self {
            class_name: class_name.into(),
            object_id,
            created_at,
            updated_at,
            server_data,
            complete,
            deleted,
            pending_sets: operation_sets.into(),
            current,
        }
    }

    /// The set collecting new edits.
    pub fn current_operations(&self) -> &OperationSet {
        &self.current
    }

    /// All queued sets, oldest first, ending with the current one.
    pub fn operation_sets(&self) -> impl Iterator<Item = &OperationSet> {
        self.pending_sets.iter().chain(std::iter::once(&self.current))
    }

    pub fn operation_set(&self, uuid: &str) -> Option<&OperationSet> {
        self.operation_sets().find(|set| set.uuid == uuid)
    }

    /// True if any queued set holds an edit.
    pub fn is_dirty(&self) -> bool {
        self.operation_sets().any(|set| !set.is_empty())
    }

    /// Best estimate of the current value of `key`.
    pub fn estimated_value(&self, key: &str) -> Option<Value> {
        let mut value = self.server_data.get(key).cloned();
        for set in self.operation_sets() {
            if let Some(operation) = set.get(key) {
                // An operation that no longer fits the confirmed value is left
                // out of the estimate; it still fails when it is sent.
                if let Ok(next) = operation.apply(key, value.as_ref()) {
                    value = next;
                }
            }
        }
        value
    }

    /// Best estimate of every field.
    pub fn estimated_data(&self) -> Fields {
        let mut data = self.server_data.clone();
        for set in self.operation_sets() {
            for (key, operation) in set.iter() {
                if let Ok(next) = operation.apply(key, data.get(key)) {
                    match next {
                        Some(value) => {
                            data.insert(key.clone(), value);
                        }
                        None => {
                            data.remove(key);
                        }
                    }
                }
            }
        }
        data
    }

    /// Queue an edit of `key`.
    ///
    /// The edit must fit the estimated value (no incrementing a string) and
    /// must merge with whatever is already queued for the key; otherwise the
    /// state is left unchanged.
    pub fn perform_operation(&mut self, key: &str, operation: FieldOperation) -> Result<()> {
        if matches!(key, OBJECT_ID_KEY | CREATED_AT_KEY | UPDATED_AT_KEY) {
            return Err(Error::InvalidOperation(format!("'{key}' is read-only")));
        }
        let current = self.estimated_value(key);
        operation.apply(key, current.as_ref())?;
        self.current.apply_operation(key, operation)
    }

    /// Freeze the current set for sending and start a fresh one.
    ///
    /// Sets left behind by a failed save that could not be folded forward are
    /// retried here first, so their merge error reaches the caller.
    pub fn begin_save(&mut self, is_save_eventually: bool) -> Result<OperationSet> {
        while let Some(index) = self.pending_sets.iter().position(|set| set.failed) {
            self.fold_forward(index)?;
        }
        self.current.is_save_eventually = is_save_eventually;
        let frozen = std::mem::take(&mut self.current);
        self.pending_sets.push_back(frozen.clone());
        Ok(frozen)
    }

    /// Fold the pending set at `index` into the set after it, keeping the
    /// later set's ID so queued commands that reference it still find it.
    fn fold_forward(&mut self, index: usize) -> Result<()> {
        let mut merged = self.pending_sets[index].clone();
        let next = self.pending_sets.get(index + 1).unwrap_or(&self.current);
        if let Err(err) = merged.merge_operation_set(next) {
            self.pending_sets[index].failed = true;
            return Err(err);
        }
        merged.uuid = next.uuid.clone();
        merged.is_save_eventually = next.is_save_eventually;
        merged.failed = false;
        match self.pending_sets.get_mut(index + 1) {
            Some(slot) => *slot = merged,
            None => self.current = merged,
        }
        self.pending_sets.remove(index);
        Ok(())
    }

    /// A save of the set `uuid` failed for good; carry its edits into the next
    /// save.
    ///
    /// If the edits do not merge, the set stays queued and flagged, and the
    /// next [`begin_save`](Self::begin_save) reports the error.
    pub fn rollback_failed_save(&mut self, uuid: &str) -> Result<()> {
        let index = self
            .pending_sets
            .iter()
            .position(|set| set.uuid == uuid)
            .ok_or_else(|| Error::OperationSetNotFound(uuid.to_string()))?;
        self.fold_forward(index)
    }

    /// The save of set `uuid` was acknowledged with `response`.
    ///
    /// The set's edits become confirmed data, the response is merged over
    /// them, and the set leaves the queue.
    pub fn apply_save_result(&mut self, uuid: &str, response: &Fields) -> Result<()> {
        let position = self.pending_sets.iter().position(|set| set.uuid == uuid);
        if let Some(set) = position.and_then(|index| self.pending_sets.remove(index)) {
            for (key, operation) in set.iter() {
                if let Ok(next) = operation.apply(key, self.server_data.get(key)) {
                    match next {
                        Some(value) => {
                            self.server_data.insert(key.clone(), value);
                        }
                        None => {
                            self.server_data.remove(key);
                        }
                    }
                }
            }
        }
        self.merge_from_server(response)
    }

    /// Merge data received from the remote service into the confirmed
    /// snapshot.
    pub fn merge_from_server(&mut self, data: &Fields) -> Result<()> {
        for (key, value) in data {
            match key.as_str() {
                OBJECT_ID_KEY => {
                    let object_id = value.as_str().ok_or_else(|| Error::TypeMismatch {
                        field: key.clone(),
                        expected: "String".into(),
                        got: json_type_name(value).into(),
                    })?;
                    match &self.object_id {
                        Some(existing) if existing != object_id => {
                            return Err(Error::InvalidOperation(format!(
                                "object id is already {existing}, refusing {object_id}"
                            )))
                        }
                        Some(_) => {}
                        None => self.object_id = Some(object_id.to_string()),
                    }
                }
                CREATED_AT_KEY => self.created_at = parse_timestamp(value),
                UPDATED_AT_KEY => self.updated_at = parse_timestamp(value),
                _ => {
                    self.server_data.insert(key.clone(), value.clone());
                }
            }
        }
        if self.updated_at.is_none() {
            self.updated_at = self.created_at;
        }
        self.complete = true;
        Ok(())
    }

    pub fn mark_deleted(&mut self) {
        self.deleted = true;
    }
}

/// Metadata timestamps arrive either as ISO strings or as tagged dates.
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(iso) => DateTime::parse_from_rfc3339(iso)
            .ok()
            .map(|at| at.with_timezone(&Utc)),
        other => crate::value::parse_date(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Fields {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn new_state_has_one_empty_set() {
        let state = ObjectState::new("Post");
        assert_eq!(state.operation_sets().count(), 1);
        assert!(!state.is_dirty());
        assert!(state.complete);
    }

    #[test]
    fn estimated_value_folds_every_set() {
        let mut state = ObjectState::new("Post");
        state.merge_from_server(&fields(json!({"score": 1}))).unwrap();
        state.perform_operation("score", FieldOperation::increment(2)).unwrap();
        state.begin_save(false).unwrap();
        state.perform_operation("score", FieldOperation::increment(3)).unwrap();

        assert_eq!(state.server_data["score"], json!(1));
        assert_eq!(state.estimated_value("score"), Some(json!(6)));
        assert_eq!(state.estimated_data()["score"], json!(6));
    }

    #[test]
    fn perform_operation_validates_against_estimate() {
        let mut state = ObjectState::new("Post");
        state.merge_from_server(&fields(json!({"title": "x"}))).unwrap();
        assert!(state
            .perform_operation("title", FieldOperation::increment(1))
            .is_err());
        assert!(!state.is_dirty());
        assert!(state
            .perform_operation("objectId", FieldOperation::set(json!("x")))
            .is_err());
    }

    #[test]
    fn begin_save_freezes_tail() {
        let mut state = ObjectState::new("Post");
        state.perform_operation("a", FieldOperation::set(json!(1))).unwrap();
        let frozen = state.begin_save(true).unwrap();
        assert!(frozen.is_save_eventually);
        assert_eq!(frozen.len(), 1);
        assert_eq!(state.operation_sets().count(), 2);
        assert!(state.current_operations().is_empty());

        // edits during the save accumulate separately
        state.perform_operation("a", FieldOperation::set(json!(2))).unwrap();
        assert_eq!(
            state.operation_set(&frozen.uuid).unwrap().get("a"),
            Some(&FieldOperation::set(json!(1)))
        );
    }

    #[test]
    fn save_result_confirms_operations() {
        let mut state = ObjectState::new("Post");
        state.perform_operation("n", FieldOperation::increment(2)).unwrap();
        let frozen = state.begin_save(false).unwrap();
        state
            .apply_save_result(
                &frozen.uuid,
                &fields(json!({"objectId": "abc", "createdAt": "2024-01-01T00:00:00.000Z"})),
            )
            .unwrap();

        assert_eq!(state.object_id.as_deref(), Some("abc"));
        assert_eq!(state.server_data["n"], json!(2));
        assert!(state.created_at.is_some());
        assert_eq!(state.operation_sets().count(), 1);
        assert!(!state.is_dirty());
    }

    #[test]
    fn object_id_is_immutable() {
        let mut state = ObjectState::without_data("Post", "abc");
        assert!(!state.complete);
        let err = state
            .merge_from_server(&fields(json!({"objectId": "other"})))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
    }

    #[test]
    fn rollback_folds_into_next_set_keeping_its_id() {
        let mut state = ObjectState::new("Post");
        state.perform_operation("n", FieldOperation::increment(1)).unwrap();
        let failed = state.begin_save(true).unwrap();
        state.perform_operation("n", FieldOperation::increment(2)).unwrap();
        let next_uuid = state.current_operations().uuid.clone();

        state.rollback_failed_save(&failed.uuid).unwrap();
        assert_eq!(state.operation_sets().count(), 1);
        assert_eq!(state.current_operations().uuid, next_uuid);
        assert_eq!(
            state.current_operations().get("n"),
            Some(&FieldOperation::increment(3))
        );
    }

    #[test]
    fn rollback_merge_error_surfaces_at_next_save() {
        let mut state = ObjectState::new("Post");
        state.perform_operation("v", FieldOperation::increment(1)).unwrap();
        let failed = state.begin_save(true).unwrap();
        // perform_operation would refuse this pair, so queue it directly
        state
            .current
            .operations
            .insert("v".into(), FieldOperation::add(vec![json!(1)]));

        assert!(state.rollback_failed_save(&failed.uuid).unwrap_err().is_merge_type());
        assert_eq!(state.operation_sets().count(), 2);
        let err = state.begin_save(false).unwrap_err();
        assert!(err.is_merge_type());
        assert!(state.operation_set(&failed.uuid).is_some());
    }

    #[test]
    fn serialization_roundtrip() {
        let mut state = ObjectState::new("Post");
        state.perform_operation("a", FieldOperation::set(json!(1))).unwrap();
        let json = serde_json::to_string(&state).unwrap();
        let parsed: ObjectState = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, state);
    }
}
