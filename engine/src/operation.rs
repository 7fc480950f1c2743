//! Field-level operations.
//!
//! Local edits are not written into an object's data directly. Each edit is a
//! [`FieldOperation`] queued against a key; the confirmed value is folded
//! through the queued operations to estimate the current value, and the
//! operations themselves are what gets sent to the remote service.

use crate::value::{
    add_numbers, contains_value, expect_array, json_type_name, parse_relation, relation_value,
};
use crate::{error::Result, ClassName, Error, LocalId};
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use std::collections::BTreeSet;

/// A modification to a single field of an object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "__op")]
pub enum FieldOperation {
    /// Replace the value.
    Set { value: Value },
    /// Remove the field.
    Delete,
    /// Add a number to a numeric field.
    Increment { amount: Number },
    /// Append objects to an array field.
    Add { objects: Vec<Value> },
    /// Append objects not already present in an array field.
    AddUnique { objects: Vec<Value> },
    /// Remove every occurrence of the objects from an array field.
    Remove { objects: Vec<Value> },
    /// Modify the target set of a relation field.
    Relation {
        #[serde(rename = "className")]
        target_class: ClassName,
        #[serde(default)]
        adds: BTreeSet<LocalId>,
        #[serde(default)]
        removes: BTreeSet<LocalId>,
    },
}

impl FieldOperation {
    pub fn set(value: Value) -> Self {
        FieldOperation::Set { value }
    }

    pub fn increment(amount: impl Into<Number>) -> Self {
        FieldOperation::Increment {
            amount: amount.into(),
        }
    }

    pub fn add(objects: Vec<Value>) -> Self {
        FieldOperation::Add { objects }
    }

    pub fn add_unique(objects: Vec<Value>) -> Self {
        FieldOperation::AddUnique { objects }
    }

    pub fn remove(objects: Vec<Value>) -> Self {
        FieldOperation::Remove { objects }
    }

    pub fn add_relation(
        target_class: impl Into<ClassName>,
        targets: impl IntoIterator<Item = LocalId>,
    ) -> Self {
        FieldOperation::Relation {
            target_class: target_class.into(),
            adds: targets.into_iter().collect(),
            removes: BTreeSet::new(),
        }
    }

    pub fn remove_relation(
        target_class: impl Into<ClassName>,
        targets: impl IntoIterator<Item = LocalId>,
    ) -> Self {
        FieldOperation::Relation {
            target_class: target_class.into(),
            adds: BTreeSet::new(),
            removes: targets.into_iter().collect(),
        }
    }

    /// Short name of the operation kind.
    pub fn name(&self) -> &'static str {
        match self {
            FieldOperation::Set { .. } => "Set",
            FieldOperation::Delete => "Delete",
            FieldOperation::Increment { .. } => "Increment",
            FieldOperation::Add { .. } => "Add",
            FieldOperation::AddUnique { .. } => "AddUnique",
            FieldOperation::Remove { .. } => "Remove",
            FieldOperation::Relation { .. } => "Relation",
        }
    }

    /// Estimate the new value of `key` after applying this operation to `old`.
    ///
    /// `None` means the field is absent.
    pub fn apply(&self, key: &str, old: Option<&Value>) -> Result<Option<Value>> {
        let old = old.filter(|v| !v.is_null());
        match self {
            FieldOperation::Set { value } => Ok(Some(value.clone())),
            FieldOperation::Delete => Ok(None),
            FieldOperation::Increment { amount } => {
                let amount = Value::Number(amount.clone());
                match old {
                    None => Ok(Some(amount)),
                    Some(current) => add_numbers(current, &amount)
                        .map(Some)
                        .ok_or_else(|| type_mismatch(key, "Number", current)),
                }
            }
            FieldOperation::Add { objects } => {
                let mut list = match old {
                    None => Vec::new(),
                    Some(current) => expect_array(key, current)?.clone(),
                };
                list.extend(objects.iter().cloned());
                Ok(Some(Value::Array(list)))
            }
            FieldOperation::AddUnique { objects } => {
                let mut list = match old {
                    None => Vec::new(),
                    Some(current) => expect_array(key, current)?.clone(),
                };
                for object in objects {
                    if !contains_value(&list, object) {
                        list.push(object.clone());
                    }
                }
                Ok(Some(Value::Array(list)))
            }
            FieldOperation::Remove { objects } => {
                let list = match old {
                    None => Vec::new(),
                    Some(current) => expect_array(key, current)?
                        .iter()
                        .filter(|item| !contains_value(objects, item))
                        .cloned()
                        .collect(),
                };
                Ok(Some(Value::Array(list)))
            }
            FieldOperation::Relation {
                target_class,
                adds,
                removes,
            } => {
                let mut targets = match old {
                    None => BTreeSet::new(),
                    Some(current) => match parse_relation(current) {
                        Some((class_name, targets)) if &class_name == target_class => targets,
                        Some((class_name, _)) => {
                            return Err(Error::InvalidOperation(format!(
                                "relation '{key}' targets {class_name}, not {target_class}"
                            )))
                        }
                        None => return Err(type_mismatch(key, "Relation", current)),
                    },
                };
                targets.extend(adds.iter().cloned());
                targets.retain(|target| !removes.contains(target));
                Ok(Some(relation_value(target_class, &targets)))
            }
        }
    }

    /// Combine this operation with the operation that preceded it on the same
    /// key, producing one operation with the effect of both.
    ///
    /// Neither input is modified.
    pub fn merge_with_previous(
        &self,
        key: &str,
        previous: Option<&FieldOperation>,
    ) -> Result<FieldOperation> {
        let Some(previous) = previous else {
            return Ok(self.clone());
        };
        let incompatible = || Error::merge_type(key, previous.name(), self.name());

        match (previous, self) {
            (_, FieldOperation::Set { .. }) | (_, FieldOperation::Delete) => Ok(self.clone()),

            (FieldOperation::Set { value }, next) => {
                if matches!(next, FieldOperation::Relation { .. }) {
                    return Err(incompatible());
                }
                let merged = next.apply(key, Some(value)).map_err(|_| incompatible())?;
                Ok(FieldOperation::Set {
                    value: merged.unwrap_or(Value::Null),
                })
            }
            (FieldOperation::Delete, next) => {
                if matches!(next, FieldOperation::Relation { .. }) {
                    return Err(incompatible());
                }
                let merged = next.apply(key, None).map_err(|_| incompatible())?;
                Ok(FieldOperation::Set {
                    value: merged.unwrap_or(Value::Null),
                })
            }

            (
                FieldOperation::Increment { amount: before },
                FieldOperation::Increment { amount },
            ) => {
                let sum = add_numbers(&Value::Number(before.clone()), &Value::Number(amount.clone()))
                    .ok_or_else(incompatible)?;
                match sum {
                    Value::Number(amount) => Ok(FieldOperation::Increment { amount }),
                    _ => Err(incompatible()),
                }
            }

            (FieldOperation::Add { objects: before }, FieldOperation::Add { objects }) => {
                let mut merged = before.clone();
                merged.extend(objects.iter().cloned());
                Ok(FieldOperation::Add { objects: merged })
            }
            (FieldOperation::Add { objects: before }, FieldOperation::AddUnique { objects })
            | (FieldOperation::AddUnique { objects: before }, FieldOperation::AddUnique { objects }) => {
                Ok(FieldOperation::AddUnique {
                    objects: union(before, objects),
                })
            }
            (FieldOperation::Add { objects: before }, FieldOperation::Remove { objects }) => {
                Ok(FieldOperation::Add {
                    objects: before
                        .iter()
                        .filter(|item| !contains_value(objects, item))
                        .cloned()
                        .collect(),
                })
            }
            (FieldOperation::Remove { objects: before }, FieldOperation::Remove { objects }) => {
                Ok(FieldOperation::Remove {
                    objects: union(before, objects),
                })
            }

            (
                FieldOperation::Relation {
                    target_class: before_class,
                    adds: adds_before,
                    removes: removes_before,
                },
                FieldOperation::Relation {
                    target_class,
                    adds,
                    removes,
                },
            ) => {
                if before_class != target_class {
                    return Err(incompatible());
                }
                // An add cancels a pending remove of the same target and vice
                // versa; the cancelled target is not carried into either set.
                let merged_adds = adds_before
                    .difference(removes)
                    .chain(adds.difference(removes_before))
                    .cloned()
                    .collect();
                let merged_removes = removes_before
                    .difference(adds)
                    .chain(removes.difference(adds_before))
                    .cloned()
                    .collect();
                Ok(FieldOperation::Relation {
                    target_class: target_class.clone(),
                    adds: merged_adds,
                    removes: merged_removes,
                })
            }

            _ => Err(incompatible()),
        }
    }
}

fn union(before: &[Value], objects: &[Value]) -> Vec<Value> {
    let mut merged: Vec<Value> = Vec::with_capacity(before.len() + objects.len());
    for object in before.iter().chain(objects) {
        if !contains_value(&merged, object) {
            merged.push(object.clone());
        }
    }
    merged
}

fn type_mismatch(key: &str, expected: &str, got: &Value) -> Error {
    Error::TypeMismatch {
        field: key.to_string(),
        expected: expected.to_string(),
        got: json_type_name(got).to_string(),
    }
}
