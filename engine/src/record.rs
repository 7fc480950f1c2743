//! Stored object rows.
//!
//! One [`LocalObjectRecord`] exists per locally known object. Its payload holds
//! the confirmed fields together with the pending operation sets, so unsent
//! edits survive a restart.

use crate::{error::Result, ClassName, Error, LocalId, ObjectId, ObjectState, OperationSet};
use crate::value::Fields;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// JSON payload stored in an object row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowPayload {
    /// Server-confirmed field values
    #[serde(default)]
    pub fields: Fields,
    /// Pending operation sets, oldest first, ending with the current one
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operations: Vec<OperationSet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Whether `fields` holds the full object
    #[serde(default)]
    pub complete: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
}

/// A stored object row.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalObjectRecord {
    /// Stable local identity, generated once
    pub local_id: LocalId,
    /// Class this object belongs to
    pub class_name: ClassName,
    /// Server-assigned ID, set once after the first successful create
    pub object_id: Option<ObjectId>,
    pub payload: RowPayload,
    /// A delete has been queued for this object
    pub is_deleting_eventually: bool,
    /// When the row was last written
    pub updated_at: DateTime<Utc>,
}

impl LocalObjectRecord {
    /// Capture an object's state for writing.
    pub fn from_state(
        local_id: impl Into<LocalId>,
        state: &ObjectState,
        is_deleting_eventually: bool,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            local_id: local_id.into(),
            class_name: state.class_name.clone(),
            object_id: state.object_id.clone(),
            payload: RowPayload {
                fields: state.server_data.clone(),
                operations: state.operation_sets().cloned().collect(),
                created_at: state.created_at,
                updated_at: state.updated_at,
                complete: state.complete,
                deleted: state.deleted,
            },
            is_deleting_eventually,
            updated_at: now,
        }
    }

    /// Decode a row's columns.
    pub fn from_row(
        local_id: impl Into<LocalId>,
        class_name: impl Into<ClassName>,
        object_id: Option<ObjectId>,
        json: &str,
        is_deleting_eventually: bool,
        updated_at: DateTime<Utc>,
    ) -> Result<Self> {
        let local_id = local_id.into();
        let payload = if json.trim().is_empty() {
            RowPayload::empty()
        } else {
            serde_json::from_str(json)
                .map_err(|err| Error::InvalidPayload(format!("row {local_id}: {err}")))?
        };
        Ok(Self {
            local_id,
            class_name: class_name.into(),
            object_id,
            payload,
            is_deleting_eventually,
            updated_at,
        })
    }

    /// Encode the payload column.
    pub fn payload_json(&self) -> Result<String> {
        serde_json::to_string(&self.payload)
            .map_err(|err| Error::InvalidPayload(format!("row {}: {err}", self.local_id)))
    }

    /// Rebuild the object's state.
    pub fn to_state(&self) -> ObjectState {
        ObjectState::from_parts(
            self.class_name.clone(),
            self.object_id.clone(),
            self.payload.created_at,
            self.payload.updated_at,
            self.payload.fields.clone(),
            self.payload.complete,
            self.payload.deleted,
            self.payload.operations.clone(),
        )
    }
}

impl RowPayload {
    /// Payload of a row inserted before the object has any data.
    pub fn empty() -> Self {
        Self {
            fields: Fields::new(),
            operations: Vec::new(),
            created_at: None,
            updated_at: None,
            complete: false,
            deleted: false,
        }
    }
}
