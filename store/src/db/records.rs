//! Database operations for the objects table.

use super::Session;
use crate::error::Result;
use chrono::{DateTime, Utc};
use mooring_engine::LocalObjectRecord;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

/// A stored object row.
#[derive(Debug, Clone)]
pub struct ObjectRow {
    pub uuid: String,
    pub class_name: String,
    pub object_id: Option<String>,
    pub json: String,
    pub is_deleting_eventually: bool,
    pub updated_at: i64,
}

impl<'r> sqlx::FromRow<'r, SqliteRow> for ObjectRow {
    fn from_row(row: &'r SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        Ok(ObjectRow {
            uuid: row.try_get("uuid")?,
            class_name: row.try_get("class_name")?,
            object_id: row.try_get("object_id")?,
            json: row.try_get("json")?,
            is_deleting_eventually: row.try_get("is_deleting_eventually")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl ObjectRow {
    /// Decode the row into a record.
    pub fn to_record(&self) -> std::result::Result<LocalObjectRecord, mooring_engine::Error> {
        LocalObjectRecord::from_row(
            &self.uuid,
            &self.class_name,
            self.object_id.clone(),
            &self.json,
            self.is_deleting_eventually,
            DateTime::from_timestamp_millis(self.updated_at).unwrap_or_default(),
        )
    }
}

const OBJECT_COLUMNS: &str = "uuid, class_name, object_id, json, is_deleting_eventually, updated_at";

pub async fn find_object(session: &mut Session<'_>, uuid: &str) -> Result<Option<ObjectRow>> {
    session
        .query_one_as(
            &format!("SELECT {OBJECT_COLUMNS} FROM objects WHERE uuid = ?"),
            &[uuid.into()],
        )
        .await
}

pub async fn find_object_by_id(
    session: &mut Session<'_>,
    class_name: &str,
    object_id: &str,
) -> Result<Option<ObjectRow>> {
    session
        .query_one_as(
            &format!("SELECT {OBJECT_COLUMNS} FROM objects WHERE class_name = ? AND object_id = ?"),
            &[class_name.into(), object_id.into()],
        )
        .await
}

/// Rows of `class_name`, optionally restricted to members of `pin`.
pub async fn objects_in_class(
    session: &mut Session<'_>,
    class_name: &str,
    pin: Option<&str>,
) -> Result<Vec<ObjectRow>> {
    match pin {
        Some(pin) => {
            session
                .query_as(
                    r#"
                    SELECT o.uuid, o.class_name, o.object_id, o.json,
                           o.is_deleting_eventually, o.updated_at
                    FROM objects o
                    JOIN pin_members m ON m.uuid = o.uuid
                    WHERE o.class_name = ? AND m.pin = ?
                    ORDER BY o.rowid
                    "#,
                    &[class_name.into(), pin.into()],
                )
                .await
        }
        None => {
            session
                .query_as(
                    &format!(
                        "SELECT {OBJECT_COLUMNS} FROM objects WHERE class_name = ? ORDER BY rowid"
                    ),
                    &[class_name.into()],
                )
                .await
        }
    }
}

/// Insert an empty row for a new object. Returns false if the row exists.
pub async fn insert_empty_object(
    session: &mut Session<'_>,
    uuid: &str,
    class_name: &str,
    object_id: Option<&str>,
) -> Result<bool> {
    let inserted = session
        .execute_cached(
            r#"
            INSERT OR IGNORE INTO objects (uuid, class_name, object_id, json, updated_at)
            VALUES (?, ?, ?, '', ?)
            "#,
            &[
                uuid.into(),
                class_name.into(),
                object_id.into(),
                Utc::now().timestamp_millis().into(),
            ],
        )
        .await?;
    Ok(inserted > 0)
}

/// Insert or replace a record.
pub async fn upsert_object(session: &mut Session<'_>, record: &LocalObjectRecord) -> Result<()> {
    let json = record.payload_json()?;
    session
        .execute_cached(
            r#"
            INSERT INTO objects (uuid, class_name, object_id, json, is_deleting_eventually, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (uuid) DO UPDATE SET
                object_id = excluded.object_id,
                json = excluded.json,
                is_deleting_eventually = excluded.is_deleting_eventually,
                updated_at = excluded.updated_at
            "#,
            &[
                record.local_id.as_str().into(),
                record.class_name.as_str().into(),
                record.object_id.as_deref().into(),
                json.into(),
                record.is_deleting_eventually.into(),
                record.updated_at.timestamp_millis().into(),
            ],
        )
        .await?;
    Ok(())
}

/// Overwrite an existing record. Returns false if no row exists.
pub async fn update_object(session: &mut Session<'_>, record: &LocalObjectRecord) -> Result<bool> {
    let json = record.payload_json()?;
    let updated = session
        .execute_cached(
            r#"
            UPDATE objects
            SET object_id = ?, json = ?, is_deleting_eventually = ?, updated_at = ?
            WHERE uuid = ?
            "#,
            &[
                record.object_id.as_deref().into(),
                json.into(),
                record.is_deleting_eventually.into(),
                record.updated_at.timestamp_millis().into(),
                record.local_id.as_str().into(),
            ],
        )
        .await?;
    Ok(updated > 0)
}

pub async fn set_object_id(session: &mut Session<'_>, uuid: &str, object_id: &str) -> Result<()> {
    session
        .execute_cached(
            "UPDATE objects SET object_id = ? WHERE uuid = ?",
            &[object_id.into(), uuid.into()],
        )
        .await?;
    Ok(())
}

pub async fn set_deleting_eventually(
    session: &mut Session<'_>,
    uuid: &str,
    deleting: bool,
) -> Result<()> {
    session
        .execute_cached(
            "UPDATE objects SET is_deleting_eventually = ? WHERE uuid = ?",
            &[deleting.into(), uuid.into()],
        )
        .await?;
    Ok(())
}

/// Delete a row; its pin memberships go with it.
pub async fn delete_object(session: &mut Session<'_>, uuid: &str) -> Result<bool> {
    let deleted = session
        .execute_cached("DELETE FROM objects WHERE uuid = ?", &[uuid.into()])
        .await?;
    Ok(deleted > 0)
}

/// Row count per class.
pub async fn count_by_class(session: &mut Session<'_>) -> Result<Vec<(String, i64)>> {
    session
        .query_map(
            "SELECT class_name, COUNT(*) AS n FROM objects GROUP BY class_name ORDER BY class_name",
            &[],
            |row| Ok((row.try_get("class_name")?, row.try_get("n")?)),
        )
        .await
}

pub async fn delete_all_objects(session: &mut Session<'_>) -> Result<()> {
    session.execute("DELETE FROM objects", &[]).await?;
    Ok(())
}

