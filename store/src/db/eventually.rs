//! Database operations for the eventually_pins table.

use super::Session;
use crate::error::Result;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

/// A stored queued command.
#[derive(Debug, Clone, PartialEq)]
pub struct EventuallyRow {
    pub uuid: String,
    pub kind: String,
    pub target_uuid: Option<String>,
    pub operation_set_uuid: Option<String>,
    pub session_token: Option<String>,
    pub created_at: i64,
    pub seq: i64,
    pub command: String,
}

impl<'r> sqlx::FromRow<'r, SqliteRow> for EventuallyRow {
    fn from_row(row: &'r SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        Ok(EventuallyRow {
            uuid: row.try_get("uuid")?,
            kind: row.try_get("kind")?,
            target_uuid: row.try_get("target_uuid")?,
            operation_set_uuid: row.try_get("operation_set_uuid")?,
            session_token: row.try_get("session_token")?,
            created_at: row.try_get("created_at")?,
            seq: row.try_get("seq")?,
            command: row.try_get("command")?,
        })
    }
}

const EVENTUALLY_COLUMNS: &str =
    "uuid, kind, target_uuid, operation_set_uuid, session_token, created_at, seq, command";

pub async fn insert_eventually(session: &mut Session<'_>, row: &EventuallyRow) -> Result<()> {
    session
        .execute_cached(
            &format!(
                "INSERT INTO eventually_pins ({EVENTUALLY_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?)"
            ),
            &[
                row.uuid.as_str().into(),
                row.kind.as_str().into(),
                row.target_uuid.as_deref().into(),
                row.operation_set_uuid.as_deref().into(),
                row.session_token.as_deref().into(),
                row.created_at.into(),
                row.seq.into(),
                row.command.as_str().into(),
            ],
        )
        .await?;
    Ok(())
}

/// Every queued command in replay order.
pub async fn load_eventually(session: &mut Session<'_>) -> Result<Vec<EventuallyRow>> {
    session
        .query_as(
            &format!(
                "SELECT {EVENTUALLY_COLUMNS} FROM eventually_pins ORDER BY created_at, seq, uuid"
            ),
            &[],
        )
        .await
}

pub async fn first_eventually(session: &mut Session<'_>) -> Result<Option<EventuallyRow>> {
    session
        .query_one_as(
            &format!(
                "SELECT {EVENTUALLY_COLUMNS} FROM eventually_pins ORDER BY created_at, seq, uuid LIMIT 1"
            ),
            &[],
        )
        .await
}

pub async fn delete_eventually(session: &mut Session<'_>, uuid: &str) -> Result<bool> {
    let deleted = session
        .execute_cached("DELETE FROM eventually_pins WHERE uuid = ?", &[uuid.into()])
        .await?;
    Ok(deleted > 0)
}

/// Queued commands still referencing `target_uuid`.
pub async fn count_eventually_for(session: &mut Session<'_>, target_uuid: &str) -> Result<i64> {
    let counts = session
        .query_map(
            "SELECT COUNT(*) AS n FROM eventually_pins WHERE target_uuid = ?",
            &[target_uuid.into()],
            |row| Ok(row.try_get::<i64, _>("n")?),
        )
        .await?;
    Ok(counts.into_iter().next().unwrap_or(0))
}

pub async fn count_eventually(session: &mut Session<'_>) -> Result<i64> {
    let counts = session
        .query_map("SELECT COUNT(*) AS n FROM eventually_pins", &[], |row| {
            Ok(row.try_get::<i64, _>("n")?)
        })
        .await?;
    Ok(counts.into_iter().next().unwrap_or(0))
}

pub async fn delete_all_eventually(session: &mut Session<'_>) -> Result<()> {
    session.execute("DELETE FROM eventually_pins", &[]).await?;
    Ok(())
}
