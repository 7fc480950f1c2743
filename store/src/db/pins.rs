//! Database operations for the pins and pin_members tables.

use super::Session;
use crate::error::Result;
use chrono::Utc;
use sqlx::Row;

/// Create a pin row if it does not exist yet.
pub async fn ensure_pin(session: &mut Session<'_>, name: &str) -> Result<()> {
    session
        .execute_cached(
            "INSERT OR IGNORE INTO pins (name, created_at) VALUES (?, ?)",
            &[name.into(), Utc::now().timestamp_millis().into()],
        )
        .await?;
    Ok(())
}

pub async fn add_member(session: &mut Session<'_>, pin: &str, uuid: &str) -> Result<()> {
    session
        .execute_cached(
            "INSERT OR IGNORE INTO pin_members (pin, uuid) VALUES (?, ?)",
            &[pin.into(), uuid.into()],
        )
        .await?;
    Ok(())
}

pub async fn remove_member(session: &mut Session<'_>, pin: &str, uuid: &str) -> Result<bool> {
    let removed = session
        .execute_cached(
            "DELETE FROM pin_members WHERE pin = ? AND uuid = ?",
            &[pin.into(), uuid.into()],
        )
        .await?;
    Ok(removed > 0)
}

/// Remove every membership of `uuid`.
pub async fn remove_memberships(session: &mut Session<'_>, uuid: &str) -> Result<()> {
    session
        .execute_cached("DELETE FROM pin_members WHERE uuid = ?", &[uuid.into()])
        .await?;
    Ok(())
}

/// Delete a pin; its memberships go with it.
pub async fn delete_pin(session: &mut Session<'_>, name: &str) -> Result<bool> {
    let deleted = session
        .execute_cached("DELETE FROM pins WHERE name = ?", &[name.into()])
        .await?;
    Ok(deleted > 0)
}

pub async fn pin_names(session: &mut Session<'_>) -> Result<Vec<String>> {
    session
        .query_map("SELECT name FROM pins ORDER BY name", &[], |row| {
            Ok(row.try_get("name")?)
        })
        .await
}

/// Members of `pin` in insertion order.
pub async fn pin_members(session: &mut Session<'_>, pin: &str) -> Result<Vec<String>> {
    session
        .query_map(
            "SELECT uuid FROM pin_members WHERE pin = ? ORDER BY rowid",
            &[pin.into()],
            |row| Ok(row.try_get("uuid")?),
        )
        .await
}

/// Pins `uuid` belongs to.
pub async fn pins_of(session: &mut Session<'_>, uuid: &str) -> Result<Vec<String>> {
    session
        .query_map(
            "SELECT pin FROM pin_members WHERE uuid = ? ORDER BY pin",
            &[uuid.into()],
            |row| Ok(row.try_get("pin")?),
        )
        .await
}

/// Rows that belong to no pin.
pub async fn unpinned_objects(session: &mut Session<'_>) -> Result<Vec<String>> {
    session
        .query_map(
            r#"
            SELECT o.uuid FROM objects o
            WHERE NOT EXISTS (SELECT 1 FROM pin_members m WHERE m.uuid = o.uuid)
            "#,
            &[],
            |row| Ok(row.try_get("uuid")?),
        )
        .await
}

pub async fn delete_all_pins(session: &mut Session<'_>) -> Result<()> {
    session.execute("DELETE FROM pin_members", &[]).await?;
    session.execute("DELETE FROM pins", &[]).await?;
    Ok(())
}
