//! Named pins.
//!
//! A pin retains a set of objects on disk. Rows that belong to no pin and have
//! no live handle can be reclaimed by [`PinRegistry::collect_garbage`].

use crate::db::{self, Session};
use crate::error::Result;
use crate::objects::ObjectRef;
use crate::offline_store::{write_records, OfflineStore};
use chrono::Utc;
use mooring_engine::{LocalId, LocalObjectRecord};
use std::sync::Arc;

/// Pin used when no name is given.
pub const DEFAULT_PIN: &str = "_default";
/// Pin retaining the targets of queued commands.
pub const EVENTUALLY_PIN: &str = "_eventually";

/// Manages pin membership.
#[derive(Debug, Clone)]
pub struct PinRegistry {
    store: Arc<OfflineStore>,
}

impl PinRegistry {
    pub fn new(store: Arc<OfflineStore>) -> Self {
        Self { store }
    }

    /// Pin `objects` and everything reachable from them under `name`
    /// ([`DEFAULT_PIN`] if `None`).
    ///
    /// Every reachable object is written and added to the pin in one
    /// transaction.
    pub async fn pin(&self, objects: &[ObjectRef], name: Option<&str>) -> Result<()> {
        let name = name.unwrap_or(DEFAULT_PIN);
        let records = self.retained_records(objects).await?;

        let mut session = self.store.database().session().await?;
        session.begin().await?;
        let result = write_pin(&mut session, name, &records).await;
        session.finish(result).await?;

        tracing::debug!(pin = %name, roots = objects.len(), members = records.len(), "Pinned");
        Ok(())
    }

    /// Records of `objects` and everything reachable from them, as a pin
    /// would write them.
    pub(crate) async fn retained_records(&self, objects: &[ObjectRef]) -> Result<Vec<LocalObjectRecord>> {
        let graph = self.store.collect_graph(objects, true).await?;
        let now = Utc::now();
        Ok(graph.iter().map(|object| object.to_record(now)).collect())
    }

    /// Remove `objects` from the pin. Objects reachable from them stay
    /// pinned, and no row is deleted.
    pub async fn unpin(&self, objects: &[ObjectRef], name: Option<&str>) -> Result<()> {
        let name = name.unwrap_or(DEFAULT_PIN);
        let mut session = self.store.database().session().await?;
        session.begin().await?;
        let result = remove_pin_members(&mut session, name, objects).await;
        session.finish(result).await?;

        tracing::debug!(pin = %name, count = objects.len(), "Unpinned");
        Ok(())
    }

    /// Empty and delete the pin `name`.
    pub async fn unpin_all(&self, name: Option<&str>) -> Result<()> {
        let name = name.unwrap_or(DEFAULT_PIN);
        let mut session = self.store.database().session().await?;
        let existed = db::delete_pin(&mut session, name).await?;
        tracing::debug!(pin = %name, existed, "Unpinned all");
        Ok(())
    }

    /// Delete rows that belong to no pin and have no live handle. Returns the
    /// number of rows deleted.
    pub async fn collect_garbage(&self) -> Result<usize> {
        let mut session = self.store.database().session().await?;
        let candidates = db::unpinned_objects(&mut session).await?;
        let garbage: Vec<_> = candidates
            .into_iter()
            .filter(|uuid| !self.store.is_alive(uuid))
            .collect();
        if garbage.is_empty() {
            return Ok(0);
        }

        session.begin().await?;
        let result = delete_rows(&mut session, &garbage).await;
        session.finish(result).await?;

        tracing::info!(count = garbage.len(), "Collected unpinned objects");
        Ok(garbage.len())
    }

    pub async fn pin_names(&self) -> Result<Vec<String>> {
        let mut session = self.store.database().session().await?;
        db::pin_names(&mut session).await
    }

    /// Local ids of the members of `name`.
    pub async fn members(&self, name: &str) -> Result<Vec<LocalId>> {
        let mut session = self.store.database().session().await?;
        db::pin_members(&mut session, name).await
    }

    /// Pins `object` belongs to.
    pub async fn pins_of(&self, object: &ObjectRef) -> Result<Vec<String>> {
        let mut session = self.store.database().session().await?;
        db::pins_of(&mut session, object.local_id()).await
    }
}

pub(crate) async fn write_pin(session: &mut Session<'_>, name: &str, records: &[LocalObjectRecord]) -> Result<()> {
    db::ensure_pin(session, name).await?;
    write_records(session, records).await?;
    for record in records {
        db::add_member(session, name, &record.local_id).await?;
    }
    Ok(())
}

async fn remove_pin_members(session: &mut Session<'_>, name: &str, objects: &[ObjectRef]) -> Result<()> {
    for object in objects {
        db::remove_member(session, name, object.local_id()).await?;
    }
    Ok(())
}

async fn delete_rows(session: &mut Session<'_>, uuids: &[String]) -> Result<()> {
    for uuid in uuids {
        db::delete_object(session, uuid).await?;
    }
    Ok(())
}
