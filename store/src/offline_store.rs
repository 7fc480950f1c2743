//! The object graph store.
//!
//! Objects live in the `objects` table, one row per local id. Pointers inside
//! stored fields always name their target by local id, so a row stays valid
//! before and after its target is first created remotely.

use crate::db::{self, Database, Session};
use crate::error::{Result, StoreError};
use crate::objects::{IdentityMap, LocalObject, ObjectRef};
use chrono::Utc;
use mooring_engine::value::{map_pointers, visit_pointers, Fields};
use mooring_engine::{
    ClassRegistry, FieldOperation, LocalId, LocalObjectRecord, ObjectState, Pointer,
};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Disk-backed store of local objects.
#[derive(Debug)]
pub struct OfflineStore {
    db: Arc<Database>,
    identity: IdentityMap,
    registry: ClassRegistry,
}

impl OfflineStore {
    pub fn new(db: Arc<Database>, registry: ClassRegistry) -> Self {
        Self {
            db,
            identity: IdentityMap::new(),
            registry,
        }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn registry(&self) -> &ClassRegistry {
        &self.registry
    }

    pub fn identity(&self) -> &IdentityMap {
        &self.identity
    }

    /// True if a caller still holds the handle for `local_id`.
    pub fn is_alive(&self, local_id: &str) -> bool {
        self.identity.is_alive(local_id)
    }

    /// Create a new object that only exists locally. No row is written until
    /// it is saved or pinned.
    pub fn create_object(&self, class_name: &str) -> Result<ObjectRef> {
        self.registry.check_class(class_name)?;
        let local_id = uuid::Uuid::new_v4().to_string();
        Ok(self.identity.intern(&local_id, || {
            LocalObject::new(local_id.clone(), ObjectState::new(class_name), false)
        }))
    }

    /// Queue an edit after checking it against the class schema.
    pub fn perform_operation(
        &self,
        object: &LocalObject,
        key: &str,
        operation: FieldOperation,
    ) -> Result<()> {
        self.registry
            .validate_operation(object.class_name(), key, &operation)?;
        object.perform(key, operation)?;
        Ok(())
    }

    /// Make sure `object` has a row, inserting an empty one on first
    /// encounter.
    pub async fn get_or_create_uuid(&self, object: &LocalObject) -> Result<LocalId> {
        let object_id = object.object_id();
        let mut session = self.db.session().await?;
        let inserted = db::insert_empty_object(
            &mut session,
            object.local_id(),
            object.class_name(),
            object_id.as_deref(),
        )
        .await?;
        if inserted {
            tracing::debug!(uuid = %object.local_id(), class = %object.class_name(), "Object row created");
        }
        Ok(object.local_id().to_string())
    }

    /// Load the object stored under `uuid`.
    ///
    /// A live handle wins over the row, since it may carry edits that have not
    /// been written yet. Fails with [`StoreError::CacheMiss`] if neither
    /// exists.
    pub async fn load(&self, uuid: &str) -> Result<ObjectRef> {
        if let Some(live) = self.identity.get(uuid) {
            return Ok(live);
        }
        let row = {
            let mut session = self.db.session().await?;
            db::find_object(&mut session, uuid).await?
        };
        let row = row.ok_or(StoreError::CacheMiss)?;
        self.object_from_row(&row)
    }

    /// Like [`load`](Self::load), mapping a cache miss to `None`.
    pub async fn object_for_uuid(&self, uuid: &str) -> Result<Option<ObjectRef>> {
        match self.load(uuid).await {
            Ok(object) => Ok(Some(object)),
            Err(StoreError::CacheMiss) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Decode a row and intern its object, or return the live handle.
    pub(crate) fn object_from_row(&self, row: &db::ObjectRow) -> Result<ObjectRef> {
        if let Some(live) = self.identity.get(&row.uuid) {
            return Ok(live);
        }
        let record = row.to_record()?;
        self.registry
            .validate_fields(&record.class_name, &record.payload.fields)?;
        Ok(self
            .identity
            .intern(&record.local_id, || LocalObject::from_record(&record)))
    }

    /// Resolve a stored or received pointer to an object handle.
    pub async fn resolve_pointer(&self, pointer: &Pointer) -> Result<Option<ObjectRef>> {
        if let Some(local_id) = &pointer.local_id {
            return self.object_for_uuid(local_id).await;
        }
        match &pointer.object_id {
            Some(object_id) => self.find_by_object_id(&pointer.class_name, object_id).await,
            None => Ok(None),
        }
    }

    async fn find_by_object_id(&self, class_name: &str, object_id: &str) -> Result<Option<ObjectRef>> {
        if let Some(local_id) = self.identity.lookup(class_name, object_id) {
            if let Some(object) = self.object_for_uuid(&local_id).await? {
                return Ok(Some(object));
            }
        }
        let row = {
            let mut session = self.db.session().await?;
            db::find_object_by_id(&mut session, class_name, object_id).await?
        };
        row.map(|row| self.object_from_row(&row)).transpose()
    }

    /// Local id of the object with server id `object_id`, without loading or
    /// creating anything.
    pub(crate) async fn local_id_for(
        &self,
        class_name: &str,
        object_id: &str,
    ) -> Result<Option<LocalId>> {
        if let Some(local_id) = self.identity.lookup(class_name, object_id) {
            return Ok(Some(local_id));
        }
        let mut session = self.db.session().await?;
        Ok(db::find_object_by_id(&mut session, class_name, object_id)
            .await?
            .map(|row| row.uuid))
    }

    /// Handle for the object with server id `object_id`, creating a hollow
    /// one (no data fetched yet) if it is not known locally.
    pub async fn object_without_data(&self, class_name: &str, object_id: &str) -> Result<ObjectRef> {
        if let Some(object) = self.find_by_object_id(class_name, object_id).await? {
            return Ok(object);
        }
        self.registry.check_class(class_name)?;
        let local_id = uuid::Uuid::new_v4().to_string();
        let object = self.identity.intern(&local_id, || {
            LocalObject::new(
                local_id.clone(),
                ObjectState::without_data(class_name, object_id),
                false,
            )
        });
        self.get_or_create_uuid(&object).await?;
        Ok(object)
    }

    /// Load the stored data of `object` into it.
    ///
    /// Edits made in memory since the last write are kept on top of the
    /// stored data. Fails with [`StoreError::CacheMiss`] if nothing is stored
    /// for the object.
    pub async fn fetch_locally(&self, object: &ObjectRef) -> Result<Fields> {
        let row = {
            let mut session = self.db.session().await?;
            db::find_object(&mut session, object.local_id()).await?
        };
        let record = row.ok_or(StoreError::CacheMiss)?.to_record()?;
        if !record.payload.complete && record.payload.operations.iter().all(|set| set.is_empty()) {
            return Err(StoreError::CacheMiss);
        }
        self.registry
            .validate_fields(&record.class_name, &record.payload.fields)?;

        let stored = record.to_state();
        {
            let mut state = object.state();
            if state.is_dirty() {
                state.server_data = stored.server_data;
                state.created_at = stored.created_at.or(state.created_at);
                state.updated_at = stored.updated_at.or(state.updated_at);
                state.complete |= stored.complete;
                if state.object_id.is_none() {
                    state.object_id = stored.object_id;
                }
            } else {
                *state = stored;
            }
        }
        object.set_deleting_eventually(record.is_deleting_eventually);

        for local_id in object.pointer_targets() {
            if let Some(child) = self.object_for_uuid(&local_id).await? {
                object.cache_child(child);
            }
        }
        Ok(object.data())
    }

    /// Write a server-style field diff into the row `uuid`, assigning its
    /// server id on first create.
    pub async fn save(&self, uuid: &str, diff: &Fields, new_object_id: Option<&str>) -> Result<()> {
        let diff = match self.normalize_pointers(Value::Object(diff.clone())).await? {
            Value::Object(map) => map,
            _ => Fields::new(),
        };

        let mut session = self.db.session().await?;
        session.begin().await?;
        let result = write_diff(&mut session, uuid, &diff, new_object_id).await;
        let record = session.finish(result).await?;
        drop(session);

        if let Some(live) = self.identity.get(uuid) {
            live.state().merge_from_server(&diff)?;
            if let Some(object_id) = new_object_id {
                let mut state = live.state();
                if state.object_id.is_none() {
                    state.object_id = Some(object_id.to_string());
                }
            }
        }
        if let Some(object_id) = &record.object_id {
            self.identity.index(&record.class_name, object_id, uuid);
        }
        Ok(())
    }

    /// Write `object`, and optionally every object reachable from it, in one
    /// transaction. Returns the objects written.
    pub async fn save_locally(&self, object: &ObjectRef, include_children: bool) -> Result<Vec<ObjectRef>> {
        let graph = self
            .collect_graph(std::slice::from_ref(object), include_children)
            .await?;
        let records: Vec<_> = graph.iter().map(|o| o.to_record(Utc::now())).collect();

        let mut session = self.db.session().await?;
        session.begin().await?;
        let result = write_records(&mut session, &records).await;
        session.finish(result).await?;

        tracing::debug!(uuid = %object.local_id(), count = records.len(), "Saved locally");
        Ok(graph)
    }

    /// Rewrite the row of `object` if it exists. Returns false if there is no
    /// row.
    pub async fn update_data_for_object(&self, object: &LocalObject) -> Result<bool> {
        let record = object.to_record(Utc::now());
        let mut session = self.db.session().await?;
        db::update_object(&mut session, &record).await
    }

    /// Remove the row of `object` and all of its pin memberships.
    pub async fn delete_locally(&self, object: &LocalObject) -> Result<()> {
        let mut session = self.db.session().await?;
        session.begin().await?;
        let result = delete_row(&mut session, object.local_id()).await;
        let deleted = session.finish(result).await?;
        drop(session);

        if let Some(object_id) = object.object_id() {
            self.identity.unindex(object.class_name(), &object_id);
        }
        tracing::debug!(uuid = %object.local_id(), deleted, "Deleted locally");
        Ok(())
    }

    /// Record the server id assigned to `object`.
    ///
    /// A server id never changes once set: `old` must be unset or equal to
    /// `new`.
    pub async fn update_object_id(&self, object: &LocalObject, old: Option<&str>, new: &str) -> Result<()> {
        if let Some(old) = old {
            if old == new {
                return Ok(());
            }
            return Err(mooring_engine::Error::InvalidOperation(format!(
                "object id is already {old}, refusing {new}"
            ))
            .into());
        }
        {
            let mut state = object.state();
            match &state.object_id {
                Some(existing) if existing != new => {
                    return Err(mooring_engine::Error::InvalidOperation(format!(
                        "object id is already {existing}, refusing {new}"
                    ))
                    .into())
                }
                Some(_) => {}
                None => state.object_id = Some(new.to_string()),
            }
        }

        self.get_or_create_uuid(object).await?;
        let mut session = self.db.session().await?;
        db::set_object_id(&mut session, object.local_id(), new).await?;
        drop(session);

        self.identity
            .index(object.class_name(), new, object.local_id());
        tracing::debug!(uuid = %object.local_id(), object_id = %new, "Object id assigned");
        Ok(())
    }

    /// Flag `object` as having a delete queued, and persist the flag.
    pub async fn set_deleting_eventually(&self, object: &LocalObject, deleting: bool) -> Result<()> {
        object.set_deleting_eventually(deleting);
        self.get_or_create_uuid(object).await?;
        let mut session = self.db.session().await?;
        db::set_deleting_eventually(&mut session, object.local_id(), deleting).await
    }

    /// Rewrite pointers received from the remote service (by server id) into
    /// stored pointers (by local id). Unknown targets get hollow rows.
    pub async fn normalize_pointers(&self, value: Value) -> Result<Value> {
        let mut remote = Vec::new();
        visit_pointers(&value, &mut |pointer| {
            if pointer.local_id.is_none() {
                remote.push(pointer);
            }
        });

        let mut local_ids: HashMap<(String, String), LocalId> = HashMap::new();
        for pointer in remote {
            let Some(object_id) = pointer.object_id else {
                continue;
            };
            let key = (pointer.class_name, object_id);
            if local_ids.contains_key(&key) {
                continue;
            }
            let object = self.object_without_data(&key.0, &key.1).await?;
            local_ids.insert(key, object.local_id().to_string());
        }

        let value = map_pointers(value, &mut |pointer| {
            let local_id = match &pointer.local_id {
                Some(local_id) => local_id.clone(),
                None => pointer
                    .object_id
                    .as_ref()
                    .and_then(|id| local_ids.get(&(pointer.class_name.clone(), id.clone())))
                    .cloned()
                    .ok_or_else(|| {
                        mooring_engine::Error::InvalidPointer(format!(
                            "unresolved pointer to {}",
                            pointer.class_name
                        ))
                    })?,
            };
            Ok(Pointer::local(pointer.class_name, local_id))
        })?;
        Ok(value)
    }

    /// Every object reachable from `roots` through pointers, roots first.
    pub(crate) async fn collect_graph(&self, roots: &[ObjectRef], include_children: bool) -> Result<Vec<ObjectRef>> {
        let mut visited = HashSet::new();
        let mut graph = Vec::new();
        let mut stack: Vec<ObjectRef> = roots.iter().rev().cloned().collect();

        while let Some(object) = stack.pop() {
            if !visited.insert(object.local_id().to_string()) {
                continue;
            }
            if include_children {
                for local_id in object.pointer_targets().into_iter().rev() {
                    if visited.contains(&local_id) {
                        continue;
                    }
                    let child = match object.child(&local_id) {
                        Some(child) => Some(child),
                        None => self.object_for_uuid(&local_id).await?,
                    };
                    match child {
                        Some(child) => stack.push(child),
                        None => {
                            tracing::warn!(uuid = %object.local_id(), target = %local_id, "Pointer target is not stored locally")
                        }
                    }
                }
            }
            graph.push(object);
        }
        Ok(graph)
    }

    /// Drop every in-memory handle and index. Rows are untouched.
    pub fn simulate_reboot(&self) {
        self.identity.clear();
        tracing::info!("Offline store caches cleared");
    }

    /// Delete every row, pin and queued command.
    pub async fn clear_database(&self) -> Result<()> {
        let mut session = self.db.session().await?;
        session.begin().await?;
        let result = delete_everything(&mut session).await;
        session.finish(result).await?;
        drop(session);

        self.identity.clear();
        tracing::info!("Offline store cleared");
        Ok(())
    }
}

async fn write_diff(
    session: &mut Session<'_>,
    uuid: &str,
    diff: &Fields,
    new_object_id: Option<&str>,
) -> Result<LocalObjectRecord> {
    let row = db::find_object(session, uuid)
        .await?
        .ok_or(StoreError::CacheMiss)?;
    let mut record = row.to_record()?;

    if let Some(new) = new_object_id {
        match &record.object_id {
            Some(existing) if existing != new => {
                return Err(mooring_engine::Error::InvalidOperation(format!(
                    "object id is already {existing}, refusing {new}"
                ))
                .into())
            }
            _ => record.object_id = Some(new.to_string()),
        }
    }

    let mut state = record.to_state();
    state.merge_from_server(diff)?;
    let updated = LocalObjectRecord::from_state(
        record.local_id.clone(),
        &state,
        record.is_deleting_eventually,
        Utc::now(),
    );
    db::upsert_object(session, &updated).await?;
    Ok(updated)
}

async fn delete_row(session: &mut Session<'_>, uuid: &str) -> Result<bool> {
    db::remove_memberships(session, uuid).await?;
    db::delete_object(session, uuid).await
}

async fn delete_everything(session: &mut Session<'_>) -> Result<()> {
    db::delete_all_eventually(session).await?;
    db::delete_all_pins(session).await?;
    db::delete_all_objects(session).await
}

pub(crate) async fn write_records(session: &mut Session<'_>, records: &[LocalObjectRecord]) -> Result<()> {
    for record in records {
        db::upsert_object(session, record).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn open_store() -> (tempfile::TempDir, OfflineStore) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::new(dir.path().join("store.sqlite")));
        db.open().await.unwrap();
        (dir, OfflineStore::new(db, ClassRegistry::new()))
    }

    #[tokio::test]
    async fn unknown_object_is_cache_miss() {
        let (_dir, store) = open_store().await;
        let object = store.create_object("Post").unwrap();
        let err = store.fetch_locally(&object).await.unwrap_err();
        assert!(err.is_cache_miss());
        assert!(store.load("nope").await.unwrap_err().is_cache_miss());
    }

    #[tokio::test]
    async fn hollow_row_is_cache_miss() {
        let (_dir, store) = open_store().await;
        let object = store.object_without_data("Post", "p1").await.unwrap();
        assert!(store.fetch_locally(&object).await.unwrap_err().is_cache_miss());
    }

    #[tokio::test]
    async fn save_then_fetch_after_reboot() {
        let (_dir, store) = open_store().await;
        let object = store.create_object("Post").unwrap();
        object.set("title", "hello").unwrap();
        store.save_locally(&object, false).await.unwrap();
        let uuid = object.local_id().to_string();
        drop(object);
        store.simulate_reboot();

        let loaded = store.load(&uuid).await.unwrap();
        assert_eq!(loaded.get("title"), Some(json!("hello")));
        assert!(loaded.is_dirty());
    }

    #[tokio::test]
    async fn normalize_rewrites_server_pointers() {
        let (_dir, store) = open_store().await;
        let value = json!({"author": {"__type": "Pointer", "className": "User", "objectId": "u1"}});
        let normalized = store.normalize_pointers(value.clone()).await.unwrap();
        let local_id = normalized["author"]["localId"].as_str().unwrap().to_string();
        assert!(normalized["author"].get("objectId").is_none());

        let again = store.normalize_pointers(value).await.unwrap();
        assert_eq!(again["author"]["localId"], json!(local_id));
    }

    #[tokio::test]
    async fn object_id_is_immutable() {
        let (_dir, store) = open_store().await;
        let object = store.create_object("Post").unwrap();
        store.update_object_id(&object, None, "p1").await.unwrap();
        assert_eq!(object.object_id().as_deref(), Some("p1"));
        assert!(store.update_object_id(&object, Some("p1"), "p2").await.is_err());
        assert!(store.update_object_id(&object, None, "p2").await.is_err());

        let same = store.object_without_data("Post", "p1").await.unwrap();
        assert!(Arc::ptr_eq(&object, &same));
    }
}
