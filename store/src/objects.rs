//! In-memory object handles and the identity map.
//!
//! Every locally known object is represented by at most one live
//! [`LocalObject`] at a time. The [`IdentityMap`] holds weak references only,
//! so a handle disappears from it once the last caller drops it.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use mooring_engine::value::{visit_pointers, Fields};
use mooring_engine::{
    ClassName, FieldOperation, LocalId, LocalObjectRecord, ObjectId, ObjectState, Pointer,
};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Shared handle to a local object.
pub type ObjectRef = Arc<LocalObject>;

/// A locally known object.
#[derive(Debug)]
pub struct LocalObject {
    local_id: LocalId,
    class_name: ClassName,
    state: Mutex<ObjectState>,
    /// Objects loaded through this object's pointers and relations
    children: Mutex<HashMap<LocalId, CachedChild>>,
    deleting_eventually: AtomicBool,
}

impl LocalObject {
    pub(crate) fn new(
        local_id: impl Into<LocalId>,
        state: ObjectState,
        deleting_eventually: bool,
    ) -> ObjectRef {
        Arc::new(Self {
            local_id: local_id.into(),
            class_name: state.class_name.clone(),
            state: Mutex::new(state),
            children: Mutex::new(HashMap::new()),
            deleting_eventually: AtomicBool::new(deleting_eventually),
        })
    }

    pub(crate) fn from_record(record: &LocalObjectRecord) -> ObjectRef {
        Self::new(
            record.local_id.clone(),
            record.to_state(),
            record.is_deleting_eventually,
        )
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn object_id(&self) -> Option<ObjectId> {
        self.state.lock().object_id.clone()
    }

    /// Pointer to this object, as stored in other objects' fields.
    pub fn pointer(&self) -> Pointer {
        Pointer::local(self.class_name.clone(), self.local_id.clone())
    }

    /// Exclusive access to the object's state.
    pub fn state(&self) -> MutexGuard<'_, ObjectState> {
        self.state.lock()
    }

    pub fn snapshot(&self) -> ObjectState {
        self.state.lock().clone()
    }

    /// Estimated value of `key`.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.state.lock().estimated_value(key)
    }

    /// Estimated value of every field.
    pub fn data(&self) -> Fields {
        self.state.lock().estimated_data()
    }

    pub fn is_dirty(&self) -> bool {
        self.state.lock().is_dirty()
    }

    /// Queue an edit of `key`.
    pub fn perform(&self, key: &str, operation: FieldOperation) -> mooring_engine::error::Result<()> {
        self.state.lock().perform_operation(key, operation)
    }

    pub fn set(&self, key: &str, value: impl Into<Value>) -> mooring_engine::error::Result<()> {
        self.perform(key, FieldOperation::set(value.into()))
    }

    pub fn remove_key(&self, key: &str) -> mooring_engine::error::Result<()> {
        self.perform(key, FieldOperation::Delete)
    }

    pub fn increment(&self, key: &str, amount: i64) -> mooring_engine::error::Result<()> {
        self.perform(key, FieldOperation::increment(amount))
    }

    /// Point `key` at `child`.
    pub fn set_object(&self, key: &str, child: &ObjectRef) -> mooring_engine::error::Result<()> {
        self.set(key, child.pointer().to_value())?;
        self.cache_child(child.clone());
        Ok(())
    }

    /// Add `child` to the relation `key`.
    pub fn add_related(&self, key: &str, child: &ObjectRef) -> mooring_engine::error::Result<()> {
        self.perform(
            key,
            FieldOperation::add_relation(child.class_name.clone(), [child.local_id.clone()]),
        )?;
        self.cache_child(child.clone());
        Ok(())
    }

    /// Remove `child` from the relation `key`.
    pub fn remove_related(&self, key: &str, child: &ObjectRef) -> mooring_engine::error::Result<()> {
        self.perform(
            key,
            FieldOperation::remove_relation(child.class_name.clone(), [child.local_id.clone()]),
        )
    }

    pub fn is_deleting_eventually(&self) -> bool {
        self.deleting_eventually.load(Ordering::Acquire)
    }

    pub(crate) fn set_deleting_eventually(&self, deleting: bool) {
        self.deleting_eventually.store(deleting, Ordering::Release);
    }

    /// A previously loaded child that is still alive.
    pub fn child(&self, local_id: &str) -> Option<ObjectRef> {
        self.children.lock().get(local_id).and_then(CachedChild::upgrade)
    }

    pub fn children(&self) -> Vec<ObjectRef> {
        self.children
            .lock()
            .values()
            .filter_map(CachedChild::upgrade)
            .collect()
    }

    /// Keep `child` with this object.
    ///
    /// The child is held strongly unless it already reaches this object
    /// through strongly held children, so pointer cycles never keep their
    /// members alive.
    pub(crate) fn cache_child(&self, child: ObjectRef) {
        let entry = if child.reaches(&self.local_id) {
            CachedChild::Weak(Arc::downgrade(&child))
        } else {
            CachedChild::Strong(child.clone())
        };
        self.children.lock().insert(child.local_id.clone(), entry);
    }

    /// True if `local_id` is this object or is strongly held below it.
    fn reaches(&self, local_id: &str) -> bool {
        if self.local_id == local_id {
            return true;
        }
        let mut visited = HashSet::new();
        let mut stack = self.strong_children();
        while let Some(object) = stack.pop() {
            if object.local_id == local_id {
                return true;
            }
            if visited.insert(object.local_id.clone()) {
                stack.extend(object.strong_children());
            }
        }
        false
    }

    fn strong_children(&self) -> Vec<ObjectRef> {
        self.children
            .lock()
            .values()
            .filter_map(|entry| match entry {
                CachedChild::Strong(child) => Some(child.clone()),
                CachedChild::Weak(_) => None,
            })
            .collect()
    }

    /// Local ids referenced by pointers in the estimated data.
    pub fn pointer_targets(&self) -> Vec<LocalId> {
        let data = self.data();
        let mut targets = Vec::new();
        for value in data.values() {
            visit_pointers(value, &mut |pointer| {
                if let Some(local_id) = pointer.local_id {
                    targets.push(local_id);
                }
            });
        }
        targets
    }

    /// Capture the object for writing.
    pub fn to_record(&self, now: DateTime<Utc>) -> LocalObjectRecord {
        let state = self.state.lock();
        LocalObjectRecord::from_state(
            self.local_id.clone(),
            &state,
            self.is_deleting_eventually(),
            now,
        )
    }
}

#[derive(Debug)]
enum CachedChild {
    Strong(ObjectRef),
    /// Held weakly to break a pointer cycle
    Weak(Weak<LocalObject>),
}

impl CachedChild {
    fn upgrade(&self) -> Option<ObjectRef> {
        match self {
            CachedChild::Strong(child) => Some(child.clone()),
            CachedChild::Weak(child) => child.upgrade(),
        }
    }
}

/// Weak map of live object handles.
///
/// Thread-safe and shared through the offline store.
#[derive(Debug, Default)]
pub struct IdentityMap {
    objects: DashMap<LocalId, Weak<LocalObject>>,
    /// Index of local ids by `(class, server id)`
    by_object_id: DashMap<(ClassName, ObjectId), LocalId>,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// The live handle for `local_id`, if any. A dead entry is dropped
    /// together with its server id index.
    pub fn get(&self, local_id: &str) -> Option<ObjectRef> {
        let live = self.objects.get(local_id)?.upgrade();
        if live.is_none() {
            self.forget(local_id);
        }
        live
    }

    fn forget(&self, local_id: &str) {
        let removed = self
            .objects
            .remove_if(local_id, |_, weak| weak.strong_count() == 0);
        if removed.is_some() {
            self.by_object_id.retain(|_, indexed| indexed.as_str() != local_id);
        }
    }

    pub fn is_alive(&self, local_id: &str) -> bool {
        self.objects
            .get(local_id)
            .is_some_and(|weak| weak.strong_count() > 0)
    }

    /// Return the live handle for `local_id`, or register the one built by
    /// `make`.
    pub fn intern(&self, local_id: &str, make: impl FnOnce() -> ObjectRef) -> ObjectRef {
        let object = match self.objects.entry(local_id.to_string()) {
            Entry::Occupied(mut entry) => match entry.get().upgrade() {
                Some(live) => return live,
                None => {
                    let object = make();
                    entry.insert(Arc::downgrade(&object));
                    object
                }
            },
            Entry::Vacant(entry) => {
                let object = make();
                entry.insert(Arc::downgrade(&object));
                object
            }
        };
        if let Some(object_id) = object.object_id() {
            self.index(object.class_name(), &object_id, local_id);
        }
        object
    }

    /// Local id of the object with server id `object_id`, if known.
    pub fn lookup(&self, class_name: &str, object_id: &str) -> Option<LocalId> {
        self.by_object_id
            .get(&(class_name.to_string(), object_id.to_string()))
            .map(|entry| entry.value().clone())
    }

    pub fn index(&self, class_name: &str, object_id: &str, local_id: &str) {
        self.by_object_id.insert(
            (class_name.to_string(), object_id.to_string()),
            local_id.to_string(),
        );
    }

    pub fn unindex(&self, class_name: &str, object_id: &str) {
        self.by_object_id
            .remove(&(class_name.to_string(), object_id.to_string()));
    }

    /// Number of live handles. Dead entries and their index entries are
    /// swept on the way.
    pub fn live_count(&self) -> usize {
        self.objects.retain(|_, weak| weak.strong_count() > 0);
        self.by_object_id
            .retain(|_, local_id| self.objects.contains_key(local_id.as_str()));
        self.objects.len()
    }

    pub fn clear(&self) {
        self.objects.clear();
        self.by_object_id.clear();
        tracing::debug!("Identity map cleared");
    }
}
