//! Local query execution.
//!
//! Queries are matched against each object's estimated data, so edits that
//! have not reached the remote service are visible to local queries.

use crate::db;
use crate::error::Result;
use crate::objects::ObjectRef;
use crate::offline_store::OfflineStore;
use futures::future::BoxFuture;
use futures::FutureExt;
use mooring_engine::value::{map_pointers, parse_relation, visit_pointers, Fields};
use mooring_engine::{
    apply_window, sort_candidates, Candidate, LocalId, Matcher, Pointer, QueryState, Subquery,
};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

impl OfflineStore {
    /// Run `query` against the local store.
    ///
    /// `pin` restricts the scan to members of that pin and falls back to the
    /// query's own pin scope. Results are sorted, windowed by `skip` and
    /// `limit`, and have their include paths loaded.
    pub async fn find(
        &self,
        query: &QueryState,
        user_id: Option<&str>,
        pin: Option<&str>,
    ) -> Result<Vec<ObjectRef>> {
        let mut matches = self.matching(query, user_id, pin).await?;
        sort_candidates(&mut matches, &query.sort_keys, |(_, candidate)| candidate)?;
        let results: Vec<ObjectRef> = apply_window(matches, query.skip, query.limit)
            .into_iter()
            .map(|(object, _)| object)
            .collect();

        if !query.include_keys.is_empty() {
            let mut visited = HashSet::new();
            for object in &results {
                for path in &query.include_keys {
                    self.load_include(object, path, &mut visited).await?;
                }
            }
        }

        tracing::debug!(class = %query.class_name, results = results.len(), "Local query finished");
        Ok(results)
    }

    /// Number of objects matching `query`. `skip` and `limit` are ignored.
    pub async fn count(
        &self,
        query: &QueryState,
        user_id: Option<&str>,
        pin: Option<&str>,
    ) -> Result<u64> {
        let matches = self.matching(query, user_id, pin).await?;
        Ok(matches.len() as u64)
    }

    /// Rewrite server-id pointers in query conditions to the local ids they
    /// are stored under. Nothing is written: a pointer to an object not known
    /// locally is left as is and matches no stored pointer.
    async fn local_condition_pointers(&self, conditions: Value) -> Result<Value> {
        let mut remote = Vec::new();
        visit_pointers(&conditions, &mut |pointer| {
            if let (None, Some(object_id)) = (&pointer.local_id, &pointer.object_id) {
                remote.push((pointer.class_name.clone(), object_id.clone()));
            }
        });

        let mut known: HashMap<(String, String), LocalId> = HashMap::new();
        for key in remote {
            if known.contains_key(&key) {
                continue;
            }
            if let Some(local_id) = self.local_id_for(&key.0, &key.1).await? {
                known.insert(key, local_id);
            }
        }

        let conditions = map_pointers(conditions, &mut |pointer| {
            if pointer.local_id.is_some() {
                return Ok(pointer);
            }
            let local_id = pointer
                .object_id
                .as_ref()
                .and_then(|object_id| known.get(&(pointer.class_name.clone(), object_id.clone())))
                .cloned();
            Ok(match local_id {
                Some(local_id) => Pointer::local(pointer.class_name, local_id),
                None => pointer,
            })
        })?;
        Ok(conditions)
    }

    /// Every object of the query's class that matches its constraints, in
    /// storage order.
    fn matching<'a>(
        &'a self,
        query: &'a QueryState,
        user_id: Option<&'a str>,
        pin: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Vec<(ObjectRef, Candidate)>>> {
        async move {
            self.registry().check_class(&query.class_name)?;
            let pin = pin.or(query.pin_name.as_deref());

            let mut query = query.clone();
            query.conditions = match self
                .local_condition_pointers(Value::Object(query.conditions))
                .await?
            {
                Value::Object(map) => map,
                _ => Fields::new(),
            };

            let mut resolved = Vec::new();
            for subquery in Matcher::subqueries(&query)? {
                resolved.push(self.resolve_subquery(subquery, user_id, pin).await?);
            }
            let matcher = Matcher::compile(&query, resolved)?;

            let rows = {
                let mut session = self.database().session().await?;
                db::objects_in_class(&mut session, &query.class_name, pin).await?
            };

            let mut matches = Vec::new();
            for row in rows {
                if row.is_deleting_eventually {
                    continue;
                }
                let object = match self.object_from_row(&row) {
                    Ok(object) => object,
                    Err(err) => {
                        tracing::warn!(uuid = %row.uuid, error = %err, "Skipping malformed row");
                        continue;
                    }
                };
                if object.is_deleting_eventually() {
                    continue;
                }
                let candidate = {
                    let state = object.state();
                    if state.deleted || (!state.complete && !state.is_dirty()) {
                        continue;
                    }
                    Candidate::from_state(object.local_id(), &state)
                };
                if matcher.matches(&candidate, user_id) {
                    matches.push((object, candidate));
                }
            }
            Ok(matches)
        }
        .boxed()
    }

    async fn resolve_subquery(
        &self,
        subquery: Subquery,
        user_id: Option<&str>,
        pin: Option<&str>,
    ) -> Result<HashSet<LocalId>> {
        match subquery {
            Subquery::InQuery { query, .. } | Subquery::NotInQuery { query, .. } => {
                let pin = query.pin_name.as_deref().or(pin);
                let matches = self.matching(&query, user_id, pin).await?;
                Ok(matches
                    .into_iter()
                    .map(|(object, _)| object.local_id().to_string())
                    .collect())
            }
            Subquery::RelatedTo { owner, key } => {
                let Some(owner) = self.resolve_pointer(&owner).await? else {
                    return Ok(HashSet::new());
                };
                Ok(owner
                    .get(&key)
                    .and_then(|value| parse_relation(&value))
                    .map(|(_, targets)| targets.into_iter().collect())
                    .unwrap_or_default())
            }
        }
    }

    /// Load the objects along one include path, caching each as a child of
    /// the object pointing at it.
    async fn load_include(
        &self,
        root: &ObjectRef,
        path: &str,
        visited: &mut HashSet<(LocalId, String)>,
    ) -> Result<()> {
        let mut pending = vec![(root.clone(), path.to_string())];
        while let Some((owner, path)) = pending.pop() {
            if !visited.insert((owner.local_id().to_string(), path.clone())) {
                continue;
            }
            let (head, rest) = match path.split_once('.') {
                Some((head, rest)) => (head, Some(rest)),
                None => (path.as_str(), None),
            };
            let Some(value) = owner.get(head) else {
                continue;
            };
            let mut targets = Vec::new();
            visit_pointers(&value, &mut |pointer| targets.push(pointer));

            for pointer in targets {
                let Some(child) = self.resolve_pointer(&pointer).await? else {
                    continue;
                };
                owner.cache_child(child.clone());
                if let Some(rest) = rest {
                    pending.push((child, rest.to_string()));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::db::Database;
    use crate::offline_store::OfflineStore;
    use mooring_engine::{ClassRegistry, QueryState};
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn unsaved_edits_are_visible_to_queries() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::new(dir.path().join("q.sqlite")));
        db.open().await.unwrap();
        let store = OfflineStore::new(db, ClassRegistry::new());

        let object = store.create_object("Item").unwrap();
        object.set("score", 1).unwrap();
        store.save_locally(&object, false).await.unwrap();
        object.set("score", 9).unwrap();

        let query = QueryState::builder("Item")
            .greater_than("score", json!(5))
            .build();
        let found = store.find(&query, None, None).await.unwrap();
        assert_eq!(found.len(), 1);
        assert!(Arc::ptr_eq(&found[0], &object));
    }

    #[tokio::test]
    async fn unknown_pointer_condition_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::new(dir.path().join("ro.sqlite")));
        db.open().await.unwrap();
        let store = OfflineStore::new(db.clone(), ClassRegistry::new());

        let query = QueryState::builder("Post")
            .equal_to(
                "author",
                json!({"__type": "Pointer", "className": "User", "objectId": "u-zzz"}),
            )
            .build();
        assert!(store.find(&query, None, None).await.unwrap().is_empty());
        assert_eq!(store.count(&query, None, None).await.unwrap(), 0);

        let mut session = db.session().await.unwrap();
        assert!(crate::db::count_by_class(&mut session).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn server_pointer_condition_matches_stored_object() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::new(dir.path().join("known.sqlite")));
        db.open().await.unwrap();
        let store = OfflineStore::new(db, ClassRegistry::new());

        let author = store.object_without_data("User", "u-1").await.unwrap();
        let post = store.create_object("Post").unwrap();
        post.set_object("author", &author).unwrap();
        store.save_locally(&post, false).await.unwrap();

        let query = QueryState::builder("Post")
            .equal_to(
                "author",
                json!({"__type": "Pointer", "className": "User", "objectId": "u-1"}),
            )
            .build();
        let found = store.find(&query, None, None).await.unwrap();
        assert_eq!(found.len(), 1);
        assert!(Arc::ptr_eq(&found[0], &post));
    }
}
