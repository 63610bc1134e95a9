//! Fans view snapshots out to the listeners registered for each query.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::firestore::core::query::Query;
use crate::firestore::core::view::{ChangeType, ViewSnapshot};
use crate::firestore::error::{FirestoreError, FirestoreResult};
use crate::firestore::remote::online_state_tracker::OnlineState;

pub type ListenerId = u64;

pub type SnapshotCallback = Arc<dyn Fn(FirestoreResult<ViewSnapshot>) + Send + Sync>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ListenOptions {
    /// Raise snapshots whose only change is metadata (`from_cache` or
    /// pending writes).
    pub include_metadata_changes: bool,
    /// Hold back the first from-cache snapshot while the client might still
    /// reach the backend.
    pub wait_for_sync_when_online: bool,
}

impl ListenOptions {
    pub fn with_metadata_changes(mut self) -> Self {
        self.include_metadata_changes = true;
        self
    }

    pub fn wait_for_sync_when_online(mut self) -> Self {
        self.wait_for_sync_when_online = true;
        self
    }
}

/// A callback invocation collected while engine state is locked, dispatched
/// once the lock is released.
pub struct ListenerEvent {
    callback: SnapshotCallback,
    result: FirestoreResult<ViewSnapshot>,
}

impl ListenerEvent {
    pub fn dispatch(self) {
        (self.callback)(self.result);
    }
}

pub fn dispatch_all(events: Vec<ListenerEvent>) {
    for event in events {
        event.dispatch();
    }
}

struct QueryListener {
    id: ListenerId,
    options: ListenOptions,
    callback: SnapshotCallback,
    raised_initial_event: bool,
    snapshot: Option<ViewSnapshot>,
    online_state: OnlineState,
}

impl QueryListener {
    fn on_view_snapshot(&mut self, snapshot: ViewSnapshot, events: &mut Vec<ListenerEvent>) {
        let snapshot = if self.options.include_metadata_changes {
            snapshot
        } else {
            let changes = snapshot
                .changes
                .iter()
                .filter(|change| change.change_type != ChangeType::Metadata)
                .cloned()
                .collect();
            ViewSnapshot {
                changes,
                excludes_metadata_changes: true,
                ..snapshot
            }
        };

        if !self.raised_initial_event {
            if self.should_raise_initial_event(&snapshot, self.online_state) {
                self.raise_initial_event(&snapshot, events);
            }
        } else if self.should_raise_event(&snapshot) {
            events.push(ListenerEvent {
                callback: Arc::clone(&self.callback),
                result: Ok(snapshot.clone()),
            });
        }
        self.snapshot = Some(snapshot);
    }

    fn on_error(&self, error: FirestoreError, events: &mut Vec<ListenerEvent>) {
        events.push(ListenerEvent {
            callback: Arc::clone(&self.callback),
            result: Err(error),
        });
    }

    fn apply_online_state_change(&mut self, online_state: OnlineState, events: &mut Vec<ListenerEvent>) {
        self.online_state = online_state;
        if self.raised_initial_event {
            return;
        }
        if let Some(snapshot) = self.snapshot.clone() {
            if self.should_raise_initial_event(&snapshot, online_state) {
                self.raise_initial_event(&snapshot, events);
            }
        }
    }

    fn should_raise_initial_event(&self, snapshot: &ViewSnapshot, online_state: OnlineState) -> bool {
        if !snapshot.from_cache {
            return true;
        }
        let maybe_online = online_state != OnlineState::Offline;
        if self.options.wait_for_sync_when_online && maybe_online {
            return false;
        }
        // An empty from-cache result is withheld until the backend had a
        // chance to answer, unless the client is known to be offline.
        !snapshot.documents.is_empty() || snapshot.has_cached_results || online_state == OnlineState::Offline
    }

    fn should_raise_event(&self, snapshot: &ViewSnapshot) -> bool {
        if !snapshot.changes.is_empty() {
            return true;
        }
        let pending_writes_changed = self
            .snapshot
            .as_ref()
            .is_some_and(|previous| previous.has_pending_writes() != snapshot.has_pending_writes());
        if snapshot.sync_state_changed || pending_writes_changed {
            return self.options.include_metadata_changes;
        }
        false
    }

    fn raise_initial_event(&mut self, snapshot: &ViewSnapshot, events: &mut Vec<ListenerEvent>) {
        let initial = ViewSnapshot::from_initial_documents(
            snapshot.query.clone(),
            snapshot.documents.clone(),
            snapshot.mutated_keys.clone(),
            snapshot.from_cache,
            snapshot.has_cached_results,
        );
        self.raised_initial_event = true;
        events.push(ListenerEvent {
            callback: Arc::clone(&self.callback),
            result: Ok(initial),
        });
    }
}

struct QueryListeners {
    query: Query,
    view_snapshot: Option<ViewSnapshot>,
    listeners: Vec<QueryListener>,
}

/// Outcome of [`EventManager::add_listener`].
pub struct AddedListener {
    pub listener_id: ListenerId,
    /// The query had no listener before; its view must be created.
    pub first_listener: bool,
    pub events: Vec<ListenerEvent>,
}

#[derive(Default)]
pub struct EventManager {
    queries: HashMap<String, QueryListeners>,
    listener_queries: BTreeMap<ListenerId, String>,
    next_listener_id: ListenerId,
    online_state: OnlineState,
}

impl EventManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(
        &mut self,
        query: Query,
        options: ListenOptions,
        callback: SnapshotCallback,
    ) -> AddedListener {
        let canonical_id = query.canonical_id();
        let listener_id = self.next_listener_id;
        self.next_listener_id += 1;

        let first_listener = !self.queries.contains_key(&canonical_id);
        let entry = self
            .queries
            .entry(canonical_id.clone())
            .or_insert_with(|| QueryListeners {
                query,
                view_snapshot: None,
                listeners: Vec::new(),
            });

        let mut listener = QueryListener {
            id: listener_id,
            options,
            callback,
            raised_initial_event: false,
            snapshot: None,
            online_state: self.online_state,
        };
        let mut events = Vec::new();
        if let Some(snapshot) = entry.view_snapshot.clone() {
            listener.on_view_snapshot(snapshot, &mut events);
        }
        entry.listeners.push(listener);
        self.listener_queries.insert(listener_id, canonical_id);

        AddedListener {
            listener_id,
            first_listener,
            events,
        }
    }

    /// Returns the query when `listener_id` was its last listener.
    pub fn remove_listener(&mut self, listener_id: ListenerId) -> Option<Query> {
        let canonical_id = self.listener_queries.remove(&listener_id)?;
        let entry = self.queries.get_mut(&canonical_id)?;
        entry.listeners.retain(|listener| listener.id != listener_id);
        if entry.listeners.is_empty() {
            return self.queries.remove(&canonical_id).map(|entry| entry.query);
        }
        None
    }

    pub fn has_listeners(&self, query: &Query) -> bool {
        self.queries.contains_key(&query.canonical_id())
    }

    pub fn on_watch_change(&mut self, snapshots: Vec<ViewSnapshot>) -> Vec<ListenerEvent> {
        let mut events = Vec::new();
        for snapshot in snapshots {
            let Some(entry) = self.queries.get_mut(&snapshot.query.canonical_id()) else {
                continue;
            };
            for listener in &mut entry.listeners {
                listener.on_view_snapshot(snapshot.clone(), &mut events);
            }
            entry.view_snapshot = Some(snapshot);
        }
        events
    }

    /// Reports `error` to every listener of `query` and forgets the query.
    pub fn on_watch_error(&mut self, query: &Query, error: FirestoreError) -> Vec<ListenerEvent> {
        let mut events = Vec::new();
        if let Some(entry) = self.queries.remove(&query.canonical_id()) {
            for listener in &entry.listeners {
                self.listener_queries.remove(&listener.id);
                listener.on_error(error.clone(), &mut events);
            }
        }
        events
    }

    pub fn on_online_state_change(&mut self, online_state: OnlineState) -> Vec<ListenerEvent> {
        self.online_state = online_state;
        let mut events = Vec::new();
        for entry in self.queries.values_mut() {
            for listener in &mut entry.listeners {
                listener.apply_online_state_change(online_state, &mut events);
            }
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    use super::*;
    use crate::firestore::core::view::{DocumentSet, DocumentViewChange};
    use crate::firestore::error::permission_denied;
    use crate::firestore::model::{DocumentKey, MutableDocument, SnapshotVersion, Timestamp};
    use crate::firestore::value::ObjectValue;

    fn recording_callback() -> (SnapshotCallback, Arc<Mutex<Vec<FirestoreResult<ViewSnapshot>>>>) {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        let callback: SnapshotCallback = Arc::new(move |result| sink.lock().unwrap().push(result));
        (callback, received)
    }

    fn snapshot(query: &Query, paths: &[&str], from_cache: bool) -> ViewSnapshot {
        let mut documents = DocumentSet::new(Arc::new(query.clone()));
        for path in paths {
            documents.add(MutableDocument::new_found(
                DocumentKey::from_string(path).unwrap(),
                SnapshotVersion::from_timestamp(Timestamp::new(1, 0)),
                ObjectValue::empty(),
            ));
        }
        ViewSnapshot {
            changes: documents
                .iter()
                .map(|document| DocumentViewChange {
                    change_type: ChangeType::Added,
                    document: document.clone(),
                })
                .collect(),
            old_documents: DocumentSet::new(Arc::new(query.clone())),
            query: query.clone(),
            documents,
            mutated_keys: BTreeSet::new(),
            from_cache,
            sync_state_changed: true,
            excludes_metadata_changes: false,
            has_cached_results: false,
        }
    }

    #[test]
    fn second_listener_receives_the_cached_snapshot() {
        let query = Query::collection("rooms").unwrap();
        let mut manager = EventManager::new();
        let (first, first_received) = recording_callback();
        let added = manager.add_listener(query.clone(), ListenOptions::default(), first);
        assert!(added.first_listener);
        assert!(added.events.is_empty());

        dispatch_all(manager.on_watch_change(vec![snapshot(&query, &["rooms/a"], false)]));
        assert_eq!(first_received.lock().unwrap().len(), 1);

        let (second, second_received) = recording_callback();
        let added = manager.add_listener(Query::collection("rooms").unwrap(), ListenOptions::default(), second);
        assert!(!added.first_listener);
        dispatch_all(added.events);
        let received = second_received.lock().unwrap();
        let initial = received[0].as_ref().unwrap();
        assert_eq!(initial.documents.len(), 1);
        assert!(initial.sync_state_changed);
    }

    #[test]
    fn empty_cached_snapshot_waits_until_offline() {
        let query = Query::collection("rooms").unwrap();
        let mut manager = EventManager::new();
        let (callback, received) = recording_callback();
        manager.add_listener(query.clone(), ListenOptions::default(), callback);

        dispatch_all(manager.on_watch_change(vec![snapshot(&query, &[], true)]));
        assert!(received.lock().unwrap().is_empty());

        dispatch_all(manager.on_online_state_change(OnlineState::Offline));
        let received = received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert!(received[0].as_ref().unwrap().from_cache);
    }

    #[test]
    fn metadata_only_snapshots_respect_options() {
        let query = Query::collection("rooms").unwrap();
        let mut manager = EventManager::new();
        let (plain, plain_received) = recording_callback();
        let (metadata, metadata_received) = recording_callback();
        manager.add_listener(query.clone(), ListenOptions::default(), plain);
        manager.add_listener(query.clone(), ListenOptions::default().with_metadata_changes(), metadata);

        dispatch_all(manager.on_watch_change(vec![snapshot(&query, &["rooms/a"], true)]));
        let mut synced = snapshot(&query, &["rooms/a"], false);
        synced.changes.clear();
        dispatch_all(manager.on_watch_change(vec![synced]));

        assert_eq!(plain_received.lock().unwrap().len(), 1);
        assert_eq!(metadata_received.lock().unwrap().len(), 2);
    }

    #[test]
    fn errors_remove_the_query() {
        let query = Query::collection("rooms").unwrap();
        let mut manager = EventManager::new();
        let (callback, received) = recording_callback();
        let added = manager.add_listener(query.clone(), ListenOptions::default(), callback);

        dispatch_all(manager.on_watch_error(&query, permission_denied("denied")));
        assert!(received.lock().unwrap()[0].is_err());
        assert!(!manager.has_listeners(&query));
        assert_eq!(manager.remove_listener(added.listener_id), None);
    }

    #[test]
    fn removing_the_last_listener_returns_the_query() {
        let query = Query::collection("rooms").unwrap();
        let mut manager = EventManager::new();
        let (first, _) = recording_callback();
        let (second, _) = recording_callback();
        let first = manager.add_listener(query.clone(), ListenOptions::default(), first);
        let second = manager.add_listener(query.clone(), ListenOptions::default(), second);

        assert_eq!(manager.remove_listener(first.listener_id), None);
        assert_eq!(manager.remove_listener(second.listener_id), Some(query));
    }
}
