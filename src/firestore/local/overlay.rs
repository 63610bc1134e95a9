use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::local::persistence::{PersistenceTransaction, Tables};
use crate::firestore::model::{BatchId, DocumentKey, Mutation, Overlay, ResourcePath, User};

/// Per-user overlay table. Each document has at most one overlay, the
/// squashed effect of every pending batch that touches it.
#[derive(Clone, Debug)]
pub struct DocumentOverlayCache {
    user_key: String,
}

impl DocumentOverlayCache {
    pub fn new(user: &User) -> Self {
        Self {
            user_key: user.to_key(),
        }
    }

    pub fn get_overlay(&self, tables: &Tables, key: &DocumentKey) -> Option<Overlay> {
        tables
            .overlays
            .get(&(self.user_key.clone(), key.clone()))
            .cloned()
    }

    pub fn get_overlays(
        &self,
        tables: &Tables,
        keys: &BTreeSet<DocumentKey>,
    ) -> BTreeMap<DocumentKey, Overlay> {
        keys.iter()
            .filter_map(|key| {
                self.get_overlay(tables, key)
                    .map(|overlay| (key.clone(), overlay))
            })
            .collect()
    }

    /// Overlays for documents directly inside `collection`.
    pub fn overlays_for_collection(
        &self,
        tables: &Tables,
        collection: &ResourcePath,
    ) -> BTreeMap<DocumentKey, Overlay> {
        let start = (self.user_key.clone(), DocumentKey::collection_start(collection));
        tables
            .overlays
            .range(start..)
            .take_while(|((user, key), _)| {
                *user == self.user_key && collection.is_prefix_of(key.path())
            })
            .filter(|((_, key), _)| collection.is_immediate_parent_of(key.path()))
            .map(|((_, key), overlay)| (key.clone(), overlay.clone()))
            .collect()
    }

    pub fn save_overlays(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        largest_batch_id: BatchId,
        overlays: BTreeMap<DocumentKey, Mutation>,
    ) {
        for (key, mutation) in overlays {
            txn.put(
                Tables::overlays_mut,
                (self.user_key.clone(), key),
                Overlay::new(largest_batch_id, mutation),
            );
        }
    }

    pub fn remove_overlay(&self, txn: &mut PersistenceTransaction<'_>, key: &DocumentKey) {
        txn.delete(Tables::overlays_mut, &(self.user_key.clone(), key.clone()));
    }

    /// Drops the overlays of `keys` that were last written by `batch_id`.
    pub fn remove_overlays_for_batch_id(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        keys: &BTreeSet<DocumentKey>,
        batch_id: BatchId,
    ) {
        for key in keys {
            let written_by_batch = self
                .get_overlay(txn.tables(), key)
                .map(|overlay| overlay.largest_batch_id == batch_id)
                .unwrap_or(false);
            if written_by_batch {
                self.remove_overlay(txn, key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::firestore::local::persistence::{MemoryPersistence, Persistence};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    #[test]
    fn collection_scan_skips_subcollections_and_other_users() {
        let persistence: Arc<dyn Persistence> = Arc::new(MemoryPersistence::new());
        let alice = DocumentOverlayCache::new(&User::authenticated("alice"));
        let bob = DocumentOverlayCache::new(&User::authenticated("bob"));
        persistence
            .run_transaction("save", |txn| {
                let mut overlays = BTreeMap::new();
                for path in ["rooms/a", "rooms/a/messages/m", "rooms/b", "users/x"] {
                    overlays.insert(key(path), Mutation::delete(key(path)));
                }
                alice.save_overlays(txn, 1, overlays);
                let mut others = BTreeMap::new();
                others.insert(key("rooms/c"), Mutation::delete(key("rooms/c")));
                bob.save_overlays(txn, 2, others);
                Ok(())
            })
            .unwrap();

        persistence
            .run_transaction("read", |txn| {
                let rooms = ResourcePath::from_string("rooms").unwrap();
                let found: Vec<String> = alice
                    .overlays_for_collection(txn.tables(), &rooms)
                    .keys()
                    .map(ToString::to_string)
                    .collect();
                assert_eq!(found, vec!["rooms/a", "rooms/b"]);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn removes_only_overlays_of_the_batch() {
        let persistence: Arc<dyn Persistence> = Arc::new(MemoryPersistence::new());
        let cache = DocumentOverlayCache::new(&User::unauthenticated());
        persistence
            .run_transaction("remove", |txn| {
                let mut first = BTreeMap::new();
                first.insert(key("rooms/a"), Mutation::delete(key("rooms/a")));
                cache.save_overlays(txn, 1, first);
                let mut second = BTreeMap::new();
                second.insert(key("rooms/b"), Mutation::delete(key("rooms/b")));
                cache.save_overlays(txn, 2, second);

                let keys: BTreeSet<DocumentKey> = [key("rooms/a"), key("rooms/b")].into_iter().collect();
                cache.remove_overlays_for_batch_id(txn, &keys, 1);
                assert!(cache.get_overlay(txn.tables(), &key("rooms/a")).is_none());
                assert!(cache.get_overlay(txn.tables(), &key("rooms/b")).is_some());
                Ok(())
            })
            .unwrap();
    }
}
