//! Transactional storage shared by the local store components.
//!
//! A driver owns one [`Tables`] value and runs every read and write inside
//! [`Persistence::run_transaction_dyn`]. Writes go through
//! [`PersistenceTransaction`], which records an undo entry per change so a
//! failed transaction leaves the tables untouched.

mod file;
mod memory;
mod tables;

use crate::firestore::error::{internal_error, FirestoreResult};

pub use file::FilePersistence;
pub use memory::MemoryPersistence;
pub use tables::{
    BundleMetadata, MutationQueueMetadata, SetRef, TableRef, Tables, TargetGlobals,
};

type UndoFn = Box<dyn FnOnce(&mut Tables) + Send>;

pub trait Persistence: Send + Sync {
    /// Runs `operation` atomically. On error every change it made is rolled
    /// back.
    fn run_transaction_dyn(
        &self,
        label: &str,
        operation: &mut dyn FnMut(&mut PersistenceTransaction<'_>) -> FirestoreResult<()>,
    ) -> FirestoreResult<()>;

    /// Releases resources held by the driver. Later transactions fail.
    fn shutdown(&self) -> FirestoreResult<()>;

    fn is_durable(&self) -> bool;
}

impl dyn Persistence {
    pub fn run_transaction<T, F>(&self, label: &str, operation: F) -> FirestoreResult<T>
    where
        F: FnOnce(&mut PersistenceTransaction<'_>) -> FirestoreResult<T>,
    {
        let mut operation = Some(operation);
        let mut output = None;
        self.run_transaction_dyn(label, &mut |txn| {
            let operation = operation
                .take()
                .ok_or_else(|| internal_error("transaction body invoked twice"))?;
            output = Some(operation(txn)?);
            Ok(())
        })?;
        output.ok_or_else(|| internal_error(format!("transaction '{label}' produced no result")))
    }
}

/// Read access to the tables plus undo-logged writes.
pub struct PersistenceTransaction<'a> {
    tables: &'a mut Tables,
    undo: Vec<UndoFn>,
}

impl<'a> PersistenceTransaction<'a> {
    fn new(tables: &'a mut Tables) -> Self {
        Self {
            tables,
            undo: Vec::new(),
        }
    }

    pub fn tables(&self) -> &Tables {
        &*self.tables
    }

    pub fn put<K, V>(&mut self, table: TableRef<K, V>, key: K, value: V)
    where
        K: Ord + Clone + Send + 'static,
        V: Send + 'static,
    {
        let previous = table(self.tables).insert(key.clone(), value);
        self.undo.push(Box::new(move |tables| {
            let map = table(tables);
            match previous {
                Some(previous) => {
                    map.insert(key, previous);
                }
                None => {
                    map.remove(&key);
                }
            }
        }));
    }

    pub fn delete<K, V>(&mut self, table: TableRef<K, V>, key: &K) -> Option<V>
    where
        K: Ord + Clone + Send + 'static,
        V: Clone + Send + 'static,
    {
        let previous = table(self.tables).remove(key)?;
        let restored = previous.clone();
        let key = key.clone();
        self.undo.push(Box::new(move |tables| {
            table(tables).insert(key, restored);
        }));
        Some(previous)
    }

    pub fn insert_member<T>(&mut self, table: SetRef<T>, member: T)
    where
        T: Ord + Clone + Send + 'static,
    {
        if table(self.tables).insert(member.clone()) {
            self.undo.push(Box::new(move |tables| {
                table(tables).remove(&member);
            }));
        }
    }

    pub fn remove_member<T>(&mut self, table: SetRef<T>, member: &T)
    where
        T: Ord + Clone + Send + 'static,
    {
        if table(self.tables).remove(member) {
            let member = member.clone();
            self.undo.push(Box::new(move |tables| {
                table(tables).insert(member);
            }));
        }
    }

    pub fn update_target_globals(&mut self, update: impl FnOnce(&mut TargetGlobals)) {
        let previous = self.tables.target_globals.clone();
        update(&mut self.tables.target_globals);
        if self.tables.target_globals != previous {
            self.undo.push(Box::new(move |tables| {
                tables.target_globals = previous;
            }));
        }
    }

    /// Removes every member of `table` in `range`.
    pub fn remove_members_in<T, R>(&mut self, table: SetRef<T>, range: R)
    where
        T: Ord + Clone + Send + 'static,
        R: std::ops::RangeBounds<T>,
    {
        let members: Vec<T> = table(self.tables).range(range).cloned().collect();
        for member in members {
            self.remove_member(table, &member);
        }
    }
}

/// Writes made by a committed transaction, kept until the driver has made
/// them durable.
pub(crate) struct UndoLog(Vec<UndoFn>);

impl UndoLog {
    pub(crate) fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn rollback(self, tables: &mut Tables) {
        for undo in self.0.into_iter().rev() {
            undo(tables);
        }
    }
}

pub(crate) fn run_on_tables(
    tables: &mut Tables,
    label: &str,
    operation: &mut dyn FnMut(&mut PersistenceTransaction<'_>) -> FirestoreResult<()>,
) -> FirestoreResult<UndoLog> {
    let mut txn = PersistenceTransaction::new(tables);
    let result = operation(&mut txn);
    let undo = UndoLog(std::mem::take(&mut txn.undo));
    match result {
        Ok(()) => Ok(undo),
        Err(err) => {
            log::debug!("transaction '{label}' failed: {err}");
            undo.rollback(tables);
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::firestore::error::invalid_argument;
    use crate::firestore::model::{DocumentKey, MutableDocument, SnapshotVersion};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    #[test]
    fn failed_transaction_rolls_back() {
        let persistence: Arc<dyn Persistence> = Arc::new(MemoryPersistence::new());
        persistence
            .run_transaction("seed", |txn| {
                txn.put(
                    Tables::remote_documents_mut,
                    key("rooms/a"),
                    MutableDocument::new_no_document(key("rooms/a"), SnapshotVersion::min()),
                );
                Ok(())
            })
            .unwrap();

        let result: FirestoreResult<()> = persistence.run_transaction("fail", |txn| {
            txn.delete(Tables::remote_documents_mut, &key("rooms/a"));
            txn.insert_member(Tables::target_documents_mut, (2, key("rooms/b")));
            txn.update_target_globals(|globals| globals.highest_target_id = 10);
            Err(invalid_argument("boom"))
        });
        assert!(result.is_err());

        persistence
            .run_transaction("check", |txn| {
                assert!(txn.tables().remote_documents.contains_key(&key("rooms/a")));
                assert!(txn.tables().target_documents.is_empty());
                assert_eq!(txn.tables().target_globals.highest_target_id, 0);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn returns_transaction_output() {
        let persistence: Arc<dyn Persistence> = Arc::new(MemoryPersistence::new());
        let value = persistence
            .run_transaction("read", |txn| Ok(txn.tables().targets.len()))
            .unwrap();
        assert_eq!(value, 0);
    }
}
