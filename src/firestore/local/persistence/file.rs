use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use crate::firestore::error::{
    failed_precondition, internal_error, persistence_unavailable, FirestoreResult,
};
use crate::firestore::local::persistence::{
    run_on_tables, Persistence, PersistenceTransaction, Tables,
};

struct FileState {
    tables: Tables,
    closed: bool,
}

/// Durable driver backed by one JSON file.
///
/// An exclusive `<file>.lock` marks the store as owned by this instance;
/// a second instance opening the same path gets `persistence-unavailable`.
/// Every committed transaction that wrote something rewrites the file
/// through a temporary file and a rename.
pub struct FilePersistence {
    path: PathBuf,
    lock_path: PathBuf,
    state: Mutex<FileState>,
}

impl FilePersistence {
    pub fn open(path: impl AsRef<Path>) -> FirestoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|err| {
                    persistence_unavailable(format!("cannot create {}: {err}", parent.display()))
                })?;
            }
        }

        let lock_path = path.with_extension("lock");
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
        {
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                return Err(persistence_unavailable(format!(
                    "{} is locked by another instance",
                    path.display()
                )));
            }
            Err(err) => {
                return Err(persistence_unavailable(format!(
                    "cannot lock {}: {err}",
                    path.display()
                )));
            }
        }

        let tables = match Self::load(&path) {
            Ok(tables) => tables,
            Err(err) => {
                let _ = fs::remove_file(&lock_path);
                return Err(err);
            }
        };
        log::debug!("opened durable persistence at {}", path.display());

        Ok(Self {
            path,
            lock_path,
            state: Mutex::new(FileState {
                tables,
                closed: false,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(path: &Path) -> FirestoreResult<Tables> {
        match fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|err| {
                internal_error(format!("corrupt persistence file {}: {err}", path.display()))
            }),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Tables::default()),
            Err(err) => Err(persistence_unavailable(format!(
                "cannot read {}: {err}",
                path.display()
            ))),
        }
    }

    fn flush(&self, tables: &Tables) -> FirestoreResult<()> {
        let bytes = serde_json::to_vec(tables)
            .map_err(|err| internal_error(format!("cannot encode persistence state: {err}")))?;
        let temp_path = self.path.with_extension("tmp");
        fs::write(&temp_path, bytes)
            .and_then(|_| fs::rename(&temp_path, &self.path))
            .map_err(|err| {
                persistence_unavailable(format!("cannot write {}: {err}", self.path.display()))
            })
    }

    fn release_lock(&self) {
        if let Err(err) = fs::remove_file(&self.lock_path) {
            if err.kind() != ErrorKind::NotFound {
                log::warn!("failed to remove {}: {err}", self.lock_path.display());
            }
        }
    }
}

impl Persistence for FilePersistence {
    fn run_transaction_dyn(
        &self,
        label: &str,
        operation: &mut dyn FnMut(&mut PersistenceTransaction<'_>) -> FirestoreResult<()>,
    ) -> FirestoreResult<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.closed {
            return Err(failed_precondition(format!(
                "transaction '{label}' started after persistence shut down"
            )));
        }
        let undo = run_on_tables(&mut state.tables, label, operation)?;
        if undo.is_empty() {
            return Ok(());
        }
        if let Err(err) = self.flush(&state.tables) {
            log::warn!("transaction '{label}' could not be persisted: {err}");
            undo.rollback(&mut state.tables);
            return Err(err);
        }
        Ok(())
    }

    fn shutdown(&self) -> FirestoreResult<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.closed {
            state.closed = true;
            self.release_lock();
        }
        Ok(())
    }

    fn is_durable(&self) -> bool {
        true
    }
}

impl Drop for FilePersistence {
    fn drop(&mut self) {
        let closed = self
            .state
            .get_mut()
            .map(|state| state.closed)
            .unwrap_or_else(|poisoned| poisoned.into_inner().closed);
        if !closed {
            self.release_lock();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::firestore::model::{DocumentKey, MutableDocument, SnapshotVersion};

    #[test]
    fn second_instance_is_locked_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let first = FilePersistence::open(&path).unwrap();
        let err = FilePersistence::open(&path).err().unwrap();
        assert_eq!(err.code_str(), "firestore/persistence-unavailable");
        first.shutdown().unwrap();
        assert!(FilePersistence::open(&path).is_ok());
    }

    #[test]
    fn committed_writes_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("store.json");
        let key = DocumentKey::from_string("rooms/eros").unwrap();
        {
            let persistence: Arc<dyn Persistence> = Arc::new(FilePersistence::open(&path).unwrap());
            persistence
                .run_transaction("write", |txn| {
                    txn.put(
                        Tables::remote_documents_mut,
                        key.clone(),
                        MutableDocument::new_no_document(key.clone(), SnapshotVersion::min()),
                    );
                    Ok(())
                })
                .unwrap();
        }
        let persistence: Arc<dyn Persistence> = Arc::new(FilePersistence::open(&path).unwrap());
        let found = persistence
            .run_transaction("read", |txn| {
                Ok(txn.tables().remote_documents.contains_key(&key))
            })
            .unwrap();
        assert!(found);
    }
}
