use std::sync::{Mutex, PoisonError};

use crate::firestore::error::{failed_precondition, FirestoreResult};
use crate::firestore::local::persistence::{
    run_on_tables, Persistence, PersistenceTransaction, Tables,
};

#[derive(Default)]
struct MemoryState {
    tables: Tables,
    closed: bool,
}

/// Non-durable driver; state lives as long as the value.
#[derive(Default)]
pub struct MemoryPersistence {
    state: Mutex<MemoryState>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Persistence for MemoryPersistence {
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
        run_on_tables(&mut state.tables, label, operation).map(|_| ())
    }

    fn shutdown(&self) -> FirestoreResult<()> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closed = true;
        Ok(())
    }

    fn is_durable(&self) -> bool {
        false
    }
}
