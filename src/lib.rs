//! Offline-first synchronization engine for Firestore-style document clients.
//!
//! Writes are applied to a local cache immediately and queued for the
//! backend; queries are answered from the cache and kept in sync with the
//! server through a long-lived watch stream. See [`firestore::FirestoreClient`]
//! for the entry point.

pub mod firestore;
pub mod platform;
pub mod util;
