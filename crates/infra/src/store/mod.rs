//! Versioned document store boundary.
//!
//! Aggregates are persisted as whole JSON documents keyed by `(collection, key)`.
//! Every write carries an [`ExpectedVersion`](dialtone_core::ExpectedVersion);
//! there is no delete.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryDocumentStore;
pub use postgres::PostgresDocumentStore;
pub use r#trait::{DocumentStore, NewDocument, StoreError, StoredDocument};
