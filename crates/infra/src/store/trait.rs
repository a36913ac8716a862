use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use thiserror::Error;

use dialtone_core::{ExpectedVersion, TenantId};

/// A document as handed to [`DocumentStore::put`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewDocument {
    pub collection: &'static str,
    pub key: String,
    /// `None` for global documents (e.g. per-number ownership).
    pub tenant_id: Option<TenantId>,
    pub body: JsonValue,
}

/// A persisted document revision.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub collection: String,
    pub key: String,
    pub tenant_id: Option<TenantId>,
    /// Starts at 1 on create, incremented by every successful write.
    pub version: u64,
    pub body: JsonValue,
    pub updated_at: DateTime<Utc>,
}

/// Document store operation error.
///
/// Infrastructure errors only; domain rules are enforced above the store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Conditional write lost (version mismatch or document already exists).
    #[error("optimistic concurrency check failed: {0}")]
    Conflict(String),

    /// A write tried to move a document to another tenant.
    #[error("tenant isolation violation: {0}")]
    TenantIsolation(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Key/value + collection store with compare-and-swap writes.
///
/// Implementations must:
/// - treat `ExpectedVersion::Exact(0)` as create-if-absent
/// - reject a write whose expectation does not match the stored version
/// - never change a document's tenant after creation
/// - return `list` and `list_prefix` results ordered by key
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(
        &self,
        collection: &str,
        key: &str,
    ) -> Result<Option<StoredDocument>, StoreError>;

    /// Write a document. Returns the new revision.
    async fn put(
        &self,
        document: NewDocument,
        expected_version: ExpectedVersion,
    ) -> Result<StoredDocument, StoreError>;

    /// List a collection, optionally restricted to one tenant.
    async fn list(
        &self,
        collection: &str,
        tenant_id: Option<TenantId>,
    ) -> Result<Vec<StoredDocument>, StoreError>;

    /// List the documents of a collection whose key starts with `prefix`.
    async fn list_prefix(
        &self,
        collection: &str,
        tenant_id: Option<TenantId>,
        prefix: &str,
    ) -> Result<Vec<StoredDocument>, StoreError>;
}

#[async_trait]
impl<S> DocumentStore for Arc<S>
where
    S: DocumentStore + ?Sized,
{
    async fn get(
        &self,
        collection: &str,
        key: &str,
    ) -> Result<Option<StoredDocument>, StoreError> {
        (**self).get(collection, key).await
    }

    async fn put(
        &self,
        document: NewDocument,
        expected_version: ExpectedVersion,
    ) -> Result<StoredDocument, StoreError> {
        (**self).put(document, expected_version).await
    }

    async fn list(
        &self,
        collection: &str,
        tenant_id: Option<TenantId>,
    ) -> Result<Vec<StoredDocument>, StoreError> {
        (**self).list(collection, tenant_id).await
    }

    async fn list_prefix(
        &self,
        collection: &str,
        tenant_id: Option<TenantId>,
        prefix: &str,
    ) -> Result<Vec<StoredDocument>, StoreError> {
        (**self).list_prefix(collection, tenant_id, prefix).await
    }
}
