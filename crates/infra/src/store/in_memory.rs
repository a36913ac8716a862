use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;

use dialtone_core::{ExpectedVersion, TenantId};

use super::r#trait::{DocumentStore, NewDocument, StoreError, StoredDocument};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct DocumentKey {
    collection: String,
    key: String,
}

/// In-memory document store.
///
/// Intended for tests/dev. Not optimized for performance.
#[derive(Debug, Default)]
pub struct InMemoryDocumentStore {
    documents: RwLock<BTreeMap<DocumentKey, StoredDocument>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn get(
        &self,
        collection: &str,
        key: &str,
    ) -> Result<Option<StoredDocument>, StoreError> {
        let documents = self
            .documents
            .read()
            .map_err(|_| StoreError::Backend("lock poisoned".to_string()))?;

        Ok(documents
            .get(&DocumentKey {
                collection: collection.to_string(),
                key: key.to_string(),
            })
            .cloned())
    }

    async fn put(
        &self,
        document: NewDocument,
        expected_version: ExpectedVersion,
    ) -> Result<StoredDocument, StoreError> {
        let mut documents = self
            .documents
            .write()
            .map_err(|_| StoreError::Backend("lock poisoned".to_string()))?;

        let key = DocumentKey {
            collection: document.collection.to_string(),
            key: document.key.clone(),
        };
        let existing = documents.get(&key);
        let current = existing.map(|d| d.version).unwrap_or(0);

        if !expected_version.matches(current) {
            return Err(StoreError::Conflict(format!(
                "{}/{}: expected {expected_version:?}, found {current}",
                document.collection, document.key
            )));
        }

        if let Some(existing) = existing {
            if existing.tenant_id != document.tenant_id {
                return Err(StoreError::TenantIsolation(format!(
                    "{}/{} belongs to another tenant",
                    document.collection, document.key
                )));
            }
        }

        let stored = StoredDocument {
            collection: key.collection.clone(),
            key: key.key.clone(),
            tenant_id: document.tenant_id,
            version: current + 1,
            body: document.body,
            updated_at: Utc::now(),
        };
        documents.insert(key, stored.clone());
        Ok(stored)
    }

    async fn list(
        &self,
        collection: &str,
        tenant_id: Option<TenantId>,
    ) -> Result<Vec<StoredDocument>, StoreError> {
        let documents = self
            .documents
            .read()
            .map_err(|_| StoreError::Backend("lock poisoned".to_string()))?;

        Ok(documents
            .values()
            .filter(|d| d.collection == collection)
            .filter(|d| tenant_id.is_none() || d.tenant_id == tenant_id)
            .cloned()
            .collect())
    }

    async fn list_prefix(
        &self,
        collection: &str,
        tenant_id: Option<TenantId>,
        prefix: &str,
    ) -> Result<Vec<StoredDocument>, StoreError> {
        let documents = self
            .documents
            .read()
            .map_err(|_| StoreError::Backend("lock poisoned".to_string()))?;

        let start = DocumentKey {
            collection: collection.to_string(),
            key: prefix.to_string(),
        };
        Ok(documents
            .range(start..)
            .take_while(|(k, _)| k.collection == collection && k.key.starts_with(prefix))
            .map(|(_, d)| d)
            .filter(|d| tenant_id.is_none() || d.tenant_id == tenant_id)
            .cloned()
            .collect())
    }
}
