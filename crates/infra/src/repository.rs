//! Typed repositories over the document store.
//!
//! A [`Document`] knows its collection, its key and its tenant. The repository
//! does the JSON mapping and stamps the store version back onto the aggregate,
//! so a later `save` is a compare-and-swap against the revision that was read.

use std::marker::PhantomData;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use dialtone_compliance::{
    A2pBrand, A2pCampaign, A2pRegistration, ComplianceAttempt, NumberBinding,
};
use dialtone_core::{AggregateRoot, ExpectedVersion, TenantId};

use crate::store::{DocumentStore, NewDocument, StoreError, StoredDocument};

pub trait Document: AggregateRoot + Serialize + DeserializeOwned + Send + Sync {
    const COLLECTION: &'static str;

    fn key(&self) -> String;

    /// `None` for global documents readable by every tenant.
    fn tenant_id(&self) -> Option<TenantId>;

    fn set_version(&mut self, version: u64);
}

impl Document for A2pRegistration {
    const COLLECTION: &'static str = "registrations";

    fn key(&self) -> String {
        self.id.to_string()
    }

    fn tenant_id(&self) -> Option<TenantId> {
        Some(self.tenant_id)
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

/// Keyed by registration id: at most one brand per registration.
impl Document for A2pBrand {
    const COLLECTION: &'static str = "brands";

    fn key(&self) -> String {
        self.registration_id.to_string()
    }

    fn tenant_id(&self) -> Option<TenantId> {
        Some(self.tenant_id)
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

impl Document for A2pCampaign {
    const COLLECTION: &'static str = "campaigns";

    fn key(&self) -> String {
        self.registration_id.to_string()
    }

    fn tenant_id(&self) -> Option<TenantId> {
        Some(self.tenant_id)
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

/// Global: a number is owned by one registration across all tenants.
impl Document for NumberBinding {
    const COLLECTION: &'static str = "number_bindings";

    fn key(&self) -> String {
        self.number.to_string()
    }

    fn tenant_id(&self) -> Option<TenantId> {
        None
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

impl Document for ComplianceAttempt {
    const COLLECTION: &'static str = "compliance_attempts";

    fn key(&self) -> String {
        self.id.key()
    }

    fn tenant_id(&self) -> Option<TenantId> {
        Some(self.tenant_id)
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

pub struct Repository<T> {
    store: Arc<dyn DocumentStore>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Repository<T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Document> Repository<T> {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            _marker: PhantomData,
        }
    }

    /// Load without a tenant check (global documents, sweeps, webhooks).
    pub async fn load_any(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.store.get(T::COLLECTION, key).await? {
            Some(doc) => decode(doc).map(Some),
            None => Ok(None),
        }
    }

    /// Load a document owned by `tenant_id`.
    pub async fn load(&self, tenant_id: TenantId, key: &str) -> Result<Option<T>, StoreError> {
        let Some(doc) = self.store.get(T::COLLECTION, key).await? else {
            return Ok(None);
        };
        if let Some(owner) = doc.tenant_id {
            if owner != tenant_id {
                return Err(StoreError::TenantIsolation(format!(
                    "{}/{key} is not visible to tenant {tenant_id}",
                    T::COLLECTION
                )));
            }
        }
        decode(doc).map(Some)
    }

    /// Create-if-absent.
    pub async fn insert(&self, value: &mut T) -> Result<(), StoreError> {
        self.write(value, ExpectedVersion::absent()).await
    }

    /// Compare-and-swap against the version `value` was loaded at.
    pub async fn save(&self, value: &mut T) -> Result<(), StoreError> {
        let expected = ExpectedVersion::Exact(value.version());
        self.write(value, expected).await
    }

    pub async fn list(&self, tenant_id: Option<TenantId>) -> Result<Vec<T>, StoreError> {
        self.store
            .list(T::COLLECTION, tenant_id)
            .await?
            .into_iter()
            .map(decode)
            .collect()
    }

    /// Documents whose key starts with `prefix`, in key order.
    pub async fn list_prefix(&self, tenant_id: Option<TenantId>, prefix: &str) -> Result<Vec<T>, StoreError> {
        self.store
            .list_prefix(T::COLLECTION, tenant_id, prefix)
            .await?
            .into_iter()
            .map(decode)
            .collect()
    }

    async fn write(&self, value: &mut T, expected: ExpectedVersion) -> Result<(), StoreError> {
        let body = serde_json::to_value(&*value)
            .map_err(|e| StoreError::Serialization(format!("{}: {e}", T::COLLECTION)))?;
        let stored = self
            .store
            .put(
                NewDocument {
                    collection: T::COLLECTION,
                    key: value.key(),
                    tenant_id: value.tenant_id(),
                    body,
                },
                expected,
            )
            .await?;
        value.set_version(stored.version);
        Ok(())
    }
}

fn decode<T: Document>(doc: StoredDocument) -> Result<T, StoreError> {
    let mut value: T = serde_json::from_value(doc.body).map_err(|e| {
        StoreError::Serialization(format!("{}/{}: {e}", doc.collection, doc.key))
    })?;
    value.set_version(doc.version);
    Ok(value)
}
