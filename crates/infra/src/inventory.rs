//! Tenant phone-number inventory (read side of the purchase flow).

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use dialtone_compliance::PhoneNumber;
use dialtone_core::{ExpectedVersion, TenantId};

use crate::store::{DocumentStore, NewDocument, StoreError};

pub const OWNED_NUMBERS_COLLECTION: &str = "owned_phone_numbers";

#[async_trait]
pub trait NumberInventory: Send + Sync {
    /// Numbers the tenant owns, in key order.
    async fn list_available_numbers(&self, tenant_id: TenantId) -> Result<Vec<PhoneNumber>, StoreError>;

    async fn owns(&self, tenant_id: TenantId, number: &PhoneNumber) -> Result<bool, StoreError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OwnedNumber {
    number: PhoneNumber,
    tenant_id: TenantId,
    acquired_at: DateTime<Utc>,
}

/// Inventory over the `owned_phone_numbers` collection.
pub struct DocumentNumberInventory {
    store: Arc<dyn DocumentStore>,
}

impl DocumentNumberInventory {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Record a purchased number. Idempotent for the owning tenant.
    pub async fn register_owned_number(
        &self,
        tenant_id: TenantId,
        number: &PhoneNumber,
    ) -> Result<(), StoreError> {
        let body = serde_json::to_value(OwnedNumber {
            number: number.clone(),
            tenant_id,
            acquired_at: Utc::now(),
        })
        .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let document = NewDocument {
            collection: OWNED_NUMBERS_COLLECTION,
            key: number.to_string(),
            tenant_id: Some(tenant_id),
            body,
        };
        match self.store.put(document, ExpectedVersion::absent()).await {
            Ok(_) => Ok(()),
            Err(StoreError::Conflict(msg)) => {
                if self.owns(tenant_id, number).await? {
                    Ok(())
                } else {
                    Err(StoreError::TenantIsolation(format!(
                        "{number} is owned by another tenant ({msg})"
                    )))
                }
            }
            Err(other) => Err(other),
        }
    }
}

#[async_trait]
impl NumberInventory for DocumentNumberInventory {
    async fn list_available_numbers(&self, tenant_id: TenantId) -> Result<Vec<PhoneNumber>, StoreError> {
        self.store
            .list(OWNED_NUMBERS_COLLECTION, Some(tenant_id))
            .await?
            .into_iter()
            .map(|doc| {
                serde_json::from_value::<OwnedNumber>(doc.body)
                    .map(|owned| owned.number)
                    .map_err(|e| StoreError::Serialization(format!("{}: {e}", doc.key)))
            })
            .collect()
    }

    async fn owns(&self, tenant_id: TenantId, number: &PhoneNumber) -> Result<bool, StoreError> {
        Ok(self
            .store
            .get(OWNED_NUMBERS_COLLECTION, number.as_str())
            .await?
            .is_some_and(|doc| doc.tenant_id == Some(tenant_id)))
    }
}
