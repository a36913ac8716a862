//! Service wiring: document store, gateway and the orchestrator on top.

use std::sync::Arc;

use thiserror::Error;

use dialtone_core::{Clock, SystemClock};
use dialtone_infra::{
    ComplianceGateway, DocumentNumberInventory, DocumentStore, GatewayError, HttpComplianceGateway,
    InMemoryDocumentStore, NumberInventory, Orchestrator, OrchestratorConfig,
    PostgresDocumentStore, SandboxGateway, StoreError,
};

use crate::config::AppConfig;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("document store unavailable: {0}")]
    Store(#[from] StoreError),

    #[error("compliance gateway misconfigured: {0}")]
    Gateway(#[from] GatewayError),
}

/// Everything handlers need, shared behind an `Arc`.
pub struct AppServices {
    pub orchestrator: Arc<Orchestrator>,
    /// Owned-number inventory; the purchase flow writes it, handlers only read.
    pub inventory: Arc<DocumentNumberInventory>,
    pub webhook_secret: String,
}

impl AppServices {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        gateway: Arc<dyn ComplianceGateway>,
        clock: Arc<dyn Clock>,
        config: OrchestratorConfig,
        webhook_secret: impl Into<String>,
    ) -> Self {
        let inventory = Arc::new(DocumentNumberInventory::new(store.clone()));
        let inventory_seam: Arc<dyn NumberInventory> = inventory.clone();
        let orchestrator = Arc::new(Orchestrator::new(store, gateway, inventory_seam, clock, config));
        Self {
            orchestrator,
            inventory,
            webhook_secret: webhook_secret.into(),
        }
    }

    /// In-memory store and sandbox gateway. Used by tests and local runs.
    pub fn in_memory(webhook_secret: impl Into<String>) -> Self {
        Self::new(
            Arc::new(InMemoryDocumentStore::new()),
            Arc::new(SandboxGateway::new()),
            Arc::new(SystemClock),
            OrchestratorConfig::default(),
            webhook_secret,
        )
    }
}

pub async fn build_services(config: &AppConfig) -> Result<AppServices, StartupError> {
    let store: Arc<dyn DocumentStore> = match &config.database_url {
        Some(url) => {
            let store = PostgresDocumentStore::connect(url).await?;
            store.migrate().await?;
            tracing::info!("using postgres document store");
            Arc::new(store)
        }
        None => {
            tracing::warn!("DATABASE_URL not set; state is kept in memory only");
            Arc::new(InMemoryDocumentStore::new())
        }
    };

    let gateway: Arc<dyn ComplianceGateway> = match &config.gateway {
        Some(http) => {
            tracing::info!(base_url = %http.base_url, "using upstream compliance API");
            Arc::new(HttpComplianceGateway::new(http)?)
        }
        None => Arc::new(SandboxGateway::new()),
    };

    Ok(AppServices::new(
        store,
        gateway,
        Arc::new(SystemClock),
        config.orchestrator.clone(),
        config.webhook_secret.clone(),
    ))
}
