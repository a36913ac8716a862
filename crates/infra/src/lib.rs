//! Infrastructure layer: document store, attempt log, compliance gateway and
//! the registration orchestrator on top of them.

pub mod attempt_log;
pub mod config;
pub mod error;
pub mod gateway;
pub mod inventory;
pub mod number_binder;
pub mod orchestrator;
pub mod queries;
pub mod reconcile;
pub mod registrar;
pub mod repository;
pub mod retry;
pub mod store;
pub mod sweeper;
pub mod wizard;

mod integration_tests;

pub use attempt_log::{AttemptLog, AttemptLogError, AttemptStart, DocumentAttemptLog};
pub use config::{OrchestratorConfig, SweeperConfig};
pub use error::{ComplianceError, ComplianceResult};
pub use gateway::{
    CallKind, ComplianceGateway, GatewayError, GatewayResponse, HttpComplianceGateway,
    HttpGatewayConfig, SandboxGateway, StatusQuery,
};
pub use inventory::{DocumentNumberInventory, NumberInventory};
pub use number_binder::{BindReport, FailedNumber};
pub use orchestrator::{AdvanceAction, AdvanceReport, Orchestrator};
pub use queries::ReconcileReport;
pub use retry::{BackoffStrategy, RetryPolicy};
pub use store::{DocumentStore, InMemoryDocumentStore, PostgresDocumentStore, StoreError};
pub use sweeper::{StatusSweeper, SweepReport, SweeperHandle};
pub use wizard::{RejectedNumber, SelectionReport};
