//! Shared domain building blocks for the dialtone crates.
//!
//! Identifiers, the domain error model, optimistic-concurrency primitives and the
//! clock abstraction. No infrastructure concerns live here.

pub mod aggregate;
pub mod clock;
pub mod error;
pub mod id;

pub use aggregate::{AggregateRoot, ExpectedVersion};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use id::{BrandId, CampaignId, RegistrationId, TenantId, UserId};
