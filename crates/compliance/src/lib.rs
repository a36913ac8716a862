//! A2P 10DLC compliance domain (pure, no IO).
//!
//! Registration aggregate and its state machine, brand/campaign sub-entities,
//! per-number bindings, the attempt audit record and gateway outcome types.
//! Persistence, gateway calls and orchestration live in `dialtone-infra`.

pub mod attempt;
pub mod binding;
pub mod brand;
pub mod campaign;
pub mod outcome;
pub mod phone;
pub mod registration;
pub mod status;

pub use attempt::{
    AttemptErrorKind, AttemptId, AttemptResolution, AttemptSlot, AttemptStatus, AttemptType,
    ComplianceAttempt, IdempotencyKey,
};
pub use binding::{NumberBinding, NumberBindingStatus, NumberFailure};
pub use brand::{A2pBrand, BrandForm, BrandStatus};
pub use campaign::{A2pCampaign, CampaignForm, CampaignStatus};
pub use outcome::{GatewayOutcome, ReviewState, UpstreamStatus, UpstreamStatusUpdate};
pub use phone::PhoneNumber;
pub use registration::{
    A2pRegistration, ComplianceAttestations, RegistrationForms, RegistrationStatus,
    TransitionEvidence, WizardStep,
};
pub use status::{LastError, NumberStatusView, RegistrationStatusView};
