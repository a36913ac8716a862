//! Request/response bodies that are not domain types themselves.
//!
//! Forms, attestations and the webhook body deserialize straight into the
//! compliance types, which re-validate them before any dispatch.

use serde::{Deserialize, Serialize};

use dialtone_compliance::{A2pRegistration, ComplianceAttempt, PhoneNumber};

#[derive(Debug, Deserialize)]
pub struct SelectPhoneNumbersRequest {
    pub phone_numbers: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct RegistrationList {
    pub registrations: Vec<A2pRegistration>,
}

#[derive(Debug, Serialize)]
pub struct AvailableNumbers {
    pub phone_numbers: Vec<PhoneNumber>,
}

#[derive(Debug, Serialize)]
pub struct AttemptList {
    pub attempts: Vec<ComplianceAttempt>,
}
