//! End-to-end tests of the registration workflow over the in-memory store and
//! the sandbox gateway.
//!
//! Verifies:
//! - each step dispatches exactly one upstream submission, even under concurrent advances
//! - retriable and fatal failures land in the audit trail and the status view
//! - a crash between dispatch and finalization is reconciled, not resubmitted
//! - a phone number is held by at most one active registration

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;

    use dialtone_compliance::{
        AttemptErrorKind, AttemptStatus, AttemptType, BrandForm, BrandStatus, CampaignForm,
        CampaignStatus, ComplianceAttestations, GatewayOutcome, IdempotencyKey,
        NumberBindingStatus, PhoneNumber, RegistrationStatus, ReviewState, UpstreamStatus,
        UpstreamStatusUpdate,
    };
    use dialtone_core::{ManualClock, RegistrationId, TenantId, UserId};

    use crate::config::{OrchestratorConfig, SweeperConfig};
    use crate::error::ComplianceError;
    use crate::gateway::{
        BrandSubmission, CallKind, CampaignSubmission, ComplianceGateway, GatewayResponse,
        SandboxGateway, StatusQuery,
    };
    use crate::inventory::DocumentNumberInventory;
    use crate::orchestrator::{AdvanceAction, Orchestrator};
    use crate::retry::RetryPolicy;
    use crate::store::InMemoryDocumentStore;
    use crate::sweeper::StatusSweeper;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Stall {
        /// The request never reaches upstream.
        BeforeUpstream,
        /// Upstream records the request, the response is lost.
        AfterUpstream,
    }

    /// Sandbox wrapper that hangs selected calls, simulating a process dying mid-call.
    struct StallingGateway {
        inner: Arc<SandboxGateway>,
        stalls: Mutex<HashMap<CallKind, Stall>>,
    }

    impl StallingGateway {
        fn stall(&self, kind: CallKind, stall: Stall) {
            self.stalls.lock().unwrap().insert(kind, stall);
        }

        fn resume(&self, kind: CallKind) {
            self.stalls.lock().unwrap().remove(&kind);
        }

        fn stall_for(&self, kind: CallKind) -> Option<Stall> {
            self.stalls.lock().unwrap().get(&kind).copied()
        }

        async fn run<F>(&self, kind: CallKind, call: F) -> GatewayResponse
        where
            F: std::future::Future<Output = GatewayResponse> + Send,
        {
            match self.stall_for(kind) {
                Some(Stall::BeforeUpstream) => std::future::pending().await,
                Some(Stall::AfterUpstream) => {
                    call.await;
                    std::future::pending().await
                }
                None => call.await,
            }
        }
    }

    #[async_trait]
    impl ComplianceGateway for StallingGateway {
        async fn register_brand(&self, s: &BrandSubmission, key: &IdempotencyKey) -> GatewayResponse {
            self.run(CallKind::Brand, self.inner.register_brand(s, key)).await
        }

        async fn register_campaign(&self, s: &CampaignSubmission, key: &IdempotencyKey) -> GatewayResponse {
            self.run(CallKind::Campaign, self.inner.register_campaign(s, key)).await
        }

        async fn assign_number(
            &self,
            number: &PhoneNumber,
            campaign_ref: &str,
            key: &IdempotencyKey,
        ) -> GatewayResponse {
            self.run(CallKind::Number, self.inner.assign_number(number, campaign_ref, key))
                .await
        }

        async fn check_status(&self, query: &StatusQuery, key: &IdempotencyKey) -> GatewayResponse {
            self.run(CallKind::Status, self.inner.check_status(query, key)).await
        }
    }

    struct Harness {
        orchestrator: Arc<Orchestrator>,
        sandbox: Arc<SandboxGateway>,
        gateway: Arc<StallingGateway>,
        inventory: Arc<DocumentNumberInventory>,
        clock: Arc<ManualClock>,
        tenant: TenantId,
        user: UserId,
    }

    fn harness() -> Harness {
        let store = Arc::new(InMemoryDocumentStore::new());
        let sandbox = Arc::new(SandboxGateway::new());
        let gateway = Arc::new(StallingGateway {
            inner: sandbox.clone(),
            stalls: Mutex::new(HashMap::new()),
        });
        let inventory = Arc::new(DocumentNumberInventory::new(store.clone()));
        let clock = Arc::new(ManualClock::default());
        let orchestrator = Arc::new(Orchestrator::new(
            store,
            gateway.clone(),
            inventory.clone(),
            clock.clone(),
            OrchestratorConfig::default(),
        ));
        Harness {
            orchestrator,
            sandbox,
            gateway,
            inventory,
            clock,
            tenant: TenantId::new(),
            user: UserId::new(),
        }
    }

    fn brand_form() -> BrandForm {
        BrandForm {
            company_name: "Acme Voice LLC".into(),
            website: "https://acme.example".into(),
            support_email: "support@acme.example".into(),
            support_phone: "+1 555 010 0000".into(),
            tax_id: "12-3456789".into(),
            business_type: "private_profit".into(),
            industry_vertical: "technology".into(),
        }
    }

    fn campaign_form() -> CampaignForm {
        CampaignForm {
            name: "Appointment reminders".into(),
            description: "Reminders for booked appointments".into(),
            use_case: "account_notification".into(),
            vertical: "healthcare".into(),
            traffic_type: "low_volume_mixed".into(),
            sample_messages: vec![
                "Hi Sam, your appointment is tomorrow at 3pm. Reply STOP to opt out.".into(),
            ],
            sample_urls: vec!["https://acme.example/appointments".into()],
            message_flow: "Customers opt in on the booking form checkbox".into(),
        }
    }

    fn attested() -> ComplianceAttestations {
        ComplianceAttestations {
            opt_in_consent: true,
            terms_accepted: true,
            ..Default::default()
        }
    }

    impl Harness {
        async fn own(&self, raw: &str) -> PhoneNumber {
            let number = PhoneNumber::parse(raw).unwrap();
            self.inventory
                .register_owned_number(self.tenant, &number)
                .await
                .unwrap();
            number
        }

        async fn draft_with_brand(&self) -> RegistrationId {
            self.draft_with_brand_for(self.tenant).await
        }

        async fn draft_with_brand_for(&self, tenant: TenantId) -> RegistrationId {
            let r = self
                .orchestrator
                .create_registration(tenant, self.user)
                .await
                .unwrap();
            self.orchestrator
                .save_brand_form(tenant, r.id, brand_form())
                .await
                .unwrap();
            r.id
        }

        /// Every wizard step filled in, nothing dispatched.
        async fn ready(&self, numbers: &[&str]) -> RegistrationId {
            let id = self.draft_with_brand().await;
            let o = &self.orchestrator;
            o.save_campaign_form(self.tenant, id, campaign_form()).await.unwrap();
            for n in numbers {
                self.own(n).await;
            }
            let selection = o
                .select_phone_numbers(self.tenant, id, numbers.iter().map(|n| n.to_string()).collect())
                .await
                .unwrap();
            assert!(selection.rejected.is_empty(), "{:?}", selection.rejected);
            o.save_attestations(self.tenant, id, self.user, attested()).await.unwrap();
            id
        }

        async fn advance(&self, id: RegistrationId) -> Result<crate::AdvanceReport, ComplianceError> {
            self.orchestrator.advance(self.tenant, id).await
        }

        async fn status(&self, id: RegistrationId) -> RegistrationStatus {
            self.orchestrator
                .get_registration(self.tenant, id)
                .await
                .unwrap()
                .status
        }

        async fn attempts_of(&self, id: RegistrationId, kind: AttemptType) -> Vec<dialtone_compliance::ComplianceAttempt> {
            self.orchestrator
                .list_attempts(self.tenant, id)
                .await
                .unwrap()
                .into_iter()
                .filter(|a| a.attempt_type() == kind)
                .collect()
        }

        async fn campaign_ref(&self, id: RegistrationId) -> String {
            let registration = self.orchestrator.get_registration(self.tenant, id).await.unwrap();
            self.orchestrator
                .registrar
                .load_campaign(&registration)
                .await
                .unwrap()
                .and_then(|c| c.upstream_ref)
                .unwrap()
        }

        /// Drive a ready registration to `submitted`.
        async fn submit(&self, id: RegistrationId) {
            self.advance(id).await.unwrap();
            self.advance(id).await.unwrap();
            let report = self.advance(id).await.unwrap();
            assert_eq!(report.to, RegistrationStatus::Submitted, "{report:?}");
        }
    }

    #[tokio::test]
    async fn draft_with_valid_brand_reaches_campaign_pending() {
        let h = harness();
        let id = h.draft_with_brand().await;

        let report = h.advance(id).await.unwrap();
        assert_eq!(report.from, RegistrationStatus::Draft);
        assert_eq!(report.to, RegistrationStatus::CampaignPending);
        assert_eq!(report.action, AdvanceAction::BrandSubmitted);

        let brand_attempts = h.attempts_of(id, AttemptType::BrandRegistration).await;
        assert_eq!(brand_attempts.len(), 1);
        assert_eq!(brand_attempts[0].status, AttemptStatus::Success);
        assert!(brand_attempts[0].upstream_ref.is_some());
    }

    #[tokio::test]
    async fn draft_without_brand_form_is_rejected_locally() {
        let h = harness();
        let r = h
            .orchestrator
            .create_registration(h.tenant, h.user)
            .await
            .unwrap();

        assert!(matches!(h.advance(r.id).await, Err(ComplianceError::Validation(_))));
        assert_eq!(h.status(r.id).await, RegistrationStatus::Draft);
        assert!(h.orchestrator.list_attempts(h.tenant, r.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn full_flow_dispatches_each_step_once() {
        let h = harness();
        let id = h.ready(&["+15551234567"]).await;

        h.submit(id).await;
        // Further advances only poll.
        let report = h.advance(id).await.unwrap();
        assert_eq!(report.action, AdvanceAction::StatusChecked);
        assert_eq!(report.to, RegistrationStatus::Submitted);

        assert_eq!(h.sandbox.submissions(CallKind::Brand), 1);
        assert_eq!(h.sandbox.submissions(CallKind::Campaign), 1);
        assert_eq!(h.sandbox.submissions(CallKind::Number), 1);

        let campaign_ref = h.campaign_ref(id).await;
        assert!(h.sandbox.decide(&campaign_ref, Ok(ReviewState::Approved)));
        let report = h.advance(id).await.unwrap();
        assert_eq!(report.to, RegistrationStatus::Approved);

        let view = h.orchestrator.get_registration_status(h.tenant, id).await.unwrap();
        assert_eq!(view.brand_status, Some(BrandStatus::Approved));
        assert_eq!(view.campaign_status, Some(CampaignStatus::Approved));
        assert_eq!(view.per_number_status[0].status, NumberBindingStatus::Registered);
        assert!(view.last_error.is_none());

        // Terminal: nothing more happens.
        let report = h.advance(id).await.unwrap();
        assert_eq!(report.action, AdvanceAction::None);
    }

    #[tokio::test]
    async fn concurrent_advances_submit_the_brand_once() {
        let h = harness();
        let id = h.draft_with_brand().await;

        let (a, b) = tokio::join!(h.advance(id), h.advance(id));
        assert!(a.is_ok() || b.is_ok(), "{a:?} / {b:?}");
        for result in [&a, &b] {
            if let Err(err) = result {
                assert!(
                    matches!(err, ComplianceError::ReconciliationRequired { .. }),
                    "unexpected error: {err:?}"
                );
            }
        }

        assert_eq!(h.sandbox.submissions(CallKind::Brand), 1);
        assert_eq!(h.attempts_of(id, AttemptType::BrandRegistration).await.len(), 1);
        assert_eq!(h.status(id).await, RegistrationStatus::CampaignPending);
    }

    #[tokio::test]
    async fn retriable_failures_are_retried_until_accepted() {
        let h = harness();
        let id = h.draft_with_brand().await;
        h.sandbox.script(
            CallKind::Brand,
            [
                GatewayOutcome::retriable("upstream timeout"),
                GatewayOutcome::retriable("upstream timeout"),
            ],
        );

        for _ in 0..2 {
            assert!(matches!(
                h.advance(id).await,
                Err(ComplianceError::RetriableGateway {
                    step: AttemptType::BrandRegistration,
                    ..
                })
            ));
            assert_eq!(h.status(id).await, RegistrationStatus::BrandPending);
        }
        let view = h.orchestrator.get_registration_status(h.tenant, id).await.unwrap();
        let last_error = view.last_error.unwrap();
        assert_eq!(last_error.attempt_type, AttemptType::BrandRegistration);
        assert_eq!(last_error.kind, Some(AttemptErrorKind::Retriable));

        h.advance(id).await.unwrap();
        assert_eq!(h.status(id).await, RegistrationStatus::CampaignPending);

        let attempts = h.attempts_of(id, AttemptType::BrandRegistration).await;
        assert_eq!(attempts.len(), 3);
        assert_eq!(attempts[0].status, AttemptStatus::Error);
        assert_eq!(attempts[1].status, AttemptStatus::Error);
        assert_eq!(attempts[2].status, AttemptStatus::Success);
        let view = h.orchestrator.get_registration_status(h.tenant, id).await.unwrap();
        assert!(view.last_error.is_none());
    }

    #[tokio::test]
    async fn second_registration_cannot_take_a_bound_number() {
        let h = harness();
        h.own("+15551234567").await;
        let first = h.draft_with_brand().await;
        let second = h.draft_with_brand().await;

        let a = h
            .orchestrator
            .select_phone_numbers(h.tenant, first, vec!["+15551234567".into()])
            .await
            .unwrap();
        assert_eq!(a.accepted.len(), 1);

        let b = h
            .orchestrator
            .select_phone_numbers(h.tenant, second, vec!["+1 (555) 123-4567".into()])
            .await
            .unwrap();
        assert!(b.accepted.is_empty());
        assert_eq!(b.rejected.len(), 1);
        assert!(b.rejected[0].reason.contains("already bound"), "{}", b.rejected[0].reason);

        let available = h.orchestrator.list_available_numbers(h.tenant).await.unwrap();
        assert!(available.is_empty());
    }

    #[tokio::test]
    async fn unowned_and_malformed_numbers_are_reported_per_number() {
        let h = harness();
        h.own("+15551234567").await;
        let id = h.draft_with_brand().await;

        let report = h
            .orchestrator
            .select_phone_numbers(
                h.tenant,
                id,
                vec!["+15551234567".into(), "+15559999999".into(), "not a number".into()],
            )
            .await
            .unwrap();
        assert_eq!(report.accepted, vec![PhoneNumber::parse("+15551234567").unwrap()]);
        assert_eq!(report.rejected.len(), 2);
        assert_eq!(report.registration.phone_numbers.len(), 1);
    }

    #[tokio::test]
    async fn replacing_the_selection_releases_dropped_numbers() {
        let h = harness();
        h.own("+15551234567").await;
        h.own("+15557654321").await;
        let first = h.draft_with_brand().await;
        let second = h.draft_with_brand().await;
        let o = &h.orchestrator;

        o.select_phone_numbers(h.tenant, first, vec!["+15551234567".into()]).await.unwrap();
        o.select_phone_numbers(h.tenant, first, vec!["+15557654321".into()]).await.unwrap();

        let report = o
            .select_phone_numbers(h.tenant, second, vec!["+15551234567".into()])
            .await
            .unwrap();
        assert_eq!(report.accepted.len(), 1);
    }

    #[tokio::test]
    async fn refused_selection_leaves_new_numbers_unclaimed() {
        let h = harness();
        let id = h.ready(&["+15551230001", "+15551230002"]).await;
        h.advance(id).await.unwrap();
        h.advance(id).await.unwrap();
        h.sandbox
            .script(CallKind::Number, [GatewayOutcome::rejected("number not eligible for A2P")]);
        let report = h.advance(id).await.unwrap();
        assert_eq!(report.to, RegistrationStatus::CampaignPending);

        // +15551230002 is registered upstream and cannot be dropped.
        h.own("+15551230003").await;
        let replaced = h
            .orchestrator
            .select_phone_numbers(h.tenant, id, vec!["+15551230003".into()])
            .await;
        assert!(matches!(replaced, Err(ComplianceError::InvariantViolation(_))), "{replaced:?}");
        let unchanged = h.orchestrator.get_registration(h.tenant, id).await.unwrap();
        assert!(!unchanged.phone_numbers.contains(&PhoneNumber::parse("+15551230003").unwrap()));

        let available = h.orchestrator.list_available_numbers(h.tenant).await.unwrap();
        assert!(
            available.contains(&PhoneNumber::parse("+15551230003").unwrap()),
            "{available:?}"
        );
        let other = h.draft_with_brand().await;
        let report = h
            .orchestrator
            .select_phone_numbers(h.tenant, other, vec!["+15551230003".into()])
            .await
            .unwrap();
        assert!(report.rejected.is_empty(), "{:?}", report.rejected);
        assert_eq!(report.accepted.len(), 1);
    }

    #[tokio::test]
    async fn crash_after_campaign_dispatch_is_reconciled_not_resubmitted() {
        let h = harness();
        let id = h.ready(&["+15551234567"]).await;
        h.advance(id).await.unwrap();

        h.gateway.stall(CallKind::Campaign, Stall::AfterUpstream);
        let crashed = tokio::time::timeout(Duration::from_millis(50), h.advance(id)).await;
        assert!(crashed.is_err(), "advance should have hung");
        assert_eq!(h.sandbox.submissions(CallKind::Campaign), 1);

        let pending = h.attempts_of(id, AttemptType::CampaignRegistration).await;
        assert_eq!(pending.len(), 1);
        assert!(pending[0].is_pending());

        h.gateway.resume(CallKind::Campaign);
        let report = h.advance(id).await.unwrap();
        assert_eq!(report.action, AdvanceAction::CampaignSubmitted);

        assert_eq!(h.sandbox.calls(CallKind::Campaign), 1);
        assert_eq!(h.sandbox.submissions(CallKind::Campaign), 1);
        let attempts = h.attempts_of(id, AttemptType::CampaignRegistration).await;
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].status, AttemptStatus::Success);
        assert!(!h.attempts_of(id, AttemptType::StatusCheck).await.is_empty());

        h.advance(id).await.unwrap();
        assert_eq!(h.status(id).await, RegistrationStatus::Submitted);
    }

    #[tokio::test]
    async fn lost_request_is_abandoned_after_the_timeout_and_redispatched() {
        let h = harness();
        let id = h.draft_with_brand().await;

        h.gateway.stall(CallKind::Brand, Stall::BeforeUpstream);
        assert!(tokio::time::timeout(Duration::from_millis(50), h.advance(id)).await.is_err());
        h.gateway.resume(CallKind::Brand);

        assert!(matches!(
            h.advance(id).await,
            Err(ComplianceError::ReconciliationRequired { .. })
        ));
        let report = h.orchestrator.force_reconcile(h.tenant, id).await.unwrap();
        assert_eq!(report.still_pending.len(), 1);

        h.clock.advance(chrono::Duration::minutes(16));
        let report = h.orchestrator.force_reconcile(h.tenant, id).await.unwrap();
        assert_eq!(report.abandoned.len(), 1);

        h.advance(id).await.unwrap();
        assert_eq!(h.status(id).await, RegistrationStatus::CampaignPending);
        let attempts = h.attempts_of(id, AttemptType::BrandRegistration).await;
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].error_kind, Some(AttemptErrorKind::Abandoned));
        assert_eq!(attempts[1].status, AttemptStatus::Success);
        assert_ne!(attempts[0].idempotency_key, attempts[1].idempotency_key);
        assert_eq!(h.sandbox.submissions(CallKind::Brand), 1);
    }

    #[tokio::test]
    async fn force_reconcile_applies_the_upstream_record() {
        let h = harness();
        let id = h.draft_with_brand().await;

        h.gateway.stall(CallKind::Brand, Stall::AfterUpstream);
        assert!(tokio::time::timeout(Duration::from_millis(50), h.advance(id)).await.is_err());
        h.gateway.resume(CallKind::Brand);

        let report = h.orchestrator.force_reconcile(h.tenant, id).await.unwrap();
        assert_eq!(report.resolved.len(), 1);

        let view = h.orchestrator.get_registration_status(h.tenant, id).await.unwrap();
        assert_eq!(view.brand_status, Some(BrandStatus::Pending));

        let report = h.advance(id).await.unwrap();
        assert_eq!(report.to, RegistrationStatus::CampaignPending);
        assert_eq!(h.sandbox.calls(CallKind::Brand), 1);
    }

    #[tokio::test]
    async fn fatal_rejection_then_resubmission() {
        let h = harness();
        let id = h.draft_with_brand().await;
        h.sandbox
            .script(CallKind::Brand, [GatewayOutcome::rejected("EIN does not match company name")]);

        assert!(matches!(
            h.advance(id).await,
            Err(ComplianceError::FatalGateway {
                step: AttemptType::BrandRegistration,
                ..
            })
        ));
        let view = h.orchestrator.get_registration_status(h.tenant, id).await.unwrap();
        assert_eq!(view.brand_status, Some(BrandStatus::Rejected));
        assert_eq!(view.last_error.unwrap().kind, Some(AttemptErrorKind::Fatal));

        // Rejected stays rejected; nothing is resubmitted under the old registration.
        assert!(matches!(h.advance(id).await, Err(ComplianceError::FatalGateway { .. })));
        assert_eq!(h.sandbox.calls(CallKind::Brand), 1);

        let successor = h.orchestrator.resubmit(h.tenant, id, h.user).await.unwrap();
        assert_eq!(successor.resubmission_of, Some(id));
        assert_eq!(successor.forms.brand, Some(brand_form()));

        let predecessor = h.orchestrator.get_registration(h.tenant, id).await.unwrap();
        assert_eq!(predecessor.superseded_by, Some(successor.id));
        assert_eq!(h.advance(id).await.unwrap().action, AdvanceAction::None);
        assert!(matches!(
            h.orchestrator.resubmit(h.tenant, id, h.user).await,
            Err(ComplianceError::Conflict(_))
        ));

        let report = h.advance(successor.id).await.unwrap();
        assert_eq!(report.to, RegistrationStatus::CampaignPending);
    }

    #[tokio::test]
    async fn only_rejected_registrations_can_be_resubmitted() {
        let h = harness();
        let id = h.draft_with_brand().await;
        assert!(matches!(
            h.orchestrator.resubmit(h.tenant, id, h.user).await,
            Err(ComplianceError::InvariantViolation(_))
        ));
    }

    #[tokio::test]
    async fn tenant_holds_one_active_brand() {
        let h = harness();
        let first = h.draft_with_brand().await;
        h.advance(first).await.unwrap();

        let second = h.draft_with_brand().await;
        assert!(matches!(h.advance(second).await, Err(ComplianceError::Conflict(_))));
        assert_eq!(h.sandbox.submissions(CallKind::Brand), 1);

        // Refused locally: still a draft with nothing dispatched, so it can be abandoned.
        assert_eq!(h.status(second).await, RegistrationStatus::Draft);
        assert!(h.orchestrator.list_attempts(h.tenant, second).await.unwrap().is_empty());
        let abandoned = h.orchestrator.abandon(h.tenant, second).await.unwrap();
        assert!(abandoned.abandoned_at.is_some());
    }

    #[tokio::test]
    async fn abandon_only_drafts_and_free_their_numbers() {
        let h = harness();
        h.own("+15551234567").await;
        let draft = h.draft_with_brand().await;
        let o = &h.orchestrator;
        o.select_phone_numbers(h.tenant, draft, vec!["+15551234567".into()]).await.unwrap();

        let abandoned = o.abandon(h.tenant, draft).await.unwrap();
        assert!(abandoned.abandoned_at.is_some());
        assert_eq!(h.advance(draft).await.unwrap().action, AdvanceAction::None);
        assert!(o.get_registration_status(h.tenant, draft).await.unwrap().abandoned);

        let other = h.draft_with_brand().await;
        let report = o
            .select_phone_numbers(h.tenant, other, vec!["+15551234567".into()])
            .await
            .unwrap();
        assert_eq!(report.accepted.len(), 1);

        h.advance(other).await.unwrap();
        assert!(matches!(
            o.abandon(h.tenant, other).await,
            Err(ComplianceError::InvariantViolation(_))
        ));
    }

    #[tokio::test]
    async fn campaign_requires_attestations() {
        let h = harness();
        let id = h.draft_with_brand().await;
        h.orchestrator
            .save_campaign_form(h.tenant, id, campaign_form())
            .await
            .unwrap();
        h.advance(id).await.unwrap();

        assert!(matches!(h.advance(id).await, Err(ComplianceError::Validation(_))));
        assert_eq!(h.sandbox.calls(CallKind::Campaign), 0);

        let registration = h
            .orchestrator
            .save_attestations(h.tenant, id, h.user, attested())
            .await
            .unwrap();
        let attestations = registration.forms.attestations.unwrap();
        assert_eq!(attestations.accepted_by, Some(h.user));
        assert!(attestations.accepted_at.is_some());

        assert_eq!(h.advance(id).await.unwrap().action, AdvanceAction::CampaignSubmitted);
    }

    #[tokio::test]
    async fn partial_binding_holds_back_submission() {
        let h = harness();
        let id = h.ready(&["+15551230001", "+15551230002"]).await;
        h.advance(id).await.unwrap();
        h.advance(id).await.unwrap();

        // Numbers bind in order; the first is refused upstream.
        h.sandbox
            .script(CallKind::Number, [GatewayOutcome::rejected("number not eligible for A2P")]);
        let report = h.advance(id).await.unwrap();
        assert_eq!(report.to, RegistrationStatus::CampaignPending);
        let binding = report.binding.unwrap();
        assert_eq!(binding.registered, vec![PhoneNumber::parse("+15551230002").unwrap()]);
        assert_eq!(binding.failed.len(), 1);
        assert!(binding.failed[0].fatal);

        let view = h.orchestrator.get_registration_status(h.tenant, id).await.unwrap();
        let failed = view
            .per_number_status
            .iter()
            .find(|n| n.status == NumberBindingStatus::Failed)
            .unwrap();
        assert_eq!(failed.error.as_deref(), Some("number not eligible for A2P"));
        assert_eq!(view.last_error.unwrap().attempt_type, AttemptType::PhoneAssignment);

        // Registered numbers cannot be dropped; the refused one can.
        assert!(h
            .orchestrator
            .remove_phone_number(h.tenant, id, "+15551230002")
            .await
            .is_err());
        h.orchestrator
            .remove_phone_number(h.tenant, id, "+15551230001")
            .await
            .unwrap();

        let report = h.advance(id).await.unwrap();
        assert_eq!(report.to, RegistrationStatus::Submitted);
        // The refused number and the registered one; nothing was sent twice.
        assert_eq!(h.sandbox.submissions(CallKind::Number), 2);
    }

    #[tokio::test]
    async fn webhook_decides_a_submitted_registration() {
        let h = harness();
        let id = h.ready(&["+15551234567"]).await;
        h.submit(id).await;
        let campaign_ref = h.campaign_ref(id).await;

        let registration = h
            .orchestrator
            .apply_upstream_status(&UpstreamStatusUpdate {
                upstream_ref: campaign_ref,
                status: UpstreamStatus::Rejected,
                reason: Some("sample messages lack opt-out language".into()),
            })
            .await
            .unwrap();
        assert_eq!(registration.status, RegistrationStatus::Rejected);
        assert_eq!(
            registration.rejection_reason.as_deref(),
            Some("sample messages lack opt-out language")
        );

        assert!(matches!(
            h.orchestrator
                .apply_upstream_status(&UpstreamStatusUpdate {
                    upstream_ref: "CM-unknown".into(),
                    status: UpstreamStatus::Approved,
                    reason: None,
                })
                .await,
            Err(ComplianceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn other_tenants_cannot_read_a_registration() {
        let h = harness();
        let id = h.draft_with_brand().await;
        assert!(matches!(
            h.orchestrator.get_registration(TenantId::new(), id).await,
            Err(ComplianceError::TenantIsolation(_))
        ));
    }

    #[tokio::test]
    async fn sweeper_polls_and_retries() {
        let h = harness();
        let submitted = h.ready(&["+15551234567"]).await;
        h.submit(submitted).await;
        let campaign_ref = h.campaign_ref(submitted).await;
        h.sandbox.decide(&campaign_ref, Ok(ReviewState::Approved));

        // Another tenant: the first one already holds an active brand.
        let other = TenantId::new();
        let flaky = h.draft_with_brand_for(other).await;
        h.sandbox.script(CallKind::Brand, [GatewayOutcome::retriable("503 from upstream")]);
        assert!(matches!(
            h.orchestrator.advance(other, flaky).await,
            Err(ComplianceError::RetriableGateway { .. })
        ));

        let sweeper = StatusSweeper::new(
            h.orchestrator.clone(),
            SweeperConfig::default().with_retry_policy(RetryPolicy::fixed(3, Duration::ZERO)),
        );
        let report = sweeper.sweep_once().await.unwrap();
        assert_eq!(report.polled, 1);
        assert_eq!(report.retried, 1);
        assert_eq!(report.failures, 0);

        assert_eq!(h.status(submitted).await, RegistrationStatus::Approved);
        let flaky = h.orchestrator.get_registration(other, flaky).await.unwrap();
        assert_eq!(flaky.status, RegistrationStatus::CampaignPending);

        // Nothing left to retry.
        let report = sweeper.sweep_once().await.unwrap();
        assert_eq!(report.retried, 0);
    }

    #[tokio::test]
    async fn sweeper_spaces_out_decision_polls() {
        let h = harness();
        let id = h.ready(&["+15551234567"]).await;
        h.submit(id).await;

        let sweeper = StatusSweeper::new(
            h.orchestrator.clone(),
            SweeperConfig::default().with_poll_interval(Duration::from_secs(600)),
        );
        assert_eq!(sweeper.sweep_once().await.unwrap().polled, 1);
        assert_eq!(sweeper.sweep_once().await.unwrap().polled, 0);
        assert_eq!(h.sandbox.calls(CallKind::Status), 1);

        h.clock.advance(chrono::Duration::minutes(11));
        assert_eq!(sweeper.sweep_once().await.unwrap().polled, 1);
        assert_eq!(h.attempts_of(id, AttemptType::StatusCheck).await.len(), 2);
        assert_eq!(h.status(id).await, RegistrationStatus::Submitted);
    }

    #[tokio::test]
    async fn sweeper_backs_off_between_retries() {
        let h = harness();
        let id = h.draft_with_brand().await;
        h.sandbox.script(CallKind::Brand, [GatewayOutcome::retriable("503 from upstream")]);
        assert!(h.advance(id).await.is_err());

        let sweeper = StatusSweeper::new(
            h.orchestrator.clone(),
            SweeperConfig::default()
                .with_retry_policy(RetryPolicy::fixed(3, Duration::from_secs(30))),
        );
        assert_eq!(sweeper.sweep_once().await.unwrap().retried, 0);

        h.clock.advance(chrono::Duration::seconds(31));
        assert_eq!(sweeper.sweep_once().await.unwrap().retried, 1);
        assert_eq!(h.status(id).await, RegistrationStatus::CampaignPending);
    }

    #[tokio::test]
    async fn sweeper_finalizes_expired_attempts() {
        let h = harness();
        let id = h.draft_with_brand().await;
        h.gateway.stall(CallKind::Brand, Stall::BeforeUpstream);
        assert!(tokio::time::timeout(Duration::from_millis(50), h.advance(id)).await.is_err());
        h.gateway.resume(CallKind::Brand);

        let sweeper = StatusSweeper::new(h.orchestrator.clone(), SweeperConfig::default());
        assert_eq!(sweeper.sweep_once().await.unwrap().reconciled, 0);

        h.clock.advance(chrono::Duration::minutes(30));
        let report = sweeper.sweep_once().await.unwrap();
        assert_eq!(report.reconciled, 1);

        let pending = h
            .orchestrator
            .attempt_log()
            .list_pending(Some(h.tenant))
            .await
            .unwrap();
        assert!(pending.is_empty(), "{pending:?}");
    }
}
