//! End-to-end pipeline tests over the in-memory store and queue backends:
//! accept-time gating, dispatch-time re-gating, quiet-hour deferral,
//! provider retry, campaign expansion, and inbound reconciliation.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use leafline_compliance::{Clock, ComplianceGate, GateConfig};
use leafline_core::{
    Campaign, CampaignKind, CampaignStatus, ConsentMethod, Contact, Location, Message,
    MessageStatus, OptAction, TenantId,
};
use leafline_pipeline::{
    CampaignJobPayload, CampaignSendHandler, InboundOutcome, Reconciler, ReconcilerConfig,
    SendOutcome, SendService, SmsSendHandler, SmsSendRequest, StatusOutcome,
};
use leafline_provider::{ScriptedProvider, SmsProvider};
use leafline_queue::{
    JobKind, JobOptions, JobResult, MemoryQueueBackend, Queue, QueueBackend, WorkerConfig,
    WorkerPool,
};
use leafline_store::{Store, store::Tenant};
use leafline_store_memory::MemoryStore;

const TENANT: &str = "acme-dispensary";
const LOCATION_NUMBER: &str = "+14155550100";
const CONTACT_NUMBER: &str = "+14155551212";

/// Noon UTC — outside the default 21:00–08:00 window for UTC contacts.
fn daytime() -> DateTime<Utc> {
    "2025-06-15T12:00:00Z".parse().unwrap()
}

/// 22:30 UTC — inside the window for UTC contacts.
fn late_evening() -> DateTime<Utc> {
    "2025-06-15T22:30:00Z".parse().unwrap()
}

/// Mutable clock shared with the gate so tests can cross the quiet-hours
/// boundary deterministically.
struct TestClock(Mutex<DateTime<Utc>>);

impl TestClock {
    fn set(&self, at: DateTime<Utc>) {
        *self.0.lock().unwrap() = at;
    }
}

struct Harness {
    store: Arc<dyn Store>,
    backend: Arc<MemoryQueueBackend>,
    provider: Arc<ScriptedProvider>,
    send: Arc<SendService>,
    pool: Arc<WorkerPool>,
    reconciler: Reconciler,
    clock: Arc<TestClock>,
    tenant: TenantId,
    location: Location,
}

impl Harness {
    async fn new() -> Self {
        Self::with_provider(Arc::new(ScriptedProvider::new())).await
    }

    async fn with_provider(provider: Arc<ScriptedProvider>) -> Self {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let tenant = TenantId::new(TENANT);
        store
            .create_tenant(&Tenant::new(TENANT, "Acme Dispensary"))
            .await
            .unwrap();

        let location = Location::new(TENANT, "Mission St", "CA", "UTC")
            .with_sms_phone_number(LOCATION_NUMBER);
        store.create_location(&tenant, &location).await.unwrap();

        let clock = Arc::new(TestClock(Mutex::new(daytime())));
        let clock_fn: Clock = {
            let clock = Arc::clone(&clock);
            Arc::new(move || *clock.0.lock().unwrap())
        };
        let gate = Arc::new(
            ComplianceGate::new(Arc::clone(&store), GateConfig::default()).with_clock(clock_fn),
        );

        let backend = Arc::new(MemoryQueueBackend::new());
        let queue = Queue::new(backend.clone() as Arc<dyn QueueBackend>);
        let send = Arc::new(SendService::new(Arc::clone(&gate), queue.clone()));

        let sms_handler = Arc::new(SmsSendHandler::new(
            Arc::clone(&store),
            Arc::clone(&gate),
            provider.clone() as Arc<dyn SmsProvider>,
            Some("mp-default".to_owned()),
        ));
        let campaign_handler = Arc::new(CampaignSendHandler::new(
            Arc::clone(&store),
            Arc::clone(&send),
        ));
        let pool = Arc::new(
            WorkerPool::new(backend.clone() as Arc<dyn QueueBackend>, WorkerConfig::default())
                .register(sms_handler)
                .register(campaign_handler),
        );

        let reconciler = Reconciler::new(
            Arc::clone(&store),
            provider.clone() as Arc<dyn SmsProvider>,
            ReconcilerConfig {
                default_messaging_profile: Some("mp-default".to_owned()),
                ..ReconcilerConfig::default()
            },
        );

        Self {
            store,
            backend,
            provider,
            send,
            pool,
            reconciler,
            clock,
            tenant,
            location,
        }
    }

    /// A consented, age-verified contact pinned to UTC at the seeded
    /// location.
    async fn seed_contact(&self, phone: &str) -> Contact {
        let contact = Contact::new(TENANT, phone)
            .with_sms_consent(daytime(), ConsentMethod::Manual)
            .with_age_verified(chrono::NaiveDate::from_ymd_opt(1990, 6, 1))
            .with_primary_location(self.location.id.clone())
            .with_timezone("UTC");
        self.store.create_contact(&self.tenant, &contact).await.unwrap();
        contact
    }

    /// Make every parked job visible.
    async fn promote_all(&self) {
        self.backend
            .promote_due(Utc::now() + chrono::Duration::days(365))
            .await
            .unwrap();
    }

    async fn messages_to(&self, address: &str) -> Vec<Message> {
        self.store
            .list_messages_to_address(&self.tenant, address)
            .await
            .unwrap()
    }
}

// ---- Single-send gating -----------------------------------------------

#[tokio::test]
async fn block_without_consent_creates_nothing() {
    let h = Harness::new().await;
    let contact = Contact::new(TENANT, CONTACT_NUMBER)
        .with_age_verified(chrono::NaiveDate::from_ymd_opt(1990, 6, 1));
    h.store.create_contact(&h.tenant, &contact).await.unwrap();

    let outcome = h
        .send
        .send_sms(
            &h.tenant,
            SmsSendRequest {
                contact_id: contact.id.clone(),
                location_id: None,
                content: "hi".into(),
                campaign_id: None,
            },
        )
        .await
        .unwrap();

    match outcome {
        SendOutcome::Blocked { reasons } => {
            assert!(reasons.iter().any(|r| r.contains("No SMS consent on file")));
        }
        other => panic!("expected Blocked, got {other:?}"),
    }
    // No job, no message row.
    assert_eq!(h.backend.ready_len(JobKind::SmsSend).await.unwrap(), 0);
    assert!(h.messages_to(CONTACT_NUMBER).await.is_empty());
}

#[tokio::test]
async fn allowed_send_dispatches_and_records() {
    let h = Harness::new().await;
    let contact = h.seed_contact(CONTACT_NUMBER).await;

    let outcome = h
        .send
        .send_sms(
            &h.tenant,
            SmsSendRequest {
                contact_id: contact.id.clone(),
                location_id: None,
                content: "20% off this weekend".into(),
                campaign_id: None,
            },
        )
        .await
        .unwrap();
    assert!(matches!(outcome, SendOutcome::Queued { .. }));

    let result = h.pool.run_one(JobKind::SmsSend).await.unwrap().unwrap();
    assert!(matches!(result, JobResult::Completed));

    let messages = h.messages_to(CONTACT_NUMBER).await;
    assert_eq!(messages.len(), 1);
    let message = &messages[0];
    assert_eq!(message.status, MessageStatus::Sent);
    assert_eq!(message.provider_message_id.as_deref(), Some("test-pm-1"));
    assert_eq!(message.from_address, LOCATION_NUMBER);
    assert!(message.consent_verified_at.is_some());
    assert!(message.quiet_hours_checked_at.is_some());
    assert!(message.sent_at.is_some());

    let sent = h.provider.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, CONTACT_NUMBER);
}

#[tokio::test]
async fn quiet_hours_defer_then_dispatch_after_window() {
    let h = Harness::new().await;
    let contact = h.seed_contact(CONTACT_NUMBER).await;

    h.clock.set(late_evening());
    let outcome = h
        .send
        .send_sms(
            &h.tenant,
            SmsSendRequest {
                contact_id: contact.id.clone(),
                location_id: None,
                content: "hi".into(),
                campaign_id: None,
            },
        )
        .await
        .unwrap();

    // Deferred until the next 08:00 in the contact's zone; no row yet.
    match &outcome {
        SendOutcome::Deferred { until, .. } => {
            assert_eq!(*until, "2025-06-16T08:00:00Z".parse::<DateTime<Utc>>().unwrap());
        }
        other => panic!("expected Deferred, got {other:?}"),
    }
    assert!(h.messages_to(CONTACT_NUMBER).await.is_empty());
    assert_eq!(h.backend.delayed_len().await.unwrap(), 1);

    // The window ends; the job becomes visible and the second gate pass
    // allows it.
    h.clock.set("2025-06-16T08:00:01Z".parse().unwrap());
    h.promote_all().await;
    let result = h.pool.run_one(JobKind::SmsSend).await.unwrap().unwrap();
    assert!(matches!(result, JobResult::Completed));

    let messages = h.messages_to(CONTACT_NUMBER).await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].status, MessageStatus::Sent);
}

#[tokio::test]
async fn dispatch_time_gate_catches_late_opt_out() {
    let h = Harness::new().await;
    let contact = h.seed_contact(CONTACT_NUMBER).await;

    let outcome = h
        .send
        .send_sms(
            &h.tenant,
            SmsSendRequest {
                contact_id: contact.id.clone(),
                location_id: None,
                content: "hi".into(),
                campaign_id: None,
            },
        )
        .await
        .unwrap();
    assert!(matches!(outcome, SendOutcome::Queued { .. }));

    // The contact opts out between enqueue and dispatch.
    h.store
        .record_contact_opt_out(&h.tenant, &contact.id, Utc::now())
        .await
        .unwrap();

    let result = h.pool.run_one(JobKind::SmsSend).await.unwrap().unwrap();
    match result {
        JobResult::Blocked { reasons } => {
            assert!(reasons.iter().any(|r| r.contains("opted out")));
        }
        other => panic!("expected Blocked, got {other:?}"),
    }
    // Nothing was dispatched, nothing retried.
    assert_eq!(h.provider.send_attempts(), 0);
    assert!(h.messages_to(CONTACT_NUMBER).await.is_empty());
    assert_eq!(h.backend.delayed_len().await.unwrap(), 0);
}

#[tokio::test]
async fn re_entering_quiet_hours_reschedules_at_dispatch() {
    let h = Harness::new().await;
    let contact = h.seed_contact(CONTACT_NUMBER).await;

    let outcome = h
        .send
        .send_sms(
            &h.tenant,
            SmsSendRequest {
                contact_id: contact.id.clone(),
                location_id: None,
                content: "hi".into(),
                campaign_id: None,
            },
        )
        .await
        .unwrap();
    assert!(matches!(outcome, SendOutcome::Queued { .. }));

    // The clock crosses into quiet hours before a worker picks it up.
    h.clock.set(late_evening());
    let result = h.pool.run_one(JobKind::SmsSend).await.unwrap().unwrap();
    assert!(matches!(result, JobResult::Rescheduled { .. }));
    assert_eq!(h.backend.delayed_len().await.unwrap(), 1);
    assert_eq!(h.provider.send_attempts(), 0);
    // A deferral is not a failure.
    assert!(h.backend.failed().is_empty());
}

// ---- Provider retry (S6) ----------------------------------------------

#[tokio::test]
async fn provider_failures_retry_then_succeed() {
    let h = Harness::with_provider(Arc::new(ScriptedProvider::failing_first(2))).await;
    let contact = h.seed_contact(CONTACT_NUMBER).await;

    h.send
        .send_sms(
            &h.tenant,
            SmsSendRequest {
                contact_id: contact.id.clone(),
                location_id: None,
                content: "hi".into(),
                campaign_id: None,
            },
        )
        .await
        .unwrap();

    // Attempt 1 fails; the row records the failure and the job parks.
    let result = h.pool.run_one(JobKind::SmsSend).await.unwrap().unwrap();
    assert!(matches!(result, JobResult::Retried { .. }));
    let messages = h.messages_to(CONTACT_NUMBER).await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].status, MessageStatus::Failed);
    assert!(messages[0].error.as_deref().unwrap().contains("simulated outage"));

    // Attempt 2 fails the same way.
    h.promote_all().await;
    let result = h.pool.run_one(JobKind::SmsSend).await.unwrap().unwrap();
    assert!(matches!(result, JobResult::Retried { .. }));

    // Attempt 3 succeeds; the same row flips to sent and the stale error
    // clears.
    h.promote_all().await;
    let result = h.pool.run_one(JobKind::SmsSend).await.unwrap().unwrap();
    assert!(matches!(result, JobResult::Completed));

    let messages = h.messages_to(CONTACT_NUMBER).await;
    assert_eq!(messages.len(), 1, "retries must reuse the same row");
    assert_eq!(messages[0].status, MessageStatus::Sent);
    assert!(messages[0].error.is_none());
    assert!(messages[0].provider_message_id.is_some());
    assert_eq!(h.provider.send_attempts(), 3);
}

#[tokio::test]
async fn exhausted_retries_leave_the_row_failed() {
    let h = Harness::with_provider(Arc::new(ScriptedProvider::failing_first(5))).await;
    let contact = h.seed_contact(CONTACT_NUMBER).await;

    h.send
        .send_sms(
            &h.tenant,
            SmsSendRequest {
                contact_id: contact.id.clone(),
                location_id: None,
                content: "hi".into(),
                campaign_id: None,
            },
        )
        .await
        .unwrap();

    for _ in 0..2 {
        let result = h.pool.run_one(JobKind::SmsSend).await.unwrap().unwrap();
        assert!(matches!(result, JobResult::Retried { .. }));
        h.promote_all().await;
    }
    let result = h.pool.run_one(JobKind::SmsSend).await.unwrap().unwrap();
    assert!(matches!(result, JobResult::Failed { .. }));

    let messages = h.messages_to(CONTACT_NUMBER).await;
    assert_eq!(messages[0].status, MessageStatus::Failed);
    assert_eq!(h.provider.send_attempts(), 3, "attempt budget is 3");
}

// ---- Campaign expansion (S5) ------------------------------------------

#[tokio::test]
async fn campaign_expands_tag_targeting_and_counts() {
    let h = Harness::new().await;

    // Three contacts: two tagged vip, one of those opted out.
    let vip = {
        let c = Contact::new(TENANT, "+14155550001")
            .with_sms_consent(daytime(), ConsentMethod::Manual)
            .with_age_verified(chrono::NaiveDate::from_ymd_opt(1990, 1, 1))
            .with_primary_location(h.location.id.clone())
            .with_timezone("UTC")
            .with_tags(vec!["vip".into()]);
        h.store.create_contact(&h.tenant, &c).await.unwrap();
        c
    };
    let opted_out = Contact::new(TENANT, "+14155550002")
        .with_sms_consent(daytime(), ConsentMethod::Manual)
        .with_age_verified(chrono::NaiveDate::from_ymd_opt(1990, 1, 1))
        .with_tags(vec!["vip".into()])
        .with_sms_opt_out(daytime());
    h.store.create_contact(&h.tenant, &opted_out).await.unwrap();
    let untagged = Contact::new(TENANT, "+14155550003")
        .with_sms_consent(daytime(), ConsentMethod::Manual)
        .with_age_verified(chrono::NaiveDate::from_ymd_opt(1990, 1, 1));
    h.store.create_contact(&h.tenant, &untagged).await.unwrap();

    let campaign = Campaign::new(TENANT, "VIP drop", CampaignKind::Sms)
        .with_sms_content("VIP early access today")
        .with_target_tags(vec!["vip".into()]);
    h.store.create_campaign(&h.tenant, &campaign).await.unwrap();

    // Trigger expansion the way the API does.
    let queue = Queue::new(h.backend.clone() as Arc<dyn QueueBackend>);
    queue
        .enqueue(
            JobKind::CampaignSend,
            serde_json::to_value(CampaignJobPayload {
                tenant_id: h.tenant.clone(),
                campaign_id: campaign.id.clone(),
            })
            .unwrap(),
            JobOptions::default(),
        )
        .await
        .unwrap();

    let result = h.pool.run_one(JobKind::CampaignSend).await.unwrap().unwrap();
    assert!(matches!(result, JobResult::Completed));

    // Exactly one recipient survived the filter and exactly one SMS job
    // was enqueued.
    let expanded = h.store.get_campaign(&h.tenant, &campaign.id).await.unwrap().unwrap();
    assert_eq!(expanded.total_recipients, 1);
    assert_eq!(expanded.status, CampaignStatus::Sent);
    assert!(expanded.started_at.is_some());
    assert!(expanded.completed_at.is_some());
    assert_eq!(h.backend.ready_len(JobKind::SmsSend).await.unwrap(), 1);

    // Drive the send and reconcile the carrier's callbacks into counters.
    let result = h.pool.run_one(JobKind::SmsSend).await.unwrap().unwrap();
    assert!(matches!(result, JobResult::Completed));
    let messages = h.messages_to(&vip.phone).await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].campaign_id, Some(campaign.id.clone()));

    let pmid = messages[0].provider_message_id.clone().unwrap();
    h.reconciler.on_status(&pmid, "sent", None).await.unwrap();
    h.reconciler.on_status(&pmid, "delivered", None).await.unwrap();

    let finished = h.store.get_campaign(&h.tenant, &campaign.id).await.unwrap().unwrap();
    assert_eq!(finished.sent_count, 1);
    assert_eq!(finished.delivered_count, 1);
    assert_eq!(finished.failed_count, 0);
}

#[tokio::test]
async fn missing_campaign_fails_without_retry() {
    let h = Harness::new().await;
    let queue = Queue::new(h.backend.clone() as Arc<dyn QueueBackend>);
    queue
        .enqueue(
            JobKind::CampaignSend,
            serde_json::to_value(CampaignJobPayload {
                tenant_id: h.tenant.clone(),
                campaign_id: leafline_core::CampaignId::new("ghost"),
            })
            .unwrap(),
            JobOptions::default(),
        )
        .await
        .unwrap();

    let result = h.pool.run_one(JobKind::CampaignSend).await.unwrap().unwrap();
    match result {
        JobResult::Failed { error } => assert!(error.contains("campaign not found")),
        other => panic!("expected Failed, got {other:?}"),
    }
    assert_eq!(h.backend.delayed_len().await.unwrap(), 0, "no retry");
}

// ---- Inbound reconciliation (S4) --------------------------------------

#[tokio::test]
async fn stop_keyword_round_trip() {
    let h = Harness::new().await;
    let contact = h.seed_contact(CONTACT_NUMBER).await;

    let outcome = h
        .reconciler
        .on_inbound(CONTACT_NUMBER, LOCATION_NUMBER, "stop", "pm-in-1")
        .await
        .unwrap();
    match outcome {
        InboundOutcome::OptedOut { contact_id } => {
            assert_eq!(contact_id, Some(contact.id.clone()));
        }
        other => panic!("expected OptedOut, got {other:?}"),
    }

    // Contact flag set with timestamp.
    let updated = h.store.get_contact(&h.tenant, &contact.id).await.unwrap().unwrap();
    assert!(updated.sms_opted_out);
    assert!(updated.sms_opted_out_at.is_some());

    // Exactly one audit row.
    let log = h
        .store
        .list_opt_out_log(&h.tenant, CONTACT_NUMBER)
        .await
        .unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].action, OptAction::OptOut);
    assert_eq!(log[0].method, ConsentMethod::KeywordReply);
    assert!(log[0].source_message_id.is_some());

    // Cross-tenant opt-out recorded.
    let global = h.store.get_global_opt_out(CONTACT_NUMBER).await.unwrap().unwrap();
    assert_eq!(global.source_tenant, h.tenant);

    // One outbound confirmation row with the unsubscribe text, bypassing
    // the consent stamps.
    let messages = h.messages_to(CONTACT_NUMBER).await;
    assert_eq!(messages.len(), 1);
    assert!(messages[0].content.contains("unsubscribed"));
    assert_eq!(messages[0].status, MessageStatus::Sent);
    assert!(messages[0].consent_verified_at.is_none());

    // The gate now blocks this contact.
    let blocked = h
        .send
        .send_sms(
            &h.tenant,
            SmsSendRequest {
                contact_id: contact.id.clone(),
                location_id: None,
                content: "hi".into(),
                campaign_id: None,
            },
        )
        .await
        .unwrap();
    assert!(matches!(blocked, SendOutcome::Blocked { .. }));
}

#[tokio::test]
async fn repeated_stop_appends_audit_but_stays_idempotent() {
    let h = Harness::new().await;
    let contact = h.seed_contact(CONTACT_NUMBER).await;

    h.reconciler
        .on_inbound(CONTACT_NUMBER, LOCATION_NUMBER, "STOP", "pm-in-1")
        .await
        .unwrap();
    let first_opt_out_at = h
        .store
        .get_contact(&h.tenant, &contact.id)
        .await
        .unwrap()
        .unwrap()
        .sms_opted_out_at;

    // A second STOP from a distinct carrier delivery.
    h.reconciler
        .on_inbound(CONTACT_NUMBER, LOCATION_NUMBER, "  stop  ", "pm-in-2")
        .await
        .unwrap();

    let updated = h.store.get_contact(&h.tenant, &contact.id).await.unwrap().unwrap();
    assert!(updated.sms_opted_out);
    assert_eq!(
        updated.sms_opted_out_at, first_opt_out_at,
        "first opt-out timestamp is kept"
    );
    // One additional audit row is intentional.
    let log = h
        .store
        .list_opt_out_log(&h.tenant, CONTACT_NUMBER)
        .await
        .unwrap();
    assert_eq!(log.len(), 2);
}

#[tokio::test]
async fn replayed_webhook_delivery_is_a_no_op() {
    let h = Harness::new().await;
    h.seed_contact(CONTACT_NUMBER).await;

    h.reconciler
        .on_inbound(CONTACT_NUMBER, LOCATION_NUMBER, "stop", "pm-in-1")
        .await
        .unwrap();
    // The carrier redelivers the same webhook.
    let outcome = h
        .reconciler
        .on_inbound(CONTACT_NUMBER, LOCATION_NUMBER, "stop", "pm-in-1")
        .await
        .unwrap();
    assert!(matches!(outcome, InboundOutcome::Received));

    let log = h
        .store
        .list_opt_out_log(&h.tenant, CONTACT_NUMBER)
        .await
        .unwrap();
    assert_eq!(log.len(), 1, "replay must not append audit rows");
}

#[tokio::test]
async fn start_keyword_restores_consent() {
    let h = Harness::new().await;
    let contact = h.seed_contact(CONTACT_NUMBER).await;

    h.reconciler
        .on_inbound(CONTACT_NUMBER, LOCATION_NUMBER, "stop", "pm-in-1")
        .await
        .unwrap();
    let outcome = h
        .reconciler
        .on_inbound(CONTACT_NUMBER, LOCATION_NUMBER, "START", "pm-in-2")
        .await
        .unwrap();
    assert!(matches!(outcome, InboundOutcome::OptedIn { .. }));

    let updated = h.store.get_contact(&h.tenant, &contact.id).await.unwrap().unwrap();
    assert!(!updated.sms_opted_out);
    assert!(updated.sms_consent);
    assert_eq!(updated.sms_consent_method, Some(ConsentMethod::KeywordReply));

    // The global opt-out is lifted.
    assert!(h.store.get_global_opt_out(CONTACT_NUMBER).await.unwrap().is_none());

    // Audit trail holds both actions.
    let log = h
        .store
        .list_opt_out_log(&h.tenant, CONTACT_NUMBER)
        .await
        .unwrap();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].action, OptAction::OptOut);
    assert_eq!(log[1].action, OptAction::OptIn);
}

#[tokio::test]
async fn unknown_destination_is_dropped() {
    let h = Harness::new().await;
    h.seed_contact(CONTACT_NUMBER).await;

    let outcome = h
        .reconciler
        .on_inbound(CONTACT_NUMBER, "+19995550000", "stop", "pm-in-1")
        .await
        .unwrap();
    assert!(matches!(outcome, InboundOutcome::UnknownDestination));

    // Nothing persisted anywhere.
    assert!(h.messages_to(CONTACT_NUMBER).await.is_empty());
    assert!(
        h.store
            .list_opt_out_log(&h.tenant, CONTACT_NUMBER)
            .await
            .unwrap()
            .is_empty()
    );
    assert!(h.store.get_global_opt_out(CONTACT_NUMBER).await.unwrap().is_none());
}

#[tokio::test]
async fn plain_inbound_text_is_recorded() {
    let h = Harness::new().await;
    let contact = h.seed_contact(CONTACT_NUMBER).await;

    let outcome = h
        .reconciler
        .on_inbound(CONTACT_NUMBER, LOCATION_NUMBER, "do you open tomorrow?", "pm-in-1")
        .await
        .unwrap();
    assert!(matches!(outcome, InboundOutcome::Received));

    let messages = h.messages_to(LOCATION_NUMBER).await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].contact_id, Some(contact.id));
    assert!(messages[0].consent_verified_at.is_none());
}

// ---- Status reconciliation --------------------------------------------

#[tokio::test]
async fn out_of_order_status_callbacks_do_not_regress() {
    let h = Harness::new().await;
    let contact = h.seed_contact(CONTACT_NUMBER).await;

    let campaign = Campaign::new(TENANT, "drop", CampaignKind::Sms).with_sms_content("x");
    h.store.create_campaign(&h.tenant, &campaign).await.unwrap();

    let mut message = Message::outbound(
        TENANT,
        Some(contact.id),
        CONTACT_NUMBER,
        LOCATION_NUMBER,
        "x",
        Utc::now(),
    )
    .with_campaign(campaign.id.clone());
    message.provider_message_id = Some("pm-st-1".to_owned());
    h.store.insert_message(&h.tenant, &message).await.unwrap();

    // `delivered` lands before `sent`.
    let outcome = h.reconciler.on_status("pm-st-1", "delivered", None).await.unwrap();
    assert!(matches!(outcome, StatusOutcome::Updated { transitioned: true, .. }));

    let outcome = h.reconciler.on_status("pm-st-1", "sent", None).await.unwrap();
    assert!(matches!(outcome, StatusOutcome::Updated { transitioned: false, .. }));

    let row = h.store.find_message_by_provider_id("pm-st-1").await.unwrap().unwrap();
    assert_eq!(row.status, MessageStatus::Delivered);
    assert!(row.delivered_at.is_some());

    // Counters saw the delivery once and never a late `sent`.
    let c = h.store.get_campaign(&h.tenant, &campaign.id).await.unwrap().unwrap();
    assert_eq!(c.delivered_count, 1);
    assert_eq!(c.sent_count, 0);

    // Replaying the delivered callback changes nothing.
    h.reconciler.on_status("pm-st-1", "delivered", None).await.unwrap();
    let c = h.store.get_campaign(&h.tenant, &campaign.id).await.unwrap().unwrap();
    assert_eq!(c.delivered_count, 1);
}

#[tokio::test]
async fn unknown_provider_status_passes_through_untranslated() {
    let h = Harness::new().await;
    let contact = h.seed_contact(CONTACT_NUMBER).await;

    let mut message = Message::outbound(
        TENANT,
        Some(contact.id),
        CONTACT_NUMBER,
        LOCATION_NUMBER,
        "x",
        Utc::now(),
    );
    message.status = MessageStatus::Sent;
    message.provider_message_id = Some("pm-st-2".to_owned());
    h.store.insert_message(&h.tenant, &message).await.unwrap();

    let outcome = h
        .reconciler
        .on_status("pm-st-2", "carrier_side_mystery", Some("code 1234"))
        .await
        .unwrap();
    assert!(matches!(outcome, StatusOutcome::Updated { transitioned: false, .. }));

    let row = h.store.find_message_by_provider_id("pm-st-2").await.unwrap().unwrap();
    assert_eq!(row.status, MessageStatus::Sent, "internal status untouched");
    assert_eq!(row.provider_status.as_deref(), Some("carrier_side_mystery"));
    assert_eq!(row.error.as_deref(), Some("code 1234"));
}

#[tokio::test]
async fn status_for_unknown_message_is_reported() {
    let h = Harness::new().await;
    let outcome = h.reconciler.on_status("pm-ghost", "delivered", None).await.unwrap();
    assert!(matches!(outcome, StatusOutcome::UnknownMessage));
}
