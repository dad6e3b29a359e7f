//! Store conformance test suite.
//!
//! Backends call [`run_store_conformance_tests`] from their own test module
//! with a fresh store instance. The suite exercises the contracts every
//! backend must uphold: tenant isolation, phone uniqueness, atomic campaign
//! counters, the status-regression guard, and global opt-out idempotency.

use chrono::{Duration, Utc};

use leafline_core::{
    Campaign, CampaignKind, Channel, ConsentMethod, Contact, ContactId, CounterField, JobId,
    Location, Message, MessageStatus, OptAction, OptOutLogEntry, TenantId,
};

use crate::error::StoreError;
use crate::store::{Store, Tenant};

fn consented_contact(tenant: &str, phone: &str) -> Contact {
    Contact::new(tenant, phone)
        .with_sms_consent(Utc::now(), ConsentMethod::Manual)
        .with_age_verified(None)
}

/// Run the full store conformance test suite.
///
/// # Errors
///
/// Returns an error if any conformance test fails.
pub async fn run_store_conformance_tests(store: &dyn Store) -> Result<(), StoreError> {
    test_tenant_roundtrip(store).await?;
    test_tenant_isolation(store).await?;
    test_phone_uniqueness(store).await?;
    test_contact_opt_out_roundtrip(store).await?;
    test_campaign_recipients_filtering(store).await?;
    test_campaign_counter_increment(store).await?;
    test_message_status_guard(store).await?;
    test_message_dispatch_marks(store).await?;
    test_rate_limit_counting(store).await?;
    test_global_opt_out_idempotency(store).await?;
    test_location_lookup_by_number(store).await?;
    test_opt_out_log_append(store).await?;
    Ok(())
}

async fn test_tenant_roundtrip(store: &dyn Store) -> Result<(), StoreError> {
    let tenant = Tenant::new("conf-tenant", "Conformance");
    store.create_tenant(&tenant).await?;
    let back = store.get_tenant(&tenant.id).await?;
    assert_eq!(back.map(|t| t.name), Some("Conformance".to_owned()));
    Ok(())
}

async fn test_tenant_isolation(store: &dyn Store) -> Result<(), StoreError> {
    let t1 = TenantId::new("iso-t1");
    let t2 = TenantId::new("iso-t2");
    let contact = consented_contact("iso-t1", "+14155550001");
    store.create_contact(&t1, &contact).await?;

    // The other tenant must see nothing, through every read path.
    assert!(store.get_contact(&t2, &contact.id).await?.is_none());
    assert!(
        store
            .find_contact_by_phone(&t2, "+14155550001")
            .await?
            .is_none()
    );
    let recipients = store
        .list_campaign_recipients(&t2, CampaignKind::Sms, &[], &[])
        .await?;
    assert!(
        recipients.iter().all(|c| c.id != contact.id),
        "contact leaked across tenants"
    );

    // The owning tenant sees the row.
    assert!(store.get_contact(&t1, &contact.id).await?.is_some());
    Ok(())
}

async fn test_phone_uniqueness(store: &dyn Store) -> Result<(), StoreError> {
    let t = TenantId::new("uniq-t");
    store
        .create_contact(&t, &consented_contact("uniq-t", "+14155550002"))
        .await?;
    let dup = consented_contact("uniq-t", "+14155550002");
    let err = store.create_contact(&t, &dup).await.unwrap_err();
    assert!(
        matches!(err, StoreError::Conflict(_)),
        "duplicate (tenant, phone) must conflict, got {err}"
    );
    Ok(())
}

async fn test_contact_opt_out_roundtrip(store: &dyn Store) -> Result<(), StoreError> {
    let t = TenantId::new("opt-t");
    let contact = consented_contact("opt-t", "+14155550003");
    store.create_contact(&t, &contact).await?;

    let at = Utc::now();
    store.record_contact_opt_out(&t, &contact.id, at).await?;
    let back = store.get_contact(&t, &contact.id).await?.unwrap();
    assert!(back.sms_opted_out);
    assert!(back.sms_opted_out_at.is_some());

    // Repeating the opt-out is a no-op.
    store.record_contact_opt_out(&t, &contact.id, at).await?;

    store
        .record_contact_opt_in(&t, &contact.id, ConsentMethod::KeywordReply, Utc::now())
        .await?;
    let back = store.get_contact(&t, &contact.id).await?.unwrap();
    assert!(!back.sms_opted_out);
    assert!(back.sms_consent);
    assert_eq!(back.sms_consent_method, Some(ConsentMethod::KeywordReply));
    Ok(())
}

async fn test_campaign_recipients_filtering(store: &dyn Store) -> Result<(), StoreError> {
    let t = TenantId::new("rcpt-t");
    let vip = consented_contact("rcpt-t", "+14155550010").with_tags(vec!["vip".into()]);
    let vip_opted_out = consented_contact("rcpt-t", "+14155550011")
        .with_tags(vec!["vip".into()])
        .with_sms_opt_out(Utc::now());
    let plain = consented_contact("rcpt-t", "+14155550012");
    store.create_contact(&t, &vip).await?;
    store.create_contact(&t, &vip_opted_out).await?;
    store.create_contact(&t, &plain).await?;

    let all = store
        .list_campaign_recipients(&t, CampaignKind::Sms, &[], &[])
        .await?;
    assert_eq!(all.len(), 2, "opted-out contact must be excluded");

    let vips = store
        .list_campaign_recipients(&t, CampaignKind::Sms, &[], &["vip".to_owned()])
        .await?;
    assert_eq!(vips.len(), 1);
    assert_eq!(vips[0].id, vip.id);
    Ok(())
}

async fn test_campaign_counter_increment(store: &dyn Store) -> Result<(), StoreError> {
    let t = TenantId::new("camp-t");
    let campaign = Campaign::new("camp-t", "drop", CampaignKind::Sms).with_sms_content("hi");
    store.create_campaign(&t, &campaign).await?;

    store.mark_campaign_sending(&t, &campaign.id, 3, Utc::now()).await?;
    for _ in 0..3 {
        store
            .increment_campaign_counter(&t, &campaign.id, CounterField::Sent)
            .await?;
    }
    store
        .increment_campaign_counter(&t, &campaign.id, CounterField::Delivered)
        .await?;
    store.mark_campaign_sent(&t, &campaign.id, Utc::now()).await?;

    let back = store.get_campaign(&t, &campaign.id).await?.unwrap();
    assert_eq!(back.total_recipients, 3);
    assert_eq!(back.sent_count, 3);
    assert_eq!(back.delivered_count, 1);
    assert!(back.started_at.is_some());
    assert!(back.completed_at.is_some());

    // A sent campaign is terminal.
    let err = store
        .mark_campaign_sending(&t, &campaign.id, 3, Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::IllegalTransition(_)));
    Ok(())
}

async fn test_message_status_guard(store: &dyn Store) -> Result<(), StoreError> {
    let t = TenantId::new("msg-t");
    let mut msg = Message::outbound(
        "msg-t",
        None,
        "+14155550020",
        "+14155550100",
        "hello",
        Utc::now(),
    );
    msg.provider_message_id = Some("conf-pm-1".to_owned());
    store.insert_message(&t, &msg).await?;

    // Out-of-order callbacks: delivered lands first.
    let applied = store
        .apply_status_update(
            &t,
            &msg.id,
            Some(MessageStatus::Delivered),
            Some("delivered"),
            None,
            Utc::now(),
        )
        .await?;
    assert!(applied.transitioned);
    assert_eq!(applied.previous_status, MessageStatus::Queued);
    assert!(applied.previous_provider_status.is_none());

    // The late `sent` callback must not regress the row.
    let applied = store
        .apply_status_update(
            &t,
            &msg.id,
            Some(MessageStatus::Sent),
            Some("sent"),
            None,
            Utc::now(),
        )
        .await?;
    assert!(!applied.transitioned, "terminal status must not regress");
    assert_eq!(applied.previous_status, MessageStatus::Delivered);
    assert_eq!(applied.previous_provider_status.as_deref(), Some("delivered"));

    let back = store.find_message_by_provider_id("conf-pm-1").await?.unwrap();
    assert_eq!(back.status, MessageStatus::Delivered);
    assert!(back.delivered_at.is_some());
    // The raw carrier text still reflects the latest callback.
    assert_eq!(back.provider_status.as_deref(), Some("sent"));
    Ok(())
}

async fn test_message_dispatch_marks(store: &dyn Store) -> Result<(), StoreError> {
    let t = TenantId::new("disp-t");
    let job = JobId::new("conf-job-1");
    let msg = Message::outbound(
        "disp-t",
        None,
        "+14155550021",
        "+14155550100",
        "hello",
        Utc::now(),
    )
    .with_client_ref(job.clone());
    store.insert_message(&t, &msg).await?;

    let found = store.find_message_by_client_ref(&t, &job).await?.unwrap();
    assert_eq!(found.id, msg.id);

    store
        .mark_message_failed(&t, &msg.id, "upstream 500", Utc::now())
        .await?;
    let back = store.find_message_by_client_ref(&t, &job).await?.unwrap();
    assert_eq!(back.status, MessageStatus::Failed);
    assert_eq!(back.error.as_deref(), Some("upstream 500"));

    // A retried job revives its own row; the stale error is cleared.
    store
        .mark_message_dispatched(&t, &msg.id, "conf-pm-2", 2, Utc::now())
        .await?;
    let back = store.find_message_by_client_ref(&t, &job).await?.unwrap();
    assert_eq!(back.status, MessageStatus::Sent);
    assert_eq!(back.provider_message_id.as_deref(), Some("conf-pm-2"));
    assert_eq!(back.segments, Some(2));
    assert!(back.error.is_none());
    assert!(back.sent_at.is_some());
    Ok(())
}

async fn test_rate_limit_counting(store: &dyn Store) -> Result<(), StoreError> {
    let t = TenantId::new("rate-t");
    let contact = consented_contact("rate-t", "+14155550030");
    store.create_contact(&t, &contact).await?;

    let since = Utc::now() - Duration::hours(24);
    let make = |status: MessageStatus| {
        let mut m = Message::outbound(
            "rate-t",
            Some(contact.id.clone()),
            "+14155550030",
            "+14155550100",
            "hi",
            Utc::now(),
        );
        m.status = status;
        m
    };

    store.insert_message(&t, &make(MessageStatus::Sent)).await?;
    store.insert_message(&t, &make(MessageStatus::Queued)).await?;
    store.insert_message(&t, &make(MessageStatus::Failed)).await?;

    let count = store
        .count_outbound_since(&t, &contact.id, Channel::Sms, since)
        .await?;
    assert_eq!(count, 2, "failed rows must not count against the budget");
    Ok(())
}

async fn test_global_opt_out_idempotency(store: &dyn Store) -> Result<(), StoreError> {
    let first = TenantId::new("glob-t1");
    let second = TenantId::new("glob-t2");

    store.add_global_opt_out("+14155550040", &first).await?;
    // Conflict-ignoring: the original source tenant is kept.
    store.add_global_opt_out("+14155550040", &second).await?;

    let entry = store.get_global_opt_out("+14155550040").await?.unwrap();
    assert_eq!(entry.source_tenant, first);

    store.remove_global_opt_out("+14155550040").await?;
    assert!(store.get_global_opt_out("+14155550040").await?.is_none());
    // Removing an absent number is a no-op.
    store.remove_global_opt_out("+14155550040").await?;
    Ok(())
}

async fn test_location_lookup_by_number(store: &dyn Store) -> Result<(), StoreError> {
    let t = TenantId::new("loc-t");
    let location = Location::new("loc-t", "Mission St", "CA", "America/Los_Angeles")
        .with_sms_phone_number("+14155550050");
    store.create_location(&t, &location).await?;

    let found = store.find_location_by_sms_number("+14155550050").await?;
    assert_eq!(found.map(|l| l.id), Some(location.id));
    assert!(
        store
            .find_location_by_sms_number("+19999999999")
            .await?
            .is_none()
    );
    Ok(())
}

async fn test_opt_out_log_append(store: &dyn Store) -> Result<(), StoreError> {
    let t = TenantId::new("log-t");
    let entry = OptOutLogEntry::new(
        "log-t",
        Some(ContactId::new("c-log")),
        Channel::Sms,
        "+14155550060",
        OptAction::OptOut,
        ConsentMethod::KeywordReply,
    );
    store.insert_opt_out_log(&t, &entry).await?;
    // Repeated opt-outs append, never overwrite.
    let again = OptOutLogEntry::new(
        "log-t",
        Some(ContactId::new("c-log")),
        Channel::Sms,
        "+14155550060",
        OptAction::OptOut,
        ConsentMethod::KeywordReply,
    );
    store.insert_opt_out_log(&t, &again).await?;

    let entries = store.list_opt_out_log(&t, "+14155550060").await?;
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|e| e.action == OptAction::OptOut));
    Ok(())
}
