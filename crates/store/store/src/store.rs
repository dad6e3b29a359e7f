use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use leafline_core::{
    Campaign, CampaignId, CampaignKind, Channel, ConsentMethod, Contact, ContactId, CounterField,
    GlobalOptOut, JobId, Location, LocationId, Message, MessageId, MessageStatus, OptOutLogEntry,
    TenantId,
};

use crate::error::StoreError;

/// A customer of the platform. Lives in a global, RLS-exempt table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    /// Unique tenant identifier.
    pub id: TenantId,
    /// Human-readable name.
    pub name: String,
    /// When the tenant was created.
    pub created_at: DateTime<Utc>,
}

impl Tenant {
    /// Create a new tenant record timestamped now.
    #[must_use]
    pub fn new(id: impl Into<TenantId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            created_at: Utc::now(),
        }
    }
}

/// Result of [`Store::apply_status_update`]: whether the internal status
/// transitioned, plus the row state the update was applied against. The
/// pre-update state is what lets the reconciler advance campaign counters
/// exactly once no matter how often the carrier replays a callback.
#[derive(Debug, Clone)]
pub struct StatusApplied {
    /// Whether the internal status changed.
    pub transitioned: bool,
    /// The internal status before this update.
    pub previous_status: MessageStatus,
    /// The raw carrier status text before this update. `None` until the
    /// first callback lands.
    pub previous_provider_status: Option<String>,
}

/// Persistence boundary for all durable platform state.
///
/// Every operation outside the global tables (tenants, global opt-outs,
/// webhook routing lookups) takes an explicit `&TenantId` and returns only
/// rows belonging to that tenant. Backends must enforce this at the storage
/// layer — the Postgres backend pins a row-level-security session variable
/// on the acquired connection before each statement — so a bug in calling
/// code can narrow results to zero rows but never widen them across tenants.
///
/// Implementations must be `Send + Sync` and safe for concurrent access.
#[async_trait]
pub trait Store: Send + Sync {
    // ---- Tenants (global) ----

    /// Insert a tenant record.
    async fn create_tenant(&self, tenant: &Tenant) -> Result<(), StoreError>;

    /// Fetch a tenant by id. Returns `None` if unknown.
    async fn get_tenant(&self, id: &TenantId) -> Result<Option<Tenant>, StoreError>;

    // ---- Contacts ----

    /// Insert a contact. Fails with [`StoreError::Conflict`] when the
    /// `(tenant, phone)` pair already exists.
    async fn create_contact(&self, tenant: &TenantId, contact: &Contact) -> Result<(), StoreError>;

    /// Replace a contact row.
    async fn update_contact(&self, tenant: &TenantId, contact: &Contact) -> Result<(), StoreError>;

    /// Fetch a contact by id.
    async fn get_contact(
        &self,
        tenant: &TenantId,
        id: &ContactId,
    ) -> Result<Option<Contact>, StoreError>;

    /// Find a contact by normalized phone number.
    async fn find_contact_by_phone(
        &self,
        tenant: &TenantId,
        phone: &str,
    ) -> Result<Option<Contact>, StoreError>;

    /// Set the SMS opt-out flag and timestamp. Targeted write that leaves
    /// the rest of the row untouched; idempotent for an already-opted-out
    /// contact.
    async fn record_contact_opt_out(
        &self,
        tenant: &TenantId,
        contact: &ContactId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Clear the opt-out flag and record fresh SMS consent captured via
    /// `method` at `at`.
    async fn record_contact_opt_in(
        &self,
        tenant: &TenantId,
        contact: &ContactId,
        method: ConsentMethod,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Resolve a campaign's targeting filter to its recipient set: contacts
    /// that are age-verified, hold consent for every channel the campaign
    /// kind touches, have not opted out, and match the location / tag
    /// filters (empty filter = no restriction).
    async fn list_campaign_recipients(
        &self,
        tenant: &TenantId,
        kind: CampaignKind,
        target_locations: &[LocationId],
        target_tags: &[String],
    ) -> Result<Vec<Contact>, StoreError>;

    // ---- Locations ----

    /// Insert a location.
    async fn create_location(
        &self,
        tenant: &TenantId,
        location: &Location,
    ) -> Result<(), StoreError>;

    /// Fetch a location by id.
    async fn get_location(
        &self,
        tenant: &TenantId,
        id: &LocationId,
    ) -> Result<Option<Location>, StoreError>;

    // ---- Campaigns ----

    /// Insert a campaign.
    async fn create_campaign(
        &self,
        tenant: &TenantId,
        campaign: &Campaign,
    ) -> Result<(), StoreError>;

    /// Fetch a campaign by id.
    async fn get_campaign(
        &self,
        tenant: &TenantId,
        id: &CampaignId,
    ) -> Result<Option<Campaign>, StoreError>;

    /// Stamp a campaign as `sending` with its resolved recipient count.
    /// Fails with [`StoreError::IllegalTransition`] when the current status
    /// does not admit the transition.
    async fn mark_campaign_sending(
        &self,
        tenant: &TenantId,
        id: &CampaignId,
        total_recipients: i64,
        started_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Stamp a campaign as `sent` once expansion has enqueued every
    /// recipient.
    async fn mark_campaign_sent(
        &self,
        tenant: &TenantId,
        id: &CampaignId,
        completed_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Atomically increment one delivery counter by 1. Implementations must
    /// use a storage-level increment (`SET n = n + 1`), never
    /// read-modify-write, so concurrent webhook callbacks cannot lose
    /// updates.
    async fn increment_campaign_counter(
        &self,
        tenant: &TenantId,
        id: &CampaignId,
        field: CounterField,
    ) -> Result<(), StoreError>;

    // ---- Messages ----

    /// Insert a message row. Fails with [`StoreError::Conflict`] when the
    /// provider message id or client ref is already taken.
    async fn insert_message(&self, tenant: &TenantId, message: &Message) -> Result<(), StoreError>;

    /// Find the message row created by a delivery job on a previous
    /// attempt, keyed by `client_ref`. This is what makes provider dispatch
    /// idempotent across queue retries.
    async fn find_message_by_client_ref(
        &self,
        tenant: &TenantId,
        job: &JobId,
    ) -> Result<Option<Message>, StoreError>;

    /// Record a successful dispatch: status `sent`, provider id and segment
    /// count captured, `sent_at` stamped, any error text from a prior
    /// attempt cleared. This is a worker-owned write and is not subject to
    /// the reconciliation regression guard: a retried job legitimately
    /// moves its own row from `failed` back to `sent`.
    async fn mark_message_dispatched(
        &self,
        tenant: &TenantId,
        id: &MessageId,
        provider_message_id: &str,
        segments: i32,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Record a failed dispatch attempt: status `failed` with the
    /// provider's error text preserved.
    async fn mark_message_failed(
        &self,
        tenant: &TenantId,
        id: &MessageId,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Count outbound messages of `kind` to `contact` created at or after
    /// `since`, excluding `failed` rows — delivery failures do not consume
    /// the recipient's daily budget, and a retried job's own failed row
    /// from a prior attempt must not block the retry.
    async fn count_outbound_since(
        &self,
        tenant: &TenantId,
        contact: &ContactId,
        kind: Channel,
        since: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// List messages addressed to `address` under a tenant, oldest first.
    async fn list_messages_to_address(
        &self,
        tenant: &TenantId,
        address: &str,
    ) -> Result<Vec<Message>, StoreError>;

    /// Find a message by its carrier-assigned id. Cross-tenant by design:
    /// provider message ids are globally unique, and carrier callbacks do
    /// not identify the tenant.
    async fn find_message_by_provider_id(
        &self,
        provider_message_id: &str,
    ) -> Result<Option<Message>, StoreError>;

    /// Apply a reconciliation status update. The carrier's raw status text
    /// is always recorded; the internal status only changes when `status`
    /// is `Some` and the current status admits the transition (see
    /// [`MessageStatus::accepts_transition_to`]) — out-of-order callbacks
    /// never regress a terminal state. `delivered_at` is captured when the
    /// applied status is `Delivered`. The returned [`StatusApplied`]
    /// carries the pre-update state so the caller can count exactly-once
    /// under webhook replays.
    async fn apply_status_update(
        &self,
        tenant: &TenantId,
        id: &MessageId,
        status: Option<MessageStatus>,
        provider_status: Option<&str>,
        error: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<StatusApplied, StoreError>;

    // ---- Opt-out audit log ----

    /// Append an immutable consent-change audit entry.
    async fn insert_opt_out_log(
        &self,
        tenant: &TenantId,
        entry: &OptOutLogEntry,
    ) -> Result<(), StoreError>;

    /// List audit entries for an address, oldest first.
    async fn list_opt_out_log(
        &self,
        tenant: &TenantId,
        address: &str,
    ) -> Result<Vec<OptOutLogEntry>, StoreError>;

    // ---- Global opt-outs (global, cross-tenant) ----

    /// Record a phone in the cross-tenant opt-out table. Conflict-ignoring:
    /// recording an already-present number is a no-op and the original
    /// source tenant is kept.
    async fn add_global_opt_out(
        &self,
        phone: &str,
        source_tenant: &TenantId,
    ) -> Result<(), StoreError>;

    /// Remove a phone from the cross-tenant opt-out table. Unconditional;
    /// removing an absent number is a no-op.
    async fn remove_global_opt_out(&self, phone: &str) -> Result<(), StoreError>;

    /// Fetch the opt-out record for a phone, if present.
    async fn get_global_opt_out(&self, phone: &str) -> Result<Option<GlobalOptOut>, StoreError>;

    // ---- Webhook routing (global) ----

    /// Resolve the location that owns a sending phone number. Cross-tenant
    /// by design: inbound webhooks identify the tenant by the destination
    /// number.
    async fn find_location_by_sms_number(
        &self,
        phone: &str,
    ) -> Result<Option<Location>, StoreError>;
}

/// Whether a campaign kind's recipient query accepts a contact, ignoring
/// the location and tag filters. Shared by backends so the memory and
/// Postgres recipient queries agree.
#[must_use]
pub fn recipient_consent_eligible(kind: CampaignKind, contact: &Contact) -> bool {
    if !contact.age_verified {
        return false;
    }
    if kind.touches_sms() && (!contact.sms_consent || contact.sms_opted_out) {
        return false;
    }
    if kind.touches_email() && !contact.email_consent {
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recipient_eligibility_requires_age_verification() {
        let c = Contact::new("t", "+14155551212")
            .with_sms_consent(Utc::now(), ConsentMethod::Manual);
        assert!(!recipient_consent_eligible(CampaignKind::Sms, &c));
    }

    #[test]
    fn recipient_eligibility_respects_opt_out() {
        let c = Contact::new("t", "+14155551212")
            .with_sms_consent(Utc::now(), ConsentMethod::Manual)
            .with_age_verified(None)
            .with_sms_opt_out(Utc::now());
        assert!(!recipient_consent_eligible(CampaignKind::Sms, &c));
    }

    #[test]
    fn recipient_eligibility_both_requires_both_consents() {
        let sms_only = Contact::new("t", "+14155551212")
            .with_sms_consent(Utc::now(), ConsentMethod::Manual)
            .with_age_verified(None);
        assert!(recipient_consent_eligible(CampaignKind::Sms, &sms_only));
        assert!(!recipient_consent_eligible(CampaignKind::Both, &sms_only));

        let both = sms_only.with_email_consent("a@example.com");
        assert!(recipient_consent_eligible(CampaignKind::Both, &both));
    }
}
