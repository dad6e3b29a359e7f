//! In-memory [`Store`] backend.
//!
//! Backs the test suites and local development. All tables live behind one
//! [`RwLock`]; methods lock, mutate, and clone results out, which keeps the
//! async trait methods trivially cancel-safe. Tenant scoping is enforced the
//! same way the Postgres backend's row-level security does it: every
//! tenant-scoped read filters on the tenant key, so a wrong tenant yields
//! zero rows.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use leafline_core::{
    Campaign, CampaignId, CampaignKind, CampaignStatus, Channel, ConsentMethod, Contact, ContactId,
    CounterField, Direction, GlobalOptOut, JobId, Location, LocationId, Message, MessageId,
    MessageStatus, OptOutLogEntry, TenantId,
};
use leafline_store::error::StoreError;
use leafline_store::store::{StatusApplied, Store, Tenant, recipient_consent_eligible};

type Keyed<T> = HashMap<(String, String), T>;

#[derive(Default)]
struct Inner {
    tenants: HashMap<String, Tenant>,
    contacts: Keyed<Contact>,
    locations: Keyed<Location>,
    campaigns: Keyed<Campaign>,
    messages: Keyed<Message>,
    opt_out_log: Vec<OptOutLogEntry>,
    global_opt_outs: HashMap<String, GlobalOptOut>,
}

/// In-memory [`Store`] implementation.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    /// Create a new, empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn key(tenant: &TenantId, id: &str) -> (String, String) {
        (tenant.as_str().to_owned(), id.to_owned())
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore").finish_non_exhaustive()
    }
}

#[allow(clippy::significant_drop_tightening)]
#[async_trait]
impl Store for MemoryStore {
    async fn create_tenant(&self, tenant: &Tenant) -> Result<(), StoreError> {
        let mut inner = self.inner.write().expect("store lock poisoned");
        inner
            .tenants
            .insert(tenant.id.as_str().to_owned(), tenant.clone());
        Ok(())
    }

    async fn get_tenant(&self, id: &TenantId) -> Result<Option<Tenant>, StoreError> {
        let inner = self.inner.read().expect("store lock poisoned");
        Ok(inner.tenants.get(id.as_str()).cloned())
    }

    async fn create_contact(&self, tenant: &TenantId, contact: &Contact) -> Result<(), StoreError> {
        let mut inner = self.inner.write().expect("store lock poisoned");
        let duplicate = inner.contacts.iter().any(|((t, _), c)| {
            t == tenant.as_str() && c.phone == contact.phone
        });
        if duplicate {
            return Err(StoreError::Conflict(format!(
                "contacts(tenant, phone) = ({tenant}, {})",
                contact.phone
            )));
        }
        inner
            .contacts
            .insert(Self::key(tenant, &contact.id), contact.clone());
        Ok(())
    }

    async fn update_contact(&self, tenant: &TenantId, contact: &Contact) -> Result<(), StoreError> {
        let mut inner = self.inner.write().expect("store lock poisoned");
        let key = Self::key(tenant, &contact.id);
        if !inner.contacts.contains_key(&key) {
            return Err(StoreError::NotFound(format!("contact {}", contact.id)));
        }
        inner.contacts.insert(key, contact.clone());
        Ok(())
    }

    async fn get_contact(
        &self,
        tenant: &TenantId,
        id: &ContactId,
    ) -> Result<Option<Contact>, StoreError> {
        let inner = self.inner.read().expect("store lock poisoned");
        Ok(inner.contacts.get(&Self::key(tenant, id)).cloned())
    }

    async fn find_contact_by_phone(
        &self,
        tenant: &TenantId,
        phone: &str,
    ) -> Result<Option<Contact>, StoreError> {
        let inner = self.inner.read().expect("store lock poisoned");
        Ok(inner
            .contacts
            .iter()
            .find(|((t, _), c)| t == tenant.as_str() && c.phone == phone)
            .map(|(_, c)| c.clone()))
    }

    async fn record_contact_opt_out(
        &self,
        tenant: &TenantId,
        contact: &ContactId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().expect("store lock poisoned");
        let c = inner
            .contacts
            .get_mut(&Self::key(tenant, contact))
            .ok_or_else(|| StoreError::NotFound(format!("contact {contact}")))?;
        if !c.sms_opted_out {
            c.sms_opted_out = true;
            c.sms_opted_out_at = Some(at);
        }
        c.updated_at = at;
        Ok(())
    }

    async fn record_contact_opt_in(
        &self,
        tenant: &TenantId,
        contact: &ContactId,
        method: ConsentMethod,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().expect("store lock poisoned");
        let c = inner
            .contacts
            .get_mut(&Self::key(tenant, contact))
            .ok_or_else(|| StoreError::NotFound(format!("contact {contact}")))?;
        c.sms_opted_out = false;
        c.sms_opted_out_at = None;
        c.sms_consent = true;
        c.sms_consent_at = Some(at);
        c.sms_consent_method = Some(method);
        c.updated_at = at;
        Ok(())
    }

    async fn list_campaign_recipients(
        &self,
        tenant: &TenantId,
        kind: CampaignKind,
        target_locations: &[LocationId],
        target_tags: &[String],
    ) -> Result<Vec<Contact>, StoreError> {
        let inner = self.inner.read().expect("store lock poisoned");
        let mut out: Vec<Contact> = inner
            .contacts
            .iter()
            .filter(|((t, _), _)| t == tenant.as_str())
            .map(|(_, c)| c)
            .filter(|c| recipient_consent_eligible(kind, c))
            .filter(|c| {
                target_locations.is_empty()
                    || c.primary_location_id
                        .as_ref()
                        .is_some_and(|l| target_locations.contains(l))
            })
            .filter(|c| {
                target_tags.is_empty() || c.tags.iter().any(|t| target_tags.contains(t))
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    async fn create_location(
        &self,
        tenant: &TenantId,
        location: &Location,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().expect("store lock poisoned");
        inner
            .locations
            .insert(Self::key(tenant, &location.id), location.clone());
        Ok(())
    }

    async fn get_location(
        &self,
        tenant: &TenantId,
        id: &LocationId,
    ) -> Result<Option<Location>, StoreError> {
        let inner = self.inner.read().expect("store lock poisoned");
        Ok(inner.locations.get(&Self::key(tenant, id)).cloned())
    }

    async fn create_campaign(
        &self,
        tenant: &TenantId,
        campaign: &Campaign,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().expect("store lock poisoned");
        inner
            .campaigns
            .insert(Self::key(tenant, &campaign.id), campaign.clone());
        Ok(())
    }

    async fn get_campaign(
        &self,
        tenant: &TenantId,
        id: &CampaignId,
    ) -> Result<Option<Campaign>, StoreError> {
        let inner = self.inner.read().expect("store lock poisoned");
        Ok(inner.campaigns.get(&Self::key(tenant, id)).cloned())
    }

    async fn mark_campaign_sending(
        &self,
        tenant: &TenantId,
        id: &CampaignId,
        total_recipients: i64,
        started_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().expect("store lock poisoned");
        let c = inner
            .campaigns
            .get_mut(&Self::key(tenant, id))
            .ok_or_else(|| StoreError::NotFound(format!("campaign {id}")))?;
        if !c.status.can_transition_to(CampaignStatus::Sending) {
            return Err(StoreError::IllegalTransition(format!(
                "campaign {id}: {} -> sending",
                c.status
            )));
        }
        c.status = CampaignStatus::Sending;
        c.total_recipients = total_recipients;
        c.started_at = Some(started_at);
        Ok(())
    }

    async fn mark_campaign_sent(
        &self,
        tenant: &TenantId,
        id: &CampaignId,
        completed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().expect("store lock poisoned");
        let c = inner
            .campaigns
            .get_mut(&Self::key(tenant, id))
            .ok_or_else(|| StoreError::NotFound(format!("campaign {id}")))?;
        if !c.status.can_transition_to(CampaignStatus::Sent) {
            return Err(StoreError::IllegalTransition(format!(
                "campaign {id}: {} -> sent",
                c.status
            )));
        }
        c.status = CampaignStatus::Sent;
        c.completed_at = Some(completed_at);
        Ok(())
    }

    async fn increment_campaign_counter(
        &self,
        tenant: &TenantId,
        id: &CampaignId,
        field: CounterField,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().expect("store lock poisoned");
        let c = inner
            .campaigns
            .get_mut(&Self::key(tenant, id))
            .ok_or_else(|| StoreError::NotFound(format!("campaign {id}")))?;
        let counter = match field {
            CounterField::Sent => &mut c.sent_count,
            CounterField::Delivered => &mut c.delivered_count,
            CounterField::Failed => &mut c.failed_count,
            CounterField::Opened => &mut c.opened_count,
            CounterField::Clicked => &mut c.clicked_count,
            CounterField::OptedOut => &mut c.opted_out_count,
        };
        *counter += 1;
        Ok(())
    }

    async fn insert_message(&self, tenant: &TenantId, message: &Message) -> Result<(), StoreError> {
        let mut inner = self.inner.write().expect("store lock poisoned");
        if let Some(pmid) = &message.provider_message_id
            && inner
                .messages
                .values()
                .any(|m| m.provider_message_id.as_ref() == Some(pmid))
        {
            return Err(StoreError::Conflict(format!(
                "messages.provider_message_id = {pmid}"
            )));
        }
        if let Some(job) = &message.client_ref
            && inner.messages.iter().any(|((t, _), m)| {
                t == tenant.as_str() && m.client_ref.as_ref() == Some(job)
            })
        {
            return Err(StoreError::Conflict(format!("messages.client_ref = {job}")));
        }
        inner
            .messages
            .insert(Self::key(tenant, &message.id), message.clone());
        Ok(())
    }

    async fn find_message_by_client_ref(
        &self,
        tenant: &TenantId,
        job: &JobId,
    ) -> Result<Option<Message>, StoreError> {
        let inner = self.inner.read().expect("store lock poisoned");
        Ok(inner
            .messages
            .iter()
            .find(|((t, _), m)| t == tenant.as_str() && m.client_ref.as_ref() == Some(job))
            .map(|(_, m)| m.clone()))
    }

    async fn mark_message_dispatched(
        &self,
        tenant: &TenantId,
        id: &MessageId,
        provider_message_id: &str,
        segments: i32,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().expect("store lock poisoned");
        let m = inner
            .messages
            .get_mut(&Self::key(tenant, id))
            .ok_or_else(|| StoreError::NotFound(format!("message {id}")))?;
        m.status = MessageStatus::Sent;
        m.provider_message_id = Some(provider_message_id.to_owned());
        m.segments = Some(segments);
        m.sent_at = Some(at);
        m.error = None;
        m.status_updated_at = at;
        Ok(())
    }

    async fn mark_message_failed(
        &self,
        tenant: &TenantId,
        id: &MessageId,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().expect("store lock poisoned");
        let m = inner
            .messages
            .get_mut(&Self::key(tenant, id))
            .ok_or_else(|| StoreError::NotFound(format!("message {id}")))?;
        m.status = MessageStatus::Failed;
        m.error = Some(error.to_owned());
        m.status_updated_at = at;
        Ok(())
    }

    async fn count_outbound_since(
        &self,
        tenant: &TenantId,
        contact: &ContactId,
        kind: Channel,
        since: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let inner = self.inner.read().expect("store lock poisoned");
        let count = inner
            .messages
            .iter()
            .filter(|((t, _), m)| {
                t == tenant.as_str()
                    && m.direction == Direction::Outbound
                    && m.kind == kind
                    && m.contact_id.as_ref() == Some(contact)
                    && m.status != MessageStatus::Failed
                    && m.created_at >= since
            })
            .count();
        Ok(count as u64)
    }

    async fn list_messages_to_address(
        &self,
        tenant: &TenantId,
        address: &str,
    ) -> Result<Vec<Message>, StoreError> {
        let inner = self.inner.read().expect("store lock poisoned");
        let mut out: Vec<Message> = inner
            .messages
            .iter()
            .filter(|((t, _), m)| t == tenant.as_str() && m.to_address == address)
            .map(|(_, m)| m.clone())
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    async fn find_message_by_provider_id(
        &self,
        provider_message_id: &str,
    ) -> Result<Option<Message>, StoreError> {
        let inner = self.inner.read().expect("store lock poisoned");
        Ok(inner
            .messages
            .values()
            .find(|m| m.provider_message_id.as_deref() == Some(provider_message_id))
            .cloned())
    }

    async fn apply_status_update(
        &self,
        tenant: &TenantId,
        id: &MessageId,
        status: Option<MessageStatus>,
        provider_status: Option<&str>,
        error: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<StatusApplied, StoreError> {
        let mut inner = self.inner.write().expect("store lock poisoned");
        let m = inner
            .messages
            .get_mut(&Self::key(tenant, id))
            .ok_or_else(|| StoreError::NotFound(format!("message {id}")))?;

        let previous_status = m.status;
        let previous_provider_status = m.provider_status.clone();

        if let Some(text) = provider_status {
            m.provider_status = Some(text.to_owned());
        }
        if let Some(text) = error {
            m.error = Some(text.to_owned());
        }

        let transitioned = match status {
            Some(next) if m.status.accepts_transition_to(next) => {
                m.status = next;
                m.status_updated_at = at;
                if next == MessageStatus::Delivered {
                    m.delivered_at = Some(at);
                }
                true
            }
            _ => false,
        };

        Ok(StatusApplied {
            transitioned,
            previous_status,
            previous_provider_status,
        })
    }

    async fn insert_opt_out_log(
        &self,
        tenant: &TenantId,
        entry: &OptOutLogEntry,
    ) -> Result<(), StoreError> {
        debug_assert_eq!(entry.tenant.as_str(), tenant.as_str());
        let mut inner = self.inner.write().expect("store lock poisoned");
        inner.opt_out_log.push(entry.clone());
        Ok(())
    }

    async fn list_opt_out_log(
        &self,
        tenant: &TenantId,
        address: &str,
    ) -> Result<Vec<OptOutLogEntry>, StoreError> {
        let inner = self.inner.read().expect("store lock poisoned");
        Ok(inner
            .opt_out_log
            .iter()
            .filter(|e| e.tenant.as_str() == tenant.as_str() && e.address == address)
            .cloned()
            .collect())
    }

    async fn add_global_opt_out(
        &self,
        phone: &str,
        source_tenant: &TenantId,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().expect("store lock poisoned");
        // Insert-on-conflict-do-nothing: the first recording wins.
        inner
            .global_opt_outs
            .entry(phone.to_owned())
            .or_insert_with(|| GlobalOptOut::new(phone, source_tenant.clone()));
        Ok(())
    }

    async fn remove_global_opt_out(&self, phone: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().expect("store lock poisoned");
        inner.global_opt_outs.remove(phone);
        Ok(())
    }

    async fn get_global_opt_out(&self, phone: &str) -> Result<Option<GlobalOptOut>, StoreError> {
        let inner = self.inner.read().expect("store lock poisoned");
        Ok(inner.global_opt_outs.get(phone).cloned())
    }

    async fn find_location_by_sms_number(
        &self,
        phone: &str,
    ) -> Result<Option<Location>, StoreError> {
        let inner = self.inner.read().expect("store lock poisoned");
        Ok(inner
            .locations
            .values()
            .find(|l| l.sms_phone_number.as_deref() == Some(phone))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leafline_store::testing::run_store_conformance_tests;

    #[tokio::test]
    async fn conformance() {
        let store = MemoryStore::new();
        run_store_conformance_tests(&store)
            .await
            .expect("memory store must pass the conformance suite");
    }
}
