//! Inbound reconciliation.
//!
//! Carrier webhooks land here after the HTTP layer has acknowledged them:
//! status callbacks advance message rows (and campaign counters), inbound
//! texts are recorded and matched against the opt-out / opt-in keyword
//! sets, and consent changes are mirrored into the contact row, the audit
//! log, and the cross-tenant opt-out table.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use leafline_compliance::{default_opt_in_keywords, default_opt_out_keywords};
use leafline_core::{
    Channel, ConsentMethod, Contact, ContactId, CounterField, Location, Message, MessageId,
    MessageStatus, OptAction, OptOutLogEntry, TenantId, normalize,
};
use leafline_provider::{SmsFrom, SmsProvider};
use leafline_store::Store;

use crate::error::PipelineError;

/// Reconciler configuration.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Keywords that trigger an opt-out (uppercase).
    pub opt_out_keywords: Vec<String>,

    /// Keywords that trigger an opt-in (uppercase).
    pub opt_in_keywords: Vec<String>,

    /// Confirmation text sent after an opt-out.
    pub opt_out_confirmation: String,

    /// Confirmation text sent after an opt-in.
    pub opt_in_confirmation: String,

    /// Messaging profile used for confirmations when the receiving
    /// location has no dedicated number.
    pub default_messaging_profile: Option<String>,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            opt_out_keywords: default_opt_out_keywords(),
            opt_in_keywords: default_opt_in_keywords(),
            opt_out_confirmation:
                "You have been unsubscribed and will receive no further messages. \
                 Reply START to resubscribe."
                    .to_owned(),
            opt_in_confirmation:
                "You are subscribed. Reply STOP at any time to unsubscribe.".to_owned(),
            default_messaging_profile: None,
        }
    }
}

/// Result of a status callback.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "result")]
pub enum StatusOutcome {
    /// The matching row was updated.
    Updated {
        /// The message the callback applied to.
        message_id: MessageId,
        /// Whether the internal status actually transitioned (`false` for
        /// replays, regressions, and untranslated provider statuses).
        transitioned: bool,
    },
    /// No row carries this provider message id.
    UnknownMessage,
}

/// Result of an inbound text.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum InboundOutcome {
    /// The text matched an opt-out keyword.
    OptedOut {
        /// The affected contact, when one matched the sender.
        contact_id: Option<ContactId>,
    },
    /// The text matched an opt-in keyword.
    OptedIn {
        /// The affected contact, when one matched the sender.
        contact_id: Option<ContactId>,
    },
    /// A plain inbound message; recorded, nothing else.
    Received,
    /// The destination number maps to no location. Nothing was persisted.
    UnknownDestination,
}

/// Map a carrier delivery status onto the internal status. Unknown values
/// return `None` and pass through untranslated — the raw text is still
/// recorded on the row.
#[must_use]
pub fn map_provider_status(provider_status: &str) -> Option<MessageStatus> {
    match provider_status {
        "queued" => Some(MessageStatus::Queued),
        "sending" => Some(MessageStatus::Sending),
        // The carrier could not confirm handset delivery; treat as sent.
        "sent" | "delivery_unconfirmed" => Some(MessageStatus::Sent),
        "delivered" => Some(MessageStatus::Delivered),
        "delivery_failed" => Some(MessageStatus::Failed),
        _ => None,
    }
}

/// Decide which campaign counter (if any) a status callback advances.
///
/// Counting must be exactly-once under carrier replays and out-of-order
/// delivery, so each counter keys off a monotone row change:
///
/// - `delivered_count` advances on the transition into `Delivered`.
/// - `failed_count` advances on the transition into `Failed`, unless the
///   carrier had already confirmed the send (that message was counted sent
///   and stays in that bucket; the row itself still flips to failed).
/// - `sent_count` advances on the first carrier confirmation of a row the
///   worker marked sent: same status, but no provider status text had been
///   recorded yet. A replayed `sent` callback finds the text already
///   recorded and counts nothing.
fn campaign_counter_for(
    next: MessageStatus,
    applied: &leafline_store::StatusApplied,
) -> Option<CounterField> {
    if applied.transitioned {
        return match next {
            MessageStatus::Delivered => Some(CounterField::Delivered),
            MessageStatus::Sent => Some(CounterField::Sent),
            MessageStatus::Failed => {
                let already_counted_sent = applied.previous_status == MessageStatus::Sent
                    && applied.previous_provider_status.is_some();
                (!already_counted_sent).then_some(CounterField::Failed)
            }
            _ => None,
        };
    }
    let first_sent_confirmation = next == MessageStatus::Sent
        && applied.previous_status == MessageStatus::Sent
        && applied.previous_provider_status.is_none();
    first_sent_confirmation.then_some(CounterField::Sent)
}

/// Processes carrier callbacks after the webhook has been acknowledged.
pub struct Reconciler {
    store: Arc<dyn Store>,
    provider: Arc<dyn SmsProvider>,
    config: ReconcilerConfig,
}

impl Reconciler {
    /// Create a reconciler.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        provider: Arc<dyn SmsProvider>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            store,
            provider,
            config,
        }
    }

    /// Apply a delivery-status callback.
    ///
    /// The lookup by provider message id is cross-tenant by design. The
    /// store's regression guard makes replays and out-of-order callbacks
    /// no-ops for the row, and [`campaign_counter_for`] keys counter
    /// advancement off the pre-update state, which keeps the counters
    /// replay-safe too.
    #[instrument(skip(self))]
    pub async fn on_status(
        &self,
        provider_message_id: &str,
        provider_status: &str,
        error: Option<&str>,
    ) -> Result<StatusOutcome, PipelineError> {
        let Some(message) = self
            .store
            .find_message_by_provider_id(provider_message_id)
            .await?
        else {
            warn!(provider_message_id, "status callback for unknown message");
            return Ok(StatusOutcome::UnknownMessage);
        };

        let mapped = map_provider_status(provider_status);
        if mapped.is_none() {
            debug!(provider_status, "untranslated provider status");
        }

        let applied = self
            .store
            .apply_status_update(
                &message.tenant,
                &message.id,
                mapped,
                Some(provider_status),
                error,
                Utc::now(),
            )
            .await?;

        if let (Some(campaign), Some(next)) = (&message.campaign_id, mapped)
            && let Some(field) = campaign_counter_for(next, &applied)
        {
            self.store
                .increment_campaign_counter(&message.tenant, campaign, field)
                .await?;
        }

        Ok(StatusOutcome::Updated {
            message_id: message.id,
            transitioned: applied.transitioned,
        })
    }

    /// Process an inbound text.
    #[instrument(skip(self, text))]
    pub async fn on_inbound(
        &self,
        from: &str,
        to: &str,
        text: &str,
        provider_message_id: &str,
    ) -> Result<InboundOutcome, PipelineError> {
        let from = normalize(from);
        let to = normalize(to);

        // Carrier webhooks are retried on our failures; a provider message
        // id we have already recorded means this delivery is a replay.
        if self
            .store
            .find_message_by_provider_id(provider_message_id)
            .await?
            .is_some()
        {
            debug!(provider_message_id, "duplicate inbound delivery, skipping");
            return Ok(InboundOutcome::Received);
        }

        let Some(location) = self.store.find_location_by_sms_number(&to).await? else {
            warn!(destination = %to, "inbound for unknown destination number, dropping");
            return Ok(InboundOutcome::UnknownDestination);
        };
        let tenant = location.tenant.clone();

        let contact = self.store.find_contact_by_phone(&tenant, &from).await?;

        let inbound = Message::inbound(
            tenant.clone(),
            contact.as_ref().map(|c| c.id.clone()),
            from.clone(),
            to.clone(),
            text,
            provider_message_id,
        );
        self.store.insert_message(&tenant, &inbound).await?;

        let keyword = text.trim().to_uppercase();
        if self.config.opt_out_keywords.contains(&keyword) {
            self.process_opt_out(&tenant, &location, contact, &from, &inbound.id)
                .await
        } else if self.config.opt_in_keywords.contains(&keyword) {
            self.process_opt_in(&tenant, &location, contact, &from, &inbound.id)
                .await
        } else {
            debug!(tenant = %tenant, from = %from, "inbound message recorded");
            Ok(InboundOutcome::Received)
        }
    }

    async fn process_opt_out(
        &self,
        tenant: &TenantId,
        location: &Location,
        contact: Option<Contact>,
        from: &str,
        inbound_id: &MessageId,
    ) -> Result<InboundOutcome, PipelineError> {
        let contact_id = contact.as_ref().map(|c| c.id.clone());
        let now = Utc::now();

        if let Some(id) = &contact_id {
            self.store.record_contact_opt_out(tenant, id, now).await?;
        }

        let entry = OptOutLogEntry::new(
            tenant.clone(),
            contact_id.clone(),
            Channel::Sms,
            from,
            OptAction::OptOut,
            ConsentMethod::KeywordReply,
        )
        .with_source_message(inbound_id.clone());
        self.store.insert_opt_out_log(tenant, &entry).await?;

        self.store.add_global_opt_out(from, tenant).await?;

        info!(tenant = %tenant, from = %from, "opt-out recorded");
        self.send_confirmation(
            tenant,
            location,
            contact_id.clone(),
            from,
            &self.config.opt_out_confirmation,
        )
        .await;

        Ok(InboundOutcome::OptedOut {
            contact_id,
        })
    }

    async fn process_opt_in(
        &self,
        tenant: &TenantId,
        location: &Location,
        contact: Option<Contact>,
        from: &str,
        inbound_id: &MessageId,
    ) -> Result<InboundOutcome, PipelineError> {
        let contact_id = contact.as_ref().map(|c| c.id.clone());
        let now = Utc::now();

        if let Some(id) = &contact_id {
            self.store
                .record_contact_opt_in(tenant, id, ConsentMethod::KeywordReply, now)
                .await?;
        }

        let entry = OptOutLogEntry::new(
            tenant.clone(),
            contact_id.clone(),
            Channel::Sms,
            from,
            OptAction::OptIn,
            ConsentMethod::KeywordReply,
        )
        .with_source_message(inbound_id.clone());
        self.store.insert_opt_out_log(tenant, &entry).await?;

        self.store.remove_global_opt_out(from).await?;

        info!(tenant = %tenant, from = %from, "opt-in recorded");
        self.send_confirmation(
            tenant,
            location,
            contact_id.clone(),
            from,
            &self.config.opt_in_confirmation,
        )
        .await;

        Ok(InboundOutcome::OptedIn {
            contact_id,
        })
    }

    /// Send a consent confirmation and record it as an outbound row.
    ///
    /// This path deliberately bypasses the gate: it targets the phone that
    /// just texted us, not a consented contact, and regulations require the
    /// confirmation even for opted-out numbers. Failures are logged rather
    /// than propagated — the consent change itself has already been
    /// persisted and must not be rolled back by a carrier hiccup.
    async fn send_confirmation(
        &self,
        tenant: &TenantId,
        location: &Location,
        contact_id: Option<ContactId>,
        to: &str,
        text: &str,
    ) {
        let sender = location
            .sms_phone_number
            .clone()
            .map(SmsFrom::Number)
            .or_else(|| {
                self.config
                    .default_messaging_profile
                    .clone()
                    .map(SmsFrom::MessagingProfile)
            });
        let Some(sender) = sender else {
            warn!(tenant = %tenant, "no sender identity for confirmation text");
            return;
        };
        let from_address = match &sender {
            SmsFrom::Number(number) => number.clone(),
            SmsFrom::MessagingProfile(id) => id.clone(),
        };

        match self.provider.send(to, &sender, text).await {
            Ok(receipt) => {
                let now = Utc::now();
                let mut message =
                    Message::outbound(tenant.clone(), contact_id, to, from_address, text, now)
                        .without_compliance_stamps();
                message.status = MessageStatus::Sent;
                message.provider_message_id = Some(receipt.provider_id);
                message.segments = Some(i32::try_from(receipt.segments).unwrap_or(i32::MAX));
                message.sent_at = Some(now);
                if let Err(e) = self.store.insert_message(tenant, &message).await {
                    warn!(tenant = %tenant, error = %e, "failed to record confirmation message");
                }
            }
            Err(e) => {
                warn!(tenant = %tenant, to = %to, error = %e, "confirmation send failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leafline_store::StatusApplied;

    fn applied(
        transitioned: bool,
        previous_status: MessageStatus,
        previous_provider_status: Option<&str>,
    ) -> StatusApplied {
        StatusApplied {
            transitioned,
            previous_status,
            previous_provider_status: previous_provider_status.map(str::to_owned),
        }
    }

    #[test]
    fn status_map_matches_carrier_vocabulary() {
        assert_eq!(map_provider_status("queued"), Some(MessageStatus::Queued));
        assert_eq!(map_provider_status("sent"), Some(MessageStatus::Sent));
        assert_eq!(
            map_provider_status("delivery_unconfirmed"),
            Some(MessageStatus::Sent)
        );
        assert_eq!(
            map_provider_status("delivery_failed"),
            Some(MessageStatus::Failed)
        );
        assert_eq!(map_provider_status("carrier_mystery"), None);
    }

    #[test]
    fn first_sent_confirmation_counts_once() {
        // Worker marked the row sent; no callback text yet.
        let first = applied(false, MessageStatus::Sent, None);
        assert_eq!(
            campaign_counter_for(MessageStatus::Sent, &first),
            Some(CounterField::Sent)
        );
        // The replay finds the text recorded.
        let replay = applied(false, MessageStatus::Sent, Some("sent"));
        assert_eq!(campaign_counter_for(MessageStatus::Sent, &replay), None);
    }

    #[test]
    fn delivered_counts_on_transition_only() {
        let transition = applied(true, MessageStatus::Sent, Some("sent"));
        assert_eq!(
            campaign_counter_for(MessageStatus::Delivered, &transition),
            Some(CounterField::Delivered)
        );
        let replay = applied(false, MessageStatus::Delivered, Some("delivered"));
        assert_eq!(campaign_counter_for(MessageStatus::Delivered, &replay), None);
    }

    #[test]
    fn late_sent_after_delivered_counts_nothing() {
        let late = applied(false, MessageStatus::Delivered, Some("delivered"));
        assert_eq!(campaign_counter_for(MessageStatus::Sent, &late), None);
    }

    #[test]
    fn delivery_failure_stays_in_the_sent_bucket_once_confirmed() {
        // Confirmed-sent messages were already counted; a later carrier
        // failure flips the row but not the partition.
        let confirmed = applied(true, MessageStatus::Sent, Some("sent"));
        assert_eq!(campaign_counter_for(MessageStatus::Failed, &confirmed), None);
        // An unconfirmed send that fails outright counts as failed.
        let unconfirmed = applied(true, MessageStatus::Sent, None);
        assert_eq!(
            campaign_counter_for(MessageStatus::Failed, &unconfirmed),
            Some(CounterField::Failed)
        );
    }
}
