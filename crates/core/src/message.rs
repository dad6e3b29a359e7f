use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::channel::Channel;
use crate::types::{CampaignId, ContactId, JobId, MessageId, TenantId};

/// Direction of a message relative to the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Outbound,
    Inbound,
}

impl Direction {
    /// Return a string representation of the direction.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Outbound => "outbound",
            Self::Inbound => "inbound",
        }
    }
}

impl std::str::FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "outbound" => Ok(Self::Outbound),
            "inbound" => Ok(Self::Inbound),
            other => Err(format!("unknown direction: {other}")),
        }
    }
}

/// Delivery state of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Queued,
    Sending,
    Sent,
    Delivered,
    Failed,
    Bounced,
    Complained,
    Opened,
    Clicked,
}

impl MessageStatus {
    /// Whether this status is terminal for delivery purposes.
    ///
    /// `Opened` and `Clicked` are engagement states that follow `Delivered`;
    /// they are not delivery-terminal themselves but are only reachable from
    /// terminal states.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Delivered | Self::Failed | Self::Bounced | Self::Complained
        )
    }

    /// Whether a status update from `self` to `next` is allowed.
    ///
    /// Carrier callbacks can arrive out of order (a `delivered` callback may
    /// land before the `sent` one), so updates out of a terminal state back
    /// to a non-terminal one are refused. The only transitions out of
    /// `Delivered` are the engagement progression `Opened` then `Clicked`.
    #[must_use]
    pub fn accepts_transition_to(self, next: Self) -> bool {
        if self == next {
            return false;
        }
        match self {
            Self::Failed | Self::Bounced | Self::Complained | Self::Clicked => false,
            Self::Delivered => matches!(next, Self::Opened | Self::Clicked),
            Self::Opened => next == Self::Clicked,
            Self::Queued | Self::Sending | Self::Sent => true,
        }
    }

    /// Return a string representation of the status.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
            Self::Bounced => "bounced",
            Self::Complained => "complained",
            Self::Opened => "opened",
            Self::Clicked => "clicked",
        }
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MessageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "sending" => Ok(Self::Sending),
            "sent" => Ok(Self::Sent),
            "delivered" => Ok(Self::Delivered),
            "failed" => Ok(Self::Failed),
            "bounced" => Ok(Self::Bounced),
            "complained" => Ok(Self::Complained),
            "opened" => Ok(Self::Opened),
            "clicked" => Ok(Self::Clicked),
            other => Err(format!("unknown message status: {other}")),
        }
    }
}

/// A per-send audit row.
///
/// Outbound rows carry the compliance timestamps (`consent_verified_at`,
/// `quiet_hours_checked_at`) stamped at dispatch time; inbound rows bypass
/// them. `provider_message_id` is unique across tenants once set.
/// `client_ref` holds the delivery job id so a retried job can find and
/// reuse its row instead of inserting a duplicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique message identifier.
    pub id: MessageId,

    /// Tenant that owns this message.
    pub tenant: TenantId,

    /// Contact this message was sent to or received from, when known.
    pub contact_id: Option<ContactId>,

    /// Campaign this message belongs to, if any.
    pub campaign_id: Option<CampaignId>,

    /// Delivery channel.
    pub kind: Channel,

    /// Direction relative to the platform.
    pub direction: Direction,

    /// Destination address (E.164 for SMS).
    pub to_address: String,

    /// Source address or messaging-profile id.
    pub from_address: String,

    /// Message body.
    pub content: String,

    /// Billable segment count reported by the carrier.
    pub segments: Option<i32>,

    /// Carrier-assigned message id, set after dispatch.
    pub provider_message_id: Option<String>,

    /// Delivery state.
    pub status: MessageStatus,

    /// Raw carrier status text from the most recent callback.
    pub provider_status: Option<String>,

    /// Carrier error text from the most recent failed attempt.
    pub error: Option<String>,

    /// When consent was re-verified before dispatch. Inbound rows and
    /// opt-out confirmations leave this unset.
    pub consent_verified_at: Option<DateTime<Utc>>,

    /// When quiet hours were checked before dispatch.
    pub quiet_hours_checked_at: Option<DateTime<Utc>>,

    /// Delivery job id for idempotent dispatch across queue retries.
    pub client_ref: Option<JobId>,

    /// When the carrier accepted the message.
    pub sent_at: Option<DateTime<Utc>>,

    /// When delivery was confirmed.
    pub delivered_at: Option<DateTime<Utc>>,

    /// When the row was created.
    pub created_at: DateTime<Utc>,

    /// When the status last changed. Monotonically advances under the
    /// store's last-writer-wins serialization.
    pub status_updated_at: DateTime<Utc>,
}

impl Message {
    /// Create an outbound message row in `Queued` state with the compliance
    /// timestamps stamped to `now`.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn outbound(
        tenant: impl Into<TenantId>,
        contact_id: Option<ContactId>,
        to: impl Into<String>,
        from: impl Into<String>,
        content: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: MessageId::random(),
            tenant: tenant.into(),
            contact_id,
            campaign_id: None,
            kind: Channel::Sms,
            direction: Direction::Outbound,
            to_address: to.into(),
            from_address: from.into(),
            content: content.into(),
            segments: None,
            provider_message_id: None,
            status: MessageStatus::Queued,
            provider_status: None,
            error: None,
            consent_verified_at: Some(now),
            quiet_hours_checked_at: Some(now),
            client_ref: None,
            sent_at: None,
            delivered_at: None,
            created_at: now,
            status_updated_at: now,
        }
    }

    /// Create an inbound message row in `Delivered` state. Inbound rows
    /// bypass the consent timestamps.
    #[must_use]
    pub fn inbound(
        tenant: impl Into<TenantId>,
        contact_id: Option<ContactId>,
        from: impl Into<String>,
        to: impl Into<String>,
        content: impl Into<String>,
        provider_message_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: MessageId::random(),
            tenant: tenant.into(),
            contact_id,
            campaign_id: None,
            kind: Channel::Sms,
            direction: Direction::Inbound,
            to_address: to.into(),
            from_address: from.into(),
            content: content.into(),
            segments: None,
            provider_message_id: Some(provider_message_id.into()),
            status: MessageStatus::Delivered,
            provider_status: None,
            error: None,
            consent_verified_at: None,
            quiet_hours_checked_at: None,
            client_ref: None,
            sent_at: None,
            delivered_at: Some(now),
            created_at: now,
            status_updated_at: now,
        }
    }

    /// Attach a campaign reference.
    #[must_use]
    pub fn with_campaign(mut self, campaign: impl Into<CampaignId>) -> Self {
        self.campaign_id = Some(campaign.into());
        self
    }

    /// Attach the delivery job id used for idempotent dispatch.
    #[must_use]
    pub fn with_client_ref(mut self, job: impl Into<JobId>) -> Self {
        self.client_ref = Some(job.into());
        self
    }

    /// Clear the compliance timestamps. Used by the opt-out confirmation
    /// path, which targets a phone rather than a consented contact.
    #[must_use]
    pub fn without_compliance_stamps(mut self) -> Self {
        self.consent_verified_at = None;
        self.quiet_hours_checked_at = None;
        self
    }
}
