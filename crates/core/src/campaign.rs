use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{CampaignId, LocationId, TenantId};

/// Which channels a campaign sends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignKind {
    Sms,
    Email,
    Both,
}

impl CampaignKind {
    /// Whether this campaign sends SMS.
    #[must_use]
    pub fn touches_sms(self) -> bool {
        matches!(self, Self::Sms | Self::Both)
    }

    /// Whether this campaign sends email.
    #[must_use]
    pub fn touches_email(self) -> bool {
        matches!(self, Self::Email | Self::Both)
    }

    /// Return a string representation of the kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sms => "sms",
            Self::Email => "email",
            Self::Both => "both",
        }
    }
}

impl std::str::FromStr for CampaignKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sms" => Ok(Self::Sms),
            "email" => Ok(Self::Email),
            "both" => Ok(Self::Both),
            other => Err(format!("unknown campaign kind: {other}")),
        }
    }
}

/// Lifecycle state of a campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Scheduled,
    Sending,
    Sent,
    Paused,
    Cancelled,
}

impl CampaignStatus {
    /// Whether this state admits no further transitions.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Sent | Self::Cancelled)
    }

    /// Whether a transition from `self` to `next` is legal.
    ///
    /// The forward path is draft → scheduled → sending → sent; `cancelled`
    /// and `paused` are reachable from any non-terminal state. A draft may
    /// also go straight to sending ("send now").
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            Self::Cancelled | Self::Paused => true,
            Self::Scheduled => self == Self::Draft,
            Self::Sending => matches!(self, Self::Draft | Self::Scheduled),
            Self::Sent => self == Self::Sending,
            Self::Draft => false,
        }
    }

    /// Return a string representation of the status.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Scheduled => "scheduled",
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Paused => "paused",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CampaignStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "scheduled" => Ok(Self::Scheduled),
            "sending" => Ok(Self::Sending),
            "sent" => Ok(Self::Sent),
            "paused" => Ok(Self::Paused),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown campaign status: {other}")),
        }
    }
}

/// A campaign delivery counter advanced during reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterField {
    Sent,
    Delivered,
    Failed,
    Opened,
    Clicked,
    OptedOut,
}

impl CounterField {
    /// The column name for this counter.
    #[must_use]
    pub fn column(self) -> &'static str {
        match self {
            Self::Sent => "sent_count",
            Self::Delivered => "delivered_count",
            Self::Failed => "failed_count",
            Self::Opened => "opened_count",
            Self::Clicked => "clicked_count",
            Self::OptedOut => "opted_out_count",
        }
    }
}

/// A one-time broadcast to a filtered recipient set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    /// Unique campaign identifier.
    pub id: CampaignId,

    /// Tenant that owns this campaign.
    pub tenant: TenantId,

    /// Human-readable name.
    pub name: String,

    /// Which channels the campaign sends on.
    pub kind: CampaignKind,

    /// SMS body. Required when `kind` touches SMS.
    pub sms_content: Option<String>,

    /// Email subject line. Required when `kind` touches email.
    pub email_subject: Option<String>,

    /// Email body. Required when `kind` touches email.
    pub email_content: Option<String>,

    /// Restrict to contacts whose primary location is in this set.
    /// Empty means all locations.
    #[serde(default)]
    pub target_location_ids: Vec<LocationId>,

    /// Restrict to contacts carrying at least one of these tags.
    /// Empty means all contacts.
    #[serde(default)]
    pub target_tags: Vec<String>,

    /// Lifecycle state.
    pub status: CampaignStatus,

    /// Number of recipients resolved at expansion time.
    pub total_recipients: i64,

    /// Sends acknowledged by the carrier.
    pub sent_count: i64,

    /// Deliveries confirmed by the carrier.
    pub delivered_count: i64,

    /// Sends that exhausted retries or were rejected by the carrier.
    pub failed_count: i64,

    /// Email opens (unused by the SMS path).
    pub opened_count: i64,

    /// Email link clicks (unused by the SMS path).
    pub clicked_count: i64,

    /// Recipients who opted out in response to this campaign.
    pub opted_out_count: i64,

    /// When the campaign is scheduled to fire.
    pub scheduled_at: Option<DateTime<Utc>>,

    /// When expansion began.
    pub started_at: Option<DateTime<Utc>>,

    /// When expansion finished enqueueing.
    pub completed_at: Option<DateTime<Utc>>,

    /// When the campaign was created.
    pub created_at: DateTime<Utc>,
}

impl Campaign {
    /// Create a new draft campaign with a random id and zeroed counters.
    #[must_use]
    pub fn new(tenant: impl Into<TenantId>, name: impl Into<String>, kind: CampaignKind) -> Self {
        Self {
            id: CampaignId::random(),
            tenant: tenant.into(),
            name: name.into(),
            kind,
            sms_content: None,
            email_subject: None,
            email_content: None,
            target_location_ids: Vec::new(),
            target_tags: Vec::new(),
            status: CampaignStatus::Draft,
            total_recipients: 0,
            sent_count: 0,
            delivered_count: 0,
            failed_count: 0,
            opened_count: 0,
            clicked_count: 0,
            opted_out_count: 0,
            scheduled_at: None,
            started_at: None,
            completed_at: None,
            created_at: Utc::now(),
        }
    }

    /// Set the SMS body.
    #[must_use]
    pub fn with_sms_content(mut self, content: impl Into<String>) -> Self {
        self.sms_content = Some(content.into());
        self
    }

    /// Restrict targeting to a set of locations.
    #[must_use]
    pub fn with_target_locations(mut self, locations: Vec<LocationId>) -> Self {
        self.target_location_ids = locations;
        self
    }

    /// Restrict targeting to contacts carrying any of these tags.
    #[must_use]
    pub fn with_target_tags(mut self, tags: Vec<String>) -> Self {
        self.target_tags = tags;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_path_transitions() {
        use CampaignStatus::{Draft, Scheduled, Sending, Sent};
        assert!(Draft.can_transition_to(Scheduled));
        assert!(Scheduled.can_transition_to(Sending));
        assert!(Sending.can_transition_to(Sent));
        // Send-now skips scheduling.
        assert!(Draft.can_transition_to(Sending));
    }

    #[test]
    fn terminal_states_admit_nothing() {
        use CampaignStatus::{Cancelled, Paused, Sending, Sent};
        assert!(!Sent.can_transition_to(Sending));
        assert!(!Sent.can_transition_to(Paused));
        assert!(!Cancelled.can_transition_to(Sending));
    }

    #[test]
    fn cancel_and_pause_reachable_from_any_non_terminal() {
        use CampaignStatus::{Cancelled, Draft, Paused, Scheduled, Sending};
        for from in [Draft, Scheduled, Sending, Paused] {
            assert!(from.can_transition_to(Cancelled), "{from} -> cancelled");
        }
        for from in [Draft, Scheduled, Sending] {
            assert!(from.can_transition_to(Paused), "{from} -> paused");
        }
    }

    #[test]
    fn no_backward_transitions() {
        use CampaignStatus::{Draft, Scheduled, Sending};
        assert!(!Sending.can_transition_to(Scheduled));
        assert!(!Scheduled.can_transition_to(Draft));
    }

    #[test]
    fn kind_channel_membership() {
        assert!(CampaignKind::Sms.touches_sms());
        assert!(!CampaignKind::Sms.touches_email());
        assert!(CampaignKind::Both.touches_sms());
        assert!(CampaignKind::Both.touches_email());
        assert!(!CampaignKind::Email.touches_sms());
    }

    #[test]
    fn new_campaign_is_draft_with_zero_counters() {
        let c = Campaign::new("t", "Summer drop", CampaignKind::Sms);
        assert_eq!(c.status, CampaignStatus::Draft);
        assert_eq!(c.total_recipients, 0);
        assert_eq!(c.sent_count, 0);
    }

    #[test]
    fn counter_field_columns() {
        assert_eq!(CounterField::Sent.column(), "sent_count");
        assert_eq!(CounterField::OptedOut.column(), "opted_out_count");
    }
}
