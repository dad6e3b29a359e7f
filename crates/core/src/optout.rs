use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::channel::Channel;
use crate::contact::ConsentMethod;
use crate::types::{ContactId, MessageId, TenantId};

/// Whether an audit entry records an opt-in or an opt-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptAction {
    OptIn,
    OptOut,
}

impl OptAction {
    /// Return a string representation of the action.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OptIn => "opt_in",
            Self::OptOut => "opt_out",
        }
    }
}

impl std::str::FromStr for OptAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "opt_in" => Ok(Self::OptIn),
            "opt_out" => Ok(Self::OptOut),
            other => Err(format!("unknown opt action: {other}")),
        }
    }
}

/// Immutable audit record of a consent change.
///
/// One row is appended per opt-in / opt-out action, even when the action is
/// a repeat of the contact's current state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptOutLogEntry {
    /// Unique entry identifier.
    pub id: String,

    /// Tenant under which the action was recorded.
    pub tenant: TenantId,

    /// Contact affected, when known.
    pub contact_id: Option<ContactId>,

    /// Channel the action applies to.
    pub channel: Channel,

    /// The address the action was received from (E.164 for SMS).
    pub address: String,

    /// Opt-in or opt-out.
    pub action: OptAction,

    /// How the action was captured.
    pub method: ConsentMethod,

    /// Inbound message that triggered the action, if any.
    pub source_message_id: Option<MessageId>,

    /// When the action was recorded.
    pub created_at: DateTime<Utc>,
}

impl OptOutLogEntry {
    /// Create a new audit entry timestamped now.
    #[must_use]
    pub fn new(
        tenant: impl Into<TenantId>,
        contact_id: Option<ContactId>,
        channel: Channel,
        address: impl Into<String>,
        action: OptAction,
        method: ConsentMethod,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tenant: tenant.into(),
            contact_id,
            channel,
            address: address.into(),
            action,
            method,
            source_message_id: None,
            created_at: Utc::now(),
        }
    }

    /// Attach the inbound message that triggered this action.
    #[must_use]
    pub fn with_source_message(mut self, message: impl Into<MessageId>) -> Self {
        self.source_message_id = Some(message.into());
        self
    }
}

/// Cross-tenant opt-out record keyed by E.164 phone.
///
/// A number present here must not be messaged by any tenant, regardless of
/// which tenant first recorded the opt-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalOptOut {
    /// The opted-out phone number in E.164 form.
    pub phone: String,

    /// Tenant that first recorded the opt-out.
    pub source_tenant: TenantId,

    /// When the opt-out was recorded.
    pub opted_out_at: DateTime<Utc>,
}

impl GlobalOptOut {
    /// Create a new record timestamped now.
    #[must_use]
    pub fn new(phone: impl Into<String>, source_tenant: impl Into<TenantId>) -> Self {
        Self {
            phone: phone.into(),
            source_tenant: source_tenant.into(),
            opted_out_at: Utc::now(),
        }
    }
}
