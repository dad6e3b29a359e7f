use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{LocationId, TenantId};

/// A physical retail site belonging to a tenant.
///
/// Each location carries its own sending phone number (or falls back to the
/// tenant's default messaging profile when unset) and the timezone used for
/// quiet-hours evaluation of contacts without an explicit override.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Location {
    /// Unique location identifier.
    pub id: LocationId,

    /// Tenant that owns this location.
    pub tenant: TenantId,

    /// Human-readable name.
    pub name: String,

    /// Two-letter US state code (e.g. `"CA"`).
    pub state_code: String,

    /// IANA timezone of the site (e.g. `"America/Los_Angeles"`).
    pub timezone: String,

    /// Dedicated sending number in E.164 form. When `None`, dispatch uses the
    /// configured default messaging-profile id instead.
    pub sms_phone_number: Option<String>,

    /// When the location was created.
    pub created_at: DateTime<Utc>,
}

impl Location {
    /// Create a new location with a random id.
    #[must_use]
    pub fn new(
        tenant: impl Into<TenantId>,
        name: impl Into<String>,
        state_code: impl Into<String>,
        timezone: impl Into<String>,
    ) -> Self {
        Self {
            id: LocationId::random(),
            tenant: tenant.into(),
            name: name.into(),
            state_code: state_code.into(),
            timezone: timezone.into(),
            sms_phone_number: None,
            created_at: Utc::now(),
        }
    }

    /// Assign a dedicated sending number.
    #[must_use]
    pub fn with_sms_phone_number(mut self, phone: impl Into<String>) -> Self {
        self.sms_phone_number = Some(phone.into());
        self
    }
}
