use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ContactId, LocationId, TenantId};

/// How a consent or opt-out action was captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentMethod {
    /// The recipient replied with a keyword (STOP, START, ...).
    KeywordReply,
    /// The recipient clicked a subscribe/unsubscribe link.
    LinkClick,
    /// A staff member recorded the action manually.
    Manual,
    /// Imported from an external system.
    Import,
}

impl ConsentMethod {
    /// Return a string representation of the method.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::KeywordReply => "keyword_reply",
            Self::LinkClick => "link_click",
            Self::Manual => "manual",
            Self::Import => "import",
        }
    }
}

impl std::fmt::Display for ConsentMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ConsentMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "keyword_reply" => Ok(Self::KeywordReply),
            "link_click" => Ok(Self::LinkClick),
            "manual" => Ok(Self::Manual),
            "import" => Ok(Self::Import),
            other => Err(format!("unknown consent method: {other}")),
        }
    }
}

/// A messageable recipient belonging to a tenant.
///
/// Keyed by `(tenant, id)`; `(tenant, phone)` is unique. The consent and
/// opt-out pairs carry their timestamps: `sms_consent == true` implies
/// `sms_consent_at` is set, and `sms_opted_out == true` implies
/// `sms_opted_out_at` is set. The builder methods maintain these pairings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    /// Unique contact identifier.
    pub id: ContactId,

    /// Tenant that owns this contact.
    pub tenant: TenantId,

    /// Phone number in E.164 form (already normalized).
    pub phone: String,

    /// The retail location this contact primarily shops at.
    pub primary_location_id: Option<LocationId>,

    /// Whether the contact has consented to SMS marketing.
    pub sms_consent: bool,

    /// When SMS consent was captured.
    pub sms_consent_at: Option<DateTime<Utc>>,

    /// How SMS consent was captured.
    pub sms_consent_method: Option<ConsentMethod>,

    /// Email address, if known.
    pub email: Option<String>,

    /// Whether the contact has consented to email marketing.
    pub email_consent: bool,

    /// Whether the contact has opted out of SMS.
    pub sms_opted_out: bool,

    /// When the contact opted out of SMS.
    pub sms_opted_out_at: Option<DateTime<Utc>>,

    /// Whether the contact's age has been verified.
    pub age_verified: bool,

    /// Date of birth, when collected during age verification.
    pub date_of_birth: Option<NaiveDate>,

    /// Free-form tags used for campaign targeting.
    #[serde(default)]
    pub tags: Vec<String>,

    /// Explicit IANA timezone override for quiet-hours evaluation.
    pub timezone: Option<String>,

    /// When the contact was created.
    pub created_at: DateTime<Utc>,

    /// When the contact was last updated.
    pub updated_at: DateTime<Utc>,
}

impl Contact {
    /// Create a new contact with a random id and no consent on file.
    #[must_use]
    pub fn new(tenant: impl Into<TenantId>, phone: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: ContactId::random(),
            tenant: tenant.into(),
            phone: phone.into(),
            primary_location_id: None,
            sms_consent: false,
            sms_consent_at: None,
            sms_consent_method: None,
            email: None,
            email_consent: false,
            sms_opted_out: false,
            sms_opted_out_at: None,
            age_verified: false,
            date_of_birth: None,
            tags: Vec::new(),
            timezone: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Record SMS consent captured at `at` via `method`.
    #[must_use]
    pub fn with_sms_consent(mut self, at: DateTime<Utc>, method: ConsentMethod) -> Self {
        self.sms_consent = true;
        self.sms_consent_at = Some(at);
        self.sms_consent_method = Some(method);
        self
    }

    /// Record email consent.
    #[must_use]
    pub fn with_email_consent(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self.email_consent = true;
        self
    }

    /// Mark the contact as opted out of SMS at `at`.
    #[must_use]
    pub fn with_sms_opt_out(mut self, at: DateTime<Utc>) -> Self {
        self.sms_opted_out = true;
        self.sms_opted_out_at = Some(at);
        self
    }

    /// Mark age as verified, optionally recording the date of birth.
    #[must_use]
    pub fn with_age_verified(mut self, date_of_birth: Option<NaiveDate>) -> Self {
        self.age_verified = true;
        self.date_of_birth = date_of_birth;
        self
    }

    /// Set the primary location.
    #[must_use]
    pub fn with_primary_location(mut self, location: impl Into<LocationId>) -> Self {
        self.primary_location_id = Some(location.into());
        self
    }

    /// Set targeting tags.
    #[must_use]
    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    /// Set an explicit timezone override.
    #[must_use]
    pub fn with_timezone(mut self, tz: impl Into<String>) -> Self {
        self.timezone = Some(tz.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_contact_has_no_consent() {
        let c = Contact::new("tenant-1", "+14155551212");
        assert!(!c.sms_consent);
        assert!(c.sms_consent_at.is_none());
        assert!(!c.sms_opted_out);
        assert!(!c.age_verified);
    }

    #[test]
    fn consent_carries_timestamp_and_method() {
        let now = Utc::now();
        let c = Contact::new("t", "+14155551212").with_sms_consent(now, ConsentMethod::Manual);
        assert!(c.sms_consent);
        assert_eq!(c.sms_consent_at, Some(now));
        assert_eq!(c.sms_consent_method, Some(ConsentMethod::Manual));
    }

    #[test]
    fn opt_out_carries_timestamp() {
        let now = Utc::now();
        let c = Contact::new("t", "+14155551212").with_sms_opt_out(now);
        assert!(c.sms_opted_out);
        assert_eq!(c.sms_opted_out_at, Some(now));
    }

    #[test]
    fn consent_method_serde_is_snake_case() {
        let json = serde_json::to_string(&ConsentMethod::KeywordReply).unwrap();
        assert_eq!(json, "\"keyword_reply\"");
    }

    #[test]
    fn contact_serde_roundtrip() {
        let c = Contact::new("t", "+14155551212")
            .with_age_verified(Some(NaiveDate::from_ymd_opt(1990, 6, 1).unwrap()))
            .with_tags(vec!["vip".into()]);
        let json = serde_json::to_string(&c).unwrap();
        let back: Contact = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, c.id);
        assert_eq!(back.tags, vec!["vip".to_owned()]);
        assert!(back.age_verified);
    }
}
