use serde::{Deserialize, Serialize};

use leafline_core::{CampaignId, ContactId, LocationId, TenantId};

/// Payload of an `sms_send` job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmsJobPayload {
    /// Tenant the send belongs to.
    pub tenant_id: TenantId,

    /// Recipient contact.
    pub contact_id: ContactId,

    /// Explicit sending location. When absent, the contact's primary
    /// location decides the from number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_id: Option<LocationId>,

    /// Message body.
    pub content: String,

    /// Campaign this send belongs to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub campaign_id: Option<CampaignId>,
}

/// Payload of a `campaign_send` job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignJobPayload {
    /// Tenant the campaign belongs to.
    pub tenant_id: TenantId,

    /// Campaign to expand.
    pub campaign_id: CampaignId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sms_payload_omits_absent_options() {
        let payload = SmsJobPayload {
            tenant_id: TenantId::new("t"),
            contact_id: ContactId::new("c"),
            location_id: None,
            content: "hi".into(),
            campaign_id: None,
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert!(!json.contains("location_id"));
        assert!(!json.contains("campaign_id"));
        let back: SmsJobPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back.contact_id, ContactId::new("c"));
    }
}
