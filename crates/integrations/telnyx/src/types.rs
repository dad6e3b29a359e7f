use serde::{Deserialize, Serialize};

/// JSON request body for the Telnyx `POST /v2/messages` endpoint.
///
/// Exactly one of `from` and `messaging_profile_id` is set.
#[derive(Debug, Clone, Serialize)]
pub struct CreateMessageRequest {
    /// Destination phone number in E.164 format.
    pub to: String,

    /// Message body text.
    pub text: String,

    /// Sending phone number.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,

    /// Messaging-profile id, used when no dedicated number is assigned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub messaging_profile_id: Option<String>,
}

/// Response envelope from the Messages API.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateMessageResponse {
    /// The created message resource.
    pub data: MessageData,
}

/// The message resource inside a create response.
#[derive(Debug, Clone, Deserialize)]
pub struct MessageData {
    /// Carrier-assigned message id.
    pub id: String,

    /// Billable segment count. Absent for some message types.
    #[serde(default)]
    pub parts: Option<u32>,
}

/// Error envelope returned on non-2xx responses.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErrorResponse {
    /// The API's error list.
    #[serde(default)]
    pub errors: Vec<ApiError>,
}

/// One error from the API's error list.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiError {
    /// Machine-readable error code.
    #[serde(default)]
    pub code: Option<String>,

    /// Short error title.
    #[serde(default)]
    pub title: Option<String>,

    /// Human-readable detail.
    #[serde(default)]
    pub detail: Option<String>,
}

impl ErrorResponse {
    /// Flatten the error list into a single message, preferring detail over
    /// title over code.
    #[must_use]
    pub fn message(&self) -> String {
        let parts: Vec<String> = self
            .errors
            .iter()
            .map(|e| {
                e.detail
                    .clone()
                    .or_else(|| e.title.clone())
                    .or_else(|| e.code.clone())
                    .unwrap_or_else(|| "unknown error".to_owned())
            })
            .collect();
        if parts.is_empty() {
            "unknown error".to_owned()
        } else {
            parts.join("; ")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serializes_from_number() {
        let req = CreateMessageRequest {
            to: "+14155551212".into(),
            text: "hello".into(),
            from: Some("+14155550100".into()),
            messaging_profile_id: None,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["to"], "+14155551212");
        assert_eq!(json["from"], "+14155550100");
        assert!(json.get("messaging_profile_id").is_none());
    }

    #[test]
    fn request_serializes_messaging_profile() {
        let req = CreateMessageRequest {
            to: "+14155551212".into(),
            text: "hello".into(),
            from: None,
            messaging_profile_id: Some("mp-123".into()),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["messaging_profile_id"], "mp-123");
        assert!(json.get("from").is_none());
    }

    #[test]
    fn response_deserializes_id_and_parts() {
        let json = r#"{"data":{"id":"msg-abc","parts":2}}"#;
        let resp: CreateMessageResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.data.id, "msg-abc");
        assert_eq!(resp.data.parts, Some(2));
    }

    #[test]
    fn response_tolerates_missing_parts() {
        let json = r#"{"data":{"id":"msg-abc"}}"#;
        let resp: CreateMessageResponse = serde_json::from_str(json).unwrap();
        assert!(resp.data.parts.is_none());
    }

    #[test]
    fn error_response_flattens_detail() {
        let json = r#"{"errors":[{"code":"40310","title":"Blocked","detail":"Recipient opted out"}]}"#;
        let resp: ErrorResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.message(), "Recipient opted out");
    }

    #[test]
    fn empty_error_response_has_fallback_message() {
        let resp = ErrorResponse::default();
        assert_eq!(resp.message(), "unknown error");
    }
}
