//! Carrier webhook intake.
//!
//! The handler verifies the Ed25519 signature over the raw body, then
//! acknowledges with 200 *before* any reconciliation work — processing runs
//! on a spawned task so carrier retries are never triggered by our own
//! latency. Unknown event types are logged at info and acknowledged.

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use chrono::Utc;
use serde::Deserialize;
use tracing::{error, info, warn};

use leafline_pipeline::Reconciler;

use super::AppState;

/// Carrier webhook envelope: `{data: {event_type, payload}}`.
#[derive(Debug, Deserialize)]
struct WebhookEnvelope {
    data: WebhookEvent,
}

#[derive(Debug, Deserialize)]
struct WebhookEvent {
    event_type: String,
    payload: serde_json::Value,
}

/// Payload shape of outbound lifecycle events.
#[derive(Debug, Deserialize)]
struct OutboundPayload {
    id: String,
    #[serde(default)]
    to: Vec<ToEntry>,
    #[serde(default)]
    errors: Vec<PayloadError>,
}

#[derive(Debug, Deserialize)]
struct ToEntry {
    #[serde(default)]
    phone_number: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PayloadError {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    detail: Option<String>,
}

impl PayloadError {
    fn message(&self) -> String {
        self.detail
            .clone()
            .or_else(|| self.title.clone())
            .or_else(|| self.code.clone())
            .unwrap_or_else(|| "unknown error".to_owned())
    }
}

/// Payload shape of `message.received`.
#[derive(Debug, Deserialize)]
struct InboundPayload {
    id: String,
    from: FromEntry,
    #[serde(default)]
    to: Vec<ToEntry>,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct FromEntry {
    phone_number: String,
}

/// `POST /webhooks/telnyx`.
pub async fn telnyx(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    if let Some(verifier) = &state.verifier {
        let signature = header_str(&headers, "telnyx-signature-ed25519");
        let timestamp = header_str(&headers, "telnyx-timestamp");
        let (Some(signature), Some(timestamp)) = (signature, timestamp) else {
            warn!("webhook missing signature headers");
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": "missing signature headers" })),
            );
        };
        if let Err(e) = verifier.verify(signature, timestamp, &body, Utc::now()) {
            warn!(error = %e, "webhook signature verification failed");
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": "invalid signature" })),
            );
        }
    }

    let envelope: WebhookEnvelope = match serde_json::from_slice(&body) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(error = %e, "malformed webhook body");
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": "malformed body" })),
            );
        }
    };

    // Ack first; reconcile on our own event loop.
    let reconciler = state.reconciler.clone();
    tokio::spawn(async move {
        process_event(&reconciler, envelope.data).await;
    });

    (
        StatusCode::OK,
        Json(serde_json::json!({ "received": true })),
    )
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Derive the provider status for events whose payload omits
/// `to[0].status`.
fn status_from_event_type(event_type: &str) -> Option<&'static str> {
    match event_type {
        "message.sent" => Some("sent"),
        "message.delivered" => Some("delivered"),
        "message.failed" | "message.delivery_failed" => Some("delivery_failed"),
        _ => None,
    }
}

async fn process_event(reconciler: &Reconciler, event: WebhookEvent) {
    match event.event_type.as_str() {
        "message.received" => {
            let payload: InboundPayload = match serde_json::from_value(event.payload) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(error = %e, "malformed message.received payload");
                    return;
                }
            };
            let Some(destination) = payload.to.first().and_then(|t| t.phone_number.clone())
            else {
                warn!("message.received without destination number");
                return;
            };
            if let Err(e) = reconciler
                .on_inbound(
                    &payload.from.phone_number,
                    &destination,
                    &payload.text,
                    &payload.id,
                )
                .await
            {
                error!(error = %e, "inbound reconciliation failed");
            }
        }
        "message.sent"
        | "message.finalized"
        | "message.delivered"
        | "message.failed"
        | "message.delivery_failed" => {
            let payload: OutboundPayload = match serde_json::from_value(event.payload) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(error = %e, event_type = %event.event_type, "malformed status payload");
                    return;
                }
            };
            let status = payload
                .to
                .first()
                .and_then(|t| t.status.clone())
                .or_else(|| status_from_event_type(&event.event_type).map(str::to_owned));
            let Some(status) = status else {
                warn!(event_type = %event.event_type, "status event without a status");
                return;
            };
            let error_text = payload.errors.first().map(PayloadError::message);
            if let Err(e) = reconciler
                .on_status(&payload.id, &status, error_text.as_deref())
                .await
            {
                error!(error = %e, "status reconciliation failed");
            }
        }
        other => {
            info!(event_type = %other, "unhandled webhook event type");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_fallback_statuses() {
        assert_eq!(status_from_event_type("message.sent"), Some("sent"));
        assert_eq!(status_from_event_type("message.delivered"), Some("delivered"));
        assert_eq!(
            status_from_event_type("message.failed"),
            Some("delivery_failed")
        );
        assert_eq!(status_from_event_type("message.finalized"), None);
    }

    #[test]
    fn payload_error_prefers_detail() {
        let err = PayloadError {
            code: Some("40300".into()),
            title: Some("Blocked".into()),
            detail: Some("Recipient unreachable".into()),
        };
        assert_eq!(err.message(), "Recipient unreachable");
        let err = PayloadError {
            code: Some("40300".into()),
            title: None,
            detail: None,
        };
        assert_eq!(err.message(), "40300");
    }

    #[test]
    fn envelope_parses_carrier_shape() {
        let raw = r#"{
            "data": {
                "event_type": "message.received",
                "payload": {
                    "id": "pm-1",
                    "from": {"phone_number": "+14155551212"},
                    "to": [{"phone_number": "+14155550100"}],
                    "text": "STOP"
                }
            }
        }"#;
        let envelope: WebhookEnvelope = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.data.event_type, "message.received");
        let payload: InboundPayload = serde_json::from_value(envelope.data.payload).unwrap();
        assert_eq!(payload.from.phone_number, "+14155551212");
        assert_eq!(payload.text, "STOP");
    }
}
