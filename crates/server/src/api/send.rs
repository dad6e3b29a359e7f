use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use serde::Deserialize;

use leafline_core::{ContactId, LocationId};
use leafline_pipeline::{SendOutcome, SmsSendRequest};

use super::{AppState, tenant_from_headers};
use crate::error::ServerError;

/// Request body for `POST /api/sms/send`.
#[derive(Debug, Deserialize)]
pub struct SendSmsBody {
    /// Recipient contact id.
    pub contact_id: String,
    /// Optional sending-location override.
    #[serde(default)]
    pub location_id: Option<String>,
    /// Message body.
    pub content: String,
}

/// `POST /api/sms/send` — gate-checked single send.
///
/// Returns 200 with the job id on ALLOW and DEFER; 422 with the structured
/// block reasons on BLOCK.
pub async fn send_sms(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<SendSmsBody>,
) -> Result<impl IntoResponse, ServerError> {
    let tenant = tenant_from_headers(&headers)?;

    let outcome = state
        .send
        .send_sms(
            &tenant,
            SmsSendRequest {
                contact_id: ContactId::new(body.contact_id),
                location_id: body.location_id.map(LocationId::new),
                content: body.content,
                campaign_id: None,
            },
        )
        .await?;

    let response = match outcome {
        SendOutcome::Queued { job_id } => (
            StatusCode::OK,
            Json(serde_json::json!({ "success": true, "jobId": job_id })),
        ),
        SendOutcome::Deferred { job_id, until } => (
            StatusCode::OK,
            Json(serde_json::json!({
                "success": true,
                "jobId": job_id,
                "deferredUntil": until,
            })),
        ),
        SendOutcome::Blocked { reasons } => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(serde_json::json!({
                "success": false,
                "blocked": true,
                "reasons": reasons,
            })),
        ),
    };
    Ok(response)
}
