use axum::Json;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;

use leafline_core::CampaignId;
use leafline_pipeline::CampaignJobPayload;
use leafline_queue::{JobKind, JobOptions};

use super::{AppState, tenant_from_headers};
use crate::error::ServerError;

/// `POST /api/campaigns/{id}/send` — trigger campaign expansion.
///
/// Verifies the campaign exists under the tenant, then enqueues a
/// `campaign_send` job; per-recipient gating happens during expansion.
pub async fn send_campaign(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServerError> {
    let tenant = tenant_from_headers(&headers)?;
    let campaign_id = CampaignId::new(id);

    if state
        .store
        .get_campaign(&tenant, &campaign_id)
        .await?
        .is_none()
    {
        return Err(ServerError::NotFound(format!("campaign {campaign_id}")));
    }

    let payload = CampaignJobPayload {
        tenant_id: tenant,
        campaign_id,
    };
    let payload = serde_json::to_value(&payload)
        .map_err(|e| ServerError::Config(format!("payload serialization: {e}")))?;
    let job_id = state
        .queue
        .enqueue(JobKind::CampaignSend, payload, JobOptions::default())
        .await
        .map_err(leafline_pipeline::PipelineError::from)?;

    Ok(Json(serde_json::json!({ "success": true, "jobId": job_id })))
}
