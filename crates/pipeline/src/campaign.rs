//! Campaign expansion.
//!
//! A `campaign_send` job resolves the campaign's targeting filter to its
//! recipient set and funnels every recipient through the same DEFER-aware
//! single-send path the API uses, so per-recipient quiet hours produce
//! per-recipient delayed dispatch rather than one campaign-wide delay.
//! Delivery counters advance asynchronously as carrier callbacks arrive.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, instrument, warn};

use leafline_queue::{HandlerError, Job, JobHandler, JobKind, JobOutcome};
use leafline_store::{Store, StoreError};

use crate::payload::CampaignJobPayload;
use crate::send::{SendOutcome, SendService, SmsSendRequest};

/// Handler for `campaign_send` jobs.
pub struct CampaignSendHandler {
    store: Arc<dyn Store>,
    send: Arc<SendService>,
}

impl CampaignSendHandler {
    /// Create the handler.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, send: Arc<SendService>) -> Self {
        Self { store, send }
    }
}

fn store_error(e: StoreError) -> HandlerError {
    match e {
        StoreError::NotFound(_) | StoreError::IllegalTransition(_) => {
            HandlerError::fatal(e.to_string())
        }
        other => HandlerError::retryable(other.to_string()),
    }
}

#[async_trait]
impl JobHandler for CampaignSendHandler {
    fn kind(&self) -> JobKind {
        JobKind::CampaignSend
    }

    #[instrument(skip(self, job), fields(job_id = %job.id))]
    async fn run(&self, job: &Job) -> Result<JobOutcome, HandlerError> {
        let payload: CampaignJobPayload = serde_json::from_value(job.payload.clone())
            .map_err(|e| HandlerError::fatal(format!("malformed campaign_send payload: {e}")))?;
        let tenant = &payload.tenant_id;

        let campaign = self
            .store
            .get_campaign(tenant, &payload.campaign_id)
            .await
            .map_err(store_error)?
            .ok_or_else(|| {
                HandlerError::fatal(format!("campaign not found: {}", payload.campaign_id))
            })?;

        if !campaign.kind.touches_sms() {
            return Err(HandlerError::fatal(format!(
                "campaign {} has no SMS channel",
                campaign.id
            )));
        }
        let content = campaign.sms_content.clone().ok_or_else(|| {
            HandlerError::fatal(format!("campaign {} has no SMS content", campaign.id))
        })?;

        let recipients = self
            .store
            .list_campaign_recipients(
                tenant,
                campaign.kind,
                &campaign.target_location_ids,
                &campaign.target_tags,
            )
            .await
            .map_err(store_error)?;

        let total = i64::try_from(recipients.len()).unwrap_or(i64::MAX);
        self.store
            .mark_campaign_sending(tenant, &campaign.id, total, Utc::now())
            .await
            .map_err(store_error)?;

        info!(
            campaign = %campaign.id,
            recipients = recipients.len(),
            "expanding campaign"
        );

        for contact in &recipients {
            let request = SmsSendRequest {
                contact_id: contact.id.clone(),
                location_id: None,
                content: content.clone(),
                campaign_id: Some(campaign.id.clone()),
            };
            match self.send.send_sms(tenant, request).await {
                Ok(SendOutcome::Blocked { reasons }) => {
                    // The recipient query already filtered consent and
                    // opt-outs; a block here is a cross-cutting rule such
                    // as the daily limit or the global list.
                    warn!(
                        campaign = %campaign.id,
                        contact = %contact.id,
                        ?reasons,
                        "campaign recipient blocked, skipping"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(
                        campaign = %campaign.id,
                        contact = %contact.id,
                        error = %e,
                        "failed to enqueue campaign recipient, skipping"
                    );
                }
            }
        }

        self.store
            .mark_campaign_sent(tenant, &campaign.id, Utc::now())
            .await
            .map_err(store_error)?;

        Ok(JobOutcome::Completed)
    }
}
