//! Accept-time entry point for single sends.
//!
//! The gate runs once here to decide whether to enqueue at all; the worker
//! runs it a second time at dispatch, because recipient state can change
//! between the two (an opt-out lands, the clock crosses into quiet hours,
//! the daily budget fills up).

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use leafline_compliance::{ComplianceGate, GateDecision, scan_content};
use leafline_core::{CampaignId, Channel, ContactId, JobId, LocationId, TenantId};
use leafline_queue::{JobKind, JobOptions, Queue};

use crate::error::PipelineError;
use crate::payload::SmsJobPayload;

/// A single-send request, as accepted from the API or the campaign
/// expander.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmsSendRequest {
    /// Recipient contact.
    pub contact_id: ContactId,

    /// Explicit sending location override.
    #[serde(default)]
    pub location_id: Option<LocationId>,

    /// Message body.
    pub content: String,

    /// Campaign reference carried through to the message row.
    #[serde(default)]
    pub campaign_id: Option<CampaignId>,
}

/// What became of an accepted send request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum SendOutcome {
    /// Enqueued for immediate dispatch.
    Queued {
        /// The delivery job id.
        job_id: JobId,
    },
    /// Enqueued with a delay; the recipient is inside quiet hours.
    Deferred {
        /// The delivery job id.
        job_id: JobId,
        /// When the job becomes dispatchable.
        until: DateTime<Utc>,
    },
    /// Rejected by the compliance gate. Nothing was enqueued and no
    /// message row exists.
    Blocked {
        /// Every failing reason.
        reasons: Vec<String>,
    },
}

/// Gate-checked producer for SMS delivery jobs.
pub struct SendService {
    gate: Arc<ComplianceGate>,
    queue: Queue,
}

impl SendService {
    /// Create a send service.
    #[must_use]
    pub fn new(gate: Arc<ComplianceGate>, queue: Queue) -> Self {
        Self { gate, queue }
    }

    /// Evaluate the gate and enqueue accordingly: ALLOW enqueues for
    /// immediate dispatch, DEFER enqueues with the quiet-hours delay, BLOCK
    /// enqueues nothing.
    #[instrument(skip(self, tenant, request), fields(tenant = %tenant, contact = %request.contact_id))]
    pub async fn send_sms(
        &self,
        tenant: &TenantId,
        request: SmsSendRequest,
    ) -> Result<SendOutcome, PipelineError> {
        let evaluation = self
            .gate
            .evaluate(tenant, &request.contact_id, Channel::Sms)
            .await?;

        // Advisory content scan; issues are logged, never blocking.
        let state_code = evaluation.location.as_ref().map(|l| l.state_code.clone());
        let scan = scan_content(&request.content, state_code.as_deref());
        if !scan.approved {
            warn!(
                contact = %request.contact_id,
                issues = ?scan.issues,
                "content scan flagged outbound copy"
            );
        }

        match evaluation.decision {
            GateDecision::Block => {
                info!(reasons = ?evaluation.reasons, "send blocked at accept time");
                Ok(SendOutcome::Blocked {
                    reasons: evaluation.reasons,
                })
            }
            GateDecision::Allow => {
                let job_id = self.enqueue(tenant, &request, Duration::ZERO).await?;
                Ok(SendOutcome::Queued { job_id })
            }
            GateDecision::Defer => {
                let until = evaluation
                    .retry_after
                    .unwrap_or_else(|| Utc::now() + chrono::Duration::hours(1));
                let delay = (until - Utc::now())
                    .to_std()
                    .unwrap_or(Duration::from_secs(1));
                let job_id = self.enqueue(tenant, &request, delay).await?;
                info!(%job_id, %until, "send deferred for quiet hours");
                Ok(SendOutcome::Deferred { job_id, until })
            }
        }
    }

    async fn enqueue(
        &self,
        tenant: &TenantId,
        request: &SmsSendRequest,
        delay: Duration,
    ) -> Result<JobId, PipelineError> {
        let payload = SmsJobPayload {
            tenant_id: tenant.clone(),
            contact_id: request.contact_id.clone(),
            location_id: request.location_id.clone(),
            content: request.content.clone(),
            campaign_id: request.campaign_id.clone(),
        };
        let payload = serde_json::to_value(&payload)
            .map_err(|e| PipelineError::Serialization(e.to_string()))?;
        let job_id = self
            .queue
            .enqueue(
                JobKind::SmsSend,
                payload,
                JobOptions::default().with_delay(delay),
            )
            .await?;
        Ok(job_id)
    }
}
