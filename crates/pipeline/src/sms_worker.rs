//! The SMS delivery worker body.
//!
//! Runs the compliance gate a second time at dispatch — the recipient may
//! have opted out, crossed into quiet hours, or exhausted the daily budget
//! since the job was enqueued. A dispatch-time block is a terminal business
//! outcome (the queue finalizes the job successfully); a dispatch-time
//! deferral re-parks the job; only provider failures propagate as errors so
//! the queue retries.
//!
//! Dispatch is idempotent across retries: the message row is keyed by the
//! job id (`client_ref`), so a retried job finds and reuses its row instead
//! of inserting a duplicate.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, instrument, warn};

use leafline_compliance::{ComplianceGate, GateDecision, GateOutcome, scan_content};
use leafline_core::{Channel, CounterField, Message, MessageStatus, TenantId};
use leafline_provider::{SmsFrom, SmsProvider};
use leafline_queue::{HandlerError, Job, JobHandler, JobKind, JobOutcome};
use leafline_store::Store;

use crate::payload::SmsJobPayload;

/// Handler for `sms_send` jobs.
pub struct SmsSendHandler {
    store: Arc<dyn Store>,
    gate: Arc<ComplianceGate>,
    provider: Arc<dyn SmsProvider>,
    default_messaging_profile: Option<String>,
}

impl SmsSendHandler {
    /// Create the handler. `default_messaging_profile` is the carrier
    /// profile used when a location has no dedicated sending number.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        gate: Arc<ComplianceGate>,
        provider: Arc<dyn SmsProvider>,
        default_messaging_profile: Option<String>,
    ) -> Self {
        Self {
            store,
            gate,
            provider,
            default_messaging_profile,
        }
    }

    /// Resolve the sender identity: an explicit location from the payload
    /// wins, then the contact's primary location; the location's dedicated
    /// number wins over the default messaging profile.
    async fn resolve_from(
        &self,
        tenant: &TenantId,
        payload: &SmsJobPayload,
        evaluation: &GateOutcome,
    ) -> Result<SmsFrom, HandlerError> {
        let location = match &payload.location_id {
            Some(id) => self
                .store
                .get_location(tenant, id)
                .await
                .map_err(|e| HandlerError::retryable(e.to_string()))?,
            None => evaluation.location.clone(),
        };

        location
            .and_then(|l| l.sms_phone_number)
            .map(SmsFrom::Number)
            .or_else(|| {
                self.default_messaging_profile
                    .clone()
                    .map(SmsFrom::MessagingProfile)
            })
            .ok_or_else(|| {
                HandlerError::fatal("no sending number assigned and no messaging profile configured")
            })
    }

    async fn dispatch(
        &self,
        job: &Job,
        payload: &SmsJobPayload,
        evaluation: GateOutcome,
    ) -> Result<JobOutcome, HandlerError> {
        let tenant = &payload.tenant_id;
        let Some(contact) = evaluation.contact.clone() else {
            return Err(HandlerError::fatal("gate allowed without a contact snapshot"));
        };

        let from = self.resolve_from(tenant, payload, &evaluation).await?;
        let from_address = match &from {
            SmsFrom::Number(number) => number.clone(),
            SmsFrom::MessagingProfile(id) => id.clone(),
        };

        let state_code = evaluation.location.as_ref().map(|l| l.state_code.clone());
        let scan = scan_content(&payload.content, state_code.as_deref());
        if !scan.approved {
            warn!(job_id = %job.id, issues = ?scan.issues, "content scan flagged copy at dispatch");
        }

        // Find-or-insert keyed on the job id: a retried job reuses the row
        // written by its previous attempt.
        let existing = self
            .store
            .find_message_by_client_ref(tenant, &job.id)
            .await
            .map_err(|e| HandlerError::retryable(e.to_string()))?;
        let message = match existing {
            // At-least-once delivery can rerun a job whose previous
            // invocation crashed after the carrier accepted the message.
            // The recorded provider id proves the send happened.
            Some(message)
                if message.status == MessageStatus::Sent
                    && message.provider_message_id.is_some() =>
            {
                debug!(job_id = %job.id, "message already dispatched, skipping");
                return Ok(JobOutcome::Completed);
            }
            Some(message) => message,
            None => {
                let now = Utc::now();
                let mut message = Message::outbound(
                    tenant.clone(),
                    Some(contact.id.clone()),
                    contact.phone.clone(),
                    from_address,
                    payload.content.clone(),
                    now,
                )
                .with_client_ref(job.id.clone());
                if let Some(campaign) = &payload.campaign_id {
                    message = message.with_campaign(campaign.clone());
                }
                self.store
                    .insert_message(tenant, &message)
                    .await
                    .map_err(|e| HandlerError::retryable(e.to_string()))?;
                message
            }
        };

        match self
            .provider
            .send(&message.to_address, &from, &message.content)
            .await
        {
            Ok(receipt) => {
                let segments = i32::try_from(receipt.segments).unwrap_or(i32::MAX);
                self.store
                    .mark_message_dispatched(
                        tenant,
                        &message.id,
                        &receipt.provider_id,
                        segments,
                        Utc::now(),
                    )
                    .await
                    .map_err(|e| HandlerError::retryable(e.to_string()))?;
                debug!(job_id = %job.id, provider_id = %receipt.provider_id, "SMS dispatched");
                Ok(JobOutcome::Completed)
            }
            Err(e) => {
                // Record the carrier's text on the row, then let the error
                // propagate so the queue retries. After the attempt budget
                // is exhausted the row stays failed.
                let text = e.to_string();
                if let Err(store_err) = self
                    .store
                    .mark_message_failed(tenant, &message.id, &text, Utc::now())
                    .await
                {
                    warn!(job_id = %job.id, error = %store_err, "failed to record dispatch failure");
                }
                // A campaign send that just burned its last attempt will
                // never produce a carrier callback (there is no provider
                // id), so its failure is counted here.
                if job.attempt + 1 >= job.opts.attempts_max
                    && let Some(campaign) = &payload.campaign_id
                    && let Err(counter_err) = self
                        .store
                        .increment_campaign_counter(tenant, campaign, CounterField::Failed)
                        .await
                {
                    warn!(job_id = %job.id, error = %counter_err, "failed to advance failed counter");
                }
                Err(HandlerError::retryable(text))
            }
        }
    }
}

#[async_trait]
impl JobHandler for SmsSendHandler {
    fn kind(&self) -> JobKind {
        JobKind::SmsSend
    }

    #[instrument(skip(self, job), fields(job_id = %job.id))]
    async fn run(&self, job: &Job) -> Result<JobOutcome, HandlerError> {
        let payload: SmsJobPayload = serde_json::from_value(job.payload.clone())
            .map_err(|e| HandlerError::fatal(format!("malformed sms_send payload: {e}")))?;

        // Second gate evaluation: dispatch-time truth.
        let evaluation = self
            .gate
            .evaluate(&payload.tenant_id, &payload.contact_id, Channel::Sms)
            .await
            .map_err(|e| HandlerError::retryable(e.to_string()))?;

        match evaluation.decision {
            GateDecision::Block => {
                // A campaign recipient blocked at dispatch (typically an
                // opt-out that landed after enqueue) advances the campaign's
                // opted-out counter so the totals still reconcile.
                if let Some(campaign) = &payload.campaign_id
                    && let Err(e) = self
                        .store
                        .increment_campaign_counter(
                            &payload.tenant_id,
                            campaign,
                            CounterField::OptedOut,
                        )
                        .await
                {
                    warn!(job_id = %job.id, error = %e, "failed to advance opted-out counter");
                }
                Ok(JobOutcome::Blocked {
                    reasons: evaluation.reasons,
                })
            }
            GateDecision::Defer => {
                let until = evaluation
                    .retry_after
                    .unwrap_or_else(|| Utc::now() + chrono::Duration::hours(1));
                let delay = (until - Utc::now())
                    .to_std()
                    .unwrap_or(Duration::from_secs(1));
                debug!(job_id = %job.id, %until, "dispatch deferred for quiet hours");
                Ok(JobOutcome::Rescheduled { delay })
            }
            GateDecision::Allow => self.dispatch(job, &payload, evaluation).await,
        }
    }
}
