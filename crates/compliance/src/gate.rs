//! The compliance gate.
//!
//! Every send — at accept time and again inside the delivery worker — goes
//! through [`ComplianceGate::evaluate`]. Seven checks run in fixed order,
//! and all of them run even after one fails, so the caller sees every
//! failing reason at once. The aggregate decision is ALLOW, BLOCK with
//! reasons, or DEFER with the instant at which a retry will pass.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::warn;

use leafline_core::{Channel, Contact, ContactId, Location, TenantId};
use leafline_store::{Store, StoreError};

use crate::config::GateConfig;

/// Check names in evaluation order.
const CHECK_CONSENT: &str = "consent";
const CHECK_OPT_OUT: &str = "opt_out";
const CHECK_AGE: &str = "age_verified";
const CHECK_GLOBAL_OPT_OUT: &str = "global_opt_out";
const CHECK_QUIET_HOURS: &str = "quiet_hours";
const CHECK_RATE_LIMIT: &str = "rate_limit";
const CHECK_STATE_RULES: &str = "state_rules";

/// Minimum age for cannabis marketing recipients.
const MINIMUM_AGE_YEARS: u32 = 21;

/// Aggregate decision for a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateDecision {
    /// Dispatch now.
    Allow,
    /// Never dispatch; `reasons` explain why.
    Block,
    /// Dispatch after `retry_after`.
    Defer,
}

/// One check's result, in evaluation order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    /// Check name.
    pub name: String,
    /// Whether the check passed.
    pub passed: bool,
}

/// Outcome of a gate evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateOutcome {
    /// The aggregate decision.
    pub decision: GateDecision,

    /// Every failing reason, in check order. Empty on ALLOW.
    pub reasons: Vec<String>,

    /// Every check that ran, in order, with its result.
    pub checks: Vec<CheckResult>,

    /// On DEFER, the UTC instant after which a retry will pass the
    /// quiet-hours check.
    pub retry_after: Option<DateTime<Utc>>,

    /// Snapshot of the contact as read during evaluation. Lets the caller
    /// act on exactly the state the decision was made against.
    pub contact: Option<Contact>,

    /// Snapshot of the contact's resolved location, when one exists.
    pub location: Option<Location>,
}

impl GateOutcome {
    fn blocked(reasons: Vec<String>) -> Self {
        Self {
            decision: GateDecision::Block,
            reasons,
            checks: Vec::new(),
            retry_after: None,
            contact: None,
            location: None,
        }
    }
}

/// Hook for jurisdiction-specific rules.
///
/// Evaluated against the contact's location state code. Returning
/// `Some(reason)` fails the `state_rules` check with that reason. No rules
/// ship today; the seam exists so new state requirements land without
/// touching gate callers.
pub trait StateRule: Send + Sync {
    /// Short identifier for logs.
    fn name(&self) -> &str;

    /// Return a violation reason, or `None` when the send is acceptable.
    fn evaluate(&self, state_code: &str, contact: &Contact, channel: Channel) -> Option<String>;
}

/// Clock source used by [`ComplianceGate::evaluate`]. Production uses
/// `Utc::now`; tests inject a controllable instant.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// The policy engine governing every send.
pub struct ComplianceGate {
    store: Arc<dyn Store>,
    config: GateConfig,
    state_rules: Vec<Box<dyn StateRule>>,
    clock: Clock,
}

impl ComplianceGate {
    /// Create a gate over the given store with no state rules registered.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, config: GateConfig) -> Self {
        Self {
            store,
            config,
            state_rules: Vec::new(),
            clock: Arc::new(Utc::now),
        }
    }

    /// Register a jurisdiction rule.
    #[must_use]
    pub fn with_state_rule(mut self, rule: Box<dyn StateRule>) -> Self {
        self.state_rules.push(rule);
        self
    }

    /// Replace the clock source. Test support for quiet-hours and
    /// rate-limit determinism.
    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// Evaluate a prospective send against current state.
    pub async fn evaluate(
        &self,
        tenant: &TenantId,
        contact_id: &ContactId,
        channel: Channel,
    ) -> Result<GateOutcome, StoreError> {
        let now = (self.clock)();
        self.evaluate_at(tenant, contact_id, channel, now).await
    }

    /// Deterministic variant of [`evaluate`](Self::evaluate) with an
    /// explicit clock.
    #[allow(clippy::too_many_lines)]
    pub async fn evaluate_at(
        &self,
        tenant: &TenantId,
        contact_id: &ContactId,
        channel: Channel,
        now: DateTime<Utc>,
    ) -> Result<GateOutcome, StoreError> {
        let Some(contact) = self.store.get_contact(tenant, contact_id).await? else {
            return Ok(GateOutcome::blocked(vec![format!(
                "Contact not found: {contact_id}"
            )]));
        };

        let location = match &contact.primary_location_id {
            Some(id) => self.store.get_location(tenant, id).await?,
            None => None,
        };

        let mut reasons: Vec<String> = Vec::new();
        let mut checks: Vec<CheckResult> = Vec::new();
        let mut retry_after: Option<DateTime<Utc>> = None;

        let mut record = |name: &str, failures: Vec<String>, reasons: &mut Vec<String>| {
            let passed = failures.is_empty();
            reasons.extend(failures);
            checks.push(CheckResult {
                name: name.to_owned(),
                passed,
            });
        };

        // 1. Consent. Missing flag and missing timestamp are separate
        //    reasons so data problems are distinguishable from a plain "no".
        let mut failures = Vec::new();
        match channel {
            Channel::Sms => {
                if !contact.sms_consent {
                    failures.push("No SMS consent on file".to_owned());
                }
                if contact.sms_consent_at.is_none() {
                    failures.push("SMS consent timestamp missing".to_owned());
                }
            }
            Channel::Email => {
                if !contact.email_consent {
                    failures.push("No email consent on file".to_owned());
                }
            }
        }
        record(CHECK_CONSENT, failures, &mut reasons);

        // 2. Contact-level opt-out. Email has no opt-out flag today; the
        //    check passes for that channel.
        let mut failures = Vec::new();
        if channel == Channel::Sms && contact.sms_opted_out {
            failures.push("Contact has opted out of SMS".to_owned());
        }
        record(CHECK_OPT_OUT, failures, &mut reasons);

        // 3. Age verification, plus a hard date-of-birth check when one is
        //    on file.
        let mut failures = Vec::new();
        if !contact.age_verified {
            failures.push("Age not verified".to_owned());
        }
        if let Some(dob) = contact.date_of_birth {
            let age = now.date_naive().years_since(dob).unwrap_or(0);
            if age < MINIMUM_AGE_YEARS {
                failures.push("Contact is under 21".to_owned());
            }
        }
        record(CHECK_AGE, failures, &mut reasons);

        // 4. Global opt-out (SMS only) — spans all tenants.
        let mut failures = Vec::new();
        if channel == Channel::Sms
            && self.store.get_global_opt_out(&contact.phone).await?.is_some()
        {
            failures.push("Phone number is on the global opt-out list".to_owned());
        }
        record(CHECK_GLOBAL_OPT_OUT, failures, &mut reasons);

        // 5. Quiet hours (SMS only). On failure, compute the instant at
        //    which a deferred retry will pass.
        let mut failures = Vec::new();
        if channel == Channel::Sms {
            let tz = self.resolve_timezone(&contact, location.as_ref());
            if self.config.quiet_hours.is_in_window(tz, now) {
                let until = self.config.quiet_hours.window_end_after(tz, now);
                retry_after = Some(until);
                failures.push(format!(
                    "Inside quiet hours window for {tz} until {until}"
                ));
            }
        }
        record(CHECK_QUIET_HOURS, failures, &mut reasons);

        // 6. Per-recipient rate limit over the trailing 24 hours.
        let mut failures = Vec::new();
        let sent_today = self
            .store
            .count_outbound_since(tenant, contact_id, channel, now - Duration::hours(24))
            .await?;
        let max = u64::from(self.config.max_messages_per_day_per_recipient);
        if sent_today >= max {
            failures.push(format!(
                "Daily message limit reached ({sent_today}/{max} in the last 24h)"
            ));
        }
        record(CHECK_RATE_LIMIT, failures, &mut reasons);

        // 7. Jurisdiction rules, keyed on the location's state.
        let mut failures = Vec::new();
        if let Some(loc) = &location {
            for rule in &self.state_rules {
                if let Some(reason) = rule.evaluate(&loc.state_code, &contact, channel) {
                    failures.push(reason);
                }
            }
        }
        record(CHECK_STATE_RULES, failures, &mut reasons);

        // Aggregate: DEFER only when quiet hours is the sole failure and a
        // retry instant was computed; any other failure is a BLOCK.
        let failing: Vec<&str> = checks
            .iter()
            .filter(|c| !c.passed)
            .map(|c| c.name.as_str())
            .collect();
        let decision = if failing.is_empty() {
            GateDecision::Allow
        } else if failing == [CHECK_QUIET_HOURS] && retry_after.is_some() {
            GateDecision::Defer
        } else {
            GateDecision::Block
        };

        Ok(GateOutcome {
            decision,
            reasons,
            checks,
            retry_after: if decision == GateDecision::Defer {
                retry_after
            } else {
                None
            },
            contact: Some(contact),
            location,
        })
    }

    /// Resolve the recipient timezone: contact override, then location,
    /// then the configured default. Unparseable zones fall back to the
    /// default with a warning.
    fn resolve_timezone(&self, contact: &Contact, location: Option<&Location>) -> Tz {
        let named = contact
            .timezone
            .as_deref()
            .or(location.map(|l| l.timezone.as_str()));
        match named {
            Some(name) => name.parse().unwrap_or_else(|_| {
                warn!(timezone = %name, contact = %contact.id, "unknown timezone, using default");
                self.config.default_timezone
            }),
            None => self.config.default_timezone,
        }
    }
}
