use chrono_tz::Tz;

use crate::quiet_hours::QuietHours;

/// Default opt-out keywords recognized in inbound replies.
#[must_use]
pub fn default_opt_out_keywords() -> Vec<String> {
    ["STOP", "UNSUBSCRIBE", "CANCEL", "END", "QUIT"]
        .into_iter()
        .map(str::to_owned)
        .collect()
}

/// Default opt-in keywords recognized in inbound replies.
#[must_use]
pub fn default_opt_in_keywords() -> Vec<String> {
    ["START", "YES", "SUBSCRIBE", "UNSTOP"]
        .into_iter()
        .map(str::to_owned)
        .collect()
}

/// Resolved compliance policy configuration consumed by the gate.
///
/// The server builds this from its TOML `[compliance]` section; tests build
/// it directly. Keywords are stored uppercased since inbound matching is
/// case-insensitive.
#[derive(Debug, Clone)]
pub struct GateConfig {
    /// Per-recipient local-time window during which SMS is held.
    pub quiet_hours: QuietHours,

    /// Maximum outbound messages per channel per recipient in any trailing
    /// 24-hour window.
    pub max_messages_per_day_per_recipient: u32,

    /// Keywords that trigger an opt-out (matched against the uppercased,
    /// trimmed inbound text).
    pub opt_out_keywords: Vec<String>,

    /// Keywords that trigger an opt-in.
    pub opt_in_keywords: Vec<String>,

    /// Timezone used when neither the contact nor their location carries
    /// one.
    pub default_timezone: Tz,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            quiet_hours: QuietHours::parse("21:00", "08:00")
                .expect("default quiet hours are valid"),
            max_messages_per_day_per_recipient: 3,
            opt_out_keywords: default_opt_out_keywords(),
            opt_in_keywords: default_opt_in_keywords(),
            default_timezone: chrono_tz::America::Los_Angeles,
        }
    }
}

impl GateConfig {
    /// Override the quiet-hours window.
    #[must_use]
    pub fn with_quiet_hours(mut self, quiet_hours: QuietHours) -> Self {
        self.quiet_hours = quiet_hours;
        self
    }

    /// Override the daily per-recipient limit.
    #[must_use]
    pub fn with_max_per_day(mut self, max: u32) -> Self {
        self.max_messages_per_day_per_recipient = max;
        self
    }
}
