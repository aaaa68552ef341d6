//! Song repetition status
//!
//! Pure calculation over a song's usage history. Nothing here reads the clock
//! or any shared state; `now` is always passed in.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use setlist_common::config::AvailabilityConfig;
use setlist_common::models::UsageRecord;
use setlist_common::time::days;

/// Rolling lookback for the frequency rule when no policy overrides it
pub const DEFAULT_LOOKBACK_DAYS: u32 = 90;

/// How freely a song can be scheduled again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Availability {
    Available,
    /// Used often lately, though not within the window
    Caution,
    /// Used within the window
    Recent,
}

impl fmt::Display for Availability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Availability::Available => write!(f, "available"),
            Availability::Caution => write!(f, "caution"),
            Availability::Recent => write!(f, "recent"),
        }
    }
}

/// Availability with the default lookback
pub fn availability(
    history: &[UsageRecord],
    now: DateTime<Utc>,
    window_days: u32,
    frequency_threshold: u32,
) -> Availability {
    AvailabilityPolicy {
        window_days,
        frequency_threshold,
        lookback_days: DEFAULT_LOOKBACK_DAYS,
    }
    .evaluate(history, now)
}

/// Parameters of the repetition rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityPolicy {
    pub window_days: u32,
    /// 0 disables the caution rule
    pub frequency_threshold: u32,
    pub lookback_days: u32,
}

impl Default for AvailabilityPolicy {
    fn default() -> Self {
        Self::from(&AvailabilityConfig::default())
    }
}

impl From<&AvailabilityConfig> for AvailabilityPolicy {
    fn from(config: &AvailabilityConfig) -> Self {
        Self {
            window_days: config.window_days,
            frequency_threshold: config.frequency_threshold,
            lookback_days: config.lookback_days,
        }
    }
}

impl AvailabilityPolicy {
    /// Apply the rule: recent use first, then frequency, else available
    ///
    /// Records dated after `now` count as used within the window.
    pub fn evaluate(&self, history: &[UsageRecord], now: DateTime<Utc>) -> Availability {
        let Some(last_used) = history.iter().map(|r| r.used_at).max() else {
            return Availability::Available;
        };

        if now - last_used < days(self.window_days) {
            return Availability::Recent;
        }

        if self.frequency_threshold > 0 {
            let since = now - days(self.lookback_days);
            let uses = history.iter().filter(|r| r.used_at > since).count();
            if uses >= self.frequency_threshold as usize {
                return Availability::Caution;
            }
        }

        Availability::Available
    }
}
