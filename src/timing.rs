//! Tick and timeout configuration
//!
//! The scheduler ticks every `monitoring-ticker` seconds. Tenant pulls and
//! token refreshes run on their own, longer periods. Peer heartbeats time out
//! after four ticks.

use std::time::{Duration, Instant};

use fleet_settings::Settings;

use crate::arbitration::heartbeat_timeout;

/// Scheduler periods, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickConfig {
    /// Main loop period (default: 2)
    pub tick_seconds: u64,

    /// Tenant pull period (default: 60)
    pub git_pull_seconds: u64,

    /// OAuth token refresh period (default: 86400)
    pub token_refresh_seconds: u64,
}

impl Default for TickConfig {
    fn default() -> Self {
        Self {
            tick_seconds: 2,
            git_pull_seconds: 60,
            token_refresh_seconds: 86400,
        }
    }
}

impl TickConfig {
    /// Read the periods from the global settings.
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            tick_seconds: settings.monitoring_ticker(),
            git_pull_seconds: settings.git_monitoring_ticker(),
            token_refresh_seconds: settings.token_refresh_seconds(),
        }
    }

    pub fn validate(&self) -> Result<(), TickValidationError> {
        // tick_seconds must be in (0, 3600]
        if self.tick_seconds == 0 || self.tick_seconds > 3600 {
            return Err(TickValidationError::TickOutOfBounds {
                value: self.tick_seconds,
            });
        }

        if self.git_pull_seconds < self.tick_seconds {
            return Err(TickValidationError::GitPullOutOfBounds {
                value: self.git_pull_seconds,
                min: self.tick_seconds,
            });
        }

        if self.token_refresh_seconds < 60 {
            return Err(TickValidationError::RefreshOutOfBounds {
                value: self.token_refresh_seconds,
            });
        }

        Ok(())
    }

    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_seconds)
    }

    /// Time allowed for one peer heartbeat.
    pub fn heartbeat_timeout(&self) -> Duration {
        heartbeat_timeout(self.tick_seconds)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TickValidationError {
    #[error("monitoring-ticker must be in (0, 3600], got {value}")]
    TickOutOfBounds { value: u64 },

    #[error("git-monitoring-ticker must be at least {min}, got {value}")]
    GitPullOutOfBounds { value: u64, min: u64 },

    #[error("git-token-refresh-seconds must be at least 60, got {value}")]
    RefreshOutOfBounds { value: u64 },
}

/// A fixed period measured from a start instant.
///
/// The first run is due one full period after `start`, not immediately.
#[derive(Debug, Clone, Copy)]
pub struct Interval {
    period: Duration,
    last: Instant,
}

impl Interval {
    pub fn new(period: Duration, start: Instant) -> Self {
        Self { period, last: start }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn is_due(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last) >= self.period
    }

    /// Mark a run at `now`. Returns whether it was due.
    pub fn mark(&mut self, now: Instant) -> bool {
        let due = self.is_due(now);
        self.last = now;
        due
    }

    /// Time left before the next run is due.
    pub fn remaining(&self, now: Instant) -> Duration {
        self.period
            .saturating_sub(now.saturating_duration_since(self.last))
    }
}
