//! Session configuration.
//!
//! All timings are plain `Duration`s so tests can shrink them with
//! [`SessionConfig::for_testing`] and run under paused tokio time.

use std::time::Duration;

/// Autosave timing.
#[derive(Debug, Clone)]
pub struct AutosaveConfig {
    /// Quiet period after the last local edit before a push.
    pub debounce: Duration,
    /// Upper bound between successful saves while edits keep arriving.
    pub max_interval: Duration,
    /// First retry delay after a transient failure.
    pub retry_base: Duration,
    /// Retry delay cap.
    pub retry_max: Duration,
}

impl Default for AutosaveConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(2),
            max_interval: Duration::from_secs(5),
            retry_base: Duration::from_secs(1),
            retry_max: Duration::from_secs(30),
        }
    }
}

impl AutosaveConfig {
    /// Exponential backoff for the `attempt`-th consecutive failure (1-based):
    /// base, 2×base, 4×base, … capped at `retry_max`.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.retry_base
            .saturating_mul(1u32 << exponent)
            .min(self.retry_max)
    }
}

/// Presence timing.
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// Re-publish interval while the document has focus.
    pub heartbeat_interval: Duration,
    /// Records older than this are ignored even if never deleted.
    pub stale_after: Duration,
    /// How often the collaborator list is re-filtered for staleness.
    pub sweep_interval: Duration,
    /// Publish the local record as soon as the session opens.
    pub start_focused: bool,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            stale_after: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
            start_focused: true,
        }
    }
}

/// Per-session configuration.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub autosave: AutosaveConfig,
    pub presence: PresenceConfig,
}

impl SessionConfig {
    /// Short timings for tests (millisecond scale).
    pub fn for_testing() -> Self {
        Self {
            autosave: AutosaveConfig {
                debounce: Duration::from_millis(200),
                max_interval: Duration::from_millis(500),
                retry_base: Duration::from_millis(100),
                retry_max: Duration::from_millis(800),
            },
            presence: PresenceConfig {
                heartbeat_interval: Duration::from_millis(100),
                stale_after: Duration::from_millis(300),
                sweep_interval: Duration::from_millis(50),
                start_focused: true,
            },
        }
    }
}
