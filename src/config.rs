/// Environment variable overriding [`RuntimeConfig::unhandled_rejection_delay`].
pub const ENV_UNHANDLED_REJECTION_DELAY: &str = "THENABLE_UNHANDLED_REJECTION_DELAY";

/// Environment variable selecting the clock (`system` or `manual`).
pub const ENV_CLOCK: &str = "THENABLE_CLOCK";

/// Default delay (ms) before an unobserved rejection is reported. Zero
/// means "as soon as the current batch of queued tasks has drained".
pub const DEFAULT_UNHANDLED_REJECTION_DELAY: i64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClockMode {
    /// Wall-clock time; idle waits block the thread.
    #[default]
    System,
    /// Virtual time that only moves through [`crate::scheduler::advance`].
    Manual,
}

/// Per-event-loop settings. Installed with [`crate::scheduler::install`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Milliseconds to wait before reporting an unhandled rejection.
    /// A negative value disables reporting altogether.
    pub unhandled_rejection_delay: i64,
    pub clock: ClockMode,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            unhandled_rejection_delay: DEFAULT_UNHANDLED_REJECTION_DELAY,
            clock: ClockMode::System,
        }
    }
}

impl RuntimeConfig {
    /// Virtual clock, default delay. What deterministic tests want.
    pub fn manual() -> Self {
        RuntimeConfig {
            clock: ClockMode::Manual,
            ..Self::default()
        }
    }

    pub fn with_unhandled_rejection_delay(mut self, ms: i64) -> Self {
        self.unhandled_rejection_delay = ms;
        self
    }

    pub fn with_clock(mut self, clock: ClockMode) -> Self {
        self.clock = clock;
        self
    }

    /// Defaults overridden by `THENABLE_UNHANDLED_REJECTION_DELAY` and
    /// `THENABLE_CLOCK`. Unparsable values are ignored with a warning.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(raw) = lookup(ENV_UNHANDLED_REJECTION_DELAY) {
            match raw.trim().parse::<i64>() {
                Ok(ms) => config.unhandled_rejection_delay = ms,
                Err(e) => log::warn!("ignoring {ENV_UNHANDLED_REJECTION_DELAY}={raw:?}: {e}"),
            }
        }
        if let Some(raw) = lookup(ENV_CLOCK) {
            match raw.trim().to_ascii_lowercase().as_str() {
                "system" => config.clock = ClockMode::System,
                "manual" => config.clock = ClockMode::Manual,
                other => log::warn!("ignoring {ENV_CLOCK}={other:?}: expected `system` or `manual`"),
            }
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_overrides_defaults() {
        let config = RuntimeConfig::from_lookup(|key| match key {
            ENV_UNHANDLED_REJECTION_DELAY => Some("-1".to_string()),
            ENV_CLOCK => Some("Manual".to_string()),
            _ => None,
        });
        assert_eq!(config.unhandled_rejection_delay, -1);
        assert_eq!(config.clock, ClockMode::Manual);
    }

    #[test]
    fn bad_env_values_keep_defaults() {
        let config = RuntimeConfig::from_lookup(|key| match key {
            ENV_UNHANDLED_REJECTION_DELAY => Some("soon".to_string()),
            ENV_CLOCK => Some("sundial".to_string()),
            _ => None,
        });
        assert_eq!(config, RuntimeConfig::default());
    }
}
