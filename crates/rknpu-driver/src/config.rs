//! Driver configuration.
//!
//! Every tunable has a documented default. Builders override individual
//! values; [`DriverConfig::from_env`] applies the environment overrides
//! listed below on top of the defaults.
//!
//! | Variable | Field |
//! |----------|-------|
//! | `RKNPU_POWER_PUT_DELAY_MS` | `power_put_delay` |
//! | `RKNPU_MAX_FREQ_MHZ` | `max_freq_hz` |
//! | `RKNPU_BYPASS_SOFT_RESET` | `bypass_soft_reset` |
//! | `RKNPU_ALLOW_UNSAFE_NO_POWER_DOMAINS` | `allow_unsafe_no_power_domains` |

use std::time::Duration;

use rknpu_chip::opp::{DEFAULT_MAX_FREQ_HZ, MHZ};
use tracing::warn;

use crate::devfreq::Governor;

/// Runtime configuration for an [`NpuDevice`](crate::NpuDevice).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverConfig {
    /// Delay before powering off after the last reference is dropped.
    /// Zero powers off immediately. Default 500 ms.
    pub power_put_delay: Duration,
    /// Safety ceiling for every frequency request. Default 1000 MHz.
    pub max_freq_hz: u64,
    /// Skip hardware soft resets. Default `false`.
    pub bypass_soft_reset: bool,
    /// Accept submissions on platforms without power domains while address
    /// translation is disabled. Default `false`.
    pub allow_unsafe_no_power_domains: bool,
    /// Governor sampling period. Default 50 ms.
    pub devfreq_polling: Duration,
    /// Per-core load window length. Default 1 s.
    pub load_interval: Duration,
    /// Frequency policy. Default simple-ondemand 70/20.
    pub governor: Governor,
    /// Bounded waits before a blocking submission gives up. Default 3.
    pub wait_retries: u32,
    /// Settle time before an aborted job's slots are cleared. Default 100 ms.
    pub abort_settle: Duration,
    /// How long a reset waits for running slots to clear. Default 100 ms.
    pub reset_drain_timeout: Duration,
    /// Delay after asserting and after deasserting reset lines. Default 10 µs.
    pub reset_settle: Duration,
    /// Poll period while waiting for address translation to go idle on
    /// power-off. Default 1 ms.
    pub mmu_disable_poll_period: Duration,
    /// Give-up time for that poll. Default 20 ms.
    pub mmu_disable_poll_timeout: Duration,
    /// Start the background governor thread. Default `true`.
    pub devfreq_monitor: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            power_put_delay: Duration::from_millis(500),
            max_freq_hz: DEFAULT_MAX_FREQ_HZ,
            bypass_soft_reset: false,
            allow_unsafe_no_power_domains: false,
            devfreq_polling: Duration::from_millis(50),
            load_interval: Duration::from_secs(1),
            governor: Governor::default(),
            wait_retries: 3,
            abort_settle: Duration::from_millis(100),
            reset_drain_timeout: Duration::from_millis(100),
            reset_settle: Duration::from_micros(10),
            mmu_disable_poll_period: Duration::from_millis(1),
            mmu_disable_poll_timeout: Duration::from_millis(20),
            devfreq_monitor: true,
        }
    }
}

impl DriverConfig {
    /// Defaults with environment overrides applied.
    ///
    /// Unparseable values are logged and ignored.
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup.
    #[must_use]
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(ms) = parse_var::<u64>(&lookup, "RKNPU_POWER_PUT_DELAY_MS") {
            self.power_put_delay = Duration::from_millis(ms);
        }
        if let Some(mhz) = parse_var::<u64>(&lookup, "RKNPU_MAX_FREQ_MHZ") {
            self.max_freq_hz = mhz * MHZ;
        }
        if let Some(b) = parse_flag(&lookup, "RKNPU_BYPASS_SOFT_RESET") {
            self.bypass_soft_reset = b;
        }
        if let Some(b) = parse_flag(&lookup, "RKNPU_ALLOW_UNSAFE_NO_POWER_DOMAINS") {
            self.allow_unsafe_no_power_domains = b;
        }
        self
    }

    /// Set the power-off debounce delay.
    #[must_use]
    pub const fn with_power_put_delay(mut self, delay: Duration) -> Self {
        self.power_put_delay = delay;
        self
    }

    /// Set the frequency ceiling in Hz.
    #[must_use]
    pub const fn with_max_freq_hz(mut self, hz: u64) -> Self {
        self.max_freq_hz = hz;
        self
    }

    /// Enable or disable soft-reset bypass.
    #[must_use]
    pub const fn with_bypass_soft_reset(mut self, bypass: bool) -> Self {
        self.bypass_soft_reset = bypass;
        self
    }

    /// Allow submissions on platforms with no power domains.
    #[must_use]
    pub const fn with_allow_unsafe_no_power_domains(mut self, allow: bool) -> Self {
        self.allow_unsafe_no_power_domains = allow;
        self
    }

    /// Set the governor.
    #[must_use]
    pub const fn with_governor(mut self, governor: Governor) -> Self {
        self.governor = governor;
        self
    }

    /// Set the governor sampling period.
    #[must_use]
    pub const fn with_devfreq_polling(mut self, period: Duration) -> Self {
        self.devfreq_polling = period;
        self
    }

    /// Set the per-core load window.
    #[must_use]
    pub const fn with_load_interval(mut self, interval: Duration) -> Self {
        self.load_interval = interval;
        self
    }

    /// Enable or disable the background governor thread.
    #[must_use]
    pub const fn with_devfreq_monitor(mut self, enabled: bool) -> Self {
        self.devfreq_monitor = enabled;
        self
    }

    /// Set the abort settle time.
    #[must_use]
    pub const fn with_abort_settle(mut self, settle: Duration) -> Self {
        self.abort_settle = settle;
        self
    }

    /// Set the number of bounded waits per blocking submission.
    #[must_use]
    pub const fn with_wait_retries(mut self, retries: u32) -> Self {
        self.wait_retries = retries;
        self
    }

    /// Set the reset drain timeout.
    #[must_use]
    pub const fn with_reset_drain_timeout(mut self, timeout: Duration) -> Self {
        self.reset_drain_timeout = timeout;
        self
    }

    /// Set the address-translation idle poll used on power-off.
    #[must_use]
    pub const fn with_mmu_disable_poll(mut self, period: Duration, timeout: Duration) -> Self {
        self.mmu_disable_poll_period = period;
        self.mmu_disable_poll_timeout = timeout;
        self
    }
}

fn parse_var<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("ignoring {key}={raw:?}: not a number");
            None
        }
    }
}

fn parse_flag(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<bool> {
    let raw = lookup(key)?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "y" | "yes" | "true" | "on" => Some(true),
        "0" | "n" | "no" | "false" | "off" => Some(false),
        _ => {
            warn!("ignoring {key}={raw:?}: not a boolean");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults() {
        let c = DriverConfig::default();
        assert_eq!(c.power_put_delay, Duration::from_millis(500));
        assert_eq!(c.max_freq_hz, 1_000_000_000);
        assert_eq!(c.wait_retries, 3);
        assert_eq!(c.devfreq_polling, Duration::from_millis(50));
        assert_eq!(c.reset_settle, Duration::from_micros(10));
        assert!(!c.bypass_soft_reset);
        assert!(!c.allow_unsafe_no_power_domains);
    }

    #[test]
    fn env_overrides_apply() {
        let c = DriverConfig::default().with_overrides(env(&[
            ("RKNPU_POWER_PUT_DELAY_MS", "0"),
            ("RKNPU_MAX_FREQ_MHZ", "800"),
            ("RKNPU_BYPASS_SOFT_RESET", "1"),
            ("RKNPU_ALLOW_UNSAFE_NO_POWER_DOMAINS", "yes"),
        ]));
        assert_eq!(c.power_put_delay, Duration::ZERO);
        assert_eq!(c.max_freq_hz, 800 * MHZ);
        assert!(c.bypass_soft_reset);
        assert!(c.allow_unsafe_no_power_domains);
    }

    #[test]
    fn garbage_env_is_ignored() {
        let c = DriverConfig::default().with_overrides(env(&[
            ("RKNPU_MAX_FREQ_MHZ", "fast"),
            ("RKNPU_BYPASS_SOFT_RESET", "maybe"),
        ]));
        assert_eq!(c, DriverConfig::default());
    }
}
