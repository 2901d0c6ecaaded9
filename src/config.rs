//! Validated rater configuration.
//!
//! Built with [`RaterConfig::builder`]; every relationship between the fields is checked in
//! `build`, so a `RaterConfig` value is always usable. Hosts loading settings from a file can
//! deserialize [`RaterSettings`] (feature `serde`) and convert it with `try_into`.

use crate::error::ConfigError;
use crate::policy::{GracePolicy, NotifyMode};
use crate::state::WindowPolicy;
use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Shortest window accepted.
pub const MIN_PERIOD: Duration = Duration::from_secs(1);
/// Longest window accepted.
pub const MAX_PERIOD: Duration = Duration::from_secs(86_400 * 365);
/// Windows shorter than this are accepted with a warning.
pub const RECOMMENDED_MIN_PERIOD: Duration = Duration::from_secs(3);

/// Immutable limiter configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RaterConfig {
    period: Duration,
    after_handle_count: u32,
    warnings_count: u32,
    window: WindowPolicy,
    notify: NotifyMode,
    grace: GracePolicy,
    throttle: bool,
    sem_period: Option<Duration>,
}

impl RaterConfig {
    pub fn builder() -> RaterConfigBuilder {
        RaterConfigBuilder::new()
    }

    /// Window length; also the TTL of subject entries.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Calls allowed per window before limiting starts.
    pub fn after_handle_count(&self) -> u32 {
        self.after_handle_count
    }

    /// Cooldown warnings per window.
    pub fn warnings_count(&self) -> u32 {
        self.warnings_count
    }

    pub fn window(&self) -> WindowPolicy {
        self.window
    }

    pub fn debounce(&self) -> bool {
        self.window.is_sliding()
    }

    pub fn notify(&self) -> NotifyMode {
        self.notify
    }

    pub fn grace(&self) -> GracePolicy {
        self.grace
    }

    /// Delay over-limit events on a leaky bucket instead of dropping them.
    pub fn throttle(&self) -> bool {
        self.throttle
    }

    /// Refill window of the per-subject bucket; `Some` exactly when throttling.
    pub fn sem_period(&self) -> Option<Duration> {
        self.sem_period
    }
}

impl Default for RaterConfig {
    fn default() -> Self {
        RaterConfigBuilder::new().resolve()
    }
}

/// Builder for [`RaterConfig`].
#[derive(Debug, Clone)]
pub struct RaterConfigBuilder {
    period: Duration,
    after_handle_count: u32,
    warnings_count: u32,
    window: WindowPolicy,
    notify: NotifyMode,
    grace: GracePolicy,
    throttle: bool,
    sem_period: Option<Duration>,
}

impl RaterConfigBuilder {
    /// Defaults: 3s sliding window, one call, two warnings, cooldown and calmed notices.
    pub fn new() -> Self {
        Self {
            period: RECOMMENDED_MIN_PERIOD,
            after_handle_count: 1,
            warnings_count: 2,
            window: WindowPolicy::Sliding,
            notify: NotifyMode::Both,
            grace: GracePolicy::Counted,
            throttle: false,
            sem_period: None,
        }
    }

    pub fn period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    pub fn period_secs(self, secs: u64) -> Self {
        self.period(Duration::from_secs(secs))
    }

    pub fn after_handle_count(mut self, count: u32) -> Self {
        self.after_handle_count = count;
        self
    }

    pub fn warnings_count(mut self, count: u32) -> Self {
        self.warnings_count = count;
        self
    }

    /// `true` slides the window on every event, `false` keeps it fixed.
    pub fn debounce(mut self, debounce: bool) -> Self {
        self.window = WindowPolicy::from_debounce(debounce);
        self
    }

    pub fn window(mut self, window: WindowPolicy) -> Self {
        self.window = window;
        self
    }

    pub fn notify(mut self, notify: NotifyMode) -> Self {
        self.notify = notify;
        self
    }

    pub fn grace(mut self, grace: GracePolicy) -> Self {
        self.grace = grace;
        self
    }

    pub fn throttle(mut self, throttle: bool) -> Self {
        self.throttle = throttle;
        self
    }

    /// Bucket refill window; only meaningful with `throttle(true)`.
    pub fn sem_period(mut self, sem_period: Duration) -> Self {
        self.sem_period = Some(sem_period);
        self
    }

    /// Validate and build.
    pub fn build(self) -> Result<RaterConfig, ConfigError> {
        if self.period < MIN_PERIOD || self.period > MAX_PERIOD {
            return Err(ConfigError::InvalidPeriod(self.period));
        }
        if self.after_handle_count == 0 {
            return Err(ConfigError::InvalidAfterHandleCount(0));
        }
        if self.notify.is_enabled() && self.warnings_count == 0 {
            return Err(ConfigError::InvalidWarningsCount(0));
        }
        if self.throttle {
            if let Some(sem_period) = self.sem_period {
                if sem_period.is_zero() || sem_period >= self.period {
                    return Err(ConfigError::InvalidSemPeriod { sem_period, period: self.period });
                }
            }
        }
        if self.period < RECOMMENDED_MIN_PERIOD {
            tracing::warn!(
                period = ?self.period,
                "period below 3s; subjects may barely be limited"
            );
        }
        Ok(self.resolve())
    }

    fn resolve(self) -> RaterConfig {
        let sem_period = match (self.throttle, self.sem_period) {
            (true, Some(sem_period)) => Some(sem_period),
            (true, None) => {
                let fallback = self.period - self.period / 90;
                tracing::warn!(
                    sem_period = ?fallback,
                    "throttle sem_period not set; deriving from period"
                );
                Some(fallback)
            }
            (false, Some(_)) => {
                tracing::debug!("sem_period ignored without throttle mode");
                None
            }
            (false, None) => None,
        };
        RaterConfig {
            period: self.period,
            after_handle_count: self.after_handle_count,
            warnings_count: self.warnings_count,
            window: self.window,
            notify: self.notify,
            grace: self.grace,
            throttle: self.throttle,
            sem_period,
        }
    }
}

impl Default for RaterConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Plain, deserializable form of [`RaterConfig`].
///
/// ```
/// # #[cfg(feature = "serde")] {
/// use rater::{RaterConfig, RaterSettings};
/// let settings: RaterSettings =
///     serde_json::from_str(r#"{"period_sec": 8, "after_handle_count": 2, "notify": "cooldown"}"#)
///         .unwrap();
/// let config = RaterConfig::try_from(settings).unwrap();
/// assert_eq!(config.after_handle_count(), 2);
/// # }
/// ```
#[cfg(feature = "serde")]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaterSettings {
    pub period_sec: u64,
    pub after_handle_count: u32,
    pub warnings_count: u32,
    pub debounce: bool,
    pub notify: NotifyMode,
    pub grace: GracePolicy,
    pub throttle: bool,
    pub sem_period_sec: Option<f64>,
}

#[cfg(feature = "serde")]
impl Default for RaterSettings {
    fn default() -> Self {
        Self {
            period_sec: RECOMMENDED_MIN_PERIOD.as_secs(),
            after_handle_count: 1,
            warnings_count: 2,
            debounce: true,
            notify: NotifyMode::Both,
            grace: GracePolicy::Counted,
            throttle: false,
            sem_period_sec: None,
        }
    }
}

#[cfg(feature = "serde")]
impl TryFrom<RaterSettings> for RaterConfig {
    type Error = ConfigError;

    fn try_from(settings: RaterSettings) -> Result<Self, Self::Error> {
        let period = Duration::from_secs(settings.period_sec);
        let mut builder = RaterConfig::builder()
            .period(period)
            .after_handle_count(settings.after_handle_count)
            .warnings_count(settings.warnings_count)
            .debounce(settings.debounce)
            .notify(settings.notify)
            .grace(settings.grace)
            .throttle(settings.throttle);
        if let Some(secs) = settings.sem_period_sec {
            let sem_period = Duration::try_from_secs_f64(secs)
                .map_err(|_| ConfigError::InvalidSemPeriod { sem_period: Duration::ZERO, period })?;
            builder = builder.sem_period(sem_period);
        }
        builder.build()
    }
}
