//! Job configuration.
//!
//! Defaults are the production values; every field can be overridden from
//! `SETTLE_*` environment variables.

use std::time::Duration;

use thiserror::Error;

/// Limits shared by every batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchLimits {
    /// Wall-clock budget of one invocation. Must stay well inside the host's ceiling.
    pub deadline: Duration,
    /// Timeout of each provider call. Strictly shorter than `deadline`.
    pub call_timeout: Duration,
    /// Pause between provider calls within one batch.
    pub inter_call_delay: Duration,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(25),
            call_timeout: Duration::from_secs(8),
            inter_call_delay: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookRetryConfig {
    pub batch_size: usize,
    pub max_attempts: u32,
    /// `PROCESSING` events untouched for this long are considered orphaned.
    pub orphan_threshold: Duration,
    /// Minimum time between two attempts on the same event.
    pub cooldown: Duration,
}

impl Default for WebhookRetryConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            max_attempts: 3,
            orphan_threshold: Duration::from_secs(10 * 60),
            cooldown: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentSyncConfig {
    pub batch_size: usize,
    /// Leave younger orders to the normal confirmation path.
    pub min_age: Duration,
    /// Older orders are left for manual review.
    pub max_age: Duration,
}

impl Default for PaymentSyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            min_age: Duration::from_secs(60 * 60),
            max_age: Duration::from_secs(10 * 24 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundReconcileConfig {
    pub batch_size: usize,
    /// Minimum age of the last submission before an in-flight refund is polled.
    pub in_flight_cooldown: Duration,
    /// Age after which an unsubmitted refund decision is a phantom.
    pub staleness_threshold: Duration,
}

impl Default for RefundReconcileConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            in_flight_cooldown: Duration::from_secs(30 * 60),
            staleness_threshold: Duration::from_secs(24 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SideEffectRetryConfig {
    pub batch_size: usize,
    pub max_attempts: u32,
}

impl Default for SideEffectRetryConfig {
    fn default() -> Self {
        Self {
            batch_size: 25,
            max_attempts: 3,
        }
    }
}

/// Complete configuration of the reconciliation jobs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileConfig {
    pub limits: BatchLimits,
    pub webhooks: WebhookRetryConfig,
    pub payments: PaymentSyncConfig,
    pub refunds: RefundReconcileConfig,
    pub side_effects: SideEffectRetryConfig,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name}: cannot parse {value:?} as {expected}")]
    Parse {
        name: String,
        value: String,
        expected: &'static str,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl ReconcileConfig {
    /// Defaults overridden by the process environment, then validated.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overridden by `lookup`, then validated.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };
        let mut cfg = Self::default();

        env.secs("SETTLE_DEADLINE_SECS", &mut cfg.limits.deadline)?;
        env.secs("SETTLE_CALL_TIMEOUT_SECS", &mut cfg.limits.call_timeout)?;
        env.millis("SETTLE_INTER_CALL_DELAY_MS", &mut cfg.limits.inter_call_delay)?;

        env.number("SETTLE_WEBHOOK_BATCH_SIZE", &mut cfg.webhooks.batch_size)?;
        env.number("SETTLE_WEBHOOK_MAX_ATTEMPTS", &mut cfg.webhooks.max_attempts)?;
        env.secs("SETTLE_WEBHOOK_ORPHAN_SECS", &mut cfg.webhooks.orphan_threshold)?;
        env.secs("SETTLE_WEBHOOK_COOLDOWN_SECS", &mut cfg.webhooks.cooldown)?;

        env.number("SETTLE_PAYMENT_BATCH_SIZE", &mut cfg.payments.batch_size)?;
        env.secs("SETTLE_PAYMENT_MIN_AGE_SECS", &mut cfg.payments.min_age)?;
        env.secs("SETTLE_PAYMENT_MAX_AGE_SECS", &mut cfg.payments.max_age)?;

        env.number("SETTLE_REFUND_BATCH_SIZE", &mut cfg.refunds.batch_size)?;
        env.secs("SETTLE_REFUND_COOLDOWN_SECS", &mut cfg.refunds.in_flight_cooldown)?;
        env.secs("SETTLE_REFUND_STALE_SECS", &mut cfg.refunds.staleness_threshold)?;

        env.number("SETTLE_SIDE_EFFECT_BATCH_SIZE", &mut cfg.side_effects.batch_size)?;
        env.number("SETTLE_SIDE_EFFECT_MAX_ATTEMPTS", &mut cfg.side_effects.max_attempts)?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.limits.deadline.is_zero() {
            return invalid("deadline must be positive");
        }
        if self.limits.call_timeout.is_zero() || self.limits.call_timeout >= self.limits.deadline {
            return invalid("call timeout must be positive and shorter than the batch deadline");
        }
        if self.webhooks.batch_size == 0
            || self.payments.batch_size == 0
            || self.refunds.batch_size == 0
            || self.side_effects.batch_size == 0
        {
            return invalid("batch sizes must be positive");
        }
        if self.webhooks.max_attempts == 0 || self.side_effects.max_attempts == 0 {
            return invalid("max attempts must be positive");
        }
        if self.payments.min_age >= self.payments.max_age {
            return invalid("payment min age must be shorter than max age");
        }
        if self.refunds.staleness_threshold <= self.refunds.in_flight_cooldown {
            return invalid("refund staleness threshold must exceed the in-flight cooldown");
        }
        Ok(())
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw<T: std::str::FromStr>(&self, name: &str, expected: &'static str) -> Result<Option<T>, ConfigError> {
        let Some(value) = (self.lookup)(name) else {
            return Ok(None);
        };
        value.trim().parse::<T>().map(Some).map_err(|_| ConfigError::Parse {
            name: name.to_string(),
            value,
            expected,
        })
    }

    fn number<T: std::str::FromStr>(&self, name: &str, target: &mut T) -> Result<(), ConfigError> {
        if let Some(v) = self.raw(name, "a non-negative integer")? {
            *target = v;
        }
        Ok(())
    }

    fn secs(&self, name: &str, target: &mut Duration) -> Result<(), ConfigError> {
        if let Some(v) = self.raw::<u64>(name, "whole seconds")? {
            *target = Duration::from_secs(v);
        }
        Ok(())
    }

    fn millis(&self, name: &str, target: &mut Duration) -> Result<(), ConfigError> {
        if let Some(v) = self.raw::<u64>(name, "whole milliseconds")? {
            *target = Duration::from_millis(v);
        }
        Ok(())
    }
}
