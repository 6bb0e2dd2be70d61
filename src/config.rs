//! Runtime configuration.
//!
//! Loaded from `TICKETFLOW_*` environment variables, falling back to the
//! defaults below for anything unset or unparsable.

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub lock: LockConfig,
    pub idempotency: IdempotencyConfig,
    pub reservation: ReservationConfig,
    pub settlement: SettlementConfig,
    pub gateway: GatewayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Expiry of a held lock; bounds the damage of a crashed holder.
    pub ttl: Duration,
    /// How long a purchase waits for the resource lock before giving up.
    pub max_wait: Duration,
    pub poll_interval: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyConfig {
    /// Retention window of memoized responses.
    pub ttl: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationConfig {
    /// Unsettled reservations are cancelled after this long.
    pub ttl: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementConfig {
    /// Total tries per settlement job, including the first.
    pub attempts: u32,
    /// First retry delay; doubles on each further retry.
    pub backoff_base: Duration,
    /// Upper bound on a single retry delay.
    pub backoff_max: Duration,
    pub workers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub min_latency: Duration,
    pub max_latency: Duration,
    /// Probability in `0.0..=1.0` that a charge fails.
    pub failure_rate: f64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            max_wait: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl Default for ReservationConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(5 * 60),
        }
    }
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_base: Duration::from_secs(2),
            backoff_max: Duration::from_secs(60),
            workers: 4,
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            min_latency: Duration::from_millis(1000),
            max_latency: Duration::from_millis(3000),
            failure_rate: 0.1,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_vars(|var| env::var(var).ok())
    }

    /// Build from any variable source; `from_env` reads the process environment.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let vars = Vars(lookup);
        let defaults = Self::default();
        Self {
            lock: LockConfig {
                // a zero ttl or poll interval would disable the lock or spin on it
                ttl: vars
                    .nonzero_millis("TICKETFLOW_LOCK_TTL_MS")
                    .unwrap_or(defaults.lock.ttl),
                max_wait: vars
                    .millis("TICKETFLOW_LOCK_MAX_WAIT_MS")
                    .unwrap_or(defaults.lock.max_wait),
                poll_interval: vars
                    .nonzero_millis("TICKETFLOW_LOCK_POLL_MS")
                    .unwrap_or(defaults.lock.poll_interval),
            },
            idempotency: IdempotencyConfig {
                ttl: vars
                    .secs("TICKETFLOW_IDEMPOTENCY_TTL_SECS")
                    .unwrap_or(defaults.idempotency.ttl),
            },
            reservation: ReservationConfig {
                ttl: vars
                    .secs("TICKETFLOW_RESERVATION_TTL_SECS")
                    .unwrap_or(defaults.reservation.ttl),
            },
            settlement: SettlementConfig {
                attempts: vars
                    .parsed("TICKETFLOW_SETTLEMENT_ATTEMPTS")
                    .filter(|&n: &u32| n > 0)
                    .unwrap_or(defaults.settlement.attempts),
                backoff_base: vars
                    .millis("TICKETFLOW_SETTLEMENT_BACKOFF_MS")
                    .unwrap_or(defaults.settlement.backoff_base),
                backoff_max: vars
                    .millis("TICKETFLOW_SETTLEMENT_BACKOFF_MAX_MS")
                    .unwrap_or(defaults.settlement.backoff_max),
                workers: vars
                    .parsed("TICKETFLOW_WORKERS")
                    .filter(|&n: &usize| n > 0)
                    .unwrap_or(defaults.settlement.workers),
            },
            gateway: GatewayConfig {
                min_latency: vars
                    .millis("TICKETFLOW_GATEWAY_MIN_LATENCY_MS")
                    .unwrap_or(defaults.gateway.min_latency),
                max_latency: vars
                    .millis("TICKETFLOW_GATEWAY_MAX_LATENCY_MS")
                    .unwrap_or(defaults.gateway.max_latency),
                failure_rate: vars
                    .parsed("TICKETFLOW_GATEWAY_FAILURE_RATE")
                    .filter(|rate: &f64| (0.0..=1.0).contains(rate))
                    .unwrap_or(defaults.gateway.failure_rate),
            },
        }
    }
}

struct Vars<F>(F);

impl<F: Fn(&str) -> Option<String>> Vars<F> {
    fn parsed<T: std::str::FromStr>(&self, var: &str) -> Option<T> {
        (self.0)(var).and_then(|s| s.trim().parse().ok())
    }

    fn millis(&self, var: &str) -> Option<Duration> {
        self.parsed(var).map(Duration::from_millis)
    }

    fn nonzero_millis(&self, var: &str) -> Option<Duration> {
        self.millis(var).filter(|d| !d.is_zero())
    }

    fn secs(&self, var: &str) -> Option<Duration> {
        self.parsed(var).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.lock.ttl, Duration::from_secs(30));
        assert_eq!(config.lock.max_wait, Duration::from_secs(5));
        assert_eq!(config.lock.poll_interval, Duration::from_millis(100));
        assert_eq!(config.idempotency.ttl, Duration::from_secs(86_400));
        assert_eq!(config.reservation.ttl, Duration::from_secs(300));
        assert_eq!(config.settlement.attempts, 3);
        assert_eq!(config.settlement.backoff_base, Duration::from_secs(2));
    }

    fn from_pairs(pairs: &[(&str, &str)]) -> Config {
        Config::from_vars(|var| {
            pairs
                .iter()
                .find(|(name, _)| *name == var)
                .map(|(_, value)| value.to_string())
        })
    }

    #[test]
    fn variables_override_defaults() {
        let config = from_pairs(&[
            ("TICKETFLOW_LOCK_TTL_MS", "250"),
            ("TICKETFLOW_LOCK_POLL_MS", " 5 "),
            ("TICKETFLOW_SETTLEMENT_ATTEMPTS", "7"),
            ("TICKETFLOW_GATEWAY_FAILURE_RATE", "0.25"),
        ]);
        assert_eq!(config.lock.ttl, Duration::from_millis(250));
        assert_eq!(config.lock.poll_interval, Duration::from_millis(5));
        assert_eq!(config.settlement.attempts, 7);
        assert_eq!(config.gateway.failure_rate, 0.25);
    }

    #[test]
    fn unparsable_values_fall_back() {
        let config = from_pairs(&[
            ("TICKETFLOW_LOCK_MAX_WAIT_MS", "soon"),
            ("TICKETFLOW_GATEWAY_FAILURE_RATE", "1.5"),
        ]);
        let defaults = Config::default();
        assert_eq!(config.lock.max_wait, defaults.lock.max_wait);
        assert_eq!(config.gateway.failure_rate, defaults.gateway.failure_rate);
    }

    #[test]
    fn zero_lock_timings_are_rejected() {
        let config = from_pairs(&[
            ("TICKETFLOW_LOCK_TTL_MS", "0"),
            ("TICKETFLOW_LOCK_POLL_MS", "0"),
            ("TICKETFLOW_SETTLEMENT_ATTEMPTS", "0"),
            ("TICKETFLOW_WORKERS", "0"),
        ]);
        let defaults = Config::default();
        assert_eq!(config.lock.ttl, defaults.lock.ttl);
        assert_eq!(config.lock.poll_interval, defaults.lock.poll_interval);
        assert_eq!(config.settlement.attempts, defaults.settlement.attempts);
        assert_eq!(config.settlement.workers, defaults.settlement.workers);
    }
}
