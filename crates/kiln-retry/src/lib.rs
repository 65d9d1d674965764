//! Retry/backoff strategy used by [`kiln-publish`](../kiln_publish) when the
//! registry driver signals a transient condition. A push is retried only
//! if the underlying runtime classifies the failure as transient rather
//! than permanent.

use std::time::Duration;

use kiln_duration::{deserialize_duration, serialize_duration};
use serde::{Deserialize, Serialize};

/// Whether a failed operation may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transience {
    Transient,
    Permanent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategyType {
    Immediate,
    #[default]
    Exponential,
    Linear,
    Constant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryStrategyConfig {
    #[serde(default)]
    pub strategy: RetryStrategyType,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        default = "default_base_delay"
    )]
    pub base_delay: Duration,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        default = "default_max_delay"
    )]
    pub max_delay: Duration,
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_max_attempts() -> u32 {
    6
}
fn default_base_delay() -> Duration {
    Duration::from_secs(2)
}
fn default_max_delay() -> Duration {
    Duration::from_secs(120)
}
fn default_jitter() -> f64 {
    0.5
}

impl Default for RetryStrategyConfig {
    fn default() -> Self {
        Self {
            strategy: RetryStrategyType::Exponential,
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            jitter: default_jitter(),
        }
    }
}

/// Compute the delay before the next attempt, given the attempt number
/// (1-indexed: the delay before the *second* call is `calculate_delay(cfg, 1)`).
pub fn calculate_delay(config: &RetryStrategyConfig, attempt: u32) -> Duration {
    let delay = match config.strategy {
        RetryStrategyType::Immediate => Duration::ZERO,
        RetryStrategyType::Exponential => {
            let pow = attempt.saturating_sub(1).min(16);
            config.base_delay.saturating_mul(2u32.saturating_pow(pow))
        }
        RetryStrategyType::Linear => config.base_delay.saturating_mul(attempt.max(1)),
        RetryStrategyType::Constant => config.base_delay,
    };

    let capped = delay.min(config.max_delay);
    if config.jitter > 0.0 {
        apply_jitter(capped, config.jitter)
    } else {
        capped
    }
}

fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    let jitter = jitter.clamp(0.0, 1.0);
    let jitter_range = 2.0 * jitter;
    let random_factor = 1.0 - jitter + (rand::random::<f64>() * jitter_range);
    let millis = (delay.as_millis() as f64 * random_factor).round().max(0.0) as u64;
    Duration::from_millis(millis)
}

/// Run `op`, retrying up to `config.max_attempts` times while `classify`
/// reports [`Transience::Transient`]. Returns the last error on exhaustion.
pub fn retry_with_backoff<T, E>(
    config: &RetryStrategyConfig,
    mut op: impl FnMut(u32) -> Result<T, E>,
    classify: impl Fn(&E) -> Transience,
    mut sleep: impl FnMut(Duration),
) -> Result<T, E> {
    let mut attempt = 1;
    loop {
        match op(attempt) {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= config.max_attempts || classify(&err) == Transience::Permanent {
                    return Err(err);
                }
                sleep(calculate_delay(config, attempt));
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_doubles_then_caps() {
        let cfg = RetryStrategyConfig {
            strategy: RetryStrategyType::Exponential,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: 0.0,
            max_attempts: 10,
        };
        assert_eq!(calculate_delay(&cfg, 1), Duration::from_secs(1));
        assert_eq!(calculate_delay(&cfg, 2), Duration::from_secs(2));
        assert_eq!(calculate_delay(&cfg, 3), Duration::from_secs(4));
        assert_eq!(calculate_delay(&cfg, 10), Duration::from_secs(60));
    }

    #[test]
    fn constant_never_changes() {
        let cfg = RetryStrategyConfig {
            strategy: RetryStrategyType::Constant,
            base_delay: Duration::from_secs(3),
            max_delay: Duration::from_secs(30),
            jitter: 0.0,
            max_attempts: 5,
        };
        for attempt in 1..=5 {
            assert_eq!(calculate_delay(&cfg, attempt), Duration::from_secs(3));
        }
    }

    #[test]
    fn retry_with_backoff_stops_on_permanent_error() {
        let cfg = RetryStrategyConfig {
            jitter: 0.0,
            max_attempts: 5,
            ..Default::default()
        };
        let mut calls = 0;
        let mut slept = Vec::new();
        let result: Result<(), &str> = retry_with_backoff(
            &cfg,
            |_attempt| {
                calls += 1;
                Err("permanent failure")
            },
            |_e| Transience::Permanent,
            |d| slept.push(d),
        );
        assert!(result.is_err());
        assert_eq!(calls, 1);
        assert!(slept.is_empty());
    }

    #[test]
    fn retry_with_backoff_retries_transient_until_success() {
        let cfg = RetryStrategyConfig {
            strategy: RetryStrategyType::Immediate,
            jitter: 0.0,
            max_attempts: 5,
            ..Default::default()
        };
        let mut calls = 0;
        let result: Result<&str, &str> = retry_with_backoff(
            &cfg,
            |attempt| {
                calls += 1;
                if attempt < 3 { Err("transient") } else { Ok("done") }
            },
            |_e| Transience::Transient,
            |_d| {},
        );
        assert_eq!(result, Ok("done"));
        assert_eq!(calls, 3);
    }

    #[test]
    fn retry_with_backoff_exhausts_attempts() {
        let cfg = RetryStrategyConfig {
            strategy: RetryStrategyType::Immediate,
            jitter: 0.0,
            max_attempts: 3,
            ..Default::default()
        };
        let mut calls = 0;
        let result: Result<(), &str> = retry_with_backoff(
            &cfg,
            |_attempt| {
                calls += 1;
                Err("still transient")
            },
            |_e| Transience::Transient,
            |_d| {},
        );
        assert!(result.is_err());
        assert_eq!(calls, 3);
    }

    #[test]
    fn config_deserializes_with_human_durations() {
        let json = r#"{"strategy":"linear","max_attempts":3,"base_delay":"5s","max_delay":"30s","jitter":0.2}"#;
        let cfg: RetryStrategyConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.strategy, RetryStrategyType::Linear);
        assert_eq!(cfg.base_delay, Duration::from_secs(5));
    }
}
