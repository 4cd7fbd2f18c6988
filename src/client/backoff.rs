/*
 *
 * Copyright 2025 Crossbar authors.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 *
 */

use rand::Rng;
use std::{
    sync::Mutex,
    time::{Duration, Instant},
};

/// Connection backoff state for a subchannel.
pub(crate) trait Backoff: Send + Sync {
    /// The instant before which the next connection attempt must not start.
    fn backoff_until(&self) -> Instant;

    /// Resets the backoff to its base delay.  Called when a connection
    /// succeeds.
    fn reset(&self);

    /// The maximum time to wait for a single connection attempt.
    fn min_connect_timeout(&self) -> Duration;
}

#[derive(Clone)]
pub(crate) struct BackoffConfig {
    /// The amount of time to backoff after the first failure.
    pub base_delay: Duration,

    /// The factor with which to multiply backoffs after a failed retry.
    /// Must be >= 1.
    pub multiplier: f64,

    /// The factor with which backoffs are randomized, in [0, 1].
    pub jitter: f64,

    /// The upper bound of backoff delay.
    pub max_delay: Duration,

    /// The maximum time to wait for a single connection attempt.
    pub min_connect_timeout: Duration,
}

/// Default backoff parameters, following the conventional exponential
/// connection-backoff schedule.
pub(crate) const DEFAULT_EXPONENTIAL_CONFIG: BackoffConfig = BackoffConfig {
    base_delay: Duration::from_secs(1),
    multiplier: 1.6,
    jitter: 0.2,
    max_delay: Duration::from_secs(120),
    min_connect_timeout: Duration::from_secs(20),
};

impl BackoffConfig {
    fn validate(&self) -> Result<(), &'static str> {
        if self.base_delay > self.max_delay {
            Err("base_delay must not be greater than max_delay")?;
        }
        if self.multiplier < 1.0 {
            Err("multiplier must be greater than or equal to 1.0")?;
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            Err("jitter must be within [0, 1]")?;
        }
        Ok(())
    }
}

pub(crate) struct ExponentialBackoff {
    config: BackoffConfig,

    // The delay for the next retry before jitter, as f64 seconds to avoid
    // rounding errors.
    next_delay_secs: Mutex<f64>,
}

impl ExponentialBackoff {
    pub(crate) fn new(config: BackoffConfig) -> Result<Self, &'static str> {
        config.validate()?;
        let next_delay_secs = config.base_delay.as_secs_f64();
        Ok(ExponentialBackoff {
            config,
            next_delay_secs: Mutex::new(next_delay_secs),
        })
    }

    fn backoff_duration(&self) -> Duration {
        let mut next_delay = self.next_delay_secs.lock().unwrap();
        let jitter_factor = 1.0 + self.config.jitter * rand::rng().random_range(-1.0..1.0);
        let cur_delay = *next_delay * jitter_factor;
        *next_delay = self
            .config
            .max_delay
            .as_secs_f64()
            .min(*next_delay * self.config.multiplier);
        Duration::from_secs_f64(cur_delay)
    }
}

impl Backoff for ExponentialBackoff {
    fn backoff_until(&self) -> Instant {
        Instant::now() + self.backoff_duration()
    }

    fn reset(&self) {
        let mut next_delay = self.next_delay_secs.lock().unwrap();
        *next_delay = self.config.base_delay.as_secs_f64();
    }

    fn min_connect_timeout(&self) -> Duration {
        self.config.min_connect_timeout
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::{BackoffConfig, ExponentialBackoff, DEFAULT_EXPONENTIAL_CONFIG};

    #[test]
    fn default_config_is_valid() {
        assert!(ExponentialBackoff::new(DEFAULT_EXPONENTIAL_CONFIG.clone()).is_ok());
    }

    #[test]
    fn invalid_configs_are_rejected() {
        let base_more_than_max = BackoffConfig {
            base_delay: Duration::from_secs(100),
            max_delay: Duration::from_secs(10),
            ..DEFAULT_EXPONENTIAL_CONFIG
        };
        assert!(ExponentialBackoff::new(base_more_than_max).is_err());

        let shrinking = BackoffConfig {
            multiplier: 0.5,
            ..DEFAULT_EXPONENTIAL_CONFIG
        };
        assert!(ExponentialBackoff::new(shrinking).is_err());

        let bad_jitter = BackoffConfig {
            jitter: 2.0,
            ..DEFAULT_EXPONENTIAL_CONFIG
        };
        assert!(ExponentialBackoff::new(bad_jitter).is_err());
    }

    #[test]
    fn grows_caps_and_resets() {
        let config = BackoffConfig {
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: 0.0,
            max_delay: Duration::from_secs(15),
            min_connect_timeout: Duration::from_secs(20),
        };
        let backoff = ExponentialBackoff::new(config).unwrap();
        for want in [1, 2, 4, 8, 15, 15] {
            assert_eq!(backoff.backoff_duration(), Duration::from_secs(want));
        }
        super::Backoff::reset(&backoff);
        assert_eq!(backoff.backoff_duration(), Duration::from_secs(1));
    }
}
