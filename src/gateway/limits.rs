use std::num::NonZeroU32;

use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};

use crate::config::RateLimitConfig;
use crate::errors::{Result, TetherError};

/// Keyed limiters for the HTTP surface: a global per-client limit and a
/// stricter per-user limit on the AI path.
pub struct RateLimits {
    global: DefaultKeyedRateLimiter<String>,
    ai: DefaultKeyedRateLimiter<String>,
    per_minute: u32,
    ai_per_minute: u32,
}

impl RateLimits {
    pub fn new(config: &RateLimitConfig) -> Result<Self> {
        let per_minute = NonZeroU32::new(config.per_minute)
            .ok_or_else(|| TetherError::validation("rate_limit.per_minute", "must be > 0"))?;
        let ai_per_minute = NonZeroU32::new(config.ai_per_minute)
            .ok_or_else(|| TetherError::validation("rate_limit.ai_per_minute", "must be > 0"))?;
        Ok(Self {
            global: RateLimiter::keyed(Quota::per_minute(per_minute)),
            ai: RateLimiter::keyed(Quota::per_minute(ai_per_minute)),
            per_minute: config.per_minute,
            ai_per_minute: config.ai_per_minute,
        })
    }

    pub fn check_global(&self, key: &str) -> Result<()> {
        self.global
            .check_key(&key.to_string())
            .map_err(|_| TetherError::RateLimited {
                retry_after: Some(hint_secs(self.per_minute)),
            })
    }

    pub fn check_ai(&self, key: &str) -> Result<()> {
        self.ai
            .check_key(&key.to_string())
            .map_err(|_| TetherError::RateLimited {
                retry_after: Some(hint_secs(self.ai_per_minute)),
            })
    }
}

/// Coarse back-off hint: the average spacing the quota allows.
fn hint_secs(per_minute: u32) -> u64 {
    u64::from(60 / per_minute.max(1)).max(1)
}
