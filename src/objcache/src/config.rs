//! Engine tunables.

use std::time::Duration;

pub const DEFAULT_NEG_PATH_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_NEG_PATH_MAX_COUNT: usize = 100;
pub const DEFAULT_LOOP_PERIOD: Duration = Duration::from_secs(10);
pub const DEFAULT_UPLOAD_DELAY: Duration = DEFAULT_LOOP_PERIOD;
pub const DEFAULT_EVICT_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// How long a negative path entry short-circuits `stat` to not-found.
    pub neg_path_timeout: Duration,
    /// Capacity of the negative path cache.
    pub neg_path_max_count: usize,
    /// Period of the background upload/evict loop.
    pub loop_period: Duration,
    /// Minimum idle time before a dirty node is uploaded.
    pub upload_delay: Duration,
    /// Minimum idle time before a clean node is evicted.
    pub evict_delay: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            neg_path_timeout: DEFAULT_NEG_PATH_TIMEOUT,
            neg_path_max_count: DEFAULT_NEG_PATH_MAX_COUNT,
            loop_period: DEFAULT_LOOP_PERIOD,
            upload_delay: DEFAULT_UPLOAD_DELAY,
            evict_delay: DEFAULT_EVICT_DELAY,
        }
    }
}

impl CacheConfig {
    /// Replace any zero override with its default.
    pub fn normalized(mut self) -> Self {
        if self.neg_path_timeout.is_zero() {
            self.neg_path_timeout = DEFAULT_NEG_PATH_TIMEOUT;
        }
        if self.neg_path_max_count == 0 {
            self.neg_path_max_count = DEFAULT_NEG_PATH_MAX_COUNT;
        }
        if self.loop_period.is_zero() {
            self.loop_period = DEFAULT_LOOP_PERIOD;
        }
        if self.upload_delay.is_zero() {
            self.upload_delay = DEFAULT_UPLOAD_DELAY;
        }
        if self.evict_delay.is_zero() {
            self.evict_delay = DEFAULT_EVICT_DELAY;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalized_fills_zero_overrides() {
        let config = CacheConfig {
            neg_path_timeout: Duration::ZERO,
            neg_path_max_count: 0,
            loop_period: Duration::from_secs(1),
            upload_delay: Duration::ZERO,
            evict_delay: Duration::from_secs(2),
        }
        .normalized();
        assert_eq!(config.neg_path_timeout, DEFAULT_NEG_PATH_TIMEOUT);
        assert_eq!(config.neg_path_max_count, DEFAULT_NEG_PATH_MAX_COUNT);
        assert_eq!(config.loop_period, Duration::from_secs(1));
        assert_eq!(config.upload_delay, DEFAULT_UPLOAD_DELAY);
        assert_eq!(config.evict_delay, Duration::from_secs(2));
    }
}
