use std::time::Duration;

/// Resource limits governing the Layer Acquirer's admission controller and
/// retry policy. Loading these values from a file or environment is an
/// external concern; this crate only carries the values themselves.
#[derive(Debug, Clone, Copy)]
pub struct ThrottleConfig {
    /// Cap on concurrent in-flight declared-tar bytes.
    pub budget_bytes: u64,
    /// Attempts per layer before giving up and recording a terminal error.
    pub max_attempts: u32,
    /// Per-request read timeout for a single layer fetch.
    pub read_timeout: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            budget_bytes: 400 * 1024 * 1024,
            max_attempts: 3,
            read_timeout: Duration::from_secs(10 * 60),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = ThrottleConfig::default();
        assert_eq!(config.budget_bytes, 400 * 1024 * 1024);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.read_timeout, Duration::from_secs(600));
    }
}
