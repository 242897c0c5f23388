//! Retry policies and the per-collaborator preset table.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How the wait grows between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same wait every time.
    Fixed,
    /// `base * 2^(attempt-1)`, capped at `max_delay`.
    #[default]
    Exponential,
}

/// Attempt budget and backoff for one kind of call.
///
/// `max_attempts` counts the first try: `3` means one call plus up to two
/// retries. No jitter is applied, so delays are reproducible under a paused
/// tokio clock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(3, Duration::from_millis(500), Duration::from_secs(30))
    }
}

/// Collaborators the pipeline calls out to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExternalService {
    ContentExtraction,
    ScriptGeneration,
    SpeechSynthesis,
    ObjectStorage,
    Database,
    CdnPurge,
}

impl ExternalService {
    pub fn name(self) -> &'static str {
        match self {
            ExternalService::ContentExtraction => "content-extraction",
            ExternalService::ScriptGeneration => "script-generation",
            ExternalService::SpeechSynthesis => "speech-synthesis",
            ExternalService::ObjectStorage => "object-storage",
            ExternalService::Database => "database",
            ExternalService::CdnPurge => "cdn-purge",
        }
    }
}

impl RetryPolicy {
    /// A single attempt.
    pub fn no_retry() -> Self {
        Self::fixed(1, Duration::ZERO)
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// Preset for calls into `service`.
    ///
    /// Rate-limited third-party APIs get few attempts spaced far apart;
    /// idempotent storage and database calls get more attempts, quickly.
    pub fn for_service(service: ExternalService) -> Self {
        let (attempts, base, cap) = match service {
            ExternalService::ContentExtraction => (3, Duration::from_secs(2), Duration::from_secs(20)),
            ExternalService::ScriptGeneration => (2, Duration::from_secs(5), Duration::from_secs(30)),
            ExternalService::SpeechSynthesis => (3, Duration::from_secs(3), Duration::from_secs(30)),
            ExternalService::ObjectStorage => (4, Duration::from_millis(200), Duration::from_secs(5)),
            ExternalService::Database => (5, Duration::from_millis(50), Duration::from_secs(2)),
            ExternalService::CdnPurge => (3, Duration::from_secs(1), Duration::from_secs(10)),
        };
        Self::exponential(attempts, base, cap)
    }

    /// Wait after failed attempt number `attempt` (1-indexed) before the next one.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let Some(doublings) = attempt.checked_sub(1) else {
            return Duration::ZERO;
        };
        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                let factor = 1u32.checked_shl(doublings).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
        };
        delay.min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_doubles_until_capped() {
        let policy = RetryPolicy::exponential(10, Duration::from_millis(100), Duration::from_millis(500));

        let delays: Vec<_> = (1..=4).map(|n| policy.delay_for_attempt(n).as_millis()).collect();
        assert_eq!(delays, [100, 200, 400, 500]);
        assert_eq!(policy.delay_for_attempt(60), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_millis(500));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(500));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
    }

    #[test]
    fn attempt_zero_never_waits() {
        assert_eq!(RetryPolicy::default().delay_for_attempt(0), Duration::ZERO);
        assert_eq!(RetryPolicy::no_retry().max_attempts, 1);
    }

    #[test]
    fn rate_limited_presets_wait_longer_than_storage_presets() {
        let tts = RetryPolicy::for_service(ExternalService::SpeechSynthesis);
        let db = RetryPolicy::for_service(ExternalService::Database);

        assert!(tts.max_attempts < db.max_attempts);
        assert!(tts.base_delay > db.base_delay);
    }
}
