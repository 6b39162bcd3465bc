use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::warn;

#[derive(Debug, Default)]
struct BreakerEntry {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

/// Per-adapter failure counter. When an adapter fails too many times in a
/// row, further submissions to it are short-circuited for a cool-down
/// window. Any success resets the count.
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    entries: Mutex<HashMap<String, BreakerEntry>>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold,
            cooldown,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// True when a submission to this adapter may proceed.
    pub fn allows(&self, agent_id: &str) -> bool {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(agent_id) else {
            return true;
        };
        match entry.open_until {
            Some(until) if Instant::now() < until => false,
            Some(_) => {
                // Cool-down elapsed; give the adapter another chance.
                entry.open_until = None;
                entry.consecutive_failures = 0;
                true
            }
            None => true,
        }
    }

    pub fn record_failure(&self, agent_id: &str) {
        let mut entries = self.entries.lock();
        let entry = entries.entry(agent_id.to_string()).or_default();
        entry.consecutive_failures += 1;
        if entry.consecutive_failures >= self.threshold && entry.open_until.is_none() {
            entry.open_until = Some(Instant::now() + self.cooldown);
            warn!(
                agent_id,
                failures = entry.consecutive_failures,
                cooldown_secs = self.cooldown.as_secs(),
                "Circuit breaker opened"
            );
        }
    }

    pub fn record_success(&self, agent_id: &str) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(agent_id) {
            entry.consecutive_failures = 0;
            entry.open_until = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breaker_opens_at_threshold() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        assert!(breaker.allows("a"));

        breaker.record_failure("a");
        breaker.record_failure("a");
        assert!(breaker.allows("a"));

        breaker.record_failure("a");
        assert!(!breaker.allows("a"));
    }

    #[test]
    fn test_success_resets_count() {
        let breaker = CircuitBreaker::new(2, Duration::from_secs(60));
        breaker.record_failure("a");
        breaker.record_success("a");
        breaker.record_failure("a");
        assert!(breaker.allows("a"));
    }

    #[test]
    fn test_breaker_closes_after_cooldown() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(10));
        breaker.record_failure("a");
        assert!(!breaker.allows("a"));

        std::thread::sleep(Duration::from_millis(20));
        assert!(breaker.allows("a"));
    }

    #[test]
    fn test_breakers_are_per_adapter() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(60));
        breaker.record_failure("a");
        assert!(!breaker.allows("a"));
        assert!(breaker.allows("b"));
    }
}
