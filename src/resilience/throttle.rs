//! # Throttle
//!
//! Sliding-window rate limiter used for database-connect backoff and for
//! backing off when jobs keep failing.
//!
//! A throttle is built from a rule set such as `"3/500ms, 5/m!"`. Every rule
//! `N/{period}{unit}` allows at most `N` failures per window; a trailing `!`
//! keeps the rule's history when a success is registered.
//!
//! Each rule keeps a ring of `N` "unblock at" instants. A failure writes
//! `now + window` into the oldest slot; the delay a caller has to wait is
//! taken from the slot that will be overwritten next, which is the `N`th most
//! recent failure.

use crate::error::{ConsumerError, Result};
use parking_lot::Mutex;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

/// A single `N/{period}{unit}[!]` rule
#[derive(Debug, Clone)]
pub struct ThrottleRule {
    /// Ring of instants at which the matching failure stops counting
    unblock_at: Vec<Option<Instant>>,
    /// Window length
    window: Duration,
    /// Clear history when a success is registered
    reset_on_success: bool,
    /// Next slot to read from and write to
    pos: usize,
}

impl ThrottleRule {
    /// Create a rule allowing `max_events` failures per `window`
    pub fn new(max_events: usize, window: Duration, reset_on_success: bool) -> Self {
        Self {
            unblock_at: vec![None; max_events.max(1)],
            window,
            reset_on_success,
            pos: 0,
        }
    }

    pub fn max_events(&self) -> usize {
        self.unblock_at.len()
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn reset_on_success(&self) -> bool {
        self.reset_on_success
    }

    fn reset(&mut self) {
        if self.reset_on_success {
            self.unblock_at.iter_mut().for_each(|slot| *slot = None);
        }
    }

    fn register_failure(&mut self, now: Instant) {
        self.unblock_at[self.pos] = Some(now + self.window);
        self.pos = (self.pos + 1) % self.unblock_at.len();
    }

    fn delay(&self, now: Instant) -> Duration {
        self.unblock_at[self.pos]
            .map(|unblock_at| unblock_at.saturating_duration_since(now))
            .unwrap_or(Duration::ZERO)
    }
}

impl FromStr for ThrottleRule {
    type Err = ConsumerError;

    fn from_str(rule: &str) -> Result<Self> {
        let (count, period) = rule
            .split_once('/')
            .ok_or_else(|| ConsumerError::invalid_throttle_rule(rule, "missing '/'"))?;

        let max_events = parse_positive(count)
            .ok_or_else(|| ConsumerError::invalid_throttle_rule(rule, "invalid event count"))?;

        let (period, reset_on_success) = match period.strip_suffix('!') {
            Some(period) => (period, false),
            None => (period, true),
        };

        let unit_start = period
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| ConsumerError::invalid_throttle_rule(rule, "missing time unit"))?;
        let (periods, unit) = period.split_at(unit_start);
        let periods = if periods.is_empty() {
            1
        } else {
            parse_positive(periods)
                .ok_or_else(|| ConsumerError::invalid_throttle_rule(rule, "invalid period count"))?
        };

        let unit_ms: u64 = match unit {
            "ms" => 1,
            "s" => 1_000,
            "m" => 60_000,
            "h" => 3_600_000,
            _ => {
                return Err(ConsumerError::invalid_throttle_rule(
                    rule,
                    format!("unknown time unit {unit:?}"),
                ))
            }
        };
        let window_ms = (periods as u64)
            .checked_mul(unit_ms)
            .ok_or_else(|| ConsumerError::invalid_throttle_rule(rule, "window too large"))?;

        Ok(ThrottleRule::new(
            max_events,
            Duration::from_millis(window_ms),
            reset_on_success,
        ))
    }
}

/// Digits only, no sign, no leading zero
fn parse_positive(text: &str) -> Option<usize> {
    if text.is_empty() || text.starts_with('0') || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    text.parse().ok()
}

/// Multi-rule failure throttle
///
/// `throttle()` waits until every rule allows another attempt. `register()`
/// reports the outcome of that attempt. A success wakes every waiter, so a
/// worker blocked on a long backoff resumes as soon as another worker has
/// proven the system healthy again.
pub struct Throttle {
    spec: String,
    rules: Mutex<Vec<ThrottleRule>>,
    success: Notify,
}

impl fmt::Debug for Throttle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Throttle").field("spec", &self.spec).finish()
    }
}

impl Throttle {
    /// Parse a rule set (rules separated by commas and/or whitespace)
    pub fn new(rule_set: &str) -> Result<Self> {
        let rules = rule_set
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|rule| !rule.is_empty())
            .map(ThrottleRule::from_str)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            spec: rule_set.trim().to_string(),
            rules: Mutex::new(rules),
            success: Notify::new(),
        })
    }

    /// The rule set this throttle was built from
    pub fn spec(&self) -> &str {
        &self.spec
    }

    pub fn rule_count(&self) -> usize {
        self.rules.lock().len()
    }

    /// How long a caller has to wait right now
    pub fn current_delay(&self) -> Duration {
        let now = Instant::now();
        self.rules
            .lock()
            .iter()
            .map(|rule| rule.delay(now))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    /// Wait until every rule allows another attempt
    ///
    /// The delay is re-evaluated after each wait, and a success registered by
    /// another caller cuts the wait short.
    pub async fn throttle(&self) {
        loop {
            let notified = self.success.notified();
            tokio::pin!(notified);
            // Register interest before reading the rules, so a success that
            // lands in between is not lost
            notified.as_mut().enable();

            let delay = self.current_delay();
            if delay.is_zero() {
                return;
            }
            debug!(
                throttle = %self.spec,
                delay_ms = delay.as_millis() as u64,
                "⏳ Throttling"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = &mut notified => {
                    debug!(throttle = %self.spec, "Throttle woken by success");
                }
            }
        }
    }

    /// Report the outcome of an attempt
    pub fn register(&self, success: bool) {
        let now = Instant::now();
        let mut rules = self.rules.lock();
        if success {
            rules.iter_mut().for_each(ThrottleRule::reset);
            drop(rules);
            self.success.notify_waiters();
        } else {
            rules.iter_mut().for_each(|rule| rule.register_failure(now));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    async fn timed_throttle(throttle: &Throttle) -> Duration {
        let start = Instant::now();
        throttle.throttle().await;
        start.elapsed()
    }

    #[test]
    fn test_parse_rule_set() {
        let throttle = Throttle::new("3/500ms, 5/m!  2/10s").unwrap();
        assert_eq!(throttle.rule_count(), 3);

        let rules = throttle.rules.lock();
        assert_eq!(rules[0].max_events(), 3);
        assert_eq!(rules[0].window(), Duration::from_millis(500));
        assert!(rules[0].reset_on_success());
        assert_eq!(rules[1].max_events(), 5);
        assert_eq!(rules[1].window(), Duration::from_secs(60));
        assert!(!rules[1].reset_on_success());
        assert_eq!(rules[2].window(), Duration::from_secs(10));
    }

    #[test]
    fn test_parse_empty_rule_set() {
        let throttle = Throttle::new("   ").unwrap();
        assert_eq!(throttle.rule_count(), 0);
        assert_eq!(throttle.current_delay(), Duration::ZERO);
    }

    #[test]
    fn test_parse_rejects_invalid_rules() {
        for rule in ["0/s", "3/0s", "3/500", "3/500d", "x/s", "3s", "03/s", "-1/s"] {
            let result = Throttle::new(rule);
            assert!(
                matches!(result, Err(ConsumerError::InvalidThrottleRule { .. })),
                "expected {rule:?} to be rejected"
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_rules_never_waits() {
        let throttle = Throttle::new("").unwrap();
        throttle.register(false);
        throttle.register(false);
        assert_eq!(timed_throttle(&throttle).await.as_millis(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_oldest_failure() {
        let throttle = Throttle::new("3/500ms").unwrap();

        throttle.register(false);
        tokio::time::advance(Duration::from_millis(100)).await;
        throttle.register(false);
        tokio::time::advance(Duration::from_millis(100)).await;
        throttle.register(false);

        // 500ms after the first of the three failures, not the last
        assert_eq!(timed_throttle(&throttle).await.as_millis(), 300);
    }

    #[tokio::test(start_paused = true)]
    async fn test_below_limit_does_not_wait() {
        let throttle = Throttle::new("3/500ms").unwrap();
        throttle.register(false);
        throttle.register(false);
        assert_eq!(timed_throttle(&throttle).await.as_millis(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_rule() {
        let throttle = Throttle::new("1/10s").unwrap();
        throttle.register(false);
        assert_eq!(throttle.current_delay(), Duration::from_secs(10));

        throttle.register(true);
        assert_eq!(timed_throttle(&throttle).await.as_millis(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sticky_rule_survives_success() {
        let throttle = Throttle::new("1/10s!").unwrap();
        throttle.register(false);
        throttle.register(true);
        assert_eq!(timed_throttle(&throttle).await.as_millis(), 10000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_longest_rule_wins() {
        let throttle = Throttle::new("1/100ms, 2/1s").unwrap();
        throttle.register(false);
        assert_eq!(timed_throttle(&throttle).await.as_millis(), 100);
        throttle.register(false);
        // 2/1s: the first failure was 100ms ago
        assert_eq!(timed_throttle(&throttle).await.as_millis(), 900);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_wakes_waiter() {
        let throttle = Arc::new(Throttle::new("1/10s").unwrap());
        throttle.register(false);

        let waiter = {
            let throttle = Arc::clone(&throttle);
            tokio::spawn(async move { timed_throttle(&throttle).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        throttle.register(true);

        let waited = waiter.await.unwrap();
        assert!(waited < Duration::from_secs(1), "waited {waited:?}");
    }

    proptest! {
        #[test]
        fn prop_valid_rules_parse(count in 1usize..1000, periods in 1u64..1000, unit_idx in 0usize..4, sticky in any::<bool>()) {
            let (unit, ms) = [("ms", 1u64), ("s", 1_000), ("m", 60_000), ("h", 3_600_000)][unit_idx];
            let text = format!("{count}/{periods}{unit}{}", if sticky { "!" } else { "" });
            let rule: ThrottleRule = text.parse().unwrap();
            prop_assert_eq!(rule.max_events(), count);
            prop_assert_eq!(rule.window(), Duration::from_millis(periods * ms));
            prop_assert_eq!(rule.reset_on_success(), !sticky);
        }

        #[test]
        fn prop_garbage_never_panics(text in "\\PC*") {
            let _ = Throttle::new(&text);
        }
    }
}
