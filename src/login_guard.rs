//! Rate limiting for the admin login endpoint.
//!
//! Counts failed logins per client in a short window and blocks the client
//! once the threshold is passed. Each repeated block doubles in length up to a
//! ceiling; the escalation count survives until a successful login or until
//! the record is swept by [`LoginGuard::cleanup`]. State is in memory only.

use crate::guard::{ensure_in_range, secs_until, Decision, DAY_SECS};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Tunables for the login guard.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoginGuardSettings {
    /// Window in seconds over which failed attempts are counted.
    pub attempt_window_secs: i64,
    /// Failures tolerated per window; the next one blocks.
    pub max_attempts: u32,
    /// Length of the first block in seconds.
    pub base_block_secs: i64,
    /// Upper bound on any block in seconds.
    pub max_block_secs: i64,
    /// How long an expired block is remembered for escalation, in seconds.
    pub block_memory_secs: i64,
}

impl Default for LoginGuardSettings {
    fn default() -> Self {
        Self {
            attempt_window_secs: 60,
            max_attempts: 5,
            base_block_secs: 60,
            max_block_secs: 60 * 60,
            block_memory_secs: 10 * 60,
        }
    }
}

impl LoginGuardSettings {
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure_in_range("login_guard.attempt_window_secs", self.attempt_window_secs, DAY_SECS)?;
        ensure_in_range("login_guard.base_block_secs", self.base_block_secs, DAY_SECS)?;
        ensure_in_range("login_guard.max_block_secs", self.max_block_secs, 7 * DAY_SECS)?;
        ensure_in_range("login_guard.block_memory_secs", self.block_memory_secs, 7 * DAY_SECS)?;
        if self.max_block_secs < self.base_block_secs {
            anyhow::bail!("login_guard.max_block_secs must not be below base_block_secs");
        }
        if self.max_attempts == 0 {
            anyhow::bail!("login_guard.max_attempts must be at least 1");
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct LoginAttemptRecord {
    attempts: u32,
    first_attempt_at: DateTime<Utc>,
    blocked_until: Option<DateTime<Utc>>,
    /// Blocks issued so far; drives the exponential backoff.
    block_count: u32,
}

impl LoginAttemptRecord {
    /// Start a fresh counting window; the escalation count is kept.
    fn lift_block(&mut self, now: DateTime<Utc>) {
        self.attempts = 0;
        self.first_attempt_at = now;
        self.blocked_until = None;
    }
}

/// Result of recording a failed login.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Not blocked yet; this many failures remain before a block.
    AttemptsLeft(u32),
    /// The client is now blocked for `duration`.
    Block { duration: Duration },
}

#[cfg(test)]
impl FailureOutcome {
    pub fn should_block(&self) -> bool {
        matches!(self, FailureOutcome::Block { .. })
    }
}

pub struct LoginGuard {
    attempt_window: Duration,
    max_attempts: u32,
    base_block: Duration,
    max_block: Duration,
    block_memory: Duration,
    attempts: Mutex<HashMap<String, LoginAttemptRecord>>,
}

impl LoginGuard {
    pub fn new(settings: &LoginGuardSettings) -> Self {
        Self {
            attempt_window: Duration::seconds(settings.attempt_window_secs),
            max_attempts: settings.max_attempts,
            base_block: Duration::seconds(settings.base_block_secs),
            max_block: Duration::seconds(settings.max_block_secs),
            block_memory: Duration::seconds(settings.block_memory_secs),
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Check whether `ip` is currently blocked.
    ///
    /// An expired block is lifted here and the client starts a fresh counting
    /// window; the escalation count is kept.
    pub fn is_blocked(&self, ip: &str, now: DateTime<Utc>) -> Decision {
        let mut attempts = self.attempts.lock();
        let Some(record) = attempts.get_mut(ip) else {
            return Decision::Allow;
        };
        let Some(until) = record.blocked_until else {
            return Decision::Allow;
        };

        if now < until {
            return Decision::rate_limited(secs_until(now, until));
        }

        record.lift_block(now);
        Decision::Allow
    }

    /// Record one failed login from `ip`.
    ///
    /// A client that is already blocked, for instance by a concurrent request
    /// that passed [`Self::is_blocked`] at the same moment, gets the remaining
    /// block back and its escalation count is left alone.
    pub fn record_failure(&self, ip: &str, now: DateTime<Utc>) -> FailureOutcome {
        let mut attempts = self.attempts.lock();

        let Some(record) = attempts.get_mut(ip) else {
            attempts.insert(
                ip.to_string(),
                LoginAttemptRecord {
                    attempts: 1,
                    first_attempt_at: now,
                    blocked_until: None,
                    block_count: 0,
                },
            );
            return FailureOutcome::AttemptsLeft(self.max_attempts - 1);
        };

        if let Some(until) = record.blocked_until {
            if now < until {
                return FailureOutcome::Block {
                    duration: until - now,
                };
            }
            record.lift_block(now);
        }

        if now - record.first_attempt_at > self.attempt_window {
            record.attempts = 1;
            record.first_attempt_at = now;
            return FailureOutcome::AttemptsLeft(self.max_attempts - 1);
        }

        record.attempts += 1;

        if record.attempts > self.max_attempts {
            record.block_count += 1;
            let duration = self.block_duration(record.block_count);
            record.blocked_until = Some(now + duration);
            log::warn!(
                "login guard: ip={} blocked for {}s after {} failed attempts (block #{})",
                ip,
                duration.num_seconds(),
                record.attempts,
                record.block_count
            );
            return FailureOutcome::Block { duration };
        }

        FailureOutcome::AttemptsLeft(self.max_attempts - record.attempts)
    }

    /// Forget everything about `ip` after a successful login, escalation included.
    pub fn record_success(&self, ip: &str) {
        self.attempts.lock().remove(ip);
    }

    /// Drop records that are neither counting nor blocking.
    ///
    /// Unblocked records go once their attempt window has passed; blocked ones
    /// are kept until `block_memory` after the block expired so a returning
    /// abuser still escalates. Returns the number of removed records.
    pub fn cleanup(&self, now: DateTime<Utc>) -> usize {
        let expired: Vec<String> = self
            .attempts
            .lock()
            .iter()
            .filter(|(_, record)| self.is_expired(record, now))
            .map(|(ip, _)| ip.clone())
            .collect();

        let mut removed = 0;
        for ip in &expired {
            let mut attempts = self.attempts.lock();
            // Re-check: a request may have touched the record since the snapshot.
            if attempts.get(ip).is_some_and(|record| self.is_expired(record, now)) {
                attempts.remove(ip);
                removed += 1;
            }
        }

        if removed > 0 {
            log::info!("login guard: cleaned up {} expired records", removed);
        }
        removed
    }

    /// Number of identifiers currently tracked.
    pub fn len(&self) -> usize {
        self.attempts.lock().len()
    }

    /// `base * 2^(n-1)`, capped at the maximum block.
    fn block_duration(&self, block_count: u32) -> Duration {
        let exponent = block_count.saturating_sub(1).min(30);
        let secs = self.base_block.num_seconds().saturating_mul(1i64 << exponent);
        Duration::seconds(secs.min(self.max_block.num_seconds()))
    }

    fn is_expired(&self, record: &LoginAttemptRecord, now: DateTime<Utc>) -> bool {
        match record.blocked_until {
            None => now - record.first_attempt_at > self.attempt_window,
            Some(until) => now > until + self.block_memory,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::DenyReason;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn guard() -> LoginGuard {
        LoginGuard::new(&LoginGuardSettings::default())
    }

    /// Fail six times, ten seconds apart, starting at `start`.
    fn fail_until_blocked(guard: &LoginGuard, ip: &str, start: i64) -> FailureOutcome {
        let mut outcome = FailureOutcome::AttemptsLeft(0);
        for i in 0..6 {
            assert!(guard.is_blocked(ip, at(start + i * 10)).is_allowed());
            outcome = guard.record_failure(ip, at(start + i * 10));
        }
        outcome
    }

    #[test]
    fn test_unknown_client_not_blocked() {
        assert!(guard().is_blocked("1.2.3.4", at(0)).is_allowed());
    }

    #[test]
    fn test_attempts_left_counts_down() {
        let guard = guard();
        assert_eq!(guard.record_failure("1.2.3.4", at(0)), FailureOutcome::AttemptsLeft(4));
        assert_eq!(guard.record_failure("1.2.3.4", at(1)), FailureOutcome::AttemptsLeft(3));
        assert_eq!(guard.record_failure("1.2.3.4", at(2)), FailureOutcome::AttemptsLeft(2));
        assert_eq!(guard.record_failure("1.2.3.4", at(3)), FailureOutcome::AttemptsLeft(1));
        assert_eq!(guard.record_failure("1.2.3.4", at(4)), FailureOutcome::AttemptsLeft(0));
    }

    #[test]
    fn test_sixth_failure_in_window_blocks_for_a_minute() {
        let guard = guard();
        let outcome = fail_until_blocked(&guard, "1.2.3.4", 0);
        assert_eq!(outcome, FailureOutcome::Block { duration: Duration::seconds(60) });
        assert!(outcome.should_block());

        let decision = guard.is_blocked("1.2.3.4", at(51));
        let denial = decision.denial().expect("blocked");
        assert_eq!(denial.reason, DenyReason::RateLimited);
        assert_eq!(denial.retry_after_secs, Some(59));
    }

    #[test]
    fn test_window_expiry_resets_attempts() {
        let guard = guard();
        for i in 0..5 {
            guard.record_failure("1.2.3.4", at(i));
        }
        assert_eq!(guard.record_failure("1.2.3.4", at(65)), FailureOutcome::AttemptsLeft(4));
    }

    #[test]
    fn test_block_lifts_on_expiry() {
        let guard = guard();
        fail_until_blocked(&guard, "1.2.3.4", 0);
        assert!(!guard.is_blocked("1.2.3.4", at(109)).is_allowed());
        assert!(guard.is_blocked("1.2.3.4", at(110)).is_allowed());
        assert_eq!(guard.record_failure("1.2.3.4", at(111)), FailureOutcome::AttemptsLeft(4));
    }

    #[test]
    fn test_repeated_blocks_double_up_to_cap() {
        let guard = guard();
        let mut start = 0;
        let expected = [60, 120, 240, 480, 960, 1920, 3600, 3600];
        for (n, secs) in expected.iter().enumerate() {
            let outcome = fail_until_blocked(&guard, "1.2.3.4", start);
            assert_eq!(
                outcome,
                FailureOutcome::Block { duration: Duration::seconds(*secs) },
                "block #{}",
                n + 1
            );
            // Resume right after the block ends.
            start += 50 + secs;
        }
    }

    #[test]
    fn test_success_resets_escalation() {
        let guard = guard();
        fail_until_blocked(&guard, "1.2.3.4", 0);
        fail_until_blocked(&guard, "1.2.3.4", 110);
        guard.record_success("1.2.3.4");
        assert_eq!(guard.len(), 0);

        let outcome = fail_until_blocked(&guard, "1.2.3.4", 400);
        assert_eq!(outcome, FailureOutcome::Block { duration: Duration::seconds(60) });
    }

    #[test]
    fn test_failure_while_blocked_does_not_escalate() {
        let guard = guard();
        fail_until_blocked(&guard, "1.2.3.4", 0);

        let outcome = guard.record_failure("1.2.3.4", at(80));
        assert_eq!(outcome, FailureOutcome::Block { duration: Duration::seconds(30) });

        let denial = *guard.is_blocked("1.2.3.4", at(80)).denial().expect("blocked");
        assert_eq!(denial.retry_after_secs, Some(30));

        // The next offense is only the second block.
        let outcome = fail_until_blocked(&guard, "1.2.3.4", 110);
        assert_eq!(outcome, FailureOutcome::Block { duration: Duration::seconds(120) });
    }

    #[test]
    fn test_concurrent_failures_block_once() {
        use std::sync::Barrier;

        let guard = guard();
        for i in 0..4 {
            guard.record_failure("1.2.3.4", at(i));
        }

        // Every request checks before any of them records.
        let barrier = Barrier::new(4);
        let (guard, barrier) = (&guard, &barrier);
        let outcomes: Vec<FailureOutcome> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    s.spawn(move || {
                        let _ = guard.is_blocked("1.2.3.4", at(10));
                        barrier.wait();
                        guard.record_failure("1.2.3.4", at(10))
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let sixty = FailureOutcome::Block { duration: Duration::seconds(60) };
        assert_eq!(outcomes.iter().filter(|o| **o == sixty).count(), 3);
        assert!(outcomes.contains(&FailureOutcome::AttemptsLeft(0)));

        let denial = *guard.is_blocked("1.2.3.4", at(10)).denial().expect("blocked");
        assert_eq!(denial.retry_after_secs, Some(60));
    }

    #[test]
    fn test_cleanup_keeps_active_window_and_block() {
        let guard = guard();
        guard.record_failure("counting", at(0));
        fail_until_blocked(&guard, "blocked", 0);

        assert_eq!(guard.cleanup(at(30)), 0);
        assert_eq!(guard.len(), 2);

        // Window over for "counting"; block over at 110 but still remembered.
        assert_eq!(guard.cleanup(at(200)), 1);
        assert_eq!(guard.len(), 1);

        assert_eq!(guard.cleanup(at(110 + 600)), 0);
        assert_eq!(guard.cleanup(at(110 + 601)), 1);
        assert_eq!(guard.len(), 0);
    }

    #[test]
    fn test_cleanup_preserves_escalation_memory() {
        let guard = guard();
        fail_until_blocked(&guard, "1.2.3.4", 0);
        // Block expired at 110; a sweep inside the memory period keeps the count.
        guard.cleanup(at(300));
        let outcome = fail_until_blocked(&guard, "1.2.3.4", 300);
        assert_eq!(outcome, FailureOutcome::Block { duration: Duration::seconds(120) });
    }

    #[test]
    fn test_long_blocks_stay_within_cap() {
        let guard = LoginGuard::new(&LoginGuardSettings {
            base_block_secs: DAY_SECS,
            max_block_secs: 7 * DAY_SECS,
            ..LoginGuardSettings::default()
        });
        assert_eq!(guard.block_duration(1), Duration::days(1));
        assert_eq!(guard.block_duration(4), Duration::days(7));
        assert_eq!(guard.block_duration(u32::MAX), Duration::days(7));
    }

    #[test]
    fn test_settings_validation() {
        assert!(LoginGuardSettings::default().validate().is_ok());

        let zero_block = LoginGuardSettings {
            base_block_secs: 0,
            ..LoginGuardSettings::default()
        };
        assert!(zero_block.validate().is_err());

        let inverted_cap = LoginGuardSettings {
            base_block_secs: 600,
            max_block_secs: 60,
            ..LoginGuardSettings::default()
        };
        assert!(inverted_cap.validate().is_err());

        let negative_window = LoginGuardSettings {
            attempt_window_secs: -1,
            ..LoginGuardSettings::default()
        };
        assert!(negative_window.validate().is_err());
    }
}
