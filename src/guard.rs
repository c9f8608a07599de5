//! Decision types shared by the vote and login guards.
//!
//! A guard check never fails: every outcome, including a broken ban store,
//! is expressed as a [`Decision`] for the HTTP layer to map onto a status code.

use chrono::{DateTime, Duration, Utc};

/// Bucket used when the client address cannot be resolved.
pub const UNKNOWN_CLIENT: &str = "unknown";

pub const DAY_SECS: i64 = 24 * 60 * 60;

/// Fail unless `value` lies in `1..=max`.
pub fn ensure_in_range(name: &str, value: i64, max: i64) -> anyhow::Result<()> {
    if !(1..=max).contains(&value) {
        anyhow::bail!("{} must be between 1 and {}, got {}", name, max, value);
    }
    Ok(())
}

/// Why a guard refused a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// Too soon after the previous request, or temporarily blocked.
    RateLimited,
    /// An existing ban is still in force.
    Banned,
    /// This very request crossed the burst threshold and triggered a ban.
    BannedNow,
    /// The durable ban store could not be consulted; the guard failed closed.
    StoreUnavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Denial {
    pub reason: DenyReason,
    /// Seconds until the client may retry, when known.
    pub retry_after_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(Denial),
}

impl Decision {
    pub fn rate_limited(retry_after_secs: u64) -> Self {
        Decision::Deny(Denial {
            reason: DenyReason::RateLimited,
            retry_after_secs: Some(retry_after_secs),
        })
    }

    pub fn banned(retry_after_secs: Option<u64>) -> Self {
        Decision::Deny(Denial {
            reason: DenyReason::Banned,
            retry_after_secs,
        })
    }

    pub fn banned_now(ban: Duration) -> Self {
        Decision::Deny(Denial {
            reason: DenyReason::BannedNow,
            retry_after_secs: Some(ceil_secs(ban)),
        })
    }

    pub fn store_unavailable() -> Self {
        Decision::Deny(Denial {
            reason: DenyReason::StoreUnavailable,
            retry_after_secs: None,
        })
    }

    #[cfg(test)]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }

    #[cfg(test)]
    pub fn denial(&self) -> Option<&Denial> {
        match self {
            Decision::Allow => None,
            Decision::Deny(denial) => Some(denial),
        }
    }
}

/// Whole seconds remaining in `duration`, rounded up. Negative spans count as zero.
pub fn ceil_secs(duration: Duration) -> u64 {
    let millis = duration.num_milliseconds();
    if millis <= 0 {
        return 0;
    }
    (millis as u64).div_ceil(1000)
}

/// Seconds from `now` until `until`, rounded up.
pub fn secs_until(now: DateTime<Utc>, until: DateTime<Utc>) -> u64 {
    ceil_secs(until - now)
}

/// Normalize a raw client address into a table key.
///
/// Forwarded headers may carry a list; the left-most entry is the originating client.
pub fn client_key(raw: Option<&str>) -> String {
    raw.and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
}
