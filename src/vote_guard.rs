//! Abuse guard for the public vote endpoint.
//!
//! Two limits apply per client identifier:
//! - a minimum interval between accepted vote attempts, and
//! - a burst counter over a fixed window; exceeding it writes a durable ban.
//!
//! Each identifier owns a slot behind an async mutex. The ban lookup, the
//! counter update and the escalation write all happen while that slot is held,
//! so concurrent requests from one client are fully serialized and a ban is
//! visible to the very next check. Slots removed by escalation or by
//! [`VoteGuard::cleanup`] are marked retired; a request that was waiting on a
//! retired slot looks the identifier up again.
//!
//! Store failures fail closed: the request is denied with
//! [`DenyReason::StoreUnavailable`](crate::guard::DenyReason::StoreUnavailable).

use crate::ban_store::BanStore;
use crate::guard::{ceil_secs, ensure_in_range, secs_until, Decision, DAY_SECS};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Tunables for the vote guard. Defaults match the public site's policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VoteGuardSettings {
    /// Minimum seconds between two accepted vote attempts.
    pub min_interval_secs: i64,
    /// Length of the burst counting window in seconds.
    pub burst_window_secs: i64,
    /// Requests allowed per burst window; one more triggers a ban.
    pub max_requests_per_window: u32,
    /// Ban length in hours.
    pub ban_duration_hours: i64,
}

impl Default for VoteGuardSettings {
    fn default() -> Self {
        Self {
            min_interval_secs: 30,
            burst_window_secs: 5 * 60,
            max_requests_per_window: 10,
            ban_duration_hours: 12,
        }
    }
}

impl VoteGuardSettings {
    /// Reject values that would disable a limit or push a ban expiry out of range.
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure_in_range("vote_guard.min_interval_secs", self.min_interval_secs, DAY_SECS)?;
        ensure_in_range("vote_guard.burst_window_secs", self.burst_window_secs, 7 * DAY_SECS)?;
        ensure_in_range("vote_guard.ban_duration_hours", self.ban_duration_hours, 365 * 24)?;
        if self.max_requests_per_window == 0 {
            anyhow::bail!("vote_guard.max_requests_per_window must be at least 1");
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct ClientRecord {
    /// `None` until the first attempt has been counted.
    last_request_at: Option<DateTime<Utc>>,
    request_count: u32,
    window_start: DateTime<Utc>,
}

impl ClientRecord {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            last_request_at: None,
            request_count: 0,
            window_start: now,
        }
    }
}

struct Slot {
    record: ClientRecord,
    retired: bool,
}

type SharedSlot = Arc<tokio::sync::Mutex<Slot>>;

pub struct VoteGuard {
    store: Arc<dyn BanStore>,
    min_interval: Duration,
    burst_window: Duration,
    max_requests: u32,
    ban_duration: Duration,
    clients: Mutex<HashMap<String, SharedSlot>>,
}

impl VoteGuard {
    pub fn new(store: Arc<dyn BanStore>, settings: &VoteGuardSettings) -> Self {
        Self {
            store,
            min_interval: Duration::seconds(settings.min_interval_secs),
            burst_window: Duration::seconds(settings.burst_window_secs),
            max_requests: settings.max_requests_per_window,
            ban_duration: Duration::hours(settings.ban_duration_hours),
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Evaluate one vote attempt from `ip` at `now` and record it when it counts.
    pub async fn check_and_record(&self, ip: &str, now: DateTime<Utc>) -> Decision {
        loop {
            let slot = self.slot_for(ip, now);
            let mut held = slot.lock().await;
            if held.retired {
                continue;
            }
            let decision = self.evaluate(ip, &mut held, now).await;
            if held.retired {
                self.remove_slot(ip, &slot);
            }
            return decision;
        }
    }

    async fn evaluate(&self, ip: &str, slot: &mut Slot, now: DateTime<Utc>) -> Decision {
        match self.store.get(ip).await {
            Ok(Some(until)) if until > now => {
                log::warn!("vote denied: ip={} is banned for {}s", ip, secs_until(now, until));
                retire_if_unused(slot);
                return Decision::banned(Some(secs_until(now, until)));
            }
            Ok(Some(_)) => {
                log::info!("vote guard: ban for ip={} expired, removing", ip);
                if let Err(e) = self.store.delete(ip).await {
                    log::warn!("vote guard: failed to remove expired ban for ip={}: {:#}", ip, e);
                }
            }
            Ok(None) => {}
            Err(e) => {
                log::error!("vote guard: ban lookup failed for ip={}: {:#}", ip, e);
                retire_if_unused(slot);
                return Decision::store_unavailable();
            }
        }

        let record = &mut slot.record;

        if let Some(last) = record.last_request_at {
            let elapsed = now - last;
            if elapsed < self.min_interval {
                let wait = ceil_secs(self.min_interval - elapsed);
                log::warn!("vote denied: ip={} rate limited, retry in {}s", ip, wait);
                return Decision::rate_limited(wait);
            }
        }

        if now - record.window_start > self.burst_window {
            record.request_count = 0;
            record.window_start = now;
        }

        record.request_count += 1;
        record.last_request_at = Some(now);

        if record.request_count > self.max_requests {
            let Some(until) = now.checked_add_signed(self.ban_duration) else {
                log::error!("vote guard: ban expiry for ip={} is out of range", ip);
                return Decision::store_unavailable();
            };
            if let Err(e) = self.store.upsert(ip, until).await {
                // The count is kept; the next attempt in this window escalates again.
                log::error!("vote guard: failed to persist ban for ip={}: {:#}", ip, e);
                return Decision::store_unavailable();
            }
            log::warn!(
                "vote guard: banned ip={} until {} after {} requests in window",
                ip,
                until.to_rfc3339(),
                record.request_count
            );
            slot.retired = true;
            return Decision::banned_now(self.ban_duration);
        }

        Decision::Allow
    }

    /// Remove records that no longer influence any decision.
    ///
    /// A record is dropped once both its burst window and the minimum interval
    /// have elapsed; a fresh record would decide identically. Slots held by an
    /// in-flight request are skipped. Returns the number of removed records.
    pub fn cleanup(&self, now: DateTime<Utc>) -> usize {
        let snapshot: Vec<(String, SharedSlot)> = self
            .clients
            .lock()
            .iter()
            .map(|(ip, slot)| (ip.clone(), slot.clone()))
            .collect();

        let mut removed = 0;
        for (ip, slot) in snapshot {
            let Ok(mut held) = slot.try_lock() else {
                continue;
            };
            if held.retired || !self.is_stale(&held.record, now) {
                continue;
            }
            held.retired = true;
            if self.remove_slot(&ip, &slot) {
                removed += 1;
            }
        }

        if removed > 0 {
            log::info!("vote guard: cleaned up {} idle records", removed);
        }
        removed
    }

    /// Number of identifiers currently tracked in memory.
    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    fn is_stale(&self, record: &ClientRecord, now: DateTime<Utc>) -> bool {
        let interval_elapsed = record
            .last_request_at
            .map_or(true, |last| now - last >= self.min_interval);
        interval_elapsed && now - record.window_start > self.burst_window
    }

    fn slot_for(&self, ip: &str, now: DateTime<Utc>) -> SharedSlot {
        self.clients
            .lock()
            .entry(ip.to_string())
            .or_insert_with(|| {
                Arc::new(tokio::sync::Mutex::new(Slot {
                    record: ClientRecord::new(now),
                    retired: false,
                }))
            })
            .clone()
    }

    fn remove_slot(&self, ip: &str, slot: &SharedSlot) -> bool {
        let mut clients = self.clients.lock();
        match clients.get(ip) {
            Some(current) if Arc::ptr_eq(current, slot) => {
                clients.remove(ip);
                true
            }
            _ => false,
        }
    }
}

/// A slot created only to look up a ban carries no history worth keeping.
fn retire_if_unused(slot: &mut Slot) {
    if slot.record.last_request_at.is_none() {
        slot.retired = true;
    }
}
