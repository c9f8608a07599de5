//! Durable ban storage consumed by the vote guard.
//!
//! One entry per client identifier; `upsert` replaces any earlier ban.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[async_trait]
pub trait BanStore: Send + Sync + 'static {
    /// Expiry of the ban recorded for `ip`, if any (expired entries included).
    async fn get(&self, ip: &str) -> Result<Option<DateTime<Utc>>>;

    /// Record a ban for `ip` until `until`, replacing any existing entry.
    async fn upsert(&self, ip: &str, until: DateTime<Utc>) -> Result<()>;

    /// Remove the ban entry for `ip`. Removing a missing entry is not an error.
    async fn delete(&self, ip: &str) -> Result<()>;
}

/// Process-local ban store for guard tests.
#[cfg(test)]
#[derive(Default)]
pub struct MemoryBanStore {
    bans: parking_lot::Mutex<std::collections::HashMap<String, DateTime<Utc>>>,
}

#[cfg(test)]
impl MemoryBanStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.bans.lock().len()
    }
}

#[cfg(test)]
#[async_trait]
impl BanStore for MemoryBanStore {
    async fn get(&self, ip: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.bans.lock().get(ip).copied())
    }

    async fn upsert(&self, ip: &str, until: DateTime<Utc>) -> Result<()> {
        self.bans.lock().insert(ip.to_string(), until);
        Ok(())
    }

    async fn delete(&self, ip: &str) -> Result<()> {
        self.bans.lock().remove(ip);
        Ok(())
    }
}
