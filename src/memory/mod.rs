//! Two-tier memory store.
//!
//! The cache tier is fast and lossy; the durable log tier is the source of
//! truth. A cache miss is always answerable from the log, and the portfolio
//! key has a single-writer lease held only during execution.

pub mod cache;
pub mod lease;
pub mod log;

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde_json::Value;

use crate::config::now_ts;
pub use cache::Cache;
pub use lease::{LeaseGuard, PortfolioLease};
pub use log::{
    DurableLog, FactorScore, LearningRecord, LearningSummary, Outcome, RiskEvent, Severity,
    StageRow,
};

#[derive(Debug, Clone, Copy)]
pub enum Tier {
    /// Best-effort, optionally expiring. Loss is acceptable.
    Cache { ttl: Option<Duration> },
    /// Written to sqlite before the call returns.
    Durable,
}

pub struct MemoryStore {
    cache: Cache,
    log: Mutex<DurableLog>,
    lease: PortfolioLease,
}

impl MemoryStore {
    pub fn open(path: &str) -> Result<Self> {
        Ok(Self {
            cache: Cache::new(),
            log: Mutex::new(DurableLog::open(path)?),
            lease: PortfolioLease::new(),
        })
    }

    pub fn put(&self, key: &str, value: Value, tier: Tier) -> Result<()> {
        match tier {
            Tier::Cache { ttl } => {
                self.cache.put(key, value, ttl);
                Ok(())
            }
            Tier::Durable => {
                self.log()?.kv_put(key, &value, now_ts())?;
                // Keep the cache warm for readers; a null tombstone evicts
                // instead.
                if value.is_null() {
                    self.cache.remove(key);
                } else {
                    self.cache.put(key, value, None);
                }
                Ok(())
            }
        }
    }

    /// Cache first, then the durable tier; a durable hit repopulates the cache.
    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        if let Some(v) = self.cache.get(key) {
            return Ok(Some(v));
        }
        match self.log()?.kv_get(key)? {
            Some(v) => {
                self.cache.put(key, v.clone(), None);
                Ok(Some(v))
            }
            None => Ok(None),
        }
    }

    /// Drop the whole cache tier. Correctness must not depend on it.
    pub fn drop_cache(&self) {
        self.cache.clear();
    }

    pub fn acquire_portfolio_lease(&self) -> Option<LeaseGuard> {
        self.lease.acquire()
    }

    pub fn portfolio_lease_held(&self) -> bool {
        self.lease.is_held()
    }

    pub fn log(&self) -> Result<MutexGuard<'_, DurableLog>> {
        self.log.lock().map_err(|_| anyhow!("memory log poisoned"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::NamedTempFile;

    fn open_temp() -> (MemoryStore, NamedTempFile) {
        let f = NamedTempFile::new().unwrap();
        let store = MemoryStore::open(f.path().to_str().unwrap()).unwrap();
        (store, f)
    }

    #[test]
    fn test_durable_survives_cache_loss() {
        let (store, _f) = open_temp();
        store
            .put("portfolio", json!({"cash": 5000.0}), Tier::Durable)
            .unwrap();
        store
            .put("scratch", json!("gone soon"), Tier::Cache { ttl: None })
            .unwrap();

        store.drop_cache();

        assert_eq!(
            store.get("portfolio").unwrap().unwrap()["cash"],
            5000.0
        );
        assert!(store.get("scratch").unwrap().is_none());
    }

    #[test]
    fn test_lease_exclusive_through_facade() {
        let (store, _f) = open_temp();
        let guard = store.acquire_portfolio_lease().unwrap();
        assert!(store.acquire_portfolio_lease().is_none());
        drop(guard);
        assert!(store.acquire_portfolio_lease().is_some());
    }

    #[test]
    fn test_null_tombstone_evicts_cached_value() {
        let (store, _f) = open_temp();
        store.put("flag", json!({"set": true}), Tier::Durable).unwrap();
        assert!(store.cache.get("flag").is_some());
        store.put("flag", Value::Null, Tier::Durable).unwrap();
        assert!(store.cache.get("flag").is_none());
        // The durable row still answers, with the tombstone.
        assert_eq!(store.get("flag").unwrap(), Some(Value::Null));
    }

    #[test]
    fn test_durable_hit_repopulates_cache() {
        let (store, _f) = open_temp();
        store.put("k", json!(42), Tier::Durable).unwrap();
        store.drop_cache();
        // First read goes to sqlite, second should hit the cache; both agree.
        assert_eq!(store.get("k").unwrap().unwrap(), json!(42));
        assert_eq!(store.cache.get("k").unwrap(), json!(42));
    }
}
