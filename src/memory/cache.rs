//! Ephemeral cache tier. Contents are lossy by contract: anything that
//! matters is also in the durable log and can be rebuilt from it.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::Value;

struct Entry {
    value: Value,
    expires: Option<Instant>,
}

#[derive(Default)]
pub struct Cache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, key: &str, value: Value, ttl: Option<Duration>) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(
                key.to_string(),
                Entry {
                    value,
                    expires: ttl.map(|t| Instant::now() + t),
                },
            );
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let mut entries = self.entries.lock().ok()?;
        match entries.get(key) {
            Some(e) if e.expires.map(|t| t > Instant::now()).unwrap_or(true) => {
                Some(e.value.clone())
            }
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn remove(&self, key: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(key);
        }
    }

    /// Drop everything, simulating process restart or eviction.
    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }
}
