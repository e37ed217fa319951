//! Single-process storage: one mutex over a map of expiring entries.

use async_trait::async_trait;
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tracing::trace;

use crate::{
    error::{RateLimitError, Result},
    storage::{StorageBackend, StoredValue, WindowLogAdmission},
    utils::{system_clock, Clock},
};

/// Default cap on entries kept in one timestamp list.
pub const DEFAULT_MAX_LIST_LEN: usize = 10_000;

/// Every this many operations the whole map is swept for expired entries.
const SWEEP_INTERVAL: u64 = 1024;

#[derive(Debug)]
enum Slot {
    Scalar(StoredValue),
    List(VecDeque<f64>),
}

#[derive(Debug)]
struct Entry {
    slot: Slot,
    expires_at: f64,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    operations: u64,
}

impl Inner {
    /// Evict `key` if expired, and periodically everything else that is.
    fn prepare(&mut self, key: &str, now: f64) {
        self.operations = self.operations.wrapping_add(1);
        if self.operations % SWEEP_INTERVAL == 0 {
            let before = self.entries.len();
            self.entries.retain(|_, entry| entry.expires_at > now);
            trace!(evicted = before - self.entries.len(), "Swept expired entries");
            return;
        }

        if self
            .entries
            .get(key)
            .is_some_and(|entry| entry.expires_at <= now)
        {
            self.entries.remove(key);
        }
    }
}

/// In-memory storage backend, not shared between processes.
#[derive(Debug)]
pub struct InMemoryStorage {
    inner: Mutex<Inner>,
    clock: Arc<dyn Clock>,
    max_list_len: usize,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            clock,
            max_list_len: DEFAULT_MAX_LIST_LEN,
        }
    }

    /// Cap each list at `max_list_len` entries, dropping the oldest beyond it.
    pub fn with_max_list_len(mut self, max_list_len: usize) -> Self {
        self.max_list_len = max_list_len.max(1);
        self
    }

    /// Number of live entries.
    pub fn len(&self) -> Result<usize> {
        let now = self.clock.now();
        let inner = self.lock()?;
        Ok(inner
            .entries
            .values()
            .filter(|entry| entry.expires_at > now)
            .count())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Drop every expired entry now, returning how many were removed.
    pub fn purge_expired(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut inner = self.lock()?;
        let before = inner.entries.len();
        inner.entries.retain(|_, entry| entry.expires_at > now);
        Ok(before - inner.entries.len())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| {
            RateLimitError::StorageUnavailable("in-memory storage lock poisoned".to_string())
        })
    }

    fn expiry(now: f64, ttl: Duration) -> f64 {
        now + ttl.as_secs_f64()
    }

    fn push_capped(&self, list: &mut VecDeque<f64>, value: f64) {
        list.push_back(value);
        while list.len() > self.max_list_len {
            list.pop_front();
        }
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

fn wrong_type(key: &str, expected: &str) -> RateLimitError {
    RateLimitError::Storage(format!("Key `{}` does not hold {}", key, expected))
}

#[async_trait]
impl StorageBackend for InMemoryStorage {
    async fn increment(&self, key: &str, ttl: Duration) -> Result<i64> {
        let now = self.clock.now();
        let mut inner = self.lock()?;
        inner.prepare(key, now);

        let current = match inner.entries.get(key) {
            None => 0,
            Some(Entry {
                slot: Slot::Scalar(StoredValue::Integer(value)),
                ..
            }) => *value,
            Some(_) => return Err(wrong_type(key, "an integer")),
        };

        let next = current + 1;
        inner.entries.insert(
            key.to_string(),
            Entry {
                slot: Slot::Scalar(StoredValue::Integer(next)),
                expires_at: Self::expiry(now, ttl),
            },
        );
        Ok(next)
    }

    async fn get(&self, key: &str) -> Result<Option<StoredValue>> {
        let now = self.clock.now();
        let mut inner = self.lock()?;
        inner.prepare(key, now);

        match inner.entries.get(key) {
            None => Ok(None),
            Some(Entry {
                slot: Slot::Scalar(value),
                ..
            }) => Ok(Some(*value)),
            Some(_) => Err(wrong_type(key, "a scalar")),
        }
    }

    async fn set(&self, key: &str, value: StoredValue, ttl: Duration) -> Result<()> {
        let now = self.clock.now();
        let mut inner = self.lock()?;
        inner.prepare(key, now);

        inner.entries.insert(
            key.to_string(),
            Entry {
                slot: Slot::Scalar(value),
                expires_at: Self::expiry(now, ttl),
            },
        );
        Ok(())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&StoredValue>,
        new: StoredValue,
        ttl: Duration,
    ) -> Result<bool> {
        let now = self.clock.now();
        let mut inner = self.lock()?;
        inner.prepare(key, now);

        let current = match inner.entries.get(key) {
            None => None,
            Some(Entry {
                slot: Slot::Scalar(value),
                ..
            }) => Some(value),
            Some(_) => return Err(wrong_type(key, "a scalar")),
        };

        if current != expected {
            return Ok(false);
        }

        inner.entries.insert(
            key.to_string(),
            Entry {
                slot: Slot::Scalar(new),
                expires_at: Self::expiry(now, ttl),
            },
        );
        Ok(true)
    }

    async fn append_to_list(&self, key: &str, value: f64, ttl: Duration) -> Result<usize> {
        let now = self.clock.now();
        let mut inner = self.lock()?;
        inner.prepare(key, now);

        let entry = inner.entries.entry(key.to_string()).or_insert_with(|| Entry {
            slot: Slot::List(VecDeque::new()),
            expires_at: now,
        });
        let Slot::List(list) = &mut entry.slot else {
            return Err(wrong_type(key, "a list"));
        };

        self.push_capped(list, value);
        let len = list.len();
        entry.expires_at = Self::expiry(now, ttl);
        Ok(len)
    }

    async fn read_list(&self, key: &str) -> Result<Vec<f64>> {
        let now = self.clock.now();
        let mut inner = self.lock()?;
        inner.prepare(key, now);

        match inner.entries.get(key) {
            None => Ok(Vec::new()),
            Some(Entry {
                slot: Slot::List(list),
                ..
            }) => Ok(list.iter().copied().collect()),
            Some(_) => Err(wrong_type(key, "a list")),
        }
    }

    async fn trim_list(&self, key: &str, cutoff: f64) -> Result<usize> {
        let now = self.clock.now();
        let mut inner = self.lock()?;
        inner.prepare(key, now);

        let remaining = match inner.entries.get_mut(key) {
            None => return Ok(0),
            Some(Entry {
                slot: Slot::List(list),
                ..
            }) => {
                list.retain(|&timestamp| timestamp > cutoff);
                list.len()
            }
            Some(_) => return Err(wrong_type(key, "a list")),
        };

        if remaining == 0 {
            inner.entries.remove(key);
        }
        Ok(remaining)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut inner = self.lock()?;
        inner.entries.remove(key);
        Ok(())
    }

    async fn record_in_window(
        &self,
        key: &str,
        now: f64,
        cutoff: f64,
        limit: u64,
        ttl: Duration,
    ) -> Result<WindowLogAdmission> {
        let clock_now = self.clock.now();
        let mut inner = self.lock()?;
        inner.prepare(key, clock_now);

        let entry = inner.entries.entry(key.to_string()).or_insert_with(|| Entry {
            slot: Slot::List(VecDeque::new()),
            expires_at: clock_now,
        });
        let Slot::List(list) = &mut entry.slot else {
            return Err(wrong_type(key, "a list"));
        };

        list.retain(|&timestamp| timestamp > cutoff);
        let prior_count = list.len();
        let admitted = (prior_count as u64) < limit;

        if admitted {
            self.push_capped(list, now);
            entry.expires_at = Self::expiry(clock_now, ttl);
        }

        let oldest = list.iter().copied().reduce(f64::min);
        if list.is_empty() {
            inner.entries.remove(key);
        }

        Ok(WindowLogAdmission {
            admitted,
            prior_count,
            oldest,
        })
    }
}
