// TTL cache for slow-changing reference lists with in-flight de-duplication
//
// Concurrent `get_or_load` calls for the same key share one loader
// invocation. The first caller leads the load and publishes its result,
// success or error, on a watch slot that every other caller of that key
// awaits. The slot is removed once published, so the next call after a
// failure loads again.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    fetched_at: Instant,
    generation: u64,
}

type LoadSlot<V, E> = watch::Receiver<Option<Result<V, E>>>;

/// Slots of the loads currently running. Holds only keys with a load in
/// flight.
type InFlight<V, E> = Mutex<HashMap<String, LoadSlot<V, E>>>;

enum Role<'a, V, E> {
    Cached(V),
    Follower(LoadSlot<V, E>),
    Leader(LoadLeader<'a, V, E>),
}

/// Publishes the leader's result and clears its slot on drop, also when the
/// leading call is cancelled mid-load.
struct LoadLeader<'a, V, E> {
    inflight: &'a InFlight<V, E>,
    key: String,
    sender: watch::Sender<Option<Result<V, E>>>,
    slot: LoadSlot<V, E>,
}

impl<V, E> LoadLeader<'_, V, E> {
    fn publish(&self, result: Result<V, E>) {
        self.sender.send_replace(Some(result));
    }
}

impl<V, E> Drop for LoadLeader<'_, V, E> {
    fn drop(&mut self) {
        let mut inflight = self.inflight.lock();
        if inflight
            .get(&self.key)
            .is_some_and(|slot| slot.same_channel(&self.slot))
        {
            inflight.remove(&self.key);
        }
    }
}

pub struct MetadataCache<V, E> {
    ttl: Duration,
    entries: RwLock<HashMap<String, CacheEntry<V>>>,
    inflight: InFlight<V, E>,
    next_generation: AtomicU64,
}

impl<V: Clone, E: Clone> MetadataCache<V, E> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Cached value for `key` if it is younger than the TTL
    pub fn get(&self, key: &str) -> Option<V> {
        self.entries
            .read()
            .get(key)
            .filter(|entry| entry.fetched_at.elapsed() < self.ttl)
            .map(|entry| entry.value.clone())
    }

    /// Return the cached value, or run `loader` and cache its result.
    ///
    /// Callers arriving while a load of `key` runs get that load's outcome,
    /// the error included; `force_refresh` only bypasses the TTL. A failed
    /// load leaves any previous entry in place.
    pub async fn get_or_load<F, Fut>(&self, key: &str, force_refresh: bool, loader: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let seen_generation = {
            let entries = self.entries.read();
            match entries.get(key) {
                Some(entry) if !force_refresh && entry.fetched_at.elapsed() < self.ttl => {
                    log::debug!("[METADATA CACHE] Hit for {}", key);
                    return Ok(entry.value.clone());
                }
                Some(entry) => entry.generation,
                None => 0,
            }
        };

        let leader = loop {
            match self.join_or_lead(key, seen_generation) {
                Role::Cached(value) => {
                    log::debug!("[METADATA CACHE] Reusing concurrent load for {}", key);
                    return Ok(value);
                }
                Role::Leader(leader) => break leader,
                Role::Follower(mut slot) => {
                    log::debug!("[METADATA CACHE] Joining in-flight load for {}", key);
                    let shared = slot
                        .wait_for(Option::is_some)
                        .await
                        .ok()
                        .and_then(|published| (*published).clone());
                    match shared {
                        Some(result) => return result,
                        None => log::warn!(
                            "[METADATA CACHE] Load of {} was abandoned, retrying",
                            key
                        ),
                    }
                }
            }
        };

        log::info!(
            "[METADATA CACHE] Loading {}{}",
            key,
            if force_refresh { " (forced)" } else { "" }
        );
        let result = loader().await;

        match &result {
            Ok(value) => {
                let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
                self.entries.write().insert(
                    key.to_string(),
                    CacheEntry {
                        value: value.clone(),
                        fetched_at: Instant::now(),
                        generation,
                    },
                );
            }
            Err(_) => log::warn!("[METADATA CACHE] Load of {} failed", key),
        }

        leader.publish(result.clone());
        result
    }

    fn join_or_lead(&self, key: &str, seen_generation: u64) -> Role<'_, V, E> {
        let mut inflight = self.inflight.lock();
        if let Some(slot) = inflight.get(key) {
            return Role::Follower(slot.clone());
        }

        // A load may have finished between the TTL check and taking the lock
        if let Some(entry) = self.entries.read().get(key) {
            if entry.generation > seen_generation {
                return Role::Cached(entry.value.clone());
            }
        }

        let (sender, slot) = watch::channel(None);
        inflight.insert(key.to_string(), slot.clone());
        Role::Leader(LoadLeader {
            inflight: &self.inflight,
            key: key.to_string(),
            sender,
            slot,
        })
    }

    pub fn invalidate(&self, key: &str) -> bool {
        self.entries.write().remove(key).is_some()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Number of keys with a load currently running
    pub fn loads_in_flight(&self) -> usize {
        self.inflight.lock().len()
    }
}

impl<V: Clone, E: Clone> Default for MetadataCache<V, E> {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}
