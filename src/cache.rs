//! Single-flight cache for shared named resources.
//!
//! Concurrent `get_or_create` calls for one key converge on a single loader:
//! the first caller claims a `Loading` slot and runs the loader, later callers
//! subscribe to that slot and receive the same outcome. Successful values stay
//! cached (optionally for a TTL); failures are evicted so the next call retries.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

type Shared<V, E> = Option<Result<V, Arc<E>>>;

enum Slot<V, E> {
    Loading {
        generation: u64,
        outcome: watch::Receiver<Shared<V, E>>,
    },
    Ready {
        value: V,
        loaded_at: Instant,
    },
}

enum Claim<V, E> {
    Hit(V),
    Wait(watch::Receiver<Shared<V, E>>),
    Load(watch::Sender<Shared<V, E>>, u64),
}

pub struct SingleFlightCache<K, V, E> {
    kind: &'static str,
    ttl: Option<Duration>,
    pinned: fn(&V) -> bool,
    slots: Mutex<HashMap<K, Slot<V, E>>>,
    generation: AtomicU64,
}

impl<K, V, E> SingleFlightCache<K, V, E>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
    V: Clone,
{
    /// `kind` only labels log events, e.g. "security group".
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            ttl: None,
            pinned: |_| false,
            slots: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl;
        self
    }

    /// Values for which `pinned` holds never expire, e.g. ones holding a secret
    /// that a reload could not recover. `invalidate` still drops them.
    pub fn with_pinned(mut self, pinned: fn(&V) -> bool) -> Self {
        self.pinned = pinned;
        self
    }

    /// Return the cached value for `key`, or run `loader` to produce it.
    ///
    /// At most one loader runs per key at a time. Callers that arrive while it
    /// runs wait for it and share its result, error included. If the loading
    /// caller is dropped mid-load, waiters start over and one of them takes over.
    pub async fn get_or_create<F, Fut>(&self, key: K, loader: F) -> Result<V, Arc<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let (sender, generation) = loop {
            match self.claim(&key) {
                Claim::Hit(value) => {
                    debug!(kind = self.kind, ?key, "cache hit");
                    return Ok(value);
                }
                Claim::Wait(mut outcome) => {
                    debug!(kind = self.kind, ?key, "waiting on in-flight load");
                    if let Ok(shared) = outcome.wait_for(Option::is_some).await {
                        if let Some(result) = shared.as_ref() {
                            return result.clone();
                        }
                    }
                    debug!(kind = self.kind, ?key, "in-flight load abandoned, retrying");
                }
                Claim::Load(sender, generation) => break (sender, generation),
            }
        };

        debug!(kind = self.kind, ?key, "loading");
        let mut guard = LoadGuard {
            cache: self,
            key: Some(key),
            generation,
        };
        let result = loader().await.map_err(Arc::new);

        if let Some(key) = guard.key.take() {
            let mut slots = self.lock();
            match &result {
                Ok(value) => {
                    slots.insert(
                        key,
                        Slot::Ready {
                            value: value.clone(),
                            loaded_at: Instant::now(),
                        },
                    );
                }
                Err(_) => {
                    debug!(kind = self.kind, ?key, "load failed, evicting");
                    slots.remove(&key);
                }
            }
            sender.send_replace(Some(result.clone()));
        }
        result
    }

    /// Drop a cached value so the next request reloads it. In-flight loads are left alone.
    pub fn invalidate(&self, key: &K) {
        let mut slots = self.lock();
        if matches!(slots.get(key), Some(Slot::Ready { .. })) {
            slots.remove(key);
        }
    }

    /// Cached value for `key`, without loading.
    pub fn get(&self, key: &K) -> Option<V> {
        match self.lock().get(key) {
            Some(Slot::Ready { value, loaded_at }) if !self.expired(value, *loaded_at) => {
                Some(value.clone())
            }
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn claim(&self, key: &K) -> Claim<V, E> {
        let mut slots = self.lock();
        match slots.get(key) {
            Some(Slot::Ready { value, loaded_at }) if !self.expired(value, *loaded_at) => {
                return Claim::Hit(value.clone());
            }
            Some(Slot::Loading { outcome, .. }) => return Claim::Wait(outcome.clone()),
            _ => {}
        }
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let (sender, outcome) = watch::channel(None);
        slots.insert(
            key.clone(),
            Slot::Loading {
                generation,
                outcome,
            },
        );
        Claim::Load(sender, generation)
    }

    fn expired(&self, value: &V, loaded_at: Instant) -> bool {
        !(self.pinned)(value) && self.ttl.is_some_and(|ttl| loaded_at.elapsed() >= ttl)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, Slot<V, E>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases a `Loading` slot whose loader was dropped before finishing.
struct LoadGuard<'a, K, V, E>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
    V: Clone,
{
    cache: &'a SingleFlightCache<K, V, E>,
    key: Option<K>,
    generation: u64,
}

impl<K, V, E> Drop for LoadGuard<'_, K, V, E>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
    V: Clone,
{
    fn drop(&mut self) {
        let Some(key) = self.key.take() else {
            return;
        };
        let mut slots = self.cache.lock();
        if matches!(
            slots.get(&key),
            Some(Slot::Loading { generation, .. }) if *generation == self.generation
        ) {
            slots.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use futures_util::future::join_all;

    use super::*;

    #[derive(Debug, PartialEq)]
    struct LoadError(&'static str);

    type TestCache = SingleFlightCache<String, String, LoadError>;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_share_one_load() {
        let cache = Arc::new(TestCache::new("security group"));
        let loads = Arc::new(AtomicUsize::new(0));

        let callers = (0..16).map(|i| {
            let cache = cache.clone();
            let loads = loads.clone();
            tokio::spawn(async move {
                cache
                    .get_or_create("sg-web".to_string(), || async move {
                        loads.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok::<_, LoadError>(format!("sg-{i}"))
                    })
                    .await
            })
        });
        let results: Vec<_> = join_all(callers)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap())
            .collect();

        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|v| v == &results[0]));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn two_callers_return_after_one_slow_load() {
        let cache = Arc::new(TestCache::new("security group"));
        let loads = Arc::new(AtomicUsize::new(0));
        let start = std::time::Instant::now();

        let call = |cache: Arc<TestCache>, loads: Arc<AtomicUsize>| async move {
            cache
                .get_or_create("sg-web".to_string(), || async move {
                    loads.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok::<_, LoadError>("sg-1234".to_string())
                })
                .await
        };
        let first = tokio::spawn(call(cache.clone(), loads.clone()));
        tokio::time::sleep(Duration::from_millis(1)).await;
        let second = tokio::spawn(call(cache.clone(), loads.clone()));

        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();
        let elapsed = start.elapsed();

        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert_eq!(first, "sg-1234");
        assert_eq!(first, second);
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(190), "took {elapsed:?}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn waiters_share_the_loader_error() {
        let cache = Arc::new(TestCache::new("key pair"));
        let loads = Arc::new(AtomicUsize::new(0));

        let callers = (0..8).map(|_| {
            let cache = cache.clone();
            let loads = loads.clone();
            tokio::spawn(async move {
                cache
                    .get_or_create("kp".to_string(), || async move {
                        loads.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Err::<String, _>(LoadError("quota exceeded"))
                    })
                    .await
            })
        });
        let errors: Vec<_> = join_all(callers)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap_err())
            .collect();

        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(errors.iter().all(|e| Arc::ptr_eq(e, &errors[0])));
        assert_eq!(*errors[0], LoadError("quota exceeded"));
    }

    #[tokio::test]
    async fn failed_load_is_evicted_and_retried() {
        let cache = TestCache::new("key pair");

        let first = cache
            .get_or_create("kp".to_string(), || async { Err(LoadError("boom")) })
            .await;
        assert!(first.is_err());
        assert!(cache.is_empty());

        let second = cache
            .get_or_create("kp".to_string(), || async { Ok("kp-1".to_string()) })
            .await;
        assert_eq!(second.unwrap(), "kp-1");
    }

    #[tokio::test]
    async fn ready_value_skips_loader() {
        let cache = TestCache::new("key pair");
        cache
            .get_or_create("kp".to_string(), || async { Ok("kp-1".to_string()) })
            .await
            .unwrap();

        let loads = AtomicUsize::new(0);
        let value = cache
            .get_or_create("kp".to_string(), || async {
                loads.fetch_add(1, Ordering::SeqCst);
                Ok("kp-2".to_string())
            })
            .await
            .unwrap();
        assert_eq!(value, "kp-1");
        assert_eq!(loads.load(Ordering::SeqCst), 0);
        assert_eq!(cache.get(&"kp".to_string()).as_deref(), Some("kp-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_expiry_reloads() {
        let cache = TestCache::new("security group").with_ttl(Some(Duration::from_secs(60)));
        cache
            .get_or_create("sg".to_string(), || async { Ok("v1".to_string()) })
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(cache.get(&"sg".to_string()).as_deref(), Some("v1"));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(cache.get(&"sg".to_string()).is_none());
        let reloaded = cache
            .get_or_create("sg".to_string(), || async { Ok("v2".to_string()) })
            .await
            .unwrap();
        assert_eq!(reloaded, "v2");
    }

    #[tokio::test(start_paused = true)]
    async fn pinned_values_outlive_the_ttl() {
        let cache = TestCache::new("key pair")
            .with_ttl(Some(Duration::from_secs(60)))
            .with_pinned(|value| value.starts_with("secret"));
        for key in ["kp-a", "kp-b"] {
            let value = if key == "kp-a" { "secret-a" } else { "public-b" };
            cache
                .get_or_create(key.to_string(), || async { Ok(value.to_string()) })
                .await
                .unwrap();
        }

        tokio::time::advance(Duration::from_secs(120)).await;

        assert_eq!(cache.get(&"kp-a".to_string()).as_deref(), Some("secret-a"));
        assert!(cache.get(&"kp-b".to_string()).is_none());
        let kept = cache
            .get_or_create("kp-a".to_string(), || async { Ok("reloaded".to_string()) })
            .await
            .unwrap();
        assert_eq!(kept, "secret-a");

        cache.invalidate(&"kp-a".to_string());
        assert!(cache.get(&"kp-a".to_string()).is_none());
    }

    #[tokio::test]
    async fn invalidate_forces_reload() {
        let cache = TestCache::new("security group");
        cache
            .get_or_create("sg".to_string(), || async { Ok("v1".to_string()) })
            .await
            .unwrap();
        cache.invalidate(&"sg".to_string());

        let value = cache
            .get_or_create("sg".to_string(), || async { Ok("v2".to_string()) })
            .await
            .unwrap();
        assert_eq!(value, "v2");
    }

    #[tokio::test]
    async fn abandoned_load_hands_over_to_waiter() {
        let cache = Arc::new(TestCache::new("security group"));

        let abandoned = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .get_or_create("sg".to_string(), || std::future::pending())
                    .await
            })
        };
        tokio::task::yield_now().await;

        let waiter = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .get_or_create("sg".to_string(), || async { Ok("v2".to_string()) })
                    .await
            })
        };
        tokio::task::yield_now().await;

        abandoned.abort();
        let _ = abandoned.await;

        assert_eq!(waiter.await.unwrap().unwrap(), "v2");
    }
}
