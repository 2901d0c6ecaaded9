//! Lazily-expiring key/value cache driven by per-entry Tokio timers.
//!
//! Every entry owns exactly one pending expiry timer. Replacing the timer (`expire`,
//! `set_eviction_callback` with a ttl, overwriting `set`) aborts the previous one; a
//! generation number stamped on each timer makes a timer that already woke up but lost the
//! race to a replacement a no-op.
//!
//! Semantics:
//! - Timer expiry is the only *eviction*. It removes the entry, tears down its companion and
//!   then awaits the attached eviction callback, if any, exactly once.
//! - `delete`, `clear` and overwriting `set` are silent: the callback is dropped unrun.
//! - Missing keys are reported as `false`/`None`, never as errors.
//!
//! All scheduling goes through `tokio::spawn`, so mutating calls must happen inside a Tokio
//! runtime.

use futures::future::BoxFuture;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// One-shot action run when an entry is evicted by its timer.
pub type EvictionCallback = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Bounds required of cache keys.
pub trait CacheKey: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static {}

impl<T> CacheKey for T where T: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static {}

/// Side object stored next to a cached value.
///
/// The cache calls [`Companion::teardown`] whenever the entry holding it leaves the map, so
/// background work owned by the companion stops with its entry instead of whenever the last
/// clone happens to drop.
pub trait Companion: Send + Sync + 'static {
    /// Release resources held by the companion. Must be idempotent.
    fn teardown(&self) {}
}

impl Companion for () {}

struct CacheEntry<V, C> {
    value: V,
    companion: Option<Arc<C>>,
    timer: JoinHandle<()>,
    generation: u64,
    deadline: Instant,
    on_evict: Option<EvictionCallback>,
}

impl<V, C: Companion> CacheEntry<V, C> {
    /// Cancel the timer and release the companion; the callback is dropped unrun.
    fn discard(self) {
        self.timer.abort();
        if let Some(companion) = self.companion {
            companion.teardown();
        }
    }
}

struct Inner<K, V, C: Companion> {
    entries: HashMap<K, CacheEntry<V, C>>,
    next_generation: u64,
}

impl<K, V, C: Companion> Drop for Inner<K, V, C> {
    fn drop(&mut self) {
        for (_, entry) in self.entries.drain() {
            entry.discard();
        }
    }
}

/// Key/value cache whose entries expire on their own timers.
///
/// Clones share the same underlying map, which is how several raters can be bound to one
/// keyspace.
pub struct TimerCache<K, V, C: Companion = ()> {
    inner: Arc<Mutex<Inner<K, V, C>>>,
}

impl<K, V, C: Companion> Clone for TimerCache<K, V, C> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<K, V, C: Companion> fmt::Debug for TimerCache<K, V, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let len = lock(&self.inner).entries.len();
        f.debug_struct("TimerCache").field("len", &len).finish()
    }
}

impl<K, V, C: Companion> Default for TimerCache<K, V, C> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner { entries: HashMap::new(), next_generation: 0 })),
        }
    }
}

/// Stand-in deadline for ttls that run past what `Instant` can represent.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `ttl` from now, saturating instead of overflowing `Instant`.
pub(crate) fn deadline_after(ttl: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(ttl).unwrap_or_else(|| now + FAR_FUTURE)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<K, V, C> TimerCache<K, V, C>
where
    K: CacheKey,
    V: Send + 'static,
    C: Companion,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `value`, replacing any previous entry (and its timer) without firing its
    /// eviction callback.
    pub fn set(&self, key: K, value: V, companion: Option<C>, ttl: Duration) -> bool {
        let mut guard = lock(&self.inner);
        let previous = self.insert_locked(&mut guard, key, value, companion, ttl);
        drop(guard);
        if let Some(previous) = previous {
            previous.discard();
        }
        true
    }

    /// Clone out the stored value.
    pub fn get(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        lock(&self.inner).entries.get(key).map(|e| e.value.clone())
    }

    /// Shared handle to the entry's companion, if both exist.
    pub fn get_companion(&self, key: &K) -> Option<Arc<C>> {
        lock(&self.inner).entries.get(key).and_then(|e| e.companion.clone())
    }

    /// Replace the stored value, leaving the timer untouched.
    pub fn update(&self, key: &K, value: V) -> bool {
        match lock(&self.inner).entries.get_mut(key) {
            Some(entry) => {
                entry.value = value;
                true
            }
            None => false,
        }
    }

    /// `update` if present, otherwise `set` with `ttl` and no companion.
    pub fn upsert(&self, key: K, value: V, ttl: Duration) -> bool {
        let mut guard = lock(&self.inner);
        if let Some(entry) = guard.entries.get_mut(&key) {
            entry.value = value;
            return true;
        }
        self.insert_locked(&mut guard, key, value, None, ttl);
        true
    }

    /// Cancel the current timer and schedule a fresh one `ttl` from now.
    pub fn expire(&self, key: &K, ttl: Duration) -> bool {
        let mut guard = lock(&self.inner);
        self.reschedule_locked(&mut guard, key, ttl)
    }

    /// Remove the entry silently: its timer is cancelled and its callback never runs.
    pub fn delete(&self, key: &K) -> bool {
        let removed = lock(&self.inner).entries.remove(key);
        match removed {
            Some(entry) => {
                entry.discard();
                true
            }
            None => false,
        }
    }

    /// Attach a one-shot callback run when the entry expires.
    ///
    /// Keeps the remaining time of the current timer unless `ttl` is given, in which case the
    /// timer is rescheduled. Replaces a previously attached callback.
    pub fn set_eviction_callback(
        &self,
        key: &K,
        callback: EvictionCallback,
        ttl: Option<Duration>,
    ) -> bool {
        let mut guard = lock(&self.inner);
        let Some(entry) = guard.entries.get_mut(key) else { return false };
        entry.on_evict = Some(callback);
        match ttl {
            Some(ttl) => self.reschedule_locked(&mut guard, key, ttl),
            None => true,
        }
    }

    /// Time left before the entry's timer fires.
    pub fn remaining(&self, key: &K) -> Option<Duration> {
        lock(&self.inner)
            .entries
            .get(key)
            .map(|e| e.deadline.saturating_duration_since(Instant::now()))
    }

    pub fn contains(&self, key: &K) -> bool {
        lock(&self.inner).entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry silently.
    pub fn clear(&self) {
        let drained: Vec<_> = lock(&self.inner).entries.drain().map(|(_, e)| e).collect();
        for entry in drained {
            entry.discard();
        }
    }

    fn insert_locked(
        &self,
        inner: &mut Inner<K, V, C>,
        key: K,
        value: V,
        companion: Option<C>,
        ttl: Duration,
    ) -> Option<CacheEntry<V, C>> {
        let generation = bump(inner);
        let timer = self.schedule(key.clone(), generation, ttl);
        let entry = CacheEntry {
            value,
            companion: companion.map(Arc::new),
            timer,
            generation,
            deadline: deadline_after(ttl),
            on_evict: None,
        };
        inner.entries.insert(key, entry)
    }

    fn reschedule_locked(&self, inner: &mut Inner<K, V, C>, key: &K, ttl: Duration) -> bool {
        if !inner.entries.contains_key(key) {
            return false;
        }
        let generation = bump(inner);
        let timer = self.schedule(key.clone(), generation, ttl);
        match inner.entries.get_mut(key) {
            Some(entry) => {
                entry.timer.abort();
                entry.timer = timer;
                entry.generation = generation;
                entry.deadline = deadline_after(ttl);
                true
            }
            None => {
                timer.abort();
                false
            }
        }
    }

    fn schedule(&self, key: K, generation: u64, ttl: Duration) -> JoinHandle<()> {
        let cache = Arc::downgrade(&self.inner);
        tokio::spawn(evict_later(cache, key, generation, ttl))
    }
}

fn bump<K, V, C: Companion>(inner: &mut Inner<K, V, C>) -> u64 {
    inner.next_generation = inner.next_generation.wrapping_add(1);
    inner.next_generation
}

async fn evict_later<K, V, C>(
    cache: Weak<Mutex<Inner<K, V, C>>>,
    key: K,
    generation: u64,
    ttl: Duration,
) where
    K: CacheKey,
    V: Send + 'static,
    C: Companion,
{
    tokio::time::sleep(ttl).await;

    let evicted = {
        let Some(inner) = cache.upgrade() else { return };
        let mut guard = lock(&inner);
        let current = guard.entries.get(&key).map(|e| e.generation);
        if current == Some(generation) {
            guard.entries.remove(&key)
        } else {
            None
        }
    };

    let Some(entry) = evicted else { return };
    tracing::debug!(key = ?key, "cache entry expired");
    if let Some(companion) = entry.companion {
        companion.teardown();
    }
    if let Some(callback) = entry.on_evict {
        callback().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn counting_callback(counter: &Arc<AtomicUsize>) -> EvictionCallback {
        let counter = counter.clone();
        Box::new(move || {
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        })
    }

    #[derive(Default)]
    struct Probe {
        torn_down: AtomicBool,
    }

    impl Companion for Probe {
        fn teardown(&self) {
            self.torn_down.store(true, Ordering::SeqCst);
        }
    }

    async fn sleep_secs(secs: f64) {
        tokio::time::sleep(Duration::from_secs_f64(secs)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn entry_expires_after_ttl() {
        let cache: TimerCache<u64, u32> = TimerCache::new();
        assert!(cache.set(1, 10, None, Duration::from_secs(5)));
        assert_eq!(cache.get(&1), Some(10));

        sleep_secs(4.9).await;
        assert!(cache.contains(&1));

        sleep_secs(0.2).await;
        assert!(!cache.contains(&1));
        assert_eq!(cache.get(&1), None);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn update_keeps_the_timer() {
        let cache: TimerCache<u64, u32> = TimerCache::new();
        cache.set(1, 0, None, Duration::from_secs(10));

        sleep_secs(6.0).await;
        assert!(cache.update(&1, 7));
        assert_eq!(cache.get(&1), Some(7));

        sleep_secs(4.5).await;
        assert!(!cache.contains(&1), "update must not extend the window");
    }

    #[tokio::test(start_paused = true)]
    async fn expire_slides_the_window() {
        let cache: TimerCache<u64, u32> = TimerCache::new();
        cache.set(1, 0, None, Duration::from_secs(4));

        for _ in 0..5 {
            sleep_secs(3.0).await;
            assert!(cache.expire(&1, Duration::from_secs(4)));
        }
        assert!(cache.contains(&1));
        assert!(cache.remaining(&1).unwrap() > Duration::from_secs(3));

        sleep_secs(4.1).await;
        assert!(!cache.contains(&1));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_keys_report_false() {
        let cache: TimerCache<u64, u32> = TimerCache::new();
        let counter = Arc::new(AtomicUsize::new(0));

        assert!(!cache.update(&9, 1));
        assert!(!cache.expire(&9, Duration::from_secs(1)));
        assert!(!cache.delete(&9));
        assert!(!cache.set_eviction_callback(&9, counting_callback(&counter), None));
        assert!(cache.get_companion(&9).is_none());
        assert!(cache.remaining(&9).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn eviction_callback_fires_once_on_expiry() {
        let cache: TimerCache<&'static str, u32> = TimerCache::new();
        let counter = Arc::new(AtomicUsize::new(0));
        cache.set("alice", 1, None, Duration::from_secs(3));

        sleep_secs(1.0).await;
        assert!(cache.set_eviction_callback(&"alice", counting_callback(&counter), None));

        // Remaining time is preserved: the entry still dies at t=3.
        sleep_secs(1.9).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        sleep_secs(0.2).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        sleep_secs(10.0).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn eviction_callback_ttl_reschedules() {
        let cache: TimerCache<u64, u32> = TimerCache::new();
        let counter = Arc::new(AtomicUsize::new(0));
        cache.set(1, 1, None, Duration::from_secs(2));
        cache.set_eviction_callback(&1, counting_callback(&counter), Some(Duration::from_secs(6)));

        sleep_secs(5.0).await;
        assert!(cache.contains(&1));
        sleep_secs(1.5).await;
        assert!(!cache.contains(&1));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduling_yields_a_single_invocation() {
        let cache: TimerCache<u64, u32> = TimerCache::new();
        let counter = Arc::new(AtomicUsize::new(0));
        cache.set(1, 1, None, Duration::from_secs(2));

        for _ in 0..4 {
            let ttl = Some(Duration::from_secs(2));
            cache.set_eviction_callback(&1, counting_callback(&counter), ttl);
            cache.expire(&1, Duration::from_secs(3));
            sleep_secs(1.0).await;
        }
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        sleep_secs(2.5).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn delete_and_overwrite_are_silent() {
        let cache: TimerCache<u64, u32> = TimerCache::new();
        let counter = Arc::new(AtomicUsize::new(0));

        cache.set(1, 1, None, Duration::from_secs(1));
        cache.set_eviction_callback(&1, counting_callback(&counter), None);
        assert!(cache.delete(&1));

        cache.set(2, 1, None, Duration::from_secs(1));
        cache.set_eviction_callback(&2, counting_callback(&counter), None);
        cache.set(2, 5, None, Duration::from_secs(1));

        sleep_secs(3.0).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn clear_drops_everything_without_callbacks() {
        let cache: TimerCache<u64, u32> = TimerCache::new();
        let counter = Arc::new(AtomicUsize::new(0));
        for key in 0..5 {
            cache.set(key, 0, None, Duration::from_secs(1));
            cache.set_eviction_callback(&key, counting_callback(&counter), None);
        }
        assert_eq!(cache.len(), 5);
        cache.clear();
        assert!(cache.is_empty());

        sleep_secs(2.0).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn upsert_inserts_then_updates() {
        let cache: TimerCache<u64, u32> = TimerCache::new();
        assert!(cache.upsert(1, 1, Duration::from_secs(2)));
        sleep_secs(1.0).await;
        assert!(cache.upsert(1, 2, Duration::from_secs(10)));
        assert_eq!(cache.get(&1), Some(2));

        sleep_secs(1.5).await;
        assert!(!cache.contains(&1), "upsert on a live key keeps the original timer");
    }

    #[tokio::test(start_paused = true)]
    async fn companion_is_torn_down_with_its_entry() {
        let cache: TimerCache<u64, u32, Probe> = TimerCache::new();
        cache.set(1, 0, Some(Probe::default()), Duration::from_secs(1));
        cache.set(2, 0, Some(Probe::default()), Duration::from_secs(10));
        let expiring = cache.get_companion(&1).unwrap();
        let deleted = cache.get_companion(&2).unwrap();

        assert!(cache.delete(&2));
        assert!(deleted.torn_down.load(Ordering::SeqCst));

        assert!(!expiring.torn_down.load(Ordering::SeqCst));
        sleep_secs(1.5).await;
        assert!(expiring.torn_down.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn huge_ttls_saturate_instead_of_overflowing() {
        let cache: TimerCache<u64, u32> = TimerCache::new();
        let counter = Arc::new(AtomicUsize::new(0));
        assert!(cache.set(1, 0, None, Duration::MAX));
        assert!(cache.expire(&1, Duration::from_secs(u64::MAX)));
        assert!(cache.set_eviction_callback(&1, counting_callback(&counter), Some(Duration::MAX)));
        assert!(cache.remaining(&1).unwrap() > Duration::from_secs(86_400 * 365));

        sleep_secs(3600.0).await;
        assert!(cache.contains(&1));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn callback_ttl_replaces_the_timer_in_one_step() {
        let cache: TimerCache<u64, u32> = TimerCache::new();
        let counter = Arc::new(AtomicUsize::new(0));
        cache.set(1, 0, None, Duration::from_secs(1));

        let ttl = Some(Duration::from_secs(4));
        assert!(cache.set_eviction_callback(&1, counting_callback(&counter), ttl));
        let remaining = cache.remaining(&1).unwrap();
        assert!(remaining > Duration::from_secs(3), "{remaining:?}");

        sleep_secs(1.5).await;
        assert!(cache.contains(&1), "the original 1s timer was cancelled");
        sleep_secs(3.0).await;
        assert!(!cache.contains(&1));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn clones_share_one_keyspace() {
        let a: TimerCache<u64, u32> = TimerCache::new();
        let b = a.clone();
        a.set(1, 3, None, Duration::from_secs(5));
        assert_eq!(b.get(&1), Some(3));
        assert!(b.delete(&1));
        assert!(!a.contains(&1));
    }
}
