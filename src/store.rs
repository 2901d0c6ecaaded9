//! Storage strategies for subject state.
//!
//! A [`StateStore`] is the only thing the orchestrator talks to. Both stores here are backed
//! by a [`TimerCache`] whose companion slot holds the subject's [`LeakyBucket`] in throttle
//! mode. [`EncodedStateStore`] keeps counters as bytes through a [`StateCodec`], for hosts that
//! want the cached values in a portable form.
//!
//! Counters are always written back with `update`, so persisting never moves the window.
//!
//! Every store also owns the [`KeyLocks`] that serialize decisions per subject, so any number
//! of raters bound to one store see one lock per key.

use crate::bucket::LeakyBucket;
use crate::cache::{CacheKey, EvictionCallback, TimerCache};
use crate::error::CodecError;
use crate::state::SubjectState;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Stripe count used by the built-in stores.
pub const LOCK_STRIPES: usize = 64;

/// Fixed set of mutexes; a key always maps to the same one.
pub struct KeyLocks {
    stripes: Box<[Mutex<()>]>,
}

impl KeyLocks {
    pub fn new(stripes: usize) -> Self {
        Self { stripes: (0..stripes.max(1)).map(|_| Mutex::new(())).collect() }
    }

    fn index<K: Hash + ?Sized>(&self, key: &K) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.stripes.len() as u64) as usize
    }

    /// Block until `key`'s stripe is free. Never hold the guard across an `.await`.
    pub fn lock<K: Hash + ?Sized>(&self, key: &K) -> MutexGuard<'_, ()> {
        self.stripes[self.index(key)].lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for KeyLocks {
    fn default() -> Self {
        Self::new(LOCK_STRIPES)
    }
}

impl fmt::Debug for KeyLocks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyLocks").field("stripes", &self.stripes.len()).finish()
    }
}

/// Shared handle to a store; clone it into several raters for one common keyspace.
pub type SubjectStore<K> = Arc<dyn StateStore<K>>;

/// Keyed subject state with expiry.
///
/// Missing keys are reported as `false`/`None`.
pub trait StateStore<K>: Send + Sync + fmt::Debug {
    /// Current counters of a live subject.
    fn load(&self, key: &K) -> Option<SubjectState>;

    /// Start a window for `key`, replacing whatever was there.
    fn create(&self, key: K, state: SubjectState, bucket: Option<LeakyBucket>, ttl: Duration)
        -> bool;

    /// Persist counters without touching the timer. `false` if the subject is gone.
    fn store(&self, key: &K, state: SubjectState) -> bool;

    /// The subject's throttle bucket, if it has one.
    fn bucket(&self, key: &K) -> Option<Arc<LeakyBucket>>;

    /// Move the end of the window to `ttl` from now.
    fn expire(&self, key: &K, ttl: Duration) -> bool;

    /// Run `callback` once when the subject's window expires.
    fn on_evict(&self, key: &K, callback: EvictionCallback, ttl: Option<Duration>) -> bool;

    /// Time left in the subject's window.
    fn remaining(&self, key: &K) -> Option<Duration>;

    /// Drop the subject silently.
    fn delete(&self, key: &K) -> bool;

    /// Drop every subject silently.
    fn clear(&self);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Per-key locks shared by every rater bound to this store.
    fn locks(&self) -> &KeyLocks;
}

/// Counters kept as plain values.
pub struct MemoryStateStore<K> {
    cache: TimerCache<K, SubjectState, LeakyBucket>,
    locks: Arc<KeyLocks>,
}

impl<K: CacheKey> MemoryStateStore<K> {
    pub fn new() -> Self {
        Self { cache: TimerCache::new(), locks: Arc::default() }
    }

    /// Wrap into a shareable handle.
    pub fn shared() -> SubjectStore<K> {
        Arc::new(Self::new())
    }
}

impl<K: CacheKey> Default for MemoryStateStore<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> Clone for MemoryStateStore<K> {
    fn clone(&self) -> Self {
        Self { cache: self.cache.clone(), locks: self.locks.clone() }
    }
}

impl<K: CacheKey> fmt::Debug for MemoryStateStore<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStateStore").field("subjects", &self.cache.len()).finish()
    }
}

impl<K: CacheKey> StateStore<K> for MemoryStateStore<K> {
    fn load(&self, key: &K) -> Option<SubjectState> {
        self.cache.get(key)
    }

    fn create(
        &self,
        key: K,
        state: SubjectState,
        bucket: Option<LeakyBucket>,
        ttl: Duration,
    ) -> bool {
        self.cache.set(key, state, bucket, ttl)
    }

    fn store(&self, key: &K, state: SubjectState) -> bool {
        self.cache.update(key, state)
    }

    fn bucket(&self, key: &K) -> Option<Arc<LeakyBucket>> {
        self.cache.get_companion(key)
    }

    fn expire(&self, key: &K, ttl: Duration) -> bool {
        self.cache.expire(key, ttl)
    }

    fn on_evict(&self, key: &K, callback: EvictionCallback, ttl: Option<Duration>) -> bool {
        self.cache.set_eviction_callback(key, callback, ttl)
    }

    fn remaining(&self, key: &K) -> Option<Duration> {
        self.cache.remaining(key)
    }

    fn delete(&self, key: &K) -> bool {
        self.cache.delete(key)
    }

    fn clear(&self) {
        self.cache.clear()
    }

    fn len(&self) -> usize {
        self.cache.len()
    }

    fn locks(&self) -> &KeyLocks {
        &self.locks
    }
}

/// Converts counters to and from bytes.
pub trait StateCodec: Send + Sync + fmt::Debug + 'static {
    fn encode(&self, state: &SubjectState) -> Result<Vec<u8>, CodecError>;
    fn decode(&self, bytes: &[u8]) -> Result<SubjectState, CodecError>;
}

/// Fixed 8-byte layout: `processed` then `warnings`, both big-endian `u32`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompactCodec;

impl CompactCodec {
    const LEN: usize = 8;
}

impl StateCodec for CompactCodec {
    fn encode(&self, state: &SubjectState) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::with_capacity(Self::LEN);
        out.extend_from_slice(&state.processed.to_be_bytes());
        out.extend_from_slice(&state.warnings.to_be_bytes());
        Ok(out)
    }

    fn decode(&self, bytes: &[u8]) -> Result<SubjectState, CodecError> {
        let (processed, warnings) = match bytes {
            [p0, p1, p2, p3, w0, w1, w2, w3] => {
                ([*p0, *p1, *p2, *p3], [*w0, *w1, *w2, *w3])
            }
            _ => return Err(CodecError::Length { expected: Self::LEN, got: bytes.len() }),
        };
        Ok(SubjectState::new(u32::from_be_bytes(processed), u32::from_be_bytes(warnings)))
    }
}

/// JSON object with `processed` and `warnings` fields.
#[cfg(feature = "serde")]
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

#[cfg(feature = "serde")]
impl StateCodec for JsonCodec {
    fn encode(&self, state: &SubjectState) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(state)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<SubjectState, CodecError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Counters kept as encoded bytes.
///
/// A payload that fails to decode is logged and treated as a missing subject, so the next
/// event starts a fresh window over it.
pub struct EncodedStateStore<K, C> {
    cache: TimerCache<K, Vec<u8>, LeakyBucket>,
    codec: C,
    locks: Arc<KeyLocks>,
}

impl<K: CacheKey, C: StateCodec> EncodedStateStore<K, C> {
    pub fn new(codec: C) -> Self {
        Self { cache: TimerCache::new(), codec, locks: Arc::default() }
    }

    /// Raw stored payload, as the codec wrote it.
    pub fn raw(&self, key: &K) -> Option<Vec<u8>> {
        self.cache.get(key)
    }

    fn encode(&self, key: &K, state: &SubjectState) -> Option<Vec<u8>> {
        match self.codec.encode(state) {
            Ok(bytes) => Some(bytes),
            Err(error) => {
                tracing::warn!(key = ?key, %error, "failed to encode subject state");
                None
            }
        }
    }
}

impl<K: Clone, C: Clone> Clone for EncodedStateStore<K, C> {
    fn clone(&self) -> Self {
        Self { cache: self.cache.clone(), codec: self.codec.clone(), locks: self.locks.clone() }
    }
}

impl<K: CacheKey, C: StateCodec> fmt::Debug for EncodedStateStore<K, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncodedStateStore")
            .field("codec", &self.codec)
            .field("subjects", &self.cache.len())
            .finish()
    }
}

impl<K: CacheKey, C: StateCodec> StateStore<K> for EncodedStateStore<K, C> {
    fn load(&self, key: &K) -> Option<SubjectState> {
        let bytes = self.cache.get(key)?;
        match self.codec.decode(&bytes) {
            Ok(state) => Some(state),
            Err(error) => {
                tracing::warn!(key = ?key, %error, "discarding undecodable subject state");
                None
            }
        }
    }

    fn create(
        &self,
        key: K,
        state: SubjectState,
        bucket: Option<LeakyBucket>,
        ttl: Duration,
    ) -> bool {
        match self.encode(&key, &state) {
            Some(bytes) => self.cache.set(key, bytes, bucket, ttl),
            None => false,
        }
    }

    fn store(&self, key: &K, state: SubjectState) -> bool {
        match self.encode(key, &state) {
            Some(bytes) => self.cache.update(key, bytes),
            None => false,
        }
    }

    fn bucket(&self, key: &K) -> Option<Arc<LeakyBucket>> {
        self.cache.get_companion(key)
    }

    fn expire(&self, key: &K, ttl: Duration) -> bool {
        self.cache.expire(key, ttl)
    }

    fn on_evict(&self, key: &K, callback: EvictionCallback, ttl: Option<Duration>) -> bool {
        self.cache.set_eviction_callback(key, callback, ttl)
    }

    fn remaining(&self, key: &K) -> Option<Duration> {
        self.cache.remaining(key)
    }

    fn delete(&self, key: &K) -> bool {
        self.cache.delete(key)
    }

    fn clear(&self) {
        self.cache.clear()
    }

    fn len(&self) -> usize {
        self.cache.len()
    }

    fn locks(&self) -> &KeyLocks {
        &self.locks
    }
}
