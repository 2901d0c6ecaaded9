//! Per-event orchestration.
//!
//! [`Rater::handle_event`] runs one event through four steps:
//!
//! 1. Under a per-key lock: load the subject's counters, or open a new window for it.
//! 2. Still under the lock: slide the window (sliding mode), decide, write the counters back
//!    and arm the calmed notice when the decision asks for it.
//! 3. Outside the lock: send the cooldown notice and wait on the subject's bucket if needed.
//! 4. Run the action, or don't.
//!
//! A subject whose window expires between the load and the write-back is decided again from a
//! fresh window; if that also fails the event is suppressed.
//!
//! The per-key locks belong to the store, so raters sharing a store also exclude each other.

use crate::bucket::LeakyBucket;
use crate::cache::{CacheKey, EvictionCallback};
use crate::config::RaterConfig;
use crate::error::RaterError;
use crate::notify::{notify_best_effort, Notice, Notifier};
use crate::policy::{select_policy, ActionPlan, Decision, DecisionPolicy};
use crate::state::{SubjectPhase, SubjectState};
use crate::store::{MemoryStateStore, SubjectStore};
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Shared notifier handle; the calmed notice outlives the call that armed it.
pub type SharedNotifier<K> = Arc<dyn Notifier<K>>;

/// Which keyspace a rater binds to.
pub enum CacheSharing<K> {
    /// A store of its own.
    Private,
    /// A store shared with other raters.
    Unity(SubjectStore<K>),
}

impl<K> fmt::Debug for CacheSharing<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheSharing::Private => f.write_str("Private"),
            CacheSharing::Unity(store) => f.debug_tuple("Unity").field(store).finish(),
        }
    }
}

/// What happened to one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    /// The action ran within the subject's allowance.
    Proceeded(T),
    /// The action ran after the subject's bucket yielded a unit.
    Delayed(T),
    /// The action ran once past the limit as the grace call.
    Grace(T),
    /// The action was skipped; `warned` if a cooldown notice went out for it.
    Suppressed { warned: bool },
}

impl<T> Outcome<T> {
    pub fn is_suppressed(&self) -> bool {
        matches!(self, Outcome::Suppressed { .. })
    }

    /// Whether the action ran.
    pub fn ran(&self) -> bool {
        !self.is_suppressed()
    }

    /// The action's output, if it ran.
    pub fn into_value(self) -> Option<T> {
        match self {
            Outcome::Proceeded(v) | Outcome::Delayed(v) | Outcome::Grace(v) => Some(v),
            Outcome::Suppressed { .. } => None,
        }
    }

    pub fn as_value(&self) -> Option<&T> {
        match self {
            Outcome::Proceeded(v) | Outcome::Delayed(v) | Outcome::Grace(v) => Some(v),
            Outcome::Suppressed { .. } => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Proceeded(v) => Outcome::Proceeded(f(v)),
            Outcome::Delayed(v) => Outcome::Delayed(f(v)),
            Outcome::Grace(v) => Outcome::Grace(f(v)),
            Outcome::Suppressed { warned } => Outcome::Suppressed { warned },
        }
    }
}

/// Result of the locked part of an event.
struct Admission {
    plan: ActionPlan,
    state: SubjectState,
    bucket: Option<Arc<LeakyBucket>>,
}

/// Per-subject rate limiter.
///
/// Cheap to clone; clones share configuration and store.
///
/// # Examples
/// ```
/// use rater::{NoopNotifier, Outcome, Rater, RaterConfig, SharedNotifier};
/// use std::sync::Arc;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let config = RaterConfig::builder().period_secs(8).after_handle_count(2).build().unwrap();
/// let rater: Rater<u64> = Rater::new(config);
/// let notifier: SharedNotifier<u64> = Arc::new(NoopNotifier);
///
/// let first = rater.handle_event(7, &notifier, || async { Ok::<_, std::io::Error>("hi") }).await;
/// assert_eq!(first.unwrap(), Outcome::Proceeded("hi"));
/// # }
/// ```
pub struct Rater<K> {
    config: Arc<RaterConfig>,
    policy: Arc<dyn DecisionPolicy>,
    store: SubjectStore<K>,
    bucket: Option<Arc<LeakyBucket>>,
}

impl<K> Clone for Rater<K> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            policy: self.policy.clone(),
            store: self.store.clone(),
            bucket: self.bucket.clone(),
        }
    }
}

impl<K> fmt::Debug for Rater<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rater")
            .field("policy", &self.policy.name())
            .field("config", &self.config)
            .field("store", &self.store)
            .finish()
    }
}

impl<K: CacheKey> Rater<K> {
    /// Rater with a private in-memory store.
    pub fn new(config: RaterConfig) -> Self {
        Self::with_sharing(config, CacheSharing::Private)
    }

    /// Rater bound to `store`, which other raters may share.
    pub fn with_store(config: RaterConfig, store: SubjectStore<K>) -> Self {
        Self::with_sharing(config, CacheSharing::Unity(store))
    }

    pub fn with_sharing(config: RaterConfig, sharing: CacheSharing<K>) -> Self {
        let store = match sharing {
            CacheSharing::Private => MemoryStateStore::shared(),
            CacheSharing::Unity(store) => store,
        };
        // Limits were validated by the config builder, so this only yields `None` when not
        // throttling.
        let bucket = config
            .sem_period()
            .and_then(|period| LeakyBucket::new(config.after_handle_count(), period).ok())
            .map(Arc::new);
        let policy = select_policy(&config);
        tracing::debug!(policy = policy.name(), period = ?config.period(), "rater created");
        Self { config: Arc::new(config), policy, store, bucket }
    }

    pub fn config(&self) -> &RaterConfig {
        &self.config
    }

    /// Name of the decision strategy in use.
    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    /// Handle to the backing store.
    pub fn store(&self) -> &SubjectStore<K> {
        &self.store
    }

    /// Decide one event for `key` and run `action` if the decision allows it.
    ///
    /// `action` is called at most once. Notices go through `notifier`; their failures are
    /// logged and never surface here.
    ///
    /// # Errors
    /// - [`RaterError::Inner`] when the action fails.
    /// - [`RaterError::BucketClosed`] when the subject's bucket was torn down (its window
    ///   ended or it was reset) while the event was waiting on it.
    pub async fn handle_event<T, E, F, Fut>(
        &self,
        key: K,
        notifier: &SharedNotifier<K>,
        action: F,
    ) -> Result<Outcome<T>, RaterError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let Admission { plan, state, bucket } = self.admit(&key, notifier);

        if plan.cooldown {
            tracing::info!(
                key = ?key,
                warning = plan.warning,
                of = self.config.warnings_count(),
                "subject over limit; sending cooldown"
            );
            let notice = Notice::Cooldown {
                warning: plan.warning,
                warnings_count: self.config.warnings_count(),
            };
            notify_best_effort(notifier.as_ref(), &key, notice).await;
        }

        if let Some(bucket) = bucket {
            if plan.runs_action() {
                if let Err(error) = bucket.acquire().await {
                    tracing::warn!(key = ?key, %error, "throttled event dropped");
                    return Err(RaterError::BucketClosed { key: format!("{:?}", key) });
                }
            }
        }

        let run = |value| match plan.decision {
            Decision::Proceed => Outcome::Proceeded(value),
            Decision::DelayThenProceed => Outcome::Delayed(value),
            Decision::WarnThenSuppress | Decision::Suppress => Outcome::Grace(value),
        };
        if plan.runs_action() {
            return action().await.map(run).map_err(RaterError::Inner);
        }
        tracing::trace!(
            key = ?key,
            processed = state.processed,
            warnings = state.warnings,
            "event suppressed"
        );
        Ok(Outcome::Suppressed { warned: plan.cooldown })
    }

    /// Drop `key`'s window without a calmed notice. Returns whether it existed.
    pub fn reset(&self, key: &K) -> bool {
        let _guard = self.store.locks().lock(key);
        let removed = self.store.delete(key);
        if removed {
            tracing::debug!(key = ?key, "subject reset");
        }
        removed
    }

    /// Current counters of `key`, if its window is open.
    pub fn snapshot(&self, key: &K) -> Option<SubjectState> {
        self.store.load(key)
    }

    /// Where `key` stands against this rater's limits.
    pub fn phase(&self, key: &K) -> SubjectPhase {
        let state = self.store.load(key).unwrap_or_default();
        self.policy.phase(&state)
    }

    fn admit(&self, key: &K, notifier: &SharedNotifier<K>) -> Admission {
        let _guard = self.store.locks().lock(key);
        let period = self.config.period();

        for _ in 0..2 {
            let mut state = match self.store.load(key) {
                Some(state) => {
                    if self.config.window().is_sliding() {
                        self.store.expire(key, period);
                    }
                    state
                }
                None => {
                    let bucket = self.bucket.as_ref().map(|template| template.copy());
                    self.store.create(key.clone(), SubjectState::default(), bucket, period);
                    tracing::debug!(key = ?key, ?period, "subject window opened");
                    SubjectState::default()
                }
            };

            let plan = self.policy.decide(&mut state);
            if !self.store.store(key, state) {
                tracing::debug!(key = ?key, "subject expired mid-decision; retrying");
                continue;
            }
            tracing::debug!(
                key = ?key,
                policy = self.policy.name(),
                decision = ?plan.decision,
                processed = state.processed,
                warnings = state.warnings,
                "event decided"
            );

            if plan.arm_calmed {
                self.arm_calmed(key, notifier);
            }
            let bucket = match self.bucket {
                Some(_) => self.subject_bucket(key),
                None => None,
            };
            return Admission { plan, state, bucket };
        }

        Admission { plan: ActionPlan::suppress(), state: SubjectState::default(), bucket: None }
    }

    /// The subject's bucket. A subject opened by a non-throttling rater on a shared store has
    /// none; its events get a closed bucket and fail with `BucketClosed`.
    fn subject_bucket(&self, key: &K) -> Option<Arc<LeakyBucket>> {
        if let Some(bucket) = self.store.bucket(key) {
            return Some(bucket);
        }
        tracing::warn!(key = ?key, "throttled subject has no bucket");
        let closed = self.bucket.as_ref()?.copy();
        closed.close();
        Some(Arc::new(closed))
    }

    fn arm_calmed(&self, key: &K, notifier: &SharedNotifier<K>) {
        let notifier = notifier.clone();
        let subject = key.clone();
        let callback: EvictionCallback = Box::new(move || {
            async move {
                tracing::info!(key = ?subject, "subject calmed");
                notify_best_effort(notifier.as_ref(), &subject, Notice::Calmed).await;
            }
            .boxed()
        });
        if !self.store.on_evict(key, callback, None) {
            tracing::debug!(key = ?key, "subject gone before calmed notice could be armed");
        }
    }
}
