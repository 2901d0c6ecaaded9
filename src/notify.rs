//! Notices sent to limited subjects.
//!
//! Delivery is best effort: a failing [`Notifier`] is logged at `warn` and otherwise ignored,
//! so a lost message never changes a decision or the counters behind it.

use crate::error::BoxError;
use async_trait::async_trait;
use std::fmt;
use std::sync::{Arc, Mutex};

/// A message for a subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice {
    /// The subject hit its limit; `warning` counts from 1 within the window.
    Cooldown { warning: u32, warnings_count: u32 },
    /// A warned subject's window expired; it may send again.
    Calmed,
}

impl Notice {
    /// Stock text hosts can fall back on.
    pub fn default_text(&self) -> &'static str {
        match self {
            Notice::Cooldown { .. } => "Calm down!",
            Notice::Calmed => "You can chat now",
        }
    }

    pub fn is_cooldown(&self) -> bool {
        matches!(self, Notice::Cooldown { .. })
    }
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.default_text())
    }
}

/// Sends notices on behalf of the rater.
#[async_trait]
pub trait Notifier<K>: Send + Sync {
    async fn notify(&self, key: &K, notice: Notice) -> Result<(), BoxError>;
}

/// Discards every notice.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

#[async_trait]
impl<K: Sync> Notifier<K> for NoopNotifier {
    async fn notify(&self, _key: &K, _notice: Notice) -> Result<(), BoxError> {
        Ok(())
    }
}

/// Keeps every notice in memory, in send order.
#[derive(Debug)]
pub struct RecordingNotifier<K> {
    sent: Mutex<Vec<(K, Notice)>>,
}

impl<K> Default for RecordingNotifier<K> {
    fn default() -> Self {
        Self { sent: Mutex::new(Vec::new()) }
    }
}

impl<K: Clone> RecordingNotifier<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything sent so far.
    pub fn sent(&self) -> Vec<(K, Notice)> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Number of notices matching `pred`.
    pub fn count(&self, pred: impl Fn(&Notice) -> bool) -> usize {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).iter().filter(|(_, n)| pred(n)).count()
    }
}

#[async_trait]
impl<K: Clone + Send + Sync> Notifier<K> for RecordingNotifier<K> {
    async fn notify(&self, key: &K, notice: Notice) -> Result<(), BoxError> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).push((key.clone(), notice));
        Ok(())
    }
}

#[async_trait]
impl<K, N> Notifier<K> for Arc<N>
where
    K: Sync,
    N: Notifier<K> + ?Sized,
{
    async fn notify(&self, key: &K, notice: Notice) -> Result<(), BoxError> {
        (**self).notify(key, notice).await
    }
}

/// Send `notice`, logging and dropping any failure.
pub(crate) async fn notify_best_effort<K: fmt::Debug + Sync>(
    notifier: &dyn Notifier<K>,
    key: &K,
    notice: Notice,
) {
    match notifier.notify(key, notice).await {
        Ok(()) => tracing::debug!(key = ?key, ?notice, "notice sent"),
        Err(error) => tracing::warn!(key = ?key, ?notice, %error, "notice delivery failed"),
    }
}
