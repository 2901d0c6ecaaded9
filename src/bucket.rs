//! Leaky-bucket limiter: capacity comes back one unit at a time on a fixed cadence.
//!
//! Unlike a bulkhead there is no release: a caller that acquired a unit keeps it, and the
//! background leak loop hands units back every `period / max_rate`, never above `max_rate`.
//! That caps a bucket at `max_rate` acquisitions per `period` however quickly callers finish.
//!
//! Waiters queue on a Tokio [`Semaphore`], so they are served strictly FIFO and are released
//! with [`BucketError::Closed`] when the bucket is closed.

use crate::cache::{deadline_after, Companion};
use crate::error::BucketError;
use std::fmt;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub struct LeakyBucket {
    max_rate: u32,
    period: Duration,
    leak_interval: Duration,
    permits: Arc<Semaphore>,
    leak_task: OnceLock<JoinHandle<()>>,
}

impl fmt::Debug for LeakyBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeakyBucket")
            .field("max_rate", &self.max_rate)
            .field("period", &self.period)
            .field("available", &self.available())
            .field("leaking", &self.leak_task.get().is_some())
            .finish()
    }
}

impl LeakyBucket {
    /// Create a full bucket allowing `max_rate` acquisitions per `period`.
    ///
    /// # Examples
    /// ```
    /// use rater::LeakyBucket;
    /// use std::time::Duration;
    /// let bucket = LeakyBucket::new(4, Duration::from_secs(2)).unwrap();
    /// assert_eq!(bucket.leak_interval(), Duration::from_millis(500));
    /// ```
    pub fn new(max_rate: u32, period: Duration) -> Result<Self, BucketError> {
        if max_rate == 0 {
            return Err(BucketError::InvalidRate);
        }
        if period.is_zero() {
            return Err(BucketError::InvalidPeriod);
        }
        tracing::debug!(max_rate, ?period, "leaky bucket limits");
        Ok(Self::fresh(max_rate, period))
    }

    fn fresh(max_rate: u32, period: Duration) -> Self {
        Self {
            max_rate,
            period,
            leak_interval: period / max_rate,
            permits: Arc::new(Semaphore::new(max_rate as usize)),
            leak_task: OnceLock::new(),
        }
    }

    /// Full, idle bucket with the same limits. Skips validation.
    pub fn copy(&self) -> Self {
        Self::fresh(self.max_rate, self.period)
    }

    /// Take one unit, waiting in line for the leak loop when the bucket is empty.
    ///
    /// The first call starts the leak loop.
    ///
    /// # Errors
    /// [`BucketError::Closed`] if the bucket is closed before a unit is handed over.
    pub async fn acquire(&self) -> Result<(), BucketError> {
        if self.permits.is_closed() {
            return Err(BucketError::Closed);
        }
        self.ensure_leaking();
        let permit = self.permits.acquire().await.map_err(|_| BucketError::Closed)?;
        permit.forget();
        Ok(())
    }

    /// Stop the leak loop and fail every pending and future `acquire`. Idempotent.
    pub fn close(&self) {
        if self.permits.is_closed() {
            return;
        }
        self.permits.close();
        if let Some(task) = self.leak_task.get() {
            task.abort();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }

    /// Units that can be taken right now without waiting.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn max_rate(&self) -> u32 {
        self.max_rate
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Time between two refills.
    pub fn leak_interval(&self) -> Duration {
        self.leak_interval
    }

    fn ensure_leaking(&self) {
        self.leak_task.get_or_init(|| {
            tracing::debug!(
                max_rate = self.max_rate,
                interval = ?self.leak_interval,
                "leak loop started"
            );
            tokio::spawn(leak(Arc::downgrade(&self.permits), self.max_rate, self.leak_interval))
        });
    }
}

impl Companion for LeakyBucket {
    fn teardown(&self) {
        self.close();
    }
}

impl Drop for LeakyBucket {
    fn drop(&mut self) {
        self.close();
    }
}

async fn leak(permits: Weak<Semaphore>, max_rate: u32, every: Duration) {
    let mut ticker = tokio::time::interval_at(deadline_after(every), every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(permits) = permits.upgrade() else { break };
        if permits.is_closed() {
            break;
        }
        if permits.available_permits() < max_rate as usize {
            permits.add_permits(1);
        }
    }
    tracing::debug!("leak loop stopped");
}
