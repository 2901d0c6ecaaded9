#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # rater
//!
//! Per-subject rate limiting for async event streams: each event tagged with a subject key
//! is let through, delayed, or suppressed based on counters that live for a configurable
//! window.
//!
//! ## Features
//!
//! - **Timer cache** with per-entry cancellable expiry and one-shot eviction callbacks
//! - **Leaky bucket** that hands capacity back at a fixed rate, FIFO for waiters
//! - **Decision strategies** for counting, cooldown and calmed notices, and throttling
//! - **Fixed or sliding windows**
//! - **Shared or private subject stores**, with optional encoded storage
//! - **Tower layer** for putting a rater in front of any service
//!
//! ## Quick Start
//!
//! ```rust
//! use rater::{NotifyMode, Outcome, Rater, RaterConfig, RecordingNotifier, SharedNotifier};
//! use std::sync::Arc;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     let config = RaterConfig::builder()
//!         .period_secs(8)
//!         .after_handle_count(2)
//!         .warnings_count(1)
//!         .notify(NotifyMode::Cooldown)
//!         .build()
//!         .unwrap();
//!     let rater = Rater::new(config);
//!     let notices = Arc::new(RecordingNotifier::<u64>::new());
//!     let notifier: SharedNotifier<u64> = notices.clone();
//!
//!     let mut outcomes = Vec::new();
//!     for _ in 0..4 {
//!         let outcome = rater
//!             .handle_event(42, &notifier, || async { Ok::<_, std::io::Error>(()) })
//!             .await
//!             .unwrap();
//!         outcomes.push(outcome);
//!     }
//!
//!     assert_eq!(outcomes[2], Outcome::Grace(()));
//!     assert_eq!(outcomes[3], Outcome::Suppressed { warned: false });
//!     assert_eq!(notices.sent().len(), 1);
//! }
//! ```

pub mod bucket;
pub mod cache;
pub mod config;
pub mod error;
pub mod layer;
pub mod notify;
pub mod policy;
pub mod prelude;
pub mod rater;
pub mod state;
pub mod store;

// Re-exports
pub use bucket::LeakyBucket;
pub use cache::{CacheKey, Companion, EvictionCallback, TimerCache};
#[cfg(feature = "serde")]
pub use config::RaterSettings;
pub use config::{RaterConfig, RaterConfigBuilder};
pub use error::{BoxError, BucketError, CodecError, ConfigError, RaterError};
pub use layer::{RaterLayer, RaterService};
pub use notify::{NoopNotifier, Notice, Notifier, RecordingNotifier};
pub use policy::{
    select_policy, ActionPlan, CountOnly, CountWithBoth, CountWithCalmed, CountWithCooldown,
    Decision, DecisionPolicy, GracePolicy, NotifyMode, ThrottleDelay,
};
pub use rater::{CacheSharing, Outcome, Rater, SharedNotifier};
pub use state::{SubjectPhase, SubjectState, WindowPolicy};
#[cfg(feature = "serde")]
pub use store::JsonCodec;
pub use store::{
    CompactCodec, EncodedStateStore, KeyLocks, MemoryStateStore, StateCodec, StateStore,
    SubjectStore,
};
