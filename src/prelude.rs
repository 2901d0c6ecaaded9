//! Convenient re-exports for common rater types.
pub use crate::{
    config::{RaterConfig, RaterConfigBuilder},
    layer::RaterLayer,
    notify::{Notice, Notifier},
    policy::{GracePolicy, NotifyMode},
    rater::{CacheSharing, Outcome, Rater, SharedNotifier},
    store::{MemoryStateStore, StateStore, SubjectStore},
    ConfigError, RaterError,
};
