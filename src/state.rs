//! Per-subject counters and the window rules that reset them.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Counters tracked for one subject during the current window.
///
/// A fresh window starts from `SubjectState::default()`; the counters are never decremented.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SubjectState {
    /// Calls that consumed a slot in this window.
    pub processed: u32,
    /// Warnings (grace included) issued in this window.
    pub warnings: u32,
}

/// Where a subject stands, derived from its counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubjectPhase {
    /// Nothing processed yet.
    Fresh,
    /// Some slots used, some left.
    WithinLimit,
    /// Out of slots but still has warnings to give.
    AtLimit,
    /// Out of slots and warnings.
    Saturated,
}

/// How the subject window is anchored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum WindowPolicy {
    /// The window opens on the first event and closes `period` later.
    Fixed,
    /// Every event pushes the close of the window to `period` from now.
    #[default]
    Sliding,
}

impl SubjectState {
    pub fn new(processed: u32, warnings: u32) -> Self {
        Self { processed, warnings }
    }

    /// Classify the counters against the configured limits.
    pub fn phase(&self, after_handle_count: u32, warnings_count: u32) -> SubjectPhase {
        if self.processed == 0 {
            SubjectPhase::Fresh
        } else if self.processed < after_handle_count {
            SubjectPhase::WithinLimit
        } else if self.warnings < warnings_count {
            SubjectPhase::AtLimit
        } else {
            SubjectPhase::Saturated
        }
    }

    /// Whether another slot may be consumed in this window.
    pub fn has_slot(&self, after_handle_count: u32) -> bool {
        self.processed < after_handle_count
    }

    pub(crate) fn record_processed(&mut self) {
        self.processed = self.processed.saturating_add(1);
    }

    pub(crate) fn record_warning(&mut self) {
        self.warnings = self.warnings.saturating_add(1);
    }
}

impl WindowPolicy {
    pub fn from_debounce(debounce: bool) -> Self {
        if debounce {
            WindowPolicy::Sliding
        } else {
            WindowPolicy::Fixed
        }
    }

    pub fn is_sliding(self) -> bool {
        matches!(self, WindowPolicy::Sliding)
    }
}
