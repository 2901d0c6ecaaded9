//! Decision policies: what to do with one event given the subject's counters.
//!
//! The rule, evaluated per event in this order:
//! 1. A slot is left in the window: count it and proceed.
//! 2. Throttle mode: delay on the subject's leaky bucket, then proceed. The slot counter is a
//!    one-time gate and is not incremented past the limit.
//! 3. Notifications enabled and warnings left: warn and suppress. Depending on the
//!    [`GracePolicy`] the first over-limit event still runs the action once.
//! 4. Otherwise suppress silently.
//!
//! Each combination of flags is its own strategy type, picked once by [`select_policy`].

use crate::config::RaterConfig;
use crate::state::{SubjectPhase, SubjectState};
use std::fmt;
use std::sync::Arc;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Which notices a subject receives once it runs out of slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum NotifyMode {
    /// Drop silently.
    None,
    /// A cooldown notice per warning.
    Cooldown,
    /// One notice when the subject's window finally expires.
    Calmed,
    /// Both of the above.
    #[default]
    Both,
}

impl NotifyMode {
    pub fn is_enabled(self) -> bool {
        !matches!(self, NotifyMode::None)
    }

    pub fn cooldown(self) -> bool {
        matches!(self, NotifyMode::Cooldown | NotifyMode::Both)
    }

    pub fn calmed(self) -> bool {
        matches!(self, NotifyMode::Calmed | NotifyMode::Both)
    }
}

/// How the first over-limit event is treated when warnings are enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum GracePolicy {
    /// The first warning also runs the action and uses up one of `warnings_count`.
    #[default]
    Counted,
    /// The action runs once silently; `warnings_count` cooldown notices follow.
    Extra,
    /// No grace call: the first over-limit event already warns and suppresses.
    Disabled,
}

/// Outcome class of one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Run the action now.
    Proceed,
    /// Wait on the subject's leaky bucket, then run the action.
    DelayThenProceed,
    /// Send a warning and skip the action (unless it is the grace call).
    WarnThenSuppress,
    /// Skip the action silently.
    Suppress,
}

/// What the orchestrator has to do for one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionPlan {
    pub decision: Decision,
    /// The action runs despite a warning decision.
    pub grace: bool,
    /// A cooldown notice goes out before the action (or instead of it).
    pub cooldown: bool,
    /// Attach the calmed notice to the subject's cache entry.
    pub arm_calmed: bool,
    /// 1-based number of the cooldown notice in this window, 0 without one.
    pub warning: u32,
}

impl ActionPlan {
    fn only(decision: Decision) -> Self {
        Self { decision, grace: false, cooldown: false, arm_calmed: false, warning: 0 }
    }

    pub fn proceed() -> Self {
        Self::only(Decision::Proceed)
    }

    pub fn suppress() -> Self {
        Self::only(Decision::Suppress)
    }

    fn grace_only() -> Self {
        Self { grace: true, ..Self::only(Decision::WarnThenSuppress) }
    }

    /// Whether the downstream action is invoked.
    pub fn runs_action(&self) -> bool {
        match self.decision {
            Decision::Proceed | Decision::DelayThenProceed => true,
            Decision::WarnThenSuppress => self.grace,
            Decision::Suppress => false,
        }
    }
}

/// Strategy deciding one event and recording its effect on the counters.
pub trait DecisionPolicy: Send + Sync + fmt::Debug {
    /// Decide the event. Counters are mutated only on the path that consumes a slot or
    /// issues a warning.
    fn decide(&self, state: &mut SubjectState) -> ActionPlan;

    /// Classify `state` against this policy's limits.
    fn phase(&self, state: &SubjectState) -> SubjectPhase;

    /// Short stable name for logs.
    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct WarningRule {
    warnings_count: u32,
    grace: GracePolicy,
    cooldown: bool,
    calmed: bool,
}

impl WarningRule {
    fn new(warnings_count: u32, grace: GracePolicy, notify: NotifyMode) -> Self {
        Self { warnings_count, grace, cooldown: notify.cooldown(), calmed: notify.calmed() }
    }

    /// Warning values a window can reach; the silent grace call takes one extra.
    fn budget(&self) -> u32 {
        match self.grace {
            GracePolicy::Extra => self.warnings_count.saturating_add(1),
            GracePolicy::Counted | GracePolicy::Disabled => self.warnings_count,
        }
    }

    fn apply(&self, state: &mut SubjectState) -> ActionPlan {
        if state.warnings >= self.budget() {
            return ActionPlan::suppress();
        }
        let seen = state.warnings;
        state.record_warning();
        // (grace, index of this notice counting from 0)
        let (grace, notice) = match self.grace {
            GracePolicy::Counted => (seen == 0, seen),
            GracePolicy::Extra if seen == 0 => return ActionPlan::grace_only(),
            GracePolicy::Extra => (false, seen - 1),
            GracePolicy::Disabled => (false, seen),
        };
        ActionPlan {
            decision: Decision::WarnThenSuppress,
            grace,
            cooldown: self.cooldown,
            arm_calmed: self.calmed && notice == 0,
            warning: if self.cooldown { notice + 1 } else { 0 },
        }
    }

    /// Throttled events always run, so there is no grace call to account for.
    fn apply_throttled(&self, state: &mut SubjectState) -> ActionPlan {
        let mut plan = ActionPlan::only(Decision::DelayThenProceed);
        if state.warnings < self.warnings_count {
            plan.arm_calmed = self.calmed && state.warnings == 0;
            plan.cooldown = self.cooldown;
            state.record_warning();
            if self.cooldown {
                plan.warning = state.warnings;
            }
        }
        plan
    }
}

fn take_slot(state: &mut SubjectState, limit: u32) -> Option<ActionPlan> {
    if state.has_slot(limit) {
        state.record_processed();
        Some(ActionPlan::proceed())
    } else {
        None
    }
}

/// Plain counting: `after_handle_count` calls per window, the rest dropped.
#[derive(Debug, Clone, Copy)]
pub struct CountOnly {
    limit: u32,
}

impl CountOnly {
    pub fn new(after_handle_count: u32) -> Self {
        Self { limit: after_handle_count }
    }
}

impl DecisionPolicy for CountOnly {
    fn decide(&self, state: &mut SubjectState) -> ActionPlan {
        take_slot(state, self.limit).unwrap_or_else(ActionPlan::suppress)
    }

    fn phase(&self, state: &SubjectState) -> SubjectPhase {
        // Nothing to warn with, so the limit is already saturation.
        state.phase(self.limit, 0)
    }

    fn name(&self) -> &'static str {
        "count_only"
    }
}

macro_rules! warning_policy {
    ($(#[$doc:meta])* $name:ident, $label:literal, $mode:expr) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy)]
        pub struct $name {
            limit: u32,
            warnings: WarningRule,
        }

        impl $name {
            pub fn new(after_handle_count: u32, warnings_count: u32, grace: GracePolicy) -> Self {
                Self {
                    limit: after_handle_count,
                    warnings: WarningRule::new(warnings_count, grace, $mode),
                }
            }
        }

        impl DecisionPolicy for $name {
            fn decide(&self, state: &mut SubjectState) -> ActionPlan {
                match take_slot(state, self.limit) {
                    Some(plan) => plan,
                    None => self.warnings.apply(state),
                }
            }

            fn phase(&self, state: &SubjectState) -> SubjectPhase {
                state.phase(self.limit, self.warnings.budget())
            }

            fn name(&self) -> &'static str {
                $label
            }
        }
    };
}

warning_policy!(
    /// Counting plus a cooldown notice for each warning.
    CountWithCooldown,
    "count_with_cooldown",
    NotifyMode::Cooldown
);
warning_policy!(
    /// Counting plus a single calmed notice once a warned subject's window expires.
    CountWithCalmed,
    "count_with_calmed",
    NotifyMode::Calmed
);
warning_policy!(
    /// Counting with both cooldown and calmed notices.
    CountWithBoth,
    "count_with_both",
    NotifyMode::Both
);

/// Over-limit events wait on the subject's leaky bucket instead of being dropped.
#[derive(Debug, Clone, Copy)]
pub struct ThrottleDelay {
    limit: u32,
    warnings: Option<WarningRule>,
}

impl ThrottleDelay {
    pub fn new(after_handle_count: u32) -> Self {
        Self { limit: after_handle_count, warnings: None }
    }

    /// Also send notices while delaying.
    pub fn with_notices(mut self, warnings_count: u32, notify: NotifyMode) -> Self {
        if notify.is_enabled() {
            self.warnings = Some(WarningRule::new(warnings_count, GracePolicy::Disabled, notify));
        }
        self
    }
}

impl DecisionPolicy for ThrottleDelay {
    fn decide(&self, state: &mut SubjectState) -> ActionPlan {
        if let Some(plan) = take_slot(state, self.limit) {
            return plan;
        }
        match &self.warnings {
            Some(rule) => rule.apply_throttled(state),
            None => ActionPlan::only(Decision::DelayThenProceed),
        }
    }

    fn phase(&self, state: &SubjectState) -> SubjectPhase {
        let budget = self.warnings.map(|w| w.warnings_count).unwrap_or(0);
        state.phase(self.limit, budget)
    }

    fn name(&self) -> &'static str {
        "throttle_delay"
    }
}

/// Pick the strategy matching a validated configuration.
pub fn select_policy(config: &RaterConfig) -> Arc<dyn DecisionPolicy> {
    let limit = config.after_handle_count();
    let warnings = config.warnings_count();
    let grace = config.grace();
    if config.throttle() {
        return Arc::new(ThrottleDelay::new(limit).with_notices(warnings, config.notify()));
    }
    match config.notify() {
        NotifyMode::None => Arc::new(CountOnly::new(limit)),
        NotifyMode::Cooldown => Arc::new(CountWithCooldown::new(limit, warnings, grace)),
        NotifyMode::Calmed => Arc::new(CountWithCalmed::new(limit, warnings, grace)),
        NotifyMode::Both => Arc::new(CountWithBoth::new(limit, warnings, grace)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(policy: &dyn DecisionPolicy, events: usize) -> (Vec<ActionPlan>, SubjectState) {
        let mut state = SubjectState::default();
        let plans = (0..events).map(|_| policy.decide(&mut state)).collect();
        (plans, state)
    }

    fn ran(plans: &[ActionPlan]) -> usize {
        plans.iter().filter(|p| p.runs_action()).count()
    }

    #[test]
    fn exact_allowance_always_proceeds() {
        let policy = CountWithBoth::new(5, 2, GracePolicy::Counted);
        let (plans, state) = run(&policy, 5);
        assert!(plans.iter().all(|p| *p == ActionPlan::proceed()));
        assert_eq!(state, SubjectState::new(5, 0));
        assert_eq!(policy.phase(&state), SubjectPhase::AtLimit);
    }

    #[test]
    fn count_only_suppresses_the_excess() {
        let policy = CountOnly::new(2);
        let (plans, state) = run(&policy, 8);
        assert_eq!(ran(&plans), 2);
        assert!(plans[2..].iter().all(|p| p.decision == Decision::Suppress));
        assert_eq!(state.processed, 2);
        assert_eq!(policy.phase(&state), SubjectPhase::Saturated);
    }

    #[test]
    fn counted_grace_warns_on_the_grace_call() {
        let policy = CountWithCooldown::new(2, 1, GracePolicy::Counted);
        let (plans, state) = run(&policy, 8);

        assert_eq!(ran(&plans), 3);
        let grace = plans[2];
        assert_eq!(grace.decision, Decision::WarnThenSuppress);
        assert!(grace.grace && grace.cooldown && !grace.arm_calmed);
        assert!(plans[3..].iter().all(|p| *p == ActionPlan::suppress()));
        assert_eq!(plans.iter().filter(|p| p.cooldown).count(), 1);
        assert_eq!(state, SubjectState::new(2, 1));
    }

    #[test]
    fn counted_grace_spends_the_warning_budget() {
        let policy = CountWithCooldown::new(1, 3, GracePolicy::Counted);
        let (plans, _) = run(&policy, 6);
        let warned: Vec<_> = plans.iter().map(|p| (p.grace, p.cooldown)).collect();
        assert_eq!(
            warned,
            vec![
                (false, false),
                (true, true),
                (false, true),
                (false, true),
                (false, false),
                (false, false)
            ]
        );
    }

    #[test]
    fn extra_grace_is_silent_then_warns_w_times() {
        let policy = CountWithCooldown::new(2, 2, GracePolicy::Extra);
        let (plans, state) = run(&policy, 8);

        assert_eq!(ran(&plans), 3);
        assert!(plans[2].grace && !plans[2].cooldown);
        assert!(plans[3].cooldown && !plans[3].runs_action());
        assert!(plans[4].cooldown && !plans[4].runs_action());
        assert!(plans[5..].iter().all(|p| *p == ActionPlan::suppress()));
        assert_eq!(state.warnings, 3);
        assert_eq!(policy.phase(&state), SubjectPhase::Saturated);
    }

    #[test]
    fn cooldown_notices_are_numbered_from_one() {
        let counted = CountWithCooldown::new(1, 2, GracePolicy::Counted);
        let (plans, _) = run(&counted, 4);
        let numbers: Vec<_> = plans.iter().map(|p| p.warning).collect();
        assert_eq!(numbers, vec![0, 1, 2, 0]);

        let extra = CountWithCooldown::new(1, 2, GracePolicy::Extra);
        let (plans, _) = run(&extra, 5);
        let numbers: Vec<_> = plans.iter().map(|p| p.warning).collect();
        assert_eq!(numbers, vec![0, 0, 1, 2, 0]);

        let calmed = CountWithCalmed::new(1, 2, GracePolicy::Counted);
        let (plans, _) = run(&calmed, 3);
        assert!(plans.iter().all(|p| p.warning == 0));
    }

    #[test]
    fn disabled_grace_never_runs_over_limit() {
        let policy = CountWithCooldown::new(1, 2, GracePolicy::Disabled);
        let (plans, _) = run(&policy, 5);
        assert_eq!(ran(&plans), 1);
        assert_eq!(plans.iter().filter(|p| p.cooldown).count(), 2);
    }

    #[test]
    fn calmed_is_armed_on_the_first_warning_only() {
        let policy = CountWithBoth::new(1, 3, GracePolicy::Counted);
        let (plans, _) = run(&policy, 6);
        let armed: Vec<_> = plans.iter().map(|p| p.arm_calmed).collect();
        assert_eq!(armed, vec![false, true, false, false, false, false]);

        let extra = CountWithBoth::new(1, 3, GracePolicy::Extra);
        let (plans, _) = run(&extra, 6);
        let armed: Vec<_> = plans.iter().map(|p| p.arm_calmed).collect();
        assert_eq!(armed, vec![false, false, true, false, false, false]);
    }

    #[test]
    fn calmed_only_sends_no_cooldown() {
        let policy = CountWithCalmed::new(1, 2, GracePolicy::Counted);
        let (plans, _) = run(&policy, 4);
        assert!(plans.iter().all(|p| !p.cooldown));
        assert!(plans[1].arm_calmed && plans[1].grace);
        assert_eq!(plans[2].decision, Decision::WarnThenSuppress);
        assert_eq!(plans[3].decision, Decision::Suppress);
    }

    #[test]
    fn throttle_never_suppresses() {
        let policy = ThrottleDelay::new(2);
        let (plans, state) = run(&policy, 10);
        assert_eq!(ran(&plans), 10);
        assert!(plans[2..].iter().all(|p| p.decision == Decision::DelayThenProceed));
        assert_eq!(state.processed, 2, "slot counter stops at the limit");
    }

    #[test]
    fn throttle_with_notices_warns_while_delaying() {
        let policy = ThrottleDelay::new(1).with_notices(2, NotifyMode::Both);
        let (plans, state) = run(&policy, 5);
        assert_eq!(ran(&plans), 5);
        let notices: Vec<_> = plans.iter().map(|p| (p.cooldown, p.arm_calmed)).collect();
        assert_eq!(
            notices,
            vec![(false, false), (true, true), (true, false), (false, false), (false, false)]
        );
        assert_eq!(state.warnings, 2);
    }

    #[test]
    fn selection_follows_flags() {
        use crate::config::RaterConfigBuilder;
        let pick = |build: fn(RaterConfigBuilder) -> RaterConfigBuilder| {
            select_policy(&build(RaterConfig::builder()).build().unwrap()).name()
        };
        assert_eq!(pick(|b| b.notify(NotifyMode::None)), "count_only");
        assert_eq!(pick(|b| b.notify(NotifyMode::Cooldown)), "count_with_cooldown");
        assert_eq!(pick(|b| b.notify(NotifyMode::Calmed)), "count_with_calmed");
        assert_eq!(pick(|b| b), "count_with_both");
        assert_eq!(pick(|b| b.period_secs(8).throttle(true)), "throttle_delay");
    }
}
