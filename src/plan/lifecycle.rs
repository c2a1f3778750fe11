//! Plan lifecycle state machine.
//!
//! `RE_ARMED` is transient: applying it records the hop and immediately
//! collapses the plan back to `PENDING`.

use super::{Plan, PlanId, PlanState, Suspension, Timestamp};
use crate::error::{PlanError, PlanResult};

pub fn check_transition(id: PlanId, from: PlanState, to: PlanState) -> PlanResult<()> {
    use PlanState::*;
    let allowed = match (from, to) {
        (Executed | Cancelled | Expired, _) => false,
        (Pending, Suspended | Executed | Cancelled | Expired) => true,
        (Suspended, ReArmed | Cancelled | Expired) => true,
        (ReArmed, Pending | Suspended | Cancelled | Expired) => true,
        _ => false,
    };
    if allowed {
        Ok(())
    } else {
        Err(PlanError::InvalidTransition { id, from, to })
    }
}

/// One applied hop, for journaling and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    pub from: PlanState,
    pub to: PlanState,
}

/// Apply `to` to `plan` in place. Does not touch the revision; the store does.
pub fn apply(plan: &mut Plan, to: PlanState, reason: &str, now: Timestamp) -> PlanResult<Vec<Step>> {
    check_transition(plan.id, plan.state, to)?;
    let mut steps = vec![Step { from: plan.state, to }];
    plan.state = to;
    plan.state_reason = reason.to_string();
    plan.updated_at = now;

    match to {
        PlanState::ReArmed => {
            plan.suspension = None;
            steps.push(Step {
                from: PlanState::ReArmed,
                to: PlanState::Pending,
            });
            plan.state = PlanState::Pending;
        }
        PlanState::Suspended => {
            if plan.suspension.is_none() {
                plan.suspension = Some(Suspension {
                    reason: reason.to_string(),
                    since: now,
                    cooldown_until: now,
                    extensions: 0,
                });
            }
        }
        _ => {}
    }
    Ok(steps)
}

/// Suspend with an explicit cooldown deadline.
pub fn suspend(plan: &mut Plan, reason: &str, now: Timestamp, cooldown_until: Timestamp) -> PlanResult<Vec<Step>> {
    check_transition(plan.id, plan.state, PlanState::Suspended)?;
    plan.suspension = Some(Suspension {
        reason: reason.to_string(),
        since: now,
        cooldown_until,
        extensions: 0,
    });
    apply(plan, PlanState::Suspended, reason, now)
}

/// Push out the cooldown of a suspended plan. Not a state change.
pub fn extend_cooldown(plan: &mut Plan, until: Timestamp, reason: &str, now: Timestamp) -> PlanResult<()> {
    match (&mut plan.suspension, plan.state) {
        (Some(s), PlanState::Suspended) => {
            s.cooldown_until = s.cooldown_until.max(until);
            s.extensions += 1;
            plan.state_reason = reason.to_string();
            plan.updated_at = now;
            Ok(())
        }
        _ => Err(PlanError::InvalidTransition {
            id: plan.id,
            from: plan.state,
            to: PlanState::Suspended,
        }),
    }
}
