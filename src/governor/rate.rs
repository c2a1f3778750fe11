//! Re-anchor rate governor.
//!
//! Rolling-window budgets per plan and per symbol. A predictive update draws
//! from its own stricter per-plan budget and also from the plan's reactive
//! budget, so the plan cap bounds every re-anchor. Check and record happen
//! under one lock.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::logging::{log_governor, Domain};
use crate::plan::{PlanId, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub max_per_window: u32,
    pub min_spacing_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateConfig {
    pub window_ms: u64,
    pub plan: RateLimit,
    pub symbol: RateLimit,
    pub predictive: RateLimit,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            window_ms: 3_600_000,
            plan: RateLimit {
                max_per_window: 6,
                min_spacing_ms: 60_000,
            },
            symbol: RateLimit {
                max_per_window: 30,
                min_spacing_ms: 0,
            },
            predictive: RateLimit {
                max_per_window: 2,
                min_spacing_ms: 600_000,
            },
        }
    }
}

/// Timestamps of admitted updates inside the rolling window.
#[derive(Debug, Clone, Default)]
pub struct UpdateBudget {
    stamps: VecDeque<Timestamp>,
}

impl UpdateBudget {
    fn roll(&mut self, now: Timestamp, window_ms: u64) {
        while let Some(front) = self.stamps.front() {
            if now.saturating_sub(*front) >= window_ms {
                self.stamps.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn count(&self) -> u32 {
        self.stamps.len() as u32
    }

    /// Reason the next update would be refused, if any.
    fn refusal(&mut self, limit: &RateLimit, now: Timestamp, window_ms: u64) -> Option<String> {
        self.roll(now, window_ms);
        if self.count() >= limit.max_per_window {
            return Some(format!("cap {}/{}", self.count(), limit.max_per_window));
        }
        if let Some(last) = self.stamps.back() {
            let since = now.saturating_sub(*last);
            if since < limit.min_spacing_ms {
                return Some(format!("spacing {}ms < {}ms", since, limit.min_spacing_ms));
            }
        }
        None
    }

    fn record(&mut self, now: Timestamp) {
        self.stamps.push_back(now);
    }

    fn unrecord(&mut self, at: Timestamp) {
        if let Some(pos) = self.stamps.iter().rposition(|t| *t == at) {
            self.stamps.remove(pos);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateDecision {
    /// Admitted; `window_updates` is the plan's count in the window including this one.
    Admit { window_updates: u32 },
    Defer { scope: &'static str, reason: String },
}

#[derive(Debug, Default)]
struct PlanBudgets {
    reactive: UpdateBudget,
    predictive: UpdateBudget,
}

#[derive(Debug, Default)]
struct Budgets {
    plans: HashMap<PlanId, PlanBudgets>,
    symbols: HashMap<String, UpdateBudget>,
}

#[derive(Debug, Default)]
pub struct RateGovernor {
    cfg: RateConfig,
    budgets: Mutex<Budgets>,
}

impl RateGovernor {
    pub fn new(cfg: RateConfig) -> Self {
        Self {
            cfg,
            budgets: Mutex::new(Budgets::default()),
        }
    }

    pub fn config(&self) -> &RateConfig {
        &self.cfg
    }

    pub fn try_acquire(&self, plan_id: PlanId, symbol: &str, predictive: bool, now: Timestamp) -> RateDecision {
        let window = self.cfg.window_ms;
        let Ok(mut budgets) = self.budgets.lock() else {
            return RateDecision::Defer {
                scope: "governor",
                reason: "rate state poisoned".to_string(),
            };
        };
        let Budgets { plans, symbols } = &mut *budgets;
        let plan = plans.entry(plan_id).or_default();
        let sym = symbols.entry(symbol.to_string()).or_default();

        let mut refusal = None;
        if predictive {
            if let Some(r) = plan.predictive.refusal(&self.cfg.predictive, now, window) {
                refusal = Some(("predictive", r, plan.predictive.count(), self.cfg.predictive.max_per_window));
            }
        }
        if refusal.is_none() {
            if let Some(r) = plan.reactive.refusal(&self.cfg.plan, now, window) {
                refusal = Some(("plan", r, plan.reactive.count(), self.cfg.plan.max_per_window));
            }
        }
        if refusal.is_none() {
            if let Some(r) = sym.refusal(&self.cfg.symbol, now, window) {
                refusal = Some(("symbol", r, sym.count(), self.cfg.symbol.max_per_window));
            }
        }

        if let Some((scope, reason, count, cap)) = refusal {
            log_governor(Domain::Rate, scope, "defer", count as f64, cap as f64);
            return RateDecision::Defer { scope, reason };
        }

        plan.reactive.record(now);
        if predictive {
            plan.predictive.record(now);
        }
        sym.record(now);
        let window_updates = plan.reactive.count();
        log_governor(
            Domain::Rate,
            if predictive { "predictive" } else { "plan" },
            "admit",
            window_updates as f64,
            self.cfg.plan.max_per_window as f64,
        );
        RateDecision::Admit { window_updates }
    }

    /// Roll back an admission whose write did not land.
    pub fn release(&self, plan_id: PlanId, symbol: &str, predictive: bool, at: Timestamp) {
        if let Ok(mut budgets) = self.budgets.lock() {
            if let Some(plan) = budgets.plans.get_mut(&plan_id) {
                plan.reactive.unrecord(at);
                if predictive {
                    plan.predictive.unrecord(at);
                }
            }
            if let Some(sym) = budgets.symbols.get_mut(symbol) {
                sym.unrecord(at);
            }
        }
    }

    pub fn forget(&self, plan_id: PlanId) {
        if let Ok(mut budgets) = self.budgets.lock() {
            budgets.plans.remove(&plan_id);
        }
    }

    /// Updates admitted for `plan_id` in the window ending at `now`.
    pub fn plan_count(&self, plan_id: PlanId, now: Timestamp) -> u32 {
        let window = self.cfg.window_ms;
        self.budgets
            .lock()
            .ok()
            .and_then(|mut b| {
                b.plans.get_mut(&plan_id).map(|p| {
                    p.reactive.roll(now, window);
                    p.reactive.count()
                })
            })
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> RateConfig {
        RateConfig {
            window_ms: 3_600_000,
            plan: RateLimit {
                max_per_window: 3,
                min_spacing_ms: 60_000,
            },
            symbol: RateLimit {
                max_per_window: 4,
                min_spacing_ms: 0,
            },
            predictive: RateLimit {
                max_per_window: 1,
                min_spacing_ms: 0,
            },
        }
    }

    #[test]
    fn test_spacing_and_cap() {
        let gov = RateGovernor::new(cfg());
        assert_eq!(gov.try_acquire(1, "BTC", false, 0), RateDecision::Admit { window_updates: 1 });
        assert!(matches!(
            gov.try_acquire(1, "BTC", false, 30_000),
            RateDecision::Defer { scope: "plan", .. }
        ));
        assert!(matches!(gov.try_acquire(1, "BTC", false, 60_000), RateDecision::Admit { .. }));
        assert!(matches!(gov.try_acquire(1, "BTC", false, 120_000), RateDecision::Admit { .. }));
        assert!(matches!(gov.try_acquire(1, "BTC", false, 180_000), RateDecision::Defer { .. }));
        // first stamp leaves the window
        assert_eq!(
            gov.try_acquire(1, "BTC", false, 3_600_000),
            RateDecision::Admit { window_updates: 3 }
        );
    }

    #[test]
    fn test_symbol_cap_spans_plans() {
        let gov = RateGovernor::new(cfg());
        for id in 1..=4 {
            assert!(matches!(gov.try_acquire(id, "ETH", false, 0), RateDecision::Admit { .. }));
        }
        assert!(matches!(
            gov.try_acquire(5, "ETH", false, 0),
            RateDecision::Defer { scope: "symbol", .. }
        ));
        assert!(matches!(gov.try_acquire(5, "SOL", false, 0), RateDecision::Admit { .. }));
    }

    #[test]
    fn test_predictive_budget_is_stricter_and_shared() {
        let gov = RateGovernor::new(cfg());
        assert!(matches!(gov.try_acquire(1, "BTC", true, 0), RateDecision::Admit { .. }));
        assert!(matches!(
            gov.try_acquire(1, "BTC", true, 120_000),
            RateDecision::Defer { scope: "predictive", .. }
        ));
        assert_eq!(gov.plan_count(1, 120_000), 1);
    }

    #[test]
    fn test_release_rolls_back() {
        let gov = RateGovernor::new(cfg());
        gov.try_acquire(1, "BTC", false, 0);
        gov.release(1, "BTC", false, 0);
        assert_eq!(gov.plan_count(1, 0), 0);
        assert!(matches!(gov.try_acquire(1, "BTC", false, 1), RateDecision::Admit { .. }));
    }
}
