//! Anchor drift detection and re-anchor proposals.
//!
//! Drift is always measured against the *stored* anchor, so sub-threshold
//! moves accumulate until they cross the threshold once; the re-anchor then
//! resets the reference.

use std::collections::HashMap;

use crate::market::{MarketPhase, MarketSnapshot, Tick};
use crate::plan::{AnchorState, AnchorType, Direction, Plan, Timestamp, UpdateKind};
use crate::risk::{AdaptiveRiskEngine, RiskInput, RiskOutcome};

#[derive(Debug, Clone, PartialEq)]
pub struct DriftConfig {
    pub default_threshold: f64,
    pub thresholds: HashMap<String, f64>,
    /// Ticks requested from market data per evaluation.
    pub tick_lookback: usize,
    /// Neighbours on each side a swing pivot must beat.
    pub swing_strength: usize,
    pub predictive_enabled: bool,
    /// Short/long volatility ratio above which an expansion phase turns on
    /// predictive mode.
    pub expansion_multiple: f64,
    pub range_break_fraction: f64,
    pub forecast_horizon_ms: u64,
    pub velocity_window: usize,
    /// How long a symbol's volatility pair is reused across evaluations.
    pub vol_cache_ttl_ms: u64,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            default_threshold: 25.0,
            thresholds: HashMap::new(),
            tick_lookback: 50,
            swing_strength: 2,
            predictive_enabled: true,
            expansion_multiple: 1.5,
            range_break_fraction: 0.1,
            forecast_horizon_ms: 60_000,
            velocity_window: 10,
            vol_cache_ttl_ms: 5_000,
        }
    }
}

impl DriftConfig {
    pub fn threshold_for(&self, symbol: &str) -> f64 {
        self.thresholds.get(symbol).copied().unwrap_or(self.default_threshold)
    }
}

pub fn tick_mean(ticks: &[Tick]) -> Option<f64> {
    if ticks.is_empty() {
        return None;
    }
    Some(ticks.iter().map(|t| t.price).sum::<f64>() / ticks.len() as f64)
}

/// Volume-weighted mean; falls back to the plain mean when no volume printed.
pub fn vwap(ticks: &[Tick]) -> Option<f64> {
    let volume: f64 = ticks.iter().map(|t| t.volume.max(0.0)).sum();
    if volume <= 0.0 {
        return tick_mean(ticks);
    }
    Some(ticks.iter().map(|t| t.price * t.volume.max(0.0)).sum::<f64>() / volume)
}

/// Most recent confirmed pivot: a low for long plans, a high for short plans.
/// A pivot is strictly beyond `k` ticks on each side.
pub fn swing_pivot(ticks: &[Tick], direction: Direction, k: usize) -> Option<f64> {
    let k = k.max(1);
    if ticks.len() < 2 * k + 1 {
        return None;
    }
    for i in (k..ticks.len() - k).rev() {
        let p = ticks[i].price;
        let neighbours = ticks[i - k..=i + k]
            .iter()
            .enumerate()
            .filter(|(j, _)| *j != k)
            .map(|(_, t)| t.price);
        let is_pivot = match direction {
            Direction::Long => neighbours.into_iter().all(|q| p < q),
            Direction::Short => neighbours.into_iter().all(|q| p > q),
        };
        if is_pivot {
            return Some(p);
        }
    }
    None
}

/// Price change per millisecond over the last `window` ticks.
pub fn velocity(ticks: &[Tick], window: usize) -> f64 {
    let tail = &ticks[ticks.len().saturating_sub(window.max(2))..];
    match (tail.first(), tail.last()) {
        (Some(first), Some(last)) if last.ts > first.ts => (last.price - first.price) / (last.ts - first.ts) as f64,
        _ => 0.0,
    }
}

/// Last tick outside the preceding ticks' high/low by more than
/// `fraction` of that range.
pub fn range_break(ticks: &[Tick], fraction: f64) -> bool {
    let Some((last, before)) = ticks.split_last() else {
        return false;
    };
    if before.len() < 2 {
        return false;
    }
    let hi = before.iter().map(|t| t.price).fold(f64::MIN, f64::max);
    let lo = before.iter().map(|t| t.price).fold(f64::MAX, f64::min);
    let margin = (hi - lo) * fraction;
    last.price > hi + margin || last.price < lo - margin
}

pub fn compute_anchor(anchor_type: AnchorType, direction: Direction, snap: &MarketSnapshot, swing_strength: usize) -> f64 {
    let ticks = &snap.ticks;
    let computed = match anchor_type {
        AnchorType::Vwap => vwap(ticks),
        AnchorType::TickMean => tick_mean(ticks),
        AnchorType::Swing => swing_pivot(ticks, direction, swing_strength).or_else(|| tick_mean(ticks)),
    };
    computed.unwrap_or(snap.quote.price)
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReAnchorProposal {
    pub kind: UpdateKind,
    /// Observed drift, or forecast drift for predictive proposals.
    pub drift: f64,
    pub old_anchor: f64,
    pub anchor: AnchorState,
    pub outcome: RiskOutcome,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DriftDecision {
    NotTracked,
    Within { drift: f64, forecast_drift: Option<f64> },
    ReAnchor(ReAnchorProposal),
}

#[derive(Debug, Clone, Default)]
pub struct DriftDetector {
    cfg: DriftConfig,
}

impl DriftDetector {
    pub fn new(cfg: DriftConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &DriftConfig {
        &self.cfg
    }

    pub fn predictive_mode(&self, snap: &MarketSnapshot) -> bool {
        if !self.cfg.predictive_enabled {
            return false;
        }
        let expanding = snap.phase == MarketPhase::Expansion && snap.expansion_ratio() >= self.cfg.expansion_multiple;
        expanding || range_break(&snap.ticks, self.cfg.range_break_fraction)
    }

    pub fn evaluate(&self, plan: &Plan, snap: &MarketSnapshot, risk: &AdaptiveRiskEngine, now: Timestamp) -> DriftDecision {
        if !plan.proximity_tracking {
            return DriftDecision::NotTracked;
        }
        let price = snap.quote.price;
        let stored = plan.anchor.price;
        let drift = (price - stored).abs();

        if drift > plan.drift_threshold {
            let new_anchor = compute_anchor(plan.anchor.anchor_type, plan.direction, snap, self.cfg.swing_strength);
            return DriftDecision::ReAnchor(self.propose(plan, snap, risk, now, UpdateKind::ReAnchor, drift, new_anchor));
        }

        if self.predictive_mode(snap) {
            let forecast = price + velocity(&snap.ticks, self.cfg.velocity_window) * self.cfg.forecast_horizon_ms as f64;
            let forecast_drift = (forecast - stored).abs();
            if forecast_drift > plan.drift_threshold && forecast.is_finite() && forecast > 0.0 {
                return DriftDecision::ReAnchor(self.propose(
                    plan,
                    snap,
                    risk,
                    now,
                    UpdateKind::Predictive,
                    forecast_drift,
                    forecast,
                ));
            }
            return DriftDecision::Within {
                drift,
                forecast_drift: Some(forecast_drift),
            };
        }

        DriftDecision::Within {
            drift,
            forecast_drift: None,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn propose(
        &self,
        plan: &Plan,
        snap: &MarketSnapshot,
        risk: &AdaptiveRiskEngine,
        now: Timestamp,
        kind: UpdateKind,
        drift: f64,
        new_anchor: f64,
    ) -> ReAnchorProposal {
        let entry = new_anchor + (plan.prices.entry - plan.anchor.price);
        let outcome = risk.compute(&RiskInput::for_plan(plan, entry, snap.phase, snap.vol_short, now));
        ReAnchorProposal {
            kind,
            drift,
            old_anchor: plan.anchor.price,
            anchor: AnchorState {
                price: new_anchor,
                anchor_type: plan.anchor.anchor_type,
                updated_at: now,
                window_updates: plan.anchor.window_updates,
            },
            outcome,
        }
    }
}
