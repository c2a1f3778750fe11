//! Adaptive risk: volatility-, strategy- and session-scaled stop/target.
//!
//! `AdaptiveRiskEngine::compute` is pure. It is the only place stop and
//! target distances are derived; the drift stage, the refresh stage and plan
//! amendments all call it.

use std::collections::HashMap;

use crate::market::{MarketPhase, Session};
use crate::plan::{Archetype, Direction, Geometry, Plan, PriceTriple, Timestamp};

/// How strongly stop (`alpha`) and target (`beta`) distances follow the
/// volatility ratio.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Elasticity {
    pub alpha: f64,
    pub beta: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ElasticityTable {
    entries: HashMap<Archetype, Elasticity>,
}

impl Default for ElasticityTable {
    fn default() -> Self {
        let entries = [
            (Archetype::MeanReversion, 0.8, 0.8),
            (Archetype::RangeFade, 0.7, 0.7),
            (Archetype::OrderBlockRejection, 0.5, 0.7),
            (Archetype::BreakoutContinuation, 0.3, 0.9),
            (Archetype::TrendPullback, 0.35, 0.85),
            (Archetype::LiquiditySweep, 0.6, 0.8),
        ]
        .into_iter()
        .map(|(a, alpha, beta)| (a, Elasticity { alpha, beta }))
        .collect();
        Self { entries }
    }
}

impl ElasticityTable {
    pub fn get(&self, archetype: Archetype) -> Elasticity {
        self.entries
            .get(&archetype)
            .copied()
            .unwrap_or(Elasticity { alpha: 0.5, beta: 0.5 })
    }

    pub fn set(&mut self, archetype: Archetype, elasticity: Elasticity) {
        self.entries.insert(archetype, elasticity);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RiskConfig {
    pub elasticity: ElasticityTable,
    pub symbol_weights: HashMap<String, f64>,
    pub phase_weights: HashMap<MarketPhase, f64>,
    pub session_weights: HashMap<Session, f64>,
    /// Target R:R = original R:R × multiplier for the current phase.
    pub phase_rr_multipliers: HashMap<MarketPhase, f64>,
    /// Allowed |actual − target| R:R before the target distance is rewritten.
    pub rr_tolerance: f64,
    pub weight_bounds: (f64, f64),
    pub scale_bounds: (f64, f64),
    /// Refresh stage writes only when a distance moves by more than this fraction.
    pub refresh_min_change: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            elasticity: ElasticityTable::default(),
            symbol_weights: HashMap::new(),
            phase_weights: HashMap::new(),
            session_weights: HashMap::new(),
            phase_rr_multipliers: HashMap::new(),
            rr_tolerance: 0.05,
            weight_bounds: (0.25, 4.0),
            scale_bounds: (0.1, 5.0),
            refresh_min_change: 0.05,
        }
    }
}

impl RiskConfig {
    pub fn composite_weight(&self, symbol: &str, phase: MarketPhase, session: Session) -> f64 {
        let w = self.symbol_weights.get(symbol).copied().unwrap_or(1.0)
            * self.phase_weights.get(&phase).copied().unwrap_or(1.0)
            * self.session_weights.get(&session).copied().unwrap_or(1.0);
        w.clamp(self.weight_bounds.0, self.weight_bounds.1)
    }

    pub fn rr_multiplier(&self, phase: MarketPhase) -> f64 {
        self.phase_rr_multipliers.get(&phase).copied().unwrap_or(1.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RiskInput<'a> {
    pub direction: Direction,
    pub archetype: Archetype,
    pub symbol: &'a str,
    pub phase: MarketPhase,
    pub session: Session,
    pub entry: f64,
    pub geometry: Geometry,
    pub current_vol: f64,
    pub baseline_vol: f64,
}

impl<'a> RiskInput<'a> {
    /// Input for recomputing `plan` around `entry` under the given market state.
    pub fn for_plan(plan: &'a Plan, entry: f64, phase: MarketPhase, current_vol: f64, now: Timestamp) -> Self {
        Self {
            direction: plan.direction,
            archetype: plan.archetype,
            symbol: &plan.symbol,
            phase,
            session: Session::from_timestamp(now),
            entry,
            geometry: plan.geometry,
            current_vol,
            baseline_vol: plan.baseline_volatility,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RiskOutcome {
    pub prices: PriceTriple,
    pub elasticity: Elasticity,
    pub composite: f64,
    pub vol_ratio: f64,
    pub target_rr: f64,
    pub rr_adjusted: bool,
}

pub fn vol_ratio(current: f64, baseline: f64) -> f64 {
    if baseline > 0.0 && current.is_finite() && current > 0.0 {
        current / baseline
    } else {
        1.0
    }
}

#[derive(Debug, Clone, Default)]
pub struct AdaptiveRiskEngine {
    cfg: RiskConfig,
}

impl AdaptiveRiskEngine {
    pub fn new(cfg: RiskConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.cfg
    }

    pub fn compute(&self, input: &RiskInput<'_>) -> RiskOutcome {
        let elasticity = self.cfg.elasticity.get(input.archetype);
        let composite = self.cfg.composite_weight(input.symbol, input.phase, input.session);
        let ratio = vol_ratio(input.current_vol, input.baseline_vol);
        let (lo, hi) = self.cfg.scale_bounds;
        let stop_scale = (1.0 + elasticity.alpha * (ratio - 1.0)).clamp(lo, hi);
        let target_scale = (1.0 + elasticity.beta * (ratio - 1.0)).clamp(lo, hi);

        let stop_distance = input.geometry.stop_distance * composite * stop_scale;
        let mut target_distance = input.geometry.target_distance * composite * target_scale;

        let target_rr = input.geometry.risk_reward() * self.cfg.rr_multiplier(input.phase);
        let mut rr_adjusted = false;
        if stop_distance > 0.0 && (target_distance / stop_distance - target_rr).abs() > self.cfg.rr_tolerance {
            target_distance = stop_distance * target_rr;
            rr_adjusted = true;
        }

        RiskOutcome {
            prices: PriceTriple::from_distances(input.direction, input.entry, stop_distance, target_distance),
            elasticity,
            composite,
            vol_ratio: ratio,
            target_rr,
            rr_adjusted,
        }
    }

    /// True when `proposed` moves either distance of `current` by more than
    /// the configured fraction.
    pub fn refresh_needed(&self, current: &PriceTriple, proposed: &PriceTriple) -> bool {
        let moved = |old: f64, new: f64| {
            if old <= 0.0 {
                return new > 0.0;
            }
            ((new - old) / old).abs() > self.cfg.refresh_min_change
        };
        moved(current.stop_distance(), proposed.stop_distance())
            || moved(current.target_distance(), proposed.target_distance())
    }
}
