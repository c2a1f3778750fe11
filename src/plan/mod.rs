//! Plan data model.
//!
//! A plan is a long-lived trade intention. Its price triple (entry, stop,
//! target) is only ever replaced as a whole; `Geometry` keeps the distances the
//! plan was created (or last amended) with so recomputations can preserve the
//! original risk:reward.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{PlanError, PlanResult};
use crate::market::MarketPhase;

pub mod lifecycle;

pub type PlanId = u64;

/// Epoch milliseconds.
pub type Timestamp = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// +1 for long, -1 for short. Stops sit at `entry - sign * dist`.
    pub fn sign(&self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Long => "long",
            Direction::Short => "short",
        }
    }
}

impl FromStr for Direction {
    type Err = PlanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "long" | "buy" => Ok(Direction::Long),
            "short" | "sell" => Ok(Direction::Short),
            other => Err(PlanError::InvalidSpec(format!("unknown direction '{}'", other))),
        }
    }
}

/// Strategy archetype. Pure data: the risk engine looks up its elasticities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Archetype {
    OrderBlockRejection,
    BreakoutContinuation,
    MeanReversion,
    TrendPullback,
    LiquiditySweep,
    RangeFade,
}

impl Archetype {
    pub const ALL: [Archetype; 6] = [
        Archetype::OrderBlockRejection,
        Archetype::BreakoutContinuation,
        Archetype::MeanReversion,
        Archetype::TrendPullback,
        Archetype::LiquiditySweep,
        Archetype::RangeFade,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Archetype::OrderBlockRejection => "order_block_rejection",
            Archetype::BreakoutContinuation => "breakout_continuation",
            Archetype::MeanReversion => "mean_reversion",
            Archetype::TrendPullback => "trend_pullback",
            Archetype::LiquiditySweep => "liquidity_sweep",
            Archetype::RangeFade => "range_fade",
        }
    }
}

impl FromStr for Archetype {
    type Err = PlanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.trim().to_ascii_lowercase().replace('-', "_");
        Archetype::ALL
            .iter()
            .copied()
            .find(|a| a.as_str() == key)
            .ok_or_else(|| PlanError::InvalidSpec(format!("unknown archetype '{}'", s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorType {
    Vwap,
    Swing,
    TickMean,
}

impl AnchorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnchorType::Vwap => "vwap",
            AnchorType::Swing => "swing",
            AnchorType::TickMean => "tick_mean",
        }
    }
}

impl FromStr for AnchorType {
    type Err = PlanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "vwap" => Ok(AnchorType::Vwap),
            "swing" => Ok(AnchorType::Swing),
            "tick_mean" | "tick" => Ok(AnchorType::TickMean),
            other => Err(PlanError::InvalidSpec(format!("unknown anchor type '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlanState {
    Pending,
    Suspended,
    ReArmed,
    Executed,
    Cancelled,
    Expired,
}

impl PlanState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PlanState::Executed | PlanState::Cancelled | PlanState::Expired)
    }

    /// Counts against the density ledger.
    pub fn is_active(&self) -> bool {
        matches!(self, PlanState::Pending | PlanState::ReArmed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PlanState::Pending => "PENDING",
            PlanState::Suspended => "SUSPENDED",
            PlanState::ReArmed => "RE_ARMED",
            PlanState::Executed => "EXECUTED",
            PlanState::Cancelled => "CANCELLED",
            PlanState::Expired => "EXPIRED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(PlanState::Pending),
            "SUSPENDED" => Some(PlanState::Suspended),
            "RE_ARMED" => Some(PlanState::ReArmed),
            "EXECUTED" => Some(PlanState::Executed),
            "CANCELLED" => Some(PlanState::Cancelled),
            "EXPIRED" => Some(PlanState::Expired),
            _ => None,
        }
    }
}

impl fmt::Display for PlanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceTriple {
    pub entry: f64,
    pub stop: f64,
    pub target: f64,
}

impl PriceTriple {
    pub fn new(entry: f64, stop: f64, target: f64) -> Self {
        Self { entry, stop, target }
    }

    /// Build a triple from distances on the correct side of `entry`.
    pub fn from_distances(direction: Direction, entry: f64, stop_distance: f64, target_distance: f64) -> Self {
        let s = direction.sign();
        Self {
            entry,
            stop: entry - s * stop_distance,
            target: entry + s * target_distance,
        }
    }

    pub fn stop_distance(&self) -> f64 {
        (self.entry - self.stop).abs()
    }

    pub fn target_distance(&self) -> f64 {
        (self.target - self.entry).abs()
    }

    pub fn risk_reward(&self) -> f64 {
        let risk = self.stop_distance();
        if risk <= 0.0 {
            return 0.0;
        }
        self.target_distance() / risk
    }

    /// Long: stop < entry < target. Short: target < entry < stop.
    pub fn validate(&self, direction: Direction) -> PlanResult<()> {
        if ![self.entry, self.stop, self.target].iter().all(|p| p.is_finite() && *p > 0.0) {
            return Err(PlanError::InvalidSpec(format!(
                "prices must be finite and positive: {:?}",
                self
            )));
        }
        let ordered = match direction {
            Direction::Long => self.stop < self.entry && self.entry < self.target,
            Direction::Short => self.target < self.entry && self.entry < self.stop,
        };
        if !ordered {
            return Err(PlanError::InvalidSpec(format!(
                "{} triple out of order: entry={} stop={} target={}",
                direction.as_str(),
                self.entry,
                self.stop,
                self.target
            )));
        }
        Ok(())
    }
}

/// Distances a plan was created or last amended with.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Geometry {
    pub stop_distance: f64,
    pub target_distance: f64,
}

impl Geometry {
    pub fn of(prices: &PriceTriple) -> Self {
        Self {
            stop_distance: prices.stop_distance(),
            target_distance: prices.target_distance(),
        }
    }

    pub fn risk_reward(&self) -> f64 {
        if self.stop_distance <= 0.0 {
            return 0.0;
        }
        self.target_distance / self.stop_distance
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnchorState {
    pub price: f64,
    pub anchor_type: AnchorType,
    pub updated_at: Timestamp,
    /// Updates counted in the current rate window when this anchor was written.
    pub window_updates: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditCounters {
    pub anchor_updates: u32,
    pub predictive_updates: u32,
    pub risk_refreshes: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suspension {
    pub reason: String,
    pub since: Timestamp,
    pub cooldown_until: Timestamp,
    pub extensions: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillRecord {
    pub client_id: String,
    pub ticket: String,
    pub filled_price: f64,
    pub filled_at: Timestamp,
}

/// Stored before an order leaves for the venue. Every later attempt for the
/// plan is submitted under the same client id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchIntent {
    pub client_id: String,
    pub at: Timestamp,
}

/// Opaque activation predicates, evaluated by the signal collaborator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionSet {
    pub predicates: Vec<String>,
}

impl ConditionSet {
    pub fn new<I, S>(predicates: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            predicates: predicates.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }
}

/// What a plan requester submits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanSpec {
    pub symbol: String,
    pub direction: Direction,
    pub entry: f64,
    pub stop: f64,
    pub target: f64,
    pub archetype: Archetype,
    pub proximity_tracking: bool,
    pub anchor_type: AnchorType,
    /// Overrides the configured per-symbol threshold.
    #[serde(default)]
    pub drift_threshold: Option<f64>,
    #[serde(default)]
    pub conditions: ConditionSet,
    pub expiry: Timestamp,
    pub risk_unit: f64,
    pub confidence: f64,
}

impl PlanSpec {
    pub fn prices(&self) -> PriceTriple {
        PriceTriple::new(self.entry, self.stop, self.target)
    }

    pub fn validate(&self, now: Timestamp) -> PlanResult<()> {
        if self.symbol.trim().is_empty() {
            return Err(PlanError::InvalidSpec("empty symbol".to_string()));
        }
        self.prices().validate(self.direction)?;
        if self.expiry <= now {
            return Err(PlanError::InvalidSpec(format!(
                "expiry {} is not in the future (now {})",
                self.expiry, now
            )));
        }
        if !(self.risk_unit > 0.0 && self.risk_unit <= 1.0) {
            return Err(PlanError::InvalidSpec(format!("risk_unit {} outside (0, 1]", self.risk_unit)));
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(PlanError::InvalidSpec(format!("confidence {} outside [0, 1]", self.confidence)));
        }
        if let Some(th) = self.drift_threshold {
            if !(th.is_finite() && th > 0.0) {
                return Err(PlanError::InvalidSpec(format!("drift threshold {} must be positive", th)));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: PlanId,
    pub symbol: String,
    pub direction: Direction,
    pub prices: PriceTriple,
    pub geometry: Geometry,
    pub archetype: Archetype,
    pub proximity_tracking: bool,
    pub anchor: AnchorState,
    pub drift_threshold: f64,
    pub conditions: ConditionSet,
    pub expiry: Timestamp,
    pub state: PlanState,
    pub state_reason: String,
    pub suspension: Option<Suspension>,
    pub counters: AuditCounters,
    pub risk_unit: f64,
    pub confidence: f64,
    pub baseline_volatility: f64,
    pub admission_phase: MarketPhase,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub revision: u64,
    pub fill: Option<FillRecord>,
    #[serde(default)]
    pub dispatch_intent: Option<DispatchIntent>,
}

/// Market context captured when a plan is created.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CreateContext {
    pub now: Timestamp,
    pub anchor_price: f64,
    pub baseline_volatility: f64,
    pub phase: MarketPhase,
    pub drift_threshold: f64,
}

impl Plan {
    /// Build an unsaved plan; the store assigns `id` and `revision`.
    pub fn from_spec(spec: PlanSpec, ctx: CreateContext) -> Self {
        let prices = spec.prices();
        Self {
            id: 0,
            symbol: spec.symbol,
            direction: spec.direction,
            geometry: Geometry::of(&prices),
            prices,
            archetype: spec.archetype,
            proximity_tracking: spec.proximity_tracking,
            anchor: AnchorState {
                price: ctx.anchor_price,
                anchor_type: spec.anchor_type,
                updated_at: ctx.now,
                window_updates: 0,
            },
            drift_threshold: spec.drift_threshold.unwrap_or(ctx.drift_threshold),
            conditions: spec.conditions,
            expiry: spec.expiry,
            state: PlanState::Pending,
            state_reason: "created".to_string(),
            suspension: None,
            counters: AuditCounters::default(),
            risk_unit: spec.risk_unit,
            confidence: spec.confidence,
            baseline_volatility: ctx.baseline_volatility,
            admission_phase: ctx.phase,
            created_at: ctx.now,
            updated_at: ctx.now,
            revision: 0,
            fill: None,
            dispatch_intent: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expiry
    }

    /// Venue idempotency key. Fixed by the first dispatch intent; before
    /// that, derived from the current revision.
    pub fn client_id(&self) -> String {
        match &self.dispatch_intent {
            Some(intent) => intent.client_id.clone(),
            None => format!("pw-{}-r{}", self.id, self.revision),
        }
    }
}

/// Why a triple is being replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    ReAnchor,
    Predictive,
    RiskRefresh,
    Amendment,
}

impl UpdateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateKind::ReAnchor => "reanchor",
            UpdateKind::Predictive => "predictive",
            UpdateKind::RiskRefresh => "risk_refresh",
            UpdateKind::Amendment => "amendment",
        }
    }
}

/// Payload of `PlanStore::mutate`: the whole triple plus, optionally, a new
/// anchor and a new reference geometry.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceUpdate {
    pub prices: PriceTriple,
    pub anchor: Option<AnchorState>,
    pub geometry: Option<Geometry>,
    pub kind: UpdateKind,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlanFilter {
    pub symbol: Option<String>,
    pub states: Option<Vec<PlanState>>,
    pub non_terminal: bool,
}

impl PlanFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn non_terminal() -> Self {
        Self {
            non_terminal: true,
            ..Self::default()
        }
    }

    pub fn active() -> Self {
        Self {
            states: Some(vec![PlanState::Pending, PlanState::ReArmed]),
            ..Self::default()
        }
    }

    pub fn with_symbol(mut self, symbol: &str) -> Self {
        self.symbol = Some(symbol.to_string());
        self
    }

    pub fn with_states(mut self, states: &[PlanState]) -> Self {
        self.states = Some(states.to_vec());
        self
    }

    pub fn matches(&self, plan: &Plan) -> bool {
        if self.non_terminal && plan.is_terminal() {
            return false;
        }
        if let Some(sym) = &self.symbol {
            if &plan.symbol != sym {
                return false;
            }
        }
        if let Some(states) = &self.states {
            if !states.contains(&plan.state) {
                return false;
            }
        }
        true
    }
}
