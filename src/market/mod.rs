//! Market-facing collaborators and the value types they exchange.
//!
//! Feeds, structure detection and condition evaluation live outside this
//! crate; the engine only sees these traits. Implementations return
//! `anyhow::Result` and the engine maps failures to
//! `PlanError::CollaboratorUnavailable`.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Timelike};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::PlanError;
use crate::plan::{Direction, Plan, Timestamp};

pub mod cache;
pub mod paper;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketPhase {
    Distribution,
    Compression,
    Expansion,
    Trend,
    Exhaustion,
    Reversion,
}

impl MarketPhase {
    pub const ALL: [MarketPhase; 6] = [
        MarketPhase::Distribution,
        MarketPhase::Compression,
        MarketPhase::Expansion,
        MarketPhase::Trend,
        MarketPhase::Exhaustion,
        MarketPhase::Reversion,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MarketPhase::Distribution => "distribution",
            MarketPhase::Compression => "compression",
            MarketPhase::Expansion => "expansion",
            MarketPhase::Trend => "trend",
            MarketPhase::Exhaustion => "exhaustion",
            MarketPhase::Reversion => "reversion",
        }
    }
}

impl FromStr for MarketPhase {
    type Err = PlanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.trim().to_ascii_lowercase();
        MarketPhase::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == key)
            .ok_or_else(|| PlanError::InvalidSpec(format!("unknown market phase '{}'", s)))
    }
}

/// Trading session, derived from the UTC hour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Session {
    Asia,
    London,
    Overlap,
    NewYork,
    OffHours,
}

impl Session {
    pub const ALL: [Session; 5] = [
        Session::Asia,
        Session::London,
        Session::Overlap,
        Session::NewYork,
        Session::OffHours,
    ];

    pub fn from_timestamp(ts: Timestamp) -> Self {
        let hour = DateTime::from_timestamp_millis(ts as i64)
            .map(|dt| dt.hour())
            .unwrap_or(0);
        match hour {
            0..=6 => Session::Asia,
            7..=11 => Session::London,
            12..=15 => Session::Overlap,
            16..=20 => Session::NewYork,
            _ => Session::OffHours,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Session::Asia => "asia",
            Session::London => "london",
            Session::Overlap => "overlap",
            Session::NewYork => "new_york",
            Session::OffHours => "off_hours",
        }
    }
}

impl FromStr for Session {
    type Err = PlanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.trim().to_ascii_lowercase();
        Session::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == key)
            .ok_or_else(|| PlanError::InvalidSpec(format!("unknown session '{}'", s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bias {
    Bullish,
    Bearish,
    Neutral,
}

impl Bias {
    pub fn agrees_with(&self, direction: Direction) -> bool {
        matches!(
            (self, direction),
            (Bias::Bullish, Direction::Long) | (Bias::Bearish, Direction::Short)
        )
    }

    pub fn opposes(&self, direction: Direction) -> bool {
        matches!(
            (self, direction),
            (Bias::Bearish, Direction::Long) | (Bias::Bullish, Direction::Short)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Bias::Bullish => "bullish",
            Bias::Bearish => "bearish",
            Bias::Neutral => "neutral",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceSide {
    Above,
    Below,
}

impl PriceSide {
    pub fn as_bias(&self) -> Bias {
        match self {
            PriceSide::Above => Bias::Bullish,
            PriceSide::Below => Bias::Bearish,
        }
    }
}

/// Which of the two higher-timeframe structure views to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HtfView {
    Primary,
    Secondary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VolWindow {
    Short,
    Long,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub price: f64,
    pub ts: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub price: f64,
    pub volume: f64,
    pub ts: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StructureBreak {
    pub direction: Bias,
    pub decisive: bool,
}

#[async_trait]
pub trait MarketData: Send + Sync {
    async fn price(&self, symbol: &str) -> Result<Quote>;
    /// Realized volatility over the given window.
    async fn volatility(&self, symbol: &str, window: VolWindow) -> Result<f64>;
    async fn phase(&self, symbol: &str) -> Result<MarketPhase>;
    /// Most recent ticks, oldest first.
    async fn recent_ticks(&self, symbol: &str, limit: usize) -> Result<Vec<Tick>>;
}

#[async_trait]
pub trait BiasSource: Send + Sync {
    async fn higher_timeframe_bias(&self, symbol: &str, view: HtfView) -> Result<Bias>;
    async fn mean_price_side(&self, symbol: &str) -> Result<PriceSide>;
    async fn structure_break(&self, _symbol: &str) -> Result<Option<StructureBreak>> {
        Ok(None)
    }
}

#[async_trait]
pub trait SignalEvaluator: Send + Sync {
    /// True when every activation predicate of the plan holds right now.
    async fn conditions_met(&self, plan: &Plan) -> Result<bool>;
}

/// Everything the drift and risk stages read for one plan on one tick.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketSnapshot {
    pub quote: Quote,
    pub vol_short: f64,
    pub vol_long: f64,
    pub phase: MarketPhase,
    pub ticks: Vec<Tick>,
}

impl MarketSnapshot {
    /// Short over long realized volatility; 1.0 when the long window is empty.
    pub fn expansion_ratio(&self) -> f64 {
        if self.vol_long > 0.0 {
            self.vol_short / self.vol_long
        } else {
            1.0
        }
    }
}

/// Gather one snapshot for `symbol`. A cached `(short, long)` volatility
/// pair skips the two volatility calls.
pub async fn snapshot(
    md: &dyn MarketData,
    symbol: &str,
    tick_limit: usize,
    cached_vols: Option<(f64, f64)>,
) -> Result<MarketSnapshot, PlanError> {
    let quote = md
        .price(symbol)
        .await
        .map_err(|e| PlanError::collaborator("market_data", e))?;
    let (vol_short, vol_long) = match cached_vols {
        Some(pair) => pair,
        None => {
            let short = md
                .volatility(symbol, VolWindow::Short)
                .await
                .map_err(|e| PlanError::collaborator("market_data", e))?;
            let long = md
                .volatility(symbol, VolWindow::Long)
                .await
                .map_err(|e| PlanError::collaborator("market_data", e))?;
            (short, long)
        }
    };
    let phase = md
        .phase(symbol)
        .await
        .map_err(|e| PlanError::collaborator("market_data", e))?;
    let ticks = md
        .recent_ticks(symbol, tick_limit)
        .await
        .map_err(|e| PlanError::collaborator("market_data", e))?;
    Ok(MarketSnapshot {
        quote,
        vol_short,
        vol_long,
        phase,
        ticks,
    })
}
