//! Seeded random-walk market used by the paper loop and the demos.
//!
//! One tape per symbol. Volatility regimes flip occasionally, the drift
//! alternates every few hundred steps, so re-anchors, bias flips and
//! phase changes all show up within a short run.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rand::{rngs::StdRng, Rng, SeedableRng};

use super::{Bias, BiasSource, HtfView, MarketData, MarketPhase, PriceSide, Quote, SignalEvaluator, Tick, VolWindow};
use crate::dispatch::{ExecutionVenue, OrderTicket, VenueFill};
use crate::plan::{Direction, Plan, Timestamp};

const TAPE_CAPACITY: usize = 600;
const SHORT_WINDOW: usize = 20;
const LONG_WINDOW: usize = 200;

/// Opening price for a symbol on the paper tape.
pub fn start_price(symbol: &str) -> f64 {
    let s = symbol.to_ascii_uppercase();
    if s.starts_with("BTC") {
        90_000.0
    } else if s.starts_with("ETH") {
        3_000.0
    } else if s.starts_with("SOL") {
        150.0
    } else {
        100.0
    }
}

#[derive(Debug)]
struct Tape {
    price: f64,
    vol: f64,
    ticks: VecDeque<Tick>,
}

impl Tape {
    fn new(price: f64) -> Self {
        Self {
            price,
            vol: 0.0004,
            ticks: VecDeque::with_capacity(TAPE_CAPACITY),
        }
    }

    fn last(&self, n: usize) -> impl Iterator<Item = &Tick> {
        self.ticks.iter().skip(self.ticks.len().saturating_sub(n))
    }

    /// Standard deviation of tick-to-tick price changes over the window.
    fn realized_vol(&self, n: usize) -> f64 {
        let prices: Vec<f64> = self.last(n + 1).map(|t| t.price).collect();
        if prices.len() < 3 {
            return 0.0;
        }
        let diffs: Vec<f64> = prices.windows(2).map(|w| w[1] - w[0]).collect();
        let mean = diffs.iter().sum::<f64>() / diffs.len() as f64;
        let var = diffs.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / (diffs.len() - 1) as f64;
        var.sqrt()
    }

    /// Net change over the last `n` ticks.
    fn change(&self, n: usize) -> f64 {
        let mut window = self.last(n);
        match (window.next(), self.ticks.back()) {
            (Some(first), Some(last)) => last.price - first.price,
            _ => 0.0,
        }
    }

    fn mean(&self, n: usize) -> Option<f64> {
        let prices: Vec<f64> = self.last(n).map(|t| t.price).collect();
        if prices.is_empty() {
            return None;
        }
        Some(prices.iter().sum::<f64>() / prices.len() as f64)
    }

    fn bias_over(&self, n: usize) -> Bias {
        let change = self.change(n);
        let noise = self.realized_vol(n.min(LONG_WINDOW)) * (n as f64).sqrt() * 0.5;
        if change > noise {
            Bias::Bullish
        } else if change < -noise {
            Bias::Bearish
        } else {
            Bias::Neutral
        }
    }
}

struct PaperState {
    rng: StdRng,
    step: u64,
    tapes: HashMap<String, Tape>,
}

pub struct PaperMarket {
    state: Mutex<PaperState>,
}

impl PaperMarket {
    pub fn new(seed: u64) -> Self {
        Self {
            state: Mutex::new(PaperState {
                rng: StdRng::seed_from_u64(seed),
                step: 0,
                tapes: HashMap::new(),
            }),
        }
    }

    /// Add a symbol opening at `price` and pre-fill enough history for the
    /// long volatility window.
    pub fn with_symbol(self, symbol: &str, price: f64, now: Timestamp, step_ms: u64) -> Self {
        if let Ok(mut st) = self.state.lock() {
            st.tapes.insert(symbol.to_string(), Tape::new(price));
            let warmup = LONG_WINDOW as u64 + 1;
            for i in 0..warmup {
                let ts = now.saturating_sub((warmup - i) * step_ms);
                advance(&mut st, ts, Some(symbol));
            }
        }
        self
    }

    pub fn symbols(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|st| {
                let mut v: Vec<String> = st.tapes.keys().cloned().collect();
                v.sort();
                v
            })
            .unwrap_or_default()
    }

    /// Advance every tape by one tick stamped `now`.
    pub fn step(&self, now: Timestamp) {
        if let Ok(mut st) = self.state.lock() {
            advance(&mut st, now, None);
        }
    }

    /// Force a tape to `price` (demo scenarios).
    pub fn set_price(&self, symbol: &str, price: f64, now: Timestamp) -> Result<()> {
        let mut st = self.lock()?;
        let tape = st
            .tapes
            .get_mut(symbol)
            .ok_or_else(|| anyhow!("unknown symbol {}", symbol))?;
        tape.price = price;
        push_tick(tape, Tick { price, volume: 1.0, ts: now });
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, PaperState>> {
        self.state.lock().map_err(|_| anyhow!("paper market poisoned"))
    }

    fn with_tape<T>(&self, symbol: &str, f: impl FnOnce(&Tape) -> T) -> Result<T> {
        let st = self.lock()?;
        let tape = st.tapes.get(symbol).ok_or_else(|| anyhow!("unknown symbol {}", symbol))?;
        Ok(f(tape))
    }
}

fn push_tick(tape: &mut Tape, tick: Tick) {
    if tape.ticks.len() == TAPE_CAPACITY {
        tape.ticks.pop_front();
    }
    tape.ticks.push_back(tick);
}

fn advance(st: &mut PaperState, now: Timestamp, only: Option<&str>) {
    st.step += 1;
    let drift = if st.step % 480 < 240 { 0.00004 } else { -0.00003 };
    let PaperState { rng, tapes, .. } = st;
    let mut symbols: Vec<&String> = tapes.keys().collect();
    symbols.sort();
    let symbols: Vec<String> = symbols.into_iter().cloned().collect();
    for symbol in symbols {
        if only.is_some_and(|o| o != symbol) {
            continue;
        }
        let Some(tape) = tapes.get_mut(&symbol) else {
            continue;
        };
        let flip: f64 = rng.gen();
        if flip < 0.02 {
            tape.vol = (tape.vol * 1.4).min(0.004);
        } else if flip > 0.98 {
            tape.vol = (tape.vol * 0.7).max(0.0001);
        }
        let noise: f64 = rng.gen_range(-1.0..1.0) * tape.vol;
        tape.price = (tape.price * (1.0 + drift + noise)).max(0.01);
        let volume = rng.gen_range(0.5..5.0) * (1.0 + tape.vol * 100.0);
        let tick = Tick {
            price: tape.price,
            volume,
            ts: now,
        };
        push_tick(tape, tick);
    }
}

#[async_trait]
impl MarketData for PaperMarket {
    async fn price(&self, symbol: &str) -> Result<Quote> {
        self.with_tape(symbol, |t| Quote {
            price: t.price,
            ts: t.ticks.back().map(|k| k.ts).unwrap_or(0),
        })
    }

    async fn volatility(&self, symbol: &str, window: VolWindow) -> Result<f64> {
        let n = match window {
            VolWindow::Short => SHORT_WINDOW,
            VolWindow::Long => LONG_WINDOW,
        };
        self.with_tape(symbol, |t| t.realized_vol(n))
    }

    async fn phase(&self, symbol: &str) -> Result<MarketPhase> {
        self.with_tape(symbol, |t| {
            let short = t.realized_vol(SHORT_WINDOW);
            let long = t.realized_vol(LONG_WINDOW);
            let ratio = if long > 0.0 { short / long } else { 1.0 };
            let trend = t.change(LONG_WINDOW / 2).abs();
            let trending = long > 0.0 && trend > long * 12.0;
            let recent = t.change(SHORT_WINDOW);
            let against = t.change(LONG_WINDOW / 2).signum() != recent.signum();
            match (ratio, trending) {
                (r, _) if r > 1.6 => MarketPhase::Expansion,
                (r, _) if r < 0.6 => MarketPhase::Compression,
                (r, true) if r > 1.2 => MarketPhase::Exhaustion,
                (_, true) if against => MarketPhase::Reversion,
                (_, true) => MarketPhase::Trend,
                _ => MarketPhase::Distribution,
            }
        })
    }

    async fn recent_ticks(&self, symbol: &str, limit: usize) -> Result<Vec<Tick>> {
        self.with_tape(symbol, |t| t.last(limit).copied().collect())
    }
}

#[async_trait]
impl BiasSource for PaperMarket {
    async fn higher_timeframe_bias(&self, symbol: &str, view: HtfView) -> Result<Bias> {
        let n = match view {
            HtfView::Primary => LONG_WINDOW * 2,
            HtfView::Secondary => LONG_WINDOW,
        };
        self.with_tape(symbol, |t| t.bias_over(n))
    }

    async fn mean_price_side(&self, symbol: &str) -> Result<PriceSide> {
        self.with_tape(symbol, |t| match t.mean(LONG_WINDOW) {
            Some(mean) if t.price < mean => PriceSide::Below,
            _ => PriceSide::Above,
        })
    }
}

/// Paper activation: the market has traded through the entry.
/// Named predicates are not evaluated here.
#[async_trait]
impl SignalEvaluator for PaperMarket {
    async fn conditions_met(&self, plan: &Plan) -> Result<bool> {
        let price = self.with_tape(&plan.symbol, |t| t.price)?;
        Ok(match plan.direction {
            Direction::Long => price <= plan.prices.entry,
            Direction::Short => price >= plan.prices.entry,
        })
    }
}

/// Fills every order at the current paper price.
pub struct PaperVenue {
    market: Arc<PaperMarket>,
}

impl PaperVenue {
    pub fn new(market: Arc<PaperMarket>) -> Self {
        Self { market }
    }
}

#[async_trait]
impl ExecutionVenue for PaperVenue {
    async fn submit_order(&self, ticket: &OrderTicket) -> Result<VenueFill> {
        let quote = self.market.price(&ticket.symbol).await?;
        Ok(VenueFill {
            ticket: format!("paper-{}", ticket.client_id),
            filled_price: quote.price,
        })
    }
}
