//! Scripted collaborators for integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;

use planwarden::config::Config;
use planwarden::desk::PlanDesk;
use planwarden::dispatch::{ExecutionVenue, OrderTicket, VenueFill};
use planwarden::market::{
    Bias, BiasSource, HtfView, MarketData, MarketPhase, PriceSide, Quote, SignalEvaluator, StructureBreak, Tick,
    VolWindow,
};
use planwarden::notify::{ChannelSink, Notification, Notifier};
use planwarden::pipeline::{Collaborators, Engine};
use planwarden::plan::{AnchorType, Archetype, ConditionSet, Direction, Plan, PlanSpec, Timestamp};
use planwarden::store::{DurableStore, MemoryStore, PlanStore};

pub const SYMBOL: &str = "BTCUSDT";
pub const MINUTE: u64 = 60_000;

#[derive(Debug, Clone)]
struct Book {
    price: f64,
    vol_short: f64,
    vol_long: f64,
    phase: MarketPhase,
    ticks: Vec<Tick>,
}

/// Market whose price, volatility and phase are set by the test.
pub struct FakeMarket {
    books: Mutex<HashMap<String, Book>>,
    pub fail: AtomicBool,
    pub vol_calls: AtomicU32,
}

impl FakeMarket {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            books: Mutex::new(HashMap::new()),
            fail: AtomicBool::new(false),
            vol_calls: AtomicU32::new(0),
        })
    }

    /// Flat tape at `price`: every anchor type resolves to `price`.
    pub fn set_price(&self, symbol: &str, price: f64) {
        let mut books = self.books.lock().unwrap();
        let book = books.entry(symbol.to_string()).or_insert(Book {
            price,
            vol_short: 10.0,
            vol_long: 10.0,
            phase: MarketPhase::Compression,
            ticks: vec![],
        });
        book.price = price;
        book.ticks = (0..5)
            .map(|i| Tick {
                price,
                volume: 1.0,
                ts: i * 1_000,
            })
            .collect();
    }

    /// Quote at `price` over an explicit tick history, one second apart.
    pub fn set_tape(&self, symbol: &str, price: f64, tick_prices: &[f64]) {
        self.set_price(symbol, price);
        let mut books = self.books.lock().unwrap();
        if let Some(b) = books.get_mut(symbol) {
            b.ticks = tick_prices
                .iter()
                .enumerate()
                .map(|(i, p)| Tick {
                    price: *p,
                    volume: 1.0,
                    ts: i as u64 * 1_000,
                })
                .collect();
        }
    }

    pub fn set_vol(&self, symbol: &str, short: f64, long: f64) {
        let mut books = self.books.lock().unwrap();
        if let Some(b) = books.get_mut(symbol) {
            b.vol_short = short;
            b.vol_long = long;
        }
    }

    pub fn set_phase(&self, symbol: &str, phase: MarketPhase) {
        let mut books = self.books.lock().unwrap();
        if let Some(b) = books.get_mut(symbol) {
            b.phase = phase;
        }
    }

    fn book(&self, symbol: &str) -> Result<Book> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow!("market feed down"));
        }
        self.books
            .lock()
            .unwrap()
            .get(symbol)
            .cloned()
            .ok_or_else(|| anyhow!("no book for {}", symbol))
    }
}

#[async_trait]
impl MarketData for FakeMarket {
    async fn price(&self, symbol: &str) -> Result<Quote> {
        Ok(Quote {
            price: self.book(symbol)?.price,
            ts: 0,
        })
    }

    async fn volatility(&self, symbol: &str, window: VolWindow) -> Result<f64> {
        self.vol_calls.fetch_add(1, Ordering::SeqCst);
        let b = self.book(symbol)?;
        Ok(match window {
            VolWindow::Short => b.vol_short,
            VolWindow::Long => b.vol_long,
        })
    }

    async fn phase(&self, symbol: &str) -> Result<MarketPhase> {
        Ok(self.book(symbol)?.phase)
    }

    async fn recent_ticks(&self, symbol: &str, limit: usize) -> Result<Vec<Tick>> {
        let ticks = self.book(symbol)?.ticks;
        let skip = ticks.len().saturating_sub(limit);
        Ok(ticks[skip..].to_vec())
    }
}

/// Bias votes set by the test. Starts bullish on every view.
pub struct FakeBias {
    votes: Mutex<(Bias, Bias, PriceSide)>,
    brk: Mutex<Option<StructureBreak>>,
    pub fail: AtomicBool,
}

impl FakeBias {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            votes: Mutex::new((Bias::Bullish, Bias::Bullish, PriceSide::Above)),
            brk: Mutex::new(None),
            fail: AtomicBool::new(false),
        })
    }

    pub fn bullish(&self) {
        *self.votes.lock().unwrap() = (Bias::Bullish, Bias::Bullish, PriceSide::Above);
    }

    pub fn bearish(&self) {
        *self.votes.lock().unwrap() = (Bias::Bearish, Bias::Bearish, PriceSide::Below);
    }

    pub fn set(&self, primary: Bias, secondary: Bias, side: PriceSide) {
        *self.votes.lock().unwrap() = (primary, secondary, side);
    }

    pub fn set_break(&self, brk: Option<StructureBreak>) {
        *self.brk.lock().unwrap() = brk;
    }

    fn check(&self) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow!("structure service down"));
        }
        Ok(())
    }
}

#[async_trait]
impl BiasSource for FakeBias {
    async fn higher_timeframe_bias(&self, _symbol: &str, view: HtfView) -> Result<Bias> {
        self.check()?;
        let (a, b, _) = *self.votes.lock().unwrap();
        Ok(match view {
            HtfView::Primary => a,
            HtfView::Secondary => b,
        })
    }

    async fn mean_price_side(&self, _symbol: &str) -> Result<PriceSide> {
        self.check()?;
        Ok(self.votes.lock().unwrap().2)
    }

    async fn structure_break(&self, _symbol: &str) -> Result<Option<StructureBreak>> {
        self.check()?;
        Ok(*self.brk.lock().unwrap())
    }
}

/// Conditions are unmet until the test says otherwise.
pub struct FakeSignals {
    pub met: AtomicBool,
    pub calls: AtomicU32,
}

impl FakeSignals {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            met: AtomicBool::new(false),
            calls: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl SignalEvaluator for FakeSignals {
    async fn conditions_met(&self, _plan: &Plan) -> Result<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.met.load(Ordering::SeqCst))
    }
}

/// Records every ticket; fills at the ticket entry unless `reject` is set.
pub struct FakeVenue {
    pub reject: AtomicBool,
    pub tickets: Mutex<Vec<OrderTicket>>,
}

impl FakeVenue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            reject: AtomicBool::new(false),
            tickets: Mutex::new(Vec::new()),
        })
    }

    pub fn submitted(&self) -> usize {
        self.tickets.lock().unwrap().len()
    }
}

#[async_trait]
impl ExecutionVenue for FakeVenue {
    async fn submit_order(&self, ticket: &OrderTicket) -> Result<VenueFill> {
        self.tickets.lock().unwrap().push(ticket.clone());
        if self.reject.load(Ordering::SeqCst) {
            return Err(anyhow!("venue rejected {}", ticket.client_id));
        }
        Ok(VenueFill {
            ticket: format!("v-{}", ticket.client_id),
            filled_price: ticket.entry,
        })
    }
}

pub struct Rig {
    pub engine: Arc<Engine>,
    pub desk: PlanDesk,
    pub backend: Arc<MemoryStore>,
    pub market: Arc<FakeMarket>,
    pub bias: Arc<FakeBias>,
    pub signals: Arc<FakeSignals>,
    pub venue: Arc<FakeVenue>,
    pub notes: mpsc::Receiver<Notification>,
}

impl Rig {
    pub fn new(cfg: Config) -> Self {
        let backend = Arc::new(MemoryStore::new());
        let market = FakeMarket::new();
        market.set_price(SYMBOL, 90_320.0);
        let bias = FakeBias::new();
        let signals = FakeSignals::new();
        let venue = FakeVenue::new();
        let (sink, notes) = ChannelSink::new(256);
        let store_backend: Arc<dyn DurableStore> = backend.clone();
        let store = Arc::new(PlanStore::new(store_backend).with_retry(cfg.retry.clone()));
        let collab = Collaborators {
            market: market.clone(),
            bias: bias.clone(),
            signals: signals.clone(),
            venue: venue.clone(),
            notifier: Notifier::default().with_sink(Arc::new(sink)),
        };
        let engine = Arc::new(Engine::new(store, collab, &cfg));
        Self {
            desk: PlanDesk::new(engine.clone()),
            engine,
            backend,
            market,
            bias,
            signals,
            venue,
            notes,
        }
    }

    pub fn plan(&self, id: u64) -> Plan {
        self.engine.store().get(id).unwrap()
    }

    /// Notification kinds received so far, in order.
    pub fn drain_kinds(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(n) = self.notes.try_recv() {
            out.push(n.kind.as_str().to_string());
        }
        out
    }
}

/// Config with quiet logging and fast retries.
pub fn test_config() -> Config {
    std::env::set_var("LOG_STDOUT", "0");
    std::env::set_var("LOG_DIR", std::env::temp_dir().join("planwarden-test-runs"));
    let mut cfg = Config::default();
    cfg.retry.base_delay_ms = 1;
    cfg.retry.max_delay_ms = 2;
    cfg
}

/// Long mean-reversion plan on BTCUSDT: entry 90310, stop 90210, target
/// 90510 (R:R 2), tick-mean anchored, threshold 40.
pub fn long_spec() -> PlanSpec {
    PlanSpec {
        symbol: SYMBOL.to_string(),
        direction: Direction::Long,
        entry: 90_310.0,
        stop: 90_210.0,
        target: 90_510.0,
        archetype: Archetype::MeanReversion,
        proximity_tracking: true,
        anchor_type: AnchorType::TickMean,
        drift_threshold: Some(40.0),
        conditions: ConditionSet::new(["htf_pullback_complete"]),
        expiry: 100 * 24 * 3_600_000,
        risk_unit: 0.01,
        confidence: 0.7,
    }
}

pub fn spec_with(confidence: f64, risk_unit: f64) -> PlanSpec {
    PlanSpec {
        confidence,
        risk_unit,
        ..long_spec()
    }
}

pub fn at(minutes: u64) -> Timestamp {
    1_000_000 + minutes * MINUTE
}
