use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::json;
use tokio::sync::watch;
use tokio::time::{interval, Duration, MissedTickBehavior};

use planwarden::config::{Config, StoreBackend};
use planwarden::desk::PlanDesk;
use planwarden::logging::{self, log, obj, v_str, Domain, Level};
use planwarden::market::paper::{start_price, PaperMarket, PaperVenue};
use planwarden::monitor::Monitor;
use planwarden::notify::{LogSink, Notifier};
use planwarden::pipeline::{Collaborators, Engine};
use planwarden::plan::{AnchorType, Archetype, ConditionSet, Direction, PlanSpec, Timestamp};
use planwarden::store::{DurableStore, Journal, MemoryStore, PlanStore, SqliteStore};

/// Plans submitted when the store is empty and no `SEED_PLANS` is given:
/// one long and one short per symbol, bracketing the current price.
fn demo_specs(market: &PaperMarket, cfg: &Config, now: Timestamp) -> Vec<PlanSpec> {
    let mut specs = Vec::new();
    for symbol in market.symbols() {
        let px = start_price(&symbol);
        let unit = px * 0.001;
        for (direction, archetype, anchor_type) in [
            (Direction::Long, Archetype::MeanReversion, AnchorType::TickMean),
            (Direction::Short, Archetype::BreakoutContinuation, AnchorType::Swing),
        ] {
            let sign = direction.sign();
            let entry = px - sign * unit;
            specs.push(PlanSpec {
                symbol: symbol.clone(),
                direction,
                entry,
                stop: entry - sign * unit * 2.0,
                target: entry + sign * unit * 5.0,
                archetype,
                proximity_tracking: true,
                anchor_type,
                drift_threshold: None,
                conditions: ConditionSet::default(),
                expiry: now + cfg.monitor.tick_ms * 240,
                risk_unit: 0.01,
                confidence: 0.6,
            });
        }
    }
    specs
}

fn seed_specs(market: &PaperMarket, cfg: &Config, now: Timestamp) -> Result<Vec<PlanSpec>> {
    match &cfg.paper.seed_plans {
        Some(raw) => serde_json::from_str(raw).context("SEED_PLANS is not a JSON array of plan specs"),
        None => Ok(demo_specs(market, cfg, now)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();
    cfg.validate()?;
    let now = logging::ts_epoch_ms();

    let backend: Arc<dyn DurableStore> = match cfg.store.backend {
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
        StoreBackend::Sqlite => Arc::new(SqliteStore::open(&cfg.store.sqlite_path)?),
    };
    let mut store = PlanStore::new(backend).with_retry(cfg.retry.clone());
    if let Some(path) = &cfg.store.journal_path {
        let recovery = Journal::recover(path)?;
        log(
            Level::Info,
            Domain::Store,
            "journal_recovery",
            obj(&[
                ("plans", json!(recovery.plans.len())),
                ("open", json!(recovery.open_plans().len())),
                ("malformed", json!(recovery.malformed)),
            ]),
        );
        store = store.with_journal(Journal::open(path)?);
    }

    let market = Arc::new(cfg.paper.symbols.iter().fold(PaperMarket::new(cfg.paper.seed), |m, s| {
        m.with_symbol(s, start_price(s), now, cfg.paper.step_ms)
    }));
    let collab = Collaborators {
        market: market.clone(),
        bias: market.clone(),
        signals: market.clone(),
        venue: Arc::new(PaperVenue::new(market.clone())),
        notifier: Notifier::default().with_sink(Arc::new(LogSink)),
    };
    let engine = Arc::new(Engine::new(Arc::new(store), collab, &cfg));
    let restored = engine.rebuild_ledger()?;

    log(
        Level::Info,
        Domain::System,
        "startup",
        obj(&[
            ("store", v_str(engine.store().backend_name())),
            ("symbols", json!(cfg.paper.symbols)),
            ("seed", json!(cfg.paper.seed)),
            ("restored_active", json!(restored)),
        ]),
    );

    let desk = PlanDesk::new(engine.clone());
    if restored == 0 {
        for spec in seed_specs(&market, &cfg, now)? {
            let symbol = spec.symbol.clone();
            match desk.submit(spec, now).await {
                Ok(id) => log(
                    Level::Info,
                    Domain::Plan,
                    "seed_submitted",
                    obj(&[("plan_id", json!(id)), ("symbol", v_str(&symbol))]),
                ),
                Err(err) => log(
                    Level::Warn,
                    Domain::Plan,
                    "seed_rejected",
                    obj(&[("symbol", v_str(&symbol)), ("error", v_str(&err.to_string()))]),
                ),
            }
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let feed = {
        let market = market.clone();
        let mut shutdown = shutdown_rx.clone();
        let step_ms = cfg.paper.step_ms.max(1);
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_millis(step_ms));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => market.step(logging::ts_epoch_ms()),
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    };

    let monitor = Arc::new(Monitor::new(engine.clone(), cfg.monitor.clone()));
    let monitor_task = tokio::spawn(monitor.run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    log(Level::Info, Domain::System, "shutdown_requested", obj(&[]));
    let _ = shutdown_tx.send(true);
    let _ = feed.await;
    let _ = monitor_task.await;
    logging::flush();
    Ok(())
}
