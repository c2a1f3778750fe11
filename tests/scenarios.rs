//! End-to-end plan supervision scenarios against scripted collaborators.
//!
//! Each test drives `Engine::evaluate` (or a monitor tick) one simulated
//! minute at a time so bias snapshots and rate spacing never collide.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use common::{at, long_spec, spec_with, test_config, Rig, SYMBOL};
use planwarden::desk::Amendment;
use planwarden::error::PlanError;
use planwarden::governor::DensityCap;
use planwarden::market::{Bias, MarketPhase, PriceSide, StructureBreak};
use planwarden::monitor::Monitor;
use planwarden::pipeline::EvalMode;
use planwarden::plan::{PlanFilter, PlanState};

fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-6
}

async fn submit_long(rig: &Rig) -> u64 {
    rig.desk.submit(long_spec(), at(0)).await.unwrap()
}

#[tokio::test]
async fn test_reanchor_preserves_geometry() {
    let mut rig = Rig::new(test_config());
    let id = submit_long(&rig).await;
    let created = rig.plan(id);
    assert_eq!(created.anchor.price, 90_320.0);
    assert_eq!(created.drift_threshold, 40.0);

    rig.market.set_price(SYMBOL, 90_365.0);
    let report = rig.engine.evaluate(created, at(1), EvalMode::Normal).await.unwrap();
    assert!(report.reanchored);
    assert!(!report.predictive);

    let plan = rig.plan(id);
    assert!(approx(plan.prices.entry, 90_355.0));
    assert!(approx(plan.prices.stop, 90_255.0));
    assert!(approx(plan.prices.target, 90_555.0));
    assert!((plan.prices.risk_reward() - 2.0).abs() <= 0.05);
    assert_eq!(plan.anchor.price, 90_365.0);
    assert_eq!(plan.anchor.window_updates, 1);
    assert_eq!(plan.counters.anchor_updates, 1);
    assert_eq!(plan.revision, 2);
    assert_eq!(rig.drain_kinds(), vec!["re_anchored"]);
}

#[tokio::test]
async fn test_drift_below_threshold_does_not_reanchor() {
    let rig = Rig::new(test_config());
    let id = submit_long(&rig).await;

    rig.market.set_price(SYMBOL, 90_350.0);
    let report = rig.engine.evaluate(rig.plan(id), at(1), EvalMode::Normal).await.unwrap();
    assert!(!report.reanchored);
    assert!(!report.risk_refreshed);

    let plan = rig.plan(id);
    assert_eq!(plan.revision, 1);
    assert_eq!(plan.prices.entry, 90_310.0);
    assert_eq!(plan.counters.anchor_updates, 0);
}

#[tokio::test]
async fn test_cumulative_drift_reanchors_once() {
    let rig = Rig::new(test_config());
    let id = submit_long(&rig).await;

    let mut reanchors = 0;
    for (minute, price) in [(1, 90_335.0), (2, 90_350.0), (3, 90_361.0), (4, 90_365.0)] {
        rig.market.set_price(SYMBOL, price);
        let report = rig.engine.evaluate(rig.plan(id), at(minute), EvalMode::Normal).await.unwrap();
        if report.reanchored {
            reanchors += 1;
            assert_eq!(minute, 3, "only the threshold crossing re-anchors");
        }
    }
    assert_eq!(reanchors, 1);
    let plan = rig.plan(id);
    assert_eq!(plan.counters.anchor_updates, 1);
    assert_eq!(plan.anchor.price, 90_361.0);
    assert!(approx(plan.prices.entry, 90_351.0));
}

#[tokio::test]
async fn test_volatility_pair_reused_within_ttl() {
    let rig = Rig::new(test_config());
    let id = submit_long(&rig).await;
    assert_eq!(rig.market.vol_calls.load(Ordering::SeqCst), 2);

    rig.engine.evaluate(rig.plan(id), at(0) + 1_000, EvalMode::Normal).await.unwrap();
    assert_eq!(rig.market.vol_calls.load(Ordering::SeqCst), 2);

    rig.engine.evaluate(rig.plan(id), at(1), EvalMode::Normal).await.unwrap();
    assert_eq!(rig.market.vol_calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_predictive_reanchor_in_expansion() {
    let rig = Rig::new(test_config());
    let id = submit_long(&rig).await;

    rig.market.set_phase(SYMBOL, MarketPhase::Expansion);
    rig.market.set_vol(SYMBOL, 20.0, 10.0);
    rig.market
        .set_tape(SYMBOL, 90_340.0, &[90_320.0, 90_325.0, 90_330.0, 90_335.0, 90_340.0]);

    let report = rig.engine.evaluate(rig.plan(id), at(1), EvalMode::Normal).await.unwrap();
    assert!(report.reanchored);
    assert!(report.predictive);

    let plan = rig.plan(id);
    assert_eq!(plan.counters.predictive_updates, 1);
    assert_eq!(plan.counters.anchor_updates, 1);
    // forecast: 90340 + 0.005/ms * 60s
    assert!(approx(plan.anchor.price, 90_640.0));
    assert!(approx(plan.prices.entry, 90_630.0));
    assert!((plan.prices.risk_reward() - 2.0).abs() <= 0.05);
}

#[tokio::test]
async fn test_rate_governor_defers_rapid_reanchors() {
    let rig = Rig::new(test_config());
    let id = submit_long(&rig).await;

    rig.market.set_price(SYMBOL, 90_365.0);
    let first = rig.engine.evaluate(rig.plan(id), at(1), EvalMode::Normal).await.unwrap();
    assert!(first.reanchored);

    // 10s later, another full threshold of drift: spacing defers it
    rig.market.set_price(SYMBOL, 90_420.0);
    let second = rig
        .engine
        .evaluate(rig.plan(id), at(1) + 10_000, EvalMode::Normal)
        .await
        .unwrap();
    assert!(!second.reanchored);
    assert!(second.rate_deferred);
    assert!(second.skipped.is_empty(), "deferral is not an error");
    assert_eq!(rig.plan(id).counters.anchor_updates, 1);

    let third = rig.engine.evaluate(rig.plan(id), at(3), EvalMode::Normal).await.unwrap();
    assert!(third.reanchored);
}

#[tokio::test]
async fn test_bias_conflict_suspends_then_rearms() {
    let mut rig = Rig::new(test_config());
    let id = submit_long(&rig).await;

    rig.bias.bearish();
    let first = rig.engine.evaluate(rig.plan(id), at(1), EvalMode::Normal).await.unwrap();
    assert!(!first.suspended);
    assert_eq!(rig.plan(id).state, PlanState::Pending);

    let second = rig.engine.evaluate(rig.plan(id), at(2), EvalMode::Normal).await.unwrap();
    assert!(second.suspended);
    let plan = rig.plan(id);
    assert_eq!(plan.state, PlanState::Suspended);
    assert_eq!(plan.state_reason, "bias_conflict:bearish");
    let cooldown = plan.suspension.as_ref().unwrap().cooldown_until;
    assert_eq!(cooldown, at(2) + 900_000);
    assert!(!rig.engine.density().contains(id));

    // still bearish during cooldown: no second suspension
    let third = rig.engine.evaluate(rig.plan(id), at(3), EvalMode::Normal).await.unwrap();
    assert!(!third.suspended);
    assert!(!third.rearmed);

    rig.bias.bullish();
    let early = rig.engine.evaluate(rig.plan(id), at(10), EvalMode::Normal).await.unwrap();
    assert!(!early.rearmed);

    let after = rig.engine.evaluate(rig.plan(id), cooldown, EvalMode::Normal).await.unwrap();
    assert!(after.rearmed);
    let plan = rig.plan(id);
    assert_eq!(plan.state, PlanState::Pending);
    assert!(plan.suspension.is_none());
    assert!(rig.engine.density().contains(id));

    let kinds = rig.drain_kinds();
    assert_eq!(kinds.iter().filter(|k| *k == "suspended").count(), 1);
    assert_eq!(kinds.last().map(String::as_str), Some("re_armed"));
}

#[tokio::test]
async fn test_weak_confluence_extends_cooldown() {
    let rig = Rig::new(test_config());
    let id = submit_long(&rig).await;

    rig.bias.bearish();
    rig.engine.evaluate(rig.plan(id), at(1), EvalMode::Normal).await.unwrap();
    rig.engine.evaluate(rig.plan(id), at(2), EvalMode::Normal).await.unwrap();
    let cooldown = rig.plan(id).suspension.unwrap().cooldown_until;

    rig.bias.set(Bias::Bullish, Bias::Neutral, PriceSide::Below);
    let report = rig.engine.evaluate(rig.plan(id), cooldown, EvalMode::Normal).await.unwrap();
    assert!(report.cooldown_extended);
    let plan = rig.plan(id);
    assert_eq!(plan.state, PlanState::Suspended);
    let suspension = plan.suspension.unwrap();
    assert_eq!(suspension.cooldown_until, cooldown + 900_000);
    assert_eq!(suspension.extensions, 1);
}

#[tokio::test]
async fn test_structure_break_fast_path() {
    let rig = Rig::new(test_config());
    let id = submit_long(&rig).await;

    rig.market.set_vol(SYMBOL, 25.0, 10.0);
    rig.bias.set_break(Some(StructureBreak {
        direction: Bias::Bearish,
        decisive: true,
    }));
    let report = rig.engine.evaluate(rig.plan(id), at(1), EvalMode::Normal).await.unwrap();
    assert!(report.suspended);
    assert_eq!(rig.plan(id).state_reason, "structure_break:bearish");
}

#[tokio::test]
async fn test_bias_outage_fails_closed() {
    let rig = Rig::new(test_config());
    let id = submit_long(&rig).await;

    rig.market.set_price(SYMBOL, 90_365.0);
    rig.signals.met.store(true, Ordering::SeqCst);
    rig.bias.fail.store(true, Ordering::SeqCst);

    let report = rig.engine.evaluate(rig.plan(id), at(1), EvalMode::Normal).await.unwrap();
    assert!(!report.reanchored);
    assert!(!report.executed);
    assert_eq!(report.skipped, vec!["collaborator_unavailable"]);
    assert_eq!(rig.plan(id).revision, 1);
    assert_eq!(rig.venue.submitted(), 0);
}

#[tokio::test]
async fn test_cancel_preempts_pipeline() {
    let rig = Rig::new(test_config());
    let id = submit_long(&rig).await;
    let stale = rig.plan(id);

    rig.signals.met.store(true, Ordering::SeqCst);
    rig.market.set_price(SYMBOL, 90_365.0);
    let cancelled = rig.desk.cancel(id, "trader_cancel", at(1)).await.unwrap();
    assert_eq!(cancelled.state, PlanState::Cancelled);
    assert!(!rig.engine.density().contains(id));

    // a worker holding the pre-cancel copy must not act on it
    let report = rig.engine.evaluate(stale, at(1), EvalMode::Normal).await.unwrap();
    assert!(report.preempted);
    assert!(!report.reanchored);
    assert_eq!(rig.venue.submitted(), 0);
    assert_eq!(rig.plan(id).state, PlanState::Cancelled);

    assert!(matches!(
        rig.desk.cancel(id, "again", at(2)).await,
        Err(PlanError::InvalidTransition { .. })
    ));
    assert!(matches!(
        rig.desk
            .amend(
                id,
                Amendment {
                    entry: Some(90_300.0),
                    ..Amendment::default()
                },
                at(2)
            )
            .await,
        Err(PlanError::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn test_failed_dispatch_keeps_triple() {
    let mut rig = Rig::new(test_config());
    let id = submit_long(&rig).await;
    let before = rig.plan(id);

    rig.signals.met.store(true, Ordering::SeqCst);
    rig.venue.reject.store(true, Ordering::SeqCst);
    let report = rig.engine.evaluate(before.clone(), at(1), EvalMode::Normal).await.unwrap();
    assert!(!report.executed);
    assert_eq!(report.skipped, vec!["execution_rejected"]);

    let after = rig.plan(id);
    assert_eq!(after.state, PlanState::Pending);
    assert_eq!(after.prices, before.prices);
    // only the dispatch intent was written
    assert_eq!(after.revision, before.revision + 1);
    assert_eq!(after.dispatch_intent.as_ref().unwrap().client_id, "pw-1-r1");

    rig.venue.reject.store(false, Ordering::SeqCst);
    let report = rig.engine.evaluate(after, at(2), EvalMode::Normal).await.unwrap();
    assert!(report.executed);

    let executed = rig.plan(id);
    assert_eq!(executed.state, PlanState::Executed);
    let fill = executed.fill.unwrap();
    assert_eq!(fill.client_id, "pw-1-r1");
    assert_eq!(fill.filled_price, 90_310.0);

    // one idempotency key across both attempts
    let tickets = rig.venue.tickets.lock().unwrap().clone();
    assert_eq!(tickets.len(), 2);
    assert_eq!(tickets[0].client_id, tickets[1].client_id);
    assert_eq!(rig.drain_kinds(), vec!["executed"]);
}

#[tokio::test]
async fn test_expiry_is_terminal() {
    let mut rig = Rig::new(test_config());
    let mut spec = long_spec();
    spec.expiry = at(5);
    let id = rig.desk.submit(spec, at(0)).await.unwrap();

    let report = rig.engine.evaluate(rig.plan(id), at(5), EvalMode::Normal).await.unwrap();
    assert!(report.expired);
    assert_eq!(rig.plan(id).state, PlanState::Expired);
    assert!(!rig.engine.density().contains(id));
    assert_eq!(rig.drain_kinds(), vec!["expired"]);

    let again = rig.engine.evaluate(rig.plan(id), at(6), EvalMode::Normal).await.unwrap();
    assert!(again.preempted);
}

#[tokio::test]
async fn test_read_only_mode_never_writes() {
    let rig = Rig::new(test_config());
    let id = submit_long(&rig).await;

    rig.market.set_price(SYMBOL, 90_400.0);
    rig.signals.met.store(true, Ordering::SeqCst);
    let report = rig.engine.evaluate(rig.plan(id), at(1), EvalMode::ReadOnly).await.unwrap();
    assert!(!report.reanchored);
    assert!(!report.executed);
    assert_eq!(rig.plan(id).revision, 1);
    assert_eq!(rig.venue.submitted(), 0);
}

#[tokio::test]
async fn test_density_eviction_and_rejection() {
    let mut cfg = test_config();
    cfg.density.caps.insert(
        MarketPhase::Compression,
        DensityCap {
            max_plans: 2,
            max_risk: 1.0,
        },
    );
    let mut rig = Rig::new(cfg);

    let weak = rig.desk.submit(spec_with(0.5, 0.01), at(0)).await.unwrap();
    let mid = rig.desk.submit(spec_with(0.6, 0.01), at(0)).await.unwrap();
    let strong = rig.desk.submit(spec_with(0.9, 0.01), at(1)).await.unwrap();

    let evicted = rig.plan(weak);
    assert_eq!(evicted.state, PlanState::Suspended);
    assert_eq!(evicted.state_reason, "density_eviction");
    assert!(rig.engine.density().contains(mid));
    assert!(rig.engine.density().contains(strong));
    assert_eq!(rig.engine.density().usage(SYMBOL, MarketPhase::Compression).0, 2);
    assert_eq!(rig.drain_kinds(), vec!["evicted"]);

    let refused = rig.desk.submit(spec_with(0.4, 0.01), at(2)).await;
    assert!(matches!(refused, Err(PlanError::AdmissionRejected(_))));
    let cancelled = rig
        .desk
        .list(&PlanFilter::all().with_states(&[PlanState::Cancelled]))
        .unwrap();
    assert_eq!(cancelled.len(), 1);
    assert_eq!(cancelled[0].state_reason, "density_rejected");
    assert_eq!(rig.engine.density().usage(SYMBOL, MarketPhase::Compression).0, 2);
}

#[tokio::test]
async fn test_amend_entry_rederives_stop_and_target() {
    let rig = Rig::new(test_config());
    let id = submit_long(&rig).await;

    let plan = rig
        .desk
        .amend(
            id,
            Amendment {
                entry: Some(90_300.0),
                confidence: Some(0.9),
                ..Amendment::default()
            },
            at(1),
        )
        .await
        .unwrap();
    assert!(approx(plan.prices.entry, 90_300.0));
    assert!(approx(plan.prices.stop, 90_200.0));
    assert!(approx(plan.prices.target, 90_500.0));
    assert_eq!(plan.confidence, 0.9);
    assert_eq!(plan.revision, 2);
    assert_eq!(plan.geometry.stop_distance, 100.0);
}

#[tokio::test]
async fn test_amend_explicit_stop_sets_geometry() {
    let rig = Rig::new(test_config());
    let id = submit_long(&rig).await;

    let plan = rig
        .desk
        .amend(
            id,
            Amendment {
                stop: Some(90_260.0),
                ..Amendment::default()
            },
            at(1),
        )
        .await
        .unwrap();
    assert_eq!(plan.prices.entry, 90_310.0);
    assert_eq!(plan.prices.stop, 90_260.0);
    assert_eq!(plan.prices.target, 90_510.0);
    assert!(approx(plan.geometry.stop_distance, 50.0));
    assert!(approx(plan.geometry.target_distance, 200.0));

    let bad = rig
        .desk
        .amend(
            id,
            Amendment {
                stop: Some(90_400.0),
                ..Amendment::default()
            },
            at(2),
        )
        .await;
    assert!(matches!(bad, Err(PlanError::InvalidSpec(_))));
    assert_eq!(rig.plan(id).revision, 2);
}

#[tokio::test]
async fn test_amend_suspended_plan() {
    let rig = Rig::new(test_config());
    let id = submit_long(&rig).await;
    rig.bias.bearish();
    rig.engine.evaluate(rig.plan(id), at(1), EvalMode::Normal).await.unwrap();
    rig.engine.evaluate(rig.plan(id), at(2), EvalMode::Normal).await.unwrap();
    assert_eq!(rig.plan(id).state, PlanState::Suspended);

    let plan = rig
        .desk
        .amend(
            id,
            Amendment {
                expiry: Some(at(600)),
                ..Amendment::default()
            },
            at(3),
        )
        .await
        .unwrap();
    assert_eq!(plan.state, PlanState::Suspended);
    assert_eq!(plan.expiry, at(600));
}

#[tokio::test]
async fn test_monitor_tick_and_store_outage() {
    let mut cfg = test_config();
    cfg.monitor.store_circuit_threshold = 2;
    let mut rig = Rig::new(cfg.clone());
    let a = submit_long(&rig).await;
    let b = rig.desk.submit(spec_with(0.8, 0.01), at(0)).await.unwrap();

    let monitor = Arc::new(Monitor::new(rig.engine.clone(), cfg.monitor.clone()));
    rig.market.set_price(SYMBOL, 90_365.0);
    let tick = monitor.tick(at(1)).await;
    assert_eq!(tick.evaluated, 2);
    assert_eq!(tick.reanchored, 2);
    assert!(!tick.read_only);
    assert_eq!(rig.plan(a).counters.anchor_updates, 1);
    assert_eq!(rig.plan(b).counters.anchor_updates, 1);

    rig.backend.set_fail_reads(true);
    rig.market.set_price(SYMBOL, 90_500.0);
    for minute in 2..4 {
        let tick = monitor.tick(at(minute)).await;
        assert!(tick.read_only);
        assert_eq!(tick.evaluated, 2);
        assert_eq!(tick.reanchored, 0);
    }
    assert!(monitor.store_outage());
    assert!(rig.drain_kinds().contains(&"store_outage".to_string()));

    rig.backend.set_fail_reads(false);
    let recovered = monitor.tick(at(4) + 30_000).await;
    assert!(!recovered.read_only);
    assert!(!monitor.store_outage());
}

#[tokio::test]
async fn test_store_write_outage_holds_dispatch() {
    let cfg = test_config();
    let mut rig = Rig::new(cfg.clone());
    let id = submit_long(&rig).await;
    let monitor = Monitor::new(rig.engine.clone(), cfg.monitor.clone());

    rig.signals.met.store(true, Ordering::SeqCst);
    rig.backend.set_fail_writes(true);
    let first = monitor.tick(at(1)).await;
    assert!(!first.read_only);
    assert_eq!(first.store_errors, 1);
    assert!(!monitor.store_outage());

    for minute in 2..=5 {
        let tick = monitor.tick(at(minute)).await;
        assert_eq!(tick.executed, 0);
    }
    assert_eq!(rig.venue.submitted(), 0);
    assert!(monitor.store_outage());
    // failed half-open ticks do not repeat the alert
    assert_eq!(rig.drain_kinds(), vec!["store_outage"]);
    let plan = rig.plan(id);
    assert_eq!(plan.state, PlanState::Pending);
    assert_eq!(plan.revision, 1);

    rig.backend.set_fail_writes(false);
    let recovered = monitor.tick(at(6)).await;
    assert!(!recovered.read_only);
    assert_eq!(recovered.executed, 1);
    assert!(!monitor.store_outage());
    assert_eq!(rig.venue.submitted(), 1);
    assert_eq!(rig.plan(id).state, PlanState::Executed);
}

#[tokio::test]
async fn test_store_outage_circuit_blocks_writes_while_open() {
    let mut cfg = test_config();
    cfg.monitor.store_circuit_threshold = 2;
    cfg.monitor.store_circuit_reset_ms = 10 * 60_000;
    let rig = Rig::new(cfg.clone());
    let id = submit_long(&rig).await;
    let monitor = Monitor::new(rig.engine.clone(), cfg.monitor.clone());

    rig.signals.met.store(true, Ordering::SeqCst);
    rig.backend.set_fail_writes(true);
    assert!(!monitor.tick(at(1)).await.read_only);
    assert!(!monitor.tick(at(2)).await.read_only);
    assert!(monitor.store_outage());

    // writes are back but the circuit stays open until its reset window passes
    rig.backend.set_fail_writes(false);
    let held = monitor.tick(at(3)).await;
    assert!(held.read_only);
    assert_eq!(rig.venue.submitted(), 0);
    assert_eq!(rig.plan(id).state, PlanState::Pending);

    let reopened = monitor.tick(at(12)).await;
    assert!(!reopened.read_only);
    assert_eq!(reopened.executed, 1);
    assert!(!monitor.store_outage());
}

fn two_slot_config() -> planwarden::config::Config {
    let mut cfg = test_config();
    cfg.density.caps.insert(
        MarketPhase::Compression,
        DensityCap {
            max_plans: 2,
            max_risk: 1.0,
        },
    );
    cfg
}

#[tokio::test]
async fn test_failed_eviction_refuses_newcomer() {
    let rig = Rig::new(two_slot_config());
    let weak = rig.desk.submit(spec_with(0.5, 0.01), at(0)).await.unwrap();
    let mid = rig.desk.submit(spec_with(0.6, 0.01), at(0)).await.unwrap();

    rig.backend.set_fail_writes(true);
    let refused = rig.desk.submit(spec_with(0.9, 0.01), at(1)).await;
    assert!(matches!(refused, Err(PlanError::StoreUnavailable(_))));
    rig.backend.set_fail_writes(false);

    // the would-be victim is still active and still counted
    assert_eq!(rig.plan(weak).state, PlanState::Pending);
    assert!(rig.engine.density().contains(weak));
    assert!(rig.engine.density().contains(mid));
    assert_eq!(rig.engine.density().usage(SYMBOL, MarketPhase::Compression).0, 2);
    assert_eq!(rig.desk.list(&PlanFilter::all()).unwrap().len(), 2);

    let strong = rig.desk.submit(spec_with(0.9, 0.01), at(2)).await.unwrap();
    assert_eq!(rig.plan(weak).state, PlanState::Suspended);
    assert!(!rig.engine.density().contains(weak));
    assert!(rig.engine.density().contains(strong));
    assert_eq!(rig.engine.density().usage(SYMBOL, MarketPhase::Compression).0, 2);
}

#[tokio::test]
async fn test_failed_eviction_defers_rearm() {
    let mut rig = Rig::new(two_slot_config());
    let strong = rig.desk.submit(spec_with(0.9, 0.01), at(0)).await.unwrap();
    rig.bias.bearish();
    rig.engine.evaluate(rig.plan(strong), at(1), EvalMode::Normal).await.unwrap();
    rig.engine.evaluate(rig.plan(strong), at(2), EvalMode::Normal).await.unwrap();
    let cooldown = rig.plan(strong).suspension.unwrap().cooldown_until;

    let weak = rig.desk.submit(spec_with(0.5, 0.01), at(3)).await.unwrap();
    let mid = rig.desk.submit(spec_with(0.6, 0.01), at(3)).await.unwrap();
    rig.bias.bullish();
    rig.engine.evaluate(rig.plan(strong), at(10), EvalMode::Normal).await.unwrap();

    rig.backend.set_fail_writes(true);
    let report = rig.engine.evaluate(rig.plan(strong), cooldown, EvalMode::Normal).await.unwrap();
    rig.backend.set_fail_writes(false);
    assert!(!report.rearmed);
    assert!(report.store_failed);
    assert_eq!(report.skipped, vec!["store_unavailable"]);
    assert_eq!(rig.plan(strong).state, PlanState::Suspended);
    assert_eq!(rig.plan(weak).state, PlanState::Pending);
    assert!(rig.engine.density().contains(weak) && rig.engine.density().contains(mid));
    assert!(!rig.engine.density().contains(strong));
    assert_eq!(rig.engine.density().usage(SYMBOL, MarketPhase::Compression).0, 2);

    let report = rig
        .engine
        .evaluate(rig.plan(strong), cooldown + 60_000, EvalMode::Normal)
        .await
        .unwrap();
    assert!(report.rearmed);
    assert_eq!(rig.plan(weak).state, PlanState::Suspended);
    assert!(rig.engine.density().contains(strong));
    assert_eq!(rig.engine.density().usage(SYMBOL, MarketPhase::Compression).0, 2);
    let kinds = rig.drain_kinds();
    assert!(kinds.contains(&"evicted".to_string()));
    assert_eq!(kinds.last().map(String::as_str), Some("re_armed"));
}
