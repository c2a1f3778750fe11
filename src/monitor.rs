//! Fixed-tick monitor loop.
//!
//! Each tick snapshots the non-terminal plans, orders them by confidence
//! (highest first) then age (oldest first) and evaluates them on a bounded
//! worker pool. Every evaluation has its own time budget. Plans not started
//! before the tick budget runs out wait for the next tick.

use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{interval, timeout, Duration, MissedTickBehavior};

use crate::error::PlanError;
use crate::logging::{self, log, log_stage_skipped, log_tick_summary, obj, v_num, v_str, Domain, Level};
use crate::notify::{Notification, NotificationKind};
use crate::pipeline::{Engine, EvalMode, PlanReport};
use crate::plan::{Plan, PlanFilter, PlanId, Timestamp};
use crate::reliability::circuit::CircuitBreaker;

#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    pub tick_ms: u64,
    /// Wall time a tick may spend starting evaluations.
    pub tick_budget_ms: u64,
    pub plan_budget_ms: u64,
    pub workers: usize,
    /// A tick longer than this multiple of its budget raises an overload signal.
    pub overload_multiple: f64,
    pub store_circuit_threshold: u32,
    pub store_circuit_reset_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            tick_ms: 15_000,
            tick_budget_ms: 12_000,
            plan_budget_ms: 2_000,
            workers: num_cpus::get().max(1),
            overload_multiple: 2.0,
            store_circuit_threshold: 3,
            store_circuit_reset_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub tick: u64,
    pub evaluated: u64,
    pub reanchored: u64,
    pub suspended: u64,
    pub rearmed: u64,
    pub executed: u64,
    pub expired: u64,
    pub rate_deferred: u64,
    pub deferred: u64,
    pub timed_out: u64,
    pub errored: u64,
    /// Evaluations the durable store failed this tick.
    pub store_errors: u64,
    pub read_only: bool,
    pub overloaded: bool,
    pub elapsed_ms: f64,
}

impl TickReport {
    fn absorb(&mut self, r: &PlanReport) {
        self.evaluated += 1;
        self.reanchored += r.reanchored as u64;
        self.suspended += r.suspended as u64;
        self.rearmed += r.rearmed as u64;
        self.executed += r.executed as u64;
        self.expired += r.expired as u64;
        self.rate_deferred += r.rate_deferred as u64;
        self.errored += !r.skipped.is_empty() as u64;
    }
}

/// Highest confidence first, then oldest.
pub fn prioritize(plans: &mut [Plan]) {
    plans.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.created_at.cmp(&b.created_at))
            .then(a.id.cmp(&b.id))
    });
}

enum Outcome {
    Done(PlanReport),
    Failed(PlanError),
    TimedOut,
}

pub struct Monitor {
    engine: Arc<Engine>,
    cfg: MonitorConfig,
    tick_seq: AtomicU64,
    store_circuit: Mutex<CircuitBreaker>,
    last_known: Mutex<Vec<Plan>>,
}

impl Monitor {
    pub fn new(engine: Arc<Engine>, cfg: MonitorConfig) -> Self {
        let circuit = CircuitBreaker::new(cfg.store_circuit_threshold, cfg.store_circuit_reset_ms);
        Self {
            engine,
            cfg,
            tick_seq: AtomicU64::new(0),
            store_circuit: Mutex::new(circuit),
            last_known: Mutex::new(Vec::new()),
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.cfg
    }

    pub fn store_outage(&self) -> bool {
        self.store_circuit.lock().map(|c| c.is_open()).unwrap_or(true)
    }

    /// Plans to evaluate and the mode to evaluate them in. Falls back to the
    /// last good listing when the store cannot be read.
    fn load(&self, now: Timestamp) -> (Vec<Plan>, EvalMode) {
        let cached = || self.last_known.lock().map(|v| v.clone()).unwrap_or_default();
        let allowed = self.store_circuit.lock().map(|mut c| c.allow(now)).unwrap_or(false);
        if !allowed {
            return (cached(), EvalMode::ReadOnly);
        }

        match self.engine.store().list(&PlanFilter::non_terminal()) {
            Ok(plans) => {
                if let Ok(mut last) = self.last_known.lock() {
                    *last = plans.clone();
                }
                (plans, EvalMode::Normal)
            }
            Err(err) => {
                self.store_failed("store_read_failed", &err.to_string(), now);
                (cached(), EvalMode::ReadOnly)
            }
        }
    }

    /// Count one store failure against the circuit; the failure that opens
    /// it raises the outage.
    fn store_failed(&self, event: &str, detail: &str, now: Timestamp) {
        let opened = self
            .store_circuit
            .lock()
            .map(|mut c| c.record_failure(now))
            .unwrap_or(false);
        log(
            Level::Error,
            Domain::Store,
            event,
            obj(&[("error", v_str(detail)), ("circuit_opened", json!(opened))]),
        );
        if opened {
            self.engine
                .notifier()
                .send(Notification::system(NotificationKind::StoreOutage, detail, now));
        }
    }

    /// Close the books on a tick that ran against the store. Any read or
    /// write the store refused counts as one failure; a clean tick resets it.
    fn settle_store(&self, failure: Option<String>, now: Timestamp) {
        if let Some(detail) = failure {
            return self.store_failed("store_write_failed", &detail, now);
        }
        let recovered = self
            .store_circuit
            .lock()
            .map(|mut c| {
                let was_down = c.failures > 0;
                c.record_success();
                was_down
            })
            .unwrap_or(false);
        if recovered {
            log(Level::Info, Domain::Store, "store_recovered", obj(&[]));
        }
    }

    pub async fn tick(&self, now: Timestamp) -> TickReport {
        let started = Instant::now();
        let tick = self.tick_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let (mut plans, mode) = self.load(now);
        prioritize(&mut plans);

        let mut report = TickReport {
            tick,
            read_only: mode == EvalMode::ReadOnly,
            ..TickReport::default()
        };
        let budget = Duration::from_millis(self.cfg.tick_budget_ms);
        let plan_budget = Duration::from_millis(self.cfg.plan_budget_ms);
        let workers = Arc::new(Semaphore::new(self.cfg.workers.max(1)));
        let mut tasks: JoinSet<(PlanId, Outcome)> = JoinSet::new();

        let total = plans.len() as u64;
        let mut started_count = 0u64;
        for plan in plans {
            if started.elapsed() >= budget {
                break;
            }
            let Ok(permit) = workers.clone().acquire_owned().await else {
                break;
            };
            if started.elapsed() >= budget {
                break;
            }
            started_count += 1;
            let engine = self.engine.clone();
            tasks.spawn(async move {
                let id = plan.id;
                let outcome = match timeout(plan_budget, engine.evaluate(plan, now, mode)).await {
                    Ok(Ok(r)) => Outcome::Done(r),
                    Ok(Err(e)) => Outcome::Failed(e),
                    Err(_) => Outcome::TimedOut,
                };
                drop(permit);
                (id, outcome)
            });
        }
        report.deferred = total - started_count;

        let mut store_failure: Option<String> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((id, Outcome::Done(r))) => {
                    if r.store_failed {
                        report.store_errors += 1;
                        store_failure.get_or_insert_with(|| format!("plan {}: store write refused", id));
                    }
                    report.absorb(&r);
                }
                Ok((id, Outcome::Failed(err))) => {
                    report.errored += 1;
                    if matches!(err, PlanError::StoreUnavailable(_)) {
                        report.store_errors += 1;
                        store_failure.get_or_insert_with(|| err.to_string());
                    }
                    log_stage_skipped(id, "evaluate", err.kind(), &err.to_string());
                }
                Ok((id, Outcome::TimedOut)) => {
                    report.timed_out += 1;
                    log_stage_skipped(id, "evaluate", "timeout", &format!("exceeded {}ms", self.cfg.plan_budget_ms));
                }
                Err(join_err) => {
                    report.errored += 1;
                    log(
                        Level::Error,
                        Domain::Monitor,
                        "worker_failed",
                        obj(&[("error", v_str(&join_err.to_string()))]),
                    );
                }
            }
        }

        if mode == EvalMode::Normal {
            self.settle_store(store_failure, now);
        }

        report.elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        let overload_ms = self.cfg.tick_budget_ms as f64 * self.cfg.overload_multiple;
        report.overloaded = report.elapsed_ms > overload_ms;
        if report.overloaded {
            log(
                Level::Error,
                Domain::Monitor,
                "overload",
                obj(&[
                    ("tick", json!(tick)),
                    ("elapsed_ms", v_num(report.elapsed_ms)),
                    ("budget_ms", json!(self.cfg.tick_budget_ms)),
                    ("deferred", json!(report.deferred)),
                ]),
            );
            self.engine.notifier().send(Notification::system(
                NotificationKind::Overload,
                format!(
                    "tick {} took {:.0}ms (budget {}ms), {} plans deferred",
                    tick, report.elapsed_ms, self.cfg.tick_budget_ms, report.deferred
                ),
                now,
            ));
        }

        log_tick_summary(
            tick,
            &[
                ("evaluated", report.evaluated),
                ("reanchored", report.reanchored),
                ("suspended", report.suspended),
                ("rearmed", report.rearmed),
                ("executed", report.executed),
                ("expired", report.expired),
                ("rate_deferred", report.rate_deferred),
                ("deferred", report.deferred),
                ("timed_out", report.timed_out),
                ("errored", report.errored),
                ("store_errors", report.store_errors),
            ],
            report.elapsed_ms,
            report.read_only,
        );
        report
    }

    /// Tick until `shutdown` flips to true or its sender is dropped.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(Duration::from_millis(self.cfg.tick_ms.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        log(
            Level::Info,
            Domain::Monitor,
            "monitor_started",
            obj(&[
                ("tick_ms", json!(self.cfg.tick_ms)),
                ("workers", json!(self.cfg.workers)),
                ("store", v_str(self.engine.store().backend_name())),
            ]),
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick(logging::ts_epoch_ms()).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        log(
            Level::Info,
            Domain::Monitor,
            "monitor_stopped",
            obj(&[("ticks", json!(self.tick_seq.load(Ordering::SeqCst)))]),
        );
    }
}
