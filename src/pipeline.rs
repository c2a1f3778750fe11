//! Per-plan evaluation pipeline.
//!
//! One call evaluates one plan for one tick:
//! expiry, then (suspended) re-arm check, or (pending) bias fence, drift and
//! re-anchor, risk refresh, condition check and dispatch. The plan is re-read
//! before each stage; once it is no longer eligible the pipeline stops, so a
//! concurrent cancel always wins. Stage failures are logged and end the
//! evaluation for this tick without surfacing an error.

use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

use crate::bias::{BiasFence, FenceDecision};
use crate::config::Config;
use crate::dispatch::{ExecutionDispatcher, ExecutionVenue};
use crate::drift::{DriftDecision, DriftDetector};
use crate::error::{PlanError, PlanResult};
use crate::governor::{ActiveEntry, Admission, DensityGovernor, RateDecision, RateGovernor};
use crate::logging::{log_reanchor, log_stage_skipped, ProfileScope};
use crate::market::cache::TtlCache;
use crate::market::{self, BiasSource, MarketData, MarketPhase, MarketSnapshot, SignalEvaluator};
use crate::notify::{Notification, NotificationKind, Notifier};
use crate::plan::{Plan, PlanId, PlanState, PriceUpdate, Timestamp, UpdateKind};
use crate::reliability::retry::{retry_when, RetryConfig};
use crate::risk::{self, AdaptiveRiskEngine, RiskInput};
use crate::store::PlanStore;

/// External services the engine talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub market: Arc<dyn MarketData>,
    pub bias: Arc<dyn BiasSource>,
    pub signals: Arc<dyn SignalEvaluator>,
    pub venue: Arc<dyn ExecutionVenue>,
    pub notifier: Notifier,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalMode {
    Normal,
    /// Store outage: evaluate from the cached record, write nothing.
    ReadOnly,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlanReport {
    pub plan_id: PlanId,
    pub expired: bool,
    pub suspended: bool,
    pub rearmed: bool,
    pub cooldown_extended: bool,
    pub reanchored: bool,
    pub predictive: bool,
    pub risk_refreshed: bool,
    pub rate_deferred: bool,
    pub executed: bool,
    /// Stopped because the plan changed state under us.
    pub preempted: bool,
    /// Error kinds of stages skipped this tick.
    pub skipped: Vec<&'static str>,
    /// A stage failed because the durable store refused a read or write.
    pub store_failed: bool,
}

impl PlanReport {
    fn new(plan_id: PlanId) -> Self {
        Self {
            plan_id,
            ..Self::default()
        }
    }

    fn skip(&mut self, plan_id: PlanId, stage: &str, err: &PlanError) {
        log_stage_skipped(plan_id, stage, err.kind(), &err.to_string());
        self.skipped.push(err.kind());
        self.store_failed |= matches!(err, PlanError::StoreUnavailable(_));
    }
}

pub struct Engine {
    store: Arc<PlanStore>,
    market: Arc<dyn MarketData>,
    signals: Arc<dyn SignalEvaluator>,
    fence: BiasFence,
    drift: DriftDetector,
    risk: AdaptiveRiskEngine,
    rate: RateGovernor,
    density: DensityGovernor,
    dispatcher: ExecutionDispatcher,
    notifier: Notifier,
    retry: RetryConfig,
    vols: TtlCache<String, (f64, f64)>,
    /// Serialises density decisions with the writes that act on them.
    admission: Mutex<()>,
}

impl Engine {
    pub fn new(store: Arc<PlanStore>, collab: Collaborators, cfg: &Config) -> Self {
        Self {
            fence: BiasFence::new(cfg.bias.clone(), collab.bias),
            drift: DriftDetector::new(cfg.drift.clone()),
            risk: AdaptiveRiskEngine::new(cfg.risk.clone()),
            rate: RateGovernor::new(cfg.rate.clone()),
            density: DensityGovernor::new(cfg.density.clone()),
            dispatcher: ExecutionDispatcher::new(collab.venue, store.clone(), cfg.dispatch.clone())
                .with_notifier(collab.notifier.clone()),
            market: collab.market,
            signals: collab.signals,
            notifier: collab.notifier,
            retry: cfg.retry.clone(),
            vols: TtlCache::new(cfg.drift.vol_cache_ttl_ms),
            admission: Mutex::new(()),
            store,
        }
    }

    pub fn store(&self) -> &Arc<PlanStore> {
        &self.store
    }

    pub fn market(&self) -> &Arc<dyn MarketData> {
        &self.market
    }

    pub fn fence(&self) -> &BiasFence {
        &self.fence
    }

    pub fn drift(&self) -> &DriftDetector {
        &self.drift
    }

    pub fn risk(&self) -> &AdaptiveRiskEngine {
        &self.risk
    }

    pub fn rate(&self) -> &RateGovernor {
        &self.rate
    }

    pub fn density(&self) -> &DensityGovernor {
        &self.density
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn retry(&self) -> &RetryConfig {
        &self.retry
    }

    /// Rebuild the density ledger from the store.
    pub fn rebuild_ledger(&self) -> PlanResult<usize> {
        let active = self.store.list(&crate::plan::PlanFilter::active())?;
        self.density.rebuild(&active);
        Ok(active.len())
    }

    /// Market snapshot for `symbol`, reusing a fresh volatility pair.
    pub async fn snapshot(&self, symbol: &str, now: Timestamp) -> PlanResult<MarketSnapshot> {
        let key = symbol.to_string();
        let cached = self.vols.get(&key, now);
        let snap = market::snapshot(self.market.as_ref(), symbol, self.drift.config().tick_lookback, cached).await?;
        if cached.is_none() {
            self.vols.put(key, (snap.vol_short, snap.vol_long), now);
        }
        Ok(snap)
    }

    /// Drop per-plan governor and fence state once a plan stops being active.
    fn release(&self, plan_id: PlanId) {
        self.density.release(plan_id);
        self.rate.forget(plan_id);
        self.fence.forget(plan_id);
    }

    /// Called after a plan reached a terminal state outside the pipeline.
    pub fn on_terminal(&self, plan: &Plan, kind: NotificationKind, now: Timestamp) {
        self.release(plan.id);
        self.notifier
            .send(Notification::plan(kind, plan.id, &plan.symbol, plan.state_reason.clone(), now));
    }

    fn checkpoint(&self, cached: &Plan, mode: EvalMode) -> PlanResult<Plan> {
        match mode {
            EvalMode::Normal => self.store.get(cached.id),
            EvalMode::ReadOnly => Ok(cached.clone()),
        }
    }

    /// Held across a density decision and the store writes that follow it.
    pub async fn admission(&self) -> MutexGuard<'_, ()> {
        self.admission.lock().await
    }

    /// Decide whether `candidate` may become active under (symbol, phase)
    /// and suspend the displaced plan if there is one. The candidate is not
    /// tracked yet; `DensityGovernor::claim` does that once its write lands.
    /// A failed eviction leaves the victim tracked and fails the admission.
    /// Callers hold `admission()`.
    pub async fn make_room(
        &self,
        symbol: &str,
        phase: MarketPhase,
        candidate: &ActiveEntry,
        now: Timestamp,
    ) -> PlanResult<Admission> {
        let admission = self.density.assess(symbol, phase, candidate);
        if let Admission::Replaced { evicted } = &admission {
            self.evict(*evicted, now).await?;
        }
        Ok(admission)
    }

    /// Suspend a plan displaced by the density governor.
    pub async fn evict(&self, victim: PlanId, now: Timestamp) -> PlanResult<Plan> {
        let cooldown = now + self.fence.config().cooldown_ms;
        let store = self.store.as_ref();
        let plan = retry_when(&self.retry, "evict", PlanError::is_stale, move || async move {
            let current = store.get(victim)?;
            store.suspend(victim, current.revision, "density_eviction", now, cooldown)
        })
        .await?;
        self.release(victim);
        self.notifier.send(Notification::plan(
            NotificationKind::Evicted,
            victim,
            &plan.symbol,
            "density_eviction",
            now,
        ));
        Ok(plan)
    }

    pub async fn evaluate(&self, plan: Plan, now: Timestamp, mode: EvalMode) -> PlanResult<PlanReport> {
        let _scope = ProfileScope::new("evaluate_plan");
        let mut report = PlanReport::new(plan.id);
        let plan = self.checkpoint(&plan, mode)?;
        if plan.is_terminal() {
            report.preempted = true;
            return Ok(report);
        }

        if plan.is_expired(now) {
            if mode == EvalMode::Normal {
                match self.store.transition_at(plan.id, plan.revision, PlanState::Expired, "expired", now) {
                    Ok(expired) => {
                        self.on_terminal(&expired, NotificationKind::Expired, now);
                        report.expired = true;
                    }
                    Err(err) => report.skip(plan.id, "expiry", &err),
                }
            }
            return Ok(report);
        }

        match plan.state {
            PlanState::Suspended => self.evaluate_suspended(plan, now, mode, &mut report).await,
            PlanState::Pending => self.evaluate_pending(plan, now, mode, &mut report).await,
            // RE_ARMED never rests in the store.
            _ => report.preempted = true,
        }
        Ok(report)
    }

    async fn evaluate_suspended(&self, plan: Plan, now: Timestamp, mode: EvalMode, report: &mut PlanReport) {
        if mode == EvalMode::ReadOnly {
            return;
        }
        let decision = match self.fence.check_suspended(&plan, now).await {
            Ok(d) => d,
            Err(err) => return report.skip(plan.id, "rearm", &err),
        };
        match decision {
            FenceDecision::ReArm { .. } => self.try_rearm(plan, now, report).await,
            FenceDecision::Extend { until, reason } => {
                match self.store.extend_cooldown(plan.id, plan.revision, until, &reason, now) {
                    Ok(_) => report.cooldown_extended = true,
                    Err(err) => report.skip(plan.id, "rearm", &err),
                }
            }
            _ => {}
        }
    }

    async fn try_rearm(&self, plan: Plan, now: Timestamp, report: &mut PlanReport) {
        let phase = match self.market.phase(&plan.symbol).await {
            Ok(p) => p,
            Err(e) => return report.skip(plan.id, "rearm", &PlanError::collaborator("market_data", e)),
        };
        let _admission = self.admission().await;
        let entry = ActiveEntry::of(&plan);
        match self.make_room(&plan.symbol, phase, &entry, now).await {
            Ok(Admission::Rejected { reason }) => {
                let until = now + self.fence.config().cooldown_ms;
                let reason = format!("rearm_rejected:{}", reason);
                match self.store.extend_cooldown(plan.id, plan.revision, until, &reason, now) {
                    Ok(_) => report.cooldown_extended = true,
                    Err(err) => report.skip(plan.id, "rearm", &err),
                }
                return;
            }
            Ok(_) => {}
            Err(err) => return report.skip(plan.id, "evict", &err),
        }

        match self.store.rearm(plan.id, plan.revision, phase, "bias_realigned", now) {
            Ok(rearmed) => {
                report.rearmed = true;
                self.density.claim(&rearmed.symbol, phase, ActiveEntry::of(&rearmed));
                self.notifier.send(Notification::plan(
                    NotificationKind::ReArmed,
                    rearmed.id,
                    &rearmed.symbol,
                    "bias_realigned",
                    now,
                ));
            }
            Err(err) => report.skip(plan.id, "rearm", &err),
        }
    }

    async fn evaluate_pending(&self, plan: Plan, now: Timestamp, mode: EvalMode, report: &mut PlanReport) {
        let snap = match self.snapshot(&plan.symbol, now).await {
            Ok(s) => s,
            Err(err) => return report.skip(plan.id, "market", &err),
        };

        if mode == EvalMode::ReadOnly {
            if let DriftDecision::ReAnchor(p) = self.drift.evaluate(&plan, &snap, &self.risk, now) {
                log_stage_skipped(plan.id, "drift", "read_only", &format!("would re-anchor, drift {:.4}", p.drift));
            }
            return;
        }

        // Fence. An unavailable bias source fails closed: nothing below runs.
        let vol_ratio = risk::vol_ratio(snap.vol_short, plan.baseline_volatility);
        match self.fence.check_active(&plan, Some(vol_ratio), now).await {
            Ok(FenceDecision::Suspend { reason, cooldown_until }) => {
                match self.store.suspend(plan.id, plan.revision, &reason, now, cooldown_until) {
                    Ok(suspended) => {
                        report.suspended = true;
                        self.density.release(plan.id);
                        self.notifier.send(Notification::plan(
                            NotificationKind::Suspended,
                            suspended.id,
                            &suspended.symbol,
                            reason,
                            now,
                        ));
                    }
                    Err(err) => report.skip(plan.id, "fence", &err),
                }
                return;
            }
            Ok(_) => {}
            Err(err) => return report.skip(plan.id, "fence", &err),
        }

        // Drift.
        let plan = match self.pending_checkpoint(&plan, report) {
            Some(p) => p,
            None => return,
        };
        if let DriftDecision::ReAnchor(proposal) = self.drift.evaluate(&plan, &snap, &self.risk, now) {
            self.reanchor(&plan, &snap, proposal.kind, now, report).await;
        }

        // Risk refresh, only when the triple was not just recomputed.
        let plan = match self.pending_checkpoint(&plan, report) {
            Some(p) => p,
            None => return,
        };
        if !report.reanchored {
            let outcome = self
                .risk
                .compute(&RiskInput::for_plan(&plan, plan.prices.entry, snap.phase, snap.vol_short, now));
            if self.risk.refresh_needed(&plan.prices, &outcome.prices) {
                let update = PriceUpdate {
                    prices: outcome.prices,
                    anchor: None,
                    geometry: None,
                    kind: UpdateKind::RiskRefresh,
                };
                match self.store.mutate(plan.id, plan.revision, update, now) {
                    Ok(_) => report.risk_refreshed = true,
                    Err(err) => report.skip(plan.id, "risk", &err),
                }
            }
        }

        // Conditions and dispatch.
        let plan = match self.pending_checkpoint(&plan, report) {
            Some(p) => p,
            None => return,
        };
        match self.signals.conditions_met(&plan).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => return report.skip(plan.id, "conditions", &PlanError::collaborator("signals", e)),
        }
        let plan = match self.pending_checkpoint(&plan, report) {
            Some(p) => p,
            None => return,
        };
        match self.dispatcher.dispatch(&plan, now).await {
            Ok(result) => {
                report.executed = true;
                self.on_terminal(&result.plan, NotificationKind::Executed, now);
            }
            Err(err) => report.skip(plan.id, "dispatch", &err),
        }
    }

    /// Fresh read; `None` (and `preempted`) once the plan left `PENDING`.
    fn pending_checkpoint(&self, plan: &Plan, report: &mut PlanReport) -> Option<Plan> {
        match self.store.get(plan.id) {
            Ok(p) if p.state == PlanState::Pending => Some(p),
            Ok(_) => {
                report.preempted = true;
                None
            }
            Err(err) => {
                report.skip(plan.id, "checkpoint", &err);
                None
            }
        }
    }

    async fn reanchor(&self, plan: &Plan, snap: &MarketSnapshot, kind: UpdateKind, now: Timestamp, report: &mut PlanReport) {
        let predictive = kind == UpdateKind::Predictive;
        let window_updates = match self.rate.try_acquire(plan.id, &plan.symbol, predictive, now) {
            RateDecision::Admit { window_updates } => window_updates,
            RateDecision::Defer { scope, reason } => {
                report.rate_deferred = true;
                log_stage_skipped(
                    plan.id,
                    "drift",
                    "budget_exceeded",
                    &format!("{}: {}", scope, reason),
                );
                return;
            }
        };

        let id = plan.id;
        let store = self.store.as_ref();
        let drift = &self.drift;
        let risk = &self.risk;
        let result = retry_when(&self.retry, "reanchor", PlanError::is_stale, move || async move {
            let fresh = store.get(id)?;
            if fresh.state != PlanState::Pending {
                return Ok(None);
            }
            match drift.evaluate(&fresh, snap, risk, now) {
                DriftDecision::ReAnchor(p) if p.kind == kind => {
                    let mut anchor = p.anchor;
                    anchor.window_updates = window_updates;
                    let update = PriceUpdate {
                        prices: p.outcome.prices,
                        anchor: Some(anchor),
                        geometry: None,
                        kind,
                    };
                    store.mutate(id, fresh.revision, update, now).map(|updated| Some((updated, p)))
                }
                _ => Ok(None),
            }
        })
        .await;

        match result {
            Ok(Some((updated, p))) => {
                report.reanchored = true;
                report.predictive = predictive;
                log_reanchor(
                    updated.id,
                    &updated.symbol,
                    predictive,
                    p.drift,
                    p.old_anchor,
                    updated.anchor.price,
                    updated.prices.entry,
                    updated.prices.stop,
                    updated.prices.target,
                );
                self.notifier.send(Notification::plan(
                    NotificationKind::ReAnchored,
                    updated.id,
                    &updated.symbol,
                    format!(
                        "{} drift {:.4}: entry {} stop {} target {}",
                        kind.as_str(),
                        p.drift,
                        updated.prices.entry,
                        updated.prices.stop,
                        updated.prices.target
                    ),
                    now,
                ));
            }
            Ok(None) => self.rate.release(id, &plan.symbol, predictive, now),
            Err(err) => {
                self.rate.release(id, &plan.symbol, predictive, now);
                report.skip(id, "drift", &err);
            }
        }
    }
}
