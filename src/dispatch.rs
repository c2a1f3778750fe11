//! Execution dispatch.
//!
//! Submits a `PENDING` plan to the venue under a timeout and a circuit
//! breaker. A dispatch intent is persisted before the order leaves; if that
//! write fails the venue is never called. A fill moves the plan to
//! `EXECUTED` with the fill recorded; any venue failure leaves the price
//! triple untouched for the next tick.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::time::{timeout, Duration};

use crate::error::{PlanError, PlanResult};
use crate::logging::{log_dispatch, log_governor, Domain};
use crate::notify::{Notification, NotificationKind, Notifier};
use crate::plan::{DispatchIntent, Direction, FillRecord, Plan, PlanId, PlanState, Timestamp};
use crate::reliability::circuit::CircuitBreaker;
use crate::store::PlanStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderTicket {
    /// Idempotency key, fixed by the plan's dispatch intent.
    pub client_id: String,
    pub plan_id: PlanId,
    pub symbol: String,
    pub direction: Direction,
    pub entry: f64,
    pub stop: f64,
    pub target: f64,
    pub risk_unit: f64,
}

impl OrderTicket {
    pub fn for_plan(plan: &Plan) -> Self {
        Self {
            client_id: plan.client_id(),
            plan_id: plan.id,
            symbol: plan.symbol.clone(),
            direction: plan.direction,
            entry: plan.prices.entry,
            stop: plan.prices.stop,
            target: plan.prices.target,
            risk_unit: plan.risk_unit,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VenueFill {
    pub ticket: String,
    pub filled_price: f64,
}

#[async_trait]
pub trait ExecutionVenue: Send + Sync {
    async fn submit_order(&self, ticket: &OrderTicket) -> Result<VenueFill>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchConfig {
    pub timeout_ms: u64,
    pub circuit_threshold: u32,
    pub circuit_reset_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            circuit_threshold: 5,
            circuit_reset_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub plan: Plan,
    pub fill: FillRecord,
}

pub struct ExecutionDispatcher {
    venue: Arc<dyn ExecutionVenue>,
    store: Arc<PlanStore>,
    cfg: DispatchConfig,
    circuit: Mutex<CircuitBreaker>,
    notifier: Notifier,
}

impl ExecutionDispatcher {
    pub fn new(venue: Arc<dyn ExecutionVenue>, store: Arc<PlanStore>, cfg: DispatchConfig) -> Self {
        let circuit = CircuitBreaker::new(cfg.circuit_threshold, cfg.circuit_reset_ms);
        Self {
            venue,
            store,
            cfg,
            circuit: Mutex::new(circuit),
            notifier: Notifier::default(),
        }
    }

    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = notifier;
        self
    }

    fn circuit_allows(&self, now: Timestamp) -> bool {
        self.circuit.lock().map(|mut c| c.allow(now)).unwrap_or(false)
    }

    fn record_outcome(&self, ok: bool, now: Timestamp) {
        if let Ok(mut c) = self.circuit.lock() {
            if ok {
                c.record_success();
            } else if c.record_failure(now) {
                log_governor(Domain::Exec, "venue_circuit", "open", c.failures as f64, c.threshold as f64);
            }
        }
    }

    fn rejected(&self, plan: &Plan, client_id: &str, result: &str, detail: String) -> PlanError {
        log_dispatch(plan.id, &plan.symbol, client_id, result, &detail);
        PlanError::ExecutionRejected { id: plan.id, detail }
    }

    /// Persist the client id the order is about to be sent under. A plan
    /// that already carries an intent keeps it.
    fn record_intent(&self, plan: &Plan, now: Timestamp) -> PlanResult<Plan> {
        if plan.dispatch_intent.is_some() {
            return Ok(plan.clone());
        }
        let client_id = plan.client_id();
        let intent = DispatchIntent {
            client_id: client_id.clone(),
            at: now,
        };
        self.store
            .update(plan.id, plan.revision, "dispatch_intent", now, move |p| {
                p.dispatch_intent = Some(intent);
                Ok(())
            })
            .map_err(|err| {
                log_dispatch(plan.id, &plan.symbol, &client_id, "intent_unrecorded", &err.to_string());
                err
            })
    }

    pub async fn dispatch(&self, plan: &Plan, now: Timestamp) -> PlanResult<ExecutionResult> {
        if plan.state != PlanState::Pending {
            return Err(PlanError::InvalidTransition {
                id: plan.id,
                from: plan.state,
                to: PlanState::Executed,
            });
        }
        if !self.circuit_allows(now) {
            return Err(self.rejected(plan, &plan.client_id(), "circuit_open", "venue circuit open".to_string()));
        }
        let armed = self.record_intent(plan, now)?;
        let ticket = OrderTicket::for_plan(&armed);

        let outcome = timeout(Duration::from_millis(self.cfg.timeout_ms), self.venue.submit_order(&ticket)).await;
        let fill = match outcome {
            Ok(Ok(fill)) => {
                self.record_outcome(true, now);
                fill
            }
            Ok(Err(err)) => {
                self.record_outcome(false, now);
                return Err(self.rejected(&armed, &ticket.client_id, "rejected", err.to_string()));
            }
            Err(_) => {
                self.record_outcome(false, now);
                return Err(self.rejected(
                    &armed,
                    &ticket.client_id,
                    "timeout",
                    format!("venue did not answer within {}ms", self.cfg.timeout_ms),
                ));
            }
        };

        let record = FillRecord {
            client_id: ticket.client_id.clone(),
            ticket: fill.ticket,
            filled_price: fill.filled_price,
            filled_at: now,
        };
        let executed = match self.store.record_fill(armed.id, armed.revision, record.clone(), "filled", now) {
            Ok(plan) => plan,
            Err(err) if err.is_stale() => self.reconcile_fill(&armed, &record, err, now)?,
            Err(err) => {
                log_dispatch(armed.id, &armed.symbol, &ticket.client_id, "fill_unrecorded", &err.to_string());
                return Err(err);
            }
        };
        log_dispatch(
            armed.id,
            &armed.symbol,
            &ticket.client_id,
            "filled",
            &format!("{}@{}", record.ticket, record.filled_price),
        );
        Ok(ExecutionResult {
            plan: executed,
            fill: record,
        })
    }

    /// The venue filled while another writer moved the plan on. A plan that
    /// is still pending takes the fill at its current revision; one that left
    /// `PENDING` keeps its state and the conflict is raised to the operator.
    fn reconcile_fill(&self, armed: &Plan, record: &FillRecord, stale: PlanError, now: Timestamp) -> PlanResult<Plan> {
        let current = self.store.get(armed.id)?;
        if current.state == PlanState::Pending {
            let plan = self
                .store
                .record_fill(current.id, current.revision, record.clone(), "fill_reconciled", now)?;
            log_dispatch(
                plan.id,
                &plan.symbol,
                &record.client_id,
                "fill_reconciled",
                &format!("revision {} -> {}", armed.revision, current.revision),
            );
            return Ok(plan);
        }
        let detail = format!(
            "venue filled {}@{} but plan is {}",
            record.ticket,
            record.filled_price,
            current.state.as_str()
        );
        log_dispatch(current.id, &current.symbol, &record.client_id, "fill_conflict", &detail);
        self.notifier.send(Notification::plan(
            NotificationKind::FillConflict,
            current.id,
            &current.symbol,
            detail,
            now,
        ));
        Err(stale)
    }
}
