//! Plan store: lifecycle-aware, versioned access to durable plan records.
//!
//! Every write is a compare-and-swap on the plan revision. Callers pass the
//! revision they read; a mismatch fails with `StaleRevision` and nothing is
//! written. Committed changes are appended to the journal when one is set.

use serde_json::json;
use std::sync::{Arc, Mutex};

use crate::error::{PlanError, PlanResult};
use crate::logging::{self, log, obj, v_str, Domain, Level};
use crate::market::MarketPhase;
use crate::plan::lifecycle::{self, Step};
use crate::plan::{
    CreateContext, FillRecord, Plan, PlanFilter, PlanId, PlanSpec, PlanState, PriceUpdate, Timestamp, UpdateKind,
};
use crate::reliability::retry::{retry_when, RetryConfig};

pub mod journal;
pub mod memory;
pub mod sqlite;

pub use journal::{Journal, JournalEntry, JournalRecovery};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Durable key/record store. Implementations only need create, read,
/// versioned update and query; lifecycle rules live in `PlanStore`.
pub trait DurableStore: Send + Sync {
    /// Persist a new plan, assigning its id. The stored revision is 1.
    fn insert(&self, plan: Plan) -> PlanResult<Plan>;

    fn load(&self, id: PlanId) -> PlanResult<Option<Plan>>;

    /// Replace the stored plan iff its revision is still `expected`.
    fn compare_and_swap(&self, plan: &Plan, expected: u64) -> PlanResult<()>;

    fn query(&self, filter: &PlanFilter) -> PlanResult<Vec<Plan>>;

    fn backend(&self) -> &'static str;
}

/// Apply a price update to `plan` in place: the whole triple, plus anchor and
/// geometry when given. Counters follow the update kind.
pub fn apply_price_update(plan: &mut Plan, update: &PriceUpdate) -> PlanResult<()> {
    let allowed = match update.kind {
        UpdateKind::Amendment => matches!(plan.state, PlanState::Pending | PlanState::Suspended),
        _ => plan.state == PlanState::Pending,
    };
    if !allowed {
        return Err(PlanError::InvalidTransition {
            id: plan.id,
            from: plan.state,
            to: plan.state,
        });
    }
    update.prices.validate(plan.direction)?;

    plan.prices = update.prices;
    if let Some(anchor) = update.anchor {
        plan.anchor = anchor;
    }
    if let Some(geometry) = update.geometry {
        plan.geometry = geometry;
    }
    match update.kind {
        UpdateKind::ReAnchor => plan.counters.anchor_updates += 1,
        UpdateKind::Predictive => {
            plan.counters.anchor_updates += 1;
            plan.counters.predictive_updates += 1;
        }
        UpdateKind::RiskRefresh => plan.counters.risk_refreshes += 1,
        UpdateKind::Amendment => {}
    }
    Ok(())
}

pub struct PlanStore {
    backend: Arc<dyn DurableStore>,
    journal: Option<Mutex<Journal>>,
    retry: RetryConfig,
}

impl PlanStore {
    pub fn new(backend: Arc<dyn DurableStore>) -> Self {
        Self {
            backend,
            journal: None,
            retry: RetryConfig::default(),
        }
    }

    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = Some(Mutex::new(journal));
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.backend()
    }

    fn journal(&self, entry: JournalEntry) {
        let Some(journal) = &self.journal else {
            return;
        };
        let result = match journal.lock() {
            Ok(mut j) => j.append(&entry).map_err(|e| e.to_string()),
            Err(_) => Err("journal lock poisoned".to_string()),
        };
        if let Err(err) = result {
            log(
                Level::Error,
                Domain::Store,
                "journal_append_failed",
                obj(&[("plan_id", json!(entry.plan_id())), ("error", v_str(&err))]),
            );
        }
    }

    /// Validate `spec` and persist a new `PENDING` plan.
    pub fn create(&self, spec: PlanSpec, ctx: CreateContext) -> PlanResult<PlanId> {
        spec.validate(ctx.now)?;
        let plan = self.insert_plan(Plan::from_spec(spec, ctx))?;
        Ok(plan.id)
    }

    pub fn insert_plan(&self, plan: Plan) -> PlanResult<Plan> {
        plan.prices.validate(plan.direction)?;
        let stored = self.backend.insert(plan)?;
        let body = serde_json::to_string(&stored)?;
        self.journal(JournalEntry::Created {
            ts: stored.created_at,
            plan_id: stored.id,
            symbol: stored.symbol.clone(),
            direction: stored.direction.as_str().to_string(),
            revision: stored.revision,
            params_hash: logging::params_hash(&body),
        });
        log(
            Level::Info,
            Domain::Plan,
            "plan_created",
            obj(&[
                ("plan_id", json!(stored.id)),
                ("symbol", v_str(&stored.symbol)),
                ("direction", v_str(stored.direction.as_str())),
                ("archetype", v_str(stored.archetype.as_str())),
                ("entry", json!(stored.prices.entry)),
                ("stop", json!(stored.prices.stop)),
                ("target", json!(stored.prices.target)),
                ("expiry", json!(stored.expiry)),
            ]),
        );
        Ok(stored)
    }

    /// Persist a plan refused before it ever became active, stored directly
    /// as `CANCELLED` with `reason`.
    pub fn insert_cancelled(&self, mut plan: Plan, reason: &str, now: Timestamp) -> PlanResult<Plan> {
        let steps = lifecycle::apply(&mut plan, PlanState::Cancelled, reason, now)?;
        let stored = self.insert_plan(plan)?;
        self.record_steps(&stored, &steps, reason, now);
        Ok(stored)
    }

    pub fn get(&self, id: PlanId) -> PlanResult<Plan> {
        self.backend.load(id)?.ok_or(PlanError::NotFound(id))
    }

    /// Matching plans ordered by id.
    pub fn list(&self, filter: &PlanFilter) -> PlanResult<Vec<Plan>> {
        let mut plans = self.backend.query(filter)?;
        plans.retain(|p| filter.matches(p));
        plans.sort_by_key(|p| p.id);
        Ok(plans)
    }

    /// Read-modify-CAS. `f` edits a copy of the plan read at `expected`; the
    /// revision is bumped and `updated_at` set before the swap.
    fn commit<F>(&self, id: PlanId, expected: u64, now: Timestamp, f: F) -> PlanResult<Plan>
    where
        F: FnOnce(&mut Plan) -> PlanResult<()>,
    {
        let current = self.get(id)?;
        if current.revision != expected {
            return Err(PlanError::StaleRevision {
                id,
                expected,
                found: current.revision,
            });
        }
        let mut next = current;
        f(&mut next)?;
        next.revision = expected + 1;
        next.updated_at = now;
        self.backend.compare_and_swap(&next, expected)?;
        Ok(next)
    }

    fn record_steps(&self, plan: &Plan, steps: &[Step], reason: &str, now: Timestamp) {
        for step in steps {
            self.journal(JournalEntry::Transition {
                ts: now,
                plan_id: plan.id,
                from: step.from,
                to: step.to,
                revision: plan.revision,
                reason: reason.to_string(),
            });
            logging::log_transition(plan.id, &plan.symbol, step.from, step.to, plan.revision, reason);
        }
    }

    /// Versioned lifecycle transition.
    pub fn transition_at(
        &self,
        id: PlanId,
        expected: u64,
        to: PlanState,
        reason: &str,
        now: Timestamp,
    ) -> PlanResult<Plan> {
        let mut steps = Vec::new();
        let plan = self.commit(id, expected, now, |p| {
            steps = lifecycle::apply(p, to, reason, now)?;
            Ok(())
        })?;
        self.record_steps(&plan, &steps, reason, now);
        Ok(plan)
    }

    /// Transition against a fresh read, retrying a bounded number of times
    /// when a concurrent writer bumps the revision in between.
    pub async fn transition(&self, id: PlanId, to: PlanState, reason: &str, now: Timestamp) -> PlanResult<Plan> {
        retry_when(&self.retry, "plan_transition", PlanError::is_stale, || async move {
            let current = self.get(id)?;
            self.transition_at(id, current.revision, to, reason, now)
        })
        .await
    }

    pub fn suspend(
        &self,
        id: PlanId,
        expected: u64,
        reason: &str,
        now: Timestamp,
        cooldown_until: Timestamp,
    ) -> PlanResult<Plan> {
        let mut steps = Vec::new();
        let plan = self.commit(id, expected, now, |p| {
            steps = lifecycle::suspend(p, reason, now, cooldown_until)?;
            Ok(())
        })?;
        self.record_steps(&plan, &steps, reason, now);
        Ok(plan)
    }

    /// `SUSPENDED -> RE_ARMED -> PENDING`, recording the phase the plan was
    /// re-admitted under in the same write.
    pub fn rearm(
        &self,
        id: PlanId,
        expected: u64,
        phase: MarketPhase,
        reason: &str,
        now: Timestamp,
    ) -> PlanResult<Plan> {
        let mut steps = Vec::new();
        let plan = self.commit(id, expected, now, |p| {
            steps = lifecycle::apply(p, PlanState::ReArmed, reason, now)?;
            p.admission_phase = phase;
            Ok(())
        })?;
        self.record_steps(&plan, &steps, reason, now);
        Ok(plan)
    }

    pub fn extend_cooldown(
        &self,
        id: PlanId,
        expected: u64,
        until: Timestamp,
        reason: &str,
        now: Timestamp,
    ) -> PlanResult<Plan> {
        let plan = self.commit(id, expected, now, |p| lifecycle::extend_cooldown(p, until, reason, now))?;
        self.journal(JournalEntry::Annotated {
            ts: now,
            plan_id: id,
            revision: plan.revision,
            label: "cooldown_extended".to_string(),
            reason: reason.to_string(),
        });
        log(
            Level::Info,
            Domain::Bias,
            "cooldown_extended",
            obj(&[
                ("plan_id", json!(id)),
                ("symbol", v_str(&plan.symbol)),
                ("until", json!(until)),
                ("reason", v_str(reason)),
            ]),
        );
        Ok(plan)
    }

    /// Replace the price triple (and optionally anchor and geometry) in one
    /// versioned write.
    pub fn mutate(&self, id: PlanId, expected: u64, update: PriceUpdate, now: Timestamp) -> PlanResult<Plan> {
        let plan = self.commit(id, expected, now, |p| apply_price_update(p, &update))?;
        self.journal(JournalEntry::Mutated {
            ts: now,
            plan_id: id,
            kind: update.kind.as_str().to_string(),
            revision: plan.revision,
            entry: plan.prices.entry,
            stop: plan.prices.stop,
            target: plan.prices.target,
            anchor: update.anchor.map(|a| a.price),
        });
        Ok(plan)
    }

    /// Arbitrary field edit that is not a state change, journaled under
    /// `label`. Used for amendments that touch more than the triple.
    pub fn update<F>(&self, id: PlanId, expected: u64, label: &str, now: Timestamp, f: F) -> PlanResult<Plan>
    where
        F: FnOnce(&mut Plan) -> PlanResult<()>,
    {
        let plan = self.commit(id, expected, now, |p| {
            if p.is_terminal() {
                return Err(PlanError::InvalidTransition {
                    id: p.id,
                    from: p.state,
                    to: p.state,
                });
            }
            f(p)
        })?;
        self.journal(JournalEntry::Annotated {
            ts: now,
            plan_id: id,
            revision: plan.revision,
            label: label.to_string(),
            reason: plan.state_reason.clone(),
        });
        Ok(plan)
    }

    /// `PENDING -> EXECUTED` with the fill recorded in the same write.
    pub fn record_fill(
        &self,
        id: PlanId,
        expected: u64,
        fill: FillRecord,
        reason: &str,
        now: Timestamp,
    ) -> PlanResult<Plan> {
        let mut steps = Vec::new();
        let plan = self.commit(id, expected, now, |p| {
            steps = lifecycle::apply(p, PlanState::Executed, reason, now)?;
            p.fill = Some(fill);
            Ok(())
        })?;
        self.record_steps(&plan, &steps, reason, now);
        Ok(plan)
    }
}
