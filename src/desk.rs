//! Plan request surface: create, amend, cancel.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::drift::compute_anchor;
use crate::error::{PlanError, PlanResult};
use crate::governor::{ActiveEntry, Admission};
use crate::logging::{log, obj, v_str, Domain, Level};
use crate::notify::NotificationKind;
use crate::pipeline::Engine;
use crate::plan::{
    ConditionSet, CreateContext, Geometry, Plan, PlanFilter, PlanId, PlanSpec, PlanState, PriceTriple, PriceUpdate,
    Timestamp, UpdateKind,
};
use crate::reliability::retry::retry_when;
use crate::risk::RiskInput;
use crate::store::apply_price_update;

/// Fields a requester may change on a live plan. Unset fields are kept.
///
/// Changing only `entry` re-derives stop and target through the risk engine;
/// an explicit stop or target sets a new reference geometry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Amendment {
    pub entry: Option<f64>,
    pub stop: Option<f64>,
    pub target: Option<f64>,
    pub expiry: Option<Timestamp>,
    pub confidence: Option<f64>,
    pub conditions: Option<ConditionSet>,
}

impl Amendment {
    fn touches_prices(&self) -> bool {
        self.entry.is_some() || self.stop.is_some() || self.target.is_some()
    }
}

pub struct PlanDesk {
    engine: Arc<Engine>,
}

impl PlanDesk {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    pub fn get(&self, id: PlanId) -> PlanResult<Plan> {
        self.engine.store().get(id)
    }

    pub fn list(&self, filter: &PlanFilter) -> PlanResult<Vec<Plan>> {
        self.engine.store().list(filter)
    }

    /// Create a plan anchored to the current market and admit it through the
    /// density governor. A refused plan is kept as `CANCELLED` history.
    pub async fn submit(&self, spec: PlanSpec, now: Timestamp) -> PlanResult<PlanId> {
        spec.validate(now)?;
        let snap = self.engine.snapshot(&spec.symbol, now).await?;
        let drift_cfg = self.engine.drift().config();
        let ctx = CreateContext {
            now,
            anchor_price: compute_anchor(spec.anchor_type, spec.direction, &snap, drift_cfg.swing_strength),
            baseline_volatility: snap.vol_short,
            phase: snap.phase,
            drift_threshold: drift_cfg.threshold_for(&spec.symbol),
        };
        let plan = Plan::from_spec(spec, ctx);

        let _admission = self.engine.admission().await;
        let admission = self
            .engine
            .make_room(&plan.symbol, snap.phase, &ActiveEntry::of(&plan), now)
            .await?;
        if let Admission::Rejected { reason } = admission {
            self.engine.store().insert_cancelled(plan, "density_rejected", now)?;
            return Err(PlanError::AdmissionRejected(reason));
        }
        let plan = self.engine.store().insert_plan(plan)?;
        self.engine.density().claim(&plan.symbol, snap.phase, ActiveEntry::of(&plan));
        Ok(plan.id)
    }

    /// New triple for `plan` under `amendment`, if it touches prices.
    async fn amended_prices(&self, plan: &Plan, amendment: &Amendment, now: Timestamp) -> PlanResult<Option<PriceUpdate>> {
        if !amendment.touches_prices() {
            return Ok(None);
        }
        let entry = amendment.entry.unwrap_or(plan.prices.entry);
        let update = if amendment.stop.is_none() && amendment.target.is_none() {
            let snap = self.engine.snapshot(&plan.symbol, now).await?;
            let outcome = self
                .engine
                .risk()
                .compute(&RiskInput::for_plan(plan, entry, snap.phase, snap.vol_short, now));
            PriceUpdate {
                prices: outcome.prices,
                anchor: None,
                geometry: None,
                kind: UpdateKind::Amendment,
            }
        } else {
            let prices = PriceTriple::new(
                entry,
                amendment.stop.unwrap_or(plan.prices.stop),
                amendment.target.unwrap_or(plan.prices.target),
            );
            prices.validate(plan.direction)?;
            PriceUpdate {
                prices,
                anchor: None,
                geometry: Some(Geometry::of(&prices)),
                kind: UpdateKind::Amendment,
            }
        };
        Ok(Some(update))
    }

    /// Amend a `PENDING` or `SUSPENDED` plan in one versioned write.
    pub async fn amend(&self, id: PlanId, amendment: Amendment, now: Timestamp) -> PlanResult<Plan> {
        if let Some(expiry) = amendment.expiry {
            if expiry <= now {
                return Err(PlanError::InvalidSpec(format!("expiry {} is not in the future", expiry)));
            }
        }
        if let Some(c) = amendment.confidence {
            if !(0.0..=1.0).contains(&c) {
                return Err(PlanError::InvalidSpec(format!("confidence {} outside [0, 1]", c)));
            }
        }

        let store = self.engine.store().as_ref();
        let amendment = &amendment;
        let plan = retry_when(self.engine.retry(), "amend", PlanError::is_stale, move || async move {
            let current = store.get(id)?;
            if !matches!(current.state, PlanState::Pending | PlanState::Suspended) {
                return Err(PlanError::InvalidTransition {
                    id,
                    from: current.state,
                    to: current.state,
                });
            }
            let prices = self.amended_prices(&current, amendment, now).await?;
            store.update(id, current.revision, "amendment", now, |p| {
                if let Some(update) = &prices {
                    apply_price_update(p, update)?;
                }
                if let Some(expiry) = amendment.expiry {
                    p.expiry = expiry;
                }
                if let Some(confidence) = amendment.confidence {
                    p.confidence = confidence;
                }
                if let Some(conditions) = &amendment.conditions {
                    p.conditions = conditions.clone();
                }
                p.state_reason = "amended".to_string();
                Ok(())
            })
        })
        .await?;

        if plan.state.is_active() {
            self.engine.density().refresh(ActiveEntry::of(&plan));
        }
        log(
            Level::Info,
            Domain::Plan,
            "plan_amended",
            obj(&[
                ("plan_id", json!(plan.id)),
                ("symbol", v_str(&plan.symbol)),
                ("revision", json!(plan.revision)),
                ("entry", json!(plan.prices.entry)),
                ("stop", json!(plan.prices.stop)),
                ("target", json!(plan.prices.target)),
            ]),
        );
        Ok(plan)
    }

    pub async fn cancel(&self, id: PlanId, reason: &str, now: Timestamp) -> PlanResult<Plan> {
        let plan = self
            .engine
            .store()
            .transition(id, PlanState::Cancelled, reason, now)
            .await?;
        self.engine.on_terminal(&plan, NotificationKind::Cancelled, now);
        Ok(plan)
    }
}
