//! Plan density governor.
//!
//! Caps how many plans may be simultaneously active per (symbol, phase) and
//! the risk units they sum to. At the cap a newcomer may displace exactly one
//! weaker plan; replacement order is lowest confidence, then oldest, then most
//! correlated with the newcomer.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::logging::{log, log_governor, obj, v_num, v_str, Domain, Level};
use crate::market::MarketPhase;
use crate::plan::{Direction, Plan, PlanId, Timestamp};
use serde_json::json;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DensityCap {
    pub max_plans: usize,
    pub max_risk: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DensityConfig {
    pub caps: HashMap<MarketPhase, DensityCap>,
    /// Relative entry distance at which correlation halves.
    pub correlation_band: f64,
}

impl Default for DensityConfig {
    fn default() -> Self {
        let caps = [
            (MarketPhase::Expansion, 2, 0.02),
            (MarketPhase::Trend, 3, 0.03),
            (MarketPhase::Exhaustion, 2, 0.02),
            (MarketPhase::Reversion, 3, 0.03),
            (MarketPhase::Compression, 5, 0.05),
            (MarketPhase::Distribution, 5, 0.05),
        ]
        .into_iter()
        .map(|(phase, max_plans, max_risk)| (phase, DensityCap { max_plans, max_risk }))
        .collect();
        Self {
            caps,
            correlation_band: 0.005,
        }
    }
}

impl DensityConfig {
    pub fn cap_for(&self, phase: MarketPhase) -> DensityCap {
        self.caps.get(&phase).copied().unwrap_or(DensityCap {
            max_plans: 3,
            max_risk: 0.03,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActiveEntry {
    pub id: PlanId,
    pub direction: Direction,
    pub entry: f64,
    pub confidence: f64,
    pub created_at: Timestamp,
    pub risk_unit: f64,
}

impl ActiveEntry {
    pub fn of(plan: &Plan) -> Self {
        Self {
            id: plan.id,
            direction: plan.direction,
            entry: plan.prices.entry,
            confidence: plan.confidence,
            created_at: plan.created_at,
            risk_unit: plan.risk_unit,
        }
    }
}

/// Same direction weighted by entry proximity, in [0, 1].
pub fn correlation(a: &ActiveEntry, b: &ActiveEntry, band: f64) -> f64 {
    if a.direction != b.direction {
        return 0.0;
    }
    let scale = (a.entry.abs().max(b.entry.abs()) * band).max(f64::EPSILON);
    1.0 / (1.0 + (a.entry - b.entry).abs() / scale)
}

#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Admitted,
    Replaced { evicted: PlanId },
    Rejected { reason: String },
}

enum Decision {
    Fits,
    /// Index of the victim in the slot.
    Replace(usize),
    Reject(String),
}

#[derive(Debug, Clone, Default)]
pub struct DensityLedger {
    entries: HashMap<(String, MarketPhase), Vec<ActiveEntry>>,
}

impl DensityLedger {
    pub fn count(&self, symbol: &str, phase: MarketPhase) -> usize {
        self.entries.get(&(symbol.to_string(), phase)).map(|v| v.len()).unwrap_or(0)
    }

    pub fn risk_units(&self, symbol: &str, phase: MarketPhase) -> f64 {
        self.entries
            .get(&(symbol.to_string(), phase))
            .map(|v| v.iter().map(|e| e.risk_unit).sum())
            .unwrap_or(0.0)
    }

    fn remove(&mut self, id: PlanId) -> bool {
        let mut removed = false;
        for list in self.entries.values_mut() {
            let before = list.len();
            list.retain(|e| e.id != id);
            removed |= list.len() != before;
        }
        removed
    }
}

#[derive(Debug, Default)]
pub struct DensityGovernor {
    cfg: DensityConfig,
    ledger: Mutex<DensityLedger>,
}

const RISK_EPS: f64 = 1e-12;

impl DensityGovernor {
    pub fn new(cfg: DensityConfig) -> Self {
        Self {
            cfg,
            ledger: Mutex::new(DensityLedger::default()),
        }
    }

    pub fn config(&self) -> &DensityConfig {
        &self.cfg
    }

    /// Where `candidate` would land among `list`, which must not hold it.
    fn decide(&self, list: &[ActiveEntry], symbol: &str, phase: MarketPhase, candidate: &ActiveEntry) -> Decision {
        let cap = self.cfg.cap_for(phase);
        if cap.max_plans == 0 || candidate.risk_unit > cap.max_risk + RISK_EPS {
            return Decision::Reject(format!(
                "{} {}: risk {} exceeds cap {}",
                symbol,
                phase.as_str(),
                candidate.risk_unit,
                cap.max_risk
            ));
        }

        let count = list.len();
        let risk: f64 = list.iter().map(|e| e.risk_unit).sum();
        if count < cap.max_plans && risk + candidate.risk_unit <= cap.max_risk + RISK_EPS {
            return Decision::Fits;
        }

        let band = self.cfg.correlation_band;
        let mut order: Vec<(usize, f64)> = list
            .iter()
            .enumerate()
            .map(|(i, e)| (i, correlation(e, candidate, band)))
            .collect();
        order.sort_by(|(a, ca), (b, cb)| {
            let (ea, eb) = (&list[*a], &list[*b]);
            ea.confidence
                .partial_cmp(&eb.confidence)
                .unwrap_or(Ordering::Equal)
                .then(ea.created_at.cmp(&eb.created_at))
                .then(cb.partial_cmp(ca).unwrap_or(Ordering::Equal))
        });

        let victim = order.iter().map(|(i, _)| *i).find(|i| {
            let v = &list[*i];
            v.confidence <= candidate.confidence
                && count - 1 < cap.max_plans
                && risk - v.risk_unit + candidate.risk_unit <= cap.max_risk + RISK_EPS
        });
        match victim {
            Some(i) => Decision::Replace(i),
            None => {
                log_governor(Domain::Density, phase.as_str(), "reject", count as f64, cap.max_plans as f64);
                Decision::Reject(format!(
                    "{} {} at cap ({} plans, {:.4} risk) and no weaker plan to replace",
                    symbol,
                    phase.as_str(),
                    count,
                    risk
                ))
            }
        }
    }

    fn log_replace(symbol: &str, phase: MarketPhase, evicted: &ActiveEntry, candidate: &ActiveEntry) {
        log(
            Level::Info,
            Domain::Density,
            "replace",
            obj(&[
                ("symbol", v_str(symbol)),
                ("phase", v_str(phase.as_str())),
                ("evicted", json!(evicted.id)),
                ("evicted_confidence", v_num(evicted.confidence)),
                ("incoming", json!(candidate.id)),
                ("incoming_confidence", v_num(candidate.confidence)),
            ]),
        );
    }

    /// Admit `candidate` under (symbol, phase), evicting at most one plan.
    /// Decision and ledger change happen under one lock.
    pub fn admit(&self, symbol: &str, phase: MarketPhase, candidate: ActiveEntry) -> Admission {
        let cap = self.cfg.cap_for(phase);
        let Ok(mut ledger) = self.ledger.lock() else {
            return Admission::Rejected {
                reason: "density ledger poisoned".to_string(),
            };
        };
        ledger.remove(candidate.id);
        let list = ledger.entries.entry((symbol.to_string(), phase)).or_default();
        match self.decide(list, symbol, phase, &candidate) {
            Decision::Fits => {
                list.push(candidate);
                log_governor(Domain::Density, phase.as_str(), "admit", list.len() as f64, cap.max_plans as f64);
                Admission::Admitted
            }
            Decision::Replace(i) => {
                let evicted = list.remove(i);
                Self::log_replace(symbol, phase, &evicted, &candidate);
                list.push(candidate);
                Admission::Replaced { evicted: evicted.id }
            }
            Decision::Reject(reason) => Admission::Rejected { reason },
        }
    }

    /// The admission `candidate` would get, without touching the ledger. A
    /// `Replaced` victim stays tracked until it is released.
    pub fn assess(&self, symbol: &str, phase: MarketPhase, candidate: &ActiveEntry) -> Admission {
        let Ok(ledger) = self.ledger.lock() else {
            return Admission::Rejected {
                reason: "density ledger poisoned".to_string(),
            };
        };
        let others: Vec<ActiveEntry> = ledger
            .entries
            .get(&(symbol.to_string(), phase))
            .map(|v| v.iter().filter(|e| e.id != candidate.id).cloned().collect())
            .unwrap_or_default();
        match self.decide(&others, symbol, phase, candidate) {
            Decision::Fits => Admission::Admitted,
            Decision::Replace(i) => {
                Self::log_replace(symbol, phase, &others[i], candidate);
                Admission::Replaced { evicted: others[i].id }
            }
            Decision::Reject(reason) => Admission::Rejected { reason },
        }
    }

    /// Track `entry` under (symbol, phase) once its plan is active.
    pub fn claim(&self, symbol: &str, phase: MarketPhase, entry: ActiveEntry) {
        let cap = self.cfg.cap_for(phase);
        if let Ok(mut ledger) = self.ledger.lock() {
            ledger.remove(entry.id);
            let list = ledger.entries.entry((symbol.to_string(), phase)).or_default();
            list.push(entry);
            log_governor(Domain::Density, phase.as_str(), "admit", list.len() as f64, cap.max_plans as f64);
        }
    }

    /// Drop `id` from whichever (symbol, phase) holds it.
    pub fn release(&self, id: PlanId) -> bool {
        self.ledger.lock().map(|mut l| l.remove(id)).unwrap_or(false)
    }

    /// Update a ledger entry in place (after an amendment). No admission.
    pub fn refresh(&self, entry: ActiveEntry) -> bool {
        let Ok(mut ledger) = self.ledger.lock() else {
            return false;
        };
        for e in ledger.entries.values_mut().flat_map(|v| v.iter_mut()) {
            if e.id == entry.id {
                *e = entry;
                return true;
            }
        }
        false
    }

    /// Rebuild from stored plans; only active plans count.
    pub fn rebuild(&self, plans: &[Plan]) {
        let mut fresh = DensityLedger::default();
        for plan in plans.iter().filter(|p| p.state.is_active()) {
            fresh
                .entries
                .entry((plan.symbol.clone(), plan.admission_phase))
                .or_default()
                .push(ActiveEntry::of(plan));
        }
        if let Ok(mut ledger) = self.ledger.lock() {
            *ledger = fresh;
        }
    }

    pub fn usage(&self, symbol: &str, phase: MarketPhase) -> (usize, f64) {
        self.ledger
            .lock()
            .map(|l| (l.count(symbol, phase), l.risk_units(symbol, phase)))
            .unwrap_or((0, 0.0))
    }

    pub fn contains(&self, id: PlanId) -> bool {
        self.ledger
            .lock()
            .map(|l| l.entries.values().any(|v| v.iter().any(|e| e.id == id)))
            .unwrap_or(false)
    }
}
