//! Bias invalidation fence.
//!
//! Per-symbol verdicts come from a 3-way vote (two higher-timeframe views and
//! the mean-price side) cached for a short TTL. A plan is suspended after the
//! verdict has opposed it for `hysteresis_windows` distinct snapshots, or at
//! once on a decisive structure break against it while volatility is
//! elevated.

use futures_util::future::join3;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{PlanError, PlanResult};
use crate::logging::{log, log_fence, obj, v_str, Domain, Level};
use crate::market::cache::TtlCache;
use crate::market::{Bias, BiasSource, HtfView};
use crate::plan::{Direction, Plan, PlanId, Timestamp};

#[derive(Debug, Clone, PartialEq)]
pub struct BiasConfig {
    pub ttl_ms: u64,
    pub hysteresis_windows: u32,
    pub cooldown_ms: u64,
    pub min_confluence: f64,
    /// Short/long volatility ratio at which a structure break suspends
    /// without waiting for hysteresis.
    pub fast_path_vol_ratio: f64,
}

impl Default for BiasConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 30_000,
            hysteresis_windows: 2,
            cooldown_ms: 900_000,
            min_confluence: 0.66,
            fast_path_vol_ratio: 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BiasSnapshot {
    pub symbol: String,
    pub verdict: Bias,
    pub votes: [Bias; 3],
    pub computed_at: Timestamp,
}

impl BiasSnapshot {
    pub fn from_votes(symbol: &str, votes: [Bias; 3], computed_at: Timestamp) -> Self {
        let bulls = votes.iter().filter(|v| **v == Bias::Bullish).count();
        let bears = votes.iter().filter(|v| **v == Bias::Bearish).count();
        let verdict = if bulls >= 2 {
            Bias::Bullish
        } else if bears >= 2 {
            Bias::Bearish
        } else {
            Bias::Neutral
        };
        Self {
            symbol: symbol.to_string(),
            verdict,
            votes,
            computed_at,
        }
    }

    /// Share of votes agreeing with `direction`.
    pub fn confluence(&self, direction: Direction) -> f64 {
        self.votes.iter().filter(|v| v.agrees_with(direction)).count() as f64 / 3.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FenceDecision {
    Clear,
    /// Opposed, but not for enough windows yet.
    Watching { consecutive: u32 },
    Suspend { reason: String, cooldown_until: Timestamp },
    Cooling { until: Timestamp },
    ReArm { confluence: f64 },
    Extend { until: Timestamp, reason: String },
}

#[derive(Debug, Clone, Copy, Default)]
struct Track {
    consecutive: u32,
    last_window: Option<Timestamp>,
}

pub struct BiasFence {
    cfg: BiasConfig,
    source: Arc<dyn BiasSource>,
    cache: TtlCache<String, BiasSnapshot>,
    tracks: Mutex<HashMap<PlanId, Track>>,
}

impl BiasFence {
    pub fn new(cfg: BiasConfig, source: Arc<dyn BiasSource>) -> Self {
        let ttl = cfg.ttl_ms;
        Self {
            cfg,
            source,
            cache: TtlCache::new(ttl),
            tracks: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &BiasConfig {
        &self.cfg
    }

    /// Cached verdict for `symbol`, recomputed once the TTL lapses.
    pub async fn snapshot(&self, symbol: &str, now: Timestamp) -> PlanResult<BiasSnapshot> {
        let key = symbol.to_string();
        if let Some(snap) = self.cache.get(&key, now) {
            return Ok(snap);
        }
        let (primary, secondary, side) = join3(
            self.source.higher_timeframe_bias(symbol, HtfView::Primary),
            self.source.higher_timeframe_bias(symbol, HtfView::Secondary),
            self.source.mean_price_side(symbol),
        )
        .await;
        let votes = [
            primary.map_err(|e| PlanError::collaborator("bias", e))?,
            secondary.map_err(|e| PlanError::collaborator("bias", e))?,
            side.map_err(|e| PlanError::collaborator("bias", e))?.as_bias(),
        ];
        let snap = BiasSnapshot::from_votes(symbol, votes, now);
        log(
            Level::Debug,
            Domain::Bias,
            "bias_snapshot",
            obj(&[
                ("symbol", v_str(symbol)),
                ("verdict", v_str(snap.verdict.as_str())),
                ("votes", json!(votes.iter().map(|v| v.as_str()).collect::<Vec<_>>())),
            ]),
        );
        self.cache.put(key, snap.clone(), now);
        Ok(snap)
    }

    pub fn invalidate(&self, symbol: &str) {
        self.cache.invalidate(&symbol.to_string());
    }

    pub fn forget(&self, plan_id: PlanId) {
        if let Ok(mut tracks) = self.tracks.lock() {
            tracks.remove(&plan_id);
        }
    }

    fn suspend_decision(&self, plan: &Plan, reason: String, verdict: &str, now: Timestamp) -> FenceDecision {
        self.forget(plan.id);
        log_fence(plan.id, &plan.symbol, "suspend", verdict, &reason);
        FenceDecision::Suspend {
            reason,
            cooldown_until: now + self.cfg.cooldown_ms,
        }
    }

    /// Fence check for a `PENDING` plan. `vol_ratio` enables the fast path.
    pub async fn check_active(&self, plan: &Plan, vol_ratio: Option<f64>, now: Timestamp) -> PlanResult<FenceDecision> {
        if vol_ratio.map(|r| r >= self.cfg.fast_path_vol_ratio).unwrap_or(false) {
            let brk = self
                .source
                .structure_break(&plan.symbol)
                .await
                .map_err(|e| PlanError::collaborator("bias", e))?;
            if let Some(brk) = brk {
                if brk.decisive && brk.direction.opposes(plan.direction) {
                    let reason = format!("structure_break:{}", brk.direction.as_str());
                    return Ok(self.suspend_decision(plan, reason, brk.direction.as_str(), now));
                }
            }
        }

        let snap = self.snapshot(&plan.symbol, now).await?;
        if !snap.verdict.opposes(plan.direction) {
            self.forget(plan.id);
            return Ok(FenceDecision::Clear);
        }

        let consecutive = {
            let mut tracks = self
                .tracks
                .lock()
                .map_err(|_| PlanError::collaborator("bias", "fence state poisoned"))?;
            let track = tracks.entry(plan.id).or_default();
            if track.last_window != Some(snap.computed_at) {
                track.consecutive += 1;
                track.last_window = Some(snap.computed_at);
            }
            track.consecutive
        };

        if consecutive >= self.cfg.hysteresis_windows {
            let reason = format!("bias_conflict:{}", snap.verdict.as_str());
            return Ok(self.suspend_decision(plan, reason, snap.verdict.as_str(), now));
        }
        log_fence(
            plan.id,
            &plan.symbol,
            "watching",
            snap.verdict.as_str(),
            &format!("{}/{}", consecutive, self.cfg.hysteresis_windows),
        );
        Ok(FenceDecision::Watching { consecutive })
    }

    /// Re-arm check for a `SUSPENDED` plan.
    pub async fn check_suspended(&self, plan: &Plan, now: Timestamp) -> PlanResult<FenceDecision> {
        let until = plan.suspension.as_ref().map(|s| s.cooldown_until).unwrap_or(now);
        if now < until {
            return Ok(FenceDecision::Cooling { until });
        }
        let snap = self.snapshot(&plan.symbol, now).await?;
        let confluence = snap.confluence(plan.direction);
        if snap.verdict.agrees_with(plan.direction) && confluence >= self.cfg.min_confluence {
            log_fence(plan.id, &plan.symbol, "rearm", snap.verdict.as_str(), &format!("{:.2}", confluence));
            return Ok(FenceDecision::ReArm { confluence });
        }
        let reason = format!("bias_unconfirmed:{}:{:.2}", snap.verdict.as_str(), confluence);
        log_fence(plan.id, &plan.symbol, "extend", snap.verdict.as_str(), &reason);
        Ok(FenceDecision::Extend {
            until: now + self.cfg.cooldown_ms,
            reason,
        })
    }
}
