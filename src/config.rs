//! Environment configuration.
//!
//! `Config::from_env` is lenient: a missing or unparseable variable falls
//! back to its default. `validate` is strict and is what the daemon calls
//! before starting. Map-valued variables use `KEY=value,KEY=value`.

use anyhow::{bail, Result};
use std::collections::HashMap;
use std::hash::Hash;
use std::str::FromStr;

use crate::bias::BiasConfig;
use crate::dispatch::DispatchConfig;
use crate::drift::DriftConfig;
use crate::governor::{DensityCap, DensityConfig, RateConfig, RateLimit};
use crate::logging::{log, obj, v_str, Domain, Level};
use crate::market::{MarketPhase, Session};
use crate::monitor::MonitorConfig;
use crate::plan::Archetype;
use crate::reliability::retry::RetryConfig;
use crate::risk::{Elasticity, RiskConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub sqlite_path: String,
    /// No journal when unset.
    pub journal_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PaperConfig {
    pub symbols: Vec<String>,
    pub seed: u64,
    pub step_ms: u64,
    /// JSON array of plan specs submitted at startup.
    pub seed_plans: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub monitor: MonitorConfig,
    pub drift: DriftConfig,
    pub bias: BiasConfig,
    pub risk: RiskConfig,
    pub rate: RateConfig,
    pub density: DensityConfig,
    pub dispatch: DispatchConfig,
    pub retry: RetryConfig,
    pub store: StoreConfig,
    pub paper: PaperConfig,
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key).as_deref() {
        Ok("1") | Ok("true") | Ok("yes") => true,
        Ok("0") | Ok("false") | Ok("no") => false,
        _ => default,
    }
}

fn skipped(key: &str, entry: &str) {
    log(
        Level::Warn,
        Domain::System,
        "config_entry_ignored",
        obj(&[("var", v_str(key)), ("entry", v_str(entry))]),
    );
}

/// `KEY=value` pairs of a map-valued variable.
pub fn parse_pairs(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .filter_map(|part| {
            let (k, v) = part.split_once('=')?;
            let (k, v) = (k.trim(), v.trim());
            if k.is_empty() || v.is_empty() {
                None
            } else {
                Some((k.to_string(), v.to_string()))
            }
        })
        .collect()
}

fn env_map<K, V, F>(key: &str, mut parse: F) -> HashMap<K, V>
where
    K: FromStr + Eq + Hash,
    F: FnMut(&str) -> Option<V>,
{
    let Ok(raw) = std::env::var(key) else {
        return HashMap::new();
    };
    let mut out = HashMap::new();
    for (k, v) in parse_pairs(&raw) {
        match (k.parse::<K>().ok(), parse(&v)) {
            (Some(k), Some(v)) => {
                out.insert(k, v);
            }
            _ => skipped(key, &format!("{}={}", k, v)),
        }
    }
    out
}

fn f64_value(v: &str) -> Option<f64> {
    v.parse().ok()
}

/// `a:b` as a pair of floats.
fn f64_pair(v: &str) -> Option<(f64, f64)> {
    let (a, b) = v.split_once(':')?;
    Some((a.trim().parse().ok()?, b.trim().parse().ok()?))
}

fn env_limit(prefix: &str, default: RateLimit) -> RateLimit {
    RateLimit {
        max_per_window: env_parse(&format!("{}_MAX", prefix), default.max_per_window),
        min_spacing_ms: env_parse(&format!("{}_SPACING_MS", prefix), default.min_spacing_ms),
    }
}

impl Config {
    pub fn from_env() -> Self {
        let monitor = {
            let d = MonitorConfig::default();
            MonitorConfig {
                tick_ms: env_parse("TICK_MS", d.tick_ms),
                tick_budget_ms: env_parse("TICK_BUDGET_MS", d.tick_budget_ms),
                plan_budget_ms: env_parse("PLAN_BUDGET_MS", d.plan_budget_ms),
                workers: env_parse("WORKERS", d.workers),
                overload_multiple: env_parse("OVERLOAD_MULTIPLE", d.overload_multiple),
                store_circuit_threshold: env_parse("STORE_CIRCUIT_THRESHOLD", d.store_circuit_threshold),
                store_circuit_reset_ms: env_parse("STORE_CIRCUIT_RESET_MS", d.store_circuit_reset_ms),
            }
        };

        let drift = {
            let d = DriftConfig::default();
            DriftConfig {
                default_threshold: env_parse("DRIFT_THRESHOLD", d.default_threshold),
                thresholds: env_map::<String, f64, _>("DRIFT_THRESHOLDS", f64_value),
                tick_lookback: env_parse("DRIFT_TICK_LOOKBACK", d.tick_lookback),
                swing_strength: env_parse("SWING_STRENGTH", d.swing_strength),
                predictive_enabled: env_bool("PREDICTIVE", d.predictive_enabled),
                expansion_multiple: env_parse("PREDICTIVE_EXPANSION_MULTIPLE", d.expansion_multiple),
                range_break_fraction: env_parse("RANGE_BREAK_FRACTION", d.range_break_fraction),
                forecast_horizon_ms: env_parse("FORECAST_HORIZON_MS", d.forecast_horizon_ms),
                velocity_window: env_parse("VELOCITY_WINDOW", d.velocity_window),
                vol_cache_ttl_ms: env_parse("VOL_CACHE_TTL_MS", d.vol_cache_ttl_ms),
            }
        };

        let bias = {
            let d = BiasConfig::default();
            BiasConfig {
                ttl_ms: env_parse("BIAS_TTL_MS", d.ttl_ms),
                hysteresis_windows: env_parse("BIAS_HYSTERESIS", d.hysteresis_windows),
                cooldown_ms: env_parse("BIAS_COOLDOWN_MS", d.cooldown_ms),
                min_confluence: env_parse("BIAS_MIN_CONFLUENCE", d.min_confluence),
                fast_path_vol_ratio: env_parse("BIAS_FAST_PATH_VOL_RATIO", d.fast_path_vol_ratio),
            }
        };

        let risk = {
            let d = RiskConfig::default();
            let mut elasticity = d.elasticity.clone();
            for (archetype, (alpha, beta)) in env_map::<Archetype, (f64, f64), _>("ELASTICITY", f64_pair) {
                elasticity.set(archetype, Elasticity { alpha, beta });
            }
            RiskConfig {
                elasticity,
                symbol_weights: env_map::<String, f64, _>("SYMBOL_WEIGHTS", f64_value),
                phase_weights: env_map::<MarketPhase, f64, _>("PHASE_WEIGHTS", f64_value),
                session_weights: env_map::<Session, f64, _>("SESSION_WEIGHTS", f64_value),
                phase_rr_multipliers: env_map::<MarketPhase, f64, _>("PHASE_RR", f64_value),
                rr_tolerance: env_parse("RR_TOLERANCE", d.rr_tolerance),
                weight_bounds: (
                    env_parse("WEIGHT_MIN", d.weight_bounds.0),
                    env_parse("WEIGHT_MAX", d.weight_bounds.1),
                ),
                scale_bounds: (
                    env_parse("SCALE_MIN", d.scale_bounds.0),
                    env_parse("SCALE_MAX", d.scale_bounds.1),
                ),
                refresh_min_change: env_parse("RISK_REFRESH_MIN_CHANGE", d.refresh_min_change),
            }
        };

        let rate = {
            let d = RateConfig::default();
            RateConfig {
                window_ms: env_parse("RATE_WINDOW_MS", d.window_ms),
                plan: env_limit("RATE_PLAN", d.plan),
                symbol: env_limit("RATE_SYMBOL", d.symbol),
                predictive: env_limit("RATE_PREDICTIVE", d.predictive),
            }
        };

        let density = {
            let mut d = DensityConfig::default();
            let overrides = env_map::<MarketPhase, (f64, f64), _>("DENSITY_CAPS", f64_pair);
            for (phase, (max_plans, max_risk)) in overrides {
                d.caps.insert(
                    phase,
                    DensityCap {
                        max_plans: max_plans.max(0.0) as usize,
                        max_risk,
                    },
                );
            }
            d.correlation_band = env_parse("CORRELATION_BAND", d.correlation_band);
            d
        };

        let dispatch = {
            let d = DispatchConfig::default();
            DispatchConfig {
                timeout_ms: env_parse("DISPATCH_TIMEOUT_MS", d.timeout_ms),
                circuit_threshold: env_parse("VENUE_CIRCUIT_THRESHOLD", d.circuit_threshold),
                circuit_reset_ms: env_parse("VENUE_CIRCUIT_RESET_MS", d.circuit_reset_ms),
            }
        };

        let retry = {
            let d = RetryConfig::default();
            RetryConfig {
                max_retries: env_parse("STALE_RETRIES", d.max_retries),
                base_delay_ms: env_parse("STALE_RETRY_BASE_MS", d.base_delay_ms),
                ..d
            }
        };

        let store = StoreConfig {
            backend: match std::env::var("STORE").as_deref() {
                Ok("sqlite") => StoreBackend::Sqlite,
                _ => StoreBackend::Memory,
            },
            sqlite_path: std::env::var("SQLITE_PATH").unwrap_or_else(|_| "./planwarden.sqlite".to_string()),
            journal_path: std::env::var("JOURNAL_PATH").ok().filter(|p| !p.is_empty()),
        };

        let paper = PaperConfig {
            symbols: std::env::var("SYMBOLS")
                .unwrap_or_else(|_| "BTCUSDT,ETHUSDT".to_string())
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            seed: env_parse("PAPER_SEED", 7),
            step_ms: env_parse("PAPER_STEP_MS", 1_000),
            seed_plans: std::env::var("SEED_PLANS").ok(),
        };

        Self {
            monitor,
            drift,
            bias,
            risk,
            rate,
            density,
            dispatch,
            retry,
            store,
            paper,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.monitor.tick_ms == 0 {
            bail!("TICK_MS must be positive");
        }
        if self.monitor.workers == 0 {
            bail!("WORKERS must be positive");
        }
        if self.monitor.overload_multiple < 1.0 {
            bail!("OVERLOAD_MULTIPLE must be >= 1 (got {})", self.monitor.overload_multiple);
        }
        if self.bias.ttl_ms == 0 || self.bias.ttl_ms > 60_000 {
            bail!("BIAS_TTL_MS must be in (0, 60000] (got {})", self.bias.ttl_ms);
        }
        if self.bias.hysteresis_windows == 0 {
            bail!("BIAS_HYSTERESIS must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.bias.min_confluence) {
            bail!("BIAS_MIN_CONFLUENCE must be in [0, 1]");
        }
        if self.drift.default_threshold <= 0.0 || self.drift.thresholds.values().any(|t| *t <= 0.0) {
            bail!("drift thresholds must be positive");
        }
        if self.rate.window_ms == 0 || self.rate.plan.max_per_window == 0 {
            bail!("rate window and per-plan cap must be positive");
        }
        if self.rate.predictive.max_per_window > self.rate.plan.max_per_window {
            bail!("predictive budget must not exceed the per-plan cap");
        }
        let (lo, hi) = self.risk.weight_bounds;
        if !(lo > 0.0 && lo <= hi) {
            bail!("weight bounds must satisfy 0 < min <= max (got {}, {})", lo, hi);
        }
        let (lo, hi) = self.risk.scale_bounds;
        if !(lo > 0.0 && lo <= hi) {
            bail!("scale bounds must satisfy 0 < min <= max (got {}, {})", lo, hi);
        }
        if self.risk.rr_tolerance < 0.0 {
            bail!("RR_TOLERANCE must be non-negative");
        }
        if self.risk.phase_rr_multipliers.values().any(|m| *m <= 0.0) {
            bail!("PHASE_RR multipliers must be positive");
        }
        if self.density.caps.values().any(|c| c.max_risk <= 0.0) {
            bail!("density risk caps must be positive");
        }
        if self.dispatch.timeout_ms == 0 {
            bail!("DISPATCH_TIMEOUT_MS must be positive");
        }
        if self.paper.symbols.is_empty() {
            bail!("SYMBOLS must name at least one symbol");
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            monitor: MonitorConfig::default(),
            drift: DriftConfig::default(),
            bias: BiasConfig::default(),
            risk: RiskConfig::default(),
            rate: RateConfig::default(),
            density: DensityConfig::default(),
            dispatch: DispatchConfig::default(),
            retry: RetryConfig::default(),
            store: StoreConfig {
                backend: StoreBackend::Memory,
                sqlite_path: "./planwarden.sqlite".to_string(),
                journal_path: None,
            },
            paper: PaperConfig {
                symbols: vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()],
                seed: 7,
                step_ms: 1_000,
                seed_plans: None,
            },
        }
    }
}
