//! Structured JSON-lines logging for the supervision engine.
//!
//! Every record carries a run id, a global sequence number, a level, a domain
//! and an event name. Plan-scoped fields (`plan_id`, `symbol`, `msg`) are lifted
//! to the top level so a run can be grepped per plan; everything else lands in
//! `data`.
//!
//! Output goes to `$LOG_DIR/$RUN_ID/{events,trace}.jsonl` (trace and debug in
//! the trace file) and, unless `LOG_STDOUT=0`, to stdout.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::fs::{create_dir_all, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

use crate::plan::{PlanId, PlanState};

// =============================================================================
// Log Levels
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
    Fatal = 5,
}

impl Level {
    pub fn from_env() -> Self {
        match std::env::var("LOG_LEVEL").as_deref() {
            Ok("trace") => Level::Trace,
            Ok("debug") => Level::Debug,
            Ok("info") => Level::Info,
            Ok("warn") => Level::Warn,
            Ok("error") => Level::Error,
            Ok("fatal") => Level::Fatal,
            _ => Level::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Fatal => "fatal",
        }
    }
}

// =============================================================================
// Log Domains
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Plan,    // Lifecycle transitions, amendments
    Bias,    // Fence votes, suspensions, re-arms
    Drift,   // Anchor drift, re-anchors
    Risk,    // Stop/target recomputation
    Rate,    // Re-anchor budgets
    Density, // Admission, eviction
    Monitor, // Tick scheduling
    Exec,    // Dispatch to the venue
    Store,   // Durable store, journal
    Notify,  // Outbound events
    System,  // Startup, shutdown
    Profile, // Timing
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Plan => "plan",
            Domain::Bias => "bias",
            Domain::Drift => "drift",
            Domain::Risk => "risk",
            Domain::Rate => "rate",
            Domain::Density => "density",
            Domain::Monitor => "monitor",
            Domain::Exec => "exec",
            Domain::Store => "store",
            Domain::Notify => "notify",
            Domain::System => "system",
            Domain::Profile => "profile",
        }
    }

    pub fn is_enabled(&self) -> bool {
        // LOG_DOMAINS: comma-separated list or "all"
        match std::env::var("LOG_DOMAINS").as_deref() {
            Ok("all") | Err(_) => true,
            Ok(domains) => domains.split(',').any(|d| d.trim() == self.as_str()),
        }
    }
}

// =============================================================================
// Run context
// =============================================================================

static LOG_SEQ: AtomicU64 = AtomicU64::new(0);
static RUN_CONTEXT: OnceLock<RunContext> = OnceLock::new();

fn next_seq() -> u64 {
    LOG_SEQ.fetch_add(1, Ordering::SeqCst)
}

struct RunContext {
    run_id: String,
    min_level: Level,
    stdout: bool,
    events: Option<Mutex<BufWriter<File>>>,
    trace: Option<Mutex<BufWriter<File>>>,
}

fn open_sink(path: PathBuf) -> Option<Mutex<BufWriter<File>>> {
    match File::create(&path) {
        Ok(f) => Some(Mutex::new(BufWriter::new(f))),
        Err(err) => {
            eprintln!("[log] failed to create {}: {}", path.display(), err);
            None
        }
    }
}

fn ensure_run_context() -> &'static RunContext {
    RUN_CONTEXT.get_or_init(|| {
        let run_id = std::env::var("RUN_ID")
            .unwrap_or_else(|_| format!("r-{}-{}", ts_epoch_ms(), process::id()));
        let base = std::env::var("LOG_DIR").unwrap_or_else(|_| "out/runs".to_string());
        let mut run_dir = PathBuf::from(base);
        run_dir.push(&run_id);
        if let Err(err) = create_dir_all(&run_dir) {
            eprintln!("[log] failed to create run dir: {}", err);
        }

        let _ = std::fs::write(
            run_dir.join("manifest.json"),
            json!({
                "run_id": run_id,
                "ts": ts_now(),
                "pid": process::id(),
                "log_dir": run_dir.to_string_lossy(),
            })
            .to_string(),
        );

        RunContext {
            run_id,
            min_level: Level::from_env(),
            stdout: !matches!(std::env::var("LOG_STDOUT").as_deref(), Ok("0") | Ok("false")),
            events: open_sink(run_dir.join("events.jsonl")),
            trace: open_sink(run_dir.join("trace.jsonl")),
        }
    })
}

fn split_fields(mut fields: Map<String, Value>) -> (Map<String, Value>, Map<String, Value>) {
    let mut top = Map::new();
    for key in ["plan_id", "symbol", "tick", "msg"] {
        if let Some(value) = fields.remove(key) {
            top.insert(key.to_string(), value);
        }
    }
    (top, fields)
}

fn write_line(writer: &Option<Mutex<BufWriter<File>>>, line: &str, flush: bool) {
    if let Some(writer) = writer {
        if let Ok(mut w) = writer.lock() {
            let _ = writeln!(w, "{}", line);
            if flush {
                let _ = w.flush();
            }
        }
    }
}

/// Flush buffered sinks. Called on shutdown.
pub fn flush() {
    if let Some(ctx) = RUN_CONTEXT.get() {
        for sink in [&ctx.events, &ctx.trace].into_iter().flatten() {
            if let Ok(mut w) = sink.lock() {
                let _ = w.flush();
            }
        }
    }
}

// =============================================================================
// Core logging functions
// =============================================================================

/// RFC3339 timestamp with milliseconds
pub fn ts_now() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Epoch milliseconds
pub fn ts_epoch_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

/// Emit a structured log entry
pub fn log(level: Level, domain: Domain, event: &str, fields: Map<String, Value>) {
    let ctx = ensure_run_context();
    if level < ctx.min_level || !domain.is_enabled() {
        return;
    }
    emit_record(ctx, level, domain.as_str(), event, fields);
}

fn emit_record(ctx: &RunContext, level: Level, component: &str, event: &str, fields: Map<String, Value>) {
    let (mut top, data) = split_fields(fields);

    let msg = top.remove("msg").unwrap_or(Value::String(String::new()));
    let mut entry = Map::new();
    entry.insert("ts".to_string(), json!(ts_now()));
    entry.insert("run_id".to_string(), json!(ctx.run_id.clone()));
    entry.insert("seq".to_string(), json!(next_seq()));
    entry.insert("lvl".to_string(), json!(level.as_str().to_uppercase()));
    entry.insert("component".to_string(), json!(component));
    entry.insert("event".to_string(), json!(event));
    entry.insert("msg".to_string(), msg);
    for (k, v) in top {
        entry.insert(k, v);
    }
    entry.insert("data".to_string(), Value::Object(data));

    let line = Value::Object(entry).to_string();
    match level {
        Level::Trace | Level::Debug => write_line(&ctx.trace, &line, false),
        Level::Info => write_line(&ctx.events, &line, false),
        _ => write_line(&ctx.events, &line, true),
    }
    if ctx.stdout {
        println!("{}", line);
    }
}

// =============================================================================
// Domain-Specific Logging Helpers
// =============================================================================

pub fn log_transition(plan_id: PlanId, symbol: &str, from: PlanState, to: PlanState, revision: u64, reason: &str) {
    log(
        Level::Info,
        Domain::Plan,
        "transition",
        obj(&[
            ("plan_id", json!(plan_id)),
            ("symbol", v_str(symbol)),
            ("from", v_str(from.as_str())),
            ("to", v_str(to.as_str())),
            ("revision", json!(revision)),
            ("reason", v_str(reason)),
        ]),
    );
}

pub fn log_reanchor(
    plan_id: PlanId,
    symbol: &str,
    predictive: bool,
    drift: f64,
    old_anchor: f64,
    new_anchor: f64,
    entry: f64,
    stop: f64,
    target: f64,
) {
    log(
        Level::Info,
        Domain::Drift,
        "reanchor",
        obj(&[
            ("plan_id", json!(plan_id)),
            ("symbol", v_str(symbol)),
            ("predictive", json!(predictive)),
            ("drift", v_num(drift)),
            ("old_anchor", v_num(old_anchor)),
            ("new_anchor", v_num(new_anchor)),
            ("entry", v_num(entry)),
            ("stop", v_num(stop)),
            ("target", v_num(target)),
        ]),
    );
}

pub fn log_fence(plan_id: PlanId, symbol: &str, decision: &str, verdict: &str, detail: &str) {
    log(
        Level::Debug,
        Domain::Bias,
        "fence",
        obj(&[
            ("plan_id", json!(plan_id)),
            ("symbol", v_str(symbol)),
            ("decision", v_str(decision)),
            ("verdict", v_str(verdict)),
            ("detail", v_str(detail)),
        ]),
    );
}

pub fn log_governor(domain: Domain, check: &str, result: &str, value: f64, threshold: f64) {
    log(
        Level::Debug,
        domain,
        "guard",
        obj(&[
            ("check", v_str(check)),
            ("result", v_str(result)),
            ("value", v_num(value)),
            ("threshold", v_num(threshold)),
        ]),
    );
}

pub fn log_dispatch(plan_id: PlanId, symbol: &str, client_id: &str, result: &str, detail: &str) {
    let level = if result == "filled" { Level::Info } else { Level::Warn };
    log(
        level,
        Domain::Exec,
        "dispatch",
        obj(&[
            ("plan_id", json!(plan_id)),
            ("symbol", v_str(symbol)),
            ("client_id", v_str(client_id)),
            ("result", v_str(result)),
            ("detail", v_str(detail)),
        ]),
    );
}

/// A pipeline stage that was skipped for one plan on one tick.
pub fn log_stage_skipped(plan_id: PlanId, stage: &str, kind: &str, detail: &str) {
    log(
        Level::Warn,
        Domain::Monitor,
        "stage_skipped",
        obj(&[
            ("plan_id", json!(plan_id)),
            ("stage", v_str(stage)),
            ("kind", v_str(kind)),
            ("detail", v_str(detail)),
        ]),
    );
}

pub fn log_tick_summary(tick: u64, fields: &[(&str, u64)], elapsed_ms: f64, read_only: bool) {
    let mut map = Map::new();
    map.insert("tick".to_string(), json!(tick));
    for (k, v) in fields {
        map.insert((*k).to_string(), json!(v));
    }
    map.insert("elapsed_ms".to_string(), v_num(elapsed_ms));
    map.insert("read_only".to_string(), json!(read_only));
    log(Level::Info, Domain::Monitor, "tick_summary", map);
}

// =============================================================================
// Utility Functions
// =============================================================================

/// Short sha256 fingerprint, hex encoded.
pub fn params_hash(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(&digest[..8])
}

pub fn obj(pairs: &[(&str, Value)]) -> Map<String, Value> {
    let mut map = Map::new();
    for (k, v) in pairs {
        map.insert((*k).to_string(), v.clone());
    }
    map
}

pub fn v_str(s: &str) -> Value {
    Value::String(s.to_string())
}

pub fn v_num(n: f64) -> Value {
    json!(n)
}

// =============================================================================
// Profiling Scope
// =============================================================================

/// Emits structured timing on drop.
pub struct ProfileScope {
    label: &'static str,
    context: Map<String, Value>,
    started: Instant,
}

impl ProfileScope {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            context: Map::new(),
            started: Instant::now(),
        }
    }

    pub fn with_context(label: &'static str, fields: &[(&str, Value)]) -> Self {
        Self {
            label,
            context: obj(fields),
            started: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.started.elapsed().as_secs_f64() * 1000.0
    }
}

impl Drop for ProfileScope {
    fn drop(&mut self) {
        let mut fields = std::mem::take(&mut self.context);
        fields.insert("label".to_string(), v_str(self.label));
        fields.insert("elapsed_ms".to_string(), v_num(self.elapsed_ms()));
        log(Level::Trace, Domain::Profile, "profile", fields);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(Level::Trace < Level::Debug);
        assert!(Level::Debug < Level::Info);
        assert!(Level::Info < Level::Warn);
        assert!(Level::Warn < Level::Error);
        assert!(Level::Error < Level::Fatal);
    }

    #[test]
    fn test_params_hash_deterministic() {
        assert_eq!(params_hash("plan-1-r3"), params_hash("plan-1-r3"));
        assert_ne!(params_hash("plan-1-r3"), params_hash("plan-1-r4"));
        assert_eq!(params_hash("x").len(), 16);
    }

    #[test]
    fn test_split_fields_lifts_plan_keys() {
        let fields = obj(&[
            ("plan_id", json!(9)),
            ("symbol", v_str("BTCUSDT")),
            ("drift", v_num(45.0)),
        ]);
        let (top, data) = split_fields(fields);
        assert_eq!(top.get("plan_id").unwrap(), 9);
        assert_eq!(top.get("symbol").unwrap(), "BTCUSDT");
        assert!(data.contains_key("drift"));
        assert!(!data.contains_key("plan_id"));
    }

    #[test]
    fn test_seq_increments() {
        let s1 = next_seq();
        let s2 = next_seq();
        assert!(s2 > s1);
    }
}
