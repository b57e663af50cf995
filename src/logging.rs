//! Structured JSON logging for the decision pipeline.
//!
//! Every run gets its own directory with `events.jsonl` (info and above) and
//! `trace.jsonl` (debug detail). Entries carry a monotonic sequence number so
//! a cycle can be reconstructed in exact order after the fact.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fs::{create_dir_all, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

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

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Cycle,    // Cycle lifecycle: start, disposition, recovery
    Stage,    // Per-stage commits, retries, timeouts
    Risk,     // Guard verdicts, limit checks, halts
    Memory,   // Cache and durable log activity
    Learning, // Reconciliation, factor score updates
    Exec,     // Order submission and receipts
    System,   // Mode transitions, startup, shutdown
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Cycle => "cycle",
            Domain::Stage => "stage",
            Domain::Risk => "risk",
            Domain::Memory => "memory",
            Domain::Learning => "learning",
            Domain::Exec => "exec",
            Domain::System => "system",
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

static LOG_SEQ: AtomicU64 = AtomicU64::new(0);
static RUN_CONTEXT: OnceLock<RunContext> = OnceLock::new();

fn next_seq() -> u64 {
    LOG_SEQ.fetch_add(1, Ordering::SeqCst)
}

#[derive(Debug)]
struct RunContext {
    run_id: String,
    events: Mutex<BufWriter<File>>,
    trace: Mutex<BufWriter<File>>,
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
        let events_path = run_dir.join("events.jsonl");
        let trace_path = run_dir.join("trace.jsonl");

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

        let events = File::create(events_path).unwrap_or_else(|err| {
            eprintln!("[log] failed to create events log: {}", err);
            File::create("/tmp/alphaloop-events.jsonl").expect("events fallback")
        });
        let trace = File::create(trace_path).unwrap_or_else(|err| {
            eprintln!("[log] failed to create trace log: {}", err);
            File::create("/tmp/alphaloop-trace.jsonl").expect("trace fallback")
        });

        RunContext {
            run_id,
            events: Mutex::new(BufWriter::new(events)),
            trace: Mutex::new(BufWriter::new(trace)),
        }
    })
}

fn write_line(writer: &Mutex<BufWriter<File>>, line: &str) {
    if let Ok(mut w) = writer.lock() {
        let _ = writeln!(w, "{}", line);
        let _ = w.flush();
    }
}

/// RFC3339 timestamp with milliseconds
pub fn ts_now() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

pub fn ts_epoch_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

/// Emit a structured log entry
pub fn log(level: Level, domain: Domain, event: &str, fields: Map<String, Value>) {
    let min_level = Level::from_env();
    if level < min_level || !domain.is_enabled() {
        return;
    }

    let ctx = ensure_run_context();
    let mut entry = Map::new();
    entry.insert("ts".to_string(), json!(ts_now()));
    entry.insert("run_id".to_string(), json!(ctx.run_id.clone()));
    entry.insert("seq".to_string(), json!(next_seq()));
    entry.insert("lvl".to_string(), json!(level.as_str().to_uppercase()));
    entry.insert("domain".to_string(), json!(domain.as_str()));
    entry.insert("event".to_string(), json!(event));
    entry.insert("data".to_string(), Value::Object(fields));

    let line = Value::Object(entry).to_string();
    match level {
        Level::Trace | Level::Debug => write_line(&ctx.trace, &line),
        _ => write_line(&ctx.events, &line),
    }
    println!("{}", line);
}

// =============================================================================
// Domain helpers
// =============================================================================

pub fn log_mode_transition(from: &str, to: &str, reason: &str) {
    log(
        Level::Info,
        Domain::System,
        "mode_transition",
        obj(&[
            ("from", v_str(from)),
            ("to", v_str(to)),
            ("reason", v_str(reason)),
        ]),
    );
}

pub fn log_stage_commit(cycle_id: &str, stage: &str, agent: &str, confidence: f64, degraded: bool) {
    log(
        Level::Info,
        Domain::Stage,
        "stage_commit",
        obj(&[
            ("cycle_id", v_str(cycle_id)),
            ("stage", v_str(stage)),
            ("agent", v_str(agent)),
            ("confidence", v_num(confidence)),
            ("degraded", Value::Bool(degraded)),
        ]),
    );
}

pub fn log_stage_retry(cycle_id: &str, stage: &str, attempt: u32, reason: &str) {
    log(
        Level::Warn,
        Domain::Stage,
        "stage_retry",
        obj(&[
            ("cycle_id", v_str(cycle_id)),
            ("stage", v_str(stage)),
            ("attempt", json!(attempt)),
            ("reason", v_str(reason)),
        ]),
    );
}

pub fn log_verdict(cycle_id: &str, verdict: &str, rule: &str, value: f64, limit: f64) {
    log(
        Level::Info,
        Domain::Risk,
        "verdict",
        obj(&[
            ("cycle_id", v_str(cycle_id)),
            ("verdict", v_str(verdict)),
            ("rule", v_str(rule)),
            ("value", v_num(value)),
            ("limit", v_num(limit)),
        ]),
    );
}

pub fn log_order_submit(cycle_id: &str, key: &str, symbol: &str, side: &str, qty: f64) {
    log(
        Level::Info,
        Domain::Exec,
        "order_submit",
        obj(&[
            ("cycle_id", v_str(cycle_id)),
            ("idempotency_key", v_str(key)),
            ("symbol", v_str(symbol)),
            ("side", v_str(side)),
            ("qty", v_num(qty)),
        ]),
    );
}

pub fn log_cycle_end(cycle_id: &str, disposition: &str, equity: f64, book_hash: u64) {
    log(
        Level::Info,
        Domain::Cycle,
        "cycle_end",
        obj(&[
            ("cycle_id", v_str(cycle_id)),
            ("disposition", v_str(disposition)),
            ("equity", v_num(equity)),
            ("book_hash", serde_json::json!(book_hash)),
        ]),
    );
}

pub fn log_learning(cycle_id: &str, factor: &str, prediction_error: f64, outcome: &str) {
    log(
        Level::Debug,
        Domain::Learning,
        "reconciled",
        obj(&[
            ("cycle_id", v_str(cycle_id)),
            ("factor", v_str(factor)),
            ("prediction_error", v_num(prediction_error)),
            ("outcome", v_str(outcome)),
        ]),
    );
}

// =============================================================================
// Field construction helpers
// =============================================================================

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
