//! End-to-end pipeline tests: whole cycles against deterministic data,
//! verifying dispositions, durable state, halts, and crash recovery.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;

use async_trait::async_trait;

use alphaloop::agent::{
    AgentOutput, AgentResult, ExecutionReport, Factor, FactorKind, FactorReport, Regime,
    RegimeReport, RiskAssessment,
};
use alphaloop::broker::{OrderReceipt, PaperBroker, Side};
use alphaloop::config::{Config, RiskLimits};
use alphaloop::data::{Bar, FailoverFeed, FlakyProvider, MarketDataProvider, StaticProvider};
use alphaloop::error::PipelineError;
use alphaloop::memory::{DurableLog, Severity};
use alphaloop::orchestrator::{
    CycleWal, Disposition, Orchestrator, SystemMode, WalEntry,
};
use alphaloop::portfolio::{PortfolioState, Position};

fn test_config(dir: &TempDir) -> Config {
    Config {
        limits: RiskLimits {
            max_daily_loss_pct: 0.02,
            max_position_pct: 0.10,
            max_leverage: 1.0,
            max_drawdown_pct: 0.20,
            max_correlation: 0.7,
        },
        symbols: vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()],
        stage_timeout_secs: 5,
        stage_retries: 2,
        retry_base_delay_ms: 1,
        data_timeout_ms: 1_000,
        auto_trading: false,
        enable_factor_discovery: true,
        enable_learning: true,
        sqlite_path: dir.path().join("log.sqlite").to_string_lossy().into_owned(),
        wal_path: dir.path().join("cycle.wal").to_string_lossy().into_owned(),
        kill_file: dir.path().join("STOP").to_string_lossy().into_owned(),
        initial_capital: 100_000.0,
        min_confidence: 0.3,
        learning_decay: 0.9,
        exclusion_streak: 5,
        history_bars: 120,
        fee_rate: 0.0004,
        slip_rate: 0.0002,
        risk_event_window: 20,
    }
}

/// Slow price wave: 20-bar momentum on this series genuinely predicts the
/// next bar, so the backtest stage finds a useful factor.
fn wave_series(n: usize, phase_bars: usize) -> Vec<Bar> {
    (0..n)
        .map(|i| {
            let t = (i + phase_bars) as f64 * std::f64::consts::TAU / 80.0;
            Bar {
                ts: 1_700_000_000 + (i as u64) * 3600,
                close: 100.0 * (1.0 + 0.15 * t.sin()),
                volume: 1_000.0,
            }
        })
        .collect()
}

fn flat_series(n: usize) -> Vec<Bar> {
    (0..n)
        .map(|i| Bar {
            ts: 1_700_000_000 + (i as u64) * 3600,
            close: 100.0,
            volume: 1_000.0,
        })
        .collect()
}

fn wave_provider(n: usize) -> StaticProvider {
    let mut series = HashMap::new();
    // Quarter-period phase shift keeps pairwise correlation near zero.
    series.insert("BTCUSDT".to_string(), wave_series(n, 0));
    series.insert("ETHUSDT".to_string(), wave_series(n, 20));
    StaticProvider::with_series(series)
}

fn flat_provider(n: usize) -> StaticProvider {
    let mut series = HashMap::new();
    series.insert("BTCUSDT".to_string(), flat_series(n));
    series.insert("ETHUSDT".to_string(), flat_series(n));
    StaticProvider::with_series(series)
}

fn orchestrator_with(config: Config, provider: StaticProvider) -> Orchestrator {
    let feed = FailoverFeed::new(vec![Box::new(provider)], config.data_timeout_ms);
    let broker = Arc::new(PaperBroker::new(
        config.initial_capital,
        config.fee_rate,
        config.slip_rate,
    ));
    Orchestrator::new(config, feed, broker).expect("orchestrator init")
}

// ---------------------------------------------------------------------------
// Full cycle, dry run: every stage commits, no orders without auto trading
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_full_cycle_commits_every_stage_without_orders() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let sqlite_path = config.sqlite_path.clone();
    let mut orch = orchestrator_with(config, wave_provider(120));

    orch.start().unwrap();
    let report = orch.run_cycle().await.unwrap();

    assert_eq!(report.disposition, Disposition::Completed);
    assert_eq!(report.verdict.as_deref(), Some("approve"));
    assert_eq!(report.orders_submitted, 0, "auto trading is off by default");
    assert!(!report.degraded);
    drop(orch);

    let log = DurableLog::open(&sqlite_path).unwrap();
    let stages: Vec<String> = log
        .stage_results(&report.cycle_id)
        .unwrap()
        .into_iter()
        .map(|r| r.stage)
        .collect();
    assert_eq!(
        stages,
        vec![
            "regime_detection",
            "factor_discovery",
            "backtesting",
            "risk_assessment",
            "decision",
            "execution",
            "learning",
        ],
        "stages must commit in pipeline order"
    );
}

// ---------------------------------------------------------------------------
// Stand-aside: no usable signal skips execution but still learns
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_flat_market_stands_aside() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let sqlite_path = config.sqlite_path.clone();
    let mut orch = orchestrator_with(config, flat_provider(120));

    orch.start().unwrap();
    let report = orch.run_cycle().await.unwrap();

    assert_eq!(report.disposition, Disposition::StoodAside);
    assert_eq!(report.orders_submitted, 0);

    // The status surface reflects the stand-aside in its learning summary,
    // and no cycle is in flight once the report is back.
    let status = orch.status().unwrap();
    assert_eq!(status.learning.stand_asides, 1);
    assert!(status.cycle.is_none());
    drop(orch);

    let log = DurableLog::open(&sqlite_path).unwrap();
    let stages: Vec<String> = log
        .stage_results(&report.cycle_id)
        .unwrap()
        .into_iter()
        .map(|r| r.stage)
        .collect();
    assert!(!stages.iter().any(|s| s == "execution"));
    assert!(stages.iter().any(|s| s == "learning"));
    assert_eq!(log.learning_summary().unwrap().stand_asides, 1);
}

// ---------------------------------------------------------------------------
// Auto trading: orders fill once, keyed to the cycle, book persisted
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_auto_trading_submits_keyed_orders() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.auto_trading = true;
    let sqlite_path = config.sqlite_path.clone();
    let mut orch = orchestrator_with(config, wave_provider(120));

    orch.start().unwrap();
    let report = orch.run_cycle().await.unwrap();

    assert_eq!(report.disposition, Disposition::Completed);
    assert_eq!(report.orders_submitted, 1);
    assert!(report.equity < 100_000.0, "fees and slippage cost something");
    assert!(report.equity > 99_000.0);
    drop(orch);

    let log = DurableLog::open(&sqlite_path).unwrap();
    let rows = log.stage_results(&report.cycle_id).unwrap();
    let exec = rows.iter().find(|r| r.stage == "execution").unwrap();
    assert_eq!(
        exec.payload["output"]["data"]["receipts"][0]["idempotency_key"],
        format!("{}-execution-0", report.cycle_id)
    );

    // The book survives the process: the durable tier holds the snapshot.
    let snapshot = log.kv_get("portfolio").unwrap().unwrap();
    let portfolio: PortfolioState = serde_json::from_value(snapshot).unwrap();
    assert_eq!(portfolio.positions.len(), 1);
}

// ---------------------------------------------------------------------------
// Kill file: engaged file halts before any stage runs
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_kill_file_halts_with_exit_code_two() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    fs::write(&config.kill_file, b"stop").unwrap();
    let mut orch = orchestrator_with(config.clone(), wave_provider(120));

    orch.start().unwrap();
    let err = orch.run_cycle().await.unwrap_err();
    assert!(matches!(err, PipelineError::SystemHalted(_)));
    assert_eq!(err.exit_code(), 2);
    assert_eq!(orch.mode(), SystemMode::EmergencyStop);
    drop(orch);

    // The halt is durable: a fresh process comes up stopped and stays
    // stopped until an explicit reset.
    let mut fresh = orchestrator_with(config, wave_provider(120));
    assert_eq!(fresh.mode(), SystemMode::EmergencyStop);
    assert!(matches!(
        fresh.start(),
        Err(PipelineError::SystemHalted(_))
    ));
    fresh.reset().unwrap();
    assert_eq!(fresh.mode(), SystemMode::Idle);
    fresh.start().unwrap();
    assert_eq!(fresh.mode(), SystemMode::Running);
}

// ---------------------------------------------------------------------------
// Daily loss: a book past the limit halts the cycle at the guard
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_daily_loss_breach_halts_system() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let sqlite_path = config.sqlite_path.clone();

    // Seed a book already 3% down on the day against a 2% limit.
    {
        let mut log = DurableLog::open(&sqlite_path).unwrap();
        let book = PortfolioState {
            cash: 97_000.0,
            positions: Vec::new(),
            equity: 97_000.0,
            peak_equity: 100_000.0,
            day_start_equity: 100_000.0,
            updated_ts: 0,
        };
        log.kv_put("portfolio", &serde_json::to_value(&book).unwrap(), 0)
            .unwrap();
    }

    let mut orch = orchestrator_with(config, wave_provider(120));
    orch.start().unwrap();
    let report = orch.run_cycle().await.unwrap();

    assert_eq!(report.disposition, Disposition::Halted);
    assert_eq!(orch.mode(), SystemMode::EmergencyStop);

    // Running again without a reset is refused as halted.
    let err = orch.run_cycle().await.unwrap_err();
    assert_eq!(err.exit_code(), 2);

    // The breach is visible through the status surface without touching
    // the database directly.
    let status = orch.status().unwrap();
    assert!(status
        .recent_risk_events
        .iter()
        .any(|e| e.rule == "daily_loss" && e.severity == Severity::Critical));
    drop(orch);

    let log = DurableLog::open(&sqlite_path).unwrap();
    let critical = log.risk_events(Severity::Critical, 10).unwrap();
    assert_eq!(critical.len(), 1);
    assert_eq!(critical[0].rule, "daily_loss");
    // The halted cycle never reaches execution or learning.
    let stages: Vec<String> = log
        .stage_results(&report.cycle_id)
        .unwrap()
        .into_iter()
        .map(|r| r.stage)
        .collect();
    assert!(!stages.iter().any(|s| s == "execution"));
    assert!(!stages.iter().any(|s| s == "learning"));
}

// ---------------------------------------------------------------------------
// Recovery: an interrupted execution stage is aborted, never replayed
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_recovery_never_replays_execution() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let wal_path = config.wal_path.clone();

    // Journal shows a crash after the execution token was written.
    {
        let mut wal = CycleWal::open(&wal_path).unwrap();
        wal.append(&WalEntry::CycleStart {
            cycle_id: "c-dead-0001".to_string(),
            ts: 1,
        })
        .unwrap();
        wal.append(&WalEntry::ExecToken {
            cycle_id: "c-dead-0001".to_string(),
            key: "c-dead-0001-execution-0".to_string(),
            ts: 2,
        })
        .unwrap();
    }

    let mut orch = orchestrator_with(config, flat_provider(120));
    orch.start().unwrap();

    // Startup closed the dead cycle; the journal has no open cycle left.
    assert!(CycleWal::recover_from(Path::new(&wal_path))
        .unwrap()
        .is_none());

    // The next cycle is a fresh one.
    let report = orch.run_cycle().await.unwrap();
    assert_ne!(report.cycle_id, "c-dead-0001");
    assert_eq!(report.disposition, Disposition::StoodAside);
}

// ---------------------------------------------------------------------------
// Recovery: committed stages are rehydrated, not re-run
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_recovery_resumes_from_last_committed_stage() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let sqlite_path = config.sqlite_path.clone();
    let wal_path = config.wal_path.clone();
    let cycle_id = "c-resume-0001";

    // A crash after the regime stage committed: result in the durable log,
    // commit in the journal, nothing after.
    {
        let mut log = DurableLog::open(&sqlite_path).unwrap();
        log.record_cycle_start(cycle_id, 1).unwrap();
        let result = AgentResult {
            agent: "regime".to_string(),
            output: AgentOutput::Regime(RegimeReport {
                regime: Regime::LowVolBull,
                confidence: 0.7,
                volatility: 0.005,
                mean_return: 0.001,
            }),
            confidence: 0.7,
            degraded: false,
            ts: 1,
        };
        log.append_stage_result(
            cycle_id,
            "regime_detection",
            "regime",
            &serde_json::to_value(&result).unwrap(),
            1,
        )
        .unwrap();

        let mut wal = CycleWal::open(&wal_path).unwrap();
        wal.append(&WalEntry::CycleStart {
            cycle_id: cycle_id.to_string(),
            ts: 1,
        })
        .unwrap();
        wal.append(&WalEntry::StageCommit {
            cycle_id: cycle_id.to_string(),
            stage: "regime_detection".to_string(),
            ts: 1,
        })
        .unwrap();
    }

    let mut orch = orchestrator_with(config, flat_provider(120));
    orch.start().unwrap();
    let report = orch.run_cycle().await.unwrap();

    // The interrupted cycle finished under its original id.
    assert_eq!(report.cycle_id, cycle_id);

    // The regime agent was never invoked again; the later agents were.
    let status = orch.status().unwrap();
    assert!(status.agent_invocations.get("regime").is_none());
    assert_eq!(status.agent_invocations.get("factor_discovery"), Some(&1));
    drop(orch);

    // Exactly one regime result exists for the cycle.
    let log = DurableLog::open(&sqlite_path).unwrap();
    let stages: Vec<String> = log
        .stage_results(cycle_id)
        .unwrap()
        .into_iter()
        .map(|r| r.stage)
        .collect();
    assert_eq!(
        stages.iter().filter(|s| *s == "regime_detection").count(),
        1
    );
    assert!(stages.iter().any(|s| s == "learning"));
}

// ---------------------------------------------------------------------------
// Learning: the next cycle reconciles the previous prediction
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_second_cycle_reconciles_first_prediction() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let sqlite_path = config.sqlite_path.clone();
    let mut orch = orchestrator_with(config, wave_provider(120));

    orch.start().unwrap();
    let first = orch.run_cycle().await.unwrap();
    assert_eq!(first.disposition, Disposition::Completed);
    let second = orch.run_cycle().await.unwrap();
    assert_eq!(second.disposition, Disposition::Completed);
    drop(orch);

    let log = DurableLog::open(&sqlite_path).unwrap();
    let records = log.recent_learning_records(10).unwrap();
    // Prices did not move between cycles, so the first prediction settles
    // as a loss under its own cycle id.
    let settled = records
        .iter()
        .find(|r| r.cycle_id == first.cycle_id)
        .expect("first cycle reconciled");
    assert_eq!(settled.factor.as_deref(), Some("momentum_20"));
    assert!((settled.realized_return).abs() < 1e-9);

    let score = log.factor_score("momentum_20").unwrap().unwrap();
    assert_eq!(score.samples, 1);
    assert_eq!(score.loss_streak, 1);
    assert!(!score.excluded);
}

// ---------------------------------------------------------------------------
// Degraded data: a dead feed stands the cycle aside instead of crashing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_dead_feed_degrades_and_stands_aside() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let feed = FailoverFeed::new(
        vec![Box::new(FlakyProvider::new(
            u32::MAX,
            flat_provider(120),
        ))],
        config.data_timeout_ms,
    );
    let broker = Arc::new(PaperBroker::new(100_000.0, 0.0004, 0.0002));
    let mut orch = Orchestrator::new(config, feed, broker).unwrap();

    orch.start().unwrap();
    let report = orch.run_cycle().await.unwrap();

    assert!(report.degraded);
    assert_eq!(report.disposition, Disposition::StoodAside);
    assert_eq!(report.orders_submitted, 0);
    assert_eq!(orch.mode(), SystemMode::Running, "degraded is not halted");
}

// ---------------------------------------------------------------------------
// Mode transitions: pause blocks cycles, resume re-enables them
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_pause_blocks_cycles_until_resume() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let mut orch = orchestrator_with(config, flat_provider(120));

    assert!(matches!(
        orch.pause(),
        Err(PipelineError::InvalidTransition { .. })
    ));
    orch.start().unwrap();
    assert!(matches!(orch.start(), Err(PipelineError::AlreadyRunning)));

    orch.pause().unwrap();
    let err = orch.run_cycle().await.unwrap_err();
    assert!(matches!(err, PipelineError::InvalidTransition { .. }));
    assert_eq!(err.exit_code(), 1);

    orch.resume().unwrap();
    assert!(orch.run_cycle().await.is_ok());
}

// ---------------------------------------------------------------------------
// Mode transitions: a paused system stays paused across a restart
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_pause_survives_restart() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);

    let mut orch = orchestrator_with(config.clone(), flat_provider(120));
    orch.start().unwrap();
    orch.pause().unwrap();
    drop(orch);

    // A fresh process comes up paused, refuses to start, and only runs
    // again after an explicit resume.
    let mut fresh = orchestrator_with(config.clone(), flat_provider(120));
    assert_eq!(fresh.mode(), SystemMode::Paused);
    assert!(matches!(
        fresh.start(),
        Err(PipelineError::InvalidTransition { .. })
    ));
    fresh.resume().unwrap();
    assert_eq!(fresh.mode(), SystemMode::Running);
    assert!(fresh.run_cycle().await.is_ok());
    drop(fresh);

    // The resume cleared the flag durably too.
    let idle = orchestrator_with(config, flat_provider(120));
    assert_eq!(idle.mode(), SystemMode::Idle);
}

// ---------------------------------------------------------------------------
// Kill file: engagement while a cycle is in flight stops it before orders
// ---------------------------------------------------------------------------

/// Wraps the static provider and engages the kill file during the price
/// fetch, after the cycle-start check has already passed.
struct KillSwitchProvider {
    inner: StaticProvider,
    kill_file: String,
}

#[async_trait]
impl MarketDataProvider for KillSwitchProvider {
    fn name(&self) -> &'static str {
        "killswitch"
    }

    async fn get_historical(
        &self,
        symbols: &[String],
        bars: usize,
    ) -> anyhow::Result<HashMap<String, Vec<Bar>>> {
        self.inner.get_historical(symbols, bars).await
    }

    async fn get_latest_prices(&self, symbols: &[String]) -> anyhow::Result<HashMap<String, f64>> {
        fs::write(&self.kill_file, b"stop")?;
        self.inner.get_latest_prices(symbols).await
    }
}

#[tokio::test]
async fn test_kill_file_engaged_mid_cycle_halts_before_orders() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.auto_trading = true;
    let sqlite_path = config.sqlite_path.clone();
    let provider = KillSwitchProvider {
        inner: wave_provider(120),
        kill_file: config.kill_file.clone(),
    };
    let feed = FailoverFeed::new(vec![Box::new(provider)], config.data_timeout_ms);
    let broker = Arc::new(PaperBroker::new(
        config.initial_capital,
        config.fee_rate,
        config.slip_rate,
    ));
    let mut orch = Orchestrator::new(config, feed, broker).unwrap();

    orch.start().unwrap();
    let report = orch.run_cycle().await.unwrap();

    // The wave data produces a tradable decision, but the pre-submission
    // kill check fires first.
    assert_eq!(report.disposition, Disposition::Halted);
    assert_eq!(report.orders_submitted, 0);
    assert_eq!(orch.mode(), SystemMode::EmergencyStop);
    drop(orch);

    let log = DurableLog::open(&sqlite_path).unwrap();
    let stages: Vec<String> = log
        .stage_results(&report.cycle_id)
        .unwrap()
        .into_iter()
        .map(|r| r.stage)
        .collect();
    assert!(stages.iter().any(|s| s == "decision"));
    assert!(!stages.iter().any(|s| s == "execution"));
}

// ---------------------------------------------------------------------------
// Recovery: a rehydrated execution result is not applied to the book again
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_resumed_cycle_does_not_reapply_fills() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.auto_trading = true;
    let sqlite_path = config.sqlite_path.clone();
    let wal_path = config.wal_path.clone();
    let cycle_id = "c-crash-0001";

    // A crash landed after the execution stage committed and the filled
    // book was persisted, but before the learning stage. The durable state
    // below is exactly what that crash leaves behind: 70 units held, and an
    // execution result carrying the same 70-unit receipt.
    {
        let mut log = DurableLog::open(&sqlite_path).unwrap();
        log.record_cycle_start(cycle_id, 1).unwrap();

        let book = PortfolioState {
            cash: 93_000.0,
            positions: vec![Position {
                symbol: "BTCUSDT".to_string(),
                qty: 70.0,
                entry_price: 100.0,
                last_price: 100.0,
            }],
            equity: 100_000.0,
            peak_equity: 100_000.0,
            day_start_equity: 100_000.0,
            updated_ts: 2,
        };
        log.kv_put("portfolio", &serde_json::to_value(&book).unwrap(), 2)
            .unwrap();

        let stage_result = |agent: &str, output: AgentOutput| AgentResult {
            agent: agent.to_string(),
            output,
            confidence: 0.7,
            degraded: false,
            ts: 1,
        };
        let seeds = vec![
            (
                "regime_detection",
                "regime",
                serde_json::to_value(stage_result(
                    "regime",
                    AgentOutput::Regime(RegimeReport {
                        regime: Regime::LowVolBull,
                        confidence: 0.7,
                        volatility: 0.005,
                        mean_return: 0.001,
                    }),
                ))
                .unwrap(),
            ),
            (
                "factor_discovery",
                "factor_discovery",
                serde_json::to_value(stage_result(
                    "factor_discovery",
                    AgentOutput::Factors(vec![Factor::new(FactorKind::Momentum, 20)]),
                ))
                .unwrap(),
            ),
            (
                "backtesting",
                "backtest",
                serde_json::to_value(stage_result(
                    "backtest",
                    AgentOutput::Backtests(vec![FactorReport {
                        factor: Factor::new(FactorKind::Momentum, 20),
                        ic: 0.6,
                        sharpe: 1.2,
                        max_drawdown: 0.05,
                        win_rate: 0.6,
                        samples: 90,
                        useful: true,
                        predicted_return: 0.01,
                    }]),
                ))
                .unwrap(),
            ),
            (
                "risk_assessment",
                "risk_assessment",
                serde_json::to_value(stage_result(
                    "risk_assessment",
                    AgentOutput::Assessment(RiskAssessment {
                        leverage: 0.07,
                        daily_loss_pct: 0.0,
                        concentration: 0.07,
                        drawdown: 0.0,
                        max_correlation: 0.0,
                        violations: Vec::new(),
                    }),
                ))
                .unwrap(),
            ),
            (
                "decision",
                "orchestrator",
                serde_json::json!({"decisions": [], "verdict": {"verdict": "approve"}}),
            ),
            (
                "execution",
                "execution",
                serde_json::to_value(stage_result(
                    "execution",
                    AgentOutput::Execution(ExecutionReport {
                        receipts: vec![OrderReceipt {
                            idempotency_key: format!("{}-execution-0", cycle_id),
                            symbol: "BTCUSDT".to_string(),
                            side: Side::Buy,
                            qty: 70.0,
                            fill_price: 100.0,
                            fee: 2.8,
                            ts: 2,
                        }],
                        skipped: false,
                        reason: None,
                    }),
                ))
                .unwrap(),
            ),
        ];

        let mut wal = CycleWal::open(&wal_path).unwrap();
        wal.append(&WalEntry::CycleStart {
            cycle_id: cycle_id.to_string(),
            ts: 1,
        })
        .unwrap();
        for (stage, agent, payload) in &seeds {
            log.append_stage_result(cycle_id, stage, agent, payload, 1)
                .unwrap();
            if *stage == "execution" {
                wal.append(&WalEntry::ExecToken {
                    cycle_id: cycle_id.to_string(),
                    key: format!("{}-execution-0", cycle_id),
                    ts: 2,
                })
                .unwrap();
            }
            wal.append(&WalEntry::StageCommit {
                cycle_id: cycle_id.to_string(),
                stage: stage.to_string(),
                ts: 2,
            })
            .unwrap();
        }
    }

    let mut orch = orchestrator_with(config, flat_provider(120));
    orch.start().unwrap();
    let report = orch.run_cycle().await.unwrap();

    assert_eq!(report.cycle_id, cycle_id);
    assert_eq!(report.disposition, Disposition::Completed);
    // The rehydrated receipt still counts as a submitted order, but the
    // execution agent itself never ran again.
    assert_eq!(report.orders_submitted, 1);
    let status = orch.status().unwrap();
    assert!(status.agent_invocations.get("execution").is_none());
    drop(orch);

    // The position is still the 70 units the crash left behind, not 140.
    let log = DurableLog::open(&sqlite_path).unwrap();
    let snapshot = log.kv_get("portfolio").unwrap().unwrap();
    let book: PortfolioState = serde_json::from_value(snapshot).unwrap();
    assert_eq!(book.positions.len(), 1);
    assert!((book.positions[0].qty - 70.0).abs() < 1e-9);
    assert!((book.equity - 100_000.0).abs() < 1.0);
}

// ---------------------------------------------------------------------------
// Guard scaling: adding to a held position lands on the cap, not past it
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_second_buy_scales_to_position_cap() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.auto_trading = true;
    let sqlite_path = config.sqlite_path.clone();
    let mut orch = orchestrator_with(config, wave_provider(120));

    orch.start().unwrap();
    // First buy takes ~7% of equity. The second proposal would double it,
    // so the guard scales the order down to land on the 10% cap.
    let first = orch.run_cycle().await.unwrap();
    assert_eq!(first.verdict.as_deref(), Some("approve"));
    let second = orch.run_cycle().await.unwrap();
    assert_eq!(second.disposition, Disposition::Completed);
    assert_eq!(second.verdict.as_deref(), Some("modify"));
    assert_eq!(second.orders_submitted, 1);
    drop(orch);

    let log = DurableLog::open(&sqlite_path).unwrap();
    let snapshot = log.kv_get("portfolio").unwrap().unwrap();
    let book: PortfolioState = serde_json::from_value(snapshot).unwrap();
    assert_eq!(book.positions.len(), 1);
    let concentration = book.positions[0].qty.abs() * book.positions[0].last_price / book.equity;
    assert!(concentration > 0.095, "second buy was not dropped entirely");
    assert!(concentration < 0.1005, "book must not exceed the position cap");
}
