//! Cycle orchestration.
//!
//! The orchestrator owns the system mode, drives the stage graph, and is the
//! only component that commits stage results. Each commit lands in the
//! durable log and the journal before the next stage starts, so a crash
//! resumes from the last committed stage. The execution stage is fenced by a
//! journal token and is never replayed.

pub mod cycle;
pub mod retry;
pub mod wal;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::MutexGuard;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::{sleep, timeout, Duration};

use crate::agent::{
    Agent, AgentContext, AgentOutput, AgentResult, BacktestAgent, Decision, ExecutionAgent,
    ExecutionReport, FactorDiscoveryAgent, RegimeAgent, RiskAssessmentAgent,
};
use crate::broker::{BrokerAdapter, Side};
use crate::config::{now_ts, Config};
use crate::data::{max_pairwise_correlation, FailoverFeed};
use crate::error::PipelineError;
use crate::learning::LearningLoop;
use crate::logging::{
    self, log_cycle_end, log_learning, log_mode_transition, log_stage_commit, log_stage_retry,
    log_verdict, obj, v_str, Domain, Level,
};
use crate::memory::{DurableLog, LearningSummary, MemoryStore, RiskEvent, Severity, Tier};
use crate::portfolio::PortfolioState;
use crate::risk::{self, kill_engaged, most_conservative, RiskContext, TradeIntent, Verdict};

pub use cycle::{Disposition, Stage, SystemMode};
pub use retry::RetryConfig;
pub use wal::{CycleWal, RecoveredCycle, WalEntry};

const PORTFOLIO_KEY: &str = "portfolio";
const PENDING_KEY: &str = "pending_prediction";
const HALT_KEY: &str = "halt";
const PAUSED_KEY: &str = "paused";

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle_id: String,
    pub disposition: Disposition,
    pub verdict: Option<String>,
    pub orders_submitted: usize,
    pub equity: f64,
    pub degraded: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub mode: SystemMode,
    pub halt_reason: Option<String>,
    pub cycle: Option<String>,
    pub stage: Option<String>,
    pub cycles_run: u64,
    pub equity: f64,
    pub positions: usize,
    pub agent_invocations: HashMap<String, u64>,
    pub excluded_factors: Vec<String>,
    pub recent_risk_events: Vec<RiskEvent>,
    pub learning: LearningSummary,
}

/// What the last acted-on cycle predicted, persisted so the next cycle can
/// reconcile it against what the market actually did.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PendingPrediction {
    cycle_id: String,
    regime: String,
    factor: String,
    symbol: String,
    /// +1 long, -1 short; realized return is measured in this direction.
    direction: f64,
    predicted_return: f64,
    price: f64,
}

fn mem_err(e: anyhow::Error) -> PipelineError {
    PipelineError::StageAbort {
        stage: "memory",
        reason: e.to_string(),
    }
}

pub struct Orchestrator {
    config: Config,
    memory: MemoryStore,
    wal: CycleWal,
    feed: FailoverFeed,
    regime: Arc<dyn Agent>,
    factor: Arc<dyn Agent>,
    backtest: Arc<dyn Agent>,
    assess: Arc<dyn Agent>,
    execution: Arc<dyn Agent>,
    learning: LearningLoop,
    retry: RetryConfig,
    mode: SystemMode,
    halt_reason: Option<String>,
    portfolio: PortfolioState,
    resume: Option<RecoveredCycle>,
    invocations: HashMap<String, u64>,
    active_cycle: Option<String>,
    active_stage: Option<&'static str>,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        feed: FailoverFeed,
        broker: Arc<dyn BrokerAdapter>,
    ) -> Result<Self, PipelineError> {
        let memory = MemoryStore::open(&config.sqlite_path).map_err(mem_err)?;
        let wal = CycleWal::open(&config.wal_path)?;

        let portfolio = memory
            .get(PORTFOLIO_KEY)
            .map_err(mem_err)?
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_else(|| PortfolioState::new(config.initial_capital));

        let halt_reason = memory
            .get(HALT_KEY)
            .map_err(mem_err)?
            .filter(|v| !v.is_null())
            .and_then(|v| v["reason"].as_str().map(|s| s.to_string()));
        let paused = memory
            .get(PAUSED_KEY)
            .map_err(mem_err)?
            .filter(|v| !v.is_null())
            .is_some();
        let mode = if halt_reason.is_some() {
            SystemMode::EmergencyStop
        } else if paused {
            SystemMode::Paused
        } else {
            SystemMode::Idle
        };

        let learning = LearningLoop::new(config.learning_decay, config.exclusion_streak);
        let retry = RetryConfig::new(config.stage_retries + 1, config.retry_base_delay_ms);

        Ok(Self {
            config,
            memory,
            wal,
            feed,
            regime: Arc::new(RegimeAgent),
            factor: Arc::new(FactorDiscoveryAgent),
            backtest: Arc::new(BacktestAgent),
            assess: Arc::new(RiskAssessmentAgent),
            execution: Arc::new(ExecutionAgent::new(broker)),
            learning,
            retry,
            mode,
            halt_reason,
            portfolio,
            resume: None,
            invocations: HashMap::new(),
            active_cycle: None,
            active_stage: None,
        })
    }

    fn store(&self) -> Result<MutexGuard<'_, DurableLog>, PipelineError> {
        self.memory.log().map_err(mem_err)
    }

    // =========================================================================
    // Mode transitions
    // =========================================================================

    pub fn mode(&self) -> SystemMode {
        self.mode
    }

    /// Idle -> Running. Also replays the journal: an interrupted cycle that
    /// had entered execution is closed as aborted here, never re-run.
    pub fn start(&mut self) -> Result<(), PipelineError> {
        match self.mode {
            SystemMode::Idle => {}
            SystemMode::Running => return Err(PipelineError::AlreadyRunning),
            SystemMode::EmergencyStop => {
                return Err(PipelineError::SystemHalted(
                    self.halt_reason.clone().unwrap_or_default(),
                ))
            }
            other => {
                return Err(PipelineError::InvalidTransition {
                    op: "start",
                    mode: other.as_str().to_string(),
                })
            }
        }

        if let Some(rec) = self.wal.recover()? {
            if rec.exec_started && !rec.committed.iter().any(|s| s == Stage::Execution.as_str()) {
                logging::log(
                    Level::Warn,
                    Domain::Cycle,
                    "recovery_abort",
                    obj(&[
                        ("cycle_id", v_str(&rec.cycle_id)),
                        ("reason", v_str("execution entered but not committed")),
                    ]),
                );
                self.close_cycle(&rec.cycle_id, Disposition::Aborted)?;
            } else {
                logging::log(
                    Level::Info,
                    Domain::Cycle,
                    "recovery_resume",
                    obj(&[
                        ("cycle_id", v_str(&rec.cycle_id)),
                        ("stages", json!(rec.committed.clone())),
                    ]),
                );
                self.resume = Some(rec);
            }
        }

        log_mode_transition("idle", "running", "start");
        self.mode = SystemMode::Running;
        Ok(())
    }

    /// Persisted like the halt flag, so a paused system comes back paused
    /// after a restart.
    pub fn pause(&mut self) -> Result<(), PipelineError> {
        match self.mode {
            SystemMode::Running => {
                log_mode_transition("running", "paused", "pause");
                self.memory
                    .put(PAUSED_KEY, json!({"ts": now_ts()}), Tier::Durable)
                    .map_err(mem_err)?;
                self.mode = SystemMode::Paused;
                Ok(())
            }
            other => Err(PipelineError::InvalidTransition {
                op: "pause",
                mode: other.as_str().to_string(),
            }),
        }
    }

    pub fn resume(&mut self) -> Result<(), PipelineError> {
        match self.mode {
            SystemMode::Paused => {
                log_mode_transition("paused", "running", "resume");
                self.memory
                    .put(PAUSED_KEY, Value::Null, Tier::Durable)
                    .map_err(mem_err)?;
                self.mode = SystemMode::Running;
                Ok(())
            }
            other => Err(PipelineError::InvalidTransition {
                op: "resume",
                mode: other.as_str().to_string(),
            }),
        }
    }

    /// Reachable from any mode; persisted so a restart stays stopped.
    pub fn emergency_stop(&mut self, reason: &str) -> Result<(), PipelineError> {
        log_mode_transition(self.mode.as_str(), "emergency_stop", reason);
        self.mode = SystemMode::EmergencyStop;
        self.halt_reason = Some(reason.to_string());
        self.memory
            .put(
                HALT_KEY,
                json!({"reason": reason, "ts": now_ts()}),
                Tier::Durable,
            )
            .map_err(mem_err)?;
        Ok(())
    }

    /// The only exit from emergency stop: an explicit operator reset. The
    /// daily loss anchor re-bases so the same breach does not instantly
    /// re-trigger, and the cache tier is dropped.
    pub fn reset(&mut self) -> Result<(), PipelineError> {
        match self.mode {
            SystemMode::EmergencyStop => {
                log_mode_transition("emergency_stop", "idle", "reset");
                self.memory
                    .put(HALT_KEY, Value::Null, Tier::Durable)
                    .map_err(mem_err)?;
                self.memory
                    .put(PAUSED_KEY, Value::Null, Tier::Durable)
                    .map_err(mem_err)?;
                self.memory.drop_cache();
                self.portfolio.roll_day();
                self.persist_portfolio()?;
                self.halt_reason = None;
                self.mode = SystemMode::Idle;
                Ok(())
            }
            other => Err(PipelineError::InvalidTransition {
                op: "reset",
                mode: other.as_str().to_string(),
            }),
        }
    }

    pub fn status(&self) -> Result<StatusReport, PipelineError> {
        let log = self.store()?;
        Ok(StatusReport {
            mode: self.mode,
            halt_reason: self.halt_reason.clone(),
            cycle: self.active_cycle.clone(),
            stage: self.active_stage.map(|s| s.to_string()),
            cycles_run: log.cycles_run().map_err(mem_err)?,
            equity: self.portfolio.equity,
            positions: self.portfolio.positions.len(),
            agent_invocations: self.invocations.clone(),
            excluded_factors: log.excluded_factors().map_err(mem_err)?,
            recent_risk_events: log
                .risk_events(Severity::Low, self.config.risk_event_window)
                .map_err(mem_err)?,
            learning: log.learning_summary().map_err(mem_err)?,
        })
    }

    // =========================================================================
    // Cycle driver
    // =========================================================================

    pub async fn run_cycle(&mut self) -> Result<CycleReport, PipelineError> {
        match self.mode {
            SystemMode::Running => {}
            SystemMode::EmergencyStop => {
                return Err(PipelineError::SystemHalted(
                    self.halt_reason.clone().unwrap_or_default(),
                ))
            }
            other => {
                return Err(PipelineError::InvalidTransition {
                    op: "run_cycle",
                    mode: other.as_str().to_string(),
                })
            }
        }
        if kill_engaged(&self.config.kill_file) {
            self.emergency_stop("kill file engaged")?;
            return Err(PipelineError::SystemHalted("kill file engaged".to_string()));
        }

        let resumed = self.resume.take();
        let committed = resumed
            .as_ref()
            .map(|r| r.committed.clone())
            .unwrap_or_default();
        let cycle_id = match &resumed {
            Some(r) => r.cycle_id.clone(),
            None => {
                let n = self.store()?.cycles_run().map_err(mem_err)? + 1;
                format!("c-{}-{:04}", now_ts(), n)
            }
        };

        self.active_cycle = Some(cycle_id.clone());
        self.store()?
            .record_cycle_start(&cycle_id, now_ts())
            .map_err(mem_err)?;
        if resumed.is_none() {
            self.wal.append(&WalEntry::CycleStart {
                cycle_id: cycle_id.clone(),
                ts: now_ts(),
            })?;
        }
        logging::log(
            Level::Info,
            Domain::Cycle,
            "cycle_start",
            obj(&[
                ("cycle_id", v_str(&cycle_id)),
                ("resumed", json!(resumed.is_some())),
            ]),
        );

        let mut ctx = AgentContext::new(
            &cycle_id,
            self.config.symbols.clone(),
            self.portfolio.clone(),
            self.config.limits.clone(),
        );
        ctx.auto_trading = self.config.auto_trading;
        {
            let log = self.store()?;
            ctx.recent_learnings = log.recent_learning_records(20).map_err(mem_err)?;
            ctx.factor_scores = log.all_factor_scores().map_err(mem_err)?;
            ctx.excluded_factors = log.excluded_factors().map_err(mem_err)?;
        }

        // Market data; a total outage degrades the cycle instead of failing it.
        match self
            .feed
            .get_historical(&ctx.symbols, self.config.history_bars)
            .await
        {
            Ok(history) => ctx.history = history,
            Err(e) => {
                ctx.degraded = true;
                logging::log(
                    Level::Warn,
                    Domain::Cycle,
                    "data_degraded",
                    obj(&[("cycle_id", v_str(&cycle_id)), ("reason", v_str(&e.to_string()))]),
                );
            }
        }
        match self.feed.get_latest_prices(&ctx.symbols).await {
            Ok(prices) => {
                self.portfolio.mark(&prices);
                ctx.latest_prices = prices;
                ctx.portfolio = self.portfolio.clone();
            }
            Err(_) => ctx.degraded = true,
        }

        // Stage 1: regime detection.
        let result = match self
            .run_stage(&ctx, Stage::RegimeDetection, Arc::clone(&self.regime), &committed)
            .await
        {
            Ok(r) => r,
            Err(e) => return self.abort_cycle(&cycle_id, &ctx, e),
        };
        apply_output(&mut ctx, &result);

        // Stages 2 and 3: factor discovery and backtesting.
        if self.config.enable_factor_discovery {
            let result = match self
                .run_stage(&ctx, Stage::FactorDiscovery, Arc::clone(&self.factor), &committed)
                .await
            {
                Ok(r) => r,
                Err(e) => return self.abort_cycle(&cycle_id, &ctx, e),
            };
            apply_output(&mut ctx, &result);

            let result = match self
                .run_stage(&ctx, Stage::Backtesting, Arc::clone(&self.backtest), &committed)
                .await
            {
                Ok(r) => r,
                Err(e) => return self.abort_cycle(&cycle_id, &ctx, e),
            };
            apply_output(&mut ctx, &result);
        }

        // Stage 4: risk assessment; breaches land in the risk event log.
        let result = match self
            .run_stage(&ctx, Stage::RiskAssessment, Arc::clone(&self.assess), &committed)
            .await
        {
            Ok(r) => r,
            Err(e) => return self.abort_cycle(&cycle_id, &ctx, e),
        };
        if let AgentOutput::Assessment(assessment) = &result.output {
            for violation in &assessment.violations {
                self.record_risk_event(&cycle_id, Severity::Low, "assessment", violation)?;
            }
        }

        // Stage 5: decision. Owned by the orchestrator, gated by the guard.
        let decision = self.build_decision(&ctx);
        let intents = match &decision {
            Some(d) => intents_for(std::slice::from_ref(d), &ctx.latest_prices),
            None => Vec::new(),
        };
        let correlation = max_pairwise_correlation(&ctx.history, &ctx.symbols);
        let verdict = risk::evaluate(
            &RiskContext {
                portfolio: &self.portfolio,
                intents: &intents,
                observed_correlation: correlation,
            },
            &self.config.limits,
        );
        self.log_guard_verdict(&cycle_id, &verdict)?;

        let mut decisions: Vec<Decision> = Vec::new();
        let stood_aside = decision.is_none();
        let mut vetoed = false;
        match &verdict {
            Verdict::Halt { rule, value, limit } => {
                let reason = format!(
                    "{} at {:.4} breaches limit {:.4}",
                    rule.as_str(),
                    value,
                    limit
                );
                self.commit_decision(&cycle_id, &decisions, &verdict, &committed)?;
                self.emergency_stop(&reason)?;
                return self.finish_cycle(&cycle_id, &ctx, Disposition::Halted, &verdict, 0);
            }
            Verdict::Veto { .. } => {
                vetoed = true;
            }
            Verdict::Modify { scale, .. } => {
                if let Some(mut d) = decision {
                    d.qty *= scale;
                    decisions.push(d);
                }
            }
            Verdict::Approve => {
                if let Some(d) = decision {
                    decisions.push(d);
                }
            }
        }
        self.commit_decision(&cycle_id, &decisions, &verdict, &committed)?;

        // Stage 6: execution. Single attempt, lease held, token journaled
        // first. Skipped entirely on stand-aside or veto.
        let mut orders_submitted = 0;
        if !stood_aside && !vetoed {
            ctx.portfolio = self.portfolio.clone();

            // The kill file may have been engaged while earlier stages ran;
            // check again before any order leaves the process.
            if kill_engaged(&self.config.kill_file) {
                self.emergency_stop("kill file engaged")?;
                return self.finish_cycle(&cycle_id, &ctx, Disposition::Halted, &verdict, 0);
            }

            // The book may have moved since the decision verdict; re-check
            // against final quantities and honor a stricter answer. An equal
            // verdict was already applied at decision time.
            let conservative =
                self.presubmission_verdict(&decisions, &verdict, &ctx.latest_prices, correlation);
            if conservative != verdict {
                match conservative {
                    Verdict::Halt { rule, value, limit } => {
                        let reason = format!(
                            "{} at {:.4} breaches limit {:.4}",
                            rule.as_str(),
                            value,
                            limit
                        );
                        self.emergency_stop(&reason)?;
                        return self.finish_cycle(
                            &cycle_id,
                            &ctx,
                            Disposition::Halted,
                            &verdict,
                            0,
                        );
                    }
                    Verdict::Veto { .. } => {
                        vetoed = true;
                    }
                    Verdict::Modify { scale, .. } => {
                        // Stacks on any decision-time scaling; the stacked
                        // quantity is never looser than either verdict alone.
                        for d in decisions.iter_mut() {
                            d.qty *= scale;
                        }
                    }
                    Verdict::Approve => {}
                }
            }
            ctx.decisions = decisions.clone();

            if !vetoed {
                let _lease = self.memory.acquire_portfolio_lease().ok_or(
                    PipelineError::StageAbort {
                        stage: "execution",
                        reason: "portfolio lease unavailable".to_string(),
                    },
                )?;
                let already_committed =
                    committed.iter().any(|s| s == Stage::Execution.as_str());
                if !already_committed {
                    self.wal.append(&WalEntry::ExecToken {
                        cycle_id: cycle_id.clone(),
                        key: format!("{}-execution-0", cycle_id),
                        ts: now_ts(),
                    })?;
                }
                let result = match self
                    .run_stage(&ctx, Stage::Execution, Arc::clone(&self.execution), &committed)
                    .await
                {
                    Ok(r) => r,
                    Err(e) => return self.abort_cycle(&cycle_id, &ctx, e),
                };
                if let AgentOutput::Execution(report) = &result.output {
                    orders_submitted = report.receipts.len();
                    // A rehydrated execution result was applied and persisted
                    // before the crash; applying it again would double the
                    // fills.
                    if !already_committed {
                        self.apply_execution(report)?;
                    }
                }
            }
        }

        // Stage 7: learning. Reconcile the previous prediction, then queue
        // this cycle's own (or record a stand-aside on the spot).
        if self.config.enable_learning {
            self.run_learning_stage(&cycle_id, &ctx, &decisions, stood_aside || vetoed, &committed)?;
        }

        let disposition = if vetoed {
            Disposition::Vetoed
        } else if stood_aside {
            Disposition::StoodAside
        } else {
            Disposition::Completed
        };
        self.finish_cycle(&cycle_id, &ctx, disposition, &verdict, orders_submitted)
    }

    // =========================================================================
    // Stage plumbing
    // =========================================================================

    /// Run one agent stage with timeout and bounded retry, committing the
    /// result on success. Only timeouts and errors marked transient earn
    /// another attempt; anything else aborts without touching the retry
    /// budget. A stage the journal already shows committed is rehydrated
    /// from the durable log instead of re-run.
    async fn run_stage(
        &mut self,
        ctx: &AgentContext,
        stage: Stage,
        agent: Arc<dyn Agent>,
        committed: &[String],
    ) -> Result<AgentResult, PipelineError> {
        if committed.iter().any(|s| s == stage.as_str()) {
            let rows = self
                .store()?
                .stage_results(&ctx.cycle_id)
                .map_err(mem_err)?;
            if let Some(row) = rows.into_iter().find(|r| r.stage == stage.as_str()) {
                if let Ok(result) = serde_json::from_value::<AgentResult>(row.payload) {
                    logging::log(
                        Level::Info,
                        Domain::Stage,
                        "stage_rehydrated",
                        obj(&[
                            ("cycle_id", v_str(&ctx.cycle_id)),
                            ("stage", v_str(stage.as_str())),
                        ]),
                    );
                    return Ok(result);
                }
            }
            return Err(PipelineError::StageAbort {
                stage: stage.as_str(),
                reason: "journaled stage result missing from durable log".to_string(),
            });
        }

        let max_attempts = if stage.retryable() {
            self.config.stage_retries + 1
        } else {
            1
        };
        let stage_timeout = Duration::from_secs(self.config.stage_timeout_secs);
        let mut reason = String::new();
        for attempt in 0..max_attempts {
            match timeout(stage_timeout, agent.execute(ctx)).await {
                Ok(Ok(result)) => {
                    self.commit_stage(&ctx.cycle_id, stage, &result)?;
                    return Ok(result);
                }
                Ok(Err(e)) => {
                    reason = e.to_string();
                    let transient = e
                        .downcast_ref::<PipelineError>()
                        .map(PipelineError::is_transient)
                        .unwrap_or(false);
                    if !transient {
                        return Err(PipelineError::StageAbort {
                            stage: stage.as_str(),
                            reason,
                        });
                    }
                }
                Err(_) => {
                    reason = format!("timed out after {}s", self.config.stage_timeout_secs)
                }
            }
            if attempt + 1 < max_attempts {
                log_stage_retry(&ctx.cycle_id, stage.as_str(), attempt + 1, &reason);
                sleep(self.retry.delay_for(attempt)).await;
            }
        }
        Err(PipelineError::StageAbort {
            stage: stage.as_str(),
            reason,
        })
    }

    /// Evaluate the final order quantities against the current book and
    /// return the stricter of the decision-time verdict and the fresh one.
    fn presubmission_verdict(
        &self,
        decisions: &[Decision],
        verdict: &Verdict,
        prices: &HashMap<String, f64>,
        correlation: f64,
    ) -> Verdict {
        let intents = intents_for(decisions, prices);
        let recheck = risk::evaluate(
            &RiskContext {
                portfolio: &self.portfolio,
                intents: &intents,
                observed_correlation: correlation,
            },
            &self.config.limits,
        );
        most_conservative(vec![verdict.clone(), recheck])
    }

    fn commit_stage(
        &mut self,
        cycle_id: &str,
        stage: Stage,
        result: &AgentResult,
    ) -> Result<(), PipelineError> {
        let payload = serde_json::to_value(result).map_err(|e| PipelineError::StageAbort {
            stage: stage.as_str(),
            reason: e.to_string(),
        })?;
        self.store()?
            .append_stage_result(cycle_id, stage.as_str(), &result.agent, &payload, now_ts())
            .map_err(|_| PipelineError::DuplicateStageResult {
                cycle_id: cycle_id.to_string(),
                stage: stage.as_str().to_string(),
            })?;
        self.wal.append(&WalEntry::StageCommit {
            cycle_id: cycle_id.to_string(),
            stage: stage.as_str().to_string(),
            ts: now_ts(),
        })?;
        log_stage_commit(
            cycle_id,
            stage.as_str(),
            &result.agent,
            result.confidence,
            result.degraded,
        );
        *self.invocations.entry(result.agent.clone()).or_insert(0) += 1;
        self.active_stage = Some(stage.as_str());
        Ok(())
    }

    fn commit_decision(
        &mut self,
        cycle_id: &str,
        decisions: &[Decision],
        verdict: &Verdict,
        committed: &[String],
    ) -> Result<(), PipelineError> {
        if committed.iter().any(|s| s == Stage::Decision.as_str()) {
            return Ok(());
        }
        let payload = json!({"decisions": decisions, "verdict": verdict});
        self.store()?
            .append_stage_result(
                cycle_id,
                Stage::Decision.as_str(),
                "orchestrator",
                &payload,
                now_ts(),
            )
            .map_err(|_| PipelineError::DuplicateStageResult {
                cycle_id: cycle_id.to_string(),
                stage: Stage::Decision.as_str().to_string(),
            })?;
        self.wal.append(&WalEntry::StageCommit {
            cycle_id: cycle_id.to_string(),
            stage: Stage::Decision.as_str().to_string(),
            ts: now_ts(),
        })?;
        log_stage_commit(cycle_id, Stage::Decision.as_str(), "orchestrator", 1.0, false);
        self.active_stage = Some(Stage::Decision.as_str());
        Ok(())
    }

    /// Pick the single best validated factor and size a position off it.
    /// Returns `None` when nothing clears the usefulness and confidence
    /// bars, which sends the cycle down the stand-aside path.
    fn build_decision(&self, ctx: &AgentContext) -> Option<Decision> {
        let best = ctx
            .reports
            .iter()
            .filter(|r| r.useful)
            .max_by(|a, b| {
                a.ic
                    .partial_cmp(&b.ic)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| b.factor.name.cmp(&a.factor.name))
            })?;
        let confidence = ctx.regime.as_ref().map(|r| r.confidence).unwrap_or(0.0);
        if confidence < self.config.min_confidence {
            return None;
        }
        let symbol = ctx.primary_symbol.clone();
        let price = *ctx.latest_prices.get(&symbol)?;
        if price <= 0.0 {
            return None;
        }
        let side = if best.predicted_return >= 0.0 {
            Side::Buy
        } else {
            Side::Sell
        };
        let notional =
            ctx.portfolio.equity * self.config.limits.max_position_pct * confidence.min(1.0);
        let qty = notional / price;
        if qty <= 0.0 {
            return None;
        }
        Some(Decision {
            symbol,
            side,
            qty,
            factor: best.factor.name.clone(),
            confidence,
            predicted_return: best.predicted_return.abs(),
        })
    }

    fn apply_execution(&mut self, report: &ExecutionReport) -> Result<(), PipelineError> {
        for receipt in &report.receipts {
            let signed = match receipt.side {
                Side::Buy => receipt.qty,
                Side::Sell => -receipt.qty,
            };
            self.portfolio
                .apply_fill(&receipt.symbol, signed, receipt.fill_price, receipt.fee);
        }
        if !report.receipts.is_empty() {
            self.persist_portfolio()?;
        }
        Ok(())
    }

    fn persist_portfolio(&self) -> Result<(), PipelineError> {
        let snapshot = serde_json::to_value(&self.portfolio).map_err(|e| {
            PipelineError::StageAbort {
                stage: "memory",
                reason: e.to_string(),
            }
        })?;
        self.memory
            .put(PORTFOLIO_KEY, snapshot, Tier::Durable)
            .map_err(mem_err)
    }

    fn run_learning_stage(
        &mut self,
        cycle_id: &str,
        ctx: &AgentContext,
        decisions: &[Decision],
        stood_aside: bool,
        committed: &[String],
    ) -> Result<(), PipelineError> {
        if committed.iter().any(|s| s == Stage::Learning.as_str()) {
            return Ok(());
        }

        let pending: Option<PendingPrediction> = self
            .memory
            .get(PENDING_KEY)
            .map_err(mem_err)?
            .filter(|v| !v.is_null())
            .and_then(|v| serde_json::from_value(v).ok());

        let mut reconciled: Option<String> = None;
        if let Some(p) = &pending {
            let realized = ctx
                .latest_prices
                .get(&p.symbol)
                .filter(|_| p.price > 0.0)
                .map(|px| p.direction * (px / p.price - 1.0))
                .unwrap_or(0.0);
            let rec = self.learning.reconcile(
                &p.cycle_id,
                &p.regime,
                Some(&p.factor),
                p.predicted_return,
                realized,
                false,
            );
            {
                let mut log = self.store()?;
                self.learning.apply(&mut log, &rec).map_err(mem_err)?;
            }
            log_learning(&p.cycle_id, &p.factor, rec.prediction_error, rec.outcome.as_str());
            reconciled = Some(p.cycle_id.clone());
        }

        if stood_aside {
            let rec =
                self.learning
                    .reconcile(cycle_id, ctx.regime_label(), None, 0.0, 0.0, true);
            {
                let mut log = self.store()?;
                self.learning.apply(&mut log, &rec).map_err(mem_err)?;
            }
            self.memory
                .put(PENDING_KEY, Value::Null, Tier::Durable)
                .map_err(mem_err)?;
        } else if let Some(d) = decisions.first() {
            let price = ctx.latest_prices.get(&d.symbol).copied().unwrap_or(0.0);
            let next = PendingPrediction {
                cycle_id: cycle_id.to_string(),
                regime: ctx.regime_label().to_string(),
                factor: d.factor.clone(),
                symbol: d.symbol.clone(),
                direction: match d.side {
                    Side::Buy => 1.0,
                    Side::Sell => -1.0,
                },
                predicted_return: d.predicted_return,
                price,
            };
            let v = serde_json::to_value(&next).map_err(|e| PipelineError::StageAbort {
                stage: "learning",
                reason: e.to_string(),
            })?;
            self.memory.put(PENDING_KEY, v, Tier::Durable).map_err(mem_err)?;
        }

        let payload = json!({
            "reconciled_cycle": reconciled,
            "stood_aside": stood_aside,
        });
        self.store()?
            .append_stage_result(cycle_id, Stage::Learning.as_str(), "learning", &payload, now_ts())
            .map_err(|_| PipelineError::DuplicateStageResult {
                cycle_id: cycle_id.to_string(),
                stage: Stage::Learning.as_str().to_string(),
            })?;
        self.wal.append(&WalEntry::StageCommit {
            cycle_id: cycle_id.to_string(),
            stage: Stage::Learning.as_str().to_string(),
            ts: now_ts(),
        })?;
        log_stage_commit(cycle_id, Stage::Learning.as_str(), "learning", 1.0, false);
        self.active_stage = Some(Stage::Learning.as_str());
        Ok(())
    }

    fn log_guard_verdict(
        &mut self,
        cycle_id: &str,
        verdict: &Verdict,
    ) -> Result<(), PipelineError> {
        match verdict {
            Verdict::Approve => {
                log_verdict(cycle_id, "approve", "", 0.0, 0.0);
            }
            Verdict::Modify { rule, scale } => {
                log_verdict(cycle_id, "modify", rule.as_str(), *scale, 1.0);
                self.record_risk_event(
                    cycle_id,
                    Severity::Medium,
                    rule.as_str(),
                    &format!("proposal scaled to {:.2}", scale),
                )?;
            }
            Verdict::Veto { rule, value, limit } => {
                log_verdict(cycle_id, "veto", rule.as_str(), *value, *limit);
                self.record_risk_event(
                    cycle_id,
                    Severity::High,
                    rule.as_str(),
                    &format!("vetoed at {:.4} against limit {:.4}", value, limit),
                )?;
            }
            Verdict::Halt { rule, value, limit } => {
                log_verdict(cycle_id, "halt", rule.as_str(), *value, *limit);
                self.record_risk_event(
                    cycle_id,
                    Severity::Critical,
                    rule.as_str(),
                    &format!("halted at {:.4} against limit {:.4}", value, limit),
                )?;
            }
        }
        Ok(())
    }

    fn record_risk_event(
        &mut self,
        cycle_id: &str,
        severity: Severity,
        rule: &str,
        description: &str,
    ) -> Result<(), PipelineError> {
        self.store()?
            .append_risk_event(&RiskEvent {
                cycle_id: cycle_id.to_string(),
                severity,
                rule: rule.to_string(),
                description: description.to_string(),
                ts: now_ts(),
            })
            .map_err(mem_err)
    }

    fn abort_cycle(
        &mut self,
        cycle_id: &str,
        ctx: &AgentContext,
        err: PipelineError,
    ) -> Result<CycleReport, PipelineError> {
        logging::log(
            Level::Error,
            Domain::Cycle,
            "cycle_abort",
            obj(&[
                ("cycle_id", v_str(cycle_id)),
                ("reason", v_str(&err.to_string())),
            ]),
        );
        self.close_cycle(cycle_id, Disposition::Aborted)?;
        Ok(CycleReport {
            cycle_id: cycle_id.to_string(),
            disposition: Disposition::Aborted,
            verdict: None,
            orders_submitted: 0,
            equity: ctx.portfolio.equity,
            degraded: ctx.degraded,
        })
    }

    fn finish_cycle(
        &mut self,
        cycle_id: &str,
        ctx: &AgentContext,
        disposition: Disposition,
        verdict: &Verdict,
        orders_submitted: usize,
    ) -> Result<CycleReport, PipelineError> {
        self.close_cycle(cycle_id, disposition)?;
        Ok(CycleReport {
            cycle_id: cycle_id.to_string(),
            disposition,
            verdict: Some(verdict.as_str().to_string()),
            orders_submitted,
            equity: self.portfolio.equity,
            degraded: ctx.degraded,
        })
    }

    fn close_cycle(
        &mut self,
        cycle_id: &str,
        disposition: Disposition,
    ) -> Result<(), PipelineError> {
        self.store()?
            .record_cycle_end(cycle_id, now_ts(), disposition.as_str())
            .map_err(mem_err)?;
        self.wal.append(&WalEntry::CycleEnd {
            cycle_id: cycle_id.to_string(),
            disposition: disposition.as_str().to_string(),
            ts: now_ts(),
        })?;
        log_cycle_end(
            cycle_id,
            disposition.as_str(),
            self.portfolio.equity,
            self.portfolio.hash(),
        );
        self.active_cycle = None;
        self.active_stage = None;
        Ok(())
    }
}

fn intents_for(decisions: &[Decision], prices: &HashMap<String, f64>) -> Vec<TradeIntent> {
    decisions
        .iter()
        .map(|d| TradeIntent {
            symbol: d.symbol.clone(),
            side: d.side,
            qty: d.qty,
            price: prices.get(&d.symbol).copied().unwrap_or(0.0),
        })
        .collect()
}

fn apply_output(ctx: &mut AgentContext, result: &AgentResult) {
    match &result.output {
        AgentOutput::Regime(r) => ctx.regime = Some(r.clone()),
        AgentOutput::Factors(f) => ctx.candidates = f.clone(),
        AgentOutput::Backtests(r) => ctx.reports = r.clone(),
        AgentOutput::Assessment(_) | AgentOutput::Execution(_) => {}
    }
}
