//! Candidate validation: replay each factor over the fetched history and
//! score it on predictive power, not on in-sample profit alone.

use anyhow::Result;
use async_trait::async_trait;

use crate::config::now_ts;
use crate::data::{mean, pearson, std_dev, Bar};

use super::{Agent, AgentContext, AgentOutput, AgentResult, Factor, FactorReport};

/// IC above this is considered real signal rather than noise.
const MIN_USEFUL_IC: f64 = 0.02;
/// Below this many pooled samples the IC estimate is not trusted.
const MIN_SAMPLES: usize = 30;

pub struct BacktestAgent;

#[async_trait]
impl Agent for BacktestAgent {
    fn name(&self) -> &'static str {
        "backtest"
    }

    async fn execute(&self, ctx: &AgentContext) -> Result<AgentResult> {
        let reports: Vec<FactorReport> = ctx
            .candidates
            .iter()
            .map(|f| evaluate(f, &ctx.history))
            .collect();

        let useful = reports.iter().filter(|r| r.useful).count();
        let degraded = ctx.degraded || reports.is_empty();
        let confidence = if reports.is_empty() {
            0.0
        } else {
            useful as f64 / reports.len() as f64
        };
        Ok(AgentResult {
            agent: self.name().to_string(),
            output: AgentOutput::Backtests(reports),
            confidence,
            degraded,
            ts: now_ts(),
        })
    }
}

/// Pool (signal, next-bar return) pairs across every symbol, then score.
fn evaluate(factor: &Factor, history: &std::collections::HashMap<String, Vec<Bar>>) -> FactorReport {
    let mut signals = Vec::new();
    let mut forwards = Vec::new();
    let mut strat_returns = Vec::new();

    for bars in history.values() {
        if bars.len() < factor.lookback + 2 {
            continue;
        }
        for i in factor.lookback..bars.len() - 1 {
            let sig = match factor.signal(bars, i) {
                Some(s) => s,
                None => continue,
            };
            if bars[i].close <= 0.0 {
                continue;
            }
            let fwd = bars[i + 1].close / bars[i].close - 1.0;
            signals.push(sig);
            forwards.push(fwd);
            strat_returns.push(sig.signum() * fwd);
        }
    }

    let samples = signals.len();
    let ic = pearson(&signals, &forwards);
    let mean_ret = mean(&strat_returns);
    let vol = std_dev(&strat_returns);
    let sharpe = if vol > 0.0 { mean_ret / vol } else { 0.0 };
    let wins = strat_returns.iter().filter(|r| **r > 0.0).count();
    let win_rate = if samples > 0 {
        wins as f64 / samples as f64
    } else {
        0.0
    };

    FactorReport {
        factor: factor.clone(),
        ic,
        sharpe,
        max_drawdown: max_drawdown(&strat_returns),
        win_rate,
        samples,
        useful: ic > MIN_USEFUL_IC && samples >= MIN_SAMPLES,
        predicted_return: mean_ret,
    }
}

/// Peak-to-trough drawdown of the compounded strategy equity curve.
fn max_drawdown(rets: &[f64]) -> f64 {
    let mut equity = 1.0_f64;
    let mut peak = 1.0_f64;
    let mut worst = 0.0_f64;
    for r in rets {
        equity *= 1.0 + r;
        if equity > peak {
            peak = equity;
        }
        if peak > 0.0 {
            worst = worst.max(1.0 - equity / peak);
        }
    }
    worst
}
