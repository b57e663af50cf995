//! Agent contract.
//!
//! Agents are stateless: everything they act on arrives in the context and
//! everything they conclude leaves in the result. The orchestrator owns
//! timeouts, retries, and the decision of what to do with an output.

pub mod assess;
pub mod backtest;
pub mod execution;
pub mod factor;
pub mod regime;

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::broker::{OrderReceipt, Side};
use crate::config::RiskLimits;
use crate::data::Bar;
use crate::memory::{FactorScore, LearningRecord};
use crate::portfolio::PortfolioState;

pub use assess::RiskAssessmentAgent;
pub use backtest::BacktestAgent;
pub use execution::ExecutionAgent;
pub use factor::FactorDiscoveryAgent;
pub use regime::RegimeAgent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Regime {
    HighVolBull,
    HighVolBear,
    LowVolBull,
    LowVolBear,
    Unknown,
}

impl Regime {
    pub fn as_str(&self) -> &'static str {
        match self {
            Regime::HighVolBull => "high_vol_bull",
            Regime::HighVolBear => "high_vol_bear",
            Regime::LowVolBull => "low_vol_bull",
            Regime::LowVolBear => "low_vol_bear",
            Regime::Unknown => "unknown",
        }
    }

    pub fn is_high_vol(&self) -> bool {
        matches!(self, Regime::HighVolBull | Regime::HighVolBear)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeReport {
    pub regime: Regime,
    pub confidence: f64,
    pub volatility: f64,
    pub mean_return: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactorKind {
    Momentum,
    Reversal,
    Volatility,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Factor {
    pub name: String,
    pub kind: FactorKind,
    pub lookback: usize,
}

impl Factor {
    pub fn new(kind: FactorKind, lookback: usize) -> Self {
        let prefix = match kind {
            FactorKind::Momentum => "momentum",
            FactorKind::Reversal => "reversal",
            FactorKind::Volatility => "vol",
        };
        Self {
            name: format!("{}_{}", prefix, lookback),
            kind,
            lookback,
        }
    }

    /// Signal at index `i` (needs `lookback` bars of history before it).
    pub fn signal(&self, bars: &[Bar], i: usize) -> Option<f64> {
        if i < self.lookback || i >= bars.len() {
            return None;
        }
        let window = &bars[i - self.lookback..=i];
        if window[0].close <= 0.0 {
            return Some(0.0);
        }
        match self.kind {
            FactorKind::Momentum => Some(window[window.len() - 1].close / window[0].close - 1.0),
            FactorKind::Reversal => {
                Some(-(window[window.len() - 1].close / window[0].close - 1.0))
            }
            FactorKind::Volatility => {
                let rets = crate::data::returns(window);
                // Low-vol preference: calm windows score positive.
                Some(0.02 - crate::data::std_dev(&rets))
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactorReport {
    pub factor: Factor,
    /// Information coefficient: correlation of signal with next-bar return.
    pub ic: f64,
    pub sharpe: f64,
    pub max_drawdown: f64,
    pub win_rate: f64,
    pub samples: usize,
    pub useful: bool,
    pub predicted_return: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub leverage: f64,
    pub daily_loss_pct: f64,
    pub concentration: f64,
    pub drawdown: f64,
    pub max_correlation: f64,
    pub violations: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    pub factor: String,
    pub confidence: f64,
    pub predicted_return: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub receipts: Vec<OrderReceipt>,
    pub skipped: bool,
    pub reason: Option<String>,
}

// Adjacently tagged: internal tagging cannot represent the list-carrying
// variants (Factors, Backtests).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum AgentOutput {
    Regime(RegimeReport),
    Factors(Vec<Factor>),
    Backtests(Vec<FactorReport>),
    Assessment(RiskAssessment),
    Execution(ExecutionReport),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResult {
    pub agent: String,
    pub output: AgentOutput,
    pub confidence: f64,
    pub degraded: bool,
    pub ts: u64,
}

/// Read-only view of the world for one stage invocation.
pub struct AgentContext {
    pub cycle_id: String,
    pub primary_symbol: String,
    pub symbols: Vec<String>,
    pub portfolio: PortfolioState,
    pub limits: RiskLimits,
    pub history: HashMap<String, Vec<Bar>>,
    pub latest_prices: HashMap<String, f64>,
    pub regime: Option<RegimeReport>,
    pub candidates: Vec<Factor>,
    pub reports: Vec<FactorReport>,
    pub decisions: Vec<Decision>,
    pub recent_learnings: Vec<LearningRecord>,
    pub factor_scores: Vec<FactorScore>,
    pub excluded_factors: Vec<String>,
    pub auto_trading: bool,
    /// Market data could not be fetched this cycle; agents fall back to
    /// conservative defaults instead of failing.
    pub degraded: bool,
}

impl AgentContext {
    pub fn new(
        cycle_id: &str,
        symbols: Vec<String>,
        portfolio: PortfolioState,
        limits: RiskLimits,
    ) -> Self {
        let primary_symbol = symbols.first().cloned().unwrap_or_default();
        Self {
            cycle_id: cycle_id.to_string(),
            primary_symbol,
            symbols,
            portfolio,
            limits,
            history: HashMap::new(),
            latest_prices: HashMap::new(),
            regime: None,
            candidates: Vec::new(),
            reports: Vec::new(),
            decisions: Vec::new(),
            recent_learnings: Vec::new(),
            factor_scores: Vec::new(),
            excluded_factors: Vec::new(),
            auto_trading: false,
            degraded: false,
        }
    }

    pub fn regime_label(&self) -> &'static str {
        self.regime
            .as_ref()
            .map(|r| r.regime.as_str())
            .unwrap_or("unknown")
    }
}

#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &'static str;
    async fn execute(&self, ctx: &AgentContext) -> Result<AgentResult>;
}
