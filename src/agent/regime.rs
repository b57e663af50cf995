//! Market regime classification: per-bar volatility split against a fixed
//! threshold, direction from the sign of the mean return.

use anyhow::Result;
use async_trait::async_trait;

use crate::config::now_ts;
use crate::data::{mean, returns, std_dev};

use super::{Agent, AgentContext, AgentResult, AgentOutput, Regime, RegimeReport};

/// Per-bar return volatility above this is a high-volatility regime.
const HIGH_VOL_THRESHOLD: f64 = 0.02;
const BASE_CONFIDENCE: f64 = 0.7;
/// Bars needed before the classification gets full confidence.
const FULL_CONFIDENCE_BARS: usize = 30;

pub struct RegimeAgent;

#[async_trait]
impl Agent for RegimeAgent {
    fn name(&self) -> &'static str {
        "regime"
    }

    async fn execute(&self, ctx: &AgentContext) -> Result<AgentResult> {
        let bars = ctx.history.get(&ctx.primary_symbol);
        let report = match bars {
            Some(bars) if bars.len() >= 3 && !ctx.degraded => classify(bars),
            // No usable data: Unknown with zero confidence, which the
            // decision stage treats as a reason to size conservatively.
            _ => RegimeReport {
                regime: Regime::Unknown,
                confidence: 0.0,
                volatility: 0.0,
                mean_return: 0.0,
            },
        };
        let degraded = report.regime == Regime::Unknown;
        let confidence = report.confidence;
        Ok(AgentResult {
            agent: self.name().to_string(),
            output: AgentOutput::Regime(report),
            confidence,
            degraded,
            ts: now_ts(),
        })
    }
}

fn classify(bars: &[crate::data::Bar]) -> RegimeReport {
    let rets = returns(bars);
    let volatility = std_dev(&rets);
    let mean_return = mean(&rets);
    let regime = match (volatility > HIGH_VOL_THRESHOLD, mean_return >= 0.0) {
        (true, true) => Regime::HighVolBull,
        (true, false) => Regime::HighVolBear,
        (false, true) => Regime::LowVolBull,
        (false, false) => Regime::LowVolBear,
    };
    let sample_weight = (rets.len() as f64 / FULL_CONFIDENCE_BARS as f64).min(1.0);
    RegimeReport {
        regime,
        confidence: BASE_CONFIDENCE * sample_weight,
        volatility,
        mean_return,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, RiskLimits};
    use crate::data::Bar;
    use crate::portfolio::PortfolioState;
    use std::collections::HashMap;

    fn ctx_with_bars(bars: Vec<Bar>) -> AgentContext {
        let cfg = Config::from_env();
        let mut ctx = AgentContext::new(
            "c-test",
            vec!["BTCUSDT".to_string()],
            PortfolioState::new(10_000.0),
            RiskLimits { ..cfg.limits },
        );
        let mut history = HashMap::new();
        history.insert("BTCUSDT".to_string(), bars);
        ctx.history = history;
        ctx
    }

    fn trending_bars(n: usize, step: f64) -> Vec<Bar> {
        let mut price = 100.0;
        (0..n)
            .map(|i| {
                price *= 1.0 + step;
                Bar { ts: i as u64, close: price, volume: 1.0 }
            })
            .collect()
    }

    fn choppy_bars(n: usize, swing: f64, drift: f64) -> Vec<Bar> {
        let mut price = 100.0;
        (0..n)
            .map(|i| {
                let dir = if i % 2 == 0 { swing } else { -swing };
                price *= 1.0 + drift + dir;
                Bar { ts: i as u64, close: price, volume: 1.0 }
            })
            .collect()
    }

    #[tokio::test]
    async fn test_low_vol_bull() {
        let ctx = ctx_with_bars(trending_bars(60, 0.002));
        let result = RegimeAgent.execute(&ctx).await.unwrap();
        match result.output {
            AgentOutput::Regime(r) => {
                assert_eq!(r.regime, Regime::LowVolBull);
                assert!((r.confidence - 0.7).abs() < 1e-9, "full sample weight");
            }
            _ => panic!("wrong output kind"),
        }
        assert!(!result.degraded);
    }

    #[tokio::test]
    async fn test_high_vol_bear() {
        let ctx = ctx_with_bars(choppy_bars(60, 0.05, -0.005));
        let result = RegimeAgent.execute(&ctx).await.unwrap();
        match result.output {
            AgentOutput::Regime(r) => {
                assert_eq!(r.regime, Regime::HighVolBear);
                assert!(r.volatility > 0.02);
            }
            _ => panic!("wrong output kind"),
        }
    }

    #[tokio::test]
    async fn test_no_data_is_unknown_and_degraded() {
        let mut ctx = ctx_with_bars(vec![]);
        ctx.degraded = true;
        let result = RegimeAgent.execute(&ctx).await.unwrap();
        match result.output {
            AgentOutput::Regime(r) => {
                assert_eq!(r.regime, Regime::Unknown);
                assert_eq!(r.confidence, 0.0);
            }
            _ => panic!("wrong output kind"),
        }
        assert!(result.degraded);
    }

    #[tokio::test]
    async fn test_short_history_lowers_confidence() {
        let ctx = ctx_with_bars(trending_bars(10, 0.002));
        let result = RegimeAgent.execute(&ctx).await.unwrap();
        assert!(result.confidence < 0.7);
        assert!(result.confidence > 0.0);
    }
}
