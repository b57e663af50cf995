//! Portfolio risk assessment: measure the book against the configured
//! limits and list every breach. Deterministic, so confidence is fixed.

use anyhow::Result;
use async_trait::async_trait;

use crate::config::now_ts;
use crate::data::max_pairwise_correlation;

use super::{Agent, AgentContext, AgentOutput, AgentResult, RiskAssessment};

pub struct RiskAssessmentAgent;

#[async_trait]
impl Agent for RiskAssessmentAgent {
    fn name(&self) -> &'static str {
        "risk_assessment"
    }

    async fn execute(&self, ctx: &AgentContext) -> Result<AgentResult> {
        let p = &ctx.portfolio;
        let limits = &ctx.limits;

        let leverage = p.leverage();
        let daily_loss_pct = p.daily_loss_pct();
        let concentration = p.concentration();
        let drawdown = p.drawdown();
        let max_correlation = max_pairwise_correlation(&ctx.history, &ctx.symbols);

        let mut violations = Vec::new();
        if leverage > limits.max_leverage {
            violations.push(format!(
                "leverage {:.4} exceeds limit {:.4}",
                leverage, limits.max_leverage
            ));
        }
        if daily_loss_pct >= limits.max_daily_loss_pct {
            violations.push(format!(
                "daily loss {:.4} at or past limit {:.4}",
                daily_loss_pct, limits.max_daily_loss_pct
            ));
        }
        if concentration > limits.max_position_pct {
            violations.push(format!(
                "concentration {:.4} exceeds limit {:.4}",
                concentration, limits.max_position_pct
            ));
        }
        if drawdown >= limits.max_drawdown_pct {
            violations.push(format!(
                "drawdown {:.4} at or past limit {:.4}",
                drawdown, limits.max_drawdown_pct
            ));
        }
        if max_correlation > limits.max_correlation {
            violations.push(format!(
                "pairwise correlation {:.4} exceeds limit {:.4}",
                max_correlation, limits.max_correlation
            ));
        }

        Ok(AgentResult {
            agent: self.name().to_string(),
            output: AgentOutput::Assessment(RiskAssessment {
                leverage,
                daily_loss_pct,
                concentration,
                drawdown,
                max_correlation,
                violations,
            }),
            confidence: 1.0,
            degraded: ctx.degraded,
            ts: now_ts(),
        })
    }
}
