//! Factor discovery: propose candidate signals from a fixed template set,
//! drop excluded factors, and rank the rest by their rolling scores.

use anyhow::Result;
use async_trait::async_trait;

use crate::config::now_ts;

use super::{Agent, AgentContext, AgentOutput, AgentResult, Factor, FactorKind};

/// The candidate universe. Discovery narrows this set, it never invents
/// signals outside it.
fn templates() -> Vec<Factor> {
    vec![
        Factor::new(FactorKind::Momentum, 20),
        Factor::new(FactorKind::Momentum, 60),
        Factor::new(FactorKind::Reversal, 5),
        Factor::new(FactorKind::Volatility, 20),
    ]
}

pub struct FactorDiscoveryAgent;

#[async_trait]
impl Agent for FactorDiscoveryAgent {
    fn name(&self) -> &'static str {
        "factor_discovery"
    }

    async fn execute(&self, ctx: &AgentContext) -> Result<AgentResult> {
        let mut candidates: Vec<Factor> = templates()
            .into_iter()
            .filter(|f| !ctx.excluded_factors.contains(&f.name))
            .collect();

        // Best-scored factors first; unseen factors rank as neutral.
        candidates.sort_by(|a, b| {
            let sa = score_of(ctx, &a.name);
            let sb = score_of(ctx, &b.name);
            sb.partial_cmp(&sa).unwrap_or(std::cmp::Ordering::Equal)
        });

        let degraded = ctx.degraded || candidates.is_empty();
        let confidence = if candidates.is_empty() { 0.0 } else { 0.7 };
        Ok(AgentResult {
            agent: self.name().to_string(),
            output: AgentOutput::Factors(candidates),
            confidence,
            degraded,
            ts: now_ts(),
        })
    }
}

fn score_of(ctx: &AgentContext, name: &str) -> f64 {
    ctx.factor_scores
        .iter()
        .find(|s| s.factor == name)
        .map(|s| s.score)
        .unwrap_or(0.0)
}
