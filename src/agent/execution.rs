//! Order execution. The only agent with a side effect, and the only one
//! holding a broker handle; every order carries a cycle-derived idempotency
//! key so a replayed call cannot double-fill.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::broker::{BrokerAdapter, OrderSpec};
use crate::config::now_ts;
use crate::logging::log_order_submit;

use super::{Agent, AgentContext, AgentOutput, AgentResult, ExecutionReport};

pub struct ExecutionAgent {
    broker: Arc<dyn BrokerAdapter>,
}

impl ExecutionAgent {
    pub fn new(broker: Arc<dyn BrokerAdapter>) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl Agent for ExecutionAgent {
    fn name(&self) -> &'static str {
        "execution"
    }

    async fn execute(&self, ctx: &AgentContext) -> Result<AgentResult> {
        let skip_reason = if !ctx.auto_trading {
            Some("auto trading disabled".to_string())
        } else if ctx.decisions.is_empty() {
            Some("no approved decisions".to_string())
        } else {
            None
        };

        if let Some(reason) = skip_reason {
            return Ok(AgentResult {
                agent: self.name().to_string(),
                output: AgentOutput::Execution(ExecutionReport {
                    receipts: Vec::new(),
                    skipped: true,
                    reason: Some(reason),
                }),
                confidence: 1.0,
                degraded: false,
                ts: now_ts(),
            });
        }

        let mut receipts = Vec::new();
        for (i, d) in ctx.decisions.iter().enumerate() {
            let spec = OrderSpec {
                symbol: d.symbol.clone(),
                side: d.side,
                qty: d.qty,
                limit_price: ctx.latest_prices.get(&d.symbol).copied().unwrap_or(0.0),
                idempotency_key: format!("{}-execution-{}", ctx.cycle_id, i),
            };
            log_order_submit(
                &ctx.cycle_id,
                &spec.idempotency_key,
                &spec.symbol,
                spec.side.as_str(),
                spec.qty,
            );
            let receipt = self.broker.submit_order(&spec).await?;
            receipts.push(receipt);
        }

        Ok(AgentResult {
            agent: self.name().to_string(),
            output: AgentOutput::Execution(ExecutionReport {
                receipts,
                skipped: false,
                reason: None,
            }),
            confidence: 1.0,
            degraded: false,
            ts: now_ts(),
        })
    }
}
