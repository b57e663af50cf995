//! Deterministic risk guard.
//!
//! `evaluate` is a pure function of the proposed trades, the portfolio
//! snapshot, and the configured limits. Rules run in a fixed priority order
//! and the first hard stop wins, so the same inputs always produce the same
//! verdict regardless of which limits are breached together.

use serde::{Deserialize, Serialize};

use crate::broker::Side;
use crate::config::RiskLimits;
use crate::portfolio::PortfolioState;

/// Limit rules in evaluation (and severity) order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskRule {
    Leverage,
    DailyLoss,
    Concentration,
    Drawdown,
    Correlation,
}

impl RiskRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskRule::Leverage => "leverage",
            RiskRule::DailyLoss => "daily_loss",
            RiskRule::Concentration => "concentration",
            RiskRule::Drawdown => "drawdown",
            RiskRule::Correlation => "correlation",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Approve,
    /// Proceed with all quantities scaled down by `scale`.
    Modify { rule: RiskRule, scale: f64 },
    /// Drop the execution stage for this cycle; the system keeps running.
    Veto { rule: RiskRule, value: f64, limit: f64 },
    /// The portfolio itself is in breach; the system must stop.
    Halt { rule: RiskRule, value: f64, limit: f64 },
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Approve => "approve",
            Verdict::Modify { .. } => "modify",
            Verdict::Veto { .. } => "veto",
            Verdict::Halt { .. } => "halt",
        }
    }

    fn severity(&self) -> u8 {
        match self {
            Verdict::Approve => 0,
            Verdict::Modify { .. } => 1,
            Verdict::Veto { .. } => 2,
            Verdict::Halt { .. } => 3,
        }
    }
}

/// A trade the decision stage proposes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeIntent {
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    pub price: f64,
}

impl TradeIntent {
    pub fn signed_qty(&self) -> f64 {
        match self.side {
            Side::Buy => self.qty,
            Side::Sell => -self.qty,
        }
    }
}

/// Everything the guard looks at. `observed_correlation` is the highest
/// pairwise return correlation among held and proposed symbols, computed
/// upstream from history so the guard itself stays pure.
pub struct RiskContext<'a> {
    pub portfolio: &'a PortfolioState,
    pub intents: &'a [TradeIntent],
    pub observed_correlation: f64,
}

pub fn evaluate(ctx: &RiskContext, limits: &RiskLimits) -> Verdict {
    let pf = ctx.portfolio;
    let equity = pf.equity.max(1e-9);

    // 1. Leverage. A portfolio already over the limit is a breach of the
    // book itself, not just of the proposal.
    let current_leverage = pf.leverage();
    if current_leverage > limits.max_leverage {
        return Verdict::Halt {
            rule: RiskRule::Leverage,
            value: current_leverage,
            limit: limits.max_leverage,
        };
    }
    let projected = projected_leverage(ctx);
    if projected > limits.max_leverage {
        return Verdict::Veto {
            rule: RiskRule::Leverage,
            value: projected,
            limit: limits.max_leverage,
        };
    }

    // 2. Daily loss.
    let daily_loss = pf.daily_loss_pct();
    if daily_loss >= limits.max_daily_loss_pct {
        return Verdict::Halt {
            rule: RiskRule::DailyLoss,
            value: daily_loss,
            limit: limits.max_daily_loss_pct,
        };
    }

    // 3. Concentration. Oversized additions are scaled down rather than
    // dropped; a symbol already at cap cannot be added to at all.
    if let Some(verdict) = concentration_check(ctx, limits, equity) {
        return verdict;
    }

    // 4. Drawdown.
    let dd = pf.drawdown();
    if dd >= limits.max_drawdown_pct {
        return Verdict::Halt {
            rule: RiskRule::Drawdown,
            value: dd,
            limit: limits.max_drawdown_pct,
        };
    }

    // 5. Correlation.
    if !ctx.intents.is_empty() && ctx.observed_correlation > limits.max_correlation {
        return Verdict::Veto {
            rule: RiskRule::Correlation,
            value: ctx.observed_correlation,
            limit: limits.max_correlation,
        };
    }

    Verdict::Approve
}

fn projected_leverage(ctx: &RiskContext) -> f64 {
    let pf = ctx.portfolio;
    let equity = pf.equity.max(1e-9);
    let mut gross = 0.0;
    let mut seen: Vec<&str> = Vec::new();
    for p in &pf.positions {
        let mut qty = p.qty;
        for i in ctx.intents.iter().filter(|i| i.symbol == p.symbol) {
            qty += i.signed_qty();
        }
        gross += qty.abs() * p.last_price;
        seen.push(p.symbol.as_str());
    }
    for i in ctx.intents.iter().filter(|i| !seen.contains(&i.symbol.as_str())) {
        gross += i.qty.abs() * i.price;
    }
    gross / equity
}

fn concentration_check(
    ctx: &RiskContext,
    limits: &RiskLimits,
    equity: f64,
) -> Option<Verdict> {
    let mut worst_scale = 1.0_f64;
    for intent in ctx.intents {
        let held = ctx
            .portfolio
            .position(&intent.symbol)
            .map(|p| p.qty)
            .unwrap_or(0.0);
        let projected_qty = held + intent.signed_qty();
        let frac = projected_qty.abs() * intent.price / equity;
        // Rounding slack: a quantity scaled exactly onto the cap must pass
        // when re-checked.
        if frac <= limits.max_position_pct * (1.0 + 1e-9) {
            continue;
        }
        let held_frac = held.abs() * intent.price / equity;
        if held_frac >= limits.max_position_pct {
            return Some(Verdict::Veto {
                rule: RiskRule::Concentration,
                value: frac,
                limit: limits.max_position_pct,
            });
        }
        // Scale so the projected position lands exactly on the cap.
        let allowed = limits.max_position_pct * equity / intent.price - held.abs();
        let scale = (allowed / intent.qty).clamp(0.0, 1.0);
        worst_scale = worst_scale.min(scale);
    }
    if worst_scale < 1.0 {
        Some(Verdict::Modify {
            rule: RiskRule::Concentration,
            scale: worst_scale,
        })
    } else {
        None
    }
}

/// Pick the most conservative of a set of candidate verdicts. Used by the
/// decision stage when recommendations tie: halt beats veto beats modify
/// beats approve, and of two modifies the smaller scale wins.
pub fn most_conservative(verdicts: Vec<Verdict>) -> Verdict {
    let mut best = Verdict::Approve;
    for v in verdicts {
        let replace = match (&v, &best) {
            (Verdict::Modify { scale: a, .. }, Verdict::Modify { scale: b, .. }) => a < b,
            _ => v.severity() > best.severity(),
        };
        if replace {
            best = v;
        }
    }
    best
}

/// Operator kill file: presence alone halts the system.
pub fn kill_engaged(path: &str) -> bool {
    std::path::Path::new(path).exists()
}
