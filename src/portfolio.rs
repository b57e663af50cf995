use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::now_ts;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub symbol: String,
    /// Signed quantity; negative is short.
    pub qty: f64,
    pub entry_price: f64,
    pub last_price: f64,
}

impl Position {
    pub fn notional(&self) -> f64 {
        self.qty.abs() * self.last_price
    }

    pub fn unrealized_pnl(&self) -> f64 {
        self.qty * (self.last_price - self.entry_price)
    }
}

/// Portfolio snapshot the pipeline reads and the execution stage alone writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioState {
    pub cash: f64,
    pub positions: Vec<Position>,
    pub equity: f64,
    pub peak_equity: f64,
    pub day_start_equity: f64,
    pub updated_ts: u64,
}

impl PortfolioState {
    pub fn new(capital: f64) -> Self {
        Self {
            cash: capital,
            positions: Vec::new(),
            equity: capital,
            peak_equity: capital,
            day_start_equity: capital,
            updated_ts: now_ts(),
        }
    }

    pub fn gross_exposure(&self) -> f64 {
        self.positions.iter().map(|p| p.notional()).sum()
    }

    pub fn leverage(&self) -> f64 {
        self.gross_exposure() / self.equity.max(1e-9)
    }

    /// Largest single-position notional as a fraction of equity.
    pub fn concentration(&self) -> f64 {
        self.positions
            .iter()
            .map(|p| p.notional() / self.equity.max(1e-9))
            .fold(0.0, f64::max)
    }

    pub fn drawdown(&self) -> f64 {
        if self.peak_equity <= 0.0 {
            return 0.0;
        }
        ((self.peak_equity - self.equity) / self.peak_equity).max(0.0)
    }

    /// Loss since the daily anchor; zero when flat or up on the day.
    pub fn daily_loss_pct(&self) -> f64 {
        if self.day_start_equity <= 0.0 {
            return 0.0;
        }
        ((self.day_start_equity - self.equity) / self.day_start_equity).max(0.0)
    }

    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.positions.iter().find(|p| p.symbol == symbol)
    }

    /// Mark all positions to the given prices and recompute equity.
    pub fn mark(&mut self, prices: &HashMap<String, f64>) {
        for p in &mut self.positions {
            if let Some(px) = prices.get(&p.symbol) {
                p.last_price = *px;
            }
        }
        self.recompute();
    }

    /// Apply a fill: signed qty, execution price, fee already charged.
    pub fn apply_fill(&mut self, symbol: &str, qty: f64, price: f64, fee: f64) {
        self.cash -= qty * price + fee;
        match self.positions.iter_mut().find(|p| p.symbol == symbol) {
            Some(p) => {
                let new_qty = p.qty + qty;
                if new_qty.abs() < 1e-12 {
                    self.positions.retain(|p| p.symbol != symbol);
                } else {
                    // Average entry only when adding in the same direction.
                    if p.qty.signum() == qty.signum() {
                        p.entry_price =
                            (p.entry_price * p.qty + price * qty) / new_qty;
                    }
                    p.qty = new_qty;
                    p.last_price = price;
                }
            }
            None => {
                if qty.abs() > 1e-12 {
                    self.positions.push(Position {
                        symbol: symbol.to_string(),
                        qty,
                        entry_price: price,
                        last_price: price,
                    });
                }
            }
        }
        self.recompute();
    }

    /// Reset the daily loss anchor. Called at day roll, and by `reset` after
    /// an operator acknowledges an emergency stop.
    pub fn roll_day(&mut self) {
        self.day_start_equity = self.equity;
    }

    fn recompute(&mut self) {
        let mtm: f64 = self.positions.iter().map(|p| p.qty * p.last_price).sum();
        self.equity = self.cash + mtm;
        if self.equity > self.peak_equity {
            self.peak_equity = self.equity;
        }
        self.updated_ts = now_ts();
    }

    /// Deterministic snapshot hash. Floats are quantized so replay of the
    /// same fills yields the same value.
    pub fn hash(&self) -> u64 {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};
        let mut h = DefaultHasher::new();
        ((self.cash * 1e8) as i64).hash(&mut h);
        ((self.equity * 1e8) as i64).hash(&mut h);
        let mut positions = self.positions.clone();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        for p in positions {
            p.symbol.hash(&mut h);
            ((p.qty * 1e8) as i64).hash(&mut h);
            ((p.entry_price * 1e8) as i64).hash(&mut h);
        }
        h.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn marked(symbol: &str, qty: f64, entry: f64, last: f64) -> Position {
        Position {
            symbol: symbol.to_string(),
            qty,
            entry_price: entry,
            last_price: last,
        }
    }

    #[test]
    fn test_fill_opens_and_closes_position() {
        let mut pf = PortfolioState::new(10_000.0);
        pf.apply_fill("BTCUSDT", 0.1, 50_000.0, 2.0);
        assert_eq!(pf.positions.len(), 1);
        assert!((pf.cash - (10_000.0 - 5_000.0 - 2.0)).abs() < 1e-9);
        // Equity = cash + mtm = 4998 + 5000
        assert!((pf.equity - 9_998.0).abs() < 1e-9);

        pf.apply_fill("BTCUSDT", -0.1, 51_000.0, 2.0);
        assert!(pf.positions.is_empty());
        // Realized +100 minus 4 in fees
        assert!((pf.equity - 10_096.0).abs() < 1e-9);
    }

    #[test]
    fn test_leverage_and_concentration() {
        let mut pf = PortfolioState::new(10_000.0);
        pf.positions = vec![
            marked("BTCUSDT", 0.1, 50_000.0, 50_000.0),
            marked("ETHUSDT", -1.0, 3_000.0, 3_000.0),
        ];
        pf.cash = 10_000.0;
        pf.recompute();
        // Gross 8000, equity = 10000 + (5000 - 3000) = 12000
        assert!((pf.gross_exposure() - 8_000.0).abs() < 1e-9);
        assert!((pf.leverage() - 8_000.0 / 12_000.0).abs() < 1e-9);
        assert!((pf.concentration() - 5_000.0 / 12_000.0).abs() < 1e-9);
    }

    #[test]
    fn test_drawdown_from_peak() {
        let mut pf = PortfolioState::new(10_000.0);
        pf.apply_fill("BTCUSDT", 0.1, 50_000.0, 0.0);
        let mut up = HashMap::new();
        up.insert("BTCUSDT".to_string(), 60_000.0);
        pf.mark(&up);
        assert!(pf.drawdown() < 1e-9);

        let mut down = HashMap::new();
        down.insert("BTCUSDT".to_string(), 40_000.0);
        pf.mark(&down);
        // Peak was 11000, now 9000 -> dd = 2000/11000
        assert!((pf.drawdown() - 2_000.0 / 11_000.0).abs() < 1e-9);
    }

    #[test]
    fn test_daily_loss_anchor() {
        let mut pf = PortfolioState::new(10_000.0);
        pf.apply_fill("BTCUSDT", 0.1, 50_000.0, 0.0);
        let mut down = HashMap::new();
        down.insert("BTCUSDT".to_string(), 48_000.0);
        pf.mark(&down);
        // Lost 200 on the day
        assert!((pf.daily_loss_pct() - 0.02).abs() < 1e-9);

        pf.roll_day();
        assert!(pf.daily_loss_pct() < 1e-9);
    }

    #[test]
    fn test_hash_deterministic_and_order_insensitive() {
        let mut a = PortfolioState::new(10_000.0);
        a.apply_fill("BTCUSDT", 0.1, 50_000.0, 1.0);
        a.apply_fill("ETHUSDT", 1.0, 3_000.0, 1.0);

        let mut b = PortfolioState::new(10_000.0);
        b.apply_fill("ETHUSDT", 1.0, 3_000.0, 1.0);
        b.apply_fill("BTCUSDT", 0.1, 50_000.0, 1.0);

        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn test_short_position_unrealized() {
        let p = marked("ETHUSDT", -1.0, 3_000.0, 3_100.0);
        assert!((p.unrealized_pnl() - (-100.0)).abs() < 1e-9);
    }
}
