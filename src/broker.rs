//! Broker seam: order submission with idempotency-key replay semantics.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::now_ts;
use crate::portfolio::Position;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderSpec {
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    pub limit_price: f64,
    /// Caller-supplied key; resubmitting the same key returns the original
    /// receipt instead of a second fill.
    pub idempotency_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderReceipt {
    pub idempotency_key: String,
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    pub fill_price: f64,
    pub fee: f64,
    pub ts: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub cash: f64,
    pub equity: f64,
}

#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    async fn submit_order(&self, spec: &OrderSpec) -> Result<OrderReceipt>;
    async fn get_positions(&self) -> Result<Vec<Position>>;
    async fn get_account(&self) -> Result<AccountSnapshot>;
}

/// In-process fill simulator with a flat slippage and fee model.
pub struct PaperBroker {
    fee_rate: f64,
    slip_rate: f64,
    book: Mutex<Book>,
}

struct Book {
    cash: f64,
    positions: HashMap<String, Position>,
    receipts: HashMap<String, OrderReceipt>,
}

impl PaperBroker {
    pub fn new(capital: f64, fee_rate: f64, slip_rate: f64) -> Self {
        Self {
            fee_rate,
            slip_rate,
            book: Mutex::new(Book {
                cash: capital,
                positions: HashMap::new(),
                receipts: HashMap::new(),
            }),
        }
    }

    fn fill_price(&self, spec: &OrderSpec) -> f64 {
        match spec.side {
            Side::Buy => spec.limit_price * (1.0 + self.slip_rate),
            Side::Sell => spec.limit_price * (1.0 - self.slip_rate),
        }
    }
}

#[async_trait]
impl BrokerAdapter for PaperBroker {
    async fn submit_order(&self, spec: &OrderSpec) -> Result<OrderReceipt> {
        if spec.qty <= 0.0 {
            return Err(anyhow!("order qty must be positive, got {}", spec.qty));
        }
        if spec.idempotency_key.is_empty() {
            return Err(anyhow!("order missing idempotency key"));
        }
        let mut book = self
            .book
            .lock()
            .map_err(|_| anyhow!("broker book poisoned"))?;

        if let Some(existing) = book.receipts.get(&spec.idempotency_key) {
            return Ok(existing.clone());
        }

        let fill_price = self.fill_price(spec);
        let fee = spec.qty * fill_price * self.fee_rate;
        let signed_qty = match spec.side {
            Side::Buy => spec.qty,
            Side::Sell => -spec.qty,
        };

        book.cash -= signed_qty * fill_price + fee;
        let entry = book
            .positions
            .entry(spec.symbol.clone())
            .or_insert_with(|| Position {
                symbol: spec.symbol.clone(),
                qty: 0.0,
                entry_price: fill_price,
                last_price: fill_price,
            });
        if entry.qty.signum() == signed_qty.signum() || entry.qty == 0.0 {
            let new_qty = entry.qty + signed_qty;
            if new_qty.abs() > 1e-12 {
                entry.entry_price =
                    (entry.entry_price * entry.qty + fill_price * signed_qty) / new_qty;
            }
        }
        entry.qty += signed_qty;
        entry.last_price = fill_price;
        if entry.qty.abs() < 1e-12 {
            book.positions.remove(&spec.symbol);
        }

        let receipt = OrderReceipt {
            idempotency_key: spec.idempotency_key.clone(),
            symbol: spec.symbol.clone(),
            side: spec.side,
            qty: spec.qty,
            fill_price,
            fee,
            ts: now_ts(),
        };
        book.receipts
            .insert(spec.idempotency_key.clone(), receipt.clone());
        Ok(receipt)
    }

    async fn get_positions(&self) -> Result<Vec<Position>> {
        let book = self
            .book
            .lock()
            .map_err(|_| anyhow!("broker book poisoned"))?;
        let mut positions: Vec<Position> = book.positions.values().cloned().collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(positions)
    }

    async fn get_account(&self) -> Result<AccountSnapshot> {
        let book = self
            .book
            .lock()
            .map_err(|_| anyhow!("broker book poisoned"))?;
        let mtm: f64 = book
            .positions
            .values()
            .map(|p| p.qty * p.last_price)
            .sum();
        Ok(AccountSnapshot {
            cash: book.cash,
            equity: book.cash + mtm,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(key: &str, side: Side, qty: f64) -> OrderSpec {
        OrderSpec {
            symbol: "BTCUSDT".to_string(),
            side,
            qty,
            limit_price: 50_000.0,
            idempotency_key: key.to_string(),
        }
    }

    #[tokio::test]
    async fn test_replay_returns_original_receipt() {
        let broker = PaperBroker::new(100_000.0, 0.001, 0.0005);
        let s = spec("c1-exec-0", Side::Buy, 0.1);

        let first = broker.submit_order(&s).await.unwrap();
        let replay = broker.submit_order(&s).await.unwrap();

        assert_eq!(first.fill_price, replay.fill_price);
        assert_eq!(first.ts, replay.ts);

        // The position reflects exactly one fill.
        let positions = broker.get_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert!((positions[0].qty - 0.1).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_slippage_direction() {
        let broker = PaperBroker::new(100_000.0, 0.0, 0.001);
        let b = broker
            .submit_order(&spec("k-buy", Side::Buy, 0.1))
            .await
            .unwrap();
        let s = broker
            .submit_order(&spec("k-sell", Side::Sell, 0.1))
            .await
            .unwrap();
        assert!(b.fill_price > 50_000.0, "buys pay up");
        assert!(s.fill_price < 50_000.0, "sells give up");
    }

    #[tokio::test]
    async fn test_round_trip_costs_fees() {
        let broker = PaperBroker::new(100_000.0, 0.001, 0.0);
        broker
            .submit_order(&spec("k-open", Side::Buy, 0.1))
            .await
            .unwrap();
        broker
            .submit_order(&spec("k-close", Side::Sell, 0.1))
            .await
            .unwrap();

        let positions = broker.get_positions().await.unwrap();
        assert!(positions.is_empty());
        let account = broker.get_account().await.unwrap();
        // Two fees of 5.0 each at 50k * 0.1 * 0.001
        assert!((account.equity - 99_990.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_rejects_bad_orders() {
        let broker = PaperBroker::new(100_000.0, 0.0, 0.0);
        assert!(broker
            .submit_order(&spec("k", Side::Buy, 0.0))
            .await
            .is_err());
        let mut no_key = spec("", Side::Buy, 1.0);
        no_key.idempotency_key.clear();
        assert!(broker.submit_order(&no_key).await.is_err());
    }
}
