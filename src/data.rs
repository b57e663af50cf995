//! Market data seam: provider contract, ordered failover, and the
//! deterministic in-process providers used for dry runs and tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::{timeout, Duration};

use crate::error::PipelineError;
use crate::logging::{self, obj, v_str, Domain, Level};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Bar {
    pub ts: u64,
    pub close: f64,
    pub volume: f64,
}

#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    fn name(&self) -> &'static str;
    async fn get_historical(
        &self,
        symbols: &[String],
        bars: usize,
    ) -> Result<HashMap<String, Vec<Bar>>>;
    async fn get_latest_prices(&self, symbols: &[String]) -> Result<HashMap<String, f64>>;
}

/// Tries providers in configured order; each attempt is bounded by the same
/// timeout. All providers failing is a `DataUnavailable`, which the caller
/// treats as a degraded stage rather than a crash.
pub struct FailoverFeed {
    providers: Vec<Box<dyn MarketDataProvider>>,
    attempt_timeout: Duration,
}

impl FailoverFeed {
    pub fn new(providers: Vec<Box<dyn MarketDataProvider>>, attempt_timeout_ms: u64) -> Self {
        Self {
            providers,
            attempt_timeout: Duration::from_millis(attempt_timeout_ms),
        }
    }

    pub async fn get_historical(
        &self,
        symbols: &[String],
        bars: usize,
    ) -> Result<HashMap<String, Vec<Bar>>, PipelineError> {
        let mut last_err = String::from("no providers configured");
        for provider in &self.providers {
            match timeout(self.attempt_timeout, provider.get_historical(symbols, bars)).await {
                Ok(Ok(series)) if !series.is_empty() => return Ok(series),
                Ok(Ok(_)) => last_err = format!("{}: empty response", provider.name()),
                Ok(Err(e)) => last_err = format!("{}: {}", provider.name(), e),
                Err(_) => last_err = format!("{}: timed out", provider.name()),
            }
            logging::log(
                Level::Warn,
                Domain::System,
                "provider_failover",
                obj(&[("provider", v_str(provider.name())), ("reason", v_str(&last_err))]),
            );
        }
        Err(PipelineError::DataUnavailable(last_err))
    }

    pub async fn get_latest_prices(
        &self,
        symbols: &[String],
    ) -> Result<HashMap<String, f64>, PipelineError> {
        let mut last_err = String::from("no providers configured");
        for provider in &self.providers {
            match timeout(self.attempt_timeout, provider.get_latest_prices(symbols)).await {
                Ok(Ok(prices)) if !prices.is_empty() => return Ok(prices),
                Ok(Ok(_)) => last_err = format!("{}: empty response", provider.name()),
                Ok(Err(e)) => last_err = format!("{}: {}", provider.name(), e),
                Err(_) => last_err = format!("{}: timed out", provider.name()),
            }
        }
        Err(PipelineError::DataUnavailable(last_err))
    }
}

/// Deterministic synthetic series: a drift plus two sine terms seeded from
/// the symbol name. Same inputs, same bars, every run.
pub struct StaticProvider {
    series: HashMap<String, Vec<Bar>>,
}

impl StaticProvider {
    pub fn seeded(symbols: &[String], bars: usize) -> Self {
        let mut series = HashMap::new();
        for symbol in symbols {
            series.insert(symbol.clone(), synth_series(symbol, bars, 0.0005));
        }
        Self { series }
    }

    /// Series with a chosen per-bar drift, for forcing a regime in tests.
    pub fn with_drift(symbols: &[String], bars: usize, drift: f64) -> Self {
        let mut series = HashMap::new();
        for symbol in symbols {
            series.insert(symbol.clone(), synth_series(symbol, bars, drift));
        }
        Self { series }
    }

    pub fn with_series(series: HashMap<String, Vec<Bar>>) -> Self {
        Self { series }
    }
}

fn symbol_seed(symbol: &str) -> f64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut h = DefaultHasher::new();
    symbol.hash(&mut h);
    (h.finish() % 1000) as f64
}

fn synth_series(symbol: &str, bars: usize, drift: f64) -> Vec<Bar> {
    let seed = symbol_seed(symbol);
    let base = 50.0 + seed;
    let phase = seed / 100.0;
    let mut out = Vec::with_capacity(bars);
    let mut price = base;
    for i in 0..bars {
        let wave = 0.004 * ((i as f64) * 0.35 + phase).sin()
            + 0.002 * ((i as f64) * 0.11 + phase * 2.0).sin();
        price *= 1.0 + drift + wave;
        out.push(Bar {
            ts: 1_700_000_000 + (i as u64) * 3600,
            close: price,
            volume: 1_000.0 + 50.0 * ((i as f64) * 0.2 + phase).cos().abs(),
        });
    }
    out
}

#[async_trait]
impl MarketDataProvider for StaticProvider {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn get_historical(
        &self,
        symbols: &[String],
        bars: usize,
    ) -> Result<HashMap<String, Vec<Bar>>> {
        let mut out = HashMap::new();
        for symbol in symbols {
            let series = self
                .series
                .get(symbol)
                .ok_or_else(|| anyhow!("unknown symbol {}", symbol))?;
            let start = series.len().saturating_sub(bars);
            out.insert(symbol.clone(), series[start..].to_vec());
        }
        Ok(out)
    }

    async fn get_latest_prices(&self, symbols: &[String]) -> Result<HashMap<String, f64>> {
        let mut out = HashMap::new();
        for symbol in symbols {
            let series = self
                .series
                .get(symbol)
                .ok_or_else(|| anyhow!("unknown symbol {}", symbol))?;
            let last = series
                .last()
                .ok_or_else(|| anyhow!("empty series for {}", symbol))?;
            out.insert(symbol.clone(), last.close);
        }
        Ok(out)
    }
}

/// Fails the first `fail_times` calls, then delegates. Used to exercise
/// failover and retry paths.
pub struct FlakyProvider {
    fail_times: AtomicU32,
    inner: StaticProvider,
}

impl FlakyProvider {
    pub fn new(fail_times: u32, inner: StaticProvider) -> Self {
        Self {
            fail_times: AtomicU32::new(fail_times),
            inner,
        }
    }

    fn should_fail(&self) -> bool {
        self.fail_times
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl MarketDataProvider for FlakyProvider {
    fn name(&self) -> &'static str {
        "flaky"
    }

    async fn get_historical(
        &self,
        symbols: &[String],
        bars: usize,
    ) -> Result<HashMap<String, Vec<Bar>>> {
        if self.should_fail() {
            return Err(anyhow!("simulated outage"));
        }
        self.inner.get_historical(symbols, bars).await
    }

    async fn get_latest_prices(&self, symbols: &[String]) -> Result<HashMap<String, f64>> {
        if self.should_fail() {
            return Err(anyhow!("simulated outage"));
        }
        self.inner.get_latest_prices(symbols).await
    }
}

// =============================================================================
// Return statistics used by the regime and assessment agents
// =============================================================================

pub fn returns(bars: &[Bar]) -> Vec<f64> {
    bars.windows(2)
        .map(|w| {
            if w[0].close > 0.0 {
                w[1].close / w[0].close - 1.0
            } else {
                0.0
            }
        })
        .collect()
}

pub fn mean(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        return 0.0;
    }
    xs.iter().sum::<f64>() / xs.len() as f64
}

pub fn std_dev(xs: &[f64]) -> f64 {
    if xs.len() < 2 {
        return 0.0;
    }
    let m = mean(xs);
    let var = xs.iter().map(|x| (x - m).powi(2)).sum::<f64>() / (xs.len() as f64 - 1.0);
    var.sqrt()
}

pub fn pearson(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len().min(b.len());
    if n < 2 {
        return 0.0;
    }
    let (a, b) = (&a[..n], &b[..n]);
    let (ma, mb) = (mean(a), mean(b));
    let mut cov = 0.0;
    let mut va = 0.0;
    let mut vb = 0.0;
    for i in 0..n {
        let (da, db) = (a[i] - ma, b[i] - mb);
        cov += da * db;
        va += da * da;
        vb += db * db;
    }
    if va <= 0.0 || vb <= 0.0 {
        return 0.0;
    }
    cov / (va.sqrt() * vb.sqrt())
}

/// Highest pairwise return correlation among the given symbols.
pub fn max_pairwise_correlation(
    history: &HashMap<String, Vec<Bar>>,
    symbols: &[String],
) -> f64 {
    let series: Vec<Vec<f64>> = symbols
        .iter()
        .filter_map(|s| history.get(s))
        .map(|bars| returns(bars))
        .collect();
    let mut max_corr = 0.0_f64;
    for i in 0..series.len() {
        for j in (i + 1)..series.len() {
            max_corr = max_corr.max(pearson(&series[i], &series[j]).abs());
        }
    }
    max_corr
}
