/// Hard portfolio limits enforced by the risk guard.
#[derive(Clone, Debug, PartialEq)]
pub struct RiskLimits {
    /// Fraction of day-start equity that may be lost before trading halts.
    pub max_daily_loss_pct: f64,
    /// Largest single-position notional as a fraction of equity.
    pub max_position_pct: f64,
    pub max_leverage: f64,
    pub max_drawdown_pct: f64,
    /// Highest tolerated pairwise exposure correlation.
    pub max_correlation: f64,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub limits: RiskLimits,
    pub symbols: Vec<String>,
    pub stage_timeout_secs: u64,
    pub stage_retries: u32,
    pub retry_base_delay_ms: u64,
    pub data_timeout_ms: u64,
    /// Orders are only submitted when this is set. Defaults to off; every
    /// other stage still runs so the pipeline can be observed dry.
    pub auto_trading: bool,
    pub enable_factor_discovery: bool,
    pub enable_learning: bool,
    pub sqlite_path: String,
    pub wal_path: String,
    pub kill_file: String,
    pub initial_capital: f64,
    pub min_confidence: f64,
    /// Exponential decay applied to rolling factor scores on each update.
    pub learning_decay: f64,
    /// Consecutive losing cycles before a factor is excluded.
    pub exclusion_streak: u32,
    pub history_bars: usize,
    pub fee_rate: f64,
    pub slip_rate: f64,
    /// How many recent risk events the status report carries.
    pub risk_event_window: usize,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            limits: RiskLimits {
                max_daily_loss_pct: std::env::var("MAX_DAILY_LOSS_PCT").ok().and_then(|v| v.parse().ok()).unwrap_or(0.02),
                max_position_pct: std::env::var("MAX_POSITION_PCT").ok().and_then(|v| v.parse().ok()).unwrap_or(0.10),
                max_leverage: std::env::var("MAX_LEVERAGE").ok().and_then(|v| v.parse().ok()).unwrap_or(1.0),
                max_drawdown_pct: std::env::var("MAX_DRAWDOWN_PCT").ok().and_then(|v| v.parse().ok()).unwrap_or(0.20),
                max_correlation: std::env::var("MAX_CORRELATION").ok().and_then(|v| v.parse().ok()).unwrap_or(0.7),
            },
            symbols: std::env::var("SYMBOLS")
                .unwrap_or_else(|_| "BTCUSDT,ETHUSDT,SOLUSDT".to_string())
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            stage_timeout_secs: std::env::var("STAGE_TIMEOUT_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(30),
            stage_retries: std::env::var("STAGE_RETRIES").ok().and_then(|v| v.parse().ok()).unwrap_or(2),
            retry_base_delay_ms: std::env::var("RETRY_BASE_DELAY_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(100),
            data_timeout_ms: std::env::var("DATA_TIMEOUT_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(5000),
            auto_trading: env_flag("AUTO_TRADING", false),
            enable_factor_discovery: env_flag("ENABLE_FACTOR_DISCOVERY", true),
            enable_learning: env_flag("ENABLE_LEARNING", true),
            sqlite_path: std::env::var("SQLITE_PATH").unwrap_or_else(|_| "./alphaloop.sqlite".to_string()),
            wal_path: std::env::var("WAL_PATH").unwrap_or_else(|_| "./alphaloop.wal".to_string()),
            kill_file: std::env::var("KILL_FILE").unwrap_or_else(|_| "/tmp/STOP".to_string()),
            initial_capital: std::env::var("INITIAL_CAPITAL").ok().and_then(|v| v.parse().ok()).unwrap_or(100_000.0),
            min_confidence: std::env::var("MIN_CONFIDENCE").ok().and_then(|v| v.parse().ok()).unwrap_or(0.3),
            learning_decay: std::env::var("LEARNING_DECAY").ok().and_then(|v| v.parse().ok()).unwrap_or(0.9),
            exclusion_streak: std::env::var("EXCLUSION_STREAK").ok().and_then(|v| v.parse().ok()).unwrap_or(5),
            history_bars: std::env::var("HISTORY_BARS").ok().and_then(|v| v.parse().ok()).unwrap_or(120),
            fee_rate: std::env::var("FEE_RATE").ok().and_then(|v| v.parse().ok()).unwrap_or(0.0004),
            slip_rate: std::env::var("SLIP_RATE").ok().and_then(|v| v.parse().ok()).unwrap_or(0.0002),
            risk_event_window: std::env::var("RISK_EVENT_WINDOW").ok().and_then(|v| v.parse().ok()).unwrap_or(20),
        }
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

pub fn now_ts() -> u64 {
    chrono::Utc::now().timestamp() as u64
}
