use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

// ─── Bybit ────────────────────────────────────────────────────────────────────
pub const BYBIT_REST_URL: &str = "https://api-demo.bybit.com";
pub const BYBIT_PUBLIC_REST_URL: &str = "https://api.bybit.com";
pub const BYBIT_WS_URL: &str = "wss://stream.bybit.com/v5/public/linear";
// BYBIT_API_KEY, BYBIT_SECRET, TELEGRAM_TOKEN, TELEGRAM_CHAT_ID
// are read from environment variables at runtime.

/// Every collaborator call is bounded by this.
pub const NETWORK_TIMEOUT: Duration = Duration::from_secs(10);
/// Order writes; longer than the HTTP client's own per-request timeout.
pub const ORDER_TIMEOUT: Duration = Duration::from_secs(20);

// ─── Market data ──────────────────────────────────────────────────────────────
pub const TF_ENTRY: &str = "60";  // 1H structure and entry
pub const TF_HTF_4H: &str = "240";
pub const TF_HTF_1D: &str = "D";
pub const OHLCV_LIMIT: usize = 150;
pub const HTF_LIMIT: usize = 100;
pub const MIN_CANDLES: usize = 50;
pub const ATR_WINDOW: usize = 14;

// ─── Confidence ───────────────────────────────────────────────────────────────
pub const ADMISSION_THRESHOLD: i64 = 40;
pub const VOLUME_SPIKE_MULT: f64 = 1.8;
pub const LIQ_NEARBY_WINDOW_SECS: i64 = 300;
pub const LIQ_LARGE_USDT: f64 = 100_000.0;

// ─── Stops / targets ──────────────────────────────────────────────────────────
pub const DEFAULT_SL_PCT: f64 = 0.01;
pub const DEFAULT_SL_MULT: f64 = 1.0;
pub const DEFAULT_RR: f64 = 2.0;
pub const DEFAULT_PRICE_DECIMALS: u32 = 2;

// ─── Risk ─────────────────────────────────────────────────────────────────────
pub const MIN_RISK_PCT: f64 = 0.002;
pub const MAX_RISK_PCT: f64 = 0.01;
pub const DAILY_LOSS_LIMIT_PCT: f64 = 0.03;
pub const MAX_DRAWDOWN_PCT: f64 = 0.05;
pub const MAX_TRADES_PER_DAY: u32 = 20;

// ─── Entry gate ───────────────────────────────────────────────────────────────
pub const ENTRY_TIMEOUT_SECS: i64 = 30 * 60;
pub const REENTRY_DEVIATION_PCT: f64 = 0.01;
pub const HALT_FLAG: &str = "halt.flag";
pub const PAUSE_FLAG: &str = "pause.flag";

// ─── Position lifecycle ───────────────────────────────────────────────────────
pub const MONITOR_POLL: Duration = Duration::from_secs(10);
pub const BREAK_EVEN_RR: f64 = 1.0;
pub const TRAILING_START_RR: f64 = 1.5;
pub const TRAILING_DISTANCE: f64 = 0.005;

// ─── Circuit breaker ──────────────────────────────────────────────────────────
pub const LOSS_STREAK_LIMIT: u32 = 3;
pub const COOLDOWN_MINUTES: i64 = 120;
pub const LIQUIDATION_THRESHOLD_USDT: f64 = 50_000.0;
pub const REGIME_HIGH_COUNT: u32 = 20;
pub const REGIME_LOW_COUNT: u32 = 3;
pub const REGIME_EVAL_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const EMERGENCY_COUNT: usize = 5;
pub const EMERGENCY_MIN_VALUE_USDT: f64 = 500_000.0;
pub const EMERGENCY_WINDOW_SECS: i64 = 300;
pub const RECENT_LIQUIDATIONS_CAP: usize = 100;
// (risk_pct, rr) per regime
pub const REGIME_DEFENSIVE: (f64, f64) = (0.003, 1.2);
pub const REGIME_NORMAL: (f64, f64) = (0.01, 2.0);
pub const REGIME_AGGRESSIVE: (f64, f64) = (0.015, 3.0);
pub const CONNECTIVITY_FAIL_LIMIT: u32 = 3;
pub const WATCHDOG_INTERVAL: Duration = Duration::from_secs(60);

// ─── Orchestrator ─────────────────────────────────────────────────────────────
pub const CYCLE_INTERVAL: Duration = Duration::from_secs(30);
pub const COOLDOWN_CYCLE_INTERVAL: Duration = Duration::from_secs(90);
pub const TOP_N_SYMBOLS: usize = 10;
pub const SYMBOL_RANK_CANDLES: usize = 50;
/// Used when TRADING_PAIRS is set to the literal "default".
pub const TRADING_PAIRS: &[&str] = &["BTCUSDT", "ETHUSDT", "BNBUSDT", "XRPUSDT", "SOLUSDT"];
pub const MAX_LEVERAGE: u32 = 3;

// ─── Background tasks ─────────────────────────────────────────────────────────
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const BALANCE_ALERT_PCT: f64 = 0.05;
pub const WEIGHTS_RELOAD_INTERVAL: Duration = Duration::from_secs(60);
pub const LIQ_WS_RECONNECT_DELAY: Duration = Duration::from_secs(10);
pub const SUPERVISOR_RESTART_DELAY: Duration = Duration::from_secs(30);

/// Runtime settings: secrets from the environment plus optional overrides of
/// the defaults above.
#[derive(Clone, Debug)]
pub struct Settings {
    pub api_key: String,
    pub api_secret: String,
    pub rest_url: String,
    pub telegram_token: Option<String>,
    pub telegram_chat_id: Option<String>,
    pub live_mode: bool,
    /// Empty means "rank all USDT linear symbols and keep the top N".
    pub trading_pairs: Vec<String>,
    pub top_n_symbols: usize,
    pub max_trades_per_day: u32,
    pub max_leverage: u32,
    pub weights_path: PathBuf,
    pub sltp_path: PathBuf,
    pub journal_path: PathBuf,
    pub signal_log_path: PathBuf,
    pub halt_flag: PathBuf,
    pub pause_flag: PathBuf,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = required("BYBIT_API_KEY")?;
        let api_secret = required("BYBIT_SECRET")?;

        let trading_pairs = match std::env::var("TRADING_PAIRS") {
            Ok(raw) if raw.trim() == "default" => {
                TRADING_PAIRS.iter().map(|s| s.to_string()).collect()
            }
            Ok(raw) => parse_pairs(&raw),
            Err(_) => Vec::new(),
        };

        Ok(Settings {
            api_key,
            api_secret,
            rest_url: std::env::var("BYBIT_REST_URL").unwrap_or_else(|_| BYBIT_REST_URL.to_string()),
            telegram_token: optional("TELEGRAM_TOKEN"),
            telegram_chat_id: optional("TELEGRAM_CHAT_ID"),
            live_mode: env_or("LIVE_MODE", false)?,
            trading_pairs,
            top_n_symbols: env_or("TOP_N_SYMBOLS", TOP_N_SYMBOLS)?,
            max_trades_per_day: env_or("MAX_TRADES_PER_DAY", MAX_TRADES_PER_DAY)?,
            max_leverage: env_or("MAX_LEVERAGE", MAX_LEVERAGE)?,
            weights_path: env_or("WEIGHTS_PATH", PathBuf::from("config/best_weights.json"))?,
            sltp_path: env_or("SLTP_PATH", PathBuf::from("config/sl_tp_weights.json"))?,
            journal_path: env_or("JOURNAL_PATH", PathBuf::from("logs/trade_journal.csv"))?,
            signal_log_path: env_or("SIGNAL_LOG_PATH", PathBuf::from("logs/signals.jsonl"))?,
            halt_flag: env_or("HALT_FLAG_PATH", PathBuf::from(HALT_FLAG))?,
            pause_flag: env_or("PAUSE_FLAG_PATH", PathBuf::from(PAUSE_FLAG))?,
        })
    }
}

fn required(key: &'static str) -> Result<String, ConfigError> {
    optional(key).ok_or(ConfigError::MissingEnv(key))
}

fn optional(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_or<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match optional(key) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidEnv { key, value: raw }),
        None => Ok(default),
    }
}

/// "btcusdt, ETHUSDT,," → ["BTCUSDT", "ETHUSDT"]
pub fn parse_pairs(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}
