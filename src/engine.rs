use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::env;
use std::error::Error;
use std::fmt;
use std::fs;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use tokio::time::Duration;

use crate::alert_notifier::notify_alert;
use crate::broker::{retry_read, Broker, BrokerError, MarketSnapshot};
use crate::config::{BrokerSettings, RunMode};
use crate::regime::{self, Regime, RegimeModel, RegimeState};
use crate::risk::{
    correlation, portfolio_block, position_fraction, EntryBlock, PortfolioRiskState, RiskLimits,
    SizingConfig, TradeStats,
};
use crate::stats::{
    align_series, dynamic_thresholds, estimate_pair, reversion_speed, tail_std,
    CointegrationResult, PricePoint, SpreadModel, Thresholds, ZScoreSignal,
};
use crate::trade::execution::broker_box::BrokerBox;
use crate::trade::execution::lifecycle::{
    ClosedLeg, EntryOutcome, ExecState, ExitTrigger, LegPlan, OpenLeg, SpreadDirection,
    TradeLifecycle,
};

const DEFAULT_INTERVAL_SECS: u64 = 20;
const DEFAULT_TRADING_PERIOD_SECS: u64 = 60;
const DEFAULT_TRAINING_WINDOW_BARS: usize = 480;
const DEFAULT_MIN_TRAINING_SAMPLES: usize = 60;
const DEFAULT_RETRAIN_SECS: u64 = 3600;
const DEFAULT_ENTRY_Z_BASE: f64 = 2.0;
const DEFAULT_EXIT_Z_BASE: f64 = 1.0;
const DEFAULT_STOP_LOSS_Z: f64 = 4.0;
const DEFAULT_TAKE_PROFIT_Z: f64 = 0.0;
const DEFAULT_MAX_HOLDING_SECS: u64 = 259_200;
const DEFAULT_COOLDOWN_SECS: u64 = 1800;
const DEFAULT_ADF_P_THRESHOLD: f64 = 0.05;
const DEFAULT_HALF_LIFE_MIN_DAYS: f64 = 1.0;
const DEFAULT_HALF_LIFE_MAX_DAYS: f64 = 60.0;
const DEFAULT_REGIME_CONFIDENCE_FLOOR: f64 = 0.60;
const DEFAULT_ALLOW_TRENDING_ENTRIES: bool = false;
const DEFAULT_KELLY_MULTIPLIER: f64 = 0.5;
const DEFAULT_MAX_POSITION_FRACTION: f64 = 0.25;
const DEFAULT_FALLBACK_FRACTION: f64 = 0.10;
const DEFAULT_MIN_TRADES_FOR_KELLY: usize = 20;
const DEFAULT_TRADE_STATS_CAPACITY: usize = 200;
const DEFAULT_MAX_DRAWDOWN: f64 = 0.20;
const DEFAULT_MAX_LEVERAGE: f64 = 2.0;
const DEFAULT_MAX_DAILY_LOSS: f64 = 0.05;
const DEFAULT_MAX_PAIR_CORRELATION: f64 = 0.7;
const DEFAULT_MAX_OPEN_POSITIONS: usize = 5;
const DEFAULT_CORRELATION_WINDOW_BARS: usize = 120;
const DEFAULT_RECENT_VOL_BARS: usize = 60;
const DEFAULT_FEE_BPS: f64 = 2.0;
const DEFAULT_SLIPPAGE_BPS: f64 = 3.0;
const DEFAULT_CONFIRM_TIMEOUT_SECS: u64 = 30;
const DEFAULT_EQUITY_REFRESH_SECS: u64 = 60;
const DEFAULT_PAIR_MAX_UNITS: i64 = 1_000_000;
const DEFAULT_TRADE_LOG_RETAIN_DAYS: u64 = 7;
const TRADE_LOG_CLEANUP_INTERVAL_SECS: u64 = 21_600;
const REGIME_MIN_SAMPLES: usize = 30;
const STATUS_TARGET_SECS: u64 = 60;

#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
enum StringOrVec {
    String(String),
    Vec(Vec<String>),
}

impl StringOrVec {
    fn into_vec(self) -> Vec<String> {
        match self {
            StringOrVec::String(value) => value
                .split(',')
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty())
                .collect(),
            StringOrVec::Vec(values) => values
                .into_iter()
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty())
                .collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PairDefinition {
    pub symbol_a: String,
    pub symbol_b: String,
    pub allocation: f64,
    pub max_position_size: Decimal,
}

impl PairDefinition {
    pub fn key(&self) -> String {
        format!("{}/{}", self.symbol_a, self.symbol_b)
    }
}

/// Parses `SYM_A/SYM_B[:allocation[:max_units]]` entries. Pairs without an
/// explicit allocation share capital evenly.
fn resolve_pairs(items: Vec<String>) -> Result<Vec<PairDefinition>> {
    let mut parsed = Vec::new();
    for raw in &items {
        let mut fields = raw.split(':');
        let symbols = fields
            .next()
            .ok_or_else(|| anyhow!("empty pair entry"))?
            .trim();
        let (symbol_a, symbol_b) = symbols
            .split_once('/')
            .ok_or_else(|| anyhow!("pair '{}' must look like AAA/BBB", raw))?;
        let symbol_a = symbol_a.trim();
        let symbol_b = symbol_b.trim();
        if symbol_a.is_empty() || symbol_b.is_empty() {
            return Err(anyhow!("pair '{}' must look like AAA/BBB", raw));
        }
        let allocation = match fields.next() {
            Some(value) => Some(
                value
                    .trim()
                    .parse::<f64>()
                    .map_err(|_| anyhow!("invalid allocation in pair '{}'", raw))?,
            ),
            None => None,
        };
        let max_units = match fields.next() {
            Some(value) => Some(
                value
                    .trim()
                    .parse::<Decimal>()
                    .map_err(|_| anyhow!("invalid max size in pair '{}'", raw))?,
            ),
            None => None,
        };
        if let Some(alloc) = allocation {
            if alloc <= 0.0 || alloc > 1.0 {
                return Err(anyhow!("allocation in pair '{}' must be in (0, 1]", raw));
            }
        }
        parsed.push((symbol_a.to_string(), symbol_b.to_string(), allocation, max_units));
    }
    if parsed.is_empty() {
        return Ok(Vec::new());
    }
    let default_alloc = 1.0 / parsed.len() as f64;
    Ok(parsed
        .into_iter()
        .map(|(symbol_a, symbol_b, allocation, max_units)| PairDefinition {
            symbol_a,
            symbol_b,
            allocation: allocation.unwrap_or(default_alloc),
            max_position_size: max_units.unwrap_or_else(|| Decimal::from(DEFAULT_PAIR_MAX_UNITS)),
        })
        .collect())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
struct EngineYaml {
    interval_secs: Option<u64>,
    trading_period_secs: Option<u64>,
    training_window_bars: Option<usize>,
    min_training_samples: Option<usize>,
    retrain_secs: Option<u64>,
    entry_z_base: Option<f64>,
    exit_z_base: Option<f64>,
    stop_loss_z: Option<f64>,
    take_profit_z: Option<f64>,
    max_holding_secs: Option<u64>,
    cooldown_secs: Option<u64>,
    adf_p_threshold: Option<f64>,
    half_life_min_days: Option<f64>,
    half_life_max_days: Option<f64>,
    regime_confidence_floor: Option<f64>,
    allow_trending_entries: Option<bool>,
    kelly_multiplier: Option<f64>,
    max_position_fraction: Option<f64>,
    fallback_fraction: Option<f64>,
    min_trades_for_kelly: Option<usize>,
    trade_stats_capacity: Option<usize>,
    max_drawdown: Option<f64>,
    max_leverage: Option<f64>,
    max_daily_loss: Option<f64>,
    max_pair_correlation: Option<f64>,
    max_open_positions: Option<usize>,
    correlation_window_bars: Option<usize>,
    recent_vol_bars: Option<usize>,
    fee_bps: Option<f64>,
    slippage_bps: Option<f64>,
    confirm_timeout_secs: Option<u64>,
    equity_refresh_secs: Option<u64>,
    size_step: Option<String>,
    state_dir: Option<String>,
    pairs: Option<StringOrVec>,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub interval_secs: u64,
    pub trading_period_secs: u64,
    pub training_window_bars: usize,
    pub min_training_samples: usize,
    pub retrain_secs: u64,
    pub entry_z_base: f64,
    pub exit_z_base: f64,
    pub stop_loss_z: f64,
    pub take_profit_z: f64,
    pub max_holding_secs: u64,
    pub cooldown_secs: u64,
    pub p_value_threshold: f64,
    pub half_life_min_days: f64,
    pub half_life_max_days: f64,
    pub regime_confidence_floor: f64,
    pub allow_trending_entries: bool,
    pub kelly_multiplier: f64,
    pub max_position_fraction: f64,
    pub fallback_fraction: f64,
    pub min_trades_for_kelly: usize,
    pub trade_stats_capacity: usize,
    pub max_drawdown: f64,
    pub max_leverage: f64,
    pub max_daily_loss: f64,
    pub max_pair_correlation: f64,
    pub max_open_positions: usize,
    pub correlation_window_bars: usize,
    pub recent_vol_bars: usize,
    pub fee_bps: f64,
    pub slippage_bps: f64,
    pub confirm_timeout_secs: u64,
    pub equity_refresh_secs: u64,
    pub size_step: Decimal,
    pub state_dir: PathBuf,
    pub pairs: Vec<PairDefinition>,
}

impl EngineConfig {
    pub fn from_env_or_yaml() -> Result<Self> {
        let config_path = env::var("STATARB_CONFIG_PATH")
            .ok()
            .filter(|value| !value.trim().is_empty());
        if let Some(path) = config_path {
            return Self::from_yaml_path(path);
        }
        Self::from_env()
    }

    pub fn from_yaml_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let file = File::open(path_ref)
            .with_context(|| format!("failed to open engine config {}", path_ref.display()))?;
        let yaml: EngineYaml = serde_yaml::from_reader(file)
            .with_context(|| format!("failed to parse engine config {}", path_ref.display()))?;

        let mut cfg = Self::defaults();
        if let Some(v) = yaml.interval_secs {
            cfg.interval_secs = v;
        }
        if let Some(v) = yaml.trading_period_secs {
            cfg.trading_period_secs = v;
        }
        if let Some(v) = yaml.training_window_bars {
            cfg.training_window_bars = v;
        }
        if let Some(v) = yaml.min_training_samples {
            cfg.min_training_samples = v;
        }
        if let Some(v) = yaml.retrain_secs {
            cfg.retrain_secs = v;
        }
        if let Some(v) = yaml.entry_z_base {
            cfg.entry_z_base = v;
        }
        if let Some(v) = yaml.exit_z_base {
            cfg.exit_z_base = v;
        }
        if let Some(v) = yaml.stop_loss_z {
            cfg.stop_loss_z = v;
        }
        if let Some(v) = yaml.take_profit_z {
            cfg.take_profit_z = v;
        }
        if let Some(v) = yaml.max_holding_secs {
            cfg.max_holding_secs = v;
        }
        if let Some(v) = yaml.cooldown_secs {
            cfg.cooldown_secs = v;
        }
        if let Some(v) = yaml.adf_p_threshold {
            cfg.p_value_threshold = v;
        }
        if let Some(v) = yaml.half_life_min_days {
            cfg.half_life_min_days = v;
        }
        if let Some(v) = yaml.half_life_max_days {
            cfg.half_life_max_days = v;
        }
        if let Some(v) = yaml.regime_confidence_floor {
            cfg.regime_confidence_floor = v;
        }
        if let Some(v) = yaml.allow_trending_entries {
            cfg.allow_trending_entries = v;
        }
        if let Some(v) = yaml.kelly_multiplier {
            cfg.kelly_multiplier = v;
        }
        if let Some(v) = yaml.max_position_fraction {
            cfg.max_position_fraction = v;
        }
        if let Some(v) = yaml.fallback_fraction {
            cfg.fallback_fraction = v;
        }
        if let Some(v) = yaml.min_trades_for_kelly {
            cfg.min_trades_for_kelly = v;
        }
        if let Some(v) = yaml.trade_stats_capacity {
            cfg.trade_stats_capacity = v;
        }
        if let Some(v) = yaml.max_drawdown {
            cfg.max_drawdown = v;
        }
        if let Some(v) = yaml.max_leverage {
            cfg.max_leverage = v;
        }
        if let Some(v) = yaml.max_daily_loss {
            cfg.max_daily_loss = v;
        }
        if let Some(v) = yaml.max_pair_correlation {
            cfg.max_pair_correlation = v;
        }
        if let Some(v) = yaml.max_open_positions {
            cfg.max_open_positions = v;
        }
        if let Some(v) = yaml.correlation_window_bars {
            cfg.correlation_window_bars = v;
        }
        if let Some(v) = yaml.recent_vol_bars {
            cfg.recent_vol_bars = v;
        }
        if let Some(v) = yaml.fee_bps {
            cfg.fee_bps = v;
        }
        if let Some(v) = yaml.slippage_bps {
            cfg.slippage_bps = v;
        }
        if let Some(v) = yaml.confirm_timeout_secs {
            cfg.confirm_timeout_secs = v;
        }
        if let Some(v) = yaml.equity_refresh_secs {
            cfg.equity_refresh_secs = v;
        }
        if let Some(v) = yaml.size_step {
            cfg.size_step = v
                .trim()
                .parse()
                .map_err(|e| anyhow!("invalid size_step in {}: {}", path_ref.display(), e))?;
        }
        if let Some(v) = yaml.state_dir {
            cfg.state_dir = PathBuf::from(v);
        }
        if let Some(raw) = yaml.pairs {
            cfg.pairs = resolve_pairs(raw.into_vec())?;
        }

        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::defaults();
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn defaults() -> Self {
        Self {
            interval_secs: DEFAULT_INTERVAL_SECS,
            trading_period_secs: DEFAULT_TRADING_PERIOD_SECS,
            training_window_bars: DEFAULT_TRAINING_WINDOW_BARS,
            min_training_samples: DEFAULT_MIN_TRAINING_SAMPLES,
            retrain_secs: DEFAULT_RETRAIN_SECS,
            entry_z_base: DEFAULT_ENTRY_Z_BASE,
            exit_z_base: DEFAULT_EXIT_Z_BASE,
            stop_loss_z: DEFAULT_STOP_LOSS_Z,
            take_profit_z: DEFAULT_TAKE_PROFIT_Z,
            max_holding_secs: DEFAULT_MAX_HOLDING_SECS,
            cooldown_secs: DEFAULT_COOLDOWN_SECS,
            p_value_threshold: DEFAULT_ADF_P_THRESHOLD,
            half_life_min_days: DEFAULT_HALF_LIFE_MIN_DAYS,
            half_life_max_days: DEFAULT_HALF_LIFE_MAX_DAYS,
            regime_confidence_floor: DEFAULT_REGIME_CONFIDENCE_FLOOR,
            allow_trending_entries: DEFAULT_ALLOW_TRENDING_ENTRIES,
            kelly_multiplier: DEFAULT_KELLY_MULTIPLIER,
            max_position_fraction: DEFAULT_MAX_POSITION_FRACTION,
            fallback_fraction: DEFAULT_FALLBACK_FRACTION,
            min_trades_for_kelly: DEFAULT_MIN_TRADES_FOR_KELLY,
            trade_stats_capacity: DEFAULT_TRADE_STATS_CAPACITY,
            max_drawdown: DEFAULT_MAX_DRAWDOWN,
            max_leverage: DEFAULT_MAX_LEVERAGE,
            max_daily_loss: DEFAULT_MAX_DAILY_LOSS,
            max_pair_correlation: DEFAULT_MAX_PAIR_CORRELATION,
            max_open_positions: DEFAULT_MAX_OPEN_POSITIONS,
            correlation_window_bars: DEFAULT_CORRELATION_WINDOW_BARS,
            recent_vol_bars: DEFAULT_RECENT_VOL_BARS,
            fee_bps: DEFAULT_FEE_BPS,
            slippage_bps: DEFAULT_SLIPPAGE_BPS,
            confirm_timeout_secs: DEFAULT_CONFIRM_TIMEOUT_SECS,
            equity_refresh_secs: DEFAULT_EQUITY_REFRESH_SECS,
            size_step: Decimal::new(1, 4),
            state_dir: default_state_dir(),
            pairs: Vec::new(),
        }
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(value) = env::var("INTERVAL_SECS") {
            if let Ok(parsed) = value.parse() {
                self.interval_secs = parsed;
            }
        }
        if let Ok(value) = env::var("TRADING_PERIOD_SECS") {
            if let Ok(parsed) = value.parse() {
                self.trading_period_secs = parsed;
            }
        }
        if let Ok(value) = env::var("TRAINING_WINDOW_BARS") {
            if let Ok(parsed) = value.parse() {
                self.training_window_bars = parsed;
            }
        }
        if let Ok(value) = env::var("MIN_TRAINING_SAMPLES") {
            if let Ok(parsed) = value.parse() {
                self.min_training_samples = parsed;
            }
        }
        if let Ok(value) = env::var("RETRAIN_SECS") {
            if let Ok(parsed) = value.parse() {
                self.retrain_secs = parsed;
            }
        }
        if let Ok(value) = env::var("ENTRY_Z_BASE") {
            if let Ok(parsed) = value.parse() {
                self.entry_z_base = parsed;
            }
        }
        if let Ok(value) = env::var("EXIT_Z_BASE") {
            if let Ok(parsed) = value.parse() {
                self.exit_z_base = parsed;
            }
        }
        if let Ok(value) = env::var("STOP_LOSS_Z") {
            if let Ok(parsed) = value.parse() {
                self.stop_loss_z = parsed;
            }
        }
        if let Ok(value) = env::var("TAKE_PROFIT_Z") {
            if let Ok(parsed) = value.parse() {
                self.take_profit_z = parsed;
            }
        }
        if let Ok(value) = env::var("MAX_HOLDING_SECS") {
            if let Ok(parsed) = value.parse() {
                self.max_holding_secs = parsed;
            }
        }
        if let Ok(value) = env::var("COOLDOWN_SECS") {
            if let Ok(parsed) = value.parse() {
                self.cooldown_secs = parsed;
            }
        }
        if let Ok(value) = env::var("ADF_P_THRESHOLD") {
            if let Ok(parsed) = value.parse() {
                self.p_value_threshold = parsed;
            }
        }
        if let Ok(value) = env::var("HALF_LIFE_MIN_DAYS") {
            if let Ok(parsed) = value.parse() {
                self.half_life_min_days = parsed;
            }
        }
        if let Ok(value) = env::var("HALF_LIFE_MAX_DAYS") {
            if let Ok(parsed) = value.parse() {
                self.half_life_max_days = parsed;
            }
        }
        if let Ok(value) = env::var("REGIME_CONFIDENCE_FLOOR") {
            if let Ok(parsed) = value.parse() {
                self.regime_confidence_floor = parsed;
            }
        }
        if let Ok(value) = env::var("ALLOW_TRENDING_ENTRIES") {
            self.allow_trending_entries = parse_bool(&value);
        }
        if let Ok(value) = env::var("KELLY_MULTIPLIER") {
            if let Ok(parsed) = value.parse() {
                self.kelly_multiplier = parsed;
            }
        }
        if let Ok(value) = env::var("MAX_POSITION_FRACTION") {
            if let Ok(parsed) = value.parse() {
                self.max_position_fraction = parsed;
            }
        }
        if let Ok(value) = env::var("FALLBACK_FRACTION") {
            if let Ok(parsed) = value.parse() {
                self.fallback_fraction = parsed;
            }
        }
        if let Ok(value) = env::var("MIN_TRADES_FOR_KELLY") {
            if let Ok(parsed) = value.parse() {
                self.min_trades_for_kelly = parsed;
            }
        }
        if let Ok(value) = env::var("TRADE_STATS_CAPACITY") {
            if let Ok(parsed) = value.parse() {
                self.trade_stats_capacity = parsed;
            }
        }
        if let Ok(value) = env::var("MAX_DRAWDOWN") {
            if let Ok(parsed) = value.parse() {
                self.max_drawdown = parsed;
            }
        }
        if let Ok(value) = env::var("MAX_LEVERAGE") {
            if let Ok(parsed) = value.parse() {
                self.max_leverage = parsed;
            }
        }
        if let Ok(value) = env::var("MAX_DAILY_LOSS") {
            if let Ok(parsed) = value.parse() {
                self.max_daily_loss = parsed;
            }
        }
        if let Ok(value) = env::var("MAX_PAIR_CORRELATION") {
            if let Ok(parsed) = value.parse() {
                self.max_pair_correlation = parsed;
            }
        }
        if let Ok(value) = env::var("MAX_OPEN_POSITIONS") {
            if let Ok(parsed) = value.parse() {
                self.max_open_positions = parsed;
            }
        }
        if let Ok(value) = env::var("CORRELATION_WINDOW_BARS") {
            if let Ok(parsed) = value.parse() {
                self.correlation_window_bars = parsed;
            }
        }
        if let Ok(value) = env::var("RECENT_VOL_BARS") {
            if let Ok(parsed) = value.parse() {
                self.recent_vol_bars = parsed;
            }
        }
        if let Ok(value) = env::var("FEE_BPS") {
            if let Ok(parsed) = value.parse() {
                self.fee_bps = parsed;
            }
        }
        if let Ok(value) = env::var("SLIPPAGE_BPS") {
            if let Ok(parsed) = value.parse() {
                self.slippage_bps = parsed;
            }
        }
        if let Ok(value) = env::var("CONFIRM_TIMEOUT_SECS") {
            if let Ok(parsed) = value.parse() {
                self.confirm_timeout_secs = parsed;
            }
        }
        if let Ok(value) = env::var("EQUITY_REFRESH_SECS") {
            if let Ok(parsed) = value.parse() {
                self.equity_refresh_secs = parsed;
            }
        }
        if let Ok(value) = env::var("SIZE_STEP") {
            if let Ok(parsed) = value.trim().parse() {
                self.size_step = parsed;
            }
        }
        if let Ok(value) = env::var("STATARB_STATE_DIR") {
            if !value.trim().is_empty() {
                self.state_dir = PathBuf::from(value);
            }
        }
        if let Ok(value) = env::var("PAIRS") {
            if !value.trim().is_empty() {
                self.pairs = resolve_pairs(StringOrVec::String(value).into_vec())?;
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.pairs.is_empty() {
            return Err(anyhow!(
                "no pairs configured; set PAIRS or provide a config file"
            ));
        }
        let mut seen = HashSet::new();
        for pair in &self.pairs {
            if !seen.insert(pair.key()) {
                return Err(anyhow!("pair {} configured twice", pair.key()));
            }
        }
        if self.exit_z_base >= self.entry_z_base {
            return Err(anyhow!(
                "exit z base {} must sit below entry z base {}",
                self.exit_z_base,
                self.entry_z_base
            ));
        }
        if self.stop_loss_z <= self.entry_z_base {
            return Err(anyhow!(
                "stop loss z {} must exceed entry z base {}",
                self.stop_loss_z,
                self.entry_z_base
            ));
        }
        if self.trading_period_secs == 0 {
            return Err(anyhow!("trading period must be at least one second"));
        }
        let alloc_sum: f64 = self.pairs.iter().map(|p| p.allocation).sum();
        if alloc_sum > 1.0 + 1e-9 {
            log::warn!(
                "[CONFIG] pair allocations sum to {:.2}, capital is over-committed",
                alloc_sum
            );
        }
        Ok(())
    }

    pub fn risk_limits(&self) -> RiskLimits {
        RiskLimits {
            max_drawdown: self.max_drawdown,
            max_leverage: self.max_leverage,
            max_daily_loss: self.max_daily_loss,
            max_pair_correlation: self.max_pair_correlation,
            max_open_positions: self.max_open_positions,
        }
    }

    pub fn sizing(&self) -> SizingConfig {
        SizingConfig {
            kelly_multiplier: self.kelly_multiplier,
            max_fraction: self.max_position_fraction,
            fallback_fraction: self.fallback_fraction,
            min_trades: self.min_trades_for_kelly,
        }
    }

    fn window_bars(&self) -> usize {
        self.correlation_window_bars.max(self.recent_vol_bars).max(8)
    }

    fn max_history_bars(&self) -> usize {
        self.training_window_bars.max(self.window_bars())
    }
}

fn default_state_dir() -> PathBuf {
    env::var("HOME")
        .map(|home| PathBuf::from(home).join("statarb_state"))
        .unwrap_or_else(|_| PathBuf::from("statarb_state"))
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[derive(Debug)]
pub enum EngineError {
    InsufficientData { needed: usize, got: usize },
    DegenerateStatistic(String),
    CointegrationLost { pair: String, p_value: f64 },
    Broker(BrokerError),
    PartialFillInconsistency(String),
    RiskLimitBreached(&'static str),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::InsufficientData { needed, got } => {
                write!(f, "insufficient data: needed {}, got {}", needed, got)
            }
            EngineError::DegenerateStatistic(msg) => write!(f, "degenerate statistic: {}", msg),
            EngineError::CointegrationLost { pair, p_value } => {
                write!(f, "cointegration lost on {} (p={:.3})", pair, p_value)
            }
            EngineError::Broker(err) => write!(f, "broker error: {}", err),
            EngineError::PartialFillInconsistency(msg) => {
                write!(f, "partial fill inconsistency: {}", msg)
            }
            EngineError::RiskLimitBreached(reason) => write!(f, "risk limit breached: {}", reason),
        }
    }
}

impl Error for EngineError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            EngineError::Broker(err) => Some(err),
            _ => None,
        }
    }
}

impl From<BrokerError> for EngineError {
    fn from(err: BrokerError) -> Self {
        EngineError::Broker(err)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub ts: i64,
    pub pair_id: String,
    pub direction: String,
    pub entry_time: i64,
    pub exit_time: i64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub size: Decimal,
    pub pnl: f64,
    pub regime_at_entry: String,
    pub trigger: String,
}

/// Daily JSONL journal of completed trades. Files older than the retention
/// window are removed opportunistically while logging.
pub struct TradeLogger {
    dir: PathBuf,
    tag: Option<String>,
    retain_days: u64,
    last_cleanup: Option<Instant>,
}

impl TradeLogger {
    pub fn from_env() -> Option<Self> {
        let enabled = env::var("STATARB_TRADE_LOG")
            .map(|v| !matches!(v.trim().to_ascii_lowercase().as_str(), "0" | "false" | "off"))
            .unwrap_or(true);
        if !enabled {
            return None;
        }
        let dir = env::var("STATARB_TRADE_LOG_DIR")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .or_else(|| {
                env::var("HOME")
                    .ok()
                    .map(|home| PathBuf::from(home).join("statarb_trades"))
            })?;
        let tag = env::var("STATARB_TRADE_LOG_TAG")
            .ok()
            .map(|t| sanitize_tag(&t))
            .filter(|t| !t.is_empty());
        let retain_days = env::var("STATARB_TRADE_LOG_RETAIN_DAYS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_TRADE_LOG_RETAIN_DAYS)
            .max(1);
        Some(Self {
            dir,
            tag,
            retain_days,
            last_cleanup: None,
        })
    }

    pub fn log(&mut self, record: &TradeRecord) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create trade log dir {}", self.dir.display()))?;
        let path = self.log_path();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open trade log {}", path.display()))?;
        let line = serde_json::to_string(record).context("failed to encode trade record")?;
        writeln!(file, "{line}").context("failed to append trade record")?;
        self.maybe_cleanup();
        Ok(())
    }

    fn log_path(&self) -> PathBuf {
        let date = Utc::now().format("%Y%m%d");
        let name = match &self.tag {
            Some(tag) => format!("trades-{}-{}.jsonl", tag, date),
            None => format!("trades-{}.jsonl", date),
        };
        self.dir.join(name)
    }

    fn maybe_cleanup(&mut self) {
        let due = self
            .last_cleanup
            .map(|t| t.elapsed().as_secs() >= TRADE_LOG_CLEANUP_INTERVAL_SECS)
            .unwrap_or(true);
        if !due {
            return;
        }
        self.last_cleanup = Some(Instant::now());
        let Some(cutoff) = SystemTime::now()
            .checked_sub(std::time::Duration::from_secs(self.retain_days * 86_400))
        else {
            return;
        };
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !is_trade_log_file(&path) {
                continue;
            }
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            let Ok(modified) = meta.modified() else {
                continue;
            };
            if modified < cutoff {
                if let Err(err) = fs::remove_file(&path) {
                    log::debug!("[TRADE] failed to remove {}: {:?}", path.display(), err);
                } else {
                    log::info!("[TRADE] removed aged log {}", path.display());
                }
            }
        }
    }
}

fn sanitize_tag(raw: &str) -> String {
    raw.chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

fn is_trade_log_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    name.starts_with("trades-") && name.ends_with(".jsonl")
}

#[derive(Debug, Clone, Serialize)]
pub struct SignalSnapshot {
    pub pair: String,
    pub regime: String,
    pub z_score: Option<f64>,
    pub signal: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusPosition {
    pub pair: String,
    pub direction: String,
    pub size: String,
    pub entry_z: f64,
    pub entry_time: i64,
}

#[derive(Serialize)]
struct StatusSnapshot {
    ts: i64,
    updated_at: String,
    mode: String,
    broker: String,
    interval_secs: u64,
    equity: f64,
    pnl_today: f64,
    position_count: usize,
    has_position: bool,
    positions: Vec<StatusPosition>,
    signals: Vec<SignalSnapshot>,
}

#[derive(Serialize, Deserialize)]
struct EquityBaseline {
    date: String,
    equity: f64,
}

#[derive(Serialize)]
struct EquityHistoryPoint {
    ts: i64,
    equity: f64,
}

/// JSON heartbeat for alerting and CLI consumers. The day-start equity
/// baseline persists across restarts so today's P&L survives a crash.
pub struct StatusReporter {
    path: PathBuf,
    equity_baseline_path: PathBuf,
    equity_history_path: PathBuf,
    mode: String,
    broker: String,
    interval_secs: u64,
    snapshot_every: Duration,
    equity: f64,
    pnl_today: f64,
    equity_day_start: f64,
    equity_day_start_set: bool,
    day: NaiveDate,
    last_history_ts: Option<i64>,
    last_snapshot: Option<Instant>,
}

impl StatusReporter {
    pub fn from_env(mode: RunMode, broker_name: &str, interval_secs: u64) -> Option<Self> {
        let enabled = env::var("STATARB_STATUS")
            .map(|v| !matches!(v.trim().to_ascii_lowercase().as_str(), "0" | "false" | "off"))
            .unwrap_or(true);
        if !enabled {
            return None;
        }
        let path = env::var("STATARB_STATUS_PATH")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .or_else(|| {
                env::var("STATARB_STATUS_DIR")
                    .ok()
                    .filter(|v| !v.trim().is_empty())
                    .map(|dir| PathBuf::from(dir).join("status.json"))
            })
            .or_else(|| {
                env::var("HOME")
                    .ok()
                    .map(|home| PathBuf::from(home).join("statarb_status").join("status.json"))
            })
            .unwrap_or_else(|| PathBuf::from("status.json"));

        let equity_baseline_path = path.with_extension("equity.json");
        let equity_history_path = path.with_extension("equity_history.jsonl");
        let interval = interval_secs.max(1);
        let snapshot_every = {
            let n = ((STATUS_TARGET_SECS + interval - 1) / interval).max(1);
            Duration::from_secs(interval.saturating_mul(n).max(1))
        };

        let mut reporter = Self {
            path,
            equity_baseline_path,
            equity_history_path,
            mode: mode.as_str().to_string(),
            broker: broker_name.to_string(),
            interval_secs,
            snapshot_every,
            equity: 0.0,
            pnl_today: 0.0,
            equity_day_start: 0.0,
            equity_day_start_set: false,
            day: Utc::now().date_naive(),
            last_history_ts: None,
            last_snapshot: None,
        };
        reporter.load_equity_baseline();
        if let Err(err) = reporter.ensure_status_file() {
            log::warn!(
                "[STATUS] failed to create status file {}: {:?}",
                reporter.path.display(),
                err
            );
        }
        Some(reporter)
    }

    fn ensure_status_file(&self) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        Ok(())
    }

    fn load_equity_baseline(&mut self) {
        let Ok(payload) = fs::read_to_string(&self.equity_baseline_path) else {
            return;
        };
        let Ok(baseline) = serde_json::from_str::<EquityBaseline>(&payload) else {
            return;
        };
        let Ok(date) = NaiveDate::parse_from_str(&baseline.date, "%Y-%m-%d") else {
            return;
        };
        self.equity_day_start = baseline.equity;
        self.day = date;
        self.equity_day_start_set = true;
    }

    fn persist_equity_baseline(&self) {
        let baseline = EquityBaseline {
            date: self.day.format("%Y-%m-%d").to_string(),
            equity: self.equity_day_start,
        };
        let payload = match serde_json::to_string(&baseline) {
            Ok(v) => v,
            Err(err) => {
                log::warn!("[STATUS] failed to encode equity baseline: {:?}", err);
                return;
            }
        };
        if let Some(parent) = self.equity_baseline_path.parent() {
            if let Err(err) = fs::create_dir_all(parent) {
                log::warn!("[STATUS] failed to create equity baseline dir: {:?}", err);
                return;
            }
        }
        let tmp_path = self.equity_baseline_path.with_extension("equity.json.tmp");
        if let Err(err) = fs::write(&tmp_path, payload) {
            log::warn!("[STATUS] failed to write equity baseline: {:?}", err);
            return;
        }
        if let Err(err) = fs::rename(&tmp_path, &self.equity_baseline_path) {
            log::warn!("[STATUS] failed to finalize equity baseline: {:?}", err);
        }
    }

    fn append_equity_history(&mut self) {
        let ts = Utc::now().timestamp_millis();
        if self.last_history_ts == Some(ts) {
            return;
        }
        self.last_history_ts = Some(ts);
        let point = EquityHistoryPoint {
            ts,
            equity: self.equity,
        };
        let line = match serde_json::to_string(&point) {
            Ok(v) => v,
            Err(err) => {
                log::warn!("[STATUS] failed to encode equity history: {:?}", err);
                return;
            }
        };
        if let Some(parent) = self.equity_history_path.parent() {
            if let Err(err) = fs::create_dir_all(parent) {
                log::warn!("[STATUS] failed to create equity history dir: {:?}", err);
                return;
            }
        }
        let mut file = match OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.equity_history_path)
        {
            Ok(f) => f,
            Err(err) => {
                log::warn!("[STATUS] failed to open equity history: {:?}", err);
                return;
            }
        };
        if writeln!(file, "{line}").is_err() {
            log::warn!("[STATUS] failed to write equity history");
        }
    }

    pub fn update_equity(&mut self, equity: f64) {
        let today = Utc::now().date_naive();
        self.equity = equity;
        if !self.equity_day_start_set || self.day != today {
            self.day = today;
            self.equity_day_start = equity;
            self.equity_day_start_set = true;
            self.persist_equity_baseline();
        }
        self.pnl_today = equity - self.equity_day_start;
        self.append_equity_history();
    }

    pub fn write_snapshot(
        &mut self,
        signals: &[SignalSnapshot],
        positions: &[StatusPosition],
    ) -> std::io::Result<()> {
        let snapshot = StatusSnapshot {
            ts: Utc::now().timestamp(),
            updated_at: Utc::now().to_rfc3339(),
            mode: self.mode.clone(),
            broker: self.broker.clone(),
            interval_secs: self.interval_secs,
            equity: self.equity,
            pnl_today: self.pnl_today,
            position_count: positions.len(),
            has_position: !positions.is_empty(),
            positions: positions.to_vec(),
            signals: signals.to_vec(),
        };
        let payload = serde_json::to_string(&snapshot)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, payload)?;
        fs::rename(tmp_path, &self.path)?;
        Ok(())
    }

    pub fn write_snapshot_if_due(
        &mut self,
        signals: &[SignalSnapshot],
        positions: &[StatusPosition],
    ) -> std::io::Result<bool> {
        let due = self
            .last_snapshot
            .map(|t| t.elapsed() >= self.snapshot_every)
            .unwrap_or(true);
        if !due {
            return Ok(false);
        }
        self.write_snapshot(signals, positions)?;
        self.last_snapshot = Some(Instant::now());
        Ok(true)
    }
}

/// An open paired position. Exactly one may exist per pair; the portfolio
/// manager enforces that before submission. Survives restarts through the
/// position store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub pair: String,
    pub direction: SpreadDirection,
    pub legs: Vec<OpenLeg>,
    #[serde(default)]
    pub closed_legs: Vec<ClosedLeg>,
    pub unit_size: Decimal,
    pub entry_time: i64,
    pub entry_z: f64,
    pub entry_spread: f64,
    pub stop_loss_z: f64,
    pub take_profit_z: f64,
    pub regime_at_entry: Regime,
    pub state: ExecState,
    #[serde(default)]
    pub exit_trigger: Option<ExitTrigger>,
}

impl Position {
    fn transition(&mut self, next: ExecState) -> bool {
        if self.state.allows(next) {
            log::debug!(
                "[POSITION] {} {} -> {}",
                self.pair,
                self.state.as_str(),
                next.as_str()
            );
            self.state = next;
            true
        } else {
            log::error!(
                "[POSITION] {} rejected transition {} -> {}",
                self.pair,
                self.state.as_str(),
                next.as_str()
            );
            false
        }
    }
}

/// Closes one bar per `window_secs` from a stream of quotes, emitting the
/// previous close when a quote lands past the boundary.
#[derive(Debug, Clone)]
struct BarBuilder {
    window_secs: u64,
    start_ts: Option<i64>,
    close: Decimal,
}

impl BarBuilder {
    fn new(window_secs: u64) -> Self {
        Self {
            window_secs: window_secs.max(1),
            start_ts: None,
            close: Decimal::ZERO,
        }
    }

    fn push(&mut self, ts: i64, price: Decimal) -> Option<(Decimal, i64)> {
        match self.start_ts {
            None => {
                self.start_ts = Some(ts);
                self.close = price;
                None
            }
            Some(start) => {
                if ts.saturating_sub(start) >= self.window_secs as i64 {
                    let prev_close = self.close;
                    let close_ts = start.saturating_add(self.window_secs as i64);
                    self.start_ts = Some(ts);
                    self.close = price;
                    Some((prev_close, close_ts))
                } else {
                    self.close = price;
                    None
                }
            }
        }
    }
}

struct PairRuntime {
    def: PairDefinition,
    model: Option<SpreadModel>,
    cointegration: Option<CointegrationResult>,
    regime_model: Option<RegimeModel>,
    last_regime: RegimeState,
    tradeable: bool,
    last_trained_ts: Option<i64>,
    spread_window: VecDeque<f64>,
    diff_window: VecDeque<f64>,
    position: Option<Position>,
    stats: TradeStats,
    cooldown_until: Option<i64>,
    last_z: Option<f64>,
}

impl PairRuntime {
    fn new(def: PairDefinition, cfg: &EngineConfig) -> Self {
        let cap = cfg.window_bars();
        Self {
            def,
            model: None,
            cointegration: None,
            regime_model: None,
            last_regime: RegimeState::unknown(),
            tradeable: false,
            last_trained_ts: None,
            spread_window: VecDeque::with_capacity(cap),
            diff_window: VecDeque::with_capacity(cap),
            position: None,
            stats: TradeStats::new(cfg.trade_stats_capacity),
            cooldown_until: None,
            last_z: None,
        }
    }
}

#[derive(Serialize, Deserialize, Default)]
struct PairModelSnapshot {
    cointegration: Option<CointegrationResult>,
    spread: Option<SpreadModel>,
    regime: Option<RegimeModel>,
}

/// On-disk state: open positions as inspectable JSON, model parameters as a
/// bincode snapshot. Load failures degrade to a cold start, never a crash.
struct StateStore {
    positions_path: PathBuf,
    models_path: PathBuf,
    risk_path: PathBuf,
}

impl StateStore {
    fn new(dir: &Path) -> Self {
        Self {
            positions_path: dir.join("positions.json"),
            models_path: dir.join("models.bin"),
            risk_path: dir.join("risk.json"),
        }
    }

    fn load_positions(&self) -> HashMap<String, Position> {
        let Ok(payload) = fs::read_to_string(&self.positions_path) else {
            return HashMap::new();
        };
        match serde_json::from_str(&payload) {
            Ok(map) => map,
            Err(err) => {
                log::warn!("[STATE] failed to parse position store: {:?}", err);
                HashMap::new()
            }
        }
    }

    fn save_positions(&self, positions: &HashMap<String, Position>) {
        let payload = match serde_json::to_string(positions) {
            Ok(v) => v,
            Err(err) => {
                log::warn!("[STATE] failed to encode positions: {:?}", err);
                return;
            }
        };
        self.write_atomic(&self.positions_path, payload.as_bytes());
    }

    fn load_models(&self) -> HashMap<String, PairModelSnapshot> {
        let Ok(bytes) = fs::read(&self.models_path) else {
            return HashMap::new();
        };
        match bincode::deserialize(&bytes) {
            Ok(map) => map,
            Err(err) => {
                log::warn!("[STATE] failed to parse model store: {:?}", err);
                HashMap::new()
            }
        }
    }

    fn save_models(&self, models: &HashMap<String, PairModelSnapshot>) {
        let bytes = match bincode::serialize(models) {
            Ok(v) => v,
            Err(err) => {
                log::warn!("[STATE] failed to encode models: {:?}", err);
                return;
            }
        };
        self.write_atomic(&self.models_path, &bytes);
    }

    fn load_risk_state(&self) -> Option<PortfolioRiskState> {
        let payload = fs::read_to_string(&self.risk_path).ok()?;
        match serde_json::from_str(&payload) {
            Ok(state) => Some(state),
            Err(err) => {
                log::warn!("[STATE] failed to parse risk store: {:?}", err);
                None
            }
        }
    }

    fn save_risk_state(&self, state: &PortfolioRiskState) {
        let payload = match serde_json::to_string(state) {
            Ok(v) => v,
            Err(err) => {
                log::warn!("[STATE] failed to encode risk marks: {:?}", err);
                return;
            }
        };
        self.write_atomic(&self.risk_path, payload.as_bytes());
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8]) {
        if let Some(parent) = path.parent() {
            if let Err(err) = fs::create_dir_all(parent) {
                log::debug!("[STATE] failed to create {}: {:?}", parent.display(), err);
                return;
            }
        }
        let tmp = path.with_extension("tmp");
        if let Err(err) = fs::write(&tmp, bytes) {
            log::debug!("[STATE] failed to write {}: {:?}", path.display(), err);
            return;
        }
        if let Err(err) = fs::rename(&tmp, path) {
            log::debug!("[STATE] failed to finalize {}: {:?}", path.display(), err);
        }
    }
}

fn ts_to_datetime(ts: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(ts, 0).single().unwrap_or_else(Utc::now)
}

fn push_window(window: &mut VecDeque<f64>, value: f64, cap: usize) {
    if window.len() >= cap {
        window.pop_front();
    }
    window.push_back(value);
}

fn window_tail(window: &VecDeque<f64>, len: usize) -> Vec<f64> {
    let start = window.len().saturating_sub(len);
    window.iter().skip(start).copied().collect()
}

/// Round-trip execution cost (both legs, entry and exit) expressed in units
/// of the frozen training std, so it can be added onto the entry threshold.
fn entry_cost_sigma(
    fee_bps: f64,
    slippage_bps: f64,
    price_a: f64,
    price_b: f64,
    beta: f64,
    train_std: f64,
) -> f64 {
    if train_std < 1e-8 {
        return f64::INFINITY;
    }
    let rate = (fee_bps + slippage_bps) / 10_000.0;
    2.0 * rate * (price_a + beta.abs() * price_b) / train_std
}

fn quantize_size(size: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return size;
    }
    (size / step).floor() * step
}

fn leg_pnl(closed: &ClosedLeg) -> Decimal {
    match closed.leg.side {
        crate::broker::OrderSide::Buy => {
            (closed.close_price - closed.leg.entry_price) * closed.leg.size
        }
        crate::broker::OrderSide::Sell => {
            (closed.leg.entry_price - closed.close_price) * closed.leg.size
        }
    }
}

/// Exit checks in precedence order: holding-period liquidation, stop loss,
/// take profit (spread crossed the mean), then the ordinary exit band.
fn exit_trigger_for(
    position: &Position,
    z: f64,
    exit_threshold: f64,
    max_holding_secs: u64,
    now_ts: i64,
) -> Option<ExitTrigger> {
    if now_ts.saturating_sub(position.entry_time) >= max_holding_secs as i64 {
        return Some(ExitTrigger::ForcedLiquidation);
    }
    match position.direction {
        SpreadDirection::ShortSpread => {
            if z >= position.stop_loss_z {
                Some(ExitTrigger::StopLossHit)
            } else if z <= position.take_profit_z {
                Some(ExitTrigger::TakeProfitHit)
            } else if z <= exit_threshold {
                Some(ExitTrigger::ExitSignal)
            } else {
                None
            }
        }
        SpreadDirection::LongSpread => {
            if z <= -position.stop_loss_z {
                Some(ExitTrigger::StopLossHit)
            } else if z >= -position.take_profit_z {
                Some(ExitTrigger::TakeProfitHit)
            } else if z >= -exit_threshold {
                Some(ExitTrigger::ExitSignal)
            } else {
                None
            }
        }
    }
}

enum CloseAction {
    Fresh(ExitTrigger),
    Retry,
}

pub struct StatArbEngine {
    cfg: EngineConfig,
    mode: RunMode,
    broker: Arc<BrokerBox>,
    lifecycle: TradeLifecycle,
    runtimes: HashMap<String, PairRuntime>,
    pair_order: Vec<String>,
    history: HashMap<String, VecDeque<PricePoint>>,
    bar_builders: HashMap<String, BarBuilder>,
    risk_state: PortfolioRiskState,
    limits: RiskLimits,
    sizing: SizingConfig,
    equity: Decimal,
    last_equity_fetch: Option<Instant>,
    trade_logger: Option<TradeLogger>,
    status_reporter: Option<StatusReporter>,
    store: StateStore,
    positions_dirty: bool,
    models_dirty: bool,
    risk_dirty: bool,
}

impl StatArbEngine {
    pub async fn new(cfg: EngineConfig, mode: RunMode, settings: &BrokerSettings) -> Result<Self> {
        let broker = Arc::new(
            BrokerBox::create(&settings.broker_name, settings.replay_file.as_deref())
                .context("failed to initialize broker")?,
        );
        broker.start().await.context("failed to start broker")?;
        let balance = {
            let broker = broker.clone();
            retry_read("get_account_balance", 3, || broker.get_account_balance())
                .await
                .context("failed to fetch starting balance")?
        };

        let mut engine = Self::from_parts(cfg, mode, broker, balance.equity);
        engine.restore_models();
        if let Some(saved) = engine.store.load_risk_state() {
            engine.risk_state.restore(&saved);
        }
        engine.risk_dirty = true;
        let persisted = engine.store.load_positions();
        engine.reconcile_on_startup(persisted).await?;
        engine.trade_logger = TradeLogger::from_env();
        engine.status_reporter =
            StatusReporter::from_env(mode, &settings.broker_name, engine.cfg.interval_secs);
        Ok(engine)
    }

    fn from_parts(cfg: EngineConfig, mode: RunMode, broker: Arc<BrokerBox>, equity: Decimal) -> Self {
        let lifecycle = TradeLifecycle::new(
            broker.clone(),
            mode,
            Duration::from_secs(cfg.confirm_timeout_secs.max(1)),
        );
        let mut runtimes = HashMap::new();
        let mut history = HashMap::new();
        let mut bar_builders = HashMap::new();
        let mut pair_order = Vec::new();
        for def in &cfg.pairs {
            let key = def.key();
            pair_order.push(key.clone());
            history.entry(def.symbol_a.clone()).or_insert_with(VecDeque::new);
            history.entry(def.symbol_b.clone()).or_insert_with(VecDeque::new);
            bar_builders
                .entry(def.symbol_a.clone())
                .or_insert_with(|| BarBuilder::new(cfg.trading_period_secs));
            bar_builders
                .entry(def.symbol_b.clone())
                .or_insert_with(|| BarBuilder::new(cfg.trading_period_secs));
            runtimes.insert(key, PairRuntime::new(def.clone(), &cfg));
        }
        let limits = cfg.risk_limits();
        let sizing = cfg.sizing();
        let store = StateStore::new(&cfg.state_dir);
        Self {
            mode,
            broker,
            lifecycle,
            runtimes,
            pair_order,
            history,
            bar_builders,
            risk_state: PortfolioRiskState::new(equity, Utc::now()),
            limits,
            sizing,
            equity,
            last_equity_fetch: None,
            trade_logger: None,
            status_reporter: None,
            store,
            positions_dirty: false,
            models_dirty: false,
            risk_dirty: false,
            cfg,
        }
    }

    fn restore_models(&mut self) {
        let stored = self.store.load_models();
        for (key, snapshot) in stored {
            let Some(rt) = self.runtimes.get_mut(&key) else {
                log::debug!("[STATE] dropping stored model for unknown pair {}", key);
                continue;
            };
            rt.tradeable = snapshot
                .cointegration
                .map(|c| {
                    c.beta > 0.0
                        && c.qualifies(
                            self.cfg.p_value_threshold,
                            self.cfg.half_life_min_days,
                            self.cfg.half_life_max_days,
                        )
                })
                .unwrap_or(false);
            rt.last_trained_ts = snapshot.spread.map(|m| m.trained_at);
            rt.cointegration = snapshot.cointegration;
            rt.model = snapshot.spread;
            rt.regime_model = snapshot.regime;
            if let Some(model) = rt.model {
                log::info!(
                    "[STATE] {} restored model beta={:.4} tradeable={}",
                    key,
                    model.beta,
                    rt.tradeable
                );
            }
        }
    }

    /// Compares the persisted position store with what the broker reports.
    /// Positions whose legs are all present resume monitoring; anything else
    /// is dropped with an alert rather than re-submitted.
    async fn reconcile_on_startup(
        &mut self,
        persisted: HashMap<String, Position>,
    ) -> Result<()> {
        let broker_positions = if persisted.is_empty() {
            Vec::new()
        } else {
            let broker = self.broker.clone();
            retry_read("get_open_positions", 3, || broker.get_open_positions())
                .await
                .context("failed to list broker positions on startup")?
        };
        let known: HashSet<String> = broker_positions
            .iter()
            .map(|p| p.deal_reference.clone())
            .collect();
        let mut claimed: HashSet<String> = HashSet::new();
        for (key, mut position) in persisted {
            let Some(rt) = self.runtimes.get_mut(&key) else {
                log::warn!(
                    "[STATE] stored position for {} has no configured pair, ignoring",
                    key
                );
                continue;
            };
            let all_present = !position.legs.is_empty()
                && position
                    .legs
                    .iter()
                    .all(|leg| known.contains(&leg.deal_reference));
            if all_present {
                for leg in &position.legs {
                    claimed.insert(leg.deal_reference.clone());
                }
                if position.state == ExecState::PositionOpen {
                    position.transition(ExecState::Monitoring);
                }
                log::info!(
                    "[POSITION] {} resumed {} with {} legs",
                    key,
                    position.state.as_str(),
                    position.legs.len()
                );
                rt.position = Some(position);
                self.positions_dirty = true;
            } else {
                log::warn!(
                    "[SAFETY] {} stored position legs missing at broker, dropping record",
                    key
                );
                notify_alert(
                    &format!("stale position record for {}", key),
                    "persisted legs no longer exist at the broker; manual check advised",
                );
                self.positions_dirty = true;
            }
        }
        for bp in &broker_positions {
            if !claimed.contains(&bp.deal_reference) {
                log::warn!(
                    "[SAFETY] unmanaged broker position {} {} size={}",
                    bp.deal_reference,
                    bp.instrument,
                    bp.size
                );
                notify_alert(
                    "unmanaged broker position",
                    &format!(
                        "{} {} size {} is not tracked by the engine",
                        bp.deal_reference, bp.instrument, bp.size
                    ),
                );
            }
        }
        Ok(())
    }

    pub async fn run(&mut self) -> Result<()> {
        log::info!(
            "[CONFIG] mode={} pairs={} interval={}s bar={}s",
            self.mode.as_str(),
            self.pair_order.join(","),
            self.cfg.interval_secs,
            self.cfg.trading_period_secs
        );
        log::info!(
            "[CONFIG] entry_z={} exit_z={} stop_z={} p_threshold={} fee_bps={} slippage_bps={}",
            self.cfg.entry_z_base,
            self.cfg.exit_z_base,
            self.cfg.stop_loss_z,
            self.cfg.p_value_threshold,
            self.cfg.fee_bps,
            self.cfg.slippage_bps
        );

        if let Some(paper) = self.broker.paper_handle().filter(|p| p.is_replay()) {
            log::info!("[REPLAY] running from tape");
            while paper.tick() {
                if let Err(err) = self.step().await {
                    log::error!("[REPLAY] step failed: {:?}", err);
                }
            }
            log::info!("[REPLAY] tape exhausted");
        } else {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(self.cfg.interval_secs.max(1)));
            // Slow cycles skip missed ticks instead of bursting to catch up.
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = self.step().await {
                            log::error!("engine step failed: {:?}", err);
                        }
                    }
                    _ = tokio::signal::ctrl_c() => {
                        log::info!("shutdown requested, draining");
                        break;
                    }
                }
            }
        }

        self.positions_dirty = true;
        self.models_dirty = true;
        self.risk_dirty = true;
        self.persist_state();
        let signals = self.signal_snapshots();
        let positions = self.status_positions();
        let equity = self.equity.to_f64().unwrap_or(0.0);
        if let Some(reporter) = &mut self.status_reporter {
            reporter.update_equity(equity);
            if let Err(err) = reporter.write_snapshot(&signals, &positions) {
                log::warn!("[STATUS] failed to write final status: {:?}", err);
            }
        }
        if let Err(err) = self.broker.stop().await {
            log::warn!("[BROKER] stop failed: {}", err);
        }
        Ok(())
    }

    /// One evaluation cycle. Pairs are processed sequentially so every
    /// decision in the cycle sees the same portfolio risk state.
    async fn step(&mut self) -> Result<()> {
        let snapshots = self.fetch_snapshots().await;
        let now_ts = snapshots
            .values()
            .map(|s| s.ts)
            .max()
            .unwrap_or_else(|| Utc::now().timestamp());
        self.refresh_equity().await;
        if self.risk_state.observe(self.equity, ts_to_datetime(now_ts)) {
            self.risk_dirty = true;
        }

        let max_history = self.cfg.max_history_bars();
        let mut closed_bars = HashSet::new();
        let mut symbols: Vec<String> = self.bar_builders.keys().cloned().collect();
        symbols.sort();
        for symbol in symbols {
            let Some(snapshot) = snapshots.get(&symbol) else {
                continue;
            };
            let Some(builder) = self.bar_builders.get_mut(&symbol) else {
                continue;
            };
            if let Some((close, close_ts)) = builder.push(snapshot.ts, snapshot.mid()) {
                let Some(price) = close.to_f64() else {
                    log::warn!("[PRICE] unrepresentable close for {}", symbol);
                    continue;
                };
                let history = self
                    .history
                    .entry(symbol.clone())
                    .or_insert_with(VecDeque::new);
                if history.len() >= max_history {
                    history.pop_front();
                }
                history.push_back(PricePoint {
                    ts: close_ts,
                    price,
                });
                closed_bars.insert(symbol);
            }
        }

        for key in self.pair_order.clone() {
            if let Err(err) = self
                .evaluate_pair(&key, &snapshots, &closed_bars, now_ts)
                .await
            {
                log::warn!("[EVAL] {} cycle error: {:?}", key, err);
            }
        }

        let signals = self.signal_snapshots();
        let positions = self.status_positions();
        let equity = self.equity.to_f64().unwrap_or(0.0);
        if let Some(reporter) = &mut self.status_reporter {
            reporter.update_equity(equity);
            if let Err(err) = reporter.write_snapshot_if_due(&signals, &positions) {
                log::warn!("[STATUS] failed to write status: {:?}", err);
            }
        }
        self.persist_state();
        Ok(())
    }

    async fn fetch_snapshots(&self) -> HashMap<String, MarketSnapshot> {
        let mut map = HashMap::new();
        let mut symbols: Vec<String> = self.bar_builders.keys().cloned().collect();
        symbols.sort();
        for symbol in symbols {
            match self.broker.get_market_snapshot(&symbol).await {
                Ok(snapshot) => {
                    map.insert(symbol, snapshot);
                }
                Err(err) => {
                    log::debug!("[PRICE] no quote for {}: {}", symbol, err);
                }
            }
        }
        map
    }

    async fn refresh_equity(&mut self) {
        let due = self
            .last_equity_fetch
            .map(|t| t.elapsed() >= Duration::from_secs(self.cfg.equity_refresh_secs))
            .unwrap_or(true);
        if !due {
            return;
        }
        let broker = self.broker.clone();
        match retry_read("get_account_balance", 3, || broker.get_account_balance()).await {
            Ok(balance) => {
                self.equity = balance.equity;
                self.last_equity_fetch = Some(Instant::now());
            }
            Err(err) => {
                log::warn!("[BROKER] balance refresh failed: {}", err);
            }
        }
    }

    async fn evaluate_pair(
        &mut self,
        key: &str,
        snapshots: &HashMap<String, MarketSnapshot>,
        closed_bars: &HashSet<String>,
        now_ts: i64,
    ) -> Result<()> {
        let (sym_a, sym_b) = {
            let Some(rt) = self.runtimes.get(key) else {
                return Ok(());
            };
            (rt.def.symbol_a.clone(), rt.def.symbol_b.clone())
        };
        let (Some(snap_a), Some(snap_b)) = (snapshots.get(&sym_a), snapshots.get(&sym_b)) else {
            log::debug!("[PRICE] {} missing a quote this cycle", key);
            return Ok(());
        };
        let mid_a_dec = snap_a.mid();
        let mid_b_dec = snap_b.mid();
        let (Some(mid_a), Some(mid_b)) = (mid_a_dec.to_f64(), mid_b_dec.to_f64()) else {
            log::warn!("[PRICE] {} unrepresentable quote", key);
            return Ok(());
        };

        self.manage_position(key, mid_a, mid_b, now_ts).await?;

        if !(closed_bars.contains(&sym_a) && closed_bars.contains(&sym_b)) {
            return Ok(());
        }
        self.retrain_if_due(key, now_ts);

        let (bar_a, bar_b, bar_ts) = {
            let a = self.history.get(&sym_a).and_then(|h| h.back()).copied();
            let b = self.history.get(&sym_b).and_then(|h| h.back()).copied();
            match (a, b) {
                (Some(a), Some(b)) => (a.price, b.price, a.ts.max(b.ts)),
                _ => return Ok(()),
            }
        };

        let window_cap = self.cfg.window_bars();
        let decision = {
            let Some(rt) = self.runtimes.get_mut(key) else {
                return Ok(());
            };
            if let Some(model) = rt.model {
                let spread = model.spread(bar_a, bar_b);
                if let Some(prev) = rt.spread_window.back().copied() {
                    push_window(&mut rt.diff_window, spread - prev, window_cap);
                }
                push_window(&mut rt.spread_window, spread, window_cap);
                let diffs: Vec<f64> = rt.diff_window.iter().copied().collect();
                rt.last_regime = rt
                    .regime_model
                    .as_ref()
                    .map(|m| m.classify(&diffs))
                    .unwrap_or_else(RegimeState::unknown);
                log::debug!(
                    "[REGIME] {} {} ({:.2})",
                    key,
                    rt.last_regime.regime.as_str(),
                    rt.last_regime.confidence
                );
                if rt.tradeable {
                    match model.signal(bar_ts, bar_a, bar_b) {
                        Ok(sig) => {
                            rt.last_z = Some(sig.z);
                            let vol_ratio = if model.train_vol > 1e-12 {
                                tail_std(&rt.diff_window, self.cfg.recent_vol_bars)
                                    .map(|v| v / model.train_vol)
                            } else {
                                None
                            };
                            let spread_vec: Vec<f64> =
                                rt.spread_window.iter().copied().collect();
                            let thresholds = dynamic_thresholds(
                                self.cfg.entry_z_base,
                                self.cfg.exit_z_base,
                                vol_ratio,
                                reversion_speed(&spread_vec),
                            );
                            Some((sig, thresholds))
                        }
                        Err(err) => {
                            rt.last_z = None;
                            log::debug!("[SIGNAL] {} abstaining: {}", key, err);
                            None
                        }
                    }
                } else {
                    rt.last_z = None;
                    None
                }
            } else {
                None
            }
        };

        if let Some((sig, thresholds)) = decision {
            self.consider_entry(key, sig, thresholds, mid_a_dec, mid_b_dec)
                .await?;
        }
        Ok(())
    }

    fn retrain_if_due(&mut self, key: &str, now_ts: i64) {
        let due = {
            let Some(rt) = self.runtimes.get(key) else {
                return;
            };
            rt.last_trained_ts
                .map(|t| now_ts.saturating_sub(t) >= self.cfg.retrain_secs as i64)
                .unwrap_or(true)
        };
        if !due {
            return;
        }
        let (sym_a, sym_b) = {
            let Some(rt) = self.runtimes.get(key) else {
                return;
            };
            (rt.def.symbol_a.clone(), rt.def.symbol_b.clone())
        };
        let series_a: Vec<PricePoint> = self
            .history
            .get(&sym_a)
            .map(|h| h.iter().copied().collect())
            .unwrap_or_default();
        let series_b: Vec<PricePoint> = self
            .history
            .get(&sym_b)
            .map(|h| h.iter().copied().collect())
            .unwrap_or_default();
        let (mut va, mut vb) = align_series(&series_a, &series_b);
        let window = self.cfg.training_window_bars;
        if va.len() > window {
            va = va[va.len() - window..].to_vec();
            vb = vb[vb.len() - window..].to_vec();
        }
        match estimate_pair(
            &va,
            &vb,
            self.cfg.min_training_samples,
            self.cfg.trading_period_secs,
            now_ts,
        ) {
            Ok(result) => self.apply_estimate(key, result, &va, &vb, now_ts),
            Err(EngineError::InsufficientData { needed, got }) => {
                log::debug!("[EVAL] {} warming up ({}/{} samples)", key, got, needed);
            }
            Err(err) => {
                log::warn!("[EVAL] {} estimation failed: {}", key, err);
                if let Some(rt) = self.runtimes.get_mut(key) {
                    rt.last_trained_ts = Some(now_ts);
                }
            }
        }
    }

    fn apply_estimate(
        &mut self,
        key: &str,
        result: CointegrationResult,
        a: &[f64],
        b: &[f64],
        now_ts: i64,
    ) {
        let qualifies = result.qualifies(
            self.cfg.p_value_threshold,
            self.cfg.half_life_min_days,
            self.cfg.half_life_max_days,
        );
        let window_cap = self.cfg.window_bars();
        let Some(rt) = self.runtimes.get_mut(key) else {
            return;
        };
        rt.last_trained_ts = Some(now_ts);
        let was_tradeable = rt.tradeable;
        rt.cointegration = Some(result);
        if !qualifies {
            rt.tradeable = false;
            log::info!(
                "[EVAL] {} disqualified p={:.3} half_life={:.1}d",
                key,
                result.p_value,
                result.half_life_days
            );
            if was_tradeable {
                let err = EngineError::CointegrationLost {
                    pair: key.to_string(),
                    p_value: result.p_value,
                };
                log::warn!("[EVAL] {}", err);
                notify_alert(
                    &format!("cointegration lost on {}", key),
                    &format!(
                        "p={:.3} half_life={:.1}d, entries halted until the pair requalifies",
                        result.p_value, result.half_life_days
                    ),
                );
            }
            self.models_dirty = true;
            return;
        }
        if result.beta <= 0.0 {
            rt.tradeable = false;
            log::warn!(
                "[EVAL] {} hedge ratio {:.4} not positive, cannot hedge with opposing legs",
                key,
                result.beta
            );
            self.models_dirty = true;
            return;
        }
        match SpreadModel::fit(&result, a, b) {
            Ok(model) => {
                let spreads: Vec<f64> = a
                    .iter()
                    .zip(b.iter())
                    .map(|(x, y)| x - result.beta * y)
                    .collect();
                let diffs: Vec<f64> = spreads.windows(2).map(|w| w[1] - w[0]).collect();
                match regime::train(&diffs, REGIME_MIN_SAMPLES, now_ts) {
                    Ok(regime_model) => {
                        rt.regime_model = Some(regime_model);
                    }
                    Err(err) => {
                        log::debug!("[REGIME] {} training skipped: {}", key, err);
                    }
                }
                let spread_start = spreads.len().saturating_sub(window_cap);
                rt.spread_window = spreads[spread_start..].iter().copied().collect();
                let diff_start = diffs.len().saturating_sub(window_cap);
                rt.diff_window = diffs[diff_start..].iter().copied().collect();
                rt.model = Some(model);
                rt.tradeable = true;
                log::info!(
                    "[EVAL] {} qualified beta={:.4} p={:.3} half_life={:.1}d samples={}",
                    key,
                    result.beta,
                    result.p_value,
                    result.half_life_days,
                    result.samples
                );
                self.models_dirty = true;
            }
            Err(err) => {
                rt.tradeable = false;
                log::warn!("[EVAL] {} model fit failed: {}", key, err);
            }
        }
    }

    /// Polls the open position for this pair: fresh exit triggers move it to
    /// closing, a position stuck in closing is retried. Runs every cycle and
    /// never consults the entry breakers, so exits stay available while
    /// entries are halted.
    async fn manage_position(
        &mut self,
        key: &str,
        mid_a: f64,
        mid_b: f64,
        now_ts: i64,
    ) -> Result<()> {
        let action = {
            let Some(rt) = self.runtimes.get_mut(key) else {
                return Ok(());
            };
            let Some(pos) = rt.position.as_mut() else {
                return Ok(());
            };
            match pos.state {
                ExecState::PositionOpen => {
                    pos.transition(ExecState::Monitoring);
                    None
                }
                ExecState::Closing => Some(CloseAction::Retry),
                ExecState::Monitoring => {
                    if let Some(model) = rt.model {
                        match model.signal(now_ts, mid_a, mid_b) {
                            Ok(sig) => {
                                let vol_ratio = if model.train_vol > 1e-12 {
                                    tail_std(&rt.diff_window, self.cfg.recent_vol_bars)
                                        .map(|v| v / model.train_vol)
                                } else {
                                    None
                                };
                                let spread_vec: Vec<f64> =
                                    rt.spread_window.iter().copied().collect();
                                let thresholds = dynamic_thresholds(
                                    self.cfg.entry_z_base,
                                    self.cfg.exit_z_base,
                                    vol_ratio,
                                    reversion_speed(&spread_vec),
                                );
                                exit_trigger_for(
                                    pos,
                                    sig.z,
                                    thresholds.exit,
                                    self.cfg.max_holding_secs,
                                    now_ts,
                                )
                                .map(CloseAction::Fresh)
                            }
                            Err(err) => {
                                log::debug!("[EXIT_CHECK] {} signal unavailable: {}", key, err);
                                None
                            }
                        }
                    } else {
                        None
                    }
                }
                _ => None,
            }
        };
        let Some(action) = action else {
            return Ok(());
        };
        if let CloseAction::Fresh(trigger) = action {
            let Some(rt) = self.runtimes.get_mut(key) else {
                return Ok(());
            };
            if let Some(pos) = rt.position.as_mut() {
                log::info!("[EXIT_CHECK] {} reason={}", key, trigger.as_str());
                if !pos.transition(ExecState::Closing) {
                    return Ok(());
                }
                pos.exit_trigger = Some(trigger);
                self.positions_dirty = true;
            }
        }
        self.close_open_legs(key, mid_a, mid_b, now_ts).await
    }

    async fn close_open_legs(
        &mut self,
        key: &str,
        mid_a: f64,
        mid_b: f64,
        now_ts: i64,
    ) -> Result<()> {
        let legs = {
            let Some(rt) = self.runtimes.get(key) else {
                return Ok(());
            };
            let Some(pos) = rt.position.as_ref() else {
                return Ok(());
            };
            pos.legs.clone()
        };
        let (closed, stuck) = if legs.is_empty() {
            (Vec::new(), Vec::new())
        } else {
            self.lifecycle.close_legs(key, &legs).await
        };
        let record = {
            let Some(rt) = self.runtimes.get_mut(key) else {
                return Ok(());
            };
            let Some(pos) = rt.position.as_mut() else {
                return Ok(());
            };
            pos.closed_legs.extend(closed);
            pos.legs = stuck.into_iter().map(|(leg, _)| leg).collect();
            self.positions_dirty = true;
            if !pos.legs.is_empty() {
                log::warn!(
                    "[SAFETY] {} close incomplete, {} legs still open",
                    key,
                    pos.legs.len()
                );
                None
            } else {
                let pnl: Decimal = pos.closed_legs.iter().map(leg_pnl).sum();
                let exit_spread = rt
                    .model
                    .map(|m| m.spread(mid_a, mid_b))
                    .unwrap_or(pos.entry_spread);
                pos.transition(ExecState::Closed);
                let trigger = pos
                    .exit_trigger
                    .map(|t| t.as_str())
                    .unwrap_or("exit_signal");
                let record = TradeRecord {
                    ts: now_ts,
                    pair_id: key.to_string(),
                    direction: pos.direction.as_str().to_string(),
                    entry_time: pos.entry_time,
                    exit_time: now_ts,
                    entry_price: pos.entry_spread,
                    exit_price: exit_spread,
                    size: pos.unit_size,
                    pnl: pnl.to_f64().unwrap_or(0.0),
                    regime_at_entry: pos.regime_at_entry.as_str().to_string(),
                    trigger: trigger.to_string(),
                };
                rt.stats.record(record.pnl);
                if self.cfg.cooldown_secs > 0 {
                    rt.cooldown_until = Some(now_ts + self.cfg.cooldown_secs as i64);
                }
                rt.position = None;
                Some(record)
            }
        };
        if let Some(record) = record {
            log::info!(
                "[TRADE] {} {} closed pnl={:.2} trigger={}",
                key,
                record.direction,
                record.pnl,
                record.trigger
            );
            self.write_trade_record(record);
        }
        Ok(())
    }

    fn write_trade_record(&mut self, record: TradeRecord) {
        if let Some(logger) = &mut self.trade_logger {
            if let Err(err) = logger.log(&record) {
                log::warn!("[TRADE] failed to write trade log: {:?}", err);
            }
        }
    }

    fn open_position_count(&self) -> usize {
        self.runtimes
            .values()
            .filter(|rt| rt.position.is_some())
            .count()
    }

    // Exposure measured at entry prices; good enough for the leverage gate
    // between equity refreshes.
    fn gross_exposure(&self) -> Decimal {
        let mut total = Decimal::ZERO;
        for rt in self.runtimes.values() {
            if let Some(pos) = &rt.position {
                for leg in &pos.legs {
                    total += leg.size * leg.entry_price;
                }
            }
        }
        total
    }

    /// Entry gating chain for a signal that already cleared the entry
    /// threshold. Returns the first refusal, or None when the entry may be
    /// sized and submitted.
    fn entry_block(
        &self,
        key: &str,
        z: f64,
        thresholds: &Thresholds,
        cost_sigma: f64,
        now_ts: i64,
    ) -> Option<EntryBlock> {
        let rt = self.runtimes.get(key)?;
        if rt.position.is_some() {
            return Some(EntryBlock::PositionAlreadyOpen);
        }
        if rt
            .cooldown_until
            .map(|until| now_ts < until)
            .unwrap_or(false)
        {
            return Some(EntryBlock::Cooldown);
        }
        if z.abs() < thresholds.entry + cost_sigma {
            return Some(EntryBlock::CostExceedsEdge);
        }
        let regime = rt.last_regime;
        match regime.regime {
            Regime::Volatile => return Some(EntryBlock::RegimeVolatile),
            Regime::Trending => {
                if !self.cfg.allow_trending_entries {
                    return Some(EntryBlock::RegimeTrending);
                }
                if regime.confidence < self.cfg.regime_confidence_floor {
                    return Some(EntryBlock::RegimeConfidence);
                }
            }
            Regime::MeanReverting => {
                if regime.confidence < self.cfg.regime_confidence_floor {
                    return Some(EntryBlock::RegimeConfidence);
                }
            }
        }
        let candidate = window_tail(&rt.diff_window, self.cfg.correlation_window_bars);
        for (other_key, other) in &self.runtimes {
            if other_key == key || other.position.is_none() {
                continue;
            }
            let other_tail = window_tail(&other.diff_window, self.cfg.correlation_window_bars);
            if let Some(c) = correlation(&candidate, &other_tail) {
                if c.abs() > self.cfg.max_pair_correlation {
                    log::info!(
                        "[RISK] {} spread correlated {:.2} with open pair {}",
                        key,
                        c,
                        other_key
                    );
                    return Some(EntryBlock::CorrelationLimit);
                }
            }
        }
        portfolio_block(
            &self.risk_state,
            self.equity,
            self.gross_exposure(),
            self.open_position_count(),
            &self.limits,
        )
    }

    async fn consider_entry(
        &mut self,
        key: &str,
        sig: ZScoreSignal,
        thresholds: Thresholds,
        mid_a: Decimal,
        mid_b: Decimal,
    ) -> Result<()> {
        let (beta, train_std, regime_state, fraction_full, fraction_half, alloc, max_position, sym_a, sym_b) = {
            let Some(rt) = self.runtimes.get(key) else {
                return Ok(());
            };
            let Some(model) = rt.model else {
                return Ok(());
            };
            if !rt.tradeable {
                return Ok(());
            }
            (
                model.beta,
                model.train_std,
                rt.last_regime,
                position_fraction(&rt.stats, &self.sizing, false),
                position_fraction(&rt.stats, &self.sizing, true),
                rt.def.allocation,
                rt.def.max_position_size,
                rt.def.symbol_a.clone(),
                rt.def.symbol_b.clone(),
            )
        };
        if sig.z.abs() < thresholds.entry {
            return Ok(());
        }
        let (Some(pa), Some(pb)) = (mid_a.to_f64(), mid_b.to_f64()) else {
            return Ok(());
        };
        let cost_sigma = entry_cost_sigma(
            self.cfg.fee_bps,
            self.cfg.slippage_bps,
            pa,
            pb,
            beta,
            train_std,
        );
        if let Some(block) = self.entry_block(key, sig.z, &thresholds, cost_sigma, sig.ts) {
            match block {
                EntryBlock::PositionAlreadyOpen => {
                    log::debug!(
                        "[SIGNAL] {} qualifying z={:.2} ignored, position already open",
                        key,
                        sig.z
                    );
                }
                EntryBlock::DrawdownLimit
                | EntryBlock::DailyLossLimit
                | EntryBlock::LeverageLimit => {
                    let err = EngineError::RiskLimitBreached(block.as_str());
                    log::warn!("[RISK] {} entry blocked: {}", key, err);
                    notify_alert("portfolio circuit breaker", block.as_str());
                }
                _ => {
                    log::info!("[RISK] {} entry blocked ({})", key, block.as_str());
                }
            }
            return Ok(());
        }

        let direction = if sig.z > 0.0 {
            SpreadDirection::ShortSpread
        } else {
            SpreadDirection::LongSpread
        };
        let half = regime_state.regime == Regime::Trending;
        let fraction = if half { fraction_half } else { fraction_full };
        if fraction <= 0.0 {
            log::info!("[RISK] {} sizer declined the entry", key);
            return Ok(());
        }
        let Some(beta_dec) = Decimal::from_f64(beta) else {
            log::warn!("[ORDER] {} hedge ratio {} not representable", key, beta);
            return Ok(());
        };
        let denom = mid_a + beta_dec * mid_b;
        if denom <= Decimal::ZERO {
            log::warn!("[ORDER] {} degenerate quote, skipping entry", key);
            return Ok(());
        }
        let Some(scale) = Decimal::from_f64(alloc * fraction) else {
            return Ok(());
        };
        let unit = self.equity * scale / denom;
        let size_a = quantize_size(unit, self.cfg.size_step).min(max_position);
        let size_b = quantize_size(unit * beta_dec, self.cfg.size_step).min(max_position);
        if size_a <= Decimal::ZERO || size_b <= Decimal::ZERO {
            log::info!(
                "[ORDER] {} sized to zero (fraction {:.3}), skipping",
                key,
                fraction
            );
            return Ok(());
        }
        let (side_a, side_b) = direction.leg_sides();
        let leg_a = LegPlan {
            instrument: sym_a,
            side: side_a,
            size: size_a,
            stop_loss: None,
            take_profit: None,
        };
        let leg_b = LegPlan {
            instrument: sym_b,
            side: side_b,
            size: size_b,
            stop_loss: None,
            take_profit: None,
        };
        log::info!(
            "[SIGNAL] {} {} z={:.2} entry={:.2} exit={:.2} cost_sigma={:.3} fraction={:.3}{}",
            key,
            direction.as_str(),
            sig.z,
            thresholds.entry,
            thresholds.exit,
            cost_sigma,
            fraction,
            if half { " (half size)" } else { "" }
        );
        match self.lifecycle.submit_entry(key, direction, &leg_a, &leg_b).await {
            Ok(EntryOutcome::LoggedOnly) => {}
            Ok(EntryOutcome::Declined) => {}
            Ok(EntryOutcome::Opened { legs }) => {
                let unit_size = legs.first().map(|leg| leg.size).unwrap_or(Decimal::ZERO);
                let mut position = Position {
                    pair: key.to_string(),
                    direction,
                    legs,
                    closed_legs: Vec::new(),
                    unit_size,
                    entry_time: sig.ts,
                    entry_z: sig.z,
                    entry_spread: sig.spread,
                    stop_loss_z: self.cfg.stop_loss_z,
                    take_profit_z: self.cfg.take_profit_z,
                    regime_at_entry: regime_state.regime,
                    state: ExecState::PositionOpen,
                    exit_trigger: None,
                };
                position.transition(ExecState::Monitoring);
                log::info!(
                    "[POSITION] {} opened {} z={:.2} size={}x{}",
                    key,
                    direction.as_str(),
                    sig.z,
                    size_a,
                    size_b
                );
                if let Some(rt) = self.runtimes.get_mut(key) {
                    rt.position = Some(position);
                }
                self.positions_dirty = true;
            }
            Err(err) => {
                log::error!("[ORDER] {} entry failed: {}", key, err);
                if let EngineError::Broker(_) = err {
                    notify_alert(&format!("entry failure on {}", key), &err.to_string());
                }
            }
        }
        Ok(())
    }

    fn signal_snapshots(&self) -> Vec<SignalSnapshot> {
        let now_ts = Utc::now().timestamp();
        let mut out = Vec::with_capacity(self.pair_order.len());
        for key in &self.pair_order {
            let Some(rt) = self.runtimes.get(key) else {
                continue;
            };
            let signal = match rt.last_z {
                Some(z) if z >= self.cfg.entry_z_base => "SHORT",
                Some(z) if z <= -self.cfg.entry_z_base => "LONG",
                Some(_) => "HOLD",
                None => "HOLD",
            };
            let status = if let Some(pos) = &rt.position {
                match pos.state {
                    ExecState::Closing => "closing",
                    _ => "open",
                }
            } else if rt.model.is_none() {
                "warming_up"
            } else if !rt.tradeable {
                "disqualified"
            } else if rt
                .cooldown_until
                .map(|until| now_ts < until)
                .unwrap_or(false)
            {
                "cooldown"
            } else {
                "ready"
            };
            out.push(SignalSnapshot {
                pair: key.clone(),
                regime: rt.last_regime.regime.as_str().to_string(),
                z_score: rt.last_z,
                signal: signal.to_string(),
                status: status.to_string(),
            });
        }
        out
    }

    fn status_positions(&self) -> Vec<StatusPosition> {
        let mut out = Vec::new();
        for key in &self.pair_order {
            let Some(rt) = self.runtimes.get(key) else {
                continue;
            };
            if let Some(pos) = &rt.position {
                out.push(StatusPosition {
                    pair: key.clone(),
                    direction: pos.direction.as_str().to_string(),
                    size: pos.unit_size.to_string(),
                    entry_z: pos.entry_z,
                    entry_time: pos.entry_time,
                });
            }
        }
        out
    }

    fn persist_state(&mut self) {
        if self.positions_dirty {
            let map: HashMap<String, Position> = self
                .runtimes
                .iter()
                .filter_map(|(k, rt)| rt.position.clone().map(|p| (k.clone(), p)))
                .collect();
            self.store.save_positions(&map);
            self.positions_dirty = false;
        }
        if self.models_dirty {
            let map: HashMap<String, PairModelSnapshot> = self
                .runtimes
                .iter()
                .map(|(k, rt)| {
                    (
                        k.clone(),
                        PairModelSnapshot {
                            cointegration: rt.cointegration,
                            spread: rt.model,
                            regime: rt.regime_model.clone(),
                        },
                    )
                })
                .collect();
            self.store.save_models(&map);
            self.models_dirty = false;
        }
        if self.risk_dirty {
            self.store.save_risk_state(&self.risk_state);
            self.risk_dirty = false;
        }
    }
}

#[cfg(test)]
impl StatArbEngine {
    fn test_instance(cfg: EngineConfig, mode: RunMode, broker: BrokerBox) -> Self {
        Self::from_parts(cfg, mode, Arc::new(broker), Decimal::from(10_000))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use tempfile::NamedTempFile;

    fn dec(value: &str) -> Decimal {
        Decimal::from_str(value).unwrap()
    }

    #[test]
    fn resolve_pairs_defaults_allocation_evenly() {
        let pairs =
            resolve_pairs(vec!["AAA/BBB".to_string(), "CCC/DDD".to_string()]).unwrap();
        assert_eq!(pairs.len(), 2);
        assert!((pairs[0].allocation - 0.5).abs() < 1e-12);
        assert!((pairs[1].allocation - 0.5).abs() < 1e-12);
        assert_eq!(pairs[0].key(), "AAA/BBB");
    }

    #[test]
    fn resolve_pairs_honors_explicit_fields() {
        let pairs = resolve_pairs(vec![
            "AAA/BBB:0.6:2500".to_string(),
            "CCC/DDD".to_string(),
        ])
        .unwrap();
        assert!((pairs[0].allocation - 0.6).abs() < 1e-12);
        assert_eq!(pairs[0].max_position_size, dec("2500"));
        assert!((pairs[1].allocation - 0.5).abs() < 1e-12);
    }

    #[test]
    fn resolve_pairs_rejects_malformed_entries() {
        assert!(resolve_pairs(vec!["AAABBB".to_string()]).is_err());
        assert!(resolve_pairs(vec!["AAA/".to_string()]).is_err());
        assert!(resolve_pairs(vec!["AAA/BBB:nope".to_string()]).is_err());
        assert!(resolve_pairs(vec!["AAA/BBB:1.5".to_string()]).is_err());
    }

    #[test]
    fn quantize_size_rounds_down_to_step() {
        assert_eq!(quantize_size(dec("0.0023"), dec("0.001")), dec("0.002"));
        assert_eq!(quantize_size(dec("5"), dec("0")), dec("5"));
    }

    #[test]
    fn bar_builder_emits_close_on_boundary() {
        let mut builder = BarBuilder::new(60);
        assert!(builder.push(0, dec("100")).is_none());
        assert!(builder.push(30, dec("101")).is_none());
        let (close, close_ts) = builder.push(65, dec("102")).unwrap();
        assert_eq!(close, dec("101"));
        assert_eq!(close_ts, 60);
        let (close, close_ts) = builder.push(130, dec("103")).unwrap();
        assert_eq!(close, dec("102"));
        assert_eq!(close_ts, 125);
    }

    #[test]
    fn entry_cost_sigma_converts_round_trip_cost() {
        let sigma = entry_cost_sigma(5.0, 5.0, 100.0, 50.0, 1.0, 1.5);
        assert!((sigma - 0.2).abs() < 1e-12);
        assert!(entry_cost_sigma(5.0, 5.0, 100.0, 50.0, 1.0, 0.0).is_infinite());
    }

    fn short_position(entry_time: i64) -> Position {
        Position {
            pair: "AAA/BBB".to_string(),
            direction: SpreadDirection::ShortSpread,
            legs: Vec::new(),
            closed_legs: Vec::new(),
            unit_size: dec("1"),
            entry_time,
            entry_z: 2.5,
            entry_spread: 2.5,
            stop_loss_z: 4.0,
            take_profit_z: 0.0,
            regime_at_entry: Regime::MeanReverting,
            state: ExecState::Monitoring,
            exit_trigger: None,
        }
    }

    #[test]
    fn exit_trigger_precedence() {
        let pos = short_position(1_000);
        assert_eq!(
            exit_trigger_for(&pos, 1.5, 0.5, 3_600, 1_000 + 3_600),
            Some(ExitTrigger::ForcedLiquidation)
        );
        assert_eq!(
            exit_trigger_for(&pos, 4.2, 0.5, 86_400, 2_000),
            Some(ExitTrigger::StopLossHit)
        );
        assert_eq!(
            exit_trigger_for(&pos, -0.1, 0.5, 86_400, 2_000),
            Some(ExitTrigger::TakeProfitHit)
        );
        assert_eq!(
            exit_trigger_for(&pos, 0.4, 0.5, 86_400, 2_000),
            Some(ExitTrigger::ExitSignal)
        );
        assert_eq!(exit_trigger_for(&pos, 1.2, 0.5, 86_400, 2_000), None);
    }

    #[test]
    fn trade_record_serializes_expected_fields() {
        let record = TradeRecord {
            ts: 1,
            pair_id: "AAA/BBB".to_string(),
            direction: "short_spread".to_string(),
            entry_time: 1,
            exit_time: 2,
            entry_price: 2.5,
            exit_price: 0.4,
            size: dec("1.5"),
            pnl: 12.5,
            regime_at_entry: "MEAN_REVERTING".to_string(),
            trigger: "exit_signal".to_string(),
        };
        let value = serde_json::to_value(&record).unwrap();
        for field in [
            "pair_id",
            "direction",
            "entry_time",
            "exit_time",
            "entry_price",
            "exit_price",
            "size",
            "pnl",
            "regime_at_entry",
        ] {
            assert!(value.get(field).is_some(), "missing {}", field);
        }
    }

    #[test]
    fn engine_error_display_names_the_pair() {
        let err = EngineError::CointegrationLost {
            pair: "AAA/BBB".to_string(),
            p_value: 0.42,
        };
        let text = err.to_string();
        assert!(text.contains("AAA/BBB"));
        assert!(text.contains("0.420"));
    }

    #[test]
    fn engine_config_loads_yaml_with_pairs() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            "entry_z_base: 2.2\nexit_z_base: 0.4\nstop_loss_z: 4.5\npairs:\n  - AAA/BBB:0.7\n  - CCC/DDD\n"
        )
        .unwrap();
        let cfg = EngineConfig::from_yaml_path(file.path()).unwrap();
        assert!((cfg.entry_z_base - 2.2).abs() < 1e-12);
        assert!((cfg.exit_z_base - 0.4).abs() < 1e-12);
        assert_eq!(cfg.pairs.len(), 2);
        assert!((cfg.pairs[0].allocation - 0.7).abs() < 1e-12);
    }

    #[test]
    fn engine_config_rejects_inverted_bands() {
        let mut cfg = EngineConfig::defaults();
        cfg.pairs = resolve_pairs(vec!["AAA/BBB".to_string()]).unwrap();
        cfg.exit_z_base = 2.5;
        assert!(cfg.validate().is_err());
        cfg.exit_z_base = 0.5;
        cfg.stop_loss_z = 1.0;
        assert!(cfg.validate().is_err());
    }
}

#[cfg(test)]
mod engine_tests {
    use super::*;
    use crate::broker::{Broker, OrderSide};
    use ctor::ctor;
    use std::str::FromStr;
    use tempfile::tempdir;

    #[ctor]
    fn init_test_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn dec(value: &str) -> Decimal {
        Decimal::from_str(value).unwrap()
    }

    fn test_config(dir: &Path) -> EngineConfig {
        let mut cfg = EngineConfig::defaults();
        cfg.interval_secs = 1;
        cfg.trading_period_secs = 1;
        cfg.training_window_bars = 60;
        cfg.min_training_samples = 20;
        cfg.retrain_secs = 60;
        cfg.cooldown_secs = 0;
        cfg.half_life_min_days = 0.0;
        cfg.min_trades_for_kelly = 5;
        cfg.correlation_window_bars = 40;
        cfg.recent_vol_bars = 20;
        cfg.fee_bps = 0.0;
        cfg.slippage_bps = 0.0;
        cfg.state_dir = dir.to_path_buf();
        cfg.pairs = resolve_pairs(vec!["AAA/BBB:0.5".to_string(), "CCC/DDD:0.5".to_string()])
            .unwrap();
        cfg
    }

    fn paper_engine(cfg: EngineConfig, mode: RunMode) -> StatArbEngine {
        let broker = BrokerBox::create("paper", None).unwrap();
        StatArbEngine::test_instance(cfg, mode, broker)
    }

    fn make_tradeable(engine: &mut StatArbEngine, key: &str, train_mean: f64) {
        let rt = engine.runtimes.get_mut(key).unwrap();
        rt.model = Some(SpreadModel {
            beta: 1.0,
            train_mean,
            train_std: 1.0,
            train_vol: 1.0,
            trained_at: 0,
        });
        rt.cointegration = Some(CointegrationResult {
            beta: 1.0,
            intercept: 0.0,
            p_value: 0.01,
            half_life_days: 5.0,
            evaluated_at: 0,
            samples: 100,
        });
        rt.tradeable = true;
        rt.last_regime = RegimeState {
            regime: Regime::MeanReverting,
            confidence: 0.9,
            posterior: [0.9, 0.05, 0.05],
        };
    }

    fn qualifying_signal(z: f64) -> ZScoreSignal {
        ZScoreSignal {
            ts: 1_000,
            z,
            spread: 0.0,
            mean: -z,
            std: 1.0,
        }
    }

    fn base_thresholds() -> Thresholds {
        Thresholds {
            entry: 2.0,
            exit: 0.5,
        }
    }

    #[tokio::test]
    async fn second_qualifying_signal_same_pair_is_ignored() {
        let dir = tempdir().unwrap();
        let cfg = test_config(dir.path());
        let mut engine = paper_engine(cfg, RunMode::LiveTest);
        let paper = engine.broker.paper_handle().unwrap();
        paper.set_price("AAA", dec("100"));
        paper.set_price("BBB", dec("100"));
        make_tradeable(&mut engine, "AAA/BBB", -3.0);

        engine
            .consider_entry(
                "AAA/BBB",
                qualifying_signal(3.0),
                base_thresholds(),
                dec("100"),
                dec("100"),
            )
            .await
            .unwrap();
        assert!(engine.runtimes["AAA/BBB"].position.is_some());
        let open = engine.broker.get_open_positions().await.unwrap();
        assert_eq!(open.len(), 2);

        engine
            .consider_entry(
                "AAA/BBB",
                qualifying_signal(3.0),
                base_thresholds(),
                dec("100"),
                dec("100"),
            )
            .await
            .unwrap();
        let open = engine.broker.get_open_positions().await.unwrap();
        assert_eq!(open.len(), 2, "second signal must not add legs");
    }

    #[tokio::test]
    async fn correlated_candidate_is_held_while_first_pair_is_open() {
        let dir = tempdir().unwrap();
        let cfg = test_config(dir.path());
        let mut engine = paper_engine(cfg, RunMode::LiveTest);
        make_tradeable(&mut engine, "AAA/BBB", -3.0);
        make_tradeable(&mut engine, "CCC/DDD", -3.0);

        let wave: Vec<f64> = (0..40).map(|i| (i as f64 * 0.35).sin()).collect();
        {
            let rt = engine.runtimes.get_mut("AAA/BBB").unwrap();
            rt.diff_window = wave.iter().copied().collect();
            let mut pos = super::tests_support::stub_position("AAA/BBB");
            pos.state = ExecState::Monitoring;
            rt.position = Some(pos);
        }
        {
            let rt = engine.runtimes.get_mut("CCC/DDD").unwrap();
            rt.diff_window = wave.iter().map(|v| v * 2.0).collect();
        }
        let block = engine.entry_block("CCC/DDD", 3.0, &base_thresholds(), 0.0, 1_000);
        assert_eq!(block, Some(EntryBlock::CorrelationLimit));

        let flat: Vec<f64> = (0..40).map(|i| if i % 2 == 0 { 0.5 } else { -0.5 }).collect();
        {
            let candidate = window_tail(
                &flat.iter().copied().collect::<VecDeque<f64>>(),
                40,
            );
            let open = window_tail(&wave.iter().copied().collect::<VecDeque<f64>>(), 40);
            let c = correlation(&candidate, &open).unwrap();
            assert!(c.abs() < 0.7, "test windows unexpectedly correlated: {}", c);
        }
        {
            let rt = engine.runtimes.get_mut("CCC/DDD").unwrap();
            rt.diff_window = flat.into_iter().collect();
        }
        let block = engine.entry_block("CCC/DDD", 3.0, &base_thresholds(), 0.0, 1_000);
        assert_eq!(block, None);
    }

    #[tokio::test]
    async fn drawdown_breaker_blocks_entry() {
        let dir = tempdir().unwrap();
        let cfg = test_config(dir.path());
        let mut engine = paper_engine(cfg, RunMode::LiveTest);
        make_tradeable(&mut engine, "AAA/BBB", -3.0);

        engine.risk_state.high_watermark = dec("10000");
        engine.risk_state.day_start_equity = dec("7900");
        engine.equity = dec("7900");
        let block = engine.entry_block("AAA/BBB", 3.0, &base_thresholds(), 0.0, 1_000);
        assert_eq!(block, Some(EntryBlock::DrawdownLimit));
    }

    #[tokio::test]
    async fn exit_path_stays_open_while_breaker_is_tripped() {
        let dir = tempdir().unwrap();
        let cfg = test_config(dir.path());
        let mut engine = paper_engine(cfg, RunMode::LiveTest);
        let paper = engine.broker.paper_handle().unwrap();
        paper.set_price("AAA", dec("100"));
        paper.set_price("BBB", dec("100"));
        make_tradeable(&mut engine, "AAA/BBB", -3.0);

        engine
            .consider_entry(
                "AAA/BBB",
                qualifying_signal(3.0),
                base_thresholds(),
                dec("100"),
                dec("100"),
            )
            .await
            .unwrap();
        assert!(engine.runtimes["AAA/BBB"].position.is_some());

        engine.risk_state.high_watermark = dec("20000");
        engine.equity = dec("10000");
        paper.set_price("AAA", dec("97.3"));
        {
            let rt = engine.runtimes.get_mut("AAA/BBB").unwrap();
            rt.model = Some(SpreadModel {
                beta: 1.0,
                train_mean: -3.0,
                train_std: 1.0,
                train_vol: 1.0,
                trained_at: 0,
            });
        }
        engine
            .manage_position("AAA/BBB", 97.3, 100.0, 2_000)
            .await
            .unwrap();
        assert!(engine.runtimes["AAA/BBB"].position.is_none());
        assert_eq!(engine.runtimes["AAA/BBB"].stats.len(), 1);
        let open = engine.broker.get_open_positions().await.unwrap();
        assert!(open.is_empty());
    }

    #[tokio::test]
    async fn restart_resumes_monitoring_for_matching_positions() {
        let dir = tempdir().unwrap();
        let cfg = test_config(dir.path());
        let mut engine = paper_engine(cfg, RunMode::LiveTest);
        let paper = engine.broker.paper_handle().unwrap();
        paper.set_price("AAA", dec("100"));
        paper.set_price("BBB", dec("100"));

        let first = engine
            .broker
            .create_position("AAA", OrderSide::Sell, dec("1"), None, None)
            .await
            .unwrap();
        let second = engine
            .broker
            .create_position("BBB", OrderSide::Buy, dec("1"), None, None)
            .await
            .unwrap();
        let mut position = super::tests_support::stub_position("AAA/BBB");
        position.state = ExecState::Monitoring;
        position.legs = vec![
            OpenLeg {
                instrument: "AAA".to_string(),
                side: OrderSide::Sell,
                size: dec("1"),
                entry_price: first.filled_price,
                deal_reference: first.deal_reference,
            },
            OpenLeg {
                instrument: "BBB".to_string(),
                side: OrderSide::Buy,
                size: dec("1"),
                entry_price: second.filled_price,
                deal_reference: second.deal_reference,
            },
        ];
        let mut stale = super::tests_support::stub_position("CCC/DDD");
        stale.legs = vec![OpenLeg {
            instrument: "CCC".to_string(),
            side: OrderSide::Buy,
            size: dec("1"),
            entry_price: dec("10"),
            deal_reference: "D-404".to_string(),
        }];
        let mut persisted = HashMap::new();
        persisted.insert("AAA/BBB".to_string(), position);
        persisted.insert("CCC/DDD".to_string(), stale);

        engine.reconcile_on_startup(persisted).await.unwrap();
        let resumed = engine.runtimes["AAA/BBB"].position.as_ref().unwrap();
        assert_eq!(resumed.state, ExecState::Monitoring);
        assert_eq!(resumed.legs.len(), 2);
        assert!(engine.runtimes["CCC/DDD"].position.is_none());
    }

    #[tokio::test]
    async fn state_store_round_trips_positions_and_models() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());

        let mut positions = HashMap::new();
        positions.insert(
            "AAA/BBB".to_string(),
            super::tests_support::stub_position("AAA/BBB"),
        );
        store.save_positions(&positions);
        let loaded = store.load_positions();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded["AAA/BBB"].state, ExecState::Monitoring);

        let mut models = HashMap::new();
        models.insert(
            "AAA/BBB".to_string(),
            PairModelSnapshot {
                cointegration: Some(CointegrationResult {
                    beta: 1.25,
                    intercept: 0.1,
                    p_value: 0.02,
                    half_life_days: 4.0,
                    evaluated_at: 7,
                    samples: 90,
                }),
                spread: Some(SpreadModel {
                    beta: 1.25,
                    train_mean: 0.4,
                    train_std: 0.9,
                    train_vol: 0.2,
                    trained_at: 7,
                }),
                regime: None,
            },
        );
        store.save_models(&models);
        let loaded = store.load_models();
        let snapshot = &loaded["AAA/BBB"];
        assert!((snapshot.spread.unwrap().beta - 1.25).abs() < 1e-12);
        assert!((snapshot.cointegration.unwrap().p_value - 0.02).abs() < 1e-12);
    }

    #[tokio::test]
    async fn risk_marks_round_trip_through_state_store() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        assert!(store.load_risk_state().is_none());

        let day = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let mut state = PortfolioRiskState::new(dec("10000"), day);
        state.observe(dec("12500"), day);
        store.save_risk_state(&state);

        let loaded = store.load_risk_state().expect("risk marks written");
        assert_eq!(loaded.high_watermark, dec("12500"));
        assert_eq!(loaded.day_start_equity, dec("10000"));
        assert_eq!(loaded.day, day.date_naive());
    }

    #[tokio::test]
    async fn trade_logger_appends_daily_jsonl() {
        let dir = tempdir().unwrap();
        let mut logger = TradeLogger {
            dir: dir.path().to_path_buf(),
            tag: Some("test".to_string()),
            retain_days: 7,
            last_cleanup: None,
        };
        let record = TradeRecord {
            ts: 1,
            pair_id: "AAA/BBB".to_string(),
            direction: "long_spread".to_string(),
            entry_time: 1,
            exit_time: 2,
            entry_price: -2.1,
            exit_price: -0.3,
            size: dec("2"),
            pnl: 8.0,
            regime_at_entry: "MEAN_REVERTING".to_string(),
            trigger: "exit_signal".to_string(),
        };
        logger.log(&record).unwrap();
        let entry = fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .find(|e| {
                e.file_name()
                    .to_string_lossy()
                    .starts_with("trades-test-")
            })
            .expect("trade log file written");
        let body = fs::read_to_string(entry.path()).unwrap();
        let parsed: TradeRecord = serde_json::from_str(body.trim()).unwrap();
        assert_eq!(parsed.pair_id, "AAA/BBB");
        assert!((parsed.pnl - 8.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn status_reporter_writes_snapshot_and_baseline() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("status.json");
        let mut reporter = StatusReporter {
            equity_baseline_path: path.with_extension("equity.json"),
            equity_history_path: path.with_extension("equity_history.jsonl"),
            path,
            mode: "dry".to_string(),
            broker: "paper".to_string(),
            interval_secs: 1,
            snapshot_every: Duration::from_secs(1),
            equity: 0.0,
            pnl_today: 0.0,
            equity_day_start: 0.0,
            equity_day_start_set: false,
            day: Utc::now().date_naive(),
            last_history_ts: None,
            last_snapshot: None,
        };
        reporter.update_equity(10_500.0);
        let signals = vec![SignalSnapshot {
            pair: "AAA/BBB".to_string(),
            regime: "MEAN_REVERTING".to_string(),
            z_score: Some(1.2),
            signal: "HOLD".to_string(),
            status: "ready".to_string(),
        }];
        reporter.write_snapshot(&signals, &[]).unwrap();

        let body = fs::read_to_string(&reporter.path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["signals"].as_array().unwrap().len(), 1);
        assert!((value["equity"].as_f64().unwrap() - 10_500.0).abs() < 1e-9);
        assert!(!value["has_position"].as_bool().unwrap());
        assert!(reporter.equity_baseline_path.exists());
    }
}

#[cfg(test)]
mod tests_support {
    use super::*;
    use std::str::FromStr;

    pub fn stub_position(pair: &str) -> Position {
        Position {
            pair: pair.to_string(),
            direction: SpreadDirection::ShortSpread,
            legs: Vec::new(),
            closed_legs: Vec::new(),
            unit_size: Decimal::from_str("1").unwrap(),
            entry_time: 1_000,
            entry_z: 2.5,
            entry_spread: 2.5,
            stop_loss_z: 4.0,
            take_profit_z: 0.0,
            regime_at_entry: Regime::MeanReverting,
            state: ExecState::Monitoring,
            exit_trigger: None,
        }
    }
}
