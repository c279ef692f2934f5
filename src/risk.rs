use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Kelly criterion: f* = (p * b - q) / b with b = avg_win / avg_loss.
/// Degenerate inputs size to zero instead of erroring.
pub fn kelly_fraction(win_rate: f64, avg_win: f64, avg_loss: f64) -> f64 {
    if !(0.0..=1.0).contains(&win_rate) || avg_win <= 0.0 || avg_loss <= 0.0 {
        return 0.0;
    }
    let b = avg_win / avg_loss;
    let q = 1.0 - win_rate;
    ((win_rate * b - q) / b).max(0.0)
}

/// Trailing realized-pnl window backing the Kelly inputs. Only closed trades
/// are recorded here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeStats {
    pnls: VecDeque<f64>,
    capacity: usize,
}

impl TradeStats {
    pub fn new(capacity: usize) -> Self {
        Self {
            pnls: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&mut self, pnl: f64) {
        if self.pnls.len() == self.capacity {
            self.pnls.pop_front();
        }
        self.pnls.push_back(pnl);
    }

    pub fn len(&self) -> usize {
        self.pnls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pnls.is_empty()
    }

    pub fn win_rate(&self) -> Option<f64> {
        if self.pnls.is_empty() {
            return None;
        }
        let wins = self.pnls.iter().filter(|p| **p > 0.0).count();
        Some(wins as f64 / self.pnls.len() as f64)
    }

    pub fn avg_win(&self) -> Option<f64> {
        let wins: Vec<f64> = self.pnls.iter().copied().filter(|p| *p > 0.0).collect();
        if wins.is_empty() {
            return None;
        }
        Some(wins.iter().sum::<f64>() / wins.len() as f64)
    }

    pub fn avg_loss(&self) -> Option<f64> {
        let losses: Vec<f64> = self.pnls.iter().copied().filter(|p| *p < 0.0).collect();
        if losses.is_empty() {
            return None;
        }
        Some(losses.iter().map(|p| p.abs()).sum::<f64>() / losses.len() as f64)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SizingConfig {
    pub kelly_multiplier: f64,
    pub max_fraction: f64,
    pub fallback_fraction: f64,
    pub min_trades: usize,
}

/// Capital fraction for the next entry. Falls back to the fixed fraction
/// until the history is deep enough to estimate win statistics, and whenever
/// the history is one-sided.
pub fn position_fraction(stats: &TradeStats, cfg: &SizingConfig, half_size: bool) -> f64 {
    let full = if stats.len() < cfg.min_trades {
        cfg.fallback_fraction
    } else {
        match (stats.win_rate(), stats.avg_win(), stats.avg_loss()) {
            (Some(win_rate), Some(avg_win), Some(avg_loss)) => {
                kelly_fraction(win_rate, avg_win, avg_loss) * cfg.kelly_multiplier
            }
            _ => cfg.fallback_fraction,
        }
    };
    let clamped = full.clamp(0.0, cfg.max_fraction);
    if half_size {
        clamped * 0.5
    } else {
        clamped
    }
}

pub fn correlation(a: &[f64], b: &[f64]) -> Option<f64> {
    let n = a.len().min(b.len());
    if n < 2 {
        return None;
    }
    let mean_a = a[..n].iter().sum::<f64>() / n as f64;
    let mean_b = b[..n].iter().sum::<f64>() / n as f64;
    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for i in 0..n {
        let da = a[i] - mean_a;
        let db = b[i] - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }
    let denom = (var_a * var_b).sqrt();
    if denom < 1e-12 {
        return None;
    }
    Some(cov / denom)
}

#[derive(Debug, Clone, Copy)]
pub struct RiskLimits {
    pub max_drawdown: f64,
    pub max_leverage: f64,
    pub max_daily_loss: f64,
    pub max_pair_correlation: f64,
    pub max_open_positions: usize,
}

/// Portfolio-wide reference marks. High watermark never decreases; the daily
/// baseline resets at the UTC day boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioRiskState {
    pub high_watermark: Decimal,
    pub day_start_equity: Decimal,
    pub day: NaiveDate,
}

impl PortfolioRiskState {
    pub fn new(equity: Decimal, now: DateTime<Utc>) -> Self {
        Self {
            high_watermark: equity,
            day_start_equity: equity,
            day: now.date_naive(),
        }
    }

    /// Returns true when either mark moved.
    pub fn observe(&mut self, equity: Decimal, now: DateTime<Utc>) -> bool {
        let mut moved = false;
        let today = now.date_naive();
        if today != self.day {
            self.day = today;
            self.day_start_equity = equity;
            moved = true;
        }
        if equity > self.high_watermark {
            self.high_watermark = equity;
            moved = true;
        }
        moved
    }

    /// Merge marks persisted by an earlier run. The watermark is monotone;
    /// the daily baseline only carries over within the same UTC day.
    pub fn restore(&mut self, saved: &PortfolioRiskState) {
        if saved.high_watermark > self.high_watermark {
            self.high_watermark = saved.high_watermark;
        }
        if saved.day == self.day {
            self.day_start_equity = saved.day_start_equity;
        }
    }

    pub fn drawdown(&self, equity: Decimal) -> f64 {
        if self.high_watermark <= Decimal::ZERO {
            return 0.0;
        }
        ratio(self.high_watermark - equity, self.high_watermark).max(0.0)
    }

    pub fn daily_loss(&self, equity: Decimal) -> f64 {
        if self.day_start_equity <= Decimal::ZERO {
            return 0.0;
        }
        ratio(self.day_start_equity - equity, self.day_start_equity).max(0.0)
    }
}

fn ratio(num: Decimal, den: Decimal) -> f64 {
    if den == Decimal::ZERO {
        return 0.0;
    }
    (num / den).to_f64().unwrap_or(0.0)
}

/// Reasons an otherwise qualified entry signal is refused. The string form
/// goes into logs and the trade journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryBlock {
    DrawdownLimit,
    DailyLossLimit,
    LeverageLimit,
    TooManyPositions,
    PositionAlreadyOpen,
    CorrelationLimit,
    RegimeVolatile,
    RegimeTrending,
    RegimeConfidence,
    CostExceedsEdge,
    Cooldown,
}

impl EntryBlock {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryBlock::DrawdownLimit => "risk.drawdown_limit",
            EntryBlock::DailyLossLimit => "risk.daily_loss_limit",
            EntryBlock::LeverageLimit => "risk.leverage_limit",
            EntryBlock::TooManyPositions => "risk.too_many_positions",
            EntryBlock::PositionAlreadyOpen => "risk.position_open",
            EntryBlock::CorrelationLimit => "risk.correlation_limit",
            EntryBlock::RegimeVolatile => "regime.volatile",
            EntryBlock::RegimeTrending => "regime.trending",
            EntryBlock::RegimeConfidence => "regime.low_confidence",
            EntryBlock::CostExceedsEdge => "cost.exceeds_edge",
            EntryBlock::Cooldown => "risk.cooldown",
        }
    }
}

/// Circuit breakers, checked before any new entry. Breaches block entries
/// only; exits and stop handling keep running.
pub fn portfolio_block(
    state: &PortfolioRiskState,
    equity: Decimal,
    gross_exposure: Decimal,
    open_positions: usize,
    limits: &RiskLimits,
) -> Option<EntryBlock> {
    if state.drawdown(equity) > limits.max_drawdown {
        return Some(EntryBlock::DrawdownLimit);
    }
    if state.daily_loss(equity) > limits.max_daily_loss {
        return Some(EntryBlock::DailyLossLimit);
    }
    if ratio(gross_exposure, equity) > limits.max_leverage {
        return Some(EntryBlock::LeverageLimit);
    }
    if open_positions >= limits.max_open_positions {
        return Some(EntryBlock::TooManyPositions);
    }
    None
}
