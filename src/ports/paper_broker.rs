use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use rand::thread_rng;
use rand_distr::{Distribution, Normal};
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::broker::{
    AccountBalance, Broker, BrokerError, BrokerPosition, ClosePositionResponse,
    CreatePositionResponse, MarketSnapshot, OrderSide,
};

const BPS: Decimal = Decimal::from_parts(10_000, 0, 0, false, 0);

/// One line of a replay file: a timestamp plus the mid marks observed then.
#[derive(Debug, Clone, Deserialize)]
struct ReplayRecord {
    ts: i64,
    prices: HashMap<String, f64>,
}

struct ReplayTape {
    records: Vec<ReplayRecord>,
    cursor: AtomicUsize,
}

/// In-memory brokerage for dry runs and replays. Fills cross a synthetic
/// bid/ask book built from mid marks, realized pnl settles into cash on
/// close, and open deals are held in a reference ledger so restart
/// reconciliation can be exercised without a live venue.
pub struct PaperBroker {
    half_spread_bps: Decimal,
    slippage: Option<Normal<f64>>,
    marks: Mutex<HashMap<String, Decimal>>,
    deals: Mutex<HashMap<String, BrokerPosition>>,
    cash: Mutex<Decimal>,
    deal_seq: AtomicUsize,
    clock: AtomicI64,
    replay: Option<ReplayTape>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl PaperBroker {
    pub fn new(starting_cash: Decimal, half_spread_bps: Decimal, slippage_std_bps: f64) -> Self {
        let slippage = if slippage_std_bps > 0.0 {
            Normal::new(0.0, slippage_std_bps).ok()
        } else {
            None
        };
        Self {
            half_spread_bps,
            slippage,
            marks: Mutex::new(HashMap::new()),
            deals: Mutex::new(HashMap::new()),
            cash: Mutex::new(starting_cash),
            deal_seq: AtomicUsize::new(0),
            clock: AtomicI64::new(0),
            replay: None,
        }
    }

    /// Same broker, but with marks driven by a recorded price tape instead of
    /// `set_price`. Lines that fail to parse are skipped with a warning so a
    /// truncated tail does not abort a long replay.
    pub fn with_replay_file(
        path: &Path,
        starting_cash: Decimal,
        half_spread_bps: Decimal,
    ) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("failed to open replay file {}", path.display()))?;
        let mut records = Vec::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line.with_context(|| format!("failed to read replay line {}", idx + 1))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ReplayRecord>(&line) {
                Ok(record) => records.push(record),
                Err(err) => {
                    log::warn!("[REPLAY] skipping malformed line {}: {}", idx + 1, err);
                }
            }
        }
        log::info!(
            "[REPLAY] loaded {} records from {}",
            records.len(),
            path.display()
        );
        let mut broker = Self::new(starting_cash, half_spread_bps, 0.0);
        broker.replay = Some(ReplayTape {
            records,
            cursor: AtomicUsize::new(0),
        });
        Ok(broker)
    }

    pub fn is_replay(&self) -> bool {
        self.replay.is_some()
    }

    pub fn set_price(&self, instrument: &str, mid: Decimal) {
        lock(&self.marks).insert(instrument.to_string(), mid);
        self.clock.store(Utc::now().timestamp(), Ordering::SeqCst);
    }

    /// Advance the replay cursor by one record, applying its marks. Returns
    /// false once the tape is exhausted.
    pub fn tick(&self) -> bool {
        let Some(tape) = &self.replay else {
            return false;
        };
        let idx = tape.cursor.fetch_add(1, Ordering::SeqCst);
        let Some(record) = tape.records.get(idx) else {
            return false;
        };
        let mut marks = lock(&self.marks);
        for (instrument, price) in &record.prices {
            if let Some(mid) = Decimal::from_f64(*price) {
                marks.insert(instrument.clone(), mid);
            }
        }
        self.clock.store(record.ts, Ordering::SeqCst);
        true
    }

    fn now_ts(&self) -> i64 {
        if self.replay.is_some() {
            self.clock.load(Ordering::SeqCst)
        } else {
            Utc::now().timestamp()
        }
    }

    fn snapshot_of(&self, instrument: &str) -> Result<MarketSnapshot, BrokerError> {
        let mid = lock(&self.marks)
            .get(instrument)
            .copied()
            .ok_or_else(|| BrokerError::Other(format!("no mark for {}", instrument)))?;
        let half = mid * self.half_spread_bps / BPS;
        Ok(MarketSnapshot {
            instrument: instrument.to_string(),
            bid: mid - half,
            ask: mid + half,
            ts: self.now_ts(),
        })
    }

    fn fill_price(&self, snapshot: &MarketSnapshot, side: OrderSide) -> Decimal {
        let base = snapshot.side_price(side);
        let Some(dist) = &self.slippage else {
            return base;
        };
        let jitter_bps = dist.sample(&mut thread_rng());
        let jitter = Decimal::from_f64(jitter_bps).unwrap_or(Decimal::ZERO) / BPS;
        match side {
            OrderSide::Buy => base * (Decimal::ONE + jitter),
            OrderSide::Sell => base * (Decimal::ONE - jitter),
        }
    }

    fn unrealized(&self, marks: &HashMap<String, Decimal>, deal: &BrokerPosition) -> Decimal {
        let Some(mid) = marks.get(&deal.instrument) else {
            return Decimal::ZERO;
        };
        let diff = *mid - deal.entry_price;
        match deal.side {
            OrderSide::Buy => diff * deal.size,
            OrderSide::Sell => -diff * deal.size,
        }
    }
}

#[async_trait]
impl Broker for PaperBroker {
    async fn start(&self) -> Result<(), BrokerError> {
        let tape_len = self.replay.as_ref().map(|t| t.records.len()).unwrap_or(0);
        log::info!(
            "[PAPER] broker ready (cash={}, replay_records={})",
            lock(&self.cash),
            tape_len
        );
        Ok(())
    }

    async fn stop(&self) -> Result<(), BrokerError> {
        let deals = lock(&self.deals);
        log::info!(
            "[PAPER] broker stopped (cash={}, open_deals={})",
            lock(&self.cash),
            deals.len()
        );
        Ok(())
    }

    async fn get_account_balance(&self) -> Result<AccountBalance, BrokerError> {
        let cash = *lock(&self.cash);
        let marks = lock(&self.marks);
        let deals = lock(&self.deals);
        let unrealized: Decimal = deals.values().map(|d| self.unrealized(&marks, d)).sum();
        let equity = cash + unrealized;
        Ok(AccountBalance {
            balance: cash,
            available: equity,
            equity,
        })
    }

    async fn get_market_snapshot(&self, instrument: &str) -> Result<MarketSnapshot, BrokerError> {
        self.snapshot_of(instrument)
    }

    async fn create_position(
        &self,
        instrument: &str,
        side: OrderSide,
        size: Decimal,
        _stop_loss: Option<Decimal>,
        _take_profit: Option<Decimal>,
    ) -> Result<CreatePositionResponse, BrokerError> {
        if size <= Decimal::ZERO {
            return Err(BrokerError::OrderRejected(format!(
                "non-positive size {}",
                size
            )));
        }
        let snapshot = self
            .snapshot_of(instrument)
            .map_err(|_| BrokerError::OrderRejected(format!("no market for {}", instrument)))?;
        let filled_price = self.fill_price(&snapshot, side);
        let deal_reference = format!("P-{:06}", self.deal_seq.fetch_add(1, Ordering::SeqCst));
        lock(&self.deals).insert(
            deal_reference.clone(),
            BrokerPosition {
                deal_reference: deal_reference.clone(),
                instrument: instrument.to_string(),
                side,
                size,
                entry_price: filled_price,
            },
        );
        log::info!(
            "[PAPER_FILL] open {} {} {} @ {} ({})",
            side.as_str(),
            size,
            instrument,
            filled_price,
            deal_reference
        );
        Ok(CreatePositionResponse {
            deal_reference,
            filled_price,
            filled_size: size,
        })
    }

    async fn close_position(
        &self,
        deal_reference: &str,
    ) -> Result<ClosePositionResponse, BrokerError> {
        let deal = lock(&self.deals)
            .remove(deal_reference)
            .ok_or_else(|| BrokerError::UnknownDeal(deal_reference.to_string()))?;
        let snapshot = self.snapshot_of(&deal.instrument)?;
        let close_price = self.fill_price(&snapshot, deal.side.opposite());
        let diff = close_price - deal.entry_price;
        let pnl = match deal.side {
            OrderSide::Buy => diff * deal.size,
            OrderSide::Sell => -diff * deal.size,
        };
        *lock(&self.cash) += pnl;
        log::info!(
            "[PAPER_FILL] close {} {} {} @ {} pnl={} ({})",
            deal.side.opposite().as_str(),
            deal.size,
            deal.instrument,
            close_price,
            pnl,
            deal_reference
        );
        Ok(ClosePositionResponse {
            deal_reference: deal_reference.to_string(),
            close_price,
        })
    }

    async fn get_open_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        Ok(lock(&self.deals).values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn broker() -> PaperBroker {
        PaperBroker::new(dec("10000"), dec("10"), 0.0)
    }

    #[tokio::test]
    async fn fills_cross_the_synthetic_spread() {
        let broker = broker();
        broker.set_price("AAA", dec("100"));
        let snap = broker.get_market_snapshot("AAA").await.unwrap();
        assert_eq!(snap.ask, dec("100.1"));
        assert_eq!(snap.bid, dec("99.9"));

        let open = broker
            .create_position("AAA", OrderSide::Buy, dec("2"), None, None)
            .await
            .unwrap();
        assert_eq!(open.filled_price, dec("100.1"));

        let close = broker.close_position(&open.deal_reference).await.unwrap();
        assert_eq!(close.close_price, dec("99.9"));
        // round trip pays the full spread
        let balance = broker.get_account_balance().await.unwrap();
        assert_eq!(balance.balance, dec("9999.6"));
    }

    #[tokio::test]
    async fn short_positions_settle_inverted_pnl() {
        let broker = broker();
        broker.set_price("AAA", dec("100"));
        let open = broker
            .create_position("AAA", OrderSide::Sell, dec("1"), None, None)
            .await
            .unwrap();
        assert_eq!(open.filled_price, dec("99.9"));
        broker.set_price("AAA", dec("90"));
        let close = broker.close_position(&open.deal_reference).await.unwrap();
        assert_eq!(close.close_price, dec("90.09"));
        let balance = broker.get_account_balance().await.unwrap();
        assert_eq!(balance.balance, dec("10000") + (dec("99.9") - dec("90.09")));
    }

    #[tokio::test]
    async fn equity_marks_open_deals() {
        let broker = broker();
        broker.set_price("AAA", dec("100"));
        broker
            .create_position("AAA", OrderSide::Buy, dec("1"), None, None)
            .await
            .unwrap();
        broker.set_price("AAA", dec("110"));
        let balance = broker.get_account_balance().await.unwrap();
        assert_eq!(balance.balance, dec("10000"));
        assert_eq!(balance.equity, dec("10000") + (dec("110") - dec("100.1")));
    }

    #[tokio::test]
    async fn rejects_bad_orders() {
        let broker = broker();
        broker.set_price("AAA", dec("100"));
        assert!(matches!(
            broker
                .create_position("AAA", OrderSide::Buy, dec("0"), None, None)
                .await,
            Err(BrokerError::OrderRejected(_))
        ));
        assert!(matches!(
            broker
                .create_position("BBB", OrderSide::Buy, dec("1"), None, None)
                .await,
            Err(BrokerError::OrderRejected(_))
        ));
        assert!(matches!(
            broker.close_position("P-999999").await,
            Err(BrokerError::UnknownDeal(_))
        ));
    }

    #[tokio::test]
    async fn replay_tape_drives_marks_and_clock() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "{}",
            r#"{"ts": 1700000000, "prices": {"AAA": 100.0, "BBB": 50.0}}"#
        )
        .unwrap();
        writeln!(file, "{}", r#"not json at all"#).unwrap();
        writeln!(
            file,
            "{}",
            r#"{"ts": 1700000060, "prices": {"AAA": 101.0}}"#
        )
        .unwrap();
        file.flush().unwrap();

        let broker =
            PaperBroker::with_replay_file(file.path(), dec("10000"), dec("0")).unwrap();
        assert!(broker.is_replay());

        assert!(broker.tick());
        let snap = broker.get_market_snapshot("AAA").await.unwrap();
        assert_eq!(snap.mid(), dec("100"));
        assert_eq!(snap.ts, 1700000000);

        assert!(broker.tick());
        let snap = broker.get_market_snapshot("AAA").await.unwrap();
        assert_eq!(snap.mid(), dec("101"));
        assert_eq!(snap.ts, 1700000060);
        // BBB keeps its last mark
        let snap_b = broker.get_market_snapshot("BBB").await.unwrap();
        assert_eq!(snap_b.mid(), dec("50"));

        assert!(!broker.tick());
    }
}
