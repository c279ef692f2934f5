use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;
use std::future::Future;
use tokio::time::{sleep, Duration};

/// Per-leg order side as the brokerage understands it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AccountBalance {
    pub balance: Decimal,
    pub available: Decimal,
    pub equity: Decimal,
}

#[derive(Debug, Clone)]
pub struct MarketSnapshot {
    pub instrument: String,
    pub bid: Decimal,
    pub ask: Decimal,
    pub ts: i64,
}

impl MarketSnapshot {
    pub fn mid(&self) -> Decimal {
        (self.bid + self.ask) / Decimal::TWO
    }

    /// Price a taker order would cross at.
    pub fn side_price(&self, side: OrderSide) -> Decimal {
        match side {
            OrderSide::Buy => self.ask,
            OrderSide::Sell => self.bid,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreatePositionResponse {
    pub deal_reference: String,
    pub filled_price: Decimal,
    pub filled_size: Decimal,
}

#[derive(Debug, Clone)]
pub struct ClosePositionResponse {
    pub deal_reference: String,
    pub close_price: Decimal,
}

/// Broker-side view of an open deal, used for reconciliation after restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub deal_reference: String,
    pub instrument: String,
    pub side: OrderSide,
    pub size: Decimal,
    pub entry_price: Decimal,
}

#[derive(Debug)]
pub enum BrokerError {
    Unauthorized(String),
    RateLimited(String),
    OrderRejected(String),
    UnknownDeal(String),
    Timeout(String),
    Other(String),
}

impl BrokerError {
    /// Transient failures worth retrying for idempotent read calls.
    /// Order placement is never retried on these; a timed-out leg is treated
    /// as failed and takes the reconciliation path.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BrokerError::RateLimited(_) | BrokerError::Timeout(_))
    }
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerError::Unauthorized(msg) => write!(f, "unauthorized: {}", msg),
            BrokerError::RateLimited(msg) => write!(f, "rate limited: {}", msg),
            BrokerError::OrderRejected(msg) => write!(f, "order rejected: {}", msg),
            BrokerError::UnknownDeal(msg) => write!(f, "unknown deal: {}", msg),
            BrokerError::Timeout(msg) => write!(f, "timed out: {}", msg),
            BrokerError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl Error for BrokerError {}

/// Port to the brokerage collaborator. The engine only ever talks to this
/// trait; live transports and the in-repo paper broker both sit behind it.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn start(&self) -> Result<(), BrokerError>;

    async fn stop(&self) -> Result<(), BrokerError>;

    async fn get_account_balance(&self) -> Result<AccountBalance, BrokerError>;

    async fn get_market_snapshot(&self, instrument: &str) -> Result<MarketSnapshot, BrokerError>;

    async fn create_position(
        &self,
        instrument: &str,
        side: OrderSide,
        size: Decimal,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) -> Result<CreatePositionResponse, BrokerError>;

    async fn close_position(
        &self,
        deal_reference: &str,
    ) -> Result<ClosePositionResponse, BrokerError>;

    async fn get_open_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError>;
}

/// Retry wrapper for idempotent read calls with exponential backoff.
pub async fn retry_read<T, F, Fut>(
    op_name: &str,
    max_attempts: u32,
    mut call: F,
) -> Result<T, BrokerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BrokerError>>,
{
    let mut delay = Duration::from_millis(500);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                log::warn!(
                    "[BROKER] {} failed (attempt {}/{}): {}; retrying in {:?}",
                    op_name,
                    attempt,
                    max_attempts,
                    err,
                    delay
                );
                sleep(delay).await;
                delay = delay.saturating_mul(2);
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn order_side_opposite_flips() {
        assert_eq!(OrderSide::Buy.opposite(), OrderSide::Sell);
        assert_eq!(OrderSide::Sell.opposite(), OrderSide::Buy);
    }

    #[test]
    fn snapshot_side_price_crosses_the_book() {
        let snapshot = MarketSnapshot {
            instrument: "AAA".to_string(),
            bid: Decimal::new(999, 1),
            ask: Decimal::new(1001, 1),
            ts: 0,
        };
        assert_eq!(snapshot.side_price(OrderSide::Buy), Decimal::new(1001, 1));
        assert_eq!(snapshot.side_price(OrderSide::Sell), Decimal::new(999, 1));
        assert_eq!(snapshot.mid(), Decimal::new(100, 0));
    }

    #[tokio::test]
    async fn retry_read_retries_transient_errors() {
        let attempts = AtomicU32::new(0);
        let result = retry_read("balance", 3, || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(BrokerError::RateLimited("429".to_string()))
                } else {
                    Ok(42_u32)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_read_does_not_retry_rejections() {
        let attempts = AtomicU32::new(0);
        let result: Result<u32, _> = retry_read("balance", 3, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(BrokerError::OrderRejected("bad size".to_string())) }
        })
        .await;
        assert!(matches!(result, Err(BrokerError::OrderRejected(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
