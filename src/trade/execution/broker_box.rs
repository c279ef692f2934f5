use async_trait::async_trait;
use lazy_static::lazy_static;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::env;
use std::path::Path;
use std::sync::Arc;

use crate::alert_notifier::notify_alert;
use crate::broker::{
    AccountBalance, Broker, BrokerError, BrokerPosition, ClosePositionResponse,
    CreatePositionResponse, MarketSnapshot, OrderSide,
};
use crate::ports::paper_broker::PaperBroker;

lazy_static! {
    static ref PAPER_STARTING_CASH: Decimal = {
        match env::var("PAPER_STARTING_CASH") {
            Ok(val) => val.parse::<Decimal>().unwrap_or(dec!(10_000)),
            Err(_) => dec!(10_000),
        }
    };
    static ref PAPER_HALF_SPREAD_BPS: Decimal = {
        match env::var("PAPER_HALF_SPREAD_BPS") {
            Ok(val) => val.parse::<Decimal>().unwrap_or(dec!(5)),
            Err(_) => dec!(5),
        }
    };
    static ref PAPER_SLIPPAGE_STD_BPS: f64 = {
        match env::var("PAPER_SLIPPAGE_STD_BPS") {
            Ok(val) => val.parse::<f64>().unwrap_or(0.0),
            Err(_) => 0.0,
        }
    };
}

/// Uniform wrapper around whichever brokerage backs the session. Every call
/// funnels through here so rate-limit pressure is reported in one place.
pub struct BrokerBox {
    pub inner: Arc<dyn Broker>,
    paper: Option<Arc<PaperBroker>>,
}

impl std::fmt::Debug for BrokerBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerBox").finish_non_exhaustive()
    }
}

impl BrokerBox {
    fn report_rate_limit(&self, operation: &str, detail: &str, err: &BrokerError) {
        let err_text = err.to_string();
        if matches!(err, BrokerError::RateLimited(_)) || err_text.contains("429") {
            let context = format!("{} ({})", operation, detail);
            notify_alert(&context, &err_text);
        }
    }

    pub fn create(broker_name: &str, replay_file: Option<&Path>) -> Result<Self, BrokerError> {
        match broker_name {
            "paper" => {
                let paper = Arc::new(PaperBroker::new(
                    *PAPER_STARTING_CASH,
                    *PAPER_HALF_SPREAD_BPS,
                    *PAPER_SLIPPAGE_STD_BPS,
                ));
                Ok(BrokerBox {
                    inner: paper.clone(),
                    paper: Some(paper),
                })
            }
            "replay" => {
                let path = replay_file.ok_or_else(|| {
                    BrokerError::Other("replay broker requires a replay file".to_string())
                })?;
                let paper = Arc::new(
                    PaperBroker::with_replay_file(path, *PAPER_STARTING_CASH, *PAPER_HALF_SPREAD_BPS)
                        .map_err(|e| BrokerError::Other(e.to_string()))?,
                );
                Ok(BrokerBox {
                    inner: paper.clone(),
                    paper: Some(paper),
                })
            }
            _ => Err(BrokerError::Other(format!(
                "unsupported broker '{}' (expected paper or replay)",
                broker_name
            ))),
        }
    }

    /// Concrete handle for tape driving and test price injection. None once a
    /// live transport sits behind the box.
    pub fn paper_handle(&self) -> Option<Arc<PaperBroker>> {
        self.paper.clone()
    }
}

#[async_trait]
impl Broker for BrokerBox {
    async fn start(&self) -> Result<(), BrokerError> {
        let result = self.inner.start().await;
        if let Err(ref err) = result {
            self.report_rate_limit("start", "broker", err);
        }
        result
    }

    async fn stop(&self) -> Result<(), BrokerError> {
        let result = self.inner.stop().await;
        if let Err(ref err) = result {
            self.report_rate_limit("stop", "broker", err);
        }
        result
    }

    async fn get_account_balance(&self) -> Result<AccountBalance, BrokerError> {
        let result = self.inner.get_account_balance().await;
        if let Err(ref err) = result {
            self.report_rate_limit("get_account_balance", "account", err);
        }
        result
    }

    async fn get_market_snapshot(&self, instrument: &str) -> Result<MarketSnapshot, BrokerError> {
        let result = self.inner.get_market_snapshot(instrument).await;
        if let Err(ref err) = result {
            self.report_rate_limit("get_market_snapshot", instrument, err);
        }
        result
    }

    async fn create_position(
        &self,
        instrument: &str,
        side: OrderSide,
        size: Decimal,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) -> Result<CreatePositionResponse, BrokerError> {
        let result = self
            .inner
            .create_position(instrument, side, size, stop_loss, take_profit)
            .await;
        if let Err(ref err) = result {
            self.report_rate_limit(
                "create_position",
                &format!("{} | side={} size={}", instrument, side.as_str(), size),
                err,
            );
        }
        result
    }

    async fn close_position(
        &self,
        deal_reference: &str,
    ) -> Result<ClosePositionResponse, BrokerError> {
        let result = self.inner.close_position(deal_reference).await;
        if let Err(ref err) = result {
            self.report_rate_limit(
                "close_position",
                &format!("deal={}", deal_reference),
                err,
            );
        }
        result
    }

    async fn get_open_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        let result = self.inner.get_open_positions().await;
        if let Err(ref err) = result {
            self.report_rate_limit("get_open_positions", "account", err);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_broker_name_is_rejected() {
        let err = BrokerBox::create("capital", None).unwrap_err();
        assert!(err.to_string().contains("unsupported broker"));
    }

    #[test]
    fn replay_without_file_is_rejected() {
        assert!(BrokerBox::create("replay", None).is_err());
    }

    #[tokio::test]
    async fn paper_box_delegates_calls() {
        let broker = BrokerBox::create("paper", None).unwrap();
        let paper = broker.paper_handle().unwrap();
        paper.set_price("AAA", Decimal::new(100, 0));
        let snapshot = broker.get_market_snapshot("AAA").await.unwrap();
        assert_eq!(snapshot.instrument, "AAA");
        assert!(snapshot.ask > snapshot.bid);
    }
}
