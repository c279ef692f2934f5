use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::time::{timeout, Duration};

use crate::alert_notifier::notify_alert;
use crate::broker::{Broker, BrokerError, BrokerPosition, OrderSide};
use crate::config::RunMode;
use crate::engine::EngineError;

/// Execution lifecycle of one pair position. Terminal states are
/// LOGGED_ONLY, CLOSED and FAILED; everything else must move along the
/// edges in `allows`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecState {
    Idle,
    SignalQualified,
    AwaitingConfirmation,
    SubmittingLegs,
    LoggedOnly,
    PositionOpen,
    Reconciling,
    Monitoring,
    Closing,
    Closed,
    Failed,
}

impl ExecState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecState::Idle => "IDLE",
            ExecState::SignalQualified => "SIGNAL_QUALIFIED",
            ExecState::AwaitingConfirmation => "AWAITING_CONFIRMATION",
            ExecState::SubmittingLegs => "SUBMITTING_LEGS",
            ExecState::LoggedOnly => "LOGGED_ONLY",
            ExecState::PositionOpen => "POSITION_OPEN",
            ExecState::Reconciling => "RECONCILING",
            ExecState::Monitoring => "MONITORING",
            ExecState::Closing => "CLOSING",
            ExecState::Closed => "CLOSED",
            ExecState::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecState::LoggedOnly | ExecState::Closed | ExecState::Failed
        )
    }

    pub fn allows(self, next: ExecState) -> bool {
        use ExecState::*;
        matches!(
            (self, next),
            (Idle, SignalQualified)
                | (SignalQualified, LoggedOnly)
                | (SignalQualified, AwaitingConfirmation)
                | (SignalQualified, SubmittingLegs)
                | (AwaitingConfirmation, SubmittingLegs)
                | (AwaitingConfirmation, Idle)
                | (SubmittingLegs, PositionOpen)
                | (SubmittingLegs, Reconciling)
                | (SubmittingLegs, Failed)
                | (Reconciling, PositionOpen)
                | (Reconciling, Failed)
                | (PositionOpen, Monitoring)
                | (Monitoring, Closing)
                | (Closing, Closed)
                | (Closing, Failed)
        )
    }
}

/// Which way the spread is traded. A rich spread (z above entry) is sold:
/// short the first instrument, long the second. A cheap spread is bought.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpreadDirection {
    ShortSpread,
    LongSpread,
}

impl SpreadDirection {
    pub fn leg_sides(self) -> (OrderSide, OrderSide) {
        match self {
            SpreadDirection::ShortSpread => (OrderSide::Sell, OrderSide::Buy),
            SpreadDirection::LongSpread => (OrderSide::Buy, OrderSide::Sell),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SpreadDirection::ShortSpread => "SHORT_SPREAD",
            SpreadDirection::LongSpread => "LONG_SPREAD",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitTrigger {
    ExitSignal,
    StopLossHit,
    TakeProfitHit,
    ForcedLiquidation,
}

impl ExitTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitTrigger::ExitSignal => "exit_signal",
            ExitTrigger::StopLossHit => "stop_loss",
            ExitTrigger::TakeProfitHit => "take_profit",
            ExitTrigger::ForcedLiquidation => "forced_liquidation",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LegPlan {
    pub instrument: String,
    pub side: OrderSide,
    pub size: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenLeg {
    pub instrument: String,
    pub side: OrderSide,
    pub size: Decimal,
    pub entry_price: Decimal,
    pub deal_reference: String,
}

#[derive(Debug)]
pub enum EntryOutcome {
    /// Dry run: the decision is journaled, no broker contact.
    LoggedOnly,
    /// Operator declined or the confirmation prompt expired.
    Declined,
    Opened { legs: Vec<OpenLeg> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedLeg {
    pub leg: OpenLeg,
    pub close_price: Decimal,
}

/// Places and unwinds the two legs of a pair position. The second-leg
/// failure path always finishes with either both legs open or both legs
/// flat; anything else raises an operator alert before returning.
pub struct TradeLifecycle {
    broker: Arc<dyn Broker>,
    mode: RunMode,
    confirm_timeout: Duration,
}

impl TradeLifecycle {
    pub fn new(broker: Arc<dyn Broker>, mode: RunMode, confirm_timeout: Duration) -> Self {
        Self {
            broker,
            mode,
            confirm_timeout,
        }
    }

    pub async fn submit_entry(
        &self,
        pair_label: &str,
        direction: SpreadDirection,
        leg_a: &LegPlan,
        leg_b: &LegPlan,
    ) -> Result<EntryOutcome, EngineError> {
        log::info!(
            "[ORDER] {} qualified {}: {} {} {} / {} {} {}",
            pair_label,
            direction.as_str(),
            leg_a.side.as_str(),
            leg_a.size,
            leg_a.instrument,
            leg_b.side.as_str(),
            leg_b.size,
            leg_b.instrument
        );

        if !self.mode.submits_orders() {
            log::info!("[ORDER] {} dry run, decision journaled only", pair_label);
            return Ok(EntryOutcome::LoggedOnly);
        }

        if self.mode.requires_confirmation() && !self.confirm(pair_label, direction, leg_a, leg_b).await
        {
            log::warn!("[ORDER] {} entry not confirmed, discarding signal", pair_label);
            return Ok(EntryOutcome::Declined);
        }

        let first = match self
            .broker
            .create_position(
                &leg_a.instrument,
                leg_a.side,
                leg_a.size,
                leg_a.stop_loss,
                leg_a.take_profit,
            )
            .await
        {
            Ok(response) => response,
            Err(BrokerError::Timeout(msg)) => {
                return self.reconcile_first_leg_timeout(pair_label, leg_a, &msg).await;
            }
            Err(err) => {
                log::warn!("[ORDER] {} first leg rejected: {}", pair_label, err);
                return Err(EngineError::Broker(err));
            }
        };
        let open_a = OpenLeg {
            instrument: leg_a.instrument.clone(),
            side: leg_a.side,
            size: first.filled_size,
            entry_price: first.filled_price,
            deal_reference: first.deal_reference,
        };
        log::info!(
            "[ORDER] {} first leg filled {} {} @ {} ({})",
            pair_label,
            open_a.side.as_str(),
            open_a.instrument,
            open_a.entry_price,
            open_a.deal_reference
        );

        match self
            .broker
            .create_position(
                &leg_b.instrument,
                leg_b.side,
                leg_b.size,
                leg_b.stop_loss,
                leg_b.take_profit,
            )
            .await
        {
            Ok(second) => {
                let open_b = OpenLeg {
                    instrument: leg_b.instrument.clone(),
                    side: leg_b.side,
                    size: second.filled_size,
                    entry_price: second.filled_price,
                    deal_reference: second.deal_reference,
                };
                log::info!(
                    "[ORDER] {} second leg filled {} {} @ {} ({})",
                    pair_label,
                    open_b.side.as_str(),
                    open_b.instrument,
                    open_b.entry_price,
                    open_b.deal_reference
                );
                Ok(EntryOutcome::Opened {
                    legs: vec![open_a, open_b],
                })
            }
            Err(BrokerError::Timeout(msg)) => {
                log::error!(
                    "[SAFETY] {} second leg timed out, reconciling against broker state",
                    pair_label
                );
                if let Some(found) = self.find_broker_position(&leg_b.instrument, leg_b.side).await {
                    log::warn!(
                        "[SAFETY] {} second leg was filled broker-side ({}), keeping position",
                        pair_label,
                        found.deal_reference
                    );
                    let open_b = OpenLeg {
                        instrument: found.instrument,
                        side: found.side,
                        size: found.size,
                        entry_price: found.entry_price,
                        deal_reference: found.deal_reference,
                    };
                    return Ok(EntryOutcome::Opened {
                        legs: vec![open_a, open_b],
                    });
                }
                self.unwind_first_leg(pair_label, &open_a, &BrokerError::Timeout(msg))
                    .await
            }
            Err(err) => self.unwind_first_leg(pair_label, &open_a, &err).await,
        }
    }

    async fn reconcile_first_leg_timeout(
        &self,
        pair_label: &str,
        leg_a: &LegPlan,
        msg: &str,
    ) -> Result<EntryOutcome, EngineError> {
        log::error!(
            "[SAFETY] {} first leg timed out, reconciling against broker state",
            pair_label
        );
        if let Some(found) = self.find_broker_position(&leg_a.instrument, leg_a.side).await {
            let open_a = OpenLeg {
                instrument: found.instrument,
                side: found.side,
                size: found.size,
                entry_price: found.entry_price,
                deal_reference: found.deal_reference,
            };
            return self
                .unwind_first_leg(
                    pair_label,
                    &open_a,
                    &BrokerError::Timeout(format!("first leg filled after timeout: {}", msg)),
                )
                .await;
        }
        log::warn!("[SAFETY] {} first leg never filled, clean failure", pair_label);
        Err(EngineError::Broker(BrokerError::Timeout(msg.to_string())))
    }

    /// Second-leg failure compensation. Outcome is never a half-open pair
    /// reported as success.
    async fn unwind_first_leg(
        &self,
        pair_label: &str,
        open_a: &OpenLeg,
        cause: &BrokerError,
    ) -> Result<EntryOutcome, EngineError> {
        log::error!(
            "[SAFETY] {} second leg failed ({}), closing first leg {}",
            pair_label,
            cause,
            open_a.deal_reference
        );
        match self.broker.close_position(&open_a.deal_reference).await {
            Ok(close) => {
                let detail = format!(
                    "second leg failed ({}); first leg {} closed at {}",
                    cause, open_a.deal_reference, close.close_price
                );
                notify_alert(&format!("partial entry unwound on {}", pair_label), &detail);
                Err(EngineError::PartialFillInconsistency(detail))
            }
            Err(close_err) => {
                let detail = format!(
                    "second leg failed ({}); first leg {} STILL OPEN: close failed ({})",
                    cause, open_a.deal_reference, close_err
                );
                log::error!("[SAFETY] {} UNHEDGED EXPOSURE: {}", pair_label, detail);
                notify_alert(&format!("UNHEDGED exposure on {}", pair_label), &detail);
                Err(EngineError::PartialFillInconsistency(detail))
            }
        }
    }

    async fn find_broker_position(
        &self,
        instrument: &str,
        side: OrderSide,
    ) -> Option<BrokerPosition> {
        match self.broker.get_open_positions().await {
            Ok(positions) => positions
                .into_iter()
                .find(|p| p.instrument == instrument && p.side == side),
            Err(err) => {
                log::error!("[SAFETY] reconciliation query failed: {}", err);
                None
            }
        }
    }

    /// Close every remaining leg of a position. Legs that close (or turn out
    /// to be already gone) come back in the first list; legs the broker
    /// refused to close come back in the second with their error text, and
    /// an alert is raised for them.
    pub async fn close_legs(
        &self,
        pair_label: &str,
        legs: &[OpenLeg],
    ) -> (Vec<ClosedLeg>, Vec<(OpenLeg, String)>) {
        let mut closed = Vec::new();
        let mut stuck = Vec::new();
        for leg in legs {
            match self.broker.close_position(&leg.deal_reference).await {
                Ok(response) => {
                    log::info!(
                        "[ORDER] {} closed leg {} {} @ {}",
                        pair_label,
                        leg.side.as_str(),
                        leg.instrument,
                        response.close_price
                    );
                    closed.push(ClosedLeg {
                        leg: leg.clone(),
                        close_price: response.close_price,
                    });
                }
                Err(BrokerError::UnknownDeal(reference)) => {
                    log::warn!(
                        "[SAFETY] {} leg {} unknown to broker, treating as flat",
                        pair_label,
                        reference
                    );
                    closed.push(ClosedLeg {
                        leg: leg.clone(),
                        close_price: leg.entry_price,
                    });
                }
                Err(err) => {
                    log::error!(
                        "[SAFETY] {} failed to close leg {} ({}): {}",
                        pair_label,
                        leg.deal_reference,
                        leg.instrument,
                        err
                    );
                    stuck.push((leg.clone(), err.to_string()));
                }
            }
        }
        if !stuck.is_empty() {
            let detail = stuck
                .iter()
                .map(|(leg, err)| format!("{} ({}): {}", leg.deal_reference, leg.instrument, err))
                .collect::<Vec<_>>()
                .join("; ");
            notify_alert(&format!("close failure on {}", pair_label), &detail);
        }
        (closed, stuck)
    }

    async fn confirm(
        &self,
        pair_label: &str,
        direction: SpreadDirection,
        leg_a: &LegPlan,
        leg_b: &LegPlan,
    ) -> bool {
        if !stdin_is_tty() {
            log::warn!(
                "[ORDER] {} live entry needs an interactive terminal to confirm, declining",
                pair_label
            );
            return false;
        }
        log::warn!(
            "[ORDER] {} confirm {} within {}s: {} {} {} / {} {} {} [y/N] ",
            pair_label,
            direction.as_str(),
            self.confirm_timeout.as_secs(),
            leg_a.side.as_str(),
            leg_a.size,
            leg_a.instrument,
            leg_b.side.as_str(),
            leg_b.size,
            leg_b.instrument
        );
        let reader = tokio::task::spawn_blocking(|| {
            let mut line = String::new();
            let _ = std::io::stdin().read_line(&mut line);
            line
        });
        match timeout(self.confirm_timeout, reader).await {
            Ok(Ok(line)) => matches!(line.trim(), "y" | "Y" | "yes" | "YES"),
            Ok(Err(_)) => false,
            Err(_) => {
                log::warn!("[ORDER] {} confirmation timed out", pair_label);
                false
            }
        }
    }
}

fn stdin_is_tty() -> bool {
    unsafe { libc::isatty(libc::STDIN_FILENO) == 1 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{
        AccountBalance, ClosePositionResponse, CreatePositionResponse, MarketSnapshot,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[derive(Default)]
    struct DummyBroker {
        calls: Mutex<Vec<String>>,
        reject_instruments: Mutex<Vec<String>>,
        timeout_instruments: Mutex<Vec<String>>,
        broker_side_positions: Mutex<Vec<BrokerPosition>>,
        fail_closes: Mutex<Vec<String>>,
        seq: AtomicUsize,
    }

    impl DummyBroker {
        fn recorded(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl Broker for DummyBroker {
        async fn start(&self) -> Result<(), BrokerError> {
            Ok(())
        }

        async fn stop(&self) -> Result<(), BrokerError> {
            Ok(())
        }

        async fn get_account_balance(&self) -> Result<AccountBalance, BrokerError> {
            Ok(AccountBalance::default())
        }

        async fn get_market_snapshot(
            &self,
            instrument: &str,
        ) -> Result<MarketSnapshot, BrokerError> {
            Ok(MarketSnapshot {
                instrument: instrument.to_string(),
                bid: dec("99.9"),
                ask: dec("100.1"),
                ts: 0,
            })
        }

        async fn create_position(
            &self,
            instrument: &str,
            side: OrderSide,
            size: Decimal,
            _stop_loss: Option<Decimal>,
            _take_profit: Option<Decimal>,
        ) -> Result<CreatePositionResponse, BrokerError> {
            self.record(format!("create {} {}", instrument, side.as_str()));
            if self
                .reject_instruments
                .lock()
                .unwrap()
                .contains(&instrument.to_string())
            {
                return Err(BrokerError::OrderRejected(format!("no {}", instrument)));
            }
            if self
                .timeout_instruments
                .lock()
                .unwrap()
                .contains(&instrument.to_string())
            {
                return Err(BrokerError::Timeout(format!("{} timed out", instrument)));
            }
            let reference = format!("D-{}", self.seq.fetch_add(1, Ordering::SeqCst));
            Ok(CreatePositionResponse {
                deal_reference: reference,
                filled_price: dec("100"),
                filled_size: size,
            })
        }

        async fn close_position(
            &self,
            deal_reference: &str,
        ) -> Result<ClosePositionResponse, BrokerError> {
            self.record(format!("close {}", deal_reference));
            if self
                .fail_closes
                .lock()
                .unwrap()
                .contains(&deal_reference.to_string())
            {
                return Err(BrokerError::Other("venue unavailable".to_string()));
            }
            Ok(ClosePositionResponse {
                deal_reference: deal_reference.to_string(),
                close_price: dec("101"),
            })
        }

        async fn get_open_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
            self.record("get_open_positions".to_string());
            Ok(self.broker_side_positions.lock().unwrap().clone())
        }
    }

    fn leg(instrument: &str, side: OrderSide) -> LegPlan {
        LegPlan {
            instrument: instrument.to_string(),
            side,
            size: dec("1"),
            stop_loss: None,
            take_profit: None,
        }
    }

    fn lifecycle(broker: Arc<DummyBroker>, mode: RunMode) -> TradeLifecycle {
        TradeLifecycle::new(broker, mode, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn dry_run_never_contacts_the_broker() {
        let broker = Arc::new(DummyBroker::default());
        let lc = lifecycle(broker.clone(), RunMode::Dry);
        let outcome = lc
            .submit_entry(
                "AAA/BBB",
                SpreadDirection::ShortSpread,
                &leg("AAA", OrderSide::Sell),
                &leg("BBB", OrderSide::Buy),
            )
            .await
            .unwrap();
        assert!(matches!(outcome, EntryOutcome::LoggedOnly));
        assert!(broker.recorded().is_empty());
    }

    #[tokio::test]
    async fn both_legs_fill_in_order() {
        let broker = Arc::new(DummyBroker::default());
        let lc = lifecycle(broker.clone(), RunMode::LiveTest);
        let outcome = lc
            .submit_entry(
                "AAA/BBB",
                SpreadDirection::LongSpread,
                &leg("AAA", OrderSide::Buy),
                &leg("BBB", OrderSide::Sell),
            )
            .await
            .unwrap();
        let EntryOutcome::Opened { legs } = outcome else {
            panic!("expected opened");
        };
        assert_eq!(legs.len(), 2);
        assert_eq!(legs[0].instrument, "AAA");
        assert_eq!(legs[1].instrument, "BBB");
        assert_eq!(
            broker.recorded(),
            vec!["create AAA BUY".to_string(), "create BBB SELL".to_string()]
        );
    }

    #[tokio::test]
    async fn second_leg_rejection_unwinds_the_first() {
        let broker = Arc::new(DummyBroker::default());
        broker
            .reject_instruments
            .lock()
            .unwrap()
            .push("BBB".to_string());
        let lc = lifecycle(broker.clone(), RunMode::LiveTest);
        let err = lc
            .submit_entry(
                "AAA/BBB",
                SpreadDirection::ShortSpread,
                &leg("AAA", OrderSide::Sell),
                &leg("BBB", OrderSide::Buy),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::PartialFillInconsistency(_)));
        // first leg was closed before reporting failure
        assert_eq!(
            broker.recorded(),
            vec![
                "create AAA SELL".to_string(),
                "create BBB BUY".to_string(),
                "close D-0".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn failed_unwind_still_reports_inconsistency() {
        let broker = Arc::new(DummyBroker::default());
        broker
            .reject_instruments
            .lock()
            .unwrap()
            .push("BBB".to_string());
        broker.fail_closes.lock().unwrap().push("D-0".to_string());
        let lc = lifecycle(broker.clone(), RunMode::LiveTest);
        let err = lc
            .submit_entry(
                "AAA/BBB",
                SpreadDirection::ShortSpread,
                &leg("AAA", OrderSide::Sell),
                &leg("BBB", OrderSide::Buy),
            )
            .await
            .unwrap_err();
        let EngineError::PartialFillInconsistency(detail) = err else {
            panic!("expected partial fill inconsistency");
        };
        assert!(detail.contains("STILL OPEN"));
    }

    #[tokio::test]
    async fn first_leg_rejection_fails_clean() {
        let broker = Arc::new(DummyBroker::default());
        broker
            .reject_instruments
            .lock()
            .unwrap()
            .push("AAA".to_string());
        let lc = lifecycle(broker.clone(), RunMode::LiveTest);
        let err = lc
            .submit_entry(
                "AAA/BBB",
                SpreadDirection::ShortSpread,
                &leg("AAA", OrderSide::Sell),
                &leg("BBB", OrderSide::Buy),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Broker(_)));
        assert_eq!(broker.recorded(), vec!["create AAA SELL".to_string()]);
    }

    #[tokio::test]
    async fn second_leg_timeout_reconciles_to_open() {
        let broker = Arc::new(DummyBroker::default());
        broker
            .timeout_instruments
            .lock()
            .unwrap()
            .push("BBB".to_string());
        broker
            .broker_side_positions
            .lock()
            .unwrap()
            .push(BrokerPosition {
                deal_reference: "D-77".to_string(),
                instrument: "BBB".to_string(),
                side: OrderSide::Buy,
                size: dec("1"),
                entry_price: dec("100"),
            });
        let lc = lifecycle(broker.clone(), RunMode::LiveTest);
        let outcome = lc
            .submit_entry(
                "AAA/BBB",
                SpreadDirection::ShortSpread,
                &leg("AAA", OrderSide::Sell),
                &leg("BBB", OrderSide::Buy),
            )
            .await
            .unwrap();
        let EntryOutcome::Opened { legs } = outcome else {
            panic!("expected reconciled open");
        };
        assert_eq!(legs[1].deal_reference, "D-77");
    }

    #[tokio::test]
    async fn second_leg_timeout_without_fill_unwinds() {
        let broker = Arc::new(DummyBroker::default());
        broker
            .timeout_instruments
            .lock()
            .unwrap()
            .push("BBB".to_string());
        let lc = lifecycle(broker.clone(), RunMode::LiveTest);
        let err = lc
            .submit_entry(
                "AAA/BBB",
                SpreadDirection::ShortSpread,
                &leg("AAA", OrderSide::Sell),
                &leg("BBB", OrderSide::Buy),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::PartialFillInconsistency(_)));
        let calls = broker.recorded();
        assert!(calls.contains(&"get_open_positions".to_string()));
        assert!(calls.contains(&"close D-0".to_string()));
    }

    #[tokio::test]
    async fn close_reports_stuck_legs() {
        let broker = Arc::new(DummyBroker::default());
        broker.fail_closes.lock().unwrap().push("D-1".to_string());
        let lc = lifecycle(broker.clone(), RunMode::LiveTest);
        let legs = vec![
            OpenLeg {
                instrument: "AAA".to_string(),
                side: OrderSide::Sell,
                size: dec("1"),
                entry_price: dec("100"),
                deal_reference: "D-0".to_string(),
            },
            OpenLeg {
                instrument: "BBB".to_string(),
                side: OrderSide::Buy,
                size: dec("1"),
                entry_price: dec("50"),
                deal_reference: "D-1".to_string(),
            },
        ];
        let (closed, stuck) = lc.close_legs("AAA/BBB", &legs).await;
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].leg.deal_reference, "D-0");
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].0.deal_reference, "D-1");
    }

    #[test]
    fn transitions_follow_defined_edges() {
        use ExecState::*;
        assert!(Idle.allows(SignalQualified));
        assert!(SignalQualified.allows(LoggedOnly));
        assert!(SignalQualified.allows(AwaitingConfirmation));
        assert!(AwaitingConfirmation.allows(Idle));
        assert!(SubmittingLegs.allows(Reconciling));
        assert!(Reconciling.allows(PositionOpen));
        assert!(PositionOpen.allows(Monitoring));
        assert!(Monitoring.allows(Closing));
        assert!(Closing.allows(Closed));

        assert!(!Idle.allows(PositionOpen));
        assert!(!Idle.allows(Monitoring));
        assert!(!SubmittingLegs.allows(Monitoring));
        assert!(!Closed.allows(Monitoring));
        assert!(!Failed.allows(Idle));
        assert!(!LoggedOnly.allows(SubmittingLegs));
    }

    #[test]
    fn terminal_states_are_flagged() {
        assert!(ExecState::LoggedOnly.is_terminal());
        assert!(ExecState::Closed.is_terminal());
        assert!(ExecState::Failed.is_terminal());
        assert!(!ExecState::Monitoring.is_terminal());
    }

    #[test]
    fn direction_maps_to_leg_sides() {
        assert_eq!(
            SpreadDirection::ShortSpread.leg_sides(),
            (OrderSide::Sell, OrderSide::Buy)
        );
        assert_eq!(
            SpreadDirection::LongSpread.leg_sides(),
            (OrderSide::Buy, OrderSide::Sell)
        );
    }
}
