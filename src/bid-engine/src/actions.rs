//! Farmer commands: accept, reject and counter a pending bid.
//!
//! Each command marks the bid as processing (optionally applying the
//! expected outcome right away), calls the marketplace API under a timeout,
//! then either settles the ledger with the server's record or rolls the
//! local change back.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::api::{ApiError, BidApi, CommandAck};
use crate::ledger::{BidLedger, LedgerError};
use crate::models::{ActionKind, BidStatus};
use crate::state_machine::Transition;
use crate::Config;

/// Open ledgers keyed by topic id.
pub type Ledgers = Arc<Mutex<HashMap<String, BidLedger>>>;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Topic {0} is not open")]
    TopicNotOpen(String),

    #[error("Bid {0} not found")]
    UnknownBid(String),

    #[error("Bid {bid_id} is {status}, only pending bids can be answered")]
    NotPending { bid_id: String, status: BidStatus },

    #[error("Bid {0} is already being processed")]
    InFlight(String),

    #[error("Counter amount must be positive")]
    NonPositiveAmount,

    #[error("Counter amount {amount} must exceed the current bid of {current}")]
    CounterTooLow { amount: Decimal, current: Decimal },

    #[error("No response from the marketplace after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("Server record rejected: {0}")]
    InvalidRecord(String),
}

impl CommandError {
    fn from_ledger(bid_id: &str, err: LedgerError) -> Self {
        match err {
            LedgerError::UnknownBid(id) => CommandError::UnknownBid(id),
            LedgerError::ActionInFlight(id) => CommandError::InFlight(id),
            LedgerError::IllegalTransition(e) => CommandError::NotPending {
                bid_id: bid_id.to_string(),
                status: e.from,
            },
            other => CommandError::InvalidRecord(other.to_string()),
        }
    }
}

/// A farmer response to one bid.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Accept,
    Reject { reason: Option<String> },
    Counter { amount: Decimal },
}

impl Command {
    pub fn kind(&self) -> ActionKind {
        match self {
            Command::Accept => ActionKind::Accept,
            Command::Reject { .. } => ActionKind::Reject,
            Command::Counter { .. } => ActionKind::Counter,
        }
    }

    /// Expected outcome, applied before the server confirms.
    fn guess(&self, at: chrono::DateTime<Utc>) -> Transition {
        match self {
            Command::Accept => Transition::accept(at),
            Command::Reject { reason } => Transition::reject(at, reason.clone()),
            Command::Counter { amount } => Transition::counter(at, *amount, None),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ActionSettings {
    pub optimistic: bool,
    pub require_counter_above_bid: bool,
    pub command_timeout: Duration,
}

impl ActionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            optimistic: config.optimistic_updates,
            require_counter_above_bid: config.require_counter_above_bid,
            command_timeout: config.command_timeout(),
        }
    }
}

/// Command surface over the session's open ledgers.
pub struct NegotiationActions {
    api: Arc<dyn BidApi>,
    ledgers: Ledgers,
    settings: ActionSettings,
}

impl NegotiationActions {
    pub fn new(api: Arc<dyn BidApi>, ledgers: Ledgers, settings: ActionSettings) -> Self {
        Self {
            api,
            ledgers,
            settings,
        }
    }

    pub async fn accept(&self, topic_id: &str, bid_id: &str) -> Result<CommandAck, CommandError> {
        self.execute(topic_id, bid_id, Command::Accept).await
    }

    pub async fn reject(
        &self,
        topic_id: &str,
        bid_id: &str,
        reason: Option<String>,
    ) -> Result<CommandAck, CommandError> {
        let reason = reason.filter(|r| !r.trim().is_empty());
        self.execute(topic_id, bid_id, Command::Reject { reason })
            .await
    }

    pub async fn counter(
        &self,
        topic_id: &str,
        bid_id: &str,
        amount: Decimal,
    ) -> Result<CommandAck, CommandError> {
        self.execute(topic_id, bid_id, Command::Counter { amount })
            .await
    }

    /// Run one command end to end.
    pub async fn execute(
        &self,
        topic_id: &str,
        bid_id: &str,
        command: Command,
    ) -> Result<CommandAck, CommandError> {
        self.begin(topic_id, bid_id, &command).await?;

        info!("[ACTION] {} bid {} on {}", command.kind().as_str(), bid_id, topic_id);

        let outcome = match timeout(self.settings.command_timeout, self.send(bid_id, &command)).await {
            Ok(Ok(ack)) => Ok(ack),
            Ok(Err(e)) => Err(CommandError::Api(e)),
            Err(_) => Err(CommandError::Timeout(self.settings.command_timeout)),
        };

        self.settle(topic_id, bid_id, &command, outcome).await
    }

    async fn begin(&self, topic_id: &str, bid_id: &str, command: &Command) -> Result<(), CommandError> {
        let now = Utc::now();
        let mut ledgers = self.ledgers.lock().await;
        let ledger = ledgers
            .get_mut(topic_id)
            .ok_or_else(|| CommandError::TopicNotOpen(topic_id.to_string()))?;

        if let Command::Counter { amount } = command {
            if *amount <= Decimal::ZERO {
                return Err(CommandError::NonPositiveAmount);
            }
            if self.settings.require_counter_above_bid {
                let current = ledger
                    .get(bid_id)
                    .map(|bid| bid.amount)
                    .ok_or_else(|| CommandError::UnknownBid(bid_id.to_string()))?;
                if *amount <= current {
                    return Err(CommandError::CounterTooLow {
                        amount: *amount,
                        current,
                    });
                }
            }
        }

        let guess = self.settings.optimistic.then(|| command.guess(now));
        ledger
            .begin_action(bid_id, command.kind(), guess, now)
            .map_err(|e| CommandError::from_ledger(bid_id, e))
    }

    async fn send(&self, bid_id: &str, command: &Command) -> Result<CommandAck, ApiError> {
        match command {
            Command::Accept => self.api.accept(bid_id).await,
            Command::Reject { reason } => self.api.reject(bid_id, reason.clone()).await,
            Command::Counter { amount } => self.api.counter(bid_id, *amount).await,
        }
    }

    async fn settle(
        &self,
        topic_id: &str,
        bid_id: &str,
        command: &Command,
        outcome: Result<CommandAck, CommandError>,
    ) -> Result<CommandAck, CommandError> {
        let mut ledgers = self.ledgers.lock().await;
        let Some(ledger) = ledgers.get_mut(topic_id) else {
            info!(
                "[ACTION] {} left before {} on bid {} returned, discarding result",
                topic_id,
                command.kind().as_str(),
                bid_id
            );
            return outcome;
        };

        match outcome {
            Ok(ack) => {
                if let Err(e) = ledger.complete_action(bid_id, ack.bid.clone(), ack.counter_bid.clone()) {
                    warn!("[ACTION] Discarding server record for bid {}: {}", bid_id, e);
                    ledger.rollback_action(bid_id);
                    return Err(CommandError::InvalidRecord(e.to_string()));
                }
                info!("[ACTION] Bid {} is now {}", bid_id, ack.bid.status);
                Ok(ack)
            }
            Err(e) => {
                ledger.rollback_action(bid_id);
                warn!(
                    "[ACTION] {} on bid {} failed, rolled back: {}",
                    command.kind().as_str(),
                    bid_id,
                    e
                );
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{MockBidApi, TopicSnapshot};
    use crate::models::Bid;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use rust_decimal_macros::dec;

    fn pending_bid(id: &str, amount: Decimal) -> Bid {
        let created = Utc::now() - ChronoDuration::minutes(5);
        Bid {
            id: id.to_string(),
            topic_id: "crop_1".to_string(),
            bidder_id: format!("buyer-{}", id),
            bidder_name: "Buyer".to_string(),
            amount,
            quantity: dec!(40),
            message: None,
            status: BidStatus::Pending,
            created_at: created,
            expires_at: created + ChronoDuration::hours(48),
            responded_at: None,
            rejection_reason: None,
            parent_bid_id: None,
            is_highest: false,
        }
    }

    fn settled(bid: &Bid, status: BidStatus) -> Bid {
        let mut record = bid.clone();
        record.status = status;
        record.responded_at = Some(Utc::now());
        record
    }

    async fn ledgers_with(bids: Vec<Bid>) -> Ledgers {
        let mut ledger = BidLedger::new("crop_1");
        ledger.load_snapshot(bids, None, Utc::now());
        let ledgers: Ledgers = Arc::new(Mutex::new(HashMap::new()));
        ledgers.lock().await.insert("crop_1".to_string(), ledger);
        ledgers
    }

    fn settings() -> ActionSettings {
        ActionSettings {
            optimistic: true,
            require_counter_above_bid: false,
            command_timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn test_accept_applies_server_record() {
        let b1 = pending_bid("b-1", dec!(48));
        let b2 = pending_bid("b-2", dec!(52));
        let ledgers = ledgers_with(vec![b1.clone(), b2.clone()]).await;

        let record = settled(&b2, BidStatus::Accepted);
        let mut api = MockBidApi::new();
        api.expect_accept()
            .withf(|id| id == "b-2")
            .times(1)
            .returning(move |_| {
                Ok(CommandAck {
                    bid: record.clone(),
                    counter_bid: None,
                })
            });

        let actions = NegotiationActions::new(Arc::new(api), ledgers.clone(), settings());
        let ack = actions.accept("crop_1", "b-2").await.unwrap();
        assert_eq!(ack.bid.status, BidStatus::Accepted);

        let guard = ledgers.lock().await;
        let ledger = guard.get("crop_1").unwrap();
        assert_eq!(ledger.summary().highest_pending_amount, Some(dec!(48)));
        assert_eq!(ledger.summary().pending_bids, 1);
        assert_eq!(ledger.highest_bid().unwrap().id, "b-1");
        assert!(ledger.processing("b-2").is_none());
    }

    #[tokio::test]
    async fn test_failed_command_rolls_back() {
        let b1 = pending_bid("b-1", dec!(48));
        let ledgers = ledgers_with(vec![b1]).await;

        let mut api = MockBidApi::new();
        api.expect_reject().times(1).returning(|_, _| {
            Err(ApiError::Rejected {
                status: 409,
                message: "Bid is not pending".to_string(),
            })
        });

        let actions = NegotiationActions::new(Arc::new(api), ledgers.clone(), settings());
        let err = actions
            .reject("crop_1", "b-1", Some("too low".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Api(ApiError::Rejected { status: 409, .. })));

        let guard = ledgers.lock().await;
        let ledger = guard.get("crop_1").unwrap();
        let bid = ledger.get("b-1").unwrap();
        assert_eq!(bid.status, BidStatus::Pending);
        assert!(bid.rejection_reason.is_none());
        assert!(ledger.processing("b-1").is_none());
        assert_eq!(ledger.highest_bid().unwrap().id, "b-1");
    }

    #[tokio::test]
    async fn test_counter_validation() {
        let b1 = pending_bid("b-1", dec!(48));
        let ledgers = ledgers_with(vec![b1]).await;

        let mut api = MockBidApi::new();
        api.expect_counter().times(0);
        let strict = ActionSettings {
            require_counter_above_bid: true,
            ..settings()
        };
        let actions = NegotiationActions::new(Arc::new(api), ledgers.clone(), strict);

        assert!(matches!(
            actions.counter("crop_1", "b-1", dec!(0)).await,
            Err(CommandError::NonPositiveAmount)
        ));
        assert!(matches!(
            actions.counter("crop_1", "b-1", dec!(45)).await,
            Err(CommandError::CounterTooLow { .. })
        ));

        let guard = ledgers.lock().await;
        assert!(guard.get("crop_1").unwrap().processing("b-1").is_none());
    }

    #[tokio::test]
    async fn test_counter_spawns_server_bid() {
        let b1 = pending_bid("b-1", dec!(48));
        let ledgers = ledgers_with(vec![b1.clone()]).await;

        let record = settled(&b1, BidStatus::Countered);
        let mut spawned = pending_bid("b-9", dec!(55));
        spawned.parent_bid_id = Some("b-1".to_string());
        spawned.created_at = Utc::now();
        spawned.expires_at = spawned.created_at + ChronoDuration::hours(48);

        let mut api = MockBidApi::new();
        api.expect_counter()
            .withf(|id, amount| id == "b-1" && *amount == dec!(55))
            .returning(move |_, _| {
                Ok(CommandAck {
                    bid: record.clone(),
                    counter_bid: Some(spawned.clone()),
                })
            });

        let actions = NegotiationActions::new(Arc::new(api), ledgers.clone(), settings());
        actions.counter("crop_1", "b-1", dec!(55)).await.unwrap();

        let guard = ledgers.lock().await;
        let ledger = guard.get("crop_1").unwrap();
        assert_eq!(ledger.get("b-1").unwrap().status, BidStatus::Countered);
        assert!(!ledger.contains("b-1-counter"));
        assert_eq!(ledger.highest_bid().unwrap().id, "b-9");
        assert_eq!(ledger.summary().pending_bids, 1);
    }

    #[tokio::test]
    async fn test_only_pending_bids_and_open_topics() {
        let mut accepted = pending_bid("b-1", dec!(48));
        accepted.status = BidStatus::Accepted;
        accepted.responded_at = Some(Utc::now());
        let ledgers = ledgers_with(vec![accepted]).await;

        let mut api = MockBidApi::new();
        api.expect_accept().times(0);
        let actions = NegotiationActions::new(Arc::new(api), ledgers, settings());

        assert!(matches!(
            actions.accept("crop_1", "b-1").await,
            Err(CommandError::NotPending { status: BidStatus::Accepted, .. })
        ));
        assert!(matches!(
            actions.accept("crop_1", "b-404").await,
            Err(CommandError::UnknownBid(_))
        ));
        assert!(matches!(
            actions.accept("crop_2", "b-1").await,
            Err(CommandError::TopicNotOpen(_))
        ));
    }

    /// Never answers within the command timeout.
    struct SlowApi;

    #[async_trait]
    impl BidApi for SlowApi {
        async fn fetch_topic(&self, _topic_id: &str) -> Result<TopicSnapshot, ApiError> {
            Ok(TopicSnapshot::default())
        }

        async fn accept(&self, _bid_id: &str) -> Result<CommandAck, ApiError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Err(ApiError::ApiError("unreachable".to_string()))
        }

        async fn reject(&self, _bid_id: &str, _reason: Option<String>) -> Result<CommandAck, ApiError> {
            Err(ApiError::ApiError("unused".to_string()))
        }

        async fn counter(&self, _bid_id: &str, _amount: Decimal) -> Result<CommandAck, ApiError> {
            Err(ApiError::ApiError("unused".to_string()))
        }
    }

    #[tokio::test]
    async fn test_timeout_rolls_back_and_second_action_blocked_meanwhile() {
        let b1 = pending_bid("b-1", dec!(48));
        let ledgers = ledgers_with(vec![b1]).await;
        let actions = Arc::new(NegotiationActions::new(
            Arc::new(SlowApi),
            ledgers.clone(),
            ActionSettings {
                command_timeout: Duration::from_millis(100),
                ..settings()
            },
        ));

        let first = {
            let actions = actions.clone();
            tokio::spawn(async move { actions.accept("crop_1", "b-1").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        {
            let guard = ledgers.lock().await;
            let ledger = guard.get("crop_1").unwrap();
            assert_eq!(ledger.processing("b-1"), Some(ActionKind::Accept));
            // Optimistic guess is visible while waiting
            assert_eq!(ledger.get("b-1").unwrap().status, BidStatus::Accepted);
        }
        assert!(matches!(
            actions.accept("crop_1", "b-1").await,
            Err(CommandError::InFlight(_))
        ));

        let err = first.await.unwrap().unwrap_err();
        assert!(matches!(err, CommandError::Timeout(_)));

        let guard = ledgers.lock().await;
        let ledger = guard.get("crop_1").unwrap();
        assert_eq!(ledger.get("b-1").unwrap().status, BidStatus::Pending);
        assert!(ledger.processing("b-1").is_none());
    }

    #[tokio::test]
    async fn test_result_after_leave_is_discarded() {
        let b1 = pending_bid("b-1", dec!(48));
        let ledgers = ledgers_with(vec![b1.clone()]).await;

        let record = settled(&b1, BidStatus::Accepted);
        let leave_handle = ledgers.clone();
        let mut api = MockBidApi::new();
        api.expect_accept().returning(move |_| {
            // Topic is left while the request is outstanding
            if let Ok(mut guard) = leave_handle.try_lock() {
                guard.remove("crop_1");
            }
            Ok(CommandAck {
                bid: record.clone(),
                counter_bid: None,
            })
        });

        let actions = NegotiationActions::new(Arc::new(api), ledgers.clone(), settings());
        let ack = actions.accept("crop_1", "b-1").await.unwrap();

        assert_eq!(ack.bid.status, BidStatus::Accepted);
        assert!(ledgers.lock().await.get("crop_1").is_none());
    }
}
