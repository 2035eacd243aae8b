//! Shared data models for bids, topic aggregates and connection status.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Bid lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BidStatus {
    Pending,
    Accepted,
    Rejected,
    Expired,
    Countered,
}

impl BidStatus {
    /// A bid in a terminal status never changes again.
    ///
    /// `Countered` counts as terminal for the original bid; the counter-offer
    /// lives on as a separate pending bid.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, BidStatus::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BidStatus::Pending => "PENDING",
            BidStatus::Accepted => "ACCEPTED",
            BidStatus::Rejected => "REJECTED",
            BidStatus::Expired => "EXPIRED",
            BidStatus::Countered => "COUNTERED",
        }
    }
}

impl std::fmt::Display for BidStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BidValidationError {
    #[error("Bid {0} has a non-positive amount")]
    NonPositiveAmount(String),

    #[error("Bid {0} has a non-positive quantity")]
    NonPositiveQuantity(String),

    #[error("Bid {0} expires before it was created")]
    ExpiresBeforeCreation(String),
}

/// A buyer's offer against one crop listing.
///
/// Records are only ever changed through status transitions; the ledger
/// owns the derived `is_highest` flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bid {
    pub id: String,
    /// Crop listing this bid targets
    pub topic_id: String,
    pub bidder_id: String,
    #[serde(default)]
    pub bidder_name: String,
    pub amount: Decimal,
    pub quantity: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub status: BidStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responded_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
    /// Set on bids spawned by a counter-offer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_bid_id: Option<String>,
    #[serde(default, skip_deserializing)]
    pub is_highest: bool,
}

impl Bid {
    /// Check the record invariants: positive amount and quantity, expiry after creation.
    pub fn validate(&self) -> Result<(), BidValidationError> {
        if self.amount <= Decimal::ZERO {
            return Err(BidValidationError::NonPositiveAmount(self.id.clone()));
        }
        if self.quantity <= Decimal::ZERO {
            return Err(BidValidationError::NonPositiveQuantity(self.id.clone()));
        }
        if self.expires_at <= self.created_at {
            return Err(BidValidationError::ExpiresBeforeCreation(self.id.clone()));
        }
        Ok(())
    }

    pub fn is_pending(&self) -> bool {
        self.status == BidStatus::Pending
    }

    /// Pending bid whose expiry time has passed.
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.is_pending() && now >= self.expires_at
    }

    /// Total value of the offer (amount per unit times quantity).
    pub fn total_value(&self) -> Decimal {
        self.amount * self.quantity
    }
}

/// Farmer response to a pending bid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Accept,
    Reject,
    Counter,
}

impl ActionKind {
    /// Status the bid ends in when the server confirms the action.
    pub fn target_status(&self) -> BidStatus {
        match self {
            ActionKind::Accept => BidStatus::Accepted,
            ActionKind::Reject => BidStatus::Rejected,
            ActionKind::Counter => BidStatus::Countered,
        }
    }

    /// Path segment of the command endpoint.
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Accept => "accept",
            ActionKind::Reject => "reject",
            ActionKind::Counter => "counter",
        }
    }
}

/// Aggregate view over all bids of one topic.
///
/// Always recomputed from the full bid set, never patched incrementally.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicSummary {
    pub topic_id: String,
    pub total_bids: usize,
    pub pending_bids: usize,
    pub highest_pending_amount: Option<Decimal>,
    pub highest_bid_id: Option<String>,
    pub average_pending_amount: Option<Decimal>,
    /// Farmer's listed price for reference
    pub listed_price: Option<Decimal>,
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Connection state plus the details the UI shows next to it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub last_error: Option<String>,
    /// Current reconnect attempt, 0 when not retrying
    pub attempt: u32,
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn is_connecting(&self) -> bool {
        self.state == ConnectionState::Connecting
    }

    /// Reconnecting after a drop or failed attempt (non-blocking indicator).
    pub fn is_reconnecting(&self) -> bool {
        self.is_connecting() && self.attempt > 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn sample_bid() -> Bid {
        let now = Utc::now();
        Bid {
            id: "bid-1".to_string(),
            topic_id: "crop_1".to_string(),
            bidder_id: "buyer-7".to_string(),
            bidder_name: "Asha Traders".to_string(),
            amount: dec!(48.50),
            quantity: dec!(100),
            message: None,
            status: BidStatus::Pending,
            created_at: now,
            expires_at: now + Duration::hours(24),
            responded_at: None,
            rejection_reason: None,
            parent_bid_id: None,
            is_highest: false,
        }
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!BidStatus::Pending.is_terminal());
        assert!(BidStatus::Accepted.is_terminal());
        assert!(BidStatus::Rejected.is_terminal());
        assert!(BidStatus::Expired.is_terminal());
        assert!(BidStatus::Countered.is_terminal());
    }

    #[test]
    fn test_validate_accepts_well_formed_bid() {
        assert!(sample_bid().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_amount() {
        let mut bid = sample_bid();
        bid.amount = dec!(0);
        assert_eq!(
            bid.validate(),
            Err(BidValidationError::NonPositiveAmount("bid-1".to_string()))
        );
    }

    #[test]
    fn test_validate_rejects_zero_quantity() {
        let mut bid = sample_bid();
        bid.quantity = dec!(0);
        assert!(matches!(
            bid.validate(),
            Err(BidValidationError::NonPositiveQuantity(_))
        ));
    }

    #[test]
    fn test_validate_rejects_expiry_before_creation() {
        let mut bid = sample_bid();
        bid.expires_at = bid.created_at;
        assert!(matches!(
            bid.validate(),
            Err(BidValidationError::ExpiresBeforeCreation(_))
        ));
    }

    #[test]
    fn test_bid_deserializes_from_camel_case_record() {
        let json = r#"{
            "id": "b-9",
            "topicId": "crop_9",
            "bidderId": "u-1",
            "bidderName": "Ravi",
            "amount": "52.00",
            "quantity": "10",
            "status": "PENDING",
            "createdAt": "2026-01-01T10:00:00Z",
            "expiresAt": "2026-01-02T10:00:00Z",
            "isHighest": true
        }"#;

        let bid: Bid = serde_json::from_str(json).unwrap();
        assert_eq!(bid.topic_id, "crop_9");
        assert_eq!(bid.amount, dec!(52.00));
        assert_eq!(bid.status, BidStatus::Pending);
        // Derived flag is owned locally, never taken from the wire
        assert!(!bid.is_highest);
    }

    #[test]
    fn test_overdue_only_for_pending() {
        let mut bid = sample_bid();
        let later = bid.expires_at + Duration::seconds(1);
        assert!(bid.is_overdue(later));

        bid.status = BidStatus::Accepted;
        assert!(!bid.is_overdue(later));
    }

    #[test]
    fn test_reconnecting_indicator() {
        let status = ConnectionStatus {
            state: ConnectionState::Connecting,
            last_error: Some("refused".to_string()),
            attempt: 2,
        };
        assert!(status.is_reconnecting());
        assert!(!ConnectionStatus::default().is_reconnecting());
    }
}
