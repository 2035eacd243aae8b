//! Bid lifecycle transitions.
//!
//! Only `PENDING` bids move, and each moves exactly once:
//!
//! ```text
//! PENDING -> ACCEPTED | REJECTED | COUNTERED | EXPIRED
//! ```
//!
//! A counter-offer closes the original bid and spawns a fresh pending bid
//! for the same bidder and topic carrying the farmer's amount.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

use crate::models::{Bid, BidStatus};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Illegal transition for bid {bid_id}: {from} -> {to}")]
pub struct IllegalTransitionError {
    pub bid_id: String,
    pub from: BidStatus,
    pub to: BidStatus,
}

/// A requested status change for one bid.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub to: BidStatus,
    pub at: DateTime<Utc>,
    /// Rejection reason, only meaningful for `Rejected`
    pub reason: Option<String>,
    /// Farmer's counter amount, only meaningful for `Countered`
    pub counter_amount: Option<Decimal>,
    /// Server id of the spawned counter bid, when known
    pub counter_bid_id: Option<String>,
}

impl Transition {
    pub fn accept(at: DateTime<Utc>) -> Self {
        Self::to(BidStatus::Accepted, at)
    }

    pub fn reject(at: DateTime<Utc>, reason: Option<String>) -> Self {
        Self {
            reason,
            ..Self::to(BidStatus::Rejected, at)
        }
    }

    pub fn counter(at: DateTime<Utc>, amount: Decimal, counter_bid_id: Option<String>) -> Self {
        Self {
            counter_amount: Some(amount),
            counter_bid_id,
            ..Self::to(BidStatus::Countered, at)
        }
    }

    pub fn expire(at: DateTime<Utc>) -> Self {
        Self::to(BidStatus::Expired, at)
    }

    pub fn to(status: BidStatus, at: DateTime<Utc>) -> Self {
        Self {
            to: status,
            at,
            reason: None,
            counter_amount: None,
            counter_bid_id: None,
        }
    }
}

/// Whether `from -> to` is an edge of the lifecycle graph.
pub fn can_transition(from: BidStatus, to: BidStatus) -> bool {
    from == BidStatus::Pending && to != BidStatus::Pending
}

/// Apply `transition` to `bid` in place.
///
/// Returns the spawned counter bid for a counter-offer that carries an
/// amount. On error the bid is left untouched.
pub fn apply_transition(
    bid: &mut Bid,
    transition: &Transition,
) -> Result<Option<Bid>, IllegalTransitionError> {
    if !can_transition(bid.status, transition.to) {
        return Err(IllegalTransitionError {
            bid_id: bid.id.clone(),
            from: bid.status,
            to: transition.to,
        });
    }

    bid.status = transition.to;

    match transition.to {
        BidStatus::Accepted => {
            bid.responded_at = Some(transition.at);
            Ok(None)
        }
        BidStatus::Rejected => {
            bid.responded_at = Some(transition.at);
            bid.rejection_reason = transition.reason.clone();
            Ok(None)
        }
        BidStatus::Countered => {
            bid.responded_at = Some(transition.at);
            Ok(transition.counter_amount.map(|amount| {
                spawn_counter_bid(bid, amount, transition.at, transition.counter_bid_id.clone())
            }))
        }
        // Expiry is not a response from the farmer
        BidStatus::Expired | BidStatus::Pending => Ok(None),
    }
}

/// Id used for a counter bid whose server id is not known yet.
pub fn provisional_counter_id(original_id: &str) -> String {
    format!("{}-counter", original_id)
}

/// Build the pending bid a counter-offer leaves behind.
///
/// The new bid keeps the original's bidder, quantity and validity window
/// length, starting from the counter time.
pub fn spawn_counter_bid(
    original: &Bid,
    amount: Decimal,
    at: DateTime<Utc>,
    id: Option<String>,
) -> Bid {
    let lifetime = original.expires_at - original.created_at;
    Bid {
        id: id.unwrap_or_else(|| provisional_counter_id(&original.id)),
        topic_id: original.topic_id.clone(),
        bidder_id: original.bidder_id.clone(),
        bidder_name: original.bidder_name.clone(),
        amount,
        quantity: original.quantity,
        message: None,
        status: BidStatus::Pending,
        created_at: at,
        expires_at: at + lifetime,
        responded_at: None,
        rejection_reason: None,
        parent_bid_id: Some(original.id.clone()),
        is_highest: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn pending_bid(id: &str, amount: Decimal) -> Bid {
        let created = Utc::now();
        Bid {
            id: id.to_string(),
            topic_id: "crop_1".to_string(),
            bidder_id: "buyer-1".to_string(),
            bidder_name: "Buyer One".to_string(),
            amount,
            quantity: dec!(20),
            message: Some("Can pick up Friday".to_string()),
            status: BidStatus::Pending,
            created_at: created,
            expires_at: created + Duration::hours(48),
            responded_at: None,
            rejection_reason: None,
            parent_bid_id: None,
            is_highest: false,
        }
    }

    #[test]
    fn test_only_pending_can_move() {
        let all = [
            BidStatus::Pending,
            BidStatus::Accepted,
            BidStatus::Rejected,
            BidStatus::Expired,
            BidStatus::Countered,
        ];
        for from in all {
            for to in all {
                let expected = from == BidStatus::Pending && to != BidStatus::Pending;
                assert_eq!(can_transition(from, to), expected, "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn test_accept_sets_response_time() {
        let mut bid = pending_bid("a", dec!(48));
        let at = Utc::now();

        let spawned = apply_transition(&mut bid, &Transition::accept(at)).unwrap();

        assert!(spawned.is_none());
        assert_eq!(bid.status, BidStatus::Accepted);
        assert_eq!(bid.responded_at, Some(at));
    }

    #[test]
    fn test_reject_records_reason() {
        let mut bid = pending_bid("a", dec!(48));
        let at = Utc::now();

        apply_transition(&mut bid, &Transition::reject(at, Some("Too low".to_string()))).unwrap();

        assert_eq!(bid.status, BidStatus::Rejected);
        assert_eq!(bid.rejection_reason.as_deref(), Some("Too low"));
        assert_eq!(bid.responded_at, Some(at));
    }

    #[test]
    fn test_counter_spawns_pending_bid() {
        let mut bid = pending_bid("b", dec!(52));
        let at = bid.created_at + Duration::hours(1);

        let spawned = apply_transition(&mut bid, &Transition::counter(at, dec!(55), None))
            .unwrap()
            .expect("counter bid");

        assert_eq!(bid.status, BidStatus::Countered);
        assert_eq!(bid.responded_at, Some(at));

        assert_eq!(spawned.id, "b-counter");
        assert_eq!(spawned.amount, dec!(55));
        assert_eq!(spawned.status, BidStatus::Pending);
        assert_eq!(spawned.topic_id, bid.topic_id);
        assert_eq!(spawned.bidder_id, bid.bidder_id);
        assert_eq!(spawned.parent_bid_id.as_deref(), Some("b"));
        assert_eq!(spawned.expires_at - spawned.created_at, Duration::hours(48));
        assert!(spawned.validate().is_ok());
    }

    #[test]
    fn test_counter_uses_server_id_when_given() {
        let mut bid = pending_bid("b", dec!(52));
        let spawned = apply_transition(
            &mut bid,
            &Transition::counter(Utc::now(), dec!(60), Some("srv-77".to_string())),
        )
        .unwrap()
        .unwrap();
        assert_eq!(spawned.id, "srv-77");
    }

    #[test]
    fn test_expire_leaves_response_time_empty() {
        let mut bid = pending_bid("a", dec!(48));
        let at = bid.expires_at;
        apply_transition(&mut bid, &Transition::expire(at)).unwrap();
        assert_eq!(bid.status, BidStatus::Expired);
        assert!(bid.responded_at.is_none());
    }

    #[test]
    fn test_illegal_transition_leaves_bid_unchanged() {
        let mut bid = pending_bid("a", dec!(48));
        apply_transition(&mut bid, &Transition::reject(Utc::now(), None)).unwrap();
        let before = bid.clone();

        let err = apply_transition(&mut bid, &Transition::accept(Utc::now())).unwrap_err();

        assert_eq!(err.from, BidStatus::Rejected);
        assert_eq!(err.to, BidStatus::Accepted);
        assert_eq!(bid, before);
    }
}
