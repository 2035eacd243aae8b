//! Wire format of the bid broadcast channel.
//!
//! Every frame is a JSON object `{"type": "<tag>", "payload": {...}}`.
//! Clients scope delivery with `room:join` / `room:leave`; the server pushes
//! `bid:new` and `bid:updated` for the rooms a client has joined.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::ledger::{BidEvent, BidEventKind};
use crate::models::{Bid, BidStatus};
use crate::state_machine::Transition;

/// Validity window assumed when a `bid:new` frame omits `expiresAt`.
pub const DEFAULT_BID_TTL_HOURS: i64 = 48;

/// Broadcast room for one crop listing.
pub fn room_name(topic_id: &str) -> String {
    format!("topic:{}:bids", topic_id)
}

/// Inverse of [`room_name`].
pub fn topic_from_room(room: &str) -> Option<&str> {
    room.strip_prefix("topic:")?
        .strip_suffix(":bids")
        .filter(|topic| !topic.is_empty())
}

/// Client -> server control frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum ClientMessage {
    #[serde(rename = "room:join")]
    JoinRoom { room: String },
    #[serde(rename = "room:leave")]
    LeaveRoom { room: String },
}

impl ClientMessage {
    pub fn join(topic_id: &str) -> Self {
        ClientMessage::JoinRoom {
            room: room_name(topic_id),
        }
    }

    pub fn leave(topic_id: &str) -> Self {
        ClientMessage::LeaveRoom {
            room: room_name(topic_id),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Payload of `bid:new`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewBidPayload {
    pub bid_id: String,
    pub topic_id: String,
    pub bidder_id: String,
    #[serde(default)]
    pub bidder_name: String,
    pub amount: Decimal,
    pub quantity: Decimal,
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub event_id: Option<String>,
}

impl NewBidPayload {
    pub fn into_event(self) -> BidEvent {
        let id = self
            .event_id
            .clone()
            .unwrap_or_else(|| format!("{}:new", self.bid_id));
        let expires_at = self
            .expires_at
            .unwrap_or(self.timestamp + Duration::hours(DEFAULT_BID_TTL_HOURS));

        let bid = Bid {
            id: self.bid_id,
            topic_id: self.topic_id.clone(),
            bidder_id: self.bidder_id,
            bidder_name: self.bidder_name,
            amount: self.amount,
            quantity: self.quantity,
            message: self.message,
            status: BidStatus::Pending,
            created_at: self.timestamp,
            expires_at,
            responded_at: None,
            rejection_reason: None,
            parent_bid_id: None,
            is_highest: false,
        };

        BidEvent {
            id,
            topic_id: self.topic_id,
            kind: BidEventKind::Created(bid),
        }
    }
}

/// Payload of `bid:updated` (status change of an existing bid).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BidUpdatedPayload {
    pub bid_id: String,
    pub topic_id: String,
    pub status: BidStatus,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
    pub counter_amount: Option<Decimal>,
    pub counter_bid_id: Option<String>,
    pub event_id: Option<String>,
}

impl BidUpdatedPayload {
    pub fn into_event(self) -> BidEvent {
        // A bid leaves PENDING once, so (bid, status) names the transition
        let id = self
            .event_id
            .clone()
            .unwrap_or_else(|| format!("{}:{}", self.bid_id, self.status));

        let transition = Transition {
            to: self.status,
            at: self.timestamp,
            reason: self.reason,
            counter_amount: self.counter_amount,
            counter_bid_id: self.counter_bid_id,
        };

        BidEvent {
            id,
            topic_id: self.topic_id,
            kind: BidEventKind::Transitioned {
                bid_id: self.bid_id,
                transition,
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoomPayload {
    pub room: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
    pub code: Option<i32>,
}

/// Server -> client frames.
#[derive(Debug, Clone)]
pub enum ServerMessage {
    BidNew(NewBidPayload),
    BidUpdated(BidUpdatedPayload),
    RoomJoined(String),
    RoomLeft(String),
    Error(ErrorPayload),
    Unknown(String),
}

impl ServerMessage {
    /// Convert a bid frame into a ledger event.
    pub fn into_bid_event(self) -> Option<BidEvent> {
        match self {
            ServerMessage::BidNew(payload) => Some(payload.into_event()),
            ServerMessage::BidUpdated(payload) => Some(payload.into_event()),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    tag: String,
    #[serde(default)]
    payload: serde_json::Value,
}

/// Parse a raw text frame. Anything unrecognised or malformed becomes `Unknown`.
pub fn parse_message(text: &str) -> ServerMessage {
    let envelope: Envelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(_) => return ServerMessage::Unknown(text.to_string()),
    };

    let parsed = match envelope.tag.as_str() {
        "bid:new" => serde_json::from_value(envelope.payload).map(ServerMessage::BidNew),
        "bid:updated" => serde_json::from_value(envelope.payload).map(ServerMessage::BidUpdated),
        "room:joined" => serde_json::from_value::<RoomPayload>(envelope.payload)
            .map(|p| ServerMessage::RoomJoined(p.room)),
        "room:left" => serde_json::from_value::<RoomPayload>(envelope.payload)
            .map(|p| ServerMessage::RoomLeft(p.room)),
        "error" => serde_json::from_value(envelope.payload).map(ServerMessage::Error),
        _ => return ServerMessage::Unknown(text.to_string()),
    };

    parsed.unwrap_or_else(|_| ServerMessage::Unknown(text.to_string()))
}
