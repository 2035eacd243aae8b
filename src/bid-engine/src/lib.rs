//! Real-time crop bid negotiation engine.
//!
//! Provides:
//! - Connection management for the bid broadcast WebSocket
//! - Room subscriptions per crop listing
//! - Per-topic bid ledgers with lifecycle rules and live aggregates
//! - Accept / reject / counter commands with optimistic updates
//! - Marketplace REST client and configuration loading from .env

pub mod actions;
pub mod api;
pub mod config;
pub mod connection;
pub mod credentials;
pub mod ledger;
pub mod models;
pub mod protocol;
pub mod rooms;
pub mod session;
pub mod state_machine;

pub use actions::{Command, CommandError, NegotiationActions};
pub use api::{ApiError, BidApi, CommandAck, HttpBidApi, TopicSnapshot};
pub use config::{Config, ConfigError};
pub use connection::{ConnectionError, ConnectionEvent, ConnectionManager, Connector, WsConnector};
pub use credentials::{CredentialProvider, StaticCredentials};
pub use ledger::{ApplyOutcome, BidEvent, BidEventKind, BidLedger, LedgerError};
pub use models::{
    ActionKind, Bid, BidStatus, ConnectionState, ConnectionStatus, TopicSummary,
};
pub use rooms::{RoomRegistry, SubscriptionError};
pub use session::MarketSession;
pub use state_machine::{IllegalTransitionError, Transition};
