//! Market session: the explicitly owned object a client holds while signed in.
//!
//! It owns the connection manager, the room registry, the open ledgers and
//! a single dispatcher task that consumes connection events in delivery
//! order. Nothing here is global; dropping the session after
//! [`MarketSession::shutdown`] discards all bid state.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::actions::{ActionSettings, CommandError, Ledgers, NegotiationActions};
use crate::api::{ApiError, BidApi, CommandAck, HttpBidApi};
use crate::connection::{
    ConnectionError, ConnectionEvent, ConnectionManager, ConnectionSettings, Connector, WsConnector,
};
use crate::credentials::CredentialProvider;
use crate::ledger::BidLedger;
use crate::models::{ActionKind, Bid, ConnectionStatus, TopicSummary};
use crate::protocol::{topic_from_room, ClientMessage, ServerMessage};
use crate::rooms::{JoinAction, LeaveAction, RoomRegistry, SubscriptionError};
use crate::Config;

/// Handles the dispatcher task works with.
#[derive(Clone)]
struct SessionShared {
    connection: Arc<ConnectionManager>,
    api: Arc<dyn BidApi>,
    rooms: Arc<Mutex<RoomRegistry>>,
    ledgers: Ledgers,
}

struct Dispatcher {
    stop: oneshot::Sender<()>,
    /// Hands the event receiver back so the session can be restarted
    handle: JoinHandle<mpsc::Receiver<ConnectionEvent>>,
}

pub struct MarketSession {
    shared: SessionShared,
    actions: NegotiationActions,
    events: Mutex<Option<mpsc::Receiver<ConnectionEvent>>>,
    dispatcher: Mutex<Option<Dispatcher>>,
}

impl MarketSession {
    /// Session over the production WebSocket and REST clients.
    pub fn from_config(
        config: &Config,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self, ApiError> {
        let api = Arc::new(HttpBidApi::new(config, credentials.clone())?);
        let connector = Arc::new(WsConnector::new(config));
        Ok(Self::new(config, credentials, api, connector))
    }

    pub fn new(
        config: &Config,
        credentials: Arc<dyn CredentialProvider>,
        api: Arc<dyn BidApi>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self::with_settings(
            ConnectionSettings::from_config(config),
            ActionSettings::from_config(config),
            credentials,
            api,
            connector,
        )
    }

    pub fn with_settings(
        connection_settings: ConnectionSettings,
        action_settings: ActionSettings,
        credentials: Arc<dyn CredentialProvider>,
        api: Arc<dyn BidApi>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let (connection, events) = ConnectionManager::new(connection_settings, credentials, connector);
        let ledgers: Ledgers = Arc::new(Mutex::new(HashMap::new()));
        let actions = NegotiationActions::new(api.clone(), ledgers.clone(), action_settings);

        Self {
            shared: SessionShared {
                connection: Arc::new(connection),
                api,
                rooms: Arc::new(Mutex::new(RoomRegistry::new())),
                ledgers,
            },
            actions,
            events: Mutex::new(Some(events)),
            dispatcher: Mutex::new(None),
        }
    }

    /// Start the dispatcher and connect.
    pub async fn start(&self) -> Result<(), ConnectionError> {
        {
            let mut dispatcher = self.dispatcher.lock().await;
            if dispatcher.is_none() {
                if let Some(events) = self.events.lock().await.take() {
                    let (stop_tx, stop_rx) = oneshot::channel();
                    let handle = tokio::spawn(dispatch(self.shared.clone(), events, stop_rx));
                    *dispatcher = Some(Dispatcher {
                        stop: stop_tx,
                        handle,
                    });
                }
            }
        }

        self.shared.connection.connect().await
    }

    /// Disconnect, stop the dispatcher and discard every topic.
    pub async fn shutdown(&self) {
        self.shared.connection.disconnect().await;

        if let Some(dispatcher) = self.dispatcher.lock().await.take() {
            let _ = dispatcher.stop.send(());
            match dispatcher.handle.await {
                Ok(events) => *self.events.lock().await = Some(events),
                Err(e) => warn!("Dispatcher ended abnormally: {}", e),
            }
        }

        *self.shared.rooms.lock().await = RoomRegistry::new();
        let mut ledgers = self.shared.ledgers.lock().await;
        for (_, mut ledger) in ledgers.drain() {
            ledger.close();
        }
        info!("Market session shut down");
    }

    /// Follow a crop listing: open its ledger, join its room, load its bids.
    ///
    /// Before the connection is up the join is queued and sent once connected.
    pub async fn join_topic(&self, topic_id: &str) -> Result<(), SubscriptionError> {
        let topic_id = topic_id.trim();
        if topic_id.is_empty() {
            return Err(SubscriptionError::EmptyTopic);
        }

        {
            let mut rooms = self.shared.rooms.lock().await;
            match rooms.join(topic_id) {
                JoinAction::AlreadyJoined => return Ok(()),
                JoinAction::Queued => {}
                JoinAction::Send => {
                    if let Err(e) = self.shared.connection.send(&ClientMessage::join(topic_id)).await {
                        warn!("[ROOMS] Join for {} not sent ({}), queued", topic_id, e);
                        rooms.requeue(topic_id);
                    }
                }
            }
            self.shared
                .ledgers
                .lock()
                .await
                .entry(topic_id.to_string())
                .or_insert_with(|| BidLedger::new(topic_id));
        }

        if let Err(e) = resync(&self.shared, topic_id).await {
            warn!("[ROOMS] Initial load of {} failed: {}", topic_id, e);
            if let Err(leave_err) = self.leave_topic(topic_id).await {
                debug!("[ROOMS] Cleanup of {} after failed load: {}", topic_id, leave_err);
            }
            return Err(SubscriptionError::Snapshot {
                topic: topic_id.to_string(),
                message: e.to_string(),
            });
        }

        info!("[ROOMS] Following {}", topic_id);
        Ok(())
    }

    /// Stop following a crop listing and discard its ledger.
    pub async fn leave_topic(&self, topic_id: &str) -> Result<(), SubscriptionError> {
        let action = {
            let mut rooms = self.shared.rooms.lock().await;
            let action = rooms.leave(topic_id);
            if action == LeaveAction::Send {
                if let Err(e) = self.shared.connection.send(&ClientMessage::leave(topic_id)).await {
                    // Membership dies with the link anyway
                    debug!("[ROOMS] Leave for {} not sent: {}", topic_id, e);
                }
            }
            action
        };

        if let Some(mut ledger) = self.shared.ledgers.lock().await.remove(topic_id) {
            ledger.close();
        }

        match action {
            LeaveAction::NotJoined => Err(SubscriptionError::NotJoined(topic_id.to_string())),
            _ => {
                info!("[ROOMS] Left {}", topic_id);
                Ok(())
            }
        }
    }

    pub async fn accept(&self, topic_id: &str, bid_id: &str) -> Result<CommandAck, CommandError> {
        self.actions.accept(topic_id, bid_id).await
    }

    pub async fn reject(
        &self,
        topic_id: &str,
        bid_id: &str,
        reason: Option<String>,
    ) -> Result<CommandAck, CommandError> {
        self.actions.reject(topic_id, bid_id, reason).await
    }

    pub async fn counter(
        &self,
        topic_id: &str,
        bid_id: &str,
        amount: Decimal,
    ) -> Result<CommandAck, CommandError> {
        self.actions.counter(topic_id, bid_id, amount).await
    }

    /// All bids of a topic, newest first.
    pub async fn bids(&self, topic_id: &str) -> Vec<Bid> {
        self.read(topic_id, |ledger| ledger.bids())
            .await
            .unwrap_or_default()
    }

    /// Pending bids of a topic, best first.
    pub async fn pending_bids(&self, topic_id: &str) -> Vec<Bid> {
        self.read(topic_id, |ledger| ledger.pending_bids())
            .await
            .unwrap_or_default()
    }

    pub async fn highest_bid(&self, topic_id: &str) -> Option<Bid> {
        self.read(topic_id, |ledger| ledger.highest_bid().cloned())
            .await
            .flatten()
    }

    pub async fn topic_summary(&self, topic_id: &str) -> Option<TopicSummary> {
        self.read(topic_id, |ledger| ledger.summary().clone()).await
    }

    /// Watch a topic's recomputed summaries. `None` when the topic is not open.
    pub async fn subscribe_summary(&self, topic_id: &str) -> Option<watch::Receiver<TopicSummary>> {
        self.shared
            .ledgers
            .lock()
            .await
            .get(topic_id)
            .map(|ledger| ledger.subscribe())
    }

    /// Action in flight for a bid, if any.
    pub async fn processing(&self, topic_id: &str, bid_id: &str) -> Option<ActionKind> {
        self.read(topic_id, |ledger| ledger.processing(bid_id))
            .await
            .flatten()
    }

    pub async fn topics(&self) -> Vec<String> {
        self.shared.rooms.lock().await.topics()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connection.is_connected()
    }

    pub fn is_connecting(&self) -> bool {
        self.shared.connection.is_connecting()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.shared.connection.status()
    }

    pub fn subscribe_connection(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.connection.subscribe()
    }

    /// Read a ledger after applying lazy expiry.
    async fn read<T>(&self, topic_id: &str, f: impl FnOnce(&BidLedger) -> T) -> Option<T> {
        let mut ledgers = self.shared.ledgers.lock().await;
        let ledger = ledgers.get_mut(topic_id)?;
        ledger.refresh(Utc::now());
        Some(f(ledger))
    }
}

/// Fetch a topic's snapshot and merge it into its ledger, if still open.
async fn resync(shared: &SessionShared, topic_id: &str) -> Result<usize, ApiError> {
    let snapshot = shared.api.fetch_topic(topic_id).await?;

    let mut ledgers = shared.ledgers.lock().await;
    match ledgers.get_mut(topic_id) {
        Some(ledger) => Ok(ledger.load_snapshot(snapshot.bids, snapshot.listed_price, Utc::now())),
        None => {
            debug!("[ROOMS] {} left during load, snapshot dropped", topic_id);
            Ok(0)
        }
    }
}

/// Consume connection events strictly in delivery order until stopped.
async fn dispatch(
    shared: SessionShared,
    mut events: mpsc::Receiver<ConnectionEvent>,
    mut stop: oneshot::Receiver<()>,
) -> mpsc::Receiver<ConnectionEvent> {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => handle_event(&shared, event).await,
                None => break,
            },
            _ = &mut stop => break,
        }
    }
    events
}

async fn handle_event(shared: &SessionShared, event: ConnectionEvent) {
    match event {
        ConnectionEvent::Connected => on_connected(shared).await,
        ConnectionEvent::Disconnected => {
            shared.rooms.lock().await.on_disconnected();
        }
        ConnectionEvent::Message(message) => on_message(shared, message).await,
    }
}

/// Join every tracked room once, then catch up on what was missed.
async fn on_connected(shared: &SessionShared) {
    let topics = {
        let mut rooms = shared.rooms.lock().await;
        let topics = rooms.on_connected();
        for topic in &topics {
            if let Err(e) = shared.connection.send(&ClientMessage::join(topic)).await {
                warn!("[ROOMS] Join for {} not sent: {}", topic, e);
                rooms.requeue(topic);
            }
        }
        topics
    };

    for topic in topics {
        match resync(shared, &topic).await {
            Ok(merged) => debug!("[ROOMS] {} resynced ({} records)", topic, merged),
            Err(e) => warn!("[ROOMS] Resync of {} failed: {}", topic, e),
        }
    }
}

async fn on_message(shared: &SessionShared, message: ServerMessage) {
    match message {
        ServerMessage::BidNew(_) | ServerMessage::BidUpdated(_) => {
            let Some(event) = message.into_bid_event() else {
                return;
            };
            let mut ledgers = shared.ledgers.lock().await;
            let Some(ledger) = ledgers.get_mut(&event.topic_id) else {
                debug!("[LEDGER] Event {} for untracked topic {}", event.id, event.topic_id);
                return;
            };
            let event_id = event.id.clone();
            if let Err(e) = ledger.apply_event(event, Utc::now()) {
                warn!("[LEDGER] Dropping event {}: {}", event_id, e);
            }
        }
        ServerMessage::RoomJoined(room) => {
            if let Some(topic) = topic_from_room(&room) {
                shared.rooms.lock().await.confirm_joined(topic);
            }
        }
        ServerMessage::RoomLeft(room) => {
            let Some(topic) = topic_from_room(&room) else {
                return;
            };
            {
                let mut rooms = shared.rooms.lock().await;
                if !rooms.confirm_left(topic) {
                    return;
                }
                if let Err(e) = shared.connection.send(&ClientMessage::join(topic)).await {
                    warn!("[ROOMS] Rejoin for {} not sent: {}", topic, e);
                    rooms.requeue(topic);
                    return;
                }
            }
            // Broadcasts may have been missed while out of the room
            if let Err(e) = resync(shared, topic).await {
                warn!("[ROOMS] Resync of {} failed: {}", topic, e);
            }
        }
        ServerMessage::Error(payload) => {
            warn!("Server error: {} (code {:?})", payload.message, payload.code);
        }
        ServerMessage::Unknown(text) => {
            debug!("Ignoring unrecognised frame: {}", text);
        }
    }
}
