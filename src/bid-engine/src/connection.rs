//! Connection manager for the bid broadcast WebSocket.
//!
//! One supervisor task per connection owns the transport: it connects with
//! exponential backoff, forwards every received frame as a typed
//! [`ConnectionEvent`] on a single channel, and reconnects when the link
//! drops. State changes are published on a watch channel so callers can
//! show a "reconnecting" indicator without touching bid data.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::credentials::CredentialProvider;
use crate::models::{ConnectionState, ConnectionStatus};
use crate::protocol::{parse_message, ClientMessage, ServerMessage};
use crate::Config;

/// Capacity of the delivered-event channel.
const EVENT_BUFFER: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("No session credential available")]
    MissingCredential,

    #[error("Connection timeout")]
    Timeout,

    #[error("WebSocket connection failed: {0}")]
    Transport(String),

    #[error("Gave up after {attempts} connection attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },

    #[error("Not connected")]
    NotConnected,

    #[error("Connection closed")]
    ChannelClosed,
}

/// Everything the supervisor delivers, in arrival order.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
    Message(ServerMessage),
}

/// Channel pair over one established transport connection.
pub struct TransportLink {
    /// Text frames to send
    pub outbound: mpsc::Sender<String>,
    /// Received text frames; an error or end of stream means the link dropped
    pub inbound: mpsc::Receiver<Result<String, ConnectionError>>,
}

/// Opens transport connections.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str, token: &str) -> Result<TransportLink, ConnectionError>;
}

/// Retry and timeout settings of the connection manager.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub url: String,
    pub max_attempts: u32,
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    pub connect_timeout: Duration,
}

impl ConnectionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            url: config.ws_url.clone(),
            max_attempts: config.max_reconnect_attempts.max(1),
            reconnect_delay: config.reconnect_delay(),
            max_reconnect_delay: config.max_reconnect_delay(),
            connect_timeout: config.connect_timeout(),
        }
    }
}

/// tokio-tungstenite transport with ping keepalive and idle detection.
pub struct WsConnector {
    ping_interval: Duration,
    idle_timeout: Duration,
}

impl WsConnector {
    pub fn new(config: &Config) -> Self {
        Self {
            ping_interval: config.ping_interval(),
            idle_timeout: config.idle_timeout(),
        }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str, token: &str) -> Result<TransportLink, ConnectionError> {
        info!("Connecting to bid WebSocket at {}", url);

        let mut request = url
            .into_client_request()
            .map_err(|e| ConnectionError::Transport(e.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|e| ConnectionError::Transport(e.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (ws_stream, response) = connect_async(request)
            .await
            .map_err(|e| ConnectionError::Transport(e.to_string()))?;

        info!(
            "Connected to bid WebSocket (status: {})",
            response.status()
        );

        let (out_tx, out_rx) = mpsc::channel(64);
        let (in_tx, in_rx) = mpsc::channel(256);
        tokio::spawn(pump_socket(
            ws_stream,
            out_rx,
            in_tx,
            self.ping_interval,
            self.idle_timeout,
        ));

        Ok(TransportLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

/// Shuttle frames between the socket and the link channels until either side closes.
async fn pump_socket<S>(
    ws_stream: tokio_tungstenite::WebSocketStream<S>,
    mut out_rx: mpsc::Receiver<String>,
    in_tx: mpsc::Sender<Result<String, ConnectionError>>,
    ping_interval: Duration,
    idle_timeout: Duration,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut write, mut read) = ws_stream.split();
    let mut ping = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
    let idle = sleep(idle_timeout);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            frame = read.next() => {
                idle.as_mut().reset(Instant::now() + idle_timeout);
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        if in_tx.send(Ok(text.to_string())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = write.send(Message::Pong(data)).await {
                            error!("Failed to send pong: {}", e);
                            let _ = in_tx.send(Err(ConnectionError::Transport(e.to_string()))).await;
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("WebSocket closed by server");
                        let _ = in_tx.send(Err(ConnectionError::ChannelClosed)).await;
                        break;
                    }
                    Some(Ok(_)) => {} // Binary, Pong, Frame - ignore
                    Some(Err(e)) => {
                        error!("WebSocket error: {}", e);
                        let _ = in_tx.send(Err(ConnectionError::Transport(e.to_string()))).await;
                        break;
                    }
                    None => {
                        let _ = in_tx.send(Err(ConnectionError::ChannelClosed)).await;
                        break;
                    }
                }
            }
            outgoing = out_rx.recv() => match outgoing {
                Some(text) => {
                    if let Err(e) = write.send(Message::Text(text.into())).await {
                        error!("Failed to send frame: {}", e);
                        let _ = in_tx.send(Err(ConnectionError::Transport(e.to_string()))).await;
                        break;
                    }
                }
                None => {
                    // Manager released the link
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }
            },
            _ = ping.tick() => {
                if let Err(e) = write.send(Message::Ping(vec![].into())).await {
                    warn!("Failed to send ping: {}", e);
                    let _ = in_tx.send(Err(ConnectionError::Transport(e.to_string()))).await;
                    break;
                }
                debug!("Sent keepalive ping");
            }
            _ = &mut idle => {
                warn!("No frames for {:?}, dropping connection", idle_timeout);
                let _ = in_tx
                    .send(Err(ConnectionError::Transport("idle timeout".to_string())))
                    .await;
                break;
            }
        }
    }
}

struct Supervisor {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// State shared between the manager and its supervisor task.
#[derive(Clone)]
struct Shared {
    settings: ConnectionSettings,
    credentials: Arc<dyn CredentialProvider>,
    connector: Arc<dyn Connector>,
    status: Arc<watch::Sender<ConnectionStatus>>,
    outbound: Arc<watch::Sender<Option<mpsc::Sender<String>>>>,
    events: mpsc::Sender<ConnectionEvent>,
}

impl Shared {
    fn set_status(&self, state: ConnectionState, attempt: u32, last_error: Option<String>) {
        self.status.send_modify(|status| {
            status.state = state;
            status.attempt = attempt;
            if last_error.is_some() || state == ConnectionState::Connected {
                status.last_error = last_error;
            }
        });
    }
}

enum LinkEnd {
    Shutdown,
    Dropped(String),
}

/// Owns the process-wide connection of one client session.
pub struct ConnectionManager {
    shared: Shared,
    lifecycle: Mutex<Option<Supervisor>>,
}

impl ConnectionManager {
    /// Create a manager and the receiver of its delivered events.
    pub fn new(
        settings: ConnectionSettings,
        credentials: Arc<dyn CredentialProvider>,
        connector: Arc<dyn Connector>,
    ) -> (Self, mpsc::Receiver<ConnectionEvent>) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (status_tx, _) = watch::channel(ConnectionStatus::default());
        let (outbound_tx, _) = watch::channel(None);

        let manager = Self {
            shared: Shared {
                settings,
                credentials,
                connector,
                status: Arc::new(status_tx),
                outbound: Arc::new(outbound_tx),
                events: events_tx,
            },
            lifecycle: Mutex::new(None),
        };
        (manager, events_rx)
    }

    /// Open the connection and wait until it is established or has failed.
    ///
    /// Idempotent while connecting or connected: no second connection is
    /// opened, the call just waits for the current attempt to settle. After
    /// an error a fresh supervisor is started.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        let mut lifecycle = self.lifecycle.lock().await;

        // A supervisor that reported Error is done even if its task has not exited yet
        let failed = self.connection_state() == ConnectionState::Error;
        let running = lifecycle
            .as_ref()
            .is_some_and(|supervisor| !supervisor.handle.is_finished());
        if running && !failed {
            drop(lifecycle);
            return self.wait_settled().await;
        }

        if let Some(stale) = lifecycle.take() {
            let _ = stale.shutdown.send(());
            if let Err(e) = stale.handle.await {
                warn!("Previous connection supervisor ended abnormally: {}", e);
            }
        }

        if self.shared.credentials.token().is_none() {
            warn!("Cannot connect: no session credential");
            let err = ConnectionError::MissingCredential;
            self.shared
                .set_status(ConnectionState::Error, 0, Some(err.to_string()));
            return Err(err);
        }

        self.shared.set_status(ConnectionState::Connecting, 1, None);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(supervise(self.shared.clone(), shutdown_rx));
        *lifecycle = Some(Supervisor {
            shutdown: shutdown_tx,
            handle,
        });
        drop(lifecycle);

        self.wait_settled().await
    }

    /// Close the connection and stop reconnecting.
    pub async fn disconnect(&self) {
        let mut lifecycle = self.lifecycle.lock().await;

        if let Some(supervisor) = lifecycle.take() {
            let _ = supervisor.shutdown.send(());
            if let Err(e) = supervisor.handle.await {
                warn!("Connection supervisor ended abnormally: {}", e);
            }
        }

        self.shared.outbound.send_replace(None);
        self.shared.set_status(ConnectionState::Disconnected, 0, None);
        info!("Disconnected from bid WebSocket");
    }

    /// Send a control frame over the live connection.
    pub async fn send(&self, message: &ClientMessage) -> Result<(), ConnectionError> {
        if !self.is_connected() {
            return Err(ConnectionError::NotConnected);
        }
        let sender = self
            .shared
            .outbound
            .borrow()
            .clone()
            .ok_or(ConnectionError::NotConnected)?;

        let text = message
            .to_json()
            .map_err(|e| ConnectionError::Transport(e.to_string()))?;
        debug!("Sending {}", text);
        sender
            .send(text)
            .await
            .map_err(|_| ConnectionError::ChannelClosed)
    }

    async fn wait_settled(&self) -> Result<(), ConnectionError> {
        let mut rx = self.shared.status.subscribe();
        let status = rx
            .wait_for(|status| status.state != ConnectionState::Connecting)
            .await
            .map_err(|_| ConnectionError::ChannelClosed)?
            .clone();

        match status.state {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Error => Err(ConnectionError::Transport(
                status.last_error.unwrap_or_else(|| "connection failed".to_string()),
            )),
            _ => Err(ConnectionError::NotConnected),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.status.borrow().clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.status.borrow().state
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared.status.borrow().last_error.clone()
    }

    pub fn reconnect_attempt(&self) -> u32 {
        self.shared.status.borrow().attempt
    }

    pub fn is_connected(&self) -> bool {
        self.shared.status.borrow().is_connected()
    }

    pub fn is_connecting(&self) -> bool {
        self.shared.status.borrow().is_connecting()
    }

    /// Watch connection status changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }
}

/// Connect, deliver, reconnect until shut down or out of attempts.
async fn supervise(shared: Shared, mut shutdown: oneshot::Receiver<()>) {
    let settings = shared.settings.clone();
    let mut attempt = 0;
    let mut delay = settings.reconnect_delay;

    loop {
        attempt += 1;
        shared.set_status(ConnectionState::Connecting, attempt, None);

        let Some(token) = shared.credentials.token() else {
            warn!("Session credential disappeared, giving up");
            shared.set_status(
                ConnectionState::Error,
                0,
                Some(ConnectionError::MissingCredential.to_string()),
            );
            return;
        };

        let attempt_result = tokio::select! {
            result = timeout(settings.connect_timeout, shared.connector.connect(&settings.url, &token)) => {
                result.unwrap_or(Err(ConnectionError::Timeout))
            }
            _ = &mut shutdown => return,
        };

        let last_error = match attempt_result {
            Ok(link) => {
                shared.outbound.send_replace(Some(link.outbound.clone()));
                shared.set_status(ConnectionState::Connected, 0, None);
                if shared.events.send(ConnectionEvent::Connected).await.is_err() {
                    return;
                }

                let end = deliver(&shared, link, &mut shutdown).await;
                shared.outbound.send_replace(None);
                let _ = shared.events.send(ConnectionEvent::Disconnected).await;

                match end {
                    LinkEnd::Shutdown => return,
                    LinkEnd::Dropped(reason) => {
                        warn!("Connection lost: {}. Reconnecting...", reason);
                        shared.set_status(ConnectionState::Connecting, 1, Some(reason));
                        attempt = 0;
                        delay = settings.reconnect_delay;
                        continue;
                    }
                }
            }
            Err(e) => e.to_string(),
        };
        shared.set_status(ConnectionState::Connecting, attempt, Some(last_error.clone()));

        if attempt >= settings.max_attempts {
            error!("Failed to connect after {} attempts", attempt);
            let err = ConnectionError::Exhausted {
                attempts: attempt,
                last_error,
            };
            shared.set_status(ConnectionState::Error, 0, Some(err.to_string()));
            return;
        }

        warn!(
            "Connection attempt {} failed: {}. Retrying in {:?}",
            attempt, last_error, delay
        );
        tokio::select! {
            _ = sleep(delay) => {}
            _ = &mut shutdown => return,
        }

        // Exponential backoff with cap
        delay = std::cmp::min(delay * 2, settings.max_reconnect_delay);
    }
}

/// Forward inbound frames as events until the link drops or shutdown is requested.
async fn deliver(
    shared: &Shared,
    link: TransportLink,
    shutdown: &mut oneshot::Receiver<()>,
) -> LinkEnd {
    let TransportLink {
        outbound: _outbound,
        mut inbound,
    } = link;

    loop {
        tokio::select! {
            frame = inbound.recv() => match frame {
                Some(Ok(text)) => {
                    let message = parse_message(&text);
                    if shared.events.send(ConnectionEvent::Message(message)).await.is_err() {
                        return LinkEnd::Shutdown;
                    }
                }
                Some(Err(e)) => return LinkEnd::Dropped(e.to_string()),
                None => return LinkEnd::Dropped(ConnectionError::ChannelClosed.to_string()),
            },
            _ = &mut *shutdown => return LinkEnd::Shutdown,
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory transport for exercising the manager and session.

    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};

    use tokio::sync::Notify;

    use super::*;

    /// Server end of a fake link.
    pub(crate) struct FakeServer {
        /// Frames the client sent
        pub sent: mpsc::Receiver<String>,
        /// Push frames (or a drop) to the client
        pub push: mpsc::Sender<Result<String, ConnectionError>>,
    }

    impl FakeServer {
        pub(crate) async fn push_text(&self, text: &str) {
            self.push.send(Ok(text.to_string())).await.unwrap();
        }

        pub(crate) async fn drop_link(&self) {
            self.push
                .send(Err(ConnectionError::Transport("reset by peer".to_string())))
                .await
                .unwrap();
        }

        /// Next frame the client sent, if one arrives shortly.
        pub(crate) async fn next_sent(&mut self) -> Option<String> {
            tokio::time::timeout(Duration::from_millis(200), self.sent.recv())
                .await
                .ok()
                .flatten()
        }
    }

    pub(crate) fn fake_link() -> (TransportLink, FakeServer) {
        let (out_tx, out_rx) = mpsc::channel(64);
        let (in_tx, in_rx) = mpsc::channel(64);
        (
            TransportLink {
                outbound: out_tx,
                inbound: in_rx,
            },
            FakeServer {
                sent: out_rx,
                push: in_tx,
            },
        )
    }

    /// Hands out queued links; fails once the queue is empty.
    #[derive(Default)]
    pub(crate) struct FakeConnector {
        pub plans: std::sync::Mutex<VecDeque<Result<TransportLink, ConnectionError>>>,
        pub attempts: AtomicU32,
        /// When set, every attempt waits for a permit
        pub gate: Option<Arc<Notify>>,
    }

    impl FakeConnector {
        pub(crate) fn with_plans(plans: Vec<Result<TransportLink, ConnectionError>>) -> Self {
            Self {
                plans: std::sync::Mutex::new(plans.into()),
                ..Self::default()
            }
        }

        pub(crate) fn attempts(&self) -> u32 {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Connector for FakeConnector {
        async fn connect(&self, _url: &str, token: &str) -> Result<TransportLink, ConnectionError> {
            assert!(!token.is_empty());
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.plans
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ConnectionError::Transport("connection refused".to_string())))
        }
    }

    pub(crate) fn fast_settings(max_attempts: u32) -> ConnectionSettings {
        ConnectionSettings {
            url: "ws://test/ws".to_string(),
            max_attempts,
            reconnect_delay: Duration::from_millis(5),
            max_reconnect_delay: Duration::from_millis(20),
            connect_timeout: Duration::from_secs(1),
        }
    }
}
