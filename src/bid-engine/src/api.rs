//! Marketplace REST client: topic snapshots and farmer commands.
//!
//! Commands are request/acknowledge: the response body is the authoritative
//! bid record, distinct from the broadcast other observers receive.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::credentials::CredentialProvider;
use crate::models::{ActionKind, Bid};
use crate::Config;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP request failed: {0}")]
    RequestError(#[from] reqwest::Error),

    #[error("Not signed in")]
    Unauthenticated,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("API error: {0}")]
    ApiError(String),
}

/// Current bids of a crop listing, loaded before live events are layered on.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicSnapshot {
    #[serde(default)]
    pub bids: Vec<Bid>,
    #[serde(default)]
    pub listed_price: Option<Decimal>,
}

/// Server acknowledgement of accept/reject/counter.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandAck {
    #[serde(flatten)]
    pub bid: Bid,
    /// Bid spawned by a counter-offer, when the server reports it
    #[serde(default)]
    pub counter_bid: Option<Bid>,
}

#[derive(Debug, Serialize)]
struct RejectBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

#[derive(Debug, Serialize)]
struct CounterBody {
    amount: Decimal,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(alias = "error")]
    message: String,
}

/// Trait for marketplace REST operations - mockable for testing.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BidApi: Send + Sync {
    /// `GET /crops/{topic_id}/bids`
    async fn fetch_topic(&self, topic_id: &str) -> Result<TopicSnapshot, ApiError>;

    /// `POST /bids/{bid_id}/accept`
    async fn accept(&self, bid_id: &str) -> Result<CommandAck, ApiError>;

    /// `POST /bids/{bid_id}/reject`
    async fn reject(&self, bid_id: &str, reason: Option<String>) -> Result<CommandAck, ApiError>;

    /// `POST /bids/{bid_id}/counter`
    async fn counter(&self, bid_id: &str, amount: Decimal) -> Result<CommandAck, ApiError>;
}

/// reqwest-backed marketplace client.
pub struct HttpBidApi {
    client: Client,
    base_url: String,
    credentials: Arc<dyn CredentialProvider>,
}

impl HttpBidApi {
    /// Create a new client. Requests are bounded by the command timeout.
    pub fn new(config: &Config, credentials: Arc<dyn CredentialProvider>) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(config.command_timeout())
            .build()?;
        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            credentials,
        })
    }

    fn authorize(&self, request: RequestBuilder) -> Result<RequestBuilder, ApiError> {
        let token = self.credentials.token().ok_or(ApiError::Unauthenticated)?;
        Ok(request.bearer_auth(token))
    }

    async fn send_command<B: Serialize + ?Sized>(
        &self,
        bid_id: &str,
        action: ActionKind,
        body: &B,
    ) -> Result<CommandAck, ApiError> {
        let url = format!("{}/bids/{}/{}", self.base_url, bid_id, action.as_str());
        let request_id = Uuid::new_v4();

        info!("[API] {} bid {} (request {})", action.as_str(), bid_id, request_id);

        let request = self
            .client
            .post(&url)
            .header("X-Request-Id", request_id.to_string())
            .json(body);
        let response = self.authorize(request)?.send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_failure(status, &body, bid_id));
        }

        let ack: CommandAck = response.json().await?;
        debug!("[API] bid {} is now {}", ack.bid.id, ack.bid.status);
        Ok(ack)
    }
}

#[async_trait]
impl BidApi for HttpBidApi {
    async fn fetch_topic(&self, topic_id: &str) -> Result<TopicSnapshot, ApiError> {
        let url = format!("{}/crops/{}/bids", self.base_url, topic_id);

        debug!("[API] Fetching snapshot for {}", topic_id);

        let response = self.authorize(self.client.get(&url))?.send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_failure(status, &body, topic_id));
        }

        let snapshot: TopicSnapshot = response.json().await?;
        info!(
            "[API] Snapshot for {}: {} bids",
            topic_id,
            snapshot.bids.len()
        );
        Ok(snapshot)
    }

    async fn accept(&self, bid_id: &str) -> Result<CommandAck, ApiError> {
        self.send_command(bid_id, ActionKind::Accept, &serde_json::json!({}))
            .await
    }

    async fn reject(&self, bid_id: &str, reason: Option<String>) -> Result<CommandAck, ApiError> {
        self.send_command(bid_id, ActionKind::Reject, &RejectBody { reason })
            .await
    }

    async fn counter(&self, bid_id: &str, amount: Decimal) -> Result<CommandAck, ApiError> {
        self.send_command(bid_id, ActionKind::Counter, &CounterBody { amount })
            .await
    }
}

/// Map a non-success response to an error, preferring the server's message.
fn classify_failure(status: StatusCode, body: &str, subject: &str) -> ApiError {
    let message = serde_json::from_str::<ErrorBody>(body)
        .map(|e| e.message)
        .unwrap_or_else(|_| body.trim().to_string());

    match status {
        StatusCode::UNAUTHORIZED => ApiError::Unauthenticated,
        StatusCode::NOT_FOUND => ApiError::NotFound(subject.to_string()),
        s if s.is_client_error() => ApiError::Rejected {
            status: s.as_u16(),
            message: if message.is_empty() {
                s.to_string()
            } else {
                message
            },
        },
        s => ApiError::ApiError(format!("API returned status: {}", s)),
    }
}
