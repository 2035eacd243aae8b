//! Bid Monitor - follow live bids on crop listings.
//!
//! Usage:
//!   bid-monitor --topics crop_1,crop_2 --heartbeat-secs 60

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use bid_engine::{
    Config, ConnectionState, CredentialProvider, MarketSession, StaticCredentials, TopicSummary,
};

/// Follow live bids on crop listings
#[derive(Parser, Debug)]
#[command(name = "bid-monitor")]
#[command(about = "Stream live bid aggregates for crop listings")]
struct Args {
    /// Crop listings to follow (comma-separated)
    #[arg(long)]
    topics: String,

    /// Seconds between summary reports when nothing changes
    #[arg(long, default_value = "60")]
    heartbeat_secs: u64,

    /// Print every pending bid in each report
    #[arg(long)]
    show_bids: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging with RUST_LOG env var support (default: info)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();

    let topics: Vec<String> = args
        .topics
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if topics.is_empty() {
        anyhow::bail!("At least one topic is required");
    }

    info!("Bid Monitor starting...");
    info!("Topics: {}", topics.join(", "));

    let config = Config::from_env()?;
    let credentials: Arc<dyn CredentialProvider> =
        Arc::new(StaticCredentials::new(config.auth_token.clone()));
    let session = MarketSession::from_config(&config, credentials)?;

    spawn_status_logger(&session);

    session
        .start()
        .await
        .context("Failed to connect to the bid stream")?;

    for topic in &topics {
        session.join_topic(topic).await?;
        if let Some(rx) = session.subscribe_summary(topic).await {
            spawn_summary_logger(rx);
        }
    }

    let mut heartbeat = tokio::time::interval(Duration::from_secs(args.heartbeat_secs.max(1)));
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received shutdown signal, exiting...");
                break;
            }
            _ = heartbeat.tick() => {
                info!("[ALIVE] Connection: {:?}", session.connection_status().state);
                for topic in &topics {
                    if let Some(summary) = session.topic_summary(topic).await {
                        print_summary(&summary);
                    }
                    if args.show_bids {
                        for bid in session.pending_bids(topic).await {
                            info!(
                                "  {} {} x{} by {}{}",
                                bid.id,
                                bid.amount,
                                bid.quantity,
                                bid.bidder_name,
                                if bid.is_highest { " (highest)" } else { "" }
                            );
                        }
                    }
                }
            }
        }
    }

    session.shutdown().await;
    info!("Bid Monitor stopped");
    Ok(())
}

/// Log connection transitions, including reconnect attempts.
fn spawn_status_logger(session: &MarketSession) {
    let mut rx = session.subscribe_connection();
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let status = rx.borrow_and_update().clone();
            match status.state {
                ConnectionState::Connected => info!("Connected"),
                ConnectionState::Connecting if status.is_reconnecting() => {
                    warn!("Reconnecting (attempt {})", status.attempt)
                }
                ConnectionState::Connecting => info!("Connecting..."),
                ConnectionState::Disconnected => info!("Disconnected"),
                ConnectionState::Error => error!(
                    "Connection error: {}",
                    status.last_error.as_deref().unwrap_or("unknown")
                ),
            }
        }
    });
}

/// Log every recomputed summary of one topic until it is closed.
fn spawn_summary_logger(mut rx: tokio::sync::watch::Receiver<TopicSummary>) {
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let summary = rx.borrow_and_update().clone();
            print_summary(&summary);
        }
    });
}

fn print_summary(summary: &TopicSummary) {
    let highest = summary
        .highest_pending_amount
        .map(|a| a.to_string())
        .unwrap_or_else(|| "-".to_string());
    let average = summary
        .average_pending_amount
        .map(|a| a.to_string())
        .unwrap_or_else(|| "-".to_string());
    let listed = summary
        .listed_price
        .map(|a| a.to_string())
        .unwrap_or_else(|| "-".to_string());

    info!(
        "[{}] bids={} pending={} highest={} avg={} listed={}",
        summary.topic_id, summary.total_bids, summary.pending_bids, highest, average, listed
    );
}
