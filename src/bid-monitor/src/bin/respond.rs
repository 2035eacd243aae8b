//! Answer one bid over the marketplace API.
//!
//! Usage:
//!   bid-respond accept --bid-id <BID_ID>
//!   bid-respond reject --bid-id <BID_ID> --reason "price too low"
//!   bid-respond counter --bid-id <BID_ID> --amount 56.50

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::info;

use bid_engine::{BidApi, Config, HttpBidApi, StaticCredentials};

#[derive(Parser, Debug)]
#[command(name = "bid-respond")]
#[command(about = "Accept, reject or counter a bid")]
struct Args {
    #[command(subcommand)]
    action: Action,
}

#[derive(Subcommand, Debug)]
enum Action {
    /// Accept a pending bid
    Accept {
        #[arg(long)]
        bid_id: String,
    },
    /// Reject a pending bid
    Reject {
        #[arg(long)]
        bid_id: String,

        /// Reason shown to the buyer
        #[arg(long)]
        reason: Option<String>,
    },
    /// Counter a pending bid with a new price
    Counter {
        #[arg(long)]
        bid_id: String,

        /// Counter price per unit
        #[arg(long)]
        amount: Decimal,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("bid_respond=info,bid_engine=info")),
        )
        .init();

    let args = Args::parse();

    let config = Config::from_env()?;
    if config.auth_token.is_none() {
        anyhow::bail!("MARKET_AUTH_TOKEN is required to answer bids");
    }
    let api = HttpBidApi::new(
        &config,
        Arc::new(StaticCredentials::new(config.auth_token.clone())),
    )?;

    let ack = match args.action {
        Action::Accept { bid_id } => api
            .accept(&bid_id)
            .await
            .with_context(|| format!("Failed to accept bid {}", bid_id))?,
        Action::Reject { bid_id, reason } => api
            .reject(&bid_id, reason)
            .await
            .with_context(|| format!("Failed to reject bid {}", bid_id))?,
        Action::Counter { bid_id, amount } => {
            if amount <= Decimal::ZERO {
                anyhow::bail!("Counter amount must be positive");
            }
            api.counter(&bid_id, amount)
                .await
                .with_context(|| format!("Failed to counter bid {}", bid_id))?
        }
    };

    info!("Bid {} is now {}", ack.bid.id, ack.bid.status);

    println!("\n{}", "=".repeat(50));
    println!("Bid record:");
    println!("{}", "=".repeat(50));
    println!("{}", serde_json::to_string_pretty(&ack.bid)?);

    if let Some(counter) = &ack.counter_bid {
        println!("\nCounter bid:");
        println!("{}", serde_json::to_string_pretty(counter)?);
    }

    Ok(())
}
