//! Tick Subscription Example
//!
//! Opens one venue session, runs a one-shot request and streams a handful of
//! ticks before unsubscribing.
//!
//! Run with: `cargo run -p hpx-venue --example tick_subscription`
//!
//! Set `VENUE_URL` to point at another endpoint and `VENUE_TOKEN` to
//! authorize on connect.

use std::time::Duration;

use hpx_venue::{JsonProtocol, JsonProtocolConfig, VenueClient, VenueConfig};
use serde_json::{Value, json};

const DEFAULT_URL: &str = "wss://ws.derivws.com/websockets/v3?app_id=1089";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let url = std::env::var("VENUE_URL").unwrap_or_else(|_| DEFAULT_URL.to_string());
    let token = std::env::var("VENUE_TOKEN").ok();

    let mut protocol_config = JsonProtocolConfig::new();
    if let Some(token) = &token {
        protocol_config = protocol_config.api_token(token);
    }

    let config = VenueConfig::new(url)
        .request_timeout(Duration::from_secs(10))
        .auth_on_connect(token.is_some())
        .reconnect_max_attempts(Some(5));
    let client = VenueClient::connect(config, JsonProtocol::new(protocol_config))?;
    let epoch = client.wait_until_open(Duration::from_secs(15)).await?;
    println!("Session open (epoch {})", epoch.0);

    let time: Value = client.request(&json!({"time": 1})).await?;
    println!("Server time: {}", time["time"]);

    let mut ticks = client
        .subscribe_json(&json!({"ticks": "R_50", "subscribe": 1}))
        .await?;
    for _ in 0..5 {
        match ticks.next_timeout(Duration::from_secs(10)).await? {
            Some(push) => {
                let body: Value = push.json()?;
                println!("R_50 quote: {}", body["tick"]["quote"]);
            }
            None => break,
        }
    }

    if let Err(err) = ticks.cancel().await {
        eprintln!("Unsubscribe failed: {err}");
    }

    client.shutdown();
    Ok(())
}
