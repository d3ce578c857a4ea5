//! # hpx-venue
//!
//! Request/response correlation and subscription multiplexing over a single
//! trading-venue WebSocket.
//!
//! Many concurrent tasks share one physical connection. Each outbound request
//! carries a fresh correlation id; the venue echoes it on the reply (and on
//! every push of a subscription), and the crate routes each inbound message
//! back to exactly the caller waiting for that id.
//!
//! ## Architecture
//!
//! ```text
//!  caller tasks                          supervisor task
//!  ────────────                          ───────────────
//!  execute / subscribe ──┐          ┌──▶ WebSocket writer ──▶ venue
//!   1. IdAllocator::next │  mpsc    │
//!   2. register_wait     ├─────────▶┤    (single send-ordering point)
//!   3. send_through_current         │
//!   4. wait ◀───────┐    │          └──◀ WebSocket reader ◀── venue
//!                   │                          │
//!           CorrelationRegistry ◀── deliver ── Dispatcher::on_message
//!                   ▲                          │
//!                   └──── fail_all ◀── session lost / shutdown
//! ```
//!
//! ## Features
//!
//! - **Exact routing**: every caller receives the reply carrying its own id
//! - **Exactly one outcome**: success, `Timeout`, `ConnectionLost` or
//!   `SendFailed`, with the registry entry always cleaned up
//! - **Reconnection**: exponential backoff with jitter, optional attempt cap
//! - **Authorization on open** and heartbeat handling
//! - **Subscriptions** as ordered lazy sequences with explicit cancellation,
//!   released on drop
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use hpx_venue::{JsonProtocol, VenueClient, VenueConfig};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = VenueConfig::new("wss://ws.example.com/websockets/v3?app_id=1");
//!     let client = VenueClient::connect(config, JsonProtocol::default())?;
//!     client.wait_until_open(Duration::from_secs(10)).await?;
//!
//!     let mut ticks = client.subscribe_json(&json!({"ticks": "R_50"})).await?;
//!     while let Some(tick) = ticks.next().await {
//!         println!("{}", tick?.text().unwrap_or_default());
//!     }
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod id;
pub mod message;
pub mod protocol;
pub mod registry;
pub mod subscription;
pub mod supervisor;
pub mod transport;

// Re-export commonly used types
pub use client::VenueClient;
pub use config::VenueConfig;
pub use dispatch::Dispatcher;
pub use error::{VenueError, VenueResult};
pub use id::{CorrelationId, IdAllocator};
pub use message::{Outbound, Reply};
pub use protocol::{JsonProtocol, JsonProtocolConfig, Routing, VenueProtocol};
pub use registry::{Closure, CorrelationRegistry, Delivery, WaitHandle, WaitMode};
pub use subscription::{DedupPolicy, Subscription};
pub use supervisor::{
    ConnectionEpoch, ConnectionSupervisor, Dispatch, SessionState, SessionStatus,
    SupervisorHandle,
};
pub use transport::SessionWriter;
