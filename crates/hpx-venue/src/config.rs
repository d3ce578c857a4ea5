//! Venue connection configuration.

use std::time::Duration;

use crate::registry::DEFAULT_INBOX_CAPACITY;

/// Configuration for a [`VenueClient`](crate::VenueClient).
#[derive(Clone, Debug)]
pub struct VenueConfig {
    // URL
    /// Venue WebSocket endpoint.
    pub url: String,

    // Reconnection settings
    /// Initial delay before first reconnection attempt.
    pub reconnect_initial_delay: Duration,
    /// Maximum delay between reconnection attempts.
    pub reconnect_max_delay: Duration,
    /// Backoff multiplier for reconnection delays.
    pub reconnect_backoff_factor: f64,
    /// Random jitter factor (0.0-1.0) for reconnection delays.
    pub reconnect_jitter: f64,
    /// Consecutive failed opens before giving up (None = never).
    pub reconnect_max_attempts: Option<u32>,

    // Connection
    /// Timeout for the WebSocket handshake and authorization.
    pub connect_timeout: Duration,
    /// Run the protocol's authorization exchange on every open.
    pub auth_on_connect: bool,
    /// Inbound frames above this size are dropped.
    pub max_message_size: usize,

    // Heartbeat settings
    /// Interval between pings.
    pub ping_interval: Duration,
    /// Session is considered dead after this long without a pong.
    pub pong_timeout: Duration,
    /// Use WebSocket protocol-level ping frames (vs application-level).
    pub use_websocket_ping: bool,

    // Exchanges
    /// Default bound for one-shot exchanges.
    pub request_timeout: Duration,
    /// Bounded wait per subscription poll.
    pub subscription_poll_interval: Duration,
    /// Bound on the forget round-trip during subscription cancellation.
    pub unsubscribe_timeout: Duration,
    /// Unread pushes kept per subscription; the oldest is dropped when full.
    pub subscription_inbox_capacity: usize,

    // Housekeeping
    /// Capacity of the supervisor command channel.
    pub command_channel_capacity: usize,
    /// Lifetime of a delivered reply nobody registered for.
    pub orphan_ttl: Duration,
    /// Cadence of the orphan sweep.
    pub cleanup_interval: Duration,
}

impl Default for VenueConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            reconnect_initial_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(60),
            reconnect_backoff_factor: 2.0,
            reconnect_jitter: 0.1,
            reconnect_max_attempts: None,
            connect_timeout: Duration::from_secs(10),
            auth_on_connect: false,
            max_message_size: 16 * 1024 * 1024, // 16 MB
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(60),
            use_websocket_ping: true,
            request_timeout: Duration::from_secs(30),
            subscription_poll_interval: Duration::from_secs(10),
            unsubscribe_timeout: Duration::from_secs(5),
            subscription_inbox_capacity: DEFAULT_INBOX_CAPACITY,
            command_channel_capacity: 64,
            orphan_ttl: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(5),
        }
    }
}

impl VenueConfig {
    /// Create a new configuration with the given URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Set the reconnection initial delay.
    #[must_use]
    pub fn reconnect_initial_delay(mut self, delay: Duration) -> Self {
        self.reconnect_initial_delay = delay;
        self
    }

    /// Set the maximum reconnection delay.
    #[must_use]
    pub fn reconnect_max_delay(mut self, delay: Duration) -> Self {
        self.reconnect_max_delay = delay;
        self
    }

    /// Set the reconnection backoff factor.
    #[must_use]
    pub fn reconnect_backoff_factor(mut self, factor: f64) -> Self {
        self.reconnect_backoff_factor = factor;
        self
    }

    /// Set the reconnection jitter.
    #[must_use]
    pub fn reconnect_jitter(mut self, jitter: f64) -> Self {
        self.reconnect_jitter = jitter;
        self
    }

    /// Set the maximum reconnection attempts.
    #[must_use]
    pub fn reconnect_max_attempts(mut self, attempts: Option<u32>) -> Self {
        self.reconnect_max_attempts = attempts;
        self
    }

    /// Set the connection timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set whether to authorize on every open.
    #[must_use]
    pub fn auth_on_connect(mut self, auth: bool) -> Self {
        self.auth_on_connect = auth;
        self
    }

    /// Set the ping interval.
    #[must_use]
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Set the pong timeout.
    #[must_use]
    pub fn pong_timeout(mut self, timeout: Duration) -> Self {
        self.pong_timeout = timeout;
        self
    }

    /// Set whether to use WebSocket protocol-level pings.
    #[must_use]
    pub fn use_websocket_ping(mut self, use_ws_ping: bool) -> Self {
        self.use_websocket_ping = use_ws_ping;
        self
    }

    /// Set the default request timeout.
    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the subscription poll interval.
    #[must_use]
    pub fn subscription_poll_interval(mut self, interval: Duration) -> Self {
        self.subscription_poll_interval = interval;
        self
    }

    /// Set the unsubscribe round-trip bound.
    #[must_use]
    pub fn unsubscribe_timeout(mut self, timeout: Duration) -> Self {
        self.unsubscribe_timeout = timeout;
        self
    }

    /// Set how many unread pushes a subscription keeps.
    #[must_use]
    pub fn subscription_inbox_capacity(mut self, capacity: usize) -> Self {
        self.subscription_inbox_capacity = capacity;
        self
    }

    /// Set the orphan lifetime.
    #[must_use]
    pub fn orphan_ttl(mut self, ttl: Duration) -> Self {
        self.orphan_ttl = ttl;
        self
    }

    /// Set the orphan sweep cadence.
    #[must_use]
    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.url.is_empty() {
            return Err("URL cannot be empty".to_string());
        }
        if self.reconnect_initial_delay.is_zero() {
            return Err("Initial reconnect delay must be > 0".to_string());
        }
        if self.reconnect_max_delay < self.reconnect_initial_delay {
            return Err("Max reconnect delay must be >= initial reconnect delay".to_string());
        }
        if !self.reconnect_backoff_factor.is_finite() || self.reconnect_backoff_factor < 1.0 {
            return Err("Backoff factor must be >= 1.0".to_string());
        }
        if !(0.0..=1.0).contains(&self.reconnect_jitter) {
            return Err("Jitter must be between 0.0 and 1.0".to_string());
        }
        if self.reconnect_max_attempts == Some(0) {
            return Err("Max reconnect attempts must be > 0".to_string());
        }
        if self.connect_timeout.is_zero() {
            return Err("Connect timeout must be > 0".to_string());
        }
        if self.ping_interval.is_zero() {
            return Err("Ping interval must be > 0".to_string());
        }
        if self.pong_timeout.is_zero() {
            return Err("Pong timeout must be > 0".to_string());
        }
        if self.request_timeout.is_zero() {
            return Err("Request timeout must be > 0".to_string());
        }
        if self.subscription_poll_interval.is_zero() {
            return Err("Subscription poll interval must be > 0".to_string());
        }
        if self.unsubscribe_timeout.is_zero() {
            return Err("Unsubscribe timeout must be > 0".to_string());
        }
        if self.subscription_inbox_capacity == 0 {
            return Err("Subscription inbox capacity must be > 0".to_string());
        }
        if self.command_channel_capacity == 0 {
            return Err("Command channel capacity must be > 0".to_string());
        }
        if self.cleanup_interval.is_zero() {
            return Err("Cleanup interval must be > 0".to_string());
        }
        Ok(())
    }
}
