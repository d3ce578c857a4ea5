//! Request/response exchanges and subscription entry over one venue session.

use std::{sync::Arc, time::Duration};

use scc::hash_map::Entry;
use serde::{Serialize, de::DeserializeOwned};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::{
    config::VenueConfig,
    dispatch::Dispatcher,
    error::{VenueError, VenueResult},
    id::{CorrelationId, IdAllocator},
    message::{Outbound, Reply},
    protocol::VenueProtocol,
    registry::{CorrelationRegistry, WaitMode},
    subscription::{DedupPolicy, Subscription},
    supervisor::{
        ConnectionEpoch, ConnectionSupervisor, SessionState, SessionStatus, SupervisorHandle,
    },
};

/// Cancels the registry entry for `id` when dropped.
///
/// Covers every exit of an exchange, including the caller dropping the
/// future mid-wait. After a successful take the entry is already gone and
/// this is a no-op.
struct ReleaseOnDrop<'a> {
    registry: &'a CorrelationRegistry,
    id: CorrelationId,
}

impl Drop for ReleaseOnDrop<'_> {
    fn drop(&mut self) {
        self.registry.cancel(self.id);
    }
}

/// Multiplexed client for one venue connection.
///
/// Cheap to clone; every clone shares the same session, id allocator and
/// registry. The background supervisor stops once shutdown is requested or
/// the last clone (including live subscriptions) is dropped.
///
/// # Example
///
/// ```rust,no_run
/// use hpx_venue::{JsonProtocol, VenueClient, VenueConfig};
/// use serde_json::{Value, json};
/// use std::time::Duration;
///
/// # async fn example() -> hpx_venue::VenueResult<()> {
/// let config = VenueConfig::new("wss://ws.example.com/websockets/v3?app_id=1");
/// let client = VenueClient::connect(config, JsonProtocol::default())?;
/// client.wait_until_open(Duration::from_secs(10)).await?;
///
/// let time: Value = client.request(&json!({"time": 1})).await?;
/// println!("server time: {}", time["time"]);
/// # Ok(())
/// # }
/// ```
pub struct VenueClient<P: VenueProtocol> {
    pub(crate) config: Arc<VenueConfig>,
    pub(crate) protocol: Arc<P>,
    pub(crate) registry: Arc<CorrelationRegistry>,
    pub(crate) streams: Arc<scc::HashMap<CorrelationId, String>>,
    ids: Arc<IdAllocator>,
    supervisor: SupervisorHandle,
}

impl<P: VenueProtocol> Clone for VenueClient<P> {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            protocol: Arc::clone(&self.protocol),
            registry: Arc::clone(&self.registry),
            streams: Arc::clone(&self.streams),
            ids: Arc::clone(&self.ids),
            supervisor: self.supervisor.clone(),
        }
    }
}

impl<P: VenueProtocol> VenueClient<P> {
    /// Validate `config` and start the connection supervisor.
    ///
    /// Returns immediately; the session opens in the background. Must be
    /// called from within a tokio runtime.
    pub fn connect(config: VenueConfig, protocol: P) -> VenueResult<Self> {
        config.validate().map_err(VenueError::config)?;
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(VenueError::internal("VenueClient::connect requires a tokio runtime"));
        }

        let config = Arc::new(config);
        let protocol = Arc::new(protocol);
        let registry = Arc::new(CorrelationRegistry::with_inbox_capacity(
            config.subscription_inbox_capacity,
        ));
        let ids = Arc::new(IdAllocator::new());

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&protocol),
            Arc::clone(&registry),
            Arc::clone(&ids),
            config.orphan_ttl,
        ));
        let supervisor = ConnectionSupervisor::spawn(
            Arc::clone(&config),
            Arc::clone(&protocol),
            dispatcher,
            Arc::clone(&ids),
        );

        Ok(Self {
            config,
            protocol,
            registry,
            streams: Arc::new(scc::HashMap::new()),
            ids,
            supervisor,
        })
    }

    /// One-shot exchange bounded by the configured request timeout.
    ///
    /// `build` receives the id allocated for this exchange and must embed it
    /// in the outbound message. Resolves with the matching reply, or exactly
    /// one of [`VenueError::Timeout`], [`VenueError::ConnectionLost`] or
    /// [`VenueError::SendFailed`]. The registry entry is gone before this
    /// returns on every path.
    pub async fn execute<F>(&self, build: F) -> VenueResult<Reply>
    where
        F: FnOnce(CorrelationId) -> Outbound,
    {
        self.exchange(|id| Ok(build(id)), Some(self.config.request_timeout))
            .await
    }

    /// Like [`Self::execute`] with an explicit bound (`None` waits until the
    /// reply arrives or the session is lost).
    pub async fn execute_with_timeout<F>(&self, build: F, limit: Option<Duration>) -> VenueResult<Reply>
    where
        F: FnOnce(CorrelationId) -> Outbound,
    {
        self.exchange(|id| Ok(build(id)), limit).await
    }

    /// Serialize `req`, embed the correlation id, execute and decode the reply.
    ///
    /// Replies flagged as errors surface as [`VenueError::Rejected`].
    pub async fn request<R, T>(&self, req: &R) -> VenueResult<T>
    where
        R: Serialize,
        T: DeserializeOwned,
    {
        self.request_with_timeout(req, Some(self.config.request_timeout))
            .await
    }

    /// Like [`Self::request`] with an explicit bound.
    pub async fn request_with_timeout<R, T>(&self, req: &R, limit: Option<Duration>) -> VenueResult<T>
    where
        R: Serialize,
        T: DeserializeOwned,
    {
        let value = serde_json::to_value(req)?;
        let reply = self
            .exchange(|id| self.protocol.encode_request(value, id), limit)
            .await?;
        reply.into_result()?.json()
    }

    /// Open a subscription; `build` must embed the given id.
    pub async fn subscribe<F>(&self, build: F) -> VenueResult<Subscription<P>>
    where
        F: FnOnce(CorrelationId) -> Outbound,
    {
        self.open_subscription(|id| Ok(build(id)), DedupPolicy::Off)
            .await
    }

    /// Serialize `req`, embed the correlation id and open a subscription.
    pub async fn subscribe_json<R: Serialize>(&self, req: &R) -> VenueResult<Subscription<P>> {
        self.subscribe_json_with(req, DedupPolicy::Off).await
    }

    /// Like [`Self::subscribe_json`] with an explicit de-dup policy.
    pub async fn subscribe_json_with<R: Serialize>(
        &self,
        req: &R,
        dedup: DedupPolicy,
    ) -> VenueResult<Subscription<P>> {
        let value = serde_json::to_value(req)?;
        self.open_subscription(|id| self.protocol.encode_request(value, id), dedup)
            .await
    }

    /// Unsubscribe `id` at the venue, then release it locally.
    ///
    /// The local release always happens, also when this future is dropped
    /// before the forget round-trip finishes. The returned error only
    /// reports that the remote forget failed or timed out.
    pub async fn cancel(&self, id: CorrelationId) -> VenueResult<()> {
        let release = ReleaseOnDrop {
            registry: &self.registry,
            id,
        };
        let stream_id = self.streams.remove_sync(&id).map(|(_, stream_id)| stream_id);
        let outcome = match stream_id {
            Some(stream_id) => self.forget(&stream_id).await,
            None => Ok(()),
        };
        drop(release);

        if let Err(err) = &outcome {
            warn!(%id, error = %err, "Unsubscribe failed; subscription released locally");
        }
        outcome
    }

    /// Forget every stream of `stream_kind` (for example "ticks").
    pub async fn forget_all(&self, stream_kind: &str) -> VenueResult<Reply> {
        let reply = self
            .exchange(
                |id| {
                    self.protocol.build_forget_all(stream_kind, id).ok_or_else(|| {
                        VenueError::config("protocol does not support bulk unsubscribe")
                    })
                },
                Some(self.config.request_timeout),
            )
            .await?;
        reply.into_result()
    }

    /// Send `message` without registering a wait.
    pub async fn send(&self, message: Outbound) -> VenueResult<()> {
        self.supervisor.send_through_current(message).await
    }

    /// Stop the supervisor; no reconnect follows.
    ///
    /// Every pending wait resolves with [`VenueError::ConnectionLost`].
    pub fn shutdown(&self) {
        self.supervisor.request_shutdown();
    }

    /// Wait until a session is open.
    pub async fn wait_until_open(&self, limit: Duration) -> VenueResult<ConnectionEpoch> {
        self.supervisor.wait_until_open(limit).await
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        self.supervisor.state()
    }

    /// Current session status snapshot.
    pub fn status(&self) -> SessionStatus {
        self.supervisor.status()
    }

    /// Watch session status changes.
    pub fn watch_status(&self) -> tokio::sync::watch::Receiver<SessionStatus> {
        self.supervisor.watch_status()
    }

    /// Whether `id` still has an open wait.
    pub fn is_pending(&self, id: CorrelationId) -> bool {
        self.registry.is_pending(id)
    }

    /// Number of live registry entries.
    pub fn pending_count(&self) -> usize {
        self.registry.len()
    }

    /// The configuration in use.
    pub fn config(&self) -> &VenueConfig {
        &self.config
    }

    /// The protocol in use.
    pub fn protocol(&self) -> &P {
        &self.protocol
    }

    pub(crate) fn remember_stream(&self, id: CorrelationId, stream_id: &str) {
        match self.streams.entry_sync(id) {
            Entry::Occupied(mut occupied) => {
                if occupied.get() != stream_id {
                    *occupied.get_mut() = stream_id.to_string();
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert_entry(stream_id.to_string());
            }
        }
    }

    /// Ask the venue to stop `stream_id`, bounded by the unsubscribe timeout.
    pub(crate) async fn forget(&self, stream_id: &str) -> VenueResult<()> {
        let reply = self
            .exchange(
                |id| Ok(self.protocol.build_forget(stream_id, id)),
                Some(self.config.unsubscribe_timeout),
            )
            .await?;
        reply.into_result()?;
        debug!(stream_id, "Venue stream forgotten");
        Ok(())
    }

    async fn exchange<F>(&self, build: F, limit: Option<Duration>) -> VenueResult<Reply>
    where
        F: FnOnce(CorrelationId) -> VenueResult<Outbound>,
    {
        let id = self.ids.next();
        let handle = self.registry.register_wait(id, WaitMode::OneShot)?;
        let _release = ReleaseOnDrop {
            registry: &self.registry,
            id,
        };

        let message = build(id)?;
        self.supervisor.send_through_current(message).await?;

        let waited = self.registry.wait(&handle);
        match limit {
            Some(limit) => timeout(limit, waited).await.map_err(|_| {
                debug!(%id, "Request timed out");
                VenueError::timeout(id, limit)
            })?,
            None => waited.await,
        }
    }

    async fn open_subscription<F>(&self, build: F, dedup: DedupPolicy) -> VenueResult<Subscription<P>>
    where
        F: FnOnce(CorrelationId) -> VenueResult<Outbound>,
    {
        let id = self.ids.next();
        let handle = self.registry.register_wait(id, WaitMode::Stream)?;
        // Dropping the subscription on any error below releases the entry.
        let subscription = Subscription::new(self.clone(), handle, dedup);

        let message = build(id)?;
        self.supervisor.send_through_current(message).await?;
        debug!(%id, "Subscription opened");

        Ok(subscription)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::JsonProtocol;

    #[tokio::test]
    async fn connect_rejects_invalid_config() {
        let result = VenueClient::connect(VenueConfig::default(), JsonProtocol::default());
        assert!(matches!(result, Err(VenueError::Config { .. })));
    }

    #[test]
    fn connect_requires_runtime() {
        let result = VenueClient::connect(VenueConfig::new("ws://127.0.0.1:1"), JsonProtocol::default());
        assert!(matches!(result, Err(VenueError::Internal { .. })));
    }

    #[tokio::test]
    async fn execute_before_open_fails_and_cleans_up() {
        let config = VenueConfig::new("ws://127.0.0.1:1")
            .connect_timeout(Duration::from_millis(200))
            .reconnect_initial_delay(Duration::from_secs(5))
            .reconnect_max_delay(Duration::from_secs(5));
        let client = VenueClient::connect(config, JsonProtocol::default()).expect("connect");

        let result = client
            .execute(|id| Outbound::text(format!(r#"{{"time":1,"req_id":{id}}}"#)))
            .await;
        assert!(matches!(result, Err(VenueError::SendFailed { .. })));
        assert_eq!(client.pending_count(), 0);

        let result = client.subscribe_json(&serde_json::json!({"ticks": "R_50"})).await;
        assert!(matches!(result, Err(VenueError::SendFailed { .. })));
        assert_eq!(client.pending_count(), 0);

        client.shutdown();
    }

    #[tokio::test]
    async fn remember_stream_tracks_latest_id() {
        let client =
            VenueClient::connect(VenueConfig::new("ws://127.0.0.1:1"), JsonProtocol::default())
                .expect("connect");
        client.remember_stream(CorrelationId(3), "abc");
        client.remember_stream(CorrelationId(3), "def");

        let stored = client
            .streams
            .read_sync(&CorrelationId(3), |_, stream_id| stream_id.clone());
        assert_eq!(stored.as_deref(), Some("def"));
        client.shutdown();
    }
}
