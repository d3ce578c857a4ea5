//! Connection supervisor for the venue session lifecycle.
//!
//! The supervisor runs in a background task and handles:
//! - Opening the session (and authorizing it when configured)
//! - Reconnecting with exponential backoff after an unexpected close
//! - Serializing every outbound write through one command channel
//! - Driving the single inbound-dispatch context
//! - Heartbeat (ping/pong) management and periodic housekeeping
//!
//! ```text
//!            start                 unexpected close, no shutdown
//!   ┌──────────────┐    ok    ┌──────┐ ──────────────────────┐
//!   │  Connecting  │ ───────▶ │ Open │                       │
//!   └──────────────┘          └──────┘ ──┐ shutdown          ▼
//!          ▲  │ failed open                │           ┌────────┐
//!          │  └──────────────────────────────────────▶ │ Closed │
//!          │              backoff          ▼           └────────┘
//!          └──────────────────────── ┌─────────┐           │
//!                                    │ Closing │ ──────────┘ (terminal)
//!                                    └─────────┘
//! ```

use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use futures_util::{Stream, StreamExt};
use rand::Rng;
use tokio::{
    sync::{mpsc, oneshot, watch},
    time::{sleep, timeout},
};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::{
    config::VenueConfig,
    error::{VenueError, VenueResult},
    id::IdAllocator,
    message::Outbound,
    protocol::VenueProtocol,
    transport::{SessionWriter, frame_len, frame_text, open_session, to_frame},
};

/// Counts successful opens; bumps on every new session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ConnectionEpoch(pub u64);

/// Session state machine states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Opening (and authorizing) a fresh session.
    Connecting,
    /// Ready for traffic.
    Open,
    /// Shutting the current session down on request.
    Closing,
    /// No session. Terminal unless `will_reconnect` is set.
    Closed,
}

/// Snapshot published on every state change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionStatus {
    /// Current state.
    pub state: SessionState,
    /// Epoch of the latest session that reached `Open`.
    pub epoch: ConnectionEpoch,
    /// Consecutive failed opens.
    pub attempt: u32,
    /// Whether the supervisor will try to open another session.
    pub will_reconnect: bool,
}

impl SessionStatus {
    fn new(state: SessionState, epoch: ConnectionEpoch, attempt: u32, will_reconnect: bool) -> Self {
        Self {
            state,
            epoch,
            attempt,
            will_reconnect,
        }
    }

    /// Check if the session is ready for traffic.
    pub fn is_open(&self) -> bool {
        self.state == SessionState::Open
    }

    /// Check if the supervisor has stopped for good.
    pub fn is_terminal(&self) -> bool {
        self.state == SessionState::Closed && !self.will_reconnect
    }
}

/// Inbound callbacks of a session.
///
/// Called from the supervisor task only, one message at a time, in wire
/// order. Implementations must hand off quickly: a slow callback stalls every
/// message behind it.
pub trait Dispatch: Send + Sync + 'static {
    /// One inbound data message.
    fn on_message(&self, text: String);

    /// The current session ended; called at most once per session.
    fn on_session_lost(&self, reason: &str);

    /// Periodic housekeeping tick while a session is open.
    fn on_tick(&self) {}
}

#[derive(Debug)]
pub(crate) enum ControlCommand {
    Shutdown,
}

#[derive(Debug)]
pub(crate) enum Command {
    /// Write `message` if the session of `epoch` is still the open one.
    Send {
        message: Outbound,
        epoch: ConnectionEpoch,
        ack: oneshot::Sender<VenueResult<()>>,
    },
}

impl Command {
    fn reject(self, reason: &str) {
        match self {
            Self::Send { ack, .. } => {
                let _ = ack.send(Err(VenueError::send_failed(reason)));
            }
        }
    }
}

/// How a session loop ended.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum SessionEnd {
    /// Shutdown requested, or every handle was dropped.
    Shutdown,
    /// Unexpected close with a reason.
    Lost(String),
}

/// Cloneable handle to a running supervisor.
#[derive(Clone)]
pub struct SupervisorHandle {
    cmd_tx: mpsc::Sender<Command>,
    ctrl_tx: mpsc::Sender<ControlCommand>,
    status_rx: watch::Receiver<SessionStatus>,
    shutdown: Arc<AtomicBool>,
}

impl SupervisorHandle {
    /// Latest published status.
    pub fn status(&self) -> SessionStatus {
        *self.status_rx.borrow()
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        self.status().state
    }

    /// Watch every status change.
    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.status_rx.clone()
    }

    /// Write `message` through the current session.
    ///
    /// Fails with [`VenueError::SendFailed`] when no session is open, when
    /// the session that was open at call time has since been replaced, or
    /// when the write itself fails.
    pub async fn send_through_current(&self, message: Outbound) -> VenueResult<()> {
        let status = self.status();
        if !status.is_open() {
            return Err(VenueError::send_failed("session not open"));
        }

        let (ack, ack_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Send {
                message,
                epoch: status.epoch,
                ack,
            })
            .await
            .map_err(|_| VenueError::send_failed("supervisor stopped"))?;

        ack_rx
            .await
            .map_err(|_| VenueError::send_failed("supervisor dropped the write"))?
    }

    /// Stop for good: no reconnect after the current session closes.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        // A full channel already holds a shutdown request.
        let _ = self.ctrl_tx.try_send(ControlCommand::Shutdown);
    }

    /// Whether shutdown has been requested.
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Wait until a session is open, or fail once the supervisor gives up.
    pub async fn wait_until_open(&self, limit: Duration) -> VenueResult<ConnectionEpoch> {
        let mut status_rx = self.status_rx.clone();
        let waited = timeout(
            limit,
            status_rx.wait_for(|status| status.is_open() || status.is_terminal()),
        )
        .await
        .map_err(|_| {
            VenueError::connection_lost(format!("session not open after {limit:?}"))
        })?;

        let status = *waited.map_err(|_| VenueError::connection_lost("supervisor stopped"))?;
        if status.is_open() {
            Ok(status.epoch)
        } else {
            Err(VenueError::connection_lost("connection closed permanently"))
        }
    }

    /// Whether the supervisor task is still running.
    pub fn is_running(&self) -> bool {
        !self.cmd_tx.is_closed()
    }
}

/// Owns the session lifecycle. Construct with [`ConnectionSupervisor::spawn`].
pub struct ConnectionSupervisor<P: VenueProtocol, D: Dispatch> {
    config: Arc<VenueConfig>,
    protocol: Arc<P>,
    dispatch: Arc<D>,
    ids: Arc<IdAllocator>,
    cmd_rx: mpsc::Receiver<Command>,
    ctrl_rx: mpsc::Receiver<ControlCommand>,
    status_tx: watch::Sender<SessionStatus>,
    shutdown: Arc<AtomicBool>,
}

impl<P: VenueProtocol, D: Dispatch> ConnectionSupervisor<P, D> {
    /// Spawn the supervisor task and return a handle to it.
    pub fn spawn(
        config: Arc<VenueConfig>,
        protocol: Arc<P>,
        dispatch: Arc<D>,
        ids: Arc<IdAllocator>,
    ) -> SupervisorHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(config.command_channel_capacity);
        let (ctrl_tx, ctrl_rx) = mpsc::channel(1);
        let (status_tx, status_rx) = watch::channel(SessionStatus::new(
            SessionState::Connecting,
            ConnectionEpoch::default(),
            0,
            true,
        ));
        let shutdown = Arc::new(AtomicBool::new(false));

        let supervisor = Self {
            config,
            protocol,
            dispatch,
            ids,
            cmd_rx,
            ctrl_rx,
            status_tx,
            shutdown: Arc::clone(&shutdown),
        };
        tokio::spawn(supervisor.run());

        SupervisorHandle {
            cmd_tx,
            ctrl_tx,
            status_rx,
            shutdown,
        }
    }

    /// Main entry point - run until shut down or out of attempts.
    pub async fn run(mut self) {
        info!(url = %self.config.url, "Starting venue supervisor");

        let mut attempt: u32 = 0;
        let mut epoch = ConnectionEpoch::default();

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            self.publish(SessionState::Connecting, epoch, attempt, true);

            let opening = establish(
                Arc::clone(&self.config),
                Arc::clone(&self.protocol),
                Arc::clone(&self.ids),
            );
            let Some(opened) = self.while_not_open(opening).await else {
                break;
            };

            let reason = match opened {
                Ok((writer, reader)) => {
                    attempt = 0;
                    epoch.0 += 1;
                    self.publish(SessionState::Open, epoch, 0, true);
                    info!(epoch = epoch.0, "Venue session open");

                    let end = run_session(
                        &self.config,
                        self.protocol.as_ref(),
                        self.dispatch.as_ref(),
                        epoch,
                        &mut self.ctrl_rx,
                        &mut self.cmd_rx,
                        reader,
                        writer,
                    )
                    .await;

                    match end {
                        SessionEnd::Shutdown => {
                            self.publish(SessionState::Closing, epoch, 0, false);
                            break;
                        }
                        SessionEnd::Lost(reason) => {
                            warn!(epoch = epoch.0, %reason, "Venue session lost");
                            reason
                        }
                    }
                }
                Err(err) => {
                    warn!(error = %err, attempt, "Failed to open venue session");
                    attempt = attempt.saturating_add(1);
                    err.to_string()
                }
            };

            let exhausted = self
                .config
                .reconnect_max_attempts
                .is_some_and(|max| attempt >= max);
            let will_reconnect = !exhausted && !self.shutdown.load(Ordering::SeqCst);

            self.publish(SessionState::Closed, epoch, attempt, will_reconnect);
            self.dispatch.on_session_lost(&reason);

            if exhausted {
                error!(attempt, "Max reconnection attempts exceeded");
                break;
            }
            if !will_reconnect {
                break;
            }

            let delay = reconnect_delay(&self.config, attempt);
            debug!(
                delay_ms = delay.as_millis(),
                attempt, "Waiting before reconnect"
            );
            if self.while_not_open(sleep(delay)).await.is_none() {
                break;
            }
        }

        let status = *self.status_tx.borrow();
        self.publish(SessionState::Closed, status.epoch, status.attempt, false);
        self.dispatch.on_session_lost("supervisor shut down");
        self.cmd_rx.close();
        while let Ok(command) = self.cmd_rx.try_recv() {
            command.reject("supervisor shut down");
        }

        info!("Venue supervisor stopped");
    }

    fn publish(&self, state: SessionState, epoch: ConnectionEpoch, attempt: u32, will_reconnect: bool) {
        self.status_tx
            .send_replace(SessionStatus::new(state, epoch, attempt, will_reconnect));
    }

    /// Drive `fut` while rejecting sends, since no session is open.
    ///
    /// Returns `None` if shutdown was requested or every handle was dropped.
    async fn while_not_open<F: Future>(&mut self, fut: F) -> Option<F::Output> {
        tokio::pin!(fut);

        loop {
            tokio::select! {
                biased;
                ctrl = self.ctrl_rx.recv() => {
                    match ctrl {
                        Some(ControlCommand::Shutdown) | None => return None,
                    }
                }
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(command) => command.reject("session not open"),
                        None => return None,
                    }
                }
                output = &mut fut => return Some(output),
            }
        }
    }
}

/// Delay before the next open, given the consecutive failed opens so far.
///
/// A lost session (`failed_opens == 0`) and the first failed open both wait
/// the initial delay; every further failure multiplies it by the backoff
/// factor up to the cap. Jitter shortens the delay by a random share of up
/// to `reconnect_jitter`.
fn reconnect_delay(config: &VenueConfig, failed_opens: u32) -> Duration {
    let steps = i32::try_from(failed_opens.saturating_sub(1)).unwrap_or(i32::MAX);
    let growth = config.reconnect_backoff_factor.powi(steps);
    let delay = (config.reconnect_initial_delay.as_secs_f64() * growth)
        .min(config.reconnect_max_delay.as_secs_f64());

    if config.reconnect_jitter == 0.0 {
        return Duration::from_secs_f64(delay);
    }
    let shave = delay * config.reconnect_jitter * rand::rng().random::<f64>();
    Duration::from_secs_f64(delay - shave)
}

/// Open a session, send the protocol's greeting and authorize if configured.
///
/// This is a free function so the future does not borrow the supervisor.
async fn establish<P: VenueProtocol>(
    config: Arc<VenueConfig>,
    protocol: Arc<P>,
    ids: Arc<IdAllocator>,
) -> VenueResult<(
    impl SessionWriter,
    impl Stream<Item = VenueResult<Message>> + Unpin,
)> {
    let (mut writer, mut reader) = open_session(&config).await?;

    for message in protocol.on_connect() {
        writer.send_frame(to_frame(&message)).await?;
    }

    if config.auth_on_connect
        && let Some(auth) = protocol.build_auth_message(ids.next())
    {
        writer.send_frame(to_frame(&auth)).await?;
        authorize(&config, protocol.as_ref(), &mut reader).await?;
        info!("Venue session authorized");
    }

    Ok((writer, reader))
}

async fn authorize<P, R>(config: &VenueConfig, protocol: &P, reader: &mut R) -> VenueResult<()>
where
    P: VenueProtocol,
    R: Stream<Item = VenueResult<Message>> + Unpin,
{
    let limit = config.connect_timeout;
    let start = Instant::now();

    loop {
        let remaining = limit.saturating_sub(start.elapsed());
        if remaining.is_zero() {
            return Err(VenueError::auth("Authorization timed out"));
        }

        match timeout(remaining, reader.next()).await {
            Ok(Some(Ok(frame))) => {
                let Some(text) = frame_text(protocol, frame) else {
                    continue;
                };
                if protocol.is_auth_success(&text) {
                    return Ok(());
                }
                if protocol.is_auth_failure(&text) {
                    return Err(VenueError::auth("Authorization rejected"));
                }
                debug!("Ignoring pre-authorization message");
            }
            Ok(Some(Err(err))) => return Err(err),
            Ok(None) => {
                return Err(VenueError::connection_lost(
                    "session closed during authorization",
                ));
            }
            Err(_) => return Err(VenueError::auth("Authorization timed out")),
        }
    }
}

/// Drive one open session until it ends.
pub(crate) async fn run_session<P, D, R, W>(
    config: &VenueConfig,
    protocol: &P,
    dispatch: &D,
    epoch: ConnectionEpoch,
    ctrl_rx: &mut mpsc::Receiver<ControlCommand>,
    cmd_rx: &mut mpsc::Receiver<Command>,
    mut reader: R,
    mut writer: W,
) -> SessionEnd
where
    P: VenueProtocol,
    D: Dispatch,
    R: Stream<Item = VenueResult<Message>> + Unpin,
    W: SessionWriter,
{
    let mut ping_interval = tokio::time::interval(config.ping_interval);
    let mut cleanup_interval = tokio::time::interval(config.cleanup_interval);
    let mut last_pong = Instant::now();

    loop {
        tokio::select! {
            biased;
            ctrl = ctrl_rx.recv() => {
                match ctrl {
                    Some(ControlCommand::Shutdown) | None => {
                        let _ = writer.close_session().await;
                        return SessionEnd::Shutdown;
                    }
                }
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(Command::Send { epoch: stamped, ack, .. }) if stamped != epoch => {
                        debug!(stamped = stamped.0, current = epoch.0, "Rejecting send from a replaced session");
                        let _ = ack.send(Err(VenueError::send_failed("session replaced since send")));
                    }
                    Some(Command::Send { message, ack, .. }) => {
                        match writer.send_frame(to_frame(&message)).await {
                            Ok(()) => {
                                let _ = ack.send(Ok(()));
                            }
                            Err(err) => {
                                let reason = format!("write failed: {err}");
                                let _ = ack.send(Err(VenueError::send_failed(reason.clone())));
                                return SessionEnd::Lost(reason);
                            }
                        }
                    }
                    None => {
                        let _ = writer.close_session().await;
                        return SessionEnd::Shutdown;
                    }
                }
            }
            frame = reader.next() => {
                match frame {
                    Some(Ok(frame)) => {
                        let size = frame_len(&frame);
                        if config.max_message_size > 0 && size > config.max_message_size {
                            warn!(
                                size,
                                max = config.max_message_size,
                                "Dropping oversized venue message"
                            );
                            continue;
                        }

                        match frame {
                            Message::Pong(_) => {
                                last_pong = Instant::now();
                            }
                            Message::Ping(data) => {
                                let _ = writer.send_frame(Message::Pong(data)).await;
                            }
                            Message::Close(_) => {
                                return SessionEnd::Lost("closed by venue".to_string());
                            }
                            Message::Frame(_) => {}
                            data => {
                                let Some(text) = frame_text(protocol, data) else {
                                    warn!("Discarding undecodable binary message");
                                    continue;
                                };
                                if protocol.is_pong_response(&text) {
                                    last_pong = Instant::now();
                                    continue;
                                }
                                dispatch.on_message(text);
                            }
                        }
                    }
                    Some(Err(err)) => {
                        warn!(error = %err, "Venue read error");
                        return SessionEnd::Lost(err.to_string());
                    }
                    None => {
                        return SessionEnd::Lost("stream ended".to_string());
                    }
                }
            }
            _ = ping_interval.tick() => {
                if config.use_websocket_ping {
                    let _ = writer.send_frame(Message::Ping(Vec::new())).await;
                } else if let Some(ping) = protocol.build_ping() {
                    let _ = writer.send_frame(to_frame(&ping)).await;
                }

                if last_pong.elapsed() > config.pong_timeout {
                    return SessionEnd::Lost("pong timeout".to_string());
                }
            }
            _ = cleanup_interval.tick() => {
                dispatch.on_tick();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use futures_util::stream;

    use super::*;
    use crate::protocol::JsonProtocol;

    const SESSION: ConnectionEpoch = ConnectionEpoch(1);

    #[derive(Default)]
    struct Recorder {
        messages: Mutex<Vec<String>>,
        lost: Mutex<Vec<String>>,
    }

    impl Dispatch for Recorder {
        fn on_message(&self, text: String) {
            self.messages.lock().expect("lock").push(text);
        }

        fn on_session_lost(&self, reason: &str) {
            self.lost.lock().expect("lock").push(reason.to_string());
        }
    }

    /// Writer that forwards frames to a channel.
    struct ChannelWriter {
        tx: mpsc::UnboundedSender<Message>,
        fail: bool,
    }

    #[async_trait]
    impl SessionWriter for ChannelWriter {
        async fn send_frame(&mut self, message: Message) -> VenueResult<()> {
            if self.fail {
                return Err(VenueError::websocket("broken pipe"));
            }
            self.tx
                .send(message)
                .map_err(|_| VenueError::websocket("writer closed"))
        }
    }

    fn test_config() -> VenueConfig {
        let mut config = VenueConfig::new("ws://test");
        config.ping_interval = Duration::from_secs(60);
        config.cleanup_interval = Duration::from_secs(60);
        config
    }

    fn channels() -> (
        mpsc::Sender<ControlCommand>,
        mpsc::Receiver<ControlCommand>,
        mpsc::Sender<Command>,
        mpsc::Receiver<Command>,
    ) {
        let (ctrl_tx, ctrl_rx) = mpsc::channel(1);
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        (ctrl_tx, ctrl_rx, cmd_tx, cmd_rx)
    }

    #[tokio::test]
    async fn session_dispatches_in_wire_order_and_reports_end() {
        let config = test_config();
        let protocol = JsonProtocol::default();
        let recorder = Recorder::default();
        let (_ctrl_tx, mut ctrl_rx, _cmd_tx, mut cmd_rx) = channels();
        let (tx, _rx) = mpsc::unbounded_channel();

        let reader = stream::iter(vec![
            Ok(Message::Text(r#"{"req_id":1}"#.to_string())),
            Ok(Message::Pong(Vec::new())),
            Ok(Message::Text(r#"{"req_id":2}"#.to_string())),
            Ok(Message::Text(r#"{"msg_type":"ping","ping":"pong"}"#.to_string())),
            Ok(Message::Binary(br#"{"req_id":3}"#.to_vec())),
        ]);
        let writer = ChannelWriter { tx, fail: false };

        let end = run_session(
            &config,
            &protocol,
            &recorder,
            SESSION,
            &mut ctrl_rx,
            &mut cmd_rx,
            reader,
            writer,
        )
        .await;

        assert_eq!(end, SessionEnd::Lost("stream ended".to_string()));
        let messages = recorder.messages.lock().expect("lock").clone();
        assert_eq!(
            messages,
            vec![
                r#"{"req_id":1}"#.to_string(),
                r#"{"req_id":2}"#.to_string(),
                r#"{"req_id":3}"#.to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn session_writes_commands_and_acks() {
        let config = test_config();
        let protocol = JsonProtocol::default();
        let recorder = Recorder::default();
        let (ctrl_tx, mut ctrl_rx, cmd_tx, mut cmd_rx) = channels();
        let (tx, mut written) = mpsc::unbounded_channel();

        let (ack, ack_rx) = oneshot::channel();
        cmd_tx
            .send(Command::Send {
                message: Outbound::text(r#"{"balance":1,"req_id":0}"#),
                epoch: SESSION,
                ack,
            })
            .await
            .expect("queue command");

        let session = tokio::spawn(async move {
            run_session(
                &config,
                &protocol,
                &recorder,
                SESSION,
                &mut ctrl_rx,
                &mut cmd_rx,
                stream::pending::<VenueResult<Message>>(),
                ChannelWriter { tx, fail: false },
            )
            .await
        });

        ack_rx.await.expect("ack").expect("write ok");
        let mut saw_request = false;
        while let Ok(frame) = written.try_recv() {
            if frame == Message::Text(r#"{"balance":1,"req_id":0}"#.to_string()) {
                saw_request = true;
            }
        }
        assert!(saw_request);

        ctrl_tx.send(ControlCommand::Shutdown).await.expect("ctrl");
        let end = timeout(Duration::from_secs(1), session)
            .await
            .expect("session should stop")
            .expect("join");
        assert_eq!(end, SessionEnd::Shutdown);
        drop(cmd_tx);
    }

    #[tokio::test]
    async fn session_rejects_send_stamped_for_a_replaced_session() {
        let config = test_config();
        let protocol = JsonProtocol::default();
        let recorder = Recorder::default();
        let (_ctrl_tx, mut ctrl_rx, cmd_tx, mut cmd_rx) = channels();
        let (tx, mut written) = mpsc::unbounded_channel();

        let (stale_ack, stale_rx) = oneshot::channel();
        cmd_tx
            .send(Command::Send {
                message: Outbound::text(r#"{"buy":1,"req_id":4}"#),
                epoch: ConnectionEpoch(SESSION.0 - 1),
                ack: stale_ack,
            })
            .await
            .expect("queue command");
        let (ack, ack_rx) = oneshot::channel();
        cmd_tx
            .send(Command::Send {
                message: Outbound::text(r#"{"time":1,"req_id":5}"#),
                epoch: SESSION,
                ack,
            })
            .await
            .expect("queue command");
        drop(cmd_tx);

        let end = timeout(
            Duration::from_secs(1),
            run_session(
                &config,
                &protocol,
                &recorder,
                SESSION,
                &mut ctrl_rx,
                &mut cmd_rx,
                stream::pending::<VenueResult<Message>>(),
                ChannelWriter { tx, fail: false },
            ),
        )
        .await
        .expect("session should stop");
        assert_eq!(end, SessionEnd::Shutdown);

        assert!(matches!(
            stale_rx.await.expect("ack"),
            Err(VenueError::SendFailed { .. })
        ));
        ack_rx.await.expect("ack").expect("write ok");

        let mut frames = Vec::new();
        while let Ok(frame) = written.try_recv() {
            frames.push(frame);
        }
        assert!(!frames.contains(&Message::Text(r#"{"buy":1,"req_id":4}"#.to_string())));
        assert!(frames.contains(&Message::Text(r#"{"time":1,"req_id":5}"#.to_string())));
    }

    #[test]
    fn reconnect_delay_grows_with_failed_opens() {
        let config = VenueConfig::new("ws://test")
            .reconnect_initial_delay(Duration::from_millis(100))
            .reconnect_max_delay(Duration::from_millis(1000))
            .reconnect_backoff_factor(2.0)
            .reconnect_jitter(0.0);

        assert_eq!(reconnect_delay(&config, 0), Duration::from_millis(100));
        assert_eq!(reconnect_delay(&config, 1), Duration::from_millis(100));
        assert_eq!(reconnect_delay(&config, 2), Duration::from_millis(200));
        assert_eq!(reconnect_delay(&config, 4), Duration::from_millis(800));
        assert_eq!(reconnect_delay(&config, 5), Duration::from_millis(1000));
        assert_eq!(reconnect_delay(&config, u32::MAX), Duration::from_millis(1000));
    }

    #[test]
    fn reconnect_jitter_only_shortens_the_delay() {
        let config = VenueConfig::new("ws://test")
            .reconnect_initial_delay(Duration::from_millis(100))
            .reconnect_max_delay(Duration::from_millis(1000))
            .reconnect_jitter(0.5);

        for failed_opens in 0..12 {
            let ceiling = VenueConfig {
                reconnect_jitter: 0.0,
                ..config.clone()
            };
            let base = reconnect_delay(&ceiling, failed_opens);
            let delay = reconnect_delay(&config, failed_opens);
            assert!(delay <= base);
            assert!(delay.as_secs_f64() >= base.as_secs_f64() / 2.0 - 1e-6);
        }
    }

    #[tokio::test]
    async fn session_write_failure_ends_session_and_fails_ack() {
        let config = test_config();
        let protocol = JsonProtocol::default();
        let recorder = Recorder::default();
        let (_ctrl_tx, mut ctrl_rx, cmd_tx, mut cmd_rx) = channels();
        let (tx, _written) = mpsc::unbounded_channel();

        let (ack, ack_rx) = oneshot::channel();
        cmd_tx
            .send(Command::Send {
                message: Outbound::text("{}"),
                epoch: SESSION,
                ack,
            })
            .await
            .expect("queue command");

        let end = run_session(
            &config,
            &protocol,
            &recorder,
            SESSION,
            &mut ctrl_rx,
            &mut cmd_rx,
            stream::pending::<VenueResult<Message>>(),
            ChannelWriter { tx, fail: true },
        )
        .await;

        assert!(matches!(end, SessionEnd::Lost(reason) if reason.contains("broken pipe")));
        assert!(matches!(
            ack_rx.await.expect("ack"),
            Err(VenueError::SendFailed { .. })
        ));
    }

    #[tokio::test]
    async fn session_answers_ping_and_drops_oversized() {
        let mut config = test_config();
        config.max_message_size = 8;
        let protocol = JsonProtocol::default();
        let recorder = Recorder::default();
        let (_ctrl_tx, mut ctrl_rx, _cmd_tx, mut cmd_rx) = channels();
        let (tx, mut written) = mpsc::unbounded_channel();

        let reader = stream::iter(vec![
            Ok(Message::Ping(b"hb".to_vec())),
            Ok(Message::Text(r#"{"req_id":123456}"#.to_string())),
            Ok(Message::Close(None)),
        ]);

        let end = run_session(
            &config,
            &protocol,
            &recorder,
            SESSION,
            &mut ctrl_rx,
            &mut cmd_rx,
            reader,
            ChannelWriter { tx, fail: false },
        )
        .await;

        assert_eq!(end, SessionEnd::Lost("closed by venue".to_string()));
        assert!(recorder.messages.lock().expect("lock").is_empty());

        let mut saw_pong = false;
        while let Ok(frame) = written.try_recv() {
            if frame == Message::Pong(b"hb".to_vec()) {
                saw_pong = true;
            }
        }
        assert!(saw_pong);
    }

    #[tokio::test]
    async fn session_read_error_is_reported() {
        let config = test_config();
        let protocol = JsonProtocol::default();
        let recorder = Recorder::default();
        let (_ctrl_tx, mut ctrl_rx, _cmd_tx, mut cmd_rx) = channels();
        let (tx, _written) = mpsc::unbounded_channel();

        let reader = stream::iter(vec![Err::<Message, _>(VenueError::websocket("reset"))]);
        let end = run_session(
            &config,
            &protocol,
            &recorder,
            SESSION,
            &mut ctrl_rx,
            &mut cmd_rx,
            reader,
            ChannelWriter { tx, fail: false },
        )
        .await;

        assert!(matches!(end, SessionEnd::Lost(reason) if reason.contains("reset")));
    }

    #[tokio::test]
    async fn session_ends_when_handles_drop() {
        let config = test_config();
        let protocol = JsonProtocol::default();
        let recorder = Recorder::default();
        let (ctrl_tx, mut ctrl_rx, cmd_tx, mut cmd_rx) = channels();
        let (tx, _written) = mpsc::unbounded_channel();
        drop(ctrl_tx);
        drop(cmd_tx);

        let end = timeout(
            Duration::from_secs(1),
            run_session(
                &config,
                &protocol,
                &recorder,
                SESSION,
                &mut ctrl_rx,
                &mut cmd_rx,
                stream::pending::<VenueResult<Message>>(),
                ChannelWriter { tx, fail: false },
            ),
        )
        .await
        .expect("session should stop");
        assert_eq!(end, SessionEnd::Shutdown);
    }

    #[test]
    fn status_helpers() {
        let open = SessionStatus::new(SessionState::Open, ConnectionEpoch(2), 0, true);
        assert!(open.is_open());
        assert!(!open.is_terminal());

        let retrying = SessionStatus::new(SessionState::Closed, ConnectionEpoch(2), 1, true);
        assert!(!retrying.is_terminal());

        let done = SessionStatus::new(SessionState::Closed, ConnectionEpoch(2), 0, false);
        assert!(done.is_terminal());
    }

    #[tokio::test]
    async fn handle_rejects_send_when_not_open() {
        let (cmd_tx, _cmd_rx) = mpsc::channel(1);
        let (ctrl_tx, _ctrl_rx) = mpsc::channel(1);
        let (_status_tx, status_rx) = watch::channel(SessionStatus::new(
            SessionState::Connecting,
            ConnectionEpoch::default(),
            0,
            true,
        ));
        let handle = SupervisorHandle {
            cmd_tx,
            ctrl_tx,
            status_rx,
            shutdown: Arc::new(AtomicBool::new(false)),
        };

        let result = handle.send_through_current(Outbound::text("{}")).await;
        assert!(matches!(result, Err(VenueError::SendFailed { .. })));

        handle.request_shutdown();
        assert!(handle.is_shutdown_requested());
    }
}
