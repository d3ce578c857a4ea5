//! One physical duplex connection to the venue.
//!
//! A session is opened, split into a writer and a reader, and handed to the
//! supervisor, which is the only owner of both halves. Writes are therefore
//! serialized by construction and inbound frames are consumed by exactly one
//! task in wire order.

use async_trait::async_trait;
use futures_util::{
    SinkExt, Stream, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::{net::TcpStream, time::timeout};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::debug;

use crate::{
    config::VenueConfig,
    error::{VenueError, VenueResult},
    message::Outbound,
    protocol::VenueProtocol,
};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Write half of a session.
pub type SessionSink = SplitSink<Socket, Message>;

/// Read half of a session.
pub type SessionSource = SplitStream<Socket>;

/// Anything the supervisor can write frames to.
#[async_trait]
pub trait SessionWriter: Send {
    /// Write one frame.
    async fn send_frame(&mut self, message: Message) -> VenueResult<()>;

    /// Close the write side. Errors are ignored by callers.
    async fn close_session(&mut self) -> VenueResult<()> {
        Ok(())
    }
}

#[async_trait]
impl SessionWriter for SessionSink {
    async fn send_frame(&mut self, message: Message) -> VenueResult<()> {
        self.send(message).await.map_err(VenueError::from)
    }

    async fn close_session(&mut self) -> VenueResult<()> {
        self.close().await.map_err(VenueError::from)
    }
}

/// Open a new session within `connect_timeout`.
pub async fn open_session(
    config: &VenueConfig,
) -> VenueResult<(SessionSink, impl Stream<Item = VenueResult<Message>> + Unpin + use<>)> {
    debug!(url = %config.url, "Opening venue session");

    let (socket, _response) = timeout(config.connect_timeout, connect_async(config.url.as_str()))
        .await
        .map_err(|_| {
            VenueError::websocket(format!(
                "Handshake timed out after {:?}",
                config.connect_timeout
            ))
        })??;

    let (sink, source): (SessionSink, SessionSource) = socket.split();
    Ok((sink, source.map(|frame| frame.map_err(VenueError::from))))
}

/// Convert an outbound message into a WebSocket frame.
pub(crate) fn to_frame(message: &Outbound) -> Message {
    match message {
        Outbound::Text(text) => Message::Text(text.clone()),
        Outbound::Binary(data) => Message::Binary(data.clone()),
    }
}

/// Text content of a data frame, decoding binary frames through the protocol.
pub(crate) fn frame_text<P: VenueProtocol>(protocol: &P, message: Message) -> Option<String> {
    match message {
        Message::Text(text) => Some(text),
        Message::Binary(data) => protocol.decode_binary(&data).ok(),
        _ => None,
    }
}

/// Payload size used for the inbound size limit.
pub(crate) fn frame_len(message: &Message) -> usize {
    match message {
        Message::Text(text) => text.len(),
        Message::Binary(data) => data.len(),
        _ => 0,
    }
}
