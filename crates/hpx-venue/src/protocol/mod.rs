//! Venue protocol abstraction.
//!
//! The multiplexer never looks inside a payload beyond what
//! [`VenueProtocol`] tells it: the correlation id and error flag of an
//! inbound message, the server-side stream id of a push, and how to build
//! the handful of control requests (authorize, forget, ping) it issues on
//! its own. Everything else about message layouts belongs to callers.

mod json;

pub use json::{JsonProtocol, JsonProtocolConfig};
use serde_json::Value;

use crate::{
    error::{VenueError, VenueResult},
    id::CorrelationId,
    message::Outbound,
};

/// Routing facts decoded from one inbound message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Routing {
    /// Correlation id echoed by the venue.
    pub id: CorrelationId,
    /// Whether the venue flagged the message as an error.
    pub is_error: bool,
}

/// Venue-specific framing consumed by the multiplexer.
///
/// # Example
///
/// ```rust
/// use hpx_venue::{CorrelationId, Outbound, Routing, VenueProtocol};
/// use serde_json::Value;
///
/// struct EchoVenue;
///
/// impl VenueProtocol for EchoVenue {
///     fn route(&self, message: &str) -> Option<Routing> {
///         let json: Value = serde_json::from_str(message).ok()?;
///         Some(Routing {
///             id: CorrelationId(json.get("id")?.as_u64()?),
///             is_error: json.get("error").is_some(),
///         })
///     }
///
///     fn embed_correlation_id(&self, mut request: Value, id: CorrelationId) -> Value {
///         if let Value::Object(map) = &mut request {
///             map.insert("id".to_string(), id.get().into());
///         }
///         request
///     }
///
///     fn build_forget(&self, stream_id: &str, id: CorrelationId) -> Outbound {
///         Outbound::text(format!(r#"{{"forget":"{stream_id}","id":{id}}}"#))
///     }
/// }
/// ```
pub trait VenueProtocol: Send + Sync + 'static {
    // ========================
    // Routing
    // ========================

    /// Decode the correlation id and error flag of an inbound message.
    ///
    /// Returns `None` for messages that cannot be routed; the dispatcher
    /// logs and discards those.
    fn route(&self, message: &str) -> Option<Routing>;

    /// Server-side stream id carried by a subscription push.
    fn extract_stream_id(&self, message: &str) -> Option<String> {
        let _ = message;
        None
    }

    /// Decode a binary frame to text.
    fn decode_binary(&self, data: &[u8]) -> VenueResult<String> {
        String::from_utf8(data.to_vec()).map_err(Into::into)
    }

    // ========================
    // Request building
    // ========================

    /// Embed `id` into a JSON request body.
    fn embed_correlation_id(&self, request: Value, id: CorrelationId) -> Value;

    /// Serialize a request with its correlation id embedded.
    fn encode_request(&self, request: Value, id: CorrelationId) -> VenueResult<Outbound> {
        let body = self.embed_correlation_id(request, id);
        serde_json::to_string(&body)
            .map(Outbound::Text)
            .map_err(VenueError::from)
    }

    /// Build the unsubscribe request for one server-side stream.
    fn build_forget(&self, stream_id: &str, id: CorrelationId) -> Outbound;

    /// Build the bulk unsubscribe request for every stream of one kind.
    fn build_forget_all(&self, stream_kind: &str, id: CorrelationId) -> Option<Outbound> {
        let _ = (stream_kind, id);
        None
    }

    // ========================
    // Session lifecycle
    // ========================

    /// Messages to send as soon as a session opens, before authorization.
    fn on_connect(&self) -> Vec<Outbound> {
        Vec::new()
    }

    /// Authorization request sent on every open when enabled.
    fn build_auth_message(&self, id: CorrelationId) -> Option<Outbound> {
        let _ = id;
        None
    }

    /// Whether `message` confirms the authorization.
    fn is_auth_success(&self, message: &str) -> bool {
        let _ = message;
        true
    }

    /// Whether `message` rejects the authorization.
    fn is_auth_failure(&self, message: &str) -> bool {
        let _ = message;
        false
    }

    /// Application-level ping. `None` means WebSocket ping frames are used.
    fn build_ping(&self) -> Option<Outbound> {
        None
    }

    /// Whether `message` answers an application-level ping.
    fn is_pong_response(&self, message: &str) -> bool {
        let _ = message;
        false
    }
}
