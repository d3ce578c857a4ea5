//! JSON venue protocol with an integer `req_id` correlation field.
//!
//! Matches venues where every request carries `"req_id": <n>`, every reply
//! echoes it, failures carry an `"error": {"code", "message"}` object and
//! subscription pushes name their stream under `"subscription": {"id"}`.

use serde_json::{Map, Value, json};

use super::{Routing, VenueProtocol};
use crate::{id::CorrelationId, message::Outbound};

/// Field names and operations used by [`JsonProtocol`].
#[derive(Clone, Debug)]
pub struct JsonProtocolConfig {
    /// Correlation id field (e.g., "req_id", "id").
    pub request_id_field: String,
    /// Field whose presence flags an error reply.
    pub error_field: String,
    /// Object holding the stream id on pushes.
    pub subscription_field: String,
    /// Key of the stream id inside `subscription_field`.
    pub stream_id_field: String,
    /// Message type discriminator field.
    pub msg_type_field: String,
    /// Unsubscribe-one operation.
    pub forget_op: String,
    /// Unsubscribe-all operation.
    pub forget_all_op: String,
    /// Authorization operation.
    pub authorize_op: String,
    /// Application ping operation (None uses WebSocket-level ping).
    pub ping_op: Option<String>,
    /// API token sent with the authorization request.
    pub api_token: Option<String>,
}

impl Default for JsonProtocolConfig {
    fn default() -> Self {
        Self {
            request_id_field: "req_id".to_string(),
            error_field: "error".to_string(),
            subscription_field: "subscription".to_string(),
            stream_id_field: "id".to_string(),
            msg_type_field: "msg_type".to_string(),
            forget_op: "forget".to_string(),
            forget_all_op: "forget_all".to_string(),
            authorize_op: "authorize".to_string(),
            ping_op: Some("ping".to_string()),
            api_token: None,
        }
    }
}

impl JsonProtocolConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the correlation id field name.
    #[must_use]
    pub fn request_id_field(mut self, field: impl Into<String>) -> Self {
        self.request_id_field = field.into();
        self
    }

    /// Set the error field name.
    #[must_use]
    pub fn error_field(mut self, field: impl Into<String>) -> Self {
        self.error_field = field.into();
        self
    }

    /// Set the API token used for authorization.
    #[must_use]
    pub fn api_token(mut self, token: impl Into<String>) -> Self {
        self.api_token = Some(token.into());
        self
    }

    /// Set the ping operation (None to use WebSocket-level ping).
    #[must_use]
    pub fn ping_op(mut self, op: Option<String>) -> Self {
        self.ping_op = op;
        self
    }
}

/// Ready-made [`VenueProtocol`] for `req_id`-style JSON venues.
///
/// # Example
///
/// ```rust
/// use hpx_venue::{CorrelationId, JsonProtocol, JsonProtocolConfig, VenueProtocol};
///
/// let protocol = JsonProtocol::new(JsonProtocolConfig::new().api_token("secret"));
/// let routing = protocol
///     .route(r#"{"msg_type":"balance","balance":{"balance":10},"req_id":4}"#)
///     .expect("routable");
/// assert_eq!(routing.id, CorrelationId(4));
/// assert!(!routing.is_error);
/// ```
#[derive(Clone, Debug, Default)]
pub struct JsonProtocol {
    config: JsonProtocolConfig,
}

impl JsonProtocol {
    /// Create a protocol with the given configuration.
    pub fn new(config: JsonProtocolConfig) -> Self {
        Self { config }
    }

    /// Access the configuration.
    pub fn config(&self) -> &JsonProtocolConfig {
        &self.config
    }

    fn parse_json(&self, message: &str) -> Option<Value> {
        serde_json::from_str(message).ok()
    }

    fn msg_type<'a>(&self, json: &'a Value) -> Option<&'a str> {
        json.get(&self.config.msg_type_field)
            .and_then(Value::as_str)
    }

    fn request(&self, op: &str, arg: Value, id: CorrelationId) -> Outbound {
        let mut map = Map::new();
        map.insert(op.to_string(), arg);
        map.insert(self.config.request_id_field.clone(), id.get().into());
        Outbound::text(Value::Object(map).to_string())
    }
}

impl VenueProtocol for JsonProtocol {
    fn route(&self, message: &str) -> Option<Routing> {
        let json = self.parse_json(message)?;
        let id = match json.get(&self.config.request_id_field)? {
            Value::Number(n) => n.as_u64()?,
            Value::String(s) => s.parse().ok()?,
            _ => return None,
        };

        Some(Routing {
            id: CorrelationId(id),
            is_error: json.get(&self.config.error_field).is_some(),
        })
    }

    fn extract_stream_id(&self, message: &str) -> Option<String> {
        let json = self.parse_json(message)?;
        match json
            .get(&self.config.subscription_field)?
            .get(&self.config.stream_id_field)?
        {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    fn embed_correlation_id(&self, mut request: Value, id: CorrelationId) -> Value {
        if let Value::Object(map) = &mut request {
            map.insert(self.config.request_id_field.clone(), id.get().into());
        }
        request
    }

    fn build_forget(&self, stream_id: &str, id: CorrelationId) -> Outbound {
        self.request(&self.config.forget_op, Value::from(stream_id), id)
    }

    fn build_forget_all(&self, stream_kind: &str, id: CorrelationId) -> Option<Outbound> {
        Some(self.request(&self.config.forget_all_op, Value::from(stream_kind), id))
    }

    fn build_auth_message(&self, id: CorrelationId) -> Option<Outbound> {
        let token = self.config.api_token.as_ref()?;
        Some(self.request(&self.config.authorize_op, Value::from(token.as_str()), id))
    }

    fn is_auth_success(&self, message: &str) -> bool {
        let Some(json) = self.parse_json(message) else {
            return false;
        };
        json.get(&self.config.authorize_op).is_some()
            && json.get(&self.config.error_field).is_none()
    }

    fn is_auth_failure(&self, message: &str) -> bool {
        let Some(json) = self.parse_json(message) else {
            return false;
        };
        self.msg_type(&json) == Some(self.config.authorize_op.as_str())
            && json.get(&self.config.error_field).is_some()
    }

    fn build_ping(&self) -> Option<Outbound> {
        self.config
            .ping_op
            .as_ref()
            .map(|op| Outbound::text(json!({ op.clone(): 1 }).to_string()))
    }

    fn is_pong_response(&self, message: &str) -> bool {
        let Some(ping_op) = &self.config.ping_op else {
            return false;
        };
        let Some(json) = self.parse_json(message) else {
            return false;
        };
        self.msg_type(&json) == Some(ping_op.as_str())
            && json.get(&self.config.request_id_field).is_none()
    }
}
