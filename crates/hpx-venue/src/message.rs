//! Outbound frames and delivered replies.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::{
    error::{VenueError, VenueResult},
    id::CorrelationId,
};

/// Message handed to the supervisor for writing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    /// Text frame.
    Text(String),
    /// Binary frame.
    Binary(Vec<u8>),
}

impl Outbound {
    /// Create a text frame.
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }

    /// Create a binary frame.
    pub fn binary(data: impl Into<Vec<u8>>) -> Self {
        Self::Binary(data.into())
    }

    /// Get as text if this is a text frame.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            Self::Binary(_) => None,
        }
    }

    /// Get as bytes regardless of frame type.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(s) => s.as_bytes(),
            Self::Binary(b) => b,
        }
    }

    /// Size of the payload in bytes.
    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

impl From<Bytes> for Outbound {
    fn from(bytes: Bytes) -> Self {
        match String::from_utf8(bytes.to_vec()) {
            Ok(text) => Self::Text(text),
            Err(err) => Self::Binary(err.into_bytes()),
        }
    }
}

impl From<String> for Outbound {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

/// An inbound message routed to one correlation id.
///
/// Only the id and the venue's error flag are decoded on the dispatch path;
/// the body is kept byte-for-byte for downstream decoders.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reply {
    id: CorrelationId,
    is_error: bool,
    body: Bytes,
}

impl Reply {
    /// Wrap a raw body routed to `id`.
    pub fn new(id: CorrelationId, is_error: bool, body: impl Into<Bytes>) -> Self {
        Self {
            id,
            is_error,
            body: body.into(),
        }
    }

    /// Correlation id this reply was routed to.
    pub fn id(&self) -> CorrelationId {
        self.id
    }

    /// Whether the venue flagged this reply as an error.
    pub fn is_error(&self) -> bool {
        self.is_error
    }

    /// Raw body as received.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Consume the reply and keep only the body.
    pub fn into_body(self) -> Bytes {
        self.body
    }

    /// Body as UTF-8 text, when it is valid UTF-8.
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    /// Decode the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> VenueResult<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// The venue's `error.message`, if the body carries one.
    pub fn error_message(&self) -> Option<String> {
        let value: Value = serde_json::from_slice(&self.body).ok()?;
        let message = value.get("error")?.get("message")?.as_str()?;
        Some(message.to_string())
    }

    /// The venue's `error.code`, if the body carries one.
    pub fn error_code(&self) -> Option<String> {
        let value: Value = serde_json::from_slice(&self.body).ok()?;
        let code = value.get("error")?.get("code")?.as_str()?;
        Some(code.to_string())
    }

    /// Turn a flagged reply into [`VenueError::Rejected`].
    pub fn into_result(self) -> VenueResult<Self> {
        if !self.is_error {
            return Ok(self);
        }
        Err(VenueError::Rejected {
            id: self.id,
            code: self.error_code(),
            message: self
                .error_message()
                .unwrap_or_else(|| "unspecified venue error".to_string()),
        })
    }
}
