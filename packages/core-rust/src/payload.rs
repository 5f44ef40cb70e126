//! Deferred JSON rendering of request payloads.
//!
//! [`wrap`] hands back a [`JsonPayload`] that only serializes when it is
//! formatted. Attached to a `tracing` event as a `%` field, the serializer
//! runs only if a subscriber actually records the event; filtered events
//! never pay for it.

use std::fmt;

use serde::Serialize;

use crate::context::split_method;
use crate::message::RpcMessage;

/// Failure to render a payload as JSON.
#[derive(Debug, thiserror::Error)]
pub enum MarshalError {
    #[error("json serializer failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// A message that can be rendered as JSON for logging.
pub trait Payload {
    /// Serializes the message.
    ///
    /// # Errors
    ///
    /// Returns [`MarshalError`] if the message cannot be represented as JSON.
    fn marshal_json(&self) -> Result<String, MarshalError>;
}

impl<T: Serialize + ?Sized> Payload for T {
    fn marshal_json(&self) -> Result<String, MarshalError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Lazily serialized view of a payload.
#[derive(Clone, Copy)]
pub struct JsonPayload<'a> {
    message: &'a dyn Payload,
}

/// Wraps `message` for deferred serialization.
#[must_use]
pub fn wrap(message: &dyn Payload) -> JsonPayload<'_> {
    JsonPayload { message }
}

impl JsonPayload<'_> {
    /// Serializes now.
    ///
    /// # Errors
    ///
    /// Propagates the underlying [`MarshalError`].
    pub fn marshal(&self) -> Result<String, MarshalError> {
        self.message.marshal_json()
    }
}

impl fmt::Display for JsonPayload<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message.marshal_json() {
            Ok(json) => f.write_str(&json),
            // The failure is described in place; logging never fails the call.
            Err(err) => write!(f, "{}", serde_json::json!({ "error": err.to_string() })),
        }
    }
}

impl fmt::Debug for JsonPayload<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Client-side counterpart of the server's "Request received" line, emitted
/// before an outgoing call is sent. Nothing is logged when `log_payload` is
/// off; opaque messages are logged without content.
pub fn log_request_sent(full_method: &'static str, message: &dyn RpcMessage, log_payload: bool) {
    if !log_payload {
        return;
    }
    let (service, method) = split_method(full_method);
    match message.payload() {
        Some(content) => tracing::debug!(
            grpc.service = service,
            grpc.method = method,
            system = "grpc",
            span.kind = "client",
            grpc.request.content = %wrap(content),
            "Request sent"
        ),
        None => tracing::debug!(
            grpc.service = service,
            grpc.method = method,
            system = "grpc",
            span.kind = "client",
            "Request sent"
        ),
    }
}
