//! Error types for the RTM client

use crate::fsm::FsmError;
use thiserror::Error;

/// Broad classification of an [`RtmError`].
///
/// Handlers of the client `error` event usually only care which layer
/// failed, not the exact variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Misuse of the API or an error response from the service
    Application,
    /// Socket dial, read or write failure
    Transport,
    /// Malformed or unroutable inbound frame
    Pdu,
    /// Caller-supplied message could not be serialized
    InvalidPayload,
    /// Handshake or authenticate round-trip failed
    Authentication,
}

/// Errors that can occur when using the RTM client
#[derive(Error, Debug)]
pub enum RtmError {
    /// Client created without an endpoint
    #[error("Endpoint is empty")]
    EmptyEndpoint,

    /// Client created without an application key
    #[error("App key is empty")]
    EmptyAppKey,

    /// Endpoint could not be parsed
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Client created outside a Tokio runtime
    #[error("No Tokio runtime available")]
    NoRuntime,

    /// Lifecycle state machine misconfigured
    #[error("State machine error: {0}")]
    Fsm(#[from] FsmError),

    /// Operation requires the client to be connected
    #[error("Not connected")]
    NotConnected,

    /// No subscription registered under the given id
    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),

    /// The service answered with an error PDU
    #[error("{error}: {reason}")]
    Response { error: String, reason: String },

    /// Socket-level failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// The connection was closed before a response arrived
    #[error("Connection closed")]
    ConnectionClosed,

    /// Inbound frame could not be decoded or routed
    #[error("PDU error: {0}")]
    Pdu(String),

    /// Outbound message could not be serialized
    #[error("Invalid payload: {0}")]
    InvalidPayload(#[source] serde_json::Error),

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    Authentication(String),
}

impl RtmError {
    /// Layer this error belongs to
    pub fn kind(&self) -> ErrorKind {
        match self {
            RtmError::EmptyEndpoint
            | RtmError::EmptyAppKey
            | RtmError::InvalidEndpoint(_)
            | RtmError::NoRuntime
            | RtmError::Fsm(_)
            | RtmError::NotConnected
            | RtmError::SubscriptionNotFound(_)
            | RtmError::Response { .. } => ErrorKind::Application,
            RtmError::Transport(_) | RtmError::ConnectionClosed => ErrorKind::Transport,
            RtmError::Pdu(_) => ErrorKind::Pdu,
            RtmError::InvalidPayload(_) => ErrorKind::InvalidPayload,
            RtmError::Authentication(_) => ErrorKind::Authentication,
        }
    }

    /// Build a [`RtmError::Response`] from an error PDU body.
    ///
    /// Bodies that do not carry `error`/`reason` are kept verbatim as the reason.
    pub(crate) fn from_error_body(body: &serde_json::Value) -> Self {
        let field = |name: &str| body.get(name).and_then(|v| v.as_str()).map(str::to_owned);
        match (field("error"), field("reason")) {
            (Some(error), reason) => RtmError::Response {
                error,
                reason: reason.unwrap_or_default(),
            },
            (None, _) => RtmError::Response {
                error: "error".to_string(),
                reason: body.to_string(),
            },
        }
    }
}

/// Result type for RTM operations
pub type Result<T> = std::result::Result<T, RtmError>;
