//! Events emitted by the client

use crate::error::RtmError;
use crate::observer::Event;
use crate::pdu::Pdu;

/// Lifecycle state of the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientState {
    /// Not running; initial state
    Stopped,
    /// Dialing and authenticating
    Connecting,
    /// Connected and ready for requests
    Connected,
    /// Connection lost, waiting to reconnect
    Awaiting,
}

/// Inputs of the lifecycle state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientTrigger {
    Start,
    Stop,
    Open,
    Close,
    Error,
    Reconnect,
}

/// Events emitted on the client bus
#[derive(Debug)]
pub enum ClientEvent {
    /// Entered a lifecycle state
    Enter(ClientState),
    /// About to leave a lifecycle state
    Leave(ClientState),
    Start,
    Stop,
    /// Connection established and authenticated
    Open,
    /// Connection closed by the service
    Close,
    /// Backoff elapsed, time to dial again
    Reconnect,
    /// Client-level failure; drives the client to reconnect
    Error(RtmError),
    /// Inbound frame that could not be decoded or routed
    DataError(RtmError),
    Authenticated,
    /// Every inbound frame, after routing
    Message(Pdu),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientEventKind {
    Enter(ClientState),
    Leave(ClientState),
    Start,
    Stop,
    Open,
    Close,
    Reconnect,
    Error,
    DataError,
    Authenticated,
    Message,
}

impl Event for ClientEvent {
    type Kind = ClientEventKind;

    fn kind(&self) -> ClientEventKind {
        match self {
            ClientEvent::Enter(state) => ClientEventKind::Enter(*state),
            ClientEvent::Leave(state) => ClientEventKind::Leave(*state),
            ClientEvent::Start => ClientEventKind::Start,
            ClientEvent::Stop => ClientEventKind::Stop,
            ClientEvent::Open => ClientEventKind::Open,
            ClientEvent::Close => ClientEventKind::Close,
            ClientEvent::Reconnect => ClientEventKind::Reconnect,
            ClientEvent::Error(_) => ClientEventKind::Error,
            ClientEvent::DataError(_) => ClientEventKind::DataError,
            ClientEvent::Authenticated => ClientEventKind::Authenticated,
            ClientEvent::Message(_) => ClientEventKind::Message,
        }
    }
}

impl ClientEventKind {
    /// The state machine input this event kind feeds, if any
    pub fn trigger(self) -> Option<ClientTrigger> {
        match self {
            ClientEventKind::Start => Some(ClientTrigger::Start),
            ClientEventKind::Stop => Some(ClientTrigger::Stop),
            ClientEventKind::Open => Some(ClientTrigger::Open),
            ClientEventKind::Close => Some(ClientTrigger::Close),
            ClientEventKind::Error => Some(ClientTrigger::Error),
            ClientEventKind::Reconnect => Some(ClientTrigger::Reconnect),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn test_event_kinds() {
        assert_eq!(
            ClientEvent::Enter(ClientState::Connected).kind(),
            ClientEventKind::Enter(ClientState::Connected)
        );
        assert_ne!(
            ClientEvent::Enter(ClientState::Connected).kind(),
            ClientEvent::Enter(ClientState::Awaiting).kind()
        );
        assert_eq!(
            ClientEvent::Error(RtmError::NotConnected).kind(),
            ClientEventKind::Error
        );
        assert_eq!(
            ClientEvent::Message(Pdu::new("rtm/publish/ok", Value::Null)).kind(),
            ClientEventKind::Message
        );
    }

    #[test]
    fn test_trigger_mapping() {
        assert_eq!(ClientEventKind::Start.trigger(), Some(ClientTrigger::Start));
        assert_eq!(ClientEventKind::Error.trigger(), Some(ClientTrigger::Error));
        assert_eq!(
            ClientEventKind::Reconnect.trigger(),
            Some(ClientTrigger::Reconnect)
        );
        assert_eq!(ClientEventKind::DataError.trigger(), None);
        assert_eq!(ClientEventKind::Message.trigger(), None);
        assert_eq!(
            ClientEventKind::Enter(ClientState::Stopped).trigger(),
            None
        );
    }
}
