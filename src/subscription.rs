//! Channel subscriptions
//!
//! A [`Subscription`] holds what is needed to (re)subscribe to one channel or
//! streamview and reacts to the service's answers and pushes. Listeners
//! attach through the typed `on_*` / `once_*` methods; every callback runs on
//! the subscription's own event worker.

use crate::error::{Result, RtmError};
use crate::observer::{Event, EventBus, HandlerId, DEFAULT_QUEUE_CAPACITY};
use crate::pdu::{
    Pdu, SubscribeBody, SubscribeError, SubscribeOk, SubscribeOptions, SubscriptionData,
    SubscriptionError, SubscriptionInfo, UnsubscribeBody, UnsubscribeError, UnsubscribeOk,
    ACTION_SUBSCRIBE, ACTION_UNSUBSCRIBE,
};

use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use tracing::{info, warn};

/// How a subscription behaves across resubscribes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionMode {
    /// Remember the last stream position and resubscribe from it
    pub track_position: bool,
    /// Let the service skip ahead when the client falls behind
    pub fast_forward: bool,
}

impl SubscriptionMode {
    /// Track the position; the service may fast-forward an expired one.
    pub const RELIABLE: Self = Self {
        track_position: true,
        fast_forward: true,
    };

    /// Do not track; resubscribe at the live end of the stream.
    pub const SIMPLE: Self = Self {
        track_position: false,
        fast_forward: true,
    };

    /// Track the position and never fast-forward. An expired position or a
    /// slow reader ends the subscription with an error.
    pub const ADVANCED: Self = Self {
        track_position: true,
        fast_forward: false,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Unsubscribed,
    Subscribed,
}

/// Events emitted by a [`Subscription`]
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent {
    /// One message delivered on the channel
    Data(Value),
    Subscribed(SubscribeOk),
    /// Only on a real subscribed to unsubscribed change
    Unsubscribed(UnsubscribeOk),
    /// Every position the service reported, tracked or not
    Position(String),
    /// The service fast-forwarded the subscription
    Info(SubscriptionInfo),
    SubscribeError(SubscribeError),
    UnsubscribeError(UnsubscribeError),
    /// The service dropped the subscription
    SubscriptionError(SubscriptionError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionEventKind {
    Data,
    Subscribed,
    Unsubscribed,
    Position,
    Info,
    SubscribeError,
    UnsubscribeError,
    SubscriptionError,
}

impl Event for SubscriptionEvent {
    type Kind = SubscriptionEventKind;

    fn kind(&self) -> SubscriptionEventKind {
        match self {
            SubscriptionEvent::Data(_) => SubscriptionEventKind::Data,
            SubscriptionEvent::Subscribed(_) => SubscriptionEventKind::Subscribed,
            SubscriptionEvent::Unsubscribed(_) => SubscriptionEventKind::Unsubscribed,
            SubscriptionEvent::Position(_) => SubscriptionEventKind::Position,
            SubscriptionEvent::Info(_) => SubscriptionEventKind::Info,
            SubscriptionEvent::SubscribeError(_) => SubscriptionEventKind::SubscribeError,
            SubscriptionEvent::UnsubscribeError(_) => SubscriptionEventKind::UnsubscribeError,
            SubscriptionEvent::SubscriptionError(_) => SubscriptionEventKind::SubscriptionError,
        }
    }
}

struct State {
    state: SubscriptionState,
    position: String,
    body: SubscribeBody,
}

/// One channel or streamview subscription
pub struct Subscription {
    id: String,
    mode: SubscriptionMode,
    state: Mutex<State>,
    events: EventBus<SubscriptionEvent>,
}

/// Generates a typed `on_*` / `once_*` pair for one event variant
macro_rules! listener {
    ($on:ident, $once:ident, $variant:ident, $payload:ty) => {
        pub fn $on<F>(&self, mut callback: F) -> HandlerId
        where
            F: FnMut(&$payload) + Send + 'static,
        {
            self.events.on(SubscriptionEventKind::$variant, move |event| {
                if let SubscriptionEvent::$variant(payload) = event {
                    callback(payload);
                }
            })
        }

        pub fn $once<F>(&self, mut callback: F) -> HandlerId
        where
            F: FnMut(&$payload) + Send + 'static,
        {
            self.events.once(SubscriptionEventKind::$variant, move |event| {
                if let SubscriptionEvent::$variant(payload) = event {
                    callback(payload);
                }
            })
        }
    };
}

impl Subscription {
    pub fn new(id: impl Into<String>, mode: SubscriptionMode, opts: SubscribeOptions) -> Self {
        Self::with_queue_capacity(id, mode, opts, DEFAULT_QUEUE_CAPACITY)
    }

    /// Like [`Subscription::new`] with an explicit event queue bound
    pub fn with_queue_capacity(
        id: impl Into<String>,
        mode: SubscriptionMode,
        opts: SubscribeOptions,
        capacity: usize,
    ) -> Self {
        let id = id.into();

        // A streamview is addressed by subscription id, a plain channel by name.
        let (channel, subscription_id) = match opts.filter {
            Some(ref filter) if !filter.is_empty() => (None, Some(id.clone())),
            _ => (Some(id.clone()), None),
        };

        let body = SubscribeBody {
            channel,
            force: false,
            fast_forward: mode.fast_forward,
            subscription_id,
            filter: opts.filter.filter(|f| !f.is_empty()),
            history: opts.history,
            period: opts.period,
            position: opts.position.filter(|p| !p.is_empty()),
        };

        Self {
            id,
            mode,
            state: Mutex::new(State {
                state: SubscriptionState::Unsubscribed,
                position: String::new(),
                body,
            }),
            events: EventBus::with_capacity(capacity),
        }
    }

    pub fn subscription_id(&self) -> &str {
        &self.id
    }

    pub fn mode(&self) -> SubscriptionMode {
        self.mode
    }

    pub fn state(&self) -> SubscriptionState {
        self.state.lock().state
    }

    /// Last tracked stream position
    pub fn position(&self) -> Option<String> {
        let state = self.state.lock();
        (!state.position.is_empty()).then(|| state.position.clone())
    }

    /// Build the `rtm/subscribe` request, resuming from the tracked position
    pub fn subscribe_pdu(&self) -> Result<Pdu> {
        let mut state = self.state.lock();
        if !state.position.is_empty() {
            state.body.position = Some(state.position.clone());
        }
        // Forced so a resubscribe replaces any stale server-side subscription.
        state.body.force = true;

        let body = serde_json::to_value(&state.body).map_err(RtmError::InvalidPayload)?;
        Ok(Pdu::new(ACTION_SUBSCRIBE, body))
    }

    /// Build the `rtm/unsubscribe` request
    pub fn unsubscribe_pdu(&self) -> Result<Pdu> {
        let body = serde_json::to_value(UnsubscribeBody {
            subscription_id: self.id.clone(),
        })
        .map_err(RtmError::InvalidPayload)?;
        Ok(Pdu::new(ACTION_UNSUBSCRIBE, body))
    }

    pub fn process_subscribe(&self, ok: SubscribeOk) {
        self.track_position(&ok.position);
        {
            let mut state = self.state.lock();
            state.state = SubscriptionState::Subscribed;
            state.body.position = None;
        }
        info!(subscription_id = %self.id, "Subscribed");
        self.events.fire(SubscriptionEvent::Subscribed(ok));
    }

    pub fn process_subscribe_error(&self, err: SubscribeError) {
        self.mark_unsubscribed(UnsubscribeOk::default());
        warn!(
            subscription_id = %self.id,
            error = %err.error,
            reason = %err.reason,
            "Subscribe failed"
        );
        self.events.fire(SubscriptionEvent::SubscribeError(err));
    }

    pub fn process_info(&self, info: SubscriptionInfo) {
        self.track_position(&info.position);
        warn!(
            subscription_id = %self.id,
            info = %info.info,
            reason = %info.reason,
            "Falling behind, subscription fast-forwarded"
        );
        self.events.fire(SubscriptionEvent::Info(info));
    }

    pub fn process_subscription_error(&self, err: SubscriptionError) {
        self.track_position(&err.position);
        self.mark_unsubscribed(UnsubscribeOk::default());
        warn!(
            subscription_id = %self.id,
            error = %err.error,
            reason = %err.reason,
            "Subscription error"
        );
        self.events.fire(SubscriptionEvent::SubscriptionError(err));
    }

    pub fn process_data(&self, data: SubscriptionData) {
        self.track_position(&data.position);
        for message in data.messages {
            self.events.fire(SubscriptionEvent::Data(message));
        }
    }

    pub fn process_unsubscribe(&self, ok: UnsubscribeOk) {
        self.mark_unsubscribed(ok);
    }

    pub fn process_unsubscribe_error(&self, err: UnsubscribeError) {
        warn!(
            subscription_id = %self.id,
            error = %err.error,
            reason = %err.reason,
            "Unsubscribe failed"
        );
        self.events.fire(SubscriptionEvent::UnsubscribeError(err));
    }

    /// The connection dropped; no server round-trip
    pub fn process_disconnect(&self) {
        self.mark_unsubscribed(UnsubscribeOk::default());
    }

    fn mark_unsubscribed(&self, ok: UnsubscribeOk) {
        let changed = {
            let mut state = self.state.lock();
            let changed = state.state == SubscriptionState::Subscribed;
            state.state = SubscriptionState::Unsubscribed;
            changed
        };

        if changed {
            info!(subscription_id = %self.id, "Unsubscribed");
            self.events.fire(SubscriptionEvent::Unsubscribed(ok));
        }
    }

    fn track_position(&self, position: &str) {
        if self.mode.track_position {
            self.state.lock().position = position.to_string();
        }
        self.events
            .fire(SubscriptionEvent::Position(position.to_string()));
    }

    /// Register a handler for any event kind
    pub fn on<F>(&self, kind: SubscriptionEventKind, handler: F) -> HandlerId
    where
        F: FnMut(&SubscriptionEvent) + Send + 'static,
    {
        self.events.on(kind, handler)
    }

    pub fn off(&self, kind: SubscriptionEventKind, id: HandlerId) {
        self.events.off(kind, id);
    }

    listener!(on_data, once_data, Data, Value);
    listener!(on_subscribed, once_subscribed, Subscribed, SubscribeOk);
    listener!(on_unsubscribed, once_unsubscribed, Unsubscribed, UnsubscribeOk);
    listener!(on_position, once_position, Position, String);
    listener!(on_info, once_info, Info, SubscriptionInfo);
    listener!(on_subscribe_error, once_subscribe_error, SubscribeError, SubscribeError);
    listener!(on_unsubscribe_error, once_unsubscribe_error, UnsubscribeError, UnsubscribeError);
    listener!(
        on_subscription_error,
        once_subscription_error,
        SubscriptionError,
        SubscriptionError
    );
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("state", &state.state)
            .field("position", &state.position)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::History;
    use serde_json::json;
    use std::sync::mpsc;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(2);

    fn ok(position: &str) -> SubscribeOk {
        SubscribeOk {
            position: position.to_string(),
            subscription_id: "animals".to_string(),
        }
    }

    fn data(position: &str, messages: Vec<Value>) -> SubscriptionData {
        SubscriptionData {
            subscription_id: "animals".to_string(),
            position: position.to_string(),
            messages,
        }
    }

    #[test]
    fn test_channel_subscribe_pdu() {
        let sub = Subscription::new("animals", SubscriptionMode::SIMPLE, SubscribeOptions::default());
        let pdu = sub.subscribe_pdu().unwrap();
        assert_eq!(pdu.action, "rtm/subscribe");
        assert_eq!(
            pdu.body,
            json!({"channel": "animals", "force": true, "fast_forward": true})
        );
        assert_eq!(pdu.id, None);
    }

    #[test]
    fn test_reliable_filter_subscribe_pdu_with_position() {
        let opts = SubscribeOptions {
            filter: Some("SELECT * FROM `test`".to_string()),
            history: Some(History {
                count: Some(1),
                age: Some(10),
            }),
            period: None,
            position: Some("123456789".to_string()),
        };
        let sub = Subscription::new("test", SubscriptionMode::RELIABLE, opts);
        let pdu = sub.subscribe_pdu().unwrap();
        assert_eq!(pdu.action, "rtm/subscribe");
        assert_eq!(
            pdu.body,
            json!({
                "fast_forward": true,
                "filter": "SELECT * FROM `test`",
                "force": true,
                "history": {"age": 10, "count": 1},
                "position": "123456789",
                "subscription_id": "test"
            })
        );
        assert!(pdu.body.get("channel").is_none());
    }

    #[test]
    fn test_filter_subscribe_pdu() {
        let opts = SubscribeOptions {
            filter: Some("select * from animals".to_string()),
            history: Some(History {
                count: Some(10),
                age: None,
            }),
            period: Some(5),
            position: None,
        };
        let sub = Subscription::new("zebras", SubscriptionMode::ADVANCED, opts);
        let pdu = sub.subscribe_pdu().unwrap();
        assert_eq!(
            pdu.body,
            json!({
                "subscription_id": "zebras",
                "filter": "select * from animals",
                "history": {"count": 10},
                "period": 5,
                "force": true
            })
        );
    }

    #[test]
    fn test_unsubscribe_pdu() {
        let sub = Subscription::new("animals", SubscriptionMode::SIMPLE, SubscribeOptions::default());
        let pdu = sub.unsubscribe_pdu().unwrap();
        assert_eq!(pdu.action, "rtm/unsubscribe");
        assert_eq!(pdu.body, json!({"subscription_id": "animals"}));
    }

    #[test]
    fn test_initial_position_used_once() {
        let opts = SubscribeOptions {
            position: Some("100:0".to_string()),
            ..Default::default()
        };
        let sub = Subscription::new("animals", SubscriptionMode::SIMPLE, opts);
        assert_eq!(sub.subscribe_pdu().unwrap().body["position"], json!("100:0"));

        sub.process_subscribe(ok("101:0"));
        assert!(sub.subscribe_pdu().unwrap().body.get("position").is_none());
    }

    #[test]
    fn test_reliable_tracks_position() {
        let sub = Subscription::new("animals", SubscriptionMode::RELIABLE, SubscribeOptions::default());
        sub.process_subscribe(ok("1:0"));
        sub.process_data(data("5:2", vec![json!("a")]));
        assert_eq!(sub.position().as_deref(), Some("5:2"));

        sub.process_disconnect();
        assert_eq!(sub.subscribe_pdu().unwrap().body["position"], json!("5:2"));
    }

    #[test]
    fn test_simple_does_not_track_but_reports_position() {
        let sub = Subscription::new("animals", SubscriptionMode::SIMPLE, SubscribeOptions::default());
        let (tx, rx) = mpsc::channel();
        sub.on_position(move |p| {
            let _ = tx.send(p.clone());
        });

        sub.process_data(data("7:1", vec![]));
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), "7:1");
        assert_eq!(sub.position(), None);
        assert!(sub.subscribe_pdu().unwrap().body.get("position").is_none());
    }

    #[test]
    fn test_data_delivered_in_order() {
        let sub = Subscription::new("animals", SubscriptionMode::SIMPLE, SubscribeOptions::default());
        let (tx, rx) = mpsc::channel();
        sub.on_data(move |m| {
            let _ = tx.send(m.clone());
        });

        sub.process_data(data("1", vec![json!(0), json!(1)]));
        sub.process_data(data("2", vec![json!(2)]));

        let got: Vec<_> = (0..3).map(|_| rx.recv_timeout(WAIT).unwrap()).collect();
        assert_eq!(got, vec![json!(0), json!(1), json!(2)]);
    }

    #[test]
    fn test_unsubscribed_fires_only_on_edge() {
        let sub = Subscription::new("animals", SubscriptionMode::SIMPLE, SubscribeOptions::default());
        let (tx, rx) = mpsc::channel();
        sub.on_unsubscribed(move |_| {
            let _ = tx.send(());
        });

        sub.process_disconnect();
        sub.process_subscribe(ok("1"));
        assert_eq!(sub.state(), SubscriptionState::Subscribed);
        sub.process_disconnect();
        sub.process_disconnect();
        sub.process_unsubscribe(UnsubscribeOk::default());

        assert!(rx.recv_timeout(WAIT).is_ok());
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(sub.state(), SubscriptionState::Unsubscribed);
    }

    #[test]
    fn test_subscription_error_unsubscribes() {
        let sub = Subscription::new("animals", SubscriptionMode::ADVANCED, SubscribeOptions::default());
        let (tx, rx) = mpsc::channel();
        sub.once_subscription_error(move |e| {
            let _ = tx.send(e.error.clone());
        });

        sub.process_subscribe(ok("1"));
        sub.process_subscription_error(SubscriptionError {
            error: "out_of_sync".to_string(),
            reason: "Too much traffic".to_string(),
            subscription_id: "animals".to_string(),
            position: "9:9".to_string(),
        });

        assert_eq!(rx.recv_timeout(WAIT).unwrap(), "out_of_sync");
        assert_eq!(sub.state(), SubscriptionState::Unsubscribed);
        assert_eq!(sub.position().as_deref(), Some("9:9"));
    }

    #[test]
    fn test_subscribe_error_event() {
        let sub = Subscription::new("animals", SubscriptionMode::SIMPLE, SubscribeOptions::default());
        let (tx, rx) = mpsc::channel();
        sub.on_subscribe_error(move |e| {
            let _ = tx.send(e.reason.clone());
        });

        sub.process_subscribe_error(SubscribeError {
            error: "authorization_denied".to_string(),
            reason: "Unauthorized".to_string(),
            subscription_id: "animals".to_string(),
        });

        assert_eq!(rx.recv_timeout(WAIT).unwrap(), "Unauthorized");
        assert_eq!(sub.state(), SubscriptionState::Unsubscribed);
    }

    #[test]
    fn test_info_tracks_position() {
        let sub = Subscription::new("animals", SubscriptionMode::RELIABLE, SubscribeOptions::default());
        let (tx, rx) = mpsc::channel();
        sub.on_info(move |i| {
            let _ = tx.send(i.info.clone());
        });

        sub.process_info(SubscriptionInfo {
            info: "fast_forward".to_string(),
            reason: "Subscription was fast-forwarded".to_string(),
            subscription_id: "animals".to_string(),
            position: "42:0".to_string(),
        });

        assert_eq!(rx.recv_timeout(WAIT).unwrap(), "fast_forward");
        assert_eq!(sub.position().as_deref(), Some("42:0"));
    }

    #[test]
    fn test_unsubscribe_error_keeps_state() {
        let sub = Subscription::new("animals", SubscriptionMode::SIMPLE, SubscribeOptions::default());
        let (tx, rx) = mpsc::channel();
        sub.on_unsubscribe_error(move |e| {
            let _ = tx.send(e.error.clone());
        });

        sub.process_subscribe(ok("1"));
        sub.process_unsubscribe_error(UnsubscribeError {
            error: "invalid_service".to_string(),
            ..Default::default()
        });

        assert_eq!(rx.recv_timeout(WAIT).unwrap(), "invalid_service");
        assert_eq!(sub.state(), SubscriptionState::Subscribed);
    }

    #[test]
    fn test_modes() {
        assert!(SubscriptionMode::RELIABLE.track_position && SubscriptionMode::RELIABLE.fast_forward);
        assert!(!SubscriptionMode::SIMPLE.track_position && SubscriptionMode::SIMPLE.fast_forward);
        assert!(SubscriptionMode::ADVANCED.track_position && !SubscriptionMode::ADVANCED.fast_forward);
    }
}
