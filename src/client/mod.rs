//! RTM client
//!
//! [`RtmClient`] owns the lifecycle state machine, the current connection and
//! the subscription registry. All state machine transitions run on the
//! client's event worker; requests are plain async calls.

mod events;
mod lifecycle;

pub use events::{ClientEvent, ClientEventKind, ClientState, ClientTrigger};
pub use lifecycle::reconnect_delay;

use crate::config::RtmConfig;
use crate::connection::{Connection, Waiter};
use crate::error::{ErrorKind, Result, RtmError};
use crate::fsm::Fsm;
use crate::observer::{EventBus, HandlerId};
use crate::pdu::{
    DeleteBody, DeleteOk, Outcome, Pdu, PublishBody, PublishOk, ReadBody, ReadOk, SearchBody,
    SearchChunk, SubscribeError, SubscribeOk, SubscribeOptions, SubscriptionData,
    SubscriptionError, SubscriptionInfo, UnsubscribeError, UnsubscribeOk, WriteBody, WriteOk,
    ACTION_DELETE, ACTION_PUBLISH, ACTION_READ, ACTION_SEARCH, ACTION_SUBSCRIBE, ACTION_SUBSCRIPTION_DATA,
    ACTION_SUBSCRIPTION_ERROR, ACTION_SUBSCRIPTION_INFO, ACTION_WRITE,
};
use crate::subscription::{Subscription, SubscriptionMode};
use crate::transport::{Dialer, WebSocketDialer};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::AtomicU32;
use std::sync::{Arc, OnceLock};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

/// Protocol version appended to endpoints that do not name one
const API_VERSION: &str = "v2";

#[derive(Default)]
struct Tasks {
    connect: Option<JoinHandle<()>>,
    retry: Option<JoinHandle<()>>,
}

impl Tasks {
    fn abort_all(&mut self) {
        if let Some(task) = self.connect.take() {
            task.abort();
        }
        if let Some(task) = self.retry.take() {
            task.abort();
        }
    }
}

/// Subscribe request waiting for its answer on `conn`
struct PendingSubscribe {
    conn: Arc<Connection>,
    sub: Arc<Subscription>,
}

/// Internal client state
struct ClientInner {
    config: RtmConfig,
    url: String,
    dialer: Arc<dyn Dialer>,
    runtime: Handle,

    // Set once right after construction; handlers need a weak self first.
    fsm: OnceLock<Fsm<ClientState, ClientTrigger>>,
    events: EventBus<ClientEvent>,

    conn: Mutex<Option<Arc<Connection>>>,
    subscriptions: Mutex<HashMap<String, Arc<Subscription>>>,
    // Request id -> subscription; resolved by the reader in wire order.
    pending_subscribes: Mutex<HashMap<String, PendingSubscribe>>,
    reconnect_count: AtomicU32,
    tasks: Mutex<Tasks>,
}

/// RTM publish/subscribe client
///
/// Cheaply cloneable; every clone drives the same connection.
#[derive(Clone)]
pub struct RtmClient {
    inner: Arc<ClientInner>,
}

impl RtmClient {
    /// Create a stopped client. Must be called inside a Tokio runtime.
    pub fn new(config: RtmConfig) -> Result<Self> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| RtmError::NoRuntime)?;
        let url = endpoint_url(&config.endpoint, &config.app_key)?;

        let dialer: Arc<dyn Dialer> = match (&config.dialer, &config.proxy) {
            (Some(dialer), _) => dialer.clone(),
            (None, Some(proxy)) => Arc::new(WebSocketDialer::with_proxy(proxy)?),
            (None, None) => Arc::new(WebSocketDialer::new()),
        };

        let inner = Arc::new(ClientInner {
            events: EventBus::with_capacity(config.event_queue_capacity),
            config,
            url,
            dialer,
            runtime,
            fsm: OnceLock::new(),
            conn: Mutex::new(None),
            subscriptions: Mutex::new(HashMap::new()),
            pending_subscribes: Mutex::new(HashMap::new()),
            reconnect_count: AtomicU32::new(0),
            tasks: Mutex::new(Tasks::default()),
        });

        let fsm = Fsm::new(
            ClientState::Stopped,
            lifecycle::state_table(Arc::downgrade(&inner)),
        )?;
        let _ = inner.fsm.set(fsm);
        lifecycle::wire_triggers(&inner);

        Ok(Self { inner })
    }

    /// Start connecting; reconnects automatically until [`stop`](Self::stop)
    pub fn start(&self) {
        self.inner.events.fire(ClientEvent::Start);
    }

    /// Close the connection and stop reconnecting
    pub fn stop(&self) {
        self.inner.events.fire(ClientEvent::Stop);
    }

    pub fn state(&self) -> ClientState {
        self.inner.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ClientState::Connected
    }

    /// Fully qualified URL the client dials, including the app key
    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// Publish without waiting for the service to acknowledge
    pub async fn publish<T: Serialize>(&self, channel: &str, message: &T) -> Result<()> {
        let body = to_body(&PublishBody {
            channel: channel.to_string(),
            message: serde_json::to_value(message).map_err(RtmError::InvalidPayload)?,
        })?;
        self.inner.send(ACTION_PUBLISH, body).await
    }

    /// Publish and wait for the service to acknowledge
    pub async fn publish_ack<T: Serialize>(&self, channel: &str, message: &T) -> Result<PublishOk> {
        let body = to_body(&PublishBody {
            channel: channel.to_string(),
            message: serde_json::to_value(message).map_err(RtmError::InvalidPayload)?,
        })?;
        let waiter = self.inner.request(ACTION_PUBLISH, body).await?;
        expect_ok(waiter.response().await?)
    }

    /// Write a value to a channel
    pub async fn write<T: Serialize>(&self, channel: &str, message: &T) -> Result<WriteOk> {
        let body = to_body(&WriteBody {
            channel: channel.to_string(),
            message: serde_json::to_value(message).map_err(RtmError::InvalidPayload)?,
        })?;
        let waiter = self.inner.request(ACTION_WRITE, body).await?;
        expect_ok(waiter.response().await?)
    }

    /// Read the latest value of a channel
    pub async fn read(&self, channel: &str) -> Result<ReadOk> {
        self.read_position(channel, None).await
    }

    /// Read the value of a channel at `position`
    pub async fn read_at(&self, channel: &str, position: &str) -> Result<ReadOk> {
        self.read_position(channel, Some(position.to_string())).await
    }

    async fn read_position(&self, channel: &str, position: Option<String>) -> Result<ReadOk> {
        let body = to_body(&ReadBody {
            channel: channel.to_string(),
            position: position.filter(|p| !p.is_empty()),
        })?;
        let waiter = self.inner.request(ACTION_READ, body).await?;
        expect_ok(waiter.response().await?)
    }

    /// Delete the value of a channel
    pub async fn delete(&self, channel: &str) -> Result<DeleteOk> {
        let body = to_body(&DeleteBody {
            channel: channel.to_string(),
        })?;
        let waiter = self.inner.request(ACTION_DELETE, body).await?;
        expect_ok(waiter.response().await?)
    }

    /// Find channels whose names start with `prefix`
    pub async fn search(&self, prefix: &str) -> Result<Vec<String>> {
        let body = to_body(&SearchBody {
            prefix: prefix.to_string(),
        })?;
        let mut waiter = self.inner.request(ACTION_SEARCH, body).await?;

        let mut channels = Vec::new();
        loop {
            let pdu = waiter.recv().await.ok_or(RtmError::ConnectionClosed)?;
            match pdu.outcome() {
                Outcome::Data => {
                    let chunk: SearchChunk = decode_body(pdu.body)?;
                    channels.extend(chunk.channels);
                }
                Outcome::Ok => {
                    let chunk: SearchChunk = decode_body(pdu.body)?;
                    channels.extend(chunk.channels);
                    return Ok(channels);
                }
                Outcome::Error | Outcome::Bad => return Err(RtmError::from_error_body(&pdu.body)),
            }
        }
    }

    /// Subscribe to a channel, or to a streamview when `opts.filter` is set.
    ///
    /// The subscription is registered immediately and (re)subscribed on every
    /// connect. Its outcome is reported through its own events.
    pub async fn subscribe(
        &self,
        subscription_id: &str,
        mode: SubscriptionMode,
        opts: SubscribeOptions,
    ) -> Result<Arc<Subscription>> {
        self.subscribe_with(subscription_id, mode, opts, |_| {}).await
    }

    /// Like [`subscribe`](Self::subscribe), running `setup` before the request
    /// is sent so no early event is missed
    pub async fn subscribe_with<F>(
        &self,
        subscription_id: &str,
        mode: SubscriptionMode,
        opts: SubscribeOptions,
        setup: F,
    ) -> Result<Arc<Subscription>>
    where
        F: FnOnce(&Subscription),
    {
        let sub = Arc::new(Subscription::with_queue_capacity(
            subscription_id,
            mode,
            opts,
            self.inner.config.event_queue_capacity,
        ));
        setup(&sub);

        let previous = self
            .inner
            .subscriptions
            .lock()
            .insert(subscription_id.to_string(), sub.clone());
        if let Some(previous) = previous {
            warn!(subscription_id = %subscription_id, "Replacing existing subscription");
            previous.process_disconnect();
        }

        if self.is_connected() {
            match self.inner.send_subscribe(&sub).await {
                Ok(()) => {}
                // Lost the connection meanwhile; the next one resubscribes.
                Err(RtmError::NotConnected) => {
                    debug!(subscription_id = %subscription_id, "Not connected, subscribe deferred");
                }
                Err(e) => {
                    self.inner.remove_subscription(&sub);
                    return Err(e);
                }
            }
        }

        Ok(sub)
    }

    /// Unsubscribe and forget the subscription
    pub async fn unsubscribe(&self, subscription_id: &str) -> Result<UnsubscribeOk> {
        let sub = self.get_subscription(subscription_id)?;
        let pdu = sub.unsubscribe_pdu()?;
        let waiter = self.inner.request(&pdu.action, pdu.body).await?;
        let response = waiter.response().await?;

        match response.outcome() {
            Outcome::Ok => {
                let ok: UnsubscribeOk = decode_body(response.body)?;
                sub.process_unsubscribe(ok.clone());
                self.inner.remove_subscription(&sub);
                Ok(ok)
            }
            _ => {
                let err = RtmError::from_error_body(&response.body);
                sub.process_unsubscribe_error(decode_lenient::<UnsubscribeError>(response.body));
                Err(err)
            }
        }
    }

    pub fn get_subscription(&self, subscription_id: &str) -> Result<Arc<Subscription>> {
        self.inner.get_subscription(subscription_id)
    }

    /// Ids of every registered subscription
    pub fn subscription_ids(&self) -> Vec<String> {
        self.inner.subscriptions.lock().keys().cloned().collect()
    }

    /// Register a handler for any client event kind
    pub fn on<F>(&self, kind: ClientEventKind, handler: F) -> HandlerId
    where
        F: FnMut(&ClientEvent) + Send + 'static,
    {
        self.inner.events.on(kind, handler)
    }

    pub fn once<F>(&self, kind: ClientEventKind, handler: F) -> HandlerId
    where
        F: FnMut(&ClientEvent) + Send + 'static,
    {
        self.inner.events.once(kind, handler)
    }

    pub fn off(&self, kind: ClientEventKind, id: HandlerId) {
        self.inner.events.off(kind, id);
    }

    /// Called each time the client enters `state`
    pub fn on_enter<F>(&self, state: ClientState, mut callback: F) -> HandlerId
    where
        F: FnMut() + Send + 'static,
    {
        self.on(ClientEventKind::Enter(state), move |_| callback())
    }

    pub fn once_enter<F>(&self, state: ClientState, mut callback: F) -> HandlerId
    where
        F: FnMut() + Send + 'static,
    {
        self.once(ClientEventKind::Enter(state), move |_| callback())
    }

    /// Called each time the client leaves `state`
    pub fn on_leave<F>(&self, state: ClientState, mut callback: F) -> HandlerId
    where
        F: FnMut() + Send + 'static,
    {
        self.on(ClientEventKind::Leave(state), move |_| callback())
    }

    pub fn on_error<F>(&self, mut callback: F) -> HandlerId
    where
        F: FnMut(&RtmError) + Send + 'static,
    {
        self.on(ClientEventKind::Error, move |event| {
            if let ClientEvent::Error(e) = event {
                callback(e);
            }
        })
    }

    pub fn once_error<F>(&self, mut callback: F) -> HandlerId
    where
        F: FnMut(&RtmError) + Send + 'static,
    {
        self.once(ClientEventKind::Error, move |event| {
            if let ClientEvent::Error(e) = event {
                callback(e);
            }
        })
    }

    pub fn on_data_error<F>(&self, mut callback: F) -> HandlerId
    where
        F: FnMut(&RtmError) + Send + 'static,
    {
        self.on(ClientEventKind::DataError, move |event| {
            if let ClientEvent::DataError(e) = event {
                callback(e);
            }
        })
    }

    pub fn on_authenticated<F>(&self, mut callback: F) -> HandlerId
    where
        F: FnMut() + Send + 'static,
    {
        self.on(ClientEventKind::Authenticated, move |_| callback())
    }

    pub fn once_authenticated<F>(&self, mut callback: F) -> HandlerId
    where
        F: FnMut() + Send + 'static,
    {
        self.once(ClientEventKind::Authenticated, move |_| callback())
    }

    /// Called for every inbound frame
    pub fn on_message<F>(&self, mut callback: F) -> HandlerId
    where
        F: FnMut(&Pdu) + Send + 'static,
    {
        self.on(ClientEventKind::Message, move |event| {
            if let ClientEvent::Message(pdu) = event {
                callback(pdu);
            }
        })
    }
}

impl std::fmt::Debug for RtmClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtmClient")
            .field("endpoint", &self.inner.config.endpoint)
            .field("state", &self.state())
            .finish()
    }
}

impl ClientInner {
    fn state(&self) -> ClientState {
        self.fsm
            .get()
            .map(Fsm::current_state)
            .unwrap_or(ClientState::Stopped)
    }

    /// Feed the state machine. Triggers the current state ignores are dropped.
    fn trigger(&self, trigger: ClientTrigger) {
        let Some(fsm) = self.fsm.get() else {
            return;
        };
        if fsm.event(trigger).is_err() {
            debug!(trigger = ?trigger, state = ?fsm.current_state(), "Trigger ignored");
        }
    }

    /// The live connection, if the client is connected
    fn connection(&self) -> Result<Arc<Connection>> {
        if self.state() != ClientState::Connected {
            return Err(RtmError::NotConnected);
        }
        self.conn.lock().clone().ok_or(RtmError::NotConnected)
    }

    /// Whether `conn` is the connection currently installed
    fn is_current(&self, conn: &Arc<Connection>) -> bool {
        self.conn
            .lock()
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, conn))
    }

    async fn send(&self, action: &str, body: Value) -> Result<()> {
        let conn = self.connection()?;
        conn.send(action, body)
            .await
            .map_err(|e| self.send_failed(e))
    }

    async fn request(&self, action: &str, body: Value) -> Result<Waiter> {
        let conn = self.connection()?;
        conn.send_ack(action, body)
            .await
            .map_err(|e| self.send_failed(e))
    }

    /// A failed write means the connection is gone; let the lifecycle react.
    fn send_failed(&self, e: RtmError) -> RtmError {
        if e.kind() == ErrorKind::Transport {
            warn!(error = %e, "Send failed");
            self.events
                .fire(ClientEvent::Error(RtmError::Transport(e.to_string())));
        }
        e
    }

    fn get_subscription(&self, subscription_id: &str) -> Result<Arc<Subscription>> {
        self.subscriptions
            .lock()
            .get(subscription_id)
            .cloned()
            .ok_or_else(|| RtmError::SubscriptionNotFound(subscription_id.to_string()))
    }

    /// Drop `sub` from the registry unless it was already replaced
    fn remove_subscription(&self, sub: &Arc<Subscription>) {
        let mut subscriptions = self.subscriptions.lock();
        if let Some(current) = subscriptions.get(sub.subscription_id()) {
            if Arc::ptr_eq(current, sub) {
                subscriptions.remove(sub.subscription_id());
            }
        }
    }

    /// Send `sub`'s subscribe request. The reader resolves the answer in
    /// order with the data frames that follow it.
    async fn send_subscribe(&self, sub: &Arc<Subscription>) -> Result<()> {
        let pdu = sub.subscribe_pdu()?;
        let conn = self.connection()?;

        let id = conn.next_id();
        self.pending_subscribes.lock().insert(
            id.clone(),
            PendingSubscribe {
                conn: conn.clone(),
                sub: sub.clone(),
            },
        );

        if let Err(e) = conn.send_with_id(&id, &pdu.action, pdu.body).await {
            self.pending_subscribes.lock().remove(&id);
            return Err(self.send_failed(e));
        }
        Ok(())
    }

    /// Subscribe requests still unanswered when their connection went away
    fn clear_pending_subscribes(&self) {
        self.pending_subscribes.lock().clear();
    }

    /// Route an inbound frame, then publish it as a message event
    fn handle_message(&self, conn: &Arc<Connection>, pdu: Pdu) {
        if let Err(e) = self.route(conn, &pdu) {
            warn!(error = %e, action = %pdu.action, "Failed to route frame");
            self.events.fire(ClientEvent::DataError(e));
        }
        self.events.fire(ClientEvent::Message(pdu));
    }

    fn route(&self, conn: &Arc<Connection>, pdu: &Pdu) -> Result<()> {
        match pdu.action.as_str() {
            ACTION_SUBSCRIPTION_DATA => {
                let data: SubscriptionData = decode_push(&pdu.body)?;
                self.routed(&data.subscription_id)?.process_data(data);
            }
            ACTION_SUBSCRIPTION_INFO => {
                let info: SubscriptionInfo = decode_push(&pdu.body)?;
                self.routed(&info.subscription_id)?.process_info(info);
            }
            ACTION_SUBSCRIPTION_ERROR => {
                let err: SubscriptionError = decode_push(&pdu.body)?;
                self.routed(&err.subscription_id)?.process_subscription_error(err);
            }
            action if response_to(action) == Some(ACTION_SUBSCRIBE) => {
                self.resolve_subscribe(conn, pdu)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn resolve_subscribe(&self, conn: &Arc<Connection>, pdu: &Pdu) -> Result<()> {
        let Some(id) = pdu.correlation_id() else {
            return Ok(());
        };
        let pending = {
            let mut pending = self.pending_subscribes.lock();
            let ours = pending
                .get(id)
                .is_some_and(|p| Arc::ptr_eq(&p.conn, conn));
            if ours {
                pending.remove(id)
            } else {
                None
            }
        };
        let Some(PendingSubscribe { sub, .. }) = pending else {
            debug!(id = %id, "Subscribe response without a pending request");
            return Ok(());
        };

        match pdu.outcome() {
            Outcome::Ok => sub.process_subscribe(decode_body::<SubscribeOk>(pdu.body.clone())?),
            Outcome::Error => {
                sub.process_subscribe_error(decode_lenient::<SubscribeError>(pdu.body.clone()));
                self.remove_subscription(&sub);
            }
            _ => {
                return Err(RtmError::Pdu(format!(
                    "Unexpected subscribe response: {}",
                    pdu.action
                )))
            }
        }
        Ok(())
    }

    fn routed(&self, subscription_id: &str) -> Result<Arc<Subscription>> {
        self.get_subscription(subscription_id)
            .map_err(|_| RtmError::Pdu(format!("Unknown subscription: {subscription_id}")))
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.get_mut().take() {
            conn.close();
        }
        self.tasks.get_mut().abort_all();
    }
}

/// Build the URL to dial: `<endpoint>/v2?appkey=<key>`.
///
/// Endpoints that already end in a version segment are used as given.
fn endpoint_url(endpoint: &str, app_key: &str) -> Result<String> {
    let last_segment = endpoint.rsplit('/').next().unwrap_or_default();
    let has_version = last_segment.len() > 1
        && last_segment.starts_with('v')
        && last_segment[1..].chars().all(|c| c.is_ascii_digit());

    let versioned = if has_version {
        warn!(
            endpoint = %endpoint,
            "Specifying the protocol version in the endpoint is deprecated, remove '/{last_segment}'"
        );
        endpoint.to_string()
    } else if endpoint.ends_with('/') {
        format!("{endpoint}{API_VERSION}")
    } else {
        format!("{endpoint}/{API_VERSION}")
    };

    let mut url = Url::parse(&versioned).map_err(|e| RtmError::InvalidEndpoint(e.to_string()))?;
    url.query_pairs_mut().append_pair("appkey", app_key);
    Ok(url.into())
}

/// Request action a response action answers, `rtm/subscribe/ok` -> `rtm/subscribe`
fn response_to(action: &str) -> Option<&str> {
    action.rsplit_once('/').map(|(request, _)| request)
}

fn to_body<T: Serialize>(body: &T) -> Result<Value> {
    serde_json::to_value(body).map_err(RtmError::InvalidPayload)
}

/// Decode a response body; a missing body reads as an empty object
fn decode_body<T: DeserializeOwned>(body: Value) -> Result<T> {
    let body = if body.is_null() {
        Value::Object(Default::default())
    } else {
        body
    };
    serde_json::from_value(body).map_err(|e| RtmError::Pdu(e.to_string()))
}

/// Decode an error body, falling back to defaults for missing fields
fn decode_lenient<T: DeserializeOwned + Default>(body: Value) -> T {
    decode_body(body).unwrap_or_default()
}

fn decode_push<T: DeserializeOwned>(body: &Value) -> Result<T> {
    serde_json::from_value(body.clone()).map_err(|e| RtmError::Pdu(e.to_string()))
}

/// Decode an OK response or turn an error response into [`RtmError::Response`]
fn expect_ok<T: DeserializeOwned>(pdu: Pdu) -> Result<T> {
    match pdu.outcome() {
        Outcome::Ok => decode_body(pdu.body),
        _ => Err(RtmError::from_error_body(&pdu.body)),
    }
}
