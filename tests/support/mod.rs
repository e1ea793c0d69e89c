//! In-process RTM service used by the integration tests

#![allow(dead_code)]

use parking_lot::Mutex;
use rtm_client::auth::hmac_md5;
use rtm_client::transport::{MemoryDialer, MemoryListener, MemoryServerConn};
use rtm_client::{RtmClient, RtmConfig};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

pub const ROLE: &str = "publisher";
pub const SECRET: &str = "s3cr3t";
const NONCE: &str = "nonce-4242";

/// Commands delivered to a live server connection
enum Push {
    Frame(String),
    Close,
    Fail(String),
}

struct Session {
    id: u64,
    push: mpsc::UnboundedSender<Push>,
    /// subscription id -> channel
    subscriptions: HashMap<String, String>,
}

#[derive(Default)]
struct State {
    position: u64,
    kv: BTreeMap<String, (Value, String)>,
    sessions: Vec<Session>,
    next_session: u64,
    accepted: usize,
    received: Vec<Value>,
    rejected_channels: HashSet<String>,
    /// Frames sent right behind the next subscribe confirmation
    after_subscribe: Vec<Value>,
    silent: bool,
}

impl State {
    fn next_position(&mut self) -> String {
        self.position += 1;
        format!("{}:0", self.position)
    }

    fn session(&mut self, id: u64) -> Option<&mut Session> {
        self.sessions.iter_mut().find(|s| s.id == id)
    }

    fn fan_out(&mut self, channel: &str, message: &Value, position: &str) {
        for session in &self.sessions {
            for (subscription_id, subscribed) in &session.subscriptions {
                if subscribed == channel {
                    let frame = json!({
                        "action": "rtm/subscription/data",
                        "body": {
                            "subscription_id": subscription_id,
                            "position": position,
                            "messages": [message],
                        }
                    });
                    let _ = session.push.send(Push::Frame(frame.to_string()));
                }
            }
        }
    }
}

/// Mock service reachable through [`MockRtm::dialer`]
#[derive(Clone)]
pub struct MockRtm {
    pub dialer: MemoryDialer,
    state: Arc<Mutex<State>>,
    changed: Arc<Notify>,
}

impl MockRtm {
    pub fn start() -> Self {
        let (dialer, listener) = MemoryDialer::new();
        let mock = Self {
            dialer,
            state: Arc::new(Mutex::new(State::default())),
            changed: Arc::new(Notify::new()),
        };
        tokio::spawn(mock.clone().accept_loop(listener));
        mock
    }

    /// Client configuration pointing at this service, reconnecting fast
    pub fn config(&self) -> RtmConfig {
        RtmConfig::new("ws://rtm.test", "test-key")
            .dialer(Arc::new(self.dialer.clone()))
            .max_reconnect_delay(Duration::ZERO)
    }

    /// Same as [`config`](Self::config) with role/secret authentication
    pub fn auth_config(&self, secret: &str) -> RtmConfig {
        self.config()
            .auth(rtm_client::RoleSecretAuth::new(ROLE, secret))
    }

    /// Number of connections accepted so far
    pub fn accepted(&self) -> usize {
        self.state.lock().accepted
    }

    /// Number of connections currently open
    pub fn live(&self) -> usize {
        self.state.lock().sessions.len()
    }

    /// Every request frame received, in order
    pub fn received(&self) -> Vec<Value> {
        self.state.lock().received.clone()
    }

    /// Requests received with the given action
    pub fn received_action(&self, action: &str) -> Vec<Value> {
        self.received()
            .into_iter()
            .filter(|frame| frame["action"] == action)
            .collect()
    }

    /// Answer subscribes to `channel` with an error
    pub fn reject_channel(&self, channel: &str) {
        self.state.lock().rejected_channels.insert(channel.to_string());
    }

    /// Send `frame` back to back with the next subscribe confirmation
    pub fn after_subscribe(&self, frame: Value) {
        self.state.lock().after_subscribe.push(frame);
    }

    /// Stop answering requests
    pub fn set_silent(&self, silent: bool) {
        self.state.lock().silent = silent;
    }

    /// Send a raw frame to every open connection
    pub fn push(&self, frame: Value) {
        for session in &self.state.lock().sessions {
            let _ = session.push.send(Push::Frame(frame.to_string()));
        }
    }

    /// Close every open connection from the server side
    pub fn drop_connections(&self) {
        for session in &self.state.lock().sessions {
            let _ = session.push.send(Push::Close);
        }
    }

    /// Fail every open connection with a transport error
    pub fn fail_connections(&self, reason: &str) {
        for session in &self.state.lock().sessions {
            let _ = session.push.send(Push::Fail(reason.to_string()));
        }
    }

    /// Wait until `check` holds, re-evaluating on every server-side change
    pub async fn wait_for(&self, what: &str, check: impl Fn(&Self) -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let changed = self.changed.notified();
            if check(self) {
                return;
            }
            if tokio::time::timeout_at(deadline, changed).await.is_err() {
                panic!("Timed out waiting for {what}");
            }
        }
    }

    async fn accept_loop(self, mut listener: MemoryListener) {
        while let Some(conn) = listener.accept().await {
            let (push_tx, push_rx) = mpsc::unbounded_channel();
            let id = {
                let mut state = self.state.lock();
                state.accepted += 1;
                state.next_session += 1;
                let id = state.next_session;
                state.sessions.push(Session {
                    id,
                    push: push_tx,
                    subscriptions: HashMap::new(),
                });
                id
            };
            self.changed.notify_waiters();
            tokio::spawn(self.clone().serve(id, conn, push_rx));
        }
    }

    async fn serve(
        self,
        session: u64,
        mut conn: MemoryServerConn,
        mut push_rx: mpsc::UnboundedReceiver<Push>,
    ) {
        let mut nonce_sent = false;
        loop {
            tokio::select! {
                frame = conn.recv() => {
                    let Some(frame) = frame else { break };
                    let Ok(request) = serde_json::from_str::<Value>(&frame) else { continue };
                    for reply in self.handle(session, &request, &mut nonce_sent) {
                        conn.send(reply.to_string());
                    }
                    self.changed.notify_waiters();
                }
                push = push_rx.recv() => match push {
                    Some(Push::Frame(frame)) => {
                        conn.send(frame);
                    }
                    Some(Push::Close) | None => {
                        conn.close();
                        break;
                    }
                    Some(Push::Fail(reason)) => {
                        conn.fail(&reason);
                        break;
                    }
                },
            }
        }

        self.state.lock().sessions.retain(|s| s.id != session);
        self.changed.notify_waiters();
    }

    fn handle(&self, session: u64, request: &Value, nonce_sent: &mut bool) -> Vec<Value> {
        let mut state = self.state.lock();
        state.received.push(request.clone());
        if state.silent {
            return Vec::new();
        }

        let action = request["action"].as_str().unwrap_or_default().to_string();
        let body = &request["body"];
        let id = request.get("id").cloned();
        let reply = |suffix: &str, body: Value| {
            let mut frame = json!({"action": format!("{action}/{suffix}"), "body": body});
            if let Some(id) = &id {
                frame["id"] = id.clone();
            }
            frame
        };

        match action.as_str() {
            "auth/handshake" => {
                if body["data"]["role"] == ROLE {
                    *nonce_sent = true;
                    vec![reply("ok", json!({"data": {"nonce": NONCE}}))]
                } else {
                    vec![reply("error", json!({"error": "authentication_failed", "reason": "Unknown role"}))]
                }
            }
            "auth/authenticate" => {
                let expected = hmac_md5(NONCE, SECRET).unwrap_or_default();
                if *nonce_sent && body["credentials"]["hash"] == expected.as_str() {
                    vec![reply("ok", json!({}))]
                } else {
                    vec![reply("error", json!({"error": "authentication_failed", "reason": "Invalid hash"}))]
                }
            }
            "rtm/subscribe" => {
                let subscription_id = body["subscription_id"]
                    .as_str()
                    .or(body["channel"].as_str())
                    .unwrap_or_default()
                    .to_string();
                let channel = match body["filter"].as_str() {
                    Some(filter) => filter.rsplit("from ").next().unwrap_or_default().trim().to_string(),
                    None => subscription_id.clone(),
                };

                if state.rejected_channels.contains(&channel) {
                    return vec![reply(
                        "error",
                        json!({"error": "authorization_denied", "reason": "Unauthorized", "subscription_id": subscription_id}),
                    )];
                }

                let position = format!("{}:0", state.position);
                if let Some(s) = state.session(session) {
                    s.subscriptions.insert(subscription_id.clone(), channel);
                }
                let mut replies = vec![reply(
                    "ok",
                    json!({"position": position, "subscription_id": subscription_id}),
                )];
                replies.append(&mut state.after_subscribe);
                replies
            }
            "rtm/unsubscribe" => {
                let subscription_id = body["subscription_id"].as_str().unwrap_or_default().to_string();
                let position = format!("{}:0", state.position);
                let removed = state
                    .session(session)
                    .and_then(|s| s.subscriptions.remove(&subscription_id))
                    .is_some();
                if removed {
                    vec![reply("ok", json!({"position": position, "subscription_id": subscription_id}))]
                } else {
                    vec![reply(
                        "error",
                        json!({"error": "invalid_format", "reason": "Not subscribed", "subscription_id": subscription_id}),
                    )]
                }
            }
            "rtm/publish" | "rtm/write" => {
                let channel = body["channel"].as_str().unwrap_or_default().to_string();
                let message = body["message"].clone();
                let position = state.next_position();
                state.kv.insert(channel.clone(), (message.clone(), position.clone()));
                state.fan_out(&channel, &message, &position);
                if id.is_some() {
                    vec![reply("ok", json!({"position": position}))]
                } else {
                    Vec::new()
                }
            }
            "rtm/read" => {
                let channel = body["channel"].as_str().unwrap_or_default();
                match state.kv.get(channel) {
                    Some((message, position)) => {
                        vec![reply("ok", json!({"message": message, "position": position}))]
                    }
                    None => vec![reply("ok", json!({"message": null, "position": ""}))],
                }
            }
            "rtm/delete" => {
                let channel = body["channel"].as_str().unwrap_or_default().to_string();
                state.kv.remove(&channel);
                let position = state.next_position();
                vec![reply("ok", json!({"position": position}))]
            }
            "rtm/search" => {
                let prefix = body["prefix"].as_str().unwrap_or_default();
                let mut replies: Vec<Value> = state
                    .kv
                    .keys()
                    .filter(|channel| channel.starts_with(prefix))
                    .map(|channel| reply("data", json!({"channels": [channel]})))
                    .collect();
                replies.push(reply("ok", json!({"channels": []})));
                replies
            }
            _ => vec![reply(
                "error",
                json!({"error": "invalid_operation", "reason": format!("Unknown action {action}")}),
            )],
        }
    }
}

/// Start `client` and wait until it reports connected
pub async fn connect(client: &RtmClient) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    client.once_enter(rtm_client::ClientState::Connected, move || {
        let _ = tx.send(());
    });
    client.start();
    within(rx.recv()).await;
    assert!(client.is_connected());
}

/// Await `future`, failing the test after five seconds
pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out")
}

/// Poll `check` until it holds, failing after five seconds
pub async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("Timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
