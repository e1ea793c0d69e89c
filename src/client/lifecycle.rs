//! Connection lifecycle
//!
//! ```text
//!   Stopped --start--> Connecting --open--> Connected
//!      ^                 |    ^                |
//!      |          error/close  reconnect   error/close
//!      |                 v    |                |
//!      +------stop---- Awaiting <--------------+
//! ```
//!
//! `stop` is accepted from every state but `Stopped`. Every transition runs on
//! the client's event worker, so state handlers never race each other.

use super::{ClientEvent, ClientInner, ClientState, ClientTrigger};
use crate::connection::Connection;
use crate::error::{Result, RtmError};
use crate::fsm::{Fsm, StateTable, Trigger};

use rand::Rng;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};

type ClientFsm = Fsm<ClientState, ClientTrigger>;

/// Delay before reconnect attempt number `count + 1`: `count²` seconds capped
/// at `max`, plus up to 100ms of jitter
pub fn reconnect_delay(count: u32, max: Duration) -> Duration {
    let secs = u64::from(count)
        .saturating_mul(u64::from(count))
        .min(max.as_secs());
    let jitter = rand::thread_rng().gen_range(0..100);
    Duration::from_secs(secs) + Duration::from_millis(jitter)
}

pub(super) fn state_table(client: Weak<ClientInner>) -> StateTable<ClientState, ClientTrigger> {
    use ClientState::*;

    StateTable::new()
        .on(Stopped, Trigger::Enter, act(&client, ClientInner::enter_stopped))
        .on(Stopped, Trigger::Leave, leave(&client, Stopped))
        .on(Stopped, Trigger::On(ClientTrigger::Start), goto(Connecting))
        .on(Connecting, Trigger::Enter, act(&client, ClientInner::enter_connecting))
        .on(Connecting, Trigger::Leave, leave(&client, Connecting))
        .on(Connecting, Trigger::On(ClientTrigger::Open), goto(Connected))
        .on(Connecting, Trigger::On(ClientTrigger::Error), goto(Awaiting))
        .on(Connecting, Trigger::On(ClientTrigger::Close), goto(Awaiting))
        .on(Connecting, Trigger::On(ClientTrigger::Stop), goto(Stopped))
        .on(Connected, Trigger::Enter, act(&client, ClientInner::enter_connected))
        .on(Connected, Trigger::Leave, act(&client, ClientInner::leave_connected))
        .on(Connected, Trigger::On(ClientTrigger::Close), goto(Awaiting))
        .on(Connected, Trigger::On(ClientTrigger::Error), goto(Awaiting))
        .on(Connected, Trigger::On(ClientTrigger::Stop), goto(Stopped))
        .on(Awaiting, Trigger::Enter, act(&client, ClientInner::enter_awaiting))
        .on(Awaiting, Trigger::Leave, leave(&client, Awaiting))
        .on(Awaiting, Trigger::On(ClientTrigger::Reconnect), goto(Connecting))
        .on(Awaiting, Trigger::On(ClientTrigger::Stop), goto(Stopped))
}

/// Feed bus events of the trigger kinds into the state machine
pub(super) fn wire_triggers(client: &Arc<ClientInner>) {
    use super::ClientEventKind::*;

    for kind in [Start, Stop, Open, Close, Error, Reconnect] {
        let Some(trigger) = kind.trigger() else {
            continue;
        };
        let weak = Arc::downgrade(client);
        client.events.on(kind, move |_| {
            if let Some(client) = weak.upgrade() {
                client.trigger(trigger);
            }
        });
    }
}

fn act<F>(client: &Weak<ClientInner>, action: F) -> impl Fn(&ClientFsm) + Send + Sync + 'static
where
    F: Fn(&Arc<ClientInner>) + Send + Sync + 'static,
{
    let client = client.clone();
    move |_: &ClientFsm| {
        if let Some(client) = client.upgrade() {
            action(&client);
        }
    }
}

fn leave(client: &Weak<ClientInner>, state: ClientState) -> impl Fn(&ClientFsm) + Send + Sync + 'static {
    act(client, move |client| client.events.fire(ClientEvent::Leave(state)))
}

fn goto(dest: ClientState) -> impl Fn(&ClientFsm) + Send + Sync + 'static {
    move |fsm: &ClientFsm| {
        if let Err(e) = fsm.transition(dest) {
            error!(error = %e, to = ?dest, "Lifecycle transition failed");
        }
    }
}

impl ClientInner {
    fn enter_stopped(self: &Arc<Self>) {
        info!("Client stopped");
        self.events.fire(ClientEvent::Enter(ClientState::Stopped));
        self.tasks.lock().abort_all();
        self.drop_connection();
        self.reconnect_count.store(0, Ordering::Release);
    }

    fn enter_connecting(self: &Arc<Self>) {
        self.events.fire(ClientEvent::Enter(ClientState::Connecting));

        let task = self.runtime.spawn(connect(self.clone()));
        if let Some(previous) = self.tasks.lock().connect.replace(task) {
            previous.abort();
        }
    }

    fn enter_connected(self: &Arc<Self>) {
        info!(endpoint = %self.config.endpoint, "Connected");
        self.events.fire(ClientEvent::Enter(ClientState::Connected));
        self.reconnect_count.store(0, Ordering::Release);
        self.subscribe_all();
    }

    fn leave_connected(self: &Arc<Self>) {
        self.events.fire(ClientEvent::Leave(ClientState::Connected));
        self.clear_pending_subscribes();

        let subscriptions: Vec<_> = self.subscriptions.lock().values().cloned().collect();
        for sub in subscriptions {
            sub.process_disconnect();
        }
    }

    fn enter_awaiting(self: &Arc<Self>) {
        self.events.fire(ClientEvent::Enter(ClientState::Awaiting));
        if let Some(task) = self.tasks.lock().connect.take() {
            task.abort();
        }
        self.drop_connection();
        self.schedule_retry();
    }

    fn drop_connection(&self) {
        if let Some(conn) = self.conn.lock().take() {
            conn.close();
        }
    }

    /// Resend every registered subscription on the new connection
    fn subscribe_all(self: &Arc<Self>) {
        let subscriptions: Vec<_> = self.subscriptions.lock().values().cloned().collect();
        if subscriptions.is_empty() {
            return;
        }

        let client = self.clone();
        self.runtime.spawn(async move {
            for sub in subscriptions {
                if let Err(e) = client.send_subscribe(&sub).await {
                    warn!(subscription_id = %sub.subscription_id(), error = %e, "Failed to resubscribe");
                }
            }
        });
    }

    fn schedule_retry(self: &Arc<Self>) {
        let count = self.reconnect_count.load(Ordering::Acquire);
        let delay = reconnect_delay(count, self.config.max_reconnect_delay);
        info!("Reconnecting in {:?}...", delay);

        let client = Arc::downgrade(self);
        let task = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(client) = client.upgrade() else {
                return;
            };
            if client.state() != ClientState::Awaiting {
                return;
            }
            client.reconnect_count.fetch_add(1, Ordering::AcqRel);
            client.events.fire(ClientEvent::Reconnect);
        });

        if let Some(previous) = self.tasks.lock().retry.replace(task) {
            previous.abort();
        }
    }

    /// Dial, authenticate and report the outcome back to the state machine
    async fn establish(self: &Arc<Self>) -> Result<()> {
        debug!("Connecting to {}", self.config.endpoint);
        let conn = Arc::new(Connection::dial(self.dialer.as_ref(), &self.url).await?);

        if self.state() != ClientState::Connecting {
            conn.close();
            return Ok(());
        }
        if let Some(previous) = self.conn.lock().replace(conn.clone()) {
            previous.close();
        }
        // Stop may have run between the check and the install.
        if self.state() != ClientState::Connecting {
            self.release(&conn);
            return Ok(());
        }

        self.spawn_reader(conn.clone());

        if let Some(auth) = &self.config.auth {
            auth.authenticate(&conn).await.map_err(|e| match e {
                RtmError::Authentication(_) => e,
                other => RtmError::Authentication(other.to_string()),
            })?;
            self.events.fire(ClientEvent::Authenticated);
        }

        self.events.fire(ClientEvent::Open);
        Ok(())
    }

    /// Close `conn` and clear the slot if it still holds it
    fn release(&self, conn: &Arc<Connection>) {
        {
            let mut slot = self.conn.lock();
            if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, conn)) {
                slot.take();
            }
        }
        conn.close();
    }

    /// Pump inbound frames until the connection ends
    fn spawn_reader(self: &Arc<Self>, conn: Arc<Connection>) {
        let client = Arc::downgrade(self);
        self.runtime.spawn(async move {
            loop {
                let result = conn.read().await;
                let Some(client) = client.upgrade() else {
                    conn.close();
                    return;
                };

                match result {
                    Ok(pdu) => client.handle_message(&conn, pdu),
                    Err(RtmError::Pdu(reason)) => {
                        warn!(reason = %reason, "Failed to parse frame");
                        client.events.fire(ClientEvent::DataError(RtmError::Pdu(reason)));
                    }
                    Err(RtmError::ConnectionClosed) => {
                        if client.is_current(&conn) {
                            debug!("Connection closed by server");
                            client.events.fire(ClientEvent::Close);
                        }
                        return;
                    }
                    Err(e) => {
                        if client.is_current(&conn) {
                            client.events.fire(ClientEvent::Error(e));
                        }
                        return;
                    }
                }
            }
        });
    }
}

async fn connect(client: Arc<ClientInner>) {
    if let Err(e) = client.establish().await {
        error!(error = %e, "Connection failed");
        client.events.fire(ClientEvent::Error(e));
    }
}
