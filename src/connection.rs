//! Connection and request/response correlation
//!
//! A [`Connection`] wraps one transport connection. Requests that expect an
//! answer carry a numeric string id; inbound frames carrying an id are handed
//! to a correlation worker that delivers them to the matching [`Waiter`].

use crate::error::{Result, RtmError};
use crate::pdu::{Pdu, ACTION_SEARCH_DATA};
use crate::transport::{Dialer, FrameSink, FrameStream};

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace, warn};

/// Largest request id before the counter wraps back to 1
pub const MAX_ID: i32 = i32::MAX;

/// Bound of the queue between the reader and the correlation worker
const ACK_QUEUE_CAPACITY: usize = 100;

type WaiterMap = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Pdu>>>>;

/// Receives the responses to one request
#[derive(Debug)]
pub struct Waiter {
    rx: mpsc::UnboundedReceiver<Pdu>,
}

impl Waiter {
    /// Next response frame, `None` once the request completed or the
    /// connection closed
    pub async fn recv(&mut self) -> Option<Pdu> {
        self.rx.recv().await
    }

    /// First response frame, failing if the connection closed first
    pub async fn response(mut self) -> Result<Pdu> {
        self.recv().await.ok_or(RtmError::ConnectionClosed)
    }
}

struct IdAllocator {
    last: Mutex<i32>,
}

impl IdAllocator {
    fn new() -> Self {
        Self {
            last: Mutex::new(0),
        }
    }

    fn next(&self) -> String {
        let mut last = self.last.lock();
        if *last >= MAX_ID {
            *last = 0;
        }
        *last += 1;
        last.to_string()
    }
}

/// One live connection to the RTM service
pub struct Connection {
    sink: Arc<tokio::sync::Mutex<Box<dyn FrameSink>>>,
    stream: tokio::sync::Mutex<Box<dyn FrameStream>>,
    ids: IdAllocator,
    waiters: WaiterMap,
    ack_tx: Mutex<Option<mpsc::Sender<Pdu>>>,
    closed: AtomicBool,
    close_notify: Notify,
}

impl Connection {
    /// Dial `url` and wrap the resulting transport
    pub async fn dial(dialer: &dyn Dialer, url: &str) -> Result<Self> {
        debug!(url = %url, "Dialing");
        let (sink, stream) = dialer.dial(url).await?;
        Ok(Self::new(sink, stream))
    }

    /// Wrap an already open transport. Must be called inside a Tokio runtime.
    pub fn new(sink: Box<dyn FrameSink>, stream: Box<dyn FrameStream>) -> Self {
        let waiters: WaiterMap = Arc::new(Mutex::new(HashMap::new()));
        let (ack_tx, ack_rx) = mpsc::channel(ACK_QUEUE_CAPACITY);
        tokio::spawn(correlate(ack_rx, waiters.clone()));

        Self {
            sink: Arc::new(tokio::sync::Mutex::new(sink)),
            stream: tokio::sync::Mutex::new(stream),
            ids: IdAllocator::new(),
            waiters,
            ack_tx: Mutex::new(Some(ack_tx)),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
        }
    }

    /// Send a request without an id; no response is expected
    pub async fn send(&self, action: &str, body: Value) -> Result<()> {
        self.write(&Pdu::new(action, body)).await
    }

    /// Send a request with a fresh id and return the waiter for its responses
    pub async fn send_ack(&self, action: &str, body: Value) -> Result<Waiter> {
        let id = self.ids.next();
        let (tx, rx) = mpsc::unbounded_channel();
        self.waiters.lock().insert(id.clone(), tx);

        let mut pdu = Pdu::new(action, body);
        pdu.id = Some(id.clone());
        if let Err(e) = self.write(&pdu).await {
            self.waiters.lock().remove(&id);
            return Err(e);
        }

        Ok(Waiter { rx })
    }

    /// Reserve the id for a request sent with [`send_with_id`].
    ///
    /// [`send_with_id`]: Connection::send_with_id
    pub fn next_id(&self) -> String {
        self.ids.next()
    }

    /// Send a request under a reserved id without registering a waiter.
    /// Its responses reach the caller only through [`read`](Connection::read).
    pub async fn send_with_id(&self, id: &str, action: &str, body: Value) -> Result<()> {
        let mut pdu = Pdu::new(action, body);
        pdu.id = Some(id.to_string());
        self.write(&pdu).await
    }

    async fn write(&self, pdu: &Pdu) -> Result<()> {
        if self.is_closed() {
            return Err(RtmError::ConnectionClosed);
        }

        let frame = serde_json::to_string(pdu).map_err(RtmError::InvalidPayload)?;
        debug!(frame = %frame, "send>");

        let result = self.sink.lock().await.write_text(frame).await;
        if let Err(e) = &result {
            warn!(error = %e, "Write failed, closing connection");
            self.close();
        }
        result
    }

    /// Read the next inbound frame.
    ///
    /// Frames that carry an id are also queued for correlation. A frame that
    /// is not valid JSON yields [`RtmError::Pdu`] and leaves the connection
    /// open; transport failures and peer close shut it down.
    pub async fn read(&self) -> Result<Pdu> {
        let notified = self.close_notify.notified();
        if self.is_closed() {
            return Err(RtmError::ConnectionClosed);
        }

        let mut stream = self.stream.lock().await;
        let next = tokio::select! {
            next = stream.read_text() => next,
            _ = notified => return Err(RtmError::ConnectionClosed),
        };

        match next {
            Ok(Some(text)) => {
                debug!(frame = %text, "recv<");
                let pdu: Pdu = serde_json::from_str(&text)
                    .map_err(|e| RtmError::Pdu(format!("{e}: {text}")))?;

                if pdu.correlation_id().is_some() {
                    let ack_tx = self.ack_tx.lock().clone();
                    if let Some(ack_tx) = ack_tx {
                        let _ = ack_tx.send(pdu.clone()).await;
                    }
                }
                Ok(pdu)
            }
            Ok(None) => {
                debug!("Connection closed by peer");
                self.close();
                Err(RtmError::ConnectionClosed)
            }
            Err(e) => {
                warn!(error = %e, "Read failed, closing connection");
                self.close();
                Err(e)
            }
        }
    }

    /// Close the connection. Safe to call any number of times from anywhere.
    ///
    /// Pending waiters observe end-of-responses once already received frames
    /// are delivered, a blocked [`read`] returns
    /// [`RtmError::ConnectionClosed`] and the transport is shut down in the
    /// background.
    ///
    /// [`read`]: Connection::read
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.close_notify.notify_waiters();
        // The worker delivers what is already queued, then drops every waiter.
        self.ack_tx.lock().take();

        let sink = self.sink.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    sink.lock().await.close().await;
                });
            }
            Err(_) => trace!("No runtime, transport left to drop"),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[cfg(test)]
    fn set_last_id(&self, id: i32) {
        *self.ids.last.lock() = id;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("closed", &self.is_closed())
            .field("pending", &self.waiters.lock().len())
            .finish()
    }
}

/// Deliver id-carrying frames to their waiters
async fn correlate(mut rx: mpsc::Receiver<Pdu>, waiters: WaiterMap) {
    while let Some(pdu) = rx.recv().await {
        let Some(id) = pdu.correlation_id() else {
            continue;
        };

        // Search answers arrive as a run of data frames for one id.
        let waiter = {
            let mut waiters = waiters.lock();
            if pdu.action == ACTION_SEARCH_DATA {
                waiters.get(id).cloned()
            } else {
                waiters.remove(id)
            }
        };

        match waiter {
            Some(tx) => {
                let _ = tx.send(pdu);
            }
            None => debug!(id = %id, action = %pdu.action, "No waiter for response"),
        }
    }

    waiters.lock().clear();
}
