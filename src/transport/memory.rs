//! In-process transport
//!
//! A [`MemoryDialer`] hands every dialed connection to its paired
//! [`MemoryListener`], where a test server drives the other end.

use super::{async_trait, Dialer, FrameSink, FrameStream};
use crate::error::{Result, RtmError};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

enum Frame {
    Text(String),
    Fail(String),
}

/// Client write half
pub struct MemorySink {
    tx: Option<mpsc::UnboundedSender<String>>,
}

/// Client read half
pub struct MemoryStream {
    rx: mpsc::UnboundedReceiver<Frame>,
}

/// Server end of an in-memory connection
pub struct MemoryServerConn {
    url: String,
    tx: Option<mpsc::UnboundedSender<Frame>>,
    rx: mpsc::UnboundedReceiver<String>,
}

/// Create a connected client/server pair
pub fn pair(url: &str) -> (MemorySink, MemoryStream, MemoryServerConn) {
    let (client_tx, server_rx) = mpsc::unbounded_channel();
    let (server_tx, client_rx) = mpsc::unbounded_channel();
    (
        MemorySink {
            tx: Some(client_tx),
        },
        MemoryStream { rx: client_rx },
        MemoryServerConn {
            url: url.to_string(),
            tx: Some(server_tx),
            rx: server_rx,
        },
    )
}

impl MemoryServerConn {
    /// URL the client dialed
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Send a text frame to the client. Returns false once the client is gone.
    pub fn send(&self, frame: impl Into<String>) -> bool {
        match &self.tx {
            Some(tx) => tx.send(Frame::Text(frame.into())).is_ok(),
            None => false,
        }
    }

    /// Next frame written by the client, `None` once it closed its sink
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Make the client's next read fail with a transport error
    pub fn fail(&mut self, reason: &str) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Frame::Fail(reason.to_string()));
        }
    }

    /// Close the server end; the client reads end-of-stream
    pub fn close(&mut self) {
        self.tx.take();
    }
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn write_text(&mut self, frame: String) -> Result<()> {
        match &self.tx {
            Some(tx) => tx.send(frame).map_err(|_| RtmError::Transport("peer gone".into())),
            None => Err(RtmError::Transport("sink closed".into())),
        }
    }

    async fn close(&mut self) {
        self.tx.take();
    }
}

#[async_trait]
impl FrameStream for MemoryStream {
    async fn read_text(&mut self) -> Result<Option<String>> {
        match self.rx.recv().await {
            Some(Frame::Text(text)) => Ok(Some(text)),
            Some(Frame::Fail(reason)) => Err(RtmError::Transport(reason)),
            None => Ok(None),
        }
    }
}

/// Dialer whose connections land on a [`MemoryListener`]
#[derive(Clone)]
pub struct MemoryDialer {
    accept_tx: mpsc::UnboundedSender<MemoryServerConn>,
    refuse: Arc<AtomicBool>,
}

/// Accepts connections opened through a [`MemoryDialer`]
pub struct MemoryListener {
    accept_rx: mpsc::UnboundedReceiver<MemoryServerConn>,
}

impl MemoryDialer {
    pub fn new() -> (Self, MemoryListener) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        (
            Self {
                accept_tx,
                refuse: Arc::new(AtomicBool::new(false)),
            },
            MemoryListener { accept_rx },
        )
    }

    /// While set, every dial fails with a transport error
    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }
}

impl MemoryListener {
    pub async fn accept(&mut self) -> Option<MemoryServerConn> {
        self.accept_rx.recv().await
    }
}

#[async_trait]
impl Dialer for MemoryDialer {
    async fn dial(&self, url: &str) -> Result<(Box<dyn FrameSink>, Box<dyn FrameStream>)> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(RtmError::Transport("connection refused".into()));
        }

        let (sink, stream, server) = pair(url);
        self.accept_tx
            .send(server)
            .map_err(|_| RtmError::Transport("listener gone".into()))?;
        Ok((Box::new(sink), Box::new(stream)))
    }
}
