//! Transport boundary
//!
//! The protocol core only needs to dial a URL, write text frames, read text
//! frames and close. Adapters:
//!
//! - WebSocket: `tokio-tungstenite`, optionally tunnelled through an HTTP proxy
//! - Memory: in-process frame pipes, used by tests and embedders

mod memory;
mod websocket;

pub use memory::{pair as memory_pair, MemoryDialer, MemoryListener, MemoryServerConn, MemorySink, MemoryStream};
pub use websocket::WebSocketDialer;

pub use async_trait::async_trait;

use crate::error::Result;

/// Write half of a frame-oriented connection
#[async_trait]
pub trait FrameSink: Send {
    /// Write one text frame
    async fn write_text(&mut self, frame: String) -> Result<()>;

    /// Close the write half. Errors are not reported.
    async fn close(&mut self);
}

/// Read half of a frame-oriented connection
#[async_trait]
pub trait FrameStream: Send {
    /// Next text frame, or `None` once the peer closed the connection
    async fn read_text(&mut self) -> Result<Option<String>>;
}

/// Opens frame-oriented connections
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, url: &str) -> Result<(Box<dyn FrameSink>, Box<dyn FrameStream>)>;
}
