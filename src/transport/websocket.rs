//! WebSocket adapter built on tokio-tungstenite

use super::{async_trait, Dialer, FrameSink, FrameStream};
use crate::error::{Result, RtmError};

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Dials `ws://` and `wss://` endpoints, optionally through an HTTP proxy
#[derive(Debug, Clone, Default)]
pub struct WebSocketDialer {
    proxy: Option<Url>,
}

impl WebSocketDialer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tunnel every connection through `proxy` with HTTP `CONNECT`
    pub fn with_proxy(proxy: &str) -> Result<Self> {
        let proxy = Url::parse(proxy).map_err(|e| RtmError::InvalidEndpoint(e.to_string()))?;
        Ok(Self { proxy: Some(proxy) })
    }

    async fn connect(&self, url: &str) -> Result<WsStream> {
        // Both the direct and the proxied path use rustls with the ring provider.
        let _ = rustls::crypto::ring::default_provider().install_default();

        match &self.proxy {
            None => {
                let (ws, _) = tokio_tungstenite::connect_async(url)
                    .await
                    .map_err(|e| RtmError::Transport(e.to_string()))?;
                Ok(ws)
            }
            Some(proxy) => {
                let target = Url::parse(url).map_err(|e| RtmError::InvalidEndpoint(e.to_string()))?;
                let tcp = proxy_tunnel(proxy, &target).await?;
                let (ws, _) = tokio_tungstenite::client_async_tls(url, tcp)
                    .await
                    .map_err(|e| RtmError::Transport(e.to_string()))?;
                Ok(ws)
            }
        }
    }
}

/// Open a TCP connection to `target` through an HTTP `CONNECT` proxy
async fn proxy_tunnel(proxy: &Url, target: &Url) -> Result<TcpStream> {
    let proxy_addr = host_port(proxy)?;
    let target_addr = host_port(target)?;
    debug!(proxy = %proxy_addr, target = %target_addr, "Opening proxy tunnel");

    let mut tcp = TcpStream::connect(&proxy_addr)
        .await
        .map_err(|e| RtmError::Transport(e.to_string()))?;

    let request = format!("CONNECT {target_addr} HTTP/1.1\r\nHost: {target_addr}\r\n\r\n");
    tcp.write_all(request.as_bytes())
        .await
        .map_err(|e| RtmError::Transport(e.to_string()))?;

    let mut reader = BufReader::new(&mut tcp);
    let mut status = String::new();
    reader
        .read_line(&mut status)
        .await
        .map_err(|e| RtmError::Transport(e.to_string()))?;

    let code = status.split_whitespace().nth(1).unwrap_or_default();
    if code != "200" {
        return Err(RtmError::Transport(format!(
            "Proxy refused tunnel: {}",
            status.trim()
        )));
    }

    // Drain response headers up to the blank line.
    loop {
        let mut line = String::new();
        let n = reader
            .read_line(&mut line)
            .await
            .map_err(|e| RtmError::Transport(e.to_string()))?;
        if n == 0 || line == "\r\n" || line == "\n" {
            break;
        }
    }

    Ok(tcp)
}

fn host_port(url: &Url) -> Result<String> {
    let host = url
        .host_str()
        .ok_or_else(|| RtmError::InvalidEndpoint(format!("No host in {url}")))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| RtmError::InvalidEndpoint(format!("No port for {url}")))?;
    Ok(format!("{host}:{port}"))
}

#[async_trait]
impl Dialer for WebSocketDialer {
    async fn dial(&self, url: &str) -> Result<(Box<dyn FrameSink>, Box<dyn FrameStream>)> {
        let ws = self.connect(url).await?;
        let (sink, stream) = ws.split();
        Ok((Box::new(WsSink { sink }), Box::new(WsFrames { stream })))
    }
}

struct WsSink {
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn write_text(&mut self, frame: String) -> Result<()> {
        self.sink
            .send(Message::Text(frame.into()))
            .await
            .map_err(|e| RtmError::Transport(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.sink.close().await;
    }
}

struct WsFrames {
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl FrameStream for WsFrames {
    async fn read_text(&mut self) -> Result<Option<String>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text.to_string())),
                Some(Ok(Message::Binary(bin))) => match String::from_utf8(bin.to_vec()) {
                    Ok(text) => return Ok(Some(text)),
                    Err(_) => {
                        warn!(len = bin.len(), "Dropping non-UTF-8 binary frame");
                        continue;
                    }
                },
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                // Pings are answered by tungstenite itself
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(RtmError::Transport(e.to_string())),
            }
        }
    }
}
