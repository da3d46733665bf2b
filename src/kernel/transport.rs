//! Channels to the kernel.
//!
//! A [`Transport`] opens a [`Connection`]: request/response calls plus a
//! duplex frame feed used for event subscriptions. [`HttpWsTransport`] posts
//! calls to `{http_url}/rpc` and reads pushed events from a WebSocket.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::config::KernelConfig;
use crate::error::RpcError;
use crate::kernel::protocol::{RpcRequest, RpcResponse};

/// Opens connections to one kernel endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Connection>, RpcError>;
}

/// An open channel to the kernel.
///
/// Calls may run while another task is blocked in
/// [`next_frame`](Connection::next_frame).
#[async_trait]
pub trait Connection: Send + Sync {
    async fn request(&self, request: &RpcRequest) -> Result<RpcResponse, RpcError>;

    /// Send a frame on the push channel.
    async fn send_frame(&self, frame: serde_json::Value) -> Result<(), RpcError>;

    /// Next frame pushed by the kernel, or `None` once the channel closes.
    async fn next_frame(&self) -> Result<Option<serde_json::Value>, RpcError>;

    async fn close(&self);
}

// ==================== HTTP + WebSocket ====================

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// HTTP for calls, WebSocket for the push feed.
#[derive(Debug, Clone)]
pub struct HttpWsTransport {
    ws_url: String,
    http_url: String,
    call_timeout: std::time::Duration,
}

impl HttpWsTransport {
    pub fn new(config: &KernelConfig) -> Self {
        Self {
            ws_url: config.ws_url.clone(),
            http_url: config.http_url.trim_end_matches('/').to_string(),
            call_timeout: config.call_timeout(),
        }
    }
}

#[async_trait]
impl Transport for HttpWsTransport {
    async fn connect(&self) -> Result<Box<dyn Connection>, RpcError> {
        let http = reqwest::Client::builder()
            .timeout(self.call_timeout)
            .build()
            .map_err(|e| RpcError::Connection(format!("HTTP client: {}", e)))?;

        let (ws, _) = tokio_tungstenite::connect_async(self.ws_url.as_str())
            .await
            .map_err(|e| RpcError::Connection(format!("{}: {}", self.ws_url, e)))?;
        let (sink, stream) = ws.split();

        tracing::info!(ws_url = %self.ws_url, http_url = %self.http_url, "Connected to kernel");

        Ok(Box::new(HttpWsConnection {
            http,
            rpc_url: format!("{}/rpc", self.http_url),
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
        }))
    }
}

struct HttpWsConnection {
    http: reqwest::Client,
    rpc_url: String,
    sink: Mutex<SplitSink<WsStream, Message>>,
    stream: Mutex<SplitStream<WsStream>>,
}

#[async_trait]
impl Connection for HttpWsConnection {
    async fn request(&self, request: &RpcRequest) -> Result<RpcResponse, RpcError> {
        let response = self
            .http
            .post(&self.rpc_url)
            .json(request)
            .send()
            .await
            .map_err(|e| RpcError::Connection(format!("RPC request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| RpcError::Connection(format!("RPC response body: {}", e)))?;

        // Kernels may answer errors with a non-2xx status and a normal body.
        match serde_json::from_slice::<RpcResponse>(&body) {
            Ok(parsed) => Ok(parsed),
            Err(_) if !status.is_success() => Err(RpcError::Protocol(format!(
                "kernel returned status: {}",
                status
            ))),
            Err(e) => Err(RpcError::Protocol(format!("invalid RPC response: {}", e))),
        }
    }

    async fn send_frame(&self, frame: serde_json::Value) -> Result<(), RpcError> {
        self.sink
            .lock()
            .await
            .send(Message::text(frame.to_string()))
            .await
            .map_err(|e| RpcError::Connection(format!("WebSocket send failed: {}", e)))
    }

    async fn next_frame(&self) -> Result<Option<serde_json::Value>, RpcError> {
        let mut stream = self.stream.lock().await;
        while let Some(message) = stream.next().await {
            let message =
                message.map_err(|e| RpcError::Connection(format!("WebSocket read failed: {}", e)))?;
            let parsed = match message {
                Message::Text(text) => serde_json::from_str(text.as_str()),
                Message::Binary(data) => serde_json::from_slice(&data),
                Message::Close(_) => return Ok(None),
                _ => continue,
            };
            match parsed {
                Ok(frame) => return Ok(Some(frame)),
                Err(e) => tracing::warn!(error = %e, "Dropping malformed frame from kernel"),
            }
        }
        Ok(None)
    }

    async fn close(&self) {
        if let Err(e) = self.sink.lock().await.close().await {
            tracing::debug!(error = %e, "WebSocket close");
        }
    }
}
