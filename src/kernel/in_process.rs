//! Kernel stand-in served from the same process.
//!
//! [`InProcessTransport`] answers calls from a closure and is fed events
//! through a [`PushHandle`]. Built for tests and for the `test-support`
//! feature.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};

use crate::error::RpcError;
use crate::kernel::protocol::{RpcRequest, RpcResponse};
use crate::kernel::transport::{Connection, Transport};

/// Answers a request with a result or an error message.
pub type Responder =
    Arc<dyn Fn(&RpcRequest) -> Result<serde_json::Value, String> + Send + Sync>;

/// Transport served by a closure in the same process.
///
/// Every connection shares one push feed, fed through the [`PushHandle`]
/// returned by [`new`](Self::new).
#[derive(Clone)]
pub struct InProcessTransport {
    responder: Responder,
    feed: Arc<Mutex<mpsc::UnboundedReceiver<serde_json::Value>>>,
    requests: Arc<Mutex<Vec<RpcRequest>>>,
    sent_frames: Arc<Mutex<Vec<serde_json::Value>>>,
    connect_error: Option<String>,
}

/// Pushes frames to an [`InProcessTransport`]'s feed.
#[derive(Clone)]
pub struct PushHandle {
    sender: Arc<Mutex<Option<mpsc::UnboundedSender<serde_json::Value>>>>,
}

impl PushHandle {
    /// Queue a frame. Returns false once the feed is closed.
    pub async fn push(&self, frame: serde_json::Value) -> bool {
        match self.sender.lock().await.as_ref() {
            Some(sender) => sender.send(frame).is_ok(),
            None => false,
        }
    }

    /// End the feed; readers see `None` after draining queued frames.
    pub async fn close(&self) {
        self.sender.lock().await.take();
    }
}

impl InProcessTransport {
    pub fn new<F>(responder: F) -> (Self, PushHandle)
    where
        F: Fn(&RpcRequest) -> Result<serde_json::Value, String> + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Self {
            responder: Arc::new(responder),
            feed: Arc::new(Mutex::new(rx)),
            requests: Arc::new(Mutex::new(Vec::new())),
            sent_frames: Arc::new(Mutex::new(Vec::new())),
            connect_error: None,
        };
        let push = PushHandle {
            sender: Arc::new(Mutex::new(Some(tx))),
        };
        (transport, push)
    }

    /// A transport whose `connect` always fails with `message`.
    pub fn refusing(message: impl Into<String>) -> Self {
        let (mut transport, _) = Self::new(|_| Ok(serde_json::Value::Null));
        transport.connect_error = Some(message.into());
        transport
    }

    /// Requests received so far, oldest first.
    pub async fn requests(&self) -> Vec<RpcRequest> {
        self.requests.lock().await.clone()
    }

    /// Frames sent by clients so far, oldest first.
    pub async fn sent_frames(&self) -> Vec<serde_json::Value> {
        self.sent_frames.lock().await.clone()
    }
}

#[async_trait]
impl Transport for InProcessTransport {
    async fn connect(&self) -> Result<Box<dyn Connection>, RpcError> {
        if let Some(message) = &self.connect_error {
            return Err(RpcError::Connection(message.clone()));
        }
        Ok(Box::new(InProcessConnection {
            transport: self.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

struct InProcessConnection {
    transport: InProcessTransport,
    closed: AtomicBool,
}

impl InProcessConnection {
    fn ensure_open(&self) -> Result<(), RpcError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RpcError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for InProcessConnection {
    async fn request(&self, request: &RpcRequest) -> Result<RpcResponse, RpcError> {
        self.ensure_open()?;
        self.transport.requests.lock().await.push(request.clone());
        Ok(match (self.transport.responder)(request) {
            Ok(result) => RpcResponse::success(request.id, result),
            Err(message) => RpcResponse::failure(request.id, message),
        })
    }

    async fn send_frame(&self, frame: serde_json::Value) -> Result<(), RpcError> {
        self.ensure_open()?;
        self.transport.sent_frames.lock().await.push(frame);
        Ok(())
    }

    async fn next_frame(&self) -> Result<Option<serde_json::Value>, RpcError> {
        if self.ensure_open().is_err() {
            return Ok(None);
        }
        Ok(self.transport.feed.lock().await.recv().await)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
