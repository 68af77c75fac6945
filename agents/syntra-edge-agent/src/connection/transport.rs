//! Cloud Transport Interface
//!
//! The authenticated device-to-cloud channel the agent runs on. The agent
//! only needs twin get/patch plus three inbound channels (desired-property
//! patches, direct methods, stream requests); how the transport
//! authenticates and reconnects is its own business.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};

use crate::error::AgentError;
use crate::requests::{Request, Response};

/// Twin document pair as returned by the hub
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Twin {
    #[serde(default)]
    pub desired: Value,
    #[serde(default)]
    pub reported: Value,
}

/// Key holding the version of a desired/reported document
pub const VERSION_KEY: &str = "$version";

/// Read the `$version` of a twin document
pub fn document_version(document: &Value) -> Option<i64> {
    document.get(VERSION_KEY).and_then(Value::as_i64)
}

/// Link state of the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

/// Errors raised by a transport
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("not connected to the hub")]
    NotConnected,

    #[error("hub did not answer in time")]
    Timeout,

    #[error("hub rejected the operation ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("transport closed")]
    Closed,

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<TransportError> for AgentError {
    fn from(err: TransportError) -> Self {
        AgentError::disconnected(err.to_string())
    }
}

/// An inbound direct method together with its single-use responder
#[derive(Debug)]
pub struct MethodInvocation {
    pub request: Request,
    pub responder: oneshot::Sender<Response>,
}

/// Outcome code sent when a stream closes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StreamStatus {
    Completed,
    Unsupported,
    NotFound,
    Busy,
    Cancelled,
    Failed,
}

/// One frame written back on a stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum StreamFrame {
    Data { data: String },
    Close {
        status: StreamStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl StreamFrame {
    pub fn data(data: impl Into<String>) -> Self {
        StreamFrame::Data { data: data.into() }
    }

    pub fn close(status: StreamStatus, message: Option<String>) -> Self {
        StreamFrame::Close { status, message }
    }
}

/// An inbound long-lived stream request
#[derive(Debug)]
pub struct StreamRequest {
    pub stream_id: String,
    pub name: String,
    pub payload: Option<Value>,
    /// Frames written here travel back on the same named channel
    pub frames: mpsc::Sender<StreamFrame>,
}

/// Channels the transport delivers inbound traffic on
#[derive(Debug, Clone)]
pub struct TransportHandlers {
    pub desired_patches: mpsc::Sender<Value>,
    pub methods: mpsc::Sender<MethodInvocation>,
    pub streams: mpsc::Sender<StreamRequest>,
}

/// The device-to-cloud transport
#[async_trait]
pub trait CloudTransport: Send + Sync {
    /// Fetch the full twin
    async fn get_twin(&self) -> Result<Twin, TransportError>;

    /// Send a merge patch for the reported properties
    async fn update_reported_properties(&self, patch: &Value) -> Result<(), TransportError>;

    /// Route inbound traffic to `handlers`, replacing any previous registration
    fn register(&self, handlers: TransportHandlers);

    /// Stop routing inbound traffic
    fn unregister(&self);

    /// Observe link state changes
    fn status(&self) -> watch::Receiver<ConnectionStatus>;

    /// Release the underlying connection
    async fn close(&self);
}
