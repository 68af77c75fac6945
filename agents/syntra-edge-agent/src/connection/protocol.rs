//! Message Protocol
//!
//! JSON messages exchanged with the hub over the device WebSocket. Both
//! directions use `{ "type": ..., "payload": ... }` envelopes. Twin reads and
//! reported patches are correlated by `request_id`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::transport::{StreamFrame, Twin};
use crate::requests::{Request, Response};

/// Messages sent from the device to the hub
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum DeviceMessage {
    /// Session handshake
    Hello(HelloPayload),

    /// Ask for the full twin
    GetTwin(TwinRequestPayload),

    /// Merge patch for the reported properties
    PatchReported(PatchReportedPayload),

    /// Answer to a direct method
    MethodResponse(Response),

    /// Frame written on an open stream
    StreamFrame(StreamFramePayload),
}

/// Messages sent from the hub to the device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum CloudMessage {
    /// Full twin, answering `GetTwin`
    Twin(TwinPayload),

    /// Reported patch accepted
    PatchAck(PatchAckPayload),

    /// Desired properties changed
    DesiredPatch(DesiredPatchPayload),

    /// Direct method invocation
    MethodRequest(Request),

    /// Open a long-lived stream
    StreamOpen(StreamOpenPayload),

    /// Request failed, or a session-level error when `request_id` is absent
    Error(ErrorPayload),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloPayload {
    pub device_id: String,
    pub hub_hostname: String,
    pub agent_version: String,
    pub hostname: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TwinRequestPayload {
    pub request_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchReportedPayload {
    pub request_id: String,
    pub patch: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamFramePayload {
    pub stream_id: String,
    pub frame: StreamFrame,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TwinPayload {
    pub request_id: String,
    pub twin: Twin,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchAckPayload {
    pub request_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesiredPatchPayload {
    pub patch: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamOpenPayload {
    pub stream_id: String,
    pub name: String,
    #[serde(default)]
    pub payload: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    #[serde(default)]
    pub request_id: Option<String>,
    pub status: u16,
    pub message: String,
}

impl DeviceMessage {
    /// Handshake sent first on every session
    pub fn hello(device_id: &str, hub_hostname: &str) -> Self {
        DeviceMessage::Hello(HelloPayload {
            device_id: device_id.to_string(),
            hub_hostname: hub_hostname.to_string(),
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            hostname: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
            timestamp: Utc::now(),
        })
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl CloudMessage {
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    /// Correlation id of a reply to a device request
    pub fn request_id(&self) -> Option<&str> {
        match self {
            CloudMessage::Twin(p) => Some(&p.request_id),
            CloudMessage::PatchAck(p) => Some(&p.request_id),
            CloudMessage::Error(p) => p.request_id.as_deref(),
            _ => None,
        }
    }
}
