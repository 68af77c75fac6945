//! Request Manager
//!
//! Dispatches named direct requests from the cloud to registered handlers.
//! Every request produces exactly one response: the handler's result, a
//! structured error, or a timeout. A handler that outlives its budget is
//! cancelled and its late result is dropped.

mod get_logs;
mod log_items;
mod ping;
mod restart_module;
mod upload_logs;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{AgentError, Result};

pub use get_logs::GetLogsHandler;
pub use ping::PingHandler;
pub use restart_module::RestartModuleHandler;
pub use upload_logs::UploadLogsHandler;

/// Response status codes
pub mod status {
    pub const OK: u16 = 200;
    pub const BAD_REQUEST: u16 = 400;
    pub const NOT_FOUND: u16 = 404;
    pub const TIMEOUT: u16 = 408;
    pub const INTERNAL_ERROR: u16 = 500;
    pub const UNAVAILABLE: u16 = 503;
}

/// An inbound direct request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub correlation_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

/// The single answer to a [`Request`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub correlation_id: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Response {
    pub fn success(correlation_id: &str, payload: Option<Value>) -> Self {
        Self {
            correlation_id: correlation_id.to_string(),
            status: status::OK,
            payload,
        }
    }

    pub fn error(correlation_id: &str, status: u16, message: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.to_string(),
            status,
            payload: Some(json!({ "message": message.into() })),
        }
    }

    /// Structured error response for a failed request
    pub fn from_error(correlation_id: &str, err: &AgentError) -> Self {
        let status = match err {
            AgentError::InvalidRequest(_) => status::BAD_REQUEST,
            AgentError::HandlerNotFound(_) => status::NOT_FOUND,
            AgentError::RequestTimeout(_) => status::TIMEOUT,
            AgentError::Disconnected(_) => status::UNAVAILABLE,
            _ => status::INTERNAL_ERROR,
        };
        Self::error(correlation_id, status, err.to_string())
    }

    pub fn is_success(&self) -> bool {
        self.status == status::OK
    }
}

/// Handles one named request type
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Dispatch key, matched case-insensitively
    fn name(&self) -> &str;

    /// Handle the request payload. Implementations must return promptly once
    /// `cancel` fires.
    async fn handle(&self, payload: Option<Value>, cancel: CancellationToken)
        -> Result<Option<Value>>;
}

/// Decode a request payload into a handler's schema
pub fn parse_payload<T: for<'de> Deserialize<'de>>(payload: Option<Value>) -> Result<T> {
    let payload = payload.ok_or_else(|| AgentError::invalid_request("payload is required"))?;
    serde_json::from_value(payload).map_err(|e| AgentError::invalid_request(e.to_string()))
}

/// Terminal state of a dispatched request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Succeeded,
    Failed,
    TimedOut,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Succeeded => write!(f, "succeeded"),
            Outcome::Failed => write!(f, "failed"),
            Outcome::TimedOut => write!(f, "timed_out"),
        }
    }
}

/// Routes requests to handlers with a per-request timeout
pub struct RequestManager {
    handlers: HashMap<String, Arc<dyn RequestHandler>>,
    timeout: Duration,
    permits: Arc<Semaphore>,
}

impl RequestManager {
    /// Create a manager from an ordered handler list.
    ///
    /// When two handlers declare the same name the first one wins.
    pub fn new(
        handlers: Vec<Arc<dyn RequestHandler>>,
        timeout: Duration,
        max_concurrent: usize,
    ) -> Self {
        let mut registry: HashMap<String, Arc<dyn RequestHandler>> = HashMap::new();
        for handler in handlers {
            let key = handler.name().to_lowercase();
            if registry.contains_key(&key) {
                warn!(name = %key, "Duplicate request handler ignored");
                continue;
            }
            registry.insert(key, handler);
        }

        info!(
            handlers = ?registry.keys().collect::<Vec<_>>(),
            timeout_ms = timeout.as_millis() as u64,
            "Request manager ready"
        );

        Self {
            handlers: registry,
            timeout,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Dispatch a request and produce its one response
    pub async fn dispatch(&self, request: Request, cancel: &CancellationToken) -> Response {
        let Request {
            correlation_id,
            name,
            payload,
        } = request;
        let key = name.to_lowercase();
        debug!(correlation_id = %correlation_id, name = %key, "Request received");

        let Some(handler) = self.handlers.get(&key).cloned() else {
            warn!(correlation_id = %correlation_id, name = %key, "No handler for request");
            return Response::from_error(&correlation_id, &AgentError::HandlerNotFound(key));
        };

        if cancel.is_cancelled() {
            return Response::error(&correlation_id, status::UNAVAILABLE, "agent is shutting down");
        }

        let deadline = Instant::now() + self.timeout;
        let timed_out = || {
            error!(
                correlation_id = %correlation_id,
                name = %key,
                outcome = %Outcome::TimedOut,
                "Request timed out"
            );
            Response::from_error(&correlation_id, &AgentError::RequestTimeout(self.timeout))
        };

        let permit = tokio::select! {
            _ = cancel.cancelled() => {
                return Response::error(&correlation_id, status::UNAVAILABLE, "agent is shutting down");
            }
            permit = timeout_at(deadline, Arc::clone(&self.permits).acquire_owned()) => match permit {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => {
                    return Response::error(&correlation_id, status::UNAVAILABLE, "request manager closed");
                }
                Err(_) => return timed_out(),
            }
        };

        let handler_cancel = cancel.child_token();
        let task = tokio::spawn({
            let handler_cancel = handler_cancel.clone();
            async move {
                let result = handler.handle(payload, handler_cancel).await;
                drop(permit);
                result
            }
        });
        let abort = task.abort_handle();
        debug!(correlation_id = %correlation_id, name = %key, "Request dispatched");

        let response = tokio::select! {
            _ = cancel.cancelled() => {
                handler_cancel.cancel();
                abort.abort();
                Response::error(&correlation_id, status::UNAVAILABLE, "agent is shutting down")
            }
            result = timeout_at(deadline, task) => match result {
                Ok(Ok(Ok(payload))) => Response::success(&correlation_id, payload),
                Ok(Ok(Err(e))) => Response::from_error(&correlation_id, &e),
                Ok(Err(join_err)) => Response::from_error(
                    &correlation_id,
                    &AgentError::handler_failure(format!("handler aborted: {}", join_err)),
                ),
                Err(_) => {
                    handler_cancel.cancel();
                    abort.abort();
                    return timed_out();
                }
            }
        };

        let outcome = if response.is_success() {
            Outcome::Succeeded
        } else {
            Outcome::Failed
        };
        info!(
            correlation_id = %correlation_id,
            name = %key,
            status = response.status,
            outcome = %outcome,
            "Request completed"
        );
        response
    }
}
