//! Log tail stream
//!
//! Streams the log lines of one module, following new output when asked.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::StreamRequestHandler;
use crate::connection::transport::StreamFrame;
use crate::error::{AgentError, Result};
use crate::logs::{LogFilter, LogOptions, LogsProvider};
use crate::requests::parse_payload;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogsStreamRequest {
    id: String,
    #[serde(default)]
    filter: LogOptions,
}

/// Stream handler registered as `logs`
pub struct LogsStreamHandler {
    logs: Arc<dyn LogsProvider>,
}

impl LogsStreamHandler {
    pub fn new(logs: Arc<dyn LogsProvider>) -> Self {
        Self { logs }
    }
}

#[async_trait]
impl StreamRequestHandler for LogsStreamHandler {
    async fn handle(
        &self,
        payload: Option<Value>,
        frames: mpsc::Sender<StreamFrame>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let request: LogsStreamRequest = parse_payload(payload)?;
        if request.id.is_empty() {
            return Err(AgentError::invalid_request("module id is required"));
        }

        let filter = LogFilter::from_options(&request.filter)?;
        let mut records = self.logs.get_logs(&request.id, &request.filter);

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                next = records.next() => next,
            };

            let Some(record) = next else {
                return Ok(());
            };
            let record = record?;
            if !filter.matches(&record) {
                continue;
            }

            let line = format!("<{}> {}\n", record.level, record.text);
            if frames.send(StreamFrame::data(line)).await.is_err() {
                debug!(module = %request.id, "Log stream consumer gone");
                return Ok(());
            }
        }
    }
}
