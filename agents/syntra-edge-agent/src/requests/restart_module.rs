//! Module restart request

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::{parse_payload, RequestHandler};
use crate::deployment::types::EDGE_AGENT_MODULE;
use crate::error::{AgentError, Result};
use crate::runtime::adapter::RuntimeInfoProvider;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RestartModulePayload {
    schema_version: String,
    id: String,
}

/// `restartmodule` handler
pub struct RestartModuleHandler {
    runtime: Arc<dyn RuntimeInfoProvider>,
}

impl RestartModuleHandler {
    pub fn new(runtime: Arc<dyn RuntimeInfoProvider>) -> Self {
        Self { runtime }
    }
}

#[async_trait]
impl RequestHandler for RestartModuleHandler {
    fn name(&self) -> &str {
        "restartmodule"
    }

    async fn handle(&self, payload: Option<Value>, _cancel: CancellationToken) -> Result<Option<Value>> {
        let payload: RestartModulePayload = parse_payload(payload)?;
        if !payload.schema_version.starts_with('1') {
            return Err(AgentError::invalid_request(format!(
                "unsupported schema version '{}'",
                payload.schema_version
            )));
        }
        if payload.id.eq_ignore_ascii_case(EDGE_AGENT_MODULE) {
            return Err(AgentError::invalid_request("the agent cannot restart itself"));
        }

        let modules = self.runtime.list_modules().await?;
        if !modules.iter().any(|m| m.name == payload.id) {
            return Err(AgentError::invalid_request(format!(
                "module '{}' not found",
                payload.id
            )));
        }

        self.runtime.restart_module(&payload.id).await?;
        Ok(None)
    }
}
