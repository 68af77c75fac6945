//! Log upload request
//!
//! Fetches runtime info, reads the logs of every requested module and hands
//! each module's payload to the uploader. Failures across modules are folded
//! into one error; nothing is retried.

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::log_items::{resolve_modules, LogsRequest};
use super::{parse_payload, RequestHandler};
use crate::error::{AgentError, Result};
use crate::logs::upload::blob_url;
use crate::logs::{
    collect_logs, encode_logs, LogOptions, LogsContentType, LogsEncoding, LogsProvider, LogsUploader,
};
use crate::runtime::adapter::RuntimeInfoProvider;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadLogsPayload {
    sas_url: String,
    #[serde(flatten)]
    request: LogsRequest,
}

/// `uploadlogs` handler
pub struct UploadLogsHandler {
    device_id: String,
    runtime: Arc<dyn RuntimeInfoProvider>,
    logs: Arc<dyn LogsProvider>,
    uploader: Arc<dyn LogsUploader>,
}

impl UploadLogsHandler {
    pub fn new(
        device_id: &str,
        runtime: Arc<dyn RuntimeInfoProvider>,
        logs: Arc<dyn LogsProvider>,
        uploader: Arc<dyn LogsUploader>,
    ) -> Self {
        Self {
            device_id: device_id.to_string(),
            runtime,
            logs,
            uploader,
        }
    }

    fn blob_name(&self, module: &str, content_type: LogsContentType, encoding: LogsEncoding) -> String {
        let extension = match content_type {
            LogsContentType::Json => "json",
            LogsContentType::Text => "log",
        };
        let suffix = match encoding {
            LogsEncoding::None => "",
            LogsEncoding::Zstd => ".zst",
        };
        format!(
            "{}/{}-{}.{}{}",
            self.device_id,
            module,
            Utc::now().format("%Y%m%d%H%M%S"),
            extension,
            suffix
        )
    }

    async fn upload_module(
        &self,
        sas_url: &str,
        module: &str,
        request: &LogsRequest,
        options: &LogOptions,
    ) -> Result<()> {
        let records = collect_logs(self.logs.as_ref(), module, options).await?;
        let payload = encode_logs(&records, request.content_type, request.encoding)?;
        let destination = blob_url(
            sas_url,
            &self.blob_name(module, request.content_type, request.encoding),
        );
        self.uploader.upload(&destination, payload).await
    }
}

#[async_trait]
impl RequestHandler for UploadLogsHandler {
    fn name(&self) -> &str {
        "uploadlogs"
    }

    async fn handle(&self, payload: Option<Value>, cancel: CancellationToken) -> Result<Option<Value>> {
        let payload: UploadLogsPayload = parse_payload(payload)?;
        payload.request.validate()?;
        if payload.sas_url.trim().is_empty() {
            return Err(AgentError::invalid_request("sasUrl must not be empty"));
        }

        let modules = resolve_modules(self.runtime.as_ref(), &payload.request.items).await?;

        let mut uploaded = Vec::new();
        let mut failures = Vec::new();
        for (module, options) in &modules {
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(AgentError::handler_failure("log upload cancelled")),
                result = self.upload_module(&payload.sas_url, module, &payload.request, options) => result,
            };

            match result {
                Ok(()) => uploaded.push(module.clone()),
                Err(e) => {
                    warn!(module = %module, error = %e, "Log upload failed");
                    failures.push(format!("{}: {}", module, e));
                }
            }
        }

        if !failures.is_empty() {
            return Err(AgentError::handler_failure(format!(
                "{} of {} log uploads failed: {}",
                failures.len(),
                modules.len(),
                failures.join("; ")
            )));
        }

        info!(modules = ?uploaded, "Module logs uploaded");
        Ok(Some(json!({ "uploaded": uploaded })))
    }
}
