//! Inline logs request
//!
//! Returns module logs in the response itself. Compressed payloads are
//! base64-encoded so they survive the JSON response.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::log_items::{resolve_modules, LogsRequest};
use super::{parse_payload, RequestHandler};
use crate::error::{AgentError, Result};
use crate::logs::{collect_logs, encode_logs, LogsEncoding, LogsProvider};
use crate::runtime::adapter::RuntimeInfoProvider;

/// `getlogs` handler
pub struct GetLogsHandler {
    runtime: Arc<dyn RuntimeInfoProvider>,
    logs: Arc<dyn LogsProvider>,
}

impl GetLogsHandler {
    pub fn new(runtime: Arc<dyn RuntimeInfoProvider>, logs: Arc<dyn LogsProvider>) -> Self {
        Self { runtime, logs }
    }
}

#[async_trait]
impl RequestHandler for GetLogsHandler {
    fn name(&self) -> &str {
        "getlogs"
    }

    async fn handle(&self, payload: Option<Value>, cancel: CancellationToken) -> Result<Option<Value>> {
        let request: LogsRequest = parse_payload(payload)?;
        request.validate()?;

        let modules = resolve_modules(self.runtime.as_ref(), &request.items).await?;

        let mut entries = Vec::with_capacity(modules.len());
        for (module, options) in &modules {
            let records = tokio::select! {
                _ = cancel.cancelled() => return Err(AgentError::handler_failure("log read cancelled")),
                records = collect_logs(self.logs.as_ref(), module, options) => records?,
            };
            let bytes = encode_logs(&records, request.content_type, request.encoding)?;

            let payload = match request.encoding {
                LogsEncoding::None => Value::String(String::from_utf8_lossy(&bytes).into_owned()),
                LogsEncoding::Zstd => Value::String(BASE64.encode(&bytes)),
            };
            entries.push(json!({
                "moduleId": module,
                "contentType": request.content_type,
                "encoding": request.encoding,
                "payload": payload,
            }));
        }

        Ok(Some(Value::Array(entries)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{StaticLogsProvider, StaticRuntime};

    fn handler() -> GetLogsHandler {
        GetLogsHandler::new(
            Arc::new(StaticRuntime::with_modules(&["sensor"])),
            Arc::new(StaticLogsProvider::new().with_lines("sensor", &["<6> a", "<6> b", "<6> c"])),
        )
    }

    #[tokio::test]
    async fn test_returns_text_inline() {
        let payload = json!({
            "schemaVersion": "1.0",
            "items": [{ "id": "sensor", "filter": { "tail": 2 } }],
            "contentType": "text"
        });

        let result = handler()
            .handle(Some(payload), CancellationToken::new())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(result[0]["moduleId"], "sensor");
        assert_eq!(result[0]["payload"], "<6> b\n<6> c\n");
    }

    #[tokio::test]
    async fn test_zstd_payload_is_base64() {
        let payload = json!({
            "schemaVersion": "1.0",
            "items": [{ "id": "sensor" }],
            "encoding": "zstd",
            "contentType": "text"
        });

        let result = handler()
            .handle(Some(payload), CancellationToken::new())
            .await
            .unwrap()
            .unwrap();

        let packed = BASE64.decode(result[0]["payload"].as_str().unwrap()).unwrap();
        let text = zstd::decode_all(packed.as_slice()).unwrap();
        assert_eq!(text, b"<6> a\n<6> b\n<6> c\n");
    }

    #[tokio::test]
    async fn test_bad_schema_version() {
        let payload = json!({ "schemaVersion": "2.0", "items": [{ "id": "sensor" }] });
        let err = handler()
            .handle(Some(payload), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::InvalidRequest(_)));
    }
}
