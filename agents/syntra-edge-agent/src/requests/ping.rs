//! Liveness request

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::RequestHandler;
use crate::error::Result;

/// Always succeeds with an empty payload
pub struct PingHandler;

#[async_trait]
impl RequestHandler for PingHandler {
    fn name(&self) -> &str {
        "ping"
    }

    async fn handle(&self, _payload: Option<Value>, _cancel: CancellationToken) -> Result<Option<Value>> {
        Ok(None)
    }
}
