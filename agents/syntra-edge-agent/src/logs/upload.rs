//! HTTP Logs Uploader
//!
//! Uploads log payloads to a blob container addressed by a SAS URL.

use async_trait::async_trait;
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use tracing::info;

use super::LogsUploader;
use crate::error::{AgentError, Result};

/// Uploader that `PUT`s each payload as a block blob
pub struct HttpLogsUploader {
    client: reqwest::Client,
}

impl HttpLogsUploader {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| AgentError::handler_failure(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

/// Insert a blob name into a container SAS URL.
///
/// `https://acct/container?sig` becomes `https://acct/container/blob?sig`.
pub fn blob_url(sas_url: &str, blob_name: &str) -> String {
    match sas_url.split_once('?') {
        Some((base, query)) => format!("{}/{}?{}", base.trim_end_matches('/'), blob_name, query),
        None => format!("{}/{}", sas_url.trim_end_matches('/'), blob_name),
    }
}

#[async_trait]
impl LogsUploader for HttpLogsUploader {
    async fn upload(&self, destination: &str, payload: Vec<u8>) -> Result<()> {
        let bytes = payload.len();
        let response = self
            .client
            .put(destination)
            .header("x-ms-blob-type", HeaderValue::from_static("BlockBlob"))
            .header(CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"))
            .body(payload)
            .send()
            .await
            .map_err(|e| AgentError::handler_failure(format!("log upload failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AgentError::handler_failure(format!(
                "log upload rejected with status {}",
                status
            )));
        }

        // never log the destination, it carries the SAS signature
        info!(bytes, status = %status, "Logs uploaded");
        Ok(())
    }
}
