//! Workload API Encryption Provider
//!
//! HTTP client for the edge security daemon's workload API. The daemon owns
//! the master key; the agent only ever sees base64 plaintext/ciphertext.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::EncryptionProvider;
use crate::error::{AgentError, Result};

const API_VERSION: &str = "2019-01-30";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EncryptRequest<'a> {
    plaintext: &'a str,
    initialization_vector: &'a str,
}

#[derive(Debug, Deserialize)]
struct EncryptResponse {
    ciphertext: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DecryptRequest<'a> {
    ciphertext: &'a str,
    initialization_vector: &'a str,
}

#[derive(Debug, Deserialize)]
struct DecryptResponse {
    plaintext: String,
}

/// Encryption provider backed by the workload API
pub struct WorkloadEncryptionProvider {
    client: reqwest::Client,
    base_url: String,
    module_id: String,
    generation_id: String,
    initialization_vector: String,
}

impl WorkloadEncryptionProvider {
    /// Create a provider for the given workload endpoint and module identity
    pub fn new(
        workload_uri: &str,
        module_id: &str,
        generation_id: &str,
        initialization_vector: &str,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| AgentError::encryption(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: workload_uri.trim_end_matches('/').to_string(),
            module_id: module_id.to_string(),
            generation_id: generation_id.to_string(),
            initialization_vector: BASE64.encode(initialization_vector.as_bytes()),
        })
    }

    fn endpoint(&self, operation: &str) -> String {
        format!(
            "{}/modules/{}/genid/{}/{}?api-version={}",
            self.base_url, self.module_id, self.generation_id, operation, API_VERSION
        )
    }

    async fn post<B: Serialize, T: for<'de> Deserialize<'de>>(
        &self,
        operation: &str,
        body: &B,
    ) -> Result<T> {
        let url = self.endpoint(operation);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| AgentError::encryption(format!("failed to reach {}: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(AgentError::encryption(format!(
                "{} returned {}: {}",
                operation, status, detail
            )));
        }

        response
            .json()
            .await
            .map_err(|e| AgentError::encryption(format!("invalid {} response: {}", operation, e)))
    }
}

#[async_trait]
impl EncryptionProvider for WorkloadEncryptionProvider {
    async fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let encoded = BASE64.encode(plaintext);
        let request = EncryptRequest {
            plaintext: &encoded,
            initialization_vector: &self.initialization_vector,
        };

        let response: EncryptResponse = self.post("encrypt", &request).await?;
        debug!(bytes = plaintext.len(), "Payload encrypted");

        BASE64
            .decode(response.ciphertext)
            .map_err(|e| AgentError::encryption(format!("ciphertext is not base64: {}", e)))
    }

    async fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let encoded = BASE64.encode(ciphertext);
        let request = DecryptRequest {
            ciphertext: &encoded,
            initialization_vector: &self.initialization_vector,
        };

        let response: DecryptResponse = self.post("decrypt", &request).await?;

        BASE64
            .decode(response.plaintext)
            .map_err(|e| AgentError::encryption(format!("plaintext is not base64: {}", e)))
    }
}
