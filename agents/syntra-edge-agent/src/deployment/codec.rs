//! Config Codec
//!
//! Converts deployment configuration to and from bytes. Decoding validates
//! the document, so anything that comes out of the codec is safe to act on
//! and safe to back up.

use serde_json::Value;

use super::types::{DeploymentConfig, DeploymentConfigInfo};
use crate::error::{AgentError, Result};

/// Serializes and deserializes [`DeploymentConfigInfo`]
pub trait ConfigCodec: Send + Sync {
    fn encode(&self, info: &DeploymentConfigInfo) -> Result<Vec<u8>>;

    fn decode(&self, bytes: &[u8]) -> Result<DeploymentConfigInfo>;
}

/// JSON codec, tolerant of unknown module and runtime type tags
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonConfigCodec;

impl ConfigCodec for JsonConfigCodec {
    fn encode(&self, info: &DeploymentConfigInfo) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(info)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<DeploymentConfigInfo> {
        let info: DeploymentConfigInfo = serde_json::from_slice(bytes)
            .map_err(|e| AgentError::malformed_config(format!("invalid deployment info: {}", e)))?;
        info.deployment_config.validate()?;
        Ok(info)
    }
}

/// Parse and validate a deployment document
pub fn decode_deployment(document: Value) -> Result<DeploymentConfig> {
    let config: DeploymentConfig = serde_json::from_value(document)
        .map_err(|e| AgentError::malformed_config(e.to_string()))?;
    config.validate()?;
    Ok(config)
}
