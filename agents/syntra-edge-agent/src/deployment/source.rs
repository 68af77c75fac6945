//! Config source interface

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::types::DeploymentConfigInfo;
use crate::error::Result;

/// Where the agent reads its deployment from
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// Fetch the current deployment.
    ///
    /// `Disconnected` and `MalformedConfig` are distinct: the first means the
    /// cloud could not be asked, the second that it answered with a document
    /// that does not validate.
    async fn get_config(&self) -> Result<DeploymentConfigInfo>;

    /// Receive each new deployment pushed by the cloud
    fn subscribe(&self) -> broadcast::Receiver<DeploymentConfigInfo>;
}
