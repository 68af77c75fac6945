//! Twin Config Source
//!
//! Reads the deployment out of the twin's desired properties and turns every
//! pushed desired document into a change notification.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::codec::decode_deployment;
use super::source::ConfigSource;
use super::types::DeploymentConfigInfo;
use crate::connection::transport::VERSION_KEY;
use crate::error::{AgentError, Result};

const CHANGE_CAPACITY: usize = 16;

/// Desired-properties document access, provided by the connection
#[async_trait]
pub trait DesiredProperties: Send + Sync {
    /// Fetch the full desired document
    async fn get_desired_properties(&self) -> Result<Value>;

    /// Receive every new full desired document
    fn subscribe_desired(&self) -> broadcast::Receiver<Value>;
}

/// Convert a desired document into deployment info.
///
/// Metadata keys (`$version`, `$metadata`, ...) are not part of the
/// deployment. A document with nothing else in it yields the empty info.
pub fn decode_desired(document: Value) -> Result<DeploymentConfigInfo> {
    let Value::Object(mut properties) = document else {
        return Err(AgentError::malformed_config(
            "desired properties must be a JSON object",
        ));
    };

    let version = properties
        .remove(VERSION_KEY)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| AgentError::malformed_config("desired properties carry no $version"))?;
    properties.retain(|key, _| !key.starts_with('$'));

    if properties.is_empty() {
        return Ok(DeploymentConfigInfo::empty());
    }

    let config = decode_deployment(Value::Object(properties))?;
    Ok(DeploymentConfigInfo::new(version, config))
}

/// Primary config source backed by the twin
pub struct TwinConfigSource {
    desired: Arc<dyn DesiredProperties>,
    changes: broadcast::Sender<DeploymentConfigInfo>,
    forwarder: JoinHandle<()>,
}

impl TwinConfigSource {
    pub fn new(desired: Arc<dyn DesiredProperties>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        let forwarder = tokio::spawn(forward_changes(
            desired.subscribe_desired(),
            changes.clone(),
        ));

        Self {
            desired,
            changes,
            forwarder,
        }
    }
}

impl Drop for TwinConfigSource {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

async fn forward_changes(
    mut updates: broadcast::Receiver<Value>,
    changes: broadcast::Sender<DeploymentConfigInfo>,
) {
    loop {
        match updates.recv().await {
            Ok(document) => match decode_desired(document) {
                Ok(info) => {
                    info!(version = info.version, "Deployment changed");
                    // no subscribers is fine
                    let _ = changes.send(info);
                }
                Err(e) => {
                    error!(error = %e, "Pushed deployment is malformed, fix the deployment manifest");
                }
            },
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Desired updates lagged, waiting for the next one");
            }
            Err(RecvError::Closed) => {
                debug!("Desired update stream closed");
                break;
            }
        }
    }
}

#[async_trait]
impl ConfigSource for TwinConfigSource {
    async fn get_config(&self) -> Result<DeploymentConfigInfo> {
        let document = self.desired.get_desired_properties().await?;
        let info = decode_desired(document)?;
        debug!(version = info.version, empty = info.is_empty(), "Read deployment from twin");
        Ok(info)
    }

    fn subscribe(&self) -> broadcast::Receiver<DeploymentConfigInfo> {
        self.changes.subscribe()
    }
}
