//! Backup Config Source
//!
//! Decorates a primary [`ConfigSource`] with an encrypted on-disk copy of the
//! last deployment it returned. While the primary answers, every new
//! deployment is backed up; when it fails, the backup is served instead and
//! marked `from_backup`.
//!
//! Fetch, encrypt and write run under one lock, so the backup file has a
//! single writer and concurrent callers queue behind the fetch in flight.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

use super::backup_store::BackupStore;
use super::codec::ConfigCodec;
use super::source::ConfigSource;
use super::types::DeploymentConfigInfo;
use crate::crypto::EncryptionProvider;
use crate::error::{AgentError, Result};

pub struct BackupConfigSource {
    primary: Arc<dyn ConfigSource>,
    encryption: Arc<dyn EncryptionProvider>,
    store: BackupStore,
    codec: Arc<dyn ConfigCodec>,
    /// Deployment currently held in the backup file
    backed_up: Mutex<Option<DeploymentConfigInfo>>,
}

impl BackupConfigSource {
    pub fn new(
        primary: Arc<dyn ConfigSource>,
        encryption: Arc<dyn EncryptionProvider>,
        store: BackupStore,
        codec: Arc<dyn ConfigCodec>,
    ) -> Self {
        Self {
            primary,
            encryption,
            store,
            codec,
            backed_up: Mutex::new(None),
        }
    }

    async fn write_backup(&self, info: &DeploymentConfigInfo) -> Result<()> {
        let plaintext = self.codec.encode(info)?;
        let ciphertext = self.encryption.encrypt(&plaintext).await?;
        self.store.write(&ciphertext).await
    }

    async fn read_backup(&self) -> Result<DeploymentConfigInfo> {
        let ciphertext = self.store.read().await?.ok_or_else(|| {
            AgentError::backup_unavailable(format!(
                "no backup at {}",
                self.store.path().display()
            ))
        })?;
        let plaintext = self.encryption.decrypt(&ciphertext).await?;
        self.codec.decode(&plaintext)
    }
}

#[async_trait]
impl ConfigSource for BackupConfigSource {
    async fn get_config(&self) -> Result<DeploymentConfigInfo> {
        let mut backed_up = self.backed_up.lock().await;

        let primary_err = match self.primary.get_config().await {
            Ok(info) => {
                if backed_up.as_ref() == Some(&info) {
                    debug!(version = info.version, "Deployment unchanged, backup kept");
                } else {
                    match self.write_backup(&info).await {
                        Ok(()) => {
                            info!(version = info.version, "Deployment backed up");
                            *backed_up = Some(info.clone());
                        }
                        Err(e) => warn!(error = %e, "Failed to back up deployment"),
                    }
                }
                return Ok(info);
            }
            Err(e) => e,
        };

        if primary_err.is_malformed_config() {
            error!(error = %primary_err, "Deployment from the cloud is malformed, fix the deployment manifest");
        } else {
            warn!(error = %primary_err, "Cloud config source unavailable, trying backup");
        }

        let restored = match backed_up.as_ref() {
            Some(info) => Ok(info.clone()),
            None => self.read_backup().await,
        };

        match restored {
            Ok(info) => {
                info!(version = info.version, "Serving deployment from backup");
                *backed_up = Some(info.clone());
                Ok(info.into_backup())
            }
            Err(e) => {
                warn!(error = %e, "No usable backup");
                Err(primary_err)
            }
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<DeploymentConfigInfo> {
        self.primary.subscribe()
    }
}
