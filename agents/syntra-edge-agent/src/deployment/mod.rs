//! Deployment configuration
//!
//! Types for the desired deployment, the codec that validates it, and the
//! config sources the rest of the agent reads it through: the twin-backed
//! primary and the encrypted local backup that wraps it.

pub mod backup;
pub mod backup_store;
pub mod codec;
pub mod source;
pub mod twin;
pub mod types;

pub use backup::BackupConfigSource;
pub use backup_store::BackupStore;
pub use codec::{ConfigCodec, JsonConfigCodec};
pub use source::ConfigSource;
pub use twin::{DesiredProperties, TwinConfigSource};
pub use types::{DeploymentConfig, DeploymentConfigInfo};
