//! Runtime Info Provider Trait
//!
//! Defines what the agent needs to know from the module runtime: which
//! modules exist, how they are doing, and how to restart one.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Runtime status of a module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleRuntimeStatus {
    Created,
    Running,
    Paused,
    Restarting,
    Exited,
    Dead,
    Unknown,
}

impl std::fmt::Display for ModuleRuntimeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModuleRuntimeStatus::Created => write!(f, "created"),
            ModuleRuntimeStatus::Running => write!(f, "running"),
            ModuleRuntimeStatus::Paused => write!(f, "paused"),
            ModuleRuntimeStatus::Restarting => write!(f, "restarting"),
            ModuleRuntimeStatus::Exited => write!(f, "exited"),
            ModuleRuntimeStatus::Dead => write!(f, "dead"),
            ModuleRuntimeStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Module information returned by the runtime
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleRuntimeInfo {
    pub name: String,
    pub image: String,
    pub status: ModuleRuntimeStatus,
    pub exit_code: Option<i64>,
    pub started_at: Option<DateTime<Utc>>,
    pub exited_at: Option<DateTime<Utc>>,
}

/// Host and runtime details
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SystemInfo {
    pub os_type: String,
    pub architecture: String,
    pub runtime_version: String,
}

/// Runtime info provider trait - what the agent consumes from the module runtime
#[async_trait]
pub trait RuntimeInfoProvider: Send + Sync {
    /// Get the runtime type name, used as the reported type tag
    fn runtime_type(&self) -> &str;

    /// Get host and runtime details
    async fn system_info(&self) -> Result<SystemInfo>;

    /// List all modules, running or not
    async fn list_modules(&self) -> Result<Vec<ModuleRuntimeInfo>>;

    /// Restart a module by name
    async fn restart_module(&self, name: &str) -> Result<()>;
}
