//! Reported State Types
//!
//! The snapshot the agent writes into the twin's reported properties. Runtime
//! info and module entries are type-tagged; entries from a runtime this node
//! does not know are carried as [`UnknownEntity`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::deployment::types::{ModuleStatus, RestartPolicy};
use crate::error::AgentError;
use crate::runtime::adapter::ModuleRuntimeStatus;
use crate::tagged::{
    decode_shape, deserialize_tagged, encode_shape, serialize_tagged, TypeTagged, UnknownEntity,
    DOCKER_TYPE,
};

/// Schema version of the reported document
pub const REPORTED_SCHEMA_VERSION: &str = "1.0";

/// Deployment outcome codes
pub mod deployment_code {
    pub const SUCCESSFUL: u16 = 200;
    pub const CONFIG_FORMAT_ERROR: u16 = 400;
    pub const UNKNOWN: u16 = 406;
    pub const INVALID_SCHEMA_VERSION: u16 = 412;
    pub const CONFIG_EMPTY: u16 = 417;
    pub const FAILED: u16 = 500;
}

/// Snapshot of the agent and its modules
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentState {
    pub schema_version: String,
    pub version: VersionInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_desired_version: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_desired_status: Option<DeploymentStatus>,
    pub runtime: ReportedRuntimeInfo,
    #[serde(default)]
    pub system_modules: ReportedSystemModules,
    #[serde(default)]
    pub modules: BTreeMap<String, ReportedModule>,
}

/// Build identity of the running agent
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    #[serde(default)]
    pub build: String,
    #[serde(default)]
    pub commit: String,
}

impl VersionInfo {
    /// Identity of this binary; build and commit come from the build environment
    pub fn current() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            build: option_env!("SYNTRA_BUILD_ID").unwrap_or_default().to_string(),
            commit: option_env!("SYNTRA_GIT_COMMIT").unwrap_or_default().to_string(),
        }
    }
}

/// Result of applying the last desired configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentStatus {
    pub code: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl DeploymentStatus {
    pub fn new(code: u16, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
        }
    }

    pub fn successful() -> Self {
        Self::new(deployment_code::SUCCESSFUL, "")
    }

    /// Status for a configuration fetch that produced no usable config
    pub fn from_error(err: &AgentError) -> Self {
        let code = match err {
            AgentError::MalformedConfig(msg) if msg.contains("schema version") => {
                deployment_code::INVALID_SCHEMA_VERSION
            }
            AgentError::MalformedConfig(_) => deployment_code::CONFIG_FORMAT_ERROR,
            AgentError::Disconnected(_) | AgentError::BackupUnavailable(_) => {
                deployment_code::UNKNOWN
            }
            _ => deployment_code::FAILED,
        };
        Self::new(code, err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportedSystemModules {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge_agent: Option<ReportedModule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge_hub: Option<ReportedModule>,
}

/// Runtime details, selected by the `type` tag
#[derive(Debug, Clone, PartialEq)]
pub enum ReportedRuntimeInfo {
    Docker(DockerReportedRuntime),
    Unknown(UnknownEntity),
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DockerReportedRuntime {
    pub platform: Platform,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
    #[serde(default)]
    pub version: String,
}

/// A module's observed state, selected by the `type` tag
#[derive(Debug, Clone, PartialEq)]
pub enum ReportedModule {
    Docker(DockerReportedModule),
    Unknown(UnknownEntity),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerReportedModule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Desired run state, when the module is part of the deployment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ModuleStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<RestartPolicy>,
    pub runtime_status: ModuleRuntimeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time_utc: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_exit_time_utc: Option<DateTime<Utc>>,
    pub settings: ReportedSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportedSettings {
    pub image: String,
}

impl TypeTagged for ReportedRuntimeInfo {
    fn type_tag(&self) -> &str {
        match self {
            ReportedRuntimeInfo::Docker(_) => DOCKER_TYPE,
            ReportedRuntimeInfo::Unknown(u) => &u.type_tag,
        }
    }

    fn to_properties(&self) -> serde_json::Result<Map<String, Value>> {
        match self {
            ReportedRuntimeInfo::Docker(docker) => encode_shape(docker),
            ReportedRuntimeInfo::Unknown(u) => Ok(u.properties.clone()),
        }
    }

    fn from_tagged(tag: &str, properties: Map<String, Value>) -> serde_json::Result<Self> {
        match tag {
            DOCKER_TYPE => decode_shape(properties).map(ReportedRuntimeInfo::Docker),
            _ => Ok(ReportedRuntimeInfo::Unknown(UnknownEntity {
                type_tag: tag.to_string(),
                properties,
            })),
        }
    }
}

impl TypeTagged for ReportedModule {
    fn type_tag(&self) -> &str {
        match self {
            ReportedModule::Docker(_) => DOCKER_TYPE,
            ReportedModule::Unknown(u) => &u.type_tag,
        }
    }

    fn to_properties(&self) -> serde_json::Result<Map<String, Value>> {
        match self {
            ReportedModule::Docker(module) => encode_shape(module),
            ReportedModule::Unknown(u) => Ok(u.properties.clone()),
        }
    }

    fn from_tagged(tag: &str, properties: Map<String, Value>) -> serde_json::Result<Self> {
        match tag {
            DOCKER_TYPE => decode_shape(properties).map(ReportedModule::Docker),
            _ => Ok(ReportedModule::Unknown(UnknownEntity {
                type_tag: tag.to_string(),
                properties,
            })),
        }
    }
}

impl Serialize for ReportedRuntimeInfo {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serialize_tagged(self, serializer)
    }
}

impl<'de> Deserialize<'de> for ReportedRuntimeInfo {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserialize_tagged(deserializer)
    }
}

impl Serialize for ReportedModule {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serialize_tagged(self, serializer)
    }
}

impl<'de> Deserialize<'de> for ReportedModule {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserialize_tagged(deserializer)
    }
}
