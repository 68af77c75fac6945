//! Deployment Configuration Types
//!
//! The desired module set and runtime settings for a device, as carried in
//! the twin's desired properties.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::error::{AgentError, Result};
use crate::tagged::{
    decode_shape, deserialize_tagged, encode_shape, serialize_tagged, TypeTagged, UnknownEntity,
    DOCKER_TYPE,
};

/// Major schema version this agent understands
pub const SUPPORTED_SCHEMA_MAJOR: &str = "1";

/// Version used for an empty configuration
pub const EMPTY_VERSION: i64 = -1;

/// Name of the agent's own module
pub const EDGE_AGENT_MODULE: &str = "edgeAgent";

/// Name of the hub module
pub const EDGE_HUB_MODULE: &str = "edgeHub";

/// Desired deployment for the device. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentConfig {
    pub schema_version: String,
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub system_modules: SystemModules,
    #[serde(default)]
    pub modules: BTreeMap<String, ModuleSpec>,
}

/// The agent's own module and the hub module
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemModules {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge_agent: Option<ModuleSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge_hub: Option<ModuleSpec>,
}

/// Runtime settings, selected by the `type` tag
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeConfig {
    Docker(DockerRuntimeConfig),
    Unknown(UnknownEntity),
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerRuntimeConfig {
    #[serde(default)]
    pub settings: DockerRuntimeSettings,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerRuntimeSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_docker_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logging_options: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub registry_credentials: BTreeMap<String, RegistryCredential>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryCredential {
    pub address: String,
    pub username: String,
    pub password: String,
}

/// A module definition, selected by the `type` tag
#[derive(Debug, Clone, PartialEq)]
pub enum ModuleSpec {
    Docker(DockerModule),
    Unknown(UnknownEntity),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerModule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub status: ModuleStatus,
    #[serde(default)]
    pub restart_policy: RestartPolicy,
    pub settings: DockerSettings,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, EnvValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerSettings {
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_options: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvValue {
    pub value: String,
}

/// Desired run state of a module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleStatus {
    #[default]
    Running,
    Stopped,
}

/// Module restart policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    Never,
    OnFailure,
    OnUnhealthy,
    #[default]
    Always,
}

/// A parsed configuration plus its version and provenance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentConfigInfo {
    /// Desired properties `$version` this config was read from
    pub version: i64,
    pub deployment_config: DeploymentConfig,
    /// Set when served from the local backup; never persisted
    #[serde(skip)]
    pub from_backup: bool,
}

impl DeploymentConfigInfo {
    pub fn new(version: i64, deployment_config: DeploymentConfig) -> Self {
        Self {
            version,
            deployment_config,
            from_backup: false,
        }
    }

    /// Info for a twin that carries no deployment yet
    pub fn empty() -> Self {
        Self::new(EMPTY_VERSION, DeploymentConfig::empty())
    }

    pub fn is_empty(&self) -> bool {
        self.version == EMPTY_VERSION
    }

    /// Same snapshot, marked as served from the backup
    pub fn into_backup(mut self) -> Self {
        self.from_backup = true;
        self
    }
}

impl DeploymentConfig {
    pub fn empty() -> Self {
        Self {
            schema_version: format!("{}.0", SUPPORTED_SCHEMA_MAJOR),
            runtime: RuntimeConfig::Docker(DockerRuntimeConfig::default()),
            system_modules: SystemModules::default(),
            modules: BTreeMap::new(),
        }
    }

    /// Reject documents this agent cannot act on
    pub fn validate(&self) -> Result<()> {
        let major = self.schema_version.split('.').next().unwrap_or_default();
        if major != SUPPORTED_SCHEMA_MAJOR {
            return Err(AgentError::malformed_config(format!(
                "unsupported schema version '{}'",
                self.schema_version
            )));
        }

        for (name, module) in &self.modules {
            if name.trim().is_empty() {
                return Err(AgentError::malformed_config("module name must not be empty"));
            }
            module.validate(name)?;
        }

        if let Some(agent) = &self.system_modules.edge_agent {
            agent.validate(EDGE_AGENT_MODULE)?;
        }
        if let Some(hub) = &self.system_modules.edge_hub {
            hub.validate(EDGE_HUB_MODULE)?;
        }

        Ok(())
    }
}

impl ModuleSpec {
    fn validate(&self, name: &str) -> Result<()> {
        match self {
            ModuleSpec::Docker(module) if module.settings.image.trim().is_empty() => Err(
                AgentError::malformed_config(format!("modules.{}.settings.image is empty", name)),
            ),
            _ => Ok(()),
        }
    }
}

impl TypeTagged for RuntimeConfig {
    fn type_tag(&self) -> &str {
        match self {
            RuntimeConfig::Docker(_) => DOCKER_TYPE,
            RuntimeConfig::Unknown(u) => &u.type_tag,
        }
    }

    fn to_properties(&self) -> serde_json::Result<Map<String, Value>> {
        match self {
            RuntimeConfig::Docker(docker) => encode_shape(docker),
            RuntimeConfig::Unknown(u) => Ok(u.properties.clone()),
        }
    }

    fn from_tagged(tag: &str, properties: Map<String, Value>) -> serde_json::Result<Self> {
        match tag {
            DOCKER_TYPE => decode_shape(properties).map(RuntimeConfig::Docker),
            _ => Ok(RuntimeConfig::Unknown(UnknownEntity {
                type_tag: tag.to_string(),
                properties,
            })),
        }
    }
}

impl TypeTagged for ModuleSpec {
    fn type_tag(&self) -> &str {
        match self {
            ModuleSpec::Docker(_) => DOCKER_TYPE,
            ModuleSpec::Unknown(u) => &u.type_tag,
        }
    }

    fn to_properties(&self) -> serde_json::Result<Map<String, Value>> {
        match self {
            ModuleSpec::Docker(module) => encode_shape(module),
            ModuleSpec::Unknown(u) => Ok(u.properties.clone()),
        }
    }

    fn from_tagged(tag: &str, properties: Map<String, Value>) -> serde_json::Result<Self> {
        match tag {
            DOCKER_TYPE => decode_shape(properties).map(ModuleSpec::Docker),
            _ => Ok(ModuleSpec::Unknown(UnknownEntity {
                type_tag: tag.to_string(),
                properties,
            })),
        }
    }
}

impl Serialize for RuntimeConfig {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serialize_tagged(self, serializer)
    }
}

impl<'de> Deserialize<'de> for RuntimeConfig {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserialize_tagged(deserializer)
    }
}

impl Serialize for ModuleSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serialize_tagged(self, serializer)
    }
}

impl<'de> Deserialize<'de> for ModuleSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserialize_tagged(deserializer)
    }
}
