//! State collection
//!
//! Rebuilds the [`AgentState`] snapshot from the runtime's current view and
//! the deployment the agent is working from.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use super::state::{
    AgentState, DeploymentStatus, DockerReportedModule, DockerReportedRuntime, Platform,
    ReportedModule, ReportedRuntimeInfo, ReportedSettings, ReportedSystemModules, VersionInfo,
    REPORTED_SCHEMA_VERSION,
};
use crate::deployment::types::{
    DeploymentConfigInfo, ModuleSpec, EDGE_AGENT_MODULE, EDGE_HUB_MODULE,
};
use crate::error::Result;
use crate::runtime::adapter::{ModuleRuntimeInfo, RuntimeInfoProvider, SystemInfo};
use crate::tagged::{encode_shape, UnknownEntity, DOCKER_TYPE};

/// Builds reportable snapshots from the runtime
pub struct StateCollector {
    runtime: Arc<dyn RuntimeInfoProvider>,
    version: VersionInfo,
}

impl StateCollector {
    pub fn new(runtime: Arc<dyn RuntimeInfoProvider>) -> Self {
        Self {
            runtime,
            version: VersionInfo::current(),
        }
    }

    /// Snapshot the runtime against `deployment`, tagging it with `status`
    pub async fn collect(
        &self,
        deployment: Option<&DeploymentConfigInfo>,
        status: DeploymentStatus,
    ) -> Result<AgentState> {
        let runtime_type = self.runtime.runtime_type().to_string();
        let system_info = self.runtime.system_info().await?;
        let modules = self.runtime.list_modules().await?;
        debug!(runtime = %runtime_type, modules = modules.len(), "Collected runtime state");

        let mut state = AgentState {
            schema_version: REPORTED_SCHEMA_VERSION.to_string(),
            version: self.version.clone(),
            last_desired_version: deployment.filter(|d| !d.is_empty()).map(|d| d.version),
            last_desired_status: Some(status),
            runtime: runtime_info(&runtime_type, system_info)?,
            system_modules: ReportedSystemModules::default(),
            modules: BTreeMap::new(),
        };

        for module in modules {
            let desired = deployment.and_then(|d| desired_spec(d, &module.name));
            let reported = reported_module(&runtime_type, &module, desired)?;

            match module.name.as_str() {
                EDGE_AGENT_MODULE => state.system_modules.edge_agent = Some(reported),
                EDGE_HUB_MODULE => state.system_modules.edge_hub = Some(reported),
                _ => {
                    state.modules.insert(module.name.clone(), reported);
                }
            }
        }

        Ok(state)
    }
}

fn desired_spec<'a>(deployment: &'a DeploymentConfigInfo, name: &str) -> Option<&'a ModuleSpec> {
    let config = &deployment.deployment_config;
    match name {
        EDGE_AGENT_MODULE => config.system_modules.edge_agent.as_ref(),
        EDGE_HUB_MODULE => config.system_modules.edge_hub.as_ref(),
        _ => config.modules.get(name),
    }
}

fn runtime_info(runtime_type: &str, info: SystemInfo) -> Result<ReportedRuntimeInfo> {
    let docker = DockerReportedRuntime {
        platform: Platform {
            os: info.os_type,
            architecture: info.architecture,
            version: info.runtime_version,
        },
    };

    if runtime_type == DOCKER_TYPE {
        return Ok(ReportedRuntimeInfo::Docker(docker));
    }
    Ok(ReportedRuntimeInfo::Unknown(UnknownEntity {
        type_tag: runtime_type.to_string(),
        properties: encode_shape(&docker)?,
    }))
}

fn reported_module(
    runtime_type: &str,
    module: &ModuleRuntimeInfo,
    desired: Option<&ModuleSpec>,
) -> Result<ReportedModule> {
    let desired = match desired {
        Some(ModuleSpec::Docker(spec)) => Some(spec),
        _ => None,
    };

    let reported = DockerReportedModule {
        version: desired.and_then(|d| d.version.clone()),
        status: desired.map(|d| d.status),
        restart_policy: desired.map(|d| d.restart_policy),
        runtime_status: module.status,
        exit_code: module.exit_code,
        start_time_utc: module.started_at,
        last_exit_time_utc: module.exited_at,
        settings: ReportedSettings {
            image: module.image.clone(),
        },
    };

    if runtime_type == DOCKER_TYPE {
        return Ok(ReportedModule::Docker(reported));
    }
    Ok(ReportedModule::Unknown(UnknownEntity {
        type_tag: runtime_type.to_string(),
        properties: encode_shape(&reported)?,
    }))
}
