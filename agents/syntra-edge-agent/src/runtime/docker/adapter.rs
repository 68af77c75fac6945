//! Docker Runtime
//!
//! Implementation of RuntimeInfoProvider and LogsProvider for Docker using
//! the bollard library. Only containers carrying the managed label are
//! treated as modules.

use async_trait::async_trait;
use bollard::container::{ListContainersOptions, LogsOptions as BollardLogsOptions};
use bollard::service::ContainerStateStatusEnum;
use bollard::Docker;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::error::{AgentError, Result};
use crate::logs::{parse_log_line, LogOptions, LogRecord, LogsProvider};
use crate::runtime::adapter::{
    ModuleRuntimeInfo, ModuleRuntimeStatus, RuntimeInfoProvider, SystemInfo,
};
use crate::tagged::DOCKER_TYPE;

/// Label marking containers owned by the agent
pub const MANAGED_LABEL: &str = "syntra.managed=true";

/// Docker runtime
#[derive(Clone)]
pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    /// Connect to the default socket
    pub fn new() -> Result<Self> {
        let client = Docker::connect_with_socket_defaults().map_err(runtime_error)?;
        Ok(Self { client })
    }

    /// Connect to a custom socket path
    pub fn with_socket(socket_path: &str) -> Result<Self> {
        let client = Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
            .map_err(runtime_error)?;
        Ok(Self { client })
    }

    /// Convert bollard container state to our ModuleRuntimeStatus
    fn parse_status(state: Option<&ContainerStateStatusEnum>) -> ModuleRuntimeStatus {
        match state {
            Some(ContainerStateStatusEnum::CREATED) => ModuleRuntimeStatus::Created,
            Some(ContainerStateStatusEnum::RUNNING) => ModuleRuntimeStatus::Running,
            Some(ContainerStateStatusEnum::PAUSED) => ModuleRuntimeStatus::Paused,
            Some(ContainerStateStatusEnum::RESTARTING) => ModuleRuntimeStatus::Restarting,
            Some(ContainerStateStatusEnum::EXITED) => ModuleRuntimeStatus::Exited,
            Some(ContainerStateStatusEnum::DEAD) => ModuleRuntimeStatus::Dead,
            _ => ModuleRuntimeStatus::Unknown,
        }
    }

    /// Docker reports unset times as the zero time
    fn parse_time(value: Option<&String>) -> Option<DateTime<Utc>> {
        let parsed = DateTime::parse_from_rfc3339(value?).ok()?.with_timezone(&Utc);
        (parsed.timestamp() > 0).then_some(parsed)
    }

    async fn inspect_module(&self, name: &str) -> Result<ModuleRuntimeInfo> {
        let container = self
            .client
            .inspect_container(name, None)
            .await
            .map_err(runtime_error)?;

        let state = container.state.as_ref();
        let status = Self::parse_status(state.and_then(|s| s.status.as_ref()));

        Ok(ModuleRuntimeInfo {
            name: name.to_string(),
            image: container
                .config
                .as_ref()
                .and_then(|c| c.image.clone())
                .unwrap_or_default(),
            status,
            exit_code: match status {
                ModuleRuntimeStatus::Exited | ModuleRuntimeStatus::Dead => {
                    state.and_then(|s| s.exit_code)
                }
                _ => None,
            },
            started_at: Self::parse_time(state.and_then(|s| s.started_at.as_ref())),
            exited_at: Self::parse_time(state.and_then(|s| s.finished_at.as_ref())),
        })
    }
}

fn runtime_error(err: bollard::errors::Error) -> AgentError {
    AgentError::handler_failure(format!("docker: {}", err))
}

#[async_trait]
impl RuntimeInfoProvider for DockerRuntime {
    fn runtime_type(&self) -> &str {
        DOCKER_TYPE
    }

    async fn system_info(&self) -> Result<SystemInfo> {
        let version = self.client.version().await.map_err(runtime_error)?;
        Ok(SystemInfo {
            os_type: version.os.unwrap_or_default(),
            architecture: version.arch.unwrap_or_default(),
            runtime_version: version.version.unwrap_or_default(),
        })
    }

    async fn list_modules(&self) -> Result<Vec<ModuleRuntimeInfo>> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![MANAGED_LABEL.to_string()]);

        let options = ListContainersOptions::<String> {
            all: true,
            filters,
            ..Default::default()
        };

        let containers = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(runtime_error)?;

        let mut modules = Vec::with_capacity(containers.len());
        for container in containers {
            let Some(name) = container
                .names
                .and_then(|n| n.first().cloned())
                .map(|n| n.trim_start_matches('/').to_string())
            else {
                continue;
            };

            match self.inspect_module(&name).await {
                Ok(module) => modules.push(module),
                // removed between list and inspect
                Err(e) => debug!(module = %name, error = %e, "Skipping module"),
            }
        }

        Ok(modules)
    }

    async fn restart_module(&self, name: &str) -> Result<()> {
        self.client
            .restart_container(name, None)
            .await
            .map_err(runtime_error)?;
        info!(module = %name, "Module restarted");
        Ok(())
    }
}

impl LogsProvider for DockerRuntime {
    fn get_logs(&self, module: &str, options: &LogOptions) -> BoxStream<'static, Result<LogRecord>> {
        let bollard_options = BollardLogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: options.follow,
            timestamps: true,
            tail: options
                .tail
                .map(|t| t.to_string())
                .unwrap_or_else(|| "all".to_string()),
            since: options.since.unwrap_or(0),
            until: options.until.unwrap_or(0),
            ..Default::default()
        };

        let module = module.to_string();
        let chunks = self.client.logs(&module, Some(bollard_options));
        chunks
            .flat_map(move |chunk| {
                let records: Vec<Result<LogRecord>> = match chunk {
                    Ok(output) => output
                        .to_string()
                        .lines()
                        .filter(|line| !line.is_empty())
                        .map(|line| Ok(parse_log_line(&module, line)))
                        .collect(),
                    Err(e) => {
                        warn!(module = %module, error = %e, "Error reading log");
                        vec![Err(runtime_error(e))]
                    }
                };
                futures_util::stream::iter(records)
            })
            .boxed()
    }
}
