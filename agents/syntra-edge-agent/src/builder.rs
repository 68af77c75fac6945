//! Agent composition
//!
//! Wires the collaborators together by hand, leaf first. [`build_agent`]
//! creates the concrete ones from the config; [`assemble`] takes them
//! ready-made.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cli::config::Config;
use crate::connection::agent::AgentConnection;
use crate::connection::transport::CloudTransport;
use crate::connection::websocket::WebSocketTransport;
use crate::crypto::{EncryptionProvider, WorkloadEncryptionProvider};
use crate::deployment::{
    BackupConfigSource, BackupStore, ConfigSource, JsonConfigCodec, TwinConfigSource,
};
use crate::logs::{HttpLogsUploader, LogsProvider, LogsUploader};
use crate::reporting::{StateCollector, StateRefresh, StateReporter};
use crate::requests::{
    GetLogsHandler, PingHandler, RequestHandler, RequestManager, RestartModuleHandler,
    UploadLogsHandler,
};
use crate::runtime::adapter::RuntimeInfoProvider;
use crate::runtime::docker::DockerRuntime;
use crate::streams::{
    EnabledStreamListener, LogsStreamHandler, NullStreamListener, StreamHandlerRegistry,
    StreamRequestListener,
};

/// Stream name served by [`LogsStreamHandler`]
pub const LOGS_STREAM: &str = "logs";

/// External collaborators the agent is built around
pub struct Collaborators {
    pub transport: Arc<dyn CloudTransport>,
    pub encryption: Arc<dyn EncryptionProvider>,
    pub runtime: Arc<dyn RuntimeInfoProvider>,
    pub logs: Arc<dyn LogsProvider>,
    pub uploader: Arc<dyn LogsUploader>,
}

/// A running agent
pub struct Agent {
    connection: Arc<AgentConnection>,
    config_source: Arc<dyn ConfigSource>,
    watcher: JoinHandle<()>,
    cancel: CancellationToken,
}

impl Agent {
    pub fn connection(&self) -> &Arc<AgentConnection> {
        &self.connection
    }

    /// Current deployment, falling back to the local backup
    pub fn config_source(&self) -> &Arc<dyn ConfigSource> {
        &self.config_source
    }

    /// Stop background work and close the connection
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.watcher.await;
        self.connection.close().await;
    }
}

/// Build the agent from configuration. Must be called inside a Tokio runtime.
pub fn build_agent(config: &Config) -> Result<Agent> {
    let encryption = WorkloadEncryptionProvider::new(
        &config.encryption.workload_uri,
        &config.encryption.module_id,
        &config.encryption.generation_id,
        config.initialization_vector(),
    )
    .context("Failed to create encryption provider")?;

    let docker = Arc::new(
        DockerRuntime::with_socket(&config.runtime.docker_socket)
            .context("Failed to initialize Docker runtime")?,
    );

    let transport = WebSocketTransport::builder(&config.connection.url, &config.device_id)
        .hub_hostname(&config.hub_hostname)
        .reconnect_interval_ms(config.connection.reconnect_interval_ms)
        .operation_timeout_secs(config.connection.request_timeout_secs)
        .build();
    transport.start();

    let uploader = HttpLogsUploader::new().context("Failed to create logs uploader")?;

    Ok(assemble(
        config,
        Collaborators {
            transport: Arc::new(transport),
            encryption: Arc::new(encryption),
            runtime: docker.clone(),
            logs: docker,
            uploader: Arc::new(uploader),
        },
    ))
}

/// Wire the agent around ready-made collaborators and start refreshing
pub fn assemble(config: &Config, parts: Collaborators) -> Agent {
    let Collaborators {
        transport,
        encryption,
        runtime,
        logs,
        uploader,
    } = parts;

    let store = BackupStore::new(config.backup.path.clone());

    let handlers: Vec<Arc<dyn RequestHandler>> = vec![
        Arc::new(PingHandler),
        Arc::new(UploadLogsHandler::new(
            &config.device_id,
            runtime.clone(),
            logs.clone(),
            uploader,
        )),
        Arc::new(GetLogsHandler::new(runtime.clone(), logs.clone())),
        Arc::new(RestartModuleHandler::new(runtime.clone())),
    ];
    let requests = Arc::new(RequestManager::new(
        handlers,
        config.connection.request_timeout(),
        config.connection.max_concurrent_requests,
    ));

    let streams: Arc<dyn StreamRequestListener> = if config.streams.enabled {
        let registry = StreamHandlerRegistry::new()
            .with_handler(LOGS_STREAM, Arc::new(LogsStreamHandler::new(logs)));
        Arc::new(EnabledStreamListener::new(
            Arc::new(registry),
            config.streams.max_concurrent_streams,
        ))
    } else {
        Arc::new(NullStreamListener)
    };

    let connection = Arc::new(AgentConnection::new(
        transport,
        requests,
        streams,
        config.connection.refresh_interval(),
    ));

    let twin = Arc::new(TwinConfigSource::new(connection.clone()));
    let config_source: Arc<dyn ConfigSource> = Arc::new(BackupConfigSource::new(
        twin,
        encryption,
        store,
        Arc::new(JsonConfigCodec),
    ));

    let reporter = Arc::new(StateReporter::new(connection.clone()));
    connection.start_refresh(Arc::new(StateRefresh::new(
        config_source.clone(),
        StateCollector::new(runtime),
        reporter,
    )));

    let cancel = CancellationToken::new();
    let watcher = tokio::spawn(watch_deployments(
        config_source.clone(),
        connection.clone(),
        cancel.clone(),
    ));

    info!(device_id = %config.device_id, streams = config.streams.enabled, "Agent assembled");

    Agent {
        connection,
        config_source,
        watcher,
        cancel,
    }
}

/// Refresh reported state whenever a new deployment arrives
async fn watch_deployments(
    source: Arc<dyn ConfigSource>,
    connection: Arc<AgentConnection>,
    cancel: CancellationToken,
) {
    let mut updates = source.subscribe();
    loop {
        let update = tokio::select! {
            _ = cancel.cancelled() => break,
            update = updates.recv() => update,
        };

        match update {
            Ok(info) => {
                info!(version = info.version, "Deployment changed");
                connection.trigger_refresh();
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Deployment notifications lagged");
                connection.trigger_refresh();
            }
            Err(RecvError::Closed) => break,
        }
    }
}
