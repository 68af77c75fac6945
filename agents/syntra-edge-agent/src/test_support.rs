//! In-memory fakes of the agent's external collaborators, for unit tests.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::connection::transport::{
    CloudTransport, ConnectionStatus, MethodInvocation, StreamFrame, StreamRequest,
    TransportError, TransportHandlers, Twin,
};
use crate::crypto::EncryptionProvider;
use crate::deployment::source::ConfigSource;
use crate::deployment::types::DeploymentConfigInfo;
use crate::error::{AgentError, Result};
use crate::logs::{parse_log_line, LogOptions, LogRecord, LogsProvider, LogsUploader};
use crate::reporting::reporter::ReportedPropertiesSink;
use crate::requests::{Request, Response};
use crate::runtime::adapter::{
    ModuleRuntimeInfo, ModuleRuntimeStatus, RuntimeInfoProvider, SystemInfo,
};
use crate::tagged::DOCKER_TYPE;

/// Fixed log lines per module
#[derive(Default)]
pub struct StaticLogsProvider {
    lines: HashMap<String, Vec<String>>,
}

impl StaticLogsProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lines(mut self, module: &str, lines: &[&str]) -> Self {
        self.lines.insert(
            module.to_string(),
            lines.iter().map(|l| l.to_string()).collect(),
        );
        self
    }
}

impl LogsProvider for StaticLogsProvider {
    fn get_logs(&self, module: &str, options: &LogOptions) -> BoxStream<'static, Result<LogRecord>> {
        let lines = self.lines.get(module).cloned().unwrap_or_default();
        let skip = options
            .tail
            .map(|tail| lines.len().saturating_sub(tail))
            .unwrap_or(0);
        let records: Vec<Result<LogRecord>> = lines
            .iter()
            .skip(skip)
            .map(|line| Ok(parse_log_line(module, line)))
            .collect();
        futures_util::stream::iter(records).boxed()
    }
}

/// Runtime with a fixed module list
pub struct StaticRuntime {
    runtime_type: String,
    modules: Vec<String>,
    restarted: Mutex<Vec<String>>,
}

impl StaticRuntime {
    pub fn with_modules(names: &[&str]) -> Self {
        Self {
            runtime_type: DOCKER_TYPE.to_string(),
            modules: names.iter().map(|n| n.to_string()).collect(),
            restarted: Mutex::new(Vec::new()),
        }
    }

    pub fn with_runtime_type(mut self, runtime_type: &str) -> Self {
        self.runtime_type = runtime_type.to_string();
        self
    }

    pub fn restarted(&self) -> Vec<String> {
        self.restarted.lock().clone()
    }
}

#[async_trait]
impl RuntimeInfoProvider for StaticRuntime {
    fn runtime_type(&self) -> &str {
        &self.runtime_type
    }

    async fn system_info(&self) -> Result<SystemInfo> {
        Ok(SystemInfo {
            os_type: "linux".to_string(),
            architecture: "x86_64".to_string(),
            runtime_version: "24.0.7".to_string(),
        })
    }

    async fn list_modules(&self) -> Result<Vec<ModuleRuntimeInfo>> {
        Ok(self
            .modules
            .iter()
            .map(|name| ModuleRuntimeInfo {
                name: name.clone(),
                image: format!("acme/{}:1.0", name),
                status: ModuleRuntimeStatus::Running,
                exit_code: None,
                started_at: None,
                exited_at: None,
            })
            .collect())
    }

    async fn restart_module(&self, name: &str) -> Result<()> {
        if !self.modules.iter().any(|m| m == name) {
            return Err(AgentError::handler_failure(format!("no such module: {}", name)));
        }
        self.restarted.lock().push(name.to_string());
        Ok(())
    }
}

/// Uploader that keeps every payload it accepts
#[derive(Default)]
pub struct RecordingUploader {
    uploads: Mutex<Vec<(String, Vec<u8>)>>,
    failing_module: Option<String>,
}

impl RecordingUploader {
    /// Reject uploads whose blob belongs to `module`
    pub fn failing_for(module: &str) -> Self {
        Self {
            uploads: Mutex::new(Vec::new()),
            failing_module: Some(module.to_string()),
        }
    }

    pub fn uploads(&self) -> Vec<(String, Vec<u8>)> {
        self.uploads.lock().clone()
    }
}

#[async_trait]
impl LogsUploader for RecordingUploader {
    async fn upload(&self, destination: &str, payload: Vec<u8>) -> Result<()> {
        if let Some(module) = &self.failing_module {
            if destination.contains(&format!("/{}-", module)) {
                return Err(AgentError::handler_failure("upload rejected with status 403"));
            }
        }
        self.uploads.lock().push((destination.to_string(), payload));
        Ok(())
    }
}

/// Reported-properties sink that records every patch
#[derive(Default)]
pub struct RecordingSink {
    patches: Mutex<Vec<Value>>,
}

impl RecordingSink {
    pub fn patches(&self) -> Vec<Value> {
        self.patches.lock().clone()
    }
}

#[async_trait]
impl ReportedPropertiesSink for RecordingSink {
    async fn update_reported_properties(&self, patch: &Value) -> Result<()> {
        self.patches.lock().push(patch.clone());
        Ok(())
    }
}

enum SourceOutcome {
    Config(DeploymentConfigInfo),
    Disconnected(String),
    Malformed(String),
}

/// Config source returning a settable outcome
pub struct StaticConfigSource {
    outcome: Mutex<SourceOutcome>,
    changes: broadcast::Sender<DeploymentConfigInfo>,
}

impl StaticConfigSource {
    pub fn new(outcome: Result<DeploymentConfigInfo>) -> Self {
        Self {
            outcome: Mutex::new(Self::outcome(outcome)),
            changes: broadcast::channel(8).0,
        }
    }

    fn outcome(result: Result<DeploymentConfigInfo>) -> SourceOutcome {
        match result {
            Ok(info) => SourceOutcome::Config(info),
            Err(AgentError::MalformedConfig(msg)) => SourceOutcome::Malformed(msg),
            Err(e) => SourceOutcome::Disconnected(e.to_string()),
        }
    }

    pub fn set(&self, outcome: Result<DeploymentConfigInfo>) {
        *self.outcome.lock() = Self::outcome(outcome);
    }

    pub fn notify(&self, info: DeploymentConfigInfo) {
        let _ = self.changes.send(info);
    }
}

#[async_trait]
impl ConfigSource for StaticConfigSource {
    async fn get_config(&self) -> Result<DeploymentConfigInfo> {
        match &*self.outcome.lock() {
            SourceOutcome::Config(info) => Ok(info.clone()),
            SourceOutcome::Disconnected(msg) => Err(AgentError::disconnected(msg.clone())),
            SourceOutcome::Malformed(msg) => Err(AgentError::malformed_config(msg.clone())),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<DeploymentConfigInfo> {
        self.changes.subscribe()
    }
}

const FAKE_KEY: u8 = 0x5a;

/// Reversible byte scrambler standing in for the security daemon
#[derive(Default)]
pub struct FakeEncryption {
    failing: AtomicBool,
    encrypt_calls: AtomicUsize,
}

impl FakeEncryption {
    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn encrypt_calls(&self) -> usize {
        self.encrypt_calls.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AgentError::encryption("workload API unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl EncryptionProvider for FakeEncryption {
    async fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.check()?;
        self.encrypt_calls.fetch_add(1, Ordering::SeqCst);
        Ok(plaintext.iter().map(|b| b ^ FAKE_KEY).collect())
    }

    async fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.check()?;
        Ok(ciphertext.iter().map(|b| b ^ FAKE_KEY).collect())
    }
}

/// Transport backed by an in-memory twin
pub struct MockTransport {
    desired: Mutex<Value>,
    reported: Mutex<Vec<Value>>,
    handlers: Mutex<Option<TransportHandlers>>,
    offline: AtomicBool,
    get_twin_calls: AtomicUsize,
    close_calls: AtomicUsize,
    status: watch::Sender<ConnectionStatus>,
}

impl MockTransport {
    pub fn new(desired: Value) -> Self {
        Self {
            desired: Mutex::new(desired),
            reported: Mutex::new(Vec::new()),
            handlers: Mutex::new(None),
            offline: AtomicBool::new(false),
            get_twin_calls: AtomicUsize::new(0),
            close_calls: AtomicUsize::new(0),
            status: watch::channel(ConnectionStatus::Connected).0,
        }
    }

    pub fn set_desired(&self, desired: Value) {
        *self.desired.lock() = desired;
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
        self.status.send_replace(if offline {
            ConnectionStatus::Disconnected
        } else {
            ConnectionStatus::Connected
        });
    }

    pub fn reported(&self) -> Vec<Value> {
        self.reported.lock().clone()
    }

    pub fn get_twin_calls(&self) -> usize {
        self.get_twin_calls.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn is_registered(&self) -> bool {
        self.handlers.lock().is_some()
    }

    fn registered(&self) -> TransportHandlers {
        match self.handlers.lock().clone() {
            Some(handlers) => handlers,
            None => panic!("no handlers registered"),
        }
    }

    /// Deliver a desired-properties patch as the hub would
    pub async fn push_desired(&self, patch: Value) {
        let handlers = self.registered();
        handlers.desired_patches.send(patch).await.unwrap();
    }

    /// Invoke a direct method and wait for its response
    pub async fn invoke(&self, request: Request) -> Response {
        let handlers = self.registered();
        let (responder, response) = oneshot::channel();
        handlers
            .methods
            .send(MethodInvocation { request, responder })
            .await
            .unwrap();
        response.await.unwrap()
    }

    /// Open a stream and return the frames written back on it
    pub async fn open_stream(&self, name: &str, payload: Option<Value>) -> mpsc::Receiver<StreamFrame> {
        let handlers = self.registered();
        let (frames, received) = mpsc::channel(16);
        handlers
            .streams
            .send(StreamRequest {
                stream_id: uuid::Uuid::new_v4().to_string(),
                name: name.to_string(),
                payload,
                frames,
            })
            .await
            .unwrap();
        received
    }
}

#[async_trait]
impl CloudTransport for MockTransport {
    async fn get_twin(&self) -> std::result::Result<Twin, TransportError> {
        self.get_twin_calls.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        Ok(Twin {
            desired: self.desired.lock().clone(),
            reported: Value::Object(Default::default()),
        })
    }

    async fn update_reported_properties(&self, patch: &Value) -> std::result::Result<(), TransportError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        self.reported.lock().push(patch.clone());
        Ok(())
    }

    fn register(&self, handlers: TransportHandlers) {
        *self.handlers.lock() = Some(handlers);
    }

    fn unregister(&self) {
        *self.handlers.lock() = None;
    }

    fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    async fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
    }
}
