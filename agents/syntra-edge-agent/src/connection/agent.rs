//! Agent Connection
//!
//! Owns the agent's single logical connection to the cloud. It keeps the
//! latest desired document cached and fans new versions out to subscribers,
//! routes direct methods to the [`RequestManager`] and stream requests to the
//! [`StreamRequestListener`], and drives the refresh loop.
//!
//! Transport failures surface as `Disconnected`; nothing here retries.
//! Reconnecting is up to the transport.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::transport::{
    document_version, CloudTransport, ConnectionStatus, MethodInvocation, StreamRequest,
    TransportHandlers,
};
use crate::deployment::twin::DesiredProperties;
use crate::error::{AgentError, Result};
use crate::patch::apply_merge_patch;
use crate::reporting::reporter::ReportedPropertiesSink;
use crate::requests::RequestManager;
use crate::streams::StreamRequestListener;

const CHANNEL_CAPACITY: usize = 32;

/// Work run on every refresh tick or trigger
#[async_trait]
pub trait RefreshAction: Send + Sync {
    async fn refresh(&self) -> Result<()>;
}

/// State shared with the background tasks
struct Shared {
    transport: Arc<dyn CloudTransport>,
    desired: AsyncMutex<Option<Value>>,
    desired_updates: broadcast::Sender<Value>,
}

impl Shared {
    async fn fetch_desired(&self) -> Result<Value> {
        let twin = self.transport.get_twin().await?;
        *self.desired.lock().await = Some(twin.desired.clone());
        Ok(twin.desired)
    }

    /// Apply a pushed patch, falling back to a full fetch when the patch
    /// does not directly follow the cached version
    async fn apply_desired_patch(&self, patch: Value) -> Result<()> {
        let mut cache = self.desired.lock().await;
        let patch_version = document_version(&patch);
        let cached_version = cache.as_ref().and_then(document_version);
        let in_sequence = matches!(
            (patch_version, cached_version),
            (Some(next), Some(current)) if next == current + 1
        );

        let document = match cache.take() {
            Some(mut document) if in_sequence => {
                apply_merge_patch(&mut document, &patch);
                document
            }
            _ => {
                debug!(?patch_version, ?cached_version, "Desired patch out of sequence, fetching twin");
                self.transport.get_twin().await?.desired
            }
        };

        debug!(version = ?document_version(&document), "Desired properties updated");
        *cache = Some(document.clone());
        // no subscribers is fine
        let _ = self.desired_updates.send(document);
        Ok(())
    }
}

/// The agent's connection to the cloud
pub struct AgentConnection {
    shared: Arc<Shared>,
    refresh_interval: Duration,
    refresh_trigger: Arc<Notify>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl AgentConnection {
    /// Register inbound handlers with `transport` and start routing.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        transport: Arc<dyn CloudTransport>,
        requests: Arc<RequestManager>,
        streams: Arc<dyn StreamRequestListener>,
        refresh_interval: Duration,
    ) -> Self {
        let (desired_updates, _) = broadcast::channel(CHANNEL_CAPACITY);
        let shared = Arc::new(Shared {
            transport: Arc::clone(&transport),
            desired: AsyncMutex::new(None),
            desired_updates,
        });
        let cancel = CancellationToken::new();

        let (patch_tx, patch_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (method_tx, method_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (stream_tx, stream_rx) = mpsc::channel(CHANNEL_CAPACITY);
        transport.register(TransportHandlers {
            desired_patches: patch_tx,
            methods: method_tx,
            streams: stream_tx,
        });

        let tasks = vec![
            tokio::spawn(pump_desired(Arc::clone(&shared), patch_rx, cancel.clone())),
            tokio::spawn(pump_methods(requests, method_rx, cancel.clone())),
            tokio::spawn(pump_streams(streams, stream_rx, cancel.clone())),
        ];

        info!(refresh_secs = refresh_interval.as_secs(), "Agent connection ready");

        Self {
            shared,
            refresh_interval,
            refresh_trigger: Arc::new(Notify::new()),
            cancel,
            tasks: Mutex::new(tasks),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AgentError::disconnected("connection closed"));
        }
        Ok(())
    }

    /// Fetch the full desired document from the cloud
    pub async fn get_desired_properties(&self) -> Result<Value> {
        self.ensure_open()?;
        self.shared.fetch_desired().await
    }

    /// Receive every new full desired document
    pub fn subscribe_desired(&self) -> broadcast::Receiver<Value> {
        self.shared.desired_updates.subscribe()
    }

    /// Send a merge patch for the reported properties
    pub async fn update_reported_properties(&self, patch: &Value) -> Result<()> {
        self.ensure_open()?;
        self.shared.transport.update_reported_properties(patch).await?;
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
            && *self.shared.transport.status().borrow() == ConnectionStatus::Connected
    }

    /// Ask for a refresh now. Triggers that arrive before the next run
    /// starts collapse into that one run.
    pub fn trigger_refresh(&self) {
        self.refresh_trigger.notify_one();
    }

    /// Run `action` immediately, then on every interval expiry and trigger.
    ///
    /// Runs never overlap. Every run resets the interval, and interval
    /// expiries during a run are dropped. A run publishes nothing to desired
    /// subscribers.
    pub fn start_refresh(&self, action: Arc<dyn RefreshAction>) {
        let trigger = Arc::clone(&self.refresh_trigger);
        let interval = self.refresh_interval;
        let cancel = self.cancel.clone();

        let handle = tokio::spawn(async move {
            let mut deadline = Instant::now();
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = sleep_until(deadline) => debug!("Refresh interval elapsed"),
                    _ = trigger.notified() => debug!("Refresh triggered"),
                }

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = action.refresh() => {
                        if let Err(e) = result {
                            warn!(error = %e, "Refresh failed");
                        }
                    }
                }
                deadline = Instant::now() + interval;
            }
            debug!("Refresh loop stopped");
        });

        self.tasks.lock().push(handle);
    }

    /// Cancel all work, unregister from the transport and release it.
    /// Calling this more than once is a no-op.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.cancel.cancel();
        self.shared.transport.unregister();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                debug!(error = %e, "Connection task ended abnormally");
            }
        }

        self.shared.transport.close().await;
        info!("Agent connection closed");
    }
}

impl Drop for AgentConnection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl DesiredProperties for AgentConnection {
    async fn get_desired_properties(&self) -> Result<Value> {
        AgentConnection::get_desired_properties(self).await
    }

    fn subscribe_desired(&self) -> broadcast::Receiver<Value> {
        AgentConnection::subscribe_desired(self)
    }
}

#[async_trait]
impl ReportedPropertiesSink for AgentConnection {
    async fn update_reported_properties(&self, patch: &Value) -> Result<()> {
        AgentConnection::update_reported_properties(self, patch).await
    }
}

async fn pump_desired(shared: Arc<Shared>, mut patches: mpsc::Receiver<Value>, cancel: CancellationToken) {
    loop {
        let patch = tokio::select! {
            _ = cancel.cancelled() => break,
            patch = patches.recv() => match patch {
                Some(patch) => patch,
                None => break,
            },
        };

        if let Err(e) = shared.apply_desired_patch(patch).await {
            warn!(error = %e, "Failed to apply desired patch");
        }
    }
}

async fn pump_methods(
    requests: Arc<RequestManager>,
    mut methods: mpsc::Receiver<MethodInvocation>,
    cancel: CancellationToken,
) {
    loop {
        let invocation = tokio::select! {
            _ = cancel.cancelled() => break,
            invocation = methods.recv() => match invocation {
                Some(invocation) => invocation,
                None => break,
            },
        };

        let MethodInvocation { request, responder } = invocation;
        let requests = Arc::clone(&requests);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let response = requests.dispatch(request, &cancel).await;
            if responder.send(response).is_err() {
                debug!("Method caller went away before the response");
            }
        });
    }
}

async fn pump_streams(
    listener: Arc<dyn StreamRequestListener>,
    mut streams: mpsc::Receiver<StreamRequest>,
    cancel: CancellationToken,
) {
    loop {
        let request = tokio::select! {
            _ = cancel.cancelled() => break,
            request = streams.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };
        listener.accept(request, cancel.child_token());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::transport::{StreamFrame, StreamStatus};
    use crate::requests::{status, PingHandler, Request, RequestHandler};
    use crate::streams::NullStreamListener;
    use crate::test_support::MockTransport;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn connect(transport: &Arc<MockTransport>, interval: Duration) -> AgentConnection {
        let handlers: Vec<Arc<dyn RequestHandler>> = vec![Arc::new(PingHandler)];
        let requests = Arc::new(RequestManager::new(handlers, Duration::from_secs(5), 4));
        AgentConnection::new(
            transport.clone(),
            requests,
            Arc::new(NullStreamListener),
            interval,
        )
    }

    struct CountingAction {
        runs: AtomicUsize,
        active: AtomicUsize,
        overlapped: AtomicBool,
        duration: Duration,
    }

    impl CountingAction {
        fn new(duration: Duration) -> Arc<Self> {
            Arc::new(Self {
                runs: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                overlapped: AtomicBool::new(false),
                duration,
            })
        }

        fn runs(&self) -> usize {
            self.runs.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RefreshAction for CountingAction {
        async fn refresh(&self) -> Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.active.fetch_add(1, Ordering::SeqCst) > 0 {
                self.overlapped.store(true, Ordering::SeqCst);
            }
            tokio::time::sleep(self.duration).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_get_desired_and_disconnected() {
        let transport = Arc::new(MockTransport::new(json!({ "$version": 2, "a": 1 })));
        let connection = connect(&transport, Duration::from_secs(60));

        let desired = connection.get_desired_properties().await.unwrap();
        assert_eq!(desired["a"], 1);

        transport.set_offline(true);
        assert!(connection.get_desired_properties().await.unwrap_err().is_disconnected());
        assert!(connection
            .update_reported_properties(&json!({ "x": 1 }))
            .await
            .unwrap_err()
            .is_disconnected());
        assert!(!connection.is_connected());
    }

    #[tokio::test]
    async fn test_in_sequence_patch_is_merged_locally() {
        let transport = Arc::new(MockTransport::new(json!({ "$version": 2, "a": 1, "b": 1 })));
        let connection = connect(&transport, Duration::from_secs(60));
        let mut updates = connection.subscribe_desired();

        connection.get_desired_properties().await.unwrap();
        transport
            .push_desired(json!({ "$version": 3, "b": null, "c": 3 }))
            .await;

        let document = updates.recv().await.unwrap();
        assert_eq!(document, json!({ "$version": 3, "a": 1, "c": 3 }));
        assert_eq!(transport.get_twin_calls(), 1);
    }

    #[tokio::test]
    async fn test_version_gap_refetches_twin() {
        let transport = Arc::new(MockTransport::new(json!({ "$version": 2, "a": 1 })));
        let connection = connect(&transport, Duration::from_secs(60));
        let mut updates = connection.subscribe_desired();

        connection.get_desired_properties().await.unwrap();
        transport.set_desired(json!({ "$version": 5, "a": 5 }));
        transport.push_desired(json!({ "$version": 5, "a": 5 })).await;

        let document = updates.recv().await.unwrap();
        assert_eq!(document["a"], 5);
        assert_eq!(transport.get_twin_calls(), 2);
    }

    #[tokio::test]
    async fn test_methods_routed_to_request_manager() {
        let transport = Arc::new(MockTransport::new(json!({ "$version": 1 })));
        let _connection = connect(&transport, Duration::from_secs(60));

        let response = transport
            .invoke(Request {
                correlation_id: "c-1".to_string(),
                name: "ping".to_string(),
                payload: None,
            })
            .await;
        assert_eq!(response.status, status::OK);
        assert_eq!(response.correlation_id, "c-1");
    }

    #[tokio::test]
    async fn test_streams_routed_to_listener() {
        let transport = Arc::new(MockTransport::new(json!({ "$version": 1 })));
        let _connection = connect(&transport, Duration::from_secs(60));

        let mut frames = transport.open_stream("logs", None).await;
        assert_eq!(
            frames.recv().await.unwrap(),
            StreamFrame::close(
                StreamStatus::Unsupported,
                Some("stream requests are not enabled on this device".to_string())
            )
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_during_run_is_suppressed() {
        let transport = Arc::new(MockTransport::new(json!({ "$version": 1 })));
        let connection = connect(&transport, Duration::from_secs(2));
        let action = CountingAction::new(Duration::from_secs(5));

        connection.start_refresh(action.clone());

        // first run spans t=0..5; ticks at 2 and 4 fall inside it
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(action.runs(), 1);

        // next deadline is 5 + 2
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(action.runs(), 2);
        assert!(!action.overlapped.load(Ordering::SeqCst));

        connection.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_run_leaves_twin_to_the_action() {
        let transport = Arc::new(MockTransport::new(json!({ "$version": 1 })));
        let connection = connect(&transport, Duration::from_secs(100));
        let mut updates = connection.subscribe_desired();
        let action = CountingAction::new(Duration::from_millis(10));

        connection.start_refresh(action.clone());
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(action.runs(), 1);
        assert_eq!(transport.get_twin_calls(), 0);
        assert!(updates.try_recv().is_err());

        connection.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_triggers_collapse_into_one_run() {
        let transport = Arc::new(MockTransport::new(json!({ "$version": 1 })));
        let connection = connect(&transport, Duration::from_secs(100));
        let action = CountingAction::new(Duration::from_secs(5));

        connection.start_refresh(action.clone());
        tokio::time::sleep(Duration::from_secs(1)).await;
        connection.trigger_refresh();
        connection.trigger_refresh();
        connection.trigger_refresh();

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(action.runs(), 2);
        assert!(!action.overlapped.load(Ordering::SeqCst));

        connection.close().await;
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let transport = Arc::new(MockTransport::new(json!({ "$version": 1 })));
        let connection = connect(&transport, Duration::from_secs(60));
        assert!(transport.is_registered());

        connection.close().await;
        connection.close().await;

        assert!(!transport.is_registered());
        assert_eq!(transport.close_calls(), 1);
        assert!(connection.get_desired_properties().await.unwrap_err().is_disconnected());
        assert!(!connection.is_connected());
    }
}
