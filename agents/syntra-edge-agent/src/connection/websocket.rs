//! WebSocket Transport
//!
//! [`CloudTransport`] over a JSON WebSocket session with the hub. The session
//! is re-established at a fixed interval whenever it drops; requests issued
//! while no session is up fail fast with `NotConnected`.

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::link::LinkStateManager;
use super::protocol::{
    CloudMessage, DeviceMessage, PatchReportedPayload, StreamFramePayload, StreamOpenPayload,
    TwinRequestPayload,
};
use super::transport::{
    CloudTransport, ConnectionStatus, MethodInvocation, StreamFrame, StreamRequest, StreamStatus,
    TransportError, TransportHandlers, Twin,
};
use crate::requests::{status, Response};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const OUTGOING_CAPACITY: usize = 100;
const STREAM_CAPACITY: usize = 32;

type PendingReply = oneshot::Sender<Result<CloudMessage, TransportError>>;

struct Inner {
    url: String,
    device_id: String,
    hub_hostname: String,
    reconnect_interval: Duration,
    operation_timeout: Duration,
    link: LinkStateManager,
    /// Outgoing queue of the live session, if any
    session: RwLock<Option<mpsc::Sender<DeviceMessage>>>,
    pending: DashMap<String, PendingReply>,
    handlers: RwLock<Option<TransportHandlers>>,
    cancel: CancellationToken,
}

/// WebSocket transport with automatic reconnect
pub struct WebSocketTransport {
    inner: Arc<Inner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WebSocketTransport {
    pub fn builder(url: &str, device_id: &str) -> WebSocketTransportBuilder {
        WebSocketTransportBuilder::new(url, device_id)
    }

    /// Start the connect/reconnect loop. Calling it again is a no-op.
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.is_none() {
            *task = Some(tokio::spawn(Arc::clone(&self.inner).run()));
        }
    }
}

impl Inner {
    async fn run(self: Arc<Self>) {
        loop {
            match self.connect_and_run().await {
                Ok(()) => info!("Hub session closed"),
                Err(e) => error!(error = %e, "Hub session failed"),
            }

            self.end_session();
            if self.cancel.is_cancelled() {
                break;
            }

            self.link.set_reconnecting();
            info!(
                interval_ms = self.reconnect_interval.as_millis() as u64,
                attempts = self.link.connection_attempts(),
                last_connected = ?self.link.last_connected(),
                "Waiting before reconnection attempt"
            );
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.reconnect_interval) => {}
            }
        }
        self.link.set_closed();
    }

    async fn connect_and_run(&self) -> anyhow::Result<()> {
        use anyhow::Context;

        self.link.set_connecting();
        info!(url = %self.url, device_id = %self.device_id, "Connecting to hub");

        let (ws_stream, _) = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(()),
            connected = timeout(CONNECT_TIMEOUT, connect_async(self.url.as_str())) => connected
                .context("Connection timeout")?
                .context("Failed to connect to WebSocket")?,
        };
        let (mut write, mut read) = ws_stream.split();

        let hello = DeviceMessage::hello(&self.device_id, &self.hub_hostname).to_json()?;
        write.send(Message::Text(hello)).await?;

        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<DeviceMessage>(OUTGOING_CAPACITY);
        *self.session.write() = Some(outgoing_tx.clone());
        self.link.set_connected();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    // best effort, the peer may already be gone
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }

                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.handle_text(&text, &outgoing_tx).await,
                    Some(Ok(Message::Ping(data))) => {
                        write.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        info!(?frame, "Hub closed the session");
                        break;
                    }
                    Some(Ok(_)) => debug!("Ignoring non-text frame"),
                    Some(Err(e)) => return Err(e.into()),
                    None => {
                        info!("Hub stream ended");
                        break;
                    }
                },

                outgoing = outgoing_rx.recv() => {
                    if let Some(message) = outgoing {
                        write.send(Message::Text(message.to_json()?)).await?;
                    }
                }
            }
        }

        Ok(())
    }

    /// Drop the session and fail everything still waiting on it
    fn end_session(&self) {
        *self.session.write() = None;

        let waiting: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for request_id in waiting {
            if let Some((_, reply)) = self.pending.remove(&request_id) {
                let _ = reply.send(Err(TransportError::NotConnected));
            }
        }
        self.link.set_disconnected("session ended");
    }

    async fn handle_text(&self, text: &str, outgoing: &mpsc::Sender<DeviceMessage>) {
        match CloudMessage::from_json(text) {
            Ok(message) => self.handle_message(message, outgoing).await,
            Err(e) => warn!(error = %e, "Failed to parse hub message"),
        }
    }

    async fn handle_message(&self, message: CloudMessage, outgoing: &mpsc::Sender<DeviceMessage>) {
        if let Some(request_id) = message.request_id().map(str::to_string) {
            match self.pending.remove(&request_id) {
                Some((_, reply)) => {
                    let result = match message {
                        CloudMessage::Error(e) => Err(TransportError::Rejected {
                            status: e.status,
                            message: e.message,
                        }),
                        other => Ok(other),
                    };
                    let _ = reply.send(result);
                }
                None => debug!(request_id = %request_id, "Reply for unknown request"),
            }
            return;
        }

        let handlers = self.handlers.read().clone();
        match message {
            CloudMessage::DesiredPatch(payload) => match handlers {
                Some(h) => {
                    if h.desired_patches.send(payload.patch).await.is_err() {
                        debug!("Desired patch receiver gone");
                    }
                }
                None => debug!("No handler registered, desired patch dropped"),
            },
            CloudMessage::MethodRequest(request) => {
                self.route_method(handlers, request, outgoing.clone()).await;
            }
            CloudMessage::StreamOpen(payload) => {
                self.route_stream(handlers, payload, outgoing.clone()).await;
            }
            CloudMessage::Error(e) => {
                error!(status = e.status, message = %e.message, "Hub reported an error");
            }
            CloudMessage::Twin(_) | CloudMessage::PatchAck(_) => {
                debug!("Uncorrelated reply ignored");
            }
        }
    }

    async fn route_method(
        &self,
        handlers: Option<TransportHandlers>,
        request: crate::requests::Request,
        outgoing: mpsc::Sender<DeviceMessage>,
    ) {
        let correlation_id = request.correlation_id.clone();
        let (responder, response) = oneshot::channel();

        let delivered = match handlers {
            Some(h) => h
                .methods
                .send(MethodInvocation { request, responder })
                .await
                .is_ok(),
            None => false,
        };

        tokio::spawn(async move {
            let response = match response.await {
                Ok(response) if delivered => response,
                _ => Response::error(&correlation_id, status::UNAVAILABLE, "device is not accepting requests"),
            };
            if outgoing.send(DeviceMessage::MethodResponse(response)).await.is_err() {
                warn!(correlation_id = %correlation_id, "Session ended before the method response was sent");
            }
        });
    }

    async fn route_stream(
        &self,
        handlers: Option<TransportHandlers>,
        payload: StreamOpenPayload,
        outgoing: mpsc::Sender<DeviceMessage>,
    ) {
        let StreamOpenPayload {
            stream_id,
            name,
            payload,
        } = payload;
        let (frames_tx, mut frames_rx) = mpsc::channel(STREAM_CAPACITY);

        let request = StreamRequest {
            stream_id: stream_id.clone(),
            name,
            payload,
            frames: frames_tx.clone(),
        };
        let delivered = match handlers {
            Some(h) => h.streams.send(request).await.is_ok(),
            None => false,
        };
        if !delivered {
            let _ = frames_tx
                .send(StreamFrame::close(StreamStatus::Unsupported, None))
                .await;
        }
        drop(frames_tx);

        tokio::spawn(async move {
            while let Some(frame) = frames_rx.recv().await {
                let last = matches!(frame, StreamFrame::Close { .. });
                let message = DeviceMessage::StreamFrame(StreamFramePayload {
                    stream_id: stream_id.clone(),
                    frame,
                });
                if outgoing.send(message).await.is_err() || last {
                    break;
                }
            }
        });
    }

    async fn request(&self, request_id: String, message: DeviceMessage) -> Result<CloudMessage, TransportError> {
        let session = self
            .session
            .read()
            .clone()
            .ok_or(TransportError::NotConnected)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.insert(request_id.clone(), reply_tx);

        if session.send(message).await.is_err() {
            self.pending.remove(&request_id);
            return Err(TransportError::NotConnected);
        }

        match timeout(self.operation_timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                self.pending.remove(&request_id);
                Err(TransportError::Timeout)
            }
        }
    }
}

#[async_trait]
impl CloudTransport for WebSocketTransport {
    async fn get_twin(&self) -> Result<Twin, TransportError> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let message = DeviceMessage::GetTwin(TwinRequestPayload {
            request_id: request_id.clone(),
        });

        match self.inner.request(request_id, message).await? {
            CloudMessage::Twin(payload) => Ok(payload.twin),
            other => Err(TransportError::Protocol(format!(
                "unexpected reply to twin request: {:?}",
                other
            ))),
        }
    }

    async fn update_reported_properties(&self, patch: &Value) -> Result<(), TransportError> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let message = DeviceMessage::PatchReported(PatchReportedPayload {
            request_id: request_id.clone(),
            patch: patch.clone(),
        });

        match self.inner.request(request_id, message).await? {
            CloudMessage::PatchAck(_) => Ok(()),
            other => Err(TransportError::Protocol(format!(
                "unexpected reply to reported patch: {:?}",
                other
            ))),
        }
    }

    fn register(&self, handlers: TransportHandlers) {
        *self.inner.handlers.write() = Some(handlers);
    }

    fn unregister(&self) {
        *self.inner.handlers.write() = None;
    }

    fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.link.subscribe()
    }

    async fn close(&self) {
        self.inner.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                debug!(error = %e, "Transport task ended abnormally");
            }
        }
        self.inner.link.set_closed();
    }
}

/// Builder for [`WebSocketTransport`]
pub struct WebSocketTransportBuilder {
    url: String,
    device_id: String,
    hub_hostname: String,
    reconnect_interval_ms: u64,
    operation_timeout_secs: u64,
}

impl WebSocketTransportBuilder {
    pub fn new(url: &str, device_id: &str) -> Self {
        Self {
            url: url.to_string(),
            device_id: device_id.to_string(),
            hub_hostname: String::new(),
            reconnect_interval_ms: 5000,
            operation_timeout_secs: 30,
        }
    }

    pub fn hub_hostname(mut self, hostname: &str) -> Self {
        self.hub_hostname = hostname.to_string();
        self
    }

    pub fn reconnect_interval_ms(mut self, ms: u64) -> Self {
        self.reconnect_interval_ms = ms;
        self
    }

    pub fn operation_timeout_secs(mut self, secs: u64) -> Self {
        self.operation_timeout_secs = secs;
        self
    }

    pub fn build(self) -> WebSocketTransport {
        WebSocketTransport {
            inner: Arc::new(Inner {
                url: self.url,
                device_id: self.device_id,
                hub_hostname: self.hub_hostname,
                reconnect_interval: Duration::from_millis(self.reconnect_interval_ms),
                operation_timeout: Duration::from_secs(self.operation_timeout_secs),
                link: LinkStateManager::new(),
                session: RwLock::new(None),
                pending: DashMap::new(),
                handlers: RwLock::new(None),
                cancel: CancellationToken::new(),
            }),
            task: Mutex::new(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::link::LinkState;
    use crate::connection::protocol::{DesiredPatchPayload, ErrorPayload, TwinPayload};
    use crate::requests::Request;
    use serde_json::json;

    fn transport() -> WebSocketTransport {
        WebSocketTransport::builder("ws://127.0.0.1:9/device", "dev-1")
            .operation_timeout_secs(1)
            .build()
    }

    fn handlers() -> (
        TransportHandlers,
        mpsc::Receiver<Value>,
        mpsc::Receiver<MethodInvocation>,
        mpsc::Receiver<StreamRequest>,
    ) {
        let (desired_patches, patches) = mpsc::channel(4);
        let (methods, invocations) = mpsc::channel(4);
        let (streams, stream_requests) = mpsc::channel(4);
        (
            TransportHandlers {
                desired_patches,
                methods,
                streams,
            },
            patches,
            invocations,
            stream_requests,
        )
    }

    #[tokio::test]
    async fn test_requests_fail_fast_without_session() {
        let transport = transport();
        assert!(matches!(
            transport.get_twin().await,
            Err(TransportError::NotConnected)
        ));
        assert_eq!(*transport.status().borrow(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_twin_reply_completes_pending_request() {
        let transport = transport();
        let (session_tx, mut session_rx) = mpsc::channel(4);
        *transport.inner.session.write() = Some(session_tx.clone());

        let inner = Arc::clone(&transport.inner);
        let reply = tokio::spawn(async move {
            let request_id = match session_rx.recv().await.unwrap() {
                DeviceMessage::GetTwin(p) => p.request_id,
                other => panic!("expected twin request, got {:?}", other),
            };
            inner
                .handle_message(
                    CloudMessage::Twin(TwinPayload {
                        request_id,
                        twin: Twin {
                            desired: json!({ "$version": 7 }),
                            reported: json!({}),
                        },
                    }),
                    &session_tx,
                )
                .await;
        });

        let twin = transport.get_twin().await.unwrap();
        reply.await.unwrap();
        assert_eq!(twin.desired["$version"], 7);
        assert!(transport.inner.pending.is_empty());
    }

    #[tokio::test]
    async fn test_error_reply_is_rejection() {
        let transport = transport();
        let (session_tx, mut session_rx) = mpsc::channel(4);
        *transport.inner.session.write() = Some(session_tx.clone());

        let inner = Arc::clone(&transport.inner);
        tokio::spawn(async move {
            if let Some(DeviceMessage::PatchReported(p)) = session_rx.recv().await {
                inner
                    .handle_message(
                        CloudMessage::Error(ErrorPayload {
                            request_id: Some(p.request_id),
                            status: 413,
                            message: "document too large".to_string(),
                        }),
                        &session_tx,
                    )
                    .await;
            }
        });

        let err = transport
            .update_reported_properties(&json!({ "a": 1 }))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Rejected { status: 413, .. }));
    }

    #[tokio::test]
    async fn test_end_session_fails_pending_requests() {
        let transport = transport();
        let (reply_tx, reply_rx) = oneshot::channel();
        transport.inner.pending.insert("r-1".to_string(), reply_tx);

        transport.inner.end_session();
        assert!(matches!(
            reply_rx.await.unwrap(),
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_method_without_handlers_answers_unavailable() {
        let transport = transport();
        let (outgoing_tx, mut outgoing_rx) = mpsc::channel(4);

        transport
            .inner
            .handle_message(
                CloudMessage::MethodRequest(Request {
                    correlation_id: "c-1".to_string(),
                    name: "ping".to_string(),
                    payload: None,
                }),
                &outgoing_tx,
            )
            .await;

        match outgoing_rx.recv().await.unwrap() {
            DeviceMessage::MethodResponse(response) => {
                assert_eq!(response.correlation_id, "c-1");
                assert_eq!(response.status, status::UNAVAILABLE);
            }
            other => panic!("expected method response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_method_routed_and_answered_once() {
        let transport = transport();
        let (h, _patches, mut invocations, _streams) = handlers();
        transport.register(h);
        let (outgoing_tx, mut outgoing_rx) = mpsc::channel(4);

        transport
            .inner
            .handle_message(
                CloudMessage::MethodRequest(Request {
                    correlation_id: "c-2".to_string(),
                    name: "ping".to_string(),
                    payload: None,
                }),
                &outgoing_tx,
            )
            .await;

        let invocation = invocations.recv().await.unwrap();
        invocation
            .responder
            .send(Response::success(&invocation.request.correlation_id, None))
            .unwrap();

        match outgoing_rx.recv().await.unwrap() {
            DeviceMessage::MethodResponse(response) => assert!(response.is_success()),
            other => panic!("expected method response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_desired_patch_routed_to_handler() {
        let transport = transport();
        let (h, mut patches, _methods, _streams) = handlers();
        transport.register(h);
        let (outgoing_tx, _outgoing_rx) = mpsc::channel(4);

        transport
            .inner
            .handle_message(
                CloudMessage::DesiredPatch(DesiredPatchPayload {
                    patch: json!({ "$version": 4 }),
                }),
                &outgoing_tx,
            )
            .await;
        assert_eq!(patches.recv().await.unwrap(), json!({ "$version": 4 }));

        transport.unregister();
        assert!(transport.inner.handlers.read().is_none());
    }

    #[tokio::test]
    async fn test_stream_frames_forwarded_until_close() {
        let transport = transport();
        let (h, _patches, _methods, mut streams) = handlers();
        transport.register(h);
        let (outgoing_tx, mut outgoing_rx) = mpsc::channel(8);

        transport
            .inner
            .handle_message(
                CloudMessage::StreamOpen(StreamOpenPayload {
                    stream_id: "s-1".to_string(),
                    name: "logs".to_string(),
                    payload: None,
                }),
                &outgoing_tx,
            )
            .await;

        let request = streams.recv().await.unwrap();
        request.frames.send(StreamFrame::data("line\n")).await.unwrap();
        request
            .frames
            .send(StreamFrame::close(StreamStatus::Completed, None))
            .await
            .unwrap();

        for expected in [
            StreamFrame::data("line\n"),
            StreamFrame::close(StreamStatus::Completed, None),
        ] {
            match outgoing_rx.recv().await.unwrap() {
                DeviceMessage::StreamFrame(p) => {
                    assert_eq!(p.stream_id, "s-1");
                    assert_eq!(p.frame, expected);
                }
                other => panic!("expected stream frame, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_failed_connects_count_attempts_until_closed() {
        let transport = WebSocketTransport::builder("ws://127.0.0.1:9/device", "dev-1")
            .reconnect_interval_ms(10)
            .build();
        transport.start();

        for _ in 0..200 {
            if transport.inner.link.connection_attempts() >= 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(transport.inner.link.connection_attempts() >= 3);
        assert!(transport.inner.link.last_connected().is_none());
        assert_eq!(*transport.status().borrow(), ConnectionStatus::Disconnected);

        transport.close().await;
        assert_eq!(transport.inner.link.current(), LinkState::Closed);
    }

    #[tokio::test]
    async fn test_close_before_start_marks_closed() {
        let transport = transport();
        transport.close().await;
        assert_eq!(transport.inner.link.current(), LinkState::Closed);
    }
}
