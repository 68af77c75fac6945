//! Stream Request Listener
//!
//! Long-lived inbound streams (log tailing) are dispatched here, separately
//! from request/response traffic. When streams are disabled the
//! [`NullStreamListener`] still accepts every stream and closes it straight
//! away with `Unsupported`, so the connection never branches on the flag.

mod logs;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::transport::{StreamFrame, StreamRequest, StreamStatus};
use crate::error::Result;

pub use logs::LogsStreamHandler;

/// Produces frames for one stream until done or cancelled
#[async_trait]
pub trait StreamRequestHandler: Send + Sync {
    async fn handle(
        &self,
        payload: Option<Value>,
        frames: mpsc::Sender<StreamFrame>,
        cancel: CancellationToken,
    ) -> Result<()>;
}

/// Maps a stream name to its handler
pub trait StreamHandlerProvider: Send + Sync {
    fn handler(&self, name: &str) -> Option<Arc<dyn StreamRequestHandler>>;
}

/// Name-keyed set of stream handlers
#[derive(Default)]
pub struct StreamHandlerRegistry {
    handlers: HashMap<String, Arc<dyn StreamRequestHandler>>,
}

impl StreamHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handler(mut self, name: &str, handler: Arc<dyn StreamRequestHandler>) -> Self {
        self.handlers.insert(name.to_lowercase(), handler);
        self
    }
}

impl StreamHandlerProvider for StreamHandlerRegistry {
    fn handler(&self, name: &str) -> Option<Arc<dyn StreamRequestHandler>> {
        self.handlers.get(&name.to_lowercase()).cloned()
    }
}

/// Accepts inbound stream requests
pub trait StreamRequestListener: Send + Sync {
    /// Take ownership of a stream; must not block the caller
    fn accept(&self, request: StreamRequest, cancel: CancellationToken);
}

fn close_stream(frames: mpsc::Sender<StreamFrame>, status: StreamStatus, message: Option<String>) {
    tokio::spawn(async move {
        if frames.send(StreamFrame::close(status, message)).await.is_err() {
            debug!("Stream peer went away before close");
        }
    });
}

/// Listener used when stream support is disabled
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStreamListener;

impl StreamRequestListener for NullStreamListener {
    fn accept(&self, request: StreamRequest, _cancel: CancellationToken) {
        debug!(stream_id = %request.stream_id, name = %request.name, "Streams disabled, closing");
        close_stream(
            request.frames,
            StreamStatus::Unsupported,
            Some("stream requests are not enabled on this device".to_string()),
        );
    }
}

/// Provider-backed listener with a bound on concurrent streams
pub struct EnabledStreamListener {
    provider: Arc<dyn StreamHandlerProvider>,
    permits: Arc<Semaphore>,
}

impl EnabledStreamListener {
    pub fn new(provider: Arc<dyn StreamHandlerProvider>, max_concurrent: usize) -> Self {
        Self {
            provider,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }
}

impl StreamRequestListener for EnabledStreamListener {
    fn accept(&self, request: StreamRequest, cancel: CancellationToken) {
        let StreamRequest {
            stream_id,
            name,
            payload,
            frames,
        } = request;

        let Some(handler) = self.provider.handler(&name) else {
            warn!(stream_id = %stream_id, name = %name, "No handler for stream");
            close_stream(frames, StreamStatus::NotFound, Some(format!("unknown stream '{}'", name)));
            return;
        };

        let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
            warn!(stream_id = %stream_id, name = %name, "Too many open streams");
            close_stream(frames, StreamStatus::Busy, None);
            return;
        };

        info!(stream_id = %stream_id, name = %name, "Stream opened");
        tokio::spawn(async move {
            let _permit = permit;
            let (status, message) = tokio::select! {
                biased;
                _ = cancel.cancelled() => (StreamStatus::Cancelled, None),
                result = handler.handle(payload, frames.clone(), cancel.clone()) => match result {
                    Ok(()) if cancel.is_cancelled() => (StreamStatus::Cancelled, None),
                    Ok(()) => (StreamStatus::Completed, None),
                    Err(e) => {
                        warn!(stream_id = %stream_id, error = %e, "Stream handler failed");
                        (StreamStatus::Failed, Some(e.to_string()))
                    }
                },
            };

            // peer may already be gone
            let _ = frames.send(StreamFrame::close(status, message)).await;
            info!(stream_id = %stream_id, status = ?status, "Stream closed");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct EchoHandler;

    #[async_trait]
    impl StreamRequestHandler for EchoHandler {
        async fn handle(
            &self,
            payload: Option<Value>,
            frames: mpsc::Sender<StreamFrame>,
            _cancel: CancellationToken,
        ) -> Result<()> {
            let text = payload.map(|p| p.to_string()).unwrap_or_default();
            let _ = frames.send(StreamFrame::data(text)).await;
            Ok(())
        }
    }

    struct ForeverHandler;

    #[async_trait]
    impl StreamRequestHandler for ForeverHandler {
        async fn handle(
            &self,
            _payload: Option<Value>,
            frames: mpsc::Sender<StreamFrame>,
            cancel: CancellationToken,
        ) -> Result<()> {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {
                        if frames.send(StreamFrame::data("tick")).await.is_err() {
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    /// Returns cleanly as soon as it is cancelled
    struct QuietHandler;

    #[async_trait]
    impl StreamRequestHandler for QuietHandler {
        async fn handle(
            &self,
            _payload: Option<Value>,
            _frames: mpsc::Sender<StreamFrame>,
            cancel: CancellationToken,
        ) -> Result<()> {
            cancel.cancelled().await;
            Ok(())
        }
    }

    fn open(name: &str) -> (StreamRequest, mpsc::Receiver<StreamFrame>) {
        let (tx, rx) = mpsc::channel(16);
        let request = StreamRequest {
            stream_id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            payload: Some(serde_json::json!("hi")),
            frames: tx,
        };
        (request, rx)
    }

    fn listener(max: usize) -> EnabledStreamListener {
        let registry = StreamHandlerRegistry::new()
            .with_handler("echo", Arc::new(EchoHandler))
            .with_handler("forever", Arc::new(ForeverHandler))
            .with_handler("quiet", Arc::new(QuietHandler));
        EnabledStreamListener::new(Arc::new(registry), max)
    }

    #[tokio::test]
    async fn test_null_listener_closes_unsupported() {
        let (request, mut rx) = open("logs");
        NullStreamListener.accept(request, CancellationToken::new());

        match rx.recv().await.unwrap() {
            StreamFrame::Close { status, .. } => assert_eq!(status, StreamStatus::Unsupported),
            other => panic!("expected close, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_handler_frames_then_completed() {
        let (request, mut rx) = open("ECHO");
        listener(2).accept(request, CancellationToken::new());

        assert_eq!(rx.recv().await.unwrap(), StreamFrame::data("\"hi\""));
        assert_eq!(
            rx.recv().await.unwrap(),
            StreamFrame::close(StreamStatus::Completed, None)
        );
    }

    #[tokio::test]
    async fn test_unknown_stream_is_not_found() {
        let (request, mut rx) = open("shell");
        listener(2).accept(request, CancellationToken::new());

        match rx.recv().await.unwrap() {
            StreamFrame::Close { status, .. } => assert_eq!(status, StreamStatus::NotFound),
            other => panic!("expected close, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_handler_ending_on_cancel_reports_cancelled() {
        for _ in 0..20 {
            let token = CancellationToken::new();
            let (request, mut rx) = open("quiet");
            listener(1).accept(request, token.clone());

            tokio::task::yield_now().await;
            token.cancel();

            assert_eq!(
                rx.recv().await.unwrap(),
                StreamFrame::close(StreamStatus::Cancelled, None)
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_excess_streams_are_busy_and_cancel_closes() {
        let listener = listener(1);
        let token = CancellationToken::new();

        let (first, mut first_rx) = open("forever");
        listener.accept(first, token.clone());
        assert_eq!(first_rx.recv().await.unwrap(), StreamFrame::data("tick"));

        let (second, mut second_rx) = open("forever");
        listener.accept(second, token.clone());
        assert_eq!(
            second_rx.recv().await.unwrap(),
            StreamFrame::close(StreamStatus::Busy, None)
        );

        token.cancel();
        loop {
            match first_rx.recv().await.unwrap() {
                StreamFrame::Data { .. } => continue,
                StreamFrame::Close { status, .. } => {
                    assert_eq!(status, StreamStatus::Cancelled);
                    break;
                }
            }
        }
    }
}
