//! # Camera Pool
//!
//! Request/future interface to a frame capture backend.
//!
//! ## Request Routing
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  CameraHandle::request(req)                                             │
//! │       │  id = next_id++ ; (tx, rx) = oneshot                            │
//! │       ▼                                                                 │
//! │  ┌──────────┐   (id, req)    ┌────────────────┐                         │
//! │  │  Broker  │ ─────────────► │ FrameSource    │  (one worker task)      │
//! │  │ pending: │ ◄───────────── │ capture(req)   │                         │
//! │  │ id → tx  │ (id, result)   └────────────────┘                         │
//! │  └────┬─────┘                                                           │
//! │       │ pending.remove(id).send(result)                                 │
//! │       ▼                                                                 │
//! │  FrameFuture (rx + per-request deadline)                                │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Only the task awaiting a [`FrameFuture`] waits. Dropping the future
//! forgets its pending entry; stopping the pool fails everything outstanding
//! with [`CameraError::PoolClosed`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Sleep;
use tracing::{debug, info, warn};

// =============================================================================
// Types
// =============================================================================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CameraError {
    /// The pool stopped before answering.
    #[error("Camera pool is closed")]
    PoolClosed,

    /// Too many captures queued.
    #[error("Camera pool is busy")]
    Busy,

    #[error("Capture timed out after {0} ms")]
    Timeout(u64),

    /// Backend failure.
    #[error("Capture failed: {0}")]
    Capture(String),
}

/// Parameters of one capture.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureRequest {
    /// Server-side snapshot id, echoed back with the frame.
    pub snapshot_id: Option<String>,
    pub max_width: Option<u32>,
    /// How long the caller waits for the frame.
    pub timeout: Duration,
}

impl Default for CaptureRequest {
    fn default() -> Self {
        CaptureRequest {
            snapshot_id: None,
            max_width: None,
            timeout: Duration::from_secs(10),
        }
    }
}

impl CaptureRequest {
    pub fn snapshot(id: Option<String>) -> Self {
        CaptureRequest {
            snapshot_id: id,
            ..Default::default()
        }
    }
}

/// One captured image.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraFrame {
    pub data: Vec<u8>,
    pub content_type: String,
    pub captured_at: DateTime<Utc>,
}

impl CameraFrame {
    pub fn jpeg(data: Vec<u8>) -> Self {
        CameraFrame {
            data,
            content_type: "image/jpeg".to_string(),
            captured_at: Utc::now(),
        }
    }
}

type CaptureResult = Result<CameraFrame, CameraError>;

/// Capture backend driven by the pool's worker task.
#[async_trait]
pub trait FrameSource: Send + 'static {
    async fn capture(&mut self, request: &CaptureRequest) -> CaptureResult;
}

// =============================================================================
// Broker Messages
// =============================================================================

enum BrokerMsg {
    Request {
        id: u64,
        request: CaptureRequest,
        reply: oneshot::Sender<CaptureResult>,
    },
    Cancel(u64),
}

// =============================================================================
// Handle & Future
// =============================================================================

/// Cloneable entry point for capture requests.
#[derive(Debug, Clone)]
pub struct CameraHandle {
    broker_tx: mpsc::UnboundedSender<BrokerMsg>,
    next_id: Arc<AtomicU64>,
    pending: Arc<AtomicUsize>,
}

impl std::fmt::Debug for BrokerMsg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrokerMsg::Request { id, .. } => write!(f, "Request({id})"),
            BrokerMsg::Cancel(id) => write!(f, "Cancel({id})"),
        }
    }
}

impl CameraHandle {
    /// Queues a capture and returns the future of its frame.
    pub fn request(&self, request: CaptureRequest) -> FrameFuture {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply, rx) = oneshot::channel();
        let timeout = request.timeout;

        // On failure the reply sender is dropped with the message and the
        // future resolves to PoolClosed.
        let _ = self.broker_tx.send(BrokerMsg::Request { id, request, reply });

        FrameFuture {
            id,
            rx,
            deadline: Box::pin(tokio::time::sleep(timeout)),
            timeout,
            settled: false,
            broker_tx: self.broker_tx.clone(),
        }
    }

    /// Requests waiting for an answer.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }
}

/// Resolves to the frame of one request.
pub struct FrameFuture {
    id: u64,
    rx: oneshot::Receiver<CaptureResult>,
    deadline: Pin<Box<Sleep>>,
    timeout: Duration,
    settled: bool,
    broker_tx: mpsc::UnboundedSender<BrokerMsg>,
}

impl FrameFuture {
    /// Correlation id of the request.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Future for FrameFuture {
    type Output = CaptureResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Poll::Ready(result) = Pin::new(&mut self.rx).poll(cx) {
            self.settled = true;
            return Poll::Ready(result.unwrap_or(Err(CameraError::PoolClosed)));
        }
        if self.deadline.as_mut().poll(cx).is_ready() {
            let ms = self.timeout.as_millis() as u64;
            return Poll::Ready(Err(CameraError::Timeout(ms)));
        }
        Poll::Pending
    }
}

impl Drop for FrameFuture {
    fn drop(&mut self) {
        if !self.settled {
            let _ = self.broker_tx.send(BrokerMsg::Cancel(self.id));
        }
    }
}

// =============================================================================
// Pool
// =============================================================================

/// Owns the broker and worker tasks.
pub struct CameraPool {
    handle: CameraHandle,
    shutdown_tx: Option<oneshot::Sender<()>>,
    broker: JoinHandle<()>,
}

impl CameraPool {
    /// Starts the pool. `capacity` bounds captures queued for the backend.
    pub fn spawn<S: FrameSource>(capacity: usize, source: S) -> Self {
        let (broker_tx, broker_rx) = mpsc::unbounded_channel();
        let (work_tx, work_rx) = mpsc::channel(capacity.max(1));
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let pending = Arc::new(AtomicUsize::new(0));

        tokio::spawn(run_worker(source, work_rx, results_tx));
        let broker = tokio::spawn(run_broker(
            broker_rx,
            work_tx,
            results_rx,
            shutdown_rx,
            pending.clone(),
        ));

        CameraPool {
            handle: CameraHandle {
                broker_tx,
                next_id: Arc::new(AtomicU64::new(1)),
                pending,
            },
            shutdown_tx: Some(shutdown_tx),
            broker,
        }
    }

    pub fn handle(&self) -> CameraHandle {
        self.handle.clone()
    }

    /// Stops the pool. Outstanding futures resolve to `PoolClosed`.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.broker).await {
            warn!(error = %e, "Camera broker ended abnormally");
        }
    }
}

async fn run_broker(
    mut broker_rx: mpsc::UnboundedReceiver<BrokerMsg>,
    work_tx: mpsc::Sender<(u64, CaptureRequest)>,
    mut results_rx: mpsc::UnboundedReceiver<(u64, CaptureResult)>,
    mut shutdown_rx: oneshot::Receiver<()>,
    pending_count: Arc<AtomicUsize>,
) {
    let mut pending: HashMap<u64, oneshot::Sender<CaptureResult>> = HashMap::new();

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => break,

            msg = broker_rx.recv() => match msg {
                Some(BrokerMsg::Request { id, request, reply }) => {
                    match work_tx.try_send((id, request)) {
                        Ok(()) => {
                            pending.insert(id, reply);
                        }
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            let _ = reply.send(Err(CameraError::Busy));
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            let _ = reply.send(Err(CameraError::PoolClosed));
                        }
                    }
                }
                Some(BrokerMsg::Cancel(id)) => {
                    if pending.remove(&id).is_some() {
                        debug!(id, "Capture request abandoned");
                    }
                }
                None => break,
            },

            Some((id, result)) = results_rx.recv() => {
                match pending.remove(&id) {
                    Some(reply) => {
                        let _ = reply.send(result);
                    }
                    None => debug!(id, "Discarding frame nobody waits for"),
                }
            }
        }
        pending_count.store(pending.len(), Ordering::Relaxed);
    }

    pending_count.store(0, Ordering::Relaxed);
    info!(outstanding = pending.len(), "Camera pool stopped");
}

async fn run_worker<S: FrameSource>(
    mut source: S,
    mut work_rx: mpsc::Receiver<(u64, CaptureRequest)>,
    results_tx: mpsc::UnboundedSender<(u64, CaptureResult)>,
) {
    while let Some((id, request)) = work_rx.recv().await {
        let result = source.capture(&request).await;
        if results_tx.send((id, result)).is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Answers after `delay` with the request's snapshot id as the payload.
    struct EchoSource {
        delay: Duration,
    }

    #[async_trait]
    impl FrameSource for EchoSource {
        async fn capture(&mut self, request: &CaptureRequest) -> CaptureResult {
            tokio::time::sleep(self.delay).await;
            match &request.snapshot_id {
                Some(id) if id == "broken" => Err(CameraError::Capture("no device".into())),
                Some(id) => Ok(CameraFrame::jpeg(id.clone().into_bytes())),
                None => Ok(CameraFrame::jpeg(Vec::new())),
            }
        }
    }

    #[tokio::test]
    async fn test_answers_are_routed_by_id() {
        tokio::time::pause();
        let pool = CameraPool::spawn(4, EchoSource { delay: Duration::from_millis(50) });
        let camera = pool.handle();

        let a = camera.request(CaptureRequest::snapshot(Some("a".into())));
        let b = camera.request(CaptureRequest::snapshot(Some("b".into())));
        assert_ne!(a.id(), b.id());

        let (b, a) = (b.await.unwrap(), a.await.unwrap());
        assert_eq!(a.data, b"a");
        assert_eq!(b.data, b"b");

        let err = camera
            .request(CaptureRequest::snapshot(Some("broken".into())))
            .await
            .unwrap_err();
        assert_eq!(err, CameraError::Capture("no device".into()));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_request_times_out() {
        tokio::time::pause();
        let pool = CameraPool::spawn(4, EchoSource { delay: Duration::from_secs(30) });
        let camera = pool.handle();

        let request = CaptureRequest {
            timeout: Duration::from_secs(2),
            ..Default::default()
        };
        assert_eq!(camera.request(request).await, Err(CameraError::Timeout(2000)));

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(camera.pending(), 0);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_dropped_future_forgets_entry() {
        tokio::time::pause();
        let pool = CameraPool::spawn(4, EchoSource { delay: Duration::from_secs(1) });
        let camera = pool.handle();

        let abandoned = camera.request(CaptureRequest::default());
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(camera.pending(), 1);

        drop(abandoned);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(camera.pending(), 0);

        let frame = camera.request(CaptureRequest::snapshot(Some("next".into()))).await;
        assert_eq!(frame.unwrap().data, b"next");
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_fails_outstanding() {
        tokio::time::pause();
        let pool = CameraPool::spawn(4, EchoSource { delay: Duration::from_secs(5) });
        let camera = pool.handle();

        let waiting = camera.request(CaptureRequest::default());
        tokio::time::sleep(Duration::from_millis(1)).await;
        pool.shutdown().await;

        assert_eq!(waiting.await, Err(CameraError::PoolClosed));
        assert_eq!(
            camera.request(CaptureRequest::default()).await,
            Err(CameraError::PoolClosed)
        );
    }

    #[tokio::test]
    async fn test_full_queue_reports_busy() {
        tokio::time::pause();
        let pool = CameraPool::spawn(1, EchoSource { delay: Duration::from_secs(5) });
        let camera = pool.handle();

        let first = camera.request(CaptureRequest::default());
        tokio::time::sleep(Duration::from_millis(1)).await;
        let second = camera.request(CaptureRequest::default());
        let third = camera.request(CaptureRequest::default());

        assert_eq!(third.await, Err(CameraError::Busy));
        drop(second);
        drop(first);
        pool.shutdown().await;
    }
}
