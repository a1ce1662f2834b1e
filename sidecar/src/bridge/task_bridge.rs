//! The task bridge.
//!
//! [`TaskBridge`] owns one long-lived channel to a remote execution context
//! and turns its asynchronous, possibly out-of-order message stream into
//! ordinary futures.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                            TaskBridge                            │
//! │                                                                  │
//! │  submit() ──► PendingTable ◄── id ── router task ◄── worker      │
//! │      │            ▲                      │                       │
//! │      ▼            │ settle once          └─► progress sinks      │
//! │  DispatchQueue ───┴──► pump (FIFO, ≤ max_concurrent) ──► worker  │
//! │                   ▲                                              │
//! │              watchdog (deadline / cancellation) per request      │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The pending table, the queue and the in-flight count sit behind a single
//! mutex, so dispatch never runs re-entrantly and every request is settled
//! by exactly one of: terminal response, timeout, cancellation, disposal.
//!
//! # Lifecycle
//!
//! `Uninitialized → Initializing → Ready → Disposed`. `initialize()` from
//! `Disposed` opens a fresh channel; correlation ids keep increasing across
//! channels so a stale response can never match a newer request.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::channel::{Frame, WorkerSpawner};
use super::config::BridgeConfig;
use super::error::BridgeError;
use super::metrics::{BridgeMetrics, BridgeStats};
use super::pending::{Outcome, PendingRequest, PendingTable, ProgressSink};
use super::policy::RetryPolicy;
use super::protocol::{
    InboundMessage, OutboundMessage, ProgressEvent, RequestId, TaskResponse, INIT_MESSAGE,
};
use super::queue::{DispatchQueue, QueueEntry};
use super::task::Task;

// =============================================================================
// Public Types
// =============================================================================

/// Observable lifecycle state of a bridge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BridgeState {
    Uninitialized,
    Initializing,
    Ready,
    Disposed,
}

impl fmt::Display for BridgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BridgeState::Uninitialized => "uninitialized",
            BridgeState::Initializing => "initializing",
            BridgeState::Ready => "ready",
            BridgeState::Disposed => "disposed",
        };
        f.write_str(name)
    }
}

/// Per-call options for [`TaskBridge::execute`].
#[derive(Clone, Default)]
pub struct ExecuteOptions {
    /// Deadline for this call; the bridge default applies when unset.
    pub timeout: Option<Duration>,

    /// Receives progress events for this call.
    pub on_progress: Option<ProgressSink>,

    /// Cancels this call when triggered.
    pub cancellation: Option<CancellationToken>,

    /// Bounded retry for timeouts and remote failures.
    pub retry: RetryPolicy,
}

impl ExecuteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the deadline for this call.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the progress callback.
    pub fn with_progress<F>(mut self, sink: F) -> Self
    where
        F: Fn(&ProgressEvent) + Send + Sync + 'static,
    {
        self.on_progress = Some(Arc::new(sink));
        self
    }

    /// Set the cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

impl fmt::Debug for ExecuteOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecuteOptions")
            .field("timeout", &self.timeout)
            .field("has_progress", &self.on_progress.is_some())
            .field("has_cancellation", &self.cancellation.is_some())
            .field("retry", &self.retry)
            .finish()
    }
}

/// Handle to a submitted request.
///
/// Dropping the handle does not cancel the request; use
/// [`TaskBridge::abort`] with [`TaskHandle::id`] for that.
#[derive(Debug)]
pub struct TaskHandle {
    id: RequestId,
    receiver: oneshot::Receiver<Outcome>,
}

impl TaskHandle {
    /// Correlation id of the request.
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Waits for the request to settle.
    pub async fn wait(self) -> Result<Value, BridgeError> {
        // The sender only disappears unsettled if the bridge itself is gone.
        self.receiver.await.unwrap_or(Err(BridgeError::Disposed))
    }
}

// =============================================================================
// Internal State
// =============================================================================

type Handshake = Shared<BoxFuture<'static, Result<(), BridgeError>>>;

enum Lifecycle {
    Uninitialized,
    Initializing(Handshake),
    Ready,
    Disposed,
}

struct BridgeInner {
    lifecycle: Lifecycle,
    pending: PendingTable,
    queue: DispatchQueue,
    outbound: Option<mpsc::UnboundedSender<Frame>>,
    router: Option<JoinHandle<()>>,
    /// Correlation id of the in-flight `init`; never counted in stats.
    handshake: Option<RequestId>,
    /// Channel generation; bumped whenever the channel is torn down so that
    /// stale routers and handshakes can recognise themselves.
    epoch: u64,
}

struct BridgeCore {
    config: BridgeConfig,
    inner: Mutex<BridgeInner>,
    metrics: BridgeMetrics,
    next_id: AtomicU64,
}

// =============================================================================
// Task Bridge
// =============================================================================

/// Request/response correlation over a worker channel.
///
/// Construct one per worker and share it by `Arc`. All methods take `&self`.
pub struct TaskBridge {
    core: Arc<BridgeCore>,
    spawner: Arc<dyn WorkerSpawner>,
}

impl TaskBridge {
    /// Creates an uninitialized bridge.
    ///
    /// # Arguments
    ///
    /// * `config` - Concurrency and timeout settings
    /// * `spawner` - Opens the worker channel on each `initialize()`
    pub fn new(config: BridgeConfig, spawner: Arc<dyn WorkerSpawner>) -> Self {
        let core = BridgeCore {
            config,
            inner: Mutex::new(BridgeInner {
                lifecycle: Lifecycle::Uninitialized,
                pending: PendingTable::new(),
                queue: DispatchQueue::new(),
                outbound: None,
                router: None,
                handshake: None,
                epoch: 0,
            }),
            metrics: BridgeMetrics::default(),
            next_id: AtomicU64::new(1),
        };
        Self {
            core: Arc::new(core),
            spawner,
        }
    }

    /// Returns the bridge configuration.
    pub fn config(&self) -> &BridgeConfig {
        &self.core.config
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> BridgeState {
        match self.core.inner.lock().lifecycle {
            Lifecycle::Uninitialized => BridgeState::Uninitialized,
            Lifecycle::Initializing(_) => BridgeState::Initializing,
            Lifecycle::Ready => BridgeState::Ready,
            Lifecycle::Disposed => BridgeState::Disposed,
        }
    }

    /// Opens the worker channel and performs the `init` handshake.
    ///
    /// Idempotent: returns immediately when ready, and concurrent callers
    /// during a handshake all receive that handshake's outcome.
    ///
    /// # Errors
    ///
    /// [`BridgeError::InitializationFailure`] if the worker cannot be
    /// spawned, rejects the handshake, or does not answer within
    /// `init_timeout`. The bridge is left uninitialized and may be retried.
    pub async fn initialize(&self) -> Result<(), BridgeError> {
        let handshake = {
            let mut inner = self.core.inner.lock();
            let existing = match &inner.lifecycle {
                Lifecycle::Ready => return Ok(()),
                Lifecycle::Initializing(handshake) => Some(handshake.clone()),
                Lifecycle::Uninitialized | Lifecycle::Disposed => None,
            };
            match existing {
                Some(handshake) => handshake,
                None => {
                    let handshake = run_handshake(
                        Arc::downgrade(&self.core),
                        Arc::clone(&self.spawner),
                        inner.epoch,
                    )
                    .boxed()
                    .shared();
                    inner.lifecycle = Lifecycle::Initializing(handshake.clone());
                    handshake
                }
            }
        };
        handshake.await
    }

    /// Runs a task and waits for its terminal outcome.
    ///
    /// Initializes the bridge first if it has not been initialized yet.
    /// With a retry policy, retryable failures are re-submitted under fresh
    /// ids; only the final outcome is returned.
    ///
    /// # Errors
    ///
    /// - [`BridgeError::NotInitialized`] after `dispose()`
    /// - [`BridgeError::Timeout`], [`BridgeError::Cancelled`],
    ///   [`BridgeError::RemoteExecutionFailure`], [`BridgeError::Disposed`]
    pub async fn execute(
        &self,
        task: Task,
        options: ExecuteOptions,
    ) -> Result<Value, BridgeError> {
        let mut attempt = 1;
        loop {
            let handle = self.submit(&task, &options).await?;
            let id = handle.id();
            let error = match handle.wait().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if !error.is_retryable() {
                return Err(error);
            }
            let Some(delay) = options.retry.delay_for_attempt(attempt) else {
                return Err(error);
            };

            warn!(
                id = %id,
                task = task.name(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying request"
            );
            match &options.cancellation {
                Some(token) => {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = token.cancelled() => return Err(BridgeError::Cancelled(id)),
                    }
                }
                None => tokio::time::sleep(delay).await,
            }
            attempt += 1;
        }
    }

    /// Runs a task given by wire name and JSON payload.
    ///
    /// # Errors
    ///
    /// [`BridgeError::UnknownTask`] or [`BridgeError::InvalidPayload`] if the
    /// name and payload do not form a known task, plus everything
    /// [`execute`](Self::execute) returns.
    pub async fn execute_named(
        &self,
        task_name: &str,
        payload: Value,
        options: ExecuteOptions,
    ) -> Result<Value, BridgeError> {
        let task = Task::from_parts(task_name, payload)?;
        self.execute(task, options).await
    }

    /// Queues a task and returns a handle without waiting for the outcome.
    ///
    /// Retry policies are not applied; see [`execute`](Self::execute).
    pub async fn submit(
        &self,
        task: &Task,
        options: &ExecuteOptions,
    ) -> Result<TaskHandle, BridgeError> {
        let payload = task.payload()?;
        loop {
            self.ensure_ready().await?;
            if let Some(handle) = self.core.enqueue(task.name(), payload.clone(), options)? {
                return Ok(handle);
            }
        }
    }

    /// Cancels a pending request.
    ///
    /// Sends a best-effort `abort` to the worker if the request was already
    /// transmitted. The caller's future settles with
    /// [`BridgeError::Cancelled`]; the worker may still finish the work, and
    /// its late response is discarded.
    ///
    /// Returns false if the id is not pending.
    pub fn abort(&self, id: RequestId) -> bool {
        self.core.cancel(id)
    }

    /// Rejects all pending requests, clears the queue and closes the channel.
    ///
    /// Safe to call any number of times from any state. Later calls fail
    /// with [`BridgeError::NotInitialized`] until `initialize()` is called.
    pub fn dispose(&self) {
        let (drained, was_active) = {
            let mut inner = self.core.inner.lock();
            let was_active = !matches!(inner.lifecycle, Lifecycle::Disposed)
                && (inner.outbound.is_some() || inner.pending.len() > 0);
            BridgeCore::teardown(&mut inner);
            inner.lifecycle = Lifecycle::Disposed;
            inner.queue.clear();
            (inner.pending.drain(), was_active)
        };

        let rejected = drained.len();
        for request in drained {
            request.settle(Err(BridgeError::Disposed));
        }
        if was_active {
            info!(rejected, "Task bridge disposed");
        }
    }

    /// Returns a snapshot of bridge counters.
    pub fn stats(&self) -> BridgeStats {
        let inner = self.core.inner.lock();
        self.core.metrics.snapshot(
            inner.queue.len(),
            inner.pending.in_flight(),
            inner.pending.len(),
        )
    }

    /// Returns true if `id` has not been settled yet.
    pub fn is_pending(&self, id: RequestId) -> bool {
        self.core.inner.lock().pending.contains(id)
    }

    /// Number of requests transmitted and awaiting a terminal response.
    pub fn in_flight(&self) -> usize {
        self.core.inner.lock().pending.in_flight()
    }

    /// Number of requests waiting for a concurrency slot.
    pub fn queued(&self) -> usize {
        self.core.inner.lock().queue.len()
    }

    async fn ensure_ready(&self) -> Result<(), BridgeError> {
        match self.state() {
            BridgeState::Ready => Ok(()),
            BridgeState::Disposed => Err(BridgeError::NotInitialized),
            BridgeState::Uninitialized | BridgeState::Initializing => self.initialize().await,
        }
    }
}

impl Drop for TaskBridge {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for TaskBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskBridge")
            .field("state", &self.state())
            .field("config", &self.core.config)
            .finish()
    }
}

// =============================================================================
// Core
// =============================================================================

impl BridgeCore {
    fn allocate_id(&self) -> RequestId {
        RequestId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Spawns the worker, starts the router and transmits `init`.
    fn open_channel(
        self: &Arc<Self>,
        spawner: &dyn WorkerSpawner,
        epoch: u64,
    ) -> Result<(RequestId, oneshot::Receiver<Outcome>), BridgeError> {
        let link = spawner.spawn().map_err(|e| match e {
            BridgeError::InitializationFailure(_) => e,
            other => BridgeError::InitializationFailure(other.to_string()),
        })?;

        let id = self.allocate_id();
        let frame = OutboundMessage::init(id)
            .encode()
            .map_err(|e| BridgeError::InitializationFailure(e.to_string()))?;

        let mut inner = self.inner.lock();
        if inner.epoch != epoch {
            return Err(BridgeError::InitializationFailure(
                "bridge was reset during initialization".to_string(),
            ));
        }
        if link.outbound.send(frame).is_err() {
            return Err(BridgeError::InitializationFailure(
                "worker channel closed before handshake".to_string(),
            ));
        }

        let (tx, rx) = oneshot::channel();
        if let Err(duplicate) = inner
            .pending
            .insert(PendingRequest::new(id, INIT_MESSAGE, tx, None, None))
        {
            duplicate.settle(Err(BridgeError::ChannelClosed));
            return Err(BridgeError::InitializationFailure(format!(
                "handshake id {} already pending",
                id
            )));
        }

        inner.router = Some(tokio::spawn(route_inbound(
            Arc::downgrade(self),
            link.inbound,
            epoch,
        )));
        inner.outbound = Some(link.outbound);
        inner.handshake = Some(id);
        debug!(id = %id, "Handshake sent");
        Ok((id, rx))
    }

    /// Applies the handshake outcome to the lifecycle.
    fn finish_handshake(
        &self,
        id: RequestId,
        epoch: u64,
        outcome: Result<(), BridgeError>,
    ) -> Result<(), BridgeError> {
        let mut inner = self.inner.lock();
        if inner.epoch != epoch {
            // Disposed or reset while the handshake was in flight; whoever
            // bumped the epoch already owns the lifecycle.
            return Err(outcome.err().unwrap_or_else(|| {
                BridgeError::InitializationFailure(
                    "bridge was reset during initialization".to_string(),
                )
            }));
        }

        // Still present only if the handshake timed out.
        inner.pending.take(id);
        inner.handshake = None;

        match outcome {
            Ok(()) => {
                inner.lifecycle = Lifecycle::Ready;
                info!(
                    max_concurrent = self.config.max_concurrent,
                    "Task bridge ready"
                );
                self.pump(&mut inner);
                Ok(())
            }
            Err(e) => {
                Self::teardown(&mut inner);
                inner.lifecycle = Lifecycle::Uninitialized;
                warn!(error = %e, "Task bridge handshake failed");
                Err(e)
            }
        }
    }

    /// Registers a request and queues it for dispatch.
    ///
    /// Returns `Ok(None)` if the bridge stopped being ready since the caller
    /// checked, so the caller can initialize again.
    fn enqueue(
        self: &Arc<Self>,
        task_name: &str,
        payload: Value,
        options: &ExecuteOptions,
    ) -> Result<Option<TaskHandle>, BridgeError> {
        let mut inner = self.inner.lock();
        match inner.lifecycle {
            Lifecycle::Ready => {}
            Lifecycle::Disposed => return Err(BridgeError::NotInitialized),
            Lifecycle::Uninitialized | Lifecycle::Initializing(_) => return Ok(None),
        }

        let id = self.allocate_id();
        let timeout = options.timeout.unwrap_or(self.config.default_timeout);
        let deadline = Instant::now().checked_add(timeout);
        let (tx, rx) = oneshot::channel();

        let mut request = PendingRequest::new(
            id,
            task_name,
            tx,
            options.on_progress.clone(),
            deadline,
        );
        if deadline.is_some() || options.cancellation.is_some() {
            let watchdog = tokio::spawn(watch_request(
                Arc::downgrade(self),
                id,
                deadline,
                timeout,
                options.cancellation.clone(),
            ));
            request = request.with_watchdog(watchdog.abort_handle());
        }

        if let Err(duplicate) = inner.pending.insert(request) {
            warn!(id = %id, "Correlation id already pending; reallocating");
            duplicate.settle(Err(BridgeError::ChannelClosed));
            return Ok(None);
        }

        inner.queue.push(QueueEntry::new(id, task_name, payload));
        self.metrics.request_submitted();
        debug!(
            id = %id,
            task = task_name,
            timeout_ms = timeout.as_millis() as u64,
            queued = inner.queue.len(),
            "Request queued"
        );

        self.pump(&mut inner);
        Ok(Some(TaskHandle { id, receiver: rx }))
    }

    /// Transmits queued entries in FIFO order while a slot is free.
    ///
    /// Runs under the state lock, so it can never overlap itself.
    fn pump(&self, inner: &mut BridgeInner) {
        if inner.queue.is_empty() || !matches!(inner.lifecycle, Lifecycle::Ready) {
            return;
        }
        let Some(outbound) = inner.outbound.clone() else {
            return;
        };

        while inner.pending.in_flight() < self.config.max_concurrent {
            let Some(entry) = inner.queue.pop() else {
                break;
            };
            let id = entry.id;
            let wait_ms = entry.wait_time().as_millis() as u64;

            if !inner.pending.mark_dispatched(id) {
                debug!(id = %id, "Skipping queue entry for settled request");
                continue;
            }

            let frame = match OutboundMessage::task(id, &entry.task_name, entry.payload).encode()
            {
                Ok(frame) => frame,
                Err(e) => {
                    if let Some(request) = inner.pending.take(id) {
                        request.settle(Err(BridgeError::InvalidPayload {
                            task: entry.task_name.clone(),
                            reason: e.to_string(),
                        }));
                        self.metrics.request_failed();
                    }
                    continue;
                }
            };

            if outbound.send(frame).is_err() {
                if let Some(request) = inner.pending.take(id) {
                    request.settle(Err(BridgeError::ChannelClosed));
                    self.metrics.request_failed();
                }
                continue;
            }

            debug!(
                id = %id,
                task = %entry.task_name,
                wait_ms,
                in_flight = inner.pending.in_flight(),
                "Request dispatched"
            );
        }
    }

    /// Routes one inbound frame.
    fn route(&self, frame: &str) {
        let message = match InboundMessage::decode(frame) {
            Ok(message) => message,
            Err(e) => {
                self.metrics.message_discarded();
                warn!(error = %e, "Dropping malformed worker message");
                return;
            }
        };

        match message {
            InboundMessage::Progress(event) => {
                let sink = self.inner.lock().pending.progress_sink(event.id);
                match sink {
                    // Invoked outside the lock: the sink may call back into the bridge.
                    Some(Some(sink)) => sink(&event),
                    Some(None) => {}
                    None => {
                        self.metrics.message_discarded();
                        debug!(id = %event.id, "Discarding progress for unknown or settled request");
                    }
                }
            }
            InboundMessage::Response(response) => self.complete(response),
        }
    }

    fn complete(&self, response: TaskResponse) {
        let mut inner = self.inner.lock();
        let Some(request) = inner.pending.take(response.id) else {
            self.metrics.message_discarded();
            debug!(id = %response.id, "Discarding response for unknown or settled request");
            return;
        };

        let task = request.task_name.clone();
        let success = response.success;
        let counted = inner.handshake != Some(response.id);
        let outcome = if success {
            if counted {
                self.metrics.request_completed();
            }
            Ok(response.data.unwrap_or(Value::Null))
        } else {
            if counted {
                self.metrics.request_failed();
            }
            Err(BridgeError::RemoteExecutionFailure(response.error.unwrap_or_else(
                || "worker reported failure without a message".to_string(),
            )))
        };

        let elapsed = request.settle(outcome);
        debug!(
            id = %response.id,
            task = %task,
            success,
            elapsed_ms = elapsed.as_millis() as u64,
            "Request settled"
        );
        self.pump(&mut inner);
    }

    fn expire(&self, id: RequestId, timeout: Duration) {
        let mut inner = self.inner.lock();
        let Some(request) = inner.pending.take(id) else {
            return;
        };
        inner.queue.remove(id);

        let task = request.task_name.clone();
        let elapsed = request.settle(Err(BridgeError::Timeout {
            id,
            timeout_ms: timeout.as_millis() as u64,
        }));
        self.metrics.request_timed_out();
        warn!(
            id = %id,
            task = %task,
            elapsed_ms = elapsed.as_millis() as u64,
            "Request timed out"
        );
        self.pump(&mut inner);
    }

    fn cancel(&self, id: RequestId) -> bool {
        let mut inner = self.inner.lock();
        let Some(request) = inner.pending.take(id) else {
            debug!(id = %id, "Abort for unknown or settled request ignored");
            return false;
        };

        if request.dispatched {
            let abort = OutboundMessage::abort(id).encode();
            match (inner.outbound.as_ref(), abort) {
                (Some(outbound), Ok(frame)) => {
                    // Best effort: the worker may already be gone.
                    let _ = outbound.send(frame);
                }
                (_, Err(e)) => warn!(id = %id, error = %e, "Failed to encode abort"),
                (None, _) => {}
            }
        } else {
            inner.queue.remove(id);
        }

        let task = request.task_name.clone();
        let dispatched = request.dispatched;
        request.settle(Err(BridgeError::Cancelled(id)));
        self.metrics.request_cancelled();
        debug!(id = %id, task = %task, dispatched, "Request cancelled");
        self.pump(&mut inner);
        true
    }

    /// Fails everything bound to a channel that closed underneath us.
    fn channel_closed(&self, epoch: u64) {
        let (drained, handshake) = {
            let mut inner = self.inner.lock();
            if inner.epoch != epoch {
                return;
            }
            let handshake = inner.handshake;
            Self::teardown(&mut inner);
            if !matches!(inner.lifecycle, Lifecycle::Disposed) {
                inner.lifecycle = Lifecycle::Uninitialized;
            }
            inner.queue.clear();
            (inner.pending.drain(), handshake)
        };

        if !drained.is_empty() {
            warn!(failed = drained.len(), "Worker channel closed with requests pending");
        } else {
            info!("Worker channel closed");
        }
        for request in drained {
            let counted = Some(request.id) != handshake;
            request.settle(Err(BridgeError::ChannelClosed));
            if counted {
                self.metrics.request_failed();
            }
        }
    }

    fn teardown(inner: &mut BridgeInner) {
        if let Some(router) = inner.router.take() {
            router.abort();
        }
        inner.outbound = None;
        inner.handshake = None;
        inner.epoch += 1;
    }
}

// =============================================================================
// Background Tasks
// =============================================================================

async fn run_handshake(
    core: Weak<BridgeCore>,
    spawner: Arc<dyn WorkerSpawner>,
    epoch: u64,
) -> Result<(), BridgeError> {
    let dropped = || BridgeError::InitializationFailure("bridge dropped".to_string());

    let (id, init_timeout, response) = {
        let core = core.upgrade().ok_or_else(dropped)?;
        let init_timeout = core.config.init_timeout;
        match core.open_channel(spawner.as_ref(), epoch) {
            Ok((id, response)) => (id, init_timeout, response),
            Err(e) => {
                let mut inner = core.inner.lock();
                if inner.epoch == epoch {
                    inner.lifecycle = Lifecycle::Uninitialized;
                }
                warn!(error = %e, "Task bridge failed to open worker channel");
                return Err(e);
            }
        }
    };

    let outcome = match tokio::time::timeout(init_timeout, response).await {
        Ok(Ok(Ok(_))) => Ok(()),
        Ok(Ok(Err(BridgeError::RemoteExecutionFailure(message)))) => {
            Err(BridgeError::InitializationFailure(message))
        }
        Ok(Ok(Err(e))) => Err(BridgeError::InitializationFailure(e.to_string())),
        Ok(Err(_)) => Err(BridgeError::InitializationFailure(
            "handshake abandoned".to_string(),
        )),
        Err(_) => Err(BridgeError::InitializationFailure(format!(
            "handshake timed out after {}ms",
            init_timeout.as_millis()
        ))),
    };

    let core = core.upgrade().ok_or_else(dropped)?;
    core.finish_handshake(id, epoch, outcome)
}

async fn route_inbound(
    core: Weak<BridgeCore>,
    mut inbound: mpsc::UnboundedReceiver<Frame>,
    epoch: u64,
) {
    while let Some(frame) = inbound.recv().await {
        match core.upgrade() {
            Some(core) => core.route(&frame),
            None => return,
        }
    }
    if let Some(core) = core.upgrade() {
        core.channel_closed(epoch);
    }
}

/// Settles a request on deadline expiry or cancellation, whichever is first.
///
/// Aborted by the request's settlement, so it only acts on live requests.
async fn watch_request(
    core: Weak<BridgeCore>,
    id: RequestId,
    deadline: Option<Instant>,
    timeout: Duration,
    cancellation: Option<CancellationToken>,
) {
    let expiry = async move {
        match deadline {
            Some(deadline) => {
                tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await
            }
            None => std::future::pending::<()>().await,
        }
    };
    let cancelled = async move {
        match cancellation {
            Some(token) => token.cancelled().await,
            None => std::future::pending::<()>().await,
        }
    };

    let timed_out = tokio::select! {
        _ = expiry => true,
        _ = cancelled => false,
    };

    let Some(core) = core.upgrade() else {
        return;
    };
    if timed_out {
        core.expire(id, timeout);
    } else {
        core.cancel(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::channel::{LoopbackSpawner, WorkerEndpoint};
    use crate::bridge::protocol::MessageKind;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    async fn ready_bridge(config: BridgeConfig) -> (TaskBridge, WorkerEndpoint) {
        let (spawner, mut endpoints) = LoopbackSpawner::new();
        let bridge = TaskBridge::new(config, Arc::new(spawner));

        let init = bridge.initialize();
        let handshake = async {
            let mut endpoint = endpoints.recv().await.unwrap();
            let message = endpoint.recv().await.unwrap();
            assert_eq!(message.kind(), MessageKind::Init);
            endpoint
                .responder()
                .respond(TaskResponse::ok(message.id, Value::Null));
            endpoint
        };
        let (result, endpoint) = tokio::join!(init, handshake);
        result.unwrap();
        (bridge, endpoint)
    }

    #[tokio::test]
    async fn test_new_bridge_is_uninitialized() {
        let (spawner, _endpoints) = LoopbackSpawner::new();
        let bridge = TaskBridge::new(BridgeConfig::default(), Arc::new(spawner));
        assert_eq!(bridge.state(), BridgeState::Uninitialized);
        assert_eq!(bridge.stats(), BridgeStats::default());
    }

    #[tokio::test]
    async fn test_initialize_reaches_ready_and_is_idempotent() {
        let (bridge, _endpoint) = ready_bridge(BridgeConfig::default()).await;
        assert_eq!(bridge.state(), BridgeState::Ready);

        // Second call is a no-op; no new handshake is sent
        bridge.initialize().await.unwrap();
        assert_eq!(bridge.state(), BridgeState::Ready);
    }

    #[tokio::test]
    async fn test_initialize_leaves_counters_at_zero() {
        let (bridge, _endpoint) = ready_bridge(BridgeConfig::default()).await;
        assert_eq!(bridge.stats(), BridgeStats::default());
    }

    #[tokio::test]
    async fn test_rejected_handshake_is_not_counted_as_failure() {
        let (spawner, mut endpoints) = LoopbackSpawner::new();
        let bridge = TaskBridge::new(BridgeConfig::default(), Arc::new(spawner));

        let init = bridge.initialize();
        let worker = async {
            let mut endpoint = endpoints.recv().await.unwrap();
            let message = endpoint.recv().await.unwrap();
            endpoint
                .responder()
                .respond(TaskResponse::failed(message.id, "model missing"));
            endpoint
        };
        let (result, _endpoint) = tokio::join!(init, worker);

        assert_eq!(
            result.unwrap_err(),
            BridgeError::InitializationFailure("model missing".to_string())
        );
        assert_eq!(bridge.state(), BridgeState::Uninitialized);
        assert_eq!(bridge.stats(), BridgeStats::default());
    }

    #[tokio::test]
    async fn test_worker_exit_during_handshake_is_not_counted() {
        let (spawner, mut endpoints) = LoopbackSpawner::new();
        let bridge = TaskBridge::new(BridgeConfig::default(), Arc::new(spawner));

        let init = bridge.initialize();
        let worker = async {
            let mut endpoint = endpoints.recv().await.unwrap();
            endpoint.recv().await.unwrap();
            drop(endpoint);
        };
        let (result, _) = tokio::join!(init, worker);

        assert!(matches!(
            result.unwrap_err(),
            BridgeError::InitializationFailure(_)
        ));
        assert_eq!(bridge.stats().failed, 0);
    }

    #[tokio::test]
    async fn test_execute_resolves_with_response_data() {
        let (bridge, mut endpoint) = ready_bridge(BridgeConfig::default()).await;
        let responder = endpoint.responder();

        let worker = async {
            let message = endpoint.recv().await.unwrap();
            assert_eq!(message.kind(), MessageKind::Task("summarize"));
            assert_eq!(message.payload["text"], json!("hello"));
            responder.respond(TaskResponse::ok(message.id, json!({"summary": "hi"})));
        };
        let (result, _) = tokio::join!(
            bridge.execute(Task::summarize("hello"), ExecuteOptions::new()),
            worker
        );

        assert_eq!(result.unwrap(), json!({"summary": "hi"}));
        let stats = bridge.stats();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test]
    async fn test_remote_failure_carries_message() {
        let (bridge, mut endpoint) = ready_bridge(BridgeConfig::default()).await;
        let responder = endpoint.responder();

        let worker = async {
            let message = endpoint.recv().await.unwrap();
            responder.respond(TaskResponse::failed(message.id, "model not loaded"));
        };
        let (result, _) = tokio::join!(
            bridge.execute(Task::summarize("x"), ExecuteOptions::new()),
            worker
        );

        assert_eq!(
            result.unwrap_err(),
            BridgeError::RemoteExecutionFailure("model not loaded".to_string())
        );
        assert_eq!(bridge.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_progress_reaches_sink_before_resolution() {
        let (bridge, mut endpoint) = ready_bridge(BridgeConfig::default()).await;
        let responder = endpoint.responder();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_in_sink = Arc::clone(&seen);

        let options = ExecuteOptions::new().with_progress(move |event| {
            assert!(event.progress <= 100.0);
            seen_in_sink.fetch_add(1, Ordering::SeqCst);
        });

        let worker = async {
            let message = endpoint.recv().await.unwrap();
            for pct in [10.0, 50.0, 90.0] {
                responder.progress(ProgressEvent::new(message.id, pct, "running", ""));
            }
            responder.respond(TaskResponse::ok(message.id, json!(null)));
        };
        let (result, _) = tokio::join!(bridge.execute(Task::summarize("x"), options), worker);

        result.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_unknown_ids_and_garbage_are_discarded() {
        let (bridge, endpoint) = ready_bridge(BridgeConfig::default()).await;
        let responder = endpoint.responder();

        responder.respond(TaskResponse::ok(RequestId::new(9_999), json!(1)));
        responder.progress(ProgressEvent::new(RequestId::new(9_999), 5.0, "", ""));
        responder.send_raw("{not json");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(bridge.state(), BridgeState::Ready);
        assert_eq!(bridge.stats().discarded, 3);
    }

    #[tokio::test]
    async fn test_execute_named_rejects_unknown_task() {
        let (bridge, _endpoint) = ready_bridge(BridgeConfig::default()).await;
        let err = bridge
            .execute_named("paint", json!({}), ExecuteOptions::new())
            .await
            .unwrap_err();
        assert_eq!(err, BridgeError::UnknownTask("paint".to_string()));
        assert_eq!(bridge.stats().submitted, 0);
    }

    #[tokio::test]
    async fn test_dispose_rejects_pending_and_is_repeatable() {
        let (bridge, mut endpoint) = ready_bridge(BridgeConfig::default()).await;

        let handle = bridge
            .submit(&Task::summarize("x"), &ExecuteOptions::new())
            .await
            .unwrap();
        endpoint.recv().await.unwrap();

        bridge.dispose();
        bridge.dispose();

        assert_eq!(handle.wait().await.unwrap_err(), BridgeError::Disposed);
        assert_eq!(bridge.state(), BridgeState::Disposed);

        let err = bridge
            .execute(Task::summarize("y"), ExecuteOptions::new())
            .await
            .unwrap_err();
        assert_eq!(err, BridgeError::NotInitialized);
    }

    #[tokio::test]
    async fn test_abort_unknown_id_returns_false() {
        let (bridge, _endpoint) = ready_bridge(BridgeConfig::default()).await;
        assert!(!bridge.abort(RequestId::new(12_345)));
    }

    #[tokio::test]
    async fn test_worker_exit_fails_pending_and_resets() {
        let (bridge, mut endpoint) = ready_bridge(BridgeConfig::default()).await;

        let handle = bridge
            .submit(&Task::summarize("x"), &ExecuteOptions::new())
            .await
            .unwrap();
        endpoint.recv().await.unwrap();
        drop(endpoint);

        assert_eq!(handle.wait().await.unwrap_err(), BridgeError::ChannelClosed);
        assert_eq!(bridge.state(), BridgeState::Uninitialized);
    }
}
