//! In-process worker.
//!
//! Runs a [`TaskHandler`] on the tokio runtime behind a regular worker
//! channel, so the bridge sees exactly the same message stream it would see
//! from an out-of-process worker.
//!
//! The serve loop answers `init` with the handler's warm-up result, turns
//! `abort` into cancellation of the targeted request, and runs each task on
//! its own tokio task so that several requests can be in flight at once.
//! Every task message gets exactly one terminal response.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::channel::{worker_channel, WorkerEndpoint, WorkerLink, WorkerResponder, WorkerSpawner};
use super::error::BridgeError;
use super::protocol::{
    OutboundMessage, ProgressEvent, RequestId, TaskResponse, ABORT_MESSAGE, INIT_MESSAGE,
};
use super::task::Task;

/// Error text of the response sent for an aborted request.
pub const ABORTED_MESSAGE: &str = "aborted";

/// Executes tasks on behalf of an [`InProcessWorker`].
///
/// Errors are plain strings: they cross the channel as the `error` field of
/// a failure response.
pub trait TaskHandler: Send + Sync + 'static {
    /// Prepares the handler. Runs once per channel, in response to `init`.
    fn warm_up(&self) -> BoxFuture<'_, Result<(), String>> {
        Box::pin(async { Ok(()) })
    }

    /// Runs one task.
    ///
    /// # Arguments
    ///
    /// * `task` - The decoded task
    /// * `progress` - Sends progress events for this request
    /// * `cancel` - Triggered when the bridge aborts the request
    fn handle<'a>(
        &'a self,
        task: Task,
        progress: ProgressReporter,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<Value, String>>;
}

/// Sends progress events for a single request.
#[derive(Clone, Debug)]
pub struct ProgressReporter {
    id: RequestId,
    responder: WorkerResponder,
}

impl ProgressReporter {
    pub fn new(id: RequestId, responder: WorkerResponder) -> Self {
        Self { id, responder }
    }

    /// The request this reporter belongs to.
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Reports a percentage. Returns false if the bridge is gone.
    pub fn report(&self, progress: f32, status: &str, message: &str) -> bool {
        self.responder
            .progress(ProgressEvent::new(self.id, progress, status, message))
    }

    /// Reports byte-level progress, deriving the percentage.
    pub fn report_bytes(&self, loaded: u64, total: u64, status: &str, message: &str) -> bool {
        let progress = if total == 0 {
            100.0
        } else {
            (loaded as f64 / total as f64 * 100.0) as f32
        };
        self.responder.progress(
            ProgressEvent::new(self.id, progress, status, message).with_bytes(loaded, total),
        )
    }
}

/// Spawner that serves a [`TaskHandler`] on the current tokio runtime.
pub struct InProcessWorker<H> {
    handler: Arc<H>,
}

impl<H: TaskHandler> InProcessWorker<H> {
    pub fn new(handler: H) -> Self {
        Self::from_arc(Arc::new(handler))
    }

    /// Shares a handler that is also used elsewhere.
    pub fn from_arc(handler: Arc<H>) -> Self {
        Self { handler }
    }
}

impl<H: TaskHandler> WorkerSpawner for InProcessWorker<H> {
    fn spawn(&self) -> Result<WorkerLink, BridgeError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| BridgeError::InitializationFailure(e.to_string()))?;
        let (link, endpoint) = worker_channel();
        runtime.spawn(serve(Arc::clone(&self.handler), endpoint));
        Ok(link)
    }
}

async fn serve<H: TaskHandler>(handler: Arc<H>, mut endpoint: WorkerEndpoint) {
    let responder = endpoint.responder();
    let running: Arc<Mutex<HashMap<RequestId, CancellationToken>>> =
        Arc::new(Mutex::new(HashMap::new()));
    let shutdown = CancellationToken::new();

    info!("In-process worker started");

    while let Some(message) = endpoint.recv().await {
        let OutboundMessage {
            id,
            message_type,
            payload,
            ..
        } = message;

        match message_type.as_str() {
            INIT_MESSAGE => {
                let response = match handler.warm_up().await {
                    Ok(()) => TaskResponse::ok(id, Value::Null),
                    Err(e) => TaskResponse::failed(id, e),
                };
                responder.respond(response);
            }
            ABORT_MESSAGE => {
                if let Some(token) = running.lock().remove(&id) {
                    debug!(id = %id, "Worker aborting request");
                    token.cancel();
                }
            }
            name => {
                let task = match Task::from_parts(name, payload) {
                    Ok(task) => task,
                    Err(e) => {
                        responder.respond(TaskResponse::failed(id, e.to_string()));
                        continue;
                    }
                };

                let token = shutdown.child_token();
                running.lock().insert(id, token.clone());

                let handler = Arc::clone(&handler);
                let responder = responder.clone();
                let running = Arc::clone(&running);
                tokio::spawn(async move {
                    let reporter = ProgressReporter::new(id, responder.clone());
                    let outcome = tokio::select! {
                        result = handler.handle(task, reporter, token.clone()) => result,
                        _ = token.cancelled() => Err(ABORTED_MESSAGE.to_string()),
                    };
                    running.lock().remove(&id);

                    let response = match outcome {
                        Ok(data) => TaskResponse::ok(id, data),
                        Err(e) => TaskResponse::failed(id, e),
                    };
                    responder.respond(response);
                });
            }
        }
    }

    shutdown.cancel();
    info!("In-process worker stopped");
}
