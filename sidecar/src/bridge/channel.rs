//! Duplex channel between the bridge and a remote execution context.
//!
//! The two ends exchange JSON text frames only; nothing else is shared.
//!
//! ```text
//! ┌──────────────┐   OutboundMessage frames   ┌────────────────┐
//! │  WorkerLink  │ ─────────────────────────► │ WorkerEndpoint │
//! │  (bridge)    │ ◄───────────────────────── │ (worker)       │
//! └──────────────┘   InboundMessage frames    └────────────────┘
//! ```
//!
//! A [`WorkerSpawner`] produces a fresh link every time the bridge
//! initializes, which is what allows re-initialization after disposal.

use tokio::sync::mpsc;
use tracing::warn;

use super::error::BridgeError;
use super::protocol::{InboundMessage, OutboundMessage, ProgressEvent, TaskResponse};

/// A single serialized message.
pub type Frame = String;

/// Bridge side of a worker channel.
#[derive(Debug)]
pub struct WorkerLink {
    /// Frames to the worker.
    pub outbound: mpsc::UnboundedSender<Frame>,
    /// Frames from the worker.
    pub inbound: mpsc::UnboundedReceiver<Frame>,
}

/// Worker side of a worker channel.
#[derive(Debug)]
pub struct WorkerEndpoint {
    requests: mpsc::UnboundedReceiver<Frame>,
    responder: WorkerResponder,
}

/// Cloneable sending half of a [`WorkerEndpoint`].
#[derive(Clone, Debug)]
pub struct WorkerResponder {
    tx: mpsc::UnboundedSender<Frame>,
}

/// Creates a connected in-process link/endpoint pair.
pub fn worker_channel() -> (WorkerLink, WorkerEndpoint) {
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

    let link = WorkerLink {
        outbound: outbound_tx,
        inbound: inbound_rx,
    };
    let endpoint = WorkerEndpoint {
        requests: outbound_rx,
        responder: WorkerResponder { tx: inbound_tx },
    };
    (link, endpoint)
}

impl WorkerEndpoint {
    /// Receives the next well-formed request.
    ///
    /// Malformed frames are logged and skipped. Returns `None` once the
    /// bridge side has dropped its link.
    pub async fn recv(&mut self) -> Option<OutboundMessage> {
        loop {
            let frame = self.requests.recv().await?;
            match OutboundMessage::decode(&frame) {
                Ok(message) => return Some(message),
                Err(e) => warn!(error = %e, "Worker dropping malformed request frame"),
            }
        }
    }

    /// Returns a cloneable handle for sending responses and progress.
    pub fn responder(&self) -> WorkerResponder {
        self.responder.clone()
    }
}

impl WorkerResponder {
    /// Sends a terminal response. Returns false if the bridge is gone.
    pub fn respond(&self, response: TaskResponse) -> bool {
        self.send(InboundMessage::Response(response))
    }

    /// Sends a progress event. Returns false if the bridge is gone.
    pub fn progress(&self, event: ProgressEvent) -> bool {
        self.send(InboundMessage::Progress(event))
    }

    /// Sends an arbitrary frame, bypassing encoding.
    pub fn send_raw(&self, frame: impl Into<Frame>) -> bool {
        self.tx.send(frame.into()).is_ok()
    }

    fn send(&self, message: InboundMessage) -> bool {
        match message.encode() {
            Ok(frame) => self.send_raw(frame),
            Err(e) => {
                warn!(id = %message.id(), error = %e, "Failed to encode worker message");
                false
            }
        }
    }
}

// =============================================================================
// Spawners
// =============================================================================

/// Opens a channel to a fresh remote execution context.
pub trait WorkerSpawner: Send + Sync + 'static {
    /// Starts a worker and returns the bridge side of its channel.
    ///
    /// Called once per `initialize()`. Must not block.
    fn spawn(&self) -> Result<WorkerLink, BridgeError>;
}

/// Spawner that hands each worker endpoint to the owner instead of running
/// a worker.
///
/// Used to drive the remote side by hand: the owner receives one
/// [`WorkerEndpoint`] per bridge initialization.
#[derive(Debug)]
pub struct LoopbackSpawner {
    endpoints: mpsc::UnboundedSender<WorkerEndpoint>,
}

impl LoopbackSpawner {
    /// Creates the spawner and the receiver of worker endpoints.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<WorkerEndpoint>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { endpoints: tx }, rx)
    }
}

impl WorkerSpawner for LoopbackSpawner {
    fn spawn(&self) -> Result<WorkerLink, BridgeError> {
        let (link, endpoint) = worker_channel();
        self.endpoints.send(endpoint).map_err(|_| {
            BridgeError::InitializationFailure("loopback endpoint receiver dropped".to_string())
        })?;
        Ok(link)
    }
}
