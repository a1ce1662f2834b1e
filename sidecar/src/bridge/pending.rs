//! Pending-request table.
//!
//! Holds one continuation per outstanding request. Removal through
//! [`PendingTable::take`] is the only way to obtain a request's responder,
//! so whichever of response, timeout, cancellation or disposal gets there
//! first settles the request and every later attempt finds nothing.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use super::error::BridgeError;
use super::protocol::{ProgressEvent, RequestId};

/// Callback receiving progress events for one request.
pub type ProgressSink = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

/// Outcome delivered to the caller's future.
pub(crate) type Outcome = Result<Value, BridgeError>;

/// One outstanding call awaiting a terminal response.
pub(crate) struct PendingRequest {
    pub id: RequestId,
    pub task_name: String,
    responder: oneshot::Sender<Outcome>,
    pub progress: Option<ProgressSink>,
    pub deadline: Option<Instant>,
    pub created_at: Instant,
    /// Transmitted to the worker and counted against the concurrency gate.
    pub dispatched: bool,
    /// Timer/cancellation watcher, stopped when the request settles.
    watchdog: Option<AbortHandle>,
}

impl PendingRequest {
    pub fn new(
        id: RequestId,
        task_name: impl Into<String>,
        responder: oneshot::Sender<Outcome>,
        progress: Option<ProgressSink>,
        deadline: Option<Instant>,
    ) -> Self {
        Self {
            id,
            task_name: task_name.into(),
            responder,
            progress,
            deadline,
            created_at: Instant::now(),
            dispatched: false,
            watchdog: None,
        }
    }

    /// Attaches the watchdog task that enforces the deadline.
    pub fn with_watchdog(mut self, watchdog: AbortHandle) -> Self {
        self.watchdog = Some(watchdog);
        self
    }

    /// Delivers the outcome and stops the watchdog.
    ///
    /// Consumes the request, so a request can be settled at most once.
    /// Returns the time since the request was created.
    pub fn settle(self, outcome: Outcome) -> Duration {
        if let Some(watchdog) = self.watchdog {
            watchdog.abort();
        }
        // The caller may have dropped its handle; nothing to deliver then.
        let _ = self.responder.send(outcome);
        self.created_at.elapsed()
    }
}

impl fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRequest")
            .field("id", &self.id)
            .field("task_name", &self.task_name)
            .field("dispatched", &self.dispatched)
            .field("deadline", &self.deadline)
            .field("has_progress", &self.progress.is_some())
            .finish()
    }
}

/// Table of outstanding requests keyed by correlation id.
#[derive(Debug, Default)]
pub(crate) struct PendingTable {
    entries: HashMap<RequestId, PendingRequest>,
    in_flight: usize,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a request.
    ///
    /// At most one request may exist per id; a duplicate is handed back.
    pub fn insert(&mut self, request: PendingRequest) -> Result<(), PendingRequest> {
        if self.entries.contains_key(&request.id) {
            return Err(request);
        }
        if request.dispatched {
            self.in_flight += 1;
        }
        self.entries.insert(request.id, request);
        Ok(())
    }

    /// Removes a request, releasing its concurrency slot if it held one.
    pub fn take(&mut self, id: RequestId) -> Option<PendingRequest> {
        let request = self.entries.remove(&id)?;
        if request.dispatched {
            self.in_flight -= 1;
        }
        Some(request)
    }

    /// Marks a request as transmitted.
    ///
    /// Returns false if the request is no longer pending.
    pub fn mark_dispatched(&mut self, id: RequestId) -> bool {
        match self.entries.get_mut(&id) {
            Some(request) if !request.dispatched => {
                request.dispatched = true;
                self.in_flight += 1;
                true
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Looks up the progress sink of a live request.
    ///
    /// `None` means the id is not pending; `Some(None)` means it is pending
    /// without a sink.
    pub fn progress_sink(&self, id: RequestId) -> Option<Option<ProgressSink>> {
        self.entries.get(&id).map(|request| request.progress.clone())
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Number of requests transmitted and awaiting a terminal response.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Removes every request.
    pub fn drain(&mut self) -> Vec<PendingRequest> {
        self.in_flight = 0;
        self.entries.drain().map(|(_, request)| request).collect()
    }
}
