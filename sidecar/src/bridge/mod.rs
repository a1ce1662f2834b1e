//! Task-dispatch bridge.
//!
//! Moves inference work to a remote execution context (a worker task or
//! process) and correlates its asynchronous responses back to callers.
//!
//! # Components
//!
//! - [`TaskBridge`]: request correlation, FIFO dispatch under a concurrency
//!   gate, per-request deadlines, cancellation and disposal
//! - [`protocol`]: the JSON wire messages exchanged with the worker
//! - [`WorkerSpawner`]: opens the worker channel; [`InProcessWorker`] runs a
//!   [`TaskHandler`] on the local runtime, [`LoopbackSpawner`] hands the
//!   worker side to the caller
//! - [`RetryPolicy`]: bounded retry for timeouts and remote failures
//!
//! # Example
//!
//! ```ignore
//! let bridge = TaskBridge::new(
//!     BridgeConfig::default().with_max_concurrent(2),
//!     Arc::new(InProcessWorker::new(MyHandler)),
//! );
//!
//! let summary = bridge
//!     .execute(
//!         Task::summarize(article),
//!         ExecuteOptions::new()
//!             .with_timeout(Duration::from_secs(30))
//!             .with_progress(|event| println!("{:.0}% {}", event.progress, event.status)),
//!     )
//!     .await?;
//! ```

mod channel;
mod config;
mod error;
mod metrics;
mod pending;
mod policy;
pub mod protocol;
mod queue;
mod task;
mod task_bridge;
mod worker;

pub use channel::{
    worker_channel, Frame, LoopbackSpawner, WorkerEndpoint, WorkerLink, WorkerResponder,
    WorkerSpawner,
};
pub use config::{
    BridgeConfig, DEFAULT_INIT_TIMEOUT_SECS, DEFAULT_MAX_CONCURRENT, DEFAULT_TIMEOUT_SECS,
};
pub use error::BridgeError;
pub use metrics::BridgeStats;
pub use pending::ProgressSink;
pub use policy::RetryPolicy;
pub use protocol::{
    InboundMessage, MessageKind, OutboundMessage, ProgressEvent, RequestId, TaskResponse,
};
pub use task::{
    Backend, ClassifyInput, EmbedInput, LoadModelInput, SummarizeInput, Task, TaskKind,
    TranscribeInput, TranslateInput,
};
pub use task_bridge::{BridgeState, ExecuteOptions, TaskBridge, TaskHandle};
pub use worker::{InProcessWorker, ProgressReporter, TaskHandler, ABORTED_MESSAGE};
