//! rollcalld: Attendance recognition daemon.
//!
//! Frames are submitted over HTTP, queued, and recognised by a pool of
//! worker threads; matches are written to the attendance ledger and pushed
//! to WebSocket observers.

pub mod api;
pub mod broadcast;
pub mod config;
pub mod queue;
pub mod remote;
pub mod worker;

pub use api::{cors_layer, router, AppState};
pub use broadcast::ObserverRegistry;
pub use config::Config;
pub use queue::{FramePayload, TaskId, TaskQueue, TaskState};
pub use worker::{Recognizer, RetryPolicy, TaskError, WorkerPool};
