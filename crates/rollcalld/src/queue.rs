//! Recognition task queue.
//!
//! `submit` journals the task, records it and hands it to the worker channel,
//! so it returns without waiting on recognition. Task state lives in a shared
//! [`TaskTable`] that workers advance and callers poll. The journal outlives
//! the process: [`TaskQueue::resume`] re-enqueues whatever a previous run left
//! unsettled.

use base64::{engine::general_purpose, Engine};
use rollcall_core::RecognitionOutcome;
use rollcall_store::{FrameEncoding, PendingTask, StoreError, TaskJournal};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

/// Opaque handle returned by [`TaskQueue::submit`].
pub type TaskId = Uuid;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("task queue is closed")]
    Closed,
    #[error("cannot journal task: {0}")]
    Journal(#[from] StoreError),
}

/// Lifecycle of a recognition task.
///
/// Transitions only move forward: `Queued → Running{1} → Running{2}… →
/// Succeeded | Failed`. Terminal states never change.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Running { attempt: u32 },
    Succeeded { result: RecognitionOutcome },
    Failed { error: String, retryable: bool },
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Succeeded { .. } | TaskState::Failed { .. })
    }

    fn rank(&self) -> (u8, u32) {
        match self {
            TaskState::Queued => (0, 0),
            TaskState::Running { attempt } => (1, *attempt),
            TaskState::Succeeded { .. } | TaskState::Failed { .. } => (2, 0),
        }
    }
}

/// Frame bytes as submitted: raw binary or base64 text.
#[derive(Debug, Clone)]
pub enum FramePayload {
    Binary(Vec<u8>),
    /// Plain base64 or a `data:image/...;base64,` URI.
    Base64(String),
}

impl FramePayload {
    pub fn len(&self) -> usize {
        match self {
            FramePayload::Binary(b) => b.len(),
            FramePayload::Base64(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Encoding and body as stored in the task journal.
    pub fn to_journal(&self) -> (FrameEncoding, Vec<u8>) {
        match self {
            FramePayload::Binary(b) => (FrameEncoding::Binary, b.clone()),
            FramePayload::Base64(s) => (FrameEncoding::Base64, s.as_bytes().to_vec()),
        }
    }

    pub fn from_journal(encoding: FrameEncoding, body: Vec<u8>) -> Self {
        match encoding {
            FrameEncoding::Binary => FramePayload::Binary(body),
            FrameEncoding::Base64 => {
                FramePayload::Base64(String::from_utf8_lossy(&body).into_owned())
            }
        }
    }

    /// Resolve to raw image bytes, decoding base64 text if needed.
    pub fn into_bytes(self) -> Result<Vec<u8>, base64::DecodeError> {
        match self {
            FramePayload::Binary(bytes) => Ok(bytes),
            FramePayload::Base64(text) => {
                let encoded = match text.split_once(',') {
                    Some((header, rest)) if header.starts_with("data:") => rest,
                    _ => text.as_str(),
                };
                general_purpose::STANDARD.decode(encoded.trim())
            }
        }
    }
}

/// Unit of work handed to the worker pool.
#[derive(Debug)]
pub struct Job {
    pub id: TaskId,
    pub payload: FramePayload,
    /// Attempts already started by a previous run.
    pub attempts: u32,
}

struct Entry {
    state: TaskState,
    updated: Instant,
}

/// Shared, thread-safe task state.
#[derive(Clone, Default)]
pub struct TaskTable {
    inner: Arc<RwLock<HashMap<TaskId, Entry>>>,
}

impl TaskTable {
    pub fn get(&self, id: &TaskId) -> Option<TaskState> {
        let map = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        map.get(id).map(|e| e.state.clone())
    }

    fn insert_queued(&self, id: TaskId) {
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        map.insert(
            id,
            Entry {
                state: TaskState::Queued,
                updated: Instant::now(),
            },
        );
    }

    fn remove(&self, id: &TaskId) {
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        map.remove(id);
    }

    /// Advance `id` to `next`. Returns false, leaving the task untouched, if
    /// the task is unknown or `next` would not move it forward.
    pub fn transition(&self, id: &TaskId, next: TaskState) -> bool {
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let Some(entry) = map.get_mut(id) else {
            tracing::warn!(task = %id, "transition for unknown task");
            return false;
        };
        if entry.state.is_terminal() || next.rank() <= entry.state.rank() {
            tracing::warn!(task = %id, from = ?entry.state, to = ?next, "rejected backward transition");
            return false;
        }
        tracing::debug!(task = %id, from = ?entry.state, to = ?next, "task transition");
        entry.state = next;
        entry.updated = Instant::now();
        true
    }

    /// Drop terminal tasks that settled more than `ttl` ago.
    pub fn sweep(&self, ttl: Duration) -> usize {
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let before = map.len();
        map.retain(|_, e| !(e.state.is_terminal() && e.updated.elapsed() >= ttl));
        before - map.len()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Clone-safe submission handle.
#[derive(Clone)]
pub struct TaskQueue {
    tx: async_channel::Sender<Job>,
    table: TaskTable,
    journal: Arc<dyn TaskJournal>,
}

impl TaskQueue {
    /// Create an unbounded queue backed by `journal`, and the receiver the
    /// worker pool drains.
    pub fn new(journal: Arc<dyn TaskJournal>) -> (Self, async_channel::Receiver<Job>) {
        let (tx, rx) = async_channel::unbounded();
        let queue = Self {
            tx,
            table: TaskTable::default(),
            journal,
        };
        (queue, rx)
    }

    /// Journal a new task and hand it to the workers.
    pub async fn submit(&self, payload: FramePayload) -> Result<TaskId, QueueError> {
        if self.tx.is_closed() {
            return Err(QueueError::Closed);
        }
        let id = Uuid::new_v4();
        let (encoding, body) = payload.to_journal();
        self.journal
            .record(&PendingTask {
                id,
                encoding,
                body,
                attempts: 0,
            })
            .await?;

        let bytes = payload.len();
        if let Err(err) = self.enqueue(Job {
            id,
            payload,
            attempts: 0,
        }) {
            // Closed between the check and the send; do not replay it later.
            if let Err(settle) = self.journal.settle(id).await {
                tracing::warn!(task = %id, error = %settle, "cannot drop rejected task from journal");
            }
            return Err(err);
        }
        tracing::debug!(task = %id, bytes, "task submitted");
        Ok(id)
    }

    /// Re-enqueue tasks a previous run left unsettled, keeping their ids so
    /// handles issued before the restart poll again.
    pub async fn resume(&self) -> Result<usize, QueueError> {
        let tasks = self.journal.unsettled().await?;
        let count = tasks.len();
        for task in tasks {
            tracing::debug!(task = %task.id, attempts = task.attempts, "resuming task");
            self.enqueue(Job {
                id: task.id,
                payload: FramePayload::from_journal(task.encoding, task.body),
                attempts: task.attempts,
            })?;
        }
        if count > 0 {
            tracing::info!(tasks = count, "resumed unsettled tasks");
        }
        Ok(count)
    }

    fn enqueue(&self, job: Job) -> Result<(), QueueError> {
        let id = job.id;
        self.table.insert_queued(id);
        if self.tx.try_send(job).is_err() {
            self.table.remove(&id);
            return Err(QueueError::Closed);
        }
        Ok(())
    }

    /// Current state of `id`; `None` if unknown or already swept.
    pub fn poll(&self, id: &TaskId) -> Option<TaskState> {
        self.table.get(id)
    }

    pub fn table(&self) -> &TaskTable {
        &self.table
    }

    /// Tasks submitted but not yet picked up by a worker.
    pub fn pending(&self) -> usize {
        self.tx.len()
    }

    /// Stop accepting tasks. Workers finish what is already queued.
    pub fn close(&self) {
        self.tx.close();
    }
}

/// Periodically evict settled tasks older than `ttl`.
pub fn spawn_sweeper(table: TaskTable, ttl: Duration) -> tokio::task::JoinHandle<()> {
    let period = (ttl / 4).clamp(Duration::from_secs(1), Duration::from_secs(60));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let evicted = table.sweep(ttl);
            if evicted > 0 {
                tracing::debug!(evicted, remaining = table.len(), "swept settled tasks");
            }
        }
    })
}
