use crate::broadcast::ObserverRegistry;
use crate::queue::{Job, TaskId, TaskState, TaskTable};
use rollcall_core::{
    BroadcastEvent, Descriptor, DescriptorExtractor, ExtractError, MatchDecision, MatchPolicy,
    Matcher, RecognitionOutcome,
};
use rollcall_store::{Store, StoreError};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;

#[derive(Error, Debug)]
pub enum TaskError {
    #[error("frame payload is not valid base64: {0}")]
    Payload(#[from] base64::DecodeError),
    #[error("descriptor extraction failed: {0}")]
    Extract(#[from] ExtractError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("probe has {actual} dimensions, enrolled embeddings have {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("worker panicked while processing frame")]
    WorkerPanicked,
    #[error("gave up after {attempts} attempts interrupted by restarts")]
    Interrupted { attempts: u32 },
}

impl TaskError {
    /// Infrastructure faults may succeed on another attempt; payload faults never will.
    pub fn is_retryable(&self) -> bool {
        match self {
            TaskError::Extract(e) => e.is_retryable(),
            TaskError::Store(e) => e.is_retryable(),
            TaskError::WorkerPanicked | TaskError::Interrupted { .. } => true,
            TaskError::Payload(_) | TaskError::DimensionMismatch { .. } => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("failed to create extractor for worker {index}: {source}")]
    Extractor { index: usize, source: ExtractError },
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// How often, and how patiently, a retry-eligible failure is re-attempted.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

/// The recognition task body shared by all workers.
///
/// Steps run strictly in order: extract, match, append to the ledger on
/// acceptance, broadcast the new ledger entry.
pub struct Recognizer {
    store: Arc<dyn Store>,
    matcher: Arc<dyn Matcher>,
    policy: MatchPolicy,
    registry: Arc<ObserverRegistry>,
    runtime: Handle,
}

impl Recognizer {
    pub fn new(
        store: Arc<dyn Store>,
        matcher: Arc<dyn Matcher>,
        policy: MatchPolicy,
        registry: Arc<ObserverRegistry>,
        runtime: Handle,
    ) -> Self {
        Self {
            store,
            matcher,
            policy,
            registry,
            runtime,
        }
    }

    /// Run one attempt. Safe to re-run for the same task: the ledger write is
    /// keyed by `task`, so a retry never records attendance twice.
    ///
    /// Must be called off the async runtime (it blocks on store calls).
    pub fn recognize(
        &self,
        extractor: &mut dyn DescriptorExtractor,
        task: TaskId,
        frame: &[u8],
    ) -> Result<RecognitionOutcome, TaskError> {
        let probe = match extractor.extract(frame)? {
            Descriptor::Face(embedding) => embedding,
            Descriptor::NoFace => return Ok(RecognitionOutcome::NoFace),
        };

        let gallery = self.runtime.block_on(self.store.gallery())?;
        if let Some(first) = gallery.first() {
            if first.embedding.dim() != probe.dim() {
                return Err(TaskError::DimensionMismatch {
                    expected: first.embedding.dim(),
                    actual: probe.dim(),
                });
            }
        }

        let nearest = match self.policy.decide(self.matcher.find_nearest(&probe, &gallery)) {
            MatchDecision::Accepted(nearest) => nearest,
            MatchDecision::Rejected { distance } => {
                tracing::debug!(task = %task, ?distance, gallery = gallery.len(), "no match");
                return Ok(RecognitionOutcome::Unknown { distance });
            }
        };

        match self
            .runtime
            .block_on(self.store.append(nearest.person_id, Some(task)))
        {
            Ok(Some(record)) => {
                self.registry
                    .broadcast(&BroadcastEvent::AttendanceMarked(record));
            }
            Ok(None) => {
                tracing::debug!(task = %task, person = nearest.person_id, "attendance already recorded");
            }
            Err(StoreError::PersonNotFound(id)) => {
                // Person removed by a reset between match and write.
                tracing::warn!(task = %task, person = id, "matched person vanished before ledger write");
            }
            Err(err) => return Err(err.into()),
        }

        tracing::info!(
            task = %task,
            person = nearest.person_id,
            distance = nearest.distance,
            "frame matched"
        );
        Ok(RecognitionOutcome::Matched {
            person_id: nearest.person_id,
            name: nearest.name,
            roll_number: nearest.roll_number,
            distance: nearest.distance,
        })
    }
}

impl Recognizer {
    /// Journal that `attempt` has started so a restart counts it. A failed
    /// write only loses the count.
    fn note_attempt(&self, task: TaskId, attempt: u32) {
        if let Err(err) = self.runtime.block_on(self.store.record_attempt(task, attempt)) {
            tracing::warn!(task = %task, attempt, error = %err, "cannot journal attempt");
        }
    }

    /// Drop a settled task from the journal. A failed write means the task is
    /// replayed after a restart; the keyed ledger write keeps that harmless.
    fn settle(&self, task: TaskId) {
        if let Err(err) = self.runtime.block_on(self.store.settle(task)) {
            tracing::warn!(task = %task, error = %err, "cannot settle journaled task");
        }
    }
}

/// Running worker threads.
pub struct WorkerPool {
    threads: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `count` worker threads draining `jobs`.
    ///
    /// Extractors are built up front, one per worker, so a backend that
    /// cannot be initialised fails startup instead of every task.
    pub fn spawn<E, F>(
        count: usize,
        jobs: async_channel::Receiver<Job>,
        table: TaskTable,
        recognizer: Arc<Recognizer>,
        retry: RetryPolicy,
        make_extractor: F,
    ) -> Result<Self, WorkerError>
    where
        E: DescriptorExtractor + 'static,
        F: Fn(usize) -> Result<E, ExtractError>,
    {
        let extractors = (0..count)
            .map(|index| {
                make_extractor(index).map_err(|source| WorkerError::Extractor { index, source })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut threads = Vec::with_capacity(count);
        for (index, mut extractor) in extractors.into_iter().enumerate() {
            let jobs = jobs.clone();
            let table = table.clone();
            let recognizer = Arc::clone(&recognizer);
            let handle = std::thread::Builder::new()
                .name(format!("rollcall-worker-{index}"))
                .spawn(move || {
                    tracing::info!(worker = index, "worker started");
                    while let Ok(job) = jobs.recv_blocking() {
                        run_job(job, &mut extractor, &recognizer, &table, retry);
                    }
                    tracing::info!(worker = index, "worker exiting");
                })?;
            threads.push(handle);
        }

        tracing::info!(
            workers = count,
            max_attempts = retry.max_attempts,
            "worker pool started"
        );
        Ok(Self { threads })
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    /// Wait for every worker to drain the closed queue and exit.
    pub fn join(self) {
        for handle in self.threads {
            if handle.join().is_err() {
                tracing::error!("worker thread panicked outside a task");
            }
        }
        tracing::info!("worker pool stopped");
    }
}

/// Drive one job to a terminal state, re-running retry-eligible failures
/// (including panics) up to `retry.max_attempts`. Attempts started by a
/// previous run count against the limit.
fn run_job(
    job: Job,
    extractor: &mut dyn DescriptorExtractor,
    recognizer: &Recognizer,
    table: &TaskTable,
    retry: RetryPolicy,
) {
    let id = job.id;
    let fail = |err: TaskError| {
        table.transition(
            &id,
            TaskState::Failed {
                error: err.to_string(),
                retryable: err.is_retryable(),
            },
        );
        recognizer.settle(id);
    };

    let frame = match job.payload.into_bytes() {
        Ok(frame) => frame,
        Err(err) => {
            let err = TaskError::from(err);
            tracing::warn!(task = %id, error = %err, "rejecting undecodable payload");
            fail(err);
            return;
        }
    };

    let mut attempt = job.attempts;
    if attempt >= retry.max_attempts {
        let err = TaskError::Interrupted { attempts: attempt };
        tracing::error!(task = %id, attempts = attempt, "abandoning resumed task");
        fail(err);
        return;
    }

    loop {
        attempt += 1;
        table.transition(&id, TaskState::Running { attempt });
        recognizer.note_attempt(id, attempt);

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            recognizer.recognize(&mut *extractor, id, &frame)
        }))
        .unwrap_or(Err(TaskError::WorkerPanicked));

        match result {
            Ok(outcome) => {
                table.transition(&id, TaskState::Succeeded { result: outcome });
                recognizer.settle(id);
                return;
            }
            Err(err) if err.is_retryable() && attempt < retry.max_attempts => {
                tracing::warn!(task = %id, attempt, error = %err, "attempt failed; retrying");
                std::thread::sleep(retry.backoff * attempt);
            }
            Err(err) => {
                tracing::error!(task = %id, attempt, error = %err, "task failed");
                fail(err);
                return;
            }
        }
    }
}
