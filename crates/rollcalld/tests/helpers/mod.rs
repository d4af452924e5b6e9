//! Shared fixtures for daemon integration tests.
#![allow(dead_code)]

use rollcall_core::{
    Descriptor, DescriptorExtractor, Embedding, ExtractError, LinearMatcher, MatchPolicy,
};
use rollcall_store::{SqliteStore, Store};
use rollcalld::{
    ObserverRegistry, Recognizer, RetryPolicy, TaskId, TaskQueue, TaskState, WorkerPool,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;

/// Deterministic stand-in for a face model.
///
/// Frames are UTF-8 scripts:
/// - `face:0.1,0.2,...` yields that embedding
/// - `down` reports the backend as unavailable
/// - `panic-once:<values>` panics the first time, then behaves like `face:`
/// - anything else, including non-UTF-8 bytes, has no face
#[derive(Clone, Default)]
pub struct ScriptedExtractor {
    panicked: Arc<AtomicBool>,
}

fn parse_values(csv: &str) -> Embedding {
    Embedding::new(
        csv.split(',')
            .map(|v| v.trim().parse::<f32>().expect("scripted value"))
            .collect(),
    )
}

impl DescriptorExtractor for ScriptedExtractor {
    fn extract(&mut self, image: &[u8]) -> Result<Descriptor, ExtractError> {
        let script = std::str::from_utf8(image).unwrap_or("");
        if let Some(values) = script.strip_prefix("face:") {
            return Ok(Descriptor::Face(parse_values(values)));
        }
        if let Some(values) = script.strip_prefix("panic-once:") {
            if !self.panicked.swap(true, Ordering::SeqCst) {
                panic!("scripted extractor crash");
            }
            return Ok(Descriptor::Face(parse_values(values)));
        }
        if script == "down" {
            return Err(ExtractError::Unavailable("scripted outage".into()));
        }
        Ok(Descriptor::NoFace)
    }
}

pub struct Harness {
    pub queue: TaskQueue,
    pub store: SqliteStore,
    pub dyn_store: Arc<dyn Store>,
    pub registry: Arc<ObserverRegistry>,
    pub extractor: ScriptedExtractor,
    pool: Option<WorkerPool>,
}

impl Harness {
    pub async fn start(threshold: f32, workers: usize) -> Self {
        let store = SqliteStore::open_in_memory().await.unwrap();
        Self::start_with(store, threshold, workers).await
    }

    /// Start workers over an existing store, as a restarted daemon would.
    pub async fn start_with(store: SqliteStore, threshold: f32, workers: usize) -> Self {
        let dyn_store: Arc<dyn Store> = Arc::new(store.clone());
        let registry = Arc::new(ObserverRegistry::new(64));
        let recognizer = Arc::new(Recognizer::new(
            Arc::clone(&dyn_store),
            Arc::new(LinearMatcher),
            MatchPolicy::new(threshold).unwrap(),
            Arc::clone(&registry),
            Handle::current(),
        ));

        let extractor = ScriptedExtractor::default();
        let factory = extractor.clone();
        let (queue, jobs) = TaskQueue::new(Arc::new(store.clone()));
        let pool = WorkerPool::spawn(
            workers,
            jobs,
            queue.table().clone(),
            recognizer,
            RetryPolicy {
                max_attempts: 3,
                backoff: Duration::from_millis(1),
            },
            move |_| Ok(factory.clone()),
        )
        .unwrap();

        Self {
            queue,
            store,
            dyn_store,
            registry,
            extractor,
            pool: Some(pool),
        }
    }

    /// Poll until `id` settles, panicking after five seconds.
    pub async fn wait(&self, id: TaskId) -> TaskState {
        for _ in 0..500 {
            match self.queue.poll(&id) {
                Some(state) if state.is_terminal() => return state,
                Some(_) => tokio::time::sleep(Duration::from_millis(10)).await,
                None => panic!("task {id} vanished"),
            }
        }
        panic!("task {id} did not settle");
    }

    pub async fn shutdown(mut self) {
        self.queue.close();
        if let Some(pool) = self.pool.take() {
            tokio::task::spawn_blocking(move || pool.join())
                .await
                .unwrap();
        }
    }
}

pub fn frame(script: &str) -> Vec<u8> {
    script.as_bytes().to_vec()
}
