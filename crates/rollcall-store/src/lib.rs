//! rollcall-store: Durable enrollment store and attendance ledger.
//!
//! The pipeline talks to storage through the [`EnrollmentStore`],
//! [`AttendanceLedger`] and [`TaskJournal`] contracts; [`SqliteStore`]
//! implements all three on a single serialized SQLite connection.

mod error;
mod schema;
mod sqlite;

pub use error::StoreError;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use rollcall_core::{
    AttendanceRecord, Embedding, GalleryEntry, PersonId, PersonSummary, ResetScope,
};
use uuid::Uuid;

/// Person enrollment: append-only apart from bulk reset.
#[async_trait]
pub trait EnrollmentStore: Send + Sync {
    /// Enroll `embedding` under `roll_number`, creating the person on first
    /// sight. An existing person keeps its name and department; only the
    /// embedding is appended.
    async fn enroll(
        &self,
        roll_number: &str,
        name: &str,
        department: &str,
        embedding: &Embedding,
    ) -> Result<PersonSummary, StoreError>;

    /// All persons ordered by roll number.
    async fn persons(&self) -> Result<Vec<PersonSummary>, StoreError>;

    /// Every enrolled embedding, ordered by person id.
    async fn gallery(&self) -> Result<Vec<GalleryEntry>, StoreError>;

    /// Dimensionality shared by all stored embeddings, `None` when empty.
    async fn dimension(&self) -> Result<Option<usize>, StoreError>;
}

/// Append-only attendance log.
#[async_trait]
pub trait AttendanceLedger: Send + Sync {
    /// Append an event for `person_id`.
    ///
    /// With an idempotency `key`, a second append carrying the same key is
    /// ignored and returns `Ok(None)`. Fails with
    /// [`StoreError::PersonNotFound`] if the person does not exist.
    async fn append(
        &self,
        person_id: PersonId,
        key: Option<Uuid>,
    ) -> Result<Option<AttendanceRecord>, StoreError>;

    /// Most recent events first.
    async fn recent(&self, limit: usize) -> Result<Vec<AttendanceRecord>, StoreError>;
}

/// How a journaled frame body is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameEncoding {
    Binary,
    /// UTF-8 base64 text, possibly a data URI.
    Base64,
}

impl FrameEncoding {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            FrameEncoding::Binary => "binary",
            FrameEncoding::Base64 => "base64",
        }
    }

    pub(crate) fn parse(s: &str) -> Option<Self> {
        match s {
            "binary" => Some(FrameEncoding::Binary),
            "base64" => Some(FrameEncoding::Base64),
            _ => None,
        }
    }
}

/// A submitted task that has not settled yet.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingTask {
    pub id: Uuid,
    pub encoding: FrameEncoding,
    pub body: Vec<u8>,
    /// Attempts started so far, including ones cut short by a crash.
    pub attempts: u32,
}

/// Durable record of unsettled tasks, replayed after a restart.
///
/// A row exists from submission until the task reaches a terminal state.
#[async_trait]
pub trait TaskJournal: Send + Sync {
    async fn record(&self, task: &PendingTask) -> Result<(), StoreError>;

    /// Note that attempt number `attempt` has started. Unknown ids are ignored.
    async fn record_attempt(&self, id: Uuid, attempt: u32) -> Result<(), StoreError>;

    /// Forget a task that reached a terminal state. Unknown ids are ignored.
    async fn settle(&self, id: Uuid) -> Result<(), StoreError>;

    /// Every unsettled task in submission order.
    async fn unsettled(&self) -> Result<Vec<PendingTask>, StoreError>;
}

/// Row counts removed by a bulk reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResetCounts {
    pub persons: usize,
    pub attendance: usize,
}

/// All contracts plus bulk reset, which spans enrollment and the ledger.
#[async_trait]
pub trait Store: EnrollmentStore + AttendanceLedger + TaskJournal {
    /// Clear the tables named by `scope` atomically. The task journal is left
    /// alone.
    async fn reset(&self, scope: ResetScope) -> Result<ResetCounts, StoreError>;
}
