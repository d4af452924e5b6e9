use crate::error::StoreError;
use crate::schema::SCHEMA;
use crate::{
    AttendanceLedger, EnrollmentStore, FrameEncoding, PendingTask, ResetCounts, Store, TaskJournal,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rollcall_core::{
    AttendanceRecord, Embedding, GalleryEntry, PersonId, PersonSummary, ResetScope,
};
use rusqlite::{params, OptionalExtension};
use std::path::Path;
use tokio_rusqlite::Connection;
use uuid::Uuid;

/// SQLite-backed store.
///
/// Every operation runs as one closure on the connection's dedicated thread,
/// so the connection is acquired and released per call on every exit path and
/// writes from concurrent workers are serialized.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path).await?;
        let store = Self { conn };
        store.migrate().await?;
        tracing::info!(path = %path.display(), "store opened");
        Ok(store)
    }

    /// Private in-memory database, used by tests and ephemeral deployments.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await?;
        let store = Self { conn };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        self.conn
            .call(|conn| {
                let mode: String =
                    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
                conn.execute_batch(SCHEMA)?;
                tracing::debug!(journal_mode = %mode, "schema ready");
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Close the underlying connection, flushing pending work.
    pub async fn close(self) -> Result<(), StoreError> {
        self.conn.close().await?;
        Ok(())
    }
}

/// Raw embedding row; decoded outside the connection thread.
struct EmbeddingRow {
    id: i64,
    person_id: PersonId,
    roll_number: String,
    name: String,
    vector: Vec<u8>,
}

enum Enrolled {
    Ok(PersonSummary),
    Mismatch { expected: usize, actual: usize },
}

enum Appended {
    Written(AttendanceRecord),
    Duplicate,
    MissingPerson,
}

/// SQLite integers are signed; counts and dimensions never are.
fn count(value: i64) -> usize {
    usize::try_from(value).unwrap_or_default()
}

fn person_summary(conn: &rusqlite::Connection, id: PersonId) -> rusqlite::Result<PersonSummary> {
    conn.query_row(
        "SELECT p.id, p.roll_number, p.name, p.department, p.created_at,
                (SELECT COUNT(*) FROM embeddings e WHERE e.person_id = p.id)
         FROM persons p WHERE p.id = ?1",
        params![id],
        |row| {
            Ok(PersonSummary {
                id: row.get(0)?,
                roll_number: row.get(1)?,
                name: row.get(2)?,
                department: row.get(3)?,
                created_at: row.get(4)?,
                embeddings: count(row.get(5)?),
            })
        },
    )
}

fn attendance_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AttendanceRecord> {
    Ok(AttendanceRecord {
        id: row.get(0)?,
        person_id: row.get(1)?,
        student_name: row.get(2)?,
        roll_number: row.get(3)?,
        timestamp: row.get(4)?,
    })
}

#[async_trait]
impl EnrollmentStore for SqliteStore {
    async fn enroll(
        &self,
        roll_number: &str,
        name: &str,
        department: &str,
        embedding: &Embedding,
    ) -> Result<PersonSummary, StoreError> {
        let roll_number = roll_number.to_string();
        let name = name.to_string();
        let department = department.to_string();
        let dim = embedding.dim();
        let blob = embedding.to_le_bytes();

        let enrolled = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;

                let existing: Option<i64> = tx
                    .query_row("SELECT dim FROM embeddings LIMIT 1", [], |row| row.get(0))
                    .optional()?;
                if let Some(expected) = existing {
                    if count(expected) != dim {
                        return Ok(Enrolled::Mismatch {
                            expected: count(expected),
                            actual: dim,
                        });
                    }
                }

                let now: DateTime<Utc> = Utc::now();
                tx.execute(
                    "INSERT INTO persons (roll_number, name, department, created_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(roll_number) DO NOTHING",
                    params![roll_number, name, department, now],
                )?;
                let person_id: PersonId = tx.query_row(
                    "SELECT id FROM persons WHERE roll_number = ?1",
                    params![roll_number],
                    |row| row.get(0),
                )?;
                tx.execute(
                    "INSERT INTO embeddings (person_id, dim, vector) VALUES (?1, ?2, ?3)",
                    params![person_id, dim as i64, blob],
                )?;

                let summary = person_summary(&tx, person_id)?;
                tx.commit()?;
                Ok(Enrolled::Ok(summary))
            })
            .await?;

        match enrolled {
            Enrolled::Ok(summary) => {
                tracing::info!(
                    person = summary.id,
                    roll_number = %summary.roll_number,
                    embeddings = summary.embeddings,
                    "person enrolled"
                );
                Ok(summary)
            }
            Enrolled::Mismatch { expected, actual } => {
                Err(StoreError::DimensionMismatch { expected, actual })
            }
        }
    }

    async fn persons(&self) -> Result<Vec<PersonSummary>, StoreError> {
        let persons = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT p.id, p.roll_number, p.name, p.department, p.created_at, COUNT(e.id)
                     FROM persons p LEFT JOIN embeddings e ON e.person_id = p.id
                     GROUP BY p.id
                     ORDER BY p.roll_number",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok(PersonSummary {
                            id: row.get(0)?,
                            roll_number: row.get(1)?,
                            name: row.get(2)?,
                            department: row.get(3)?,
                            created_at: row.get(4)?,
                            embeddings: count(row.get(5)?),
                        })
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        Ok(persons)
    }

    async fn gallery(&self) -> Result<Vec<GalleryEntry>, StoreError> {
        let rows = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT e.id, p.id, p.roll_number, p.name, e.vector
                     FROM embeddings e JOIN persons p ON p.id = e.person_id
                     ORDER BY p.id, e.id",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok(EmbeddingRow {
                            id: row.get(0)?,
                            person_id: row.get(1)?,
                            roll_number: row.get(2)?,
                            name: row.get(3)?,
                            vector: row.get(4)?,
                        })
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;

        rows.into_iter()
            .map(|row| {
                let embedding = Embedding::from_le_bytes(&row.vector)
                    .ok_or(StoreError::CorruptEmbedding(row.id))?;
                Ok(GalleryEntry {
                    person_id: row.person_id,
                    roll_number: row.roll_number,
                    name: row.name,
                    embedding,
                })
            })
            .collect()
    }

    async fn dimension(&self) -> Result<Option<usize>, StoreError> {
        let dim = self
            .conn
            .call(|conn| {
                let dim: Option<i64> = conn
                    .query_row("SELECT dim FROM embeddings LIMIT 1", [], |row| row.get(0))
                    .optional()?;
                Ok(dim)
            })
            .await?;
        Ok(dim.map(count))
    }
}

#[async_trait]
impl AttendanceLedger for SqliteStore {
    async fn append(
        &self,
        person_id: PersonId,
        key: Option<Uuid>,
    ) -> Result<Option<AttendanceRecord>, StoreError> {
        let key = key.map(|k| k.to_string());

        let appended = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let exists: bool = tx.query_row(
                    "SELECT EXISTS(SELECT 1 FROM persons WHERE id = ?1)",
                    params![person_id],
                    |row| row.get(0),
                )?;
                if !exists {
                    return Ok(Appended::MissingPerson);
                }

                let now: DateTime<Utc> = Utc::now();
                let inserted = tx.execute(
                    "INSERT OR IGNORE INTO attendance (person_id, task_id, recorded_at)
                     VALUES (?1, ?2, ?3)",
                    params![person_id, key, now],
                )?;
                if inserted == 0 {
                    return Ok(Appended::Duplicate);
                }

                let id = tx.last_insert_rowid();
                let record = tx.query_row(
                    "SELECT a.id, a.person_id, p.name, p.roll_number, a.recorded_at
                     FROM attendance a JOIN persons p ON p.id = a.person_id
                     WHERE a.id = ?1",
                    params![id],
                    attendance_row,
                )?;
                tx.commit()?;
                Ok(Appended::Written(record))
            })
            .await?;

        match appended {
            Appended::Written(record) => {
                tracing::debug!(event = record.id, person = person_id, "attendance appended");
                Ok(Some(record))
            }
            Appended::Duplicate => {
                tracing::debug!(person = person_id, "duplicate attendance write ignored");
                Ok(None)
            }
            Appended::MissingPerson => Err(StoreError::PersonNotFound(person_id)),
        }
    }

    async fn recent(&self, limit: usize) -> Result<Vec<AttendanceRecord>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let records = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT a.id, a.person_id, p.name, p.roll_number, a.recorded_at
                     FROM attendance a JOIN persons p ON p.id = a.person_id
                     ORDER BY a.recorded_at DESC, a.id DESC
                     LIMIT ?1",
                )?;
                let rows = stmt
                    .query_map(params![limit], attendance_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        Ok(records)
    }
}

/// Raw journal row; validated outside the connection thread.
struct TaskRow {
    id: String,
    encoding: String,
    body: Vec<u8>,
    attempts: i64,
}

#[async_trait]
impl TaskJournal for SqliteStore {
    async fn record(&self, task: &PendingTask) -> Result<(), StoreError> {
        let key = task.id.to_string();
        let encoding = task.encoding.as_str();
        let body = task.body.clone();
        let attempts = i64::from(task.attempts);
        self.conn
            .call(move |conn| {
                let now: DateTime<Utc> = Utc::now();
                conn.execute(
                    "INSERT OR IGNORE INTO tasks (id, encoding, body, attempts, submitted_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![key, encoding, body, attempts, now],
                )?;
                Ok(())
            })
            .await?;
        tracing::debug!(task = %task.id, bytes = task.body.len(), "task journaled");
        Ok(())
    }

    async fn record_attempt(&self, id: Uuid, attempt: u32) -> Result<(), StoreError> {
        let key = id.to_string();
        let attempt = i64::from(attempt);
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE tasks SET attempts = MAX(attempts, ?2) WHERE id = ?1",
                    params![key, attempt],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn settle(&self, id: Uuid) -> Result<(), StoreError> {
        let key = id.to_string();
        self.conn
            .call(move |conn| {
                conn.execute("DELETE FROM tasks WHERE id = ?1", params![key])?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn unsettled(&self) -> Result<Vec<PendingTask>, StoreError> {
        let rows = self
            .conn
            .call(|conn| {
                let mut stmt =
                    conn.prepare("SELECT id, encoding, body, attempts FROM tasks ORDER BY seq")?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok(TaskRow {
                            id: row.get(0)?,
                            encoding: row.get(1)?,
                            body: row.get(2)?,
                            attempts: row.get(3)?,
                        })
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;

        let tasks = rows
            .into_iter()
            .filter_map(|row| {
                let id = Uuid::parse_str(&row.id).ok();
                let encoding = FrameEncoding::parse(&row.encoding);
                match (id, encoding) {
                    (Some(id), Some(encoding)) => Some(PendingTask {
                        id,
                        encoding,
                        body: row.body,
                        attempts: u32::try_from(row.attempts).unwrap_or_default(),
                    }),
                    _ => {
                        tracing::warn!(task = %row.id, encoding = %row.encoding, "skipping corrupt journal row");
                        None
                    }
                }
            })
            .collect();
        Ok(tasks)
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn reset(&self, scope: ResetScope) -> Result<ResetCounts, StoreError> {
        let counts = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let attendance = tx.execute("DELETE FROM attendance", [])?;
                let persons = if scope.clears_persons() {
                    tx.execute("DELETE FROM embeddings", [])?;
                    tx.execute("DELETE FROM persons", [])?
                } else {
                    0
                };
                tx.commit()?;
                Ok(ResetCounts {
                    persons,
                    attendance,
                })
            })
            .await?;

        tracing::info!(
            %scope,
            persons = counts.persons,
            attendance = counts.attendance,
            "store reset"
        );
        Ok(counts)
    }
}
