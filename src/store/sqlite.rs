//! SQLite-backed durable store.
//!
//! Wraps a single `rusqlite` connection behind a mutex and runs all access
//! on tokio's blocking thread pool via `spawn_blocking`, preventing
//! synchronous SQLite I/O from tying up async worker threads. The
//! compare-and-swap commit runs inside one transaction, so the session head
//! and the appended checkpoint can never diverge, even across a crash.

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

use crate::errors::StoreError;
use crate::session::{Session, SessionId};
use crate::store::{
    Checkpoint, CheckpointId, CheckpointStore, SNAPSHOT_FORMAT_VERSION, SessionStore, fork_session,
};

/// Durable store at a single SQLite database file.
#[derive(Clone)]
pub struct SqliteStore {
    inner: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and run migrations.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)
            .context("Failed to open SQLite database")
            .map_err(StoreError::Database)?;
        Self::from_connection(conn)
    }

    /// In-memory database, for tests.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()
            .context("Failed to open in-memory SQLite database")
            .map_err(StoreError::Database)?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS sessions (
                session_id TEXT PRIMARY KEY,
                head_checkpoint_id TEXT NOT NULL,
                version INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS checkpoints (
                checkpoint_id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                parent_checkpoint_id TEXT,
                version INTEGER NOT NULL,
                format_version INTEGER NOT NULL,
                snapshot TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_checkpoints_session
                ON checkpoints(session_id);
            ",
        )
        .context("Failed to run migrations")
        .map_err(StoreError::Database)?;

        Ok(Self {
            inner: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a closure against the connection on a blocking thread. All data
    /// passed into `f` must be owned (`'static`).
    async fn call<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&Connection) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| StoreError::Database(anyhow!("connection lock poisoned")))?;
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Database(anyhow!("store task panicked: {}", e)))?
    }
}

fn db_err(e: rusqlite::Error) -> StoreError {
    StoreError::Database(e.into())
}

fn serialize_snapshot(session: &Session) -> Result<String, StoreError> {
    serde_json::to_string(session)
        .context("Failed to serialize session snapshot")
        .map_err(StoreError::Database)
}

fn parse_snapshot(session_id: SessionId, version: u64, text: &str) -> Result<Session, StoreError> {
    serde_json::from_str(text).map_err(|e| StoreError::Corruption {
        session_id,
        version,
        detail: e.to_string(),
    })
}

fn parse_uuid(text: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(text).map_err(|e| StoreError::Database(anyhow!("malformed uuid: {}", e)))
}

fn parse_timestamp(text: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Database(anyhow!("malformed timestamp: {}", e)))
}

/// Raw checkpoint row before snapshot parsing.
struct CheckpointRow {
    checkpoint_id: String,
    session_id: String,
    parent_checkpoint_id: Option<String>,
    version: u64,
    snapshot: String,
    created_at: String,
}

impl CheckpointRow {
    fn fetch(conn: &Connection, checkpoint_id: CheckpointId) -> Result<Self, StoreError> {
        conn.query_row(
            "SELECT checkpoint_id, session_id, parent_checkpoint_id, version, snapshot, created_at
             FROM checkpoints WHERE checkpoint_id = ?1",
            params![checkpoint_id.to_string()],
            |row| {
                Ok(CheckpointRow {
                    checkpoint_id: row.get(0)?,
                    session_id: row.get(1)?,
                    parent_checkpoint_id: row.get(2)?,
                    version: row.get::<_, i64>(3)? as u64,
                    snapshot: row.get(4)?,
                    created_at: row.get(5)?,
                })
            },
        )
        .optional()
        .map_err(db_err)?
        .ok_or(StoreError::CheckpointNotFound { checkpoint_id })
    }

    fn into_checkpoint(self) -> Result<Checkpoint, StoreError> {
        let session_id = parse_uuid(&self.session_id)?;
        let snapshot = parse_snapshot(session_id, self.version, &self.snapshot)?;
        Ok(Checkpoint {
            session_id,
            checkpoint_id: parse_uuid(&self.checkpoint_id)?,
            parent_checkpoint_id: self
                .parent_checkpoint_id
                .as_deref()
                .map(parse_uuid)
                .transpose()?,
            snapshot,
            created_at: parse_timestamp(&self.created_at)?,
        })
    }
}

/// Session head row: `(head_checkpoint_id, version)`.
fn fetch_head(
    conn: &Connection,
    session_id: SessionId,
) -> Result<Option<(String, u64)>, StoreError> {
    conn.query_row(
        "SELECT head_checkpoint_id, version FROM sessions WHERE session_id = ?1",
        params![session_id.to_string()],
        |row| Ok((row.get(0)?, row.get::<_, i64>(1)? as u64)),
    )
    .optional()
    .map_err(db_err)
}

fn insert_checkpoint(
    conn: &Connection,
    session_id: SessionId,
    parent: Option<&str>,
    snapshot: &Session,
) -> Result<CheckpointId, StoreError> {
    let checkpoint_id = Uuid::new_v4();
    conn.execute(
        "INSERT INTO checkpoints
            (checkpoint_id, session_id, parent_checkpoint_id, version, format_version, snapshot, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            checkpoint_id.to_string(),
            session_id.to_string(),
            parent,
            snapshot.version as i64,
            SNAPSHOT_FORMAT_VERSION,
            serialize_snapshot(snapshot)?,
            Utc::now().to_rfc3339(),
        ],
    )
    .map_err(db_err)?;
    Ok(checkpoint_id)
}

fn upsert_head(
    conn: &Connection,
    session_id: SessionId,
    head: CheckpointId,
    version: u64,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO sessions (session_id, head_checkpoint_id, version)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(session_id) DO UPDATE
         SET head_checkpoint_id = excluded.head_checkpoint_id,
             version = excluded.version",
        params![session_id.to_string(), head.to_string(), version as i64],
    )
    .map_err(db_err)?;
    Ok(())
}

/// Walk parent links from the head back to the root, oldest-first.
fn walk_history(conn: &Connection, session_id: SessionId) -> Result<Vec<Checkpoint>, StoreError> {
    let head =
        fetch_head(conn, session_id)?.ok_or(StoreError::NotFound { session_id })?;
    let mut chain = Vec::new();
    let mut cursor = Some(parse_uuid(&head.0)?);
    while let Some(id) = cursor {
        let checkpoint = CheckpointRow::fetch(conn, id)?.into_checkpoint()?;
        cursor = checkpoint.parent_checkpoint_id;
        chain.push(checkpoint);
    }
    chain.reverse();
    Ok(chain)
}

#[async_trait]
impl SessionStore for SqliteStore {
    async fn create(&self, session: Session) -> Result<Session, StoreError> {
        self.call(move |conn| {
            let session_id = session.session_id;
            let tx = conn.unchecked_transaction().map_err(db_err)?;
            if fetch_head(&tx, session_id)?.is_some() {
                return Err(StoreError::AlreadyExists { session_id });
            }
            let mut genesis = session;
            genesis.version = 0;
            genesis.updated_at = Utc::now();
            let checkpoint_id = insert_checkpoint(&tx, session_id, None, &genesis)?;
            upsert_head(&tx, session_id, checkpoint_id, 0)?;
            tx.commit().map_err(db_err)?;
            Ok(genesis)
        })
        .await
    }

    async fn load(&self, session_id: SessionId) -> Result<Session, StoreError> {
        self.call(move |conn| {
            let (head_id, version) =
                fetch_head(conn, session_id)?.ok_or(StoreError::NotFound { session_id })?;
            let row = CheckpointRow::fetch(conn, parse_uuid(&head_id)?)?;
            parse_snapshot(session_id, version, &row.snapshot)
        })
        .await
    }

    async fn compare_and_swap(
        &self,
        session_id: SessionId,
        expected_version: u64,
        next: Session,
    ) -> Result<(Session, CheckpointId), StoreError> {
        self.call(move |conn| {
            let tx = conn.unchecked_transaction().map_err(db_err)?;
            let (head_id, actual) =
                fetch_head(&tx, session_id)?.ok_or(StoreError::NotFound { session_id })?;
            if actual != expected_version {
                return Err(StoreError::StaleState {
                    session_id,
                    expected: expected_version,
                    actual,
                });
            }
            let mut committed = next;
            committed.session_id = session_id;
            committed.version = expected_version + 1;
            committed.updated_at = Utc::now();
            let checkpoint_id =
                insert_checkpoint(&tx, session_id, Some(head_id.as_str()), &committed)?;
            upsert_head(&tx, session_id, checkpoint_id, committed.version)?;
            tx.commit().map_err(db_err)?;
            Ok((committed, checkpoint_id))
        })
        .await
    }
}

#[async_trait]
impl CheckpointStore for SqliteStore {
    async fn append(
        &self,
        session_id: SessionId,
        parent_checkpoint_id: Option<CheckpointId>,
        snapshot: Session,
    ) -> Result<CheckpointId, StoreError> {
        self.call(move |conn| {
            let tx = conn.unchecked_transaction().map_err(db_err)?;
            let head_id = fetch_head(&tx, session_id)?.map(|(id, _)| id);
            let parent_str = parent_checkpoint_id.map(|id| id.to_string());
            if parent_str != head_id {
                return Err(StoreError::ParentConflict {
                    session_id,
                    detail: format!(
                        "parent {:?} is not the current head {:?}",
                        parent_str, head_id
                    ),
                });
            }
            let checkpoint_id =
                insert_checkpoint(&tx, session_id, parent_str.as_deref(), &snapshot)?;
            upsert_head(&tx, session_id, checkpoint_id, snapshot.version)?;
            tx.commit().map_err(db_err)?;
            Ok(checkpoint_id)
        })
        .await
    }

    async fn latest(&self, session_id: SessionId) -> Result<Checkpoint, StoreError> {
        self.call(move |conn| {
            let (head_id, _) =
                fetch_head(conn, session_id)?.ok_or(StoreError::NotFound { session_id })?;
            CheckpointRow::fetch(conn, parse_uuid(&head_id)?)?.into_checkpoint()
        })
        .await
    }

    async fn history(&self, session_id: SessionId) -> Result<Vec<Checkpoint>, StoreError> {
        self.call(move |conn| walk_history(conn, session_id)).await
    }

    async fn history_page(
        &self,
        session_id: SessionId,
        after: Option<CheckpointId>,
        limit: usize,
    ) -> Result<Vec<Checkpoint>, StoreError> {
        self.call(move |conn| {
            let chain = walk_history(conn, session_id)?;
            let start = match after {
                Some(after_id) => {
                    chain
                        .iter()
                        .position(|c| c.checkpoint_id == after_id)
                        .ok_or(StoreError::CheckpointNotFound {
                            checkpoint_id: after_id,
                        })?
                        + 1
                }
                None => 0,
            };
            Ok(chain.into_iter().skip(start).take(limit).collect())
        })
        .await
    }

    async fn fork_from(&self, checkpoint_id: CheckpointId) -> Result<Session, StoreError> {
        self.call(move |conn| {
            let tx = conn.unchecked_transaction().map_err(db_err)?;
            let source = CheckpointRow::fetch(&tx, checkpoint_id)?.into_checkpoint()?;
            let forked = fork_session(&source.snapshot);
            let parent = checkpoint_id.to_string();
            let genesis_id =
                insert_checkpoint(&tx, forked.session_id, Some(parent.as_str()), &forked)?;
            upsert_head(&tx, forked.session_id, genesis_id, 0)?;
            tx.commit().map_err(db_err)?;
            Ok(forked)
        })
        .await
    }
}
