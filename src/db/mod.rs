//! Action Ledger: durable keyed store of interaction records.
//!
//! A single worker thread owns the SQLite connection; callers submit
//! closures over an mpsc channel and await the result through a oneshot,
//! so all mutations are serialized and atomic with respect to each
//! other. Insertion is idempotent on the composite record id.

use std::{
    path::{Path, PathBuf},
    sync::{mpsc, Arc, Mutex},
    thread::{self, JoinHandle},
};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use log::{error, info};
use rusqlite::{params, Connection, Row};
use tokio::sync::oneshot;

mod migrations;

use crate::models::{Interaction, InteractionKind};
use migrations::run_migrations;

type DbTask = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

enum DbCommand {
    Execute(DbTask),
    Shutdown,
}

struct DatabaseInner {
    sender: mpsc::Sender<DbCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for DatabaseInner {
    fn drop(&mut self) {
        let mut guard = match self.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(handle) = guard.take() {
            if let Err(err) = self.sender.send(DbCommand::Shutdown) {
                error!("Failed to send shutdown to DB thread: {err}");
            }
            if let Err(join_err) = handle.join() {
                error!("Failed to join DB thread: {join_err:?}");
            }
        }
    }
}

fn parse_datetime(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| anyhow!("invalid datetime '{value}': {err}"))
}

fn kind_from_str(value: &str) -> Result<InteractionKind> {
    InteractionKind::from_str(value).ok_or_else(|| anyhow!("unknown interaction kind '{value}'"))
}

fn row_to_interaction(row: &Row<'_>) -> Result<Interaction> {
    Ok(Interaction {
        id: row.get::<_, String>(0)?,
        user_handle: row.get::<_, String>(1)?,
        user_name: row.get::<_, String>(2)?,
        kind: kind_from_str(&row.get::<_, String>(3)?)?,
        timestamp: row.get::<_, String>(4)?,
        post_snippet: row.get::<_, String>(5)?,
        status_link: row.get::<_, String>(6)?,
        reciprocated: row.get::<_, i64>(7)? != 0,
        collected_at: parse_datetime(&row.get::<_, String>(8)?)?,
    })
}

const INTERACTION_COLUMNS: &str =
    "id, user_handle, user_name, kind, timestamp, post_snippet, status_link, reciprocated, collected_at";

const SELF_HANDLE_KEY: &str = "self_handle";

#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
    db_path: Arc<PathBuf>,
}

impl Database {
    pub fn new(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database directory {}", parent.display())
            })?;
        }

        let (command_tx, command_rx) = mpsc::channel::<DbCommand>();
        let (ready_tx, ready_rx) = mpsc::channel();
        let path_for_thread = db_path.clone();

        let worker = thread::Builder::new()
            .name("xsl-ledger-db".into())
            .spawn(move || {
                let mut conn = match Connection::open(&path_for_thread) {
                    Ok(connection) => connection,
                    Err(err) => {
                        let _ = ready_tx.send(Err(
                            anyhow::Error::new(err).context("failed to open SQLite database")
                        ));
                        return;
                    }
                };

                if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
                    error!("Failed to enable WAL mode: {err}");
                }
                if let Err(err) = conn.pragma_update(None, "foreign_keys", "ON") {
                    error!("Failed to enable foreign keys: {err}");
                }

                let init_result =
                    run_migrations(&mut conn).context("failed to run database migrations");
                if ready_tx.send(init_result).is_err() {
                    error!("DB initialization receiver dropped before ready signal");
                    return;
                }

                while let Ok(command) = command_rx.recv() {
                    match command {
                        DbCommand::Execute(task) => {
                            task(&mut conn);
                        }
                        DbCommand::Shutdown => break,
                    }
                }

                info!("Ledger database thread shutting down");
            })
            .with_context(|| "failed to spawn database worker thread")?;

        ready_rx
            .recv()
            .context("database worker exited before signaling readiness")??;

        info!("Ledger database initialized at {}", db_path.display());

        Ok(Self {
            inner: Arc::new(DatabaseInner {
                sender: command_tx,
                worker: Mutex::new(Some(worker)),
            }),
            db_path: Arc::new(db_path),
        })
    }

    pub fn path(&self) -> &Path {
        self.db_path.as_path()
    }

    pub async fn execute<F, T>(&self, task: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let sender = self.inner.sender.clone();
        let (reply_tx, reply_rx) = oneshot::channel();

        let command = DbCommand::Execute(Box::new(move |conn| {
            let result = task(conn);
            if reply_tx.send(result).is_err() {
                error!("DB caller dropped before receiving result");
            }
        }));

        sender
            .send(command)
            .map_err(|err| anyhow!("failed to send command to DB thread: {err}"))?;

        reply_rx
            .await
            .map_err(|_| anyhow!("database thread terminated unexpectedly"))?
    }

    /// Idempotent insert keyed on the composite record id. Returns `true`
    /// only when a new row was actually stored; a duplicate is a no-op,
    /// not an error.
    pub async fn insert_interaction(&self, record: &Interaction) -> Result<bool> {
        let record = record.clone();
        self.execute(move |conn| {
            let inserted = conn
                .execute(
                    "INSERT OR IGNORE INTO interactions
                     (id, user_handle, user_name, kind, timestamp, post_snippet, status_link, reciprocated, collected_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        record.id,
                        record.user_handle,
                        record.user_name,
                        record.kind.as_str(),
                        record.timestamp,
                        record.post_snippet,
                        record.status_link,
                        record.reciprocated as i64,
                        record.collected_at.to_rfc3339(),
                    ],
                )
                .with_context(|| "failed to insert interaction")?;
            Ok(inserted > 0)
        })
        .await
    }

    pub async fn set_reciprocated(&self, id: &str, reciprocated: bool) -> Result<()> {
        let id = id.to_string();
        self.execute(move |conn| {
            conn.execute(
                "UPDATE interactions SET reciprocated = ?1 WHERE id = ?2",
                params![reciprocated as i64, id],
            )
            .with_context(|| "failed to update reciprocated flag")?;
            Ok(())
        })
        .await
    }

    pub async fn list(&self, kind: InteractionKind) -> Result<Vec<Interaction>> {
        self.query_interactions(
            format!(
                "SELECT {INTERACTION_COLUMNS} FROM interactions
                 WHERE kind = ?1 ORDER BY timestamp DESC"
            ),
            kind,
        )
        .await
    }

    /// Records of the given kind that have not been reciprocated yet.
    pub async fn pending(&self, kind: InteractionKind) -> Result<Vec<Interaction>> {
        self.query_interactions(
            format!(
                "SELECT {INTERACTION_COLUMNS} FROM interactions
                 WHERE kind = ?1 AND reciprocated = 0 ORDER BY timestamp DESC"
            ),
            kind,
        )
        .await
    }

    async fn query_interactions(
        &self,
        sql: String,
        kind: InteractionKind,
    ) -> Result<Vec<Interaction>> {
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(params![kind.as_str()])?;
            let mut records = Vec::new();
            while let Some(row) = rows.next()? {
                records.push(row_to_interaction(row)?);
            }
            Ok(records)
        })
        .await
    }

    /// Records whose page-reported timestamp falls on the given date.
    pub async fn by_date(&self, date: NaiveDate) -> Result<Vec<Interaction>> {
        let prefix = date.format("%Y-%m-%d").to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {INTERACTION_COLUMNS} FROM interactions
                 WHERE substr(timestamp, 1, 10) = ?1 ORDER BY timestamp DESC"
            ))?;
            let mut rows = stmt.query(params![prefix])?;
            let mut records = Vec::new();
            while let Some(row) = rows.next()? {
                records.push(row_to_interaction(row)?);
            }
            Ok(records)
        })
        .await
    }

    pub async fn count_total(&self, kind: InteractionKind) -> Result<u64> {
        self.execute(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM interactions WHERE kind = ?1",
                params![kind.as_str()],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
        .await
    }

    pub async fn count_pending(&self, kind: InteractionKind) -> Result<u64> {
        self.execute(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM interactions WHERE kind = ?1 AND reciprocated = 0",
                params![kind.as_str()],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
        .await
    }

    /// Bulk purge used when a handle is confirmed as the controlling
    /// account itself. Returns the number of removed rows.
    pub async fn remove_by_handle(&self, handle: &str) -> Result<usize> {
        let handle = handle.to_lowercase();
        self.execute(move |conn| {
            let removed = conn
                .execute(
                    "DELETE FROM interactions WHERE user_handle = ?1",
                    params![handle],
                )
                .with_context(|| "failed to remove records by handle")?;
            Ok(removed)
        })
        .await
    }

    pub async fn set_self_handle(&self, handle: &str) -> Result<()> {
        let handle = handle.to_lowercase();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO meta (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![SELF_HANDLE_KEY, handle],
            )
            .with_context(|| "failed to store self handle")?;
            Ok(())
        })
        .await
    }

    pub async fn self_handle(&self) -> Result<Option<String>> {
        self.execute(move |conn| {
            let mut stmt = conn.prepare("SELECT value FROM meta WHERE key = ?1")?;
            let mut rows = stmt.query(params![SELF_HANDLE_KEY])?;
            if let Some(row) = rows.next()? {
                Ok(Some(row.get::<_, String>(0)?))
            } else {
                Ok(None)
            }
        })
        .await
    }
}
