use std::{
    path::PathBuf,
    sync::{mpsc, Arc, Mutex},
    thread::{self, JoinHandle},
};

use anyhow::{anyhow, Context, Result};
use log::{error, info};
use rusqlite::Connection;
use tokio::sync::{oneshot, watch};

pub mod helpers;
mod migrations;
pub mod models;
pub mod repositories;

pub use models::{CameraSession, FrontRearHint, SessionFinalization, SessionSource};

use migrations::run_migrations;

/// Newest-first list of every stored session, republished after each write.
pub type SessionSnapshot = Arc<Vec<CameraSession>>;

type DbTask = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

enum DbCommand {
    Execute(DbTask),
    Shutdown,
}

enum DbLocation {
    File(PathBuf),
    Memory,
}

struct DatabaseInner {
    sender: mpsc::Sender<DbCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
    snapshot_tx: Arc<watch::Sender<SessionSnapshot>>,
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

/// Handle to the session store. All statements run on one dedicated SQLite
/// thread, so callers on the async runtime never block on disk I/O.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl Database {
    pub fn new(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database directory {}", parent.display())
            })?;
        }

        let location = DbLocation::File(db_path.clone());
        let database = Self::spawn(location)?;
        info!("Database initialized at {}", db_path.display());
        Ok(database)
    }

    /// Volatile store, used as a fallback when the file cannot be opened and
    /// by tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::spawn(DbLocation::Memory)
    }

    fn spawn(location: DbLocation) -> Result<Self> {
        let (command_tx, command_rx) = mpsc::channel::<DbCommand>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<Vec<CameraSession>>>();

        let worker = thread::Builder::new()
            .name("camwatch-db".into())
            .spawn(move || {
                let opened = match &location {
                    DbLocation::File(path) => Connection::open(path),
                    DbLocation::Memory => Connection::open_in_memory(),
                };
                let mut conn = match opened {
                    Ok(connection) => connection,
                    Err(err) => {
                        let _ = ready_tx.send(Err(anyhow::Error::new(err)
                            .context("failed to open SQLite database")));
                        return;
                    }
                };

                if let DbLocation::File(_) = location {
                    if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
                        error!("Failed to enable WAL mode: {err}");
                    }
                }

                let init_result = run_migrations(&mut conn)
                    .context("failed to run database migrations")
                    .and_then(|_| repositories::sessions::load_all_desc(&conn));
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

                info!("Database thread shutting down");
            })
            .with_context(|| "failed to spawn database worker thread")?;

        let initial = ready_rx
            .recv()
            .context("database worker exited before signaling readiness")??;
        let (snapshot_tx, _) = watch::channel::<SessionSnapshot>(Arc::new(initial));

        Ok(Self {
            inner: Arc::new(DatabaseInner {
                sender: command_tx,
                worker: Mutex::new(Some(worker)),
                snapshot_tx: Arc::new(snapshot_tx),
            }),
        })
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

    /// Runs a write and, on the same thread and before replying, republishes
    /// the session snapshot so observers never miss a mutation.
    pub(crate) async fn mutate<F, T>(&self, task: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let snapshot_tx = Arc::clone(&self.inner.snapshot_tx);
        self.execute(move |conn| {
            let result = task(conn)?;
            match repositories::sessions::load_all_desc(conn) {
                Ok(sessions) => {
                    snapshot_tx.send_replace(Arc::new(sessions));
                }
                Err(err) => error!("Failed to refresh session snapshot: {err:?}"),
            }
            Ok(result)
        })
        .await
    }

    /// Live view of all sessions, newest first.
    pub fn observe_all(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.snapshot_tx.subscribe()
    }
}
