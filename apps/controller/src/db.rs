use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use common::{ApiError, RequestContext};
use rusqlite::Connection;
use tokio::sync::Mutex;
use tracing::warn;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    uuid TEXT PRIMARY KEY,
    email TEXT NOT NULL DEFAULT '',
    username TEXT NOT NULL DEFAULT '',
    first_name TEXT NOT NULL DEFAULT '',
    last_name TEXT NOT NULL DEFAULT '',
    is_active INTEGER NOT NULL DEFAULT 0,
    is_admin INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS api_client_authorizations (
    uuid TEXT PRIMARY KEY,
    api_token TEXT NOT NULL,
    owner_uuid TEXT NOT NULL,
    created_at TEXT,
    expires_at TEXT,
    scopes TEXT NOT NULL DEFAULT '[\"all\"]'
);
CREATE INDEX IF NOT EXISTS api_client_authorizations_token ON api_client_authorizations (api_token);
CREATE TABLE IF NOT EXISTS containers (
    uuid TEXT PRIMARY KEY,
    state TEXT NOT NULL,
    priority INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);
CREATE TABLE IF NOT EXISTS container_requests (
    uuid TEXT PRIMARY KEY,
    state TEXT NOT NULL,
    priority INTEGER NOT NULL DEFAULT 0,
    container_uuid TEXT,
    requesting_container_uuid TEXT,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);
CREATE INDEX IF NOT EXISTS container_requests_container ON container_requests (container_uuid);
";

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("database task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("transaction requested after the API call returned")]
    Closed,
}

impl From<DbError> for ApiError {
    fn from(err: DbError) -> Self {
        ApiError::internal(err.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct Database {
    path: PathBuf,
}

impl Database {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, DbError> {
        let db = Self {
            path: path.as_ref().to_path_buf(),
        };
        db.run(|conn| conn.execute_batch(SCHEMA)).await?;
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self) -> Result<Connection, rusqlite::Error> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(Duration::from_secs(10))?;
        Ok(conn)
    }

    pub async fn run<T, F>(&self, f: F) -> Result<T, DbError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let db = self.clone();
        let result = tokio::task::spawn_blocking(move || {
            let conn = db.connect()?;
            f(&conn)
        })
        .await?;
        Ok(result?)
    }

    async fn begin(&self) -> Result<Tx, DbError> {
        let conn = self
            .run_owned(|conn| {
                conn.execute_batch("BEGIN")?;
                Ok(())
            })
            .await?;
        Ok(Tx {
            conn: Mutex::new(Some(conn)),
        })
    }

    async fn run_owned(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<()> + Send + 'static,
    ) -> Result<Connection, DbError> {
        let db = self.clone();
        let conn = tokio::task::spawn_blocking(move || {
            let conn = db.connect()?;
            f(&conn)?;
            Ok::<_, rusqlite::Error>(conn)
        })
        .await??;
        Ok(conn)
    }
}

#[derive(Debug)]
pub struct Tx {
    conn: Mutex<Option<Connection>>,
}

impl Tx {
    pub async fn run<T, F>(&self, f: F) -> Result<T, DbError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let mut slot = self.conn.lock().await;
        let conn = slot.take().ok_or(DbError::Closed)?;
        let (conn, result) = tokio::task::spawn_blocking(move || {
            let result = f(&conn);
            (conn, result)
        })
        .await?;
        *slot = Some(conn);
        Ok(result?)
    }

    async fn finish(&self, commit: bool) -> Result<(), DbError> {
        let sql = if commit { "COMMIT" } else { "ROLLBACK" };
        self.run(move |conn| conn.execute_batch(sql)).await?;
        self.conn.lock().await.take();
        Ok(())
    }
}

enum TxState {
    Unused,
    Open(Arc<Tx>),
    Closed,
}

struct TxSlot {
    db: Database,
    state: Mutex<TxState>,
}

pub async fn current_tx(ctx: &RequestContext) -> Result<Arc<Tx>, ApiError> {
    let slot = ctx
        .value::<TxSlot>()
        .ok_or_else(|| ApiError::internal("no database transaction available in this context"))?;
    let mut state = slot.state.lock().await;
    match &*state {
        TxState::Open(tx) => Ok(Arc::clone(tx)),
        TxState::Closed => Err(DbError::Closed.into()),
        TxState::Unused => {
            let tx = Arc::new(slot.db.begin().await?);
            *state = TxState::Open(Arc::clone(&tx));
            Ok(tx)
        }
    }
}

/// Run one API call with a lazily opened transaction that is committed
/// when the call succeeds and rolled back when it fails.
pub async fn wrap_in_transaction<T, F, Fut>(
    db: &Database,
    ctx: RequestContext,
    call: F,
) -> Result<T, ApiError>
where
    F: FnOnce(RequestContext) -> Fut,
    Fut: std::future::Future<Output = Result<T, ApiError>>,
{
    let slot = Arc::new(TxSlot {
        db: db.clone(),
        state: Mutex::new(TxState::Unused),
    });
    let result = call(ctx.with_value(Arc::clone(&slot))).await;

    let previous = std::mem::replace(&mut *slot.state.lock().await, TxState::Closed);
    if let TxState::Open(tx) = previous {
        let commit = result.is_ok();
        if let Err(err) = tx.finish(commit).await {
            warn!(error = %err, commit, "failed to finish transaction");
            if commit {
                return Err(err.into());
            }
        }
    }
    result
}
