//! Database connection and pool management.

use exn::ResultExt;
use sqlx::SqliteConnection;
use sqlx::pool::PoolConnectionMetadata;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use std::path::{Path, PathBuf};
use time::UtcDateTime;
use tracing::instrument;

use crate::error::{ErrorKind, Result};

/// Embedded migrations that are run automatically on connect.
static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
// Hashing and transfers run a handful of tasks at once; each may touch the cache.
const MAX_CONNECTIONS: u32 = 5;

/// Database connection pool shared by the [`HashCache`](crate::HashCache) and
/// [`ExistenceCache`](crate::ExistenceCache).
///
/// Open one per process (or per test), hand repositories to whoever needs
/// them, and [`close`](Self::close) it when done.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    async fn new(options: SqliteConnectOptions, max: Option<u32>) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            // Query-based PRAGMAs must run on EVERY pooled connection, not
            // just the first.
            .after_connect(|conn, meta| Box::pin(async move { Self::apply_pragmas(conn, meta).await }))
            .max_connections(max.unwrap_or(MAX_CONNECTIONS))
            .connect_with(options)
            .await
            .or_raise(|| ErrorKind::Database)?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// Connect to the cache database at the given path.
    ///
    /// Creates the database file (but not its directory) if it doesn't exist
    /// and runs migrations.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let options = Self::base_options().filename(path.as_ref()).create_if_missing(true);
        Self::new(options, None).await
    }

    /// Connect, and if the database is unreadable move it aside and start
    /// over with an empty one. If even that fails, fall back to an in-memory
    /// database so the caller runs uncached instead of failing.
    ///
    /// A cache is never the source of truth; losing it only costs re-hashing
    /// and extra existence checks.
    pub async fn connect_or_recover(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && let Err(error) = std::fs::create_dir_all(parent)
        {
            tracing::warn!(path = %parent.display(), %error, "could not create cache directory");
        }
        let error = match Self::connect(path).await {
            Ok(db) => return Ok(db),
            Err(error) => error,
        };
        tracing::warn!(path = %path.display(), error = ?error, "cache database unreadable, starting a new one");
        match Self::quarantine(path) {
            Ok(moved) => {
                tracing::info!(from = %path.display(), to = %moved.display(), "moved corrupt cache database aside");
                match Self::connect(path).await {
                    Ok(db) => return Ok(db),
                    Err(error) => {
                        tracing::warn!(path = %path.display(), error = ?error, "fresh cache database failed to open")
                    },
                }
            },
            Err(error) => tracing::warn!(path = %path.display(), %error, "could not move corrupt cache database"),
        }
        tracing::warn!("using an in-memory cache for this process");
        Self::connect_in_memory().await
    }

    /// Rename the database (and its WAL sidecars) to a timestamped name.
    fn quarantine(path: &Path) -> std::io::Result<PathBuf> {
        let stamp = UtcDateTime::now().unix_timestamp();
        let mut moved = path.as_os_str().to_os_string();
        moved.push(format!(".corrupt-{stamp}"));
        let moved = PathBuf::from(moved);
        std::fs::rename(path, &moved)?;
        for sidecar in ["-wal", "-shm"] {
            let mut side = path.as_os_str().to_os_string();
            side.push(sidecar);
            // Sidecars are rebuilt from scratch; stale ones would be replayed.
            let _ = std::fs::remove_file(PathBuf::from(side));
        }
        Ok(moved)
    }

    /// Connect to an in-memory database (useful for testing).
    ///
    /// Note:
    /// - In-memory databases are destroyed when the connection closes.
    /// - Not `#[cfg(test)]` so that other crates can also use this in their tests.
    pub async fn connect_in_memory() -> Result<Self> {
        let options = Self::base_options().filename(":memory:");
        // Parallel connections to ":memory:" would each see their own database.
        Self::new(options, Some(1)).await
    }

    /// Base connection options shared between file and in-memory databases.
    fn base_options() -> SqliteConnectOptions {
        SqliteConnectOptions::new()
            // WAL: readers don't block the writer and vice versa
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .foreign_keys(true)
            .synchronous(SqliteSynchronous::Normal)
            // Many hashing tasks finishing at once will queue on the single
            // WAL writer; too small a timeout surfaces as SQLITE_BUSY.
            .busy_timeout(std::time::Duration::from_millis(1500))
            .auto_vacuum(sqlx::sqlite::SqliteAutoVacuum::None)
    }

    /// Apply additional PRAGMA settings that aren't exposed via SqliteConnectOptions.
    async fn apply_pragmas(conn: &mut SqliteConnection, _meta: PoolConnectionMetadata) -> sqlx::Result<()> {
        sqlx::query(
            r#"
                PRAGMA locking_mode = NORMAL;
                PRAGMA wal_autocheckpoint = 800;
                PRAGMA cache_size = -8192;
                PRAGMA temp_store = MEMORY;
                PRAGMA mmap_size = 33554432;
                PRAGMA analysis_limit = 1000;
            "#,
        )
        .execute(conn)
        .await?;
        Ok(())
    }

    #[instrument("performing cache database migrations", skip(self))]
    async fn migrate(&self) -> Result<()> {
        MIGRATOR.run(&self.pool).await.or_raise(|| ErrorKind::Migration)
    }

    /// Get a reference to the underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the database connection pool.
    ///
    /// Waits for all connections to be returned to the pool and then closes
    /// them. Repositories created from this database stop working.
    pub async fn close(&self) {
        // Let SQLite update query planner statistics
        _ = sqlx::query("PRAGMA optimize").execute(&self.pool).await;
        self.pool.close().await;
    }
}
