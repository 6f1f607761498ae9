//! Persistent record of which object keys are known to exist remotely.

use crate::Database;
use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use sqlx::SqlitePool;
use time::{Duration, UtcDateTime};

#[derive(sqlx::FromRow)]
struct SeenRow {
    last_seen: i64,
}

/// Remembers object keys confirmed present in the remote store so that
/// repeat uploads can skip the existence check entirely.
///
/// Entries older than the TTL are treated as unknown: objects can be removed
/// by bucket lifecycle rules, and a stale "yes" would mean a manifest that
/// points at missing data.
#[derive(Debug, Clone)]
pub struct ExistenceCache {
    pool: SqlitePool,
    ttl: Duration,
}
impl From<&Database> for ExistenceCache {
    fn from(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
            ttl: Self::DEFAULT_TTL,
        }
    }
}

impl ExistenceCache {
    pub const DEFAULT_TTL: Duration = Duration::days(30);

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    async fn last_seen(&self, key: &str) -> Result<Option<UtcDateTime>> {
        let row: Option<SeenRow> = sqlx::query_as(include_str!("../queries/seen_get.sql"))
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        row.map(|row| UtcDateTime::from_unix_timestamp(row.last_seen).or_raise(|| ErrorKind::InvalidData("last seen")))
            .transpose()
    }

    /// `true` only for a key marked seen within the TTL. Lookup failures and
    /// unreadable timestamps are logged and count as "not seen".
    pub async fn has_seen(&self, key: &str) -> bool {
        match self.last_seen(key).await {
            Ok(Some(seen)) => UtcDateTime::now() - seen < self.ttl,
            Ok(None) => false,
            Err(error) => {
                tracing::warn!(key, error = ?error, "ignoring unreadable existence cache entry");
                false
            },
        }
    }

    /// Record that `key` exists remotely as of now.
    pub async fn mark_seen(&self, key: &str) {
        self.mark_seen_at(key, UtcDateTime::now()).await
    }

    /// Record that `key` existed remotely at `when`.
    pub async fn mark_seen_at(&self, key: &str, when: UtcDateTime) {
        let result = sqlx::query(include_str!("../queries/seen_upsert.sql"))
            .bind(key)
            .bind(when.unix_timestamp())
            .execute(&self.pool)
            .await;
        if let Err(error) = result {
            tracing::warn!(key, %error, "existence cache update failed");
        }
    }

    /// Delete expired entries. Returns how many went.
    pub async fn prune(&self) -> Result<u64> {
        let cutoff = UtcDateTime::now() - self.ttl;
        let result = sqlx::query(include_str!("../queries/seen_prune.sql"))
            .bind(cutoff.unix_timestamp())
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(result.rows_affected())
    }
}
