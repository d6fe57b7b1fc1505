//! Persistent seen-ledger: one record per fingerprint, never deleted.
//!
//! Writes go through narrow operations (`upsert_seen`, `mark_emailed`) so `emailed_at` can only
//! ever move from null to a timestamp. Writes to the same fingerprint are serialized by a
//! per-key lock; unrelated keys proceed concurrently.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use scout_core::{Fingerprint, SeenRecord};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::FromRow;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

const WRITE_CONFLICT_RETRIES: usize = 5;
const KEY_LOCK_PRUNE_THRESHOLD: usize = 1024;

#[derive(Debug, Error)]
pub enum LedgerError {
    /// Another writer held the same row; safe to retry since writes are idempotent.
    #[error("write conflict on {fingerprint}")]
    WriteConflict { fingerprint: String },
    /// Durable storage cannot be reached. Fatal to the run.
    #[error("ledger unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt ledger record {fingerprint}: {message}")]
    Corrupt { fingerprint: String, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmailMark {
    Marked,
    AlreadyMarked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct LedgerStats {
    pub total: u64,
    pub emailed: u64,
    pub seen_since: u64,
}

#[async_trait]
pub trait SeenLedger: Send + Sync {
    async fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<SeenRecord>, LedgerError>;

    /// Creates the record on first sighting, otherwise advances `last_seen_at` only.
    async fn upsert_seen(
        &self,
        fingerprint: &Fingerprint,
        at: DateTime<Utc>,
    ) -> Result<(), LedgerError>;

    /// Sets `emailed_at` only when it is null.
    async fn mark_emailed(
        &self,
        fingerprint: &Fingerprint,
        at: DateTime<Utc>,
    ) -> Result<EmailMark, LedgerError>;

    /// Records with `last_seen_at >= since`, newest first.
    async fn recent(&self, since: DateTime<Utc>) -> Result<Vec<SeenRecord>, LedgerError>;

    async fn stats(&self, since: DateTime<Utc>) -> Result<LedgerStats, LedgerError>;
}

#[derive(Debug, Default)]
struct KeyLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyLocks {
    async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.locks.lock().await;
            if map.len() > KEY_LOCK_PRUNE_THRESHOLD {
                map.retain(|_, lock| Arc::strong_count(lock) > 1);
            }
            map.entry(key.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

fn stamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_stamp(fingerprint: &str, raw: &str) -> Result<DateTime<Utc>, LedgerError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| LedgerError::Corrupt {
            fingerprint: fingerprint.to_string(),
            message: format!("bad timestamp {raw:?}: {err}"),
        })
}

fn classify_sqlx(fingerprint: &str, err: sqlx::Error) -> LedgerError {
    if let sqlx::Error::Database(db) = &err {
        // SQLITE_BUSY, SQLITE_LOCKED, SQLITE_BUSY_SNAPSHOT
        if matches!(db.code().as_deref(), Some("5" | "6" | "517")) {
            return LedgerError::WriteConflict {
                fingerprint: fingerprint.to_string(),
            };
        }
    }
    LedgerError::Unavailable(err.to_string())
}

#[derive(Debug, FromRow)]
struct SeenRow {
    fingerprint: String,
    first_seen_at: String,
    last_seen_at: String,
    emailed_at: Option<String>,
}

impl SeenRow {
    fn into_record(self) -> Result<SeenRecord, LedgerError> {
        let emailed_at = match &self.emailed_at {
            Some(raw) => Some(parse_stamp(&self.fingerprint, raw)?),
            None => None,
        };
        Ok(SeenRecord {
            first_seen_at: parse_stamp(&self.fingerprint, &self.first_seen_at)?,
            last_seen_at: parse_stamp(&self.fingerprint, &self.last_seen_at)?,
            emailed_at,
            fingerprint: Fingerprint::new(self.fingerprint),
        })
    }
}

/// SQLite-backed ledger. WAL journal with `synchronous = FULL`, so a committed write survives
/// a crash immediately after it returns.
#[derive(Debug)]
pub struct SqliteLedger {
    pool: SqlitePool,
    key_locks: KeyLocks,
}

impl SqliteLedger {
    /// Opens (creating if missing) the ledger at `database_url`, e.g. `sqlite://scout.db`.
    pub async fn connect(database_url: &str) -> Result<Self, LedgerError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| LedgerError::Unavailable(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| LedgerError::Unavailable(e.to_string()))?;

        Self::with_pool(pool).await
    }

    /// Ephemeral ledger for tests. A single pinned connection keeps the database alive.
    pub async fn in_memory() -> Result<Self, LedgerError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| LedgerError::Unavailable(e.to_string()))?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| LedgerError::Unavailable(e.to_string()))?;

        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self, LedgerError> {
        let ledger = Self {
            pool,
            key_locks: KeyLocks::default(),
        };
        ledger.run_migrations().await?;
        Ok(ledger)
    }

    async fn run_migrations(&self) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS postings_seen (
                fingerprint TEXT PRIMARY KEY,
                first_seen_at TEXT NOT NULL,
                last_seen_at TEXT NOT NULL,
                emailed_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_postings_seen_last_seen ON postings_seen(last_seen_at);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| LedgerError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn try_upsert(&self, fingerprint: &str, at: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO postings_seen (fingerprint, first_seen_at, last_seen_at, emailed_at)
            VALUES (?, ?, ?, NULL)
            ON CONFLICT(fingerprint) DO UPDATE SET
                last_seen_at = MAX(postings_seen.last_seen_at, excluded.last_seen_at)
            "#,
        )
        .bind(fingerprint)
        .bind(at)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn try_mark_emailed(
        &self,
        fingerprint: &str,
        at: &str,
    ) -> Result<EmailMark, sqlx::Error> {
        let updated = sqlx::query(
            "UPDATE postings_seen SET emailed_at = ? WHERE fingerprint = ? AND emailed_at IS NULL",
        )
        .bind(at)
        .bind(fingerprint)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if updated == 1 {
            return Ok(EmailMark::Marked);
        }

        // No row yet: record the sighting and the delivery together.
        let inserted = sqlx::query(
            r#"
            INSERT INTO postings_seen (fingerprint, first_seen_at, last_seen_at, emailed_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(fingerprint) DO NOTHING
            "#,
        )
        .bind(fingerprint)
        .bind(at)
        .bind(at)
        .bind(at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(if inserted == 1 {
            EmailMark::Marked
        } else {
            EmailMark::AlreadyMarked
        })
    }
}

#[async_trait]
impl SeenLedger for SqliteLedger {
    async fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<SeenRecord>, LedgerError> {
        let row = sqlx::query_as::<_, SeenRow>(
            "SELECT fingerprint, first_seen_at, last_seen_at, emailed_at
             FROM postings_seen WHERE fingerprint = ?",
        )
        .bind(fingerprint.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| LedgerError::Unavailable(e.to_string()))?;

        row.map(SeenRow::into_record).transpose()
    }

    async fn upsert_seen(
        &self,
        fingerprint: &Fingerprint,
        at: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let _guard = self.key_locks.acquire(fingerprint.as_str()).await;
        let at = stamp(at);
        let mut attempt = 0;
        loop {
            match self.try_upsert(fingerprint.as_str(), &at).await {
                Ok(()) => return Ok(()),
                Err(err) => match classify_sqlx(fingerprint.as_str(), err) {
                    LedgerError::WriteConflict { .. } if attempt < WRITE_CONFLICT_RETRIES => {
                        attempt += 1;
                        debug!(%fingerprint, attempt, "ledger write conflict, retrying");
                        tokio::task::yield_now().await;
                    }
                    other => return Err(other),
                },
            }
        }
    }

    async fn mark_emailed(
        &self,
        fingerprint: &Fingerprint,
        at: DateTime<Utc>,
    ) -> Result<EmailMark, LedgerError> {
        let _guard = self.key_locks.acquire(fingerprint.as_str()).await;
        let at = stamp(at);
        let mut attempt = 0;
        loop {
            match self.try_mark_emailed(fingerprint.as_str(), &at).await {
                Ok(mark) => return Ok(mark),
                Err(err) => match classify_sqlx(fingerprint.as_str(), err) {
                    LedgerError::WriteConflict { .. } if attempt < WRITE_CONFLICT_RETRIES => {
                        attempt += 1;
                        debug!(%fingerprint, attempt, "ledger write conflict, retrying");
                        tokio::task::yield_now().await;
                    }
                    other => {
                        warn!(%fingerprint, error = %other, "mark_emailed failed");
                        return Err(other);
                    }
                },
            }
        }
    }

    async fn recent(&self, since: DateTime<Utc>) -> Result<Vec<SeenRecord>, LedgerError> {
        let rows = sqlx::query_as::<_, SeenRow>(
            r#"
            SELECT fingerprint, first_seen_at, last_seen_at, emailed_at
            FROM postings_seen
            WHERE last_seen_at >= ?
            ORDER BY last_seen_at DESC, fingerprint ASC
            "#,
        )
        .bind(stamp(since))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| LedgerError::Unavailable(e.to_string()))?;

        rows.into_iter().map(SeenRow::into_record).collect()
    }

    async fn stats(&self, since: DateTime<Utc>) -> Result<LedgerStats, LedgerError> {
        let (total, emailed, seen_since): (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*),
                COALESCE(SUM(CASE WHEN emailed_at IS NOT NULL THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN last_seen_at >= ? THEN 1 ELSE 0 END), 0)
            FROM postings_seen
            "#,
        )
        .bind(stamp(since))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| LedgerError::Unavailable(e.to_string()))?;

        Ok(LedgerStats {
            total: total.max(0) as u64,
            emailed: emailed.max(0) as u64,
            seen_since: seen_since.max(0) as u64,
        })
    }
}

/// In-process ledger with the same semantics as [`SqliteLedger`].
#[derive(Debug, Default)]
pub struct MemoryLedger {
    records: Mutex<BTreeMap<Fingerprint, SeenRecord>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    async fn seed(&self, record: SeenRecord) {
        let mut records = self.records.lock().await;
        records.entry(record.fingerprint.clone()).or_insert(record);
    }

    async fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.records.lock().await.contains_key(fingerprint)
    }
}

#[async_trait]
impl SeenLedger for MemoryLedger {
    async fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<SeenRecord>, LedgerError> {
        Ok(self.records.lock().await.get(fingerprint).cloned())
    }

    async fn upsert_seen(
        &self,
        fingerprint: &Fingerprint,
        at: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let mut records = self.records.lock().await;
        records
            .entry(fingerprint.clone())
            .and_modify(|record| record.last_seen_at = record.last_seen_at.max(at))
            .or_insert_with(|| SeenRecord::first_sighting(fingerprint.clone(), at));
        Ok(())
    }

    async fn mark_emailed(
        &self,
        fingerprint: &Fingerprint,
        at: DateTime<Utc>,
    ) -> Result<EmailMark, LedgerError> {
        let mut records = self.records.lock().await;
        let record = records
            .entry(fingerprint.clone())
            .or_insert_with(|| SeenRecord::first_sighting(fingerprint.clone(), at));
        if record.emailed_at.is_some() {
            return Ok(EmailMark::AlreadyMarked);
        }
        record.emailed_at = Some(at);
        Ok(EmailMark::Marked)
    }

    async fn recent(&self, since: DateTime<Utc>) -> Result<Vec<SeenRecord>, LedgerError> {
        let records = self.records.lock().await;
        let mut out = records
            .values()
            .filter(|r| r.last_seen_at >= since)
            .cloned()
            .collect::<Vec<_>>();
        out.sort_by(|a, b| {
            b.last_seen_at
                .cmp(&a.last_seen_at)
                .then_with(|| a.fingerprint.cmp(&b.fingerprint))
        });
        Ok(out)
    }

    async fn stats(&self, since: DateTime<Utc>) -> Result<LedgerStats, LedgerError> {
        let records = self.records.lock().await;
        Ok(LedgerStats {
            total: records.len() as u64,
            emailed: records.values().filter(|r| r.was_emailed()).count() as u64,
            seen_since: records.values().filter(|r| r.last_seen_at >= since).count() as u64,
        })
    }
}

/// Dry-run ledger: reads fall through to `base`, writes land in a scratch [`MemoryLedger`] that is
/// dropped with the overlay. The durable store is never written.
pub struct OverlayLedger {
    base: Arc<dyn SeenLedger>,
    scratch: MemoryLedger,
}

impl OverlayLedger {
    pub fn new(base: Arc<dyn SeenLedger>) -> Self {
        Self {
            base,
            scratch: MemoryLedger::new(),
        }
    }

    async fn pull_through(&self, fingerprint: &Fingerprint) -> Result<(), LedgerError> {
        if !self.scratch.contains(fingerprint).await {
            if let Some(record) = self.base.lookup(fingerprint).await? {
                self.scratch.seed(record).await;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SeenLedger for OverlayLedger {
    async fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<SeenRecord>, LedgerError> {
        match self.scratch.lookup(fingerprint).await? {
            Some(record) => Ok(Some(record)),
            None => self.base.lookup(fingerprint).await,
        }
    }

    async fn upsert_seen(
        &self,
        fingerprint: &Fingerprint,
        at: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        self.pull_through(fingerprint).await?;
        self.scratch.upsert_seen(fingerprint, at).await
    }

    async fn mark_emailed(
        &self,
        fingerprint: &Fingerprint,
        at: DateTime<Utc>,
    ) -> Result<EmailMark, LedgerError> {
        self.pull_through(fingerprint).await?;
        self.scratch.mark_emailed(fingerprint, at).await
    }

    async fn recent(&self, since: DateTime<Utc>) -> Result<Vec<SeenRecord>, LedgerError> {
        self.base.recent(since).await
    }

    async fn stats(&self, since: DateTime<Utc>) -> Result<LedgerStats, LedgerError> {
        self.base.stats(since).await
    }
}
