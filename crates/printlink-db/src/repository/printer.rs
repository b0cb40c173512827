//! # Printer Repository
//!
//! CRUD over the `printers` table.
//!
//! ## Row Layout
//! ```text
//! ┌──────────────┬──────────┬─────────┬────────┬──────────────────┬────────────┐
//! │ unique_id PK │ identity │ rank    │ wanted │ body (JSON)      │ updated_at │
//! ├──────────────┼──────────┼─────────┼────────┼──────────────────┼────────────┤
//! │ 550e8400-... │ 42       │ active  │ 1      │ {"unique_id":..} │ 2026-...   │
//! │              │ (unique) │         │        │                  │            │
//! │ 7c9e6679-... │ NULL     │ pending │ 0      │ {...}            │ 2026-...   │
//! └──────────────┴──────────┴─────────┴────────┴──────────────────┴────────────┘
//! ```
//!
//! The JSON body is the source of truth for the config; `identity` and `rank`
//! are copies kept for lookups and constraints.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::debug;
use uuid::Uuid;

use crate::error::{DbError, DbResult};
use printlink_core::{PrinterConfig, Rank, StoredRecord};

#[derive(Debug, sqlx::FromRow)]
struct PrinterRow {
    unique_id: String,
    rank: Rank,
    wanted: bool,
    body: String,
    updated_at: DateTime<Utc>,
}

impl PrinterRow {
    fn into_record(self) -> DbResult<StoredRecord> {
        let config: PrinterConfig = serde_json::from_str(&self.body)?;
        if config.unique_id.to_string() != self.unique_id {
            return Err(DbError::Internal(format!(
                "row {} holds body for {}",
                self.unique_id, config.unique_id
            )));
        }
        Ok(StoredRecord {
            config,
            rank: self.rank,
            wanted: self.wanted,
            updated_at: self.updated_at,
        })
    }
}

fn identity_column(config: &PrinterConfig) -> DbResult<Option<i64>> {
    config
        .identity()
        .map(|id| {
            i64::try_from(id)
                .map_err(|_| DbError::Internal(format!("identity {id} exceeds column range")))
        })
        .transpose()
}

/// Repository for printer records.
#[derive(Debug, Clone)]
pub struct PrinterRepository {
    pool: SqlitePool,
}

impl PrinterRepository {
    /// Creates a new PrinterRepository.
    pub fn new(pool: SqlitePool) -> Self {
        PrinterRepository { pool }
    }

    /// All records, oldest change first.
    pub async fn list(&self) -> DbResult<Vec<StoredRecord>> {
        let rows: Vec<PrinterRow> = sqlx::query_as(
            r#"
            SELECT unique_id, rank, wanted, body, updated_at
            FROM printers
            ORDER BY updated_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(PrinterRow::into_record).collect()
    }

    pub async fn get(&self, unique_id: Uuid) -> DbResult<Option<StoredRecord>> {
        let row: Option<PrinterRow> = sqlx::query_as(
            r#"
            SELECT unique_id, rank, wanted, body, updated_at
            FROM printers
            WHERE unique_id = ?1
            "#,
        )
        .bind(unique_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(PrinterRow::into_record).transpose()
    }

    /// Looks a record up by its remote identity.
    pub async fn find_by_identity(&self, identity: u64) -> DbResult<Option<StoredRecord>> {
        let identity = i64::try_from(identity)
            .map_err(|_| DbError::not_found("Printer", identity.to_string()))?;

        let row: Option<PrinterRow> = sqlx::query_as(
            r#"
            SELECT unique_id, rank, wanted, body, updated_at
            FROM printers
            WHERE identity = ?1
            "#,
        )
        .bind(identity)
        .fetch_optional(&self.pool)
        .await?;

        row.map(PrinterRow::into_record).transpose()
    }

    /// Inserts or replaces the record keyed by its `unique_id`.
    ///
    /// Fails with [`DbError::UniqueViolation`] when another row already owns
    /// the same remote identity.
    pub async fn upsert(&self, record: &StoredRecord) -> DbResult<()> {
        let unique_id = record.unique_id().to_string();
        let identity = identity_column(&record.config)?;
        let body = serde_json::to_string(&record.config)?;

        debug!(unique_id = %unique_id, rank = %record.rank, "Upserting printer");

        sqlx::query(
            r#"
            INSERT INTO printers (unique_id, identity, rank, wanted, body, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(unique_id) DO UPDATE SET
                identity   = excluded.identity,
                rank       = excluded.rank,
                wanted     = excluded.wanted,
                body       = excluded.body,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&unique_id)
        .bind(identity)
        .bind(record.rank)
        .bind(record.wanted)
        .bind(&body)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match DbError::from(e) {
            DbError::UniqueViolation { field, .. } => DbError::UniqueViolation {
                field,
                value: identity.map(|i| i.to_string()).unwrap_or_default(),
            },
            other => other,
        })?;

        Ok(())
    }

    /// Removes a record. Returns whether a row existed.
    pub async fn delete(&self, unique_id: Uuid) -> DbResult<bool> {
        let result = sqlx::query("DELETE FROM printers WHERE unique_id = ?1")
            .bind(unique_id.to_string())
            .execute(&self.pool)
            .await?;

        debug!(unique_id = %unique_id, removed = result.rows_affected(), "Deleted printer");
        Ok(result.rows_affected() > 0)
    }

    /// Removes every tombstoned record. Returns how many were purged.
    pub async fn purge_deleted(&self) -> DbResult<u64> {
        let result = sqlx::query("DELETE FROM printers WHERE rank = ?1")
            .bind(Rank::Deleted)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn count(&self) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM printers")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
