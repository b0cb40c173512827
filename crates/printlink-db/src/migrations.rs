//! # Database Migrations
//!
//! Embedded SQL migrations for the printer store.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Database::new                                                          │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  _sqlx_migrations ◄── compare ──► embedded migrations/sqlite/*.sql     │
//! │       │                                                                 │
//! │       └── apply pending ones in filename order, one transaction each   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! New migrations get the next sequence number (`002_...sql`); applied files
//! are never edited.

use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::error::DbResult;

/// Embedded migrations from the workspace `migrations/sqlite` directory.
static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations/sqlite");

/// Runs all pending database migrations. Idempotent.
pub async fn run_migrations(pool: &SqlitePool) -> DbResult<()> {
    debug!(embedded = MIGRATOR.migrations.len(), "Checking for pending migrations");
    MIGRATOR.run(pool).await?;
    info!("Printer store schema is current");
    Ok(())
}

/// Returns `(embedded, applied)` migration counts, for diagnostics.
pub async fn migration_status(pool: &SqlitePool) -> DbResult<(usize, usize)> {
    let total = MIGRATOR.migrations.len();

    let applied: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM _sqlx_migrations WHERE success = 1")
        .fetch_one(pool)
        .await?;

    Ok((total, applied as usize))
}
