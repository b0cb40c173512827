//! # printlink-db
//!
//! SQLite persistence for printer records. The sync crate's
//! `SqliteConfigStore` is the only caller; everything here is plain sqlx.
//!
//! ```text
//!   SqliteConfigStore
//!         │ upsert / get / list / delete / find_by_identity
//!         ▼
//!   Database ── printers() ──► PrinterRepository ──► printers table
//!      │
//!      └── opened once: mkdir, WAL, migrations/sqlite/*.sql
//! ```
//!
//! ```rust,ignore
//! let db = printlink_db::Database::new(DbConfig::new("printers.db")).await?;
//! for record in db.printers().list().await? {
//!     println!("{} {}", record.config.label(), record.rank);
//! }
//! ```

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};
pub use repository::printer::PrinterRepository;
