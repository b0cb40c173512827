//! # Config Store
//!
//! Durable home of every printer's identity/config record.
//!
//! ## Implementations
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        dyn ConfigStore                                  │
//! │                                                                         │
//! │  ┌────────────────────────┐        ┌────────────────────────────────┐  │
//! │  │ MemoryConfigStore      │        │ SqliteConfigStore              │  │
//! │  │ RwLock<HashMap>        │        │ printlink-db PrinterRepository │  │
//! │  │ tests, ephemeral runs  │        │ WAL SQLite file                │  │
//! │  └───────────┬────────────┘        └───────────────┬────────────────┘  │
//! │              └──────────────┬──────────────────────┘                    │
//! │                             ▼                                           │
//! │             broadcast::Sender<StoreEvent>  (subscribe)                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Call sites wrap store calls in [`with_retry`]; only errors classified as
//! retryable are attempted again.

use async_trait::async_trait;
use printlink_core::StoredRecord;
use printlink_db::{Database, DbConfig};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{ClientSettings, StoreKind};
use crate::connection::ReconnectBackoff;
use crate::error::{SyncError, SyncResult};

// =============================================================================
// Store Trait
// =============================================================================

/// Change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEvent {
    Upserted(Uuid),
    Deleted(Uuid),
}

const EVENT_CAPACITY: usize = 64;

/// Read/write contract of the record store.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn list(&self) -> SyncResult<Vec<StoredRecord>>;

    async fn get(&self, unique_id: Uuid) -> SyncResult<Option<StoredRecord>>;

    /// Inserts or replaces the record keyed by its unique id.
    async fn upsert(&self, record: &StoredRecord) -> SyncResult<()>;

    /// Returns whether a record was removed.
    async fn delete(&self, unique_id: Uuid) -> SyncResult<bool>;

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent>;
}

/// Opens the store selected in settings.
pub async fn open_store(settings: &ClientSettings) -> SyncResult<Arc<dyn ConfigStore>> {
    match settings.store.kind {
        StoreKind::Memory => {
            info!("Using in-memory config store");
            Ok(Arc::new(MemoryConfigStore::new()))
        }
        StoreKind::Sqlite => {
            let path = settings.store.resolved_path().ok_or_else(|| {
                SyncError::InvalidConfig("no store path and no data directory".into())
            })?;
            let store = SqliteConfigStore::open(DbConfig::new(path)).await?;
            Ok(Arc::new(store))
        }
    }
}

// =============================================================================
// Memory Store
// =============================================================================

#[derive(Debug)]
pub struct MemoryConfigStore {
    records: RwLock<HashMap<Uuid, StoredRecord>>,
    events: broadcast::Sender<StoreEvent>,
    failures: AtomicUsize,
}

impl Default for MemoryConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        MemoryConfigStore {
            records: RwLock::new(HashMap::new()),
            events,
            failures: AtomicUsize::new(0),
        }
    }

    /// Makes the next `n` calls fail with a retryable error.
    pub fn inject_failures(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    fn check(&self) -> SyncResult<()> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SyncError::StoreUnavailable("injected failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn list(&self) -> SyncResult<Vec<StoredRecord>> {
        self.check()?;
        let mut records: Vec<_> = self.records.read().await.values().cloned().collect();
        records.sort_by_key(|r| r.updated_at);
        Ok(records)
    }

    async fn get(&self, unique_id: Uuid) -> SyncResult<Option<StoredRecord>> {
        self.check()?;
        Ok(self.records.read().await.get(&unique_id).cloned())
    }

    async fn upsert(&self, record: &StoredRecord) -> SyncResult<()> {
        self.check()?;
        let id = record.unique_id();
        self.records.write().await.insert(id, record.clone());
        let _ = self.events.send(StoreEvent::Upserted(id));
        Ok(())
    }

    async fn delete(&self, unique_id: Uuid) -> SyncResult<bool> {
        self.check()?;
        let removed = self.records.write().await.remove(&unique_id).is_some();
        if removed {
            let _ = self.events.send(StoreEvent::Deleted(unique_id));
        }
        Ok(removed)
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}

// =============================================================================
// SQLite Store
// =============================================================================

#[derive(Debug, Clone)]
pub struct SqliteConfigStore {
    db: Database,
    events: broadcast::Sender<StoreEvent>,
}

impl SqliteConfigStore {
    pub async fn open(config: DbConfig) -> SyncResult<Self> {
        let db = Database::new(config).await?;
        Ok(Self::from_database(db))
    }

    pub fn from_database(db: Database) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        SqliteConfigStore { db, events }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }
}

#[async_trait]
impl ConfigStore for SqliteConfigStore {
    async fn list(&self) -> SyncResult<Vec<StoredRecord>> {
        Ok(self.db.printers().list().await?)
    }

    async fn get(&self, unique_id: Uuid) -> SyncResult<Option<StoredRecord>> {
        Ok(self.db.printers().get(unique_id).await?)
    }

    async fn upsert(&self, record: &StoredRecord) -> SyncResult<()> {
        self.db.printers().upsert(record).await?;
        let _ = self.events.send(StoreEvent::Upserted(record.unique_id()));
        Ok(())
    }

    async fn delete(&self, unique_id: Uuid) -> SyncResult<bool> {
        let removed = self.db.printers().delete(unique_id).await?;
        if removed {
            let _ = self.events.send(StoreEvent::Deleted(unique_id));
        }
        Ok(removed)
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}

// =============================================================================
// Retry
// =============================================================================

/// How hard a call site retries store operations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial: Duration,
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempts: 4,
            initial: Duration::from_millis(100),
            max: Duration::from_secs(2),
        }
    }
}

/// Runs `call` until it succeeds, fails permanently or runs out of attempts.
pub async fn with_retry<T, F, Fut>(operation: &str, policy: RetryPolicy, mut call: F) -> SyncResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SyncResult<T>>,
{
    let mut backoff = ReconnectBackoff::new(policy.initial, policy.max, 0.1);
    let mut attempt = 1;

    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.attempts => {
                let delay = backoff.next_delay();
                warn!(operation, attempt, ?delay, error = %e, "Store call failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
