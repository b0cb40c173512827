//! # Client App
//!
//! Top-level owner of the runtime: boots records from the store, exposes the
//! user CRUD surface and runs the housekeeping tasks.
//!
//! ## Task Layout
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              ClientApp                                  │
//! │                                                                         │
//! │  add / remove / update / set_reachable ──► Provider signals             │
//! │                                                                         │
//! │  ┌────────────────────┐   ┌────────────────────┐   ┌────────────────┐   │
//! │  │ boot               │   │ flush task         │   │ store watcher  │   │
//! │  │ store.list() →     │   │ every FLUSH_EVERY: │   │ external edits │   │
//! │  │ provider.load()    │   │ purge deleted      │   │ → load/update/ │   │
//! │  │                    │   │                    │   │   UserDelete   │   │
//! │  └────────────────────┘   └────────────────────┘   └────────────────┘   │
//! │                                                                         │
//! │  AppEvent ──► AppEventEmitter (embedder UI, logs, tests)                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use printlink_core::validation::validate_config;
use printlink_core::{CoreError, PrinterConfig, Rank, SignalKind};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::camera::CameraHandle;
use crate::config::ClientSettings;
use crate::connection::{Dialer, WsDialer};
use crate::error::{SyncError, SyncResult};
use crate::handler::HandlerFactory;
use crate::instance::InstanceConfig;
use crate::provider::{PrinterSnapshot, Provider, ProviderConfig};
use crate::store::{open_store, with_retry, ConfigStore, RetryPolicy, StoreEvent};

/// How often deleted records are purged.
const FLUSH_EVERY: Duration = Duration::from_secs(5);

// =============================================================================
// App Events
// =============================================================================

/// Notifications for the embedding program.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AppEvent {
    InstanceStarted {
        unique_id: Uuid,
    },
    InstanceStopped {
        unique_id: Uuid,
    },
    RankChanged {
        unique_id: Uuid,
        from: Rank,
        to: Rank,
    },
    /// Pairing finished; the printer has its permanent identity.
    Paired {
        unique_id: Uuid,
        identity: u64,
    },
    /// Code the user types into the dashboard to claim the printer.
    SetupCode {
        unique_id: Uuid,
        short_id: String,
    },
    IdentityConflict {
        unique_id: Uuid,
        identity: u64,
        owner: Uuid,
    },
    /// A store call kept failing after retries.
    StoreFailure {
        unique_id: Option<Uuid>,
        error: String,
    },
}

/// Receives [`AppEvent`]s. Called from slot tasks; must not block.
pub trait AppEventEmitter: Send + Sync {
    fn emit(&self, event: &AppEvent);
}

/// Drops every event.
pub struct NoOpEmitter;

impl AppEventEmitter for NoOpEmitter {
    fn emit(&self, _event: &AppEvent) {}
}

/// Forwards events into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelEmitter {
    tx: mpsc::UnboundedSender<AppEvent>,
}

impl ChannelEmitter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AppEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ChannelEmitter { tx }, rx)
    }
}

impl AppEventEmitter for ChannelEmitter {
    fn emit(&self, event: &AppEvent) {
        let _ = self.tx.send(event.clone());
    }
}

// =============================================================================
// Client App
// =============================================================================

pub struct ClientApp {
    settings: Arc<ClientSettings>,
    provider: Provider,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl ClientApp {
    pub fn builder(settings: ClientSettings) -> ClientAppBuilder {
        ClientAppBuilder::new(settings)
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn provider(&self) -> &Provider {
        &self.provider
    }

    /// User add.
    pub async fn add(&self, config: PrinterConfig) -> SyncResult<PrinterSnapshot> {
        info!(printer = %config.label(), "Adding printer");
        validate_config(&config).map_err(CoreError::from)?;
        self.provider.admit(config).await
    }

    /// User delete. The record is purged on the next flush.
    ///
    /// Fails with [`SyncError::InvalidState`] when a latch suppressed the
    /// delete: the record was revoked by the control-plane or is already
    /// deleted.
    pub async fn remove(&self, unique_id: Uuid) -> SyncResult<()> {
        info!(%unique_id, "Removing printer");
        let transition = self
            .provider
            .evict(unique_id, SignalKind::UserDelete)
            .await?;
        if !transition.applied {
            warn!(%unique_id, rank = %transition.to, "Delete refused");
            return Err(SyncError::InvalidState(format!(
                "printer {unique_id} is {} and cannot be deleted",
                transition.to
            )));
        }
        Ok(())
    }

    pub async fn update(&self, config: PrinterConfig) -> SyncResult<bool> {
        validate_config(&config).map_err(CoreError::from)?;
        self.provider.update(config).await
    }

    /// Physical-layer reachability of a device.
    pub async fn set_reachable(&self, unique_id: Uuid, reachable: bool) -> SyncResult<Rank> {
        let signal = if reachable {
            SignalKind::ReachabilityGained
        } else {
            SignalKind::ReachabilityLost
        };
        Ok(self.provider.on_external_signal(unique_id, signal).await?.to)
    }

    /// Registers a found device without activating it.
    pub async fn discover(&self, config: PrinterConfig) -> SyncResult<PrinterSnapshot> {
        validate_config(&config).map_err(CoreError::from)?;
        self.provider.discover(config).await
    }

    pub async fn get(&self, unique_id: Uuid) -> SyncResult<PrinterSnapshot> {
        self.provider.get(unique_id).await
    }

    pub async fn snapshot(&self) -> Vec<PrinterSnapshot> {
        self.provider.snapshot().await
    }

    /// Purges deleted records now.
    pub async fn flush(&self) -> usize {
        self.provider.flush().await
    }

    /// Stops housekeeping and every slot.
    pub async fn shutdown(self) {
        info!(client = %self.settings.client.name, "Shutting down client");
        self.shutdown_tx.send_replace(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        self.provider.flush().await;
        self.provider.shutdown().await;
        info!("Client stopped");
    }

    // =========================================================================
    // Background Tasks
    // =========================================================================

    async fn boot(provider: &Provider, retry: RetryPolicy) -> SyncResult<usize> {
        let store = provider.store().clone();
        let records = with_retry("list", retry, || store.list()).await?;
        let mut loaded = 0;

        for record in records {
            let unique_id = record.unique_id();
            match provider.load(record).await {
                Ok(snapshot) => {
                    debug!(%unique_id, rank = %snapshot.rank, running = snapshot.running, "Booted record");
                    loaded += 1;
                }
                Err(e) => warn!(%unique_id, error = %e, "Could not load record"),
            }
        }
        Ok(loaded)
    }

    async fn run_flush(provider: Provider, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = interval(FLUSH_EVERY);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let purged = provider.flush().await;
                    if purged > 0 {
                        debug!(purged, "Flush purged records");
                    }
                }
                _ = shutdown_rx.changed() => break,
            }
        }
    }

    async fn run_store_watch(
        provider: Provider,
        mut events: broadcast::Receiver<StoreEvent>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            let event = tokio::select! {
                event = events.recv() => event,
                _ = shutdown_rx.changed() => break,
            };

            match event {
                Ok(StoreEvent::Upserted(unique_id)) => {
                    Self::on_store_upsert(&provider, unique_id).await;
                }
                Ok(StoreEvent::Deleted(unique_id)) => {
                    if provider.contains(unique_id).await {
                        info!(%unique_id, "Record deleted outside the runtime");
                        if let Err(e) = provider
                            .on_external_signal(unique_id, SignalKind::UserDelete)
                            .await
                        {
                            warn!(%unique_id, error = %e, "Could not apply external delete");
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "Store watcher lagged, rescanning");
                    match provider.store().list().await {
                        Ok(records) => {
                            for record in records {
                                Self::on_store_upsert(&provider, record.unique_id()).await;
                            }
                        }
                        Err(e) => error!(error = %e, "Store rescan failed"),
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    async fn on_store_upsert(provider: &Provider, unique_id: Uuid) {
        let stored = match provider.store().get(unique_id).await {
            Ok(Some(stored)) => stored,
            Ok(None) => return,
            Err(e) => {
                warn!(%unique_id, error = %e, "Could not read changed record");
                return;
            }
        };

        let result = if provider.contains(unique_id).await {
            provider.update(stored.config).await.map(|_| ())
        } else if stored.rank == Rank::Deleted {
            debug!(%unique_id, "Ignoring tombstone awaiting purge");
            return;
        } else {
            info!(%unique_id, "Record added outside the runtime");
            provider.load(stored).await.map(|_| ())
        };
        if let Err(e) = result {
            debug!(%unique_id, error = %e, "Store change not applied");
        }
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`ClientApp`].
pub struct ClientAppBuilder {
    settings: ClientSettings,
    store: Option<Arc<dyn ConfigStore>>,
    factory: Option<Arc<dyn HandlerFactory>>,
    dialer: Option<Arc<dyn Dialer>>,
    emitter: Option<Arc<dyn AppEventEmitter>>,
    camera: Option<CameraHandle>,
}

impl ClientAppBuilder {
    pub fn new(settings: ClientSettings) -> Self {
        ClientAppBuilder {
            settings,
            store: None,
            factory: None,
            dialer: None,
            emitter: None,
            camera: None,
        }
    }

    /// Defaults to the store selected in settings.
    pub fn with_store(mut self, store: Arc<dyn ConfigStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_handler_factory(mut self, factory: Arc<dyn HandlerFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Defaults to [`WsDialer`].
    pub fn with_dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = Some(dialer);
        self
    }

    pub fn with_emitter(mut self, emitter: Arc<dyn AppEventEmitter>) -> Self {
        self.emitter = Some(emitter);
        self
    }

    pub fn with_camera(mut self, camera: CameraHandle) -> Self {
        self.camera = Some(camera);
        self
    }

    /// Validates settings, loads stored records and starts housekeeping.
    pub async fn start(self) -> SyncResult<ClientApp> {
        self.settings.validate()?;

        let factory = self
            .factory
            .ok_or_else(|| SyncError::InvalidConfig("Handler factory required".into()))?;
        let store = match self.store {
            Some(store) => store,
            None => open_store(&self.settings).await?,
        };
        let dialer = self.dialer.unwrap_or_else(|| Arc::new(WsDialer));
        let emitter = self.emitter.unwrap_or_else(|| Arc::new(NoOpEmitter));

        let mut instance = InstanceConfig::new(self.settings.connection_config(), dialer)
            .with_tick_timeout(self.settings.tick_timeout());
        if let Some(camera) = self.camera {
            instance = instance.with_camera(camera);
        }

        let mut provider_config = ProviderConfig::new(instance);
        provider_config.tick_rate = self.settings.tick_rate();
        provider_config.allow_setup = self.settings.client.allow_setup;
        let retry = provider_config.retry;

        info!(
            client = %self.settings.client.name,
            url = %self.settings.connection.ws_url,
            store = %self.settings.store.kind,
            "Starting client"
        );

        let provider = Provider::new(provider_config, store.clone(), factory, emitter);

        // Subscribed before booting so no change slips between list and watch.
        let store_events = store.subscribe();
        let loaded = ClientApp::boot(&provider, retry).await?;
        info!(loaded, "Stored records loaded");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = vec![
            tokio::spawn(ClientApp::run_flush(provider.clone(), shutdown_rx.clone())),
            tokio::spawn(ClientApp::run_store_watch(
                provider.clone(),
                store_events,
                shutdown_rx,
            )),
        ];

        Ok(ClientApp {
            settings: Arc::new(self.settings),
            provider,
            shutdown_tx,
            tasks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreKind;
    use crate::connection::testing::{pair, MockServer};
    use crate::handler::{NoOpHandler, PrinterHandler};
    use crate::store::MemoryConfigStore;
    use printlink_core::StoredRecord;

    fn factory() -> Arc<dyn HandlerFactory> {
        Arc::new(|_: &PrinterConfig| -> Box<dyn PrinterHandler> { Box::new(NoOpHandler) })
    }

    async fn start(store: Arc<MemoryConfigStore>) -> (ClientApp, MockServer, mpsc::UnboundedReceiver<AppEvent>) {
        let mut settings = ClientSettings::default();
        settings.store.kind = StoreKind::Memory;
        let (dialer, server) = pair();
        let (emitter, events) = ChannelEmitter::new();

        let app = ClientApp::builder(settings)
            .with_store(store)
            .with_handler_factory(factory())
            .with_dialer(dialer)
            .with_emitter(Arc::new(emitter))
            .start()
            .await
            .unwrap();
        (app, server, events)
    }

    #[tokio::test]
    async fn test_boot_loads_stored_records() {
        tokio::time::pause();
        let store = Arc::new(MemoryConfigStore::new());
        let active = StoredRecord::new(PrinterConfig::new().with_credentials(1, "a"), Rank::Active);
        let pending = StoredRecord::new(PrinterConfig::new(), Rank::Invalid);
        store.upsert(&active).await.unwrap();
        store.upsert(&pending).await.unwrap();

        let (app, mut server, _events) = start(store).await;
        assert_eq!(app.snapshot().await.len(), 2);
        assert!(app.get(active.unique_id()).await.unwrap().running);
        assert!(!app.get(pending.unique_id()).await.unwrap().running);

        let peer = server.accept().await.unwrap();
        assert_eq!(peer.query("id").as_deref(), Some("1"));
        app.shutdown().await;
    }

    #[tokio::test]
    async fn test_crud_surface() {
        tokio::time::pause();
        let store = Arc::new(MemoryConfigStore::new());
        let (app, _server, mut events) = start(store.clone()).await;

        let config = PrinterConfig::new().with_name("mk4").with_credentials(21, "tok");
        let id = config.unique_id;
        let snapshot = app.add(config.clone()).await.unwrap();
        assert_eq!(snapshot.rank, Rank::Active);
        assert_eq!(
            events.recv().await.unwrap(),
            AppEvent::RankChanged {
                unique_id: id,
                from: Rank::Pending,
                to: Rank::Active,
            }
        );
        assert_eq!(events.recv().await.unwrap(), AppEvent::InstanceStarted { unique_id: id });

        assert_eq!(app.set_reachable(id, false).await.unwrap(), Rank::Pending);
        assert_eq!(app.set_reachable(id, true).await.unwrap(), Rank::Active);

        let mut edited = config;
        edited.device_url = Some("http://mk4.local".into());
        assert!(app.update(edited).await.unwrap());

        app.remove(id).await.unwrap();
        assert_eq!(app.get(id).await.unwrap().rank, Rank::Deleted);

        app.flush().await;
        assert!(store.get(id).await.unwrap().is_none());
        assert!(app.snapshot().await.is_empty());
        app.shutdown().await;
    }

    #[tokio::test]
    async fn test_remove_of_revoked_record_is_refused() {
        tokio::time::pause();
        let store = Arc::new(MemoryConfigStore::new());
        let (app, _server, _events) = start(store.clone()).await;

        let config = PrinterConfig::new().with_credentials(31, "tok");
        let id = config.unique_id;
        app.add(config).await.unwrap();
        app.provider()
            .evict(id, SignalKind::RemoteRevoked)
            .await
            .unwrap();

        let err = app.remove(id).await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidState(_)));
        assert_eq!(app.get(id).await.unwrap().rank, Rank::Invalid);

        app.flush().await;
        assert_eq!(store.get(id).await.unwrap().unwrap().rank, Rank::Invalid);

        // Deleting twice fails too, whether or not the flush task purged it.
        let other = PrinterConfig::new().with_credentials(32, "tok");
        let other_id = other.unique_id;
        app.add(other).await.unwrap();
        app.remove(other_id).await.unwrap();
        assert!(app.remove(other_id).await.is_err());
        app.shutdown().await;
    }

    #[tokio::test]
    async fn test_tombstone_upsert_is_not_loaded() {
        tokio::time::pause();
        let store = Arc::new(MemoryConfigStore::new());
        let (app, _server, _events) = start(store.clone()).await;

        let tombstone = StoredRecord::new(PrinterConfig::new().with_name("gone"), Rank::Deleted);
        let id = tombstone.unique_id();
        store.upsert(&tombstone).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(app.get(id).await.is_err());
        app.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_config_is_refused() {
        tokio::time::pause();
        let store = Arc::new(MemoryConfigStore::new());
        let (app, _server, _events) = start(store.clone()).await;

        let config = PrinterConfig::new().with_device_url("octopi.local");
        let id = config.unique_id;
        let err = app.add(config).await.unwrap_err();
        assert!(matches!(err, SyncError::Session(_)));
        assert!(app.get(id).await.is_err());
        assert!(store.get(id).await.unwrap().is_none());
        app.shutdown().await;
    }

    #[tokio::test]
    async fn test_external_store_changes_are_followed() {
        tokio::time::pause();
        let store = Arc::new(MemoryConfigStore::new());
        let (app, _server, _events) = start(store.clone()).await;

        let record = StoredRecord::new(PrinterConfig::new().with_credentials(4, "t"), Rank::Active);
        let id = record.unique_id();
        store.upsert(&record).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(app.get(id).await.unwrap().running);

        store.delete(id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(app.get(id).await.unwrap().rank, Rank::Deleted);
        app.shutdown().await;
    }

    #[tokio::test]
    async fn test_builder_requires_factory() {
        let mut settings = ClientSettings::default();
        settings.store.kind = StoreKind::Memory;
        let err = ClientApp::builder(settings).start().await.err().unwrap();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_app_event_serializes_tagged() {
        let id = Uuid::nil();
        let json = serde_json::to_value(AppEvent::RankChanged {
            unique_id: id,
            from: Rank::Pending,
            to: Rank::Active,
        })
        .unwrap();
        assert_eq!(json["type"], "rank_changed");
        assert_eq!(json["to"], "active");
    }
}
