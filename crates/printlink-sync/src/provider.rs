//! # Provider
//!
//! Maps records to at most one running [`Instance`] and owns every record's
//! rank.
//!
//! ## Slots
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              Provider                                   │
//! │                                                                         │
//! │   slots: RwLock<HashMap<Uuid, SlotHandle>>                              │
//! │                                                                         │
//! │   admit / evict / on_external_signal / update / snapshot                │
//! │        │                                                                │
//! │        ▼ SlotCommand (mpsc, answered over oneshot)                      │
//! │   ┌───────────────────────┐  ┌───────────────────────┐                  │
//! │   │ slot task (uuid A)    │  │ slot task (uuid B)    │   ...            │
//! │   │  RankState            │  │  RankState            │                  │
//! │   │  Parked(record) or    │  │  Parked(record) or    │                  │
//! │   │  Running(Instance)    │  │  Running(Instance)    │                  │
//! │   │  tick interval        │  │  tick interval        │                  │
//! │   └───────────────────────┘  └───────────────────────┘                  │
//! │                                                                         │
//! │   identities: Mutex<HashMap<u64, Uuid>>  (claimed by running slots)    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Signals for one record are applied strictly in order by its slot task.
//! Different records proceed concurrently. A slot is the only writer of its
//! record's rank and the only owner of its Instance, so no lock guards either.
//!
//! ## Reconciliation
//! After every applied signal the slot compares rank with occupancy:
//! `active` and parked starts an Instance; anything else while running stops
//! it. Rank changes are persisted; `deleted` records are purged by
//! [`Provider::flush`].

use printlink_core::{
    PrinterConfig, Rank, RankState, RankTransition, SessionRecord, SignalKind, StoredRecord,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::app::{AppEvent, AppEventEmitter};
use crate::connection::ConnectionState;
use crate::error::{SyncError, SyncResult};
use crate::handler::HandlerFactory;
use crate::instance::{Instance, InstanceConfig};
use crate::store::{with_retry, ConfigStore, RetryPolicy};

// =============================================================================
// Configuration & Snapshot
// =============================================================================

#[derive(Clone)]
pub struct ProviderConfig {
    pub instance: InstanceConfig,
    /// Cadence of every slot's `Instance::tick`.
    pub tick_rate: Duration,
    /// Whether records without a credential may connect to pair.
    pub allow_setup: bool,
    pub retry: RetryPolicy,
}

impl ProviderConfig {
    pub fn new(instance: InstanceConfig) -> Self {
        ProviderConfig {
            instance,
            tick_rate: Duration::from_millis(250),
            allow_setup: true,
            retry: RetryPolicy::default(),
        }
    }
}

/// Point-in-time view of one record.
#[derive(Debug, Clone, PartialEq)]
pub struct PrinterSnapshot {
    pub unique_id: Uuid,
    pub identity: Option<u64>,
    pub label: String,
    pub rank: Rank,
    pub latch: Option<SignalKind>,
    pub running: bool,
    pub connection: ConnectionState,
    pub version: Option<u64>,
    pub config: PrinterConfig,
}

// =============================================================================
// Slot Plumbing
// =============================================================================

enum SlotCommand {
    Signal {
        signal: SignalKind,
        reply: oneshot::Sender<RankTransition>,
    },
    Update {
        config: PrinterConfig,
        reply: oneshot::Sender<bool>,
    },
    Snapshot {
        reply: oneshot::Sender<PrinterSnapshot>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

struct SlotHandle {
    tx: mpsc::Sender<SlotCommand>,
    task: JoinHandle<()>,
}

impl SlotHandle {
    async fn shutdown(self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(SlotCommand::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
        if let Err(e) = self.task.await {
            warn!(error = %e, "Slot task ended abnormally");
        }
    }
}

/// What every slot shares.
struct SlotDeps {
    store: Arc<dyn ConfigStore>,
    factory: Arc<dyn HandlerFactory>,
    emitter: Arc<dyn AppEventEmitter>,
    config: ProviderConfig,
    identities: Mutex<HashMap<u64, Uuid>>,
}

impl SlotDeps {
    /// Claims `identity` for `unique_id`. Returns the other owner on conflict.
    async fn claim(&self, identity: u64, unique_id: Uuid) -> Result<(), Uuid> {
        let mut identities = self.identities.lock().await;
        match identities.get(&identity) {
            Some(owner) if *owner != unique_id => Err(*owner),
            _ => {
                identities.insert(identity, unique_id);
                Ok(())
            }
        }
    }

    async fn release(&self, identity: u64, unique_id: Uuid) {
        let mut identities = self.identities.lock().await;
        if identities.get(&identity) == Some(&unique_id) {
            identities.remove(&identity);
        }
    }

    async fn owner(&self, identity: u64) -> Option<Uuid> {
        self.identities.lock().await.get(&identity).copied()
    }
}

// =============================================================================
// Provider
// =============================================================================

/// Cloneable handle to the slot registry.
#[derive(Clone)]
pub struct Provider {
    slots: Arc<RwLock<HashMap<Uuid, SlotHandle>>>,
    deps: Arc<SlotDeps>,
}

impl Provider {
    pub fn new(
        config: ProviderConfig,
        store: Arc<dyn ConfigStore>,
        factory: Arc<dyn HandlerFactory>,
        emitter: Arc<dyn AppEventEmitter>,
    ) -> Self {
        Provider {
            slots: Arc::new(RwLock::new(HashMap::new())),
            deps: Arc::new(SlotDeps {
                store,
                factory,
                emitter,
                config,
                identities: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn ConfigStore> {
        &self.deps.store
    }

    pub async fn contains(&self, unique_id: Uuid) -> bool {
        self.slots.read().await.contains_key(&unique_id)
    }

    pub async fn len(&self) -> usize {
        self.slots.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    // =========================================================================
    // Record Entry Points
    // =========================================================================

    /// Takes over a record loaded from the store, keeping its stored rank.
    pub async fn load(&self, stored: StoredRecord) -> SyncResult<PrinterSnapshot> {
        let unique_id = stored.unique_id();
        let rank = RankState::restore(stored.rank, stored.wanted);
        let inserted = self
            .insert_slot(SessionRecord::new(stored.config), rank)
            .await;
        if !inserted {
            return Err(SyncError::InvalidState(format!(
                "record {unique_id} already loaded"
            )));
        }
        debug!(%unique_id, rank = %stored.rank, "Record loaded");

        // Reconciles the restored rank (may start the Instance).
        self.on_external_signal(unique_id, SignalKind::UserUpdate)
            .await?;
        self.get(unique_id).await
    }

    /// Registers a record the physical layer found. It stays `pending` until
    /// the user adds it.
    pub async fn discover(&self, config: PrinterConfig) -> SyncResult<PrinterSnapshot> {
        let unique_id = config.unique_id;
        if self
            .insert_slot(SessionRecord::new(config), RankState::new())
            .await
        {
            let snapshot = self.get(unique_id).await?;
            let stored = StoredRecord::new(snapshot.config.clone(), snapshot.rank);
            self.persist_from_outside(stored).await;
            Ok(snapshot)
        } else {
            self.get(unique_id).await
        }
    }

    /// User add: creates the record if needed and activates it.
    ///
    /// Refused when another live record already claims the same identity.
    pub async fn admit(&self, config: PrinterConfig) -> SyncResult<PrinterSnapshot> {
        let unique_id = config.unique_id;

        if let Some(identity) = config.identity() {
            if let Some(owner) = self.deps.owner(identity).await {
                if owner != unique_id {
                    warn!(%unique_id, identity, %owner, "Identity already claimed");
                    self.deps.emitter.emit(&AppEvent::IdentityConflict {
                        unique_id,
                        identity,
                        owner,
                    });
                    return Err(SyncError::IdentityClaimed { identity, owner });
                }
            }
        }

        let created = self
            .insert_slot(SessionRecord::new(config.clone()), RankState::new())
            .await;
        if !created {
            self.update(config).await?;
        }

        self.on_external_signal(unique_id, SignalKind::UserAdd).await?;
        self.get(unique_id).await
    }

    /// Deactivates a record. `reason` decides whether it is kept for a retry
    /// (reachability loss, revocation) or deleted (user removal).
    pub async fn evict(&self, unique_id: Uuid, reason: SignalKind) -> SyncResult<RankTransition> {
        if !matches!(
            reason,
            SignalKind::ReachabilityLost | SignalKind::RemoteRevoked | SignalKind::UserDelete
        ) {
            return Err(SyncError::InvalidState(format!(
                "{reason} does not evict a record"
            )));
        }
        self.on_external_signal(unique_id, reason).await
    }

    /// Queues `signal` on the record's slot and waits until it was applied.
    pub async fn on_external_signal(
        &self,
        unique_id: Uuid,
        signal: SignalKind,
    ) -> SyncResult<RankTransition> {
        let (reply, rx) = oneshot::channel();
        self.send(unique_id, SlotCommand::Signal { signal, reply })
            .await?;
        rx.await.map_err(|_| SyncError::ShuttingDown)
    }

    /// Copies user-editable fields into the record and persists them.
    pub async fn update(&self, config: PrinterConfig) -> SyncResult<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(config.unique_id, SlotCommand::Update { config, reply })
            .await?;
        rx.await.map_err(|_| SyncError::ShuttingDown)
    }

    pub async fn get(&self, unique_id: Uuid) -> SyncResult<PrinterSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.send(unique_id, SlotCommand::Snapshot { reply }).await?;
        rx.await.map_err(|_| SyncError::ShuttingDown)
    }

    /// Every record, in no particular order.
    pub async fn snapshot(&self) -> Vec<PrinterSnapshot> {
        let ids: Vec<Uuid> = self.slots.read().await.keys().copied().collect();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Ok(snapshot) = self.get(id).await {
                out.push(snapshot);
            }
        }
        out
    }

    /// Purges `deleted` records from the store, then from the registry.
    ///
    /// A record whose delete fails keeps its slot, so the next flush tries
    /// again.
    pub async fn flush(&self) -> usize {
        let mut purged = 0;

        for snapshot in self.snapshot().await {
            if snapshot.rank != Rank::Deleted {
                continue;
            }
            let unique_id = snapshot.unique_id;

            let store = self.deps.store.clone();
            if let Err(e) =
                with_retry("delete", self.deps.config.retry, || store.delete(unique_id)).await
            {
                error!(%unique_id, error = %e, "Could not purge deleted record");
                self.deps.emitter.emit(&AppEvent::StoreFailure {
                    unique_id: Some(unique_id),
                    error: e.to_string(),
                });
                continue;
            }

            let slot = self.slots.write().await.remove(&unique_id);
            if let Some(slot) = slot {
                slot.shutdown().await;
            }
            info!(%unique_id, "Deleted record purged");
            purged += 1;
        }

        purged
    }

    /// Stops every slot. Ranks are left as they are.
    pub async fn shutdown(&self) {
        let slots: Vec<SlotHandle> = self.slots.write().await.drain().map(|(_, s)| s).collect();
        info!(count = slots.len(), "Stopping provider slots");
        for slot in slots {
            slot.shutdown().await;
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Spawns a slot unless one exists. Returns whether it was created.
    async fn insert_slot(&self, record: SessionRecord, rank: RankState) -> bool {
        let unique_id = record.unique_id();
        let mut slots = self.slots.write().await;
        if slots.contains_key(&unique_id) {
            return false;
        }

        let (tx, rx) = mpsc::channel(32);
        let slot = Slot {
            unique_id,
            rank,
            occupant: Occupant::Parked(record),
            deps: self.deps.clone(),
            rx,
        };
        let task = tokio::spawn(slot.run());
        slots.insert(unique_id, SlotHandle { tx, task });
        true
    }

    async fn send(&self, unique_id: Uuid, command: SlotCommand) -> SyncResult<()> {
        let tx = self
            .slots
            .read()
            .await
            .get(&unique_id)
            .map(|s| s.tx.clone())
            .ok_or(SyncError::RecordNotFound(unique_id))?;
        tx.send(command).await.map_err(|_| SyncError::ShuttingDown)
    }

    async fn persist_from_outside(&self, stored: StoredRecord) {
        let store = self.deps.store.clone();
        if let Err(e) = with_retry("upsert", self.deps.config.retry, || store.upsert(&stored)).await {
            error!(unique_id = %stored.unique_id(), error = %e, "Could not persist record");
            self.deps.emitter.emit(&AppEvent::StoreFailure {
                unique_id: Some(stored.unique_id()),
                error: e.to_string(),
            });
        }
    }
}

// =============================================================================
// Slot Task
// =============================================================================

enum Occupant {
    Parked(SessionRecord),
    Running(Box<Instance>),
    /// Only while moving between the other two.
    Vacant,
}

struct Slot {
    unique_id: Uuid,
    rank: RankState,
    occupant: Occupant,
    deps: Arc<SlotDeps>,
    rx: mpsc::Receiver<SlotCommand>,
}

impl Slot {
    async fn run(mut self) {
        let mut ticker = interval(self.deps.config.tick_rate);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let running = matches!(self.occupant, Occupant::Running(_));
            tokio::select! {
                command = self.rx.recv() => match command {
                    Some(SlotCommand::Shutdown { reply }) => {
                        self.park().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle(command).await,
                    None => {
                        self.park().await;
                        break;
                    }
                },
                _ = ticker.tick(), if running => self.tick().await,
            }
        }

        debug!(unique_id = %self.unique_id, "Slot stopped");
    }

    async fn handle(&mut self, command: SlotCommand) {
        match command {
            SlotCommand::Signal { signal, reply } => {
                let transition = self.apply_signal(signal).await;
                let _ = reply.send(transition);
            }
            SlotCommand::Update { config, reply } => {
                let changed = self.update(&config).await;
                let _ = reply.send(changed);
            }
            SlotCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            SlotCommand::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn record(&self) -> Option<&SessionRecord> {
        match &self.occupant {
            Occupant::Parked(record) => Some(record),
            Occupant::Running(instance) => Some(instance.record()),
            Occupant::Vacant => None,
        }
    }

    fn label(&self) -> String {
        self.record()
            .map(|r| r.config.label())
            .unwrap_or_else(|| self.unique_id.to_string())
    }

    fn snapshot(&self) -> PrinterSnapshot {
        let config = self
            .record()
            .map(|r| r.config.clone())
            .unwrap_or_default();
        let (running, connection, version) = match &self.occupant {
            Occupant::Running(instance) => (true, instance.connection_state(), instance.version()),
            _ => (false, ConnectionState::Disconnected, None),
        };

        PrinterSnapshot {
            unique_id: self.unique_id,
            identity: config.identity(),
            label: self.label(),
            rank: self.rank.rank(),
            latch: self.rank.latch(),
            running,
            connection,
            version,
            config,
        }
    }

    // =========================================================================
    // Rank
    // =========================================================================

    async fn apply_signal(&mut self, signal: SignalKind) -> RankTransition {
        let transition = self.rank.apply(signal);
        if !transition.applied {
            debug!(
                unique_id = %self.unique_id,
                %signal,
                latch = ?self.rank.latch(),
                "Signal suppressed by latch"
            );
            return transition;
        }

        if transition.changed() {
            info!(
                printer = %self.label(),
                %signal,
                from = %transition.from,
                to = %transition.to,
                "Rank changed"
            );
            self.deps.emitter.emit(&AppEvent::RankChanged {
                unique_id: self.unique_id,
                from: transition.from,
                to: transition.to,
            });
        }

        self.reconcile().await;

        if transition.changed() || signal == SignalKind::UserAdd {
            self.persist().await;
        }
        transition
    }

    async fn reconcile(&mut self) {
        let active = self.rank.rank() == Rank::Active;
        match (&self.occupant, active) {
            (Occupant::Parked(_), true) => self.start().await,
            (Occupant::Running(_), false) => self.park().await,
            _ => {}
        }
    }

    async fn update(&mut self, config: &PrinterConfig) -> bool {
        if self.rank.rank() == Rank::Deleted {
            debug!(unique_id = %self.unique_id, "Ignoring update of deleted record");
            return false;
        }

        let changed = match &mut self.occupant {
            Occupant::Parked(record) => record.config.merge_user_fields(config),
            Occupant::Running(instance) => instance.update_config(config),
            Occupant::Vacant => false,
        };
        if changed {
            self.persist().await;
        }
        self.apply_signal(SignalKind::UserUpdate).await;
        changed
    }

    // =========================================================================
    // Occupancy
    // =========================================================================

    async fn start(&mut self) {
        let Occupant::Parked(record) = std::mem::replace(&mut self.occupant, Occupant::Vacant) else {
            return;
        };

        if !self.deps.config.allow_setup && !record.config.has_credentials() {
            debug!(printer = %record.config.label(), "Pairing disabled, record stays parked");
            self.occupant = Occupant::Parked(record);
            return;
        }

        if let Some(identity) = record.identity() {
            if let Err(owner) = self.deps.claim(identity, self.unique_id).await {
                warn!(printer = %record.config.label(), identity, %owner, "Identity already claimed");
                self.deps.emitter.emit(&AppEvent::IdentityConflict {
                    unique_id: self.unique_id,
                    identity,
                    owner,
                });
                self.occupant = Occupant::Parked(record);
                return;
            }
        }

        let handler = self.deps.factory.create(&record.config);
        let mut instance = Instance::new(record, handler, self.deps.config.instance.clone());
        match instance.start() {
            Ok(()) => {
                self.deps.emitter.emit(&AppEvent::InstanceStarted {
                    unique_id: self.unique_id,
                });
                self.occupant = Occupant::Running(Box::new(instance));
            }
            Err(e) => {
                warn!(unique_id = %self.unique_id, error = %e, "Instance failed to start");
                let record = instance.into_record();
                if let Some(identity) = record.identity() {
                    self.deps.release(identity, self.unique_id).await;
                }
                self.occupant = Occupant::Parked(record);
            }
        }
    }

    async fn park(&mut self) {
        let Occupant::Running(mut instance) = std::mem::replace(&mut self.occupant, Occupant::Vacant)
        else {
            return;
        };

        instance.stop().await;
        let record = instance.into_record();
        if let Some(identity) = record.identity() {
            self.deps.release(identity, self.unique_id).await;
        }
        self.occupant = Occupant::Parked(record);
        self.deps.emitter.emit(&AppEvent::InstanceStopped {
            unique_id: self.unique_id,
        });
    }

    async fn tick(&mut self) {
        let Occupant::Running(instance) = &mut self.occupant else {
            return;
        };

        let before = instance.record().config.clone();
        let outcome = match instance.tick().await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(unique_id = %self.unique_id, error = %e, "Tick failed");
                return;
            }
        };
        let after = instance.record().config.clone();

        let mut signals = outcome.signals;
        if outcome.config_changed {
            if let (None, Some(identity)) = (before.identity(), after.identity()) {
                match self.deps.claim(identity, self.unique_id).await {
                    Ok(()) => {
                        info!(printer = %after.label(), identity, "Printer paired");
                        self.deps.emitter.emit(&AppEvent::Paired {
                            unique_id: self.unique_id,
                            identity,
                        });
                    }
                    Err(owner) => {
                        warn!(identity, %owner, "Paired identity belongs to another record");
                        self.deps.emitter.emit(&AppEvent::IdentityConflict {
                            unique_id: self.unique_id,
                            identity,
                            owner,
                        });
                        signals.push(SignalKind::RemoteRevoked);
                    }
                }
            }
            if after.in_setup && after.short_id != before.short_id {
                if let Some(short_id) = after.short_id.clone() {
                    self.deps.emitter.emit(&AppEvent::SetupCode {
                        unique_id: self.unique_id,
                        short_id,
                    });
                }
            }
            self.persist().await;
        }

        for signal in signals {
            self.apply_signal(signal).await;
        }
    }

    async fn persist(&mut self) {
        let Some(record) = self.record() else {
            return;
        };
        let stored = StoredRecord::new(record.config.clone(), self.rank.rank())
            .with_wanted(self.rank.is_wanted());
        let store = self.deps.store.clone();

        if let Err(e) = with_retry("upsert", self.deps.config.retry, || store.upsert(&stored)).await {
            error!(unique_id = %self.unique_id, error = %e, "Could not persist record");
            self.deps.emitter.emit(&AppEvent::StoreFailure {
                unique_id: Some(self.unique_id),
                error: e.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::ChannelEmitter;
    use crate::connection::testing::{pair, MockServer};
    use crate::connection::ConnectionConfig;
    use crate::handler::{NoOpHandler, PrinterHandler};
    use crate::protocol::ServerMessage;
    use crate::store::MemoryConfigStore;

    struct Harness {
        provider: Provider,
        server: MockServer,
        store: Arc<MemoryConfigStore>,
        events: mpsc::UnboundedReceiver<AppEvent>,
    }

    impl Harness {
        fn new() -> Self {
            let (dialer, server) = pair();
            let store = Arc::new(MemoryConfigStore::new());
            let (emitter, events) = ChannelEmitter::new();
            let factory = |_: &PrinterConfig| -> Box<dyn PrinterHandler> { Box::new(NoOpHandler) };

            let instance = InstanceConfig::new(ConnectionConfig::default(), dialer);
            let provider = Provider::new(
                ProviderConfig::new(instance),
                store.clone(),
                Arc::new(factory),
                Arc::new(emitter),
            );
            Harness {
                provider,
                server,
                store,
                events,
            }
        }

        fn drain_events(&mut self) -> Vec<AppEvent> {
            let mut out = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                out.push(event);
            }
            out
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(600)).await;
    }

    #[tokio::test]
    async fn test_pending_record_has_no_instance_until_added() {
        tokio::time::pause();
        let mut h = Harness::new();

        let config = PrinterConfig::new().with_name("voron");
        let snapshot = h.provider.discover(config.clone()).await.unwrap();
        assert_eq!(snapshot.rank, Rank::Pending);
        assert!(!snapshot.running);

        let snapshot = h.provider.admit(config.clone()).await.unwrap();
        assert_eq!(snapshot.rank, Rank::Active);
        assert!(snapshot.running);

        let mut peer = h.server.accept().await.unwrap();
        peer.send_message(&ServerMessage::NewToken {
            token: "tok-1".into(),
            short_id: Some("9ZZM".into()),
        });
        peer.send_message(&ServerMessage::Connected {
            in_setup: true,
            short_id: Some("9ZZM".into()),
            name: None,
            intervals: None,
        });
        settle().await;

        let stored = h.store.get(config.unique_id).await.unwrap().unwrap();
        assert_eq!(stored.config.token.as_deref(), Some("tok-1"));
        assert!(h.drain_events().contains(&AppEvent::SetupCode {
            unique_id: config.unique_id,
            short_id: "9ZZM".into(),
        }));

        peer.send_message(&ServerMessage::CompleteSetup { printer_id: 4242 });
        settle().await;

        let snapshot = h.provider.get(config.unique_id).await.unwrap();
        assert_eq!(snapshot.identity, Some(4242));
        assert_eq!(snapshot.rank, Rank::Active);
        assert!(h.drain_events().contains(&AppEvent::Paired {
            unique_id: config.unique_id,
            identity: 4242,
        }));
        let stored = h.store.get(config.unique_id).await.unwrap().unwrap();
        assert_eq!(stored.config.identity(), Some(4242));

        let kinds: Vec<String> = peer.drain_envelopes().into_iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&"temps".to_string()));
        assert!(kinds.contains(&"job_info".to_string()));

        h.provider.shutdown().await;
    }

    #[tokio::test]
    async fn test_revocation_stops_instance_until_reactivated() {
        tokio::time::pause();
        let mut h = Harness::new();

        let config = PrinterConfig::new().with_credentials(11, "tok");
        let id = config.unique_id;
        h.provider.admit(config.clone()).await.unwrap();

        let peer = h.server.accept().await.unwrap();
        peer.accept_registration();
        settle().await;
        peer.send_message(&ServerMessage::RemoveConnection { reason: None });
        settle().await;

        let snapshot = h.provider.get(id).await.unwrap();
        assert_eq!(snapshot.rank, Rank::Invalid);
        assert!(!snapshot.running);
        assert!(peer.is_closed());
        assert_eq!(h.store.get(id).await.unwrap().unwrap().rank, Rank::Invalid);

        let redial = tokio::time::timeout(Duration::from_secs(120), h.server.accept()).await;
        assert!(redial.is_err(), "revoked record must not reconnect");

        // Reachability changes stay below the revocation latch.
        let t = h
            .provider
            .on_external_signal(id, SignalKind::ReachabilityGained)
            .await
            .unwrap();
        assert!(!t.applied);

        let snapshot = h.provider.admit(config).await.unwrap();
        assert_eq!(snapshot.rank, Rank::Active);
        assert!(snapshot.running);
        assert!(h.server.accept().await.is_some());

        let events = h.drain_events();
        assert!(events.contains(&AppEvent::InstanceStopped { unique_id: id }));
        h.provider.shutdown().await;
    }

    #[tokio::test]
    async fn test_reachability_loss_after_delete_is_noop() {
        tokio::time::pause();
        let h = Harness::new();

        let config = PrinterConfig::new().with_credentials(5, "tok");
        let id = config.unique_id;
        h.provider.admit(config).await.unwrap();

        let t = h.provider.evict(id, SignalKind::UserDelete).await.unwrap();
        assert_eq!(t.to, Rank::Deleted);
        assert!(!h.provider.get(id).await.unwrap().running);

        let t = h
            .provider
            .on_external_signal(id, SignalKind::ReachabilityLost)
            .await
            .unwrap();
        assert!(!t.applied);
        assert_eq!(h.provider.get(id).await.unwrap().rank, Rank::Deleted);

        assert_eq!(h.provider.flush().await, 1);
        assert!(!h.provider.contains(id).await);
        assert!(h.store.get(id).await.unwrap().is_none());
        assert!(matches!(
            h.provider.get(id).await,
            Err(SyncError::RecordNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_reachability_toggles_instance() {
        tokio::time::pause();
        let mut h = Harness::new();

        let config = PrinterConfig::new().with_credentials(3, "tok");
        let id = config.unique_id;
        h.provider.admit(config).await.unwrap();
        let _first = h.server.accept().await.unwrap();

        let t = h.provider.evict(id, SignalKind::ReachabilityLost).await.unwrap();
        assert!(t.deactivated());
        assert!(!h.provider.get(id).await.unwrap().running);

        let t = h
            .provider
            .on_external_signal(id, SignalKind::ReachabilityGained)
            .await
            .unwrap();
        assert!(t.activated());
        assert!(h.provider.get(id).await.unwrap().running);
        assert!(h.server.accept().await.is_some());

        assert!(h.provider.evict(id, SignalKind::UserAdd).await.is_err());
        h.provider.shutdown().await;
    }

    #[tokio::test]
    async fn test_identity_claimed_by_live_record() {
        tokio::time::pause();
        let mut h = Harness::new();

        let first = PrinterConfig::new().with_credentials(7, "a");
        h.provider.admit(first.clone()).await.unwrap();

        let second = PrinterConfig::new().with_credentials(7, "b");
        let err = h.provider.admit(second.clone()).await.unwrap_err();
        assert!(matches!(err, SyncError::IdentityClaimed { identity: 7, owner } if owner == first.unique_id));
        assert!(!h.provider.contains(second.unique_id).await);
        assert!(h
            .drain_events()
            .iter()
            .any(|e| matches!(e, AppEvent::IdentityConflict { identity: 7, .. })));

        h.provider.shutdown().await;
    }

    #[tokio::test]
    async fn test_update_merges_user_fields() {
        tokio::time::pause();
        let h = Harness::new();

        let config = PrinterConfig::new().with_name("old").with_credentials(9, "tok");
        let id = config.unique_id;
        h.provider.admit(config.clone()).await.unwrap();

        let mut edited = config.clone();
        edited.name = Some("new".into());
        assert!(h.provider.update(edited.clone()).await.unwrap());
        assert!(!h.provider.update(edited).await.unwrap());

        let snapshot = h.provider.get(id).await.unwrap();
        assert_eq!(snapshot.label, "new");
        assert_eq!(snapshot.identity, Some(9));
        let stored = h.store.get(id).await.unwrap().unwrap();
        assert_eq!(stored.config.name.as_deref(), Some("new"));
        h.provider.shutdown().await;
    }

    #[tokio::test]
    async fn test_store_failure_is_surfaced() {
        tokio::time::pause();
        let mut h = Harness::new();
        h.store.inject_failures(100);

        let config = PrinterConfig::new().with_credentials(2, "tok");
        let snapshot = h.provider.admit(config.clone()).await.unwrap();
        assert!(snapshot.running);

        assert!(h.drain_events().iter().any(|e| matches!(
            e,
            AppEvent::StoreFailure { unique_id: Some(id), .. } if *id == config.unique_id
        )));
        h.store.inject_failures(0);
        h.provider.shutdown().await;
    }

    #[tokio::test]
    async fn test_load_restores_rank() {
        tokio::time::pause();
        let h = Harness::new();

        let active = StoredRecord::new(PrinterConfig::new().with_credentials(1, "a"), Rank::Active);
        let revoked = StoredRecord::new(PrinterConfig::new().with_credentials(2, "b"), Rank::Invalid);

        let a = h.provider.load(active.clone()).await.unwrap();
        assert!(a.running);
        let r = h.provider.load(revoked).await.unwrap();
        assert_eq!(r.rank, Rank::Invalid);
        assert!(!r.running);
        assert_eq!(r.latch, Some(SignalKind::RemoteRevoked));

        assert!(h.provider.load(active).await.is_err());
        assert_eq!(h.provider.len().await, 2);
        h.provider.shutdown().await;
        assert!(h.provider.is_empty().await);
    }

    #[tokio::test]
    async fn test_discovered_record_stays_parked_after_reload() {
        tokio::time::pause();
        let mut before = Harness::new();

        let found = PrinterConfig::new().with_name("found");
        before.provider.discover(found.clone()).await.unwrap();

        let added = PrinterConfig::new().with_credentials(8, "tok");
        before.provider.admit(added.clone()).await.unwrap();
        let _peer = before.server.accept().await.unwrap();
        before
            .provider
            .evict(added.unique_id, SignalKind::ReachabilityLost)
            .await
            .unwrap();
        before.provider.shutdown().await;

        let found_stored = before.store.get(found.unique_id).await.unwrap().unwrap();
        assert_eq!(found_stored.rank, Rank::Pending);
        assert!(!found_stored.wanted);
        let added_stored = before.store.get(added.unique_id).await.unwrap().unwrap();
        assert_eq!(added_stored.rank, Rank::Pending);
        assert!(added_stored.wanted);

        let mut after = Harness::new();
        let snapshot = after.provider.load(found_stored).await.unwrap();
        assert_eq!(snapshot.rank, Rank::Pending);
        assert!(!snapshot.running);
        let dial = tokio::time::timeout(Duration::from_secs(30), after.server.accept()).await;
        assert!(dial.is_err(), "discovered record must not connect");

        let snapshot = after.provider.load(added_stored).await.unwrap();
        assert_eq!(snapshot.rank, Rank::Active);
        assert!(snapshot.running);
        assert!(after.server.accept().await.is_some());
        after.provider.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_purge_is_retried_on_next_flush() {
        tokio::time::pause();
        let mut h = Harness::new();

        let config = PrinterConfig::new().with_credentials(6, "tok");
        let id = config.unique_id;
        h.provider.admit(config).await.unwrap();
        h.provider.evict(id, SignalKind::UserDelete).await.unwrap();
        assert_eq!(h.store.get(id).await.unwrap().unwrap().rank, Rank::Deleted);

        h.store.inject_failures(100);
        assert_eq!(h.provider.flush().await, 0);
        assert!(h.provider.contains(id).await);
        assert!(h
            .drain_events()
            .iter()
            .any(|e| matches!(e, AppEvent::StoreFailure { unique_id: Some(u), .. } if *u == id)));

        h.store.inject_failures(0);
        assert_eq!(h.provider.flush().await, 1);
        assert!(!h.provider.contains(id).await);
        assert!(h.store.get(id).await.unwrap().is_none());
    }
}
