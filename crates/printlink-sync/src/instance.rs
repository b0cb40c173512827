//! # Printer Instance
//!
//! One admitted printer: its session record, its connection loop, its
//! handler and its scheduler. Driven entirely by [`Instance::tick`].
//!
//! ## Tick Order
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  1. drain ConnectionEvents                                              │
//! │       Established  → mark all dirty, reset intervals, on_connected      │
//! │       Message      → lifecycle (token, setup, intervals, pong, ...)     │
//! │                      then on_message / on_demand                        │
//! │       Rejected     → RemoteRevoked signal for the provider              │
//! │  2. handler.on_tick(elapsed)             (bounded by tick_timeout)      │
//! │  3. scheduler.poll_ping + scheduler.flush                               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Config changes and rank signals are not applied to the store or the rank
//! here; they are returned in [`TickOutcome`] for the provider to act on.

use printlink_core::{CoreError, Intervals, PrinterConfig, SessionRecord, SignalKind};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::camera::CameraHandle;
use crate::connection::{
    Connection, ConnectionConfig, ConnectionEvent, ConnectionHandle, ConnectionState, Credentials,
    Dialer,
};
use crate::error::{SyncError, SyncResult};
use crate::handler::{PrinterContext, PrinterHandler};
use crate::protocol::{Demand, ServerMessage};
use crate::scheduler::Scheduler;

// =============================================================================
// Types
// =============================================================================

/// Lifecycle of an instance. `Stopped` is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Created,
    Running,
    Stopped,
}

/// Shared construction parameters, cloned into every instance.
#[derive(Clone)]
pub struct InstanceConfig {
    pub connection: ConnectionConfig,
    pub tick_timeout: Duration,
    pub dialer: Arc<dyn Dialer>,
    pub camera: Option<CameraHandle>,
}

impl InstanceConfig {
    pub fn new(connection: ConnectionConfig, dialer: Arc<dyn Dialer>) -> Self {
        InstanceConfig {
            connection,
            tick_timeout: Duration::from_secs(1),
            dialer,
            camera: None,
        }
    }

    pub fn with_tick_timeout(mut self, tick_timeout: Duration) -> Self {
        self.tick_timeout = tick_timeout;
        self
    }

    pub fn with_camera(mut self, camera: CameraHandle) -> Self {
        self.camera = Some(camera);
        self
    }
}

/// What one tick observed.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TickOutcome {
    /// The record's config changed and should be persisted.
    pub config_changed: bool,
    /// Remote signals for the provider, in arrival order.
    pub signals: Vec<SignalKind>,
    pub events_sent: usize,
    pub handler_failed: bool,
}

enum Callback<'m> {
    Tick(Duration),
    Connected,
    Message(&'m ServerMessage),
    Demand(&'m Demand),
}

impl Callback<'_> {
    fn name(&self) -> &'static str {
        match self {
            Callback::Tick(_) => "on_tick",
            Callback::Connected => "on_connected",
            Callback::Message(_) => "on_message",
            Callback::Demand(_) => "on_demand",
        }
    }
}

// =============================================================================
// Instance
// =============================================================================

pub struct Instance {
    record: SessionRecord,
    handler: Box<dyn PrinterHandler>,
    config: InstanceConfig,
    scheduler: Scheduler,
    state: InstanceState,
    connection: Option<ConnectionHandle>,
    events: Option<mpsc::Receiver<ConnectionEvent>>,
    last_tick: Option<Instant>,
}

impl Instance {
    pub fn new(record: SessionRecord, handler: Box<dyn PrinterHandler>, config: InstanceConfig) -> Self {
        Instance {
            record,
            handler,
            config,
            scheduler: Scheduler::new(Intervals::default()),
            state: InstanceState::Created,
            connection: None,
            events: None,
            last_tick: None,
        }
    }

    pub fn unique_id(&self) -> Uuid {
        self.record.unique_id()
    }

    pub fn state(&self) -> InstanceState {
        self.state
    }

    pub fn record(&self) -> &SessionRecord {
        &self.record
    }

    pub fn record_mut(&mut self) -> &mut SessionRecord {
        &mut self.record
    }

    pub fn intervals(&self) -> &Intervals {
        self.scheduler.intervals()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection
            .as_ref()
            .map(|c| c.state())
            .unwrap_or(ConnectionState::Disconnected)
    }

    /// Live connection version, if the loop was started.
    pub fn version(&self) -> Option<u64> {
        self.connection.as_ref().map(|c| c.version())
    }

    /// Applies user-editable fields from an updated config.
    pub fn update_config(&mut self, config: &PrinterConfig) -> bool {
        self.record.config.merge_user_fields(config)
    }

    /// Spawns the connection loop.
    pub fn start(&mut self) -> SyncResult<()> {
        match self.state {
            InstanceState::Created => {}
            InstanceState::Running => return Ok(()),
            InstanceState::Stopped => {
                return Err(SyncError::InvalidState("instance already stopped".into()))
            }
        }

        let credentials = Credentials::from_config(&self.record.config);
        let (handle, events) = Connection::spawn(
            self.config.connection.clone(),
            credentials,
            self.config.dialer.clone(),
        );
        self.connection = Some(handle);
        self.events = Some(events);
        self.state = InstanceState::Running;

        info!(printer = %self.record.config.label(), "Instance started");
        Ok(())
    }

    /// Runs one cooperative step.
    pub async fn tick(&mut self) -> SyncResult<TickOutcome> {
        if self.state != InstanceState::Running {
            return Err(SyncError::InvalidState(format!(
                "cannot tick a {:?} instance",
                self.state
            )));
        }
        let Some(connection) = self.connection.clone() else {
            return Err(SyncError::InvalidState("instance has no connection".into()));
        };

        let mut outcome = TickOutcome::default();

        let mut pending = Vec::new();
        if let Some(events) = self.events.as_mut() {
            while let Ok(event) = events.try_recv() {
                pending.push(event);
            }
        }
        for event in pending {
            self.handle_event(event, &connection, &mut outcome).await;
        }

        let now = Instant::now();
        let elapsed = self
            .last_tick
            .map(|last| now.saturating_duration_since(last))
            .unwrap_or_default();
        self.last_tick = Some(now);
        self.invoke(&connection, Callback::Tick(elapsed), &mut outcome).await;

        let now = Instant::now().into_std();
        self.scheduler.poll_ping(&connection, now);
        let report = self.scheduler.flush(&mut self.record, &connection, now);
        outcome.events_sent = report.events_sent();
        if let Some(e) = report.error {
            debug!(printer = %self.record.config.label(), error = %e, "Flush incomplete");
        }

        Ok(outcome)
    }

    /// Stops the connection loop. Safe to call more than once.
    pub async fn stop(&mut self) {
        if self.state == InstanceState::Stopped {
            return;
        }
        self.state = InstanceState::Stopped;

        // Dropped first so the loop never blocks on a full event queue.
        self.events = None;
        if let Some(connection) = self.connection.take() {
            connection.shutdown().await;
        }
        info!(printer = %self.record.config.label(), "Instance stopped");
    }

    /// Gives the record back after [`Instance::stop`].
    pub fn into_record(self) -> SessionRecord {
        self.record
    }

    // =========================================================================
    // Event Handling
    // =========================================================================

    async fn handle_event(
        &mut self,
        event: ConnectionEvent,
        connection: &ConnectionHandle,
        outcome: &mut TickOutcome,
    ) {
        match event {
            ConnectionEvent::Established { version } => {
                debug!(printer = %self.record.config.label(), version, "Connection established");
                self.record.state.mark_all_dirty();
                self.scheduler.on_established();
                self.invoke(connection, Callback::Connected, outcome).await;
            }
            ConnectionEvent::Lost { version, reason } => {
                debug!(printer = %self.record.config.label(), version, %reason, "Connection lost");
            }
            ConnectionEvent::Rejected { code, reason, .. } => {
                warn!(printer = %self.record.config.label(), code, %reason, "Server rejected printer");
                outcome.signals.push(SignalKind::RemoteRevoked);
            }
            ConnectionEvent::Message { message, .. } => {
                self.apply_lifecycle(&message, connection, outcome);
                self.invoke(connection, Callback::Message(&message), outcome).await;
                if let ServerMessage::Demand(demand) = &message {
                    self.invoke(connection, Callback::Demand(demand), outcome).await;
                }
            }
        }
    }

    /// Runtime-owned reactions to server messages.
    fn apply_lifecycle(
        &mut self,
        message: &ServerMessage,
        connection: &ConnectionHandle,
        outcome: &mut TickOutcome,
    ) {
        let config = &mut self.record.config;

        match message {
            ServerMessage::NewToken { token, short_id } => {
                info!(printer = %config.label(), short_id = ?short_id, "Received pairing credential");
                config.set_pairing_credentials(token.clone(), short_id.clone());
                connection.set_credentials(Credentials::from_config(config));
                outcome.config_changed = true;
                outcome.signals.push(SignalKind::CredentialRefresh);
            }
            ServerMessage::Connected {
                in_setup,
                short_id,
                name,
                intervals,
            } => {
                if config.in_setup != *in_setup {
                    config.in_setup = *in_setup;
                    outcome.config_changed = true;
                }
                if short_id.is_some() && config.short_id != *short_id {
                    config.short_id = short_id.clone();
                    outcome.config_changed = true;
                }
                if name.is_some() && config.name != *name {
                    config.name = name.clone();
                    outcome.config_changed = true;
                }
                if let Some(intervals) = intervals {
                    self.scheduler.update_intervals(intervals.clone());
                }
                if !config.is_pending() {
                    outcome.signals.push(SignalKind::RemoteAccepted);
                }
            }
            ServerMessage::CompleteSetup { printer_id } => match config.complete_setup(*printer_id) {
                Ok(()) => {
                    info!(printer = %config.label(), identity = printer_id, "Pairing complete");
                    connection.set_credentials(Credentials::from_config(config));
                    self.record.state.mark_all_dirty();
                    outcome.config_changed = true;
                    outcome.signals.push(SignalKind::RemoteAccepted);
                }
                Err(CoreError::IdentityImmutable { current, attempted }) => {
                    warn!(current, attempted, "Server tried to reassign printer identity");
                    outcome.signals.push(SignalKind::RemoteReassigned);
                }
                Err(e) => warn!(error = %e, "Could not complete setup"),
            },
            ServerMessage::IntervalChange(intervals) => {
                self.scheduler.update_intervals(intervals.clone());
            }
            ServerMessage::Pong => {
                if let Some(ms) = self.scheduler.on_pong(Instant::now().into_std()) {
                    self.record.state.set_latency(Some(ms));
                }
            }
            ServerMessage::Error { message } => {
                warn!(printer = %config.label(), %message, "Server reported an error");
            }
            ServerMessage::RemoveConnection { reason } => {
                info!(printer = %config.label(), reason = ?reason, "Server removed printer");
                outcome.signals.push(SignalKind::RemoteRevoked);
            }
            ServerMessage::Demand(_) => {}
        }
    }

    async fn invoke(
        &mut self,
        connection: &ConnectionHandle,
        callback: Callback<'_>,
        outcome: &mut TickOutcome,
    ) {
        let name = callback.name();
        let limit = self.config.tick_timeout;
        let mut ctx = PrinterContext::new(&mut self.record, connection, self.config.camera.as_ref());
        let handler = self.handler.as_mut();

        let call = async {
            match callback {
                Callback::Tick(elapsed) => handler.on_tick(&mut ctx, elapsed).await,
                Callback::Connected => handler.on_connected(&mut ctx).await,
                Callback::Message(message) => handler.on_message(&mut ctx, message).await,
                Callback::Demand(demand) => handler.on_demand(&mut ctx, demand).await,
            }
        };

        let result = match timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::TickTimeout(limit.as_millis() as u64)),
        };

        if let Err(e) = result {
            warn!(callback = name, error = %e, "Handler failed");
            outcome.handler_failed = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::testing::{pair, MockPeer, MockServer};
    use async_trait::async_trait;
    use printlink_core::PrinterStatus;
    use std::sync::Mutex;

    fn kinds(peer: &mut MockPeer) -> Vec<String> {
        peer.drain_envelopes().into_iter().map(|e| e.kind).collect()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    fn instance(config: PrinterConfig, handler: Box<dyn PrinterHandler>) -> (Instance, MockServer) {
        let (dialer, server) = pair();
        let settings = InstanceConfig::new(ConnectionConfig::default(), dialer)
            .with_tick_timeout(Duration::from_millis(200));
        (Instance::new(SessionRecord::new(config), handler, settings), server)
    }

    #[derive(Default, Clone)]
    struct Recorder {
        seen: Arc<Mutex<Vec<String>>>,
        fail_ticks: bool,
        stall_ticks: bool,
    }

    #[async_trait]
    impl PrinterHandler for Recorder {
        async fn on_tick(&mut self, ctx: &mut PrinterContext<'_>, _elapsed: Duration) -> SyncResult<()> {
            ctx.state_mut().set_status(PrinterStatus::Operational);
            if self.stall_ticks {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            if self.fail_ticks {
                return Err(SyncError::handler("sensor offline"));
            }
            Ok(())
        }

        async fn on_connected(&mut self, _ctx: &mut PrinterContext<'_>) -> SyncResult<()> {
            self.seen.lock().unwrap().push("connected".into());
            Ok(())
        }

        async fn on_message(
            &mut self,
            _ctx: &mut PrinterContext<'_>,
            message: &ServerMessage,
        ) -> SyncResult<()> {
            self.seen.lock().unwrap().push(message.type_name().into());
            Ok(())
        }

        async fn on_demand(&mut self, _ctx: &mut PrinterContext<'_>, demand: &Demand) -> SyncResult<()> {
            self.seen.lock().unwrap().push(format!("demand:{}", demand.name()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_pairing_flow() {
        tokio::time::pause();
        let (mut instance, mut server) = instance(PrinterConfig::new(), Box::new(Recorder::default()));
        instance.start().unwrap();

        let mut peer = server.accept().await.unwrap();
        assert_eq!(peer.query("id").as_deref(), Some("0"));
        assert_eq!(peer.query("token").as_deref(), Some("0"));

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

        let outcome = instance.tick().await.unwrap();
        assert!(outcome.config_changed);
        assert_eq!(outcome.signals, vec![SignalKind::CredentialRefresh]);
        assert_eq!(instance.record().config.token.as_deref(), Some("tok-1"));
        assert_eq!(instance.record().config.short_id.as_deref(), Some("9ZZM"));
        assert!(instance.record().config.is_pending());

        settle().await;
        let sent = kinds(&mut peer);
        assert!(sent.contains(&"state_change".to_string()));
        for kind in &sent {
            assert!(
                ["state_change", "machine_data", "firmware", "ping"].contains(&kind.as_str()),
                "{kind} sent while pairing"
            );
        }

        peer.send_message(&ServerMessage::CompleteSetup { printer_id: 4242 });
        settle().await;

        let outcome = instance.tick().await.unwrap();
        assert!(outcome.config_changed);
        assert!(outcome.signals.contains(&SignalKind::RemoteAccepted));
        assert_eq!(instance.record().identity(), Some(4242));
        assert!(!instance.record().config.is_pending());

        settle().await;
        let sent = kinds(&mut peer);
        assert!(sent.contains(&"temps".to_string()));
        assert!(sent.contains(&"job_info".to_string()));
        assert!(sent.contains(&"state_change".to_string()));

        instance.stop().await;
    }

    #[tokio::test]
    async fn test_identity_reassignment_is_refused() {
        tokio::time::pause();
        let config = PrinterConfig::new().with_credentials(7, "tok");
        let (mut instance, mut server) = instance(config, Box::new(Recorder::default()));
        instance.start().unwrap();

        let peer = server.accept().await.unwrap();
        assert_eq!(peer.query("id").as_deref(), Some("7"));
        peer.accept_registration();
        peer.send_message(&ServerMessage::CompleteSetup { printer_id: 8 });
        settle().await;

        let outcome = instance.tick().await.unwrap();
        assert_eq!(
            outcome.signals,
            vec![SignalKind::RemoteAccepted, SignalKind::RemoteReassigned]
        );
        assert_eq!(instance.record().identity(), Some(7));
        instance.stop().await;
    }

    #[tokio::test]
    async fn test_callbacks_in_order() {
        tokio::time::pause();
        let recorder = Recorder::default();
        let seen = recorder.seen.clone();
        let config = PrinterConfig::new().with_credentials(1, "tok");
        let (mut instance, mut server) = instance(config, Box::new(recorder));
        instance.start().unwrap();

        let peer = server.accept().await.unwrap();
        peer.accept_registration();
        peer.send_text(r#"{"kind":"demand","data":{"demand":"pause"}}"#);
        settle().await;

        instance.tick().await.unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["connected", "connected", "demand", "demand:pause"]
        );
        instance.stop().await;
    }

    #[tokio::test]
    async fn test_handler_failure_does_not_block_flush() {
        tokio::time::pause();
        let handler = Recorder {
            fail_ticks: true,
            ..Default::default()
        };
        let config = PrinterConfig::new().with_credentials(1, "tok");
        let (mut instance, mut server) = instance(config, Box::new(handler));
        instance.start().unwrap();

        let mut peer = server.accept().await.unwrap();
        peer.accept_registration();
        settle().await;

        let outcome = instance.tick().await.unwrap();
        assert!(outcome.handler_failed);
        assert!(outcome.events_sent > 0);
        assert_eq!(instance.record().state.status(), PrinterStatus::Operational);

        settle().await;
        assert!(kinds(&mut peer).contains(&"state_change".to_string()));
        instance.stop().await;
    }

    #[tokio::test]
    async fn test_stalled_tick_is_cut_off() {
        tokio::time::pause();
        let handler = Recorder {
            stall_ticks: true,
            ..Default::default()
        };
        let config = PrinterConfig::new().with_credentials(1, "tok");
        let (mut instance, mut server) = instance(config, Box::new(handler));
        instance.start().unwrap();

        let peer = server.accept().await.unwrap();
        peer.accept_registration();
        settle().await;

        let started = Instant::now();
        let outcome = instance.tick().await.unwrap();
        assert!(outcome.handler_failed);
        assert!(outcome.events_sent > 0);
        assert!(started.elapsed() < Duration::from_secs(1));
        instance.stop().await;
    }

    #[tokio::test]
    async fn test_revocation_signals() {
        tokio::time::pause();
        let config = PrinterConfig::new().with_credentials(1, "tok");
        let (mut instance, mut server) = instance(config, Box::new(Recorder::default()));
        instance.start().unwrap();

        let peer = server.accept().await.unwrap();
        peer.accept_registration();
        peer.send_message(&ServerMessage::RemoveConnection {
            reason: Some("deleted in dashboard".into()),
        });
        settle().await;

        let outcome = instance.tick().await.unwrap();
        assert!(outcome.signals.contains(&SignalKind::RemoteRevoked));
        instance.stop().await;
    }

    #[tokio::test]
    async fn test_rejected_registration_signals_revocation() {
        tokio::time::pause();
        let config = PrinterConfig::new().with_credentials(1, "bad");
        let (mut instance, mut server) = instance(config, Box::new(Recorder::default()));
        instance.start().unwrap();

        let peer = server.accept().await.unwrap();
        peer.close(4001, "invalid token");
        settle().await;

        let outcome = instance.tick().await.unwrap();
        assert_eq!(outcome.signals, vec![SignalKind::RemoteRevoked]);
        assert_eq!(instance.connection_state(), ConnectionState::Closing);
        instance.stop().await;
    }

    #[tokio::test]
    async fn test_pong_sets_latency() {
        tokio::time::pause();
        let config = PrinterConfig::new().with_credentials(1, "tok");
        let (mut instance, mut server) = instance(config, Box::new(Recorder::default()));
        instance.start().unwrap();

        let mut peer = server.accept().await.unwrap();
        peer.accept_registration();
        settle().await;

        instance.tick().await.unwrap();
        settle().await;
        assert!(kinds(&mut peer).contains(&"ping".to_string()));

        tokio::time::sleep(Duration::from_millis(40)).await;
        peer.send_message(&ServerMessage::Pong);
        settle().await;

        instance.tick().await.unwrap();
        let latency = instance.record().state.latency_ms().unwrap();
        assert!(latency >= 40, "latency {latency}");

        settle().await;
        assert!(kinds(&mut peer).contains(&"latency".to_string()));
        instance.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        tokio::time::pause();
        let config = PrinterConfig::new().with_credentials(1, "tok");
        let (mut instance, mut server) = instance(config, Box::new(Recorder::default()));
        instance.start().unwrap();

        let peer = server.accept().await.unwrap();
        peer.accept_registration();
        settle().await;

        instance.stop().await;
        instance.stop().await;
        assert_eq!(instance.state(), InstanceState::Stopped);
        assert!(instance.tick().await.is_err());
        assert!(instance.start().is_err());

        settle().await;
        assert!(peer.is_closed());
    }
}
