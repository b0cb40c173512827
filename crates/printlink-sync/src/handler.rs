//! # Embedding Callbacks
//!
//! The seam between the runtime and the program that drives a real device.
//!
//! ```text
//!   Instance::tick()
//!        │
//!        ├── on_connected(ctx)          once per established version
//!        ├── on_message(ctx, msg)       every inbound message, in order
//!        ├── on_demand(ctx, demand)     device commands only
//!        └── on_tick(ctx, elapsed)      once per tick, bounded by tick_timeout
//! ```
//!
//! Each callback gets a [`PrinterContext`] borrowing the printer's record.
//! State written through it is picked up by the same tick's flush.

use async_trait::async_trait;
use printlink_core::{PrinterConfig, ReportedState, SessionRecord};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

use crate::camera::CameraHandle;
use crate::connection::ConnectionHandle;
use crate::error::SyncResult;
use crate::protocol::{Demand, Envelope, ServerMessage};

// =============================================================================
// Context
// =============================================================================

/// What a callback may touch while it runs.
pub struct PrinterContext<'a> {
    record: &'a mut SessionRecord,
    connection: &'a ConnectionHandle,
    camera: Option<&'a CameraHandle>,
}

impl<'a> PrinterContext<'a> {
    pub fn new(
        record: &'a mut SessionRecord,
        connection: &'a ConnectionHandle,
        camera: Option<&'a CameraHandle>,
    ) -> Self {
        Self {
            record,
            connection,
            camera,
        }
    }

    pub fn unique_id(&self) -> Uuid {
        self.record.unique_id()
    }

    pub fn config(&self) -> &PrinterConfig {
        &self.record.config
    }

    pub fn state(&self) -> &ReportedState {
        &self.record.state
    }

    /// Setters on the returned state mark fields dirty.
    pub fn state_mut(&mut self) -> &mut ReportedState {
        &mut self.record.state
    }

    pub fn is_online(&self) -> bool {
        self.connection.is_online()
    }

    /// Sends a one-off envelope on the live transport.
    ///
    /// Use this for replies the state model does not cover (terminal output,
    /// snapshot uploads). Fails when offline.
    pub fn send(&self, kind: impl Into<String>, data: Value) -> SyncResult<()> {
        self.connection
            .send(Envelope::new(kind, data), self.connection.version())
    }

    pub fn camera(&self) -> Option<&CameraHandle> {
        self.camera
    }
}

// =============================================================================
// Handler Trait
// =============================================================================

/// Per-printer callbacks. Every method defaults to doing nothing.
///
/// An `Err` is logged and counted by the instance; it never stops the
/// printer's session.
#[async_trait]
pub trait PrinterHandler: Send {
    async fn on_tick(&mut self, _ctx: &mut PrinterContext<'_>, _elapsed: Duration) -> SyncResult<()> {
        Ok(())
    }

    async fn on_connected(&mut self, _ctx: &mut PrinterContext<'_>) -> SyncResult<()> {
        Ok(())
    }

    async fn on_message(
        &mut self,
        _ctx: &mut PrinterContext<'_>,
        _message: &ServerMessage,
    ) -> SyncResult<()> {
        Ok(())
    }

    async fn on_demand(&mut self, _ctx: &mut PrinterContext<'_>, _demand: &Demand) -> SyncResult<()> {
        Ok(())
    }
}

/// Handler that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpHandler;

impl PrinterHandler for NoOpHandler {}

// =============================================================================
// Factory
// =============================================================================

/// Builds the handler for each admitted printer.
pub trait HandlerFactory: Send + Sync + 'static {
    fn create(&self, config: &PrinterConfig) -> Box<dyn PrinterHandler>;
}

impl<F> HandlerFactory for F
where
    F: Fn(&PrinterConfig) -> Box<dyn PrinterHandler> + Send + Sync + 'static,
{
    fn create(&self, config: &PrinterConfig) -> Box<dyn PrinterHandler> {
        self(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{testing, Connection, ConnectionConfig, Credentials};
    use printlink_core::PrinterStatus;

    struct Heater;

    #[async_trait]
    impl PrinterHandler for Heater {
        async fn on_tick(&mut self, ctx: &mut PrinterContext<'_>, _elapsed: Duration) -> SyncResult<()> {
            ctx.state_mut().set_status(PrinterStatus::Printing);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_context_writes_mark_dirty() {
        let (dialer, _server) = testing::pair();
        let (handle, _events) = Connection::spawn(
            ConnectionConfig::default(),
            Credentials::default(),
            dialer,
        );
        let mut record = SessionRecord::new(PrinterConfig::new());

        let mut ctx = PrinterContext::new(&mut record, &handle, None);
        Heater.on_tick(&mut ctx, Duration::ZERO).await.unwrap();
        assert!(!ctx.is_online());
        assert!(ctx.send("terminal", Value::Null).is_err());
        assert!(ctx.camera().is_none());

        assert_eq!(record.state.status(), PrinterStatus::Printing);
        assert!(!record.state.dirty().is_empty());
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_closure_factory() {
        let factory = |_: &PrinterConfig| -> Box<dyn PrinterHandler> { Box::new(NoOpHandler) };
        let config = PrinterConfig::new();
        let _handler = HandlerFactory::create(&factory, &config);
    }
}
