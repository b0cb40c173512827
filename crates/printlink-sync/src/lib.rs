//! # printlink-sync: Session Runtime
//!
//! Keeps many printer sessions connected to the remote service at once and
//! pushes each printer's reported state upstream as it changes.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Session Runtime                                  │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                    ClientApp (embedder entry point)              │  │
//! │  │  boot load, CRUD surface, flush task, store watcher             │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               ▼                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                    Provider                                      │  │
//! │  │  one slot task per record: rank, latch, identity claims         │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               ▼  (rank == active)                       │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │   Instance     │  │   Scheduler    │  │   Connection           │    │
//! │  │                │  │                │  │                        │    │
//! │  │ lifecycle msgs │─►│ dirty fields → │─►│ WebSocket, watchdog,   │    │
//! │  │ handler calls  │  │ coalesced sends│  │ versioned reconnects   │    │
//! │  └────────────────┘  └────────────────┘  └────────────────────────┘    │
//! │                                                                         │
//! │  ConfigStore (memory / sqlite)      CameraPool (snapshot requests)      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`app`] - `ClientApp`, builder and `AppEvent`s
//! - [`provider`] - Record registry and rank reconciliation
//! - [`instance`] - One running printer session
//! - [`handler`] - Embedding callbacks (`PrinterHandler`)
//! - [`scheduler`] - Dirty-field flushing and ping bookkeeping
//! - [`connection`] - WebSocket client with reconnection
//! - [`protocol`] - Wire envelope and server messages
//! - [`store`] - Config store implementations and retry
//! - [`camera`] - Snapshot request pool
//! - [`config`] - Client settings file
//! - [`error`] - Error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use printlink_sync::{ClientApp, ClientSettings, NoOpHandler, PrinterHandler};
//! use printlink_core::PrinterConfig;
//! use std::sync::Arc;
//!
//! let settings = ClientSettings::load_or_default(None);
//! let app = ClientApp::builder(settings)
//!     .with_handler_factory(Arc::new(|_: &PrinterConfig| -> Box<dyn PrinterHandler> {
//!         Box::new(NoOpHandler)
//!     }))
//!     .start()
//!     .await?;
//!
//! app.add(PrinterConfig::new().with_name("bench mk3")).await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod app;
pub mod camera;
pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod instance;
pub mod protocol;
pub mod provider;
pub mod scheduler;
pub mod store;

// =============================================================================
// Re-exports
// =============================================================================

pub use app::{AppEvent, AppEventEmitter, ChannelEmitter, ClientApp, ClientAppBuilder, NoOpEmitter};
pub use camera::{CameraError, CameraFrame, CameraHandle, CameraPool, CaptureRequest, FrameFuture, FrameSource};
pub use config::{ClientSettings, StoreKind};
pub use connection::{ConnectionConfig, ConnectionHandle, ConnectionState, Dialer, WsDialer};
pub use error::{SyncError, SyncResult};
pub use handler::{HandlerFactory, NoOpHandler, PrinterContext, PrinterHandler};
pub use instance::{Instance, InstanceConfig, InstanceState, TickOutcome};
pub use protocol::{Demand, Envelope, ServerMessage};
pub use provider::{PrinterSnapshot, Provider, ProviderConfig};
pub use scheduler::{FlushReport, Scheduler};
pub use store::{open_store, ConfigStore, MemoryConfigStore, RetryPolicy, SqliteConfigStore, StoreEvent};
