//! # printlink-core: Pure Session Types
//!
//! The data model of one printer session, with zero I/O dependencies.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        printlink Architecture                           │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                 Embedding program (device driver)               │   │
//! │  │        mutates ReportedState through explicit setters           │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │              ★ printlink-core (THIS CRATE) ★                    │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │  record   │  │   rank    │  │   state   │  │   event   │  │   │
//! │  │   │ Printer-  │  │ RankState │  │ Reported- │  │ EventKind │  │   │
//! │  │   │  Config   │  │ Signal-   │  │  State    │  │ payloads  │  │   │
//! │  │   │ Session-  │  │  Kind     │  │ FieldSet  │  │ Intervals │  │   │
//! │  │   │  Record   │  │           │  │ (dirty)   │  │           │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • NO TASKS                  │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │          printlink-db / printlink-sync (I/O layers)             │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`record`] - Printer identity/config and the in-memory session record
//! - [`rank`] - Admission classification and signal precedence
//! - [`field`] - Field identifiers and the dirty bitset
//! - [`state`] - Typed reported-state tree with dirty-marking setters
//! - [`event`] - Outbound event kinds and payload builders
//! - [`intervals`] - Server-provided rate limits
//! - [`validation`] - Config validation
//! - [`error`] - Domain error types
//!
//! ## Example Usage
//!
//! ```rust
//! use printlink_core::{FieldId, PrinterStatus, ReportedState};
//!
//! let mut state = ReportedState::default();
//! state.set_status(PrinterStatus::Printing);
//! state.set_status(PrinterStatus::Printing); // same value, no extra work
//!
//! assert!(state.dirty().contains(FieldId::Status));
//! assert_eq!(state.dirty().len(), 1);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod event;
pub mod field;
pub mod intervals;
pub mod rank;
pub mod record;
pub mod state;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use error::{CoreError, CoreResult, ValidationError};
pub use event::EventKind;
pub use field::{FieldId, FieldSet};
pub use intervals::{DispatchMode, IntervalKind, Intervals, IntervalTracker};
pub use rank::{Rank, RankState, RankTransition, SignalKind};
pub use record::{PrinterConfig, SessionRecord, StoredRecord};
pub use state::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Maximum number of tool heads tracked per printer.
pub const MAX_TOOLS: usize = 16;

/// Temperatures closer than this (after rounding) count as "at target".
pub const HEATING_TOLERANCE_C: f64 = 2.0;
