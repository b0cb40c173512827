//! # Rank and Signal Precedence
//!
//! Three authorities change a printer's admission rank: the user, the physical
//! world, and the remote control-plane. Their signals are applied one at a
//! time by the provider slot that owns the record.
//!
//! ## Rank Derivation
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  revoked?                        ──► Invalid                            │
//! │  deleted?                        ──► Deleted                            │
//! │  wanted by user AND reachable?   ──► Active    (gets an Instance)       │
//! │  otherwise                       ──► Pending                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Precedence
//! ```text
//!   3  RemoteRevoked        terminal, latched
//!   2  UserDelete           terminal, latched, absorbing
//!   1  ReachabilityLost
//!   0  everything else
//!
//!   With a latch set, a signal of precedence <= latch is a no-op.
//!   Reactivation (UserAdd, CredentialRefresh) lifts a revocation latch.
//! ```

use serde::{Deserialize, Serialize};
use ts_rs::TS;

// =============================================================================
// Rank
// =============================================================================

/// Admission classification of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum Rank {
    /// Known but not admitted (not wanted yet, or unreachable).
    #[default]
    Pending,
    /// Admitted: exactly one Instance runs for it.
    Active,
    /// Revoked by the control-plane; config kept for a later retry.
    Invalid,
    /// Deleted by the user; purged on the next flush.
    Deleted,
}

impl Rank {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Rank::Invalid | Rank::Deleted)
    }
}

impl std::fmt::Display for Rank {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rank::Pending => write!(f, "pending"),
            Rank::Active => write!(f, "active"),
            Rank::Invalid => write!(f, "invalid"),
            Rank::Deleted => write!(f, "deleted"),
        }
    }
}

// =============================================================================
// Signals
// =============================================================================

/// An external event that may change a record's rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    // User authority
    UserAdd,
    UserUpdate,
    UserDelete,
    // Physical authority
    ReachabilityGained,
    ReachabilityLost,
    // Remote authority
    RemoteAccepted,
    RemoteReassigned,
    RemoteRevoked,
    CredentialRefresh,
}

impl SignalKind {
    pub const fn precedence(&self) -> u8 {
        match self {
            SignalKind::RemoteRevoked => 3,
            SignalKind::UserDelete => 2,
            SignalKind::ReachabilityLost => 1,
            _ => 0,
        }
    }

    /// Signals allowed to lift a revocation latch.
    pub const fn reactivates(&self) -> bool {
        matches!(self, SignalKind::UserAdd | SignalKind::CredentialRefresh)
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SignalKind::UserAdd => "user_add",
            SignalKind::UserUpdate => "user_update",
            SignalKind::UserDelete => "user_delete",
            SignalKind::ReachabilityGained => "reachability_gained",
            SignalKind::ReachabilityLost => "reachability_lost",
            SignalKind::RemoteAccepted => "remote_accepted",
            SignalKind::RemoteReassigned => "remote_reassigned",
            SignalKind::RemoteRevoked => "remote_revoked",
            SignalKind::CredentialRefresh => "credential_refresh",
        };
        f.write_str(s)
    }
}

// =============================================================================
// Rank State
// =============================================================================

/// Result of applying one signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RankTransition {
    pub from: Rank,
    pub to: Rank,
    /// False when the signal was suppressed by a latch.
    pub applied: bool,
}

impl RankTransition {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }

    /// The record just became active.
    pub fn activated(&self) -> bool {
        self.changed() && self.to == Rank::Active
    }

    /// The record just stopped being active.
    pub fn deactivated(&self) -> bool {
        self.changed() && self.from == Rank::Active
    }
}

/// Authority flags plus the terminal latch. Rank is derived, never stored
/// independently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankState {
    wanted: bool,
    reachable: bool,
    revoked: bool,
    deleted: bool,
    latch: Option<SignalKind>,
}

impl Default for RankState {
    fn default() -> Self {
        Self::new()
    }
}

impl RankState {
    /// A freshly discovered record: reachable, not yet wanted.
    pub fn new() -> Self {
        Self {
            wanted: false,
            reachable: true,
            revoked: false,
            deleted: false,
            latch: None,
        }
    }

    /// Rebuilds the state of a record loaded from the store.
    ///
    /// `wanted` is the persisted user-add flag. A stored `invalid` keeps its
    /// revocation latch; a stored `deleted` keeps its deletion latch.
    pub fn restore(rank: Rank, wanted: bool) -> Self {
        let mut state = Self::new();
        match rank {
            Rank::Active => state.wanted = true,
            Rank::Pending => state.wanted = wanted,
            Rank::Invalid => {
                state.wanted = wanted;
                state.revoked = true;
                state.latch = Some(SignalKind::RemoteRevoked);
            }
            Rank::Deleted => {
                state.deleted = true;
                state.latch = Some(SignalKind::UserDelete);
            }
        }
        state
    }

    pub fn rank(&self) -> Rank {
        if self.revoked {
            Rank::Invalid
        } else if self.deleted {
            Rank::Deleted
        } else if self.wanted && self.reachable {
            Rank::Active
        } else {
            Rank::Pending
        }
    }

    pub fn latch(&self) -> Option<SignalKind> {
        self.latch
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable
    }

    pub fn is_wanted(&self) -> bool {
        self.wanted
    }

    /// Applies one signal in precedence order.
    pub fn apply(&mut self, signal: SignalKind) -> RankTransition {
        let from = self.rank();

        if let Some(latch) = self.latch {
            let lifts = signal.reactivates() && latch == SignalKind::RemoteRevoked;
            if !lifts && signal.precedence() <= latch.precedence() {
                return RankTransition {
                    from,
                    to: from,
                    applied: false,
                };
            }
        }

        match signal {
            SignalKind::UserAdd => {
                self.wanted = true;
                self.lift_revocation();
            }
            SignalKind::CredentialRefresh => self.lift_revocation(),
            SignalKind::UserDelete => {
                self.wanted = false;
                self.deleted = true;
                self.latch = Some(SignalKind::UserDelete);
            }
            SignalKind::ReachabilityGained => self.reachable = true,
            SignalKind::ReachabilityLost => self.reachable = false,
            SignalKind::RemoteRevoked => {
                self.revoked = true;
                self.latch = Some(SignalKind::RemoteRevoked);
            }
            SignalKind::UserUpdate | SignalKind::RemoteAccepted | SignalKind::RemoteReassigned => {}
        }

        RankTransition {
            from,
            to: self.rank(),
            applied: true,
        }
    }

    fn lift_revocation(&mut self) {
        if self.revoked {
            self.revoked = false;
            self.latch = self.deleted.then_some(SignalKind::UserDelete);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_add_activates_reachable_record() {
        let mut state = RankState::new();
        assert_eq!(state.rank(), Rank::Pending);

        let t = state.apply(SignalKind::UserAdd);
        assert!(t.activated());
        assert_eq!(state.rank(), Rank::Active);
    }

    #[test]
    fn test_reachability_toggles_active_and_pending() {
        let mut state = RankState::restore(Rank::Active, true);
        assert!(state.apply(SignalKind::ReachabilityLost).deactivated());
        assert_eq!(state.rank(), Rank::Pending);
        assert!(state.apply(SignalKind::ReachabilityGained).activated());
    }

    #[test]
    fn test_reachability_loss_after_delete_is_noop() {
        let mut state = RankState::restore(Rank::Active, true);
        state.apply(SignalKind::UserDelete);
        assert_eq!(state.rank(), Rank::Deleted);

        let t = state.apply(SignalKind::ReachabilityLost);
        assert!(!t.applied);
        assert!(state.is_reachable());
        assert_eq!(state.rank(), Rank::Deleted);
    }

    #[test]
    fn test_delete_is_absorbing() {
        let mut state = RankState::restore(Rank::Active, true);
        state.apply(SignalKind::UserDelete);

        assert!(!state.apply(SignalKind::UserAdd).applied);
        assert!(!state.apply(SignalKind::UserDelete).applied);
        assert_eq!(state.rank(), Rank::Deleted);
    }

    #[test]
    fn test_revocation_outranks_delete() {
        let mut state = RankState::restore(Rank::Active, true);
        state.apply(SignalKind::UserDelete);
        let t = state.apply(SignalKind::RemoteRevoked);
        assert!(t.applied);
        assert_eq!(state.rank(), Rank::Invalid);

        // Lifting the revocation falls back to the deletion latch.
        state.apply(SignalKind::CredentialRefresh);
        assert_eq!(state.rank(), Rank::Deleted);
        assert_eq!(state.latch(), Some(SignalKind::UserDelete));
    }

    #[test]
    fn test_revocation_blocks_lower_signals_until_reactivation() {
        let mut state = RankState::restore(Rank::Active, true);
        assert!(state.apply(SignalKind::RemoteRevoked).deactivated());
        assert_eq!(state.rank(), Rank::Invalid);

        assert!(!state.apply(SignalKind::UserDelete).applied);
        assert!(!state.apply(SignalKind::ReachabilityGained).applied);
        assert!(!state.apply(SignalKind::RemoteRevoked).applied);

        let t = state.apply(SignalKind::UserAdd);
        assert!(t.applied);
        assert!(t.activated());
        assert_eq!(state.latch(), None);
    }

    #[test]
    fn test_restore_pending_respects_wanted_flag() {
        let discovered = RankState::restore(Rank::Pending, false);
        assert_eq!(discovered.rank(), Rank::Pending);
        assert!(!discovered.is_wanted());

        // Added by the user, unreachable at the time it was stored.
        let added = RankState::restore(Rank::Pending, true);
        assert_eq!(added.rank(), Rank::Active);
        assert!(added.is_wanted());
    }

    #[test]
    fn test_restore_invalid_keeps_latch() {
        let state = RankState::restore(Rank::Invalid, true);
        assert_eq!(state.rank(), Rank::Invalid);
        assert_eq!(state.latch(), Some(SignalKind::RemoteRevoked));
    }
}
