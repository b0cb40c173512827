//! # Session Records
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  PrinterConfig   identity + credentials + user/physical config          │
//! │        │         (persisted, owned by provider and CRUD surface)        │
//! │        │                                                                │
//! │        ├──► StoredRecord   { config, rank, updated_at }   Config Store  │
//! │        │                                                                │
//! │        └──► SessionRecord  { config, state }              in memory,    │
//! │                                                           owned by the  │
//! │                                                           running slot  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `unique_id` exists from the first moment a record exists and is the store
//! key. `identity` is assigned by the control-plane once, then never changes.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::rank::Rank;
use crate::state::ReportedState;

// =============================================================================
// Printer Config
// =============================================================================

/// Identity and configuration of one printer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrinterConfig {
    /// Local key, assigned at creation.
    pub unique_id: Uuid,
    /// Remote printer id. `None` until pairing completes.
    #[serde(default)]
    identity: Option<u64>,
    /// Remote credential. `None` until the server issues one.
    #[serde(default)]
    pub token: Option<String>,
    /// Setup code shown to the user while pairing.
    #[serde(default)]
    pub short_id: Option<String>,
    #[serde(default)]
    pub in_setup: bool,
    #[serde(default)]
    pub name: Option<String>,
    /// Where the local device is reached (e.g. `http://octopi.local`).
    #[serde(default)]
    pub device_url: Option<String>,
    #[serde(default)]
    pub public_ip: Option<String>,
    /// Embedder-owned settings.
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Default for PrinterConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl PrinterConfig {
    /// A fresh, unpaired printer.
    pub fn new() -> Self {
        Self {
            unique_id: Uuid::new_v4(),
            identity: None,
            token: None,
            short_id: None,
            in_setup: false,
            name: None,
            device_url: None,
            public_ip: None,
            extra: BTreeMap::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_device_url(mut self, url: impl Into<String>) -> Self {
        self.device_url = Some(url.into());
        self
    }

    /// A config that was already paired elsewhere.
    pub fn with_credentials(mut self, identity: u64, token: impl Into<String>) -> Self {
        self.identity = Some(identity);
        self.token = Some(token.into());
        self
    }

    pub fn identity(&self) -> Option<u64> {
        self.identity
    }

    /// True until the control-plane accepted the printer.
    pub fn is_pending(&self) -> bool {
        self.identity.is_none() || self.in_setup
    }

    pub fn has_credentials(&self) -> bool {
        self.token.is_some()
    }

    /// Assigns the remote identity.
    ///
    /// Re-assigning the same value is a no-op (`Ok(false)`); a different value
    /// fails with [`CoreError::IdentityImmutable`].
    pub fn assign_identity(&mut self, identity: u64) -> CoreResult<bool> {
        match self.identity {
            Some(current) if current == identity => Ok(false),
            Some(current) => Err(CoreError::IdentityImmutable {
                current,
                attempted: identity,
            }),
            None => {
                self.identity = Some(identity);
                Ok(true)
            }
        }
    }

    /// Stores a freshly issued credential and enters setup.
    pub fn set_pairing_credentials(&mut self, token: String, short_id: Option<String>) {
        self.token = Some(token);
        self.short_id = short_id;
        self.in_setup = true;
    }

    /// Finishes pairing with the remote-assigned identity.
    pub fn complete_setup(&mut self, identity: u64) -> CoreResult<()> {
        self.assign_identity(identity)?;
        self.in_setup = false;
        self.short_id = None;
        Ok(())
    }

    /// Copies user-editable fields from `other`. Identity and credentials are
    /// left alone.
    pub fn merge_user_fields(&mut self, other: &PrinterConfig) -> bool {
        let before = (
            self.name.clone(),
            self.device_url.clone(),
            self.public_ip.clone(),
            self.extra.clone(),
        );
        self.name = other.name.clone();
        self.device_url = other.device_url.clone();
        self.public_ip = other.public_ip.clone();
        self.extra = other.extra.clone();
        before
            != (
                self.name.clone(),
                self.device_url.clone(),
                self.public_ip.clone(),
                self.extra.clone(),
            )
    }

    /// Name for logs: display name, else identity, else unique id.
    pub fn label(&self) -> String {
        match (&self.name, self.identity) {
            (Some(name), _) => name.clone(),
            (None, Some(id)) => format!("printer-{id}"),
            (None, None) => self.unique_id.to_string(),
        }
    }
}

// =============================================================================
// Stored Record
// =============================================================================

/// The unit persisted by the Config Store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub config: PrinterConfig,
    pub rank: Rank,
    /// The user added this record. A `pending` rank alone cannot tell a
    /// discovered device from an added one that was unreachable.
    #[serde(default)]
    pub wanted: bool,
    pub updated_at: DateTime<Utc>,
}

impl StoredRecord {
    /// `wanted` defaults to what the rank implies: active and revoked
    /// records were added, pending ones were only discovered.
    pub fn new(config: PrinterConfig, rank: Rank) -> Self {
        Self {
            config,
            rank,
            wanted: matches!(rank, Rank::Active | Rank::Invalid),
            updated_at: Utc::now(),
        }
    }

    pub fn with_wanted(mut self, wanted: bool) -> Self {
        self.wanted = wanted;
        self
    }

    pub fn unique_id(&self) -> Uuid {
        self.config.unique_id
    }
}

// =============================================================================
// Session Record
// =============================================================================

/// A running printer: config plus live reported state.
#[derive(Debug, Clone, Default)]
pub struct SessionRecord {
    pub config: PrinterConfig,
    pub state: ReportedState,
}

impl SessionRecord {
    pub fn new(config: PrinterConfig) -> Self {
        Self {
            config,
            state: ReportedState::default(),
        }
    }

    pub fn unique_id(&self) -> Uuid {
        self.config.unique_id
    }

    pub fn identity(&self) -> Option<u64> {
        self.config.identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_config_is_pending() {
        let config = PrinterConfig::new();
        assert!(config.is_pending());
        assert!(!config.has_credentials());
    }

    #[test]
    fn test_identity_is_immutable() {
        let mut config = PrinterConfig::new();
        assert!(config.assign_identity(7).unwrap());
        assert!(!config.assign_identity(7).unwrap());
        assert!(matches!(
            config.assign_identity(8),
            Err(CoreError::IdentityImmutable {
                current: 7,
                attempted: 8
            })
        ));
        assert_eq!(config.identity(), Some(7));
    }

    #[test]
    fn test_pairing_flow() {
        let mut config = PrinterConfig::new();
        config.set_pairing_credentials("tok".into(), Some("9ZZM".into()));
        assert!(config.in_setup);
        assert!(config.is_pending());

        config.complete_setup(42).unwrap();
        assert!(!config.is_pending());
        assert_eq!(config.identity(), Some(42));
        assert_eq!(config.short_id, None);
    }

    #[test]
    fn test_merge_keeps_credentials() {
        let mut stored = PrinterConfig::new().with_credentials(3, "secret");
        let edit = PrinterConfig::new().with_name("Prusa");

        assert!(stored.merge_user_fields(&edit));
        assert_eq!(stored.name.as_deref(), Some("Prusa"));
        assert_eq!(stored.identity(), Some(3));
        assert_eq!(stored.token.as_deref(), Some("secret"));
        assert!(!stored.merge_user_fields(&edit));
    }

    #[test]
    fn test_extra_fields_flatten() {
        let json = r#"{"unique_id":"550e8400-e29b-41d4-a716-446655440000","webcam_port":8080}"#;
        let config: PrinterConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.extra["webcam_port"], serde_json::json!(8080));
        assert!(config.identity().is_none());
    }
}
