//! # Wire Protocol
//!
//! Message types exchanged with the control-plane.
//!
//! ## Protocol Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Control-plane Messages                             │
//! │                                                                         │
//! │  PAIRING                                                               │
//! │  ───────                                                               │
//! │  CLIENT  ───► open ?id=0&token=0                                       │
//! │  SERVER  ◄─── new_token { token, short_id }                            │
//! │  SERVER  ◄─── connected { in_setup: true, short_id, intervals }        │
//! │  SERVER  ◄─── complete_setup { printer_id }                            │
//! │                                                                         │
//! │  STEADY STATE                                                          │
//! │  ────────────                                                          │
//! │  CLIENT  ───► { kind: "temps", data: { bed: [..], tool0: [..] } }      │
//! │  SERVER  ◄─── interval_change { job, temps, ... }                      │
//! │  SERVER  ◄─── demand { demand: "pause" }                               │
//! │                                                                         │
//! │  LATENCY                                                               │
//! │  ───────                                                               │
//! │  CLIENT  ───► ping                                                     │
//! │  SERVER  ◄─── pong                                                     │
//! │                                                                         │
//! │  TEARDOWN                                                              │
//! │  ────────                                                              │
//! │  SERVER  ◄─── remove_connection { reason }                             │
//! │  SERVER  ◄─── close(4000..=4999)  (registration rejected)              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Wire Format
//! Every frame is one JSON object: `{ "kind": "...", "data": { ... } }`.
//! `data` is omitted when there is nothing to carry.

use printlink_core::{EventKind, Intervals};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Map, Value};

use crate::error::{SyncError, SyncResult};

/// Close codes in this range mean the server refused the registration.
pub const REJECTION_CLOSE_CODES: std::ops::RangeInclusive<u16> = 4000..=4999;

// =============================================================================
// Outbound Envelope
// =============================================================================

/// One outbound message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: String,

    #[serde(default, skip_serializing_if = "is_empty_payload")]
    pub data: Option<Value>,
}

fn is_empty_payload(data: &Option<Value>) -> bool {
    match data {
        None | Some(Value::Null) => true,
        Some(Value::Object(map)) => map.is_empty(),
        _ => false,
    }
}

impl Envelope {
    /// An envelope carrying only its kind.
    pub fn bare(kind: impl Into<String>) -> Self {
        Envelope {
            kind: kind.into(),
            data: None,
        }
    }

    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Envelope {
            kind: kind.into(),
            data: Some(data),
        }
    }

    /// An envelope for a reported-state event.
    pub fn event(kind: EventKind, data: Value) -> Self {
        Self::new(kind.as_str(), data)
    }

    pub fn ping() -> Self {
        Self::bare(EventKind::Ping.as_str())
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

// =============================================================================
// Inbound Messages
// =============================================================================

/// Every message the control-plane sends that the runtime understands.
///
/// Adjacently tagged: `{ "kind": "new_token", "data": { ... } }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    // =========================================================================
    // Registration
    // =========================================================================
    /// Registration handshake finished.
    Connected {
        #[serde(default)]
        in_setup: bool,
        #[serde(default)]
        short_id: Option<String>,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        intervals: Option<Intervals>,
    },

    /// A fresh credential for an unpaired printer.
    NewToken {
        token: String,
        #[serde(default)]
        short_id: Option<String>,
    },

    /// The user claimed the printer; `printer_id` becomes its identity.
    CompleteSetup { printer_id: u64 },

    // =========================================================================
    // Runtime Control
    // =========================================================================
    /// Replaces the rate-limit table.
    IntervalChange(Intervals),

    /// Answer to a `ping` envelope.
    Pong,

    /// Server-side error report. Informational.
    Error {
        #[serde(default)]
        message: String,
    },

    /// Command for the device.
    Demand(Demand),

    /// The server retired this printer.
    RemoveConnection {
        #[serde(default)]
        reason: Option<String>,
    },
}

impl ServerMessage {
    /// Parses one inbound text frame.
    ///
    /// An empty `data` object counts as absent so unit kinds such as `pong`
    /// parse either way.
    pub fn parse(text: &str) -> SyncResult<Self> {
        let mut value: Value = serde_json::from_str(text)?;
        let kind = value
            .get("kind")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| SyncError::InvalidMessage("frame without kind".into()))?;

        if let Value::Object(obj) = &mut value {
            let empty = matches!(obj.get("data"), Some(Value::Null))
                || matches!(obj.get("data"), Some(Value::Object(m)) if m.is_empty());
            if empty && kind == "pong" {
                obj.remove("data");
            }
        }

        serde_json::from_value(value)
            .map_err(|e| SyncError::InvalidMessage(format!("{kind}: {e}")))
    }

    /// Returns the wire kind.
    pub fn type_name(&self) -> &'static str {
        match self {
            ServerMessage::Connected { .. } => "connected",
            ServerMessage::NewToken { .. } => "new_token",
            ServerMessage::CompleteSetup { .. } => "complete_setup",
            ServerMessage::IntervalChange(_) => "interval_change",
            ServerMessage::Pong => "pong",
            ServerMessage::Error { .. } => "error",
            ServerMessage::Demand(_) => "demand",
            ServerMessage::RemoveConnection { .. } => "remove_connection",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// =============================================================================
// Demands
// =============================================================================

/// A device command carried by a `demand` message.
///
/// The sub-kind lives in the `demand` field of the payload. Sub-kinds the
/// runtime does not model are kept whole in [`Demand::Other`].
#[derive(Debug, Clone, PartialEq)]
pub enum Demand {
    Pause,
    Resume,
    Cancel,
    Terminal {
        enabled: bool,
    },
    Gcode {
        lines: Vec<String>,
    },
    WebcamSnapshot {
        id: Option<String>,
        timer: Option<u64>,
    },
    File {
        url: Option<String>,
        file_name: Option<String>,
        auto_start: bool,
    },
    Other {
        name: String,
        payload: Value,
    },
}

impl Demand {
    /// Sub-kind as sent on the wire.
    pub fn name(&self) -> &str {
        match self {
            Demand::Pause => "pause",
            Demand::Resume => "resume",
            Demand::Cancel => "cancel",
            Demand::Terminal { .. } => "terminal",
            Demand::Gcode { .. } => "gcode",
            Demand::WebcamSnapshot { .. } => "webcam_snapshot",
            Demand::File { .. } => "file",
            Demand::Other { name, .. } => name,
        }
    }

    fn to_value(&self) -> Value {
        match self {
            Demand::Pause | Demand::Resume | Demand::Cancel => json!({ "demand": self.name() }),
            Demand::Terminal { enabled } => json!({ "demand": "terminal", "enabled": enabled }),
            Demand::Gcode { lines } => json!({ "demand": "gcode", "list": lines }),
            Demand::WebcamSnapshot { id, timer } => {
                json!({ "demand": "webcam_snapshot", "id": id, "timer": timer })
            }
            Demand::File {
                url,
                file_name,
                auto_start,
            } => json!({
                "demand": "file",
                "url": url,
                "file_name": file_name,
                "auto_start": auto_start,
            }),
            Demand::Other { name, payload } => {
                let mut map = match payload {
                    Value::Object(map) => map.clone(),
                    _ => Map::new(),
                };
                map.insert("demand".into(), Value::String(name.clone()));
                Value::Object(map)
            }
        }
    }
}

impl TryFrom<Value> for Demand {
    type Error = SyncError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let name = value
            .get("demand")
            .and_then(Value::as_str)
            .ok_or_else(|| SyncError::InvalidMessage("demand without sub-kind".into()))?
            .to_string();

        let str_field = |key: &str| value.get(key).and_then(Value::as_str).map(str::to_string);
        // The server sends flags both as booleans and as 0/1.
        let flag = |key: &str| match value.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_u64().unwrap_or(0) != 0,
            _ => false,
        };

        let demand = match name.as_str() {
            "pause" => Demand::Pause,
            "resume" => Demand::Resume,
            "cancel" => Demand::Cancel,
            "terminal" => Demand::Terminal {
                enabled: flag("enabled"),
            },
            "gcode" => Demand::Gcode {
                lines: value
                    .get("list")
                    .and_then(Value::as_array)
                    .map(|lines| {
                        lines
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default(),
            },
            "webcam_snapshot" => Demand::WebcamSnapshot {
                id: str_field("id"),
                timer: value.get("timer").and_then(Value::as_u64),
            },
            "file" => Demand::File {
                url: str_field("url"),
                file_name: str_field("file_name"),
                auto_start: flag("auto_start"),
            },
            _ => {
                let mut payload = value;
                if let Value::Object(map) = &mut payload {
                    map.remove("demand");
                }
                Demand::Other { name, payload }
            }
        };
        Ok(demand)
    }
}

impl Serialize for Demand {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Demand {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Demand::try_from(value).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_omits_empty_data() {
        assert_eq!(Envelope::ping().to_json().unwrap(), r#"{"kind":"ping"}"#);
        assert_eq!(
            Envelope::new("tool", json!({})).to_json().unwrap(),
            r#"{"kind":"tool"}"#
        );

        let temps = Envelope::event(EventKind::Temperatures, json!({ "bed": [60.0, 60.0] }));
        let text = temps.to_json().unwrap();
        assert!(text.contains(r#""kind":"temps""#));
        assert!(text.contains(r#""data":{"bed":[60.0,60.0]}"#));
    }

    #[test]
    fn test_parse_pairing_messages() {
        let msg = ServerMessage::parse(
            r#"{"kind":"new_token","data":{"token":"abc","short_id":"9ZZM"}}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ServerMessage::NewToken {
                token: "abc".into(),
                short_id: Some("9ZZM".into())
            }
        );

        let msg = ServerMessage::parse(
            r#"{"kind":"connected","data":{"in_setup":true,"short_id":"9ZZM","intervals":{"temps":1000}}}"#,
        )
        .unwrap();
        match msg {
            ServerMessage::Connected {
                in_setup,
                short_id,
                intervals,
                ..
            } => {
                assert!(in_setup);
                assert_eq!(short_id.as_deref(), Some("9ZZM"));
                let intervals = intervals.unwrap();
                assert_eq!(intervals.temps, 1000);
                assert_eq!(intervals.job, Intervals::default().job);
            }
            other => panic!("unexpected {other:?}"),
        }

        let msg =
            ServerMessage::parse(r#"{"kind":"complete_setup","data":{"printer_id":42}}"#).unwrap();
        assert_eq!(msg, ServerMessage::CompleteSetup { printer_id: 42 });
    }

    #[test]
    fn test_parse_pong_with_or_without_data() {
        assert_eq!(ServerMessage::parse(r#"{"kind":"pong"}"#).unwrap(), ServerMessage::Pong);
        assert_eq!(
            ServerMessage::parse(r#"{"kind":"pong","data":{}}"#).unwrap(),
            ServerMessage::Pong
        );
    }

    #[test]
    fn test_unknown_kind_is_protocol_error() {
        let err = ServerMessage::parse(r#"{"kind":"teleport","data":{}}"#).unwrap_err();
        assert!(err.is_protocol_error());

        let err = ServerMessage::parse(r#"{"data":{}}"#).unwrap_err();
        assert!(err.is_protocol_error());

        let err = ServerMessage::parse("not json").unwrap_err();
        assert!(err.is_protocol_error());
    }

    #[test]
    fn test_parse_demands() {
        let msg = ServerMessage::parse(
            r#"{"kind":"demand","data":{"demand":"gcode","list":["G28","M104 S200"]}}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ServerMessage::Demand(Demand::Gcode {
                lines: vec!["G28".into(), "M104 S200".into()]
            })
        );

        let msg = ServerMessage::parse(
            r#"{"kind":"demand","data":{"demand":"file","url":"https://cdn/x.gcode","auto_start":1}}"#,
        )
        .unwrap();
        match msg {
            ServerMessage::Demand(Demand::File { url, auto_start, .. }) => {
                assert_eq!(url.as_deref(), Some("https://cdn/x.gcode"));
                assert!(auto_start);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unmodelled_demand_is_kept() {
        let msg = ServerMessage::parse(
            r#"{"kind":"demand","data":{"demand":"plugin_install","plugins":["a"]}}"#,
        )
        .unwrap();
        let ServerMessage::Demand(demand) = msg else {
            panic!("expected demand");
        };
        assert_eq!(demand.name(), "plugin_install");
        assert_eq!(
            demand,
            Demand::Other {
                name: "plugin_install".into(),
                payload: json!({ "plugins": ["a"] })
            }
        );
        let wire = serde_json::to_value(&demand).unwrap();
        assert_eq!(wire["demand"], "plugin_install");
    }

    #[test]
    fn test_type_name_matches_tag() {
        let msg = ServerMessage::RemoveConnection { reason: None };
        let text = msg.to_json().unwrap();
        assert!(text.contains(msg.type_name()));
    }
}
