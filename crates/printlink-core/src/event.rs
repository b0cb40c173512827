//! # Outbound Event Kinds
//!
//! Maps dirty fields to wire kinds and builds the `data` payload of each kind
//! from the current [`ReportedState`].
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  dirty: {BedTemperature, ToolTemperatures, Status}                      │
//! │                                                                         │
//! │  FieldId::event_kind  ──►  {Temperatures, StateChange}                  │
//! │                                                                         │
//! │  EventKind::payload   ──►  temps        {"bed":[60,60],"tool0":[..]}    │
//! │                            state_change {"new":"printing"}              │
//! │                                                                         │
//! │  Payloads always carry the LATEST value, never a history of changes.    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::str::FromStr;

use serde_json::{json, Map, Value};

use crate::error::CoreError;
use crate::field::{FieldId, FieldSet};
use crate::intervals::IntervalKind;
use crate::state::ReportedState;

/// Kinds of client → server events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    StateChange,
    Temperatures,
    Tool,
    Ambient,
    JobInfo,
    FileProgress,
    MachineData,
    Firmware,
    CpuInfo,
    PowerSupply,
    FilamentSensor,
    Webcam,
    Latency,
    /// Application-level ping used for latency measurement.
    Ping,
}

impl EventKind {
    /// Wire name used as the envelope `kind`.
    pub const fn as_str(&self) -> &'static str {
        match self {
            EventKind::StateChange => "state_change",
            EventKind::Temperatures => "temps",
            EventKind::Tool => "tool",
            EventKind::Ambient => "ambient",
            EventKind::JobInfo => "job_info",
            EventKind::FileProgress => "file_progress",
            EventKind::MachineData => "machine_data",
            EventKind::Firmware => "firmware",
            EventKind::CpuInfo => "cpu_info",
            EventKind::PowerSupply => "psu",
            EventKind::FilamentSensor => "filament_sensor",
            EventKind::Webcam => "webcam",
            EventKind::Latency => "latency",
            EventKind::Ping => "ping",
        }
    }

    /// Kinds that may be sent while the printer is still pairing.
    pub fn allowed_while_pending(&self) -> bool {
        matches!(
            self,
            EventKind::Ping
                | EventKind::StateChange
                | EventKind::MachineData
                | EventKind::Firmware
        )
    }

    /// Fields reported through this kind (inverse of `FieldId::event_kind`).
    pub fn fields(&self) -> FieldSet {
        FieldId::ALL
            .iter()
            .copied()
            .filter(|f| f.event_kind() == *self)
            .collect()
    }

    /// Rate-limit interval for this kind, if any.
    pub fn interval(&self, state: &ReportedState) -> Option<IntervalKind> {
        match self {
            EventKind::Temperatures if state.is_heating() => Some(IntervalKind::TempsTarget),
            EventKind::Temperatures => Some(IntervalKind::Temps),
            EventKind::JobInfo => Some(IntervalKind::Job),
            EventKind::CpuInfo => Some(IntervalKind::Cpu),
            EventKind::Ping => Some(IntervalKind::Ping),
            _ => None,
        }
    }

    /// Builds the `data` payload from the current state.
    ///
    /// `dirty` restricts multi-field kinds to the fields that changed; every
    /// other kind carries its full latest value. Returns `None` for kinds not
    /// backed by reported state.
    pub fn payload(&self, state: &ReportedState, dirty: FieldSet) -> Option<Value> {
        let value = match self {
            EventKind::StateChange => json!({ "new": state.status() }),
            EventKind::Temperatures => {
                let mut temps = Map::new();
                if dirty.contains(FieldId::BedTemperature) {
                    temps.insert("bed".into(), json!(state.bed_temperature().to_wire()));
                }
                if dirty.contains(FieldId::ToolTemperatures) {
                    for (i, tool) in state.tool_temperatures().iter().enumerate() {
                        temps.insert(format!("tool{i}"), json!(tool.to_wire()));
                    }
                }
                Value::Object(temps)
            }
            EventKind::Tool => json!({ "new": state.active_tool() }),
            EventKind::Ambient => json!({ "new": state.ambient_temperature() }),
            EventKind::JobInfo => serde_json::to_value(state.job()).ok()?,
            EventKind::FileProgress => serde_json::to_value(state.file_progress()).ok()?,
            EventKind::MachineData => serde_json::to_value(state.machine_info()).ok()?,
            EventKind::Firmware => json!({ "fw": state.firmware() }),
            EventKind::CpuInfo => serde_json::to_value(state.cpu_info()).ok()?,
            EventKind::PowerSupply => json!({ "on": state.psu_on() }),
            EventKind::FilamentSensor => json!({ "state": state.filament_sensor() }),
            EventKind::Webcam => serde_json::to_value(state.webcam_settings()).ok()?,
            EventKind::Latency => json!({ "ms": state.latency_ms() }),
            EventKind::Ping => return None,
        };
        Some(value)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s {
            "state_change" => EventKind::StateChange,
            "temps" => EventKind::Temperatures,
            "tool" => EventKind::Tool,
            "ambient" => EventKind::Ambient,
            "job_info" => EventKind::JobInfo,
            "file_progress" => EventKind::FileProgress,
            "machine_data" => EventKind::MachineData,
            "firmware" => EventKind::Firmware,
            "cpu_info" => EventKind::CpuInfo,
            "psu" => EventKind::PowerSupply,
            "filament_sensor" => EventKind::FilamentSensor,
            "webcam" => EventKind::Webcam,
            "latency" => EventKind::Latency,
            "ping" => EventKind::Ping,
            other => return Err(CoreError::UnknownEventKind(other.to_string())),
        };
        Ok(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{JobFlag, PrinterStatus, Temperature};

    #[test]
    fn test_every_field_maps_back_to_its_kind() {
        for field in FieldId::ALL {
            assert!(field.event_kind().fields().contains(field));
        }
        assert_eq!(EventKind::Temperatures.fields().len(), 2);
    }

    #[test]
    fn test_wire_names_parse_back() {
        for field in FieldId::ALL {
            let kind = field.event_kind();
            assert_eq!(kind.as_str().parse::<EventKind>().unwrap(), kind);
        }
        assert!("bogus".parse::<EventKind>().is_err());
    }

    #[test]
    fn test_temps_payload_only_includes_dirty_sensors() {
        let mut state = ReportedState::default();
        state.set_bed_temperature(Temperature::new(60.0, 60.0));
        state.set_tool_temperature(0, Temperature::new(200.0, 210.0)).unwrap();

        let only_tools = FieldSet::only(FieldId::ToolTemperatures);
        let payload = EventKind::Temperatures.payload(&state, only_tools).unwrap();
        assert!(payload.get("bed").is_none());
        assert_eq!(payload["tool0"], json!([200.0, 210.0]));
    }

    #[test]
    fn test_job_payload_skips_false_flags() {
        let mut state = ReportedState::default();
        state.update_job(|job| {
            job.set_progress(50.0);
            job.set_flag(JobFlag::Started);
        });
        let payload = EventKind::JobInfo.payload(&state, FieldSet::all()).unwrap();
        assert_eq!(payload["started"], json!(true));
        assert!(payload.get("finished").is_none());
        assert_eq!(payload["progress"], json!(50.0));
    }

    #[test]
    fn test_state_change_payload() {
        let mut state = ReportedState::default();
        state.set_status(PrinterStatus::Printing);
        let payload = EventKind::StateChange.payload(&state, FieldSet::all()).unwrap();
        assert_eq!(payload, json!({"new": "printing"}));
    }

    #[test]
    fn test_heating_switches_temperature_interval() {
        let mut state = ReportedState::default();
        assert_eq!(
            EventKind::Temperatures.interval(&state),
            Some(IntervalKind::Temps)
        );
        state.set_bed_temperature(Temperature::new(20.0, 60.0));
        assert_eq!(
            EventKind::Temperatures.interval(&state),
            Some(IntervalKind::TempsTarget)
        );
    }

    #[test]
    fn test_pending_allow_list() {
        assert!(EventKind::MachineData.allowed_while_pending());
        assert!(!EventKind::Temperatures.allowed_while_pending());
    }
}
