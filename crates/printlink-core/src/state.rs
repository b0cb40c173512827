//! # Reported State
//!
//! The typed tree of values a printer reports to the control-plane.
//!
//! ## Dirty Tracking
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                   Setter → Dirty Bit → Flush                            │
//! │                                                                         │
//! │  state.set_status(Printing)                                             │
//! │        │                                                                │
//! │        ├── value unchanged? ──► return false (nothing marked)           │
//! │        │                                                                │
//! │        └── value changed ─────► store, dirty.insert(Status), true       │
//! │                                                                         │
//! │  Scheduler::flush                                                       │
//! │        ├── reads dirty()                                                │
//! │        ├── builds one envelope per event kind                           │
//! │        └── clear_dirty(sent) ONLY after the hand-off succeeded          │
//! │                                                                         │
//! │  urgent(): subset of dirty whose latest change bypasses rate limits     │
//! │            (temperature targets, job start/finish/cancel/fail flags)    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Fields are private; every mutation goes through a setter so that a field
//! can never change without its dirty bit.

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::error::{CoreError, CoreResult};
use crate::field::{FieldId, FieldSet};
use crate::{HEATING_TOLERANCE_C, MAX_TOOLS};

// =============================================================================
// Printer Status
// =============================================================================

/// High-level printer status, sent as `state_change`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum PrinterStatus {
    #[default]
    Offline,
    NotReady,
    Operational,
    Printing,
    Pausing,
    Paused,
    Resuming,
    Cancelling,
    Downloading,
    Error,
}

impl PrinterStatus {
    /// True while a job occupies the printer.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            PrinterStatus::Printing
                | PrinterStatus::Pausing
                | PrinterStatus::Paused
                | PrinterStatus::Resuming
                | PrinterStatus::Cancelling
        )
    }
}

impl std::fmt::Display for PrinterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PrinterStatus::Offline => "offline",
            PrinterStatus::NotReady => "not_ready",
            PrinterStatus::Operational => "operational",
            PrinterStatus::Printing => "printing",
            PrinterStatus::Pausing => "pausing",
            PrinterStatus::Paused => "paused",
            PrinterStatus::Resuming => "resuming",
            PrinterStatus::Cancelling => "cancelling",
            PrinterStatus::Downloading => "downloading",
            PrinterStatus::Error => "error",
        };
        f.write_str(s)
    }
}

// =============================================================================
// Temperature
// =============================================================================

/// One heater reading. Equality compares whole degrees.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Temperature {
    pub actual: Option<f64>,
    pub target: Option<f64>,
}

fn whole_degrees(value: Option<f64>) -> Option<i64> {
    value.map(|v| v.round() as i64)
}

impl Temperature {
    pub fn new(actual: f64, target: f64) -> Self {
        Self {
            actual: Some(actual),
            target: Some(target),
        }
    }

    /// A heater with a reading but no target (heater off).
    pub fn reading(actual: f64) -> Self {
        Self {
            actual: Some(actual),
            target: None,
        }
    }

    /// True while a positive target has not been reached yet.
    pub fn is_heating(&self) -> bool {
        match (self.actual, self.target) {
            (Some(actual), Some(target)) if target > 0.0 => {
                (target - actual).abs() > HEATING_TOLERANCE_C
            }
            _ => false,
        }
    }

    /// Wire form: `[actual, target]`.
    pub fn to_wire(&self) -> [Option<f64>; 2] {
        [self.actual, self.target]
    }

    fn target_differs(&self, other: &Temperature) -> bool {
        whole_degrees(self.target) != whole_degrees(other.target)
    }
}

impl PartialEq for Temperature {
    fn eq(&self, other: &Self) -> bool {
        whole_degrees(self.actual) == whole_degrees(other.actual)
            && whole_degrees(self.target) == whole_degrees(other.target)
    }
}

// =============================================================================
// Job Info
// =============================================================================

/// Terminal-ish job flags. At most one is set at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobFlag {
    Started,
    Finished,
    Cancelled,
    Failed,
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Current job progress. Unset flags are left off the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobInfo {
    /// Percent complete, rounded to two decimals.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    /// Estimated total seconds at job start.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_estimate: Option<u64>,
    /// Elapsed seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub layer: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_layers: Option<u32>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub started: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub finished: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub cancelled: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub failed: bool,
}

impl JobInfo {
    pub fn set_progress(&mut self, percent: f64) {
        let clamped = percent.clamp(0.0, 100.0);
        self.progress = Some((clamped * 100.0).round() / 100.0);
    }

    /// Sets one flag and clears the other three.
    pub fn set_flag(&mut self, flag: JobFlag) {
        self.clear_flags();
        match flag {
            JobFlag::Started => self.started = true,
            JobFlag::Finished => self.finished = true,
            JobFlag::Cancelled => self.cancelled = true,
            JobFlag::Failed => self.failed = true,
        }
    }

    pub fn clear_flags(&mut self) {
        self.started = false;
        self.finished = false;
        self.cancelled = false;
        self.failed = false;
    }

    pub fn flag(&self) -> Option<JobFlag> {
        if self.started {
            Some(JobFlag::Started)
        } else if self.finished {
            Some(JobFlag::Finished)
        } else if self.cancelled {
            Some(JobFlag::Cancelled)
        } else if self.failed {
            Some(JobFlag::Failed)
        } else {
            None
        }
    }
}

// =============================================================================
// File Progress
// =============================================================================

/// Download/upload state of the file being fetched for printing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum FileProgressState {
    Pending,
    Downloading,
    Ready,
    Started,
    Error,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct FileProgress {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<FileProgressState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl FileProgress {
    /// Moves to `state`. Leaving `downloading` resets the percentage.
    pub fn set_state(&mut self, state: FileProgressState) {
        if self.state == Some(FileProgressState::Downloading)
            && state != FileProgressState::Downloading
        {
            self.percent = Some(0.0);
        }
        if state != FileProgressState::Error {
            self.message = None;
        }
        self.state = Some(state);
    }

    pub fn set_percent(&mut self, percent: f64) {
        self.percent = Some(percent.clamp(0.0, 100.0).round());
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.set_state(FileProgressState::Error);
        self.message = Some(message.into());
    }
}

// =============================================================================
// Machine, Firmware, CPU, Webcam
// =============================================================================

/// Host machine description, sent as `machine_data`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct MachineInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub machine: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub core_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_memory: Option<u64>,
    /// Name of the host software driving the printer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_version: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct FirmwareInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuInfo {
    /// Load in percent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<u32>,
    /// SoC temperature in whole degrees.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp: Option<i32>,
    /// Memory use in percent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<u32>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub throttled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum FilamentSensorState {
    Loaded,
    Runout,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct WebcamSettings {
    pub flip_h: bool,
    pub flip_v: bool,
    pub rotate_90: bool,
}

// =============================================================================
// Reported State
// =============================================================================

/// Everything one printer reports, with per-field dirty bits.
#[derive(Debug, Clone, Default)]
pub struct ReportedState {
    status: PrinterStatus,
    bed: Temperature,
    tools: Vec<Temperature>,
    active_tool: Option<u32>,
    ambient: Option<f64>,
    job: JobInfo,
    file_progress: FileProgress,
    machine: MachineInfo,
    firmware: FirmwareInfo,
    cpu: CpuInfo,
    psu_on: Option<bool>,
    filament: Option<FilamentSensorState>,
    webcam: WebcamSettings,
    latency_ms: Option<u32>,
    dirty: FieldSet,
    urgent: FieldSet,
}

impl ReportedState {
    // -------------------------------------------------------------------------
    // Dirty bookkeeping
    // -------------------------------------------------------------------------

    /// Fields changed since they were last handed to the connection.
    pub fn dirty(&self) -> FieldSet {
        self.dirty
    }

    /// Dirty fields whose latest change must skip rate limiting.
    pub fn urgent(&self) -> FieldSet {
        self.urgent
    }

    pub fn mark_dirty(&mut self, field: FieldId) {
        self.dirty.insert(field);
    }

    /// Marks every field dirty so the next flush is a full snapshot.
    pub fn mark_all_dirty(&mut self) {
        self.dirty = FieldSet::all();
    }

    /// Clears dirty bits. Only the scheduler calls this, after a successful
    /// hand-off of the events built from `fields`.
    pub fn clear_dirty(&mut self, fields: FieldSet) {
        self.dirty = self.dirty.difference(fields);
        self.urgent = self.urgent.difference(fields);
    }

    fn assign<T: PartialEq>(
        slot: &mut T,
        value: T,
        dirty: &mut FieldSet,
        field: FieldId,
    ) -> bool {
        if *slot == value {
            return false;
        }
        *slot = value;
        dirty.insert(field);
        true
    }

    // -------------------------------------------------------------------------
    // Getters
    // -------------------------------------------------------------------------

    pub fn status(&self) -> PrinterStatus {
        self.status
    }

    pub fn bed_temperature(&self) -> Temperature {
        self.bed
    }

    pub fn tool_temperatures(&self) -> &[Temperature] {
        &self.tools
    }

    pub fn active_tool(&self) -> Option<u32> {
        self.active_tool
    }

    pub fn ambient_temperature(&self) -> Option<f64> {
        self.ambient
    }

    pub fn job(&self) -> &JobInfo {
        &self.job
    }

    pub fn file_progress(&self) -> &FileProgress {
        &self.file_progress
    }

    pub fn machine_info(&self) -> &MachineInfo {
        &self.machine
    }

    pub fn firmware(&self) -> &FirmwareInfo {
        &self.firmware
    }

    pub fn cpu_info(&self) -> &CpuInfo {
        &self.cpu
    }

    pub fn psu_on(&self) -> Option<bool> {
        self.psu_on
    }

    pub fn filament_sensor(&self) -> Option<FilamentSensorState> {
        self.filament
    }

    pub fn webcam_settings(&self) -> &WebcamSettings {
        &self.webcam
    }

    pub fn latency_ms(&self) -> Option<u32> {
        self.latency_ms
    }

    /// True if any heater is still approaching its target.
    pub fn is_heating(&self) -> bool {
        self.bed.is_heating() || self.tools.iter().any(Temperature::is_heating)
    }

    // -------------------------------------------------------------------------
    // Setters (each returns whether the value changed)
    // -------------------------------------------------------------------------

    pub fn set_status(&mut self, status: PrinterStatus) -> bool {
        Self::assign(&mut self.status, status, &mut self.dirty, FieldId::Status)
    }

    pub fn set_bed_temperature(&mut self, temperature: Temperature) -> bool {
        if self.bed.target_differs(&temperature) {
            self.urgent.insert(FieldId::BedTemperature);
        }
        Self::assign(
            &mut self.bed,
            temperature,
            &mut self.dirty,
            FieldId::BedTemperature,
        )
    }

    /// Sets the reading of tool `index`, growing the tool list as needed.
    pub fn set_tool_temperature(
        &mut self,
        index: usize,
        temperature: Temperature,
    ) -> CoreResult<bool> {
        if index >= MAX_TOOLS {
            return Err(CoreError::ToolOutOfRange {
                index,
                max: MAX_TOOLS - 1,
            });
        }
        if self.tools.len() <= index {
            self.tools.resize(index + 1, Temperature::default());
            self.dirty.insert(FieldId::ToolTemperatures);
        }
        if self.tools[index].target_differs(&temperature) {
            self.urgent.insert(FieldId::ToolTemperatures);
        }
        let changed = Self::assign(
            &mut self.tools[index],
            temperature,
            &mut self.dirty,
            FieldId::ToolTemperatures,
        );
        Ok(changed)
    }

    pub fn set_active_tool(&mut self, tool: Option<u32>) -> bool {
        Self::assign(&mut self.active_tool, tool, &mut self.dirty, FieldId::ActiveTool)
    }

    pub fn set_ambient_temperature(&mut self, value: Option<f64>) -> bool {
        if whole_degrees(self.ambient) == whole_degrees(value) {
            return false;
        }
        self.ambient = value;
        self.dirty.insert(FieldId::AmbientTemperature);
        true
    }

    /// Edits the job in place. Changing a job flag makes the update urgent.
    pub fn update_job(&mut self, edit: impl FnOnce(&mut JobInfo)) -> bool {
        let mut job = self.job.clone();
        edit(&mut job);
        if job.flag() != self.job.flag() {
            self.urgent.insert(FieldId::JobInfo);
        }
        Self::assign(&mut self.job, job, &mut self.dirty, FieldId::JobInfo)
    }

    pub fn update_file_progress(&mut self, edit: impl FnOnce(&mut FileProgress)) -> bool {
        let mut progress = self.file_progress.clone();
        edit(&mut progress);
        Self::assign(
            &mut self.file_progress,
            progress,
            &mut self.dirty,
            FieldId::FileProgress,
        )
    }

    pub fn set_machine_info(&mut self, info: MachineInfo) -> bool {
        Self::assign(&mut self.machine, info, &mut self.dirty, FieldId::MachineInfo)
    }

    pub fn set_firmware(&mut self, firmware: FirmwareInfo) -> bool {
        Self::assign(&mut self.firmware, firmware, &mut self.dirty, FieldId::Firmware)
    }

    pub fn set_cpu_info(&mut self, cpu: CpuInfo) -> bool {
        Self::assign(&mut self.cpu, cpu, &mut self.dirty, FieldId::CpuInfo)
    }

    pub fn set_psu(&mut self, on: Option<bool>) -> bool {
        Self::assign(&mut self.psu_on, on, &mut self.dirty, FieldId::PowerSupply)
    }

    pub fn set_filament_sensor(&mut self, state: Option<FilamentSensorState>) -> bool {
        Self::assign(&mut self.filament, state, &mut self.dirty, FieldId::FilamentSensor)
    }

    pub fn set_webcam_settings(&mut self, settings: WebcamSettings) -> bool {
        Self::assign(&mut self.webcam, settings, &mut self.dirty, FieldId::WebcamSettings)
    }

    pub fn set_latency(&mut self, latency_ms: Option<u32>) -> bool {
        Self::assign(&mut self.latency_ms, latency_ms, &mut self.dirty, FieldId::Latency)
    }
}
