//! # Reported-State Fields
//!
//! Every leaf of the reported-state tree has a [`FieldId`]. Dirty tracking is
//! an explicit bitset over those ids, never reflection.
//!
//! ## Field Map
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  bit  FieldId             → EventKind (wire)                            │
//! │  ───  ──────────────────    ──────────────────                          │
//! │   0   Status              → state_change                                │
//! │   1   BedTemperature      → temps      ┐ coalesced into one            │
//! │   2   ToolTemperatures    → temps      ┘ envelope                      │
//! │   3   ActiveTool          → tool                                        │
//! │   4   AmbientTemperature  → ambient                                     │
//! │   5   JobInfo             → job_info                                    │
//! │   6   FileProgress        → file_progress                               │
//! │   7   MachineInfo         → machine_data                                │
//! │   8   Firmware            → firmware                                    │
//! │   9   CpuInfo             → cpu_info                                    │
//! │  10   PowerSupply         → psu                                         │
//! │  11   FilamentSensor      → filament_sensor                             │
//! │  12   WebcamSettings      → webcam                                      │
//! │  13   Latency             → latency                                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use crate::event::EventKind;

// =============================================================================
// Field Id
// =============================================================================

/// Identifier of one reported-state leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FieldId {
    Status,
    BedTemperature,
    ToolTemperatures,
    ActiveTool,
    AmbientTemperature,
    JobInfo,
    FileProgress,
    MachineInfo,
    Firmware,
    CpuInfo,
    PowerSupply,
    FilamentSensor,
    WebcamSettings,
    Latency,
}

impl FieldId {
    /// All fields, in bit order.
    pub const ALL: [FieldId; 14] = [
        FieldId::Status,
        FieldId::BedTemperature,
        FieldId::ToolTemperatures,
        FieldId::ActiveTool,
        FieldId::AmbientTemperature,
        FieldId::JobInfo,
        FieldId::FileProgress,
        FieldId::MachineInfo,
        FieldId::Firmware,
        FieldId::CpuInfo,
        FieldId::PowerSupply,
        FieldId::FilamentSensor,
        FieldId::WebcamSettings,
        FieldId::Latency,
    ];

    #[inline]
    const fn bit(self) -> u32 {
        1 << (self as u32)
    }

    /// The outbound event kind this field is reported through.
    ///
    /// This is the static field → event-kind map; several fields may share
    /// one kind and are then coalesced into a single envelope.
    pub const fn event_kind(self) -> EventKind {
        match self {
            FieldId::Status => EventKind::StateChange,
            FieldId::BedTemperature | FieldId::ToolTemperatures => EventKind::Temperatures,
            FieldId::ActiveTool => EventKind::Tool,
            FieldId::AmbientTemperature => EventKind::Ambient,
            FieldId::JobInfo => EventKind::JobInfo,
            FieldId::FileProgress => EventKind::FileProgress,
            FieldId::MachineInfo => EventKind::MachineData,
            FieldId::Firmware => EventKind::Firmware,
            FieldId::CpuInfo => EventKind::CpuInfo,
            FieldId::PowerSupply => EventKind::PowerSupply,
            FieldId::FilamentSensor => EventKind::FilamentSensor,
            FieldId::WebcamSettings => EventKind::Webcam,
            FieldId::Latency => EventKind::Latency,
        }
    }

    /// Stable name used in logs.
    pub const fn name(self) -> &'static str {
        match self {
            FieldId::Status => "status",
            FieldId::BedTemperature => "bed_temperature",
            FieldId::ToolTemperatures => "tool_temperatures",
            FieldId::ActiveTool => "active_tool",
            FieldId::AmbientTemperature => "ambient_temperature",
            FieldId::JobInfo => "job_info",
            FieldId::FileProgress => "file_progress",
            FieldId::MachineInfo => "machine_info",
            FieldId::Firmware => "firmware",
            FieldId::CpuInfo => "cpu_info",
            FieldId::PowerSupply => "power_supply",
            FieldId::FilamentSensor => "filament_sensor",
            FieldId::WebcamSettings => "webcam_settings",
            FieldId::Latency => "latency",
        }
    }
}

impl std::fmt::Display for FieldId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Field Set (bitset)
// =============================================================================

/// A set of [`FieldId`]s packed into a single word.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FieldSet(u32);

impl FieldSet {
    /// The empty set.
    pub const fn empty() -> Self {
        FieldSet(0)
    }

    /// Every field.
    pub fn all() -> Self {
        FieldId::ALL.iter().copied().collect()
    }

    /// Set containing exactly one field.
    pub const fn only(field: FieldId) -> Self {
        FieldSet(field.bit())
    }

    pub fn insert(&mut self, field: FieldId) {
        self.0 |= field.bit();
    }

    pub fn remove(&mut self, field: FieldId) {
        self.0 &= !field.bit();
    }

    pub const fn contains(&self, field: FieldId) -> bool {
        self.0 & field.bit() != 0
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub const fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    /// Fields present in both sets.
    pub const fn intersection(self, other: FieldSet) -> FieldSet {
        FieldSet(self.0 & other.0)
    }

    /// Fields present in either set.
    pub const fn union(self, other: FieldSet) -> FieldSet {
        FieldSet(self.0 | other.0)
    }

    /// Fields in `self` that are not in `other`.
    pub const fn difference(self, other: FieldSet) -> FieldSet {
        FieldSet(self.0 & !other.0)
    }

    /// Iterates fields in bit order.
    pub fn iter(&self) -> impl Iterator<Item = FieldId> + '_ {
        FieldId::ALL.iter().copied().filter(|f| self.contains(*f))
    }

    /// Distinct event kinds covered by this set, in field order.
    pub fn event_kinds(&self) -> Vec<EventKind> {
        let mut kinds: Vec<EventKind> = Vec::new();
        for field in self.iter() {
            let kind = field.event_kind();
            if !kinds.contains(&kind) {
                kinds.push(kind);
            }
        }
        kinds
    }
}

impl FromIterator<FieldId> for FieldSet {
    fn from_iter<I: IntoIterator<Item = FieldId>>(iter: I) -> Self {
        let mut set = FieldSet::empty();
        for field in iter {
            set.insert(field);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitset_basics() {
        let mut set = FieldSet::empty();
        assert!(set.is_empty());

        set.insert(FieldId::Status);
        set.insert(FieldId::Status);
        set.insert(FieldId::Latency);
        assert_eq!(set.len(), 2);
        assert!(set.contains(FieldId::Latency));

        set.remove(FieldId::Status);
        assert!(!set.contains(FieldId::Status));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_all_covers_every_field() {
        assert_eq!(FieldSet::all().len(), FieldId::ALL.len());
    }

    #[test]
    fn test_temperatures_coalesce_to_one_kind() {
        let set: FieldSet = [FieldId::BedTemperature, FieldId::ToolTemperatures, FieldId::Status]
            .into_iter()
            .collect();
        assert_eq!(
            set.event_kinds(),
            vec![EventKind::StateChange, EventKind::Temperatures]
        );
    }

    #[test]
    fn test_set_algebra() {
        let a: FieldSet = [FieldId::Status, FieldId::JobInfo].into_iter().collect();
        let b = FieldSet::only(FieldId::JobInfo);
        assert_eq!(a.intersection(b), b);
        assert_eq!(a.difference(b), FieldSet::only(FieldId::Status));
        assert_eq!(b.union(FieldSet::only(FieldId::Status)), a);
    }
}
