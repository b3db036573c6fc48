// MIT License - Copyright (c) 2021 TJForc

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bitflags::bitflags;
use chrono::{DateTime, Utc};

use crate::constants::{ZoneChime, ZoneType};

bitflags! {
    /// Sensor state bits maintained from A5 status bitmaps.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SensorStatusFlags: u16 {
        /// Zone open (or motion seen)
        const OPEN          = 1 << 0;
        const TAMPER        = 1 << 1;
        const LOW_BATTERY   = 1 << 2;
        const BYPASS        = 1 << 3;
        const ENROLLED      = 1 << 4;
        /// Zone is in alarm
        const ALARM         = 1 << 5;
        const TAMPER_ALARM  = 1 << 6;
    }
}

impl SensorStatusFlags {
    /// Get the flags that changed between old and new status.
    pub fn changed(old: Self, new: Self) -> Self {
        old ^ new
    }

    /// Get human-readable event names for flags that became set.
    pub fn set_event_names(changed: Self, new: Self) -> Vec<&'static str> {
        let became_set = changed & new;
        let mut events = Vec::new();
        if became_set.contains(Self::OPEN) { events.push("Open"); }
        if became_set.contains(Self::TAMPER) { events.push("Tamper"); }
        if became_set.contains(Self::LOW_BATTERY) { events.push("LowBattery"); }
        if became_set.contains(Self::BYPASS) { events.push("Bypassed"); }
        if became_set.contains(Self::ENROLLED) { events.push("Enrolled"); }
        if became_set.contains(Self::ALARM) { events.push("Alarm"); }
        if became_set.contains(Self::TAMPER_ALARM) { events.push("TamperAlarm"); }
        events
    }
}

/// Physical kind of sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SensorType {
    Motion,
    Magnet,
    Camera,
    Wired,
    Smoke,
    Gas,
    Flood,
    Vibration,
    Shock,
    Temperature,
    Unknown,
}

impl SensorType {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Motion => "Motion",
            Self::Magnet => "Magnet",
            Self::Camera => "Camera",
            Self::Wired => "Wired",
            Self::Smoke => "Smoke",
            Self::Gas => "Gas",
            Self::Flood => "Flood",
            Self::Vibration => "Vibration",
            Self::Shock => "Shock",
            Self::Temperature => "Temperature",
            Self::Unknown => "Unknown",
        }
    }

    /// Parse a case-insensitive type name, as used in config files.
    pub fn from_name(name: &str) -> Option<Self> {
        let t = match name.to_lowercase().as_str() {
            "motion" => Self::Motion,
            "magnet" => Self::Magnet,
            "camera" => Self::Camera,
            "wired" => Self::Wired,
            "smoke" => Self::Smoke,
            "gas" => Self::Gas,
            "flood" => Self::Flood,
            "vibration" => Self::Vibration,
            "shock" => Self::Shock,
            "temperature" => Self::Temperature,
            "unknown" => Self::Unknown,
            _ => return None,
        };
        Some(t)
    }
}

/// One vendor sensor code entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorModel {
    pub model: String,
    pub sensor_type: SensorType,
}

/// Vendor sensor-code tables.
///
/// Several codes were identified by observation and vary between firmware
/// batches, so the tables are plain data and can be replaced or patched.
#[derive(Debug, Clone)]
pub struct SensorCatalog {
    entries: HashMap<u8, SensorModel>,
    /// PowerMax panels fall back to a low-nibble generic classification
    generic_fallback: bool,
}

const POWERMAX_SENSORS: &[(u8, &str, SensorType)] = &[
    (0x6D, "MCX-601 Wireless Repeater", SensorType::Unknown),
    (0x75, "Next+ K9-85 MCW", SensorType::Motion),
    (0x7A, "MCT-550", SensorType::Flood),
    (0x8A, "MCT-302", SensorType::Magnet),
    (0x93, "Next MCW", SensorType::Motion),
    (0x95, "MCT-302", SensorType::Magnet),
    (0x96, "MCT-302", SensorType::Magnet),
    (0x97, "MCT-302", SensorType::Magnet),
    (0xC0, "Next K9-85", SensorType::Motion),
    (0xC3, "MCT-426", SensorType::Smoke),
    (0xC4, "MCT-426", SensorType::Smoke),
    (0xC5, "MCT-441", SensorType::Gas),
    (0xD3, "Next MCW", SensorType::Motion),
    (0xD5, "Next K9", SensorType::Motion),
    (0xE4, "Next MCW", SensorType::Motion),
    (0xE5, "Next K9-85", SensorType::Motion),
    (0xF3, "MCPIR-3000", SensorType::Motion),
    (0xF9, "MCT-100 Universal", SensorType::Magnet),
    (0xFA, "MCW-K980", SensorType::Motion),
    (0xFB, "MCT-100", SensorType::Magnet),
    (0xFE, "Wired", SensorType::Wired),
];

const POWERMASTER_SENSORS: &[(u8, &str, SensorType)] = &[
    (0x01, "Next PG2", SensorType::Motion),
    (0x03, "Clip PG2", SensorType::Motion),
    (0x04, "Next CAM PG2", SensorType::Camera),
    (0x05, "GB-502 PG2", SensorType::Unknown),
    (0x06, "TOWER-32AM PG2", SensorType::Motion),
    (0x07, "TOWER-32AMK9", SensorType::Motion),
    (0x0A, "TOWER CAM PG2", SensorType::Camera),
    (0x0C, "MP-802 PG2", SensorType::Motion),
    (0x0F, "MP-902 PG2", SensorType::Motion),
    (0x15, "SMD-426 PG2", SensorType::Smoke),
    (0x16, "SMD-429 PG2", SensorType::Smoke),
    (0x18, "GSD-442 PG2", SensorType::Gas),
    (0x19, "FLD-550 PG2", SensorType::Flood),
    (0x1A, "TMD-560 PG2", SensorType::Temperature),
    (0x1E, "SMD-429 PG2", SensorType::Smoke),
    (0x29, "MC-302V PG2", SensorType::Magnet),
    (0x2A, "MC-302 PG2", SensorType::Magnet),
    (0x2C, "MC-303V PG2", SensorType::Magnet),
    (0x2D, "MC-302V PG2", SensorType::Magnet),
    (0x35, "SD-304 PG2", SensorType::Shock),
    (0xFE, "Wired", SensorType::Wired),
];

impl SensorCatalog {
    fn from_table(table: &[(u8, &str, SensorType)], generic_fallback: bool) -> Self {
        let entries = table
            .iter()
            .map(|(code, model, sensor_type)| {
                (*code, SensorModel { model: (*model).to_string(), sensor_type: *sensor_type })
            })
            .collect();
        Self { entries, generic_fallback }
    }

    pub fn powermax() -> Self {
        Self::from_table(POWERMAX_SENSORS, true)
    }

    pub fn powermaster() -> Self {
        Self::from_table(POWERMASTER_SENSORS, false)
    }

    /// Catalog for a panel family.
    pub fn for_panel(powermaster: bool) -> Self {
        if powermaster { Self::powermaster() } else { Self::powermax() }
    }

    /// Replace or add entries for specific vendor codes.
    pub fn with_overrides(mut self, overrides: &HashMap<u8, SensorType>) -> Self {
        for (code, sensor_type) in overrides {
            let model = self
                .entries
                .get(code)
                .map(|m| m.model.clone())
                .unwrap_or_else(|| format!("Custom {code:#04X}"));
            self.entries.insert(*code, SensorModel { model, sensor_type: *sensor_type });
        }
        self
    }

    pub fn insert(&mut self, code: u8, model: impl Into<String>, sensor_type: SensorType) {
        self.entries.insert(code, SensorModel { model: model.into(), sensor_type });
    }

    /// Resolve a vendor code to (model, type).
    pub fn lookup(&self, code: u8) -> (Option<&str>, SensorType) {
        if let Some(m) = self.entries.get(&code) {
            return (Some(m.model.as_str()), m.sensor_type);
        }
        if self.generic_fallback {
            return (None, generic_powermax_type(code & 0x0F));
        }
        (None, SensorType::Unknown)
    }
}

fn generic_powermax_type(nibble: u8) -> SensorType {
    match nibble {
        0x00 => SensorType::Vibration,
        0x02 => SensorType::Shock,
        0x03 | 0x04 | 0x0C => SensorType::Motion,
        0x05..=0x09 => SensorType::Magnet,
        0x0A => SensorType::Smoke,
        0x0B => SensorType::Gas,
        0x0F => SensorType::Wired,
        _ => SensorType::Unknown,
    }
}

/// A wireless or wired sensor in one zone.
#[derive(Debug, Clone)]
pub struct Sensor {
    /// Zero-based zone index
    pub id: u32,
    pub zone_name: String,
    pub zone_type: ZoneType,
    pub chime: ZoneChime,
    pub sensor_type: SensorType,
    pub model: Option<String>,
    /// 1-based partitions this zone belongs to
    pub partitions: Vec<u8>,
    pub status: SensorStatusFlags,
    pub triggered: bool,
    pub trigger_time: Option<DateTime<Utc>>,
    triggered_at: Option<Instant>,
}

impl Sensor {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            zone_name: String::new(),
            zone_type: ZoneType::NonAlarm,
            chime: ZoneChime::Off,
            sensor_type: SensorType::Unknown,
            model: None,
            partitions: vec![1],
            status: SensorStatusFlags::ENROLLED,
            triggered: false,
            trigger_time: None,
            triggered_at: None,
        }
    }

    /// Set or clear one flag. Returns the changed flags.
    pub fn set_flag(&mut self, flag: SensorStatusFlags, on: bool) -> SensorStatusFlags {
        let old = self.status;
        self.status.set(flag, on);
        SensorStatusFlags::changed(old, self.status)
    }

    /// Update the open state. A closed→open transition marks the sensor
    /// triggered; closing leaves `triggered` to the off-delay sweep.
    pub fn set_open(&mut self, open: bool, now: Instant) -> SensorStatusFlags {
        let was_open = self.is_open();
        let changed = self.set_flag(SensorStatusFlags::OPEN, open);
        if open && !was_open {
            self.mark_triggered(now);
        }
        changed
    }

    /// Record activity (zone open or motion violation).
    pub fn mark_triggered(&mut self, now: Instant) {
        self.triggered = true;
        self.trigger_time = Some(Utc::now());
        self.triggered_at = Some(now);
    }

    /// Clear `triggered` once `off_delay` has passed. Returns true if cleared.
    pub fn expire_trigger(&mut self, now: Instant, off_delay: Duration) -> bool {
        match self.triggered_at {
            Some(at) if self.triggered && now.saturating_duration_since(at) >= off_delay => {
                self.triggered = false;
                self.triggered_at = None;
                true
            }
            _ => false,
        }
    }

    pub fn is_open(&self) -> bool { self.status.contains(SensorStatusFlags::OPEN) }
    pub fn is_tamper(&self) -> bool { self.status.contains(SensorStatusFlags::TAMPER) }
    pub fn is_low_battery(&self) -> bool { self.status.contains(SensorStatusFlags::LOW_BATTERY) }
    pub fn is_bypassed(&self) -> bool { self.status.contains(SensorStatusFlags::BYPASS) }
    pub fn is_enrolled(&self) -> bool { self.status.contains(SensorStatusFlags::ENROLLED) }
    pub fn is_alarm(&self) -> bool { self.status.contains(SensorStatusFlags::ALARM) }
}
