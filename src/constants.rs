// MIT License - Copyright (c) 2021 TJForc

use std::time::Duration;

/// Protocol framing bytes.
pub const PREAMBLE: u8 = 0x0D; // Start of every PDU
pub const POSTAMBLE: u8 = 0x0A; // End of every PDU
pub const TRAILER: u8 = 0x43; // Closing byte of most 11-byte command bodies

/// Cap on a PDU of unknown length before the framer gives up and resyncs.
pub const MAX_PDU_LEN: usize = 0xB0;

/// Largest EPROM chunk requested in a single download block.
pub const MAX_DOWNLOAD_BLOCK: usize = 0xB0;

/// Size of one EPROM page.
pub const EPROM_PAGE_SIZE: usize = 256;

/// Minimum spacing between two transmitted frames.
pub const MIN_INTER_MESSAGE_GAP: Duration = Duration::from_millis(150);

/// Period of the watchdog/keep-alive tick.
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Allowed drift between the panel clock and local time before a SetTime is queued.
pub const TIME_SYNC_TOLERANCE_SECS: i64 = 20;

/// Rolling window used to count watchdog timeouts.
pub const WATCHDOG_EVENT_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Panel types from this value upwards accept an unsolicited enroll request.
pub const AUTO_ENROLL_MIN_PANEL_TYPE: u8 = 3;

/// Zone name table, indexed by the 5-bit name code stored in the EPROM.
pub const ZONE_NAMES: [&str; 32] = [
    "Attic", "Back door", "Basement", "Bathroom", "Bedroom", "Child room", "Conservatory",
    "Play room", "Dining room", "Downstairs", "Emergency", "Fire", "Front door", "Garage",
    "Garage door", "Guest room", "Hall", "Kitchen", "Laundry room", "Living room",
    "Master bathroom", "Master bedroom", "Office", "Upstairs", "Utility room", "Yard",
    "Custom 1", "Custom 2", "Custom 3", "Custom 4", "Custom 5", "Not Installed",
];

/// Look up a zone name from its EPROM code.
pub fn zone_name(code: u8) -> &'static str {
    ZONE_NAMES[(code & 0x1F) as usize]
}

/// Zone types as programmed in the panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ZoneType {
    NonAlarm = 0,
    Emergency = 1,
    Flood = 2,
    Gas = 3,
    Delay1 = 4,
    Delay2 = 5,
    InteriorFollow = 6,
    Perimeter = 7,
    PerimeterFollow = 8,
    Silent24Hours = 9,
    Audible24Hours = 10,
    Fire = 11,
    Interior = 12,
    HomeDelay = 13,
    Temperature = 14,
    Outdoor = 15,
}

impl ZoneType {
    /// Decode the low nibble of a zone info byte.
    pub fn from_u8(v: u8) -> Self {
        match v & 0x0F {
            0 => Self::NonAlarm,
            1 => Self::Emergency,
            2 => Self::Flood,
            3 => Self::Gas,
            4 => Self::Delay1,
            5 => Self::Delay2,
            6 => Self::InteriorFollow,
            7 => Self::Perimeter,
            8 => Self::PerimeterFollow,
            9 => Self::Silent24Hours,
            10 => Self::Audible24Hours,
            11 => Self::Fire,
            12 => Self::Interior,
            13 => Self::HomeDelay,
            14 => Self::Temperature,
            _ => Self::Outdoor,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::NonAlarm => "Non-Alarm",
            Self::Emergency => "Emergency",
            Self::Flood => "Flood",
            Self::Gas => "Gas",
            Self::Delay1 => "Delay 1",
            Self::Delay2 => "Delay 2",
            Self::InteriorFollow => "Interior-Follow",
            Self::Perimeter => "Perimeter",
            Self::PerimeterFollow => "Perimeter-Follow",
            Self::Silent24Hours => "24 Hours Silent",
            Self::Audible24Hours => "24 Hours Audible",
            Self::Fire => "Fire",
            Self::Interior => "Interior",
            Self::HomeDelay => "Home Delay",
            Self::Temperature => "Temperature",
            Self::Outdoor => "Outdoor",
        }
    }
}

/// Zone chime setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ZoneChime {
    Off,
    Melody,
    ZoneName,
    Unknown,
}

impl ZoneChime {
    pub fn from_u8(v: u8) -> Self {
        match v & 0x03 {
            0 => Self::Off,
            1 => Self::Melody,
            2 => Self::ZoneName,
            _ => Self::Unknown,
        }
    }
}

/// Capabilities of one panel model, keyed by the panel type byte of the 0x3C message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PanelCapabilities {
    pub model: &'static str,
    pub zones: u8,
    pub partitions: u8,
    pub x10_devices: u8,
    pub keypads_1way: u8,
    pub keypads_2way: u8,
    pub sirens: u8,
    pub powermaster: bool,
}

const PANEL_CAPABILITIES: [PanelCapabilities; 9] = [
    PanelCapabilities { model: "PowerMax", zones: 30, partitions: 1, x10_devices: 0, keypads_1way: 8, keypads_2way: 2, sirens: 2, powermaster: false },
    PanelCapabilities { model: "PowerMax+", zones: 30, partitions: 1, x10_devices: 15, keypads_1way: 8, keypads_2way: 2, sirens: 2, powermaster: false },
    PanelCapabilities { model: "PowerMax Pro", zones: 30, partitions: 1, x10_devices: 15, keypads_1way: 8, keypads_2way: 2, sirens: 2, powermaster: false },
    PanelCapabilities { model: "PowerMax Complete", zones: 30, partitions: 1, x10_devices: 15, keypads_1way: 8, keypads_2way: 2, sirens: 2, powermaster: false },
    PanelCapabilities { model: "PowerMax Pro Part", zones: 30, partitions: 3, x10_devices: 15, keypads_1way: 8, keypads_2way: 2, sirens: 2, powermaster: false },
    PanelCapabilities { model: "PowerMax Complete Part", zones: 30, partitions: 3, x10_devices: 15, keypads_1way: 8, keypads_2way: 2, sirens: 2, powermaster: false },
    PanelCapabilities { model: "PowerMax Express", zones: 30, partitions: 1, x10_devices: 0, keypads_1way: 8, keypads_2way: 2, sirens: 2, powermaster: false },
    PanelCapabilities { model: "PowerMaster 10", zones: 30, partitions: 3, x10_devices: 0, keypads_1way: 0, keypads_2way: 8, sirens: 4, powermaster: true },
    PanelCapabilities { model: "PowerMaster 30", zones: 64, partitions: 3, x10_devices: 0, keypads_1way: 0, keypads_2way: 32, sirens: 8, powermaster: true },
];

/// Capabilities for a panel type, or `None` for types this library does not know.
pub fn panel_capabilities(panel_type: u8) -> Option<&'static PanelCapabilities> {
    PANEL_CAPABILITIES.get(panel_type as usize)
}

/// Alarm classification of a panel log event code.
pub fn alarm_type(code: u8) -> Option<&'static str> {
    match code {
        0x01..=0x05 => Some("Intruder"),
        0x06..=0x09 => Some("Tamper"),
        0x0B | 0x0C => Some("Panic"),
        0x0D => Some("Duress"),
        0x20 => Some("Fire"),
        0x23 => Some("Emergency"),
        0x49 => Some("Gas"),
        0x4B => Some("Flood"),
        _ => None,
    }
}

/// Trouble classification of a panel log event code.
pub fn trouble_type(code: u8) -> Option<&'static str> {
    match code {
        0x0A | 0x31 => Some("Communication"),
        0x0F => Some("General"),
        0x29 | 0x2D | 0x38 | 0x3B | 0x3C => Some("Battery"),
        0x2B | 0x36 => Some("Power"),
        0x2F => Some("Jamming"),
        0x33 => Some("Telephone"),
        _ => None,
    }
}

/// Event codes that end an active alarm.
pub const SIREN_CANCEL_CODES: [u8; 2] = [0x1B, 0x53];

/// Entry-delay related codes that must neither raise nor clear the siren state.
pub const SIREN_IGNORE_CODES: [u8; 2] = [0x13, 0x1F];

/// Event codes raising a tamper condition, and the codes restoring it.
pub const TAMPER_CODES: [u8; 4] = [0x06, 0x07, 0x08, 0x09];
pub const TAMPER_RESTORE_CODES: [u8; 4] = [0x16, 0x17, 0x18, 0x19];

/// "System Reset" event code.
pub const PANEL_RESET_CODE: u8 = 0x5E;

/// Human readable name of a panel log event code.
pub fn log_event_name(code: u8) -> &'static str {
    match code {
        0x00 => "None",
        0x01 => "Interior Alarm",
        0x02 => "Perimeter Alarm",
        0x03 => "Delay Alarm",
        0x04 => "24h Silent Alarm",
        0x05 => "24h Audible Alarm",
        0x06 => "Tamper",
        0x07 => "Control Panel Tamper",
        0x08 | 0x09 => "Tamper Alarm",
        0x0A => "Communication Loss",
        0x0B => "Panic From Keyfob",
        0x0C => "Panic From Control Panel",
        0x0D => "Duress",
        0x0E => "Confirm Alarm",
        0x0F => "General Trouble",
        0x10 => "General Trouble Restore",
        0x11 => "Interior Restore",
        0x12 => "Perimeter Restore",
        0x13 => "Delay Restore",
        0x14 => "24h Silent Restore",
        0x15 => "24h Audible Restore",
        0x16 | 0x18 | 0x19 => "Tamper Restore",
        0x17 => "Control Panel Tamper Restore",
        0x1A => "Communication Restore",
        0x1B => "Cancel Alarm",
        0x1C => "General Restore",
        0x1D => "Trouble Restore",
        0x1F => "Recent Close",
        0x20 => "Fire",
        0x21 => "Fire Restore",
        0x22 => "Not Active",
        0x23 => "Emergency",
        0x24 => "Remove User",
        0x25 => "Disarm Latchkey",
        0x26 => "Confirm Alarm Emergency",
        0x27 => "Supervision (Inactive)",
        0x28 => "Supervision Restore (Active)",
        0x29 => "Low Battery",
        0x2A => "Low Battery Restore",
        0x2B => "AC Fail",
        0x2C => "AC Restore",
        0x2D => "Control Panel Low Battery",
        0x2E => "Control Panel Low Battery Restore",
        0x2F => "RF Jamming",
        0x30 => "RF Jamming Restore",
        0x31 => "Communications Failure",
        0x32 => "Communications Restore",
        0x33 => "Telephone Line Failure",
        0x34 => "Telephone Line Restore",
        0x35 => "Auto Test",
        0x36 => "Fuse Failure",
        0x37 => "Fuse Restore",
        0x38 => "Keyfob Low Battery",
        0x39 => "Keyfob Low Battery Restore",
        0x3A => "Engineer Reset",
        0x3B => "Battery Disconnect",
        0x3C => "1-Way Keypad Low Battery",
        0x3D => "1-Way Keypad Low Battery Restore",
        0x49 => "Gas Trouble",
        0x4A => "Gas Trouble Restore",
        0x4B => "Flood Alert",
        0x4C => "Flood Alert Restore",
        0x4D => "X-10 Trouble",
        0x4E => "X-10 Trouble Restore",
        0x4F => "Arm Home",
        0x50 => "Arm Away",
        0x51 => "Quick Arm Home",
        0x52 => "Quick Arm Away",
        0x53 => "Disarm",
        0x54 => "Fail To Auto-Arm",
        0x55 => "Enter To Test Mode",
        0x56 => "Exit From Test Mode",
        0x57 => "Force Arm",
        0x58 => "Auto Arm",
        0x59 => "Instant Arm",
        0x5A => "Bypass",
        0x5B => "Fail To Arm",
        0x5C => "Door Open",
        0x5D => "Communication Established By Control Panel",
        0x5E => "System Reset",
        0x5F => "Installer Programming",
        0x60 => "Wrong Password",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zone_name_masks_code() {
        assert_eq!(zone_name(0), "Attic");
        assert_eq!(zone_name(0x1F), "Not Installed");
        assert_eq!(zone_name(0x20 | 12), "Front door");
    }

    #[test]
    fn test_zone_type_nibble() {
        assert_eq!(ZoneType::from_u8(0x04), ZoneType::Delay1);
        assert_eq!(ZoneType::from_u8(0x3C), ZoneType::Interior);
        assert_eq!(ZoneType::Perimeter.name(), "Perimeter");
    }

    #[test]
    fn test_panel_capabilities() {
        assert_eq!(panel_capabilities(0).map(|c| c.zones), Some(30));
        assert_eq!(panel_capabilities(8).map(|c| c.zones), Some(64));
        assert!(panel_capabilities(7).is_some_and(|c| c.powermaster));
        assert!(panel_capabilities(42).is_none());
    }

    #[test]
    fn test_alarm_and_trouble_types() {
        assert_eq!(alarm_type(0x03), Some("Intruder"));
        assert_eq!(alarm_type(0x20), Some("Fire"));
        assert_eq!(alarm_type(0x1B), None);
        assert_eq!(trouble_type(0x29), Some("Battery"));
        assert_eq!(log_event_name(PANEL_RESET_CODE), "System Reset");
    }
}
