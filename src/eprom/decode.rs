// MIT License - Copyright (c) 2021 TJForc

//! Typed decoding of a downloaded EPROM image.
//!
//! Settings are described by a static field table. Malformed or missing
//! values degrade to empty strings; pages that were never downloaded are
//! reported in [`DecodedEprom::missing_pages`].

use std::collections::{BTreeMap, BTreeSet};

use crate::constants::{zone_name, PanelCapabilities, ZoneChime, ZoneType};
use crate::eprom::store::{EpromRead, EpromStore, SENTINEL};
use crate::eprom::{
    addr, DEVICE_RECORD_LEN, POWERMASTER_ZONE_LEN, POWERMAX_ZONE_LEN, SWITCH_COUNT, X10_RECORD_LEN,
};

/// How the bytes of a field are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Masked and shifted single byte, optionally enum-mapped
    Byte { mask: u8, shift: u8, names: Option<&'static [(u8, &'static str)]> },
    /// `[hour, minute]` rendered as `HH:MM`
    Time,
    /// Hex nibbles, `F` nibbles shown as `.`
    Code,
    /// Hex digits, `F` nibbles and 0xFF bytes skipped
    Phone,
    /// ASCII up to the first 0xFF
    Str,
    /// Plain hex, 0xFF bytes skipped
    Hex,
}

/// One setting descriptor.
#[derive(Debug, Clone, Copy)]
pub struct EpromField {
    pub name: &'static str,
    pub address: u16,
    pub len: usize,
    pub kind: FieldKind,
}

const BOOL_NAMES: &[(u8, &str)] = &[(0, "Off"), (1, "On")];
const BYPASS_NAMES: &[(u8, &str)] = &[(0, "No Bypass"), (1, "Force Arm"), (2, "Manual Bypass")];
const PIEZO_NAMES: &[(u8, &str)] = &[(0, "Enable"), (1, "Off when Home"), (2, "Disable")];

const fn byte(name: &'static str, address: u16) -> EpromField {
    EpromField { name, address, len: 1, kind: FieldKind::Byte { mask: 0xFF, shift: 0, names: None } }
}

const fn bits(
    name: &'static str,
    address: u16,
    mask: u8,
    shift: u8,
    names: &'static [(u8, &'static str)],
) -> EpromField {
    EpromField { name, address, len: 1, kind: FieldKind::Byte { mask, shift, names: Some(names) } }
}

const fn field(name: &'static str, address: u16, len: usize, kind: FieldKind) -> EpromField {
    EpromField { name, address, len, kind }
}

/// Settings decoded into [`DecodedEprom::settings`].
pub const SETTINGS: &[EpromField] = &[
    field("panel_time", addr::PANEL_TIME, 2, FieldKind::Time),
    byte("entry_delay_1", 0x0100),
    byte("entry_delay_2", 0x0101),
    byte("exit_delay", 0x0102),
    byte("bell_time", 0x0103),
    field("installer_code", 0x0106, 2, FieldKind::Code),
    field("master_code", 0x0108, 2, FieldKind::Code),
    field("download_code", 0x010A, 2, FieldKind::Code),
    bits("piezo_beeps", 0x0113, 0x30, 4, PIEZO_NAMES),
    bits("silent_panic", 0x0119, 0x10, 4, BOOL_NAMES),
    bits("quick_arm", 0x011A, 0x08, 3, BOOL_NAMES),
    bits("bypass_mode", 0x011B, 0xC0, 6, BYPASS_NAMES),
    field("phone_1", addr::PHONES, 8, FieldKind::Phone),
    field("phone_2", addr::PHONES + 8, 8, FieldKind::Phone),
    field("phone_3", addr::PHONES + 16, 8, FieldKind::Phone),
    field("phone_4", addr::PHONES + 24, 8, FieldKind::Phone),
    field("eprom_version", addr::FIRMWARE, 16, FieldKind::Str),
    field("software_version", addr::FIRMWARE + 16, 16, FieldKind::Str),
    field("panel_serial", addr::SERIAL, 6, FieldKind::Hex),
];

/// Render field bytes. Never fails; unusable data yields an empty string.
pub fn render(kind: FieldKind, data: &[u8]) -> String {
    match kind {
        FieldKind::Byte { mask, shift, names } => {
            let Some(&b) = data.first() else {
                return String::new();
            };
            let v = (b & mask) >> shift;
            match names {
                Some(table) => table
                    .iter()
                    .find(|(k, _)| *k == v)
                    .map_or_else(|| format!("Unknown ({v})"), |(_, n)| (*n).to_string()),
                None => v.to_string(),
            }
        }
        FieldKind::Time => match data {
            [h, m, ..] if *h < 24 && *m < 60 => format!("{h:02}:{m:02}"),
            _ => String::new(),
        },
        FieldKind::Code => data
            .iter()
            .flat_map(|b| [b >> 4, b & 0x0F])
            .map(|n| if n == 0x0F { '.' } else { char::from_digit(n as u32, 16).unwrap_or('.') })
            .collect::<String>()
            .to_uppercase(),
        FieldKind::Phone => data
            .iter()
            .filter(|&&b| b != SENTINEL)
            .flat_map(|b| [b >> 4, b & 0x0F])
            .filter(|&n| n != 0x0F)
            .filter_map(|n| char::from_digit(n as u32, 16))
            .collect(),
        FieldKind::Str => data
            .iter()
            .take_while(|&&b| b != SENTINEL)
            .filter(|b| b.is_ascii_graphic() || **b == b' ')
            .map(|&b| b as char)
            .collect::<String>()
            .trim()
            .to_string(),
        FieldKind::Hex => data
            .iter()
            .filter(|&&b| b != SENTINEL)
            .map(|b| format!("{b:02X}"))
            .collect(),
    }
}

/// A decoded zone record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneRecord {
    /// Zero-based zone index
    pub id: u32,
    pub enrolled: bool,
    pub sensor_code: u8,
    pub zone_type: ZoneType,
    pub chime: ZoneChime,
    pub name: String,
    pub partitions: Vec<u8>,
}

/// A decoded PGM/X10 record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchRecord {
    pub id: u32,
    pub enabled: bool,
    pub location: String,
}

/// Everything extracted from an EPROM image.
#[derive(Debug, Clone, Default)]
pub struct DecodedEprom {
    pub settings: BTreeMap<String, String>,
    pub zones: Vec<ZoneRecord>,
    pub switches: Vec<SwitchRecord>,
    pub keypads_1way: usize,
    pub keypads_2way: usize,
    pub sirens: usize,
    /// First user code, if it is a usable 4 digit PIN
    pub master_pin: Option<String>,
    pub missing_pages: BTreeSet<u8>,
}

impl DecodedEprom {
    pub fn is_complete(&self) -> bool {
        self.missing_pages.is_empty()
    }

    pub fn setting(&self, name: &str) -> Option<&str> {
        self.settings.get(name).map(String::as_str)
    }
}

struct Reader<'a> {
    store: &'a EpromStore,
    missing: BTreeSet<u8>,
}

impl Reader<'_> {
    fn read(&mut self, address: u16, len: usize) -> Vec<u8> {
        let EpromRead { data, missing } = self.store.read_addr(address, len);
        self.missing.extend(missing);
        data
    }
}

/// Count device slots whose record is neither blank nor unprogrammed.
fn count_present(data: &[u8], record_len: usize) -> usize {
    data.chunks(record_len)
        .filter(|rec| rec.iter().any(|&b| b != 0) && rec.iter().any(|&b| b != SENTINEL))
        .count()
}

fn partitions_for(bitmap: u8, partitions: u8) -> Vec<u8> {
    if partitions <= 1 {
        return vec![1];
    }
    (0..partitions).filter(|p| bitmap & (1 << p) != 0).map(|p| p + 1).collect()
}

/// Decode settings, zones, switches and device presence.
pub fn decode(store: &EpromStore, caps: &PanelCapabilities) -> DecodedEprom {
    let mut reader = Reader { store, missing: BTreeSet::new() };
    let mut out = DecodedEprom::default();

    for f in SETTINGS {
        let data = reader.read(f.address, f.len);
        out.settings.insert(f.name.to_string(), render(f.kind, &data));
    }

    let user1 = render(FieldKind::Code, &reader.read(addr::USER_CODES, 2));
    if user1.len() == 4 && !user1.contains('.') && user1 != "0000" {
        out.master_pin = Some(user1);
    }

    let zone_count = caps.zones as usize;
    let names = reader.read(addr::ZONE_NAMES, zone_count);
    let zone_parts = reader.read(addr::ZONE_PARTITIONS, zone_count);
    let (table, rec_len) = if caps.powermaster {
        (reader.read(addr::POWERMASTER_ZONES, zone_count * POWERMASTER_ZONE_LEN), POWERMASTER_ZONE_LEN)
    } else {
        (reader.read(addr::POWERMAX_ZONES, zone_count * POWERMAX_ZONE_LEN), POWERMAX_ZONE_LEN)
    };
    for (i, rec) in table.chunks(rec_len).enumerate() {
        let (enrolled, sensor_code, info) = if caps.powermaster {
            (rec[4..7].iter().any(|&b| b != 0), rec[5], rec[8])
        } else {
            (rec[0..3].iter().any(|&b| b != 0), rec[2], rec[3])
        };
        // An unwritten record reads as all sentinel bytes
        let enrolled = enrolled && rec.iter().any(|&b| b != SENTINEL);
        out.zones.push(ZoneRecord {
            id: i as u32,
            enrolled,
            sensor_code,
            zone_type: ZoneType::from_u8(info & 0x0F),
            chime: ZoneChime::from_u8((info >> 4) & 0x03),
            name: zone_name(names[i]).to_string(),
            partitions: partitions_for(zone_parts[i], caps.partitions),
        });
    }

    let pgm = reader.read(addr::PGM_X10, SWITCH_COUNT * X10_RECORD_LEN);
    let x10_names = reader.read(addr::X10_NAMES, SWITCH_COUNT);
    let switch_count = if caps.x10_devices > 0 { SWITCH_COUNT } else { 1 };
    for (i, rec) in pgm.chunks(X10_RECORD_LEN).take(switch_count).enumerate() {
        let enabled = rec.iter().any(|&b| b != 0 && b != SENTINEL);
        let location = if i == 0 { "PGM".to_string() } else { zone_name(x10_names[i]).to_string() };
        out.switches.push(SwitchRecord { id: i as u32, enabled, location });
    }

    let k2 = reader.read(addr::KEYPADS_2WAY, 8 * DEVICE_RECORD_LEN);
    let k1 = reader.read(addr::KEYPADS_1WAY, 8 * DEVICE_RECORD_LEN);
    let sirens = reader.read(addr::SIRENS, caps.sirens as usize * DEVICE_RECORD_LEN);
    out.keypads_2way = count_present(&k2, DEVICE_RECORD_LEN).min(caps.keypads_2way as usize);
    out.keypads_1way = count_present(&k1, DEVICE_RECORD_LEN).min(caps.keypads_1way as usize);
    out.sirens = count_present(&sirens, DEVICE_RECORD_LEN);

    out.missing_pages = reader.missing;
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::panel_capabilities;
    use crate::eprom::{download_ranges, plan_blocks};

    fn blank_store(caps: &PanelCapabilities) -> EpromStore {
        let mut store = EpromStore::new();
        for block in plan_blocks(&download_ranges(caps)) {
            store.write(block.page, block.index, &vec![0u8; block.len as usize]);
        }
        store
    }

    #[test]
    fn test_render_kinds() {
        assert_eq!(render(FieldKind::Code, &[0x12, 0x34]), "1234");
        assert_eq!(render(FieldKind::Code, &[0xAB, 0xFF]), "AB..");
        assert_eq!(render(FieldKind::Phone, &[0x05, 0x55, 0x12, 0x3F, 0xFF, 0xFF]), "0555123");
        assert_eq!(render(FieldKind::Str, b"JS702412 \xFF\xFFxx"), "JS702412");
        assert_eq!(render(FieldKind::Time, &[7, 30]), "07:30");
        assert_eq!(render(FieldKind::Time, &[0xFF, 0xFF]), "");
        assert_eq!(render(FieldKind::Hex, &[0x12, 0xFF, 0xAB]), "12AB");
        let kind = FieldKind::Byte { mask: 0xC0, shift: 6, names: Some(BYPASS_NAMES) };
        assert_eq!(render(kind, &[0x80]), "Manual Bypass");
        assert_eq!(render(kind, &[0xC0]), "Unknown (3)");
    }

    #[test]
    fn test_decode_powermax_zones() {
        let caps = panel_capabilities(3).unwrap();
        let mut store = blank_store(caps);
        // Zone 1: enrolled motion sensor, Interior (12) with melody chime, name "Living Room"
        store.write_addr(addr::POWERMAX_ZONES + 4, &[0x12, 0x34, 0xE5, 0x1C]);
        store.write_addr(addr::ZONE_NAMES + 1, &[0x0F]);
        store.write_addr(addr::USER_CODES, &[0x12, 0x34]);
        store.write_addr(addr::FIRMWARE + 16, b"JS702412 K14.000");

        let decoded = decode(&store, caps);
        assert!(decoded.is_complete());
        assert_eq!(decoded.zones.len(), 30);
        assert!(!decoded.zones[0].enrolled);
        let z = &decoded.zones[1];
        assert!(z.enrolled);
        assert_eq!(z.sensor_code, 0xE5);
        assert_eq!(z.zone_type, ZoneType::Interior);
        assert_eq!(z.chime, ZoneChime::Melody);
        assert_eq!(z.name, zone_name(0x0F));
        assert_eq!(z.partitions, vec![1]);
        assert_eq!(decoded.master_pin.as_deref(), Some("1234"));
        assert_eq!(decoded.setting("software_version"), Some("JS702412 K14.000"));
        assert_eq!(decoded.switches.len(), 16);
    }

    #[test]
    fn test_decode_powermaster_zones_and_devices() {
        let caps = panel_capabilities(7).unwrap();
        let mut store = blank_store(caps);
        store.write_addr(
            addr::POWERMASTER_ZONES + 2 * POWERMASTER_ZONE_LEN as u16,
            &[0, 0, 0, 0, 0x01, 0x2A, 0x07, 0, 0x07, 0],
        );
        store.write_addr(addr::ZONE_PARTITIONS + 2, &[0b101]);
        store.write_addr(addr::KEYPADS_2WAY, &[1, 2, 3, 4, 0, 0, 0, 0, 5, 6, 7, 8]);
        store.write_addr(addr::SIRENS + 4, &[9, 9, 9, 9]);

        let decoded = decode(&store, caps);
        let z = &decoded.zones[2];
        assert!(z.enrolled);
        assert_eq!(z.sensor_code, 0x2A);
        assert_eq!(z.zone_type, ZoneType::Perimeter);
        assert_eq!(z.partitions, vec![1, 3]);
        assert_eq!(decoded.keypads_2way, 2);
        assert_eq!(decoded.sirens, 1);
        assert!(decoded.master_pin.is_none());
        assert_eq!(decoded.switches.len(), 1);
    }

    #[test]
    fn test_decode_reports_missing_pages() {
        let caps = panel_capabilities(0).unwrap();
        let decoded = decode(&EpromStore::new(), caps);
        assert!(!decoded.is_complete());
        assert!(decoded.missing_pages.contains(&0x09));
        // Unwritten zone records are never enrolled
        assert!(decoded.zones.iter().all(|z| !z.enrolled));
    }
}
