// MIT License - Copyright (c) 2021 TJForc

//! Panel EPROM download planning, storage and decoding.

pub mod decode;
pub mod store;

use crate::constants::{MAX_DOWNLOAD_BLOCK, PanelCapabilities};

pub use decode::{decode, DecodedEprom, EpromField, FieldKind, SwitchRecord, ZoneRecord};
pub use store::{EpromRead, EpromStore};

/// EPROM addresses used by the decoder.
pub mod addr {
    pub const PANEL_TIME: u16 = 0x00F8;
    pub const SETTINGS: u16 = 0x0100;
    pub const PHONES: u16 = 0x0136;
    pub const USER_CODES: u16 = 0x01FA;
    pub const PGM_X10: u16 = 0x0214;
    pub const PARTITIONS: u16 = 0x0300;
    pub const ZONE_PARTITIONS: u16 = 0x0311;
    pub const FIRMWARE: u16 = 0x0400;
    pub const SERIAL: u16 = 0x0430;
    pub const POWERMAX_ZONES: u16 = 0x0900;
    pub const KEYPADS_2WAY: u16 = 0x0A00;
    pub const KEYPADS_1WAY: u16 = 0x0A20;
    pub const SIRENS: u16 = 0x0A60;
    pub const X10_NAMES: u16 = 0x0B30;
    pub const ZONE_NAMES: u16 = 0x0B40;
    pub const POWERMASTER_ZONES: u16 = 0xB872;
}

/// Record sizes of the per-device tables.
pub const POWERMAX_ZONE_LEN: usize = 4;
pub const POWERMASTER_ZONE_LEN: usize = 10;
pub const DEVICE_RECORD_LEN: usize = 4;
pub const X10_RECORD_LEN: usize = 9;
/// PGM plus 15 X10 units
pub const SWITCH_COUNT: usize = 16;

/// One download request: `len` bytes starting at (page, index).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRequest {
    pub page: u8,
    pub index: u8,
    pub len: u16,
}

impl BlockRequest {
    pub fn address(&self) -> u16 {
        u16::from_be_bytes([self.page, self.index])
    }

    /// Bytes patched into the DownloadBlock command: `[index, page, len_lo, len_hi]`.
    pub fn patch_bytes(&self) -> [u8; 4] {
        let [lo, hi] = self.len.to_le_bytes();
        [self.index, self.page, lo, hi]
    }
}

/// Address ranges (start, length) the decoder needs for a panel.
pub fn download_ranges(caps: &PanelCapabilities) -> Vec<(u16, usize)> {
    let zones = caps.zones as usize;
    let mut ranges = vec![
        (addr::PANEL_TIME, 6),
        (addr::SETTINGS, 0x20),
        (addr::PHONES, 4 * 8),
        (addr::USER_CODES, 8 * 2),
        (addr::PGM_X10, 0xD5),
        (addr::PARTITIONS, 0xF0),
        (addr::FIRMWARE, 0x20),
        (addr::SERIAL, 6),
        (addr::KEYPADS_2WAY, 8 * DEVICE_RECORD_LEN),
        (addr::KEYPADS_1WAY, 8 * DEVICE_RECORD_LEN),
        (addr::SIRENS, caps.sirens as usize * DEVICE_RECORD_LEN),
        (addr::X10_NAMES, SWITCH_COUNT),
        (addr::ZONE_NAMES, zones),
    ];
    if caps.powermaster {
        ranges.push((addr::POWERMASTER_ZONES, zones * POWERMASTER_ZONE_LEN));
    } else {
        ranges.push((addr::POWERMAX_ZONES, zones * POWERMAX_ZONE_LEN));
    }
    ranges
}

/// Split ranges into download requests of at most [`MAX_DOWNLOAD_BLOCK`] bytes.
pub fn plan_blocks(ranges: &[(u16, usize)]) -> Vec<BlockRequest> {
    let mut blocks = Vec::new();
    for &(start, len) in ranges {
        let mut offset = 0usize;
        while offset < len {
            let n = (len - offset).min(MAX_DOWNLOAD_BLOCK);
            let address = start as usize + offset;
            let Ok(address) = u16::try_from(address) else {
                break;
            };
            let [page, index] = address.to_be_bytes();
            blocks.push(BlockRequest { page, index, len: n as u16 });
            offset += n;
        }
    }
    blocks
}
