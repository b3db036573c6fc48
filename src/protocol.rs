// MIT License - Copyright (c) 2021 TJForc

use std::time::Duration;

use crate::checksum;
use crate::config::ArmMode;
use crate::error::{Result, VisonicError};

/// Receive-side message type codes.
pub mod msg_type {
    pub const ACK: u8 = 0x02;
    pub const TIMEOUT: u8 = 0x06;
    pub const ACCESS_DENIED: u8 = 0x08;
    pub const STOP: u8 = 0x0B;
    pub const EXIT: u8 = 0x0F;
    pub const LEGACY_PANEL_INFO: u8 = 0x22;
    pub const DOWNLOAD_RETRY: u8 = 0x25;
    pub const SETTINGS_BLOCK: u8 = 0x33;
    pub const PANEL_INFO: u8 = 0x3C;
    pub const DOWNLOAD_BLOCK: u8 = 0x3F;
    pub const EVENT_LOG: u8 = 0xA0;
    pub const ZONE_NAMES: u8 = 0xA3;
    pub const STATUS: u8 = 0xA5;
    pub const ZONE_TYPES: u8 = 0xA6;
    pub const PANEL_STATUS_CHANGE: u8 = 0xA7;
    pub const POWERLINK: u8 = 0xAB;
    pub const X10_NAMES: u8 = 0xAC;
    pub const IMAGE_RESPONSE: u8 = 0xAD;
    pub const POWERMASTER: u8 = 0xB0;
    pub const NOISE: u8 = 0xF1;
    pub const IMAGE_MANAGEMENT: u8 = 0xF4;
}

/// How the framer should delimit a message type.
///
/// `length` counts the whole PDU including preamble, type, checksum and
/// postamble. A length of zero means "terminate on the postamble".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageLayout {
    pub length: usize,
    pub ack_needed: bool,
    /// Buffer length at which the next byte is a variable-length count.
    pub length_byte_pos: Option<usize>,
    /// Early-termination window for types that sometimes arrive short.
    pub flexible: usize,
}

const fn layout(length: usize, ack_needed: bool) -> MessageLayout {
    MessageLayout { length, ack_needed, length_byte_pos: None, flexible: 0 }
}

/// Static type table for messages received from the panel.
pub fn message_layout(t: u8) -> Option<MessageLayout> {
    use msg_type::*;
    let s = match t {
        ACK => layout(0, false),
        TIMEOUT => layout(0, true),
        ACCESS_DENIED => layout(0, true),
        STOP => layout(0, true),
        EXIT => layout(0, false),
        LEGACY_PANEL_INFO | DOWNLOAD_RETRY | SETTINGS_BLOCK | PANEL_INFO => layout(14, true),
        DOWNLOAD_BLOCK => MessageLayout { length: 7, ack_needed: true, length_byte_pos: Some(4), flexible: 5 },
        EVENT_LOG | ZONE_NAMES | STATUS | ZONE_TYPES | PANEL_STATUS_CHANGE | X10_NAMES => layout(15, true),
        POWERLINK | IMAGE_RESPONSE => layout(15, false),
        POWERMASTER => MessageLayout { length: 8, ack_needed: true, length_byte_pos: Some(4), flexible: 2 },
        NOISE => layout(9, false),
        IMAGE_MANAGEMENT => MessageLayout { length: 0, ack_needed: false, length_byte_pos: None, flexible: 4 },
        _ => return None,
    };
    Some(s)
}

/// Type bytes that can never start a PDU; seeing one forces a resync.
pub fn is_pocket_sentinel(t: u8) -> bool {
    t == 0x00 || t == 0xFD
}

/// Commands that can be sent to the panel.
///
/// Each variant maps to an immutable template; variable parts are filled
/// in through a [`CommandBuilder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Ack,
    AckLong,
    /// Tells the panel a Powerlink module is present.
    Init,
    /// Enroll as a Powerlink module. Download code at offset 4.
    Enroll,
    /// Ask for a full status refresh in Powerlink mode.
    Restore,
    GetTime,
    Status,
    BypassStatus,
    /// PIN at offset 4.
    EventLog,
    /// Arm mode at offset 3, PIN at offset 4.
    Arm,
    /// PIN at 1, zone bitmap at 3.
    BypassEnable,
    /// PIN at 1, zone bitmap at 7.
    BypassDisable,
    /// Command at 6, device bitmap at 7.
    X10Pgm,
    ZoneNames,
    ZoneTypes,
    /// Enter download mode. Download code at offset 3.
    Download,
    /// `[index, page, len_lo, len_hi]` at offset 1.
    DownloadBlock,
    /// `[sec, min, hour, day, month, year - 2000]` at offset 3.
    SetTime,
    Start,
    Stop,
    Exit,
}

/// Static description of a command.
#[derive(Debug, Clone, Copy)]
pub struct CommandTemplate {
    pub data: &'static [u8],
    pub replies: &'static [u8],
    pub wait_for_ack: bool,
    pub download: bool,
    pub post_send_delay: Duration,
    pub description: &'static str,
}

impl Command {
    pub fn template(&self) -> CommandTemplate {
        const NONE: &[u8] = &[];
        let t = |data, replies, wait_for_ack, download, delay_ms: u64, description| CommandTemplate {
            data,
            replies,
            wait_for_ack,
            download,
            post_send_delay: Duration::from_millis(delay_ms),
            description,
        };
        match self {
            Self::Ack => t(&[0x02], NONE, false, false, 0, "Ack"),
            Self::AckLong => t(&[0x02, 0x43], NONE, false, false, 0, "Ack Long"),
            Self::Init => t(&[0xAB, 0x0A, 0x00, 0x01, 0, 0, 0, 0, 0, 0, 0, 0x43], NONE, true, false, 3000, "Initializing PowerMax/Master PowerLink Connection"),
            Self::Enroll => t(&[0xAB, 0x0A, 0x00, 0x00, 0x99, 0x99, 0, 0, 0, 0, 0, 0x43], NONE, true, false, 2500, "Auto-Enroll of the PowerMax/Master"),
            Self::Restore => t(&[0xAB, 0x06, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x43], &[0xA5], true, false, 0, "Restore PowerMax/Master Connection"),
            Self::GetTime => t(&[0xAB, 0x01, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x43], &[0xAB], true, false, 0, "Get Panel Time"),
            Self::Status => t(&[0xA2, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x43], &[0xA5], true, false, 0, "Getting Status"),
            Self::BypassStatus => t(&[0xA2, 0, 0, 0x20, 0, 0, 0, 0, 0, 0, 0, 0x43], &[0xA5], true, false, 0, "Bypass Status"),
            Self::EventLog => t(&[0xA0, 0, 0, 0, 0x99, 0x99, 0, 0, 0, 0, 0, 0x43], &[0xA0], true, false, 0, "Retrieving Event Log"),
            Self::Arm => t(&[0xA1, 0, 0, 0x99, 0x99, 0x99, 0, 0, 0, 0, 0, 0x43], NONE, true, false, 0, "(Dis)Arming System"),
            Self::BypassEnable => t(&[0xAA, 0x99, 0x99, 0x99, 0x99, 0x99, 0x99, 0, 0, 0, 0, 0x43], NONE, true, false, 0, "Bypassing Zones"),
            Self::BypassDisable => t(&[0xAA, 0x99, 0x99, 0, 0, 0, 0, 0x99, 0x99, 0x99, 0x99, 0x43], NONE, true, false, 0, "Restoring Bypassed Zones"),
            Self::X10Pgm => t(&[0xA4, 0, 0, 0, 0, 0, 0x99, 0x99, 0x99, 0, 0, 0x43], NONE, true, false, 0, "X10 Data"),
            Self::ZoneNames => t(&[0xA3, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x43], &[0xA3], true, false, 0, "Requesting Zone Names"),
            Self::ZoneTypes => t(&[0xA6, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x43], &[0xA6], true, false, 0, "Requesting Zone Types"),
            Self::Download => t(&[0x24, 0, 0, 0x99, 0x99, 0, 0, 0, 0, 0, 0], &[0x3C], false, true, 0, "Start Download Mode"),
            Self::DownloadBlock => t(&[0x3E, 0, 0, 0, 0, 0xB0, 0, 0, 0, 0, 0], &[0x3F], false, true, 0, "Download Data Block"),
            Self::SetTime => t(&[0x46, 0xF8, 0x00, 0x99, 0x99, 0x99, 0x99, 0x99, 0x99, 0xFF, 0xFF], NONE, true, false, 0, "Setting Time"),
            Self::Start => t(&[0x0A], &[0x0B], false, false, 0, "Start"),
            Self::Stop => t(&[0x0B], NONE, false, false, 0, "Stop"),
            Self::Exit => t(&[0x0F], NONE, false, false, 1500, "Exit Download Mode"),
        }
    }
}

/// Builds an [`OutboundCommand`] from a template plus byte patches.
///
/// Patches are checked for bounds and overlap in [`CommandBuilder::build`],
/// so a queued command is always well formed.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    command: Command,
    patches: Vec<(usize, Vec<u8>)>,
}

impl CommandBuilder {
    pub fn new(command: Command) -> Self {
        Self { command, patches: Vec::new() }
    }

    pub fn patch(mut self, offset: usize, bytes: impl Into<Vec<u8>>) -> Self {
        self.patches.push((offset, bytes.into()));
        self
    }

    pub fn build(self) -> Result<OutboundCommand> {
        let template = self.command.template();
        let mut body = template.data.to_vec();
        let mut used = vec![false; body.len()];
        for (offset, bytes) in &self.patches {
            let end = offset + bytes.len();
            if end > body.len() {
                return Err(VisonicError::PatchOutOfBounds {
                    offset: *offset,
                    len: bytes.len(),
                    template_len: body.len(),
                });
            }
            if used[*offset..end].iter().any(|u| *u) {
                return Err(VisonicError::PatchOverlap { offset: *offset });
            }
            used[*offset..end].iter_mut().for_each(|u| *u = true);
            body[*offset..end].copy_from_slice(bytes);
        }
        Ok(OutboundCommand {
            command: self.command,
            body,
            tried_resend: false,
        })
    }
}

/// A command instance ready to queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundCommand {
    pub command: Command,
    /// Template with patches applied (type byte first, no framing).
    pub body: Vec<u8>,
    pub tried_resend: bool,
}

impl OutboundCommand {
    /// Shorthand for a command that needs no patches.
    pub fn plain(command: Command) -> Self {
        Self {
            command,
            body: command.template().data.to_vec(),
            tried_resend: false,
        }
    }

    pub fn template(&self) -> CommandTemplate {
        self.command.template()
    }

    /// Full PDU with preamble, checksum and postamble.
    pub fn to_pdu(&self) -> Vec<u8> {
        checksum::frame(&self.body)
    }
}

/// Pack a 4 digit code (PIN or download code) into two bytes: `"1234"` → `[0x12, 0x34]`.
pub fn encode_code(code: &str) -> Result<[u8; 2]> {
    let invalid = || VisonicError::InvalidPin { pin: code.to_string() };
    if code.len() != 4 || !code.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(invalid());
    }
    let hi = u8::from_str_radix(&code[0..2], 16).map_err(|_| invalid())?;
    let lo = u8::from_str_radix(&code[2..4], 16).map_err(|_| invalid())?;
    Ok([hi, lo])
}

/// Arm command for a given mode and PIN.
pub fn arm_command(mode: ArmMode, pin: &str) -> Result<OutboundCommand> {
    CommandBuilder::new(Command::Arm)
        .patch(3, [mode.code()])
        .patch(4, encode_code(pin)?)
        .build()
}

/// X10/PGM command codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum X10Command {
    Off,
    On,
    Dim,
    Brighten,
}

impl X10Command {
    pub fn code(&self) -> u8 {
        match self {
            Self::Off => 0x00,
            Self::On => 0x01,
            Self::Dim => 0x0A,
            Self::Brighten => 0x0B,
        }
    }
}

/// Decoded A5 status sub-messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusMessage {
    ZoneAlarm { alarm: u32, tamper_alarm: u32 },
    ZoneOpen { open: u32, low_battery: u32 },
    Tamper { tamper: u32, tamper_alert: u32 },
    System { status: u8, flags: u8, event_zone: u8, zone_event: u8, x10: u16 },
    Enrolled { enrolled: u32, bypassed: u32 },
    Other { subtype: u8 },
}

/// Decoded AB Powerlink sub-messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PowerlinkMessage {
    PanelTime { second: u8, minute: u8, hour: u8, day: u8, month: u8, year: u8 },
    KeepAlive,
    PhoneStatus { data: Vec<u8> },
    Enroll { requested: bool },
    Other { subtype: u8 },
}

/// One A0 event log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventLogRecord {
    pub total: u8,
    pub index: u8,
    pub second: u8,
    pub minute: u8,
    pub hour: u8,
    pub day: u8,
    pub month: u8,
    pub year: u8,
    pub zone: u8,
    pub event_code: u8,
}

/// Every message the panel can send, decoded into its fixed fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PanelMessage {
    Ack,
    Timeout,
    AccessDenied,
    Stop,
    Exit,
    LegacyPanelInfo { payload: Vec<u8> },
    PanelInfo { model: u8, panel_type: u8 },
    DownloadRetry { delay_secs: u8 },
    SettingsBlock { index: u8, page: u8, data: Vec<u8> },
    DownloadBlock { index: u8, page: u8, length: u8, data: Vec<u8> },
    EventLog(EventLogRecord),
    ZoneNames { page: u8, codes: [u8; 8] },
    Status(StatusMessage),
    ZoneTypes { page: u8, codes: [u8; 8] },
    PanelStatusChange { events: Vec<(u8, u8)> },
    Powerlink(PowerlinkMessage),
    X10Names { page: u8, codes: [u8; 8] },
    Image { payload: Vec<u8> },
    PowerMaster { command: u8, subtype: u8, data: Vec<u8> },
    Noise,
    Unknown { msg_type: u8, payload: Vec<u8> },
}

fn need(payload: &[u8], n: usize, what: &str) -> Result<()> {
    if payload.len() < n {
        return Err(VisonicError::invalid_message(format!(
            "{what}: payload has {} bytes, need {n}",
            payload.len()
        )));
    }
    Ok(())
}

fn le32(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

fn eight(b: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(&b[..8]);
    out
}

impl PanelMessage {
    /// Decode a validated message. `payload` excludes the type byte and checksum.
    pub fn decode(t: u8, payload: &[u8]) -> Result<Self> {
        use msg_type::*;
        let msg = match t {
            ACK => Self::Ack,
            TIMEOUT => Self::Timeout,
            ACCESS_DENIED => Self::AccessDenied,
            STOP => Self::Stop,
            EXIT => Self::Exit,
            LEGACY_PANEL_INFO => Self::LegacyPanelInfo { payload: payload.to_vec() },
            PANEL_INFO => {
                need(payload, 6, "panel info")?;
                Self::PanelInfo { model: payload[4], panel_type: payload[5] }
            }
            DOWNLOAD_RETRY => {
                need(payload, 3, "download retry")?;
                Self::DownloadRetry { delay_secs: payload[2] }
            }
            SETTINGS_BLOCK => {
                need(payload, 10, "settings block")?;
                Self::SettingsBlock { index: payload[0], page: payload[1], data: payload[2..10].to_vec() }
            }
            DOWNLOAD_BLOCK => {
                need(payload, 3, "download block")?;
                let length = payload[2];
                let available = payload.len() - 3;
                let take = available.min(length as usize);
                Self::DownloadBlock {
                    index: payload[0],
                    page: payload[1],
                    length,
                    data: payload[3..3 + take].to_vec(),
                }
            }
            EVENT_LOG => {
                need(payload, 10, "event log")?;
                Self::EventLog(EventLogRecord {
                    total: payload[0],
                    index: payload[1],
                    second: payload[2],
                    minute: payload[3],
                    hour: payload[4],
                    day: payload[5],
                    month: payload[6],
                    year: payload[7],
                    zone: payload[8],
                    event_code: payload[9],
                })
            }
            ZONE_NAMES | ZONE_TYPES | X10_NAMES => {
                need(payload, 10, "name/type page")?;
                let page = payload[1];
                let codes = eight(&payload[2..10]);
                match t {
                    ZONE_NAMES => Self::ZoneNames { page, codes },
                    ZONE_TYPES => Self::ZoneTypes { page, codes },
                    _ => Self::X10Names { page, codes },
                }
            }
            STATUS => {
                need(payload, 2, "status")?;
                let d = &payload[2..];
                let status = match payload[1] {
                    0x01 => {
                        need(d, 8, "zone alarm status")?;
                        StatusMessage::ZoneAlarm { alarm: le32(&d[0..4]), tamper_alarm: le32(&d[4..8]) }
                    }
                    0x02 => {
                        need(d, 8, "zone open status")?;
                        StatusMessage::ZoneOpen { open: le32(&d[0..4]), low_battery: le32(&d[4..8]) }
                    }
                    0x03 => {
                        need(d, 8, "tamper status")?;
                        StatusMessage::Tamper { tamper: le32(&d[0..4]), tamper_alert: le32(&d[4..8]) }
                    }
                    0x04 => {
                        need(d, 8, "system status")?;
                        StatusMessage::System {
                            status: d[0],
                            flags: d[1],
                            event_zone: d[2],
                            zone_event: d[3],
                            x10: u16::from_le_bytes([d[6], d[7]]),
                        }
                    }
                    0x06 => {
                        need(d, 8, "enrolled status")?;
                        StatusMessage::Enrolled { enrolled: le32(&d[0..4]), bypassed: le32(&d[4..8]) }
                    }
                    subtype => StatusMessage::Other { subtype },
                };
                Self::Status(status)
            }
            PANEL_STATUS_CHANGE => {
                need(payload, 2, "panel status change")?;
                let count = (payload[0] as usize).min(4);
                let mut events = Vec::with_capacity(count);
                for i in 0..count {
                    let zi = 2 + 2 * i;
                    if zi + 1 < payload.len() {
                        events.push((payload[zi], payload[zi + 1]));
                    }
                }
                Self::PanelStatusChange { events }
            }
            POWERLINK => {
                need(payload, 1, "powerlink")?;
                let pl = match payload[0] {
                    1 => {
                        need(payload, 8, "panel time")?;
                        PowerlinkMessage::PanelTime {
                            second: payload[2],
                            minute: payload[3],
                            hour: payload[4],
                            day: payload[5],
                            month: payload[6],
                            year: payload[7],
                        }
                    }
                    3 => PowerlinkMessage::KeepAlive,
                    5 => PowerlinkMessage::PhoneStatus { data: payload[1..].to_vec() },
                    10 => {
                        need(payload, 3, "enroll")?;
                        PowerlinkMessage::Enroll { requested: payload[2] == 1 }
                    }
                    subtype => PowerlinkMessage::Other { subtype },
                };
                Self::Powerlink(pl)
            }
            IMAGE_RESPONSE | IMAGE_MANAGEMENT => Self::Image { payload: payload.to_vec() },
            POWERMASTER => {
                need(payload, 3, "powermaster")?;
                let end = (3 + payload[2] as usize).min(payload.len());
                Self::PowerMaster { command: payload[0], subtype: payload[1], data: payload[3..end].to_vec() }
            }
            NOISE => Self::Noise,
            other => Self::Unknown { msg_type: other, payload: payload.to_vec() },
        };
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_applies_patches() {
        let cmd = CommandBuilder::new(Command::Download)
            .patch(3, [0x56, 0x50])
            .build()
            .unwrap();
        assert_eq!(cmd.body[..5], [0x24, 0x00, 0x00, 0x56, 0x50]);
        assert!(!cmd.tried_resend);
    }

    #[test]
    fn test_builder_rejects_out_of_bounds() {
        let err = CommandBuilder::new(Command::Stop).patch(0, [0x01, 0x02]).build();
        assert!(matches!(err, Err(VisonicError::PatchOutOfBounds { offset: 0, len: 2, template_len: 1 })));
    }

    #[test]
    fn test_builder_rejects_overlap() {
        let err = CommandBuilder::new(Command::Arm)
            .patch(3, [0x05, 0x12])
            .patch(4, [0x12, 0x34])
            .build();
        assert!(matches!(err, Err(VisonicError::PatchOverlap { offset: 4 })));
    }

    #[test]
    fn test_encode_code() {
        assert_eq!(encode_code("1234").unwrap(), [0x12, 0x34]);
        assert_eq!(encode_code("5650").unwrap(), [0x56, 0x50]);
        assert!(encode_code("123").is_err());
        assert!(encode_code("12x4").is_err());
    }

    #[test]
    fn test_arm_command_layout() {
        let cmd = arm_command(ArmMode::Away, "1234").unwrap();
        assert_eq!(cmd.body[0], 0xA1);
        assert_eq!(cmd.body[3], 0x05);
        assert_eq!(cmd.body[4..6], [0x12, 0x34]);
        assert_eq!(*cmd.body.last().unwrap(), 0x43);
    }

    #[test]
    fn test_receive_table() {
        let dl = message_layout(msg_type::DOWNLOAD_BLOCK).unwrap();
        assert_eq!(dl.length, 7);
        assert_eq!(dl.length_byte_pos, Some(4));
        assert_eq!(message_layout(msg_type::STATUS).unwrap().length, 15);
        assert!(!message_layout(msg_type::POWERLINK).unwrap().ack_needed);
        assert!(message_layout(0x77).is_none());
        assert!(is_pocket_sentinel(0xFD));
    }

    #[test]
    fn test_decode_status_open_bitmap() {
        let payload = [0x00, 0x02, 0x11, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x80, 0x43];
        let msg = PanelMessage::decode(msg_type::STATUS, &payload).unwrap();
        assert_eq!(
            msg,
            PanelMessage::Status(StatusMessage::ZoneOpen { open: 0x11, low_battery: 0x8000_0000 })
        );
    }

    #[test]
    fn test_decode_download_block_short() {
        let payload = [0x10, 0x02, 0x08, 1, 2, 3, 4, 5];
        match PanelMessage::decode(msg_type::DOWNLOAD_BLOCK, &payload).unwrap() {
            PanelMessage::DownloadBlock { index, page, length, data } => {
                assert_eq!((index, page, length), (0x10, 0x02, 8));
                assert_eq!(data, vec![1, 2, 3, 4, 5]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_decode_panel_status_change_caps_count() {
        let payload = [0x09, 0x00, 1, 0x03, 2, 0x1B, 3, 0x06, 4, 0x53, 0x43];
        match PanelMessage::decode(msg_type::PANEL_STATUS_CHANGE, &payload).unwrap() {
            PanelMessage::PanelStatusChange { events } => {
                assert_eq!(events.len(), 4);
                assert_eq!(events[1], (2, 0x1B));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_decode_short_payload_is_error() {
        assert!(PanelMessage::decode(msg_type::SETTINGS_BLOCK, &[0x00, 0x01]).is_err());
        assert!(matches!(
            PanelMessage::decode(0x77, &[1, 2]).unwrap(),
            PanelMessage::Unknown { msg_type: 0x77, .. }
        ));
    }
}
