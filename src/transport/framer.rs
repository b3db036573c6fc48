// MIT License - Copyright (c) 2021 TJForc

//! Reassembles PDUs from the raw byte stream.
//!
//! Many message types carry no length prefix, so the framer works from the
//! static receive table: fixed-length types complete at their declared
//! length, variable types read a count byte, and unknown types terminate on
//! the first postamble that yields a valid checksum.

use std::collections::VecDeque;

use tracing::{debug, trace};

use crate::checksum::{self, ChecksumMatch};
use crate::constants::{MAX_PDU_LEN, POSTAMBLE, PREAMBLE};
use crate::protocol::{is_pocket_sentinel, message_layout, MessageLayout};

/// A complete, checksum-validated PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: u8,
    /// Bytes between the type byte and the checksum
    pub payload: Vec<u8>,
    /// The whole PDU as received
    pub raw: Vec<u8>,
    pub checksum: ChecksumMatch,
}

impl Frame {
    /// Whether the panel expects this message to be acknowledged.
    pub fn ack_needed(&self) -> bool {
        message_layout(self.msg_type).is_some_and(|s| s.ack_needed)
    }

    /// Powerlink-class messages are acknowledged with the long form `02 43`.
    ///
    /// AB is not auto-acknowledged (`ack_needed` is false for it); the
    /// keep-alive handler sends its long ACK explicitly, and only while
    /// enrolling or enrolled.
    pub fn wants_long_ack(&self) -> bool {
        self.msg_type == 0xAB || (self.msg_type < 0x10 && self.payload.last() == Some(&0x43))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramerEvent {
    Message(Frame),
    /// A fixed-length PDU completed but failed validation
    ChecksumError { msg_type: u8, raw: Vec<u8> },
}

#[derive(Debug, Default)]
pub struct Framer {
    buf: Vec<u8>,
    layout: Option<MessageLayout>,
    /// Total PDU length once known, 0 while unknown
    expected_len: usize,
    backlog: VecDeque<FramerEvent>,
}

impl Framer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one byte. Returns the oldest completed event, if any.
    pub fn feed(&mut self, byte: u8) -> Option<FramerEvent> {
        self.process(byte);
        self.backlog.pop_front()
    }

    /// Feed a chunk and collect every completed event in order.
    pub fn push(&mut self, data: &[u8]) -> Vec<FramerEvent> {
        for &b in data {
            self.process(b);
        }
        self.backlog.drain(..).collect()
    }

    /// Drop any partial PDU.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.layout = None;
        self.expected_len = 0;
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    fn process(&mut self, byte: u8) {
        if self.buf.is_empty() {
            if byte == PREAMBLE {
                self.buf.push(byte);
            } else {
                trace!("Framer: discarding {:02X} outside PDU", byte);
            }
            return;
        }

        self.buf.push(byte);
        let len = self.buf.len();

        if len == 2 {
            if is_pocket_sentinel(byte) {
                debug!("Framer: sentinel type {:02X}, resync", byte);
                self.reset();
                return;
            }
            self.layout = message_layout(byte);
            self.expected_len = self.layout.map_or(0, |s| s.length);
            return;
        }

        if let Some(layout) = self.layout
            && layout.length_byte_pos == Some(len - 1)
        {
            self.expected_len = layout.length + byte as usize;
        }

        if self.expected_len > 0 && len == self.expected_len {
            let result = checksum::validate_frame(&self.buf);
            if result.is_accepted() {
                self.complete(result);
            } else {
                self.fail();
            }
            return;
        }

        if byte == POSTAMBLE && len >= 4 && self.may_terminate_early(len) {
            let result = checksum::validate_frame(&self.buf);
            if result.is_accepted() {
                self.complete(result);
                return;
            }
            // 0x0A was part of the data; keep going
        }

        if self.expected_len == 0 && len >= MAX_PDU_LEN {
            debug!("Framer: PDU exceeded {} bytes, discarding", MAX_PDU_LEN);
            self.reset();
        }
    }

    fn may_terminate_early(&self, len: usize) -> bool {
        if self.expected_len == 0 {
            return true;
        }
        let flexible = self.layout.map_or(0, |s| s.flexible);
        flexible > 0 && len < self.expected_len && len + flexible >= self.expected_len
    }

    fn complete(&mut self, checksum: ChecksumMatch) {
        let raw = std::mem::take(&mut self.buf);
        let frame = Frame {
            msg_type: raw[1],
            payload: raw[2..raw.len() - 2].to_vec(),
            raw,
            checksum,
        };
        self.reset();
        self.backlog.push_back(FramerEvent::Message(frame));
    }

    /// Report the failure, then replay anything after the next preamble so a
    /// truncated PDU does not swallow the one behind it.
    fn fail(&mut self) {
        let raw = std::mem::take(&mut self.buf);
        let msg_type = raw[1];
        self.reset();
        self.backlog.push_back(FramerEvent::ChecksumError { msg_type, raw: raw.clone() });
        if let Some(pos) = raw.iter().skip(1).position(|&b| b == PREAMBLE) {
            for &b in &raw[pos + 1..] {
                self.process(b);
            }
        }
    }
}
