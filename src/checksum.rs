// MIT License - Copyright (c) 2021 TJForc

//! PDU checksum used by PowerMax and PowerMaster panels.
//!
//! The checksum covers the type byte and the payload, but not the
//! preamble, the checksum itself or the postamble:
//!
//! ```text
//! 0x0D <type> <payload...> <checksum> 0x0A
//! ```
//!
//! Panels in the field sometimes emit a checksum that is one off from the
//! computed value, so received frames are accepted with a ±1 tolerance.

use crate::constants::{POSTAMBLE, PREAMBLE};

/// How a received checksum compares with the computed one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumMatch {
    Exact,
    /// Off by exactly one (firmware quirk), accepted.
    OffByOne,
    Mismatch,
}

impl ChecksumMatch {
    pub fn is_accepted(&self) -> bool {
        !matches!(self, Self::Mismatch)
    }
}

/// Compute the checksum over `type..payload`.
pub fn calculate(body: &[u8]) -> u8 {
    let sum: u32 = body.iter().map(|&b| b as u32).sum();
    let checksum = 0xFF - (sum % 0xFF);
    if checksum == 0xFF { 0x00 } else { checksum as u8 }
}

/// Compare a received checksum against the one computed for `body`.
pub fn verify(body: &[u8], received: u8) -> ChecksumMatch {
    let expected = calculate(body);
    if received == expected {
        ChecksumMatch::Exact
    } else if received == expected.wrapping_add(1) || received == expected.wrapping_sub(1) {
        ChecksumMatch::OffByOne
    } else {
        ChecksumMatch::Mismatch
    }
}

/// Wrap a `type..payload` body into a complete PDU.
pub fn frame(body: &[u8]) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(body.len() + 3);
    pdu.push(PREAMBLE);
    pdu.extend_from_slice(body);
    pdu.push(calculate(body));
    pdu.push(POSTAMBLE);
    pdu
}

/// Check a complete PDU (preamble through postamble).
pub fn validate_frame(pdu: &[u8]) -> ChecksumMatch {
    if pdu.len() < 4 || pdu[0] != PREAMBLE || pdu[pdu.len() - 1] != POSTAMBLE {
        return ChecksumMatch::Mismatch;
    }
    let body = &pdu[1..pdu.len() - 2];
    verify(body, pdu[pdu.len() - 2])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_status_frame() {
        // Status request as sent to the panel
        let body = [0xA2, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x43];
        assert_eq!(calculate(&body), 0x1A);
    }

    #[test]
    fn test_fold_ff_to_zero() {
        // Sum that is a multiple of 0xFF yields 0xFF which folds to 0x00
        assert_eq!(calculate(&[0xFF]), 0x00);
        assert_eq!(calculate(&[]), 0x00);
    }

    #[test]
    fn test_frame_validates() {
        let pdu = frame(&[0xAB, 0x03, 0x00, 0x1E, 0x00, 0x31, 0x2E, 0x31, 0x35, 0x00, 0x00, 0x43]);
        assert_eq!(pdu[0], PREAMBLE);
        assert_eq!(*pdu.last().unwrap(), POSTAMBLE);
        assert_eq!(validate_frame(&pdu), ChecksumMatch::Exact);
    }

    #[test]
    fn test_tolerance_is_exactly_one() {
        for body in [vec![0x02], vec![0xA5, 0x00, 0x02, 0x11], vec![0x3C, 0x01, 0x02, 0xFE]] {
            let mut pdu = frame(&body);
            let idx = pdu.len() - 2;
            let good = pdu[idx];
            for delta in 0u8..=255 {
                pdu[idx] = good.wrapping_add(delta);
                let result = validate_frame(&pdu);
                match delta {
                    0 => assert_eq!(result, ChecksumMatch::Exact),
                    1 | 255 => assert_eq!(result, ChecksumMatch::OffByOne),
                    _ => assert_eq!(result, ChecksumMatch::Mismatch, "delta {delta}"),
                }
            }
        }
    }

    #[test]
    fn test_bad_envelope_rejected() {
        let mut pdu = frame(&[0x02]);
        pdu[0] = 0x0E;
        assert_eq!(validate_frame(&pdu), ChecksumMatch::Mismatch);
        assert_eq!(validate_frame(&[0x0D, 0x0A]), ChecksumMatch::Mismatch);
    }
}
