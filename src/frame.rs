//! Controller wire framing: the Standard Information Frame format (§4.1).
//!
//! ```text
//! [00 ..]  00 00 FF  LEN  LCS  TFI  CMD  payload..  DCS  00
//! ```
//! `LEN` covers `TFI + CMD + payload`, `LCS = (-LEN) mod 256`, and
//! `DCS = (-(TFI + CMD + sum(payload))) mod 256`.

use crate::error::Error;

/// Host→controller vs. controller→host direction byte (`TFI`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    HostToController,
    ControllerToHost,
}

impl Direction {
    const HOST_TO_CONTROLLER: u8 = 0xD4;
    const CONTROLLER_TO_HOST: u8 = 0xD5;
    /// Sentinel TFI value identifying an error frame instead of a response.
    const ERROR: u8 = 0x7F;

    fn as_byte(self) -> u8 {
        match self {
            Direction::HostToController => Self::HOST_TO_CONTROLLER,
            Direction::ControllerToHost => Self::CONTROLLER_TO_HOST,
        }
    }

    fn from_byte(b: u8) -> Option<Self> {
        match b {
            Self::HOST_TO_CONTROLLER => Some(Direction::HostToController),
            Self::CONTROLLER_TO_HOST => Some(Direction::ControllerToHost),
            _ => None,
        }
    }
}

/// The fixed 6-byte ACK sequence the controller sends before a real response.
pub const ACK: [u8; 6] = [0x00, 0x00, 0xFF, 0x00, 0xFF, 0x00];

const PREAMBLE_START: [u8; 3] = [0x00, 0x00, 0xFF];
/// `LEN` byte value reserved for the ACK/NACK short frames (`LEN=0, LCS=0xFF`).
const SHORT_FRAME_LEN: u8 = 0x00;

/// A decoded controller frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Ack,
    /// `TFI = 0x7F` error frame, one-byte error code.
    ErrorFrame { code: u8 },
    Response { command: u8, payload: Vec<u8> },
}

/// Encode a host→controller command frame.
///
/// `command` is the raw PN532-style command byte (e.g. `0x4A` for
/// `InListPassiveTarget`); the response will carry `command + 1`.
pub fn encode(command: u8, payload: &[u8]) -> Vec<u8> {
    let tfi = Direction::HostToController.as_byte();
    let len = (payload.len() + 2) as u8;
    let lcs = (!len).wrapping_add(1);

    let mut out = Vec::with_capacity(payload.len() + 8);
    out.extend_from_slice(&PREAMBLE_START);
    out.push(len);
    out.push(lcs);
    out.push(tfi);
    out.push(command);
    out.extend_from_slice(payload);

    let mut dcs_sum = tfi.wrapping_add(command);
    for &b in payload {
        dcs_sum = dcs_sum.wrapping_add(b);
    }
    out.push((!dcs_sum).wrapping_add(1));
    out.push(0x00); // postamble
    out
}

/// Parse a controller→host frame out of `data`.
///
/// Tolerates a leading wrapper byte emitted by some clone devices ahead of the
/// `00 00 FF` start sequence — callers that have already stripped any
/// transport-level framing byte can pass the raw PN532 bytes directly.
///
/// `expected_command`, when given, is checked against the response's command
/// byte: a real response carries `expected_command + 1` (§4.5's
/// command+1 sentinel). A transport built on this codec should pass the
/// command it just sent; `None` skips the check for callers that only need
/// the frame shape (e.g. decoding an ACK before a command is known).
pub fn decode(data: &[u8], expected_command: Option<u8>) -> Result<Frame, Error> {
    // `find_start` scans for the fixed `00 00 FF` sequence anywhere in the
    // buffer, so any number of leading zero preamble bytes — or a single
    // non-zero wrapper byte some clone firmware prepends — are tolerated
    // without special-casing them here.
    let start = find_start(data).ok_or_else(|| {
        Error::FrameCorrupted("could not locate 00 00 FF start sequence".into())
    })?;
    let data = &data[start..];

    if data.len() < 5 {
        return Err(Error::FrameCorrupted("frame truncated before LEN/LCS".into()));
    }

    let len = data[3];
    let lcs = data[4];

    if len == SHORT_FRAME_LEN {
        if lcs != 0xFF {
            return Err(Error::ChecksumMismatch(format!(
                "bad ACK complement: lcs=0x{lcs:02X}"
            )));
        }
        return Ok(Frame::Ack);
    }

    if len.wrapping_add(lcs) != 0 {
        return Err(Error::ChecksumMismatch(format!(
            "length checksum failed: len=0x{len:02X} lcs=0x{lcs:02X}"
        )));
    }

    let dcs_index = 5 + len as usize;
    if data.len() <= dcs_index {
        return Err(Error::FrameCorrupted(format!(
            "frame truncated: need {} bytes, have {}",
            dcs_index + 1,
            data.len()
        )));
    }

    let mut sum: u8 = 0;
    for &b in &data[5..dcs_index] {
        sum = sum.wrapping_add(b);
    }
    let dcs = data[dcs_index];
    if sum.wrapping_add(dcs) != 0 {
        return Err(Error::ChecksumMismatch(format!(
            "data checksum failed: sum=0x{sum:02X} dcs=0x{dcs:02X}"
        )));
    }

    let tfi = data[5];
    if tfi == Direction::ERROR {
        let code = *data.get(6).ok_or_else(|| {
            Error::FrameCorrupted("error frame missing error code byte".into())
        })?;
        return Ok(Frame::ErrorFrame { code });
    }

    let direction = Direction::from_byte(tfi)
        .ok_or_else(|| Error::FrameCorrupted(format!("unknown direction byte 0x{tfi:02X}")))?;
    if direction != Direction::ControllerToHost {
        return Err(Error::FrameCorrupted(
            "frame claims host-to-controller direction in a response".into(),
        ));
    }

    let command = data[6].wrapping_sub(1);
    let payload = data[7..dcs_index].to_vec();

    if let Some(expected) = expected_command {
        if data[6] != expected.wrapping_add(1) {
            return Err(Error::InvalidResponse(format!(
                "response command byte 0x{:02X} does not match sentinel for command 0x{expected:02X}",
                data[6]
            )));
        }
    }

    Ok(Frame::Response { command, payload })
}

fn find_start(data: &[u8]) -> Option<usize> {
    data.windows(3).position(|w| w == PREAMBLE_START)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_small_payload() {
        let encoded = encode(0x4A, &[0x01, 0x02, 0x03]);
        // Flip TFI/CMD to the controller->host direction + command+1 to emulate a reply.
        let mut reply = encoded.clone();
        reply[5] = Direction::ControllerToHost.as_byte();
        reply[6] = 0x4A + 1;
        // Recompute DCS for the mutated header.
        let len = reply[3];
        let dcs_index = 5 + len as usize;
        let mut sum: u8 = 0;
        for &b in &reply[5..dcs_index] {
            sum = sum.wrapping_add(b);
        }
        reply[dcs_index] = (!sum).wrapping_add(1);

        match decode(&reply, Some(0x4A)).unwrap() {
            Frame::Response { command, payload } => {
                assert_eq!(command, 0x4A);
                assert_eq!(payload, vec![0x01, 0x02, 0x03]);
            }
            other => panic!("expected Response, got {other:?}"),
        }
    }

    #[test]
    fn checksum_law_holds_for_encoded_frames() {
        let encoded = encode(0x02, &[0xAA, 0xBB, 0xCC, 0xDD]);
        let len = encoded[3];
        let lcs = encoded[4];
        assert_eq!(len.wrapping_add(lcs), 0);

        let dcs_index = 5 + len as usize;
        let mut sum: u8 = 0;
        for &b in &encoded[5..dcs_index] {
            sum = sum.wrapping_add(b);
        }
        assert_eq!(sum.wrapping_add(encoded[dcs_index]), 0);
    }

    #[test]
    fn ack_is_recognized() {
        assert_eq!(decode(&ACK, None).unwrap(), Frame::Ack);
    }

    #[test]
    fn error_frame_is_recognized() {
        let data = [0x00, 0x00, 0xFF, 0x01, 0xFF, 0x7F, 0x14, 0xEB, 0x00];
        assert_eq!(decode(&data, None).unwrap(), Frame::ErrorFrame { code: 0x14 });
    }

    #[test]
    fn length_255_boundary_round_trips() {
        let payload = vec![0x42u8; 253]; // +2 for TFI/CMD = 255
        let encoded = encode(0x40, &payload);
        assert_eq!(encoded[3], 255);

        let mut reply = encoded.clone();
        reply[5] = Direction::ControllerToHost.as_byte();
        reply[6] = 0x40 + 1;
        let dcs_index = 5 + 255usize;
        let mut sum: u8 = 0;
        for &b in &reply[5..dcs_index] {
            sum = sum.wrapping_add(b);
        }
        reply[dcs_index] = (!sum).wrapping_add(1);

        match decode(&reply, Some(0x40)).unwrap() {
            Frame::Response { payload: got, .. } => assert_eq!(got, payload),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let data = [0x00, 0x00, 0xFF, 0x05, 0xFB, 0xD5];
        assert!(matches!(decode(&data, None), Err(Error::FrameCorrupted(_))));
    }

    #[test]
    fn bad_length_checksum_is_rejected() {
        let mut encoded = encode(0x4A, &[0x01]);
        encoded[4] ^= 0xFF;
        assert!(matches!(decode(&encoded, None), Err(Error::ChecksumMismatch(_))));
    }

    #[test]
    fn mismatched_response_command_is_rejected() {
        let encoded = encode(0x4A, &[0x01, 0x02, 0x03]);
        let mut reply = encoded.clone();
        reply[5] = Direction::ControllerToHost.as_byte();
        reply[6] = 0x4A + 1;
        let dcs_index = 5 + reply[3] as usize;
        let mut sum: u8 = 0;
        for &b in &reply[5..dcs_index] {
            sum = sum.wrapping_add(b);
        }
        reply[dcs_index] = (!sum).wrapping_add(1);

        // We sent 0x4A but ask decode() to validate against 0x40 instead.
        assert!(matches!(decode(&reply, Some(0x40)), Err(Error::InvalidResponse(_))));
    }

    #[test]
    fn clone_device_leading_wrapper_byte_is_tolerated() {
        // Some clones prefix the frame with a report-id-like byte before 00 00 FF.
        let mut encoded = encode(0x4A, &[0x07]);
        encoded[5] = Direction::ControllerToHost.as_byte();
        encoded[6] = 0x4A + 1;
        let dcs_index = 5 + encoded[3] as usize;
        let mut sum: u8 = 0;
        for &b in &encoded[5..dcs_index] {
            sum = sum.wrapping_add(b);
        }
        encoded[dcs_index] = (!sum).wrapping_add(1);

        let mut wrapped = vec![0xE2u8];
        wrapped.extend_from_slice(&encoded);

        match decode(&wrapped, Some(0x4A)).unwrap() {
            Frame::Response { command, payload } => {
                assert_eq!(command, 0x4A);
                assert_eq!(payload, vec![0x07]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
