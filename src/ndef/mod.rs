//! NDEF codec: record framing (`record`) plus the type-3 TLV wrapper used to
//! store an NDEF message on a MIFARE Classic tag (§4.8, §6 "NDEF TLV on MIFARE").

mod record;

pub use record::{Message, Record, Tnf, MAX_ID_LEN, MAX_MESSAGE_SIZE, MAX_RECORDS, MAX_RECORD_PAYLOAD, MAX_TYPE_LEN};

use crate::error::{Error, Result};

const TLV_TAG_NDEF: u8 = 0x03;
const TLV_TAG_TERMINATOR: u8 = 0xFE;
const TLV_LONG_FORM_MARKER: u8 = 0xFF;

/// Wraps `message`'s encoded bytes in a type-3 TLV with a trailing terminator.
pub fn build_tlv(message: &Message) -> Result<Vec<u8>> {
    let payload = message.encode()?;

    let mut out = Vec::with_capacity(payload.len() + 4);
    out.push(TLV_TAG_NDEF);
    if payload.len() < 255 {
        out.push(payload.len() as u8);
    } else {
        if payload.len() > u16::MAX as usize {
            return Err(Error::DataTooLarge(format!(
                "NDEF TLV payload {} bytes exceeds the 16-bit long-form length limit",
                payload.len()
            )));
        }
        out.push(TLV_LONG_FORM_MARKER);
        out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    }
    out.extend_from_slice(&payload);
    out.push(TLV_TAG_TERMINATOR);
    Ok(out)
}

/// Unwraps a type-3 TLV (tolerating a missing or truncated terminator — a
/// worn tag's last block is read verbatim) and parses the enclosed message.
pub fn unwrap_tlv_and_parse(data: &[u8]) -> Result<Message> {
    if data.first() != Some(&TLV_TAG_NDEF) {
        return Err(Error::NoTagDetected);
    }

    let len_byte = *data.get(1).ok_or_else(|| Error::InvalidResponse("NDEF TLV: missing length byte".into()))?;
    let (len, payload_start) = if len_byte == TLV_LONG_FORM_MARKER {
        let b = data
            .get(2..4)
            .ok_or_else(|| Error::InvalidResponse("NDEF TLV: truncated long-form length".into()))?;
        (u16::from_be_bytes([b[0], b[1]]) as usize, 4)
    } else {
        (len_byte as usize, 2)
    };

    let payload = data
        .get(payload_start..payload_start + len)
        .ok_or_else(|| Error::InvalidResponse("NDEF TLV: declared length exceeds available data".into()))?;

    Message::decode(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Seed scenario 6: NDEF build/parse.
    #[test]
    fn build_then_parse_round_trips_text() {
        let message = Message::text("en", "Hello, World!").unwrap();
        let tlv = build_tlv(&message).unwrap();
        assert_eq!(tlv[0], TLV_TAG_NDEF);
        assert_eq!(*tlv.last().unwrap(), TLV_TAG_TERMINATOR);

        let parsed = unwrap_tlv_and_parse(&tlv).unwrap();
        assert_eq!(parsed.records[0].as_text().unwrap(), "Hello, World!");
    }

    #[test]
    fn missing_ndef_tlv_tag_yields_no_tag_detected() {
        let data = [0x00u8, 0x01, 0x02];
        assert!(matches!(unwrap_tlv_and_parse(&data), Err(Error::NoTagDetected)));
    }

    #[test]
    fn long_form_length_round_trips() {
        let text = "x".repeat(300);
        let message = Message::text("en", &text).unwrap();
        let tlv = build_tlv(&message).unwrap();
        assert_eq!(tlv[1], TLV_LONG_FORM_MARKER);
        let parsed = unwrap_tlv_and_parse(&tlv).unwrap();
        assert_eq!(parsed.records[0].as_text().unwrap(), text);
    }
}
