//! Common tag identity and dispatch base (§3 "Tag handle").
//!
//! Concrete handles ([`crate::ntag::NtagHandle`], [`crate::mifare::MifareHandle`])
//! each hold a back-reference to the owning [`ControllerSession`] plus their
//! own extra state; this module only carries what's common to all of them.

use crate::detect::{DetectedTag, TagTechnology};
use crate::error::Error;

/// Identity fields shared by every tag handle, copied out of the
/// [`DetectedTag`] that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct TagIdentity {
    pub uid: Vec<u8>,
    pub uid_hex: String,
    pub sak: Option<u8>,
    pub technology: TagTechnology,
    pub target_number: u8,
    pub from_auto_poll: bool,
}

impl From<&DetectedTag> for TagIdentity {
    fn from(t: &DetectedTag) -> Self {
        Self {
            uid: t.uid.clone(),
            uid_hex: t.uid_hex.clone(),
            sak: t.sak,
            technology: t.technology,
            target_number: t.target_number,
            from_auto_poll: t.from_auto_poll,
        }
    }
}

/// Operations every concrete tag handle may expose; unsupported ones fall
/// back to [`Error::NotImplemented`] through the default methods here so a
/// caller can treat any handle uniformly before downcasting.
pub trait TagHandle {
    fn identity(&self) -> &TagIdentity;

    fn read_block(&mut self, _block: u32) -> Result<Vec<u8>, Error> {
        Err(Error::NotImplemented("read_block"))
    }

    fn write_block(&mut self, _block: u32, _data: &[u8]) -> Result<(), Error> {
        Err(Error::NotImplemented("write_block"))
    }

    fn read_ndef(&mut self) -> Result<Vec<u8>, Error> {
        Err(Error::NotImplemented("read_ndef"))
    }

    fn write_ndef(&mut self, _data: &[u8]) -> Result<(), Error> {
        Err(Error::NotImplemented("write_ndef"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Stub(TagIdentity);
    impl TagHandle for Stub {
        fn identity(&self) -> &TagIdentity {
            &self.0
        }
    }

    #[test]
    fn default_methods_are_not_implemented() {
        let mut stub = Stub(TagIdentity {
            uid: vec![1, 2, 3, 4],
            uid_hex: "01020304".into(),
            sak: Some(0x08),
            technology: TagTechnology::Ntag,
            target_number: 1,
            from_auto_poll: false,
        });
        assert!(matches!(stub.read_block(0), Err(Error::NotImplemented("read_block"))));
        assert!(matches!(stub.write_block(0, &[]), Err(Error::NotImplemented("write_block"))));
        assert!(matches!(stub.read_ndef(), Err(Error::NotImplemented("read_ndef"))));
        assert!(matches!(stub.write_ndef(&[]), Err(Error::NotImplemented("write_ndef"))));
    }

    #[test]
    fn identity_copies_detected_tag_fields() {
        let detected = DetectedTag {
            technology: TagTechnology::MifareClassic,
            uid: vec![4, 5, 6, 7],
            uid_hex: "04050607".into(),
            atq: Some([0x00, 0x04]),
            sak: Some(0x08),
            raw: vec![],
            target_number: 1,
            from_auto_poll: false,
            detected_at_unix_ms: 0,
        };
        let identity = TagIdentity::from(&detected);
        assert_eq!(identity.uid, detected.uid);
        assert_eq!(identity.technology, TagTechnology::MifareClassic);
    }
}
