//! MIFARE Classic key material: the well-known constant keys (§4.10) and the
//! zeroizing wrapper around them.

use zeroize::{Zeroize, Zeroizing};

/// The NDEF-formatting key, `D3 F7 D3 F7 D3 F7` — used on sector ≥1 of tags
/// formatted for NDEF storage by this crate or any NDEF-aware tool.
pub const NDEF_KEY: [u8; 6] = [0xD3, 0xF7, 0xD3, 0xF7, 0xD3, 0xF7];

/// Transport/manufacturer keys commonly found on blank or factory-fresh
/// MIFARE Classic tags, tried in order when probing for a blank tag.
pub const COMMON_KEYS: [[u8; 6]; 4] = [
    [0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF],
    [0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
    [0xA0, 0xA1, 0xA2, 0xA3, 0xA4, 0xA5], // MAD key
    [0xB0, 0xB1, 0xB2, 0xB3, 0xB4, 0xB5],
];

/// A 6-byte MIFARE key whose backing storage is zeroed when dropped.
///
/// Every call site that needs the raw bytes for a single protocol operation
/// takes them via [`SecureKey::expose`], which itself returns a
/// [`Zeroizing`] copy — the transient copy used to build a command buffer is
/// wiped as soon as it goes out of scope, same as the long-lived holder.
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct SecureKey {
    bytes: [u8; 6],
}

impl SecureKey {
    pub fn new(bytes: [u8; 6]) -> Self {
        Self { bytes }
    }

    /// Returns a zeroize-on-drop copy of the key bytes for use in a single
    /// protocol command. Never log or `Debug`-print the returned value.
    pub fn expose(&self) -> Zeroizing<[u8; 6]> {
        Zeroizing::new(self.bytes)
    }
}

impl std::fmt::Debug for SecureKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureKey").field("bytes", &"<redacted>").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expose_returns_same_bytes() {
        let key = SecureKey::new(NDEF_KEY);
        assert_eq!(*key.expose(), NDEF_KEY);
    }

    #[test]
    fn debug_never_prints_key_material() {
        let key = SecureKey::new(NDEF_KEY);
        let printed = format!("{key:?}");
        assert!(!printed.contains("211")); // no decimal byte leaks
        assert!(printed.contains("redacted"));
    }
}
