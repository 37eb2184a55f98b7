//! MIFARE Classic operations: sector authentication, block r/w, NDEF-on-sector
//! storage, and blank-to-NDEF format migration (§4.10).

use std::sync::RwLock;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::detect::{DetectedTag, TargetType};
use crate::error::{Error, Result};
use crate::keys::{SecureKey, COMMON_KEYS, NDEF_KEY};
use crate::ndef::Message;
use crate::session::ControllerSession;
use crate::tag::{TagHandle, TagIdentity};
use crate::transport::Transport;

const CMD_MIFARE_READ: u8 = 0x30;
const CMD_MIFARE_WRITE: u8 = 0xA0;
const AUTH_BASE: u8 = 0x60;
/// Sentinel meaning "not authenticated" (§3, §8 invariant).
const AUTH_SENTINEL: (i32, u8) = (-1, 0);
const NDEF_END_SENTINEL: u8 = 0xFE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    A = 0,
    B = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MifareCapacity {
    Classic1K,
    Classic4K,
}

impl MifareCapacity {
    /// Sectors 0..max_sectors are addressed with a uniform 4-block layout.
    /// MIFARE 4K's extended sectors 32..39 (16 blocks each) are not modeled —
    /// this crate treats sector count as 16 for 1K, 40 for 4K, addressed
    /// uniformly; NDEF storage in the field rarely extends past sector 32.
    fn max_sectors(self) -> u32 {
        match self {
            MifareCapacity::Classic1K => 16,
            MifareCapacity::Classic4K => 40,
        }
    }
}

fn first_block_of_sector(sector: u32) -> u32 {
    sector * 4
}

fn trailer_block_of_sector(sector: u32) -> u32 {
    first_block_of_sector(sector) + 3
}

fn sector_of_block(block: u32) -> u32 {
    block / 4
}

pub struct MifareHandle<'a, T: Transport + 'static> {
    session: &'a mut ControllerSession<T>,
    identity: TagIdentity,
    capacity: MifareCapacity,
    /// `(last_auth_sector, last_auth_key_type)`, sentinel `(-1, 0)` (§3, §5).
    auth_state: RwLock<(i32, u8)>,
    ndef_key: SecureKey,
}

impl<'a, T: Transport + 'static> MifareHandle<'a, T> {
    pub fn new(session: &'a mut ControllerSession<T>, detected: &DetectedTag, capacity: MifareCapacity) -> Self {
        Self {
            session,
            identity: TagIdentity::from(detected),
            capacity,
            auth_state: RwLock::new(AUTH_SENTINEL),
            ndef_key: SecureKey::new(NDEF_KEY),
        }
    }

    fn target(&self) -> u8 {
        self.session.data_exchange_target_number()
    }

    fn uid4(&self) -> Result<[u8; 4]> {
        if self.identity.uid.len() < 4 {
            return Err(Error::InvalidParameter("MIFARE UID shorter than 4 bytes".into()));
        }
        let mut out = [0u8; 4];
        out.copy_from_slice(&self.identity.uid[..4]);
        Ok(out)
    }

    fn auth_sector(&self) -> i32 {
        self.auth_state.read().unwrap().0
    }

    fn set_auth(&self, sector: u32, key_type: KeyType) {
        *self.auth_state.write().unwrap() = (sector as i32, key_type as u8);
    }

    fn clear_auth(&self) {
        *self.auth_state.write().unwrap() = AUTH_SENTINEL;
    }

    /// `Authenticate(sector, key_type, key)` (§4.10).
    pub async fn authenticate(&mut self, sector: u32, key_type: KeyType, key: &[u8], token: &CancellationToken) -> Result<()> {
        if key.len() != 6 {
            return Err(Error::InvalidParameter(format!("MIFARE key must be 6 bytes, got {}", key.len())));
        }
        let uid = self.uid4()?;
        let target = self.target();
        let auth_cmd = AUTH_BASE + key_type as u8;
        let first_block = first_block_of_sector(sector);

        let mut args = vec![auth_cmd, first_block as u8];
        args.extend_from_slice(key);
        args.extend_from_slice(&uid);

        match self.session.in_data_exchange(target, &args, token).await {
            Ok(_) => {
                self.set_auth(sector, key_type);
                Ok(())
            }
            Err(e) => {
                self.clear_auth();
                if matches!(e, Error::ControllerError { .. }) {
                    Err(Error::AuthenticationFailed)
                } else {
                    Err(e)
                }
            }
        }
    }

    fn require_authenticated(&self, block: u32) -> Result<()> {
        let sector = sector_of_block(block) as i32;
        if self.auth_sector() != sector {
            return Err(Error::NotAuthenticated { sector });
        }
        Ok(())
    }

    /// `read_block(block)`: requires authentication to the containing sector.
    pub async fn read_block(&mut self, block: u32, token: &CancellationToken) -> Result<[u8; 16]> {
        self.require_authenticated(block)?;
        self.read_block_direct(block, token).await
    }

    /// `write_block(block, data)`: forbids block 0, requires authentication.
    pub async fn write_block(&mut self, block: u32, data: &[u8; 16], token: &CancellationToken) -> Result<()> {
        if block == 0 {
            return Err(Error::InvalidParameter("write to block 0 (manufacturer block) is forbidden".into()));
        }
        self.require_authenticated(block)?;
        self.write_block_direct(block, data, token).await
    }

    /// Unauthenticated read, for clone-tag compatibility (§4.10). Falls back
    /// to the raw target pipe on a status-0x01 (RF timeout) response.
    pub async fn read_block_direct(&mut self, block: u32, token: &CancellationToken) -> Result<[u8; 16]> {
        let target = self.target();
        let result = self.session.in_data_exchange(target, &[CMD_MIFARE_READ, block as u8], token).await;
        let payload = match result {
            Ok(p) => p,
            Err(Error::ControllerError { code: 0x01 }) => {
                self.session
                    .in_communicate_thru(&[CMD_MIFARE_READ, block as u8], token)
                    .await?
            }
            Err(e) => return Err(e),
        };
        if payload.len() < 16 {
            return Err(Error::InvalidResponse(format!(
                "read_block({block}): expected 16 bytes, got {}",
                payload.len()
            )));
        }
        let mut out = [0u8; 16];
        out.copy_from_slice(&payload[..16]);
        Ok(out)
    }

    /// Unauthenticated write, for clone-tag compatibility (§4.10). Reads back
    /// first to confirm responsiveness, then writes; falls back to the raw
    /// pipe on timeout, else reports the tag as unable to write.
    pub async fn write_block_direct(&mut self, block: u32, data: &[u8; 16], token: &CancellationToken) -> Result<()> {
        if let Err(e) = self.read_block_direct(block, token).await {
            return Err(e);
        }

        let target = self.target();
        let mut args = vec![CMD_MIFARE_WRITE, block as u8];
        args.extend_from_slice(data);

        match self.session.in_data_exchange(target, &args, token).await {
            Ok(_) => Ok(()),
            Err(Error::ControllerError { code: 0x01 }) => {
                self.session.in_communicate_thru(&args, token).await?;
                Ok(())
            }
            Err(_) => Err(Error::InvalidResponse("tag does not support writing".into())),
        }
    }

    /// Clears the local sentinel, then re-detects via a listing command to
    /// clear the controller's own internal authentication state (§4.10).
    pub async fn reset_auth_state(&mut self, token: &CancellationToken) -> Result<()> {
        self.clear_auth();
        let _ = self
            .session
            .in_list_passive_target(1, TargetType::Mifare.as_byte(), &[], token)
            .await;
        Ok(())
    }

    /// Reads the full NDEF message stored across sectors 1.. (§4.10).
    pub async fn read_ndef(&mut self, token: &CancellationToken) -> Result<Message> {
        let mut bytes = Vec::new();

        'sectors: for sector in 1..self.capacity.max_sectors() {
            let auth_ok = self.authenticate(sector, KeyType::A, &*self.ndef_key.expose(), token).await.is_ok()
                || self.authenticate(sector, KeyType::B, &*self.ndef_key.expose(), token).await.is_ok();
            if !auth_ok {
                if sector == 1 {
                    return Err(Error::AuthenticationFailed);
                }
                break 'sectors;
            }

            let first = first_block_of_sector(sector);
            let mut sector_bytes = Vec::new();
            for b in first..first + 3 {
                sector_bytes.extend_from_slice(&self.read_block_direct(b, token).await?);
            }

            if sector_bytes.iter().all(|&b| b == 0x00) {
                break 'sectors;
            }
            let end_found = sector_bytes.contains(&NDEF_END_SENTINEL);
            bytes.extend_from_slice(&sector_bytes);
            if end_found {
                break 'sectors;
            }
        }

        crate::ndef::unwrap_tlv_and_parse(&bytes)
    }

    /// Writes `message` as TLV-wrapped NDEF bytes, reformatting a blank tag
    /// to NDEF layout first if needed (§4.10).
    pub async fn write_ndef(&mut self, message: &Message, token: &CancellationToken) -> Result<()> {
        let tlv = crate::ndef::build_tlv(message)?;

        let already_formatted = self.authenticate(1, KeyType::A, &*self.ndef_key.expose(), token).await.is_ok()
            || self.authenticate(1, KeyType::B, &*self.ndef_key.expose(), token).await.is_ok();

        let blank_key = if already_formatted {
            None
        } else {
            let mut found = None;
            for candidate in COMMON_KEYS {
                if self.authenticate(1, KeyType::A, &candidate, token).await.is_ok() {
                    found = Some(candidate);
                    break;
                }
            }
            match found {
                Some(k) => Some(k),
                None => return Err(Error::AuthenticationFailed),
            }
        };

        let data_blocks_per_sector = 3u32;
        let capacity_bytes = (self.capacity.max_sectors() - 1) * data_blocks_per_sector * 16;
        if tlv.len() as u32 > capacity_bytes {
            return Err(Error::DataTooLarge(format!(
                "NDEF message ({} bytes) exceeds tag capacity ({} bytes)",
                tlv.len(),
                capacity_bytes
            )));
        }

        if let Some(blank_key) = blank_key {
            for sector in 1..self.capacity.max_sectors() {
                if self.authenticate(sector, KeyType::A, &blank_key, token).await.is_err() {
                    break;
                }
                let trailer_block = trailer_block_of_sector(sector);
                let mut trailer = self.read_block_direct(trailer_block, token).await?;
                trailer[0..6].copy_from_slice(&NDEF_KEY);
                trailer[10..16].copy_from_slice(&NDEF_KEY);
                self.write_block_direct(trailer_block, &trailer, token).await?;
                let _ = self.authenticate(sector, KeyType::A, &*self.ndef_key.expose(), token).await;
            }
            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(Duration::from_millis(50)) => {}
            }
        }

        let mut offset = 0usize;
        'write_blocks: for sector in 1..self.capacity.max_sectors() {
            if self.authenticate(sector, KeyType::A, &*self.ndef_key.expose(), token).await.is_err() {
                break;
            }
            let first = first_block_of_sector(sector);
            for block in first..first + 3 {
                if offset >= tlv.len() {
                    break 'write_blocks;
                }
                let end = (offset + 16).min(tlv.len());
                let mut chunk = [0u8; 16];
                chunk[..end - offset].copy_from_slice(&tlv[offset..end]);
                self.write_block_direct(block, &chunk, token).await?;
                offset = end;
            }
        }

        // Best-effort clear of any remaining non-trailer blocks past the
        // message; stop at the first write failure.
        'clear: for sector in 1..self.capacity.max_sectors() {
            if self.authenticate(sector, KeyType::A, &*self.ndef_key.expose(), token).await.is_err() {
                break;
            }
            let first = first_block_of_sector(sector);
            for block in first..first + 3 {
                let block_start = (block - first) as usize * 16 + (sector as usize - 1) * 48;
                if block_start < offset {
                    continue;
                }
                if self.write_block_direct(block, &[0u8; 16], token).await.is_err() {
                    break 'clear;
                }
            }
        }

        Ok(())
    }
}

impl<'a, T: Transport + 'static> TagHandle for MifareHandle<'a, T> {
    fn identity(&self) -> &TagIdentity {
        &self.identity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_sentinel_matches_spec_value() {
        assert_eq!(AUTH_SENTINEL, (-1, 0));
    }

    #[test]
    fn sector_and_block_math() {
        assert_eq!(first_block_of_sector(0), 0);
        assert_eq!(trailer_block_of_sector(0), 3);
        assert_eq!(sector_of_block(7), 1);
        assert_eq!(sector_of_block(4), 1);
    }

    #[test]
    fn capacity_sector_counts() {
        assert_eq!(MifareCapacity::Classic1K.max_sectors(), 16);
        assert_eq!(MifareCapacity::Classic4K.max_sectors(), 40);
    }
}
