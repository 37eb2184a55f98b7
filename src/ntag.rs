//! NTAG2x operations: page-oriented read/write/fast-read, version query (§4.9).

use tokio_util::sync::CancellationToken;

use crate::detect::DetectedTag;
use crate::error::{Error, Result};
use crate::session::ControllerSession;
use crate::tag::{TagHandle, TagIdentity};
use crate::transport::Transport;

const CMD_MIFARE_READ: u8 = 0x30;
const CMD_MIFARE_WRITE_ULTRALIGHT: u8 = 0xA2;
const CMD_FAST_READ: u8 = 0x3A;
const CMD_GET_VERSION: u8 = 0x60;

/// NTAG213/215/216 memory-size classes, derived from `GetVersion`'s storage-size byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NtagKind {
    Ntag213,
    Ntag215,
    Ntag216,
    Unknown,
}

pub struct NtagHandle<'a, T: Transport + 'static> {
    session: &'a mut ControllerSession<T>,
    identity: TagIdentity,
    pub kind: Option<NtagKind>,
}

impl<'a, T: Transport + 'static> NtagHandle<'a, T> {
    pub fn new(session: &'a mut ControllerSession<T>, detected: &DetectedTag) -> Self {
        Self {
            session,
            identity: TagIdentity::from(detected),
            kind: None,
        }
    }

    fn target(&self) -> u8 {
        self.session.data_exchange_target_number()
    }

    /// Reads the 4-page (16-byte) block containing `page` and returns only
    /// `page`'s 4 bytes, matching the controller's `MFRead` semantics (§4.9).
    pub async fn read_page(&mut self, page: u8, token: &CancellationToken) -> Result<[u8; 4]> {
        let target = self.target();
        let payload = self
            .session
            .in_data_exchange(target, &[CMD_MIFARE_READ, page], token)
            .await?;
        if payload.len() < 16 {
            return Err(Error::InvalidResponse(format!(
                "NTAG read_page({page}): expected 16 bytes, got {}",
                payload.len()
            )));
        }
        let mut out = [0u8; 4];
        out.copy_from_slice(&payload[..4]);
        Ok(out)
    }

    /// Writes one 4-byte page.
    pub async fn write_page(&mut self, page: u8, data: &[u8; 4], token: &CancellationToken) -> Result<()> {
        let target = self.target();
        let mut args = vec![CMD_MIFARE_WRITE_ULTRALIGHT, page];
        args.extend_from_slice(data);
        // A zero-length response with status 0 (already validated by
        // in_data_exchange) means success; no further payload to check.
        self.session.in_data_exchange(target, &args, token).await?;
        Ok(())
    }

    /// Raw-pipe fast read spanning pages `start..=end`, `(end-start+1)*4` bytes.
    pub async fn fast_read(&mut self, start: u8, end: u8, token: &CancellationToken) -> Result<Vec<u8>> {
        if end < start {
            return Err(Error::InvalidParameter(format!("fast_read: end {end} < start {start}")));
        }
        let expected = (end as usize - start as usize + 1) * 4;
        let payload = self
            .session
            .in_communicate_thru(&[CMD_FAST_READ, start, end], token)
            .await?;
        if payload.len() < expected {
            return Err(Error::InvalidResponse(format!(
                "fast_read({start}..={end}): expected {expected} bytes, got {}",
                payload.len()
            )));
        }
        Ok(payload[..expected].to_vec())
    }

    /// Raw-pipe `GetVersion`; falls back to a conservative guess on a
    /// malformed reply instead of failing, matching clone-tag tolerance elsewhere (§4.9).
    pub async fn get_version(&mut self, token: &CancellationToken) -> Result<NtagKind> {
        let result = self.session.in_communicate_thru(&[CMD_GET_VERSION], token).await;
        let kind = match result {
            Ok(payload) if payload.len() >= 8 => classify_version(&payload),
            _ => NtagKind::Unknown,
        };
        self.kind = Some(kind);
        Ok(kind)
    }
}

/// NXP `GetVersion` response: `[fixed_header, vendor_id, product_type,
/// product_subtype, major, minor, storage_size, protocol_type]`. Byte index 6
/// (`storage_size`) distinguishes the NTAG213/215/216 family members.
fn classify_version(payload: &[u8]) -> NtagKind {
    match payload[6] {
        0x0F => NtagKind::Ntag213,
        0x11 => NtagKind::Ntag215,
        0x13 => NtagKind::Ntag216,
        _ => NtagKind::Unknown,
    }
}

impl<'a, T: Transport + 'static> TagHandle for NtagHandle<'a, T> {
    fn identity(&self) -> &TagIdentity {
        &self.identity
    }
}
