//! Controller session: initialization, command dispatch, and the clone-device
//! quirk policy (§4.5).

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::adapter::CancellableTransport;
use crate::error::{Error, Result};
use crate::poll::PollingStrategyState;
use crate::retry::{retry_with, RetryConfig};
use crate::transport::{Transport, TransportType};

pub const CMD_DIAGNOSE: u8 = 0x00;
pub const CMD_FIRMWARE_VERSION: u8 = 0x02;
pub const CMD_GENERAL_STATUS: u8 = 0x04;
pub const CMD_SAM_CONFIGURATION: u8 = 0x14;
pub const CMD_POWER_DOWN: u8 = 0x16;
pub const CMD_RF_CONFIGURATION: u8 = 0x32;
pub const CMD_IN_DATA_EXCHANGE: u8 = 0x40;
pub const CMD_IN_COMMUNICATE_THRU: u8 = 0x42;
pub const CMD_IN_LIST_PASSIVE_TARGET: u8 = 0x4A;
pub const CMD_IN_RELEASE: u8 = 0x52;
pub const CMD_IN_SELECT: u8 = 0x54;
pub const CMD_IN_AUTO_POLL: u8 = 0x60;

const RESPONSE_DIRECTION_BYTE: u8 = 0xD5;

/// Typed session configuration (§3.1).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SessionConfig {
    pub command_timeout: Duration,
    pub attempt_sam_config: bool,
    /// Escape hatch for firmware that does not tolerate the hardcoded target
    /// number `1` used for in-data-exchange (§4.6 "Target number policy").
    pub target_number_override: Option<u8>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(1),
            attempt_sam_config: true,
            target_number_override: None,
        }
    }
}

/// Firmware capability report (§3). Version plus three boolean capability bits.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FirmwareCapabilities {
    pub version: String,
    pub iso14443a: bool,
    pub iso14443b: bool,
    pub felica: bool,
}

impl FirmwareCapabilities {
    /// Synthesized when a clone device's firmware-version query fails or
    /// returns something unrecognizable (§4.5(c)).
    fn conservative_default() -> Self {
        Self {
            version: "1.6".to_string(),
            iso14443a: true,
            iso14443b: false,
            felica: false,
        }
    }
}

/// Owns the transport, retry/session configuration, polling strategy state,
/// firmware capability report, and the current data-exchange target number (§3).
pub struct ControllerSession<T: Transport + 'static> {
    transport: CancellableTransport<T>,
    transport_type: TransportType,
    pub config: SessionConfig,
    pub retry: RetryConfig,
    pub poll_state: PollingStrategyState,
    pub capabilities: Option<FirmwareCapabilities>,
    initialized: bool,
}

impl<T: Transport + 'static> ControllerSession<T> {
    pub fn new(transport: T, config: SessionConfig, retry: RetryConfig, poll_state: PollingStrategyState) -> Self {
        let transport_type = transport.transport_type();
        Self {
            transport: CancellableTransport::new(transport),
            transport_type,
            config,
            retry,
            poll_state,
            capabilities: None,
            initialized: false,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn transport_type(&self) -> TransportType {
        self.transport_type
    }

    /// The logical target number used for in-data-exchange (§4.6).
    pub fn data_exchange_target_number(&self) -> u8 {
        self.config.target_number_override.unwrap_or(1)
    }

    fn deadline(&self) -> Instant {
        Instant::now() + self.config.command_timeout
    }

    /// Send `cmd` with `args`, retried per `self.retry`, racing the
    /// transport-context adapter's deadline/cancellation. Returns the raw
    /// response payload.
    ///
    /// The response-command-byte sentinel check (§4.5) is not performed
    /// here: `Transport::send_command` (§4.2, §6) already decodes the frame
    /// and hands back only the payload bytes, with the command-echo byte
    /// consumed by the codec before this layer ever sees the response. See
    /// DESIGN.md's "Open Question decisions" for why that check lives at
    /// the transport/codec boundary instead of here.
    async fn dispatch_raw(&mut self, cmd: u8, args: Vec<u8>, token: &CancellationToken) -> Result<Vec<u8>> {
        let retry = self.retry.clone();
        let timeout = self.config.command_timeout;
        let transport = &mut self.transport;
        retry_with(&retry, token, Error::is_retryable, move || {
            let args = args.clone();
            let deadline = Instant::now() + timeout;
            transport.send_command(cmd, args, deadline, token)
        })
        .await
    }

    /// Like [`Self::dispatch_raw`] but additionally validates a leading
    /// status byte (`0` = ok) and returns the remaining payload.
    async fn dispatch_status(&mut self, cmd: u8, args: Vec<u8>, token: &CancellationToken) -> Result<Vec<u8>> {
        let payload = self.dispatch_raw(cmd, args, token).await?;
        let status = *payload
            .first()
            .ok_or_else(|| Error::InvalidResponse(format!("command 0x{cmd:02X}: empty status-bearing response")))?;
        if status != 0x00 {
            return Err(Error::ControllerError { code: status });
        }
        Ok(payload[1..].to_vec())
    }

    /// (a)(b)(c) of §4.5's initialization sequence.
    pub async fn init(&mut self, token: &CancellationToken) -> Result<()> {
        let probe_failed = self.firmware_version(token).await.is_err();
        if probe_failed {
            log::debug!("controller session: firmware probe failed, clone device likely");
        }

        if self.config.attempt_sam_config {
            if let Err(e) = self.sam_configuration(token).await {
                if is_clone_sam_config_signature(&e) {
                    log::warn!("controller session: SAM configuration skipped, clone signature detected: {e}");
                } else {
                    return Err(e);
                }
            }
        }

        match self.firmware_version(token).await {
            Ok(caps) => self.capabilities = Some(caps),
            Err(e) => {
                log::debug!("controller session: firmware version query failed, using conservative defaults: {e}");
                self.capabilities = Some(FirmwareCapabilities::conservative_default());
            }
        }

        self.initialized = true;
        Ok(())
    }

    /// `GetFirmwareVersion` (`0x02`). No status byte; payload is
    /// `[IC, Ver, Rev, Support]` on real hardware.
    pub async fn firmware_version(&mut self, token: &CancellationToken) -> Result<FirmwareCapabilities> {
        let mut payload = self.dispatch_raw(CMD_FIRMWARE_VERSION, vec![], token).await?;

        // Quirk (2): unwrap a reply prefixed with the controller->host direction byte.
        if payload.first() == Some(&RESPONSE_DIRECTION_BYTE) {
            payload.remove(0);
        }

        // Quirk (1): a one-byte reply equal to the SAM-config response code
        // means the clone device echoed the previous command's framing back.
        if payload.len() == 1 && payload[0] == CMD_SAM_CONFIGURATION + 1 {
            return Err(Error::InvalidResponse(
                "firmware version reply matches SAM-config response code: clone detected".into(),
            ));
        }

        if payload.len() < 4 {
            return Err(Error::InvalidResponse(format!(
                "firmware version reply too short: {} bytes",
                payload.len()
            )));
        }

        let version = format!("{}.{}", payload[1], payload[2]);
        let support = payload[3];
        Ok(FirmwareCapabilities {
            version,
            iso14443a: support & 0x01 != 0,
            iso14443b: support & 0x04 != 0,
            felica: support & 0x02 != 0,
        })
    }

    /// `GetGeneralStatus` (`0x04`).
    pub async fn general_status(&mut self, token: &CancellationToken) -> Result<Vec<u8>> {
        self.dispatch_raw(CMD_GENERAL_STATUS, vec![], token).await
    }

    /// `Diagnose` (`0x00`) self-test.
    pub async fn self_diagnose(&mut self, test_number: u8, args: Vec<u8>, token: &CancellationToken) -> Result<Vec<u8>> {
        let mut full_args = vec![test_number];
        full_args.extend(args);
        self.dispatch_raw(CMD_DIAGNOSE, full_args, token).await
    }

    /// `SAMConfiguration` (`0x14`): normal mode, timeout=0, IRQ disabled.
    pub async fn sam_configuration(&mut self, token: &CancellationToken) -> Result<()> {
        let args = vec![0x01, 0x00, 0x00];
        self.dispatch_status(CMD_SAM_CONFIGURATION, args, token).await?;
        Ok(())
    }

    /// `InDataExchange` (`0x40`): target-addressed APDU pipe.
    pub async fn in_data_exchange(&mut self, target: u8, data: &[u8], token: &CancellationToken) -> Result<Vec<u8>> {
        let mut args = vec![target];
        args.extend_from_slice(data);
        self.dispatch_status(CMD_IN_DATA_EXCHANGE, args, token).await
    }

    /// `InCommunicateThru` (`0x42`): raw target pipe, no target-number prefix.
    pub async fn in_communicate_thru(&mut self, data: &[u8], token: &CancellationToken) -> Result<Vec<u8>> {
        self.dispatch_status(CMD_IN_COMMUNICATE_THRU, data.to_vec(), token).await
    }

    /// `InRelease` (`0x52`).
    pub async fn in_release(&mut self, target: u8, token: &CancellationToken) -> Result<()> {
        self.dispatch_status(CMD_IN_RELEASE, vec![target], token).await?;
        Ok(())
    }

    /// `InSelect` (`0x54`).
    pub async fn in_select(&mut self, target: u8, token: &CancellationToken) -> Result<()> {
        self.dispatch_status(CMD_IN_SELECT, vec![target], token).await?;
        Ok(())
    }

    /// `InListPassiveTarget` (`0x4A`). Returns the raw body (`nb_tg` plus
    /// per-target entries), with the opcode-shift quirk (3) undone.
    pub async fn in_list_passive_target(
        &mut self,
        max_targets: u8,
        baud_rate_type: u8,
        initiator_data: &[u8],
        token: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let mut args = vec![max_targets, baud_rate_type];
        args.extend_from_slice(initiator_data);
        let payload = self.dispatch_raw(CMD_IN_LIST_PASSIVE_TARGET, args, token).await?;
        Ok(unwrap_list_passive_target_quirk(&payload).to_vec())
    }

    /// `InAutoPoll` (`0x60`).
    pub async fn in_auto_poll(
        &mut self,
        poll_number: u8,
        period: u8,
        target_types: &[u8],
        token: &CancellationToken,
    ) -> Result<Vec<u8>> {
        if !(1..=15).contains(&poll_number) {
            return Err(Error::InvalidParameter(format!(
                "poll_number must be in 1..=15, got {poll_number}"
            )));
        }
        if target_types.is_empty() || target_types.len() > 15 {
            return Err(Error::InvalidParameter(format!(
                "target_types length must be in 1..=15, got {}",
                target_types.len()
            )));
        }
        let mut args = vec![poll_number, period];
        args.extend_from_slice(target_types);
        self.dispatch_raw(CMD_IN_AUTO_POLL, args, token).await
    }

    /// `PowerDown` (`0x16`).
    pub async fn power_down(&mut self, wakeup_enable: u8, token: &CancellationToken) -> Result<()> {
        self.dispatch_status(CMD_POWER_DOWN, vec![wakeup_enable], token).await?;
        Ok(())
    }
}

fn is_clone_sam_config_signature(e: &Error) -> bool {
    const SIGNATURES: &[&str] = &[
        "unexpected code 03",
        "response too short",
        "empty response",
    ];
    let msg = e.to_string().to_lowercase();
    SIGNATURES.iter().any(|s| msg.contains(s))
}

fn unwrap_list_passive_target_quirk(payload: &[u8]) -> &[u8] {
    if payload.first() == Some(&(CMD_IN_LIST_PASSIVE_TARGET + 1)) && payload.len() > 1 {
        &payload[1..]
    } else {
        payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::poll::{PollConfig, PollStrategy};
    use crate::transport::TransportType;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    #[derive(Clone)]
    struct ScriptedTransport {
        responses: Arc<Mutex<VecDeque<Result<Vec<u8>>>>>,
    }

    impl ScriptedTransport {
        fn new(responses: Vec<Result<Vec<u8>>>) -> Self {
            Self {
                responses: Arc::new(Mutex::new(responses.into_iter().collect())),
            }
        }
    }

    impl Transport for ScriptedTransport {
        fn send_command(&mut self, _cmd: u8, _args: &[u8]) -> std::result::Result<Vec<u8>, TransportError> {
            let mut q = self.responses.lock().unwrap();
            match q.pop_front() {
                Some(Ok(bytes)) => Ok(bytes),
                Some(Err(e)) => Err(TransportError::new(
                    "send_command",
                    "mock",
                    crate::error::TransportErrorKind::Permanent,
                    std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
                )),
                None => Err(TransportError::new(
                    "send_command",
                    "mock",
                    crate::error::TransportErrorKind::Permanent,
                    std::io::Error::new(std::io::ErrorKind::Other, "script exhausted"),
                )),
            }
        }
        fn close(&mut self) -> std::result::Result<(), TransportError> {
            Ok(())
        }
        fn set_timeout(&mut self, _timeout: Duration) -> std::result::Result<(), TransportError> {
            Ok(())
        }
        fn timeout(&self) -> Duration {
            Duration::from_secs(1)
        }
        fn is_connected(&self) -> bool {
            true
        }
        fn transport_type(&self) -> TransportType {
            TransportType::Mock
        }
    }

    fn session_with(responses: Vec<Result<Vec<u8>>>) -> ControllerSession<ScriptedTransport> {
        ControllerSession::new(
            ScriptedTransport::new(responses),
            SessionConfig {
                command_timeout: Duration::from_millis(200),
                ..Default::default()
            },
            RetryConfig {
                max_attempts: 1,
                ..Default::default()
            },
            PollingStrategyState::new(PollStrategy::Auto, PollConfig::default()),
        )
    }

    #[tokio::test]
    async fn firmware_version_parses_support_bits() {
        let mut session = session_with(vec![Ok(vec![0x32, 0x01, 0x06, 0x07])]);
        let token = CancellationToken::new();
        let caps = session.firmware_version(&token).await.unwrap();
        assert_eq!(caps.version, "1.6");
        assert!(caps.iso14443a && caps.iso14443b && caps.felica);
    }

    #[tokio::test]
    async fn firmware_version_unwraps_direction_byte_quirk() {
        let mut session = session_with(vec![Ok(vec![0xD5, 0x32, 0x01, 0x06, 0x00])]);
        let token = CancellationToken::new();
        let caps = session.firmware_version(&token).await.unwrap();
        assert!(caps.iso14443a);
    }

    #[tokio::test]
    async fn firmware_version_detects_clone_sentinel() {
        let mut session = session_with(vec![Ok(vec![0x15])]);
        let token = CancellationToken::new();
        assert!(session.firmware_version(&token).await.is_err());
    }

    /// Seed scenario 4: clone SAM-config recovery.
    #[tokio::test]
    async fn init_recovers_from_clone_sam_config_signature() {
        let mut session = session_with(vec![
            Ok(vec![0x32, 0x01, 0x06, 0x07]), // probe
            Err(Error::InvalidResponse(
                "unexpected SAM configuration response code: 03".into(),
            )),
            Ok(vec![0x32, 0x01, 0x06, 0x07]), // post-recovery firmware query
        ]);
        let token = CancellationToken::new();
        session.init(&token).await.unwrap();
        assert!(session.is_initialized());
        assert_eq!(session.capabilities.as_ref().unwrap().version, "1.6");
    }

    #[tokio::test]
    async fn init_falls_back_to_conservative_defaults_on_total_failure() {
        let mut session = session_with(vec![
            Err(Error::Timeout("probe".into())),
            Ok(vec![0x00]), // SAM config ok
            Err(Error::Timeout("firmware".into())),
        ]);
        let token = CancellationToken::new();
        session.init(&token).await.unwrap();
        let caps = session.capabilities.unwrap();
        assert_eq!(caps.version, "1.6");
        assert!(caps.iso14443a && !caps.iso14443b && !caps.felica);
    }

    #[tokio::test]
    async fn in_data_exchange_surfaces_controller_error_code() {
        let mut session = session_with(vec![Ok(vec![0x14])]);
        let token = CancellationToken::new();
        let err = session.in_data_exchange(1, &[0x00], &token).await.unwrap_err();
        assert!(matches!(err, Error::ControllerError { code: 0x14 }));
    }

    #[tokio::test]
    async fn list_passive_target_shift_quirk_is_unwrapped() {
        let mut session = session_with(vec![Ok(vec![0x4B, 0x01, 0x01, 0x00, 0x04, 0x08, 0x04, 1, 2, 3, 4])]);
        let token = CancellationToken::new();
        let body = session.in_list_passive_target(1, 0x00, &[], &token).await.unwrap();
        assert_eq!(body[0], 0x01); // nb_tg, quirk byte stripped
    }

    #[tokio::test]
    async fn auto_poll_rejects_out_of_range_poll_number() {
        let mut session = session_with(vec![]);
        let token = CancellationToken::new();
        let err = session.in_auto_poll(0, 1, &[0x00], &token).await.unwrap_err();
        assert!(matches!(err, Error::InvalidParameter(_)));
    }

    #[tokio::test]
    async fn data_exchange_target_number_defaults_to_one() {
        let session = session_with(vec![]);
        assert_eq!(session.data_exchange_target_number(), 1);
    }
}
