//! Polling strategy state machine: auto-poll vs legacy listing, with
//! transport-specific timing and clone-device fallback (§4.6).

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::detect::{detected_tag_from_auto_poll, parse_list_passive_target, DetectedTag, TargetType};
use crate::error::{Error, Result};
use crate::session::ControllerSession;
use crate::transport::{Transport, TransportType};

/// One of the four strategies a [`PollingStrategyState`] can resolve to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum PollStrategy {
    /// Resolves to `Legacy` on first use (§4.6: broadly compatible default).
    Auto,
    Native,
    Legacy,
    /// The core refuses to poll; the caller issues detection commands directly.
    Manual,
}

/// Tunables for both the native and legacy poll paths (§3, §4.6).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PollConfig {
    pub max_tags: u8,
    /// Units of 150ms, valid range 1..=15.
    pub poll_period_units: u8,
    /// `None` selects the per-transport default set (§4.6 "Target-type selection").
    pub target_types: Option<Vec<TargetType>>,
    pub retry_delay: Duration,
    pub max_retries: u32,
    /// A non-default baud-rate selector widens the legacy/native default type set.
    pub baud_rate_override: Option<u8>,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            max_tags: 1,
            poll_period_units: 1,
            target_types: None,
            retry_delay: Duration::from_millis(150),
            max_retries: 3,
            baud_rate_override: None,
        }
    }
}

/// Holds the resolved strategy, failure bookkeeping, and configuration (§3).
pub struct PollingStrategyState {
    requested: PollStrategy,
    resolved: Option<PollStrategy>,
    failure_count: u32,
    last_failure: Option<Instant>,
    legacy_fallback_enabled: bool,
    pub config: PollConfig,
}

impl PollingStrategyState {
    pub fn new(requested: PollStrategy, config: PollConfig) -> Self {
        Self {
            requested,
            resolved: None,
            failure_count: 0,
            last_failure: None,
            legacy_fallback_enabled: false,
            config,
        }
    }

    /// `auto` resolves to exactly one concrete strategy before first use and
    /// stays there (§3 invariant).
    fn resolve(&mut self) -> PollStrategy {
        if let Some(r) = self.resolved {
            return r;
        }
        let resolved = match self.requested {
            PollStrategy::Auto => PollStrategy::Legacy,
            other => other,
        };
        log::debug!("polling strategy resolved: {:?} -> {:?}", self.requested, resolved);
        self.resolved = Some(resolved);
        resolved
    }

    fn force_native(&mut self) {
        log::debug!("polling strategy: falling back {:?} -> Native", self.resolved);
        self.resolved = Some(PollStrategy::Native);
        self.legacy_fallback_enabled = true;
    }

    fn record_failure(&mut self) {
        self.failure_count += 1;
        self.last_failure = Some(Instant::now());
    }

    fn record_success(&mut self) {
        self.failure_count = 0;
        self.last_failure = None;
    }

    fn retry_eligible(&self) -> bool {
        if self.failure_count >= self.config.max_retries {
            return false;
        }
        match self.last_failure {
            None => true,
            Some(t) => Instant::now().saturating_duration_since(t) >= self.config.retry_delay,
        }
    }
}

fn default_target_types(transport_type: TransportType, baud_rate_override: Option<u8>) -> Vec<TargetType> {
    if baud_rate_override.is_some() {
        return vec![
            TargetType::Mifare,
            TargetType::Felica212,
            TargetType::Felica424,
            TargetType::Generic106k,
        ];
    }
    match transport_type {
        TransportType::Uart => vec![TargetType::Generic106k, TargetType::Mifare],
        TransportType::I2c => vec![TargetType::Generic106k, TargetType::Mifare, TargetType::Felica212],
        TransportType::Spi | TransportType::Mock => vec![
            TargetType::Generic106k,
            TargetType::Mifare,
            TargetType::Felica212,
            TargetType::Felica424,
        ],
    }
}

fn stabilization_wait(transport_type: TransportType, is_legacy_fallback: bool) -> Duration {
    if is_legacy_fallback {
        return Duration::from_millis(100);
    }
    match transport_type {
        TransportType::Uart => Duration::ZERO,
        _ => Duration::from_millis(10),
    }
}

fn is_clone_incompatibility(e: &Error) -> bool {
    let msg = e.to_string().to_lowercase();
    msg.contains("empty response") || msg.contains("need at least 2 bytes for status")
}

/// Drive one detection cycle using `state`'s resolved strategy, handling
/// native retry and legacy-to-native fallback (§4.6).
pub async fn poll<T: Transport + 'static>(
    state: &mut PollingStrategyState,
    session: &mut ControllerSession<T>,
    token: &CancellationToken,
) -> Result<Vec<DetectedTag>> {
    let transport_type = session.transport_type();
    match state.resolve() {
        PollStrategy::Manual => Err(Error::NotImplemented("manual polling strategy: caller must detect directly")),
        PollStrategy::Native => poll_native_with_retry(state, session, transport_type, token).await,
        PollStrategy::Legacy => match poll_legacy(state, session, transport_type, token).await {
            Ok(tags) => Ok(tags),
            Err(e) if is_clone_incompatibility(&e) => {
                log::warn!("legacy polling incompatible with this device, falling back to native: {e}");
                state.force_native();
                poll_native_with_retry(state, session, transport_type, token).await
            }
            Err(e) => Err(e),
        },
        PollStrategy::Auto => unreachable!("resolve() never returns Auto"),
    }
}

async fn poll_native_with_retry<T: Transport + 'static>(
    state: &mut PollingStrategyState,
    session: &mut ControllerSession<T>,
    transport_type: TransportType,
    token: &CancellationToken,
) -> Result<Vec<DetectedTag>> {
    loop {
        match poll_native_once(state, session, transport_type, token).await {
            Ok(tags) => {
                state.record_success();
                return Ok(tags);
            }
            Err(e) => {
                state.record_failure();
                if !state.retry_eligible() {
                    return Err(e);
                }
                log::debug!("native auto-poll failed ({e}), retrying after {:?}", state.config.retry_delay);
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return Err(Error::Cancelled),
                    _ = tokio::time::sleep(state.config.retry_delay) => {}
                }
            }
        }
    }
}

async fn poll_native_once<T: Transport + 'static>(
    state: &PollingStrategyState,
    session: &mut ControllerSession<T>,
    transport_type: TransportType,
    token: &CancellationToken,
) -> Result<Vec<DetectedTag>> {
    let period = state.config.poll_period_units.clamp(1, 15);
    let types = state
        .config
        .target_types
        .clone()
        .unwrap_or_else(|| default_target_types(transport_type, state.config.baud_rate_override));
    let type_bytes: Vec<u8> = types.iter().map(|t| t.as_byte()).collect();

    let wait = stabilization_wait(transport_type, state.legacy_fallback_enabled);
    if !wait.is_zero() {
        tokio::select! {
            biased;
            _ = token.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep(wait) => {}
        }
    }

    let body = session
        .in_auto_poll(state.config.max_tags.max(1), period, &type_bytes, token)
        .await?;

    parse_auto_poll_body(&body, state.config.max_tags)
}

/// `InAutoPoll` response body: `nb_tg(1), (type(1), len(1), data(len))*`.
fn parse_auto_poll_body(body: &[u8], max_tags: u8) -> Result<Vec<DetectedTag>> {
    if body.is_empty() {
        return Err(Error::InvalidResponse("empty InAutoPoll body".into()));
    }
    let nb_tg = body[0] as usize;
    let mut offset = 1;
    let mut tags = Vec::with_capacity(nb_tg.min(max_tags as usize));

    for _ in 0..nb_tg {
        if tags.len() >= max_tags as usize {
            break;
        }
        let type_code = *body
            .get(offset)
            .ok_or_else(|| Error::InvalidResponse("truncated auto-poll entry: type".into()))?;
        let len = *body
            .get(offset + 1)
            .ok_or_else(|| Error::InvalidResponse("truncated auto-poll entry: length".into()))? as usize;
        let start = offset + 2;
        let end = start + len;
        let data = body
            .get(start..end)
            .ok_or_else(|| Error::InvalidResponse("truncated auto-poll entry: data".into()))?;
        tags.push(detected_tag_from_auto_poll(type_code, data)?);
        offset = end;
    }

    Ok(tags)
}

async fn poll_legacy<T: Transport + 'static>(
    state: &PollingStrategyState,
    session: &mut ControllerSession<T>,
    transport_type: TransportType,
    token: &CancellationToken,
) -> Result<Vec<DetectedTag>> {
    let max_targets = state.config.max_tags.clamp(1, 2);
    let baud_rate_type = state.config.baud_rate_override.unwrap_or(TargetType::Generic106k.as_byte());

    let body = session
        .in_list_passive_target(max_targets, baud_rate_type, &[], token)
        .await?;

    let requested = target_type_from_baud_byte(baud_rate_type);
    let _ = transport_type;
    parse_list_passive_target(&body, requested)
}

fn target_type_from_baud_byte(byte: u8) -> TargetType {
    match byte {
        0x00 => TargetType::Generic106k,
        0x01 => TargetType::Generic212k,
        0x02 => TargetType::Generic424k,
        0x03 => TargetType::Iso14443B,
        0x04 => TargetType::Jewel,
        0x10 => TargetType::Mifare,
        0x11 => TargetType::Felica212,
        0x12 => TargetType::Felica424,
        _ => TargetType::Generic106k,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_resolves_to_legacy_and_stays_resolved() {
        let mut state = PollingStrategyState::new(PollStrategy::Auto, PollConfig::default());
        assert_eq!(state.resolve(), PollStrategy::Legacy);
        state.force_native();
        assert_eq!(state.resolve(), PollStrategy::Native);
    }

    #[test]
    fn default_target_types_widen_with_baud_override() {
        let default = default_target_types(TransportType::Uart, None);
        assert_eq!(default.len(), 2);
        let widened = default_target_types(TransportType::Uart, Some(0x01));
        assert_eq!(widened.len(), 4);
    }

    #[test]
    fn stabilization_wait_is_zero_on_uart_unless_fallback() {
        assert_eq!(stabilization_wait(TransportType::Uart, false), Duration::ZERO);
        assert_eq!(stabilization_wait(TransportType::Uart, true), Duration::from_millis(100));
        assert_eq!(stabilization_wait(TransportType::Spi, false), Duration::from_millis(10));
    }

    #[test]
    fn retry_eligible_respects_max_retries() {
        let mut state = PollingStrategyState::new(PollStrategy::Native, PollConfig {
            max_retries: 2,
            retry_delay: Duration::ZERO,
            ..PollConfig::default()
        });
        assert!(state.retry_eligible());
        state.record_failure();
        assert!(state.retry_eligible());
        state.record_failure();
        assert!(!state.retry_eligible());
    }

    /// Seed scenario 3: auto-poll FeliCa conversion, via the body parser directly.
    #[test]
    fn parse_auto_poll_body_produces_felica_tag() {
        let mut body = vec![0x01u8, 0x11, 17];
        body.push(0x01); // response code
        body.extend_from_slice(&[0xAA; 8]); // NFCID2
        body.extend_from_slice(&[0xBB; 8]); // PMm
        let tags = parse_auto_poll_body(&body, 1).unwrap();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].uid, vec![0xAA; 8]);
        assert!(tags[0].from_auto_poll);
    }

    #[test]
    fn parse_auto_poll_body_caps_at_max_tags() {
        let mut body = vec![0x02u8];
        for _ in 0..2 {
            body.push(0x20); // ISO14443-A
            body.push(6);
            body.extend_from_slice(&[0x00, 0x04, 0x08, 0x04, 0x01, 0x02]);
        }
        let tags = parse_auto_poll_body(&body, 1).unwrap();
        assert_eq!(tags.len(), 1);
    }
}
