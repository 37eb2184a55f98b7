//! The narrow byte-pipe interface external collaborators implement (§4.2, §6).
//!
//! Concrete UART/I²C/SPI bindings live outside this crate; this module only
//! defines the contract and the capability-query extension point.

use std::time::Duration;

use crate::error::TransportError;

/// Which physical transport a session is bound to. Several behaviors in
/// `crate::poll` branch on this (stabilization waits, default target types).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum TransportType {
    Uart,
    I2c,
    Spi,
    Mock,
}

/// Feature flags a transport may advertise through [`Transport::has_capability`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityTag {
    /// The transport's physical layer requires an explicit `in_select` before
    /// data-exchange, even for targets returned by native auto-poll.
    RequiresExplicitSelect,
    /// The controller firmware on this transport path supports `InAutoPoll`.
    SupportsNativeAutoPoll,
}

/// A byte pipe to the controller, plus timeout/connection-state plumbing.
///
/// Implementations are synchronous and blocking by contract — `send_command`
/// is expected to perform real I/O and return only once a full response frame
/// (or a timeout) has been observed. Cancellation is layered on top by
/// `crate::adapter::CancellableTransport`, not built into this trait.
pub trait Transport: Send {
    /// Send `cmd` with `args` and return the payload of the first non-ACK
    /// response frame. An ACK silently consumed ahead of the response is not
    /// this call's concern — implementations already return codec-decoded
    /// payload bytes (§6).
    fn send_command(&mut self, cmd: u8, args: &[u8]) -> Result<Vec<u8>, TransportError>;

    fn close(&mut self) -> Result<(), TransportError>;

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), TransportError>;

    /// The timeout currently in effect, so a caller that temporarily overrides
    /// it (`crate::adapter::CancellableTransport`, §4.4) can restore it afterward.
    fn timeout(&self) -> Duration;

    fn is_connected(&self) -> bool;

    fn transport_type(&self) -> TransportType;

    /// Default: no optional capabilities. Transports override to advertise.
    fn has_capability(&self, _tag: CapabilityTag) -> bool {
        false
    }
}
