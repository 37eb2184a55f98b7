//! Host-side driver core for a PN532-class NFC transceiver controller:
//! wire framing, a cancellable command session, polling strategy, tag
//! detection, NTAG2x and MIFARE Classic operations, and an NDEF codec.
//!
//! Concrete transport bindings (UART/I²C/SPI), CLI surfaces, and hardware
//! auto-discovery live outside this crate; see [`transport::Transport`] for
//! the interface external collaborators implement.

pub mod adapter;
pub mod detect;
pub mod error;
pub mod frame;
pub mod keys;
pub mod mifare;
pub mod ndef;
pub mod ntag;
pub mod poll;
pub mod retry;
pub mod session;
pub mod tag;
pub mod transport;

#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use detect::{DetectedTag, TagTechnology, TargetType};
pub use error::{Error, Result};
pub use session::{ControllerSession, FirmwareCapabilities, SessionConfig};
pub use tag::{TagHandle, TagIdentity};
pub use transport::{CapabilityTag, Transport, TransportType};
