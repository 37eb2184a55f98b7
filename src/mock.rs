//! An in-memory [`Transport`] test double, scripted with a queue of canned
//! responses. Exposed behind the `test-util` feature for downstream
//! integration tests; used unconditionally by this crate's own tests.

use std::collections::VecDeque;
use std::time::Duration;

use crate::error::{TransportError, TransportErrorKind};
use crate::transport::{CapabilityTag, Transport, TransportType};

enum Scripted {
    Ok(Vec<u8>),
    Err(TransportError),
}

/// A scriptable stand-in for a real UART/I²C/SPI transport.
pub struct MockTransport {
    queue: VecDeque<Scripted>,
    transport_type: TransportType,
    connected: bool,
    capabilities: Vec<CapabilityTag>,
    timeout: Duration,
}

impl MockTransport {
    pub fn new(transport_type: TransportType) -> Self {
        Self {
            queue: VecDeque::new(),
            transport_type,
            connected: true,
            capabilities: vec![],
            timeout: Duration::from_secs(1),
        }
    }

    pub fn with_capability(mut self, tag: CapabilityTag) -> Self {
        self.capabilities.push(tag);
        self
    }

    pub fn push_ok(&mut self, bytes: Vec<u8>) -> &mut Self {
        self.queue.push_back(Scripted::Ok(bytes));
        self
    }

    pub fn push_err(&mut self, kind: TransportErrorKind, message: impl Into<String>) -> &mut Self {
        let cause = std::io::Error::new(std::io::ErrorKind::Other, message.into());
        self.queue
            .push_back(Scripted::Err(TransportError::new("send_command", "mock", kind, cause)));
        self
    }

    pub fn remaining(&self) -> usize {
        self.queue.len()
    }
}

impl Transport for MockTransport {
    fn send_command(&mut self, _cmd: u8, _args: &[u8]) -> std::result::Result<Vec<u8>, TransportError> {
        match self.queue.pop_front() {
            Some(Scripted::Ok(bytes)) => Ok(bytes),
            Some(Scripted::Err(e)) => Err(e),
            None => Err(TransportError::new(
                "send_command",
                "mock",
                TransportErrorKind::Permanent,
                std::io::Error::new(std::io::ErrorKind::Other, "MockTransport script exhausted"),
            )),
        }
    }

    fn close(&mut self) -> std::result::Result<(), TransportError> {
        self.connected = false;
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Duration) -> std::result::Result<(), TransportError> {
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn transport_type(&self) -> TransportType {
        self.transport_type
    }

    fn has_capability(&self, tag: CapabilityTag) -> bool {
        self.capabilities.contains(&tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_responses_are_returned_in_order() {
        let mut t = MockTransport::new(TransportType::Mock);
        t.push_ok(vec![1, 2, 3]).push_ok(vec![4, 5]);
        assert_eq!(t.send_command(0x00, &[]).unwrap(), vec![1, 2, 3]);
        assert_eq!(t.send_command(0x00, &[]).unwrap(), vec![4, 5]);
    }

    #[test]
    fn exhausted_script_yields_permanent_error() {
        let mut t = MockTransport::new(TransportType::Mock);
        let err = t.send_command(0x00, &[]).unwrap_err();
        assert_eq!(err.kind, TransportErrorKind::Permanent);
    }

    #[test]
    fn close_marks_disconnected() {
        let mut t = MockTransport::new(TransportType::Mock);
        assert!(t.is_connected());
        t.close().unwrap();
        assert!(!t.is_connected());
    }
}
