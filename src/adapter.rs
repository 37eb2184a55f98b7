//! Transport-context adapter (§4.4): turns a synchronous, blocking
//! [`Transport::send_command`] into an operation that can be raced against an
//! external deadline and [`CancellationToken`].

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::transport::Transport;

/// Wraps a boxed [`Transport`] so callers can drive it with a deadline and a
/// cancellation token instead of trusting it to respect its own timeout.
///
/// Before dispatch the transport's own timeout is set to the residual time
/// left on `deadline`; on a successful join the prior timeout is restored
/// before the transport is handed back (§4.4).
///
/// The wrapped transport is moved onto a `spawn_blocking` worker for the
/// duration of each call. If the deadline/token fires first, the `JoinHandle`
/// is dropped — the worker thread is *not* interrupted (Tokio cannot
/// cooperatively cancel a blocking OS call), so its eventual result, and the
/// transport itself, are abandoned. This is the one place in the crate that
/// accepts worker-thread wastage as the price of never hanging the caller;
/// see SPEC_FULL.md §4.4 and §9 (Design Notes, "orphaned workers").
pub struct CancellableTransport<T: Transport + 'static> {
    inner: Option<T>,
}

impl<T: Transport + 'static> CancellableTransport<T> {
    pub fn new(inner: T) -> Self {
        Self { inner: Some(inner) }
    }

    /// Run `send_command(cmd, args)` against the wrapped transport, racing it
    /// against `deadline` and `token`.
    ///
    /// On success the transport is returned to `self` for reuse. On a
    /// deadline/cancellation loss, the transport is *not* returned — it is
    /// still owned by the abandoned worker thread, so subsequent calls on
    /// this adapter will fail until a fresh transport is installed with
    /// [`Self::replace`].
    pub async fn send_command(
        &mut self,
        cmd: u8,
        args: Vec<u8>,
        deadline: Instant,
        token: &CancellationToken,
    ) -> Result<Vec<u8>, Error> {
        if Instant::now() >= deadline {
            return Err(Error::Cancelled);
        }

        let mut transport = self
            .inner
            .take()
            .ok_or_else(|| Error::timeout("transport already abandoned by a prior cancellation"))?;

        let prior_timeout = transport.timeout();
        let residual = deadline.saturating_duration_since(Instant::now());
        let _ = transport.set_timeout(residual);

        let handle = tokio::task::spawn_blocking(move || {
            let result = transport.send_command(cmd, &args);
            (transport, result)
        });

        tokio::select! {
            biased;
            _ = token.cancelled() => Err(Error::Cancelled),
            _ = tokio::time::sleep_until(deadline) => {
                Err(Error::timeout("transport-context deadline elapsed"))
            }
            joined = handle => {
                match joined {
                    Ok((mut transport, result)) => {
                        let _ = transport.set_timeout(prior_timeout);
                        self.inner = Some(transport);
                        result.map_err(Error::from)
                    }
                    Err(join_err) => Err(Error::timeout(format!(
                        "transport worker panicked: {join_err}"
                    ))),
                }
            }
        }
    }

    /// Convenience wrapper computing `deadline` from `now + timeout`.
    pub async fn send_command_with_timeout(
        &mut self,
        cmd: u8,
        args: Vec<u8>,
        timeout: Duration,
        token: &CancellationToken,
    ) -> Result<Vec<u8>, Error> {
        self.send_command(cmd, args, Instant::now() + timeout, token)
            .await
    }

    /// Replace the transport after it was abandoned by a cancellation/timeout.
    pub fn replace(&mut self, transport: T) {
        self.inner = Some(transport);
    }

    pub fn has_transport(&self) -> bool {
        self.inner.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{TransportError, TransportErrorKind};
    use crate::transport::TransportType;
    use std::thread;

    struct SlowTransport {
        delay: Duration,
        timeout: Duration,
    }

    impl SlowTransport {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                timeout: Duration::from_secs(1),
            }
        }
    }

    impl Transport for SlowTransport {
        fn send_command(&mut self, _cmd: u8, _args: &[u8]) -> Result<Vec<u8>, TransportError> {
            thread::sleep(self.delay);
            Ok(vec![0xAA])
        }
        fn close(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
        fn set_timeout(&mut self, timeout: Duration) -> Result<(), TransportError> {
            self.timeout = timeout;
            Ok(())
        }
        fn timeout(&self) -> Duration {
            self.timeout
        }
        fn is_connected(&self) -> bool {
            true
        }
        fn transport_type(&self) -> TransportType {
            TransportType::Mock
        }
    }

    struct FastTransport {
        timeout: Duration,
    }

    impl FastTransport {
        fn new() -> Self {
            Self {
                timeout: Duration::from_secs(1),
            }
        }
    }

    impl Transport for FastTransport {
        fn send_command(&mut self, _cmd: u8, args: &[u8]) -> Result<Vec<u8>, TransportError> {
            Ok(args.to_vec())
        }
        fn close(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
        fn set_timeout(&mut self, timeout: Duration) -> Result<(), TransportError> {
            self.timeout = timeout;
            Ok(())
        }
        fn timeout(&self) -> Duration {
            self.timeout
        }
        fn is_connected(&self) -> bool {
            true
        }
        fn transport_type(&self) -> TransportType {
            TransportType::Mock
        }
    }

    #[tokio::test]
    async fn fast_transport_succeeds_within_deadline() {
        let mut adapter = CancellableTransport::new(FastTransport::new());
        let token = CancellationToken::new();
        let result = adapter
            .send_command_with_timeout(0x4A, vec![1, 2, 3], Duration::from_millis(100), &token)
            .await
            .unwrap();
        assert_eq!(result, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn hung_transport_is_abandoned_on_deadline() {
        let mut adapter = CancellableTransport::new(SlowTransport::new(Duration::from_secs(1)));
        let token = CancellationToken::new();
        let start = std::time::Instant::now();
        let result = adapter
            .send_command_with_timeout(0x4A, vec![], Duration::from_millis(10), &token)
            .await;
        assert!(result.is_err());
        assert!(start.elapsed() < Duration::from_millis(100));
        // The worker thread still owns the transport; the adapter has none left.
        assert!(!adapter.has_transport());
    }

    #[tokio::test]
    async fn already_expired_deadline_fails_immediately_without_io() {
        let mut adapter = CancellableTransport::new(FastTransport::new());
        let token = CancellationToken::new();
        let past = Instant::now() - Duration::from_millis(1);
        let result = adapter.send_command(0x4A, vec![], past, &token).await;
        assert!(matches!(result, Err(Error::Cancelled)));
        // Transport was never handed to a worker, so it's still here.
        assert!(adapter.has_transport());
    }

    #[tokio::test]
    async fn cancellation_token_wins_race() {
        let mut adapter = CancellableTransport::new(SlowTransport::new(Duration::from_secs(5)));
        let token = CancellationToken::new();
        token.cancel();
        let result = adapter
            .send_command_with_timeout(0x4A, vec![], Duration::from_secs(5), &token)
            .await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn prior_timeout_is_restored_after_success() {
        let mut transport = FastTransport::new();
        transport.timeout = Duration::from_secs(42);
        let mut adapter = CancellableTransport::new(transport);
        let token = CancellationToken::new();
        adapter
            .send_command_with_timeout(0x4A, vec![], Duration::from_millis(100), &token)
            .await
            .unwrap();
        // The residual deadline (100ms) was set for the call, then the
        // caller's original 42s timeout put back before returning.
        let restored = adapter.inner.as_ref().unwrap().timeout();
        assert_eq!(restored, Duration::from_secs(42));
    }
}
