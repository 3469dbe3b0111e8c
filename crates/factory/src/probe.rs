//! Readiness probes.
//!
//! The factory polls a caller-supplied probe; it knows nothing about the
//! protocol spoken by the service inside the container. A plain TCP connect
//! lives here; protocol-aware probes (e.g. a WebDriver status check) live
//! with the code that owns that protocol.

use std::time::Duration;

use {
    async_trait::async_trait,
    tokio::net::TcpStream,
    tracing::trace,
};

use crate::record::Endpoint;

/// A check for whether a freshly created container's service endpoint is
/// reachable.
#[async_trait]
pub trait ReadyProbe: Send + Sync {
    /// One probe attempt. Should return quickly; the factory owns retry and
    /// backoff.
    async fn check(&self, endpoint: &Endpoint) -> bool;
}

/// Readiness = a TCP connection to the published port can be opened.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    /// Per-attempt connect timeout.
    pub connect_timeout: Duration,
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self { connect_timeout: Duration::from_secs(1) }
    }
}

#[async_trait]
impl ReadyProbe for TcpProbe {
    async fn check(&self, endpoint: &Endpoint) -> bool {
        let addr = (endpoint.host.as_str(), endpoint.port);
        let connected =
            tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr)).await;
        let ok = matches!(connected, Ok(Ok(_)));
        trace!(endpoint = %endpoint, ok, "tcp probe");
        ok
    }
}

/// Initial readiness-probe backoff.
const BACKOFF_START: Duration = Duration::from_millis(200);

/// Readiness-probe backoff cap.
const BACKOFF_CAP: Duration = Duration::from_secs(2);

/// Poll `probe` against `endpoint` with bounded exponential backoff until it
/// succeeds or `timeout` elapses. Returns whether the endpoint became ready.
pub async fn poll_until_ready(
    endpoint: &Endpoint,
    probe: &dyn ReadyProbe,
    timeout: Duration,
) -> bool {
    let start = tokio::time::Instant::now();
    let mut backoff = BACKOFF_START;

    loop {
        if probe.check(endpoint).await {
            trace!(endpoint = %endpoint, elapsed = ?start.elapsed(), "endpoint ready");
            return true;
        }
        if start.elapsed() + backoff >= timeout {
            // one final attempt right at the deadline
            tokio::time::sleep(timeout.saturating_sub(start.elapsed())).await;
            return probe.check(endpoint).await;
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(BACKOFF_CAP);
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn tcp_probe_succeeds_on_listening_port() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let probe = TcpProbe::default();
        let endpoint = Endpoint { host: "127.0.0.1".into(), port };
        assert!(probe.check(&endpoint).await);
    }

    #[tokio::test]
    async fn tcp_probe_fails_on_closed_port() {
        // bind then drop so the port is known-closed
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let probe = TcpProbe::default();
        let endpoint = Endpoint { host: "127.0.0.1".into(), port };
        assert!(!probe.check(&endpoint).await);
    }

    struct NeverReady {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl ReadyProbe for NeverReady {
        async fn check(&self, _endpoint: &Endpoint) -> bool {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            false
        }
    }

    struct ReadyAfter {
        remaining: AtomicUsize,
    }

    #[async_trait]
    impl ReadyProbe for ReadyAfter {
        async fn check(&self, _endpoint: &Endpoint) -> bool {
            // counts down to zero, then reports ready
            self.remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_err()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn never_ready_probe_times_out_at_deadline() {
        let endpoint = Endpoint { host: "127.0.0.1".into(), port: 1 };
        let probe = NeverReady { attempts: AtomicUsize::new(0) };
        let timeout = Duration::from_secs(10);

        let start = tokio::time::Instant::now();
        let ready = poll_until_ready(&endpoint, &probe, timeout).await;

        assert!(!ready);
        // fails at (or just past) the configured timeout, not earlier and
        // not indefinitely
        assert!(start.elapsed() >= timeout);
        assert!(start.elapsed() < timeout + Duration::from_secs(3));
        assert!(probe.attempts.load(Ordering::SeqCst) >= 5);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_succeeds_after_retries() {
        let endpoint = Endpoint { host: "127.0.0.1".into(), port: 1 };
        let probe = ReadyAfter { remaining: AtomicUsize::new(3) };
        assert!(poll_until_ready(&endpoint, &probe, Duration::from_secs(30)).await);
    }
}
