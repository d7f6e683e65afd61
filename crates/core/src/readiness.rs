//! Post-launch readiness probe
//!
//! After a daemon is spawned, `start` blocks until the service accepts TCP
//! connections on its declared port. Attempts back off exponentially with equal
//! jitter up to a cap; the whole wait is bounded by a deadline.

use crate::errors::{Result, StartupError};
use crate::settings::ReadinessSettings;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::{debug, info, instrument, warn};

/// Delay schedule between connection attempts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollBackoff {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl PollBackoff {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    /// Delay before attempt `attempt + 1`: `base * 2^attempt`, capped, then
    /// half fixed plus a random half.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, &mut fastrand::Rng::new())
    }

    fn delay_with(&self, attempt: u32, rng: &mut fastrand::Rng) -> Duration {
        let exponential = self
            .base_delay
            .as_millis()
            .saturating_mul(2_u128.saturating_pow(attempt.min(32)));
        let capped = exponential.min(self.max_delay.as_millis()) as u64;
        let half = capped / 2;
        Duration::from_millis(half + rng.u64(0..=capped - half))
    }
}

/// Waits for a TCP port to accept connections
#[derive(Debug, Clone)]
pub struct ReadinessProbe {
    pub host: String,
    pub port: u16,
    pub timeout: Duration,
    pub backoff: PollBackoff,
}

impl ReadinessProbe {
    pub fn new(host: impl Into<String>, port: u16, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            timeout,
            backoff: PollBackoff::new(Duration::from_millis(250), Duration::from_secs(2)),
        }
    }

    pub fn from_settings(settings: &ReadinessSettings, port: u16) -> Self {
        Self {
            host: settings.probe_host.clone(),
            port,
            timeout: settings.timeout(),
            backoff: PollBackoff::new(settings.poll_interval(), settings.max_poll_interval()),
        }
    }

    async fn attempt(&self, budget: Duration) -> bool {
        let connect = TcpStream::connect((self.host.as_str(), self.port));
        matches!(tokio::time::timeout(budget, connect).await, Ok(Ok(_)))
    }

    /// Wait until the port opens while the service process is alive
    ///
    /// The first attempt comes one base delay after launch so a process that
    /// dies immediately is seen as dead. `alive` is consulted after every
    /// attempt, including a successful one: a port that answers while the
    /// process is gone belongs to someone else and the wait ends with
    /// `StartupError::Exited`.
    #[instrument(skip(self, alive), fields(host = %self.host, port = self.port))]
    pub async fn wait<F>(&self, alive: F) -> Result<()>
    where
        F: Fn() -> bool,
    {
        let started = Instant::now();
        let deadline = started + self.timeout;
        let mut attempt = 0u32;
        tokio::time::sleep(self.backoff.base_delay.min(self.timeout)).await;

        loop {
            let now = Instant::now();
            let remaining = deadline.saturating_duration_since(now);
            let budget = remaining.clamp(Duration::from_millis(50), Duration::from_secs(1));
            let connected = self.attempt(budget).await;
            if !alive() {
                if connected {
                    warn!("Port {} answered but the service process is gone", self.port);
                }
                return Err(StartupError::Exited { port: self.port }.into());
            }
            if connected {
                info!(
                    "Port {} ready after {:?}",
                    self.port,
                    started.elapsed()
                );
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(StartupError::Timeout {
                    port: self.port,
                    timeout_secs: self.timeout.as_secs(),
                }
                .into());
            }

            let delay = self
                .backoff
                .delay(attempt)
                .min(deadline.saturating_duration_since(now));
            debug!(attempt, "Port {} not ready, retrying in {:?}", self.port, delay);
            tokio::time::sleep(delay).await;
            attempt = attempt.saturating_add(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::AppHubError;
    use tokio::net::TcpListener;

    #[test]
    fn test_backoff_stays_within_bounds() {
        let backoff = PollBackoff::new(Duration::from_millis(100), Duration::from_millis(500));
        let mut rng = fastrand::Rng::with_seed(12345);

        let d0 = backoff.delay_with(0, &mut rng);
        assert!(d0 >= Duration::from_millis(50) && d0 <= Duration::from_millis(100));

        let d2 = backoff.delay_with(2, &mut rng);
        assert!(d2 >= Duration::from_millis(200) && d2 <= Duration::from_millis(400));

        for attempt in 3..40 {
            let d = backoff.delay_with(attempt, &mut rng);
            assert!(d <= Duration::from_millis(500), "attempt {} gave {:?}", attempt, d);
            assert!(d >= Duration::from_millis(250));
        }
    }

    #[test]
    fn test_backoff_cap_never_below_base() {
        let backoff = PollBackoff::new(Duration::from_millis(300), Duration::from_millis(100));
        assert_eq!(backoff.max_delay, Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_wait_succeeds_when_port_open() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let probe = ReadinessProbe::new("127.0.0.1", port, Duration::from_secs(5));
        probe.wait(|| true).await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_succeeds_when_port_opens_late() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let opener = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(listener);
        });

        let mut probe = ReadinessProbe::new("127.0.0.1", port, Duration::from_secs(5));
        probe.backoff = PollBackoff::new(Duration::from_millis(50), Duration::from_millis(100));
        probe.wait(|| true).await.unwrap();
        opener.abort();
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut probe = ReadinessProbe::new("127.0.0.1", port, Duration::from_millis(400));
        probe.backoff = PollBackoff::new(Duration::from_millis(50), Duration::from_millis(100));
        let started = Instant::now();
        let err = probe.wait(|| true).await.unwrap_err();
        assert!(matches!(
            err,
            AppHubError::Startup(StartupError::Timeout { .. })
        ));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_wait_stops_when_process_exits() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let probe = ReadinessProbe::new("127.0.0.1", port, Duration::from_secs(30));
        let err = probe.wait(|| false).await.unwrap_err();
        assert!(matches!(err, AppHubError::Startup(StartupError::Exited { .. })));
    }

    #[tokio::test]
    async fn test_open_port_without_live_process_is_not_ready() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let probe = ReadinessProbe::new("127.0.0.1", port, Duration::from_secs(5));
        let err = probe.wait(|| false).await.unwrap_err();
        assert!(matches!(err, AppHubError::Startup(StartupError::Exited { .. })));
        drop(listener);
    }
}
