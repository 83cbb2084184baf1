//! Bounded-retry TCP reachability check.
//!
//! Freshly provisioned VMs often accept TCP on port 22 some seconds after
//! the cloud reports them as running. Probing first keeps the SSH handshake
//! from burning its timeout on a host that is still booting.
//!
//! Attempts are paced with a constant delay via `backon`; every attempt has
//! its own connect timeout. The probe can be aborted through a
//! [`CancellationToken`].

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use backon::{ConstantBuilder, Retryable};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::{
    DEFAULT_PROBE_DELAY_SECS, DEFAULT_PROBE_MAX_ATTEMPTS, DEFAULT_PROBE_TIMEOUT_SECS,
};
use super::error::{FleetError, FleetResult};

/// Retry policy for the connectivity probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of connection attempts (values below 1 are treated as 1)
    pub max_attempts: u32,
    pub per_attempt_timeout: Duration,
    pub inter_attempt_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_PROBE_MAX_ATTEMPTS,
            per_attempt_timeout: Duration::from_secs(DEFAULT_PROBE_TIMEOUT_SECS),
            inter_attempt_delay: Duration::from_secs(DEFAULT_PROBE_DELAY_SECS),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConnectivityProbe {
    policy: RetryPolicy,
}

impl ConnectivityProbe {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Check that `host:port` accepts TCP connections.
    ///
    /// Returns the number of attempts it took. Each successful connection is
    /// closed immediately.
    pub async fn probe(
        &self,
        host: &str,
        port: u16,
        cancel: &CancellationToken,
    ) -> FleetResult<u32> {
        let attempts = AtomicU32::new(0);
        let max_attempts = self.policy.max_attempts.max(1);
        let per_attempt_timeout = self.policy.per_attempt_timeout;

        let backoff = ConstantBuilder::default()
            .with_delay(self.policy.inter_attempt_delay)
            .with_max_times((max_attempts - 1) as usize);

        let attempt = (|| async {
            let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            debug!("[Check SSH Port] {}:{} (attempt {})", host, port, n);

            let stream = tokio::time::timeout(per_attempt_timeout, TcpStream::connect((host, port)))
                .await
                .map_err(|_| format!("timed out after {:?}", per_attempt_timeout))?
                .map_err(|e| e.to_string())?;
            drop(stream);
            Ok::<(), String>(())
        })
        .retry(backoff)
        .notify(|err, dur| {
            warn!(
                "SSH port {}:{} is not accessible yet ({}). Retrying in {:?}",
                host, port, err, dur
            );
        });

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(FleetError::Cancelled),
            result = attempt => result,
        };

        let total = attempts.load(Ordering::SeqCst);
        match result {
            Ok(()) => {
                info!("SSH port {}:{} is accessible", host, port);
                Ok(total)
            }
            Err(e) => {
                let err = FleetError::PortUnreachable {
                    host: host.to_string(),
                    port,
                    attempts: total,
                };
                warn!("{}. Last error: {}", err, e);
                Err(err)
            }
        }
    }
}
