//! SSH client handler and client configuration shared by both tunnel hops.
//!
//! Cloud VMs are created and destroyed dynamically, so their host keys are
//! not known ahead of time. The default [`HostKeyPolicy::AcceptAny`] matches
//! `StrictHostKeyChecking=no` and places trust in the network path instead of
//! the host identity. Deployments that do know their fleet's keys can switch
//! to [`HostKeyPolicy::Pinned`].

use std::sync::Arc;
use std::time::Duration;

use russh::{client, keys};
use tracing::{debug, warn};

/// How server host keys are checked during a handshake.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum HostKeyPolicy {
    /// Accept every host key without verification
    #[default]
    AcceptAny,
    /// Accept only keys whose SHA256 fingerprint (`SHA256:...`) is listed
    Pinned(Vec<String>),
}

impl HostKeyPolicy {
    pub fn accepts(&self, fingerprint: &str) -> bool {
        match self {
            HostKeyPolicy::AcceptAny => true,
            HostKeyPolicy::Pinned(known) => known.iter().any(|k| k == fingerprint),
        }
    }
}

/// russh client handler applying a [`HostKeyPolicy`].
pub struct FleetClientHandler {
    policy: Arc<HostKeyPolicy>,
    peer: String,
}

impl FleetClientHandler {
    pub fn new(policy: Arc<HostKeyPolicy>, peer: impl Into<String>) -> Self {
        Self {
            policy,
            peer: peer.into(),
        }
    }
}

impl client::Handler for FleetClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        if matches!(*self.policy, HostKeyPolicy::AcceptAny) {
            return Ok(true);
        }

        let fingerprint = server_public_key
            .fingerprint(keys::HashAlg::Sha256)
            .to_string();
        let accepted = self.policy.accepts(&fingerprint);
        if accepted {
            debug!("Host key {} of {} is pinned", fingerprint, self.peer);
        } else {
            warn!(
                "Rejecting host key {} of {}: not in pinned set",
                fingerprint, self.peer
            );
        }
        Ok(accepted)
    }
}

/// Build russh client configuration for one tunnel hop.
///
/// No inactivity timeout is set: a long-running command must not tear down
/// the session. Keepalives detect dead peers instead.
pub(crate) fn build_client_config() -> Arc<client::Config> {
    Arc::new(client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(Duration::from_secs(30)),
        keepalive_max: 3,
        ..Default::default()
    })
}
