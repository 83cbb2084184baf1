//! SSH login resolution for fleet VMs.
//!
//! The effective username is picked without contacting the VM:
//!
//! 1. the username requested by the caller
//! 2. the `verified_username` recorded on the VM's SSH-key resource
//! 3. the `username` the SSH-key resource was created with
//! 4. the configured default identity (`cb-user`)
//!
//! Whether the choice is right is only discovered when the tunnel handshake
//! authenticates. After a successful handshake the dispatcher may call
//! [`CredentialResolver::record_verified`] so the next dispatch starts from a
//! known-good login.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::error::{FleetError, FleetResult};
use super::graph::ResourceGraph;

/// A resolved login for one VM.
#[derive(Clone, PartialEq, Eq)]
pub struct ResolvedCredential {
    pub username: String,
    pub private_key: String,
    /// Username already marked verified on the key resource (may be empty)
    pub verified_username: String,
    pub ssh_key_id: String,
}

impl std::fmt::Debug for ResolvedCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedCredential")
            .field("username", &self.username)
            .field("verified_username", &self.verified_username)
            .field("ssh_key_id", &self.ssh_key_id)
            .finish_non_exhaustive()
    }
}

pub struct CredentialResolver {
    graph: Arc<dyn ResourceGraph>,
    default_username: String,
}

/// First non-empty candidate in precedence order.
fn pick_username<'a>(candidates: &[&'a str]) -> Option<&'a str> {
    candidates.iter().copied().find(|c| !c.trim().is_empty())
}

impl CredentialResolver {
    pub fn new(graph: Arc<dyn ResourceGraph>, default_username: impl Into<String>) -> Self {
        Self {
            graph,
            default_username: default_username.into(),
        }
    }

    /// Resolve the username and private key to log into `vm_id` with.
    pub async fn resolve(
        &self,
        fleet_id: &str,
        vm_id: &str,
        requested_username: Option<&str>,
    ) -> FleetResult<ResolvedCredential> {
        let vm = self.graph.get_vm(fleet_id, vm_id).await.inspect_err(|e| {
            error!("Credential lookup for VM {} in {}: {}", vm_id, fleet_id, e);
        })?;
        let key = self
            .graph
            .get_ssh_key(&vm.ssh_key_id)
            .await
            .inspect_err(|e| {
                error!("SSH key {} of VM {}: {}", vm.ssh_key_id, vm_id, e);
            })?;

        let username = pick_username(&[
            requested_username.unwrap_or_default(),
            key.verified_username.as_str(),
            key.username.as_str(),
            self.default_username.as_str(),
        ])
        .ok_or_else(|| {
            let err = FleetError::UsernameUnresolved(vm_id.to_string());
            error!("{}", err);
            err
        })?;

        debug!("[SSH] {}.{} resolved userName: {}", fleet_id, vm_id, username);

        Ok(ResolvedCredential {
            username: username.to_string(),
            private_key: key.private_key,
            verified_username: key.verified_username,
            ssh_key_id: vm.ssh_key_id,
        })
    }

    /// Best-effort write-back of a username that completed authentication.
    ///
    /// Skipped when it is already the recorded one. Failures are logged and
    /// swallowed.
    pub async fn record_verified(&self, vm_id: &str, credential: &ResolvedCredential) {
        if credential.username == credential.verified_username {
            return;
        }

        match self
            .graph
            .put_verified_username(&credential.ssh_key_id, &credential.username)
            .await
        {
            Ok(()) => info!(
                "[{}] recorded as verified username of SSH key {} (VM {})",
                credential.username, credential.ssh_key_id, vm_id
            ),
            Err(e) => warn!(
                "Could not record verified username for SSH key {} (VM {}): {}",
                credential.ssh_key_id, vm_id, e
            ),
        }
    }
}
