//! Two-hop SSH tunnel running an ordered command batch on a private VM.
//!
//! ```text
//! dispatcher ──TCP──▶ bastion (public address) ──direct-tcpip──▶ target (private address)
//! ```
//!
//! The bastion hop is a regular SSH connection. The target hop is a second,
//! independent SSH handshake carried inside a `direct-tcpip` channel of the
//! bastion session, so the target's identity is authenticated end to end.
//!
//! Commands run one at a time, each on a fresh session channel. The first
//! failing command ends the batch; everything captured up to and including
//! it is returned.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::keys::{self, PrivateKey, PrivateKeyWithHashAlg};
use russh::{ChannelMsg, Disconnect, client};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::FleetSettings;
use super::error::{FleetError, FleetResult, Hop};
use super::probe::{ConnectivityProbe, RetryPolicy};
use super::session::{FleetClientHandler, HostKeyPolicy, build_client_config};
use super::transport::{DirectTransport, ProxiedTransport, Transport};
use super::types::{BatchOutput, TunnelEndpoint};

/// Runs a command batch on a target VM through a bastion.
///
/// [`TunnelSession`] is the SSH implementation; the dispatcher only depends
/// on this trait.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn run(
        &self,
        bastion: &TunnelEndpoint,
        target: &TunnelEndpoint,
        commands: &[String],
        cancel: &CancellationToken,
    ) -> FleetResult<BatchOutput>;
}

/// Settings for one tunnel run.
#[derive(Debug, Clone)]
pub struct TunnelSettings {
    /// Probe the bastion before dialing; `None` skips the probe
    pub probe: Option<RetryPolicy>,
    /// Timeout for each of dial, SSH handshake and authentication, applied per hop
    pub handshake_timeout: Duration,
    pub command_timeout: Option<Duration>,
    pub host_key_policy: Arc<HostKeyPolicy>,
}

impl From<&FleetSettings> for TunnelSettings {
    fn from(settings: &FleetSettings) -> Self {
        Self {
            probe: settings.probe_enabled.then_some(settings.probe),
            handshake_timeout: settings.handshake_timeout,
            command_timeout: settings.command_timeout,
            host_key_policy: Arc::new(settings.host_key_policy.clone()),
        }
    }
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self::from(&FleetSettings::default())
    }
}

/// What one command produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct CommandOutcome {
    pub stdout: String,
    pub stderr: String,
    /// Set when the command counts as failed
    pub failure: Option<String>,
}

/// Run `commands` strictly in order through `exec`, stopping at the first failure.
///
/// An `Err` from `exec` is terminal and discards the partial output.
pub(crate) async fn execute_batch<F, Fut>(commands: &[String], mut exec: F) -> FleetResult<BatchOutput>
where
    F: FnMut(usize, String) -> Fut,
    Fut: Future<Output = FleetResult<CommandOutcome>>,
{
    let mut output = BatchOutput::default();

    for (index, command) in commands.iter().enumerate() {
        let outcome = exec(index, command.clone()).await?;
        output.stdout.insert(index, outcome.stdout);

        match outcome.failure {
            None => {
                output.stderr.insert(index, outcome.stderr);
            }
            Some(reason) => {
                output
                    .stderr
                    .insert(index, format!("({})\nStderr: {}", reason, outcome.stderr));
                output.error = Some(FleetError::CommandExecution { index, reason });
                break;
            }
        }
    }

    Ok(output)
}

fn parse_key(endpoint: &TunnelEndpoint, hop: Hop) -> FleetResult<Arc<PrivateKey>> {
    keys::decode_secret_key(&endpoint.private_key, None)
        .map(Arc::new)
        .map_err(|e| {
            let err = FleetError::KeyParse {
                hop,
                reason: e.to_string(),
            };
            error!("{}", err);
            err
        })
}

/// Open a stream through `transport`, run the SSH handshake over it and
/// authenticate with the endpoint's key.
async fn establish<T: Transport + ?Sized>(
    transport: &T,
    endpoint: &TunnelEndpoint,
    key: Arc<PrivateKey>,
    hop: Hop,
    settings: &TunnelSettings,
) -> FleetResult<client::Handle<FleetClientHandler>> {
    let address = endpoint.address();
    debug!("Opening {} stream to {} {}", transport.name(), hop, address);

    let stream = transport
        .open(&endpoint.host, endpoint.port)
        .await
        .map_err(|reason| FleetError::Dial {
            hop,
            address: address.clone(),
            reason,
        })?;

    let handler = FleetClientHandler::new(settings.host_key_policy.clone(), address.clone());
    let connect_future = client::connect_stream(build_client_config(), stream, handler);

    let mut handle = tokio::time::timeout(settings.handshake_timeout, connect_future)
        .await
        .map_err(|_| FleetError::Handshake {
            hop,
            address: address.clone(),
            reason: format!("timed out after {:?}", settings.handshake_timeout),
        })?
        .map_err(|e| FleetError::Handshake {
            hop,
            address: address.clone(),
            reason: e.to_string(),
        })?;

    let auth_future = async {
        // For RSA keys, use the best supported hash algorithm
        let hash_alg = handle
            .best_supported_rsa_hash()
            .await
            .ok()
            .flatten()
            .flatten();
        debug!("Using RSA hash algorithm for {} key auth: {:?}", hop, hash_alg);

        handle
            .authenticate_publickey(&endpoint.username, PrivateKeyWithHashAlg::new(key, hash_alg))
            .await
    };

    let authenticated = match tokio::time::timeout(settings.handshake_timeout, auth_future).await {
        Err(_) => {
            return Err(FleetError::Handshake {
                hop,
                address,
                reason: format!(
                    "authentication timed out after {:?}",
                    settings.handshake_timeout
                ),
            });
        }
        Ok(Ok(result)) => result.success(),
        Ok(Err(e)) => {
            warn!("Key authentication error on {} {}: {}", hop, address, e);
            false
        }
    };

    if !authenticated {
        return Err(FleetError::Authentication {
            hop,
            address,
            username: endpoint.username.clone(),
        });
    }

    info!("[SSH] {}@{} ({}) authenticated", endpoint.username, address, hop);
    Ok(handle)
}

async fn disconnect(handle: &client::Handle<FleetClientHandler>, hop: Hop) {
    if let Err(e) = handle
        .disconnect(Disconnect::ByApplication, "Command batch finished", "en")
        .await
    {
        debug!("Error during {} disconnect: {}", hop, e);
    }
}

/// Run one command on a fresh session channel and collect its output.
///
/// Only a channel that cannot be opened is an `Err`; every other problem is
/// reported as a failed [`CommandOutcome`].
async fn run_command(
    handle: &client::Handle<FleetClientHandler>,
    command: &str,
    timeout: Option<Duration>,
) -> FleetResult<CommandOutcome> {
    let mut channel = handle
        .channel_open_session()
        .await
        .map_err(|e| FleetError::SessionOpen(e.to_string()))?;

    if let Err(e) = channel.exec(true, command).await {
        let _ = channel.close().await;
        return Ok(CommandOutcome {
            failure: Some(format!("Failed to execute command: {}", e)),
            ..Default::default()
        });
    }

    // Pre-allocate buffers to reduce reallocations during output collection
    let mut stdout = Vec::with_capacity(4096);
    let mut stderr = Vec::with_capacity(1024);
    let mut exit_status: Option<u32> = None;
    let mut exit_signal: Option<String> = None;

    let collect = async {
        loop {
            match channel.wait().await {
                Some(ChannelMsg::Data { data }) => {
                    stdout.extend_from_slice(&data);
                }
                Some(ChannelMsg::ExtendedData { data, ext }) => {
                    // ext == 1 is stderr in SSH protocol
                    if ext == 1 {
                        stderr.extend_from_slice(&data);
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status: code }) => {
                    exit_status = Some(code);
                }
                Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                    exit_signal = Some(format!("{:?}", signal_name));
                }
                Some(ChannelMsg::Eof) => {
                    // Continue to wait for exit status if not received yet
                    if exit_status.is_some() || exit_signal.is_some() {
                        break;
                    }
                }
                Some(ChannelMsg::Close) | None => break,
                Some(_) => {}
            }
        }
    };

    let timed_out = match timeout {
        Some(limit) => tokio::time::timeout(limit, collect).await.is_err(),
        None => {
            collect.await;
            false
        }
    };

    let _ = channel.close().await;

    let failure = if timed_out {
        Some(format!(
            "Command timed out after {:?}",
            timeout.unwrap_or_default()
        ))
    } else if let Some(signal) = exit_signal {
        Some(format!("Process exited with signal {}", signal))
    } else {
        match exit_status {
            Some(0) => None,
            Some(code) => Some(format!("Process exited with status {}", code)),
            None => Some("Channel closed without exit status".to_string()),
        }
    };

    Ok(CommandOutcome {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        failure,
    })
}

/// SSH implementation of [`RemoteExecutor`].
pub struct TunnelSession {
    settings: TunnelSettings,
}

impl TunnelSession {
    pub fn new(settings: TunnelSettings) -> Self {
        Self { settings }
    }

    async fn run_inner(
        &self,
        bastion: &TunnelEndpoint,
        target: &TunnelEndpoint,
        commands: &[String],
        cancel: &CancellationToken,
    ) -> FleetResult<BatchOutput> {
        // Both keys are checked before anything touches the network
        let bastion_key = parse_key(bastion, Hop::Bastion)?;
        let target_key = parse_key(target, Hop::Target)?;

        if let Some(policy) = self.settings.probe {
            ConnectivityProbe::new(policy)
                .probe(&bastion.host, bastion.port, cancel)
                .await?;
        }

        let direct = DirectTransport::new(self.settings.handshake_timeout);
        let bastion_handle =
            establish(&direct, bastion, bastion_key, Hop::Bastion, &self.settings).await?;

        let proxied = ProxiedTransport::new(&bastion_handle, self.settings.handshake_timeout);
        let target_handle =
            match establish(&proxied, target, target_key, Hop::Target, &self.settings).await {
                Ok(handle) => handle,
                Err(e) => {
                    disconnect(&bastion_handle, Hop::Bastion).await;
                    return Err(e);
                }
            };

        let command_timeout = self.settings.command_timeout;
        let handle = &target_handle;
        let result = execute_batch(commands, move |index, command| async move {
            debug!("[{}] running command {}: {}", target.host, index, command);
            run_command(handle, &command, command_timeout).await
        })
        .await;

        disconnect(&target_handle, Hop::Target).await;
        disconnect(&bastion_handle, Hop::Bastion).await;

        result
    }
}

#[async_trait]
impl RemoteExecutor for TunnelSession {
    async fn run(
        &self,
        bastion: &TunnelEndpoint,
        target: &TunnelEndpoint,
        commands: &[String],
        cancel: &CancellationToken,
    ) -> FleetResult<BatchOutput> {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FleetError::Cancelled),
            result = self.run_inner(bastion, target, commands, cancel) => result,
        };

        match &result {
            Ok(output) => match &output.error {
                Some(e) => warn!("[{}] batch stopped: {}", target.host, e),
                None => info!(
                    "[{}] {} command(s) completed via bastion {}",
                    target.host,
                    commands.len(),
                    bastion.address()
                ),
            },
            Err(e) => error!("[{}] tunnel failed: {}", target.host, e),
        }
        result
    }
}
