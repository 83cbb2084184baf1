//! Configuration resolution for fleet command execution.
//!
//! Values follow a three-tier priority system:
//!
//! 1. **Parameter** - Explicitly provided value (highest priority)
//! 2. **Environment Variable** - Value from environment variable
//! 3. **Default** - Built-in default value (lowest priority)
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `FLEET_PROBE_MAX_ATTEMPTS` | 5 | TCP reachability attempts before giving up |
//! | `FLEET_PROBE_TIMEOUT` | 20s | Timeout of a single probe attempt in seconds |
//! | `FLEET_PROBE_DELAY` | 5s | Delay between probe attempts in seconds |
//! | `FLEET_PROBE_ENABLED` | true | Probe the bastion before the SSH handshake |
//! | `FLEET_HANDSHAKE_TIMEOUT` | 30s | Dial + handshake timeout per hop in seconds |
//! | `FLEET_COMMAND_TIMEOUT` | 0 | Per-command timeout in seconds (0 disables) |
//! | `FLEET_DEFAULT_USERNAME` | cb-user | Login used when nothing else resolves |
//! | `FLEET_HOST_KEY_POLICY` | accept-any | `accept-any` or `pinned` |
//! | `FLEET_KNOWN_HOST_KEYS` | (empty) | Comma-separated SHA256 fingerprints for `pinned` |
//! | `FLEET_MAX_CONCURRENCY` | 0 | Cap on simultaneous VM sessions (0 = unbounded) |
//! | `FLEET_VERIFIED_WRITE_BACK` | true | Record usernames that completed a handshake |

use std::env;
use std::time::Duration;

use tracing::warn;

use super::probe::RetryPolicy;
use super::session::HostKeyPolicy;

/// Default number of probe attempts
pub(crate) const DEFAULT_PROBE_MAX_ATTEMPTS: u32 = 5;

/// Default timeout of one probe attempt in seconds
pub(crate) const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 20;

/// Default delay between probe attempts in seconds
pub(crate) const DEFAULT_PROBE_DELAY_SECS: u64 = 5;

/// Default SSH dial + handshake timeout in seconds
pub(crate) const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 30;

/// Default login identity for fleet VMs
pub(crate) const DEFAULT_USERNAME: &str = "cb-user";

pub(crate) const PROBE_MAX_ATTEMPTS_ENV_VAR: &str = "FLEET_PROBE_MAX_ATTEMPTS";
pub(crate) const PROBE_TIMEOUT_ENV_VAR: &str = "FLEET_PROBE_TIMEOUT";
pub(crate) const PROBE_DELAY_ENV_VAR: &str = "FLEET_PROBE_DELAY";
pub(crate) const PROBE_ENABLED_ENV_VAR: &str = "FLEET_PROBE_ENABLED";
pub(crate) const HANDSHAKE_TIMEOUT_ENV_VAR: &str = "FLEET_HANDSHAKE_TIMEOUT";
pub(crate) const COMMAND_TIMEOUT_ENV_VAR: &str = "FLEET_COMMAND_TIMEOUT";
pub(crate) const DEFAULT_USERNAME_ENV_VAR: &str = "FLEET_DEFAULT_USERNAME";
pub(crate) const HOST_KEY_POLICY_ENV_VAR: &str = "FLEET_HOST_KEY_POLICY";
pub(crate) const KNOWN_HOST_KEYS_ENV_VAR: &str = "FLEET_KNOWN_HOST_KEYS";
pub(crate) const MAX_CONCURRENCY_ENV_VAR: &str = "FLEET_MAX_CONCURRENCY";
pub(crate) const VERIFIED_WRITE_BACK_ENV_VAR: &str = "FLEET_VERIFIED_WRITE_BACK";

fn env_parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.trim().parse::<T>().ok())
}

fn env_flag(name: &str) -> Option<bool> {
    env::var(name)
        .ok()
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
}

/// Resolve the probe attempt count with priority: parameter -> env var -> default
pub(crate) fn resolve_probe_max_attempts(param: Option<u32>) -> u32 {
    param
        .or_else(|| env_parsed(PROBE_MAX_ATTEMPTS_ENV_VAR))
        .unwrap_or(DEFAULT_PROBE_MAX_ATTEMPTS)
}

/// Resolve the per-attempt probe timeout with priority: parameter -> env var -> default
pub(crate) fn resolve_probe_timeout(param: Option<u64>) -> Duration {
    Duration::from_secs(
        param
            .or_else(|| env_parsed(PROBE_TIMEOUT_ENV_VAR))
            .unwrap_or(DEFAULT_PROBE_TIMEOUT_SECS),
    )
}

/// Resolve the inter-attempt probe delay with priority: parameter -> env var -> default
pub(crate) fn resolve_probe_delay(param: Option<u64>) -> Duration {
    Duration::from_secs(
        param
            .or_else(|| env_parsed(PROBE_DELAY_ENV_VAR))
            .unwrap_or(DEFAULT_PROBE_DELAY_SECS),
    )
}

/// Resolve whether the bastion is probed before the handshake (default: true)
pub(crate) fn resolve_probe_enabled(param: Option<bool>) -> bool {
    param
        .or_else(|| env_flag(PROBE_ENABLED_ENV_VAR))
        .unwrap_or(true)
}

/// Resolve the handshake timeout with priority: parameter -> env var -> default
pub(crate) fn resolve_handshake_timeout(param: Option<u64>) -> Duration {
    Duration::from_secs(
        param
            .or_else(|| env_parsed(HANDSHAKE_TIMEOUT_ENV_VAR))
            .unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT_SECS),
    )
}

/// Resolve the per-command timeout. Zero means commands may run indefinitely.
pub(crate) fn resolve_command_timeout(param: Option<u64>) -> Option<Duration> {
    let secs = param
        .or_else(|| env_parsed(COMMAND_TIMEOUT_ENV_VAR))
        .unwrap_or(0);
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// Resolve the fallback login identity. An explicitly empty value disables the fallback.
pub(crate) fn resolve_default_username(param: Option<String>) -> String {
    param
        .or_else(|| env::var(DEFAULT_USERNAME_ENV_VAR).ok())
        .unwrap_or_else(|| DEFAULT_USERNAME.to_string())
}

/// Resolve the host key policy from `FLEET_HOST_KEY_POLICY` and `FLEET_KNOWN_HOST_KEYS`.
///
/// Unknown policy names fall back to accepting any key, with a warning.
pub(crate) fn resolve_host_key_policy(param: Option<HostKeyPolicy>) -> HostKeyPolicy {
    if let Some(policy) = param {
        return policy;
    }

    let Ok(name) = env::var(HOST_KEY_POLICY_ENV_VAR) else {
        return HostKeyPolicy::AcceptAny;
    };

    match name.to_lowercase().as_str() {
        "pinned" | "strict" => {
            let fingerprints = env::var(KNOWN_HOST_KEYS_ENV_VAR)
                .unwrap_or_default()
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            HostKeyPolicy::Pinned(fingerprints)
        }
        "accept-any" | "accept_any" | "disabled" | "none" => HostKeyPolicy::AcceptAny,
        other => {
            warn!(
                "Unknown host key policy '{}', accepting any host key",
                other
            );
            HostKeyPolicy::AcceptAny
        }
    }
}

/// Resolve the fan-out cap. Zero means one concurrent session per target VM.
pub(crate) fn resolve_max_concurrency(param: Option<usize>) -> Option<usize> {
    let cap = param
        .or_else(|| env_parsed(MAX_CONCURRENCY_ENV_VAR))
        .unwrap_or(0);
    (cap > 0).then_some(cap)
}

/// Resolve whether verified usernames are written back (default: true)
pub(crate) fn resolve_verified_write_back(param: Option<bool>) -> bool {
    param
        .or_else(|| env_flag(VERIFIED_WRITE_BACK_ENV_VAR))
        .unwrap_or(true)
}

/// Explicit values that take priority over the environment.
///
/// Durations are in seconds; `None` falls through to the env var and then
/// to the default.
#[derive(Debug, Clone, Default)]
pub struct SettingsOverrides {
    pub probe_max_attempts: Option<u32>,
    pub probe_timeout_secs: Option<u64>,
    pub probe_delay_secs: Option<u64>,
    pub probe_enabled: Option<bool>,
    pub handshake_timeout_secs: Option<u64>,
    pub command_timeout_secs: Option<u64>,
    pub default_username: Option<String>,
    pub host_key_policy: Option<HostKeyPolicy>,
    pub max_concurrency: Option<usize>,
    pub verified_write_back: Option<bool>,
}

/// Fully resolved settings for the execution core.
#[derive(Debug, Clone)]
pub struct FleetSettings {
    pub probe: RetryPolicy,
    pub probe_enabled: bool,
    pub handshake_timeout: Duration,
    pub command_timeout: Option<Duration>,
    pub default_username: String,
    pub host_key_policy: HostKeyPolicy,
    pub max_concurrency: Option<usize>,
    pub verified_write_back: bool,
}

impl FleetSettings {
    /// Resolve every setting from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        Self::resolve(SettingsOverrides::default())
    }

    /// Resolve every setting with priority: override -> env var -> default.
    pub fn resolve(overrides: SettingsOverrides) -> Self {
        Self {
            probe: RetryPolicy {
                max_attempts: resolve_probe_max_attempts(overrides.probe_max_attempts),
                per_attempt_timeout: resolve_probe_timeout(overrides.probe_timeout_secs),
                inter_attempt_delay: resolve_probe_delay(overrides.probe_delay_secs),
            },
            probe_enabled: resolve_probe_enabled(overrides.probe_enabled),
            handshake_timeout: resolve_handshake_timeout(overrides.handshake_timeout_secs),
            command_timeout: resolve_command_timeout(overrides.command_timeout_secs),
            default_username: resolve_default_username(overrides.default_username),
            host_key_policy: resolve_host_key_policy(overrides.host_key_policy),
            max_concurrency: resolve_max_concurrency(overrides.max_concurrency),
            verified_write_back: resolve_verified_write_back(overrides.verified_write_back),
        }
    }
}

impl Default for FleetSettings {
    fn default() -> Self {
        Self {
            probe: RetryPolicy::default(),
            probe_enabled: true,
            handshake_timeout: Duration::from_secs(DEFAULT_HANDSHAKE_TIMEOUT_SECS),
            command_timeout: None,
            default_username: DEFAULT_USERNAME.to_string(),
            host_key_policy: HostKeyPolicy::AcceptAny,
            max_concurrency: None,
            verified_write_back: true,
        }
    }
}
