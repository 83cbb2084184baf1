//! Error taxonomy for fleet command execution.
//!
//! Errors fall into two propagation classes:
//!
//! 1. **Request-level** (`Validation`, `NotFound` for fleet/subgroup,
//!    `EmptySubgroup`, `NoTargets`): the whole dispatch call fails and no
//!    per-VM results are produced.
//!
//! 2. **Per-VM** (everything else): captured into that VM's `CommandResult`
//!    and never surfaced as a call-level error.
//!
//! Transport failures carry the [`Hop`] they happened on so a reader can tell
//! a dead bastion from an unreachable private target.

use std::fmt;

/// Which leg of a two-hop tunnel an error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hop {
    Bastion,
    Target,
}

impl fmt::Display for Hop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Hop::Bastion => write!(f, "bastion"),
            Hop::Target => write!(f, "target"),
        }
    }
}

/// Kind of resource-graph object that could not be found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Fleet,
    Subgroup,
    Vm,
    VNet,
    SshKey,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Fleet => write!(f, "fleet"),
            ResourceKind::Subgroup => write!(f, "subgroup"),
            ResourceKind::Vm => write!(f, "VM"),
            ResourceKind::VNet => write!(f, "VNet"),
            ResourceKind::SshKey => write!(f, "SSH key"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FleetError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("The {kind} {id} does not exist")]
    NotFound { kind: ResourceKind, id: String },

    #[error("Subnet (ID: {subnet_id}) not found in VNet (ID: {vnet_id}) for VM (ID: {vm_id})")]
    SubnetNotFound {
        vnet_id: String,
        subnet_id: String,
        vm_id: String,
    },

    #[error("No VM in subgroup {subgroup_id} of fleet {fleet_id}")]
    EmptySubgroup {
        fleet_id: String,
        subgroup_id: String,
    },

    #[error("No target VM in fleet {0}")]
    NoTargets(String),

    #[error(
        "No assigned bastion in subnet (ID: {subnet_id}) of VNet (ID: {vnet_id}) for VM (ID: {vm_id})"
    )]
    NoBastionAssigned {
        vnet_id: String,
        subnet_id: String,
        vm_id: String,
    },

    #[error("Could not find a valid username for VM {0}")]
    UsernameUnresolved(String),

    #[error("SSH port {host}:{port} is not accessible ({attempts} trials)")]
    PortUnreachable {
        host: String,
        port: u16,
        attempts: u32,
    },

    #[error("Failed to parse {hop} private key: {reason}")]
    KeyParse { hop: Hop, reason: String },

    #[error("Failed to connect to {hop} {address}: {reason}")]
    Dial {
        hop: Hop,
        address: String,
        reason: String,
    },

    #[error("SSH handshake with {hop} {address} failed: {reason}")]
    Handshake {
        hop: Hop,
        address: String,
        reason: String,
    },

    #[error("Key authentication failed for {username}@{address} ({hop})")]
    Authentication {
        hop: Hop,
        address: String,
        username: String,
    },

    #[error("Failed to open session channel: {0}")]
    SessionOpen(String),

    #[error("Command {index} failed: {reason}")]
    CommandExecution { index: usize, reason: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Dispatch unit aborted: {0}")]
    UnitAborted(String),

    #[error("Resource store error: {0}")]
    Store(String),
}

impl FleetError {
    pub fn not_found(kind: ResourceKind, id: impl Into<String>) -> Self {
        FleetError::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// True for any missing resource, including a subnet missing from its VNet.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            FleetError::NotFound { .. } | FleetError::SubnetNotFound { .. }
        )
    }

    /// True for failures establishing either hop of the tunnel.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            FleetError::KeyParse { .. }
                | FleetError::Dial { .. }
                | FleetError::Handshake { .. }
                | FleetError::Authentication { .. }
                | FleetError::SessionOpen(_)
        )
    }

    /// Errors that abort a dispatch call as a whole instead of landing in a result.
    pub fn is_request_level(&self) -> bool {
        matches!(
            self,
            FleetError::Validation(_)
                | FleetError::EmptySubgroup { .. }
                | FleetError::NoTargets(_)
                | FleetError::NotFound {
                    kind: ResourceKind::Fleet | ResourceKind::Subgroup,
                    ..
                }
        )
    }
}

pub type FleetResult<T> = Result<T, FleetError>;
