//! Fleet command execution over bastion tunnels.
//!
//! VMs of a fleet live in private subnets; each subnet has an ordered list of
//! bastion VMs with public addresses. A batch of shell commands is run on
//! every selected VM by tunnelling SSH through the subnet's active bastion.
//!
//! This module is organized into the following submodules:
//!
//! - `types`: Resource records, requests and serializable responses
//! - `error`: The `FleetError` taxonomy
//! - `config`: Configuration resolution with environment variable support
//! - `graph`: Resource graph trait, in-memory store and JSON inventory
//! - `targets`: Fleet / subgroup / VM target selection
//! - `credential`: Username and key resolution with verified write-back
//! - `bastion`: Bastion lookup and registration
//! - `probe`: Bounded-retry TCP reachability check
//! - `session`: russh client handler and host key policy
//! - `transport`: Direct and `direct-tcpip` streams for the two hops
//! - `tunnel`: Two-hop SSH session running a command batch
//! - `dispatcher`: Concurrent fan-out and result collection
//! - `service`: Library façade
//! - `commands`: MCP tool implementations

pub mod bastion;
pub mod commands;
pub mod config;
pub mod credential;
pub mod dispatcher;
pub mod error;
pub mod graph;
pub mod probe;
pub mod service;
pub mod session;
pub mod targets;
pub(crate) mod transport;
pub mod tunnel;
pub mod types;

pub use commands::FleetTools;
pub use config::{FleetSettings, SettingsOverrides};
pub use error::{FleetError, FleetResult};
pub use service::FleetService;
