//! Resource graph trait definition.
//!
//! The execution core never touches the store directly; it goes through this
//! trait so the persistence engine can be swapped (or mocked in tests).

use async_trait::async_trait;

use crate::fleet::error::FleetResult;
use crate::fleet::types::{SshKeyRecord, VNetRecord, VmRecord};

/// Read/write surface of the fleet metadata store.
///
/// Implementations must be thread-safe (`Send + Sync`); every dispatch unit
/// holds a shared reference and queries it concurrently. Missing resources
/// are reported as `FleetError::NotFound`.
#[async_trait]
pub trait ResourceGraph: Send + Sync {
    /// Fetch a VM of a fleet.
    async fn get_vm(&self, fleet_id: &str, vm_id: &str) -> FleetResult<VmRecord>;

    /// Fetch a VNet aggregate with its subnets and bastion associations.
    async fn get_vnet(&self, vnet_id: &str) -> FleetResult<VNetRecord>;

    /// Overwrite a VNet aggregate. There are no partial-field updates.
    async fn put_vnet(&self, vnet: VNetRecord) -> FleetResult<()>;

    /// Fetch an SSH-key resource.
    async fn get_ssh_key(&self, key_id: &str) -> FleetResult<SshKeyRecord>;

    /// Record a username that completed a handshake with this key.
    async fn put_verified_username(&self, key_id: &str, username: &str) -> FleetResult<()>;

    /// All VM ids of a fleet, in insertion order.
    async fn list_vm_ids(&self, fleet_id: &str) -> FleetResult<Vec<String>>;

    /// VM ids of one subgroup of a fleet, in insertion order.
    async fn list_vm_ids_by_subgroup(
        &self,
        fleet_id: &str,
        subgroup_id: &str,
    ) -> FleetResult<Vec<String>>;
}
