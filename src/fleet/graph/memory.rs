//! DashMap-based resource graph implementation.
//!
//! Provides lock-free concurrent access to fleet metadata. VMs are keyed by
//! `(fleet_id, vm_id)`; a secondary index keeps each fleet's and subgroup's
//! member order for listing.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::fleet::error::{FleetError, FleetResult, ResourceKind};
use crate::fleet::types::{SshKeyRecord, VNetRecord, VmRecord};

use super::traits::ResourceGraph;

/// In-memory implementation of [`ResourceGraph`].
///
/// Uses `DashMap` instances for:
/// - VMs: (fleet_id, vm_id) -> VmRecord
/// - Fleet members: fleet_id -> ordered vm ids
/// - Subgroup members: (fleet_id, subgroup_id) -> ordered vm ids
/// - VNets and SSH keys by id
#[derive(Default)]
pub struct MemoryGraph {
    vms: DashMap<(String, String), VmRecord>,
    fleet_members: DashMap<String, Vec<String>>,
    subgroup_members: DashMap<(String, String), Vec<String>>,
    vnets: DashMap<String, VNetRecord>,
    ssh_keys: DashMap<String, SshKeyRecord>,
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fleet with no VMs. Listing it yields an empty set.
    pub fn insert_fleet(&self, fleet_id: &str) {
        self.fleet_members.entry(fleet_id.to_string()).or_default();
    }

    /// Insert or replace a VM, indexing it under its fleet and subgroup.
    pub fn insert_vm(&self, fleet_id: &str, vm: VmRecord) {
        let vm_id = vm.id.clone();

        {
            let mut members = self.fleet_members.entry(fleet_id.to_string()).or_default();
            if !members.contains(&vm_id) {
                members.push(vm_id.clone());
            }
        }

        let previous_subgroup = self
            .vms
            .get(&(fleet_id.to_string(), vm_id.clone()))
            .and_then(|existing| existing.subgroup_id.clone());
        if let Some(previous) = previous_subgroup.filter(|p| vm.subgroup_id.as_ref() != Some(p))
            && let Some(mut members) = self
                .subgroup_members
                .get_mut(&(fleet_id.to_string(), previous))
        {
            members.retain(|id| id != &vm_id);
        }

        if let Some(subgroup_id) = &vm.subgroup_id {
            let mut members = self
                .subgroup_members
                .entry((fleet_id.to_string(), subgroup_id.clone()))
                .or_default();
            if !members.contains(&vm_id) {
                members.push(vm_id.clone());
            }
        }

        self.vms.insert((fleet_id.to_string(), vm_id), vm);
    }

    pub fn insert_vnet(&self, vnet: VNetRecord) {
        self.vnets.insert(vnet.id.clone(), vnet);
    }

    pub fn insert_ssh_key(&self, key: SshKeyRecord) {
        self.ssh_keys.insert(key.id.clone(), key);
    }
}

#[async_trait]
impl ResourceGraph for MemoryGraph {
    async fn get_vm(&self, fleet_id: &str, vm_id: &str) -> FleetResult<VmRecord> {
        self.vms
            .get(&(fleet_id.to_string(), vm_id.to_string()))
            .map(|entry| entry.value().clone())
            .ok_or_else(|| FleetError::not_found(ResourceKind::Vm, vm_id))
    }

    async fn get_vnet(&self, vnet_id: &str) -> FleetResult<VNetRecord> {
        self.vnets
            .get(vnet_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| FleetError::not_found(ResourceKind::VNet, vnet_id))
    }

    async fn put_vnet(&self, vnet: VNetRecord) -> FleetResult<()> {
        self.vnets.insert(vnet.id.clone(), vnet);
        Ok(())
    }

    async fn get_ssh_key(&self, key_id: &str) -> FleetResult<SshKeyRecord> {
        self.ssh_keys
            .get(key_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| FleetError::not_found(ResourceKind::SshKey, key_id))
    }

    async fn put_verified_username(&self, key_id: &str, username: &str) -> FleetResult<()> {
        let mut key = self
            .ssh_keys
            .get_mut(key_id)
            .ok_or_else(|| FleetError::not_found(ResourceKind::SshKey, key_id))?;
        key.verified_username = username.to_string();
        Ok(())
    }

    async fn list_vm_ids(&self, fleet_id: &str) -> FleetResult<Vec<String>> {
        self.fleet_members
            .get(fleet_id)
            .map(|members| members.value().clone())
            .ok_or_else(|| FleetError::not_found(ResourceKind::Fleet, fleet_id))
    }

    async fn list_vm_ids_by_subgroup(
        &self,
        fleet_id: &str,
        subgroup_id: &str,
    ) -> FleetResult<Vec<String>> {
        if !self.fleet_members.contains_key(fleet_id) {
            return Err(FleetError::not_found(ResourceKind::Fleet, fleet_id));
        }
        self.subgroup_members
            .get(&(fleet_id.to_string(), subgroup_id.to_string()))
            .map(|members| members.value().clone())
            .ok_or_else(|| FleetError::not_found(ResourceKind::Subgroup, subgroup_id))
    }
}
