//! Bastion association lookup and registration.
//!
//! A bastion is associated with a *subnet*: every VM in that subnet is
//! reached through it. Associations live inside the VNet aggregate, so
//! registering one is a read-modify-write of the whole VNet.
//!
//! # Concurrency
//!
//! Registrations take a per-VNet async mutex around the read-modify-write, so
//! two concurrent registrations on the same VNet cannot overwrite each other
//! within this process. Writers in other processes sharing the store are not
//! covered; a lost update from one of those goes undetected.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{error, info};

use super::error::{FleetError, FleetResult};
use super::graph::ResourceGraph;
use super::types::{VNetRecord, VmRecord};

pub struct BastionResolver {
    graph: Arc<dyn ResourceGraph>,
    vnet_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl BastionResolver {
    pub fn new(graph: Arc<dyn ResourceGraph>) -> Self {
        Self {
            graph,
            vnet_locks: DashMap::new(),
        }
    }

    fn vnet_lock(&self, vnet_id: &str) -> Arc<Mutex<()>> {
        self.vnet_locks
            .entry(vnet_id.to_string())
            .or_default()
            .value()
            .clone()
    }

    async fn load(&self, fleet_id: &str, vm_id: &str) -> FleetResult<(VmRecord, VNetRecord)> {
        let vm = self.graph.get_vm(fleet_id, vm_id).await?;
        let vnet = self.graph.get_vnet(&vm.vnet_id).await?;
        Ok((vm, vnet))
    }

    /// Bastion VM ids recorded for the subnet of `vm_id`. Element 0 is active.
    pub async fn resolve_bastion(&self, fleet_id: &str, vm_id: &str) -> FleetResult<Vec<String>> {
        let result = async {
            let (vm, vnet) = self.load(fleet_id, vm_id).await?;
            let subnet = vnet
                .subnet(&vm.subnet_id)
                .ok_or_else(|| FleetError::SubnetNotFound {
                    vnet_id: vm.vnet_id.clone(),
                    subnet_id: vm.subnet_id.clone(),
                    vm_id: vm_id.to_string(),
                })?;

            if subnet.bastion_node_ids.is_empty() {
                return Err(FleetError::NoBastionAssigned {
                    vnet_id: vm.vnet_id.clone(),
                    subnet_id: vm.subnet_id.clone(),
                    vm_id: vm_id.to_string(),
                });
            }
            Ok(subnet.bastion_node_ids.clone())
        }
        .await;

        if let Err(e) = &result {
            error!("Bastion lookup for VM {} in {}: {}", vm_id, fleet_id, e);
        }
        result
    }

    /// Associate `bastion_vm_id` with the subnet of `target_vm_id`.
    ///
    /// Idempotent: registering an existing association returns an
    /// informational message and writes nothing.
    pub async fn register_bastion(
        &self,
        fleet_id: &str,
        target_vm_id: &str,
        bastion_vm_id: &str,
    ) -> FleetResult<String> {
        let vm = self.graph.get_vm(fleet_id, target_vm_id).await.inspect_err(|e| {
            error!("Bastion registration for VM {}: {}", target_vm_id, e);
        })?;

        let lock = self.vnet_lock(&vm.vnet_id);
        let _guard = lock.lock().await;

        let mut vnet = self.graph.get_vnet(&vm.vnet_id).await.inspect_err(|e| {
            error!("Bastion registration for VM {}: {}", target_vm_id, e);
        })?;

        let Some(subnet) = vnet.subnet_mut(&vm.subnet_id) else {
            let err = FleetError::SubnetNotFound {
                vnet_id: vm.vnet_id.clone(),
                subnet_id: vm.subnet_id.clone(),
                vm_id: target_vm_id.to_string(),
            };
            error!("Failed to set bastion: {}", err);
            return Err(err);
        };

        if subnet.bastion_node_ids.iter().any(|id| id == bastion_vm_id) {
            let message = format!(
                "Bastion (ID: {}) already exists in subnet (ID: {}) in VNet (ID: {}).",
                bastion_vm_id, vm.subnet_id, vm.vnet_id
            );
            info!("{}", message);
            return Ok(message);
        }

        subnet.bastion_node_ids.push(bastion_vm_id.to_string());
        self.graph.put_vnet(vnet).await.inspect_err(|e| {
            error!("Failed to persist VNet {}: {}", vm.vnet_id, e);
        })?;

        let message = format!(
            "Successfully set the bastion (ID: {}) for subnet (ID: {}) in VNet (ID: {}) for VM (ID: {}) in fleet (ID: {}).",
            bastion_vm_id, vm.subnet_id, vm.vnet_id, target_vm_id, fleet_id
        );
        info!("{}", message);
        Ok(message)
    }
}
