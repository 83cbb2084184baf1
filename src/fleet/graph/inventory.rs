//! JSON inventory used to seed a [`MemoryGraph`].
//!
//! ```json
//! {
//!   "fleets": [{ "id": "ns1/mcis1", "vms": [{ "id": "vm1", "subgroup_id": "g1", ... }] }],
//!   "vnets": [{ "id": "vnet1", "subnets": [{ "id": "subnet1", "bastion_node_ids": [] }] }],
//!   "ssh_keys": [{ "id": "key1", "username": "cb-user", "private_key": "..." }]
//! }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::fleet::error::{FleetError, FleetResult};
use crate::fleet::types::{SshKeyRecord, VNetRecord, VmRecord};

use super::memory::MemoryGraph;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetInventory {
    pub id: String,
    #[serde(default)]
    pub vms: Vec<VmRecord>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Inventory {
    #[serde(default)]
    pub fleets: Vec<FleetInventory>,
    #[serde(default)]
    pub vnets: Vec<VNetRecord>,
    #[serde(default)]
    pub ssh_keys: Vec<SshKeyRecord>,
}

impl Inventory {
    pub fn from_json(json: &str) -> FleetResult<Self> {
        serde_json::from_str(json).map_err(|e| FleetError::Store(format!("Invalid inventory: {}", e)))
    }

    /// Read an inventory file from disk.
    pub fn load(path: impl AsRef<Path>) -> FleetResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            FleetError::Store(format!("Failed to read inventory {:?}: {}", path, e))
        })?;
        let inventory = Self::from_json(&json)?;
        info!(
            "Loaded inventory {:?}: {} fleet(s), {} VNet(s), {} SSH key(s)",
            path,
            inventory.fleets.len(),
            inventory.vnets.len(),
            inventory.ssh_keys.len()
        );
        Ok(inventory)
    }

    pub fn into_graph(self) -> MemoryGraph {
        let graph = MemoryGraph::new();
        for fleet in self.fleets {
            graph.insert_fleet(&fleet.id);
            for vm in fleet.vms {
                graph.insert_vm(&fleet.id, vm);
            }
        }
        for vnet in self.vnets {
            graph.insert_vnet(vnet);
        }
        for key in self.ssh_keys {
            graph.insert_ssh_key(key);
        }
        graph
    }
}
