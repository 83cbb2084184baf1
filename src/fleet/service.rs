//! Library façade over the execution core.
//!
//! `FleetService` wires one shared resource graph into the dispatcher and the
//! bastion resolver and exposes the three upward operations.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::bastion::BastionResolver;
use super::config::FleetSettings;
use super::dispatcher::CommandDispatcher;
use super::error::FleetResult;
use super::graph::ResourceGraph;
use super::tunnel::{RemoteExecutor, TunnelSession, TunnelSettings};
use super::types::{CommandBatch, CommandResult};

pub struct FleetService {
    dispatcher: CommandDispatcher,
    bastions: BastionResolver,
}

impl FleetService {
    /// Service executing batches over real SSH tunnels.
    pub fn new(graph: Arc<dyn ResourceGraph>, settings: &FleetSettings) -> Self {
        let executor = Arc::new(TunnelSession::new(TunnelSettings::from(settings)));
        Self::with_executor(graph, settings, executor)
    }

    pub fn with_executor(
        graph: Arc<dyn ResourceGraph>,
        settings: &FleetSettings,
        executor: Arc<dyn RemoteExecutor>,
    ) -> Self {
        Self {
            dispatcher: CommandDispatcher::new(graph.clone(), settings, executor),
            bastions: BastionResolver::new(graph),
        }
    }

    /// Run `batch` on its targets; see [`CommandDispatcher::dispatch`].
    pub async fn execute_remote_command(
        &self,
        batch: &CommandBatch,
        cancel: &CancellationToken,
    ) -> FleetResult<Vec<CommandResult>> {
        self.dispatcher.dispatch(batch, cancel).await
    }

    pub async fn register_bastion(
        &self,
        fleet_id: &str,
        target_vm_id: &str,
        bastion_vm_id: &str,
    ) -> FleetResult<String> {
        self.bastions
            .register_bastion(fleet_id, target_vm_id, bastion_vm_id)
            .await
    }

    /// Bastion ids serving the subnet of `vm_id`; the first one is active.
    pub async fn list_bastions(&self, fleet_id: &str, vm_id: &str) -> FleetResult<Vec<String>> {
        self.bastions.resolve_bastion(fleet_id, vm_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::error::FleetError;
    use crate::fleet::graph::Inventory;

    const INVENTORY: &str = r#"{
        "fleets": [{
            "id": "ns1/mcis1",
            "vms": [
                { "id": "vm1", "private_address": "10.0.1.4", "vnet_id": "vnet1",
                  "subnet_id": "subnet1", "ssh_key_id": "key1" },
                { "id": "bastion1", "public_address": "203.0.113.10", "private_address": "10.0.1.2",
                  "vnet_id": "vnet1", "subnet_id": "subnet1", "ssh_key_id": "key1" }
            ]
        }],
        "vnets": [{ "id": "vnet1", "subnets": [{ "id": "subnet1" }] }],
        "ssh_keys": [{ "id": "key1", "username": "cb-user", "private_key": "not a key" }]
    }"#;

    fn service() -> FleetService {
        let graph = Arc::new(Inventory::from_json(INVENTORY).unwrap().into_graph());
        let settings = FleetSettings {
            probe_enabled: false,
            ..Default::default()
        };
        FleetService::new(graph, &settings)
    }

    #[tokio::test]
    async fn test_register_then_list() {
        let service = service();
        assert!(matches!(
            service.list_bastions("ns1/mcis1", "vm1").await,
            Err(FleetError::NoBastionAssigned { .. })
        ));

        service
            .register_bastion("ns1/mcis1", "vm1", "bastion1")
            .await
            .unwrap();
        assert_eq!(
            service.list_bastions("ns1/mcis1", "vm1").await.unwrap(),
            vec!["bastion1"]
        );
    }

    #[tokio::test]
    async fn test_unparsable_key_lands_in_result() {
        let service = service();
        service
            .register_bastion("ns1/mcis1", "vm1", "bastion1")
            .await
            .unwrap();

        let batch = CommandBatch {
            target: crate::fleet::types::TargetSelector {
                fleet_id: "ns1/mcis1".to_string(),
                subgroup_id: None,
                vm_id: Some("vm1".to_string()),
            },
            username: None,
            commands: vec!["uptime".to_string()],
        };
        let results = service
            .execute_remote_command(&batch, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
        assert!(matches!(results[0].error, Some(FleetError::KeyParse { .. })));
        assert_eq!(results[0].vm_ip, "10.0.1.4");
    }
}
