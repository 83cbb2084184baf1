//! MCP tool surface for fleet command execution.
//!
//! - `fleet_execute`: Run an ordered command batch on a fleet, subgroup or VM
//! - `fleet_register_bastion`: Associate a bastion with a VM's subnet
//! - `fleet_list_bastions`: Show the bastions serving a VM's subnet

use std::sync::Arc;

use poem_mcpserver::{Tools, tool::StructuredContent};
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use super::service::FleetService;
use super::types::{
    CommandBatch, CommandResult, ExecuteRemoteCommandResponse, ListBastionsResponse,
    RegisterBastionResponse, TargetSelector,
};

/// MCP fleet tools backed by a shared [`FleetService`].
pub struct FleetTools {
    service: Arc<FleetService>,
}

impl FleetTools {
    pub fn new(service: Arc<FleetService>) -> Self {
        Self { service }
    }
}

fn execute_response(
    dispatch_id: String,
    fleet_id: String,
    results: Vec<CommandResult>,
) -> ExecuteRemoteCommandResponse {
    let succeeded = results.iter().filter(|r| r.is_success()).count();
    ExecuteRemoteCommandResponse {
        dispatch_id,
        fleet_id,
        executed_at: chrono::Utc::now().to_rfc3339(),
        failed: results.len() - succeeded,
        succeeded,
        results,
    }
}

#[Tools]
impl FleetTools {
    /// Run shell commands on the VMs of a fleet through their subnet's bastion.
    ///
    /// Every target VM runs the whole list in order and stops at its first
    /// failing command. VMs run concurrently and never affect each other; a
    /// failure on one VM is reported in its own result entry. Results arrive
    /// in completion order, so match them on `vm_id`.
    async fn fleet_execute(
        &self,
        /// Fleet identifier (e.g., "ns01/mcis01")
        fleet_id: String,
        /// Restrict execution to one subgroup of the fleet
        subgroup_id: Option<String>,
        /// Run on this VM only (takes precedence over subgroup_id)
        vm_id: Option<String>,
        /// Login for bastion and target (default: the VM's recorded SSH-key user, then env FLEET_DEFAULT_USERNAME)
        username: Option<String>,
        /// Commands to execute in order
        commands: Vec<String>,
    ) -> Result<StructuredContent<ExecuteRemoteCommandResponse>, String> {
        let dispatch_id = Uuid::new_v4().to_string();
        info!("Dispatch {} requested for fleet {}", dispatch_id, fleet_id);

        let batch = CommandBatch {
            target: TargetSelector {
                fleet_id,
                subgroup_id,
                vm_id,
            },
            username,
            commands,
        };

        // Dropping this request drops the dispatch and aborts its units
        let cancel = CancellationToken::new();
        let results = self
            .service
            .execute_remote_command(&batch, &cancel)
            .await
            .map_err(|e| e.to_string())?;

        Ok(StructuredContent(execute_response(
            dispatch_id,
            batch.target.fleet_id,
            results,
        )))
    }

    /// Associate a bastion VM with the subnet of a target VM.
    ///
    /// All VMs in that subnet are reached through the bastion afterwards.
    /// Registering an existing association changes nothing.
    async fn fleet_register_bastion(
        &self,
        /// Fleet identifier
        fleet_id: String,
        /// VM whose subnet gets the bastion
        target_vm_id: String,
        /// VM acting as bastion (needs a public address)
        bastion_vm_id: String,
    ) -> Result<StructuredContent<RegisterBastionResponse>, String> {
        let message = self
            .service
            .register_bastion(&fleet_id, &target_vm_id, &bastion_vm_id)
            .await
            .map_err(|e| e.to_string())?;

        Ok(StructuredContent(RegisterBastionResponse {
            fleet_id,
            target_vm_id,
            bastion_vm_id,
            message,
        }))
    }

    /// List the bastions serving a VM's subnet. The first one is used for tunnelling.
    async fn fleet_list_bastions(
        &self,
        /// Fleet identifier
        fleet_id: String,
        /// VM whose subnet is inspected
        vm_id: String,
    ) -> Result<StructuredContent<ListBastionsResponse>, String> {
        let bastion_vm_ids = self
            .service
            .list_bastions(&fleet_id, &vm_id)
            .await
            .map_err(|e| e.to_string())?;

        Ok(StructuredContent(ListBastionsResponse {
            fleet_id,
            vm_id,
            active: bastion_vm_ids.first().cloned(),
            bastion_vm_ids,
        }))
    }
}
