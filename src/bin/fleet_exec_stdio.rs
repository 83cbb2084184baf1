#![deny(warnings)]
#![deny(clippy::unwrap_used)]

use std::sync::Arc;

use fleet_exec::fleet::graph::{Inventory, MemoryGraph};
use fleet_exec::fleet::{FleetService, FleetSettings, FleetTools};
use poem_mcpserver::McpServer;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    // stdout carries the protocol; logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let inventory_path =
        std::env::var("FLEET_INVENTORY").unwrap_or_else(|_| "fleet-inventory.json".to_string());
    let graph = Inventory::load(&inventory_path)
        .map(Inventory::into_graph)
        .unwrap_or_else(|e| {
            tracing::warn!("{}. Starting with an empty resource graph", e);
            MemoryGraph::new()
        });

    let service = Arc::new(FleetService::new(
        Arc::new(graph),
        &FleetSettings::from_env(),
    ));
    poem_mcpserver::stdio::stdio(McpServer::new().tools(FleetTools::new(service))).await?;
    Ok(())
}
