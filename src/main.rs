#![deny(warnings)]
#![deny(clippy::unwrap_used)]

use std::sync::Arc;

use dotenv::dotenv;
use fleet_exec::fleet::graph::{Inventory, MemoryGraph};
use fleet_exec::fleet::{FleetService, FleetSettings, FleetTools};
use poem::{EndpointExt, Route, Server, listener::TcpListener, middleware::Tracing};
use poem_mcpserver::{McpServer, streamable_http};
use tracing::{info, warn};

const DEFAULT_INVENTORY_PATH: &str = "fleet-inventory.json";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    // Initialize logging with proper tracing default
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().expect("valid directive")),
        )
        .init();

    // Load fleet metadata; a missing inventory starts the server empty
    let inventory_path =
        std::env::var("FLEET_INVENTORY").unwrap_or_else(|_| DEFAULT_INVENTORY_PATH.to_string());
    let graph = match Inventory::load(&inventory_path) {
        Ok(inventory) => inventory.into_graph(),
        Err(e) => {
            warn!("{}. Starting with an empty resource graph", e);
            MemoryGraph::new()
        }
    };

    let settings = FleetSettings::from_env();
    info!("Fleet settings: {:?}", settings);
    let service = Arc::new(FleetService::new(Arc::new(graph), &settings));

    // Setup MCP server
    let mcp_port: u16 = std::env::var("MCP_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8000);
    let mcp_addr = format!("0.0.0.0:{}", mcp_port);
    info!("Starting MCP server on {}", mcp_addr);

    let app = Route::new()
        .at(
            "/",
            streamable_http::endpoint(move |_| {
                McpServer::new().tools(FleetTools::new(service.clone()))
            }),
        )
        .with(Tracing);

    info!("MCP Server with fleet command execution is ready");
    info!("Use fleet_register_bastion to attach a bastion, then fleet_execute to run commands");

    // Run the MCP server
    Server::new(TcpListener::bind(mcp_addr))
        .name("Fleet Exec MCP Server")
        .run(app)
        .await?;

    Ok(())
}
