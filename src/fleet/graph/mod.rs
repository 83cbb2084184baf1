//! Resource graph abstractions for fleet metadata.
//!
//! This module provides:
//! - `ResourceGraph`: the async trait the execution core consumes
//! - `MemoryGraph`: a DashMap-backed implementation
//! - `Inventory`: a JSON document that seeds a `MemoryGraph`

mod inventory;
mod memory;
mod traits;

pub use inventory::{FleetInventory, Inventory};
pub use memory::MemoryGraph;
pub use traits::ResourceGraph;
