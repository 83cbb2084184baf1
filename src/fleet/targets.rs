//! Target selection: fleet, optionally narrowed to a subgroup or a single VM.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, error};

use super::error::{FleetError, FleetResult};
use super::graph::ResourceGraph;
use super::types::TargetSelector;

pub struct TargetResolver {
    graph: Arc<dyn ResourceGraph>,
}

impl TargetResolver {
    pub fn new(graph: Arc<dyn ResourceGraph>) -> Self {
        Self { graph }
    }

    /// Resolve the duplicate-free set of VM ids a batch should run on.
    ///
    /// A `vm_id` collapses the set to that single id even when it is not a
    /// member of the requested subgroup; subgroup errors are still raised
    /// first.
    pub async fn resolve(&self, selector: &TargetSelector) -> FleetResult<BTreeSet<String>> {
        let result = self.resolve_inner(selector).await;
        match &result {
            Ok(ids) => debug!("Fleet {} resolved {} target(s)", selector.fleet_id, ids.len()),
            Err(e) => error!("Target resolution for fleet {}: {}", selector.fleet_id, e),
        }
        result
    }

    async fn resolve_inner(&self, selector: &TargetSelector) -> FleetResult<BTreeSet<String>> {
        let fleet_id = selector.fleet_id.as_str();
        let mut ids: BTreeSet<String> = self.graph.list_vm_ids(fleet_id).await?.into_iter().collect();

        if let Some(subgroup_id) = non_empty(selector.subgroup_id.as_deref()) {
            ids = self
                .graph
                .list_vm_ids_by_subgroup(fleet_id, subgroup_id)
                .await?
                .into_iter()
                .collect();
            if ids.is_empty() {
                return Err(FleetError::EmptySubgroup {
                    fleet_id: fleet_id.to_string(),
                    subgroup_id: subgroup_id.to_string(),
                });
            }
        }

        if let Some(vm_id) = non_empty(selector.vm_id.as_deref()) {
            return Ok(BTreeSet::from([vm_id.to_string()]));
        }

        if ids.is_empty() {
            return Err(FleetError::NoTargets(fleet_id.to_string()));
        }
        Ok(ids)
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}
