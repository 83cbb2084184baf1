//! Fan-out of one command batch to every resolved target VM.
//!
//! Every target gets its own task on a [`JoinSet`]. A task never fails: all
//! per-VM problems (lookup, credentials, bastion, tunnel, command) end up in
//! that VM's [`CommandResult`]. Only request-level problems (validation,
//! target resolution) abort the call.
//!
//! Results are collected in completion order. Callers match on `vm_id`.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::bastion::BastionResolver;
use super::config::FleetSettings;
use super::credential::CredentialResolver;
use super::error::{FleetError, FleetResult};
use super::graph::ResourceGraph;
use super::targets::TargetResolver;
use super::tunnel::RemoteExecutor;
use super::types::{CommandBatch, CommandResult, TunnelEndpoint};

/// Reject malformed requests before touching the resource graph.
pub(crate) fn validate(batch: &CommandBatch) -> FleetResult<()> {
    let fleet_id = &batch.target.fleet_id;
    if fleet_id.is_empty() {
        return Err(FleetError::Validation("fleet id is required".to_string()));
    }
    if fleet_id.chars().any(char::is_whitespace) {
        return Err(FleetError::Validation(format!(
            "fleet id '{}' contains whitespace",
            fleet_id
        )));
    }

    for (name, value) in [
        ("subgroup id", &batch.target.subgroup_id),
        ("VM id", &batch.target.vm_id),
    ] {
        if let Some(id) = value
            && id.chars().any(char::is_whitespace)
        {
            return Err(FleetError::Validation(format!(
                "{} '{}' contains whitespace",
                name, id
            )));
        }
    }

    if batch.commands.is_empty() {
        return Err(FleetError::Validation(
            "at least one command is required".to_string(),
        ));
    }
    if let Some(index) = batch.commands.iter().position(|c| c.trim().is_empty()) {
        return Err(FleetError::Validation(format!("command {} is empty", index)));
    }

    Ok(())
}

/// State shared by every dispatch unit.
struct UnitContext {
    graph: Arc<dyn ResourceGraph>,
    credentials: CredentialResolver,
    bastions: BastionResolver,
    executor: Arc<dyn RemoteExecutor>,
    verified_write_back: bool,
}

impl UnitContext {
    /// Run the batch on one VM. Always yields exactly one result.
    async fn run_unit(
        &self,
        batch: &CommandBatch,
        vm_id: &str,
        limiter: Option<Arc<Semaphore>>,
        cancel: &CancellationToken,
    ) -> CommandResult {
        let fleet_id = batch.target.fleet_id.as_str();
        let mut result = CommandResult::new(fleet_id, vm_id, &batch.commands);

        // Held until the unit finishes
        let _permit = match limiter {
            Some(semaphore) => tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    result.error = Some(FleetError::Cancelled);
                    return result;
                }
                permit = semaphore.acquire_owned() => permit.ok(),
            },
            None => None,
        };

        if let Err(e) = self.execute(batch, vm_id, &mut result, cancel).await {
            error!("[{}] {}", vm_id, e);
            result.error = Some(e);
        }
        result
    }

    async fn execute(
        &self,
        batch: &CommandBatch,
        vm_id: &str,
        result: &mut CommandResult,
        cancel: &CancellationToken,
    ) -> FleetResult<()> {
        let fleet_id = batch.target.fleet_id.as_str();
        let requested = batch.username.as_deref();

        let vm = self.graph.get_vm(fleet_id, vm_id).await?;
        result.vm_ip = vm.private_address.clone();

        let credential = self.credentials.resolve(fleet_id, vm_id, requested).await?;

        let bastion_ids = self.bastions.resolve_bastion(fleet_id, vm_id).await?;
        let Some(bastion_id) = bastion_ids.first() else {
            return Err(FleetError::NoBastionAssigned {
                vnet_id: vm.vnet_id,
                subnet_id: vm.subnet_id,
                vm_id: vm_id.to_string(),
            });
        };
        let bastion_vm = self.graph.get_vm(fleet_id, bastion_id).await?;
        let bastion_credential = self
            .credentials
            .resolve(fleet_id, bastion_id, requested)
            .await?;

        let bastion = TunnelEndpoint {
            host: bastion_vm.public_address,
            port: bastion_vm.ssh_port,
            username: bastion_credential.username,
            private_key: bastion_credential.private_key,
        };
        let target = TunnelEndpoint {
            host: vm.private_address,
            port: vm.ssh_port,
            username: credential.username.clone(),
            private_key: credential.private_key.clone(),
        };

        let output = self
            .executor
            .run(&bastion, &target, &batch.commands, cancel)
            .await?;

        // Reaching here means the target accepted the login
        if self.verified_write_back {
            self.credentials.record_verified(vm_id, &credential).await;
        }

        result.stdout = output.stdout;
        result.stderr = output.stderr;
        result.error = output.error;
        Ok(())
    }
}

pub struct CommandDispatcher {
    targets: TargetResolver,
    context: Arc<UnitContext>,
    limiter: Option<Arc<Semaphore>>,
}

impl CommandDispatcher {
    pub fn new(
        graph: Arc<dyn ResourceGraph>,
        settings: &FleetSettings,
        executor: Arc<dyn RemoteExecutor>,
    ) -> Self {
        let context = UnitContext {
            graph: graph.clone(),
            credentials: CredentialResolver::new(graph.clone(), settings.default_username.clone()),
            bastions: BastionResolver::new(graph.clone()),
            executor,
            verified_write_back: settings.verified_write_back,
        };

        Self {
            targets: TargetResolver::new(graph),
            context: Arc::new(context),
            limiter: settings
                .max_concurrency
                .map(|cap| Arc::new(Semaphore::new(cap))),
        }
    }

    /// Run `batch` on every target VM concurrently.
    ///
    /// Returns one result per resolved VM id in completion order. Dropping the
    /// returned future aborts every unit still running.
    pub async fn dispatch(
        &self,
        batch: &CommandBatch,
        cancel: &CancellationToken,
    ) -> FleetResult<Vec<CommandResult>> {
        validate(batch).inspect_err(|e| error!("Rejected dispatch: {}", e))?;

        let vm_ids = self.targets.resolve(&batch.target).await?;
        info!(
            "Dispatching {} command(s) to {} VM(s) of fleet {}",
            batch.commands.len(),
            vm_ids.len(),
            batch.target.fleet_id
        );

        let shared_batch = Arc::new(batch.clone());
        let mut units = JoinSet::new();
        let mut unit_vms = HashMap::with_capacity(vm_ids.len());

        for vm_id in vm_ids {
            let context = self.context.clone();
            let batch = shared_batch.clone();
            let limiter = self.limiter.clone();
            let cancel = cancel.clone();
            let unit_vm_id = vm_id.clone();

            let handle = units.spawn(async move {
                context
                    .run_unit(&batch, &unit_vm_id, limiter, &cancel)
                    .await
            });
            unit_vms.insert(handle.id(), vm_id);
        }

        let mut results = Vec::with_capacity(unit_vms.len());
        while let Some(joined) = units.join_next_with_id().await {
            match joined {
                Ok((_, result)) => results.push(result),
                Err(e) => {
                    let vm_id = unit_vms.get(&e.id()).cloned().unwrap_or_default();
                    warn!("Dispatch unit for VM {} did not complete: {}", vm_id, e);
                    let mut result =
                        CommandResult::new(&batch.target.fleet_id, &vm_id, &batch.commands);
                    result.error = Some(FleetError::UnitAborted(e.to_string()));
                    results.push(result);
                }
            }
        }

        let failed = results.iter().filter(|r| !r.is_success()).count();
        info!(
            "Dispatch to fleet {} finished: {} succeeded, {} failed",
            batch.target.fleet_id,
            results.len() - failed,
            failed
        );
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::graph::MemoryGraph;
    use crate::fleet::types::{
        BatchOutput, SshKeyRecord, SubnetRecord, TargetSelector, VNetRecord, VmRecord,
    };
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Records every run and echoes each command on stdout.
    #[derive(Default)]
    struct FakeExecutor {
        runs: StdMutex<Vec<(TunnelEndpoint, TunnelEndpoint)>>,
        fail_command_on: Option<String>,
        panic_on: Option<String>,
        delay: Option<Duration>,
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl RemoteExecutor for FakeExecutor {
        async fn run(
            &self,
            bastion: &TunnelEndpoint,
            target: &TunnelEndpoint,
            commands: &[String],
            cancel: &CancellationToken,
        ) -> FleetResult<BatchOutput> {
            if cancel.is_cancelled() {
                return Err(FleetError::Cancelled);
            }
            if self.panic_on.as_deref() == Some(target.host.as_str()) {
                panic!("executor exploded");
            }

            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.active.fetch_sub(1, Ordering::SeqCst);

            self.runs
                .lock()
                .unwrap()
                .push((bastion.clone(), target.clone()));

            let mut output = BatchOutput::default();
            for (index, command) in commands.iter().enumerate() {
                output.stdout.insert(index, format!("{}: {}", target.host, command));
                output.stderr.insert(index, String::new());
                if self.fail_command_on.as_deref() == Some(target.host.as_str()) {
                    output.error = Some(FleetError::CommandExecution {
                        index,
                        reason: "Process exited with status 1".to_string(),
                    });
                    break;
                }
            }
            Ok(output)
        }
    }

    fn vm(id: &str, subgroup: Option<&str>, subnet: &str, private: &str, public: &str) -> VmRecord {
        VmRecord {
            id: id.to_string(),
            subgroup_id: subgroup.map(str::to_string),
            public_address: public.to_string(),
            private_address: private.to_string(),
            ssh_port: 22,
            vnet_id: "vnet1".to_string(),
            subnet_id: subnet.to_string(),
            ssh_key_id: "key1".to_string(),
        }
    }

    /// vm1 sits behind bastion1 in subnet1; vm2 is in subnet2 with no bastion.
    fn graph() -> Arc<MemoryGraph> {
        let graph = MemoryGraph::new();
        graph.insert_vm("f", vm("vm1", Some("workers"), "subnet1", "10.0.1.4", ""));
        graph.insert_vm("f", vm("vm2", Some("workers"), "subnet2", "10.0.2.4", ""));
        graph.insert_vm(
            "f",
            vm("bastion1", None, "subnet1", "10.0.1.2", "203.0.113.10"),
        );
        graph.insert_vnet(VNetRecord {
            id: "vnet1".to_string(),
            subnets: vec![
                SubnetRecord {
                    id: "subnet1".to_string(),
                    bastion_node_ids: vec!["bastion1".to_string()],
                },
                SubnetRecord {
                    id: "subnet2".to_string(),
                    bastion_node_ids: vec![],
                },
            ],
        });
        graph.insert_ssh_key(SshKeyRecord {
            id: "key1".to_string(),
            username: "cb-user".to_string(),
            verified_username: String::new(),
            private_key: "PRIVATE".to_string(),
        });
        Arc::new(graph)
    }

    fn batch(subgroup: Option<&str>, vm_id: Option<&str>, commands: &[&str]) -> CommandBatch {
        CommandBatch {
            target: TargetSelector {
                fleet_id: "f".to_string(),
                subgroup_id: subgroup.map(str::to_string),
                vm_id: vm_id.map(str::to_string),
            },
            username: None,
            commands: commands.iter().map(|c| c.to_string()).collect(),
        }
    }

    fn dispatcher(
        graph: Arc<MemoryGraph>,
        settings: FleetSettings,
        executor: Arc<FakeExecutor>,
    ) -> CommandDispatcher {
        CommandDispatcher::new(graph, &settings, executor)
    }

    fn by_vm(results: Vec<CommandResult>) -> HashMap<String, CommandResult> {
        results.into_iter().map(|r| (r.vm_id.clone(), r)).collect()
    }

    mod validation {
        use super::*;

        #[test]
        fn test_accepts_well_formed_batch() {
            assert!(validate(&batch(Some("workers"), None, &["uptime"])).is_ok());
        }

        #[test]
        fn test_rejects_empty_fleet_id() {
            let mut b = batch(None, None, &["uptime"]);
            b.target.fleet_id = String::new();
            assert!(matches!(validate(&b), Err(FleetError::Validation(_))));
        }

        #[test]
        fn test_rejects_whitespace_in_ids() {
            let mut b = batch(None, None, &["uptime"]);
            b.target.fleet_id = "ns1 mcis1".to_string();
            assert!(matches!(validate(&b), Err(FleetError::Validation(_))));

            let b = batch(Some("work ers"), None, &["uptime"]);
            assert!(matches!(validate(&b), Err(FleetError::Validation(_))));

            let b = batch(None, Some("vm\t1"), &["uptime"]);
            assert!(matches!(validate(&b), Err(FleetError::Validation(_))));
        }

        #[test]
        fn test_rejects_missing_or_empty_commands() {
            assert!(matches!(
                validate(&batch(None, None, &[])),
                Err(FleetError::Validation(_))
            ));
            assert_eq!(
                validate(&batch(None, None, &["uptime", "  "])),
                Err(FleetError::Validation("command 1 is empty".to_string()))
            );
        }

        #[tokio::test]
        async fn test_invalid_batch_never_reaches_executor() {
            let executor = Arc::new(FakeExecutor::default());
            let d = dispatcher(graph(), FleetSettings::default(), executor.clone());
            let err = d
                .dispatch(&batch(None, None, &[]), &CancellationToken::new())
                .await
                .unwrap_err();
            assert!(err.is_request_level());
            assert!(executor.runs.lock().unwrap().is_empty());
        }
    }

    mod fan_out {
        use super::*;

        #[tokio::test]
        async fn test_mixed_success_and_missing_bastion() {
            let executor = Arc::new(FakeExecutor::default());
            let d = dispatcher(graph(), FleetSettings::default(), executor.clone());

            let results = d
                .dispatch(
                    &batch(Some("workers"), None, &["hostname", "uptime"]),
                    &CancellationToken::new(),
                )
                .await
                .unwrap();
            assert_eq!(results.len(), 2);
            let results = by_vm(results);

            let vm1 = &results["vm1"];
            assert!(vm1.is_success());
            assert_eq!(vm1.vm_ip, "10.0.1.4");
            assert_eq!(vm1.stdout.len(), 2);
            assert_eq!(vm1.stdout[&0], "10.0.1.4: hostname");

            let vm2 = &results["vm2"];
            assert!(matches!(
                vm2.error,
                Some(FleetError::NoBastionAssigned { .. })
            ));
            assert_eq!(vm2.vm_ip, "10.0.2.4");
            assert!(vm2.stdout.is_empty());
            assert!(vm2.stderr.is_empty());
            assert_eq!(vm2.commands.len(), 2);

            // Only vm1 produced a tunnel run, through the bastion's public address
            let runs = executor.runs.lock().unwrap();
            assert_eq!(runs.len(), 1);
            let (bastion, target) = &runs[0];
            assert_eq!(bastion.host, "203.0.113.10");
            assert_eq!(target.host, "10.0.1.4");
            assert_eq!(target.username, "cb-user");
        }

        #[tokio::test]
        async fn test_one_result_per_target() {
            let executor = Arc::new(FakeExecutor::default());
            let d = dispatcher(graph(), FleetSettings::default(), executor);
            let results = d
                .dispatch(&batch(None, None, &["uptime"]), &CancellationToken::new())
                .await
                .unwrap();

            let mut ids: Vec<_> = results.iter().map(|r| r.vm_id.clone()).collect();
            ids.sort();
            assert_eq!(ids, vec!["bastion1", "vm1", "vm2"]);
        }

        #[tokio::test]
        async fn test_command_failure_stays_in_its_result() {
            let executor = Arc::new(FakeExecutor {
                fail_command_on: Some("10.0.1.4".to_string()),
                ..Default::default()
            });
            let d = dispatcher(graph(), FleetSettings::default(), executor);
            let results = d
                .dispatch(
                    &batch(None, Some("vm1"), &["false", "echo never"]),
                    &CancellationToken::new(),
                )
                .await
                .unwrap();

            assert_eq!(results.len(), 1);
            assert!(matches!(
                results[0].error,
                Some(FleetError::CommandExecution { index: 0, .. })
            ));
            assert_eq!(results[0].stdout.len(), 1);
        }

        #[tokio::test]
        async fn test_panicking_unit_still_yields_result() {
            let executor = Arc::new(FakeExecutor {
                panic_on: Some("10.0.1.2".to_string()),
                ..Default::default()
            });
            let d = dispatcher(graph(), FleetSettings::default(), executor);
            let results = d
                .dispatch(&batch(None, None, &["uptime"]), &CancellationToken::new())
                .await
                .unwrap();

            assert_eq!(results.len(), 3);
            let results = by_vm(results);
            assert!(matches!(
                results["bastion1"].error,
                Some(FleetError::UnitAborted(_))
            ));
            assert!(results["vm1"].is_success());
        }

        #[tokio::test]
        async fn test_unknown_vm_id_reports_not_found_in_result() {
            let executor = Arc::new(FakeExecutor::default());
            let d = dispatcher(graph(), FleetSettings::default(), executor);
            let results = d
                .dispatch(&batch(None, Some("ghost"), &["uptime"]), &CancellationToken::new())
                .await
                .unwrap();

            assert_eq!(results.len(), 1);
            assert_eq!(results[0].vm_id, "ghost");
            assert!(results[0].error.as_ref().is_some_and(FleetError::is_not_found));
            assert!(results[0].vm_ip.is_empty());
        }
    }

    mod credentials {
        use super::*;

        #[tokio::test]
        async fn test_requested_username_used_on_both_hops_and_recorded() {
            let graph = graph();
            let executor = Arc::new(FakeExecutor::default());
            let d = dispatcher(graph.clone(), FleetSettings::default(), executor.clone());

            let mut b = batch(None, Some("vm1"), &["id"]);
            b.username = Some("ubuntu".to_string());
            let results = d.dispatch(&b, &CancellationToken::new()).await.unwrap();
            assert!(results[0].is_success());

            let runs = executor.runs.lock().unwrap();
            assert_eq!(runs[0].0.username, "ubuntu");
            assert_eq!(runs[0].1.username, "ubuntu");
            assert_eq!(
                graph.get_ssh_key("key1").await.unwrap().verified_username,
                "ubuntu"
            );
        }

        #[tokio::test]
        async fn test_write_back_can_be_disabled() {
            let graph = graph();
            let settings = FleetSettings {
                verified_write_back: false,
                ..Default::default()
            };
            let d = dispatcher(graph.clone(), settings, Arc::new(FakeExecutor::default()));

            let mut b = batch(None, Some("vm1"), &["id"]);
            b.username = Some("ubuntu".to_string());
            d.dispatch(&b, &CancellationToken::new()).await.unwrap();

            assert!(
                graph
                    .get_ssh_key("key1")
                    .await
                    .unwrap()
                    .verified_username
                    .is_empty()
            );
        }
    }

    mod concurrency {
        use super::*;

        fn wide_graph(n: usize) -> Arc<MemoryGraph> {
            let graph = graph();
            for i in 0..n {
                graph.insert_vm(
                    "f",
                    vm(
                        &format!("node{}", i),
                        Some("wide"),
                        "subnet1",
                        &format!("10.0.1.{}", 100 + i),
                        "",
                    ),
                );
            }
            graph
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
        async fn test_cap_limits_simultaneous_sessions() {
            let executor = Arc::new(FakeExecutor {
                delay: Some(Duration::from_millis(30)),
                ..Default::default()
            });
            let settings = FleetSettings {
                max_concurrency: Some(2),
                ..Default::default()
            };
            let d = dispatcher(wide_graph(6), settings, executor.clone());

            let results = d
                .dispatch(&batch(Some("wide"), None, &["uptime"]), &CancellationToken::new())
                .await
                .unwrap();

            assert_eq!(results.len(), 6);
            assert!(results.iter().all(CommandResult::is_success));
            assert!(executor.peak.load(Ordering::SeqCst) <= 2);
        }

        #[tokio::test]
        async fn test_cancelled_dispatch_marks_every_unit() {
            let cancel = CancellationToken::new();
            cancel.cancel();

            let d = dispatcher(
                graph(),
                FleetSettings::default(),
                Arc::new(FakeExecutor::default()),
            );
            let results = d
                .dispatch(&batch(Some("workers"), None, &["uptime"]), &cancel)
                .await
                .unwrap();

            let results = by_vm(results);
            assert_eq!(results["vm1"].error, Some(FleetError::Cancelled));
            // vm2 fails earlier, on its missing bastion
            assert!(results["vm2"].error.is_some());
        }

        #[tokio::test]
        async fn test_cancel_while_waiting_for_permit() {
            let cancel = CancellationToken::new();
            cancel.cancel();

            let settings = FleetSettings {
                max_concurrency: Some(1),
                ..Default::default()
            };
            let d = dispatcher(wide_graph(3), settings, Arc::new(FakeExecutor::default()));
            let results = d
                .dispatch(&batch(Some("wide"), None, &["uptime"]), &cancel)
                .await
                .unwrap();

            assert_eq!(results.len(), 3);
            assert!(
                results
                    .iter()
                    .all(|r| r.error == Some(FleetError::Cancelled))
            );
        }
    }
}
