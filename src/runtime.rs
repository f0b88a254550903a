//! Lifecycle orchestrator: the public `Create`/`Start`/`Stop`/`Delete`/
//! `List`/`State`/`Logs` surface.
//!
//! Wires together the allocator, rootfs builder, network plumber,
//! Firecracker supervisor, and instance registry. Reference: `spec.md`
//! §4.A.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::allocator::{allocate_ipv6, tap_name, IpUniqueness};
use crate::config::Config;
use crate::error::RuntimeError;
use crate::firecracker::VmConfigParams;
use crate::image::ImageSource;
use crate::network::{ensure_bridge, ensure_tap, TapConfig};
use crate::registry::Registry;
use crate::rootfs::{RootfsBuilder, RootfsRequest};
use crate::types::{Client, Instance, InstanceSpec, InstanceState, NetworkInfo, Resources};

use crate::backend::VmmBackend;

/// Bookkeeping that is observable via `GetState`/`ListInstances` but isn't
/// part of the `Client` the registry guards (`spec.md` §3: `Instance` and
/// `Client` are distinct views over the same instance).
struct InstanceMeta {
    state: InstanceState,
    image_tag: String,
    resources: Resources,
    env_vars: BTreeMap<String, String>,
    created_at: chrono::DateTime<Utc>,
    started_at: Option<chrono::DateTime<Utc>>,
    ipv6_address: Option<String>,
    default_port: u16,
}

/// The node-local microVM runtime.
pub struct Runtime {
    config: Config,
    registry: Registry,
    backend: Arc<dyn VmmBackend>,
    rootfs_builder: RootfsBuilder,
    meta: RwLock<HashMap<String, InstanceMeta>>,
}

impl Runtime {
    pub fn new(config: Config, backend: Arc<dyn VmmBackend>, image_source: Arc<dyn ImageSource>) -> Self {
        let rootfs_builder = RootfsBuilder::new(config.base_rootfs_path.clone(), image_source);
        Self {
            config,
            registry: Registry::new(),
            backend,
            rootfs_builder,
            meta: RwLock::new(HashMap::new()),
        }
    }

    /// `Create(spec)`: assemble rootfs, network, and config artifacts and
    /// register the instance at state `Pending`. Does not start the VMM.
    pub async fn create(&self, spec: InstanceSpec) -> Result<Instance, RuntimeError> {
        self.create_cancellable(spec, CancellationToken::new()).await
    }

    /// `Create(spec)`, cancellable. Cancellation deletes partial artifacts
    /// the same way a failure does (`spec.md` §5 "Cancellation during
    /// Create deletes partial artifacts.").
    pub async fn create_cancellable(
        &self,
        spec: InstanceSpec,
        cancel: CancellationToken,
    ) -> Result<Instance, RuntimeError> {
        if self.registry.contains(&spec.id).await {
            return Err(RuntimeError::ResourceBusy(spec.id));
        }

        let created_at = Utc::now();
        self.insert_meta_creating(&spec, created_at).await;

        let result = tokio::select! {
            r = self.create_inner(&spec) => r,
            () = cancel.cancelled() => Err(RuntimeError::Cancelled),
        };

        match result {
            Ok(instance) => Ok(instance),
            Err(e) => {
                // Roll back: Create must not leak artifacts on failure
                // (`spec.md` §7 "Propagation policy").
                self.meta.write().await.remove(&spec.id);
                self.registry.remove(&spec.id).await;
                let _ = ensure_tap_cleanup(&spec.id);
                let client = Client::new(&self.config.base_dir, &spec.id, tap_name(&spec.id));
                let _ = std::fs::remove_dir_all(client.instance_dir());
                Err(e)
            }
        }
    }

    async fn create_inner(&self, spec: &InstanceSpec) -> Result<Instance, RuntimeError> {
        ensure_bridge(&self.config.bridge_name)?;

        let oracle = RegistryOracle { meta: &self.meta };
        let ipv6_address = allocate_ipv6(&spec.id, &oracle).await;

        let tap_config = TapConfig::new(&spec.id, &self.config.bridge_name);
        let tap_device = ensure_tap(&tap_config)?;

        let client = Client::new(&self.config.base_dir, &spec.id, tap_device.name().to_string());
        std::fs::create_dir_all(client.instance_dir())?;
        std::fs::create_dir_all(&client.logs_dir)?;

        let request = RootfsRequest {
            instance_id: &spec.id,
            image_tag: &spec.image_tag,
            environment: &spec.environment,
            default_port: Some(spec.network_config.default_port),
            ipv6_address: &ipv6_address,
        };
        self.rootfs_builder.build(&request, &client.rootfs_path).await?;

        // The registry owns the TAP from here by name; deletion is
        // name-addressed rather than tied to this handle's lifetime.
        let _ = tap_device.into_name();

        self.registry.insert(client).await;

        self.update_meta_state(&spec.id, InstanceState::Pending, |m| {
            m.ipv6_address = Some(ipv6_address.clone());
        })
        .await;

        self.get_state(&spec.id).await
    }

    /// `Start(inst)`: spawn the Firecracker process and wait for the API
    /// socket.
    pub async fn start(&self, instance_id: &str) -> Result<Instance, RuntimeError> {
        self.start_cancellable(instance_id, CancellationToken::new()).await
    }

    /// `Start(inst)`, cancellable. Cancellation aborts the socket-wait loop,
    /// kills any spawned process, and reverts state to `Failed`
    /// (`spec.md` §5).
    pub async fn start_cancellable(
        &self,
        instance_id: &str,
        cancel: CancellationToken,
    ) -> Result<Instance, RuntimeError> {
        let client = self
            .registry
            .get(instance_id)
            .await
            .ok_or_else(|| RuntimeError::ResourceNotFound(instance_id.to_string()))?;

        self.update_meta_state(instance_id, InstanceState::Starting, |_| {}).await;

        let meta_snapshot = {
            let meta = self.meta.read().await;
            meta.get(instance_id).map(|m| (m.resources, m.ipv6_address.clone()))
        };
        let Some((resources, _ipv6)) = meta_snapshot else {
            return Err(RuntimeError::ResourceNotFound(instance_id.to_string()));
        };

        let params = VmConfigParams {
            instance_id,
            vcpus: resources.vcpus,
            memory_mib: resources.memory_mib,
            kernel_path: &self.config.kernel_path,
            rootfs_path: &client.rootfs_path,
            tap_device: &client.tap_device,
            logs_dir: &client.logs_dir,
        };

        let spawn_result = self
            .backend
            .spawn(
                &params,
                &client.api_socket_path,
                &client.vm_config_path,
                &client.console_log_path,
                &cancel,
            )
            .await;

        match spawn_result {
            Ok(handle) => {
                self.registry
                    .update(instance_id, |c| c.pid = Some(handle.pid))
                    .await;
                self.update_meta_state(instance_id, InstanceState::Running, |m| {
                    m.started_at = Some(Utc::now());
                })
                .await;
                self.get_state(instance_id).await
            }
            Err(e) => {
                self.update_meta_state(instance_id, InstanceState::Failed, |_| {}).await;
                Err(e)
            }
        }
    }

    /// `Stop(inst)`: graceful shutdown, forced kill after the timeout.
    pub async fn stop(&self, instance_id: &str) -> Result<(), RuntimeError> {
        let client = self
            .registry
            .get(instance_id)
            .await
            .ok_or_else(|| RuntimeError::ResourceNotFound(instance_id.to_string()))?;

        self.update_meta_state(instance_id, InstanceState::Stopping, |_| {}).await;

        if let Some(pid) = client.pid {
            self.backend.stop(pid, &client.api_socket_path).await?;
        }

        self.registry.update(instance_id, |c| c.pid = None).await;
        self.update_meta_state(instance_id, InstanceState::Stopped, |_| {}).await;
        Ok(())
    }

    /// `Delete(inst)`: always stops first, then erases all artifacts.
    /// Idempotent — deleting an already-absent instance succeeds.
    pub async fn delete(&self, instance_id: &str) -> Result<(), RuntimeError> {
        let Some(client) = self.registry.get(instance_id).await else {
            return Ok(());
        };

        if client.pid.is_some() {
            if let Err(e) = self.stop(instance_id).await {
                warn!(instance_id, error = %e, "stop-before-delete failed, continuing teardown");
            }
        }

        let tap = tap_name(instance_id);
        if let Err(e) = delete_tap_by_name(&tap) {
            warn!(instance_id, tap = %tap, error = %e, "failed to delete TAP during instance deletion");
        }

        if let Err(e) = std::fs::remove_dir_all(client.instance_dir()) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(instance_id, error = %e, "failed to remove instance directory");
            }
        }
        let _ = std::fs::remove_file(&client.api_socket_path);

        self.registry.remove(instance_id).await;
        self.meta.write().await.remove(instance_id);

        info!(instance_id, "instance deleted");
        Ok(())
    }

    pub async fn get_state(&self, instance_id: &str) -> Result<Instance, RuntimeError> {
        let client = self
            .registry
            .get(instance_id)
            .await
            .ok_or_else(|| RuntimeError::ResourceNotFound(instance_id.to_string()))?;

        let reported_state = {
            let meta = self.meta.read().await;
            let m = meta
                .get(instance_id)
                .ok_or_else(|| RuntimeError::ResourceNotFound(instance_id.to_string()))?;

            // Invariant I4: `Running` requires the VMM process to actually
            // be alive, not just the last-recorded transition.
            if m.state == InstanceState::Running
                && !client.pid.map(|pid| self.backend.is_running(pid)).unwrap_or(false)
            {
                InstanceState::Failed
            } else {
                m.state
            }
        };

        if reported_state != self.meta.read().await.get(instance_id).map(|m| m.state).unwrap_or(reported_state) {
            self.update_meta_state(instance_id, reported_state, |_| {}).await;
        }

        let meta = self.meta.read().await;
        let m = meta
            .get(instance_id)
            .ok_or_else(|| RuntimeError::ResourceNotFound(instance_id.to_string()))?;

        Ok(Instance {
            id: instance_id.to_string(),
            runtime_id: instance_id.to_string(),
            state: reported_state,
            image_tag: m.image_tag.clone(),
            resources: m.resources,
            env_vars: m.env_vars.clone(),
            created_at: m.created_at,
            started_at: m.started_at,
            network_info: NetworkInfo {
                ipv6_address: m.ipv6_address.clone(),
                default_port: m.default_port,
            },
        })
    }

    pub async fn list_instances(&self) -> Vec<Instance> {
        let ids = self.registry.list_ids().await;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Ok(instance) = self.get_state(&id).await {
                out.push(instance);
            }
        }
        out
    }

    /// Used by the reconciler to diff against the desired set.
    pub async fn list_instance_ids(&self) -> HashSet<String> {
        self.registry.list_ids().await
    }

    /// `GetLogs(inst, n)`: last `n` console lines.
    pub async fn get_logs(&self, instance_id: &str, n: usize) -> Result<Vec<String>, RuntimeError> {
        let client = self
            .registry
            .get(instance_id)
            .await
            .ok_or_else(|| RuntimeError::ResourceNotFound(instance_id.to_string()))?;

        let contents = tokio::fs::read_to_string(&client.console_log_path)
            .await
            .unwrap_or_default();

        let lines: Vec<String> = contents.lines().map(str::to_string).collect();
        let start = lines.len().saturating_sub(n);
        Ok(lines[start..].to_vec())
    }

    /// `ExecuteCommand`: deliberately unsupported by this runtime
    /// (`spec.md` §4.A).
    pub async fn execute_command(&self, _instance_id: &str, _argv: &[String]) -> Result<(), RuntimeError> {
        Err(RuntimeError::NotSupported)
    }

    async fn insert_meta_creating(&self, spec: &InstanceSpec, created_at: chrono::DateTime<Utc>) {
        let env_vars: BTreeMap<String, String> = spec.environment.iter().cloned().collect();
        self.meta.write().await.insert(
            spec.id.clone(),
            InstanceMeta {
                state: InstanceState::Creating,
                image_tag: spec.image_tag.clone(),
                resources: spec.resources,
                env_vars,
                created_at,
                started_at: None,
                ipv6_address: None,
                default_port: spec.network_config.default_port,
            },
        );
    }

    async fn update_meta_state<F>(&self, instance_id: &str, state: InstanceState, f: F)
    where
        F: FnOnce(&mut InstanceMeta),
    {
        let mut meta = self.meta.write().await;
        if let Some(m) = meta.get_mut(instance_id) {
            m.state = state;
            f(m);
        }
    }
}

/// IPv6 uniqueness oracle backed by the currently-assigned addresses of
/// every known instance.
struct RegistryOracle<'a> {
    meta: &'a RwLock<HashMap<String, InstanceMeta>>,
}

#[async_trait]
impl IpUniqueness for RegistryOracle<'_> {
    async fn in_use(&self, addr: &str) -> bool {
        self.meta
            .read()
            .await
            .values()
            .any(|m| m.ipv6_address.as_deref() == Some(addr))
    }
}

fn ensure_tap_cleanup(instance_id: &str) -> Result<(), crate::network::TapError> {
    delete_tap_by_name(&tap_name(instance_id))
}

fn delete_tap_by_name(name: &str) -> Result<(), crate::network::TapError> {
    if !crate::network::tap_exists(name) {
        return Ok(());
    }
    std::process::Command::new("ip")
        .args(["link", "delete", name])
        .status()
        .map_err(crate::network::TapError::CommandFailed)
        .and_then(|status| {
            if status.success() {
                Ok(())
            } else {
                Err(crate::network::TapError::DeleteFailed(name.to_string()))
            }
        })
}
