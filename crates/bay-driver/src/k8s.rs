//! Kubernetes driver built on kube.
//!
//! Bay is the only external gateway; runtime pods are reached by pod IP
//! directly (`http://<pod_ip>:<runtime_port>`), no Service or Ingress per
//! pod. Cargo volumes are PersistentVolumeClaims. Multi-container sessions
//! map to one pod per container spec; session networks are no-ops because
//! pods already share the cluster network.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, LocalObjectReference, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, Pod, PodSpec,
    ResourceRequirements, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, LogParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::driver::{
    CargoHandle, ContainerInfo, ContainerStatus, Driver, MultiContainerInfo, RuntimeInstance,
    SessionHandle, WORKSPACE_MOUNT_PATH,
};
use crate::error::{DriverError, DriverResult};
use crate::labels::{self, LabelMap};
use crate::profile::{ContainerSpec, Profile};

const DRIVER_KIND: &str = "k8s";

/// Normalizes a size string for Kubernetes binary units
/// (`"1g"` -> `"1Gi"`, `"512m"` -> `"512Mi"`).
pub fn normalize_quantity(size: &str) -> String {
    let trimmed = size.trim();
    if trimmed.ends_with("Ki")
        || trimmed.ends_with("Mi")
        || trimmed.ends_with("Gi")
        || trimmed.ends_with("Ti")
    {
        return trimmed.to_string();
    }
    let lower = trimmed.to_ascii_lowercase();
    if let Some(num) = lower.strip_suffix('g') {
        return format!("{}Gi", num);
    }
    if let Some(num) = lower.strip_suffix('m') {
        return format!("{}Mi", num);
    }
    if let Some(num) = lower.strip_suffix('k') {
        return format!("{}Ki", num);
    }
    trimmed.to_string()
}

/// Halves a normalized quantity, used for memory requests (requests =
/// limits / 2 so dev clusters can overcommit).
pub fn half_quantity(normalized: &str) -> String {
    const KI: u64 = 1 << 10;
    const MI: u64 = 1 << 20;
    const GI: u64 = 1 << 30;

    let units: [(&str, u64); 4] = [("Ti", 1 << 40), ("Gi", GI), ("Mi", MI), ("Ki", KI)];
    for (suffix, mult) in units {
        if let Some(num) = normalized.strip_suffix(suffix) {
            if let Ok(value) = num.trim().parse::<u64>() {
                let bytes = (value * mult / 2).max(KI);
                return if bytes % GI == 0 {
                    format!("{}Gi", bytes / GI)
                } else if bytes % MI == 0 {
                    format!("{}Mi", bytes / MI)
                } else {
                    format!("{}Ki", bytes / KI)
                };
            }
        }
    }
    normalized.to_string()
}

/// Kubernetes driver configuration (see spec for the matching config keys).
#[derive(Debug, Clone)]
pub struct K8sConfig {
    pub namespace: String,
    pub kubeconfig: Option<String>,
    pub storage_class: Option<String>,
    pub default_storage_size: String,
    pub image_pull_secrets: Vec<String>,
    pub pod_startup_timeout: u64,
    pub label_prefix: String,
    pub instance_id: String,
}

impl Default for K8sConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            kubeconfig: None,
            storage_class: None,
            default_storage_size: "1Gi".to_string(),
            image_pull_secrets: Vec::new(),
            pod_startup_timeout: 120,
            label_prefix: labels::DEFAULT_PREFIX.to_string(),
            instance_id: "bay".to_string(),
        }
    }
}

pub struct K8sDriver {
    cfg: K8sConfig,
    client: OnceCell<Client>,
}

fn map_err(err: kube::Error, resource: &str) -> DriverError {
    match err {
        kube::Error::Api(response) if response.code == 404 => DriverError::NotFound {
            driver: DRIVER_KIND,
            resource: resource.to_string(),
        },
        kube::Error::Api(response) => DriverError::Platform {
            driver: DRIVER_KIND,
            status: Some(response.code),
            message: response.message,
        },
        other => DriverError::Platform {
            driver: DRIVER_KIND,
            status: None,
            message: other.to_string(),
        },
    }
}

fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 409)
}

impl K8sDriver {
    pub fn new(cfg: K8sConfig) -> Self {
        Self {
            cfg,
            client: OnceCell::new(),
        }
    }

    /// Lazily loads the kube configuration: an explicit kubeconfig path if
    /// configured, else the in-cluster service account.
    async fn client(&self) -> DriverResult<&Client> {
        self.client
            .get_or_try_init(|| async {
                let config = match &self.cfg.kubeconfig {
                    Some(path) => {
                        let kubeconfig =
                            Kubeconfig::read_from(path).map_err(|err| DriverError::Platform {
                                driver: DRIVER_KIND,
                                status: None,
                                message: format!("failed to read kubeconfig {path}: {err}"),
                            })?;
                        Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                            .await
                            .map_err(|err| DriverError::Platform {
                                driver: DRIVER_KIND,
                                status: None,
                                message: format!("failed to load kubeconfig: {err}"),
                            })?
                    }
                    None => Config::incluster().map_err(|err| DriverError::Platform {
                        driver: DRIVER_KIND,
                        status: None,
                        message: format!("failed to load in-cluster config: {err}"),
                    })?,
                };
                Client::try_from(config).map_err(|err| DriverError::Platform {
                    driver: DRIVER_KIND,
                    status: None,
                    message: format!("failed to build kube client: {err}"),
                })
            })
            .await
    }

    async fn pods(&self) -> DriverResult<Api<Pod>> {
        Ok(Api::namespaced(
            self.client().await?.clone(),
            &self.cfg.namespace,
        ))
    }

    async fn pvcs(&self) -> DriverResult<Api<PersistentVolumeClaim>> {
        Ok(Api::namespaced(
            self.client().await?.clone(),
            &self.cfg.namespace,
        ))
    }

    fn label(&self, name: &str) -> String {
        labels::key(&self.cfg.label_prefix, name)
    }

    fn base_labels(
        &self,
        session: &SessionHandle,
        cargo: &CargoHandle,
        runtime_port: u16,
        extra: &LabelMap,
    ) -> BTreeMap<String, String> {
        let mut out = BTreeMap::from([
            (self.label(labels::OWNER), session.owner.clone()),
            (self.label(labels::SANDBOX_ID), session.sandbox_id.clone()),
            (self.label(labels::SESSION_ID), session.id.clone()),
            (self.label(labels::CARGO_ID), cargo.id.clone()),
            (self.label(labels::PROFILE_ID), session.profile_id.clone()),
            (self.label(labels::RUNTIME_PORT), runtime_port.to_string()),
            (self.label(labels::INSTANCE_ID), self.cfg.instance_id.clone()),
            (self.label(labels::MANAGED), labels::MANAGED_TRUE.to_string()),
        ]);
        for (k, v) in extra {
            out.insert(self.label(k), v.clone());
        }
        out
    }

    /// Strips the configured prefix, returning the canonical label map the
    /// kernel operates on.
    fn bare_labels(&self, raw: Option<BTreeMap<String, String>>) -> LabelMap {
        let prefix = format!("{}.", self.cfg.label_prefix);
        raw.unwrap_or_default()
            .into_iter()
            .filter_map(|(k, v)| k.strip_prefix(&prefix).map(|bare| (bare.to_string(), v)))
            .collect()
    }

    fn build_env(session: &SessionHandle, spec: &ContainerSpec, multi: bool) -> Vec<EnvVar> {
        let mut env: Vec<EnvVar> = spec
            .env
            .iter()
            .map(|(name, value)| EnvVar {
                name: name.clone(),
                value: Some(value.clone()),
                ..Default::default()
            })
            .collect();
        env.push(EnvVar {
            name: "BAY_SESSION_ID".to_string(),
            value: Some(session.id.clone()),
            ..Default::default()
        });
        env.push(EnvVar {
            name: "BAY_SANDBOX_ID".to_string(),
            value: Some(session.sandbox_id.clone()),
            ..Default::default()
        });
        env.push(EnvVar {
            name: "BAY_WORKSPACE_PATH".to_string(),
            value: Some(WORKSPACE_MOUNT_PATH.to_string()),
            ..Default::default()
        });
        if multi {
            env.push(EnvVar {
                name: "BAY_CONTAINER_NAME".to_string(),
                value: Some(spec.name.clone()),
                ..Default::default()
            });
        }
        env
    }

    fn build_pod(
        &self,
        pod_name: &str,
        container_name: &str,
        spec: &ContainerSpec,
        session: &SessionHandle,
        cargo: &CargoHandle,
        pod_labels: BTreeMap<String, String>,
        multi: bool,
    ) -> Pod {
        let memory = normalize_quantity(&spec.resources.memory);
        // Memory requests at half the limit, CPU at the full limit, so dev
        // clusters can overcommit memory.
        let resources = ResourceRequirements {
            limits: Some(BTreeMap::from([
                ("cpu".to_string(), Quantity(spec.resources.cpus.to_string())),
                ("memory".to_string(), Quantity(memory.clone())),
            ])),
            requests: Some(BTreeMap::from([
                ("cpu".to_string(), Quantity(spec.resources.cpus.to_string())),
                ("memory".to_string(), Quantity(half_quantity(&memory))),
            ])),
            ..Default::default()
        };

        let container = Container {
            name: container_name.to_string(),
            image: Some(spec.image.clone()),
            // Local images must work on kind/docker-desktop clusters.
            image_pull_policy: Some("IfNotPresent".to_string()),
            ports: Some(vec![ContainerPort {
                container_port: spec.runtime_port as i32,
                ..Default::default()
            }]),
            env: Some(Self::build_env(session, spec, multi)),
            volume_mounts: Some(vec![VolumeMount {
                name: "workspace".to_string(),
                mount_path: WORKSPACE_MOUNT_PATH.to_string(),
                ..Default::default()
            }]),
            resources: Some(resources),
            ..Default::default()
        };

        let image_pull_secrets = (!self.cfg.image_pull_secrets.is_empty()).then(|| {
            self.cfg
                .image_pull_secrets
                .iter()
                .map(|secret| LocalObjectReference {
                    name: Some(secret.clone()),
                })
                .collect()
        });

        Pod {
            metadata: ObjectMeta {
                name: Some(pod_name.to_string()),
                namespace: Some(self.cfg.namespace.clone()),
                labels: Some(pod_labels),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![container],
                volumes: Some(vec![Volume {
                    name: "workspace".to_string(),
                    persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                        claim_name: cargo.driver_ref.clone(),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                image_pull_secrets,
                // Crashed pods are rebuilt by ensure_running, not restarted.
                restart_policy: Some("Never".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Polls until the pod is Running with an IP, once per second up to the
    /// configured startup timeout. `Failed`/`Succeeded` is terminal.
    async fn wait_for_pod_running(&self, pod_name: &str, runtime_port: u16) -> DriverResult<String> {
        let pods = self.pods().await?;

        for attempt in 0..self.cfg.pod_startup_timeout {
            let pod = match pods.get(pod_name).await {
                Ok(pod) => pod,
                Err(err) => {
                    return match map_err(err, pod_name) {
                        DriverError::NotFound { .. } => Err(DriverError::Startup {
                            driver: DRIVER_KIND,
                            message: format!("pod {pod_name} not found"),
                        }),
                        other => Err(other),
                    }
                }
            };

            let phase = pod
                .status
                .as_ref()
                .and_then(|s| s.phase.clone())
                .unwrap_or_default();
            let pod_ip = pod.status.as_ref().and_then(|s| s.pod_ip.clone());

            if phase == "Running" {
                if let Some(ip) = pod_ip {
                    let endpoint = format!("http://{ip}:{runtime_port}");
                    info!(pod_name = %pod_name, endpoint = %endpoint, "k8s pod ready");
                    return Ok(endpoint);
                }
            }

            if phase == "Failed" || phase == "Succeeded" {
                return Err(DriverError::Startup {
                    driver: DRIVER_KIND,
                    message: format!("pod {pod_name} terminated with phase {phase}"),
                });
            }

            debug!(pod_name = %pod_name, phase = %phase, attempt = attempt + 1, "k8s pod not ready yet");
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        }

        Err(DriverError::Startup {
            driver: DRIVER_KIND,
            message: format!(
                "pod {pod_name} failed to start within {}s",
                self.cfg.pod_startup_timeout
            ),
        })
    }

    async fn delete_pod(&self, pod_name: &str, grace_period_seconds: u32) -> DriverResult<()> {
        let pods = self.pods().await?;
        match pods
            .delete(
                pod_name,
                &DeleteParams {
                    grace_period_seconds: Some(grace_period_seconds),
                    ..Default::default()
                },
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(err) => match map_err(err, pod_name) {
                DriverError::NotFound { .. } => {
                    warn!(pod_name = %pod_name, "k8s delete: pod not found");
                    Ok(())
                }
                other => Err(other),
            },
        }
    }
}

#[async_trait]
impl Driver for K8sDriver {
    async fn create(
        &self,
        session: &SessionHandle,
        profile: &Profile,
        cargo: &CargoHandle,
        labels: &LabelMap,
    ) -> DriverResult<String> {
        let primary = profile
            .get_primary_container()
            .ok_or_else(|| DriverError::Platform {
                driver: DRIVER_KIND,
                status: None,
                message: format!("profile {} has no containers defined", profile.id),
            })?;

        let pod_name = format!("bay-session-{}", session.id);
        let pod_labels = self.base_labels(session, cargo, primary.runtime_port, labels);
        let pod = self.build_pod(&pod_name, "ship", &primary, session, cargo, pod_labels, false);

        info!(
            pod_name = %pod_name,
            session_id = %session.id,
            image = %primary.image,
            cargo = %cargo.driver_ref,
            runtime_port = primary.runtime_port,
            "k8s create"
        );

        let pods = self.pods().await?;
        match pods.create(&PostParams::default(), &pod).await {
            Ok(_) => {}
            Err(err) if is_conflict(&err) => {
                warn!(pod_name = %pod_name, "k8s create: pod already exists");
            }
            Err(err) => return Err(map_err(err, &pod_name)),
        }

        Ok(pod_name)
    }

    async fn start(&self, container_id: &str, runtime_port: u16) -> DriverResult<String> {
        // Pods start on creation; start just waits for Running + IP.
        info!(
            pod_name = %container_id,
            runtime_port,
            timeout = self.cfg.pod_startup_timeout,
            "k8s start"
        );
        self.wait_for_pod_running(container_id, runtime_port).await
    }

    async fn stop(&self, container_id: &str) -> DriverResult<()> {
        // No stop/pause concept for pods: stop = delete with grace.
        info!(pod_name = %container_id, "k8s stop");
        self.delete_pod(container_id, 10).await
    }

    async fn destroy(&self, container_id: &str) -> DriverResult<()> {
        info!(pod_name = %container_id, "k8s destroy");
        self.delete_pod(container_id, 10).await
    }

    async fn status(
        &self,
        container_id: &str,
        runtime_port: Option<u16>,
    ) -> DriverResult<ContainerInfo> {
        let pods = self.pods().await?;
        let pod = match pods.get(container_id).await {
            Ok(pod) => pod,
            Err(err) => {
                return match map_err(err, container_id) {
                    DriverError::NotFound { .. } => Ok(ContainerInfo {
                        container_id: container_id.to_string(),
                        status: ContainerStatus::NotFound,
                        endpoint: None,
                        exit_code: None,
                    }),
                    other => Err(other),
                }
            }
        };

        let phase = pod
            .status
            .as_ref()
            .and_then(|s| s.phase.clone())
            .unwrap_or_default();
        let status = match phase.as_str() {
            "Running" => ContainerStatus::Running,
            "Pending" => ContainerStatus::Created,
            "Succeeded" | "Failed" => ContainerStatus::Exited,
            _ => ContainerStatus::Exited,
        };

        let endpoint = match (status, runtime_port) {
            (ContainerStatus::Running, Some(port)) => pod
                .status
                .as_ref()
                .and_then(|s| s.pod_ip.as_ref())
                .map(|ip| format!("http://{ip}:{port}")),
            _ => None,
        };

        let exit_code = pod
            .status
            .as_ref()
            .and_then(|s| s.container_statuses.as_ref())
            .and_then(|statuses| statuses.first())
            .and_then(|cs| cs.state.as_ref())
            .and_then(|state| state.terminated.as_ref())
            .map(|terminated| terminated.exit_code as i64);

        Ok(ContainerInfo {
            container_id: container_id.to_string(),
            status,
            endpoint,
            exit_code,
        })
    }

    async fn logs(&self, container_id: &str, tail: u32) -> DriverResult<String> {
        let pods = self.pods().await?;
        match pods
            .logs(
                container_id,
                &LogParams {
                    tail_lines: Some(tail as i64),
                    ..Default::default()
                },
            )
            .await
        {
            Ok(logs) => Ok(logs),
            Err(err) => match map_err(err, container_id) {
                DriverError::NotFound { .. } => Ok(String::new()),
                other => Err(other),
            },
        }
    }

    async fn create_volume(&self, name: &str, labels: &LabelMap) -> DriverResult<String> {
        let mut pvc_labels = BTreeMap::from([(
            self.label(crate::labels::MANAGED),
            crate::labels::MANAGED_TRUE.to_string(),
        )]);
        for (k, v) in labels {
            pvc_labels.insert(self.label(k), v.clone());
        }

        let storage_size = normalize_quantity(&self.cfg.default_storage_size);
        let pvc = PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(self.cfg.namespace.clone()),
                labels: Some(pvc_labels),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                resources: Some(ResourceRequirements {
                    requests: Some(BTreeMap::from([(
                        "storage".to_string(),
                        Quantity(storage_size.clone()),
                    )])),
                    ..Default::default()
                }),
                storage_class_name: self.cfg.storage_class.clone(),
                ..Default::default()
            }),
            ..Default::default()
        };

        info!(
            name = %name,
            storage_size = %storage_size,
            storage_class = ?self.cfg.storage_class,
            "k8s create volume"
        );

        let pvcs = self.pvcs().await?;
        match pvcs.create(&PostParams::default(), &pvc).await {
            Ok(_) => {}
            Err(err) if is_conflict(&err) => {
                warn!(name = %name, "k8s create volume: already exists");
            }
            Err(err) => return Err(map_err(err, name)),
        }

        Ok(name.to_string())
    }

    async fn delete_volume(&self, name: &str) -> DriverResult<()> {
        info!(name = %name, "k8s delete volume");
        let pvcs = self.pvcs().await?;
        match pvcs.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(err) => match map_err(err, name) {
                DriverError::NotFound { .. } => {
                    warn!(name = %name, "k8s delete volume: not found");
                    Ok(())
                }
                other => Err(other),
            },
        }
    }

    async fn volume_exists(&self, name: &str) -> DriverResult<bool> {
        let pvcs = self.pvcs().await?;
        match pvcs.get(name).await {
            Ok(_) => Ok(true),
            Err(err) => match map_err(err, name) {
                DriverError::NotFound { .. } => Ok(false),
                other => Err(other),
            },
        }
    }

    async fn list_runtime_instances(
        &self,
        labels: &LabelMap,
    ) -> DriverResult<Vec<RuntimeInstance>> {
        let selector = labels
            .iter()
            .map(|(k, v)| format!("{}={}", self.label(k), v))
            .collect::<Vec<_>>()
            .join(",");
        debug!(label_selector = %selector, "k8s list runtime instances");

        let pods = self.pods().await?;
        let pod_list = match pods.list(&ListParams::default().labels(&selector)).await {
            Ok(list) => list,
            Err(err) => {
                warn!(error = %map_err(err, "pods"), "k8s list runtime instances failed");
                return Ok(Vec::new());
            }
        };

        let instances: Vec<RuntimeInstance> = pod_list
            .items
            .into_iter()
            .map(|pod| {
                let name = pod.metadata.name.clone().unwrap_or_default();
                let state = pod
                    .status
                    .as_ref()
                    .and_then(|s| s.phase.as_ref())
                    .map(|p| p.to_lowercase())
                    .unwrap_or_else(|| "unknown".to_string());
                RuntimeInstance {
                    id: name.clone(),
                    labels: self.bare_labels(pod.metadata.labels),
                    state,
                    created_at: pod
                        .metadata
                        .creation_timestamp
                        .as_ref()
                        .map(|ts| ts.0.to_rfc3339()),
                    name,
                }
            })
            .collect();

        debug!(count = instances.len(), "k8s list runtime instances done");
        Ok(instances)
    }

    async fn destroy_runtime_instance(&self, instance_id: &str) -> DriverResult<()> {
        info!(pod_name = %instance_id, "k8s destroy runtime instance");
        // Force delete: zero grace period.
        self.delete_pod(instance_id, 0).await
    }

    async fn create_session_network(&self, session_id: &str) -> DriverResult<String> {
        // Pods share the cluster network; nothing to create.
        debug!(session_id = %session_id, "k8s session network is a no-op");
        Ok(format!("bay-net-{session_id}"))
    }

    async fn remove_session_network(&self, session_id: &str) -> DriverResult<()> {
        debug!(session_id = %session_id, "k8s session network removal is a no-op");
        Ok(())
    }

    async fn create_multi(
        &self,
        session: &SessionHandle,
        profile: &Profile,
        cargo: &CargoHandle,
        _network_name: &str,
        labels: &LabelMap,
    ) -> DriverResult<Vec<MultiContainerInfo>> {
        let specs = profile.get_containers();
        info!(
            session_id = %session.id,
            container_count = specs.len(),
            "k8s create multi"
        );

        let pods = self.pods().await?;
        let mut results: Vec<MultiContainerInfo> = Vec::with_capacity(specs.len());

        for spec in &specs {
            let pod_name = format!("bay-{}-{}", session.id, spec.name);
            let mut pod_labels = self.base_labels(session, cargo, spec.runtime_port, labels);
            pod_labels.insert(self.label(crate::labels::CONTAINER_NAME), spec.name.clone());
            pod_labels.insert(
                self.label(crate::labels::RUNTIME_TYPE),
                spec.runtime_type.clone(),
            );

            let pod = self.build_pod(&pod_name, &spec.name, spec, session, cargo, pod_labels, true);

            match pods.create(&PostParams::default(), &pod).await {
                Ok(_) => results.push(MultiContainerInfo {
                    name: spec.name.clone(),
                    container_id: pod_name,
                    runtime_type: spec.runtime_type.clone(),
                    runtime_port: spec.runtime_port,
                    capabilities: spec.capabilities.clone(),
                    endpoint: None,
                    status: ContainerStatus::Created,
                }),
                Err(err) => {
                    let err = map_err(err, &pod_name);
                    warn!(
                        session_id = %session.id,
                        pod_name = %pod_name,
                        error = %err,
                        "k8s create multi failed, rolling back"
                    );
                    for created in &results {
                        if let Err(cleanup_err) = self.destroy(&created.container_id).await {
                            warn!(
                                pod_name = %created.container_id,
                                error = %cleanup_err,
                                "k8s create multi rollback failed"
                            );
                        }
                    }
                    return Err(err);
                }
            }
        }

        Ok(results)
    }

    async fn start_multi(
        &self,
        containers: Vec<MultiContainerInfo>,
    ) -> DriverResult<Vec<MultiContainerInfo>> {
        info!(
            container_names = ?containers.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
            "k8s start multi"
        );

        let results = futures::future::join_all(containers.iter().map(|info| async move {
            let endpoint = self
                .wait_for_pod_running(&info.container_id, info.runtime_port)
                .await?;
            let mut started = info.clone();
            started.endpoint = Some(endpoint);
            started.status = ContainerStatus::Running;
            Ok::<_, DriverError>(started)
        }))
        .await;

        let mut started = Vec::new();
        let mut first_error = None;
        for result in results {
            match result {
                Ok(info) => started.push(info),
                Err(err) => {
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }

        if let Some(err) = first_error {
            warn!(error = %err, "k8s start multi partial failure, rolling back");
            for info in &started {
                if let Err(cleanup_err) = self.destroy(&info.container_id).await {
                    warn!(
                        pod_name = %info.container_id,
                        error = %cleanup_err,
                        "k8s start multi rollback failed"
                    );
                }
            }
            return Err(err);
        }

        Ok(started)
    }

    async fn stop_multi(&self, containers: &[MultiContainerInfo]) -> DriverResult<()> {
        for info in containers {
            if let Err(err) = self.stop(&info.container_id).await {
                warn!(
                    container_name = %info.name,
                    pod_name = %info.container_id,
                    error = %err,
                    "k8s stop multi pod failed"
                );
            }
        }
        Ok(())
    }

    async fn destroy_multi(&self, containers: &[MultiContainerInfo]) -> DriverResult<()> {
        for info in containers {
            if let Err(err) = self.destroy(&info.container_id).await {
                warn!(
                    container_name = %info.name,
                    pod_name = %info.container_id,
                    error = %err,
                    "k8s destroy multi pod failed"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantities_normalize_to_binary_units() {
        assert_eq!(normalize_quantity("1g"), "1Gi");
        assert_eq!(normalize_quantity("512m"), "512Mi");
        assert_eq!(normalize_quantity("64k"), "64Ki");
        assert_eq!(normalize_quantity("2Gi"), "2Gi");
        assert_eq!(normalize_quantity("100"), "100");
    }

    #[test]
    fn half_quantity_steps_down_units() {
        assert_eq!(half_quantity("1Gi"), "512Mi");
        assert_eq!(half_quantity("512Mi"), "256Mi");
        assert_eq!(half_quantity("2Gi"), "1Gi");
        assert_eq!(half_quantity("1Ki"), "1Ki");
        assert_eq!(half_quantity("weird"), "weird");
    }

    #[test]
    fn bare_labels_strip_the_configured_prefix() {
        let driver = K8sDriver::new(K8sConfig {
            label_prefix: "bay".to_string(),
            ..Default::default()
        });

        let raw = BTreeMap::from([
            ("bay.session_id".to_string(), "sess-1".to_string()),
            ("bay.managed".to_string(), "true".to_string()),
            ("unrelated".to_string(), "x".to_string()),
        ]);
        let bare = driver.bare_labels(Some(raw));
        assert_eq!(bare.get("session_id").map(String::as_str), Some("sess-1"));
        assert_eq!(bare.get("managed").map(String::as_str), Some("true"));
        assert!(!bare.contains_key("unrelated"));
    }
}
