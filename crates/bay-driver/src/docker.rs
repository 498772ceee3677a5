//! Docker driver built on bollard.
//!
//! Supports three connectivity modes between Bay and runtime containers:
//!
//! - `container_network`: Bay reaches the runtime by container IP on a
//!   docker network (Bay itself runs in a container with docker.sock
//!   mounted, sharing that network).
//! - `host_port`: Bay reaches the runtime via a published host port
//!   (`127.0.0.1:<host_port>`) — the typical on-host deployment.
//! - `auto`: prefer container network, fall back to host port.
//!
//! Multi-container sessions get a session-scoped bridge network
//! (`bay_net_<session_id>`) with a DNS alias per container spec name, so
//! containers reach each other by name.

use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogOutput,
    LogsOptions, NetworkingConfig, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::models::{EndpointSettings, HostConfig, NetworkSettings, PortBinding, PortMap};
use bollard::network::{CreateNetworkOptions, InspectNetworkOptions};
use bollard::volume::CreateVolumeOptions;
use bollard::Docker;
use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::driver::{
    CargoHandle, ContainerInfo, ContainerStatus, Driver, MultiContainerInfo, RuntimeInstance,
    SessionHandle, WORKSPACE_MOUNT_PATH,
};
use crate::error::{DriverError, DriverResult};
use crate::labels::{self, LabelMap};
use crate::profile::{ContainerSpec, Profile};

const DRIVER_KIND: &str = "docker";
const STOP_TIMEOUT_SECS: i64 = 10;
const PIDS_LIMIT: i64 = 256;

/// Parses a memory string (`"1g"`, `"512m"`) to bytes.
pub fn parse_memory_bytes(memory: &str) -> DriverResult<i64> {
    let trimmed = memory.trim().to_ascii_lowercase();
    let trimmed = trimmed
        .strip_suffix('i')
        .map(str::to_string)
        .unwrap_or(trimmed);

    let (digits, multiplier) = match trimmed.chars().last() {
        Some('k') => (&trimmed[..trimmed.len() - 1], 1024i64),
        Some('m') => (&trimmed[..trimmed.len() - 1], 1024 * 1024),
        Some('g') => (&trimmed[..trimmed.len() - 1], 1024 * 1024 * 1024),
        _ => (trimmed.as_str(), 1),
    };

    let value: f64 = digits.parse().map_err(|_| DriverError::Platform {
        driver: DRIVER_KIND,
        status: None,
        message: format!("invalid memory value '{memory}'"),
    })?;
    Ok((value * multiplier as f64) as i64)
}

/// How Bay reaches runtime containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectMode {
    ContainerNetwork,
    HostPort,
    Auto,
}

impl ConnectMode {
    pub fn allows_container_network(&self) -> bool {
        matches!(self, ConnectMode::ContainerNetwork | ConnectMode::Auto)
    }

    pub fn allows_host_port(&self) -> bool {
        matches!(self, ConnectMode::HostPort | ConnectMode::Auto)
    }
}

impl FromStr for ConnectMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "container_network" => Ok(ConnectMode::ContainerNetwork),
            "host_port" => Ok(ConnectMode::HostPort),
            "auto" => Ok(ConnectMode::Auto),
            other => Err(format!("unknown docker connect mode: {other}")),
        }
    }
}

/// Docker driver configuration (see spec for the matching config keys).
#[derive(Debug, Clone)]
pub struct DockerConfig {
    pub socket: Option<String>,
    pub network: Option<String>,
    pub connect_mode: ConnectMode,
    pub host_address: String,
    pub publish_ports: bool,
    pub host_port: Option<u16>,
    pub instance_id: String,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            socket: None,
            network: None,
            connect_mode: ConnectMode::Auto,
            host_address: "127.0.0.1".to_string(),
            publish_ports: true,
            host_port: None,
            instance_id: "bay".to_string(),
        }
    }
}

pub struct DockerDriver {
    client: Docker,
    cfg: DockerConfig,
}

fn map_err(err: bollard::errors::Error, resource: &str) -> DriverError {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => DriverError::NotFound {
            driver: DRIVER_KIND,
            resource: resource.to_string(),
        },
        bollard::errors::Error::DockerResponseServerError {
            status_code,
            message,
        } => DriverError::Platform {
            driver: DRIVER_KIND,
            status: Some(status_code),
            message,
        },
        other => DriverError::Platform {
            driver: DRIVER_KIND,
            status: None,
            message: other.to_string(),
        },
    }
}

impl DockerDriver {
    pub fn new(cfg: DockerConfig) -> DriverResult<Self> {
        let client = match &cfg.socket {
            Some(socket) => {
                let path = socket.strip_prefix("unix://").unwrap_or(socket);
                Docker::connect_with_unix(path, 120, bollard::API_DEFAULT_VERSION)
            }
            None => Docker::connect_with_local_defaults(),
        }
        .map_err(|err| DriverError::Platform {
            driver: DRIVER_KIND,
            status: None,
            message: format!("failed to connect to docker daemon: {err}"),
        })?;

        Ok(Self { client, cfg })
    }

    fn label(name: &str) -> String {
        labels::key(labels::DEFAULT_PREFIX, name)
    }

    fn base_labels(
        &self,
        session: &SessionHandle,
        cargo: &CargoHandle,
        runtime_port: u16,
        extra: &LabelMap,
    ) -> HashMap<String, String> {
        let mut out = HashMap::from([
            (Self::label(labels::OWNER), session.owner.clone()),
            (Self::label(labels::SANDBOX_ID), session.sandbox_id.clone()),
            (Self::label(labels::SESSION_ID), session.id.clone()),
            (Self::label(labels::CARGO_ID), cargo.id.clone()),
            (Self::label(labels::PROFILE_ID), session.profile_id.clone()),
            (Self::label(labels::RUNTIME_PORT), runtime_port.to_string()),
            (
                Self::label(labels::INSTANCE_ID),
                self.cfg.instance_id.clone(),
            ),
            (
                Self::label(labels::MANAGED),
                labels::MANAGED_TRUE.to_string(),
            ),
        ]);
        for (k, v) in extra {
            out.insert(Self::label(k), v.clone());
        }
        out
    }

    /// Strips the `bay.` prefix, returning the canonical label map the
    /// kernel operates on.
    fn bare_labels(raw: Option<HashMap<String, String>>) -> LabelMap {
        let prefix = format!("{}.", labels::DEFAULT_PREFIX);
        raw.unwrap_or_default()
            .into_iter()
            .filter_map(|(k, v)| k.strip_prefix(&prefix).map(|bare| (bare.to_string(), v)))
            .collect()
    }

    fn runtime_env(session: &SessionHandle, spec: &ContainerSpec, multi: bool) -> Vec<String> {
        let mut env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        env.push(format!("BAY_SESSION_ID={}", session.id));
        env.push(format!("BAY_SANDBOX_ID={}", session.sandbox_id));
        env.push(format!("BAY_WORKSPACE_PATH={WORKSPACE_MOUNT_PATH}"));
        if multi {
            env.push(format!("BAY_CONTAINER_NAME={}", spec.name));
        }
        env
    }

    fn resolve_container_ip(&self, settings: &NetworkSettings) -> Option<String> {
        let networks = settings.networks.as_ref()?;
        if networks.is_empty() {
            return None;
        }

        if let Some(network) = &self.cfg.network {
            if let Some(endpoint) = networks.get(network) {
                return endpoint.ip_address.clone().filter(|ip| !ip.is_empty());
            }
        }

        // fallback: first attached network
        networks
            .values()
            .next()
            .and_then(|endpoint| endpoint.ip_address.clone())
            .filter(|ip| !ip.is_empty())
    }

    fn resolve_host_port(
        &self,
        settings: &NetworkSettings,
        runtime_port: u16,
    ) -> Option<(String, u16)> {
        let ports = settings.ports.as_ref()?;
        let bindings = ports.get(&format!("{runtime_port}/tcp"))?.as_ref()?;
        let binding = bindings.first()?;

        let host_port: u16 = binding.host_port.as_deref()?.parse().ok()?;
        let host_ip = match binding.host_ip.as_deref() {
            None | Some("") | Some("0.0.0.0") | Some("::") => self.cfg.host_address.clone(),
            Some(ip) => ip.to_string(),
        };
        Some((host_ip, host_port))
    }

    /// Endpoint resolution: container network first (if allowed), then the
    /// published host port, then the container name as a last resort.
    fn resolve_endpoint(
        &self,
        settings: Option<&NetworkSettings>,
        container_name: &str,
        runtime_port: u16,
    ) -> String {
        if let Some(settings) = settings {
            if self.cfg.connect_mode.allows_container_network() {
                if let Some(ip) = self.resolve_container_ip(settings) {
                    return format!("http://{ip}:{runtime_port}");
                }
            }
            if self.cfg.connect_mode.allows_host_port() {
                if let Some((host, port)) = self.resolve_host_port(settings, runtime_port) {
                    return format!("http://{host}:{port}");
                }
            }
        }

        let endpoint = format!("http://{container_name}:{runtime_port}");
        warn!(endpoint = %endpoint, "docker endpoint resolution fell back to container name");
        endpoint
    }

    async fn network_exists(&self, name: &str) -> DriverResult<bool> {
        match self
            .client
            .inspect_network(name, None::<InspectNetworkOptions<String>>)
            .await
        {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(err) => Err(map_err(err, name)),
        }
    }

    fn session_network_name(session_id: &str) -> String {
        format!("bay_net_{session_id}")
    }

    fn port_config(
        &self,
        runtime_port: u16,
        fixed_host_port: Option<u16>,
    ) -> (HashMap<String, HashMap<(), ()>>, Option<PortMap>) {
        let expose_key = format!("{runtime_port}/tcp");
        let exposed_ports = HashMap::from([(expose_key.clone(), HashMap::new())]);

        let publish = self.cfg.publish_ports && self.cfg.connect_mode.allows_host_port();
        let port_bindings = publish.then(|| {
            let host_port = fixed_host_port
                .filter(|p| *p != 0)
                .map(|p| p.to_string())
                .unwrap_or_default();
            PortMap::from([(
                expose_key,
                Some(vec![PortBinding {
                    host_ip: Some("0.0.0.0".to_string()),
                    host_port: Some(host_port),
                }]),
            )])
        });

        (exposed_ports, port_bindings)
    }

    fn build_multi_config(
        &self,
        spec: &ContainerSpec,
        session: &SessionHandle,
        cargo: &CargoHandle,
        network_name: &str,
        extra_labels: &LabelMap,
    ) -> DriverResult<(Config<String>, String)> {
        let container_name = format!("bay-{}-{}", session.id, spec.name);

        let mut container_labels =
            self.base_labels(session, cargo, spec.runtime_port, extra_labels);
        container_labels.insert(Self::label(labels::CONTAINER_NAME), spec.name.clone());
        container_labels.insert(Self::label(labels::RUNTIME_TYPE), spec.runtime_type.clone());

        let mem_limit = parse_memory_bytes(&spec.resources.memory)?;
        let nano_cpus = (spec.resources.cpus * 1e9) as i64;

        // Ephemeral host ports in multi mode to avoid conflicts.
        let (exposed_ports, port_bindings) = self.port_config(spec.runtime_port, None);

        let host_config = HostConfig {
            binds: Some(vec![format!(
                "{}:{}:rw",
                cargo.driver_ref, WORKSPACE_MOUNT_PATH
            )]),
            memory: Some(mem_limit),
            nano_cpus: Some(nano_cpus),
            pids_limit: Some(PIDS_LIMIT),
            network_mode: Some(network_name.to_string()),
            port_bindings,
            ..Default::default()
        };

        // DNS alias = spec name so containers reach each other by name.
        let networking_config = NetworkingConfig {
            endpoints_config: HashMap::from([(
                network_name.to_string(),
                EndpointSettings {
                    aliases: Some(vec![spec.name.clone()]),
                    ..Default::default()
                },
            )]),
        };

        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(Self::runtime_env(session, spec, true)),
            labels: Some(container_labels),
            hostname: Some(spec.name.clone()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            networking_config: Some(networking_config),
            ..Default::default()
        };

        Ok((config, container_name))
    }

    async fn start_single_multi(
        &self,
        mut info: MultiContainerInfo,
    ) -> DriverResult<MultiContainerInfo> {
        self.client
            .start_container(&info.container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|err| map_err(err, &info.container_id))?;

        let inspect = self
            .client
            .inspect_container(&info.container_id, None::<InspectContainerOptions>)
            .await
            .map_err(|err| map_err(err, &info.container_id))?;

        let runtime_port: u16 = inspect
            .config
            .as_ref()
            .and_then(|c| c.labels.as_ref())
            .and_then(|l| l.get(&Self::label(labels::RUNTIME_PORT)))
            .and_then(|p| p.parse().ok())
            .unwrap_or(info.runtime_port);

        let name = inspect
            .name
            .as_deref()
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_else(|| info.container_id.clone());

        let endpoint =
            self.resolve_endpoint(inspect.network_settings.as_ref(), &name, runtime_port);

        info!(
            container_name = %info.name,
            container_id = %info.container_id,
            endpoint = %endpoint,
            "docker multi container started"
        );

        info.endpoint = Some(endpoint);
        info.status = ContainerStatus::Running;
        Ok(info)
    }
}

#[async_trait]
impl Driver for DockerDriver {
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

        let runtime_port = primary.runtime_port;
        let container_labels = self.base_labels(session, cargo, runtime_port, labels);

        let mem_limit = parse_memory_bytes(&primary.resources.memory)?;
        let nano_cpus = (primary.resources.cpus * 1e9) as i64;

        info!(
            session_id = %session.id,
            image = %primary.image,
            cargo = %cargo.driver_ref,
            runtime_port,
            connect_mode = ?self.cfg.connect_mode,
            "docker create"
        );

        // Resolve network mode: if the configured network is missing, fall
        // back to the default bridge rather than failing the create.
        let mut network_mode = None;
        if let Some(network) = &self.cfg.network {
            if self.network_exists(network).await? {
                network_mode = Some(network.clone());
            } else {
                warn!(network = %network, "configured docker network not found, using default");
            }
        }

        let (exposed_ports, port_bindings) =
            self.port_config(runtime_port, self.cfg.host_port);

        let host_config = HostConfig {
            binds: Some(vec![format!(
                "{}:{}:rw",
                cargo.driver_ref, WORKSPACE_MOUNT_PATH
            )]),
            memory: Some(mem_limit),
            nano_cpus: Some(nano_cpus),
            pids_limit: Some(PIDS_LIMIT),
            network_mode: network_mode
                .filter(|_| self.cfg.connect_mode.allows_container_network()),
            port_bindings,
            ..Default::default()
        };

        let config = Config {
            image: Some(primary.image.clone()),
            env: Some(Self::runtime_env(session, &primary, false)),
            labels: Some(container_labels),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        let created = self
            .client
            .create_container(
                Some(CreateContainerOptions {
                    name: format!("bay-session-{}", session.id),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|err| map_err(err, &session.id))?;

        info!(container_id = %created.id, "docker created");
        Ok(created.id)
    }

    async fn start(&self, container_id: &str, runtime_port: u16) -> DriverResult<String> {
        info!(
            container_id = %container_id,
            runtime_port,
            connect_mode = ?self.cfg.connect_mode,
            "docker start"
        );

        self.client
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|err| map_err(err, container_id))?;

        let inspect = self
            .client
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
            .map_err(|err| map_err(err, container_id))?;

        let name = inspect
            .name
            .as_deref()
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_else(|| container_id.to_string());

        Ok(self.resolve_endpoint(inspect.network_settings.as_ref(), &name, runtime_port))
    }

    async fn stop(&self, container_id: &str) -> DriverResult<()> {
        info!(container_id = %container_id, "docker stop");
        match self
            .client
            .stop_container(
                container_id,
                Some(StopContainerOptions {
                    t: STOP_TIMEOUT_SECS,
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(err) => match map_err(err, container_id) {
                DriverError::NotFound { .. } => {
                    warn!(container_id = %container_id, "docker stop: container not found");
                    Ok(())
                }
                other => Err(other),
            },
        }
    }

    async fn destroy(&self, container_id: &str) -> DriverResult<()> {
        info!(container_id = %container_id, "docker destroy");
        match self
            .client
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(err) => match map_err(err, container_id) {
                DriverError::NotFound { .. } => {
                    warn!(container_id = %container_id, "docker destroy: container not found");
                    Ok(())
                }
                other => Err(other),
            },
        }
    }

    async fn status(
        &self,
        container_id: &str,
        runtime_port: Option<u16>,
    ) -> DriverResult<ContainerInfo> {
        let inspect = match self
            .client
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => inspect,
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

        use bollard::models::ContainerStateStatusEnum as S;
        let state = inspect.state.as_ref();
        let status = match state.and_then(|s| s.status) {
            Some(S::RUNNING) => ContainerStatus::Running,
            Some(S::CREATED) => ContainerStatus::Created,
            Some(S::REMOVING) => ContainerStatus::Removing,
            Some(S::EXITED) | Some(S::DEAD) => ContainerStatus::Exited,
            _ => ContainerStatus::Exited,
        };

        let endpoint = match (status, runtime_port) {
            (ContainerStatus::Running, Some(port)) => {
                let name = inspect
                    .name
                    .as_deref()
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_else(|| container_id.to_string());
                Some(self.resolve_endpoint(inspect.network_settings.as_ref(), &name, port))
            }
            _ => None,
        };

        Ok(ContainerInfo {
            container_id: container_id.to_string(),
            status,
            endpoint,
            exit_code: state.and_then(|s| s.exit_code),
        })
    }

    async fn logs(&self, container_id: &str, tail: u32) -> DriverResult<String> {
        let mut stream = self.client.logs(
            container_id,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                tail: tail.to_string(),
                ..Default::default()
            }),
        );

        let mut out = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(LogOutput::StdOut { message }) | Ok(LogOutput::StdErr { message }) => {
                    out.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(_) => {}
                Err(err) => {
                    return match map_err(err, container_id) {
                        DriverError::NotFound { .. } => Ok(String::new()),
                        other => Err(other),
                    }
                }
            }
        }
        Ok(out)
    }

    async fn create_volume(&self, name: &str, labels: &LabelMap) -> DriverResult<String> {
        info!(name = %name, "docker create volume");

        let mut volume_labels = HashMap::from([(
            Self::label(labels::MANAGED),
            labels::MANAGED_TRUE.to_string(),
        )]);
        for (k, v) in labels {
            volume_labels.insert(Self::label(k), v.clone());
        }

        let volume = self
            .client
            .create_volume(CreateVolumeOptions {
                name: name.to_string(),
                labels: volume_labels,
                ..Default::default()
            })
            .await
            .map_err(|err| map_err(err, name))?;

        Ok(volume.name)
    }

    async fn delete_volume(&self, name: &str) -> DriverResult<()> {
        info!(name = %name, "docker delete volume");
        match self.client.remove_volume(name, None).await {
            Ok(()) => Ok(()),
            Err(err) => match map_err(err, name) {
                DriverError::NotFound { .. } => {
                    warn!(name = %name, "docker delete volume: not found");
                    Ok(())
                }
                other => Err(other),
            },
        }
    }

    async fn volume_exists(&self, name: &str) -> DriverResult<bool> {
        match self.client.inspect_volume(name).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(err) => Err(map_err(err, name)),
        }
    }

    async fn list_runtime_instances(
        &self,
        labels: &LabelMap,
    ) -> DriverResult<Vec<RuntimeInstance>> {
        let label_filters: Vec<String> = labels
            .iter()
            .map(|(k, v)| format!("{}={}", Self::label(k), v))
            .collect();
        debug!(filters = ?label_filters, "docker list runtime instances");

        let containers = self
            .client
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters: HashMap::from([("label".to_string(), label_filters)]),
                ..Default::default()
            }))
            .await
            .map_err(|err| map_err(err, "containers"))?;

        let instances: Vec<RuntimeInstance> = containers
            .into_iter()
            .map(|summary| {
                let id = summary.id.unwrap_or_default();
                let name = summary
                    .names
                    .as_ref()
                    .and_then(|names| names.first())
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_else(|| id.clone());
                RuntimeInstance {
                    name,
                    labels: Self::bare_labels(summary.labels),
                    state: summary.state.unwrap_or_else(|| "unknown".to_string()),
                    created_at: summary
                        .created
                        .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
                        .map(|ts| ts.to_rfc3339()),
                    id,
                }
            })
            .collect();

        debug!(count = instances.len(), "docker list runtime instances done");
        Ok(instances)
    }

    async fn destroy_runtime_instance(&self, instance_id: &str) -> DriverResult<()> {
        info!(instance_id = %instance_id, "docker destroy runtime instance");
        match self
            .client
            .remove_container(
                instance_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(err) => match map_err(err, instance_id) {
                DriverError::NotFound { .. } => {
                    warn!(instance_id = %instance_id, "docker destroy runtime instance: not found");
                    Ok(())
                }
                other => Err(other),
            },
        }
    }

    async fn create_session_network(&self, session_id: &str) -> DriverResult<String> {
        let network_name = Self::session_network_name(session_id);
        info!(session_id = %session_id, network_name = %network_name, "docker create session network");

        self.client
            .create_network(CreateNetworkOptions {
                name: network_name.clone(),
                driver: "bridge".to_string(),
                labels: HashMap::from([
                    (
                        Self::label(labels::MANAGED),
                        labels::MANAGED_TRUE.to_string(),
                    ),
                    (Self::label(labels::SESSION_ID), session_id.to_string()),
                    (
                        Self::label(labels::INSTANCE_ID),
                        self.cfg.instance_id.clone(),
                    ),
                ]),
                ..Default::default()
            })
            .await
            .map_err(|err| map_err(err, &network_name))?;

        Ok(network_name)
    }

    async fn remove_session_network(&self, session_id: &str) -> DriverResult<()> {
        let network_name = Self::session_network_name(session_id);
        info!(session_id = %session_id, network_name = %network_name, "docker remove session network");

        match self.client.remove_network(&network_name).await {
            Ok(()) => Ok(()),
            Err(err) => match map_err(err, &network_name) {
                DriverError::NotFound { .. } => {
                    warn!(network_name = %network_name, "docker session network not found");
                    Ok(())
                }
                other => Err(other),
            },
        }
    }

    async fn create_multi(
        &self,
        session: &SessionHandle,
        profile: &Profile,
        cargo: &CargoHandle,
        network_name: &str,
        labels: &LabelMap,
    ) -> DriverResult<Vec<MultiContainerInfo>> {
        let specs = profile.get_containers();
        info!(
            session_id = %session.id,
            container_count = specs.len(),
            network = %network_name,
            "docker create multi"
        );

        let mut results: Vec<MultiContainerInfo> = Vec::with_capacity(specs.len());
        for spec in &specs {
            let (config, container_name) =
                self.build_multi_config(spec, session, cargo, network_name, labels)?;

            info!(
                session_id = %session.id,
                container_name = %container_name,
                image = %spec.image,
                runtime_type = %spec.runtime_type,
                "docker create multi container"
            );

            match self
                .client
                .create_container(
                    Some(CreateContainerOptions {
                        name: container_name.clone(),
                        platform: None,
                    }),
                    config,
                )
                .await
            {
                Ok(created) => results.push(MultiContainerInfo {
                    name: spec.name.clone(),
                    container_id: created.id,
                    runtime_type: spec.runtime_type.clone(),
                    runtime_port: spec.runtime_port,
                    capabilities: spec.capabilities.clone(),
                    endpoint: None,
                    status: ContainerStatus::Created,
                }),
                Err(err) => {
                    let err = map_err(err, &container_name);
                    warn!(
                        session_id = %session.id,
                        container_name = %container_name,
                        error = %err,
                        "docker create multi failed, rolling back"
                    );
                    // All-or-nothing: destroy everything created so far.
                    for created in &results {
                        if let Err(cleanup_err) = self.destroy(&created.container_id).await {
                            warn!(
                                container_id = %created.container_id,
                                error = %cleanup_err,
                                "docker create multi rollback failed"
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
            "docker start multi"
        );

        let results = futures::future::join_all(
            containers
                .into_iter()
                .map(|info| self.start_single_multi(info)),
        )
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
            warn!(error = %err, "docker start multi partial failure, rolling back");
            for info in &started {
                if let Err(cleanup_err) = self.destroy(&info.container_id).await {
                    warn!(
                        container_id = %info.container_id,
                        error = %cleanup_err,
                        "docker start multi rollback failed"
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
                    container_id = %info.container_id,
                    error = %err,
                    "docker stop multi container failed"
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
                    container_id = %info.container_id,
                    error = %err,
                    "docker destroy multi container failed"
                );
            }
        }
        Ok(())
    }
}
