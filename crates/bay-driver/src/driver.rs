use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::DriverResult;
use crate::labels::LabelMap;
use crate::profile::Profile;

/// Cargo mount path inside every runtime container (fixed).
pub const WORKSPACE_MOUNT_PATH: &str = "/workspace";

/// Container status from the driver's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    Created,
    Running,
    Exited,
    Removing,
    NotFound,
}

impl ContainerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerStatus::Created => "created",
            ContainerStatus::Running => "running",
            ContainerStatus::Exited => "exited",
            ContainerStatus::Removing => "removing",
            ContainerStatus::NotFound => "not_found",
        }
    }
}

/// Container information returned by [`Driver::status`].
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub container_id: String,
    pub status: ContainerStatus,
    pub endpoint: Option<String>,
    pub exit_code: Option<i64>,
}

/// Runtime instance information for GC discovery.
#[derive(Debug, Clone)]
pub struct RuntimeInstance {
    pub id: String,
    pub name: String,
    pub labels: LabelMap,
    pub state: String,
    pub created_at: Option<String>,
}

/// Per-container state tracked through multi-container orchestration.
#[derive(Debug, Clone)]
pub struct MultiContainerInfo {
    pub name: String,
    pub container_id: String,
    pub runtime_type: String,
    pub runtime_port: u16,
    pub capabilities: Vec<String>,
    pub endpoint: Option<String>,
    pub status: ContainerStatus,
}

/// The session fields a driver needs; managers resolve ids, drivers never
/// reach back into the catalog.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub id: String,
    pub sandbox_id: String,
    pub profile_id: String,
    pub owner: String,
}

/// The cargo fields a driver needs to bind the workspace volume.
#[derive(Debug, Clone)]
pub struct CargoHandle {
    pub id: String,
    pub driver_ref: String,
}

/// Abstract driver interface for container lifecycle management.
///
/// All resources created by a driver MUST carry the label set in
/// [`crate::labels`]. `runtime_port` is the HTTP port the runtime exposes
/// inside the container; it comes from the profile and is never hardcoded
/// here.
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    /// Create a container for the profile's primary image without starting
    /// it. Returns the platform container id (pod name on Kubernetes).
    async fn create(
        &self,
        session: &SessionHandle,
        profile: &Profile,
        cargo: &CargoHandle,
        labels: &LabelMap,
    ) -> DriverResult<String>;

    /// Start the container and resolve a base URL reachable by this Bay
    /// process (see the connectivity modes on the Docker driver).
    async fn start(&self, container_id: &str, runtime_port: u16) -> DriverResult<String>;

    /// Stop a running container. A platform 404 is logged and swallowed.
    async fn stop(&self, container_id: &str) -> DriverResult<()>;

    /// Remove a container. A platform 404 is logged and swallowed.
    async fn destroy(&self, container_id: &str) -> DriverResult<()>;

    /// Current container status; computes an endpoint when `runtime_port`
    /// is given and the container is running.
    async fn status(
        &self,
        container_id: &str,
        runtime_port: Option<u16>,
    ) -> DriverResult<ContainerInfo>;

    /// Tail of the container logs.
    async fn logs(&self, container_id: &str, tail: u32) -> DriverResult<String>;

    // Volume management (cargo).

    async fn create_volume(&self, name: &str, labels: &LabelMap) -> DriverResult<String>;
    async fn delete_volume(&self, name: &str) -> DriverResult<()>;
    async fn volume_exists(&self, name: &str) -> DriverResult<bool>;

    // Runtime instance discovery (GC).

    /// List labelled instances whose labels are a superset of the argument.
    async fn list_runtime_instances(&self, labels: &LabelMap)
        -> DriverResult<Vec<RuntimeInstance>>;

    /// Force-delete an instance, bypassing session cleanup. GC only.
    async fn destroy_runtime_instance(&self, instance_id: &str) -> DriverResult<()>;

    // Multi-container orchestration.

    /// Create a session-scoped network. Returns the network name.
    async fn create_session_network(&self, session_id: &str) -> DriverResult<String>;

    /// Remove a session-scoped network. Best-effort on 404.
    async fn remove_session_network(&self, session_id: &str) -> DriverResult<()>;

    /// Create one container per profile container spec, all on the session
    /// network and sharing the cargo volume. All-or-nothing: a failure
    /// destroys everything created so far and re-raises.
    async fn create_multi(
        &self,
        session: &SessionHandle,
        profile: &Profile,
        cargo: &CargoHandle,
        network_name: &str,
        labels: &LabelMap,
    ) -> DriverResult<Vec<MultiContainerInfo>>;

    /// Start the created containers in parallel, resolving endpoints. On any
    /// failure, started containers are destroyed and the first error
    /// re-raised.
    async fn start_multi(
        &self,
        containers: Vec<MultiContainerInfo>,
    ) -> DriverResult<Vec<MultiContainerInfo>>;

    /// Stop all containers, best-effort sequential.
    async fn stop_multi(&self, containers: &[MultiContainerInfo]) -> DriverResult<()>;

    /// Destroy all containers, best-effort sequential.
    async fn destroy_multi(&self, containers: &[MultiContainerInfo]) -> DriverResult<()>;
}
