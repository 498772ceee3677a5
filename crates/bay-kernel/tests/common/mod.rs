//! Shared test fixtures: an in-memory fake driver, a local health stub, and
//! a fully wired kernel over a sqlite::memory: catalog.

// Each integration-test binary uses a subset of these helpers.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bay_db::Database;
use bay_driver::labels::{self, LabelMap};
use bay_driver::{
    CargoHandle, ContainerInfo, ContainerSpec, ContainerStatus, Driver, DriverError, DriverResult,
    MultiContainerInfo, Profile, RuntimeInstance, SessionHandle,
};
use bay_kernel::{
    GarbageCollector, GcConfig, LockRegistry, ProfileRegistry, ReadinessConfig, RuntimeClient,
    SandboxManager,
};
use parking_lot::Mutex;

pub const INSTANCE_ID: &str = "bay-test";
pub const OWNER: &str = "owner-a";

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub id: String,
    pub name: String,
    pub image: String,
    pub labels: LabelMap,
    pub status: ContainerStatus,
}

#[derive(Default)]
struct FakeState {
    containers: HashMap<String, FakeContainer>,
    volumes: HashMap<String, LabelMap>,
    networks: HashSet<String>,
    fail_images: HashSet<String>,
    create_calls: u32,
    start_calls: u32,
    counter: u64,
}

/// Scriptable in-memory driver. Containers become reachable through the
/// health stub endpoint handed in at construction.
pub struct FakeDriver {
    endpoint: Mutex<String>,
    state: Mutex<FakeState>,
}

impl FakeDriver {
    pub fn new(endpoint: String) -> Self {
        Self {
            endpoint: Mutex::new(endpoint),
            state: Mutex::new(FakeState::default()),
        }
    }

    /// Containers of this image fail to create until cleared.
    pub fn fail_image(&self, image: &str) {
        self.state.lock().fail_images.insert(image.to_string());
    }

    pub fn clear_failures(&self) {
        self.state.lock().fail_images.clear();
    }

    /// Points all started containers at a different endpoint (e.g. a closed
    /// port, to drive the readiness budget to expiry).
    pub fn set_endpoint(&self, endpoint: &str) {
        *self.endpoint.lock() = endpoint.to_string();
    }

    pub fn create_calls(&self) -> u32 {
        self.state.lock().create_calls
    }

    pub fn start_calls(&self) -> u32 {
        self.state.lock().start_calls
    }

    pub fn container_count(&self) -> usize {
        self.state.lock().containers.len()
    }

    pub fn running_container_count(&self) -> usize {
        self.state
            .lock()
            .containers
            .values()
            .filter(|c| c.status == ContainerStatus::Running)
            .count()
    }

    pub fn network_count(&self) -> usize {
        self.state.lock().networks.len()
    }

    pub fn volume_count(&self) -> usize {
        self.state.lock().volumes.len()
    }

    pub fn has_volume(&self, name: &str) -> bool {
        self.state.lock().volumes.contains_key(name)
    }

    pub fn has_container(&self, id: &str) -> bool {
        self.state.lock().containers.contains_key(id)
    }

    /// Registers a container that Bay did not create (GC fence tests).
    pub fn add_external_instance(&self, id: &str, labels: LabelMap) {
        let mut state = self.state.lock();
        state.containers.insert(
            id.to_string(),
            FakeContainer {
                id: id.to_string(),
                name: id.to_string(),
                image: "external:latest".to_string(),
                labels,
                status: ContainerStatus::Running,
            },
        );
    }

    fn insert_container(
        state: &mut FakeState,
        name: &str,
        image: &str,
        labels: LabelMap,
    ) -> String {
        state.counter += 1;
        let id = format!("fake-{}", state.counter);
        state.containers.insert(
            id.clone(),
            FakeContainer {
                id: id.clone(),
                name: name.to_string(),
                image: image.to_string(),
                labels,
                status: ContainerStatus::Created,
            },
        );
        id
    }

    fn base_labels(
        session: &SessionHandle,
        cargo: &CargoHandle,
        runtime_port: u16,
    ) -> LabelMap {
        let mut out = LabelMap::new();
        out.insert(labels::OWNER.to_string(), session.owner.clone());
        out.insert(labels::SANDBOX_ID.to_string(), session.sandbox_id.clone());
        out.insert(labels::SESSION_ID.to_string(), session.id.clone());
        out.insert(labels::CARGO_ID.to_string(), cargo.id.clone());
        out.insert(labels::PROFILE_ID.to_string(), session.profile_id.clone());
        out.insert(labels::RUNTIME_PORT.to_string(), runtime_port.to_string());
        out.insert(labels::INSTANCE_ID.to_string(), INSTANCE_ID.to_string());
        out.insert(labels::MANAGED.to_string(), labels::MANAGED_TRUE.to_string());
        out
    }

    fn platform_error(message: impl Into<String>) -> DriverError {
        DriverError::Platform {
            driver: "fake",
            status: Some(500),
            message: message.into(),
        }
    }
}

#[async_trait]
impl Driver for FakeDriver {
    async fn create(
        &self,
        session: &SessionHandle,
        profile: &Profile,
        cargo: &CargoHandle,
        _labels: &LabelMap,
    ) -> DriverResult<String> {
        let primary = profile
            .get_primary_container()
            .ok_or_else(|| Self::platform_error("profile has no containers"))?;

        let mut state = self.state.lock();
        state.create_calls += 1;
        if state.fail_images.contains(&primary.image) {
            return Err(Self::platform_error(format!(
                "no such image: {}",
                primary.image
            )));
        }

        let labels = Self::base_labels(session, cargo, primary.runtime_port);
        let name = format!("bay-session-{}", session.id);
        Ok(Self::insert_container(
            &mut state,
            &name,
            &primary.image,
            labels,
        ))
    }

    async fn start(&self, container_id: &str, _runtime_port: u16) -> DriverResult<String> {
        let mut state = self.state.lock();
        state.start_calls += 1;
        let container =
            state
                .containers
                .get_mut(container_id)
                .ok_or_else(|| DriverError::NotFound {
                    driver: "fake",
                    resource: container_id.to_string(),
                })?;
        container.status = ContainerStatus::Running;
        Ok(self.endpoint.lock().clone())
    }

    async fn stop(&self, container_id: &str) -> DriverResult<()> {
        if let Some(container) = self.state.lock().containers.get_mut(container_id) {
            container.status = ContainerStatus::Exited;
        }
        Ok(())
    }

    async fn destroy(&self, container_id: &str) -> DriverResult<()> {
        self.state.lock().containers.remove(container_id);
        Ok(())
    }

    async fn status(
        &self,
        container_id: &str,
        runtime_port: Option<u16>,
    ) -> DriverResult<ContainerInfo> {
        let state = self.state.lock();
        match state.containers.get(container_id) {
            Some(container) => Ok(ContainerInfo {
                container_id: container_id.to_string(),
                status: container.status,
                endpoint: (container.status == ContainerStatus::Running && runtime_port.is_some())
                    .then(|| self.endpoint.lock().clone()),
                exit_code: None,
            }),
            None => Ok(ContainerInfo {
                container_id: container_id.to_string(),
                status: ContainerStatus::NotFound,
                endpoint: None,
                exit_code: None,
            }),
        }
    }

    async fn logs(&self, _container_id: &str, _tail: u32) -> DriverResult<String> {
        Ok(String::new())
    }

    async fn create_volume(&self, name: &str, labels: &LabelMap) -> DriverResult<String> {
        self.state
            .lock()
            .volumes
            .insert(name.to_string(), labels.clone());
        Ok(name.to_string())
    }

    async fn delete_volume(&self, name: &str) -> DriverResult<()> {
        self.state.lock().volumes.remove(name);
        Ok(())
    }

    async fn volume_exists(&self, name: &str) -> DriverResult<bool> {
        Ok(self.state.lock().volumes.contains_key(name))
    }

    async fn list_runtime_instances(
        &self,
        labels: &LabelMap,
    ) -> DriverResult<Vec<RuntimeInstance>> {
        let state = self.state.lock();
        Ok(state
            .containers
            .values()
            .filter(|container| {
                labels
                    .iter()
                    .all(|(k, v)| container.labels.get(k) == Some(v))
            })
            .map(|container| RuntimeInstance {
                id: container.id.clone(),
                name: container.name.clone(),
                labels: container.labels.clone(),
                state: container.status.as_str().to_string(),
                created_at: None,
            })
            .collect())
    }

    async fn destroy_runtime_instance(&self, instance_id: &str) -> DriverResult<()> {
        self.state.lock().containers.remove(instance_id);
        Ok(())
    }

    async fn create_session_network(&self, session_id: &str) -> DriverResult<String> {
        let name = format!("bay_net_{session_id}");
        self.state.lock().networks.insert(name.clone());
        Ok(name)
    }

    async fn remove_session_network(&self, session_id: &str) -> DriverResult<()> {
        self.state
            .lock()
            .networks
            .remove(&format!("bay_net_{session_id}"));
        Ok(())
    }

    async fn create_multi(
        &self,
        session: &SessionHandle,
        profile: &Profile,
        cargo: &CargoHandle,
        _network_name: &str,
        _labels: &LabelMap,
    ) -> DriverResult<Vec<MultiContainerInfo>> {
        let specs = profile.get_containers();
        let mut state = self.state.lock();
        let mut results: Vec<MultiContainerInfo> = Vec::new();

        for spec in &specs {
            state.create_calls += 1;
            if state.fail_images.contains(&spec.image) {
                for created in &results {
                    state.containers.remove(&created.container_id);
                }
                return Err(Self::platform_error(format!(
                    "no such image: {}",
                    spec.image
                )));
            }

            let mut labels = Self::base_labels(session, cargo, spec.runtime_port);
            labels.insert(labels::CONTAINER_NAME.to_string(), spec.name.clone());
            labels.insert(labels::RUNTIME_TYPE.to_string(), spec.runtime_type.clone());
            let name = format!("bay-{}-{}", session.id, spec.name);
            let id = Self::insert_container(&mut state, &name, &spec.image, labels);

            results.push(MultiContainerInfo {
                name: spec.name.clone(),
                container_id: id,
                runtime_type: spec.runtime_type.clone(),
                runtime_port: spec.runtime_port,
                capabilities: spec.capabilities.clone(),
                endpoint: None,
                status: ContainerStatus::Created,
            });
        }

        Ok(results)
    }

    async fn start_multi(
        &self,
        containers: Vec<MultiContainerInfo>,
    ) -> DriverResult<Vec<MultiContainerInfo>> {
        let mut started = Vec::with_capacity(containers.len());
        for mut info in containers {
            self.start(&info.container_id, info.runtime_port).await?;
            info.endpoint = Some(self.endpoint.lock().clone());
            info.status = ContainerStatus::Running;
            started.push(info);
        }
        Ok(started)
    }

    async fn stop_multi(&self, containers: &[MultiContainerInfo]) -> DriverResult<()> {
        for info in containers {
            let _ = self.stop(&info.container_id).await;
        }
        Ok(())
    }

    async fn destroy_multi(&self, containers: &[MultiContainerInfo]) -> DriverResult<()> {
        for info in containers {
            let _ = self.destroy(&info.container_id).await;
        }
        Ok(())
    }
}

/// Serves `GET /health` with `{"browser_ready": true}` on an ephemeral port.
pub async fn spawn_health_stub() -> String {
    let app = axum::Router::new().route(
        "/health",
        axum::routing::get(|| async {
            axum::Json(serde_json::json!({"status": "ok", "browser_ready": true}))
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

pub struct TestBay {
    pub db: Database,
    pub driver: Arc<FakeDriver>,
    pub sandboxes: SandboxManager,
    pub gc: GarbageCollector,
}

pub fn test_profiles() -> ProfileRegistry {
    let mut registry = ProfileRegistry::default();

    registry.insert(Profile::multi(
        "browser-python",
        vec![
            ContainerSpec::new("ship", "ship:latest")
                .with_capabilities(&["python", "shell", "filesystem"])
                .with_primary_for(&["filesystem"]),
            ContainerSpec::new("browser", "gull:latest")
                .with_runtime_type("browser")
                .with_runtime_port(8080)
                .with_capabilities(&["browser", "screenshot"]),
        ],
    ));

    registry.insert(Profile::multi(
        "broken-multi",
        vec![
            ContainerSpec::new("ship", "ship:latest").with_capabilities(&["python"]),
            ContainerSpec::new("worker", "missing:latest").with_capabilities(&["shell"]),
        ],
    ));

    registry
}

pub async fn bay() -> TestBay {
    bay_with_readiness(ReadinessConfig {
        budget: Duration::from_secs(3),
        initial_interval: Duration::from_millis(10),
        max_interval: Duration::from_millis(50),
        backoff_factor: 2.0,
    })
    .await
}

pub async fn bay_with_readiness(readiness: ReadinessConfig) -> TestBay {
    let db = Database::connect("sqlite::memory:").await.unwrap();
    let endpoint = spawn_health_stub().await;
    let driver = Arc::new(FakeDriver::new(endpoint));

    let sandboxes = SandboxManager::new(
        driver.clone(),
        db.clone(),
        Arc::new(test_profiles()),
        LockRegistry::new(),
        RuntimeClient::new().unwrap(),
    )
    .with_readiness(readiness);

    let gc = GarbageCollector::new(
        db.clone(),
        driver.clone(),
        sandboxes.clone(),
        GcConfig {
            instance_id: INSTANCE_ID.to_string(),
            interval: Duration::from_secs(1),
            workspace_grace: Duration::ZERO,
            ..Default::default()
        },
    );

    TestBay {
        db,
        driver,
        sandboxes,
        gc,
    }
}
