//! Execution profiles: images, resources, capabilities, idle timeout.
//!
//! Two forms are accepted. The legacy single-container form carries
//! `image`/`runtime_type`/`runtime_port`/`resources`/`env`/`capabilities`
//! at the top level and is auto-normalized into a one-element container
//! list named `primary`. The multi-container form declares `containers`
//! explicitly plus an optional startup strategy.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const DEFAULT_IMAGE: &str = "ship:latest";
pub const DEFAULT_RUNTIME_TYPE: &str = "ship";
pub const DEFAULT_RUNTIME_PORT: u16 = 8123;
pub const DEFAULT_HEALTH_CHECK_PATH: &str = "/health";
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 1800;

fn default_capabilities() -> Vec<String> {
    vec!["python".into(), "shell".into(), "filesystem".into()]
}

fn default_runtime_type() -> String {
    DEFAULT_RUNTIME_TYPE.to_string()
}

fn default_runtime_port() -> u16 {
    DEFAULT_RUNTIME_PORT
}

fn default_health_check_path() -> String {
    DEFAULT_HEALTH_CHECK_PATH.to_string()
}

fn default_idle_timeout() -> u64 {
    DEFAULT_IDLE_TIMEOUT_SECS
}

/// Per-container resource limits. Memory uses human units
/// (`"512m"`, `"1g"`, `"2Gi"`); CPU is a decimal core count.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceSpec {
    pub cpus: f64,
    pub memory: String,
}

impl Default for ResourceSpec {
    fn default() -> Self {
        Self {
            cpus: 1.0,
            memory: "1g".to_string(),
        }
    }
}

/// One container of a profile.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    #[serde(default = "default_runtime_type")]
    pub runtime_type: String,
    #[serde(default = "default_runtime_port")]
    pub runtime_port: u16,
    #[serde(default)]
    pub resources: ResourceSpec,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub primary_for: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_health_check_path")]
    pub health_check_path: String,
}

impl ContainerSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            runtime_type: default_runtime_type(),
            runtime_port: default_runtime_port(),
            resources: ResourceSpec::default(),
            capabilities: Vec::new(),
            primary_for: Vec::new(),
            env: BTreeMap::new(),
            health_check_path: default_health_check_path(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: &[&str]) -> Self {
        self.capabilities = capabilities.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_primary_for(mut self, primary_for: &[&str]) -> Self {
        self.primary_for = primary_for.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_runtime_type(mut self, runtime_type: impl Into<String>) -> Self {
        self.runtime_type = runtime_type.into();
        self
    }

    pub fn with_runtime_port(mut self, runtime_port: u16) -> Self {
        self.runtime_port = runtime_port;
        self
    }
}

/// Multi-container startup strategy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StartupOrder {
    Parallel,
    Sequential,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct StartupConfig {
    pub order: StartupOrder,
    pub wait_for_all: bool,
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            order: StartupOrder::Parallel,
            wait_for_all: true,
        }
    }
}

/// Immutable configuration bundle describing a sandbox's compute shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Profile {
    pub id: String,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,

    // Legacy single-container fields; ignored when `containers` is set.
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub runtime_type: Option<String>,
    #[serde(default)]
    pub runtime_port: Option<u16>,
    #[serde(default)]
    pub resources: Option<ResourceSpec>,
    #[serde(default)]
    pub env: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub capabilities: Option<Vec<String>>,

    #[serde(default)]
    pub containers: Option<Vec<ContainerSpec>>,
    #[serde(default)]
    pub startup: StartupConfig,
}

impl Profile {
    /// Legacy single-container profile.
    pub fn single(id: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            idle_timeout: default_idle_timeout(),
            image: Some(image.into()),
            runtime_type: None,
            runtime_port: None,
            resources: None,
            env: None,
            capabilities: None,
            containers: None,
            startup: StartupConfig::default(),
        }
    }

    /// Multi-container profile.
    pub fn multi(id: impl Into<String>, containers: Vec<ContainerSpec>) -> Self {
        Self {
            id: id.into(),
            idle_timeout: default_idle_timeout(),
            image: None,
            runtime_type: None,
            runtime_port: None,
            resources: None,
            env: None,
            capabilities: None,
            containers: Some(containers),
            startup: StartupConfig::default(),
        }
    }

    /// The normalized container list. The legacy form yields one container
    /// named `primary` with `primary_for` mirroring its capabilities.
    pub fn get_containers(&self) -> Vec<ContainerSpec> {
        if let Some(containers) = &self.containers {
            return containers.clone();
        }

        let capabilities = self
            .capabilities
            .clone()
            .unwrap_or_else(default_capabilities);
        vec![ContainerSpec {
            name: "primary".to_string(),
            image: self
                .image
                .clone()
                .unwrap_or_else(|| DEFAULT_IMAGE.to_string()),
            runtime_type: self
                .runtime_type
                .clone()
                .unwrap_or_else(default_runtime_type),
            runtime_port: self.runtime_port.unwrap_or(DEFAULT_RUNTIME_PORT),
            resources: self.resources.clone().unwrap_or_default(),
            primary_for: capabilities.clone(),
            capabilities,
            env: self.env.clone().unwrap_or_default(),
            health_check_path: default_health_check_path(),
        }]
    }

    pub fn is_multi_container(&self) -> bool {
        self.get_containers().len() > 1
    }

    /// The container whose id/endpoint back the legacy top-level session
    /// fields: `primary` by name, else `ship`, else the first declared.
    pub fn get_primary_container(&self) -> Option<ContainerSpec> {
        let containers = self.get_containers();
        if containers.is_empty() {
            return None;
        }
        for wanted in ["primary", "ship"] {
            if let Some(spec) = containers.iter().find(|c| c.name == wanted) {
                return Some(spec.clone());
            }
        }
        Some(containers[0].clone())
    }

    /// Resolves a capability to its serving container: the first container
    /// whose `primary_for` claims it wins, else the first (in declaration
    /// order) whose `capabilities` contain it.
    pub fn find_container_for_capability(&self, capability: &str) -> Option<ContainerSpec> {
        let containers = self.get_containers();
        if let Some(spec) = containers
            .iter()
            .find(|c| c.primary_for.iter().any(|p| p == capability))
        {
            return Some(spec.clone());
        }
        containers
            .into_iter()
            .find(|c| c.capabilities.iter().any(|p| p == capability))
    }

    /// Union of capabilities across all containers, declaration order kept.
    pub fn available_capabilities(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for spec in self.get_containers() {
            for cap in spec.capabilities {
                if !out.contains(&cap) {
                    out.push(cap);
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_profile_normalizes_to_single_container() {
        let mut profile = Profile::single("test", "ship:latest");
        profile.capabilities = Some(vec!["python".into()]);

        let containers = profile.get_containers();
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].name, "primary");
        assert_eq!(containers[0].image, "ship:latest");
    }

    #[test]
    fn legacy_profile_preserves_runtime_fields() {
        let mut profile = Profile::single("test", "ship:latest");
        profile.runtime_type = Some("ship".into());
        profile.runtime_port = Some(8123);
        profile.resources = Some(ResourceSpec {
            cpus: 2.0,
            memory: "4g".into(),
        });

        let primary = profile.get_primary_container().unwrap();
        assert_eq!(primary.runtime_type, "ship");
        assert_eq!(primary.runtime_port, 8123);
        assert_eq!(primary.resources.cpus, 2.0);
        assert_eq!(primary.resources.memory, "4g");
    }

    #[test]
    fn legacy_profile_sets_primary_for_from_capabilities() {
        let mut profile = Profile::single("test", "ship:latest");
        profile.capabilities = Some(vec!["filesystem".into(), "python".into()]);

        let primary = profile.get_primary_container().unwrap();
        assert_eq!(primary.capabilities, vec!["filesystem", "python"]);
        assert_eq!(primary.primary_for, vec!["filesystem", "python"]);
    }

    #[test]
    fn default_profile_creates_primary_container() {
        let profile = Profile {
            id: "test".into(),
            idle_timeout: default_idle_timeout(),
            image: None,
            runtime_type: None,
            runtime_port: None,
            resources: None,
            env: None,
            capabilities: None,
            containers: None,
            startup: StartupConfig::default(),
        };

        let containers = profile.get_containers();
        assert_eq!(containers.len(), 1);
        let primary = &containers[0];
        assert_eq!(primary.name, "primary");
        assert_eq!(primary.image, "ship:latest");
        assert_eq!(primary.runtime_type, "ship");
        assert_eq!(primary.runtime_port, 8123);
        assert!(primary.capabilities.iter().any(|c| c == "python"));
    }

    #[test]
    fn multi_container_profile_parses_in_order() {
        let profile = Profile::multi(
            "browser-python",
            vec![
                ContainerSpec::new("ship", "ship:latest")
                    .with_capabilities(&["python", "shell", "filesystem"])
                    .with_primary_for(&["filesystem"]),
                ContainerSpec::new("browser", "browser-runtime:latest")
                    .with_runtime_type("browser")
                    .with_runtime_port(8080)
                    .with_capabilities(&["browser", "screenshot", "filesystem"]),
            ],
        );

        let containers = profile.get_containers();
        assert_eq!(containers.len(), 2);
        assert_eq!(containers[0].name, "ship");
        assert_eq!(containers[1].name, "browser");
        assert!(profile.is_multi_container());
    }

    #[test]
    fn default_startup_is_parallel_wait_for_all() {
        let profile = Profile::multi("test", vec![ContainerSpec::new("ship", "ship:latest")]);
        assert_eq!(profile.startup.order, StartupOrder::Parallel);
        assert!(profile.startup.wait_for_all);
    }

    #[test]
    fn primary_container_resolution_prefers_primary_then_ship() {
        let by_primary = Profile::multi(
            "test",
            vec![
                ContainerSpec::new("browser", "browser:latest"),
                ContainerSpec::new("primary", "ship:latest"),
            ],
        );
        assert_eq!(by_primary.get_primary_container().unwrap().name, "primary");

        let by_ship = Profile::multi(
            "test",
            vec![
                ContainerSpec::new("browser", "browser:latest"),
                ContainerSpec::new("ship", "ship:latest"),
            ],
        );
        assert_eq!(by_ship.get_primary_container().unwrap().name, "ship");

        let fallback = Profile::multi(
            "test",
            vec![
                ContainerSpec::new("worker-1", "worker:latest"),
                ContainerSpec::new("worker-2", "worker:latest"),
            ],
        );
        assert_eq!(fallback.get_primary_container().unwrap().name, "worker-1");

        let empty = Profile::multi("test", Vec::new());
        assert!(empty.get_primary_container().is_none());
    }

    #[test]
    fn capability_routing_exclusive_and_ordered() {
        let profile = Profile::multi(
            "test",
            vec![
                ContainerSpec::new("ship", "ship:latest").with_capabilities(&[
                    "python",
                    "shell",
                    "filesystem",
                ]),
                ContainerSpec::new("browser", "browser:latest")
                    .with_capabilities(&["browser", "screenshot"]),
            ],
        );

        assert_eq!(
            profile.find_container_for_capability("python").unwrap().name,
            "ship"
        );
        assert_eq!(
            profile
                .find_container_for_capability("browser")
                .unwrap()
                .name,
            "browser"
        );
        assert!(profile.find_container_for_capability("teleport").is_none());
    }

    #[test]
    fn capability_routing_primary_for_wins_over_order() {
        let profile = Profile::multi(
            "test",
            vec![
                ContainerSpec::new("browser", "browser:latest")
                    .with_capabilities(&["filesystem", "browser"]),
                ContainerSpec::new("ship", "ship:latest")
                    .with_capabilities(&["filesystem"])
                    .with_primary_for(&["filesystem"]),
            ],
        );

        assert_eq!(
            profile
                .find_container_for_capability("filesystem")
                .unwrap()
                .name,
            "ship"
        );
    }

    #[test]
    fn available_capabilities_deduplicates_preserving_order() {
        let profile = Profile::multi(
            "test",
            vec![
                ContainerSpec::new("ship", "ship:latest").with_capabilities(&["python", "filesystem"]),
                ContainerSpec::new("browser", "browser:latest")
                    .with_capabilities(&["filesystem", "browser"]),
            ],
        );
        assert_eq!(
            profile.available_capabilities(),
            vec!["python", "filesystem", "browser"]
        );
    }

    #[test]
    fn profile_roundtrips_through_serde() {
        let json = r#"{
            "id": "legacy",
            "image": "ship:latest",
            "runtime_port": 9000,
            "capabilities": ["python"]
        }"#;
        let profile: Profile = serde_json::from_str(json).unwrap();
        assert_eq!(profile.idle_timeout, DEFAULT_IDLE_TIMEOUT_SECS);
        let primary = profile.get_primary_container().unwrap();
        assert_eq!(primary.runtime_port, 9000);
        assert_eq!(primary.primary_for, vec!["python"]);
    }
}
