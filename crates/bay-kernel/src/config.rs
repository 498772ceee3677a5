//! Kernel configuration: driver selection, GC tuning, profile registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bay_driver::docker::{DockerConfig, DockerDriver};
use bay_driver::k8s::{K8sConfig, K8sDriver};
use bay_driver::{Driver, Profile};

use crate::error::BayResult;

/// Variant-typed driver selection (`driver.kind` in the configuration).
#[derive(Debug, Clone)]
pub enum DriverConfig {
    Docker(DockerConfig),
    K8s(K8sConfig),
}

/// Builds the configured driver implementation.
pub fn build_driver(config: &DriverConfig) -> BayResult<Arc<dyn Driver>> {
    match config {
        DriverConfig::Docker(cfg) => Ok(Arc::new(DockerDriver::new(cfg.clone())?)),
        DriverConfig::K8s(cfg) => Ok(Arc::new(K8sDriver::new(cfg.clone()))),
    }
}

/// Garbage collector tuning. `instance_id` is this process's fence token,
/// stamped on every resource it creates and compared literally by the
/// strict-mode orphan GC.
#[derive(Debug, Clone)]
pub struct GcConfig {
    pub instance_id: String,
    pub interval: Duration,
    pub idle_session_enabled: bool,
    pub expired_sandbox_enabled: bool,
    pub orphan_container_enabled: bool,
    pub orphan_workspace_enabled: bool,
    pub workspace_grace: Duration,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            instance_id: default_instance_id(),
            interval: Duration::from_secs(5),
            idle_session_enabled: true,
            expired_sandbox_enabled: true,
            orphan_container_enabled: true,
            orphan_workspace_enabled: true,
            workspace_grace: Duration::from_secs(300),
        }
    }
}

/// Fence token default: the hostname, so co-located processes on different
/// machines never claim each other's resources.
pub fn default_instance_id() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| "bay".to_string())
}

/// In-memory profile catalog. Profile file parsing lives outside the core;
/// the daemon feeds parsed profiles in here.
#[derive(Debug, Clone)]
pub struct ProfileRegistry {
    profiles: HashMap<String, Profile>,
}

pub const DEFAULT_PROFILE_ID: &str = "python-default";

impl Default for ProfileRegistry {
    fn default() -> Self {
        let mut registry = Self {
            profiles: HashMap::new(),
        };
        registry.insert(Profile::single(DEFAULT_PROFILE_ID, "ship:latest"));
        registry
    }
}

impl ProfileRegistry {
    pub fn insert(&mut self, profile: Profile) {
        self.profiles.insert(profile.id.clone(), profile);
    }

    pub fn get(&self, id: &str) -> Option<&Profile> {
        self.profiles.get(id)
    }

    pub fn ids(&self) -> Vec<&str> {
        self.profiles.keys().map(String::as_str).collect()
    }

    /// Loads additional profiles from a JSON array (the daemon reads the
    /// file; this only parses).
    pub fn load_json(&mut self, raw: &str) -> BayResult<usize> {
        let profiles: Vec<Profile> =
            serde_json::from_str(raw).context("failed to parse profiles JSON")?;
        let count = profiles.len();
        for profile in profiles {
            self.insert(profile);
        }
        Ok(count)
    }
}
