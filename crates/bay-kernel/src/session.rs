//! Session manager: idempotent session startup, readiness, stop/destroy.
//!
//! `ensure_running` is the core contract: concurrent calls for one session
//! observe a single forward progression. Single-container profiles take the
//! legacy path (one container, top-level `container_id`/`endpoint`);
//! profiles with more than one container take the multi path (session
//! network, parallel startup, all-or-nothing rollback).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use bay_db::{
    CargoRecord, ContainerDescriptor, Database, NewSession, SessionRecord, SessionState,
};
use bay_driver::{
    labels::LabelMap, CargoHandle, ContainerStatus, Driver, MultiContainerInfo, Profile,
    SessionHandle,
};
use tracing::{debug, error, info, warn};

use crate::error::{BayError, BayResult};
use crate::http::RuntimeClient;

const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Readiness polling schedule. The generous default budget absorbs image
/// pulls on cold nodes.
#[derive(Debug, Clone)]
pub struct ReadinessConfig {
    pub budget: Duration,
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub backoff_factor: f64,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            budget: Duration::from_secs(120),
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(1),
            backoff_factor: 2.0,
        }
    }
}

#[derive(Clone)]
pub struct SessionManager {
    driver: Arc<dyn Driver>,
    db: Database,
    http: RuntimeClient,
    readiness: ReadinessConfig,
}

fn session_handle(session: &SessionRecord, owner: &str) -> SessionHandle {
    SessionHandle {
        id: session.id.clone(),
        sandbox_id: session.sandbox_id.clone(),
        profile_id: session.profile_id.clone(),
        owner: owner.to_string(),
    }
}

fn cargo_handle(cargo: &CargoRecord) -> CargoHandle {
    CargoHandle {
        id: cargo.id.clone(),
        driver_ref: cargo.driver_ref.clone(),
    }
}

fn to_descriptor(info: &MultiContainerInfo) -> ContainerDescriptor {
    ContainerDescriptor {
        name: info.name.clone(),
        container_id: info.container_id.clone(),
        runtime_type: info.runtime_type.clone(),
        capabilities: info.capabilities.clone(),
        endpoint: info.endpoint.clone(),
        status: info.status.as_str().to_string(),
    }
}

fn to_info(descriptor: &ContainerDescriptor) -> MultiContainerInfo {
    MultiContainerInfo {
        name: descriptor.name.clone(),
        container_id: descriptor.container_id.clone(),
        runtime_type: descriptor.runtime_type.clone(),
        runtime_port: bay_driver::profile::DEFAULT_RUNTIME_PORT,
        capabilities: descriptor.capabilities.clone(),
        endpoint: descriptor.endpoint.clone(),
        status: match descriptor.status.as_str() {
            "running" => ContainerStatus::Running,
            "created" => ContainerStatus::Created,
            "removing" => ContainerStatus::Removing,
            "exited" => ContainerStatus::Exited,
            _ => ContainerStatus::NotFound,
        },
    }
}

impl SessionManager {
    pub fn new(driver: Arc<dyn Driver>, db: Database, http: RuntimeClient) -> Self {
        Self {
            driver,
            db,
            http,
            readiness: ReadinessConfig::default(),
        }
    }

    /// Overrides the readiness schedule (tests use a tight budget).
    pub fn with_readiness(mut self, readiness: ReadinessConfig) -> Self {
        self.readiness = readiness;
        self
    }

    /// Creates a session row (no compute yet).
    pub async fn create(&self, sandbox_id: &str, profile: &Profile) -> BayResult<SessionRecord> {
        let session_id = bay_db::short_id("sess");
        let runtime_type = profile
            .get_primary_container()
            .map(|c| c.runtime_type)
            .unwrap_or_else(|| "ship".to_string());

        info!(
            session_id = %session_id,
            sandbox_id = %sandbox_id,
            profile_id = %profile.id,
            "session create"
        );

        Ok(self
            .db
            .create_session(NewSession {
                id: &session_id,
                sandbox_id,
                profile_id: &profile.id,
                runtime_type: &runtime_type,
            })
            .await?)
    }

    pub async fn get(&self, session_id: &str) -> BayResult<Option<SessionRecord>> {
        Ok(self.db.fetch_session(session_id).await?)
    }

    /// Updates the `last_active_at` timestamp.
    pub async fn touch(&self, session_id: &str) -> BayResult<()> {
        Ok(self.db.touch_session(session_id).await?)
    }

    /// Ensures the session is running, creating and starting compute as
    /// needed. Callers hold the per-sandbox lock.
    pub async fn ensure_running(
        &self,
        session: SessionRecord,
        cargo: &CargoRecord,
        profile: &Profile,
    ) -> BayResult<SessionRecord> {
        info!(
            session_id = %session.id,
            observed_state = session.observed_state.as_str(),
            container_count = profile.get_containers().len(),
            "session ensure_running"
        );

        if profile.get_containers().len() > 1 {
            self.ensure_running_multi(session, cargo, profile).await
        } else {
            self.ensure_running_single(session, cargo, profile).await
        }
    }

    async fn ensure_running_single(
        &self,
        mut session: SessionRecord,
        cargo: &CargoRecord,
        profile: &Profile,
    ) -> BayResult<SessionRecord> {
        // The catalog may say RUNNING while the container died underneath;
        // probe before trusting it.
        if session.container_id.is_some() && session.observed_state == SessionState::Running {
            session = self.probe_and_recover_if_dead(session, profile).await?;
        }

        if session.is_ready() {
            return Ok(session);
        }

        if session.observed_state == SessionState::Starting {
            return Err(BayError::SessionNotReady {
                sandbox_id: session.sandbox_id.clone(),
                retry_after_ms: 1000,
            });
        }

        let primary = profile.get_primary_container().ok_or_else(|| {
            BayError::Validation(format!("profile {} has no containers defined", profile.id))
        })?;

        if session.container_id.is_none() {
            self.db
                .update_session_states(&session.id, SessionState::Running, SessionState::Starting)
                .await?;

            let handle = session_handle(&session, &cargo.owner);
            let container_id = match self
                .driver
                .create(&handle, profile, &cargo_handle(cargo), &LabelMap::new())
                .await
            {
                Ok(id) => id,
                Err(err) => {
                    error!(session_id = %session.id, error = %err, "session container create failed");
                    self.db
                        .clear_session_runtime(&session.id, SessionState::Failed)
                        .await?;
                    return Err(err.into());
                }
            };

            self.db
                .set_session_container(&session.id, &container_id)
                .await?;
            session.container_id = Some(container_id);
            session.observed_state = SessionState::Starting;
        }

        if session.observed_state != SessionState::Running {
            let container_id = session
                .container_id
                .clone()
                .ok_or_else(|| BayError::Internal(anyhow!("session lost its container id")))?;

            let started: BayResult<String> =
                match self.driver.start(&container_id, primary.runtime_port).await {
                    Ok(endpoint) => self
                        .wait_for_ready(
                            &endpoint,
                            &primary.health_check_path,
                            &session.runtime_type,
                            &session.id,
                        )
                        .await
                        .map(|_| endpoint),
                    Err(err) => Err(err.into()),
                };

            match started {
                Ok(endpoint) => {
                    // Persist the endpoint only after readiness succeeds.
                    self.db
                        .mark_session_running(&session.id, &container_id, &endpoint, None)
                        .await?;
                    session.endpoint = Some(endpoint);
                    session.observed_state = SessionState::Running;
                }
                Err(err) => {
                    error!(
                        session_id = %session.id,
                        container_id = %container_id,
                        error = %err,
                        "session start failed"
                    );
                    if let Err(destroy_err) = self.driver.destroy(&container_id).await {
                        warn!(
                            session_id = %session.id,
                            container_id = %container_id,
                            error = %destroy_err,
                            "session rollback destroy failed"
                        );
                    }
                    self.db
                        .clear_session_runtime(&session.id, SessionState::Failed)
                        .await?;
                    return Err(err);
                }
            }
        }

        Ok(session)
    }

    async fn ensure_running_multi(
        &self,
        mut session: SessionRecord,
        cargo: &CargoRecord,
        profile: &Profile,
    ) -> BayResult<SessionRecord> {
        if session.is_ready() {
            return Ok(session);
        }

        if session.observed_state == SessionState::Starting {
            return Err(BayError::SessionNotReady {
                sandbox_id: session.sandbox_id.clone(),
                retry_after_ms: 1500,
            });
        }

        if session.container_id.is_none() {
            self.db
                .update_session_states(&session.id, SessionState::Running, SessionState::Starting)
                .await?;

            let handle = session_handle(&session, &cargo.owner);

            let network_name = match self.driver.create_session_network(&session.id).await {
                Ok(name) => name,
                Err(err) => {
                    error!(session_id = %session.id, error = %err, "session network create failed");
                    self.abort_multi(&session.id, &[], false).await;
                    return Err(err.into());
                }
            };

            let created = match self
                .driver
                .create_multi(
                    &handle,
                    profile,
                    &cargo_handle(cargo),
                    &network_name,
                    &LabelMap::new(),
                )
                .await
            {
                Ok(infos) => infos,
                Err(err) => {
                    // create_multi already destroyed its partial containers.
                    error!(session_id = %session.id, error = %err, "session create_multi failed");
                    self.abort_multi(&session.id, &[], true).await;
                    return Err(err.into());
                }
            };

            let started = match self.driver.start_multi(created.clone()).await {
                Ok(infos) => infos,
                Err(err) => {
                    error!(session_id = %session.id, error = %err, "session start_multi failed");
                    self.abort_multi(&session.id, &created, true).await;
                    return Err(err.into());
                }
            };

            if let Err(err) = self.wait_for_multi_ready(&started, profile, &session.id).await {
                self.abort_multi(&session.id, &started, true).await;
                return Err(err);
            }

            let primary_name = profile
                .get_primary_container()
                .map(|c| c.name)
                .unwrap_or_else(|| started[0].name.clone());
            let primary = started
                .iter()
                .find(|info| info.name == primary_name)
                .unwrap_or(&started[0]);
            let primary_endpoint = primary.endpoint.clone().ok_or_else(|| {
                BayError::Internal(anyhow!("primary container started without an endpoint"))
            })?;

            let descriptors: Vec<ContainerDescriptor> = started.iter().map(to_descriptor).collect();
            self.db
                .mark_session_running(
                    &session.id,
                    &primary.container_id,
                    &primary_endpoint,
                    Some(&descriptors),
                )
                .await?;

            info!(
                session_id = %session.id,
                containers = ?started.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
                primary = %primary.name,
                "session multi-container started"
            );

            session.container_id = Some(primary.container_id.clone());
            session.endpoint = Some(primary_endpoint);
            session.containers = Some(descriptors);
            session.observed_state = SessionState::Running;
        }

        Ok(session)
    }

    /// Best-effort rollback of a failed multi-container startup: destroy
    /// whatever exists, remove the session network, mark the session failed.
    async fn abort_multi(&self, session_id: &str, infos: &[MultiContainerInfo], network: bool) {
        if !infos.is_empty() {
            if let Err(err) = self.driver.destroy_multi(infos).await {
                warn!(session_id = %session_id, error = %err, "multi rollback destroy failed");
            }
        }
        if network {
            if let Err(err) = self.driver.remove_session_network(session_id).await {
                warn!(session_id = %session_id, error = %err, "multi rollback network removal failed");
            }
        }
        if let Err(err) = self
            .db
            .clear_session_runtime(session_id, SessionState::Failed)
            .await
        {
            warn!(session_id = %session_id, error = %err, "multi rollback catalog update failed");
        }
    }

    /// Polls one runtime's health endpoint until ready. `browser` runtimes
    /// must additionally report `browser_ready=true`; images predating the
    /// field count as ready.
    async fn wait_for_ready(
        &self,
        endpoint: &str,
        health_path: &str,
        runtime_type: &str,
        session_id: &str,
    ) -> BayResult<()> {
        let url = format!("{}{}", endpoint.trim_end_matches('/'), health_path);
        let start = tokio::time::Instant::now();
        let mut interval = self.readiness.initial_interval;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            if self.probe_health(&url, runtime_type).await {
                info!(
                    session_id = %session_id,
                    attempts = attempt,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "session runtime ready"
                );
                return Ok(());
            }

            let elapsed = start.elapsed();
            if elapsed >= self.readiness.budget {
                break;
            }
            tokio::time::sleep(interval.min(self.readiness.budget - elapsed)).await;
            interval = next_interval(interval, &self.readiness);
        }

        error!(
            session_id = %session_id,
            endpoint = %endpoint,
            attempts = attempt,
            "session runtime not ready within budget"
        );
        Err(readiness_expired(self.readiness.budget))
    }

    /// Waits for every container of a multi-container session.
    async fn wait_for_multi_ready(
        &self,
        infos: &[MultiContainerInfo],
        profile: &Profile,
        session_id: &str,
    ) -> BayResult<()> {
        let health_paths: BTreeMap<String, String> = profile
            .get_containers()
            .into_iter()
            .map(|spec| (spec.name, spec.health_check_path))
            .collect();

        let mut pending: BTreeMap<String, &MultiContainerInfo> =
            infos.iter().map(|info| (info.name.clone(), info)).collect();

        let start = tokio::time::Instant::now();
        let mut interval = self.readiness.initial_interval;
        let mut attempt = 0u32;

        while !pending.is_empty() {
            attempt += 1;
            let mut newly_ready: Vec<String> = Vec::new();

            for (name, info) in &pending {
                let Some(endpoint) = &info.endpoint else {
                    continue;
                };
                let path = health_paths
                    .get(name.as_str())
                    .cloned()
                    .unwrap_or_else(|| "/health".to_string());
                let url = format!("{}{}", endpoint.trim_end_matches('/'), path);
                if self.probe_health(&url, &info.runtime_type).await {
                    newly_ready.push(name.clone());
                }
            }

            for name in newly_ready {
                pending.remove(&name);
            }

            if pending.is_empty() {
                info!(
                    session_id = %session_id,
                    attempts = attempt,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "session all containers ready"
                );
                return Ok(());
            }

            let elapsed = start.elapsed();
            if elapsed >= self.readiness.budget {
                break;
            }
            tokio::time::sleep(interval.min(self.readiness.budget - elapsed)).await;
            interval = next_interval(interval, &self.readiness);
        }

        error!(
            session_id = %session_id,
            pending = ?pending.keys().collect::<Vec<_>>(),
            attempts = attempt,
            "session containers not ready within budget"
        );
        Err(readiness_expired(self.readiness.budget))
    }

    /// One health probe. 200 means ready; browser runtimes must also carry
    /// `browser_ready=true` in the JSON body (absent field counts as true).
    async fn probe_health(&self, url: &str, runtime_type: &str) -> bool {
        let response = match self
            .http
            .inner()
            .get(url)
            .timeout(HEALTH_PROBE_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => response,
            Err(_) => return false,
        };

        if response.status() != reqwest::StatusCode::OK {
            return false;
        }

        if runtime_type == "browser" {
            match response.json::<serde_json::Value>().await {
                Ok(body) => body
                    .get("browser_ready")
                    .and_then(serde_json::Value::as_bool)
                    .unwrap_or(true),
                Err(_) => true,
            }
        } else {
            true
        }
    }

    /// Stops a session, reclaiming compute. Multi-container sessions stop
    /// every container and remove the session network (network errors are
    /// swallowed).
    pub async fn stop(&self, session: &SessionRecord) -> BayResult<()> {
        info!(
            session_id = %session.id,
            is_multi = session.is_multi_container(),
            "session stop"
        );

        self.db
            .update_session_states(&session.id, SessionState::Stopped, SessionState::Stopping)
            .await?;

        if let Some(descriptors) = session
            .containers
            .as_ref()
            .filter(|_| session.is_multi_container())
        {
            let infos: Vec<MultiContainerInfo> = descriptors.iter().map(to_info).collect();
            self.driver.stop_multi(&infos).await?;
            if let Err(err) = self.driver.remove_session_network(&session.id).await {
                warn!(session_id = %session.id, error = %err, "session stop network removal failed");
            }
        } else if let Some(container_id) = &session.container_id {
            self.driver.stop(container_id).await?;
        }

        self.db.mark_session_stopped(&session.id).await?;
        Ok(())
    }

    /// Destroys a session completely: containers, network, catalog row.
    pub async fn destroy(&self, session: &SessionRecord) -> BayResult<()> {
        info!(
            session_id = %session.id,
            is_multi = session.is_multi_container(),
            "session destroy"
        );

        if let Some(descriptors) = session
            .containers
            .as_ref()
            .filter(|_| session.is_multi_container())
        {
            let infos: Vec<MultiContainerInfo> = descriptors.iter().map(to_info).collect();
            self.driver.destroy_multi(&infos).await?;
            if let Err(err) = self.driver.remove_session_network(&session.id).await {
                warn!(session_id = %session.id, error = %err, "session destroy network removal failed");
            }
        } else if let Some(container_id) = &session.container_id {
            self.driver.destroy(container_id).await?;
        }

        self.db.delete_session(&session.id).await?;
        Ok(())
    }

    /// Refreshes observed state from the driver. Multi-container sessions
    /// with a dead secondary are marked degraded.
    pub async fn refresh_status(
        &self,
        session: SessionRecord,
        profile: Option<&Profile>,
    ) -> BayResult<SessionRecord> {
        let Some(container_id) = session.container_id.clone() else {
            return Ok(session);
        };

        let runtime_port = profile
            .and_then(Profile::get_primary_container)
            .map(|c| c.runtime_port);
        let info = self.driver.status(&container_id, runtime_port).await?;

        let (mut observed, endpoint, clear_container) = match info.status {
            ContainerStatus::Running => (SessionState::Running, info.endpoint, false),
            ContainerStatus::Created => (SessionState::Pending, None, false),
            ContainerStatus::Exited | ContainerStatus::Removing => {
                (SessionState::Stopped, None, false)
            }
            ContainerStatus::NotFound => (SessionState::Stopped, None, true),
        };

        if observed == SessionState::Running && session.is_multi_container() {
            if let Some(descriptors) = &session.containers {
                for descriptor in descriptors {
                    let status = self.driver.status(&descriptor.container_id, None).await?;
                    if status.status != ContainerStatus::Running {
                        debug!(
                            session_id = %session.id,
                            container = %descriptor.name,
                            "secondary container not running, session degraded"
                        );
                        observed = SessionState::Degraded;
                        break;
                    }
                }
            }
        }

        self.db
            .update_session_observed(&session.id, observed, endpoint.as_deref(), clear_container)
            .await?;

        Ok(self
            .db
            .fetch_session(&session.id)
            .await?
            .unwrap_or(session))
    }

    /// Probes the primary container before trusting a RUNNING catalog state.
    /// A dead container is destroyed and the session reset to pending for a
    /// rebuild; an unreachable driver keeps the catalog state authoritative.
    async fn probe_and_recover_if_dead(
        &self,
        mut session: SessionRecord,
        profile: &Profile,
    ) -> BayResult<SessionRecord> {
        let Some(container_id) = session.container_id.clone() else {
            return Ok(session);
        };

        let runtime_port = profile.get_primary_container().map(|c| c.runtime_port);
        let info = match self.driver.status(&container_id, runtime_port).await {
            Ok(info) => info,
            Err(err) => {
                warn!(
                    session_id = %session.id,
                    container_id = %container_id,
                    error = %err,
                    "session probe failed, trusting catalog state"
                );
                return Ok(session);
            }
        };

        if info.status == ContainerStatus::Running {
            return Ok(session);
        }

        warn!(
            session_id = %session.id,
            container_id = %container_id,
            container_status = info.status.as_str(),
            "session container dead, recovering"
        );

        if let Err(err) = self.driver.destroy(&container_id).await {
            debug!(
                session_id = %session.id,
                container_id = %container_id,
                error = %err,
                "dead container destroy failed"
            );
        }

        self.db
            .clear_session_runtime(&session.id, SessionState::Pending)
            .await?;
        session.container_id = None;
        session.endpoint = None;
        session.containers = None;
        session.observed_state = SessionState::Pending;

        info!(
            session_id = %session.id,
            old_container_id = %container_id,
            "session recovered from dead container"
        );
        Ok(session)
    }
}

fn next_interval(current: Duration, cfg: &ReadinessConfig) -> Duration {
    Duration::from_secs_f64(
        (current.as_secs_f64() * cfg.backoff_factor).min(cfg.max_interval.as_secs_f64()),
    )
}

fn readiness_expired(budget: Duration) -> BayError {
    BayError::Driver(bay_driver::DriverError::Startup {
        driver: "runtime",
        message: format!("runtime not ready within {}s", budget.as_secs()),
    })
}
