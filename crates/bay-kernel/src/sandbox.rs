//! Sandbox manager: the user-facing lifecycle authority.
//!
//! Every state-mutating method acquires the per-sandbox lock, then reloads
//! the row inside a fresh transaction (row-locked on engines that support
//! `FOR UPDATE`), mutates, and commits. Handlers never hold a long-lived
//! transaction; beginning fresh inside the critical section is what defeats
//! stale-snapshot reads.

use std::sync::Arc;

use anyhow::anyhow;
use bay_db::{
    Database, NewSandbox, NewSession, SandboxRecord, SandboxStatus, SessionRecord,
};
use bay_driver::{Driver, Profile};
use chrono::{Duration, Utc};
use tracing::info;

use crate::cargo::CargoManager;
use crate::config::ProfileRegistry;
use crate::error::{BayError, BayResult};
use crate::http::RuntimeClient;
use crate::locks::LockRegistry;
use crate::session::{ReadinessConfig, SessionManager};

/// One row of a status-filtered listing: the record plus its computed
/// status at scan time.
#[derive(Debug, Clone)]
pub struct SandboxListItem {
    pub sandbox: SandboxRecord,
    pub status: SandboxStatus,
}

#[derive(Clone)]
pub struct SandboxManager {
    db: Database,
    profiles: Arc<ProfileRegistry>,
    locks: Arc<LockRegistry>,
    cargo_mgr: CargoManager,
    session_mgr: SessionManager,
}

impl SandboxManager {
    pub fn new(
        driver: Arc<dyn Driver>,
        db: Database,
        profiles: Arc<ProfileRegistry>,
        locks: Arc<LockRegistry>,
        http: RuntimeClient,
    ) -> Self {
        let cargo_mgr = CargoManager::new(Arc::clone(&driver), db.clone());
        let session_mgr = SessionManager::new(driver, db.clone(), http);
        Self {
            db,
            profiles,
            locks,
            cargo_mgr,
            session_mgr,
        }
    }

    /// Overrides the readiness schedule on the inner session manager.
    pub fn with_readiness(mut self, readiness: ReadinessConfig) -> Self {
        self.session_mgr = self.session_mgr.with_readiness(readiness);
        self
    }

    pub fn session_manager(&self) -> &SessionManager {
        &self.session_mgr
    }

    pub fn cargo_manager(&self) -> &CargoManager {
        &self.cargo_mgr
    }

    pub fn profiles(&self) -> &ProfileRegistry {
        &self.profiles
    }

    /// Creates a sandbox: validates the profile, binds or creates the cargo,
    /// computes the absolute expiry.
    pub async fn create(
        &self,
        owner: &str,
        profile_id: &str,
        cargo_id: Option<&str>,
        ttl: Option<i64>,
    ) -> BayResult<SandboxRecord> {
        if self.profiles.get(profile_id).is_none() {
            return Err(BayError::Validation(format!("invalid profile: {profile_id}")));
        }

        let sandbox_id = bay_db::short_id("sandbox");
        info!(
            sandbox_id = %sandbox_id,
            owner = %owner,
            profile_id = %profile_id,
            "sandbox create"
        );

        let cargo = match cargo_id {
            // External cargo: must exist and belong to the caller.
            Some(id) => self.cargo_mgr.get(id, owner).await?,
            None => {
                self.cargo_mgr
                    .create(owner, true, Some(&sandbox_id))
                    .await?
            }
        };

        let expires_at = ttl
            .filter(|t| *t > 0)
            .map(|t| Utc::now() + Duration::seconds(t));

        Ok(self
            .db
            .create_sandbox(NewSandbox {
                id: &sandbox_id,
                owner,
                profile_id,
                cargo_id: &cargo.id,
                expires_at,
            })
            .await?)
    }

    /// Owner-scoped lookup; soft-deleted sandboxes are invisible.
    pub async fn get(&self, sandbox_id: &str, owner: &str) -> BayResult<SandboxRecord> {
        self.db
            .fetch_sandbox_owned(sandbox_id, owner)
            .await?
            .ok_or_else(|| BayError::NotFound(format!("sandbox not found: {sandbox_id}")))
    }

    /// Lookup plus the computed status from the current session snapshot.
    pub async fn get_with_status(
        &self,
        sandbox_id: &str,
        owner: &str,
    ) -> BayResult<(SandboxRecord, SandboxStatus)> {
        let sandbox = self.get(sandbox_id, owner).await?;
        let session = self.get_current_session(&sandbox).await?;
        let status = sandbox.compute_status(Utc::now(), session.as_ref());
        Ok((sandbox, status))
    }

    pub async fn get_current_session(
        &self,
        sandbox: &SandboxRecord,
    ) -> BayResult<Option<SessionRecord>> {
        match &sandbox.current_session_id {
            Some(session_id) => self.session_mgr.get(session_id).await,
            None => Ok(None),
        }
    }

    /// Lists sandboxes by ascending id with an optional status filter.
    ///
    /// Status is computed, not stored, so the scan is bounded: batches of
    /// `clamp(limit*5, 50, 500)` rows, at most `max(limit*20, 1000)` rows per
    /// call. Hitting the cap returns a continuation cursor pointing at the
    /// last scanned id even if fewer than `limit` rows matched.
    pub async fn list(
        &self,
        owner: &str,
        status: Option<SandboxStatus>,
        limit: usize,
        cursor: Option<&str>,
    ) -> BayResult<(Vec<SandboxListItem>, Option<String>)> {
        let now = Utc::now();
        let limit = limit.max(1);
        let scan_batch_size = (limit * 5).clamp(50, 500);
        let max_scanned = (limit * 20).max(1000);

        let mut scan_cursor: Option<String> = cursor.map(str::to_string);
        let mut returned: Vec<SandboxListItem> = Vec::new();
        let mut last_scanned_id: Option<String> = None;
        let mut scanned = 0usize;

        while scanned < max_scanned {
            let batch = self
                .db
                .list_sandbox_batch(owner, scan_cursor.as_deref(), scan_batch_size as i64)
                .await?;
            if batch.is_empty() {
                return Ok((returned, None));
            }

            scanned += batch.len();
            let batch_len = batch.len();
            last_scanned_id = batch.last().map(|sandbox| sandbox.id.clone());

            for sandbox in batch {
                let session = match &sandbox.current_session_id {
                    Some(session_id) => self.db.fetch_session(session_id).await?,
                    None => None,
                };
                let computed = sandbox.compute_status(now, session.as_ref());
                if status.map(|wanted| wanted == computed).unwrap_or(true) {
                    let sandbox_id = sandbox.id.clone();
                    returned.push(SandboxListItem {
                        sandbox,
                        status: computed,
                    });
                    if returned.len() >= limit {
                        // Only hand back a cursor when more rows may follow.
                        let has_more = self.db.sandbox_exists_after(owner, &sandbox_id).await?;
                        return Ok((returned, has_more.then_some(sandbox_id)));
                    }
                }
            }

            scan_cursor = last_scanned_id.clone();
            if batch_len < scan_batch_size {
                return Ok((returned, None));
            }
        }

        // Scan cap reached: a cursor to continue scanning, regardless of
        // how many rows matched.
        Ok((returned, last_scanned_id))
    }

    /// Ensures the sandbox has a running session, creating one if needed.
    /// Refreshes the idle deadline on success.
    pub async fn ensure_running(&self, sandbox: &SandboxRecord) -> BayResult<SessionRecord> {
        let profile = self
            .profiles
            .get(&sandbox.profile_id)
            .cloned()
            .ok_or_else(|| {
                BayError::Validation(format!("invalid profile: {}", sandbox.profile_id))
            })?;
        let sandbox_id = sandbox.id.clone();

        let handle = self.locks.handle(&sandbox_id);
        let _guard = handle.lock().await;

        // Fresh row-locked reload: another request may have linked a session
        // or deleted the sandbox while we waited on the lock.
        let mut tx = self.db.begin().await?;
        let locked = self
            .db
            .fetch_sandbox_for_update(&mut tx, &sandbox_id)
            .await?
            .filter(|sb| sb.deleted_at.is_none())
            .ok_or_else(|| BayError::NotFound(format!("sandbox not found: {sandbox_id}")))?;
        let current_session_id = locked.current_session_id.clone();
        let cargo_id = locked.cargo_id.clone();
        tx.commit().await.map_err(anyhow::Error::from)?;

        let cargo = self
            .cargo_mgr
            .get_by_id(&cargo_id)
            .await?
            .ok_or_else(|| BayError::NotFound(format!("cargo not found: {cargo_id}")))?;

        let session = match &current_session_id {
            Some(session_id) => self.session_mgr.get(session_id).await?,
            None => None,
        };
        let session = match session {
            Some(session) => session,
            None => self.link_new_session(&sandbox_id, &profile).await?,
        };

        let session = self
            .session_mgr
            .ensure_running(session, &cargo, &profile)
            .await?;

        let now = Utc::now();
        self.db
            .touch_sandbox(
                &sandbox_id,
                Some(now + Duration::seconds(profile.idle_timeout as i64)),
                now,
            )
            .await?;

        Ok(session)
    }

    /// Creates a session row and links it as the sandbox's current session
    /// in one transaction, under the row lock.
    async fn link_new_session(
        &self,
        sandbox_id: &str,
        profile: &Profile,
    ) -> BayResult<SessionRecord> {
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

        let mut tx = self.db.begin().await?;
        self.db
            .fetch_sandbox_for_update(&mut tx, sandbox_id)
            .await?
            .filter(|sb| sb.deleted_at.is_none())
            .ok_or_else(|| BayError::NotFound(format!("sandbox not found: {sandbox_id}")))?;
        self.db
            .create_session_tx(
                &mut tx,
                NewSession {
                    id: &session_id,
                    sandbox_id,
                    profile_id: &profile.id,
                    runtime_type: &runtime_type,
                },
            )
            .await?;
        self.db
            .set_current_session_tx(&mut tx, sandbox_id, &session_id)
            .await?;
        tx.commit().await.map_err(anyhow::Error::from)?;

        self.session_mgr
            .get(&session_id)
            .await?
            .ok_or_else(|| BayError::Internal(anyhow!("session vanished after creation")))
    }

    /// Extends the absolute TTL by `extend_by` seconds. The base is
    /// `max(old, now)` so a stale expiry can never extend into the past.
    pub async fn extend_ttl(
        &self,
        sandbox_id: &str,
        owner: &str,
        extend_by: i64,
    ) -> BayResult<SandboxRecord> {
        if extend_by <= 0 {
            return Err(BayError::Validation(
                "extend_by must be a positive integer".to_string(),
            ));
        }

        let handle = self.locks.handle(sandbox_id);
        let _guard = handle.lock().await;

        let mut tx = self.db.begin().await?;
        let locked = self
            .db
            .fetch_sandbox_for_update(&mut tx, sandbox_id)
            .await?
            .filter(|sb| sb.deleted_at.is_none() && sb.owner == owner)
            .ok_or_else(|| BayError::NotFound(format!("sandbox not found: {sandbox_id}")))?;

        let Some(old) = locked.expires_at else {
            return Err(BayError::SandboxTtlInfinite {
                sandbox_id: sandbox_id.to_string(),
            });
        };

        let now = Utc::now();
        if old < now {
            return Err(BayError::SandboxExpired {
                sandbox_id: sandbox_id.to_string(),
                expires_at: old,
            });
        }

        let base = if old > now { old } else { now };
        let new_expiry = base + Duration::seconds(extend_by);
        self.db
            .set_expires_at_tx(&mut tx, sandbox_id, new_expiry)
            .await?;
        tx.commit().await.map_err(anyhow::Error::from)?;

        self.db
            .fetch_sandbox(sandbox_id)
            .await?
            .ok_or_else(|| BayError::Internal(anyhow!("sandbox vanished after TTL extension")))
    }

    /// Refreshes the idle deadline without starting compute.
    pub async fn keepalive(&self, sandbox: &SandboxRecord) -> BayResult<()> {
        info!(sandbox_id = %sandbox.id, "sandbox keepalive");

        let idle_expires_at = self
            .profiles
            .get(&sandbox.profile_id)
            .map(|profile| Utc::now() + Duration::seconds(profile.idle_timeout as i64))
            .or(sandbox.idle_expires_at);

        Ok(self
            .db
            .touch_sandbox(&sandbox.id, idle_expires_at, Utc::now())
            .await?)
    }

    /// Stops the sandbox: reclaims compute, keeps the cargo. Idempotent —
    /// a soft-deleted sandbox is a no-op.
    pub async fn stop(&self, sandbox: &SandboxRecord) -> BayResult<()> {
        let sandbox_id = sandbox.id.clone();
        info!(sandbox_id = %sandbox_id, "sandbox stop");

        let handle = self.locks.handle(&sandbox_id);
        let _guard = handle.lock().await;

        let mut tx = self.db.begin().await?;
        let locked = self.db.fetch_sandbox_for_update(&mut tx, &sandbox_id).await?;
        tx.commit().await.map_err(anyhow::Error::from)?;

        let Some(locked) = locked else {
            return Ok(());
        };
        if locked.deleted_at.is_some() {
            return Ok(());
        }

        for session in self.db.list_sessions_for_sandbox(&sandbox_id).await? {
            self.session_mgr.stop(&session).await?;
        }

        self.db.clear_session_and_idle(&sandbox_id).await?;
        Ok(())
    }

    /// Deletes the sandbox permanently: destroys all sessions, soft-deletes
    /// the row, cascade-deletes a managed cargo. Idempotent.
    pub async fn delete(&self, sandbox: &SandboxRecord) -> BayResult<()> {
        let sandbox_id = sandbox.id.clone();
        info!(sandbox_id = %sandbox_id, "sandbox delete");

        let handle = self.locks.handle(&sandbox_id);
        let _guard = handle.lock().await;

        let mut tx = self.db.begin().await?;
        let locked = self.db.fetch_sandbox_for_update(&mut tx, &sandbox_id).await?;
        tx.commit().await.map_err(anyhow::Error::from)?;

        let Some(locked) = locked else {
            return Ok(());
        };
        if locked.deleted_at.is_some() {
            return Ok(());
        }

        for session in self.db.list_sessions_for_sandbox(&sandbox_id).await? {
            self.session_mgr.destroy(&session).await?;
        }

        let cargo = self.cargo_mgr.get_by_id(&locked.cargo_id).await?;

        self.db.soft_delete_sandbox(&sandbox_id).await?;

        if let Some(cargo) = cargo.filter(|c| c.managed) {
            // Detach before deleting: if the volume delete fails midway, the
            // orphan-workspace GC sees an unowned managed cargo and retries.
            self.db.detach_cargo(&cargo.id).await?;
            self.cargo_mgr.delete(&cargo.id, &locked.owner, true).await?;
        }

        Ok(())
    }
}
