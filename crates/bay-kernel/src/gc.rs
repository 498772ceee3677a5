//! Background garbage collector.
//!
//! Four tasks per cycle: idle-session reclamation, expired-sandbox
//! deletion, orphan-container reaping (strict instance-id fence), and
//! orphan-workspace reaping. All sandbox mutations go through the same
//! per-sandbox locks the synchronous handlers use, so GC and a concurrent
//! `delete` cannot race: whichever takes the lock first wins, the loser
//! observes the result and no-ops. Every task is idempotent; a partially
//! completed cycle re-converges on the next one.

use std::sync::Arc;

use bay_db::Database;
use bay_driver::{labels, labels::LabelMap, Driver};
use chrono::{Duration, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::GcConfig;
use crate::error::BayResult;
use crate::sandbox::SandboxManager;

/// Per-task cleanup counts for one cycle.
#[derive(Debug, Default, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct GcReport {
    pub idle_sessions: usize,
    pub expired_sandboxes: usize,
    pub orphan_containers: usize,
    pub orphan_workspaces: usize,
}

#[derive(Clone)]
pub struct GarbageCollector {
    db: Database,
    driver: Arc<dyn Driver>,
    sandboxes: SandboxManager,
    cfg: GcConfig,
}

impl GarbageCollector {
    pub fn new(
        db: Database,
        driver: Arc<dyn Driver>,
        sandboxes: SandboxManager,
        cfg: GcConfig,
    ) -> Self {
        Self {
            db,
            driver,
            sandboxes,
            cfg,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.cfg.instance_id
    }

    /// Runs the periodic loop until the shutdown channel flips.
    pub async fn run_loop(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            instance_id = %self.cfg.instance_id,
            interval_secs = self.cfg.interval.as_secs(),
            "gc loop started"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("gc loop shutting down");
                        return;
                    }
                }
                _ = tokio::time::sleep(self.cfg.interval) => {
                    let report = self.run_cycle().await;
                    debug!(
                        idle_sessions = report.idle_sessions,
                        expired_sandboxes = report.expired_sandboxes,
                        orphan_containers = report.orphan_containers,
                        orphan_workspaces = report.orphan_workspaces,
                        "gc cycle complete"
                    );
                }
            }
        }
    }

    /// Runs one full cycle. Task failures are logged, never fatal; the
    /// process keeps serving other sandboxes even when one is broken.
    pub async fn run_cycle(&self) -> GcReport {
        let mut report = GcReport::default();

        if self.cfg.idle_session_enabled {
            report.idle_sessions = self
                .collect_idle_sessions()
                .await
                .unwrap_or_else(|err| {
                    warn!(error = %err, "idle-session gc failed");
                    0
                });
        }
        if self.cfg.expired_sandbox_enabled {
            report.expired_sandboxes = self
                .collect_expired_sandboxes()
                .await
                .unwrap_or_else(|err| {
                    warn!(error = %err, "expired-sandbox gc failed");
                    0
                });
        }
        if self.cfg.orphan_container_enabled {
            report.orphan_containers = self
                .collect_orphan_containers()
                .await
                .unwrap_or_else(|err| {
                    warn!(error = %err, "orphan-container gc failed");
                    0
                });
        }
        if self.cfg.orphan_workspace_enabled {
            report.orphan_workspaces = self
                .collect_orphan_workspaces()
                .await
                .unwrap_or_else(|err| {
                    warn!(error = %err, "orphan-workspace gc failed");
                    0
                });
        }

        report
    }

    /// Task 1: sandboxes past their idle deadline lose their session but
    /// keep the cargo; the next capability call rebuilds compute.
    async fn collect_idle_sessions(&self) -> BayResult<usize> {
        let candidates = self.db.list_idle_expired(Utc::now()).await?;
        let mut cleaned = 0;

        for sandbox in candidates {
            match self.sandboxes.stop(&sandbox).await {
                Ok(()) => {
                    info!(sandbox_id = %sandbox.id, "gc reclaimed idle session");
                    cleaned += 1;
                }
                Err(err) => {
                    warn!(sandbox_id = %sandbox.id, error = %err, "gc idle-session stop failed");
                }
            }
        }

        Ok(cleaned)
    }

    /// Task 2: sandboxes past their absolute TTL go through the full delete
    /// path (sessions destroyed, row soft-deleted, managed cargo cascaded).
    async fn collect_expired_sandboxes(&self) -> BayResult<usize> {
        let candidates = self.db.list_ttl_expired(Utc::now()).await?;
        let mut cleaned = 0;

        for sandbox in candidates {
            match self.sandboxes.delete(&sandbox).await {
                Ok(()) => {
                    info!(sandbox_id = %sandbox.id, "gc deleted expired sandbox");
                    cleaned += 1;
                }
                Err(err) => {
                    warn!(sandbox_id = %sandbox.id, error = %err, "gc expired-sandbox delete failed");
                }
            }
        }

        Ok(cleaned)
    }

    /// Task 3: labelled containers with no live session row are destroyed —
    /// strictly limited to resources carrying this process's fence token.
    /// Containers with a different instance id belong to another Bay
    /// process, or to no Bay at all, and are never touched.
    async fn collect_orphan_containers(&self) -> BayResult<usize> {
        let mut filter = LabelMap::new();
        filter.insert(
            labels::MANAGED.to_string(),
            labels::MANAGED_TRUE.to_string(),
        );
        filter.insert(
            labels::INSTANCE_ID.to_string(),
            self.cfg.instance_id.clone(),
        );

        let instances = self.driver.list_runtime_instances(&filter).await?;
        let mut cleaned = 0;

        for instance in instances {
            // The filter already narrowed the listing; re-verify the trust
            // predicate against the instance's own labels before deleting.
            if !labels::is_trusted(&instance.labels, &self.cfg.instance_id) {
                continue;
            }

            let live = match labels::session_id(&instance.labels) {
                Some(session_id) => self.db.session_exists(session_id).await?,
                None => false,
            };
            if live {
                continue;
            }

            match self.driver.destroy_runtime_instance(&instance.id).await {
                Ok(()) => {
                    info!(
                        instance_id = %instance.id,
                        name = %instance.name,
                        "gc destroyed orphan container"
                    );
                    cleaned += 1;
                }
                Err(err) => {
                    warn!(instance_id = %instance.id, error = %err, "gc orphan-container destroy failed");
                }
            }
        }

        Ok(cleaned)
    }

    /// Task 4: managed cargos with no owning sandbox, older than the grace
    /// period, lose their volume and row.
    async fn collect_orphan_workspaces(&self) -> BayResult<usize> {
        let grace = Duration::from_std(self.cfg.workspace_grace)
            .unwrap_or_else(|_| Duration::seconds(300));
        let cutoff = Utc::now() - grace;

        let orphans = self.db.list_orphan_cargos(cutoff).await?;
        let mut cleaned = 0;

        for cargo in orphans {
            if let Err(err) = self.driver.delete_volume(&cargo.driver_ref).await {
                // Leave the row so the next cycle retries.
                warn!(cargo_id = %cargo.id, error = %err, "gc orphan-workspace volume delete failed");
                continue;
            }
            match self.db.delete_cargo(&cargo.id).await {
                Ok(()) => {
                    info!(cargo_id = %cargo.id, "gc deleted orphan workspace");
                    cleaned += 1;
                }
                Err(err) => {
                    warn!(cargo_id = %cargo.id, error = %err, "gc orphan-workspace row delete failed");
                }
            }
        }

        Ok(cleaned)
    }
}
