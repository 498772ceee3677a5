//! Bay persistence layer: sandbox, session and cargo catalogs.
//!
//! This crate offers an async API around sqlx's `Any` driver so the same
//! queries run against SQLite (embedded, dev) and PostgreSQL (multi-instance
//! deployments). Row locking with `SELECT ... FOR UPDATE` is applied on
//! PostgreSQL only; on SQLite the per-sandbox process mutex in `bay-kernel`
//! is the effective serializer.

use std::{path::Path, str::FromStr, sync::Once};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use sqlx::{
    any::{AnyPoolOptions, AnyRow},
    migrate::MigrateError,
    Any, AnyPool, Row, Transaction,
};
use thiserror::Error;
use uuid::Uuid;

/// Supported database backends for the persistence layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DatabaseDriver {
    Sqlite,
    Postgres,
}

/// Transaction handle used by the row-locked critical sections.
pub type DbTransaction = Transaction<'static, Any>;

/// Primary entry point to the persistence layer.
#[derive(Clone, Debug)]
pub struct Database {
    pool: AnyPool,
    driver: DatabaseDriver,
}

impl Database {
    /// Establishes (or creates) a connection pool for the given database URL.
    pub async fn connect(database_url: &str) -> Result<Self> {
        static DRIVERS: Once = Once::new();
        DRIVERS.call_once(|| {
            sqlx::any::install_default_drivers();
        });

        let driver = if database_url.starts_with("postgres://")
            || database_url.starts_with("postgresql://")
        {
            DatabaseDriver::Postgres
        } else {
            DatabaseDriver::Sqlite
        };

        let max_connections = match driver {
            DatabaseDriver::Sqlite if database_url.contains(":memory:") => 1,
            _ => 8,
        };

        let pool = AnyPoolOptions::new()
            .min_connections(1)
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        // Run embedded migrations. The directory is resolved relative to this crate.
        let migration_result = match driver {
            DatabaseDriver::Sqlite => sqlx::migrate!("./migrations").run(&pool).await,
            DatabaseDriver::Postgres => sqlx::migrate!("./migrations_postgres").run(&pool).await,
        };
        if let Err(err) = migration_result {
            match &err {
                MigrateError::Execute(sqlx::Error::Database(db_err))
                    if db_err.message().contains("_sqlx_migrations")
                        && db_err
                            .code()
                            .map(|code| matches!(code.as_ref(), "2067" | "1555" | "23505"))
                            .unwrap_or(false) => {}
                _ => return Err(err.into()),
            }
        }

        Ok(Self { pool, driver })
    }

    /// Connects to a file path via `sqlite://` scheme.
    pub async fn connect_file(path: &Path) -> Result<Self> {
        let url = format!("sqlite://{}?mode=rwc", path.display());
        Self::connect(&url).await
    }

    /// Exposes the underlying pool for composed queries (reporting, tests).
    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    /// Returns the configured driver for this database handle.
    pub fn driver(&self) -> DatabaseDriver {
        self.driver
    }

    /// Starts a transaction for a row-locked critical section.
    pub async fn begin(&self) -> Result<DbTransaction> {
        Ok(self.pool.begin().await?)
    }

    // ------------------------------------------------------------------
    // Sandboxes
    // ------------------------------------------------------------------

    /// Registers a new sandbox and returns the persisted record.
    pub async fn create_sandbox(&self, data: NewSandbox<'_>) -> Result<SandboxRecord> {
        let now = Utc::now();
        let now_str = encode_datetime(now);
        let insert = match self.driver {
            DatabaseDriver::Sqlite => {
                r#"
            INSERT INTO sandboxes (
                id, owner, profile_id, cargo_id, current_session_id,
                expires_at, idle_expires_at, last_active_at, created_at, deleted_at
            ) VALUES (?, ?, ?, ?, NULL, ?, NULL, ?, ?, NULL)
            "#
            }
            DatabaseDriver::Postgres => {
                r#"
            INSERT INTO sandboxes (
                id, owner, profile_id, cargo_id, current_session_id,
                expires_at, idle_expires_at, last_active_at, created_at, deleted_at
            ) VALUES ($1, $2, $3, $4, NULL, $5, NULL, $6, $7, NULL)
            "#
            }
        };
        sqlx::query(insert)
            .bind(data.id)
            .bind(data.owner)
            .bind(data.profile_id)
            .bind(data.cargo_id)
            .bind(encode_optional_datetime(data.expires_at))
            .bind(now_str.clone())
            .bind(now_str)
            .execute(&self.pool)
            .await
            .map_err(|err| {
                if is_unique_violation(&err) {
                    anyhow::Error::new(CatalogError::DuplicateSandbox(data.id.to_owned()))
                } else {
                    err.into()
                }
            })?;

        self.fetch_sandbox(data.id)
            .await?
            .ok_or_else(|| anyhow!("sandbox inserted but missing when reloaded ({})", data.id))
    }

    /// Retrieves a sandbox by id, including soft-deleted rows.
    pub async fn fetch_sandbox(&self, id: &str) -> Result<Option<SandboxRecord>> {
        let select = match self.driver {
            DatabaseDriver::Sqlite => "SELECT * FROM sandboxes WHERE id = ?",
            DatabaseDriver::Postgres => "SELECT * FROM sandboxes WHERE id = $1",
        };
        let row = sqlx::query(select)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(map_sandbox).transpose()
    }

    /// Retrieves a live (not soft-deleted) sandbox owned by `owner`.
    pub async fn fetch_sandbox_owned(&self, id: &str, owner: &str) -> Result<Option<SandboxRecord>> {
        let select = match self.driver {
            DatabaseDriver::Sqlite => {
                "SELECT * FROM sandboxes WHERE id = ? AND owner = ? AND deleted_at IS NULL"
            }
            DatabaseDriver::Postgres => {
                "SELECT * FROM sandboxes WHERE id = $1 AND owner = $2 AND deleted_at IS NULL"
            }
        };
        let row = sqlx::query(select)
            .bind(id)
            .bind(owner)
            .fetch_optional(&self.pool)
            .await?;
        row.map(map_sandbox).transpose()
    }

    /// Reloads a sandbox row inside a transaction, taking a row lock where the
    /// engine supports it.
    pub async fn fetch_sandbox_for_update(
        &self,
        tx: &mut DbTransaction,
        id: &str,
    ) -> Result<Option<SandboxRecord>> {
        let select = match self.driver {
            DatabaseDriver::Sqlite => "SELECT * FROM sandboxes WHERE id = ?",
            DatabaseDriver::Postgres => "SELECT * FROM sandboxes WHERE id = $1 FOR UPDATE",
        };
        let row = sqlx::query(select)
            .bind(id)
            .fetch_optional(&mut **tx)
            .await?;
        row.map(map_sandbox).transpose()
    }

    /// Scans a batch of live sandboxes for `owner`, ordered by ascending id.
    pub async fn list_sandbox_batch(
        &self,
        owner: &str,
        after: Option<&str>,
        batch: i64,
    ) -> Result<Vec<SandboxRecord>> {
        let query = match (self.driver, after.is_some()) {
            (DatabaseDriver::Sqlite, true) => {
                r#"
            SELECT * FROM sandboxes
            WHERE owner = ? AND deleted_at IS NULL AND id > ?
            ORDER BY id ASC LIMIT ?
            "#
            }
            (DatabaseDriver::Sqlite, false) => {
                r#"
            SELECT * FROM sandboxes
            WHERE owner = ? AND deleted_at IS NULL
            ORDER BY id ASC LIMIT ?
            "#
            }
            (DatabaseDriver::Postgres, true) => {
                r#"
            SELECT * FROM sandboxes
            WHERE owner = $1 AND deleted_at IS NULL AND id > $2
            ORDER BY id ASC LIMIT $3
            "#
            }
            (DatabaseDriver::Postgres, false) => {
                r#"
            SELECT * FROM sandboxes
            WHERE owner = $1 AND deleted_at IS NULL
            ORDER BY id ASC LIMIT $2
            "#
            }
        };

        let mut q = sqlx::query(query).bind(owner);
        if let Some(cursor) = after {
            q = q.bind(cursor);
        }
        let mut rows = q.bind(batch).fetch(&self.pool);

        let mut out = Vec::new();
        while let Some(row) = rows.try_next().await? {
            out.push(map_sandbox(row)?);
        }
        Ok(out)
    }

    /// Returns true if another live sandbox for `owner` sorts after `id`.
    pub async fn sandbox_exists_after(&self, owner: &str, id: &str) -> Result<bool> {
        let select = match self.driver {
            DatabaseDriver::Sqlite => {
                "SELECT id FROM sandboxes WHERE owner = ? AND deleted_at IS NULL AND id > ? ORDER BY id ASC LIMIT 1"
            }
            DatabaseDriver::Postgres => {
                "SELECT id FROM sandboxes WHERE owner = $1 AND deleted_at IS NULL AND id > $2 ORDER BY id ASC LIMIT 1"
            }
        };
        let row = sqlx::query(select)
            .bind(owner)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Points the sandbox at its live session (or clears the pointer).
    pub async fn set_current_session(&self, id: &str, session_id: Option<&str>) -> Result<()> {
        let update = match self.driver {
            DatabaseDriver::Sqlite => "UPDATE sandboxes SET current_session_id = ? WHERE id = ?",
            DatabaseDriver::Postgres => "UPDATE sandboxes SET current_session_id = $1 WHERE id = $2",
        };
        sqlx::query(update)
            .bind(session_id)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Transaction-scoped variant of [`Database::set_current_session`].
    pub async fn set_current_session_tx(
        &self,
        tx: &mut DbTransaction,
        id: &str,
        session_id: &str,
    ) -> Result<()> {
        let update = match self.driver {
            DatabaseDriver::Sqlite => "UPDATE sandboxes SET current_session_id = ? WHERE id = ?",
            DatabaseDriver::Postgres => "UPDATE sandboxes SET current_session_id = $1 WHERE id = $2",
        };
        sqlx::query(update)
            .bind(session_id)
            .bind(id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    /// Refreshes activity bookkeeping after a capability call or keepalive.
    pub async fn touch_sandbox(
        &self,
        id: &str,
        idle_expires_at: Option<DateTime<Utc>>,
        last_active_at: DateTime<Utc>,
    ) -> Result<()> {
        let update = match self.driver {
            DatabaseDriver::Sqlite => {
                "UPDATE sandboxes SET idle_expires_at = ?, last_active_at = ? WHERE id = ?"
            }
            DatabaseDriver::Postgres => {
                "UPDATE sandboxes SET idle_expires_at = $1, last_active_at = $2 WHERE id = $3"
            }
        };
        sqlx::query(update)
            .bind(encode_optional_datetime(idle_expires_at))
            .bind(encode_datetime(last_active_at))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Transaction-scoped TTL update used by extend_ttl.
    pub async fn set_expires_at_tx(
        &self,
        tx: &mut DbTransaction,
        id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        let update = match self.driver {
            DatabaseDriver::Sqlite => "UPDATE sandboxes SET expires_at = ? WHERE id = ?",
            DatabaseDriver::Postgres => "UPDATE sandboxes SET expires_at = $1 WHERE id = $2",
        };
        sqlx::query(update)
            .bind(encode_datetime(expires_at))
            .bind(id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    /// Clears the session pointer and idle deadline (stop / idle GC).
    pub async fn clear_session_and_idle(&self, id: &str) -> Result<()> {
        let update = match self.driver {
            DatabaseDriver::Sqlite => {
                "UPDATE sandboxes SET current_session_id = NULL, idle_expires_at = NULL WHERE id = ?"
            }
            DatabaseDriver::Postgres => {
                "UPDATE sandboxes SET current_session_id = NULL, idle_expires_at = NULL WHERE id = $1"
            }
        };
        sqlx::query(update).bind(id).execute(&self.pool).await?;
        Ok(())
    }

    /// Soft-deletes a sandbox. `deleted_at` is monotonic; callers must check
    /// it is unset before invoking this.
    pub async fn soft_delete_sandbox(&self, id: &str) -> Result<()> {
        let update = match self.driver {
            DatabaseDriver::Sqlite => {
                "UPDATE sandboxes SET deleted_at = ?, current_session_id = NULL WHERE id = ?"
            }
            DatabaseDriver::Postgres => {
                "UPDATE sandboxes SET deleted_at = $1, current_session_id = NULL WHERE id = $2"
            }
        };
        sqlx::query(update)
            .bind(encode_datetime(Utc::now()))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Sandboxes whose idle deadline has passed and that still hold a session.
    pub async fn list_idle_expired(&self, now: DateTime<Utc>) -> Result<Vec<SandboxRecord>> {
        let query = match self.driver {
            DatabaseDriver::Sqlite => {
                r#"
            SELECT * FROM sandboxes
            WHERE deleted_at IS NULL
              AND current_session_id IS NOT NULL
              AND idle_expires_at IS NOT NULL
              AND idle_expires_at < ?
            ORDER BY id ASC
            "#
            }
            DatabaseDriver::Postgres => {
                r#"
            SELECT * FROM sandboxes
            WHERE deleted_at IS NULL
              AND current_session_id IS NOT NULL
              AND idle_expires_at IS NOT NULL
              AND idle_expires_at < $1
            ORDER BY id ASC
            "#
            }
        };
        let mut rows = sqlx::query(query)
            .bind(encode_datetime(now))
            .fetch(&self.pool);

        let mut out = Vec::new();
        while let Some(row) = rows.try_next().await? {
            out.push(map_sandbox(row)?);
        }
        Ok(out)
    }

    /// Sandboxes whose absolute TTL has passed and that are not yet deleted.
    pub async fn list_ttl_expired(&self, now: DateTime<Utc>) -> Result<Vec<SandboxRecord>> {
        let query = match self.driver {
            DatabaseDriver::Sqlite => {
                r#"
            SELECT * FROM sandboxes
            WHERE deleted_at IS NULL
              AND expires_at IS NOT NULL
              AND expires_at < ?
            ORDER BY id ASC
            "#
            }
            DatabaseDriver::Postgres => {
                r#"
            SELECT * FROM sandboxes
            WHERE deleted_at IS NULL
              AND expires_at IS NOT NULL
              AND expires_at < $1
            ORDER BY id ASC
            "#
            }
        };
        let mut rows = sqlx::query(query)
            .bind(encode_datetime(now))
            .fetch(&self.pool);

        let mut out = Vec::new();
        while let Some(row) = rows.try_next().await? {
            out.push(map_sandbox(row)?);
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    /// Creates a session row in `pending`/`pending` state.
    pub async fn create_session(&self, data: NewSession<'_>) -> Result<SessionRecord> {
        let now_str = encode_datetime(Utc::now());
        let insert = match self.driver {
            DatabaseDriver::Sqlite => {
                r#"
            INSERT INTO sessions (
                id, sandbox_id, profile_id, runtime_type,
                desired_state, observed_state, container_id, endpoint, containers,
                created_at, last_active_at, last_observed_at
            ) VALUES (?, ?, ?, ?, ?, ?, NULL, NULL, NULL, ?, ?, NULL)
            "#
            }
            DatabaseDriver::Postgres => {
                r#"
            INSERT INTO sessions (
                id, sandbox_id, profile_id, runtime_type,
                desired_state, observed_state, container_id, endpoint, containers,
                created_at, last_active_at, last_observed_at
            ) VALUES ($1, $2, $3, $4, $5, $6, NULL, NULL, NULL, $7, $8, NULL)
            "#
            }
        };
        sqlx::query(insert)
            .bind(data.id)
            .bind(data.sandbox_id)
            .bind(data.profile_id)
            .bind(data.runtime_type)
            .bind(SessionState::Pending.as_str())
            .bind(SessionState::Pending.as_str())
            .bind(now_str.clone())
            .bind(now_str)
            .execute(&self.pool)
            .await?;

        self.fetch_session(data.id)
            .await?
            .ok_or_else(|| anyhow!("session inserted but missing when reloaded ({})", data.id))
    }

    /// Transaction-scoped session insert, used while the sandbox row lock is
    /// held so the session create and the `current_session_id` link commit
    /// together. On the single-connection SQLite pool this also avoids
    /// acquiring a second connection mid-transaction.
    pub async fn create_session_tx(
        &self,
        tx: &mut DbTransaction,
        data: NewSession<'_>,
    ) -> Result<()> {
        let now_str = encode_datetime(Utc::now());
        let insert = match self.driver {
            DatabaseDriver::Sqlite => {
                r#"
            INSERT INTO sessions (
                id, sandbox_id, profile_id, runtime_type,
                desired_state, observed_state, container_id, endpoint, containers,
                created_at, last_active_at, last_observed_at
            ) VALUES (?, ?, ?, ?, ?, ?, NULL, NULL, NULL, ?, ?, NULL)
            "#
            }
            DatabaseDriver::Postgres => {
                r#"
            INSERT INTO sessions (
                id, sandbox_id, profile_id, runtime_type,
                desired_state, observed_state, container_id, endpoint, containers,
                created_at, last_active_at, last_observed_at
            ) VALUES ($1, $2, $3, $4, $5, $6, NULL, NULL, NULL, $7, $8, NULL)
            "#
            }
        };
        sqlx::query(insert)
            .bind(data.id)
            .bind(data.sandbox_id)
            .bind(data.profile_id)
            .bind(data.runtime_type)
            .bind(SessionState::Pending.as_str())
            .bind(SessionState::Pending.as_str())
            .bind(now_str.clone())
            .bind(now_str)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    /// Retrieves a session by id.
    pub async fn fetch_session(&self, id: &str) -> Result<Option<SessionRecord>> {
        let select = match self.driver {
            DatabaseDriver::Sqlite => "SELECT * FROM sessions WHERE id = ?",
            DatabaseDriver::Postgres => "SELECT * FROM sessions WHERE id = $1",
        };
        let row = sqlx::query(select)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(map_session).transpose()
    }

    /// True when a session row with this id exists. The orphan-container GC
    /// uses this to decide whether a labelled container is still referenced.
    pub async fn session_exists(&self, id: &str) -> Result<bool> {
        Ok(self.fetch_session(id).await?.is_some())
    }

    /// All sessions belonging to one sandbox.
    pub async fn list_sessions_for_sandbox(&self, sandbox_id: &str) -> Result<Vec<SessionRecord>> {
        let query = match self.driver {
            DatabaseDriver::Sqlite => {
                "SELECT * FROM sessions WHERE sandbox_id = ? ORDER BY created_at ASC"
            }
            DatabaseDriver::Postgres => {
                "SELECT * FROM sessions WHERE sandbox_id = $1 ORDER BY created_at ASC"
            }
        };
        let mut rows = sqlx::query(query).bind(sandbox_id).fetch(&self.pool);

        let mut out = Vec::new();
        while let Some(row) = rows.try_next().await? {
            out.push(map_session(row)?);
        }
        Ok(out)
    }

    /// Moves the state pair forward (e.g. pending -> starting).
    pub async fn update_session_states(
        &self,
        id: &str,
        desired: SessionState,
        observed: SessionState,
    ) -> Result<()> {
        let update = match self.driver {
            DatabaseDriver::Sqlite => {
                "UPDATE sessions SET desired_state = ?, observed_state = ?, last_observed_at = ? WHERE id = ?"
            }
            DatabaseDriver::Postgres => {
                "UPDATE sessions SET desired_state = $1, observed_state = $2, last_observed_at = $3 WHERE id = $4"
            }
        };
        sqlx::query(update)
            .bind(desired.as_str())
            .bind(observed.as_str())
            .bind(encode_datetime(Utc::now()))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Records the created container before it is started.
    pub async fn set_session_container(&self, id: &str, container_id: &str) -> Result<()> {
        let update = match self.driver {
            DatabaseDriver::Sqlite => "UPDATE sessions SET container_id = ? WHERE id = ?",
            DatabaseDriver::Postgres => "UPDATE sessions SET container_id = $1 WHERE id = $2",
        };
        sqlx::query(update)
            .bind(container_id)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Persists the running session: primary container, endpoint, and (for
    /// multi-container sessions) the full descriptor list.
    pub async fn mark_session_running(
        &self,
        id: &str,
        container_id: &str,
        endpoint: &str,
        containers: Option<&[ContainerDescriptor]>,
    ) -> Result<()> {
        let containers_json = containers
            .map(|list| serde_json::to_string(list).context("serialize session containers"))
            .transpose()?;
        let update = match self.driver {
            DatabaseDriver::Sqlite => {
                r#"
            UPDATE sessions
            SET container_id = ?, endpoint = ?, containers = ?,
                observed_state = ?, last_observed_at = ?
            WHERE id = ?
            "#
            }
            DatabaseDriver::Postgres => {
                r#"
            UPDATE sessions
            SET container_id = $1, endpoint = $2, containers = $3,
                observed_state = $4, last_observed_at = $5
            WHERE id = $6
            "#
            }
        };
        sqlx::query(update)
            .bind(container_id)
            .bind(endpoint)
            .bind(containers_json)
            .bind(SessionState::Running.as_str())
            .bind(encode_datetime(Utc::now()))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Clears every runtime field and records the given observed state.
    /// Used on startup rollback (`failed`) and dead-container recovery
    /// (`pending`).
    pub async fn clear_session_runtime(&self, id: &str, observed: SessionState) -> Result<()> {
        let update = match self.driver {
            DatabaseDriver::Sqlite => {
                r#"
            UPDATE sessions
            SET container_id = NULL, endpoint = NULL, containers = NULL,
                observed_state = ?, last_observed_at = ?
            WHERE id = ?
            "#
            }
            DatabaseDriver::Postgres => {
                r#"
            UPDATE sessions
            SET container_id = NULL, endpoint = NULL, containers = NULL,
                observed_state = $1, last_observed_at = $2
            WHERE id = $3
            "#
            }
        };
        sqlx::query(update)
            .bind(observed.as_str())
            .bind(encode_datetime(Utc::now()))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Marks the session stopped. The primary container id is retained so a
    /// later ensure_running can restart the same container.
    pub async fn mark_session_stopped(&self, id: &str) -> Result<()> {
        let update = match self.driver {
            DatabaseDriver::Sqlite => {
                r#"
            UPDATE sessions
            SET endpoint = NULL, containers = NULL,
                observed_state = ?, last_observed_at = ?
            WHERE id = ?
            "#
            }
            DatabaseDriver::Postgres => {
                r#"
            UPDATE sessions
            SET endpoint = NULL, containers = NULL,
                observed_state = $1, last_observed_at = $2
            WHERE id = $3
            "#
            }
        };
        sqlx::query(update)
            .bind(SessionState::Stopped.as_str())
            .bind(encode_datetime(Utc::now()))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Writes back a driver-observed state (status refresh path).
    pub async fn update_session_observed(
        &self,
        id: &str,
        observed: SessionState,
        endpoint: Option<&str>,
        clear_container: bool,
    ) -> Result<()> {
        let update = match (self.driver, clear_container) {
            (DatabaseDriver::Sqlite, false) => {
                "UPDATE sessions SET observed_state = ?, endpoint = ?, last_observed_at = ? WHERE id = ?"
            }
            (DatabaseDriver::Sqlite, true) => {
                "UPDATE sessions SET observed_state = ?, endpoint = ?, last_observed_at = ?, container_id = NULL WHERE id = ?"
            }
            (DatabaseDriver::Postgres, false) => {
                "UPDATE sessions SET observed_state = $1, endpoint = $2, last_observed_at = $3 WHERE id = $4"
            }
            (DatabaseDriver::Postgres, true) => {
                "UPDATE sessions SET observed_state = $1, endpoint = $2, last_observed_at = $3, container_id = NULL WHERE id = $4"
            }
        };
        sqlx::query(update)
            .bind(observed.as_str())
            .bind(endpoint)
            .bind(encode_datetime(Utc::now()))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Updates the `last_active_at` timestamp.
    pub async fn touch_session(&self, id: &str) -> Result<()> {
        let update = match self.driver {
            DatabaseDriver::Sqlite => "UPDATE sessions SET last_active_at = ? WHERE id = ?",
            DatabaseDriver::Postgres => "UPDATE sessions SET last_active_at = $1 WHERE id = $2",
        };
        sqlx::query(update)
            .bind(encode_datetime(Utc::now()))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Removes a session row (destroy path).
    pub async fn delete_session(&self, id: &str) -> Result<()> {
        let delete = match self.driver {
            DatabaseDriver::Sqlite => "DELETE FROM sessions WHERE id = ?",
            DatabaseDriver::Postgres => "DELETE FROM sessions WHERE id = $1",
        };
        sqlx::query(delete).bind(id).execute(&self.pool).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Cargos
    // ------------------------------------------------------------------

    /// Registers a workspace volume row and returns the persisted record.
    pub async fn create_cargo(&self, data: NewCargo<'_>) -> Result<CargoRecord> {
        let insert = match self.driver {
            DatabaseDriver::Sqlite => {
                r#"
            INSERT INTO cargos (
                id, owner, driver_ref, managed, managed_by_sandbox_id, created_at
            ) VALUES (?, ?, ?, ?, ?, ?)
            "#
            }
            DatabaseDriver::Postgres => {
                r#"
            INSERT INTO cargos (
                id, owner, driver_ref, managed, managed_by_sandbox_id, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6)
            "#
            }
        };
        let query = sqlx::query(insert)
            .bind(data.id)
            .bind(data.owner)
            .bind(data.driver_ref);
        let query = match self.driver {
            DatabaseDriver::Sqlite => query.bind(data.managed as i64),
            DatabaseDriver::Postgres => query.bind(data.managed),
        };
        query
            .bind(data.managed_by_sandbox_id)
            .bind(encode_datetime(Utc::now()))
            .execute(&self.pool)
            .await?;

        self.fetch_cargo(data.id)
            .await?
            .ok_or_else(|| anyhow!("cargo inserted but missing when reloaded ({})", data.id))
    }

    /// Retrieves a cargo by id.
    pub async fn fetch_cargo(&self, id: &str) -> Result<Option<CargoRecord>> {
        let select = match self.driver {
            DatabaseDriver::Sqlite => "SELECT * FROM cargos WHERE id = ?",
            DatabaseDriver::Postgres => "SELECT * FROM cargos WHERE id = $1",
        };
        let row = sqlx::query(select)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(map_cargo).transpose()
    }

    /// Retrieves a cargo owned by `owner`.
    pub async fn fetch_cargo_owned(&self, id: &str, owner: &str) -> Result<Option<CargoRecord>> {
        let select = match self.driver {
            DatabaseDriver::Sqlite => "SELECT * FROM cargos WHERE id = ? AND owner = ?",
            DatabaseDriver::Postgres => "SELECT * FROM cargos WHERE id = $1 AND owner = $2",
        };
        let row = sqlx::query(select)
            .bind(id)
            .bind(owner)
            .fetch_optional(&self.pool)
            .await?;
        row.map(map_cargo).transpose()
    }

    /// Lists cargos for an owner, ordered by ascending id.
    pub async fn list_cargo_batch(
        &self,
        owner: &str,
        after: Option<&str>,
        limit: i64,
    ) -> Result<Vec<CargoRecord>> {
        let query = match (self.driver, after.is_some()) {
            (DatabaseDriver::Sqlite, true) => {
                "SELECT * FROM cargos WHERE owner = ? AND id > ? ORDER BY id ASC LIMIT ?"
            }
            (DatabaseDriver::Sqlite, false) => {
                "SELECT * FROM cargos WHERE owner = ? ORDER BY id ASC LIMIT ?"
            }
            (DatabaseDriver::Postgres, true) => {
                "SELECT * FROM cargos WHERE owner = $1 AND id > $2 ORDER BY id ASC LIMIT $3"
            }
            (DatabaseDriver::Postgres, false) => {
                "SELECT * FROM cargos WHERE owner = $1 ORDER BY id ASC LIMIT $2"
            }
        };

        let mut q = sqlx::query(query).bind(owner);
        if let Some(cursor) = after {
            q = q.bind(cursor);
        }
        let mut rows = q.bind(limit).fetch(&self.pool);

        let mut out = Vec::new();
        while let Some(row) = rows.try_next().await? {
            out.push(map_cargo(row)?);
        }
        Ok(out)
    }

    /// Detaches a managed cargo from its owning sandbox. Run before the
    /// volume delete so a partially-failed sandbox delete leaves the row
    /// visible to the orphan-workspace GC.
    pub async fn detach_cargo(&self, id: &str) -> Result<()> {
        let update = match self.driver {
            DatabaseDriver::Sqlite => {
                "UPDATE cargos SET managed_by_sandbox_id = NULL WHERE id = ?"
            }
            DatabaseDriver::Postgres => {
                "UPDATE cargos SET managed_by_sandbox_id = NULL WHERE id = $1"
            }
        };
        sqlx::query(update).bind(id).execute(&self.pool).await?;
        Ok(())
    }

    /// Removes a cargo row.
    pub async fn delete_cargo(&self, id: &str) -> Result<()> {
        let delete = match self.driver {
            DatabaseDriver::Sqlite => "DELETE FROM cargos WHERE id = ?",
            DatabaseDriver::Postgres => "DELETE FROM cargos WHERE id = $1",
        };
        sqlx::query(delete).bind(id).execute(&self.pool).await?;
        Ok(())
    }

    /// Managed cargos with no owning sandbox, older than the grace cutoff.
    pub async fn list_orphan_cargos(&self, cutoff: DateTime<Utc>) -> Result<Vec<CargoRecord>> {
        let query = match self.driver {
            DatabaseDriver::Sqlite => {
                r#"
            SELECT * FROM cargos
            WHERE managed = 1 AND managed_by_sandbox_id IS NULL AND created_at < ?
            ORDER BY id ASC
            "#
            }
            DatabaseDriver::Postgres => {
                r#"
            SELECT * FROM cargos
            WHERE managed = TRUE AND managed_by_sandbox_id IS NULL AND created_at < $1
            ORDER BY id ASC
            "#
            }
        };
        let mut rows = sqlx::query(query)
            .bind(encode_datetime(cutoff))
            .fetch(&self.pool);

        let mut out = Vec::new();
        while let Some(row) = rows.try_next().await? {
            out.push(map_cargo(row)?);
        }
        Ok(out)
    }
}

// ----------------------------------------------------------------------
// Row decoding helpers
// ----------------------------------------------------------------------

fn is_unique_violation(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db_err) => {
            if let Some(code) = db_err.code() {
                matches!(code.as_ref(), "2067" | "1555" | "23505")
            } else {
                db_err.message().contains("UNIQUE") || db_err.message().contains("unique")
            }
        }
        _ => false,
    }
}

fn parse_datetime(value: String) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| anyhow!("invalid RFC3339 timestamp '{}': {}", value, err))
}

fn encode_datetime(value: DateTime<Utc>) -> String {
    value.to_rfc3339()
}

fn encode_optional_datetime(value: Option<DateTime<Utc>>) -> Option<String> {
    value.map(encode_datetime)
}

fn decode_datetime(row: &AnyRow, column: &str) -> Result<DateTime<Utc>> {
    let raw: String = row.try_get(column)?;
    parse_datetime(raw)
}

fn decode_optional_datetime(row: &AnyRow, column: &str) -> Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.try_get(column)?;
    raw.map(parse_datetime).transpose()
}

fn decode_optional_string(row: &AnyRow, column: &str) -> Result<Option<String>> {
    Ok(row.try_get::<Option<String>, _>(column)?)
}

fn decode_bool(row: &AnyRow, column: &str) -> Result<bool> {
    match row.try_get::<bool, _>(column) {
        Ok(value) => Ok(value),
        Err(_) => {
            let raw: i64 = row.try_get(column)?;
            Ok(raw != 0)
        }
    }
}

fn map_sandbox(row: AnyRow) -> Result<SandboxRecord> {
    Ok(SandboxRecord {
        id: row.try_get("id")?,
        owner: row.try_get("owner")?,
        profile_id: row.try_get("profile_id")?,
        cargo_id: row.try_get("cargo_id")?,
        current_session_id: decode_optional_string(&row, "current_session_id")?,
        expires_at: decode_optional_datetime(&row, "expires_at")?,
        idle_expires_at: decode_optional_datetime(&row, "idle_expires_at")?,
        last_active_at: decode_datetime(&row, "last_active_at")?,
        created_at: decode_datetime(&row, "created_at")?,
        deleted_at: decode_optional_datetime(&row, "deleted_at")?,
    })
}

fn map_session(row: AnyRow) -> Result<SessionRecord> {
    let desired: String = row.try_get("desired_state")?;
    let observed: String = row.try_get("observed_state")?;
    let containers_json = decode_optional_string(&row, "containers")?;
    let containers = containers_json
        .map(|raw| {
            serde_json::from_str::<Vec<ContainerDescriptor>>(&raw)
                .context("deserialize session containers")
        })
        .transpose()?;

    Ok(SessionRecord {
        id: row.try_get("id")?,
        sandbox_id: row.try_get("sandbox_id")?,
        profile_id: row.try_get("profile_id")?,
        runtime_type: row.try_get("runtime_type")?,
        desired_state: SessionState::from_str(&desired)?,
        observed_state: SessionState::from_str(&observed)?,
        container_id: decode_optional_string(&row, "container_id")?,
        endpoint: decode_optional_string(&row, "endpoint")?,
        containers,
        created_at: decode_datetime(&row, "created_at")?,
        last_active_at: decode_datetime(&row, "last_active_at")?,
        last_observed_at: decode_optional_datetime(&row, "last_observed_at")?,
    })
}

fn map_cargo(row: AnyRow) -> Result<CargoRecord> {
    Ok(CargoRecord {
        id: row.try_get("id")?,
        owner: row.try_get("owner")?,
        driver_ref: row.try_get("driver_ref")?,
        managed: decode_bool(&row, "managed")?,
        managed_by_sandbox_id: decode_optional_string(&row, "managed_by_sandbox_id")?,
        created_at: decode_datetime(&row, "created_at")?,
    })
}

// ----------------------------------------------------------------------
// Records and enums
// ----------------------------------------------------------------------

/// Errors returned by the catalog layer.
#[derive(Debug, Error, Clone)]
pub enum CatalogError {
    #[error("sandbox '{0}' already exists")]
    DuplicateSandbox(String),
}

/// Allocates a prefixed short id (`sandbox-3fa9c1d2e4b7`).
pub fn short_id(prefix: &str) -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("{}-{}", prefix, &hex[..12])
}

/// Input payload for sandbox creation.
#[derive(Debug, Clone)]
pub struct NewSandbox<'a> {
    pub id: &'a str,
    pub owner: &'a str,
    pub profile_id: &'a str,
    pub cargo_id: &'a str,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Input payload for session creation.
#[derive(Debug, Clone)]
pub struct NewSession<'a> {
    pub id: &'a str,
    pub sandbox_id: &'a str,
    pub profile_id: &'a str,
    pub runtime_type: &'a str,
}

/// Input payload for cargo creation.
#[derive(Debug, Clone)]
pub struct NewCargo<'a> {
    pub id: &'a str,
    pub owner: &'a str,
    pub driver_ref: &'a str,
    pub managed: bool,
    pub managed_by_sandbox_id: Option<&'a str>,
}

/// Persisted sandbox row: the user's handle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SandboxRecord {
    pub id: String,
    pub owner: String,
    pub profile_id: String,
    pub cargo_id: String,
    pub current_session_id: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub idle_expires_at: Option<DateTime<Utc>>,
    pub last_active_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl SandboxRecord {
    /// Computes the user-visible status from the row and the session snapshot.
    /// Status is derived, never stored.
    pub fn compute_status(
        &self,
        now: DateTime<Utc>,
        session: Option<&SessionRecord>,
    ) -> SandboxStatus {
        if let Some(expires_at) = self.expires_at {
            if expires_at < now {
                return SandboxStatus::Expired;
            }
        }

        match session {
            None => SandboxStatus::Idle,
            Some(s) => match s.observed_state {
                SessionState::Failed | SessionState::Degraded => SandboxStatus::Failed,
                SessionState::Running => {
                    if s.is_ready() {
                        SandboxStatus::Ready
                    } else {
                        SandboxStatus::Starting
                    }
                }
                SessionState::Pending | SessionState::Starting => SandboxStatus::Starting,
                SessionState::Stopping | SessionState::Stopped => SandboxStatus::Idle,
            },
        }
    }
}

/// One container of a multi-container session, as stored on the session row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContainerDescriptor {
    pub name: String,
    pub container_id: String,
    pub runtime_type: String,
    pub capabilities: Vec<String>,
    pub endpoint: Option<String>,
    pub status: String,
}

impl ContainerDescriptor {
    pub fn is_running(&self) -> bool {
        self.status == "running" && self.endpoint.is_some()
    }
}

/// Persisted session row: one instantiation of compute for a sandbox.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionRecord {
    pub id: String,
    pub sandbox_id: String,
    pub profile_id: String,
    pub runtime_type: String,
    pub desired_state: SessionState,
    pub observed_state: SessionState,
    pub container_id: Option<String>,
    pub endpoint: Option<String>,
    pub containers: Option<Vec<ContainerDescriptor>>,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub last_observed_at: Option<DateTime<Utc>>,
}

impl SessionRecord {
    pub fn is_multi_container(&self) -> bool {
        self.containers.as_ref().map(|c| c.len() > 1).unwrap_or(false)
    }

    /// Ready means observed running with an endpoint; for multi-container
    /// sessions every descriptor must additionally be running with an
    /// endpoint of its own.
    pub fn is_ready(&self) -> bool {
        if self.observed_state != SessionState::Running || self.endpoint.is_none() {
            return false;
        }
        match &self.containers {
            None => true,
            Some(list) => list.iter().all(ContainerDescriptor::is_running),
        }
    }
}

/// Persisted cargo row: the workspace volume backing a sandbox.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CargoRecord {
    pub id: String,
    pub owner: String,
    pub driver_ref: String,
    pub managed: bool,
    pub managed_by_sandbox_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Session lifecycle states. `desired_state` only ever takes
/// `pending`/`running`/`stopped`; `observed_state` uses the full set.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Pending,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
    Degraded,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Pending => "pending",
            SessionState::Starting => "starting",
            SessionState::Running => "running",
            SessionState::Stopping => "stopping",
            SessionState::Stopped => "stopped",
            SessionState::Failed => "failed",
            SessionState::Degraded => "degraded",
        }
    }
}

impl FromStr for SessionState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(SessionState::Pending),
            "starting" => Ok(SessionState::Starting),
            "running" => Ok(SessionState::Running),
            "stopping" => Ok(SessionState::Stopping),
            "stopped" => Ok(SessionState::Stopped),
            "failed" => Ok(SessionState::Failed),
            "degraded" => Ok(SessionState::Degraded),
            other => Err(anyhow!("unknown session state: {}", other)),
        }
    }
}

/// Computed sandbox status surfaced to clients (never stored).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Idle,
    Starting,
    Ready,
    Expired,
    Failed,
}

impl SandboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxStatus::Idle => "idle",
            SandboxStatus::Starting => "starting",
            SandboxStatus::Ready => "ready",
            SandboxStatus::Expired => "expired",
            SandboxStatus::Failed => "failed",
        }
    }
}

impl FromStr for SandboxStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "idle" => Ok(SandboxStatus::Idle),
            "starting" => Ok(SandboxStatus::Starting),
            "ready" => Ok(SandboxStatus::Ready),
            "expired" => Ok(SandboxStatus::Expired),
            "failed" => Ok(SandboxStatus::Failed),
            other => Err(anyhow!("unknown sandbox status: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    const TEST_DB_URL: &str = "sqlite::memory:";

    async fn setup_db() -> Database {
        Database::connect(TEST_DB_URL).await.unwrap()
    }

    async fn seed_sandbox(db: &Database, id: &str, owner: &str) -> SandboxRecord {
        db.create_sandbox(NewSandbox {
            id,
            owner,
            profile_id: "python-default",
            cargo_id: "cargo-000000000000",
            expires_at: None,
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn create_and_fetch_sandbox_roundtrip() {
        let db = setup_db().await;
        let record = seed_sandbox(&db, "sandbox-aaa111bbb222", "owner-a").await;

        assert_eq!(record.owner, "owner-a");
        assert!(record.expires_at.is_none());
        assert!(record.current_session_id.is_none());

        let fetched = db
            .fetch_sandbox("sandbox-aaa111bbb222")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched, record);
    }

    #[tokio::test]
    async fn duplicate_sandbox_ids_are_rejected() {
        let db = setup_db().await;
        seed_sandbox(&db, "sandbox-dup", "owner-a").await;

        let err = db
            .create_sandbox(NewSandbox {
                id: "sandbox-dup",
                owner: "owner-a",
                profile_id: "python-default",
                cargo_id: "cargo-x",
                expires_at: None,
            })
            .await
            .unwrap_err();

        let catalog_err = err.downcast::<CatalogError>().unwrap();
        assert!(matches!(catalog_err, CatalogError::DuplicateSandbox(_)));
    }

    #[tokio::test]
    async fn soft_deleted_sandbox_is_invisible_to_owned_lookup() {
        let db = setup_db().await;
        seed_sandbox(&db, "sandbox-soft", "owner-a").await;

        db.soft_delete_sandbox("sandbox-soft").await.unwrap();

        assert!(db
            .fetch_sandbox_owned("sandbox-soft", "owner-a")
            .await
            .unwrap()
            .is_none());
        // Raw fetch still sees the row, with deleted_at set.
        let raw = db.fetch_sandbox("sandbox-soft").await.unwrap().unwrap();
        assert!(raw.deleted_at.is_some());
        assert!(raw.current_session_id.is_none());
    }

    #[tokio::test]
    async fn owned_lookup_enforces_owner() {
        let db = setup_db().await;
        seed_sandbox(&db, "sandbox-owned", "owner-a").await;

        assert!(db
            .fetch_sandbox_owned("sandbox-owned", "owner-b")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn session_lifecycle_roundtrip() {
        let db = setup_db().await;
        seed_sandbox(&db, "sandbox-s1", "owner-a").await;

        let session = db
            .create_session(NewSession {
                id: "sess-000000000001",
                sandbox_id: "sandbox-s1",
                profile_id: "python-default",
                runtime_type: "ship",
            })
            .await
            .unwrap();
        assert_eq!(session.desired_state, SessionState::Pending);
        assert_eq!(session.observed_state, SessionState::Pending);
        assert!(!session.is_ready());

        db.update_session_states(&session.id, SessionState::Running, SessionState::Starting)
            .await
            .unwrap();
        db.set_session_container(&session.id, "cid-1").await.unwrap();
        db.mark_session_running(&session.id, "cid-1", "http://10.0.0.2:8123", None)
            .await
            .unwrap();

        let running = db.fetch_session(&session.id).await.unwrap().unwrap();
        assert!(running.is_ready());
        assert_eq!(running.container_id.as_deref(), Some("cid-1"));
        assert_eq!(running.endpoint.as_deref(), Some("http://10.0.0.2:8123"));

        db.mark_session_stopped(&session.id).await.unwrap();
        let stopped = db.fetch_session(&session.id).await.unwrap().unwrap();
        assert_eq!(stopped.observed_state, SessionState::Stopped);
        assert!(stopped.endpoint.is_none());
        // Container id survives stop so the container can be restarted.
        assert_eq!(stopped.container_id.as_deref(), Some("cid-1"));

        db.delete_session(&session.id).await.unwrap();
        assert!(db.fetch_session(&session.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn multi_container_descriptors_roundtrip() {
        let db = setup_db().await;
        seed_sandbox(&db, "sandbox-multi", "owner-a").await;
        let session = db
            .create_session(NewSession {
                id: "sess-multi000001",
                sandbox_id: "sandbox-multi",
                profile_id: "browser-python",
                runtime_type: "ship",
            })
            .await
            .unwrap();

        let descriptors = vec![
            ContainerDescriptor {
                name: "ship".into(),
                container_id: "cid-ship".into(),
                runtime_type: "ship".into(),
                capabilities: vec!["python".into(), "filesystem".into()],
                endpoint: Some("http://10.0.0.2:8123".into()),
                status: "running".into(),
            },
            ContainerDescriptor {
                name: "browser".into(),
                container_id: "cid-browser".into(),
                runtime_type: "browser".into(),
                capabilities: vec!["browser".into()],
                endpoint: Some("http://10.0.0.3:8080".into()),
                status: "running".into(),
            },
        ];

        db.mark_session_running(&session.id, "cid-ship", "http://10.0.0.2:8123", Some(&descriptors))
            .await
            .unwrap();

        let loaded = db.fetch_session(&session.id).await.unwrap().unwrap();
        assert!(loaded.is_multi_container());
        assert!(loaded.is_ready());
        assert_eq!(loaded.containers.unwrap(), descriptors);

        db.clear_session_runtime(&session.id, SessionState::Failed)
            .await
            .unwrap();
        let failed = db.fetch_session(&session.id).await.unwrap().unwrap();
        assert_eq!(failed.observed_state, SessionState::Failed);
        assert!(failed.container_id.is_none());
        assert!(failed.containers.is_none());
    }

    #[tokio::test]
    async fn gc_scan_queries_filter_correctly() {
        let db = setup_db().await;
        let now = Utc::now();

        // Idle-expired with a session.
        seed_sandbox(&db, "sandbox-idle", "owner-a").await;
        db.create_session(NewSession {
            id: "sess-idle0000001",
            sandbox_id: "sandbox-idle",
            profile_id: "python-default",
            runtime_type: "ship",
        })
        .await
        .unwrap();
        db.set_current_session("sandbox-idle", Some("sess-idle0000001"))
            .await
            .unwrap();
        db.touch_sandbox("sandbox-idle", Some(now - Duration::seconds(30)), now)
            .await
            .unwrap();

        // Idle-expired but no session: not an idle-GC candidate.
        seed_sandbox(&db, "sandbox-noses", "owner-a").await;
        db.touch_sandbox("sandbox-noses", Some(now - Duration::seconds(30)), now)
            .await
            .unwrap();

        let idle = db.list_idle_expired(now).await.unwrap();
        assert_eq!(idle.len(), 1);
        assert_eq!(idle[0].id, "sandbox-idle");

        // TTL-expired.
        db.create_sandbox(NewSandbox {
            id: "sandbox-ttl",
            owner: "owner-a",
            profile_id: "python-default",
            cargo_id: "cargo-t",
            expires_at: Some(now - Duration::seconds(5)),
        })
        .await
        .unwrap();

        let expired = db.list_ttl_expired(now).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, "sandbox-ttl");

        // Soft-deleted rows drop out of both scans.
        db.soft_delete_sandbox("sandbox-ttl").await.unwrap();
        assert!(db.list_ttl_expired(now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cargo_roundtrip_and_orphan_scan() {
        let db = setup_db().await;

        db.create_cargo(NewCargo {
            id: "cargo-managed01",
            owner: "owner-a",
            driver_ref: "bay-cargo-managed01",
            managed: true,
            managed_by_sandbox_id: Some("sandbox-x"),
        })
        .await
        .unwrap();
        db.create_cargo(NewCargo {
            id: "cargo-external1",
            owner: "owner-a",
            driver_ref: "bay-cargo-external1",
            managed: false,
            managed_by_sandbox_id: None,
        })
        .await
        .unwrap();

        let cargo = db.fetch_cargo_owned("cargo-managed01", "owner-a").await.unwrap().unwrap();
        assert!(cargo.managed);
        assert_eq!(cargo.managed_by_sandbox_id.as_deref(), Some("sandbox-x"));

        // Attached managed cargo is not an orphan; external never is.
        let cutoff = Utc::now() + Duration::seconds(60);
        assert!(db.list_orphan_cargos(cutoff).await.unwrap().is_empty());

        db.detach_cargo("cargo-managed01").await.unwrap();
        let orphans = db.list_orphan_cargos(cutoff).await.unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].id, "cargo-managed01");

        db.delete_cargo("cargo-managed01").await.unwrap();
        assert!(db.fetch_cargo("cargo-managed01").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sandbox_batch_scan_pages_by_id() {
        let db = setup_db().await;
        for i in 0..5 {
            seed_sandbox(&db, &format!("sandbox-page{:02}", i), "owner-a").await;
        }
        seed_sandbox(&db, "sandbox-other", "owner-b").await;

        let first = db.list_sandbox_batch("owner-a", None, 2).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].id, "sandbox-page00");

        let rest = db
            .list_sandbox_batch("owner-a", Some(&first[1].id), 10)
            .await
            .unwrap();
        assert_eq!(rest.len(), 3);
        assert!(db
            .sandbox_exists_after("owner-a", "sandbox-page03")
            .await
            .unwrap());
        assert!(!db
            .sandbox_exists_after("owner-a", "sandbox-page04")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn compute_status_matrix() {
        let now = Utc::now();
        let sandbox = SandboxRecord {
            id: "sandbox-st".into(),
            owner: "o".into(),
            profile_id: "p".into(),
            cargo_id: "c".into(),
            current_session_id: None,
            expires_at: None,
            idle_expires_at: None,
            last_active_at: now,
            created_at: now,
            deleted_at: None,
        };

        assert_eq!(sandbox.compute_status(now, None), SandboxStatus::Idle);

        let mut expired = sandbox.clone();
        expired.expires_at = Some(now - Duration::seconds(1));
        assert_eq!(expired.compute_status(now, None), SandboxStatus::Expired);

        let mut session = SessionRecord {
            id: "sess-st".into(),
            sandbox_id: "sandbox-st".into(),
            profile_id: "p".into(),
            runtime_type: "ship".into(),
            desired_state: SessionState::Running,
            observed_state: SessionState::Starting,
            container_id: None,
            endpoint: None,
            containers: None,
            created_at: now,
            last_active_at: now,
            last_observed_at: None,
        };
        assert_eq!(
            sandbox.compute_status(now, Some(&session)),
            SandboxStatus::Starting
        );

        session.observed_state = SessionState::Running;
        session.endpoint = Some("http://10.0.0.2:8123".into());
        assert_eq!(
            sandbox.compute_status(now, Some(&session)),
            SandboxStatus::Ready
        );

        session.observed_state = SessionState::Failed;
        assert_eq!(
            sandbox.compute_status(now, Some(&session)),
            SandboxStatus::Failed
        );

        session.observed_state = SessionState::Stopped;
        assert_eq!(
            sandbox.compute_status(now, Some(&session)),
            SandboxStatus::Idle
        );
    }

    #[test]
    fn short_ids_are_prefixed_and_unique() {
        let a = short_id("sandbox");
        let b = short_id("sandbox");
        assert!(a.starts_with("sandbox-"));
        assert_eq!(a.len(), "sandbox-".len() + 12);
        assert_ne!(a, b);
    }
}
